use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::collections::hash_map::Entry;
use std::collections::BTreeMap;
use tracing::info;

use crate::cluster::Cluster;
use crate::loader::Dataset;
use crate::record::{ExactKey, Record, RecordId};

/// Records still needing probabilistic comparison, keyed and ordered by id.
pub type Residual<'a> = BTreeMap<RecordId, &'a Record>;

/// Exact-group representative → the later rows that collapsed onto it.
pub type ExactGroups = BTreeMap<RecordId, Vec<RecordId>>;

pub struct DedupPartition<'a> {
    pub residual: Residual<'a>,
    pub groups: ExactGroups,
}

pub struct LinkPartition<'a> {
    pub residual_a: Residual<'a>,
    pub residual_b: Residual<'a>,
    /// Exact cross-file pairs, each a two-member cluster scored 1.0.
    pub exact_pairs: Vec<Cluster>,
}

///
/// Collapses rows of one dataset that are identical on `match_fields`.
///
/// The first row of each key (in file order) becomes the representative and
/// stays in the residual set; every later row with that key is recorded as
/// its child and leaves the residual set.
///
pub fn partition_dedup<'a, S: AsRef<str> + Sync>(
    dataset: &'a Dataset,
    match_fields: &[S],
) -> DedupPartition<'a> {
    let keys = exact_keys(dataset, match_fields);
    let mut representatives: FxHashMap<ExactKey<'a>, RecordId> = FxHashMap::default();
    let mut residual = Residual::new();
    let mut groups = ExactGroups::new();
    for ((id, record), key) in dataset.entries().zip(keys) {
        match representatives.entry(key) {
            Entry::Occupied(entry) => groups.entry(*entry.get()).or_default().push(id),
            Entry::Vacant(entry) => {
                entry.insert(id);
                residual.insert(id, record);
            }
        }
    }
    info!(
        rows = dataset.len(),
        residual = residual.len(),
        exact_groups = groups.len(),
        "exact duplicates collapsed"
    );
    DedupPartition { residual, groups }
}

///
/// Pairs rows of `a` and `b` that are identical on `match_fields`.
///
/// Each key in `a` is held by its last row; earlier rows sharing the key stay
/// residual. `b` is scanned in file order and
/// the first `b` row hitting a held key takes the pair and releases the key,
/// so every `a` row exact-matches at most one `b` row. Rows that pair with
/// nothing stay residual.
///
pub fn partition_link<'a, S: AsRef<str> + Sync>(
    a: &'a Dataset,
    b: &'a Dataset,
    match_fields: &[S],
) -> LinkPartition<'a> {
    let keys_a = exact_keys(a, match_fields);
    let keys_b = exact_keys(b, match_fields);
    let mut held: FxHashMap<ExactKey<'a>, RecordId> = FxHashMap::default();
    let mut residual_a = Residual::new();
    for ((id, _), key) in a.entries().zip(keys_a) {
        if let Some(previous) = held.insert(key, id) {
            if let Some(record) = a.record(previous) {
                residual_a.insert(previous, record);
            }
        }
    }

    let mut residual_b = Residual::new();
    let mut exact_pairs = Vec::new();
    for ((id_b, record), key) in b.entries().zip(keys_b) {
        match held.remove(&key) {
            Some(id_a) => exact_pairs.push(Cluster::pair(id_a, id_b, 1.0)),
            None => {
                residual_b.insert(id_b, record);
            }
        }
    }
    for id_a in held.into_values() {
        if let Some(record) = a.record(id_a) {
            residual_a.insert(id_a, record);
        }
    }
    info!(
        rows_a = a.len(),
        rows_b = b.len(),
        exact_pairs = exact_pairs.len(),
        residual_a = residual_a.len(),
        residual_b = residual_b.len(),
        "exact cross-file matches paired"
    );
    LinkPartition {
        residual_a,
        residual_b,
        exact_pairs,
    }
}

/// Keys are computed in parallel; the result keeps file order.
fn exact_keys<'a, S: AsRef<str> + Sync>(
    dataset: &'a Dataset,
    match_fields: &[S],
) -> Vec<ExactKey<'a>> {
    dataset
        .records()
        .par_iter()
        .map(|record| record.exact_key(match_fields))
        .collect()
}
