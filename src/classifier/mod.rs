//! Pairwise classifier seam.
//!
//! The orchestrator only ever talks to [`PairwiseClassifier`]; scoring,
//! blocking and threshold search stay behind it.

mod fixed;
mod minhash;
mod model;

pub use fixed::FixedRuleClassifier;
pub use minhash::{shingles, LshIndex, MinHash, Permutations};
pub use model::MinHashClassifier;

use rustc_hash::FxHashSet;
use std::cmp::Ordering;
use std::io::{Read, Write};

use crate::cluster::{Cluster, ClusterTable};
use crate::dto::FieldDefinition;
use crate::error::Result;
use crate::exact::Residual;
use crate::labeling::LabelSource;
use crate::record::{Record, RecordId};
use crate::training::TrainingLog;

/// A scored candidate pair. Link-mode edges always put the A record first.
pub type Edge = (RecordId, RecordId, f64);

/// The records a classifier may compare.
#[derive(Clone, Copy)]
pub enum Candidates<'a> {
    /// Compare residual records with each other.
    Dedup(&'a Residual<'a>),
    /// Compare every residual A record with every residual B record.
    Link(&'a Residual<'a>, &'a Residual<'a>),
}

impl<'a> Candidates<'a> {
    pub fn record(&self, id: RecordId) -> Option<&'a Record> {
        match self {
            Candidates::Dedup(residual) => residual.get(&id).copied(),
            Candidates::Link(a, b) => a.get(&id).or_else(|| b.get(&id)).copied(),
        }
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.record(id).is_some()
    }

    pub fn len(&self) -> usize {
        match self {
            Candidates::Dedup(residual) => residual.len(),
            Candidates::Link(a, b) => a.len() + b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether at least one pair could be compared at all.
    pub fn has_pairs(&self) -> bool {
        match self {
            Candidates::Dedup(residual) => residual.len() >= 2,
            Candidates::Link(a, b) => !a.is_empty() && !b.is_empty(),
        }
    }

    /// Every comparable pair, unblocked. Quadratic; meant for small inputs.
    pub fn all_pairs(&self) -> Vec<(RecordId, RecordId)> {
        match self {
            Candidates::Dedup(residual) => {
                let ids: Vec<RecordId> = residual.keys().copied().collect();
                let mut pairs = Vec::new();
                for (i, &left) in ids.iter().enumerate() {
                    for &right in &ids[i + 1..] {
                        pairs.push((left, right));
                    }
                }
                pairs
            }
            Candidates::Link(a, b) => a
                .keys()
                .flat_map(|&left| b.keys().map(move |&right| (left, right)))
                .collect(),
        }
    }

    /// Turns above-threshold edges into output groups: connected components
    /// for dedup, a greedy one-to-one assignment for link.
    pub fn clusters_from_edges(&self, edges: Vec<Edge>) -> Vec<Cluster> {
        match self {
            Candidates::Dedup(_) => ClusterTable::from_edges(edges).clusters(),
            Candidates::Link(..) => one_to_one(edges),
        }
    }
}

///
/// Trainable pairwise classifier driven by the orchestrator.
///
/// Implementations own their blocking, similarity scoring and threshold
/// search. Clusters returned by [`PairwiseClassifier::match_records`] must be
/// pairwise disjoint and only contain ids from the given candidates.
///
pub trait PairwiseClassifier {
    /// Comparison schema, in configuration order.
    fn fields(&self) -> &[FieldDefinition];

    /// Draws up to `sample_size` pairs for active learning.
    fn sample(&mut self, candidates: Candidates<'_>, sample_size: usize);

    /// Replays previously labeled examples.
    fn read_training(&mut self, log: &TrainingLog);

    /// Asks `source` about sampled pairs until it answers `Finished` or the
    /// sample is exhausted.
    fn label_interactively(&mut self, source: &mut dyn LabelSource) -> Result<()>;

    /// Every labeled example known so far.
    fn write_training(&self) -> TrainingLog;

    fn train(&mut self) -> Result<()>;

    /// Whether the current model was trained on at least one matching pair.
    fn knows_a_match(&self) -> bool;

    fn write_settings(&self, writer: &mut dyn Write) -> Result<()>;

    /// Replaces the current state with a snapshot from `write_settings`.
    fn load_settings(&mut self, reader: &mut dyn Read) -> Result<()>;

    /// Picks a decision threshold; larger `recall_weight` favours recall.
    /// Fails with `NoLinkableRecords` when no candidate pairs exist.
    fn threshold(&self, candidates: Candidates<'_>, recall_weight: f64) -> Result<f64>;

    /// Groups whose scores reach `threshold`.
    fn match_records(&self, candidates: Candidates<'_>, threshold: f64) -> Result<Vec<Cluster>>;
}

fn by_score_desc(left: &Edge, right: &Edge) -> Ordering {
    right
        .2
        .total_cmp(&left.2)
        .then_with(|| left.0.cmp(&right.0))
        .then_with(|| left.1.cmp(&right.1))
}

/// Highest-scoring edges first; each record is used at most once.
pub fn one_to_one(mut edges: Vec<Edge>) -> Vec<Cluster> {
    edges.sort_by(by_score_desc);
    let mut used: FxHashSet<RecordId> = FxHashSet::default();
    let mut pairs = Vec::new();
    for (left, right, score) in edges {
        if used.contains(&left) || used.contains(&right) {
            continue;
        }
        used.insert(left);
        used.insert(right);
        pairs.push(Cluster::pair(left, right, score));
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Side;

    fn a(n: usize) -> RecordId {
        RecordId::tagged(Side::A, n)
    }

    fn b(n: usize) -> RecordId {
        RecordId::tagged(Side::B, n)
    }

    #[test]
    fn one_to_one_prefers_higher_scores() {
        let pairs = one_to_one(vec![(a(0), b(0), 0.6), (a(0), b(1), 0.9), (a(1), b(1), 0.8)]);
        assert_eq!(pairs, vec![Cluster::pair(a(0), b(1), 0.9)]);
    }

    #[test]
    fn link_candidates_pair_across_sides_only() {
        let record = Record::new();
        let left = Residual::from([(a(0), &record), (a(1), &record)]);
        let right = Residual::from([(b(3), &record)]);
        let candidates = Candidates::Link(&left, &right);
        assert_eq!(candidates.all_pairs(), vec![(a(0), b(3)), (a(1), b(3))]);
        assert_eq!(candidates.len(), 3);
        assert!(candidates.contains(b(3)));
        assert!(!candidates.contains(b(0)));
    }

    #[test]
    fn dedup_candidates_pair_each_once() {
        let record = Record::new();
        let ids: Vec<RecordId> = (0..3).map(RecordId::bare).collect();
        let residual: Residual = ids.iter().map(|&id| (id, &record)).collect();
        let pairs = Candidates::Dedup(&residual).all_pairs();
        assert_eq!(pairs, vec![(ids[0], ids[1]), (ids[0], ids[2]), (ids[1], ids[2])]);
    }
}
