use csv::WriterBuilder;
use std::collections::BTreeSet;
use std::io::Write;
use tracing::info;

use crate::cluster::Cluster;
use crate::dto::LinkageConfig;
use crate::error::{LinkageError, Result};
use crate::loader::{Dataset, RawRow};
use crate::orchestrator::LinkageResult;
use crate::record::{RecordId, Side};

pub const CLUSTER_ID_HEADER: &str = "Cluster ID";

pub const DEDUP_OUTPUT: &str = "potential_duplicates.csv";
pub const MATCHES_OUTPUT: &str = "potential_matches.csv";
pub const A_ONLY_OUTPUT: &str = "a_only.csv";
pub const B_ONLY_OUTPUT: &str = "b_only.csv";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DedupLayout {
    /// Every input row, in file order.
    #[default]
    AllRows,
    /// First row of each cluster plus every unclustered row.
    UniqueRows,
}

impl DedupLayout {
    pub fn from_config(config: &LinkageConfig) -> Self {
        if config.destructive {
            DedupLayout::UniqueRows
        } else {
            DedupLayout::AllRows
        }
    }
}

/// Leading column of the matched file in link mode.
#[derive(Clone, Debug, PartialEq, Default)]
pub enum MarkerColumn {
    #[default]
    None,
    Constant { header: String, value: String },
    Score { header: String },
}

impl MarkerColumn {
    pub fn from_config(config: &LinkageConfig) -> Self {
        match &config.score_column {
            Some(header) => MarkerColumn::Score {
                header: header.clone(),
            },
            None => MarkerColumn::None,
        }
    }

    fn header(&self) -> Option<&str> {
        match self {
            MarkerColumn::None => None,
            MarkerColumn::Constant { header, .. } | MarkerColumn::Score { header } => {
                Some(header.as_str())
            }
        }
    }

    fn value(&self, score: f64) -> Option<String> {
        match self {
            MarkerColumn::None => None,
            MarkerColumn::Constant { value, .. } => Some(value.clone()),
            MarkerColumn::Score { .. } => Some(format!("{score:.4}")),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct WriteSummary {
    /// Clusters (dedup) or pairs (link) written.
    pub matched: usize,
    /// Rows outside any cluster or pair.
    pub unmatched: usize,
    /// Data rows written across all outputs, headers excluded.
    pub rows: usize,
}

///
/// Gives every row of `dataset` a cluster id: the index of the cluster that
/// holds it, or a fresh id counting up from `clusters.len()` in file order.
///
/// Fails with a consistency error unless every row is resolved exactly once,
/// either as a cluster member or as an unmatched record.
///
pub fn assign_cluster_ids(dataset: &Dataset, result: &LinkageResult) -> Result<Vec<usize>> {
    let mut assigned: Vec<Option<usize>> = vec![None; dataset.len()];
    let mut clustered = 0;
    for (cluster_id, cluster) in result.clusters.iter().enumerate() {
        for member in cluster.members() {
            if !dataset.owns(member.id) {
                return Err(LinkageError::consistency(format!(
                    "cluster {cluster_id} names unknown record {}",
                    member.id
                )));
            }
            if assigned[member.id.ordinal()].replace(cluster_id).is_some() {
                return Err(LinkageError::consistency(format!(
                    "record {} belongs to more than one cluster",
                    member.id
                )));
            }
            clustered += 1;
        }
    }

    let unmatched: BTreeSet<RecordId> = result.unmatched.iter().copied().collect();
    if let Some(id) = unmatched
        .iter()
        .find(|id| !dataset.owns(**id) || assigned[id.ordinal()].is_some())
    {
        return Err(LinkageError::consistency(format!(
            "record {id} is both unmatched and clustered, or unknown"
        )));
    }
    if clustered + unmatched.len() != dataset.len() || unmatched.len() != result.unmatched.len() {
        return Err(LinkageError::consistency(format!(
            "resolved {} records but loaded {} rows",
            clustered + result.unmatched.len(),
            dataset.len()
        )));
    }

    let mut next_id = result.clusters.len();
    Ok(assigned
        .into_iter()
        .map(|slot| {
            slot.unwrap_or_else(|| {
                next_id += 1;
                next_id - 1
            })
        })
        .collect())
}

///
/// Writes the dedup output: the raw rows with a leading `Cluster ID` column.
///
pub fn write_dedup<W: Write>(
    dataset: &Dataset,
    result: &LinkageResult,
    layout: DedupLayout,
    delimiter: u8,
    out: W,
) -> Result<WriteSummary> {
    let cluster_ids = assign_cluster_ids(dataset, result)?;
    let mut writer = WriterBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_writer(out);
    writer.write_record(std::iter::once(CLUSTER_ID_HEADER).chain(dataset.header().iter().map(String::as_str)))?;

    let mut written_clusters = vec![false; result.clusters.len()];
    let mut rows = 0;
    for (raw, &cluster_id) in dataset.raw_rows().iter().zip(&cluster_ids) {
        if layout == DedupLayout::UniqueRows && cluster_id < written_clusters.len() {
            if written_clusters[cluster_id] {
                continue;
            }
            written_clusters[cluster_id] = true;
        }
        let id = cluster_id.to_string();
        writer.write_record(std::iter::once(id.as_str()).chain(raw.iter().map(String::as_str)))?;
        rows += 1;
    }
    writer.flush()?;

    let summary = WriteSummary {
        matched: result.clusters.len(),
        unmatched: result.unmatched.len(),
        rows,
    };
    info!(?layout, rows, clusters = summary.matched, "dedup output written");
    Ok(summary)
}

///
/// Writes the link outputs.
///
/// Every pair becomes one row in `matches`: the optional marker, then the A
/// row, then the B row. With `overflow` set, unmatched rows are copied
/// verbatim to the A-only and B-only writers under their own headers; with
/// `None` (inner join) they are dropped.
///
pub fn write_link<W: Write>(
    a: &Dataset,
    b: &Dataset,
    result: &LinkageResult,
    marker: &MarkerColumn,
    delimiter: u8,
    matches: W,
    overflow: Option<(W, W)>,
) -> Result<WriteSummary> {
    let pairs = result
        .clusters
        .iter()
        .map(|cluster| split_pair(a, b, cluster))
        .collect::<Result<Vec<_>>>()?;
    let (a_only, b_only) = unmatched_rows(a, b, &result.clusters, &result.unmatched)?;

    let mut writer = WriterBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_writer(matches);
    let header: Vec<&str> = marker
        .header()
        .into_iter()
        .chain(a.header().iter().map(String::as_str))
        .chain(b.header().iter().map(String::as_str))
        .collect();
    writer.write_record(&header)?;
    for &(row_a, row_b, score) in &pairs {
        let marker_value = marker.value(score);
        writer.write_record(
            marker_value
                .as_deref()
                .into_iter()
                .chain(row_a.iter().map(String::as_str))
                .chain(row_b.iter().map(String::as_str)),
        )?;
    }
    writer.flush()?;
    let mut rows = pairs.len();

    match overflow {
        Some((out_a, out_b)) => {
            rows += write_rows(a.header(), &a_only, delimiter, out_a)?;
            rows += write_rows(b.header(), &b_only, delimiter, out_b)?;
        }
        None => info!(
            dropped = a_only.len() + b_only.len(),
            "inner join, unmatched rows discarded"
        ),
    }

    let summary = WriteSummary {
        matched: pairs.len(),
        unmatched: a_only.len() + b_only.len(),
        rows,
    };
    info!(pairs = summary.matched, a_only = a_only.len(), b_only = b_only.len(), "link output written");
    Ok(summary)
}

fn split_pair<'d>(a: &'d Dataset, b: &'d Dataset, cluster: &Cluster) -> Result<(&'d RawRow, &'d RawRow, f64)> {
    let malformed = || {
        LinkageError::consistency(format!(
            "expected one A and one B record in pair {:?}",
            cluster.ids()
        ))
    };
    let [first, second] = cluster.members() else {
        return Err(malformed());
    };
    let (left, right) = match (first.id.side(), second.id.side()) {
        (Some(Side::A), Some(Side::B)) => (first, second),
        (Some(Side::B), Some(Side::A)) => (second, first),
        _ => return Err(malformed()),
    };
    let row_a = a.raw_row(left.id).ok_or_else(malformed)?;
    let row_b = b.raw_row(right.id).ok_or_else(malformed)?;
    Ok((row_a, row_b, left.score))
}

/// Unpaired rows of each side in file order, after checking that pairs and
/// unmatched records together name every loaded row exactly once.
fn unmatched_rows<'d>(
    a: &'d Dataset,
    b: &'d Dataset,
    pairs: &[Cluster],
    unmatched: &[RecordId],
) -> Result<(Vec<&'d RawRow>, Vec<&'d RawRow>)> {
    let mut seen = BTreeSet::new();
    for id in pairs.iter().flat_map(Cluster::ids) {
        if !seen.insert(id) {
            return Err(LinkageError::consistency(format!(
                "record {id} appears in more than one pair"
            )));
        }
    }

    let mut a_only = Vec::new();
    let mut b_only = Vec::new();
    for &id in unmatched {
        if !seen.insert(id) {
            return Err(LinkageError::consistency(format!(
                "record {id} is both unmatched and paired, or listed twice"
            )));
        }
        match (a.raw_row(id), b.raw_row(id)) {
            (Some(row), None) => a_only.push(row),
            (None, Some(row)) => b_only.push(row),
            _ => {
                return Err(LinkageError::consistency(format!(
                    "unmatched record {id} belongs to neither input"
                )))
            }
        }
    }

    let missing = a
        .entries()
        .chain(b.entries())
        .map(|(id, _)| id)
        .find(|id| !seen.contains(id));
    if let Some(id) = missing {
        return Err(LinkageError::consistency(format!(
            "record {id} is neither paired nor unmatched"
        )));
    }
    Ok((a_only, b_only))
}

fn write_rows<W: Write>(header: &[String], rows: &[&RawRow], delimiter: u8, out: W) -> Result<usize> {
    let mut writer = WriterBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_writer(out);
    writer.write_record(header)?;
    for row in rows {
        writer.write_record(row.iter())?;
    }
    writer.flush()?;
    Ok(rows.len())
}
