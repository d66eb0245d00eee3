use rustc_hash::{FxHashMap, FxHashSet};
use std::collections::{BTreeMap, BTreeSet};

use crate::exact::ExactGroups;
use crate::record::RecordId;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Member {
    pub id: RecordId,
    pub score: f64,
}

/// Records believed to denote one entity, each with a confidence in [0, 1].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Cluster {
    members: Vec<Member>,
}

impl Cluster {
    pub fn new<I: IntoIterator<Item = (RecordId, f64)>>(members: I) -> Self {
        Cluster {
            members: members
                .into_iter()
                .map(|(id, score)| Member { id, score })
                .collect(),
        }
    }

    /// Two-member cluster used for cross-file matches, both members sharing `score`.
    pub fn pair(a: RecordId, b: RecordId, score: f64) -> Self {
        Cluster::new([(a, score), (b, score)])
    }

    pub fn members(&self) -> &[Member] {
        &self.members
    }

    pub fn ids(&self) -> Vec<RecordId> {
        self.members.iter().map(|m| m.id).collect()
    }

    pub fn scores(&self) -> Vec<f64> {
        self.members.iter().map(|m| m.score).collect()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn contains(&self, id: RecordId) -> bool {
        self.members.iter().any(|m| m.id == id)
    }

    /// Appends the exact-match children of every representative member,
    /// each child inheriting its representative's score. Children already
    /// present are skipped, so expanding twice changes nothing.
    pub fn expand(&mut self, groups: &ExactGroups) {
        let mut present: FxHashSet<RecordId> = self.members.iter().map(|m| m.id).collect();
        let representatives = self.members.clone();
        for Member { id, score } in representatives {
            let Some(children) = groups.get(&id) else {
                continue;
            };
            for &child in children {
                if present.insert(child) {
                    self.members.push(Member { id: child, score });
                }
            }
        }
    }
}

/// Expands every cluster with its representatives' exact-match children.
pub fn expand_clusters(mut clusters: Vec<Cluster>, groups: &ExactGroups) -> Vec<Cluster> {
    for cluster in clusters.iter_mut() {
        cluster.expand(groups);
    }
    clusters
}

///
/// Accumulates scored edges into disjoint clusters (connected components).
///
/// Mirrors a grouping table: one map from cluster id to its members, and a
/// reverse lookup from member to cluster id. Clusters are merged whenever an
/// edge joins two of them.
///
pub struct ClusterTable {
    /// Cluster id → members and the scores of the edges touching each member.
    groups: FxHashMap<usize, BTreeMap<RecordId, Vec<f64>>>,
    /// Reverse lookup to identify the cluster id of a record id
    lookup: FxHashMap<RecordId, usize>,
    next_id: usize,
}

impl ClusterTable {
    pub fn new() -> Self {
        Self {
            groups: FxHashMap::default(),
            lookup: FxHashMap::default(),
            next_id: 0,
        }
    }

    pub fn from_edges<I: IntoIterator<Item = (RecordId, RecordId, f64)>>(edges: I) -> Self {
        let mut table = Self::new();
        for (left, right, score) in edges {
            table.add_edge(left, right, score);
        }
        table
    }

    pub fn add_edge(&mut self, left: RecordId, right: RecordId, score: f64) {
        let cluster_id = match (self.lookup.get(&left).copied(), self.lookup.get(&right).copied()) {
            (Some(l), Some(r)) if l == r => l,
            (Some(l), Some(r)) => {
                let (keep, absorb) = if l < r { (l, r) } else { (r, l) };
                let absorbed = self.remove(absorb);
                for (id, scores) in absorbed {
                    self.add(keep, id, scores);
                }
                keep
            }
            (Some(id), None) | (None, Some(id)) => id,
            (None, None) => self.new_id(),
        };
        self.add(cluster_id, left, vec![score]);
        self.add(cluster_id, right, vec![score]);
    }

    ///
    /// Outputs the clusters ordered by their smallest member, each member
    /// scored with the mean of its edge scores.
    ///
    pub fn clusters(&self) -> Vec<Cluster> {
        let mut ordered: Vec<&BTreeMap<RecordId, Vec<f64>>> = self.groups.values().collect();
        ordered.sort_by_key(|members| members.keys().next().copied());
        ordered
            .into_iter()
            .map(|members| {
                Cluster::new(members.iter().map(|(&id, scores)| {
                    (id, scores.iter().sum::<f64>() / scores.len() as f64)
                }))
            })
            .collect()
    }

    pub fn cluster_of(&self, id: RecordId) -> Option<usize> {
        self.lookup.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    fn add(&mut self, cluster_id: usize, id: RecordId, scores: Vec<f64>) {
        self.groups
            .entry(cluster_id)
            .or_default()
            .entry(id)
            .or_default()
            .extend(scores);
        self.lookup.insert(id, cluster_id);
    }

    fn new_id(&mut self) -> usize {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn remove(&mut self, cluster_id: usize) -> BTreeMap<RecordId, Vec<f64>> {
        let members = self.groups.remove(&cluster_id).unwrap_or_default();
        for id in members.keys() {
            self.lookup.remove(id);
        }
        members
    }
}

impl Default for ClusterTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Every id in `clusters`, failing on the first one seen twice.
pub fn clustered_ids(clusters: &[Cluster]) -> Result<BTreeSet<RecordId>, RecordId> {
    let mut seen = BTreeSet::new();
    for cluster in clusters {
        for member in cluster.members() {
            if !seen.insert(member.id) {
                return Err(member.id);
            }
        }
    }
    Ok(seen)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: usize) -> RecordId {
        RecordId::bare(n)
    }

    #[test]
    fn expansion_appends_children_with_representative_score() {
        let groups = ExactGroups::from([(id(0), vec![id(5)])]);
        let cluster = Cluster::new([(id(0), 0.9), (id(2), 0.9)]);
        let expanded = expand_clusters(vec![cluster], &groups);
        assert_eq!(expanded[0].ids(), vec![id(0), id(2), id(5)]);
        assert_eq!(expanded[0].scores(), vec![0.9, 0.9, 0.9]);
    }

    #[test]
    fn expansion_is_a_fixed_point() {
        let groups = ExactGroups::from([(id(0), vec![id(5), id(6)]), (id(2), vec![id(7)])]);
        let clusters = vec![
            Cluster::new([(id(0), 0.8), (id(2), 0.6)]),
            Cluster::new([(id(3), 0.7), (id(4), 0.7)]),
        ];
        let once = expand_clusters(clusters, &groups);
        let twice = expand_clusters(once.clone(), &groups);
        assert_eq!(once, twice);
        assert_eq!(once[0].scores(), vec![0.8, 0.6, 0.8, 0.8, 0.6]);
    }

    #[test]
    fn unclustered_representative_keeps_children_unclustered() {
        let groups = ExactGroups::from([(id(9), vec![id(10)])]);
        let expanded = expand_clusters(vec![Cluster::pair(id(0), id(1), 0.5)], &groups);
        assert!(!expanded[0].contains(id(10)));
    }

    #[test]
    fn table_merges_components() {
        let table = ClusterTable::from_edges([
            (id(0), id(1), 0.9),
            (id(4), id(5), 0.8),
            (id(2), id(3), 0.7),
            (id(1), id(2), 0.6),
        ]);
        let clusters = table.clusters();
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].ids(), vec![id(0), id(1), id(2), id(3)]);
        assert_eq!(clusters[1].ids(), vec![id(4), id(5)]);
        let scores = clusters[0].scores();
        assert!((scores[1] - 0.75).abs() < 1e-9);
        assert!((scores[2] - 0.65).abs() < 1e-9);
        assert_eq!(table.cluster_of(id(3)), table.cluster_of(id(0)));
    }

    #[test]
    fn duplicate_membership_is_detected() {
        let clusters = vec![Cluster::pair(id(0), id(1), 1.0), Cluster::pair(id(1), id(2), 1.0)];
        assert_eq!(clustered_ids(&clusters), Err(id(1)));
        assert_eq!(clustered_ids(&clusters[..1]).unwrap().len(), 2);
    }
}
