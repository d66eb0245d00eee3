use std::collections::BTreeSet;
use tracing::info;

use crate::classifier::{Candidates, PairwiseClassifier};
use crate::cluster::{clustered_ids, expand_clusters, Cluster};
use crate::dto::match_fields;
use crate::error::{LinkageError, Result};
use crate::exact::{partition_dedup, partition_link};
use crate::labeling::LabelSource;
use crate::loader::Dataset;
use crate::record::RecordId;
use crate::training::{TrainingLog, TrainingStore};

/// Threshold reported when the classifier had nothing to compare.
pub const EXACT_ONLY_THRESHOLD: f64 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrainingMode {
    /// Replay the stored log, then ask the label source for more.
    Interactive,
    /// Replay the stored log only.
    ReplayOnly,
    /// Skip training and restore the cached classifier; fails if none exists.
    CachedSettings,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    LoadTraining,
    LoadSettings,
    Sample,
    Train,
    Threshold,
    Cluster,
    Done,
}

#[derive(Clone, Debug)]
pub struct RunOptions {
    pub sample_size: usize,
    pub recall_weight: f64,
    pub training: TrainingMode,
}

impl Default for RunOptions {
    fn default() -> Self {
        RunOptions {
            sample_size: 1500,
            recall_weight: 1.0,
            training: TrainingMode::Interactive,
        }
    }
}

///
/// Outcome of one run: matched groups (clusters in dedup mode, A/B pairs in
/// link mode) and every record that ended up in none of them.
///
#[derive(Clone, Debug, PartialEq)]
pub struct LinkageResult {
    pub clusters: Vec<Cluster>,
    /// Unmatched ids in id order (A before B in link mode).
    pub unmatched: Vec<RecordId>,
    /// [`EXACT_ONLY_THRESHOLD`] when only exact matching contributed.
    pub threshold: f64,
    /// Groups resolved by exact matching without the classifier.
    pub exact_matches: usize,
}

/// Collaborators of a run besides its data.
pub struct Linker<'r, C: ?Sized, S: ?Sized> {
    pub classifier: &'r mut C,
    pub store: &'r mut S,
    pub labels: Option<&'r mut dyn LabelSource>,
    pub options: RunOptions,
}

impl<'r, C, S> Linker<'r, C, S>
where
    C: PairwiseClassifier + ?Sized,
    S: TrainingStore + ?Sized,
{
    ///
    /// Finds duplicate clusters within one dataset.
    ///
    /// Exact duplicates are collapsed first; the classifier only sees their
    /// representatives, and each representative's children rejoin its
    /// cluster with the same score afterwards.
    ///
    pub fn dedup(&mut self, dataset: &Dataset) -> Result<LinkageResult> {
        let fields = match_fields(self.classifier.fields());
        let partition = partition_dedup(dataset, &fields);
        // Without a classifier verdict each exact group is its own cluster.
        let (threshold, clusters) = match self.drive(Candidates::Dedup(&partition.residual), &fields)? {
            Some(outcome) => outcome,
            None => (
                EXACT_ONLY_THRESHOLD,
                partition
                    .groups
                    .keys()
                    .map(|&representative| Cluster::new([(representative, 1.0)]))
                    .collect(),
            ),
        };
        let exact_matches = partition.groups.len();
        let clusters = expand_clusters(clusters, &partition.groups);
        info!(clusters = clusters.len(), "duplicate clusters found");

        let clustered = clustered_ids(&clusters).map_err(|id| {
            LinkageError::consistency(format!("record {id} assigned to two clusters"))
        })?;
        let unmatched = dataset
            .entries()
            .map(|(id, _)| id)
            .filter(|id| !clustered.contains(id))
            .collect();
        Ok(LinkageResult {
            clusters,
            unmatched,
            threshold,
            exact_matches,
        })
    }

    ///
    /// Finds matching records across two datasets. Exact cross-file pairs
    /// bypass the classifier and are appended to its pairs unchanged.
    ///
    pub fn link(&mut self, a: &Dataset, b: &Dataset) -> Result<LinkageResult> {
        let fields = match_fields(self.classifier.fields());
        let partition = partition_link(a, b, &fields);
        let (threshold, mut clusters) = self
            .drive(
                Candidates::Link(&partition.residual_a, &partition.residual_b),
                &fields,
            )?
            .unwrap_or((EXACT_ONLY_THRESHOLD, Vec::new()));
        let exact_matches = partition.exact_pairs.len();
        clusters.extend(partition.exact_pairs);
        info!(pairs = clusters.len(), exact = exact_matches, "cross-file matches found");

        let paired = clustered_ids(&clusters).map_err(|id| {
            LinkageError::consistency(format!("record {id} matched more than once"))
        })?;
        let unmatched = a
            .entries()
            .chain(b.entries())
            .map(|(id, _)| id)
            .filter(|id| !paired.contains(id))
            .collect();
        Ok(LinkageResult {
            clusters,
            unmatched,
            threshold,
            exact_matches,
        })
    }

    ///
    /// Walks the classifier through its stages and returns the threshold
    /// together with the raw (unexpanded) clusters, or `None` when the
    /// classifier had nothing to contribute.
    ///
    /// A residual that cannot form a single pair skips the classifier. So
    /// does a trained classifier that found no candidate pairs after having
    /// learned at least one match; without such a match the run fails with
    /// `NoLinkableRecords`.
    ///
    fn drive(
        &mut self,
        candidates: Candidates<'_>,
        fields: &[String],
    ) -> Result<Option<(f64, Vec<Cluster>)>> {
        if !candidates.has_pairs() {
            info!(residual = candidates.len(), "nothing left to compare, keeping exact matches only");
            return Ok(None);
        }
        let mut stage = Stage::LoadTraining;
        let mut log: Option<TrainingLog> = None;
        let mut threshold = 0.0;
        let mut clusters = Vec::new();
        while stage != Stage::Done {
            info!(?stage, "linkage stage");
            stage = match stage {
                Stage::LoadTraining => {
                    log = self.store.read_training()?;
                    match self.options.training {
                        TrainingMode::CachedSettings => Stage::LoadSettings,
                        TrainingMode::Interactive | TrainingMode::ReplayOnly => Stage::Sample,
                    }
                }
                Stage::LoadSettings => {
                    self.load_settings(fields)?;
                    Stage::Threshold
                }
                Stage::Sample => {
                    self.classifier.sample(candidates, self.options.sample_size);
                    Stage::Train
                }
                Stage::Train => {
                    self.train(log.take())?;
                    Stage::Threshold
                }
                Stage::Threshold => {
                    match self.classifier.threshold(candidates, self.options.recall_weight) {
                        Ok(chosen) => {
                            threshold = chosen;
                            Stage::Cluster
                        }
                        Err(LinkageError::NoLinkableRecords) if self.classifier.knows_a_match() => {
                            info!("no candidate pairs survived blocking, keeping exact matches only");
                            return Ok(None);
                        }
                        Err(err) => return Err(err),
                    }
                }
                Stage::Cluster => {
                    clusters = self.classifier.match_records(candidates, threshold)?;
                    check_membership(&clusters, candidates)?;
                    Stage::Done
                }
                Stage::Done => Stage::Done,
            };
        }
        Ok(Some((threshold, clusters)))
    }

    fn load_settings(&mut self, fields: &[String]) -> Result<()> {
        let settings = self.store.read_settings()?.ok_or_else(|| {
            LinkageError::training(
                "no cached settings found; run again without existing training data to retrain",
            )
        })?;
        self.classifier.load_settings(&mut settings.as_slice())?;
        let cached = match_fields(self.classifier.fields());
        if cached != fields {
            return Err(LinkageError::config(format!(
                "cached settings were trained on fields {:?} but the run uses {:?}; retrain",
                cached, fields
            )));
        }
        Ok(())
    }

    fn train(&mut self, log: Option<TrainingLog>) -> Result<()> {
        if let Some(log) = &log {
            self.classifier.read_training(log);
        }
        if self.options.training == TrainingMode::Interactive {
            let labels = self.labels.as_deref_mut().ok_or_else(|| {
                LinkageError::config("interactive training needs a label source")
            })?;
            info!("starting active labeling");
            self.classifier.label_interactively(labels)?;
            self.store.write_training(&self.classifier.write_training())?;
        } else {
            info!("skipping interactive labeling");
        }
        self.classifier.train()?;

        let mut settings = Vec::new();
        self.classifier.write_settings(&mut settings)?;
        self.store.write_settings(&settings)?;
        info!("classifier settings cached");
        Ok(())
    }
}

/// Classifier output may only name residual records, each at most once.
fn check_membership(clusters: &[Cluster], candidates: Candidates<'_>) -> Result<()> {
    let mut seen = BTreeSet::new();
    for member in clusters.iter().flat_map(Cluster::members) {
        if !candidates.contains(member.id) {
            return Err(LinkageError::consistency(format!(
                "classifier returned unknown record {}",
                member.id
            )));
        }
        if !seen.insert(member.id) {
            return Err(LinkageError::consistency(format!(
                "classifier placed record {} in two groups",
                member.id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::FixedRuleClassifier;
    use crate::dto::FieldDefinition;
    use crate::labeling::{Label, ScriptedLabeler};
    use crate::record::Side;
    use crate::training::MemoryStore;

    fn fields() -> Vec<FieldDefinition> {
        vec![FieldDefinition::string("name"), FieldDefinition::string("town")]
    }

    fn options(training: TrainingMode) -> RunOptions {
        RunOptions {
            training,
            ..RunOptions::default()
        }
    }

    const SCHOOLS: &str = "name,town\n\
        Oakwood,Leeds\n\
        Oakwood,York\n\
        Elm,Bath\n\
        OAKWOOD,leeds\n\
        Kings,Hull\n";

    #[test]
    fn dedup_expands_exact_children_into_clusters() {
        let dataset = Dataset::load(SCHOOLS, b',', &["name", "town"], None).unwrap();
        let mut classifier = FixedRuleClassifier::new(fields(), 0.5);
        let mut store = MemoryStore::default();
        let mut labels = ScriptedLabeler::new([Label::Match]);
        let result = Linker {
            classifier: &mut classifier,
            store: &mut store,
            labels: Some(&mut labels),
            options: options(TrainingMode::Interactive),
        }
        .dedup(&dataset)
        .unwrap();

        assert_eq!(result.exact_matches, 1);
        assert_eq!(result.clusters.len(), 1);
        assert_eq!(
            result.clusters[0].ids(),
            vec![RecordId::bare(0), RecordId::bare(1), RecordId::bare(3)]
        );
        assert_eq!(result.clusters[0].scores(), vec![0.5, 0.5, 0.5]);
        assert_eq!(result.unmatched, vec![RecordId::bare(2), RecordId::bare(4)]);
        assert_eq!(
            classifier.calls,
            vec!["sample", "label_interactively", "train"]
        );
        assert_eq!(store.training.unwrap().matches.len(), 1);
        assert!(store.settings.is_some());
    }

    #[test]
    fn link_merges_exact_pairs_after_classifier_pairs() {
        let a = Dataset::load("name,town\nOakwood,Leeds\nElm,Bath\n", b',', &["name"], Some(Side::A))
            .unwrap();
        let b = Dataset::load("name,town\nElm,Bath\nOakwood,York\nZed,Zoo\n", b',', &["name"], Some(Side::B))
            .unwrap();
        let mut classifier = FixedRuleClassifier::new(fields(), 0.5);
        let mut store = MemoryStore::default();
        let result = Linker {
            classifier: &mut classifier,
            store: &mut store,
            labels: None,
            options: options(TrainingMode::ReplayOnly),
        }
        .link(&a, &b)
        .unwrap();

        assert_eq!(
            result.clusters,
            vec![
                Cluster::pair(RecordId::tagged(Side::A, 0), RecordId::tagged(Side::B, 1), 0.5),
                Cluster::pair(RecordId::tagged(Side::A, 1), RecordId::tagged(Side::B, 0), 1.0),
            ]
        );
        assert_eq!(result.exact_matches, 1);
        assert_eq!(result.unmatched, vec![RecordId::tagged(Side::B, 2)]);
        assert_eq!(classifier.calls, vec!["sample", "train"]);
        assert!(store.training.is_none());
    }

    #[test]
    fn cached_settings_skip_sampling_and_training() {
        let dataset = Dataset::load(SCHOOLS, b',', &["name", "town"], None).unwrap();
        let mut settings = Vec::new();
        FixedRuleClassifier::new(fields(), 0.5)
            .write_settings(&mut settings)
            .unwrap();
        let mut store = MemoryStore {
            training: None,
            settings: Some(settings),
        };
        let mut classifier = FixedRuleClassifier::new(fields(), 0.9);
        let result = Linker {
            classifier: &mut classifier,
            store: &mut store,
            labels: None,
            options: options(TrainingMode::CachedSettings),
        }
        .dedup(&dataset)
        .unwrap();
        assert_eq!(classifier.calls, vec!["load_settings"]);
        assert_eq!(result.threshold, 0.5);
    }

    #[test]
    fn missing_cached_settings_is_fatal() {
        let dataset = Dataset::load(SCHOOLS, b',', &["name", "town"], None).unwrap();
        let mut classifier = FixedRuleClassifier::new(fields(), 0.5);
        let mut store = MemoryStore::default();
        let err = Linker {
            classifier: &mut classifier,
            store: &mut store,
            labels: None,
            options: options(TrainingMode::CachedSettings),
        }
        .dedup(&dataset)
        .unwrap_err();
        assert!(matches!(err, LinkageError::Training(_)));
    }

    #[test]
    fn cached_settings_for_other_fields_are_rejected() {
        let dataset = Dataset::load(SCHOOLS, b',', &["name", "town"], None).unwrap();
        let mut settings = Vec::new();
        FixedRuleClassifier::new(vec![FieldDefinition::string("name")], 0.5)
            .write_settings(&mut settings)
            .unwrap();
        let mut store = MemoryStore {
            training: None,
            settings: Some(settings),
        };
        let mut classifier = FixedRuleClassifier::new(fields(), 0.5);
        let err = Linker {
            classifier: &mut classifier,
            store: &mut store,
            labels: None,
            options: options(TrainingMode::CachedSettings),
        }
        .dedup(&dataset)
        .unwrap_err();
        assert!(matches!(err, LinkageError::Config(_)));
    }

    #[test]
    fn interactive_without_label_source_is_a_config_error() {
        let dataset = Dataset::load(SCHOOLS, b',', &["name", "town"], None).unwrap();
        let mut classifier = FixedRuleClassifier::new(fields(), 0.5);
        let mut store = MemoryStore::default();
        let err = Linker {
            classifier: &mut classifier,
            store: &mut store,
            labels: None,
            options: options(TrainingMode::Interactive),
        }
        .dedup(&dataset)
        .unwrap_err();
        assert!(matches!(err, LinkageError::Config(_)));
    }

    #[test]
    fn stored_training_is_replayed_before_labeling() {
        let dataset = Dataset::load(SCHOOLS, b',', &["name", "town"], None).unwrap();
        let mut log = TrainingLog::default();
        let oak: crate::record::Record = [("name", "oakwood")].into_iter().collect();
        log.record(Label::Distinct, (oak.clone(), oak));
        let mut store = MemoryStore {
            training: Some(log),
            settings: None,
        };
        let mut classifier = FixedRuleClassifier::new(fields(), 0.5);
        let mut labels = ScriptedLabeler::new([]);
        Linker {
            classifier: &mut classifier,
            store: &mut store,
            labels: Some(&mut labels),
            options: options(TrainingMode::Interactive),
        }
        .dedup(&dataset)
        .unwrap();
        assert_eq!(
            classifier.calls,
            vec!["sample", "read_training", "label_interactively", "train"]
        );
        assert_eq!(store.training.unwrap().distinct.len(), 1);
    }

    #[test]
    fn nothing_comparable_surfaces_no_linkable_records() {
        let dataset = Dataset::load("name,town\nA,B\nC,D\n", b',', &["name"], None).unwrap();
        let mut classifier = FixedRuleClassifier::new(fields(), 0.5);
        let mut store = MemoryStore::default();
        let err = Linker {
            classifier: &mut classifier,
            store: &mut store,
            labels: None,
            options: options(TrainingMode::ReplayOnly),
        }
        .dedup(&dataset)
        .unwrap_err();
        assert!(matches!(err, LinkageError::NoLinkableRecords));
    }

    #[test]
    fn fully_resolved_dedup_skips_the_classifier() {
        let dataset = Dataset::load("name,town
sch1,Leeds
sch1,Leeds
", b',', &["name"], None)
            .unwrap();
        let mut classifier = FixedRuleClassifier::new(fields(), 0.5);
        let mut store = MemoryStore::default();
        let result = Linker {
            classifier: &mut classifier,
            store: &mut store,
            labels: None,
            options: options(TrainingMode::Interactive),
        }
        .dedup(&dataset)
        .unwrap();
        assert_eq!(
            result.clusters,
            vec![Cluster::new([(RecordId::bare(0), 1.0), (RecordId::bare(1), 1.0)])]
        );
        assert!(result.unmatched.is_empty());
        assert_eq!(result.threshold, EXACT_ONLY_THRESHOLD);
        assert!(classifier.calls.is_empty());
        assert!(store.settings.is_none());
    }

    #[test]
    fn one_sided_link_residual_keeps_exact_pairs() {
        let a = Dataset::load("name,town
Oakwood,Leeds
Elm,Bath
", b',', &["name"], Some(Side::A))
            .unwrap();
        let b = Dataset::load("name,town
Elm,Bath
", b',', &["name"], Some(Side::B)).unwrap();
        let mut classifier = FixedRuleClassifier::new(fields(), 0.5);
        let mut store = MemoryStore::default();
        let result = Linker {
            classifier: &mut classifier,
            store: &mut store,
            labels: None,
            options: options(TrainingMode::CachedSettings),
        }
        .link(&a, &b)
        .unwrap();
        assert_eq!(
            result.clusters,
            vec![Cluster::pair(RecordId::tagged(Side::A, 1), RecordId::tagged(Side::B, 0), 1.0)]
        );
        assert_eq!(result.unmatched, vec![RecordId::tagged(Side::A, 0)]);
        assert!(classifier.calls.is_empty());
    }
}
