use rand::prelude::*;
use rayon::prelude::*;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use tracing::{debug, info};

use super::minhash::{calculate_hash, shingles, LshIndex, MinHash, Permutations};
use super::{Candidates, Edge, PairwiseClassifier};
use crate::cluster::Cluster;
use crate::dto::{match_fields, ClassifierParams, FieldDefinition, FieldType};
use crate::error::{LinkageError, Result};
use crate::labeling::{Label, LabelRequest, LabelSource};
use crate::record::{Record, RecordId};
use crate::training::TrainingLog;

const EPOCHS: usize = 1000;
const LEARNING_RATE: f64 = 0.5;
const L2_PENALTY: f64 = 1e-3;

#[derive(Clone, Debug, Serialize, Deserialize)]
struct Model {
    weights: Vec<f64>,
    bias: f64,
}

impl Model {
    fn predict(&self, features: &[f64]) -> f64 {
        let z: f64 = self
            .weights
            .iter()
            .zip(features)
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.bias;
        sigmoid(z)
    }

    /// Full-batch gradient descent from zero weights; deterministic.
    fn fit(examples: &[(Vec<f64>, f64)], dimensions: usize) -> Self {
        let mut model = Model {
            weights: vec![0.0; dimensions],
            bias: 0.0,
        };
        if examples.is_empty() {
            return model;
        }
        let n = examples.len() as f64;
        for _ in 0..EPOCHS {
            let mut gradient = vec![0.0; dimensions];
            let mut bias_gradient = 0.0;
            for (features, target) in examples {
                let error = model.predict(features) - target;
                for (g, x) in gradient.iter_mut().zip(features) {
                    *g += error * x;
                }
                bias_gradient += error;
            }
            for (w, g) in model.weights.iter_mut().zip(&gradient) {
                *w -= LEARNING_RATE * (g / n + L2_PENALTY * *w);
            }
            model.bias -= LEARNING_RATE * bias_gradient / n;
        }
        model
    }
}

/// Persisted classifier state.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot {
    fields: Vec<FieldDefinition>,
    params: ClassifierParams,
    model: Model,
    can_block: bool,
}

/// Per-record MinHash signatures.
struct Signature {
    /// One per column field; `None` for blank values.
    columns: Vec<Option<MinHash>>,
    /// Whole-record signature used for blocking; `None` for blank records.
    block: Option<MinHash>,
}

struct Example {
    left: Record,
    right: Record,
    features: Vec<f64>,
}

///
/// Logistic-regression pair classifier over per-field MinHash similarities,
/// with LSH blocking.
///
pub struct MinHashClassifier {
    fields: Vec<FieldDefinition>,
    columns: Vec<String>,
    params: ClassifierParams,
    permutations: Permutations,
    model: Option<Model>,
    /// Cleared when training saw no positive example: nothing can then be
    /// told apart from noise, so nothing is blocked together.
    can_block: bool,
    labeled: TrainingLog,
    pool: Vec<Example>,
}

impl MinHashClassifier {
    pub fn new(fields: Vec<FieldDefinition>, params: ClassifierParams) -> Self {
        let permutations = Permutations::seeded(params.num_perm, params.seed);
        MinHashClassifier {
            columns: match_fields(&fields),
            fields,
            params,
            permutations,
            model: None,
            can_block: true,
            labeled: TrainingLog::default(),
            pool: Vec::new(),
        }
    }

    /// Pairs left in the active-learning pool.
    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// Match probability of two records under the current model.
    pub fn score(&self, left: &Record, right: &Record) -> f64 {
        let features = self.features(left, right, &self.signature(left), &self.signature(right));
        self.predict(&features)
    }

    fn predict(&self, features: &[f64]) -> f64 {
        match &self.model {
            Some(model) => model.predict(features),
            None if features.is_empty() => 0.5,
            None => features.iter().sum::<f64>() / features.len() as f64,
        }
    }

    fn signature(&self, record: &Record) -> Signature {
        let columns: Vec<Option<MinHash>> = self
            .columns
            .iter()
            .map(|field| {
                record
                    .get(field)
                    .map(|value| MinHash::new(shingles(value), &self.permutations))
            })
            .collect();
        let mut grams = Vec::new();
        for (i, field) in self.columns.iter().enumerate() {
            if let Some(value) = record.get(field) {
                grams.extend(shingles(value).into_iter().map(|g| calculate_hash(&(i, g))));
            }
        }
        let block = (!grams.is_empty()).then(|| MinHash::from_hashes(grams, &self.permutations));
        Signature { columns, block }
    }

    fn features(
        &self,
        left: &Record,
        right: &Record,
        left_sig: &Signature,
        right_sig: &Signature,
    ) -> Vec<f64> {
        let column_similarity = |field: &str| -> f64 {
            let Some(i) = self.columns.iter().position(|c| c == field) else {
                return 0.0;
            };
            match (&left_sig.columns[i], &right_sig.columns[i]) {
                (Some(l), Some(r)) => l.jaccard_similarity(r),
                _ => 0.0,
            }
        };
        self.fields
            .iter()
            .map(|def| match &def.kind {
                FieldType::String => column_similarity(def.field.as_str()),
                FieldType::Exact => match (left.get(&def.field), right.get(&def.field)) {
                    (Some(l), Some(r)) if l == r => 1.0,
                    _ => 0.0,
                },
                FieldType::Interaction {
                    interaction_variables,
                } => interaction_variables
                    .iter()
                    .map(|v| column_similarity(v.as_str()))
                    .product(),
            })
            .collect()
    }

    fn signatures(&self, candidates: Candidates<'_>) -> FxHashMap<RecordId, Signature> {
        let records: Vec<(RecordId, &Record)> = match candidates {
            Candidates::Dedup(residual) => residual.iter().map(|(&id, &r)| (id, r)).collect(),
            Candidates::Link(a, b) => a
                .iter()
                .chain(b.iter())
                .map(|(&id, &r)| (id, r))
                .collect(),
        };
        records
            .into_par_iter()
            .map(|(id, record)| (id, self.signature(record)))
            .collect()
    }

    /// Candidate pairs sharing an LSH bucket, sorted.
    fn blocked_pairs(
        &self,
        candidates: Candidates<'_>,
        signatures: &FxHashMap<RecordId, Signature>,
    ) -> Vec<(RecordId, RecordId)> {
        let mut index = LshIndex::new(self.params.num_perm, self.params.num_bands);
        let mut pairs: FxHashSet<(RecordId, RecordId)> = FxHashSet::default();
        match candidates {
            Candidates::Dedup(residual) => {
                for id in residual.keys() {
                    if let Some(block) = &signatures[id].block {
                        index.insert(*id, block);
                    }
                }
                for bucket in index.shared_buckets() {
                    for (i, &left) in bucket.iter().enumerate() {
                        for &right in &bucket[i + 1..] {
                            pairs.insert((left.min(right), left.max(right)));
                        }
                    }
                }
            }
            Candidates::Link(a, b) => {
                for id in a.keys() {
                    if let Some(block) = &signatures[id].block {
                        index.insert(*id, block);
                    }
                }
                for id_b in b.keys() {
                    if let Some(block) = &signatures[id_b].block {
                        for id_a in index.query(block) {
                            pairs.insert((id_a, *id_b));
                        }
                    }
                }
            }
        }
        let mut pairs: Vec<(RecordId, RecordId)> = pairs.into_iter().collect();
        pairs.sort();
        pairs
    }

    fn scored_pairs(&self, candidates: Candidates<'_>) -> Result<Vec<Edge>> {
        if self.model.is_none() {
            return Err(LinkageError::training("the classifier has not been trained"));
        }
        if !self.can_block {
            return Ok(Vec::new());
        }
        let signatures = self.signatures(candidates);
        let pairs = self.blocked_pairs(candidates, &signatures);
        Ok(pairs
            .into_par_iter()
            .filter_map(|(left, right)| {
                let l = candidates.record(left)?;
                let r = candidates.record(right)?;
                let features = self.features(l, r, &signatures[&left], &signatures[&right]);
                Some((left, right, self.predict(&features)))
            })
            .collect())
    }

    fn random_pair(
        &self,
        candidates: Candidates<'_>,
        ids: &(Vec<RecordId>, Vec<RecordId>),
        rng: &mut StdRng,
    ) -> Option<(RecordId, RecordId)> {
        match candidates {
            Candidates::Dedup(_) => {
                let (all, _) = ids;
                if all.len() < 2 {
                    return None;
                }
                let picked: Vec<&RecordId> = all.choose_multiple(rng, 2).collect();
                Some((*picked[0].min(picked[1]), *picked[0].max(picked[1])))
            }
            Candidates::Link(..) => {
                let (a, b) = ids;
                Some((*a.choose(rng)?, *b.choose(rng)?))
            }
        }
    }

    fn example(&self, left: Record, right: Record) -> Example {
        let features = self.features(&left, &right, &self.signature(&left), &self.signature(&right));
        Example {
            left,
            right,
            features,
        }
    }

    fn refit(&mut self) {
        let examples: Vec<(Vec<f64>, f64)> = self
            .labeled
            .matches
            .iter()
            .map(|pair| (pair, 1.0))
            .chain(self.labeled.distinct.iter().map(|pair| (pair, 0.0)))
            .map(|((left, right), target)| {
                let features =
                    self.features(left, right, &self.signature(left), &self.signature(right));
                (features, target)
            })
            .collect();
        self.model = Some(Model::fit(&examples, self.fields.len()));
    }
}

impl PairwiseClassifier for MinHashClassifier {
    fn fields(&self) -> &[FieldDefinition] {
        &self.fields
    }

    fn sample(&mut self, candidates: Candidates<'_>, sample_size: usize) {
        let mut rng = StdRng::seed_from_u64(self.params.seed);
        let ids: (Vec<RecordId>, Vec<RecordId>) = match candidates {
            Candidates::Dedup(residual) => (residual.keys().copied().collect(), Vec::new()),
            Candidates::Link(a, b) => (a.keys().copied().collect(), b.keys().copied().collect()),
        };
        let possible = match candidates {
            Candidates::Dedup(_) => ids.0.len().saturating_mul(ids.0.len().saturating_sub(1)) / 2,
            Candidates::Link(..) => ids.0.len().saturating_mul(ids.1.len()),
        };

        let pairs = if possible <= sample_size {
            let mut all = candidates.all_pairs();
            all.shuffle(&mut rng);
            all
        } else {
            let signatures = self.signatures(candidates);
            let mut blocked = self.blocked_pairs(candidates, &signatures);
            blocked.shuffle(&mut rng);
            blocked.truncate(sample_size);

            let mut seen: FxHashSet<(RecordId, RecordId)> = blocked.iter().copied().collect();
            let mut pairs = blocked;
            let mut attempts = 0;
            while pairs.len() < sample_size && attempts < sample_size * 4 {
                attempts += 1;
                match self.random_pair(candidates, &ids, &mut rng) {
                    Some(pair) if seen.insert(pair) => pairs.push(pair),
                    Some(_) => continue,
                    None => break,
                }
            }
            pairs
        };

        self.pool = pairs
            .into_iter()
            .filter_map(|(left, right)| {
                Some((candidates.record(left)?.clone(), candidates.record(right)?.clone()))
            })
            .map(|(left, right)| self.example(left, right))
            .collect();
        info!(sampled = self.pool.len(), requested = sample_size, "sampled candidate pairs");
    }

    fn read_training(&mut self, log: &TrainingLog) {
        self.labeled.extend(log);
        info!(
            matches = self.labeled.matches.len(),
            distinct = self.labeled.distinct.len(),
            "replayed labeled examples"
        );
    }

    fn label_interactively(&mut self, source: &mut dyn LabelSource) -> Result<()> {
        while !self.pool.is_empty() {
            let (next, _) = self
                .pool
                .iter()
                .enumerate()
                .map(|(i, example)| (i, (self.predict(&example.features) - 0.5).abs()))
                .fold((0, f64::INFINITY), |best, current| {
                    if current.1 < best.1 {
                        current
                    } else {
                        best
                    }
                });
            let example = self.pool.remove(next);
            let label = source.label(&LabelRequest {
                fields: &self.columns,
                left: &example.left,
                right: &example.right,
                positives: self.labeled.matches.len(),
                negatives: self.labeled.distinct.len(),
            })?;
            debug!(?label, remaining = self.pool.len(), "pair labeled");
            match label {
                Label::Finished => break,
                Label::Unsure => continue,
                Label::Match | Label::Distinct => {
                    self.labeled.record(label, (example.left, example.right));
                    self.refit();
                }
            }
        }
        Ok(())
    }

    fn write_training(&self) -> TrainingLog {
        self.labeled.clone()
    }

    fn train(&mut self) -> Result<()> {
        if self.labeled.is_empty() {
            return Err(LinkageError::training(
                "no labeled examples to train from; label at least one pair",
            ));
        }
        self.refit();
        self.can_block = !self.labeled.matches.is_empty();
        info!(
            matches = self.labeled.matches.len(),
            distinct = self.labeled.distinct.len(),
            "classifier trained"
        );
        Ok(())
    }

    fn knows_a_match(&self) -> bool {
        self.model.is_some() && self.can_block
    }

    fn write_settings(&self, writer: &mut dyn Write) -> Result<()> {
        let model = self
            .model
            .clone()
            .ok_or_else(|| LinkageError::training("cannot cache an untrained classifier"))?;
        let snapshot = Snapshot {
            fields: self.fields.clone(),
            params: self.params.clone(),
            model,
            can_block: self.can_block,
        };
        serde_json::to_writer(writer, &snapshot)?;
        Ok(())
    }

    fn load_settings(&mut self, reader: &mut dyn Read) -> Result<()> {
        let snapshot: Snapshot = serde_json::from_reader(reader)
            .map_err(|err| LinkageError::training(format!("unreadable cached settings: {err}")))?;
        if snapshot.model.weights.len() != snapshot.fields.len() {
            return Err(LinkageError::training(
                "cached settings do not match their own field list",
            ));
        }
        *self = MinHashClassifier::new(snapshot.fields, snapshot.params);
        self.model = Some(snapshot.model);
        self.can_block = snapshot.can_block;
        Ok(())
    }

    fn threshold(&self, candidates: Candidates<'_>, recall_weight: f64) -> Result<f64> {
        let mut probabilities: Vec<f64> = self
            .scored_pairs(candidates)?
            .into_iter()
            .map(|(_, _, p)| p)
            .collect();
        if probabilities.is_empty() {
            return Err(LinkageError::NoLinkableRecords);
        }
        probabilities.sort_by(|a, b| b.total_cmp(a));
        let threshold = best_cut(&probabilities, recall_weight);
        info!(pairs = probabilities.len(), recall_weight, threshold, "threshold chosen");
        Ok(threshold)
    }

    fn match_records(&self, candidates: Candidates<'_>, threshold: f64) -> Result<Vec<Cluster>> {
        let edges: Vec<Edge> = self
            .scored_pairs(candidates)?
            .into_iter()
            .filter(|&(_, _, score)| score >= threshold)
            .collect();
        Ok(candidates.clusters_from_edges(edges))
    }
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

///
/// Probability at the cut maximising the weighted harmonic mean of expected
/// precision and recall. `probabilities` must be sorted descending.
///
fn best_cut(probabilities: &[f64], recall_weight: f64) -> f64 {
    let total: f64 = probabilities.iter().sum();
    if total <= 0.0 {
        return probabilities[0];
    }
    let weight = recall_weight * recall_weight;
    let mut expected = 0.0;
    let mut best = (f64::NEG_INFINITY, probabilities[0]);
    for (i, &p) in probabilities.iter().enumerate() {
        expected += p;
        let recall = expected / total;
        let precision = expected / (i + 1) as f64;
        let score = recall * precision / (recall + weight * precision);
        if score > best.0 {
            best = (score, p);
        }
    }
    best.1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exact::Residual;
    use crate::labeling::ScriptedLabeler;
    use crate::record::Side;

    fn schools(names: &[&str]) -> Vec<Record> {
        names
            .iter()
            .map(|n| [("School", *n)].into_iter().collect())
            .collect()
    }

    fn classifier() -> MinHashClassifier {
        MinHashClassifier::new(vec![FieldDefinition::string("School")], ClassifierParams::default())
    }

    fn pair(left: &str, right: &str) -> (Record, Record) {
        let mut records = schools(&[left, right]);
        let right = records.pop().unwrap();
        (records.pop().unwrap(), right)
    }

    fn trained() -> MinHashClassifier {
        let mut classifier = classifier();
        let mut log = TrainingLog::default();
        log.record(Label::Match, pair("oakwood primary school", "oakwood primary"));
        log.record(Label::Match, pair("st marys school", "st marys school leeds"));
        log.record(Label::Distinct, pair("oakwood primary school", "elmhurst grammar"));
        log.record(Label::Distinct, pair("st marys school", "kings college"));
        classifier.read_training(&log);
        classifier.train().unwrap();
        classifier
    }

    #[test]
    fn best_cut_moves_down_with_recall_weight() {
        let probabilities = [0.99, 0.95, 0.9, 0.6, 0.4, 0.2, 0.1, 0.05];
        let balanced = best_cut(&probabilities, 1.0);
        let recall_heavy = best_cut(&probabilities, 4.0);
        assert!(recall_heavy <= balanced);
    }

    #[test]
    fn training_separates_similar_from_dissimilar() {
        let classifier = trained();
        let (a, b) = pair("oakwood primary school", "oakwood primary sch");
        let (c, d) = pair("oakwood primary school", "kings college");
        assert!(classifier.score(&a, &b) > 0.5);
        assert!(classifier.score(&c, &d) < 0.5);
    }

    #[test]
    fn training_without_examples_fails() {
        let err = classifier().train().unwrap_err();
        assert!(matches!(err, LinkageError::Training(_)));
    }

    #[test]
    fn all_negative_training_links_nothing() {
        let mut classifier = classifier();
        let mut log = TrainingLog::default();
        log.record(Label::Distinct, pair("oakwood", "elmhurst"));
        classifier.read_training(&log);
        classifier.train().unwrap();
        let records = schools(&["oakwood", "oakwood school"]);
        let residual: Residual = records
            .iter()
            .enumerate()
            .map(|(i, r)| (RecordId::bare(i), r))
            .collect();
        let err = classifier
            .threshold(Candidates::Dedup(&residual), 1.0)
            .unwrap_err();
        assert!(matches!(err, LinkageError::NoLinkableRecords));
    }

    #[test]
    fn link_matching_is_one_to_one() {
        let classifier = trained();
        let a_records = schools(&["oakwood primary school", "kings college"]);
        let b_records = schools(&["oakwood primary", "oakwood primary school", "kings college"]);
        let a: Residual = a_records
            .iter()
            .enumerate()
            .map(|(i, r)| (RecordId::tagged(Side::A, i), r))
            .collect();
        let b: Residual = b_records
            .iter()
            .enumerate()
            .map(|(i, r)| (RecordId::tagged(Side::B, i), r))
            .collect();
        let candidates = Candidates::Link(&a, &b);
        let pairs = classifier.match_records(candidates, 0.5).unwrap();
        let mut seen = FxHashSet::default();
        for cluster in &pairs {
            assert_eq!(cluster.len(), 2);
            for id in cluster.ids() {
                assert!(seen.insert(id), "{id} matched twice");
            }
        }
        assert!(pairs.iter().any(|c| c.ids()
            == vec![RecordId::tagged(Side::A, 0), RecordId::tagged(Side::B, 1)]));
    }

    #[test]
    fn settings_snapshot_restores_scores() {
        let classifier = trained();
        let mut bytes = Vec::new();
        classifier.write_settings(&mut bytes).unwrap();
        let mut restored = MinHashClassifier::new(Vec::new(), ClassifierParams::default());
        restored.load_settings(&mut bytes.as_slice()).unwrap();
        let (a, b) = pair("oakwood primary school", "oakwood primary");
        assert_eq!(restored.fields(), classifier.fields());
        assert!((restored.score(&a, &b) - classifier.score(&a, &b)).abs() < 1e-12);
    }

    #[test]
    fn untrained_settings_cannot_be_written() {
        let err = classifier().write_settings(&mut Vec::new()).unwrap_err();
        assert!(matches!(err, LinkageError::Training(_)));
    }

    #[test]
    fn interactive_labeling_consumes_pool_until_finished() {
        let records = schools(&["oakwood", "oakwood school", "elmhurst", "kings college"]);
        let residual: Residual = records
            .iter()
            .enumerate()
            .map(|(i, r)| (RecordId::bare(i), r))
            .collect();
        let mut classifier = classifier();
        classifier.sample(Candidates::Dedup(&residual), 6);
        assert_eq!(classifier.pool_len(), 6);
        let mut labeler = ScriptedLabeler::new([Label::Match, Label::Unsure, Label::Distinct]);
        classifier.label_interactively(&mut labeler).unwrap();
        assert_eq!(labeler.asked, 4);
        assert_eq!(classifier.write_training().len(), 2);
        assert_eq!(classifier.pool_len(), 2);
    }

    fn school_record(school: &str, postcode: &str) -> Record {
        [("School", school), ("Postcode", postcode)].into_iter().collect()
    }

    fn feature_vector(classifier: &MinHashClassifier, left: &Record, right: &Record) -> Vec<f64> {
        classifier.features(left, right, &classifier.signature(left), &classifier.signature(right))
    }

    #[test]
    fn exact_fields_score_equality_only() {
        let classifier = MinHashClassifier::new(
            vec![
                FieldDefinition::string("School"),
                FieldDefinition {
                    field: "Postcode".to_string(),
                    kind: FieldType::Exact,
                },
            ],
            ClassifierParams::default(),
        );
        let oakwood = school_record("oakwood primary", "ls1 4ab");
        let same_code = school_record("oakwood primary", "ls1 4ab");
        let near_code = school_record("oakwood primary", "ls1 4ac");
        let no_code = school_record("oakwood primary", "");

        assert_eq!(feature_vector(&classifier, &oakwood, &same_code), vec![1.0, 1.0]);
        assert_eq!(feature_vector(&classifier, &oakwood, &near_code), vec![1.0, 0.0]);
        assert_eq!(feature_vector(&classifier, &oakwood, &no_code), vec![1.0, 0.0]);
        assert_eq!(feature_vector(&classifier, &no_code, &no_code), vec![1.0, 0.0]);
    }

    #[test]
    fn interaction_multiplies_its_variables() {
        let classifier = MinHashClassifier::new(
            vec![
                FieldDefinition::string("School"),
                FieldDefinition::string("Postcode"),
                FieldDefinition {
                    field: "school_postcode".to_string(),
                    kind: FieldType::Interaction {
                        interaction_variables: vec!["School".to_string(), "Postcode".to_string()],
                    },
                },
            ],
            ClassifierParams::default(),
        );
        let oakwood = school_record("oakwood primary school", "ls1 4ab");

        let identical = feature_vector(&classifier, &oakwood, &oakwood.clone());
        assert_eq!(identical, vec![1.0, 1.0, 1.0]);

        let moved = school_record("oakwood primary", "ls1 4ab");
        let features = feature_vector(&classifier, &oakwood, &moved);
        assert_eq!(features.len(), 3);
        assert_eq!(features[1], 1.0);
        assert!(features[0] > 0.0 && features[0] < 1.0);
        assert_eq!(features[2], features[0] * features[1]);

        let blank = school_record("oakwood primary school", "");
        let features = feature_vector(&classifier, &oakwood, &blank);
        assert_eq!(features, vec![1.0, 0.0, 0.0]);
    }
}
