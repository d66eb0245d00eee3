use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

use super::{Candidates, Edge, PairwiseClassifier};
use crate::cluster::Cluster;
use crate::dto::{match_fields, FieldDefinition};
use crate::error::{LinkageError, Result};
use crate::labeling::{Label, LabelRequest, LabelSource};
use crate::record::{Record, RecordId};
use crate::training::TrainingLog;

#[derive(Serialize, Deserialize)]
struct FixedSettings {
    fields: Vec<FieldDefinition>,
    threshold: f64,
}

///
/// Deterministic classifier without learning: a pair scores the fraction of
/// match fields on which both records hold the same non-blank value, and the
/// threshold is a constant. Pairs agreeing on no field are never compared.
///
/// Every trait call is appended to `calls`, which makes it handy for checking
/// how the orchestrator drives a classifier.
///
pub struct FixedRuleClassifier {
    fields: Vec<FieldDefinition>,
    columns: Vec<String>,
    threshold: f64,
    labeled: TrainingLog,
    sampled: Vec<(RecordId, RecordId)>,
    sampled_records: Vec<(Record, Record)>,
    pub calls: Vec<&'static str>,
}

impl FixedRuleClassifier {
    pub fn new(fields: Vec<FieldDefinition>, threshold: f64) -> Self {
        FixedRuleClassifier {
            columns: match_fields(&fields),
            fields,
            threshold,
            labeled: TrainingLog::default(),
            sampled: Vec::new(),
            sampled_records: Vec::new(),
            calls: Vec::new(),
        }
    }

    pub fn score(&self, left: &Record, right: &Record) -> f64 {
        if self.columns.is_empty() {
            return 0.0;
        }
        let agreeing = self
            .columns
            .iter()
            .filter(|field| match (left.get(field), right.get(field)) {
                (Some(l), Some(r)) => l == r,
                _ => false,
            })
            .count();
        agreeing as f64 / self.columns.len() as f64
    }

    pub fn sampled(&self) -> &[(RecordId, RecordId)] {
        &self.sampled
    }

    fn scored_pairs(&self, candidates: Candidates<'_>) -> Vec<Edge> {
        candidates
            .all_pairs()
            .into_iter()
            .filter_map(|(left, right)| {
                let score = self.score(candidates.record(left)?, candidates.record(right)?);
                (score > 0.0).then_some((left, right, score))
            })
            .collect()
    }
}

impl PairwiseClassifier for FixedRuleClassifier {
    fn fields(&self) -> &[FieldDefinition] {
        &self.fields
    }

    fn sample(&mut self, candidates: Candidates<'_>, sample_size: usize) {
        self.calls.push("sample");
        self.sampled = candidates.all_pairs();
        self.sampled.truncate(sample_size);
        self.sampled_records = self
            .sampled
            .iter()
            .filter_map(|&(left, right)| {
                Some((candidates.record(left)?.clone(), candidates.record(right)?.clone()))
            })
            .collect();
    }

    fn read_training(&mut self, log: &TrainingLog) {
        self.calls.push("read_training");
        self.labeled.extend(log);
    }

    fn label_interactively(&mut self, source: &mut dyn LabelSource) -> Result<()> {
        self.calls.push("label_interactively");
        for (left, right) in std::mem::take(&mut self.sampled_records) {
            let label = source.label(&LabelRequest {
                fields: &self.columns,
                left: &left,
                right: &right,
                positives: self.labeled.matches.len(),
                negatives: self.labeled.distinct.len(),
            })?;
            if label == Label::Finished {
                break;
            }
            self.labeled.record(label, (left, right));
        }
        Ok(())
    }

    fn write_training(&self) -> TrainingLog {
        self.labeled.clone()
    }

    fn train(&mut self) -> Result<()> {
        self.calls.push("train");
        Ok(())
    }

    fn knows_a_match(&self) -> bool {
        !self.labeled.matches.is_empty()
    }

    fn write_settings(&self, writer: &mut dyn Write) -> Result<()> {
        let settings = FixedSettings {
            fields: self.fields.clone(),
            threshold: self.threshold,
        };
        serde_json::to_writer(writer, &settings)?;
        Ok(())
    }

    fn load_settings(&mut self, reader: &mut dyn Read) -> Result<()> {
        let settings: FixedSettings = serde_json::from_reader(reader)
            .map_err(|err| LinkageError::training(format!("unreadable cached settings: {err}")))?;
        let calls = std::mem::take(&mut self.calls);
        *self = FixedRuleClassifier::new(settings.fields, settings.threshold);
        self.calls = calls;
        self.calls.push("load_settings");
        Ok(())
    }

    fn threshold(&self, candidates: Candidates<'_>, _recall_weight: f64) -> Result<f64> {
        if self.scored_pairs(candidates).is_empty() {
            return Err(LinkageError::NoLinkableRecords);
        }
        Ok(self.threshold)
    }

    fn match_records(&self, candidates: Candidates<'_>, threshold: f64) -> Result<Vec<Cluster>> {
        let edges = self
            .scored_pairs(candidates)
            .into_iter()
            .filter(|&(_, _, score)| score >= threshold)
            .collect();
        Ok(candidates.clusters_from_edges(edges))
    }
}
