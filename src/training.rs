use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{LinkageError, Result};
use crate::labeling::Label;
use crate::record::Record;
use crate::util::{read_if_exists, write_atomically};

pub type RecordPair = (Record, Record);

/// Labeled example pairs, persisted as `training.json`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingLog {
    #[serde(rename = "match", default)]
    pub matches: Vec<RecordPair>,
    #[serde(default)]
    pub distinct: Vec<RecordPair>,
}

impl TrainingLog {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|err| LinkageError::training(format!("unreadable training log: {err}")))
    }

    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Files the pair under `label`; `Unsure` and `Finished` are ignored.
    pub fn record(&mut self, label: Label, pair: RecordPair) {
        match label {
            Label::Match => self.matches.push(pair),
            Label::Distinct => self.distinct.push(pair),
            Label::Unsure | Label::Finished => {}
        }
    }

    /// Appends `other`'s examples, skipping ones already present.
    pub fn extend(&mut self, other: &TrainingLog) {
        for pair in &other.matches {
            if !self.matches.contains(pair) {
                self.matches.push(pair.clone());
            }
        }
        for pair in &other.distinct {
            if !self.distinct.contains(pair) {
                self.distinct.push(pair.clone());
            }
        }
    }

    pub fn len(&self) -> usize {
        self.matches.len() + self.distinct.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

///
/// Where the labeled-example log and the serialized classifier snapshot
/// live between runs.
///
pub trait TrainingStore {
    fn read_training(&self) -> Result<Option<TrainingLog>>;
    fn write_training(&mut self, log: &TrainingLog) -> Result<()>;
    fn read_settings(&self) -> Result<Option<Vec<u8>>>;
    fn write_settings(&mut self, settings: &[u8]) -> Result<()>;
}

/// File-backed store; every write lands via temp file and rename.
#[derive(Clone, Debug)]
pub struct FileStore {
    pub training_file: PathBuf,
    pub settings_file: PathBuf,
}

impl FileStore {
    pub fn new<P: Into<PathBuf>>(training_file: P, settings_file: P) -> Self {
        FileStore {
            training_file: training_file.into(),
            settings_file: settings_file.into(),
        }
    }
}

impl TrainingStore for FileStore {
    fn read_training(&self) -> Result<Option<TrainingLog>> {
        read_if_exists(&self.training_file)?
            .map(|bytes| TrainingLog::from_json(&bytes))
            .transpose()
    }

    fn write_training(&mut self, log: &TrainingLog) -> Result<()> {
        write_atomically(&self.training_file, &log.to_json()?)
    }

    fn read_settings(&self) -> Result<Option<Vec<u8>>> {
        read_if_exists(&self.settings_file)
    }

    fn write_settings(&mut self, settings: &[u8]) -> Result<()> {
        write_atomically(&self.settings_file, settings)
    }
}

/// In-memory store for tests and for callers that move state elsewhere.
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    pub training: Option<TrainingLog>,
    pub settings: Option<Vec<u8>>,
}

impl TrainingStore for MemoryStore {
    fn read_training(&self) -> Result<Option<TrainingLog>> {
        Ok(self.training.clone())
    }

    fn write_training(&mut self, log: &TrainingLog) -> Result<()> {
        self.training = Some(log.clone());
        Ok(())
    }

    fn read_settings(&self) -> Result<Option<Vec<u8>>> {
        Ok(self.settings.clone())
    }

    fn write_settings(&mut self, settings: &[u8]) -> Result<()> {
        self.settings = Some(settings.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(left: &str, right: &str) -> RecordPair {
        (
            [("name", left)].into_iter().collect(),
            [("name", right)].into_iter().collect(),
        )
    }

    #[test]
    fn log_uses_match_and_distinct_keys() {
        let mut log = TrainingLog::default();
        log.record(Label::Match, pair("Oakwood", "oakwood school"));
        log.record(Label::Distinct, pair("Oakwood", "Elmhurst"));
        log.record(Label::Unsure, pair("a", "b"));
        let json: serde_json::Value = serde_json::from_slice(&log.to_json().unwrap()).unwrap();
        assert_eq!(json["match"][0][1]["name"], "oakwood school");
        assert_eq!(json["distinct"].as_array().unwrap().len(), 1);
        assert_eq!(TrainingLog::from_json(&log.to_json().unwrap()).unwrap(), log);
    }

    #[test]
    fn extend_skips_known_examples() {
        let mut log = TrainingLog::default();
        log.record(Label::Match, pair("a", "a"));
        let mut other = log.clone();
        other.record(Label::Distinct, pair("a", "b"));
        log.extend(&other);
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn malformed_log_is_a_training_error() {
        let err = TrainingLog::from_json(b"{not json").unwrap_err();
        assert!(matches!(err, LinkageError::Training(_)));
    }

    #[test]
    fn file_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(
            dir.path().join("training.json"),
            dir.path().join("cached_settings"),
        );
        assert!(store.read_training().unwrap().is_none());
        assert!(store.read_settings().unwrap().is_none());

        let mut log = TrainingLog::default();
        log.record(Label::Match, pair("x", "x"));
        store.write_training(&log).unwrap();
        store.write_settings(b"{}").unwrap();
        assert_eq!(store.read_training().unwrap(), Some(log));
        assert_eq!(store.read_settings().unwrap(), Some(b"{}".to_vec()));
    }
}
