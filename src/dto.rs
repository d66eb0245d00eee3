use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{LinkageError, Result};

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct DataFile {
    pub bucket: String,
    pub key: String,
}

impl fmt::Display for DataFile {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "s3://{}/{}", self.bucket, self.key)
    }
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Find duplicates within one file.
    Dedup,
    /// Find matches across two files.
    Link,
}

/// How the classifier compares one field.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(tag = "type")]
pub enum FieldType {
    String,
    Exact,
    /// Product of other fields' similarities. Not a column, so never hashed
    /// for exact matching or checked against input headers.
    #[serde(rename_all = "camelCase")]
    Interaction { interaction_variables: Vec<String> },
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct FieldDefinition {
    pub field: String,
    #[serde(flatten)]
    pub kind: FieldType,
}

impl FieldDefinition {
    pub fn string<S: Into<String>>(field: S) -> Self {
        FieldDefinition {
            field: field.into(),
            kind: FieldType::String,
        }
    }

    pub fn is_interaction(&self) -> bool {
        matches!(self.kind, FieldType::Interaction { .. })
    }
}

/// Ordered column fields used for exact hashing and comparison.
pub fn match_fields(fields: &[FieldDefinition]) -> Vec<String> {
    fields
        .iter()
        .filter(|f| !f.is_interaction())
        .map(|f| f.field.clone())
        .collect()
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClassifierParams {
    /// Number of MinHash permutations per signature.
    #[serde(default = "default_num_perm")]
    pub num_perm: usize,
    /// Number of LSH bands; must divide `num_perm`.
    #[serde(default = "default_num_bands")]
    pub num_bands: usize,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for ClassifierParams {
    fn default() -> Self {
        ClassifierParams {
            num_perm: default_num_perm(),
            num_bands: default_num_bands(),
            seed: default_seed(),
        }
    }
}

///
/// Settings for one dedup or link run.
///
/// Parsed from YAML by the CLI and from the invocation event by the batch job.
///
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LinkageConfig {
    pub fields: Vec<FieldDefinition>,
    /// Link mode: the second file's column names, mapped by position onto
    /// the column fields of `fields`.
    #[serde(default)]
    pub secondary_fields: Option<Vec<String>>,
    #[serde(default = "default_sample_size")]
    pub sample_size: usize,
    #[serde(default = "default_recall_weight")]
    pub recall_weight: f64,
    #[serde(default)]
    pub inner_join: bool,
    /// Link mode: header of an extra leading column carrying each pair's score.
    #[serde(default)]
    pub score_column: Option<String>,
    /// Dedup mode: keep only the first row of each cluster.
    #[serde(default)]
    pub destructive: bool,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
    #[serde(default = "default_training_file")]
    pub training_file: PathBuf,
    #[serde(default = "default_settings_file")]
    pub settings_file: PathBuf,
    #[serde(default)]
    pub classifier: ClassifierParams,
}

impl LinkageConfig {
    pub fn new(fields: Vec<FieldDefinition>) -> Self {
        LinkageConfig {
            fields,
            secondary_fields: None,
            sample_size: default_sample_size(),
            recall_weight: default_recall_weight(),
            inner_join: false,
            score_column: None,
            destructive: false,
            delimiter: default_delimiter(),
            training_file: default_training_file(),
            settings_file: default_settings_file(),
            classifier: ClassifierParams::default(),
        }
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: LinkageConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            LinkageError::config(format!("could not read {}: {err}", path.display()))
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn match_fields(&self) -> Vec<String> {
        match_fields(&self.fields)
    }

    pub fn delimiter_byte(&self) -> Result<u8> {
        u8::try_from(self.delimiter)
            .ok()
            .filter(u8::is_ascii)
            .ok_or_else(|| {
                LinkageError::config(format!("delimiter '{}' must be ASCII", self.delimiter))
            })
    }

    /// Checks everything that can be checked before touching input files.
    pub fn validate(&self) -> Result<()> {
        let columns = self.match_fields();
        if columns.is_empty() {
            return Err(LinkageError::config(
                "at least one non-interaction field must be configured",
            ));
        }
        for def in &self.fields {
            if let FieldType::Interaction {
                interaction_variables,
            } = &def.kind
            {
                if interaction_variables.is_empty() {
                    return Err(LinkageError::config(format!(
                        "interaction '{}' names no variables",
                        def.field
                    )));
                }
                if let Some(unknown) = interaction_variables.iter().find(|v| !columns.contains(*v))
                {
                    return Err(LinkageError::config(format!(
                        "interaction '{}' refers to unknown field '{}'",
                        def.field, unknown
                    )));
                }
            }
        }
        if let Some(secondary) = &self.secondary_fields {
            if secondary.len() != columns.len() {
                return Err(LinkageError::config(format!(
                    "secondaryFields lists {} columns but fields lists {}",
                    secondary.len(),
                    columns.len()
                )));
            }
        }
        if !(self.recall_weight >= 1.0) {
            return Err(LinkageError::config(format!(
                "recall weight must be at least 1, got {}",
                self.recall_weight
            )));
        }
        if self.sample_size == 0 {
            return Err(LinkageError::config("sample size must be greater than zero"));
        }
        let params = &self.classifier;
        if params.num_bands == 0 || params.num_perm == 0 || params.num_perm % params.num_bands != 0
        {
            return Err(LinkageError::config(format!(
                "numBands ({}) must be non-zero and divide numPerm ({})",
                params.num_bands, params.num_perm
            )));
        }
        self.delimiter_byte()?;
        Ok(())
    }
}

///
/// Invocation event for the batch job.
///
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkageJob {
    pub mode: Mode,
    /// One file for dedup, two for link.
    pub inputs: Vec<DataFile>,
    /// Prefix for the cached training artifacts (`training.json`, `cached_settings`).
    pub training: DataFile,
    /// Load the cached classifier instead of replaying the training log.
    #[serde(default)]
    pub use_cached_settings: bool,
    pub config: LinkageConfig,
}

fn default_sample_size() -> usize {
    1500
}

fn default_recall_weight() -> f64 {
    1.0
}

fn default_delimiter() -> char {
    ','
}

fn default_training_file() -> PathBuf {
    PathBuf::from("./data/training/training.json")
}

fn default_settings_file() -> PathBuf {
    PathBuf::from("./data/training/cached_settings")
}

fn default_num_perm() -> usize {
    60
}

fn default_num_bands() -> usize {
    20
}

fn default_seed() -> u64 {
    0x5eed
}
