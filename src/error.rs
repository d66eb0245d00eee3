use crate::response::Status;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkageError {
    /// Invalid or inconsistent configuration, raised before any file I/O.
    #[error("configuration error: {0}")]
    Config(String),
    /// A configured match field is absent from an input header.
    #[error("could not find field '{field}' in {dataset} header")]
    MissingField { field: String, dataset: String },
    /// Unreadable or malformed input data.
    #[error("input error: {0}")]
    Input(String),
    /// Cached classifier state is absent or unreadable, or there is nothing
    /// to train from.
    #[error("training error: {0}")]
    Training(String),
    /// Blocking produced zero candidate pairs, so no threshold exists.
    #[error(
        "no records could be linked: the classifier found no candidate pairs. \
         This usually means every training question was answered 'no'; retrain with \
         at least one positive example"
    )]
    NoLinkableRecords,
    /// Record bookkeeping no longer adds up. Always a defect.
    #[error("internal consistency error: {0}")]
    Consistency(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("malformed configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl LinkageError {
    pub fn config<T: std::fmt::Display>(msg: T) -> LinkageError {
        LinkageError::Config(msg.to_string())
    }

    pub fn input<T: std::fmt::Display>(msg: T) -> LinkageError {
        LinkageError::Input(msg.to_string())
    }

    pub fn training<T: std::fmt::Display>(msg: T) -> LinkageError {
        LinkageError::Training(msg.to_string())
    }

    pub fn consistency<T: std::fmt::Display>(msg: T) -> LinkageError {
        LinkageError::Consistency(msg.to_string())
    }

    pub fn missing_field(field: &str, dataset: &str) -> LinkageError {
        LinkageError::MissingField {
            field: field.to_string(),
            dataset: dataset.to_string(),
        }
    }

    /// Response status for the batch job: operator-correctable failures are
    /// reported as bad requests, everything else as server errors.
    pub fn status(&self) -> Status {
        match self {
            LinkageError::Config(_)
            | LinkageError::MissingField { .. }
            | LinkageError::Input(_)
            | LinkageError::Training(_)
            | LinkageError::NoLinkableRecords
            | LinkageError::Yaml(_) => Status::BadRequest,
            LinkageError::Consistency(_)
            | LinkageError::Io(_)
            | LinkageError::Csv(_)
            | LinkageError::Json(_) => Status::InternalServerError,
        }
    }
}

pub type Result<T> = std::result::Result<T, LinkageError>;
