use thiserror::Error;

/// Failure taxonomy shared by the acquisition, storage and feature layers.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Network error, timeout or non-200 status. Retried via the proxy cycle, then terminal.
    #[error("transport failure for {url}: {reason}")]
    Transport { url: String, reason: String },

    /// Page markup did not contain a required element.
    #[error("extraction failure for {path}: {reason}")]
    Extraction { path: String, reason: String },

    /// Unknown table or view, or rows/frames missing required columns. Never retried.
    #[error("schema error: {0}")]
    Schema(String),

    /// No trained artifact exists yet ("not enough data").
    #[error("precursor missing: {0}")]
    PrecursorMissing(String),

    /// Constraint violation outside the table's declared conflict policy.
    #[error("conflict in {table}: {reason}")]
    Conflict { table: String, reason: String },

    /// Search index or key store did not answer.
    #[error("discovery failure: {0}")]
    Discovery(String),

    #[error("artifact store error: {0}")]
    Artifact(String),

    #[error("training failure: {0}")]
    Training(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("dataframe error: {0}")]
    Frame(#[from] polars::error::PolarsError),
}

impl PipelineError {
    pub fn transport(url: &str, reason: impl ToString) -> Self {
        PipelineError::Transport {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn extraction(path: &str, reason: impl ToString) -> Self {
        PipelineError::Extraction {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for the "no trained model yet" signal callers should surface as insufficient data.
    pub fn is_precursor_missing(&self) -> bool {
        matches!(self, PipelineError::PrecursorMissing(_))
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
