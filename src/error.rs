use polars::prelude::PolarsError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FusionError {
    /// The primary (budget/metadata) dataset is absent or has no columns.
    /// This is the only fatal domain condition of the pipeline.
    #[error("Missing primary data: {0}")]
    MissingPrimaryData(String),

    #[error("Planning error: {0}")]
    Planning(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Execution error: {0}")]
    Execution(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Polars error: {0}")]
    Polars(String),
}

impl From<PolarsError> for FusionError {
    fn from(e: PolarsError) -> Self {
        FusionError::Polars(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FusionError>;
