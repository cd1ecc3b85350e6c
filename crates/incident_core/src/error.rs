use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IncidentError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Embedding error: {0:#}")]
    Embedding(#[from] anyhow::Error),

    #[error("{} not found.", .0.display())]
    MissingFile(PathBuf),

    #[error("Invalid argument: {0}")]
    InvalidArg(String),

    #[error("Model not trained. Please train the model first.")]
    NotTrained,

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("{0}")]
    NotEnoughData(String),

    #[error("LLM error: {0}")]
    Llm(String),
}

pub type Result<T> = std::result::Result<T, IncidentError>;
