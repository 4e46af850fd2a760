//! Error types for the ingestion pipeline
//!
//! Every loop in the pipeline treats these as recoverable: a failed tick or
//! prediction is logged, reported to subscribers, and retried on the next
//! scheduled run. Only `SourceError::SchemaMismatch` and `ConfigError` are
//! expected to surface at startup.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Failed to open SQLite connection to {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Failed to prepare pooled connection: {0}")]
    Setup(#[from] rusqlite::Error),
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Raw source connection error: {0}")]
    Pool(#[from] PoolError),

    #[error("Raw source query failed: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Raw table {table} does not match the expected schema: {detail}")]
    SchemaMismatch { table: String, detail: String },
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Trend store connection error: {0}")]
    Pool(#[from] PoolError),

    #[error("Trend store query failed: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Schema migration failed: {0}")]
    Migration(String),
}

#[derive(Debug, Error)]
pub enum PredictError {
    #[error("Prediction request timed out")]
    Timeout,

    #[error("Prediction request failed: {0}")]
    Http(reqwest::Error),

    #[error("Prediction API returned status {0}")]
    Status(u16),

    #[error("Malformed prediction response: {0}")]
    MalformedResponse(String),
}

impl From<reqwest::Error> for PredictError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            PredictError::Timeout
        } else if err.is_decode() {
            PredictError::MalformedResponse(err.to_string())
        } else {
            PredictError::Http(err)
        }
    }
}
