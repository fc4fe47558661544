use thiserror::Error;

use crate::reports::ReportStage;

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("failed to write credential file {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Failures talking to the warehouse. Messages from the warehouse itself are
/// carried verbatim so query errors surface unchanged.
#[derive(Debug, Error)]
pub enum WarehouseError {
    #[error("warehouse request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("warehouse authentication failed: {0}")]
    Auth(String),

    #[error("warehouse returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed warehouse response: {0}")]
    Decode(String),

    #[error(transparent)]
    Credentials(#[from] CredentialError),
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),

    #[error("unsupported literal for parameter {name}: {value}")]
    UnsupportedLiteral { name: String, value: String },

    #[error("invalid query spec: {0}")]
    InvalidSpec(String),

    #[error("aggregate query returned no rows")]
    EmptyAggregate,
}

#[derive(Debug, Error)]
#[error("report failed while {stage}: {source:#}")]
pub struct ReportError {
    pub stage: ReportStage,
    #[source]
    pub source: anyhow::Error,
}

impl ReportError {
    pub fn new(stage: ReportStage, source: impl Into<anyhow::Error>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}
