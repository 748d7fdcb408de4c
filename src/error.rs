// src/error.rs
//
// Engine error taxonomy. One variant per propagation class — the orchestrator
// and workers match on kind() to pick the degradation path, so variants map
// 1:1 onto wire-visible annotation strings.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("malformed event: {0}")]
    MalformedEvent(String),

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("storage timeout on {0}")]
    StorageTimeout(&'static str),

    #[error("llm unavailable: {0}")]
    LlmUnavailable(String),

    #[error("verdict sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("internal fault: {0}")]
    InternalFault(String),
}

impl EngineError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedEvent(_)     => "malformed_event",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::StorageTimeout(_)     => "storage_timeout",
            Self::LlmUnavailable(_)     => "llm_unavailable",
            Self::SinkUnavailable(_)    => "sink_unavailable",
            Self::InternalFault(_)      => "internal_fault",
        }
    }

    /// Storage errors of either flavor — the zero-fill path in L1/L3.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::StorageUnavailable(_) | Self::StorageTimeout(_))
    }
}

impl From<tokio_postgres::Error> for EngineError {
    fn from(e: tokio_postgres::Error) -> Self {
        Self::StorageUnavailable(e.to_string())
    }
}

impl From<deadpool_postgres::PoolError> for EngineError {
    fn from(e: deadpool_postgres::PoolError) -> Self {
        match e {
            deadpool_postgres::PoolError::Timeout(_) => Self::StorageTimeout("pool"),
            other => Self::StorageUnavailable(other.to_string()),
        }
    }
}
