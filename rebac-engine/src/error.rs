use thiserror::Error;

/// Canonical wire status codes the facade maps engine errors onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    InvalidArgument,
    FailedPrecondition,
    OutOfRange,
    Internal,
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("definition `{0}` not found")]
    NamespaceNotFound(String),

    #[error("relation `{relation}` not found under definition `{namespace}`")]
    RelationNotFound { namespace: String, relation: String },

    #[error("caveat `{0}` not found")]
    CaveatNotFound(String),

    #[error("revision out of range: {0}")]
    OutOfRange(String),

    #[error("datastore is read-only")]
    ReadOnly,

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl EngineError {
    /// Wire code for this error. Schema lookups that fail at evaluation
    /// time surface as failed preconditions rather than invalid input.
    pub fn code(&self) -> StatusCode {
        match self {
            EngineError::InvalidArgument(_) => StatusCode::InvalidArgument,
            EngineError::PreconditionFailed(_)
            | EngineError::NamespaceNotFound(_)
            | EngineError::RelationNotFound { .. }
            | EngineError::CaveatNotFound(_)
            | EngineError::ReadOnly => StatusCode::FailedPrecondition,
            EngineError::OutOfRange(_) => StatusCode::OutOfRange,
            EngineError::Internal(_) => StatusCode::Internal,
        }
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Internal(anyhow::Error::new(err))
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
