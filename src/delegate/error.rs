//! Error types returned by engine delegates

use thiserror::Error;

use super::ApplyStep;

#[derive(Error, Debug)]
pub enum DelegateError {
    /// The engine or operation will never work with this delegate
    #[error("{engine} {what} not implemented yet")]
    Unsupported { engine: String, what: String },

    #[error("unsupported engine type: {0}")]
    UnknownEngine(String),

    /// The request cannot be satisfied as written
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("failed to apply {step}: {source}")]
    Step {
        step: ApplyStep,
        #[source]
        source: Box<DelegateError>,
    },

    #[error("child record {0} not found")]
    ChildNotFound(String),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DelegateError {
    pub fn unsupported(engine: &str, what: impl Into<String>) -> Self {
        DelegateError::Unsupported {
            engine: engine.to_string(),
            what: what.into(),
        }
    }

    /// Whether this is a "will never work" result rather than a failure
    pub fn is_unsupported(&self) -> bool {
        match self {
            DelegateError::Unsupported { .. } | DelegateError::UnknownEngine(_) => true,
            DelegateError::Step { source, .. } => source.is_unsupported(),
            _ => false,
        }
    }

    /// Whether retrying the same request can succeed without external action
    pub fn is_retryable(&self) -> bool {
        match self {
            DelegateError::Unsupported { .. }
            | DelegateError::UnknownEngine(_)
            | DelegateError::Invalid(_)
            | DelegateError::Serialization(_) => false,
            DelegateError::Step { source, .. } => source.is_retryable(),
            DelegateError::ChildNotFound(_) => true,
            DelegateError::Kube(e) => match e {
                kube::Error::Api(api_err) if (400..500).contains(&api_err.code) => {
                    api_err.code == 404 || api_err.code == 409 || api_err.code == 429
                }
                _ => true,
            },
        }
    }
}
