use thiserror::Error;

/// Failures at the solver boundary, classified by how callers should react.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SolverError {
    /// Transport failure, timeout or a server-side error. Safe to retry for reads.
    #[error("solver network error (stage={stage}): {detail}")]
    Network { stage: &'static str, detail: String },

    /// Malformed request or response shape. Never retried.
    #[error("solver validation error (stage={stage}): {detail}")]
    Validation { stage: &'static str, detail: String },

    /// A stale id reference.
    #[error("{what} not found")]
    NotFound { what: String },
}

impl SolverError {
    pub fn network(stage: &'static str, detail: impl std::fmt::Display) -> Self {
        Self::Network {
            stage,
            detail: detail.to_string(),
        }
    }

    pub fn validation(stage: &'static str, detail: impl std::fmt::Display) -> Self {
        Self::Validation {
            stage,
            detail: detail.to_string(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}
