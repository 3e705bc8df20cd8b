use thiserror::Error;

/// The error taxonomy, as a stable set of categories.
///
/// Each variant maps to exactly one category used for metrics labels and for
/// admission/audit surfacing. Local recovery is preferred for
/// `Evaluation`/`TransientIo`; every other variant is surfaced to the caller
/// (admission response, reconciliation status, or export).
#[derive(Debug, Error, Clone)]
pub enum GovernanceError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("compilation error: {0}")]
    Compilation(String),

    #[error("evaluation error: {0}")]
    Evaluation(String),

    #[error("timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("cache not ready")]
    CacheNotReady,

    #[error("transient I/O error: {0}")]
    TransientIo(String),

    #[error("config error: {0}")]
    Config(String),
}

impl GovernanceError {
    /// The taxonomy name this error belongs to, stable across variants'
    /// display text — used as a metrics label and a status-message prefix.
    pub fn category(&self) -> &'static str {
        match self {
            GovernanceError::Validation(_) => "ValidationError",
            GovernanceError::Compilation(_) => "CompilationError",
            GovernanceError::Evaluation(_) => "EvaluationError",
            GovernanceError::Timeout(_) => "TimeoutError",
            GovernanceError::CacheNotReady => "CacheNotReady",
            GovernanceError::TransientIo(_) => "TransientIOError",
            GovernanceError::Config(_) => "ConfigError",
        }
    }

    /// Whether this error kind is retried once with backoff before
    /// surfacing — only `TransientIOError` qualifies.
    pub fn is_retryable(&self) -> bool {
        matches!(self, GovernanceError::TransientIo(_))
    }
}

pub type Result<T> = std::result::Result<T, GovernanceError>;
