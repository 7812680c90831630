use thiserror::Error;

/// Error taxonomy for the importer. Only `Config` aborts a run; the other
/// kinds are either retried (`SourceQuery`, inside the source client) or
/// recorded per window and skipped (`Window`).
#[derive(Debug, Error)]
pub enum ImportError {
    /// Invalid or contradictory run configuration. Never retried.
    #[error("{0}")]
    Config(String),

    /// Source query still failing after the retry budget is spent.
    #[error("Source query failed: {0}")]
    SourceQuery(String),

    /// A single window's transcode or destination write failed.
    #[error("{0}")]
    Window(String),

    /// Checkpoint store read/write failure.
    #[error("State store error: {0}")]
    StateStore(String),

    /// Unknown run id or an impossible pause/resume/cancel transition.
    #[error("{0}")]
    InvalidRequest(String),
}

impl ImportError {
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    pub fn source_query<S: Into<String>>(message: S) -> Self {
        Self::SourceQuery(message.into())
    }

    pub fn window<S: Into<String>>(message: S) -> Self {
        Self::Window(message.into())
    }

    pub fn state_store<S: Into<String>>(message: S) -> Self {
        Self::StateStore(message.into())
    }

    pub fn invalid_request<S: Into<String>>(message: S) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_))
    }
}

pub type ImportResult<T> = std::result::Result<T, ImportError>;
