use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Operation(#[from] OperationError),
}

/// Failures talking to the tracker binary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("tracker binary is not available")]
    BinaryUnavailable,
    #[error("tracker command failed with exit code {exit_code:?}: {stderr}")]
    CommandFailed { exit_code: Option<i32>, stderr: String },
    #[error("tracker command timed out")]
    Timeout,
    #[error("tracker output could not be parsed: {0}")]
    MalformedOutput(String),
    #[error("failed to run tracker: {0}")]
    Spawn(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum OperationError {
    #[error("at least one tag is required")]
    NoTags,
    #[error("no timer is running")]
    NoActiveTimer,
    #[error("active timer has no interval id")]
    InvalidTimerId,
    #[error("invalid tags: {}", .0.join("; "))]
    InvalidTags(Vec<String>),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

impl OperationError {
    /// Caller-input errors are detected before any tracker command is issued.
    pub fn is_caller_error(&self) -> bool {
        !matches!(self, Self::Gateway(_))
    }
}
