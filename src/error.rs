//! Error types for the asset service.
//!
//! The variants mirror how failures are handled: `Validation` and `NotFound`
//! surface to the caller, `Backend` makes the worker reject the task so the
//! broker redelivers it, probe and remote-job variants map to per-step
//! failures in the pipeline state.

/// Result type for asset-service operations
pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Bad input: unknown step, unsupported asset type, malformed URI.
    #[error("validation error: {0}")]
    Validation(String),

    /// A requested asset / state / job record does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Blob store / document store / broker I/O failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// The ffprobe binary is not installed.
    #[error("ffprobe not found, install ffmpeg")]
    ProbeUnavailable,

    /// ffprobe exited non-zero or produced unparseable output.
    #[error("ffprobe failed: {0}")]
    ProbeFailed(String),

    /// ffprobe exceeded its hard timeout.
    #[error("ffprobe timed out")]
    ProbeTimeout,

    /// A remote job reported a permanent failure.
    #[error("remote job failed: {0}")]
    RemoteJobFailed(String),

    /// A remote job exceeded its maximum wait.
    #[error("remote job timed out: {0}")]
    RemoteJobTimeout(String),

    /// LLM quota exhausted (HTTP 429 / RESOURCE_EXHAUSTED).
    #[error("quota exhausted: {0}")]
    QuotaExhausted(String),

    /// Anything else inside a step runner.
    #[error("{0}")]
    Internal(String),
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::Backend(format!("redis: {err}"))
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::Backend(format!("http: {err}"))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(format!("io: {err}"))
    }
}
