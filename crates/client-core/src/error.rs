use thiserror::Error;

/// Error taxonomy shared by the job-API client, the executors, and the worker loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    /// Missing required configuration, or a contradictory operating mode.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A precondition on caller-supplied arguments was violated; never retried.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// No HTTP response was ever obtained after exhausting the retry budget. Carries the
    /// formatted transport error rather than a concrete HTTP-library type, so this crate
    /// never depends on reqwest.
    #[error("transport error: {0}")]
    Transport(String),

    /// No credentials are available to acquire a bearer token.
    #[error("no credentials available for authentication")]
    Unauthenticated,

    /// An HTTP response with status >= 300 that was not a retried 401.
    #[error("api error: {status} {reason}")]
    Api { status: u16, reason: String },

    /// A precondition failure inside an executor (e.g. the image-existence probe failed).
    #[error("executor error: {0}")]
    Executor(String),
}

impl WorkerError {
    /// True for a claim response of 409 Conflict: another worker won the race.
    pub fn is_claim_conflict(&self) -> bool {
        matches!(self, WorkerError::Api { status: 409, .. })
    }

    pub fn api_status(&self) -> Option<u16> {
        match self {
            WorkerError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}
