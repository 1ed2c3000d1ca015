use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("IO operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("Transfer failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Invalid URL {url:?}: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },

    #[error("[{url}] Unexpected HTTP status: {status}")]
    Status { url: String, status: u16 },

    #[error("[{url}] Invalid latency response: {body:?}")]
    InvalidLatencyResponse { url: String, body: String },

    #[error("Could not extract {0}")]
    Extract(&'static str),

    #[error("Server not found: {0}")]
    ServerNotFound(u64),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Deadline exceeded")]
    DeadlineExceeded,

    #[error("No probe tasks succeeded")]
    NoTasksSucceeded,

    #[error("Nothing to probe: the workload has no tasks")]
    EmptyWorkload,
}

impl ProbeError {
    /// True when the error means "ran out of time" rather than "server is broken".
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ProbeError::Cancelled | ProbeError::DeadlineExceeded)
    }
}

pub type Result<T> = std::result::Result<T, ProbeError>;
