use thiserror::Error;

/// Fetch/poll failures. Callers recover by retrying on the next tick.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("failed to decode remote state: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("remote unavailable: {0}")]
    Unavailable(String),
}

/// Command failures. Surfaced to the caller of the command.
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status: {status} body={body}")]
    UnexpectedStatus {
        status: reqwest::StatusCode,
        body: String,
    },
    #[error("failed to encode command or decode reply: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("remote unavailable: {0}")]
    Unavailable(String),
}
