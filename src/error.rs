use thiserror::Error;

/// Failures a scan session can surface to its caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("invalid domain: {0:?}")]
    InvalidDomain(String),
    #[error("unsupported data source: {0:?}")]
    InvalidSource(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("channel closed before all tools reported")]
    ClosedEarly,
}

#[derive(Debug, Error)]
pub enum HistoryError {
    #[error("history io: {0}")]
    Io(#[from] std::io::Error),
    #[error("history encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("history request: {0}")]
    Http(#[from] reqwest::Error),
    #[error("history service answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("history unavailable: {0}")]
    Unavailable(String),
}
