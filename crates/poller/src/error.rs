use std::fmt;

/// A single failed status lookup. The poller treats these as transient.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("status request failed: {0}")]
    Request(String),
    #[error("status endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("undecodable status response: {0}")]
    Decode(String),
    #[error("invalid status url: {0}")]
    InvalidUrl(String),
}

impl PollError {
    pub(crate) fn request(e: impl fmt::Display) -> Self {
        Self::Request(e.to_string())
    }
}
