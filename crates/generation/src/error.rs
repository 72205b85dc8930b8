use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GenerationError {
    /// The request never produced a response (connect, DNS, TLS, reset).
    #[error("inference request failed: {0}")]
    Request(String),

    #[error("inference call exceeded {0:?}")]
    Timeout(Duration),

    /// The service answered with a non-2xx status.
    #[error("inference service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("malformed inference response: {0}")]
    MalformedResponse(String),

    #[error("inference service returned an invalid url: {0}")]
    InvalidUrl(String),

    #[error("invalid generation client configuration: {0}")]
    Config(String),
}

impl GenerationError {
    /// Short reason suitable for a job's failure column.
    pub fn reason(&self) -> String {
        match self {
            Self::Request(_) => "inference service unreachable".to_string(),
            Self::Timeout(d) => format!("inference timed out after {}s", d.as_secs()),
            Self::Status { status, .. } => format!("inference service returned {status}"),
            Self::MalformedResponse(_) => "malformed inference response".to_string(),
            Self::InvalidUrl(_) => "inference returned an invalid url".to_string(),
            Self::Config(_) => "generation client misconfigured".to_string(),
        }
    }
}
