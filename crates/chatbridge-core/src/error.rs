//! Error taxonomy for a single completion request.

use thiserror::Error;

/// Everything that can end a request early.
///
/// None of these are fatal to the process: each one terminates the current
/// request only and the session permit is released on the way out.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Malformed or empty request; no automation was attempted.
    #[error("{0}")]
    InvalidRequest(String),

    /// The shared session stayed held past the acquire timeout.
    #[error("Browser Busy")]
    SessionBusy,

    #[error("Input box not found")]
    InputNotFound,

    #[error("Timeout waiting for response")]
    ArrivalTimeout,

    /// The chat UI showed an error indicator instead of a reply.
    #[error("Upstream error: {0}")]
    UpstreamError(String),

    #[error("Image upload failed: {0}")]
    ImageInjectionFailed(String),

    /// Unexpected failure talking to the automation session.
    #[error("{0}")]
    Automation(#[from] anyhow::Error),
}

impl BridgeError {
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_matches_wire_text() {
        assert_eq!(BridgeError::SessionBusy.to_string(), "Browser Busy");
    }

    #[test]
    fn automation_errors_keep_message() {
        let err: BridgeError = anyhow::anyhow!("socket closed").into();
        assert_eq!(err.to_string(), "socket closed");
    }
}
