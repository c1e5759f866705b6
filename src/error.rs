use thiserror::Error;

/// Everything that can go wrong inside one heartbeat cycle.
///
/// The `Display` text is what ends up in the stats' last-error field and in
/// `on_failed`, so keep it short and human-readable.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HeartbeatError {
    #[error("config error: {0}")]
    Config(String),

    #[error("capture error: {0}")]
    Capture(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("signature error: {0}")]
    Signature(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Protocol { status: u16, body: String },

    #[error("cancelled before {0}")]
    Cancelled(&'static str),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl HeartbeatError {
    /// HTTP status carried by a protocol failure, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            HeartbeatError::Protocol { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<anyhow::Error> for HeartbeatError {
    fn from(e: anyhow::Error) -> Self {
        HeartbeatError::Unexpected(e.to_string())
    }
}

pub type HeartbeatResult<T> = std::result::Result<T, HeartbeatError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_message_carries_status_and_body() {
        let err = HeartbeatError::Protocol {
            status: 503,
            body: "maintenance".to_string(),
        };
        assert_eq!(err.to_string(), "HTTP 503: maintenance");
        assert_eq!(err.http_status(), Some(503));
        assert_eq!(HeartbeatError::Network("reset".into()).http_status(), None);
    }
}
