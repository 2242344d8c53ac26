//! Error types for probe operations.

use thiserror::Error;

/// Main error type for the probe engine.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("raw socket requires elevated privilege: {0}")]
    PermissionDenied(#[source] std::io::Error),

    #[error("{0} is not supported")]
    Unsupported(&'static str),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("failed to send probe: {0}")]
    SendFailed(#[source] std::io::Error),

    #[error("failed to receive reply: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    #[error("malformed reply: expected at least {expected} bytes, got {actual}")]
    MalformedReply { expected: usize, actual: usize },

    #[error("receive window expired")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProbeError {
    /// Returns true if this error means "keep reading packets" rather
    /// than giving up. Raw ICMP sockets see every ICMP message on the
    /// host, so unparseable traffic is expected during a probe.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::MalformedReply { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(ProbeError::Timeout.is_retryable());
        assert!(ProbeError::MalformedReply {
            expected: 20,
            actual: 4
        }
        .is_retryable());
        assert!(!ProbeError::Unsupported("x").is_retryable());
        assert!(!ProbeError::InvalidAddress("y".into()).is_retryable());
    }
}
