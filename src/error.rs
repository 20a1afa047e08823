use thiserror::Error;

/// Failures surfaced by the streaming engines, the wire codec and the
/// handshake.
///
/// Expected control-flow outcomes (no new step yet, end of stream) are not
/// errors; see [`crate::streaming::StepStatus`].
#[derive(Debug, Error)]
pub enum StreamError {
    /// Fatal, synchronous misconfiguration detected at open/start.
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed wire buffer or handshake record.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Failure reported by a transport primitive.
    #[error("transport error: {0}")]
    Transport(String),

    /// A per-block operator failed to encode or decode a payload.
    #[error("operator `{id}` failed: {source}")]
    Operator {
        id: String,
        #[source]
        source: anyhow::Error,
    },

    /// Caller misuse: wrong buffer size, put outside a step, unknown variable.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("closed: {0}")]
    Closed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StreamError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    pub fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    /// Whether the error aborts the stream it was raised on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Protocol(_) | Self::Closed(_))
    }
}

pub type Result<T> = std::result::Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_context() {
        let err = StreamError::config("stream name too long");
        assert_eq!(err.to_string(), "configuration error: stream name too long");

        let err = StreamError::Operator {
            id: "zstd".to_string(),
            source: anyhow::anyhow!("bad frame"),
        };
        assert_eq!(err.to_string(), "operator `zstd` failed: bad frame");
    }

    #[test]
    fn test_fatality() {
        assert!(StreamError::protocol("x").is_fatal());
        assert!(StreamError::config("x").is_fatal());
        assert!(!StreamError::transport("x").is_fatal());
        assert!(!StreamError::Timeout("x".into()).is_fatal());
    }
}
