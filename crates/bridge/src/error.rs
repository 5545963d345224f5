//! Error taxonomy for the bridge.
//!
//! No error defined here crosses a loop boundary: the orchestrator's tasks
//! log these at the point of occurrence and continue. Only `ConfigInvalid`
//! and an unrecovered startup `ConnectError` reach `main` and translate to a
//! non-zero exit code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("failed to connect to {target}: {source}")]
    ConnectError {
        target: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("fetch failed for stream(s) {streams:?}: {source}")]
    FetchError {
        streams: Vec<String>,
        #[source]
        source: anyhow::Error,
    },

    #[error("ack/delete failed for {stream}:{id}: {source}")]
    AckError {
        stream: String,
        id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("publish failed for topic {topic}: {source}")]
    PublishError {
        topic: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("circuit breaker open (generation {generation})")]
    OpenState { generation: u64 },

    #[error("circuit breaker rejected: too many concurrent calls (limit {limit})")]
    TooManyConcurrent { limit: u32 },

    #[error("publish to {topic} timed out after {timeout_ms}ms")]
    WriteTimeout { topic: String, timeout_ms: u64 },

    #[error("failed to parse ack payload: {0}")]
    ParseError(#[from] serde_json::Error),

    #[error("bus client not connected")]
    NotConnected,

    #[error(transparent)]
    Redis(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// `WriteTimeout` is treated as a publish failure for breaker purposes.
    pub fn counts_as_publish_failure(&self) -> bool {
        matches!(
            self,
            BridgeError::PublishError { .. } | BridgeError::WriteTimeout { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_timeout_counts_as_publish_failure() {
        let err = BridgeError::WriteTimeout {
            topic: "t/out".into(),
            timeout_ms: 500,
        };
        assert!(err.counts_as_publish_failure());
    }

    #[test]
    fn test_open_state_does_not_count_as_publish_failure() {
        let err = BridgeError::OpenState { generation: 3 };
        assert!(!err.counts_as_publish_failure());
    }

    #[test]
    fn test_display() {
        let err = BridgeError::NotConnected;
        assert_eq!(err.to_string(), "bus client not connected");
    }
}
