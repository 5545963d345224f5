//! Consumes inbound ack messages and finalizes the corresponding upstream
//! entry.
//!
//! A malformed payload is discarded silently — the publisher on the other
//! end of the bus is outside this process's control and a bad message here
//! must never take down the finalizer loop. `ack: false` is a deliberate
//! no-op: the entry stays pending and is picked up again by idle-claim.

use std::sync::Arc;
use std::time::Duration;

use bridge_domain::AckMessage;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics;
use crate::stream_client::StreamClient;

pub struct AckFinalizer {
    stream_client: Arc<Mutex<StreamClient>>,
    ack_timeout: Duration,
}

impl AckFinalizer {
    pub fn new(stream_client: Arc<Mutex<StreamClient>>, ack_timeout: Duration) -> Self {
        Self {
            stream_client,
            ack_timeout,
        }
    }

    /// Parses `payload` and, for `ack: true`, acks and deletes the
    /// referenced entry within `ack_timeout`. Returns `Ok(())` even when the
    /// payload was malformed or the ack was negative; only a timed-out or
    /// failed ack/delete call surfaces an error.
    pub async fn handle(&self, payload: &[u8]) -> Result<()> {
        let message: AckMessage = match serde_json::from_slice(payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "discarding malformed ack payload");
                return Ok(());
            }
        };

        if !message.is_valid() {
            warn!(id = %message.id, stream = %message.stream, "discarding ack with empty id/stream");
            return Ok(());
        }

        if !message.ack {
            debug!(id = %message.id, stream = %message.stream, "negative ack, leaving entry pending");
            return Ok(());
        }

        let stream_client = self.stream_client.clone();
        let stream = message.stream.clone();
        let id = message.id.clone();

        let fut = async move {
            let mut client = stream_client.lock().await;
            client.ack_and_delete(&stream, &[id]).await
        };

        let result = tokio::time::timeout(self.ack_timeout, fut)
            .await
            .map_err(|_| crate::error::BridgeError::AckError {
                stream: message.stream.clone(),
                id: message.id.clone(),
                source: anyhow::anyhow!("ack timed out"),
            })?;

        if result.is_ok() {
            metrics::ENTRIES_ACKED_TOTAL
                .with_label_values(&[&message.stream])
                .inc();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_config::StreamClientConfig;

    fn stream_config() -> StreamClientConfig {
        StreamClientConfig {
            addresses: vec!["redis://127.0.0.1:6379".into()],
            stream_name: "orders".into(),
            consumer_group: None,
            consumer_name: "consumer-test".into(),
            batch_size: 10,
            block_timeout: Duration::from_millis(100),
            claim_min_idle: Duration::from_secs(30),
            claim_batch_size: 50,
            claim_interval: Duration::from_secs(5),
            aggressive_claim: false,
            claim_cycle_delay: Duration::from_millis(0),
            drain_enabled: false,
            drain_interval: Duration::from_secs(60),
            drain_batch_size: 100,
            consumer_cleanup_enabled: true,
            consumer_idle_timeout: Duration::from_secs(300),
            consumer_cleanup_interval: Duration::from_secs(60),
            refresh_interval: Duration::from_secs(60),
            max_retries: 5,
            retry_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn test_ack_message_parses_and_validates() {
        let raw = br#"{"id":"1-0","stream":"orders","ack":true}"#;
        let message: AckMessage = serde_json::from_slice(raw).unwrap();
        assert!(message.is_valid());
        assert!(message.ack);
    }

    #[test]
    fn test_malformed_payload_does_not_parse() {
        let raw = b"not json";
        let result: std::result::Result<AckMessage, _> = serde_json::from_slice(raw);
        assert!(result.is_err());
    }

    #[test]
    fn test_config_builds_for_finalizer_construction() {
        let _ = stream_config();
    }
}
