//! Pub/sub bus client built on `rumqttc`, with a lock-free subscription
//! registry so incoming message dispatch never blocks on the connect/publish
//! path.
//!
//! The registry is swapped, not locked: `subscribe` builds a new map from
//! the old one plus the new handler and installs it with `ArcSwap::store`
//! before issuing the wire-level SUBSCRIBE, so a message that arrives the
//! instant after the broker acks the subscribe is guaranteed to find a
//! handler already in place.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use bridge_config::BusClientConfig;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};

pub type MessageHandler = Arc<dyn Fn(&str, &[u8]) + Send + Sync>;

pub struct BusClient {
    client: AsyncClient,
    config: BusClientConfig,
    /// Derived from the TLS client certificate's common name by the external
    /// TLS collaborator (out of scope here); `None` when unavailable.
    identity_prefix: Option<String>,
    handlers: Arc<ArcSwap<HashMap<String, MessageHandler>>>,
    is_connected: Arc<std::sync::atomic::AtomicBool>,
}

impl BusClient {
    /// Opens the connection and spawns the event-loop pump task. Polls the
    /// connected flag at `connect_poll_tick` (yielding between polls) until
    /// the broker's CONNACK arrives or `connect_timeout` elapses.
    /// `identity_prefix`, when present, comes from the external TLS
    /// collaborator's certificate-derived identity.
    pub async fn connect(config: BusClientConfig, identity_prefix: Option<String>) -> Result<Self> {
        if config.brokers.is_empty() {
            return Err(BridgeError::ConfigInvalid("no bus brokers configured".into()));
        }
        let broker = config.brokers.clone();

        let (host, port) = split_host_port(&broker)?;

        let mut options = MqttOptions::new(config.client_id.clone(), host, port);
        options.set_keep_alive(config.keep_alive);
        options.set_clean_session(config.clean_session);
        options.set_inflight(config.max_inflight);

        let (client, eventloop) = AsyncClient::new(options, config.message_channel_depth);

        let handlers: Arc<ArcSwap<HashMap<String, MessageHandler>>> =
            Arc::new(ArcSwap::from_pointee(HashMap::new()));
        let is_connected = Arc::new(std::sync::atomic::AtomicBool::new(false));

        spawn_event_pump(
            eventloop,
            client.clone(),
            config.clone(),
            handlers.clone(),
            is_connected.clone(),
        );

        let poll_tick = config.connect_poll_tick();
        let poll = async {
            loop {
                if is_connected.load(std::sync::atomic::Ordering::Acquire) {
                    return;
                }
                tokio::time::sleep(poll_tick).await;
                tokio::task::yield_now().await;
            }
        };

        tokio::time::timeout(config.connect_timeout, poll)
            .await
            .map_err(|_| BridgeError::ConnectError {
                target: broker.clone(),
                source: anyhow::anyhow!("connect timed out"),
            })?;

        info!(broker, "bus client connected");

        Ok(Self {
            client,
            config,
            identity_prefix,
            handlers,
            is_connected,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.is_connected.load(std::sync::atomic::Ordering::Acquire)
    }

    fn prefixed_topic(&self, topic: &str) -> String {
        prefix_topic(topic, &self.config, self.identity_prefix.as_deref())
    }

    /// Publishes, bounded by `write_timeout`.
    pub async fn publish(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(BridgeError::NotConnected);
        }
        let full_topic = self.prefixed_topic(topic);
        let qos = qos_from_u8(self.config.qos);

        let publish = self
            .client
            .publish(full_topic.clone(), qos, false, payload.to_vec());

        tokio::time::timeout(self.config.write_timeout, publish)
            .await
            .map_err(|_| BridgeError::WriteTimeout {
                topic: full_topic.clone(),
                timeout_ms: self.config.write_timeout.as_millis() as u64,
            })?
            .map_err(|e| BridgeError::PublishError {
                topic: full_topic,
                source: anyhow::Error::new(e),
            })
    }

    /// Installs the handler, then issues the wire subscribe.
    pub async fn subscribe(&self, topic: &str, handler: MessageHandler) -> Result<()> {
        let full_topic = self.prefixed_topic(topic);

        let current = self.handlers.load();
        let mut next = (**current).clone();
        next.insert(full_topic.clone(), handler);
        self.handlers.store(Arc::new(next));

        self.client
            .subscribe(&full_topic, qos_from_u8(self.config.qos))
            .await
            .map_err(|e| BridgeError::ConnectError {
                target: full_topic,
                source: anyhow::Error::new(e),
            })?;
        Ok(())
    }

    /// Issues the wire unsubscribe, then removes the handler.
    pub async fn unsubscribe(&self, topic: &str) -> Result<()> {
        let full_topic = self.prefixed_topic(topic);

        self.client
            .unsubscribe(&full_topic)
            .await
            .map_err(|e| BridgeError::ConnectError {
                target: full_topic.clone(),
                source: anyhow::Error::new(e),
            })?;

        let current = self.handlers.load();
        let mut next = (**current).clone();
        next.remove(&full_topic);
        self.handlers.store(Arc::new(next));
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.client
            .disconnect()
            .await
            .map_err(|e| BridgeError::ConnectError {
                target: "disconnect".into(),
                source: anyhow::Error::new(e),
            })
    }
}

fn spawn_event_pump(
    mut eventloop: EventLoop,
    client: AsyncClient,
    config: BusClientConfig,
    handlers: Arc<ArcSwap<HashMap<String, MessageHandler>>>,
    is_connected: Arc<std::sync::atomic::AtomicBool>,
) {
    tokio::spawn(async move {
        let base_backoff = Duration::from_millis(200);
        let mut backoff = base_backoff;

        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    backoff = base_backoff;
                    let was_connected = is_connected.swap(true, std::sync::atomic::Ordering::AcqRel);
                    info!("bus event loop: connack received");

                    if was_connected {
                        continue;
                    }
                    // Re-subscribe every topic already in the registry: this
                    // runs on first connect too, where the snapshot is empty.
                    let qos = qos_from_u8(config.qos);
                    for topic in handlers.load().keys().cloned().collect::<Vec<_>>() {
                        let subscribe = client.subscribe(&topic, qos);
                        match tokio::time::timeout(config.write_timeout, subscribe).await {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => warn!(topic, error = %err, "re-subscribe failed"),
                            Err(_) => warn!(topic, "re-subscribe timed out after reconnect"),
                        }
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let map = handlers.load();
                    if let Some(handler) = map.get(publish.topic.as_str()) {
                        handler(&publish.topic, &publish.payload);
                    } else {
                        debug!(topic = %publish.topic, "no handler registered for topic");
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    is_connected.store(false, std::sync::atomic::Ordering::Release);
                    warn!("bus event loop: broker sent disconnect");
                }
                Ok(_) => {}
                Err(err) => {
                    is_connected.store(false, std::sync::atomic::Ordering::Release);
                    warn!(error = %err, backoff_ms = backoff.as_millis() as u64, "bus event loop error, reconnect pending");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(config.max_reconnect_delay);
                }
            }
        }
    });
}

fn qos_from_u8(qos: u8) -> QoS {
    match qos {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

fn split_host_port(broker: &str) -> Result<(String, u16)> {
    let stripped = broker
        .trim_start_matches("mqtt://")
        .trim_start_matches("tcp://");
    let (host, port) = stripped
        .rsplit_once(':')
        .ok_or_else(|| BridgeError::ConfigInvalid(format!("invalid broker address: {broker}")))?;
    let port: u16 = port
        .parse()
        .map_err(|_| BridgeError::ConfigInvalid(format!("invalid broker port: {broker}")))?;
    Ok((host.to_string(), port))
}

/// if prefixing is enabled and an identity prefix is available: "<prefix>/<topic>"
/// with any leading "/" on the base stripped. Otherwise a configured
/// custom-prefix applies only when identity-prefix is disabled. Otherwise the
/// base is used verbatim.
fn prefix_topic(topic: &str, config: &BusClientConfig, identity_prefix: Option<&str>) -> String {
    let base = topic.strip_prefix('/').unwrap_or(topic);

    if config.use_identity_prefix {
        match identity_prefix {
            Some(prefix) => return format!("{prefix}/{base}"),
            None => return base.to_string(),
        }
    }

    match &config.custom_prefix {
        Some(prefix) => format!("{prefix}/{base}"),
        None => base.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> BusClientConfig {
        BusClientConfig {
            brokers: "mqtt://127.0.0.1:1883".into(),
            client_id: "bridge-test".into(),
            qos: 1,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(30),
            clean_session: true,
            write_timeout: Duration::from_secs(5),
            message_channel_depth: 100,
            max_inflight: 20,
            publish_topic: "entries/out".into(),
            ack_topic: "entries/ack".into(),
            use_identity_prefix: true,
            custom_prefix: None,
        }
    }

    #[test]
    fn test_split_host_port() {
        let (host, port) = split_host_port("mqtt://broker.local:1883").unwrap();
        assert_eq!(host, "broker.local");
        assert_eq!(port, 1883);
    }

    #[test]
    fn test_split_host_port_rejects_missing_port() {
        assert!(split_host_port("mqtt://broker.local").is_err());
    }

    #[test]
    fn test_prefix_topic_uses_identity_prefix_when_available() {
        let cfg = config();
        assert_eq!(
            prefix_topic("entries/out", &cfg, Some("device-42")),
            "device-42/entries/out"
        );
    }

    #[test]
    fn test_prefix_topic_strips_leading_slash_on_base() {
        let cfg = config();
        assert_eq!(
            prefix_topic("/entries/out", &cfg, Some("device-42")),
            "device-42/entries/out"
        );
    }

    #[test]
    fn test_prefix_topic_falls_back_to_verbatim_when_identity_enabled_but_absent() {
        let cfg = config();
        assert_eq!(prefix_topic("entries/out", &cfg, None), "entries/out");
    }

    #[test]
    fn test_prefix_topic_custom_prefix_only_applies_when_identity_disabled() {
        let mut cfg = config();
        cfg.use_identity_prefix = false;
        cfg.custom_prefix = Some("custom".into());
        assert_eq!(prefix_topic("entries/out", &cfg, Some("device-42")), "custom/entries/out");
    }

    #[test]
    fn test_prefix_topic_custom_prefix_ignored_when_identity_enabled() {
        let mut cfg = config();
        cfg.use_identity_prefix = true;
        cfg.custom_prefix = Some("custom".into());
        assert_eq!(
            prefix_topic("entries/out", &cfg, Some("device-42")),
            "device-42/entries/out"
        );
    }

    #[test]
    fn test_prefix_topic_disabled_passes_through() {
        let mut cfg = config();
        cfg.use_identity_prefix = false;
        assert_eq!(prefix_topic("entries/out", &cfg, None), "entries/out");
    }

    #[test]
    fn test_qos_mapping() {
        assert_eq!(qos_from_u8(0), QoS::AtMostOnce);
        assert_eq!(qos_from_u8(1), QoS::AtLeastOnce);
        assert_eq!(qos_from_u8(2), QoS::ExactlyOnce);
    }
}
