//! Consumer-group client over the upstream stream log.
//!
//! Reads are grouped by `effective_group_for(stream)` before issuing the
//! blocking read: a single read call can only name one consumer group for
//! all the streams it lists, so streams that resolve to different groups
//! (mixing a global override with the per-stream default, say) go out as
//! separate calls within the same poll cycle.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use bridge_config::StreamClientConfig;
use bridge_domain::{ConsumerDescriptor, PendingRef, StreamEntry};
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use tracing::{debug, info, warn};

use crate::error::{BridgeError, Result};

pub struct StreamClient {
    config: StreamClientConfig,
    conn: ConnectionManager,
    streams: Vec<String>,
    drain_cursors: HashMap<String, String>,
}

impl StreamClient {
    pub async fn connect(config: StreamClientConfig) -> Result<Self> {
        let addr = config
            .addresses
            .first()
            .cloned()
            .ok_or_else(|| BridgeError::ConfigInvalid("no stream addresses configured".into()))?;

        let client = redis::Client::open(addr.as_str()).map_err(|e| BridgeError::ConnectError {
            target: addr.clone(),
            source: anyhow::Error::new(e),
        })?;

        let conn = tokio::time::timeout(config.connect_timeout, client.get_connection_manager())
            .await
            .map_err(|_| BridgeError::ConnectError {
                target: addr.clone(),
                source: anyhow::anyhow!("connect timed out"),
            })?
            .map_err(|e| BridgeError::ConnectError {
                target: addr,
                source: anyhow::Error::new(e),
            })?;

        let mut client = Self {
            config,
            conn,
            streams: Vec::new(),
            drain_cursors: HashMap::new(),
        };

        if client.config.stream_name.is_empty() {
            client.streams = client.discover().await?;
        } else {
            client.streams = vec![client.config.stream_name.clone()];
        }

        Ok(client)
    }

    pub fn streams(&self) -> &[String] {
        &self.streams
    }

    /// Drops the connection manager's underlying connection. `ConnectionManager`
    /// has no explicit close call of its own; this exists so the orchestrator's
    /// shutdown sequence has a named step for it, matching the stream client's
    /// place in the shutdown order.
    pub async fn close(self) {
        drop(self);
    }

    /// Whether this client is configured for multi-stream discovery
    /// (empty `STREAM_NAME`) rather than a single fixed stream.
    pub fn discovery_mode(&self) -> bool {
        self.config.stream_name.is_empty()
    }

    /// Scans the keyspace for stream-typed keys. In single-stream mode this
    /// is never called from `refresh_streams`; `connect` calls it once to
    /// seed the initial stream list when discovery mode is on.
    async fn discover(&mut self) -> Result<Vec<String>> {
        let mut cursor = 0u64;
        let mut found = Vec::new();
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut self.conn)
                .await
                .map_err(BridgeError::from)?;

            for key in keys {
                let key_type: String = redis::cmd("TYPE")
                    .arg(&key)
                    .query_async(&mut self.conn)
                    .await
                    .unwrap_or_default();
                if key_type == "stream" {
                    found.push(key);
                }
            }

            cursor = next_cursor;
            if cursor == 0 {
                break;
            }
        }
        Ok(found)
    }

    /// Idempotently creates each configured stream's consumer group,
    /// swallowing the "group already exists" error.
    pub async fn ensure_groups(&mut self) -> Result<()> {
        for stream in self.streams.clone() {
            let group = self.config.effective_group_for(&stream);
            let result: redis::RedisResult<()> = self
                .conn
                .xgroup_create_mkstream(&stream, &group, "0")
                .await;
            if let Err(err) = result {
                if !is_busygroup(&err) {
                    return Err(BridgeError::from(err));
                }
            }
        }
        Ok(())
    }

    /// Re-discovers the stream set and ensures groups for anything newly
    /// observed. No-op in single-stream mode (idempotent: calling this with
    /// an unchanged stream set returns an empty vec every time).
    pub async fn refresh_streams(&mut self) -> Result<Vec<String>> {
        if !self.discovery_mode() {
            return Ok(Vec::new());
        }

        let current = self.discover().await?;
        let discovered: Vec<String> = current
            .into_iter()
            .filter(|s| !self.streams.contains(s))
            .collect();

        for stream in &discovered {
            self.streams.push(stream.clone());
            let group = self.config.effective_group_for(stream);
            let _: redis::RedisResult<()> = self
                .conn
                .xgroup_create_mkstream(stream, &group, "0")
                .await;
        }

        if !discovered.is_empty() {
            info!(count = discovered.len(), "discovered new streams");
        }

        Ok(discovered)
    }

    /// Reads up to `batch_size` new entries per stream, blocking up to
    /// `block_timeout`. Streams are partitioned by effective group since a
    /// single call can only target one group. `batch_size_override` lets the
    /// backpressure signal shrink the read size without mutating config.
    pub async fn read_batch(&mut self, batch_size_override: Option<i64>) -> Result<Vec<StreamEntry>> {
        let batch_size = batch_size_override.unwrap_or(self.config.batch_size).max(1);

        let mut by_group: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for stream in &self.streams {
            by_group
                .entry(self.config.effective_group_for(stream))
                .or_default()
                .push(stream.clone());
        }

        let mut entries = Vec::new();
        for (group, streams) in by_group {
            let opts = StreamReadOptions::default()
                .group(group.clone(), &self.config.consumer_name)
                .count(batch_size as usize)
                .block(self.config.block_timeout.as_millis() as usize);
            let ids = vec![">"; streams.len()];

            let mut attempt = 0u32;
            let reply: StreamReadReply = loop {
                let mut reply_result: redis::RedisResult<StreamReadReply> =
                    self.conn.xread_options(&streams, &ids, &opts).await;

                // A dropped/expired group surfaces as NOGROUP; recreate it
                // opportunistically and retry exactly once before surfacing.
                if let Err(err) = &reply_result {
                    if is_nogroup(err) {
                        warn!(group, "NOGROUP on read, recreating group and retrying once");
                        for stream in &streams {
                            let _: redis::RedisResult<()> =
                                self.conn.xgroup_create_mkstream(stream, &group, "0").await;
                        }
                        reply_result = self.conn.xread_options(&streams, &ids, &opts).await;
                    }
                }

                match reply_result {
                    Ok(reply) => break reply,
                    Err(err) if is_transient(&err) && attempt < self.config.max_retries => {
                        attempt += 1;
                        warn!(
                            group,
                            attempt,
                            max_retries = self.config.max_retries,
                            error = %err,
                            "transient read failure, retrying"
                        );
                        tokio::time::sleep(self.config.retry_interval).await;
                    }
                    Err(err) => {
                        return Err(BridgeError::FetchError {
                            streams: streams.clone(),
                            source: anyhow::Error::new(err),
                        });
                    }
                }
            };

            for stream_key in reply.keys {
                for id_entry in stream_key.ids {
                    let mut fields = BTreeMap::new();
                    for (field, value) in id_entry.map {
                        if let redis::Value::BulkString(bytes) = value {
                            fields.insert(field, String::from_utf8_lossy(&bytes).into_owned());
                        }
                    }
                    entries.push(StreamEntry {
                        id: id_entry.id,
                        stream: stream_key.key.clone(),
                        fields,
                    });
                }
            }
        }

        Ok(entries)
    }

    /// Claims entries idle longer than `claim_min_idle` away from dead or
    /// stalled consumers, via `XAUTOCLAIM`. A failure on one stream is
    /// logged and skipped rather than aborting the whole cycle, so one bad
    /// stream never starves idle-claim on the rest.
    pub async fn claim_idle(&mut self) -> Result<Vec<StreamEntry>> {
        let mut claimed = Vec::new();
        for stream in self.streams.clone() {
            let group = self.config.effective_group_for(&stream);
            let mut start = "0-0".to_string();
            loop {
                let result: redis::RedisResult<redis::streams::StreamAutoClaimReply> =
                    redis::cmd("XAUTOCLAIM")
                        .arg(&stream)
                        .arg(&group)
                        .arg(&self.config.consumer_name)
                        .arg(self.config.claim_min_idle.as_millis() as usize)
                        .arg(&start)
                        .arg("COUNT")
                        .arg(self.config.claim_batch_size)
                        .query_async(&mut self.conn)
                        .await;

                let reply = match result {
                    Ok(reply) => reply,
                    Err(err) => {
                        warn!(stream, error = %err, "idle-claim failed, skipping stream for this cycle");
                        break;
                    }
                };

                for id_entry in &reply.claimed {
                    let mut fields = BTreeMap::new();
                    for (field, value) in &id_entry.map {
                        if let redis::Value::BulkString(bytes) = value {
                            fields.insert(field.clone(), String::from_utf8_lossy(bytes).into_owned());
                        }
                    }
                    claimed.push(StreamEntry {
                        id: id_entry.id.clone(),
                        stream: stream.clone(),
                        fields,
                    });
                }

                if reply.next_stream_id == "0-0" || !self.config.aggressive_claim {
                    break;
                }
                start = reply.next_stream_id;
            }
        }
        Ok(claimed)
    }

    /// Reads entries written to the raw log before the consumer group
    /// existed (or otherwise never delivered to it), via `XRANGE` starting
    /// just past each stream's last-seen id. Off unless `drain_enabled`.
    pub async fn drain(&mut self) -> Result<Vec<StreamEntry>> {
        if !self.config.drain_enabled {
            return Ok(Vec::new());
        }

        let mut drained = Vec::new();
        for stream in self.streams.clone() {
            let start = self
                .drain_cursors
                .get(&stream)
                .cloned()
                .map(|id| format!("({id}"))
                .unwrap_or_else(|| "-".to_string());

            let reply: Vec<(String, HashMap<String, redis::Value>)> = redis::cmd("XRANGE")
                .arg(&stream)
                .arg(&start)
                .arg("+")
                .arg("COUNT")
                .arg(self.config.drain_batch_size)
                .query_async(&mut self.conn)
                .await
                .map_err(|e| BridgeError::FetchError {
                    streams: vec![stream.clone()],
                    source: anyhow::Error::new(e),
                })?;

            for (id, raw_fields) in reply {
                let mut fields = BTreeMap::new();
                for (field, value) in raw_fields {
                    if let redis::Value::BulkString(bytes) = value {
                        fields.insert(field, String::from_utf8_lossy(&bytes).into_owned());
                    }
                }
                self.drain_cursors.insert(stream.clone(), id.clone());
                drained.push(StreamEntry {
                    id,
                    stream: stream.clone(),
                    fields,
                });
            }
        }
        Ok(drained)
    }

    /// Acks then deletes each id, in order, swallowing "no such id" errors
    /// (the entry may already have been trimmed or claimed elsewhere).
    pub async fn ack_and_delete(&mut self, stream: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let group = self.config.effective_group_for(stream);

        let ack_result: redis::RedisResult<i64> = self.conn.xack(stream, &group, ids).await;
        if let Err(err) = ack_result {
            return Err(BridgeError::AckError {
                stream: stream.to_string(),
                id: ids.join(","),
                source: anyhow::Error::new(err),
            });
        }

        let del_result: redis::RedisResult<i64> = self.conn.xdel(stream, ids).await;
        if let Err(err) = del_result {
            warn!(stream, error = %err, "xdel failed after ack, entries remain in the log");
        }

        Ok(())
    }

    /// Lists the group's pending entries, for observability and for locating
    /// idle-but-not-yet-claimable work.
    pub async fn pending(&mut self, stream: &str) -> Result<Vec<PendingRef>> {
        let group = self.config.effective_group_for(stream);
        let reply: redis::streams::StreamPendingCountReply = self
            .conn
            .xpending_count(stream, &group, "-", "+", 1000)
            .await
            .map_err(BridgeError::from)?;

        Ok(reply
            .ids
            .into_iter()
            .map(|id| PendingRef {
                id: id.id,
                owning_consumer: id.consumer,
                idle: Duration::from_millis(id.last_delivered_ms as u64),
            })
            .collect())
    }

    /// Lists consumers registered on the group, never including the caller
    /// itself in the returned set's eligible-for-removal semantics (the
    /// caller decides that; this just reports idle).
    pub async fn consumers(&mut self, stream: &str) -> Result<Vec<ConsumerDescriptor>> {
        let group = self.config.effective_group_for(stream);
        let infos: redis::streams::StreamInfoConsumersReply = self
            .conn
            .xinfo_consumers(stream, &group)
            .await
            .map_err(BridgeError::from)?;

        Ok(infos
            .consumers
            .into_iter()
            .map(|c| ConsumerDescriptor {
                name: c.name,
                pending_count: c.pending as i64,
                idle: Duration::from_millis(c.idle as u64),
            })
            .collect())
    }

    /// Removes consumers idle past `consumer_idle_timeout` with no pending
    /// entries, other than this process's own consumer.
    pub async fn cleanup_dead_consumers(&mut self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        for stream in self.streams.clone() {
            let group = self.config.effective_group_for(&stream);
            let consumers = self.consumers(&stream).await?;
            for consumer in consumers {
                if consumer.name == self.config.consumer_name {
                    continue;
                }
                if consumer.pending_count == 0
                    && consumer.idle >= self.config.consumer_idle_timeout
                {
                    let _: redis::RedisResult<()> = self
                        .conn
                        .xgroup_delconsumer(&stream, &group, &consumer.name)
                        .await;
                    debug!(stream, consumer = consumer.name, "removed dead consumer");
                    removed.push(consumer.name);
                }
            }
        }
        Ok(removed)
    }
}

fn is_busygroup(err: &redis::RedisError) -> bool {
    err.to_string().contains("BUSYGROUP")
}

fn is_nogroup(err: &redis::RedisError) -> bool {
    err.to_string().contains("NOGROUP")
}

/// Timeouts, `LOADING` (server still loading its RDB/AOF), and dropped
/// connections are worth a bounded retry; anything else (auth failures,
/// malformed commands, NOGROUP/BUSYGROUP, which are handled separately)
/// is not.
fn is_transient(err: &redis::RedisError) -> bool {
    err.is_timeout() || err.is_io_error() || err.to_string().contains("LOADING")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> StreamClientConfig {
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
    fn test_effective_group_partitioning_is_pure() {
        let cfg = config();
        assert_eq!(cfg.effective_group_for("orders"), "group-orders");
    }

    #[test]
    fn test_is_busygroup_matches_redis_error_text() {
        let err = redis::RedisError::from((redis::ErrorKind::ExtensionError, "BUSYGROUP exists"));
        assert!(is_busygroup(&err));
    }

    #[test]
    fn test_is_busygroup_false_for_other_errors() {
        let err = redis::RedisError::from((redis::ErrorKind::ExtensionError, "NOGROUP"));
        assert!(!is_busygroup(&err));
    }

    #[test]
    fn test_is_nogroup_matches_redis_error_text() {
        let err = redis::RedisError::from((
            redis::ErrorKind::ExtensionError,
            "NOGROUP No such key or consumer group",
        ));
        assert!(is_nogroup(&err));
    }

    #[test]
    fn test_is_nogroup_false_for_other_errors() {
        let err = redis::RedisError::from((redis::ErrorKind::ExtensionError, "BUSYGROUP exists"));
        assert!(!is_nogroup(&err));
    }

    #[test]
    fn test_is_transient_matches_loading() {
        let err = redis::RedisError::from((redis::ErrorKind::TryAgain, "LOADING Redis is loading"));
        assert!(is_transient(&err));
    }

    #[test]
    fn test_is_transient_false_for_nogroup() {
        let err = redis::RedisError::from((redis::ErrorKind::ExtensionError, "NOGROUP"));
        assert!(!is_transient(&err));
    }

    #[test]
    fn test_discovery_mode_reflects_empty_stream_name() {
        let mut cfg = config();
        cfg.stream_name = String::new();
        assert!(cfg.stream_name.is_empty());
        let mut cfg2 = config();
        cfg2.stream_name = "orders".into();
        assert!(!cfg2.stream_name.is_empty());
    }
}
