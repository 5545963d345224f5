//! Configuration loading for the stream bridge.
//!
//! Precedence is defaults < environment < explicit overrides passed to the
//! `with_*` builder methods (used by tests and by callers embedding the
//! bridge). `BridgeConfig::from_env` loads a `.env` file if present (via
//! `dotenvy`) and then reads environment variables, falling back to the
//! defaults documented on each field.

use anyhow::{Context, Result, bail};
use std::env;
use std::time::Duration;

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_opt_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Drop policy applied by the queue when it is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropPolicy {
    Oldest,
    Newest,
    None,
}

impl std::str::FromStr for DropPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "oldest" => Ok(DropPolicy::Oldest),
            "newest" => Ok(DropPolicy::Newest),
            "none" => Ok(DropPolicy::None),
            other => bail!("invalid dropPolicy '{other}', expected oldest|newest|none"),
        }
    }
}

/// Pipeline tuning: buffer sizing, backpressure, worker count, shutdown.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Rounded up to the next power of two at load time.
    pub buffer_size: usize,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub processing_timeout: Duration,
    /// Fraction in (0, 1].
    pub backpressure_threshold: f64,
    pub drop_policy: DropPolicy,
    pub flush_interval: Duration,
    pub backpressure_poll_interval: Duration,
    pub idle_poll_sleep: Duration,
    pub publish_workers: usize,
    pub shutdown_timeout: Duration,
    pub ack_timeout: Duration,
    pub error_backoff: Duration,
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        let requested_buffer: usize = env_parse("PIPELINE_BUFFER_SIZE", 1024);
        let buffer_size = requested_buffer.max(1).next_power_of_two();

        let publish_workers: usize = env_parse("PIPELINE_PUBLISH_WORKERS", 4);
        if publish_workers == 0 {
            bail!("PIPELINE_PUBLISH_WORKERS must be >= 1");
        }

        let backpressure_threshold: f64 = env_parse("PIPELINE_BACKPRESSURE_THRESHOLD", 0.8);
        if !(0.0..=1.0).contains(&backpressure_threshold) || backpressure_threshold <= 0.0 {
            bail!("PIPELINE_BACKPRESSURE_THRESHOLD must be in (0, 1]");
        }

        let drop_policy: DropPolicy = env::var("PIPELINE_DROP_POLICY")
            .ok()
            .map(|s| s.parse())
            .transpose()?
            .unwrap_or(DropPolicy::Oldest);

        Ok(Self {
            buffer_size,
            batch_size: env_parse("PIPELINE_BATCH_SIZE", 64),
            batch_timeout: Duration::from_millis(env_parse("PIPELINE_BATCH_TIMEOUT_MS", 200)),
            processing_timeout: Duration::from_millis(env_parse(
                "PIPELINE_PROCESSING_TIMEOUT_MS",
                5_000,
            )),
            backpressure_threshold,
            drop_policy,
            flush_interval: Duration::from_millis(env_parse("PIPELINE_FLUSH_INTERVAL_MS", 500)),
            backpressure_poll_interval: Duration::from_millis(env_parse(
                "PIPELINE_BACKPRESSURE_POLL_INTERVAL_MS",
                250,
            )),
            idle_poll_sleep: Duration::from_millis(env_parse("PIPELINE_IDLE_POLL_SLEEP_MS", 50)),
            publish_workers,
            shutdown_timeout: Duration::from_millis(env_parse(
                "PIPELINE_SHUTDOWN_TIMEOUT_MS",
                10_000,
            )),
            ack_timeout: Duration::from_millis(env_parse("PIPELINE_ACK_TIMEOUT_MS", 5_000)),
            error_backoff: Duration::from_millis(env_parse("PIPELINE_ERROR_BACKOFF_MS", 1_000)),
        })
    }
}

/// Stream client connection and consumer-group tuning.
#[derive(Debug, Clone)]
pub struct StreamClientConfig {
    pub addresses: Vec<String>,
    /// Empty ⇒ multi-stream discovery mode.
    pub stream_name: String,
    /// Global group name override; when unset, `group-<stream>` is used per stream.
    pub consumer_group: Option<String>,
    pub consumer_name: String,
    pub batch_size: i64,
    pub block_timeout: Duration,
    pub claim_min_idle: Duration,
    pub claim_batch_size: i64,
    pub claim_interval: Duration,
    pub aggressive_claim: bool,
    pub claim_cycle_delay: Duration,
    pub drain_enabled: bool,
    pub drain_interval: Duration,
    pub drain_batch_size: i64,
    pub consumer_cleanup_enabled: bool,
    pub consumer_idle_timeout: Duration,
    pub consumer_cleanup_interval: Duration,
    /// Defaults to `consumer_cleanup_interval` when not set explicitly.
    pub refresh_interval: Duration,
    pub max_retries: u32,
    pub retry_interval: Duration,
    pub connect_timeout: Duration,
}

impl StreamClientConfig {
    pub fn from_env() -> Result<Self> {
        let addresses: Vec<String> = env::var("STREAM_ADDRESSES")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
        if addresses.is_empty() {
            bail!("STREAM_ADDRESSES must name at least one address");
        }

        let consumer_name = env::var("STREAM_CONSUMER_NAME").unwrap_or_else(|_| {
            format!(
                "consumer-{}",
                uuid::Uuid::new_v4().simple().to_string().split_at(8).0
            )
        });

        let consumer_cleanup_interval =
            Duration::from_millis(env_parse("STREAM_CONSUMER_CLEANUP_INTERVAL_MS", 30_000));
        let refresh_interval = env::var("STREAM_REFRESH_INTERVAL_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(consumer_cleanup_interval);

        Ok(Self {
            addresses,
            stream_name: env::var("STREAM_NAME").unwrap_or_default(),
            consumer_group: env_opt_string("STREAM_CONSUMER_GROUP"),
            consumer_name,
            batch_size: env_parse("STREAM_BATCH_SIZE", 64),
            block_timeout: Duration::from_millis(env_parse("STREAM_BLOCK_TIMEOUT_MS", 2_000)),
            claim_min_idle: Duration::from_millis(env_parse("STREAM_CLAIM_MIN_IDLE_MS", 30_000)),
            claim_batch_size: env_parse("STREAM_CLAIM_BATCH_SIZE", 100),
            claim_interval: Duration::from_millis(env_parse("STREAM_CLAIM_INTERVAL_MS", 15_000)),
            aggressive_claim: env_parse("STREAM_AGGRESSIVE_CLAIM", false),
            claim_cycle_delay: Duration::from_millis(env_parse(
                "STREAM_CLAIM_CYCLE_DELAY_MS",
                100,
            )),
            drain_enabled: env_parse("STREAM_DRAIN_ENABLED", false),
            drain_interval: Duration::from_millis(env_parse("STREAM_DRAIN_INTERVAL_MS", 60_000)),
            drain_batch_size: env_parse("STREAM_DRAIN_BATCH_SIZE", 100),
            consumer_cleanup_enabled: env_parse("STREAM_CONSUMER_CLEANUP_ENABLED", true),
            consumer_idle_timeout: Duration::from_millis(env_parse(
                "STREAM_CONSUMER_IDLE_TIMEOUT_MS",
                300_000,
            )),
            consumer_cleanup_interval,
            refresh_interval,
            max_retries: env_parse("STREAM_MAX_RETRIES", 3),
            retry_interval: Duration::from_millis(env_parse("STREAM_RETRY_INTERVAL_MS", 500)),
            connect_timeout: Duration::from_millis(env_parse(
                "STREAM_CONNECT_TIMEOUT_MS",
                5_000,
            )),
        })
    }

    /// The effective consumer-group name for `stream`: an explicit global
    /// group wins when configured; otherwise falls back to `group-<stream>`.
    pub fn effective_group_for(&self, stream: &str) -> String {
        self.consumer_group
            .clone()
            .unwrap_or_else(|| format!("group-{stream}"))
    }
}

/// Bus client connection, QoS, and topic tuning.
#[derive(Debug, Clone)]
pub struct BusClientConfig {
    pub brokers: String,
    pub client_id: String,
    pub qos: u8,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    pub max_reconnect_delay: Duration,
    pub clean_session: bool,
    pub write_timeout: Duration,
    pub message_channel_depth: usize,
    pub max_inflight: u16,
    pub publish_topic: String,
    pub ack_topic: String,
    pub use_identity_prefix: bool,
    pub custom_prefix: Option<String>,
}

impl BusClientConfig {
    pub fn from_env() -> Result<Self> {
        let qos: u8 = env_parse("BUS_QOS", 1);
        if qos > 2 {
            bail!("BUS_QOS must be 0, 1, or 2");
        }

        Ok(Self {
            brokers: env::var("BUS_BROKERS")
                .context("BUS_BROKERS must be set (e.g. mqtt://127.0.0.1:1883)")?,
            client_id: env::var("BUS_CLIENT_ID")
                .unwrap_or_else(|_| format!("bridge-{}", uuid::Uuid::new_v4())),
            qos,
            keep_alive: Duration::from_secs(env_parse("BUS_KEEP_ALIVE_SECS", 30)),
            connect_timeout: Duration::from_millis(env_parse("BUS_CONNECT_TIMEOUT_MS", 5_000)),
            max_reconnect_delay: Duration::from_millis(env_parse(
                "BUS_MAX_RECONNECT_DELAY_MS",
                30_000,
            )),
            clean_session: env_parse("BUS_CLEAN_SESSION", true),
            write_timeout: Duration::from_millis(env_parse("BUS_WRITE_TIMEOUT_MS", 5_000)),
            message_channel_depth: env_parse("BUS_MESSAGE_CHANNEL_DEPTH", 256),
            max_inflight: env_parse("BUS_MAX_INFLIGHT", 100),
            publish_topic: env::var("BUS_PUBLISH_TOPIC").unwrap_or_else(|_| "bridge/out".into()),
            ack_topic: env::var("BUS_ACK_TOPIC").unwrap_or_else(|_| "bridge/ack".into()),
            use_identity_prefix: env_parse("BUS_USE_IDENTITY_PREFIX", false),
            custom_prefix: env_opt_string("BUS_CUSTOM_PREFIX"),
        })
    }

    /// Derive the connect-poll tick: connectTimeout/20, clamped to [50ms, 500ms].
    pub fn connect_poll_tick(&self) -> Duration {
        let derived = self.connect_timeout / 20;
        derived.clamp(Duration::from_millis(50), Duration::from_millis(500))
    }
}

/// Circuit breaker sliding-window and admission-control tuning.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Percent, (0, 100].
    pub error_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
    pub max_concurrent_calls: u32,
    pub request_volume_threshold: u32,
    pub window_buckets: u32,
    pub window_duration: Duration,
}

impl CircuitBreakerConfig {
    pub fn from_env() -> Result<Self> {
        let error_threshold: u32 = env_parse("BREAKER_ERROR_THRESHOLD", 50);
        if error_threshold == 0 || error_threshold > 100 {
            bail!("BREAKER_ERROR_THRESHOLD must be in (0, 100]");
        }

        let success_threshold: u32 = env_parse("BREAKER_SUCCESS_THRESHOLD", 3);
        if success_threshold == 0 {
            bail!("BREAKER_SUCCESS_THRESHOLD must be >= 1");
        }

        let max_concurrent_calls: u32 = env_parse("BREAKER_MAX_CONCURRENT_CALLS", 64);
        if max_concurrent_calls == 0 {
            bail!("BREAKER_MAX_CONCURRENT_CALLS must be >= 1");
        }

        let request_volume_threshold: u32 = env_parse("BREAKER_REQUEST_VOLUME_THRESHOLD", 10);
        if request_volume_threshold == 0 {
            bail!("BREAKER_REQUEST_VOLUME_THRESHOLD must be >= 1");
        }

        Ok(Self {
            error_threshold,
            success_threshold,
            timeout: Duration::from_millis(env_parse("BREAKER_TIMEOUT_MS", 30_000)),
            max_concurrent_calls,
            request_volume_threshold,
            window_buckets: env_parse("BREAKER_WINDOW_BUCKETS", 10),
            window_duration: Duration::from_millis(env_parse("BREAKER_WINDOW_DURATION_MS", 10_000)),
        })
    }
}

/// Top-level configuration composed of the four tuning sections above.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub pipeline: PipelineConfig,
    pub stream: StreamClientConfig,
    pub bus: BusClientConfig,
    pub breaker: CircuitBreakerConfig,
}

impl BridgeConfig {
    /// Load `.env` (if present) then read environment variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            pipeline: PipelineConfig::from_env().context("invalid pipeline configuration")?,
            stream: StreamClientConfig::from_env().context("invalid stream client configuration")?,
            bus: BusClientConfig::from_env().context("invalid bus client configuration")?,
            breaker: CircuitBreakerConfig::from_env()
                .context("invalid circuit breaker configuration")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variable tests must not run concurrently with each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_buffer_size_rounds_to_power_of_two() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            env::set_var("PIPELINE_BUFFER_SIZE", "100");
        }
        let cfg = PipelineConfig::from_env().unwrap();
        assert_eq!(cfg.buffer_size, 128);
        unsafe {
            env::remove_var("PIPELINE_BUFFER_SIZE");
        }
    }

    #[test]
    fn test_buffer_size_of_one_rounds_to_one() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            env::set_var("PIPELINE_BUFFER_SIZE", "1");
        }
        let cfg = PipelineConfig::from_env().unwrap();
        assert_eq!(cfg.buffer_size, 1);
        unsafe {
            env::remove_var("PIPELINE_BUFFER_SIZE");
        }
    }

    #[test]
    fn test_zero_publish_workers_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            env::set_var("PIPELINE_PUBLISH_WORKERS", "0");
        }
        let result = PipelineConfig::from_env();
        assert!(result.is_err());
        unsafe {
            env::remove_var("PIPELINE_PUBLISH_WORKERS");
        }
    }

    #[test]
    fn test_invalid_drop_policy_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        unsafe {
            env::set_var("PIPELINE_DROP_POLICY", "bogus");
        }
        let result = PipelineConfig::from_env();
        assert!(result.is_err());
        unsafe {
            env::remove_var("PIPELINE_DROP_POLICY");
        }
    }

    #[test]
    fn test_effective_group_for_falls_back_to_per_stream() {
        let cfg = StreamClientConfig {
            addresses: vec!["redis://127.0.0.1:6379".into()],
            stream_name: String::new(),
            consumer_group: None,
            consumer_name: "c1".into(),
            batch_size: 10,
            block_timeout: Duration::from_millis(1),
            claim_min_idle: Duration::from_millis(1),
            claim_batch_size: 1,
            claim_interval: Duration::from_millis(1),
            aggressive_claim: false,
            claim_cycle_delay: Duration::from_millis(1),
            drain_enabled: false,
            drain_interval: Duration::from_millis(1),
            drain_batch_size: 1,
            consumer_cleanup_enabled: false,
            consumer_idle_timeout: Duration::from_millis(1),
            consumer_cleanup_interval: Duration::from_millis(1),
            refresh_interval: Duration::from_millis(1),
            max_retries: 1,
            retry_interval: Duration::from_millis(1),
            connect_timeout: Duration::from_millis(1),
        };
        assert_eq!(cfg.effective_group_for("orders"), "group-orders");
    }

    #[test]
    fn test_effective_group_for_honors_global_override() {
        let mut cfg_addresses = vec!["redis://127.0.0.1:6379".into()];
        let cfg = StreamClientConfig {
            addresses: std::mem::take(&mut cfg_addresses),
            stream_name: String::new(),
            consumer_group: Some("shared-group".into()),
            consumer_name: "c1".into(),
            batch_size: 10,
            block_timeout: Duration::from_millis(1),
            claim_min_idle: Duration::from_millis(1),
            claim_batch_size: 1,
            claim_interval: Duration::from_millis(1),
            aggressive_claim: false,
            claim_cycle_delay: Duration::from_millis(1),
            drain_enabled: false,
            drain_interval: Duration::from_millis(1),
            drain_batch_size: 1,
            consumer_cleanup_enabled: false,
            consumer_idle_timeout: Duration::from_millis(1),
            consumer_cleanup_interval: Duration::from_millis(1),
            refresh_interval: Duration::from_millis(1),
            max_retries: 1,
            retry_interval: Duration::from_millis(1),
            connect_timeout: Duration::from_millis(1),
        };
        assert_eq!(cfg.effective_group_for("orders"), "shared-group");
    }

    #[test]
    fn test_connect_poll_tick_clamped() {
        let cfg = BusClientConfig {
            brokers: "mqtt://localhost:1883".into(),
            client_id: "c".into(),
            qos: 1,
            keep_alive: Duration::from_secs(30),
            connect_timeout: Duration::from_millis(1),
            max_reconnect_delay: Duration::from_secs(1),
            clean_session: true,
            write_timeout: Duration::from_millis(1),
            message_channel_depth: 1,
            max_inflight: 1,
            publish_topic: "t/out".into(),
            ack_topic: "t/ack".into(),
            use_identity_prefix: false,
            custom_prefix: None,
        };
        assert_eq!(cfg.connect_poll_tick(), Duration::from_millis(50));
    }
}
