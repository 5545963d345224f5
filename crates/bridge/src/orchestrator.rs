//! Supervises the bridge's concurrent loops: fetch, idle-claim, dead-consumer
//! cleanup, stream-discovery refresh, optional drain, a pool of publish
//! workers, and the ack dispatcher that turns inbound bus messages into
//! finalized acks.
//!
//! Shutdown is a `tokio::sync::broadcast` signal every loop selects against;
//! `run` waits up to `shutdown_timeout` for everything to unwind before
//! returning, mirroring the bounded drain used for webhook delivery workers.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bridge_config::BridgeConfig;
use tokio::sync::{Mutex, broadcast};
use tracing::{error, info, warn};

use crate::ack_finalizer::AckFinalizer;
use crate::bus_client::BusClient;
use crate::circuit_breaker::{BreakerState, CircuitBreaker};
use crate::envelope::build_envelope;
use crate::health::ServiceState;
use crate::metrics;
use crate::queue::{EnqueueOutcome, Queue};
use crate::stream_client::StreamClient;

pub struct Orchestrator {
    config: BridgeConfig,
    stream_client: Arc<Mutex<StreamClient>>,
    bus_client: Arc<BusClient>,
    breaker: Arc<CircuitBreaker>,
    queue: Arc<Queue>,
    state: ServiceState,
    shutdown_tx: broadcast::Sender<()>,
}

impl Orchestrator {
    pub fn new(
        config: BridgeConfig,
        stream_client: StreamClient,
        bus_client: BusClient,
        state: ServiceState,
    ) -> Self {
        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let queue = Arc::new(Queue::new(
            config.pipeline.buffer_size,
            config.pipeline.drop_policy,
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            stream_client: Arc::new(Mutex::new(stream_client)),
            bus_client: Arc::new(bus_client),
            breaker,
            queue,
            state,
            shutdown_tx,
        }
    }

    pub fn shutdown_handle(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Runs every loop to completion (i.e. until shutdown), returning once
    /// the drain window has elapsed.
    pub async fn run(self) -> anyhow::Result<()> {
        let ack_finalizer = Arc::new(AckFinalizer::new(
            self.stream_client.clone(),
            self.config.pipeline.ack_timeout,
        ));

        self.subscribe_ack_topic(ack_finalizer).await?;

        {
            let client = self.stream_client.lock().await;
            metrics::STREAMS_TRACKED
                .with_label_values(&["bridge"])
                .set(client.streams().len() as i64);
        }

        let mut handles = Vec::new();

        handles.push(tokio::spawn(fetch_loop(
            self.stream_client.clone(),
            self.queue.clone(),
            self.shutdown_tx.subscribe(),
            self.config.stream.claim_cycle_delay,
            self.config.stream.batch_size,
            self.config.pipeline.idle_poll_sleep,
            self.config.pipeline.backpressure_threshold,
        )));

        handles.push(tokio::spawn(claim_loop(
            self.stream_client.clone(),
            self.queue.clone(),
            self.shutdown_tx.subscribe(),
            self.config.stream.claim_interval,
        )));

        if self.config.stream.consumer_cleanup_enabled {
            handles.push(tokio::spawn(cleanup_loop(
                self.stream_client.clone(),
                self.shutdown_tx.subscribe(),
                self.config.stream.consumer_cleanup_interval,
            )));
        }

        handles.push(tokio::spawn(refresh_loop(
            self.stream_client.clone(),
            self.shutdown_tx.subscribe(),
            self.config.stream.refresh_interval,
        )));

        if self.config.stream.drain_enabled {
            handles.push(tokio::spawn(drain_loop(
                self.stream_client.clone(),
                self.queue.clone(),
                self.shutdown_tx.subscribe(),
                self.config.stream.drain_interval,
            )));
        }

        for worker_id in 0..self.config.pipeline.publish_workers {
            handles.push(tokio::spawn(publish_loop(
                worker_id,
                self.queue.clone(),
                self.bus_client.clone(),
                self.breaker.clone(),
                self.config.bus.publish_topic.clone(),
                self.shutdown_tx.subscribe(),
                self.config.pipeline.idle_poll_sleep,
                self.config.pipeline.error_backoff,
                self.config.pipeline.batch_size,
                self.config.pipeline.batch_timeout,
                self.config.pipeline.processing_timeout,
            )));
        }

        self.state.ready.store(true, Ordering::SeqCst);
        self.state
            .bus_connected
            .store(self.bus_client.is_connected(), Ordering::SeqCst);

        info!("orchestrator running with {} publish workers", self.config.pipeline.publish_workers);

        wait_for_shutdown_signal().await;
        info!("shutdown signal received, draining");
        let _ = self.shutdown_tx.send(());

        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };

        if tokio::time::timeout(self.config.pipeline.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!("shutdown timeout elapsed before all loops drained");
        }

        let write_timeout = self
            .config
            .bus
            .write_timeout
            .min(self.config.pipeline.shutdown_timeout);
        let _ = tokio::time::timeout(write_timeout, self.bus_client.disconnect()).await;

        match Arc::try_unwrap(self.stream_client) {
            Ok(mutex) => mutex.into_inner().close().await,
            Err(_) => warn!("stream client still shared at shutdown, skipping explicit close"),
        }

        Ok(())
    }

    async fn subscribe_ack_topic(&self, finalizer: Arc<AckFinalizer>) -> anyhow::Result<()> {
        let ack_topic = self.config.bus.ack_topic.clone();
        let handler: crate::bus_client::MessageHandler = Arc::new(move |_topic, payload| {
            let finalizer = finalizer.clone();
            let payload = payload.to_vec();
            tokio::spawn(async move {
                if let Err(err) = finalizer.handle(&payload).await {
                    error!(error = %err, "ack finalization failed");
                }
            });
        });

        self.bus_client.subscribe(&ack_topic, handler).await?;
        Ok(())
    }
}

/// Base batch size and idle sleep are halved/doubled (respectively) while
/// the queue's utilization stays above `backpressure_threshold`, and
/// restored as soon as it falls back under — per-cycle, no hysteresis.
async fn fetch_loop(
    stream_client: Arc<Mutex<StreamClient>>,
    queue: Arc<Queue>,
    mut shutdown_rx: broadcast::Receiver<()>,
    cycle_delay: Duration,
    base_batch_size: i64,
    base_idle_poll_sleep: Duration,
    backpressure_threshold: f64,
) {
    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        let under_pressure = queue.utilization() >= backpressure_threshold;
        let batch_size = if under_pressure {
            (base_batch_size / 2).max(1)
        } else {
            base_batch_size
        };

        let entries = {
            let mut client = stream_client.lock().await;
            client.read_batch(Some(batch_size)).await
        };

        match entries {
            Ok(entries) => {
                for entry in entries {
                    if entry.has_empty_body() {
                        continue;
                    }
                    metrics::ENTRIES_FETCHED_TOTAL
                        .with_label_values(&[&entry.stream])
                        .inc();
                    match queue.enqueue(entry) {
                        EnqueueOutcome::Dropped(dropped) => {
                            metrics::ENTRIES_DROPPED_TOTAL
                                .with_label_values(&["oldest_or_newest"])
                                .inc();
                            warn!(stream = %dropped.stream, "entry dropped from queue");
                        }
                        EnqueueOutcome::Rejected(rejected) => {
                            // dropPolicy=none: block the producer until space
                            // frees up, honoring shutdown.
                            let cancel = Box::pin(async {
                                let _ = shutdown_rx.recv().await;
                            });
                            if !queue.enqueue_blocking(rejected, cancel).await {
                                return;
                            }
                        }
                        EnqueueOutcome::Enqueued => {}
                    }
                }
                metrics::QUEUE_DEPTH.set(queue.len() as i64);
                metrics::QUEUE_UTILIZATION_PERMILLE.set((queue.utilization() * 1000.0) as i64);

                if under_pressure {
                    tokio::time::sleep(base_idle_poll_sleep * 2).await;
                }
            }
            Err(err) => {
                error!(error = %err, "fetch failed");
                tokio::time::sleep(cycle_delay.max(Duration::from_millis(100))).await;
            }
        }
    }
}

async fn claim_loop(
    stream_client: Arc<Mutex<StreamClient>>,
    queue: Arc<Queue>,
    mut shutdown_rx: broadcast::Receiver<()>,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let claimed = {
            let mut client = stream_client.lock().await;
            client.claim_idle().await
        };

        match claimed {
            Ok(entries) => {
                for entry in entries {
                    metrics::CLAIMS_TOTAL.with_label_values(&[&entry.stream]).inc();
                    if !entry.has_empty_body() {
                        queue.enqueue(entry);
                    }
                }
            }
            Err(err) => error!(error = %err, "idle-claim failed"),
        }
    }
}

async fn cleanup_loop(
    stream_client: Arc<Mutex<StreamClient>>,
    mut shutdown_rx: broadcast::Receiver<()>,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let mut client = stream_client.lock().await;
        match client.cleanup_dead_consumers().await {
            Ok(removed) if !removed.is_empty() => {
                metrics::CONSUMER_CLEANUPS_TOTAL
                    .with_label_values(&["all"])
                    .inc_by(removed.len() as u64);
                info!(count = removed.len(), "removed dead consumers");
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "consumer cleanup failed"),
        }
    }
}

async fn refresh_loop(
    stream_client: Arc<Mutex<StreamClient>>,
    mut shutdown_rx: broadcast::Receiver<()>,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let mut client = stream_client.lock().await;
        match client.refresh_streams().await {
            Ok(discovered) if !discovered.is_empty() => {
                metrics::STREAMS_DISCOVERED_TOTAL
                    .with_label_values(&["scan"])
                    .inc_by(discovered.len() as u64);
                metrics::STREAMS_TRACKED
                    .with_label_values(&["bridge"])
                    .set(client.streams().len() as i64);
            }
            Ok(_) => {}
            Err(err) => error!(error = %err, "stream refresh failed"),
        }
    }
}

async fn drain_loop(
    stream_client: Arc<Mutex<StreamClient>>,
    queue: Arc<Queue>,
    mut shutdown_rx: broadcast::Receiver<()>,
    interval: Duration,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let drained = {
            let mut client = stream_client.lock().await;
            client.drain().await
        };

        match drained {
            Ok(entries) => {
                for entry in entries {
                    if !entry.has_empty_body() {
                        queue.enqueue(entry);
                    }
                }
            }
            Err(err) => error!(error = %err, "drain failed"),
        }
    }
}

/// Pulls entries off the shared queue in batches of up to `batch_size`,
/// waiting up to `batch_timeout` for a partial batch to fill before giving
/// up and processing what arrived; each entry in the batch is then published
/// individually, each publish bounded by `processing_timeout`.
async fn publish_loop(
    worker_id: usize,
    queue: Arc<Queue>,
    bus_client: Arc<BusClient>,
    breaker: Arc<CircuitBreaker>,
    publish_topic: String,
    mut shutdown_rx: broadcast::Receiver<()>,
    idle_poll_sleep: Duration,
    error_backoff: Duration,
    batch_size: usize,
    batch_timeout: Duration,
    processing_timeout: Duration,
) {
    let mut batch: std::collections::VecDeque<bridge_domain::StreamEntry> =
        std::collections::VecDeque::new();

    loop {
        if shutdown_rx.try_recv().is_ok() {
            break;
        }

        if batch.is_empty() {
            let batch_size = batch_size.max(1);
            let accumulate_deadline = std::time::Instant::now() + batch_timeout;
            loop {
                batch.extend(queue.dequeue_batch(batch_size - batch.len()));
                if batch.len() >= batch_size || std::time::Instant::now() >= accumulate_deadline {
                    break;
                }
                tokio::time::sleep(idle_poll_sleep).await;
            }
        }

        let Some(entry) = batch.pop_front() else {
            tokio::time::sleep(idle_poll_sleep).await;
            continue;
        };

        let envelope = build_envelope(&entry);
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                error!(worker_id, error = %err, "failed to serialize envelope");
                continue;
            }
        };

        let bus = bus_client.clone();
        let topic = publish_topic.clone();
        let stream = entry.stream.clone();

        let publish_started = std::time::Instant::now();
        let result = match tokio::time::timeout(
            processing_timeout,
            breaker.execute(|| async move { bus.publish(&topic, &payload).await }),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(crate::error::BridgeError::WriteTimeout {
                topic: publish_topic.clone(),
                timeout_ms: processing_timeout.as_millis() as u64,
            }),
        };
        metrics::PUBLISH_DURATION
            .with_label_values(&[&stream])
            .observe(publish_started.elapsed().as_secs_f64());

        metrics::ENTRIES_PUBLISHED_TOTAL
            .with_label_values(&[&stream, &result.is_ok().to_string()])
            .inc();
        metrics::CIRCUIT_BREAKER_STATE.set(breaker_state_code(breaker.state()));
        metrics::CIRCUIT_BREAKER_GENERATION.set(breaker.generation() as i64);

        if let Err(err) = result {
            warn!(worker_id, stream, error = %err, "publish failed, entry left unacked");
            if matches!(err, crate::error::BridgeError::NotConnected) {
                tokio::time::sleep(error_backoff).await;
            }
        }
    }
}

/// Waits for SIGINT or, on unix, SIGTERM — the default signal `docker
/// stop`/`kubectl delete pod`/systemd send.
async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => warn!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn breaker_state_code(state: BreakerState) -> i64 {
    match state {
        BreakerState::Closed => 0,
        BreakerState::Open => 1,
        BreakerState::HalfOpen => 2,
    }
}
