//! Reliable upload engine for metrics sinks
//!
//! The [`RetryEngine`] wraps a transport with the sink reliability model:
//! bounded in-flight retries with jittered backoff, then demotion to a
//! bounded FIFO retry queue that a single flusher drains later.
//!
//! ```text
//! send(batch) ──► attempt 1..=limit ──success──► done
//!                     │ recoverable, budget exhausted
//!                     ▼
//!               retry queue (FIFO, capacity 1440, oldest dropped)
//!                     │
//! flush() ──gate──► drain oldest-first, single attempt each
//! ```
//!
//! Recoverable errors (throttling, transient network) get in-flight
//! retries with jitter to avoid retry storms; only after local patience
//! is exhausted is a batch demoted to the queue. The flush gate is
//! non-blocking: a blocking lock would stack flusher invocations after a
//! long outage and drain the same batch twice.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::component::{DataSink, DataSource, Sink};
use crate::self_metrics::MetricsPublisher;
use virta_core::{CounterType, MetricKey, MetricValue, PluginError};

/// Default retry queue capacity
///
/// Sized so a minute-cadence upload schedule tolerates roughly one day of
/// outage before dropping data; metrics staler than that are not useful.
pub const RETRY_QUEUE_LIMIT: usize = 1440;

/// Lock-free xorshift64 PRNG for jitter randomness
///
/// Uses atomic compare-exchange for thread-safe operation without locks.
struct Xorshift64 {
    state: AtomicU64,
}

impl Xorshift64 {
    /// Create with seed from system time
    fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x853c49e6748fea9b); // Fallback seed
        let seed = if seed == 0 { 0x853c49e6748fea9b } else { seed };
        Self {
            state: AtomicU64::new(seed),
        }
    }

    /// Generate next random u64 using the xorshift64 algorithm
    fn next(&self) -> u64 {
        loop {
            let old = self.state.load(Ordering::Acquire);
            let mut x = old;
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            if self
                .state
                .compare_exchange_weak(old, x, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return x;
            }
        }
    }

    /// Generate random f64 in range [0.0, 1.0)
    fn next_f64(&self) -> f64 {
        (self.next() as f64) / (u64::MAX as f64)
    }
}

static JITTER_RNG: LazyLock<Xorshift64> = LazyLock::new(Xorshift64::new);

/// Generate random jitter value in range [0.0, 1.0)
pub(crate) fn rand_jitter() -> f64 {
    JITTER_RNG.next_f64()
}

/// Transport failure, classified by the transport implementation
///
/// Recoverable failures are worth retrying; non-recoverable failures
/// (authorization, malformed request) are counted and dropped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Worth retrying: throttling, timeouts, transient network faults
    #[error("recoverable transport error: {0}")]
    Recoverable(String),

    /// Not worth retrying: the request will never succeed as-is
    #[error("non-recoverable transport error: {0}")]
    NonRecoverable(String),
}

/// The remote-service client the engine drives
///
/// Requests must be idempotent: a batch may be sent again from the retry
/// queue after an ambiguous failure.
#[async_trait]
pub trait MetricsTransport<R>: Send + Sync {
    /// Upload one prepared batch
    async fn send_request(&self, request: &R) -> Result<(), SendError>;
}

/// Tuning knobs for the retry engine
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per batch before demotion to the queue
    pub attempt_limit: u32,
    /// Backoff scale: attempt `a` sleeps `Uniform[0, interval·a) × 100 ms`
    pub backoff_interval: u64,
    /// Pause between successful sends while draining the queue
    pub flush_queue_delay: Duration,
    /// Retry queue capacity
    pub queue_capacity: usize,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempt_limit: 3,
            backoff_interval: 60,
            flush_queue_delay: Duration::from_millis(100),
            queue_capacity: RETRY_QUEUE_LIMIT,
        }
    }
}

impl RetryConfig {
    /// Backoff delay for a 1-based attempt number
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_delay_with_jitter(attempt, rand_jitter())
    }

    /// Backoff delay with explicit jitter value (for testing)
    ///
    /// `jitter` is in `[0.0, 1.0)`; the delay grows linearly with the
    /// attempt number and is fully randomized within the window.
    pub fn backoff_delay_with_jitter(&self, attempt: u32, jitter: f64) -> Duration {
        let window_ms = (self.backoff_interval * u64::from(attempt)) as f64 * 100.0;
        Duration::from_millis((jitter * window_ms) as u64)
    }
}

/// Releases the flush gate on every exit path, including cancellation
struct FlushGate<'a>(&'a AtomicBool);

impl Drop for FlushGate<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Retry/flush engine parameterized by the upload-batch type
///
/// The engine is agnostic to batch contents; it only moves batches
/// through the transport and the queue. Counters are plain atomics:
/// written by the send/flush tasks, read as monotone snapshots by metric
/// aggregation.
pub struct RetryEngine<R> {
    transport: Arc<dyn MetricsTransport<R>>,
    config: RetryConfig,
    queue: Mutex<VecDeque<R>>,
    flushing: AtomicBool,
    service_success: AtomicU64,
    recoverable_errors: AtomicU64,
    nonrecoverable_errors: AtomicU64,
    latency_ms: AtomicU64,
}

impl<R: Send + Sync> RetryEngine<R> {
    /// Create an engine over a transport
    pub fn new(transport: Arc<dyn MetricsTransport<R>>, config: RetryConfig) -> Self {
        Self {
            transport,
            config,
            queue: Mutex::new(VecDeque::new()),
            flushing: AtomicBool::new(false),
            service_success: AtomicU64::new(0),
            recoverable_errors: AtomicU64::new(0),
            nonrecoverable_errors: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Upload one batch under the retry policy
    ///
    /// Attempts are strictly sequential. Recoverable failures retry after
    /// a jittered backoff until the attempt budget runs out, then the
    /// batch is enqueued for a later flush. Non-recoverable failures drop
    /// the batch.
    pub async fn send(&self, request: R) {
        for attempt in 1..=self.config.attempt_limit {
            match self.attempt(&request).await {
                Ok(()) => {
                    self.service_success.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(SendError::Recoverable(msg)) => {
                    self.recoverable_errors.fetch_add(1, Ordering::Relaxed);
                    if attempt < self.config.attempt_limit {
                        let delay = self.config.backoff_delay(attempt);
                        debug!(
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %msg,
                            "recoverable send failure, backing off"
                        );
                        tokio::time::sleep(delay).await;
                    } else {
                        warn!(
                            attempts = self.config.attempt_limit,
                            error = %msg,
                            "attempt budget exhausted, demoting batch to retry queue"
                        );
                    }
                }
                Err(SendError::NonRecoverable(msg)) => {
                    self.nonrecoverable_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %msg, "non-recoverable send failure, dropping batch");
                    return;
                }
            }
        }
        self.enqueue(request);
    }

    /// One transport attempt with latency measurement
    async fn attempt(&self, request: &R) -> Result<(), SendError> {
        let start = Instant::now();
        let result = self.transport.send_request(request).await;
        self.latency_ms
            .store(start.elapsed().as_millis() as u64, Ordering::Relaxed);
        result
    }

    /// Enqueue a batch, dropping the oldest entry on overflow
    fn enqueue(&self, request: R) {
        let mut queue = self.queue.lock();
        if queue.len() >= self.config.queue_capacity {
            queue.pop_front();
            self.nonrecoverable_errors.fetch_add(1, Ordering::Relaxed);
            warn!(
                capacity = self.config.queue_capacity,
                "retry queue full, dropped oldest batch"
            );
        }
        queue.push_back(request);
    }

    /// Drain the retry queue, oldest first
    ///
    /// Protected by a non-blocking single-holder gate: a concurrent call
    /// returns immediately. Each batch is sent exactly once; on a
    /// recoverable failure the batch returns to the queue head and the
    /// drain stops, leaving the remaining items in FIFO order for the
    /// next tick. A non-recoverable failure drops the batch and also
    /// stops. Between successful sends the flusher sleeps
    /// `flush_queue_delay` to avoid hammering a freshly recovered remote.
    pub async fn flush(&self) {
        if self
            .flushing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("flush already in progress, skipping");
            return;
        }
        let _gate = FlushGate(&self.flushing);

        loop {
            let request = match self.queue.lock().pop_front() {
                Some(request) => request,
                None => break,
            };

            let result = self.attempt(&request).await;
            match result {
                Ok(()) => {
                    self.service_success.fetch_add(1, Ordering::Relaxed);
                    if !self.config.flush_queue_delay.is_zero() {
                        tokio::time::sleep(self.config.flush_queue_delay).await;
                    }
                }
                Err(SendError::Recoverable(msg)) => {
                    self.recoverable_errors.fetch_add(1, Ordering::Relaxed);
                    self.queue.lock().push_front(request);
                    debug!(error = %msg, "flush hit recoverable failure, stopping drain");
                    break;
                }
                Err(SendError::NonRecoverable(msg)) => {
                    self.nonrecoverable_errors.fetch_add(1, Ordering::Relaxed);
                    warn!(error = %msg, "flush dropped non-recoverable batch");
                    break;
                }
            }
        }
    }

    /// Drop everything still queued; called when the owning sink stops
    pub fn clear(&self) -> usize {
        let mut queue = self.queue.lock();
        let dropped = queue.len();
        queue.clear();
        dropped
    }

    /// Batches currently awaiting flush
    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    /// Successful uploads
    pub fn service_success(&self) -> u64 {
        self.service_success.load(Ordering::Relaxed)
    }

    /// Recoverable transport failures observed
    pub fn recoverable_errors(&self) -> u64 {
        self.recoverable_errors.load(Ordering::Relaxed)
    }

    /// Non-recoverable failures (including queue-overflow drops)
    pub fn nonrecoverable_errors(&self) -> u64 {
        self.nonrecoverable_errors.load(Ordering::Relaxed)
    }

    /// Wall-clock milliseconds of the most recent attempt
    pub fn latency_ms(&self) -> u64 {
        self.latency_ms.load(Ordering::Relaxed)
    }
}

/// One aggregated upload batch produced by [`ReliableMetricsSink`]
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsBatch {
    /// One aggregate per metric name
    pub entries: Vec<(String, MetricValue)>,
    /// When the aggregation ran
    pub observed_at: DateTime<Utc>,
}

/// How a group of samples for one metric name collapses to one aggregate
pub type Aggregator = dyn Fn(&str, &[MetricValue]) -> MetricValue + Send + Sync;

/// Sum the group; the usual aggregator for accumulator counters
pub fn sum_aggregator(_name: &str, values: &[MetricValue]) -> MetricValue {
    let total: f64 = values.iter().map(|v| v.value).sum();
    let unit = values.first().map(|v| v.unit).unwrap_or(virta_core::MetricUnit::Count);
    MetricValue {
        value: total,
        unit,
        counter_type: CounterType::CurrentValue,
    }
}

/// State shared between the sink handle and its upload tick task
struct SinkCore {
    id: String,
    engine: RetryEngine<MetricsBatch>,
    sources: Mutex<Vec<Arc<dyn DataSource>>>,
    aggregator: Arc<Aggregator>,
    publisher: Arc<MetricsPublisher>,
}

impl SinkCore {
    /// Pull current samples from every source, one aggregate per name
    ///
    /// The grouping key is the metric name; dimensions are discarded
    /// unless the aggregator's output carries them.
    fn aggregate(&self) -> Vec<(String, MetricValue)> {
        let sources: Vec<Arc<dyn DataSource>> = self.sources.lock().clone();

        let mut groups: BTreeMap<String, Vec<MetricValue>> = BTreeMap::new();
        for source in &sources {
            for metric in source.query() {
                groups.entry(metric.key.name).or_default().push(metric.value);
            }
        }

        groups
            .into_iter()
            .map(|(name, values)| {
                let aggregate = (self.aggregator)(&name, &values);
                (name, aggregate)
            })
            .collect()
    }

    /// One upload cycle: aggregate, send, drain the queue, mirror counters
    async fn upload_once(&self) {
        let entries = self.aggregate();
        if !entries.is_empty() {
            let batch = MetricsBatch {
                entries,
                observed_at: Utc::now(),
            };
            self.engine.send(batch).await;
        }
        self.engine.flush().await;
        self.mirror_counters();
    }

    fn mirror_counters(&self) {
        self.publisher.publish(
            &self.id,
            "Sinks",
            CounterType::CurrentValue,
            &[
                ("ServiceSuccess", self.engine.service_success() as f64),
                (
                    "RecoverableServiceErrors",
                    self.engine.recoverable_errors() as f64,
                ),
                (
                    "NonrecoverableServiceErrors",
                    self.engine.nonrecoverable_errors() as f64,
                ),
                ("RetryQueueLength", self.engine.queue_len() as f64),
            ],
        );
        self.publisher.publish_value(
            MetricKey::new("Latency", "Sinks").with_dimension("id", &self.id),
            MetricValue::millis(self.engine.latency_ms() as f64, CounterType::CurrentValue),
        );
    }
}

/// A data-pull metrics sink built on the retry engine
///
/// On each upload tick the sink queries its registered data sources,
/// groups samples by metric name, applies the aggregator per group,
/// sends the resulting batch through the engine, then drains the retry
/// queue. The engine's counters are mirrored to the shared publisher
/// under this sink's id.
pub struct ReliableMetricsSink {
    core: Arc<SinkCore>,
    upload_interval: Duration,
    tick: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl ReliableMetricsSink {
    /// Create a sink
    pub fn new(
        id: impl Into<String>,
        transport: Arc<dyn MetricsTransport<MetricsBatch>>,
        config: RetryConfig,
        aggregator: Arc<Aggregator>,
        upload_interval: Duration,
        publisher: Arc<MetricsPublisher>,
    ) -> Self {
        Self {
            core: Arc::new(SinkCore {
                id: id.into(),
                engine: RetryEngine::new(transport, config),
                sources: Mutex::new(Vec::new()),
                aggregator,
                publisher,
            }),
            upload_interval,
            tick: Mutex::new(None),
        }
    }

    /// The engine, exposed for counters and tests
    pub fn engine(&self) -> &RetryEngine<MetricsBatch> {
        &self.core.engine
    }

    /// Aggregate current samples from all registered sources
    pub fn aggregate(&self) -> Vec<(String, MetricValue)> {
        self.core.aggregate()
    }

    /// Run one upload cycle immediately, outside the tick schedule
    pub async fn upload_once(&self) {
        self.core.upload_once().await;
    }
}

#[async_trait]
impl Sink for ReliableMetricsSink {
    fn id(&self) -> &str {
        &self.core.id
    }

    async fn start(&self) -> Result<(), PluginError> {
        let mut tick = self.tick.lock();
        if tick.is_some() {
            return Ok(());
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let core = Arc::clone(&self.core);
        let interval = self.upload_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => core.upload_once().await,
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        *tick = Some((shutdown_tx, handle));
        Ok(())
    }

    async fn stop(&self) -> Result<(), PluginError> {
        let task = self.tick.lock().take();
        if let Some((shutdown_tx, handle)) = task {
            let _ = shutdown_tx.send(true);
            let _ = handle.await;
        }

        // Final drain, then empty whatever could not be delivered
        self.core.engine.flush().await;
        let dropped = self.core.engine.clear();
        if dropped > 0 {
            warn!(id = %self.core.id, dropped, "retry queue emptied on stop");
        }
        Ok(())
    }

    fn as_data_sink(&self) -> Option<&dyn DataSink> {
        Some(self)
    }
}

impl DataSink for ReliableMetricsSink {
    fn register_data_source(&self, source: Arc<dyn DataSource>) {
        self.core.sources.lock().push(source);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use virta_core::Metric;

    /// Transport that fails with the scripted errors, then succeeds
    struct ScriptedTransport {
        failures: Mutex<VecDeque<SendError>>,
        calls: AtomicU32,
        sent: Mutex<Vec<u32>>,
    }

    impl ScriptedTransport {
        fn new(failures: Vec<SendError>) -> Arc<Self> {
            Arc::new(Self {
                failures: Mutex::new(failures.into()),
                calls: AtomicU32::new(0),
                sent: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MetricsTransport<u32> for ScriptedTransport {
        async fn send_request(&self, request: &u32) -> Result<(), SendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.failures.lock().pop_front() {
                return Err(err);
            }
            self.sent.lock().push(*request);
            Ok(())
        }
    }

    fn fast_config() -> RetryConfig {
        RetryConfig {
            attempt_limit: 3,
            backoff_interval: 0, // zero window: no sleeping in tests
            flush_queue_delay: Duration::ZERO,
            queue_capacity: RETRY_QUEUE_LIMIT,
        }
    }

    fn recoverable(n: usize) -> Vec<SendError> {
        (0..n)
            .map(|i| SendError::Recoverable(format!("throttled {i}")))
            .collect()
    }

    // ========================================================================
    // Send-path properties
    // ========================================================================

    #[tokio::test]
    async fn test_success_increments_once_and_queue_stays_empty() {
        let transport = ScriptedTransport::new(vec![]);
        let engine = RetryEngine::new(transport.clone() as Arc<dyn MetricsTransport<u32>>, fast_config());

        engine.send(1).await;
        engine.send(2).await;

        assert_eq!(engine.service_success(), 2);
        assert_eq!(engine.queue_len(), 0);
        assert_eq!(transport.calls(), 2);
    }

    #[tokio::test]
    async fn test_recoverable_failures_then_success() {
        // Fails twice (k=2 < attempt_limit=3), then succeeds
        let transport = ScriptedTransport::new(recoverable(2));
        let engine = RetryEngine::new(transport.clone() as Arc<dyn MetricsTransport<u32>>, fast_config());

        engine.send(1).await;

        assert_eq!(engine.recoverable_errors(), 2);
        assert_eq!(engine.service_success(), 1);
        assert_eq!(engine.queue_len(), 0);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_attempt_budget_exhaustion_enqueues() {
        let transport = ScriptedTransport::new(recoverable(3));
        let engine = RetryEngine::new(transport.clone() as Arc<dyn MetricsTransport<u32>>, fast_config());

        engine.send(1).await;

        assert_eq!(engine.recoverable_errors(), 3);
        assert_eq!(engine.service_success(), 0);
        assert_eq!(engine.queue_len(), 1);
        assert_eq!(transport.calls(), 3);
    }

    #[tokio::test]
    async fn test_nonrecoverable_drops_immediately() {
        let transport =
            ScriptedTransport::new(vec![SendError::NonRecoverable("bad credentials".into())]);
        let engine = RetryEngine::new(transport.clone() as Arc<dyn MetricsTransport<u32>>, fast_config());

        engine.send(1).await;

        assert_eq!(engine.nonrecoverable_errors(), 1);
        assert_eq!(engine.service_success(), 0);
        assert_eq!(engine.queue_len(), 0);
        assert_eq!(transport.calls(), 1, "no retries for non-recoverable");
    }

    // ========================================================================
    // Queue properties
    // ========================================================================

    #[tokio::test]
    async fn test_overflow_drops_oldest() {
        // attempt_limit 1: every recoverable failure enqueues directly
        let transport = ScriptedTransport::new(recoverable(4));
        let config = RetryConfig {
            attempt_limit: 1,
            queue_capacity: 3,
            ..fast_config()
        };
        let engine = RetryEngine::new(transport.clone() as Arc<dyn MetricsTransport<u32>>, config);

        for item in 1..=4u32 {
            engine.send(item).await;
        }

        assert_eq!(engine.queue_len(), 3);
        assert_eq!(engine.nonrecoverable_errors(), 1, "one overflow drop");

        // Flush delivers the survivors in FIFO order: 2, 3, 4
        engine.flush().await;
        assert_eq!(*transport.sent.lock(), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_flush_failure_preserves_remaining_order() {
        // Four batches queued; flush fails on the second attempt
        let transport = ScriptedTransport::new(recoverable(4));
        let config = RetryConfig {
            attempt_limit: 1,
            ..fast_config()
        };
        let engine = RetryEngine::new(transport.clone() as Arc<dyn MetricsTransport<u32>>, config);

        for item in 1..=4u32 {
            engine.send(item).await;
        }
        assert_eq!(engine.queue_len(), 4);

        // Next failure in the script hits item 1 during flush; drain stops
        transport
            .failures
            .lock()
            .push_back(SendError::Recoverable("still down".into()));
        engine.flush().await;

        assert_eq!(engine.queue_len(), 4, "failed item returns to the head");

        // Remote recovers; everything drains in the original order
        engine.flush().await;
        assert_eq!(engine.queue_len(), 0);
        assert_eq!(*transport.sent.lock(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_retry_then_queue_then_flush_succeeds() {
        let transport = ScriptedTransport::new(recoverable(3));
        let engine = RetryEngine::new(transport.clone() as Arc<dyn MetricsTransport<u32>>, fast_config());

        engine.send(42).await;
        assert_eq!(engine.queue_len(), 1);
        assert_eq!(engine.service_success(), 0);

        engine.flush().await;

        assert_eq!(engine.queue_len(), 0);
        assert_eq!(engine.service_success(), 1);
        assert_eq!(*transport.sent.lock(), vec![42]);
    }

    // ========================================================================
    // Flusher gate
    // ========================================================================

    /// Transport that records how many sends overlap in time
    struct SlowTransport {
        in_flight: AtomicU32,
        max_in_flight: AtomicU32,
        total: AtomicU32,
    }

    #[async_trait]
    impl MetricsTransport<u32> for SlowTransport {
        async fn send_request(&self, _request: &u32) -> Result<(), SendError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.total.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_concurrent_flush_yields_single_drain() {
        let transport = Arc::new(SlowTransport {
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
            total: AtomicU32::new(0),
        });
        let config = RetryConfig {
            attempt_limit: 1,
            ..fast_config()
        };
        let engine = Arc::new(RetryEngine::new(
            transport.clone() as Arc<dyn MetricsTransport<u32>>,
            config,
        ));

        // Preload the queue directly through the send path
        {
            let failing = ScriptedTransport::new(recoverable(5));
            let loader = RetryEngine::new(
                failing as Arc<dyn MetricsTransport<u32>>,
                RetryConfig {
                    attempt_limit: 1,
                    ..fast_config()
                },
            );
            for item in 0..5u32 {
                loader.send(item).await;
            }
            let mut queue = engine.queue.lock();
            queue.extend(loader.queue.lock().drain(..));
        }
        assert_eq!(engine.queue_len(), 5);

        let first = tokio::spawn({
            let engine = Arc::clone(&engine);
            async move { engine.flush().await }
        });
        // Let the first flusher take the gate
        tokio::time::sleep(Duration::from_millis(5)).await;

        let start = Instant::now();
        engine.flush().await; // second flusher: returns immediately
        assert!(
            start.elapsed() < Duration::from_millis(10),
            "gated flusher must not wait"
        );

        first.await.unwrap();

        assert_eq!(transport.total.load(Ordering::SeqCst), 5, "no duplicate sends");
        assert_eq!(
            transport.max_in_flight.load(Ordering::SeqCst),
            1,
            "exactly one active drain"
        );
        assert!(!engine.flushing.load(Ordering::SeqCst), "gate released");
    }

    // ========================================================================
    // Backoff distribution
    // ========================================================================

    #[test]
    fn test_backoff_window_is_attempt_linear() {
        let config = RetryConfig {
            backoff_interval: 60,
            ..RetryConfig::default()
        };

        // jitter at the top of the range lands just under the window
        assert_eq!(
            config.backoff_delay_with_jitter(1, 0.999999),
            Duration::from_millis(5999)
        );
        assert_eq!(
            config.backoff_delay_with_jitter(2, 0.5),
            Duration::from_millis(6000)
        );
        assert_eq!(config.backoff_delay_with_jitter(3, 0.0), Duration::ZERO);
    }

    #[test]
    fn test_backoff_samples_stay_in_window_and_spread() {
        let config = RetryConfig {
            backoff_interval: 60,
            ..RetryConfig::default()
        };
        let window = Duration::from_millis(60 * 2 * 100);

        let samples: Vec<Duration> = (0..1000).map(|_| config.backoff_delay(2)).collect();

        assert!(samples.iter().all(|d| *d < window), "all within the window");
        let min = samples.iter().min().unwrap();
        let max = samples.iter().max().unwrap();
        assert!(
            *max - *min > window / 2,
            "samples should spread across the window: min={min:?} max={max:?}"
        );
    }

    #[test]
    fn test_jitter_in_unit_range() {
        for _ in 0..1000 {
            let v = rand_jitter();
            assert!((0.0..1.0).contains(&v));
        }
    }

    // ========================================================================
    // Aggregation and the full sink
    // ========================================================================

    struct FixedDataSource(Vec<Metric>);

    impl DataSource for FixedDataSource {
        fn query(&self) -> Vec<Metric> {
            self.0.clone()
        }
    }

    fn sample(name: &str, id: &str, value: f64) -> Metric {
        Metric::new(
            MetricKey::new(name, "Sinks").with_dimension("id", id),
            MetricValue::count(value, CounterType::Increment),
        )
    }

    struct BatchTransport {
        batches: Mutex<Vec<MetricsBatch>>,
    }

    #[async_trait]
    impl MetricsTransport<MetricsBatch> for BatchTransport {
        async fn send_request(&self, request: &MetricsBatch) -> Result<(), SendError> {
            self.batches.lock().push(request.clone());
            Ok(())
        }
    }

    fn make_sink(
        transport: Arc<dyn MetricsTransport<MetricsBatch>>,
        publisher: Arc<MetricsPublisher>,
    ) -> ReliableMetricsSink {
        ReliableMetricsSink::new(
            "metrics-upload",
            transport,
            RetryConfig {
                backoff_interval: 0,
                flush_queue_delay: Duration::ZERO,
                ..RetryConfig::default()
            },
            Arc::new(sum_aggregator),
            Duration::from_secs(60),
            publisher,
        )
    }

    #[tokio::test]
    async fn test_aggregation_groups_by_name_across_sources() {
        let transport = Arc::new(BatchTransport {
            batches: Mutex::new(Vec::new()),
        });
        let sink = make_sink(transport.clone(), Arc::new(MetricsPublisher::new()));

        sink.register_data_source(Arc::new(FixedDataSource(vec![
            sample("ServiceSuccess", "a", 2.0),
            sample("Latency", "a", 10.0),
        ])));
        sink.register_data_source(Arc::new(FixedDataSource(vec![sample(
            "ServiceSuccess",
            "b",
            3.0,
        )])));

        let entries = sink.aggregate();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, "Latency");
        assert_eq!(entries[0].1.value, 10.0);
        assert_eq!(entries[1].0, "ServiceSuccess");
        assert_eq!(entries[1].1.value, 5.0, "values summed across dimensions");
    }

    #[tokio::test]
    async fn test_upload_cycle_sends_and_mirrors_counters() {
        let transport = Arc::new(BatchTransport {
            batches: Mutex::new(Vec::new()),
        });
        let publisher = Arc::new(MetricsPublisher::new());
        let sink = make_sink(transport.clone(), Arc::clone(&publisher));

        sink.register_data_source(Arc::new(FixedDataSource(vec![sample(
            "ServiceSuccess",
            "a",
            1.0,
        )])));

        sink.upload_once().await;

        assert_eq!(transport.batches.lock().len(), 1);
        assert_eq!(sink.engine().service_success(), 1);
        assert_eq!(publisher.total("RetryQueueLength"), 0.0);
        assert_eq!(publisher.total("ServiceSuccess"), 1.0);
    }

    #[tokio::test]
    async fn test_sink_stop_drains_and_empties_queue() {
        // Transport permanently down: the tick enqueues, stop clears
        struct DownTransport;

        #[async_trait]
        impl MetricsTransport<MetricsBatch> for DownTransport {
            async fn send_request(&self, _request: &MetricsBatch) -> Result<(), SendError> {
                Err(SendError::Recoverable("down".into()))
            }
        }

        let sink = ReliableMetricsSink::new(
            "metrics-upload",
            Arc::new(DownTransport),
            RetryConfig {
                attempt_limit: 1,
                backoff_interval: 0,
                flush_queue_delay: Duration::ZERO,
                queue_capacity: 8,
            },
            Arc::new(sum_aggregator),
            Duration::from_secs(60),
            Arc::new(MetricsPublisher::new()),
        );
        sink.register_data_source(Arc::new(FixedDataSource(vec![sample(
            "ServiceSuccess",
            "a",
            1.0,
        )])));

        sink.start().await.unwrap();
        sink.upload_once().await;
        assert_eq!(sink.engine().queue_len(), 1);

        sink.stop().await.unwrap();
        assert_eq!(sink.engine().queue_len(), 0, "queue emptied on stop");

        // Double stop is a no-op
        sink.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_aggregation_sends_nothing() {
        let transport = Arc::new(BatchTransport {
            batches: Mutex::new(Vec::new()),
        });
        let sink = make_sink(transport.clone(), Arc::new(MetricsPublisher::new()));

        sink.upload_once().await;

        assert!(transport.batches.lock().is_empty());
        assert_eq!(sink.engine().service_success(), 0);
    }
}
