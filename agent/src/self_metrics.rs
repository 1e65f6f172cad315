//! Self-metrics: the agent observing itself
//!
//! Every component publishes operational counters through the shared
//! [`MetricsPublisher`]. The [`SelfMetricsSource`] exposes those counters
//! back into the pipeline — it is a source like any other, so metrics
//! sinks can subscribe to it (event-stream) or register it for pull
//! (data-pull).
//!
//! ```text
//! components ──publish──► MetricsPublisher ──┬─► snapshot envelopes (push)
//!                                            └─► query()            (pull)
//! ```

use crate::component::{DataSource, EventSink, EventSource, Source};
use crate::subscription::{EventBus, Subscription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use virta_core::{
    CounterType, Envelope, Metric, MetricKey, MetricUnit, MetricValue, Payload, PayloadKind,
    PluginError,
};

/// Reserved id of the self-metrics source
pub const SELF_METRICS_ID: &str = "_self_metrics";

/// Well-known counter names written by the lifecycle manager
pub mod counters {
    /// Factory providers loaded
    pub const FACTORIES_LOADED: &str = "FactoriesLoaded";
    /// Factory providers that failed to load
    pub const FACTORIES_FAILED: &str = "FactoriesFailed";
    /// Type names registered, per catalog (dimension `kind`)
    pub const FACTORIES_REGISTERED: &str = "FactoriesRegistered";
    /// Sources started this load cycle
    pub const SOURCES_STARTED: &str = "SourcesStarted";
    /// Sources that failed to construct or start
    pub const SOURCES_FAILED: &str = "SourcesFailed";
    /// Sinks started this load cycle
    pub const SINKS_STARTED: &str = "SinksStarted";
    /// Sinks that failed to construct or start
    pub const SINKS_FAILED: &str = "SinksFailed";
    /// Pipes connected this load cycle
    pub const PIPES_CONNECTED: &str = "PipesConnected";
    /// Pipe entries that failed to bind
    pub const PIPES_FAILED: &str = "PipesFailed";
    /// Plugins started this load cycle
    pub const PLUGINS_STARTED: &str = "PluginsStarted";
    /// Plugins that failed to construct or start
    pub const PLUGINS_FAILED: &str = "PluginsFailed";
    /// Successful configuration reloads since process start
    pub const CONFIG_RELOAD_COUNT: &str = "ConfigReloadCount";
    /// Failed configuration reloads since process start
    pub const CONFIG_RELOAD_FAILED_COUNT: &str = "ConfigReloadFailedCount";
    /// Agent build number
    pub const BUILD_NUMBER: &str = "BuildNumber";
    /// Configured self-update interval in minutes
    pub const SELF_UPDATE_FREQUENCY: &str = "SelfUpdateFrequency";
}

/// Shared accumulator every component publishes into
///
/// Writes happen on whatever thread the component runs on; reads are
/// monotone snapshots taken by the self-metrics source. A single lock
/// suffices because publications are small batched map updates.
pub struct MetricsPublisher {
    values: Mutex<HashMap<MetricKey, MetricValue>>,
}

impl MetricsPublisher {
    /// Create an empty publisher
    pub fn new() -> Self {
        Self {
            values: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a batch of `{name: value}` entries for one component
    ///
    /// `Increment` entries add to the stored value; `CurrentValue` and
    /// `Average` entries replace it. A non-empty `id` becomes an `id`
    /// dimension on every key.
    pub fn publish(
        &self,
        id: &str,
        category: &str,
        counter_type: CounterType,
        entries: &[(&str, f64)],
    ) {
        let mut values = self.values.lock();
        for (name, sample) in entries {
            let mut key = MetricKey::new(*name, category);
            if !id.is_empty() {
                key = key.with_dimension("id", id);
            }
            match counter_type {
                CounterType::Increment => {
                    let entry = values
                        .entry(key)
                        .or_insert(MetricValue::count(0.0, CounterType::Increment));
                    entry.value += sample;
                    entry.counter_type = CounterType::Increment;
                }
                CounterType::CurrentValue | CounterType::Average => {
                    values.insert(
                        key,
                        MetricValue {
                            value: *sample,
                            unit: MetricUnit::Count,
                            counter_type,
                        },
                    );
                }
            }
        }
    }

    /// Publish one fully-specified sample (custom unit)
    pub fn publish_value(&self, key: MetricKey, value: MetricValue) {
        match value.counter_type {
            CounterType::Increment => {
                let mut values = self.values.lock();
                let entry = values.entry(key).or_insert(MetricValue {
                    value: 0.0,
                    unit: value.unit,
                    counter_type: CounterType::Increment,
                });
                entry.value += value.value;
            }
            CounterType::CurrentValue | CounterType::Average => {
                self.values.lock().insert(key, value);
            }
        }
    }

    /// Snapshot all samples, sorted by key for stable output
    pub fn snapshot(&self) -> Vec<Metric> {
        let mut metrics: Vec<Metric> = self
            .values
            .lock()
            .iter()
            .map(|(key, value)| Metric::new(key.clone(), *value))
            .collect();
        metrics.sort_by(|a, b| a.key.cmp(&b.key));
        metrics
    }

    /// Value of a dimensionless counter, if published
    pub fn value(&self, category: &str, name: &str) -> Option<f64> {
        self.values
            .lock()
            .get(&MetricKey::new(name, category))
            .map(|v| v.value)
    }

    /// Sum of a counter across all dimensions
    pub fn total(&self, name: &str) -> f64 {
        self.values
            .lock()
            .iter()
            .filter(|(key, _)| key.name == name)
            .map(|(_, value)| value.value)
            .sum()
    }
}

impl Default for MetricsPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// In-process source feeding the agent's own counters into the pipeline
///
/// Always present under [`SELF_METRICS_ID`]. When started with a non-zero
/// emission interval it publishes `Payload::Metrics` snapshot envelopes to
/// its subscribers; data-pull sinks instead call `query` on their own
/// schedule.
pub struct SelfMetricsSource {
    publisher: Arc<MetricsPublisher>,
    bus: EventBus,
    interval: Mutex<Duration>,
    tick: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl SelfMetricsSource {
    /// Create a source over the given publisher
    pub fn new(publisher: Arc<MetricsPublisher>) -> Self {
        Self {
            publisher,
            bus: EventBus::new(),
            interval: Mutex::new(Duration::ZERO),
            tick: Mutex::new(None),
        }
    }

    /// Set the emission interval before start; zero disables emission
    pub fn set_interval(&self, interval: Duration) {
        *self.interval.lock() = interval;
    }

    /// The publisher this source snapshots
    pub fn publisher(&self) -> &Arc<MetricsPublisher> {
        &self.publisher
    }
}

#[async_trait::async_trait]
impl Source for SelfMetricsSource {
    fn id(&self) -> &str {
        SELF_METRICS_ID
    }

    async fn start(&self) -> Result<(), PluginError> {
        let interval = *self.interval.lock();
        if interval.is_zero() {
            return Ok(());
        }

        let mut tick = self.tick.lock();
        if tick.is_some() {
            // Already running; start is idempotent
            return Ok(());
        }

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let bus = self.bus.clone();
        let publisher = Arc::clone(&self.publisher);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = publisher.snapshot();
                        if !snapshot.is_empty() {
                            let delivered = bus
                                .publish(Envelope::new(Payload::Metrics(snapshot)))
                                .await;
                            debug!(delivered, "self-metrics snapshot emitted");
                        }
                    }
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
        Ok(())
    }

    fn as_event_source(&self) -> Option<&dyn EventSource> {
        Some(self)
    }

    fn as_data_source(self: Arc<Self>) -> Option<Arc<dyn DataSource>> {
        Some(self)
    }
}

impl EventSource for SelfMetricsSource {
    fn payload_kind(&self) -> PayloadKind {
        PayloadKind::Metrics
    }

    fn subscribe(&self, sink: Arc<dyn EventSink>) -> Subscription {
        self.bus.subscribe(sink)
    }
}

impl DataSource for SelfMetricsSource {
    fn query(&self) -> Vec<Metric> {
        self.publisher.snapshot()
    }
}
