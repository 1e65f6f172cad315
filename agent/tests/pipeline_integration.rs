//! Pipeline integration tests for the lifecycle manager
//!
//! Validates key invariants:
//! - Topology load: declared sources, sinks, and pipes come up connected
//! - Typed pipes: payload transformation between source and sink
//! - Data-pull coupling: registration without subscriptions
//! - Hot reload: one full stop/start cycle per config change, none when
//!   unchanged
//! - Stop: links severed, counters stable across restart

#![allow(clippy::unwrap_used, clippy::expect_used)]

use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use virta_agent::{
    AgentBuilder, AgentConfig, AgentManager, DataSink, DataSource, Envelope, EventBus, EventSink,
    EventSource, FactoryCatalogs, FactoryProvider, MemoryConfigProvider, Metric, MetricKey,
    MetricValue, Payload, PayloadKind, Pipe, PluginError, Sink, Source, Subscription,
};
use virta_core::CounterType;

// ============================================================================
// Shared test components
// ============================================================================

/// Event-stream source the tests drive by hand
struct TestSource {
    id: String,
    bus: EventBus,
    started: AtomicBool,
}

impl TestSource {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            bus: EventBus::new(),
            started: AtomicBool::new(false),
        }
    }

    async fn emit(&self, text: &str) -> usize {
        self.bus
            .publish(Envelope::new(Payload::Text(text.to_string())))
            .await
    }
}

#[async_trait]
impl Source for TestSource {
    fn id(&self) -> &str {
        &self.id
    }
    async fn start(&self) -> Result<(), PluginError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }
    async fn stop(&self) -> Result<(), PluginError> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }
    fn as_event_source(&self) -> Option<&dyn EventSource> {
        Some(self)
    }
}

impl EventSource for TestSource {
    fn payload_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }
    fn subscribe(&self, sink: Arc<dyn EventSink>) -> Subscription {
        self.bus.subscribe(sink)
    }
}

/// Event-stream sink that records every text payload it receives
struct CaptureSink {
    id: String,
    received: Mutex<Vec<String>>,
    started: AtomicBool,
}

impl CaptureSink {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            received: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for CaptureSink {
    fn id(&self) -> &str {
        &self.id
    }
    async fn start(&self) -> Result<(), PluginError> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }
    async fn stop(&self) -> Result<(), PluginError> {
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }
    fn as_event_sink(self: Arc<Self>) -> Option<Arc<dyn EventSink>> {
        Some(self)
    }
}

#[async_trait]
impl EventSink for CaptureSink {
    fn payload_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }
    async fn receive(&self, envelope: Envelope<Payload>) -> Result<(), PluginError> {
        if let Payload::Text(text) = envelope.payload {
            self.received.lock().unwrap().push(text);
        }
        Ok(())
    }
}

/// Pipe that uppercases text payloads
struct UppercasePipe {
    id: String,
    bus: EventBus,
}

#[async_trait]
impl Pipe for UppercasePipe {
    fn id(&self) -> &str {
        &self.id
    }
    async fn start(&self) -> Result<(), PluginError> {
        Ok(())
    }
    async fn stop(&self) -> Result<(), PluginError> {
        Ok(())
    }
    fn upstream(self: Arc<Self>) -> Arc<dyn EventSink> {
        self
    }
    fn downstream(&self) -> &dyn EventSource {
        self
    }
}

#[async_trait]
impl EventSink for UppercasePipe {
    fn payload_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }
    async fn receive(&self, envelope: Envelope<Payload>) -> Result<(), PluginError> {
        let transformed = envelope.map(|payload| match payload {
            Payload::Text(text) => Payload::Text(text.to_uppercase()),
            other => other,
        });
        self.bus.publish(transformed).await;
        Ok(())
    }
}

impl EventSource for UppercasePipe {
    fn payload_kind(&self) -> PayloadKind {
        PayloadKind::Text
    }
    fn subscribe(&self, sink: Arc<dyn EventSink>) -> Subscription {
        self.bus.subscribe(sink)
    }
}

/// Data-pull source answering with one fixed sample
struct PullSource {
    id: String,
}

#[async_trait]
impl Source for PullSource {
    fn id(&self) -> &str {
        &self.id
    }
    async fn start(&self) -> Result<(), PluginError> {
        Ok(())
    }
    async fn stop(&self) -> Result<(), PluginError> {
        Ok(())
    }
    fn as_data_source(self: Arc<Self>) -> Option<Arc<dyn DataSource>> {
        Some(self)
    }
}

impl DataSource for PullSource {
    fn query(&self) -> Vec<Metric> {
        vec![Metric::new(
            MetricKey::new("BytesRead", "Sources").with_dimension("id", &self.id),
            MetricValue::count(42.0, CounterType::Increment),
        )]
    }
}

/// Data-pull sink recording how many sources were registered
struct PullSink {
    id: String,
    registered: Mutex<Vec<Arc<dyn DataSource>>>,
}

#[async_trait]
impl Sink for PullSink {
    fn id(&self) -> &str {
        &self.id
    }
    async fn start(&self) -> Result<(), PluginError> {
        Ok(())
    }
    async fn stop(&self) -> Result<(), PluginError> {
        Ok(())
    }
    fn as_data_sink(&self) -> Option<&dyn DataSink> {
        Some(self)
    }
}

impl DataSink for PullSink {
    fn register_data_source(&self, source: Arc<dyn DataSource>) {
        self.registered.lock().unwrap().push(source);
    }
}

/// Metrics-stream sink standing in for the built-in perf-counter sink
struct MetricsCaptureSink {
    id: String,
    batches: Mutex<Vec<usize>>,
}

#[async_trait]
impl Sink for MetricsCaptureSink {
    fn id(&self) -> &str {
        &self.id
    }
    async fn start(&self) -> Result<(), PluginError> {
        Ok(())
    }
    async fn stop(&self) -> Result<(), PluginError> {
        Ok(())
    }
    fn as_event_sink(self: Arc<Self>) -> Option<Arc<dyn EventSink>> {
        Some(self)
    }
}

#[async_trait]
impl EventSink for MetricsCaptureSink {
    fn payload_kind(&self) -> PayloadKind {
        PayloadKind::Metrics
    }
    async fn receive(&self, envelope: Envelope<Payload>) -> Result<(), PluginError> {
        if let Payload::Metrics(metrics) = envelope.payload {
            self.batches.lock().unwrap().push(metrics.len());
        }
        Ok(())
    }
}

// ============================================================================
// Factory provider capturing built instances for the tests
// ============================================================================

#[derive(Default)]
struct TestFactories {
    sources: Arc<Mutex<Vec<Arc<TestSource>>>>,
    sinks: Arc<Mutex<Vec<Arc<CaptureSink>>>>,
    pull_sinks: Arc<Mutex<Vec<Arc<PullSink>>>>,
    metric_sinks: Arc<Mutex<Vec<Arc<MetricsCaptureSink>>>>,
    with_builtin: bool,
}

impl TestFactories {
    /// Variant that also registers the built-in perf-counter sink factory
    fn with_builtin() -> Self {
        Self {
            with_builtin: true,
            ..Self::default()
        }
    }
}

impl TestFactories {
    fn source(&self, id: &str) -> Arc<TestSource> {
        self.sources
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| s.id == id)
            .cloned()
            .expect("source not built")
    }

    fn sink(&self, id: &str) -> Arc<CaptureSink> {
        self.sinks
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| s.id == id)
            .cloned()
            .expect("sink not built")
    }

    fn pull_sink(&self, id: &str) -> Arc<PullSink> {
        self.pull_sinks
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| s.id == id)
            .cloned()
            .expect("pull sink not built")
    }
}

impl FactoryProvider for TestFactories {
    fn name(&self) -> &str {
        "test-factories"
    }

    fn register(&self, catalogs: &mut FactoryCatalogs) -> Result<(), PluginError> {
        let built = Arc::clone(&self.sources);
        catalogs.sources.register(
            "test",
            Arc::new(move |_type_name, ctx| {
                let source = Arc::new(TestSource::new(ctx.id()));
                built.lock().unwrap().push(Arc::clone(&source));
                Ok(source as Arc<dyn Source>)
            }),
        );

        catalogs.sources.register(
            "pull",
            Arc::new(|_type_name, ctx| {
                Ok(Arc::new(PullSource {
                    id: ctx.id().to_string(),
                }) as Arc<dyn Source>)
            }),
        );

        let built = Arc::clone(&self.sinks);
        catalogs.sinks.register(
            "capture",
            Arc::new(move |_type_name, ctx| {
                let sink = Arc::new(CaptureSink::new(ctx.id()));
                built.lock().unwrap().push(Arc::clone(&sink));
                Ok(sink as Arc<dyn Sink>)
            }),
        );

        let built = Arc::clone(&self.pull_sinks);
        catalogs.sinks.register(
            "pullsink",
            Arc::new(move |_type_name, ctx| {
                let sink = Arc::new(PullSink {
                    id: ctx.id().to_string(),
                    registered: Mutex::new(Vec::new()),
                });
                built.lock().unwrap().push(Arc::clone(&sink));
                Ok(sink as Arc<dyn Sink>)
            }),
        );

        if self.with_builtin {
            let built = Arc::clone(&self.metric_sinks);
            catalogs.sinks.register(
                "performancecounter",
                Arc::new(move |_type_name, ctx| {
                    let id = if ctx.id().is_empty() {
                        "_perf_counter"
                    } else {
                        ctx.id()
                    };
                    let sink = Arc::new(MetricsCaptureSink {
                        id: id.to_string(),
                        batches: Mutex::new(Vec::new()),
                    });
                    built.lock().unwrap().push(Arc::clone(&sink));
                    Ok(sink as Arc<dyn Sink>)
                }),
            );
        }

        catalogs.pipes.register(
            "uppercase",
            Arc::new(|type_name, _ctx| {
                Ok(Arc::new(UppercasePipe {
                    id: type_name.to_string(),
                    bus: EventBus::new(),
                }) as Arc<dyn Pipe>)
            }),
        );

        Ok(())
    }
}

fn config(value: serde_json::Value) -> AgentConfig {
    AgentConfig::from_value(value).unwrap()
}

fn build_manager(
    factories: Arc<TestFactories>,
    provider: Arc<MemoryConfigProvider>,
) -> Arc<AgentManager> {
    AgentBuilder::new()
        .config_provider(provider)
        .factory_provider(factories)
        .build()
        .unwrap()
}

fn counter(manager: &AgentManager, category: &str, name: &str) -> f64 {
    manager.metrics().value(category, name).unwrap_or(0.0)
}

// ============================================================================
// Happy path: source → sink, in order
// ============================================================================

#[tokio::test]
async fn happy_path_delivers_in_order() {
    let factories = Arc::new(TestFactories::default());
    let provider = Arc::new(MemoryConfigProvider::new(config(json!({
        "Sources": [{"Id": "S1", "SourceType": "test"}],
        "Sinks": [{"Id": "K1", "SinkType": "capture"}],
        "Pipes": [{"SourceRef": "S1", "SinkRef": "K1"}]
    }))));
    let manager = build_manager(Arc::clone(&factories), provider);

    manager.start().await.unwrap();

    assert_eq!(counter(&manager, "Sources", "SourcesStarted"), 1.0);
    assert_eq!(counter(&manager, "Sinks", "SinksStarted"), 1.0);
    assert_eq!(counter(&manager, "Pipes", "PipesConnected"), 1.0);
    assert_eq!(counter(&manager, "Pipes", "PipesFailed"), 0.0);

    let source = factories.source("S1");
    let sink = factories.sink("K1");
    assert!(source.started.load(Ordering::SeqCst));

    for text in ["one", "two", "three"] {
        assert_eq!(source.emit(text).await, 1);
    }
    assert_eq!(sink.received(), vec!["one", "two", "three"]);

    manager.stop().await;

    // Links are severed: nothing reaches the sink any more
    assert_eq!(source.emit("late").await, 0);
    assert_eq!(sink.received().len(), 3);
    assert!(!source.started.load(Ordering::SeqCst));

    // Double stop is a no-op
    manager.stop().await;
}

// ============================================================================
// Typed pipe: source → pipe → sink
// ============================================================================

#[tokio::test]
async fn typed_pipe_transforms_payloads() {
    let factories = Arc::new(TestFactories::default());
    let provider = Arc::new(MemoryConfigProvider::new(config(json!({
        "Sources": [{"Id": "S1", "SourceType": "test"}],
        "Sinks": [{"Id": "K1", "SinkType": "capture"}],
        "Pipes": [{"SourceRef": "S1", "SinkRef": "K1", "Type": "uppercase"}]
    }))));
    let manager = build_manager(Arc::clone(&factories), provider);

    manager.start().await.unwrap();
    assert_eq!(counter(&manager, "Pipes", "PipesConnected"), 1.0);

    let source = factories.source("S1");
    source.emit("hello").await;
    source.emit("world").await;

    assert_eq!(factories.sink("K1").received(), vec!["HELLO", "WORLD"]);

    manager.stop().await;
}

// ============================================================================
// Data-pull coupling
// ============================================================================

#[tokio::test]
async fn data_pull_registers_without_subscription() {
    let factories = Arc::new(TestFactories::default());
    let provider = Arc::new(MemoryConfigProvider::new(config(json!({
        "Sources": [{"Id": "P1", "SourceType": "pull"}],
        "Sinks": [{"Id": "Q1", "SinkType": "pullsink"}],
        "Pipes": [{"SourceRef": "P1", "SinkRef": "Q1"}]
    }))));
    let manager = build_manager(Arc::clone(&factories), provider);

    manager.start().await.unwrap();

    assert_eq!(counter(&manager, "Pipes", "PipesConnected"), 1.0);
    let registered = factories.pull_sink("Q1").registered.lock().unwrap().clone();
    assert_eq!(registered.len(), 1);
    assert_eq!(registered[0].query()[0].value.value, 42.0);

    manager.stop().await;
}

// ============================================================================
// Bad entries are skipped, the rest binds
// ============================================================================

#[tokio::test]
async fn bad_entries_are_counted_not_fatal() {
    let factories = Arc::new(TestFactories::default());
    let provider = Arc::new(MemoryConfigProvider::new(config(json!({
        "Sources": [
            {"Id": "S1", "SourceType": "test"},
            {"Id": "S2", "SourceType": "no-such-type"},
            {"SourceType": "test"}
        ],
        "Sinks": [{"Id": "K1", "SinkType": "capture"}],
        "Pipes": [
            {"SourceRef": "S1"},
            {"SourceRef": "S1", "SinkRef": "unknown"},
            {"SourceRef": "S1", "SinkRef": "K1", "Type": "no-such-pipe"},
            {"SourceRef": "S1", "SinkRef": "K1"}
        ]
    }))));
    let manager = build_manager(Arc::clone(&factories), provider);

    manager.start().await.unwrap();

    assert_eq!(counter(&manager, "Sources", "SourcesStarted"), 1.0);
    assert_eq!(counter(&manager, "Sources", "SourcesFailed"), 2.0);
    assert_eq!(counter(&manager, "Pipes", "PipesConnected"), 1.0);
    assert_eq!(counter(&manager, "Pipes", "PipesFailed"), 3.0);

    // The good pipe still delivers
    factories.source("S1").emit("still works").await;
    assert_eq!(factories.sink("K1").received(), vec!["still works"]);

    manager.stop().await;
}

// ============================================================================
// Restart with unchanged configuration: same counters (idempotent outcome)
// ============================================================================

#[tokio::test]
async fn restart_reproduces_component_counts() {
    let factories = Arc::new(TestFactories::default());
    let provider = Arc::new(MemoryConfigProvider::new(config(json!({
        "Sources": [{"Id": "S1", "SourceType": "test"}],
        "Sinks": [{"Id": "K1", "SinkType": "capture"}],
        "Pipes": [{"SourceRef": "S1", "SinkRef": "K1"}]
    }))));
    let manager = build_manager(Arc::clone(&factories), provider);

    manager.start().await.unwrap();
    let first = (
        counter(&manager, "Sources", "SourcesStarted"),
        counter(&manager, "Sinks", "SinksStarted"),
        counter(&manager, "Pipes", "PipesConnected"),
    );
    manager.stop().await;

    manager.start().await.unwrap();
    let second = (
        counter(&manager, "Sources", "SourcesStarted"),
        counter(&manager, "Sinks", "SinksStarted"),
        counter(&manager, "Pipes", "PipesConnected"),
    );
    assert_eq!(first, second);

    // Fresh instances were constructed for the second cycle
    assert_eq!(factories.sources.lock().unwrap().len(), 2);

    manager.stop().await;
}

// ============================================================================
// Hot reload
// ============================================================================

#[tokio::test]
async fn reload_picks_up_changed_configuration() {
    let factories = Arc::new(TestFactories::default());
    let provider = Arc::new(MemoryConfigProvider::new(config(json!({
        "Sources": [{"Id": "S1", "SourceType": "test"}],
        "Sinks": [{"Id": "K1", "SinkType": "capture"}],
        "Pipes": [{"SourceRef": "S1", "SinkRef": "K1"}]
    }))));
    let manager = build_manager(Arc::clone(&factories), Arc::clone(&provider));
    manager.set_config_interval(Duration::from_millis(30));

    manager.start().await.unwrap();
    assert_eq!(counter(&manager, "Agent", "ConfigReloadCount"), 0.0);

    // Unchanged document: several ticks pass, zero reload cycles
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(counter(&manager, "Agent", "ConfigReloadCount"), 0.0);

    // Config B adds a second source
    provider.replace(config(json!({
        "Sources": [
            {"Id": "S1", "SourceType": "test"},
            {"Id": "S2", "SourceType": "test"}
        ],
        "Sinks": [{"Id": "K1", "SinkType": "capture"}],
        "Pipes": [{"SourceRef": "S1", "SinkRef": "K1"}]
    })));

    // Within a few watch ticks the new topology is live
    let mut reloaded = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(30)).await;
        if counter(&manager, "Agent", "ConfigReloadCount") == 1.0 {
            reloaded = true;
            break;
        }
    }
    assert!(reloaded, "reload never happened");

    assert_eq!(counter(&manager, "Sources", "SourcesStarted"), 2.0);
    let manifest = manager.manifest().await.unwrap();
    let ids: Vec<&str> = manifest.sources.iter().map(|s| s.id.as_str()).collect();
    assert!(ids.contains(&"S1") && ids.contains(&"S2"));

    // Exactly one cycle per change
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(counter(&manager, "Agent", "ConfigReloadCount"), 1.0);

    manager.stop().await;
}

// ============================================================================
// Telemetry redirect pipe
// ============================================================================

#[tokio::test]
async fn telemetry_redirect_connects_connector_to_sink() {
    let factories = Arc::new(TestFactories::default());
    let connector = Arc::new(TestSource::new("_telemetry"));
    let provider = Arc::new(MemoryConfigProvider::new(config(json!({
        "Sinks": [{"Id": "K1", "SinkType": "capture"}],
        "Telemetrics": {"RedirectToSinkId": "K1"}
    }))));
    let manager = AgentBuilder::new()
        .config_provider(provider)
        .factory_provider(Arc::clone(&factories) as Arc<dyn FactoryProvider>)
        .telemetry_connector(Arc::clone(&connector) as Arc<dyn Source>)
        .build()
        .unwrap();

    manager.start().await.unwrap();
    assert_eq!(counter(&manager, "Pipes", "PipesConnected"), 1.0);

    connector.emit("telemetry event").await;
    assert_eq!(factories.sink("K1").received(), vec!["telemetry event"]);

    manager.stop().await;
}

#[tokio::test]
async fn telemetry_redirect_without_connector_counts_failure() {
    let factories = Arc::new(TestFactories::default());
    let provider = Arc::new(MemoryConfigProvider::new(config(json!({
        "Sinks": [{"Id": "K1", "SinkType": "capture"}],
        "Telemetrics": {"RedirectToSinkId": "K1"}
    }))));
    let manager = build_manager(factories, provider);

    manager.start().await.unwrap();
    assert_eq!(counter(&manager, "Pipes", "PipesFailed"), 1.0);

    manager.stop().await;
}

// ============================================================================
// Built-in sink subscribed to self-metrics
// ============================================================================

#[tokio::test]
async fn builtin_sink_receives_self_metrics_snapshots() {
    let factories = Arc::new(TestFactories::with_builtin());
    let provider = Arc::new(MemoryConfigProvider::new(config(json!({
        "Sinks": [{"Id": "K1", "SinkType": "capture"}]
    }))));
    let manager = AgentBuilder::new()
        .config_provider(provider)
        .factory_provider(Arc::clone(&factories) as Arc<dyn FactoryProvider>)
        .metrics_interval(Duration::from_millis(40))
        .build()
        .unwrap();

    manager.start().await.unwrap();

    // Built-in perf-counter sink plus the declared capture sink
    assert_eq!(counter(&manager, "Sinks", "SinksStarted"), 2.0);

    tokio::time::sleep(Duration::from_millis(200)).await;
    let metric_sink = factories.metric_sinks.lock().unwrap()[0].clone();
    let batches = metric_sink.batches.lock().unwrap().clone();
    assert!(!batches.is_empty(), "no self-metrics snapshots delivered");
    assert!(batches.iter().all(|len| *len > 0));

    manager.stop().await;
}

// ============================================================================
// Manifest
// ============================================================================

#[tokio::test]
async fn manifest_reflects_running_topology() {
    let factories = Arc::new(TestFactories::default());
    let provider = Arc::new(MemoryConfigProvider::new(config(json!({
        "Sources": [{"Id": "S1", "SourceType": "test"}],
        "Sinks": [{"Id": "K1", "SinkType": "capture"}],
        "Pipes": [{"SourceRef": "S1", "SinkRef": "K1"}]
    }))));
    let manager = build_manager(factories, provider);

    assert!(manager.manifest().await.is_none());

    manager.start().await.unwrap();
    let manifest = manager.manifest().await.unwrap();
    assert_eq!(manifest.pipes_connected, 1);
    assert!(manifest
        .sources
        .iter()
        .any(|s| s.id == virta_agent::SELF_METRICS_ID));
    assert!(manifest.sinks.iter().any(|s| s.id == "K1"));

    manager.stop().await;
    assert!(manager.manifest().await.is_none());
    assert!(!manager.is_running().await);
}
