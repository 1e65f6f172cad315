//! Lifecycle manager - loads, starts, stops, and reloads the pipeline
//!
//! The manager owns the whole dataflow fabric: it builds the factory
//! catalogs, constructs components from configuration sections, binds
//! pipes, and tears everything down in dependency order. It is
//! single-writer: `start`, `stop`, and reload all run under one state
//! lock, so a reload can never observe a half-built pipeline.
//!
//! Load order is part of the contract:
//!
//! 1.  self-metrics source (reserved id, always present)
//! 2.  factory catalogs for all kinds
//! 3.  credential providers (`Credentials`)
//! 4.  built-in sinks, subscribed to self-metrics
//! 5.  user sinks (`Sinks`), constructed and started
//! 6.  user sources (`Sources`), constructed but not started
//! 7.  pipe binding (`Pipes`) and the telemetry redirect
//! 8.  source start
//! 9.  self-update timer (`SelfUpdate` > 0)
//! 10. config-watch timer
//! 11. generic plugins (`Plugins`), network-status registration
//!
//! Per-entry failures are logged, counted, and skipped; only a
//! configuration document that cannot be loaded at all is fatal. The
//! agent prioritizes staying alive over delivering any one batch.

use crate::binder::PipelineBinder;
use crate::catalog::{load_factories, FactoryCatalogs, FactoryProvider};
use crate::component::{EventSource, GenericPlugin, Pipe, Sink, Source};
use crate::config::{config_keys, section_str, section_u64, ConfigProvider};
use crate::context::{context_keys, ContextData, CredentialRegistry, ParserCatalogView, PluginContext};
use crate::error::AgentError;
use crate::manifest::{AgentManifest, ComponentDesc};
use crate::network;
use crate::params::{parameter_keys, MemoryParameterStore, ParameterStore};
use crate::reliable::rand_jitter;
use crate::self_metrics::{counters, MetricsPublisher, SelfMetricsSource, SELF_METRICS_ID};
use crate::subscription::Subscription;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Span};
use virta_core::{CounterType, MetricKey, MetricValue, PluginError};

/// Default config-watch interval
pub const DEFAULT_CONFIG_INTERVAL: Duration = Duration::from_secs(10);

/// Default self-metrics emission interval
pub const DEFAULT_METRICS_INTERVAL: Duration = Duration::from_secs(60);

/// Stop cap for sources and subscriptions
const SOURCE_STOP_TIMEOUT: Duration = Duration::from_secs(300);

/// Stop cap for sinks, pipes, and plugins; always awaited because sinks
/// flush buffered state
const SINK_STOP_TIMEOUT: Duration = Duration::from_secs(600);

/// Factory type names of the built-in sinks
pub mod builtin_types {
    /// OS performance-counter sink
    pub const PERFORMANCE_COUNTER_SINK: &str = "performancecounter";
    /// Usage telemetry sink
    pub const TELEMETRY_SINK: &str = "telemetrics";
}

/// Platform-native package manager invoked by the self-update timer
#[async_trait]
pub trait PackageUpdater: Send + Sync {
    /// Check for a newer agent package and install it if found
    async fn check_and_update(&self) -> Result<(), PluginError>;
}

/// Everything owned by one load cycle
#[derive(Default)]
struct PipelineState {
    running: bool,
    credentials: Arc<CredentialRegistry>,
    sources: HashMap<String, Arc<dyn Source>>,
    sinks: HashMap<String, Arc<dyn Sink>>,
    pipes: Vec<Arc<dyn Pipe>>,
    plugins: Vec<Arc<dyn GenericPlugin>>,
    subscriptions: Vec<Subscription>,
    timers: Vec<watch::Sender<bool>>,
    manifest: Option<Arc<AgentManifest>>,
}

/// Builder for [`AgentManager`]
pub struct AgentBuilder {
    config_provider: Option<Arc<dyn ConfigProvider>>,
    factory_providers: Vec<Arc<dyn FactoryProvider>>,
    parameters: Arc<dyn ParameterStore>,
    updater: Option<Arc<dyn PackageUpdater>>,
    telemetry_connector: Option<Arc<dyn Source>>,
    config_interval: Duration,
    metrics_interval: Duration,
    config_dir: Option<String>,
    log_config_path: Option<String>,
    build_number: u64,
}

impl AgentBuilder {
    /// Create a builder with defaults
    pub fn new() -> Self {
        Self {
            config_provider: None,
            factory_providers: Vec::new(),
            parameters: Arc::new(MemoryParameterStore::new()),
            updater: None,
            telemetry_connector: None,
            config_interval: DEFAULT_CONFIG_INTERVAL,
            metrics_interval: DEFAULT_METRICS_INTERVAL,
            config_dir: None,
            log_config_path: None,
            build_number: 0,
        }
    }

    /// Set the configuration provider (required)
    pub fn config_provider(mut self, provider: Arc<dyn ConfigProvider>) -> Self {
        self.config_provider = Some(provider);
        self
    }

    /// Add a factory provider discovered from the plugin search path
    pub fn factory_provider(mut self, provider: Arc<dyn FactoryProvider>) -> Self {
        self.factory_providers.push(provider);
        self
    }

    /// Replace the default in-memory parameter store
    pub fn parameter_store(mut self, store: Arc<dyn ParameterStore>) -> Self {
        self.parameters = store;
        self
    }

    /// Install the self-update collaborator
    pub fn package_updater(mut self, updater: Arc<dyn PackageUpdater>) -> Self {
        self.updater = Some(updater);
        self
    }

    /// Install the telemetry connector source used by the redirect pipe
    pub fn telemetry_connector(mut self, connector: Arc<dyn Source>) -> Self {
        self.telemetry_connector = Some(connector);
        self
    }

    /// Set the config-watch interval
    pub fn config_interval(mut self, interval: Duration) -> Self {
        self.config_interval = interval;
        self
    }

    /// Set the default self-metrics emission interval
    pub fn metrics_interval(mut self, interval: Duration) -> Self {
        self.metrics_interval = interval;
        self
    }

    /// Record the configuration directory parameter
    pub fn config_dir(mut self, dir: impl Into<String>) -> Self {
        self.config_dir = Some(dir.into());
        self
    }

    /// Record the structured-log config path parameter
    pub fn log_config_path(mut self, path: impl Into<String>) -> Self {
        self.log_config_path = Some(path.into());
        self
    }

    /// Set the build number published to self-metrics
    pub fn build_number(mut self, build: u64) -> Self {
        self.build_number = build;
        self
    }

    /// Build the manager
    pub fn build(self) -> Result<Arc<AgentManager>, AgentError> {
        let config_provider = self
            .config_provider
            .ok_or_else(|| AgentError::Config("no configuration provider installed".into()))?;

        let publisher = Arc::new(MetricsPublisher::new());
        let self_metrics = Arc::new(SelfMetricsSource::new(Arc::clone(&publisher)));

        Ok(Arc::new_cyclic(|weak| AgentManager {
            self_handle: weak.clone(),
            config_provider,
            factory_providers: self.factory_providers,
            parameters: self.parameters,
            updater: self.updater,
            telemetry_connector: self.telemetry_connector,
            config_interval_ms: AtomicU64::new(self.config_interval.as_millis() as u64),
            metrics_interval: self.metrics_interval,
            config_dir: self.config_dir,
            log_config_path: self.log_config_path,
            build_number: self.build_number,
            publisher,
            self_metrics,
            logger: tracing::info_span!("agent_manager"),
            state: tokio::sync::Mutex::new(PipelineState::default()),
            config_load_time: parking_lot::Mutex::new(None),
        }))
    }
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// The agent lifecycle manager
///
/// Exposes `start`, `stop`, `stop_with(service_stopping)`, and a settable
/// config-watch interval; everything else happens on the manager's own
/// timers.
pub struct AgentManager {
    self_handle: Weak<AgentManager>,
    config_provider: Arc<dyn ConfigProvider>,
    factory_providers: Vec<Arc<dyn FactoryProvider>>,
    parameters: Arc<dyn ParameterStore>,
    updater: Option<Arc<dyn PackageUpdater>>,
    telemetry_connector: Option<Arc<dyn Source>>,
    config_interval_ms: AtomicU64,
    metrics_interval: Duration,
    config_dir: Option<String>,
    log_config_path: Option<String>,
    build_number: u64,
    publisher: Arc<MetricsPublisher>,
    self_metrics: Arc<SelfMetricsSource>,
    logger: Span,
    state: tokio::sync::Mutex<PipelineState>,
    config_load_time: parking_lot::Mutex<Option<DateTime<Utc>>>,
}

impl AgentManager {
    /// Load the topology and start the pipeline
    ///
    /// Only a configuration document that cannot be loaded propagates an
    /// error; every per-component failure is contained and counted.
    pub async fn start(&self) -> Result<(), AgentError> {
        let mut state = self.state.lock().await;
        if state.running {
            warn!("start ignored: pipeline already running");
            return Ok(());
        }
        self.start_inner(&mut state).await
    }

    /// Stop the pipeline; never fails, double-stop is a no-op
    pub async fn stop(&self) {
        self.stop_with(false).await;
    }

    /// Stop the pipeline
    ///
    /// With `service_stopping` the manager skips awaiting sources and
    /// subscriptions (fire-and-forget) but still awaits sinks: service
    /// stop grace time is spent on flushing buffered data, not on source
    /// shutdown.
    pub async fn stop_with(&self, service_stopping: bool) {
        let mut state = self.state.lock().await;
        self.stop_inner(&mut state, service_stopping).await;
    }

    /// Change the config-watch interval; takes effect on the next tick
    pub fn set_config_interval(&self, interval: Duration) {
        self.config_interval_ms
            .store(interval.as_millis() as u64, Ordering::Relaxed);
    }

    /// The shared self-metrics publisher
    pub fn metrics(&self) -> &Arc<MetricsPublisher> {
        &self.publisher
    }

    /// The reserved self-metrics source
    pub fn self_metrics(&self) -> &Arc<SelfMetricsSource> {
        &self.self_metrics
    }

    /// Whether a pipeline is currently running
    pub async fn is_running(&self) -> bool {
        self.state.lock().await.running
    }

    /// The current topology manifest, if a pipeline is running
    pub async fn manifest(&self) -> Option<Arc<AgentManifest>> {
        self.state.lock().await.manifest.clone()
    }

    // ────────────────────────────────────────────────────────────────────
    // Load
    // ────────────────────────────────────────────────────────────────────

    async fn start_inner(&self, state: &mut PipelineState) -> Result<(), AgentError> {
        // Conventional parameter-store keys
        if let Some(dir) = &self.config_dir {
            self.parameters.set(parameter_keys::CONFIG_DIR, dir.clone());
        }
        if let Some(path) = &self.log_config_path {
            self.parameters
                .set(parameter_keys::LOG_CONFIG_PATH, path.clone());
        }

        // The only fatal step: without a document there is nothing to run
        let config = self.config_provider.load()?;

        // 1. Self-metrics source under its reserved id
        let metrics_interval = config
            .metrics()
            .and_then(|m| section_u64(m, config_keys::INTERVAL_SECS))
            .map(Duration::from_secs)
            .unwrap_or(self.metrics_interval);
        self.self_metrics.set_interval(metrics_interval);
        if let Err(e) = self.self_metrics.start().await {
            warn!(error = %e, "self-metrics source failed to start");
        }
        state.sources.insert(
            SELF_METRICS_ID.to_string(),
            Arc::clone(&self.self_metrics) as Arc<dyn Source>,
        );

        // 2. Factory catalogs
        let mut catalogs = FactoryCatalogs::new();
        let (factories_loaded, factories_failed) =
            load_factories(&self.factory_providers, &mut catalogs);
        self.publisher.publish(
            "",
            "Factories",
            CounterType::CurrentValue,
            &[
                (counters::FACTORIES_LOADED, factories_loaded as f64),
                (counters::FACTORIES_FAILED, factories_failed as f64),
            ],
        );
        for (kind, registered) in [
            ("source", catalogs.sources.len()),
            ("sink", catalogs.sinks.len()),
            ("pipe", catalogs.pipes.len()),
            ("credential", catalogs.credentials.len()),
            ("plugin", catalogs.plugins.len()),
            ("parser", catalogs.parsers.len()),
        ] {
            self.publisher.publish_value(
                MetricKey::new(counters::FACTORIES_REGISTERED, "Factories")
                    .with_dimension("kind", kind),
                MetricValue::count(registered as f64, CounterType::CurrentValue),
            );
        }

        // 3. Credential providers
        let credentials = self.load_credentials(&config, &catalogs);
        state.credentials = Arc::clone(&credentials);

        let parsers = Arc::new(ParserCatalogView::new(catalogs.parsers.clone()));
        let make_context = |section: &Map<String, Value>| -> PluginContext {
            let mut ctx = PluginContext::new(
                section.clone(),
                &self.logger,
                Arc::clone(&self.publisher),
                Arc::clone(&credentials),
                Arc::clone(&self.parameters),
            );
            ctx.set_data(
                context_keys::PARSERS,
                ContextData::Parsers(Arc::clone(&parsers)),
            );
            ctx
        };

        let mut sinks_started = 0u64;
        let mut sinks_failed = 0u64;

        // 4. Built-in sinks, subscribed to the self-metrics source
        let telemetry_off = config
            .telemetrics()
            .and_then(|t| section_str(t, config_keys::OFF))
            == Some("true");
        let mut builtin_sections: Vec<(&str, Map<String, Value>)> = Vec::new();
        builtin_sections.push((
            builtin_types::PERFORMANCE_COUNTER_SINK,
            config.performance_counter().cloned().unwrap_or_default(),
        ));
        if !telemetry_off {
            builtin_sections.push((
                builtin_types::TELEMETRY_SINK,
                config.telemetrics().cloned().unwrap_or_default(),
            ));
        }
        for (type_name, section) in builtin_sections {
            let Some(factory) = catalogs.sinks.get(type_name) else {
                continue; // built-in factories are optional
            };
            let ctx = make_context(&section);
            match factory(type_name, &ctx) {
                Ok(sink) => {
                    if let Err(e) = sink.start().await {
                        warn!(sink = type_name, error = %e, "built-in sink failed to start");
                        sinks_failed += 1;
                        continue;
                    }
                    self.subscribe_to_self_metrics(&sink, state);
                    state.sinks.insert(sink.id().to_string(), sink);
                    sinks_started += 1;
                }
                Err(e) => {
                    warn!(sink = type_name, error = %e, "built-in sink failed to construct");
                    sinks_failed += 1;
                }
            }
        }

        // 5. User sinks: constructed and started
        for section in config.sinks() {
            let built = self
                .build_sink(section, &catalogs, &make_context, &state.sinks)
                .await;
            match built {
                Ok(sink) => {
                    state.sinks.insert(sink.id().to_string(), sink);
                    sinks_started += 1;
                }
                Err(e) => {
                    warn!(error = %e, "sink entry skipped");
                    sinks_failed += 1;
                }
            }
        }

        // 6. User sources: constructed but not started until pipes exist
        let mut sources_failed = 0u64;
        for section in config.sources() {
            let built = self.build_source(section, &catalogs, &make_context, &state.sources);
            match built {
                Ok((id, source)) => {
                    state.sources.insert(id, source);
                }
                Err(e) => {
                    warn!(error = %e, "source entry skipped");
                    sources_failed += 1;
                }
            }
        }

        // The telemetry connector only participates when a redirect is set
        let telemetry_redirect = config
            .telemetrics()
            .and_then(|t| section_str(t, config_keys::REDIRECT_TO_SINK_ID))
            .map(str::to_string);
        if telemetry_redirect.is_some() {
            if let Some(connector) = &self.telemetry_connector {
                state
                    .sources
                    .insert(connector.id().to_string(), Arc::clone(connector));
            }
        }

        // 7. Pipe binding
        let binder = PipelineBinder {
            sources: &state.sources,
            sinks: &state.sinks,
            pipe_factories: &catalogs.pipes,
        };
        let outcome = binder.bind(&config.pipes(), &make_context).await;
        let mut pipes_connected = outcome.connected;
        let mut pipes_failed = outcome.failed;
        state.subscriptions.extend(outcome.subscriptions);
        state.pipes.extend(outcome.pipes);

        // Reserved telemetry pipe: connector → redirect sink. Connect
        // errors count as failures like any other pipe entry.
        if let Some(redirect) = telemetry_redirect {
            match self.connect_telemetry(&redirect, &state.sinks) {
                Ok(subscription) => {
                    state.subscriptions.push(subscription);
                    pipes_connected += 1;
                }
                Err(e) => {
                    warn!(error = %e, "telemetry redirect failed");
                    pipes_failed += 1;
                }
            }
        }

        // 8. Start sources (the reserved source is already running)
        let mut sources_started = 0u64;
        for (id, source) in &state.sources {
            if id == SELF_METRICS_ID {
                continue;
            }
            match source.start().await {
                Ok(()) => {
                    debug!(id = %id, "source started");
                    sources_started += 1;
                }
                Err(e) => {
                    warn!(id = %id, error = %e, "source failed to start");
                    sources_failed += 1;
                }
            }
        }

        // 9. Self-update timer
        let self_update_minutes = config.self_update_minutes();
        if self_update_minutes > 0 && self.updater.is_some() {
            self.arm_self_update(state, self_update_minutes);
        }
        self.publisher.publish(
            "",
            "Agent",
            CounterType::CurrentValue,
            &[
                (counters::SELF_UPDATE_FREQUENCY, self_update_minutes as f64),
                (counters::BUILD_NUMBER, self.build_number as f64),
            ],
        );

        // 10. Config-watch timer
        self.arm_config_watch(state);

        // 11. Generic plugins
        let mut plugins_started = 0u64;
        let mut plugins_failed = 0u64;
        for section in config.plugins() {
            let Some(type_name) = section_str(section, config_keys::TYPE) else {
                warn!("plugin entry has no Type");
                plugins_failed += 1;
                continue;
            };
            let Some(factory) = catalogs.plugins.get(type_name) else {
                warn!(plugin = type_name, "unknown plugin type");
                plugins_failed += 1;
                continue;
            };
            let ctx = make_context(section);
            match factory(type_name, &ctx) {
                Ok(plugin) => {
                    let started = plugin.start().await;
                    match started {
                        Ok(()) => {
                            if let Some(status) = plugin.as_network_status() {
                                network::register(status);
                            }
                            state.plugins.push(plugin);
                            plugins_started += 1;
                        }
                        Err(e) => {
                            warn!(plugin = type_name, error = %e, "plugin failed to start");
                            plugins_failed += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(plugin = type_name, error = %e, "plugin failed to construct");
                    plugins_failed += 1;
                }
            }
        }

        // Per-load component counters are gauges: the same configuration
        // always yields the same values, reload after reload.
        self.publisher.publish(
            "",
            "Sources",
            CounterType::CurrentValue,
            &[
                (counters::SOURCES_STARTED, sources_started as f64),
                (counters::SOURCES_FAILED, sources_failed as f64),
            ],
        );
        self.publisher.publish(
            "",
            "Sinks",
            CounterType::CurrentValue,
            &[
                (counters::SINKS_STARTED, sinks_started as f64),
                (counters::SINKS_FAILED, sinks_failed as f64),
            ],
        );
        self.publisher.publish(
            "",
            "Pipes",
            CounterType::CurrentValue,
            &[
                (counters::PIPES_CONNECTED, pipes_connected as f64),
                (counters::PIPES_FAILED, pipes_failed as f64),
            ],
        );
        self.publisher.publish(
            "",
            "Plugins",
            CounterType::CurrentValue,
            &[
                (counters::PLUGINS_STARTED, plugins_started as f64),
                (counters::PLUGINS_FAILED, plugins_failed as f64),
            ],
        );

        let mut sources_desc: Vec<ComponentDesc> = state
            .sources
            .keys()
            .map(|id| ComponentDesc {
                id: id.clone(),
                kind: "source".to_string(),
            })
            .collect();
        sources_desc.sort_by(|a, b| a.id.cmp(&b.id));
        let mut sinks_desc: Vec<ComponentDesc> = state
            .sinks
            .keys()
            .map(|id| ComponentDesc {
                id: id.clone(),
                kind: "sink".to_string(),
            })
            .collect();
        sinks_desc.sort_by(|a, b| a.id.cmp(&b.id));
        state.manifest = Some(Arc::new(AgentManifest {
            version: "1".to_string(),
            sources: sources_desc,
            sinks: sinks_desc,
            pipes_connected,
            pipes_failed,
            plugins: state.plugins.len(),
            credential_providers: state.credentials.len(),
        }));

        *self.config_load_time.lock() = Some(Utc::now());
        state.running = true;

        info!(
            sources = sources_started,
            sinks = sinks_started,
            pipes = pipes_connected,
            plugins = plugins_started,
            "pipeline started"
        );
        Ok(())
    }

    fn load_credentials(
        &self,
        config: &crate::config::AgentConfig,
        catalogs: &FactoryCatalogs,
    ) -> Arc<CredentialRegistry> {
        let mut registry = CredentialRegistry::new();
        // Credential factories see an empty registry view; providers
        // cannot depend on each other.
        let empty = Arc::new(CredentialRegistry::new());
        for section in config.credentials() {
            let Some(type_name) = section_str(section, config_keys::CREDENTIAL_TYPE) else {
                warn!("credential entry has no CredentialType");
                continue;
            };
            let Some(factory) = catalogs.credentials.get(type_name) else {
                warn!(credential = type_name, "unknown credential type");
                continue;
            };
            let ctx = PluginContext::new(
                section.clone(),
                &self.logger,
                Arc::clone(&self.publisher),
                Arc::clone(&empty),
                Arc::clone(&self.parameters),
            );
            match factory(type_name, &ctx) {
                Ok(provider) => {
                    if !registry.insert(provider) {
                        warn!(credential = type_name, "duplicate credential provider id");
                    }
                }
                Err(e) => {
                    warn!(credential = type_name, error = %e, "credential provider failed");
                }
            }
        }
        Arc::new(registry)
    }

    async fn build_sink(
        &self,
        section: &Map<String, Value>,
        catalogs: &FactoryCatalogs,
        make_context: &(dyn Fn(&Map<String, Value>) -> PluginContext + Sync),
        existing: &HashMap<String, Arc<dyn Sink>>,
    ) -> Result<Arc<dyn Sink>, PluginError> {
        let id = section_str(section, config_keys::ID)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| PluginError::Config("sink entry has no Id".into()))?;
        if existing.contains_key(id) {
            return Err(PluginError::Config(format!("duplicate sink id '{id}'")));
        }
        let type_name = section_str(section, config_keys::SINK_TYPE)
            .ok_or_else(|| PluginError::Config(format!("sink '{id}' has no SinkType")))?;
        let factory = catalogs
            .sinks
            .get(type_name)
            .ok_or_else(|| PluginError::Config(format!("unknown sink type '{type_name}'")))?;

        let ctx = make_context(section);
        let sink = factory(type_name, &ctx)?;
        sink.start().await?;
        debug!(id = %id, sink = type_name, "sink started");
        Ok(sink)
    }

    fn build_source(
        &self,
        section: &Map<String, Value>,
        catalogs: &FactoryCatalogs,
        make_context: &(dyn Fn(&Map<String, Value>) -> PluginContext + Sync),
        existing: &HashMap<String, Arc<dyn Source>>,
    ) -> Result<(String, Arc<dyn Source>), PluginError> {
        let id = section_str(section, config_keys::ID)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| PluginError::Config("source entry has no Id".into()))?;
        if existing.contains_key(id) {
            return Err(PluginError::Config(format!("duplicate source id '{id}'")));
        }
        let type_name = section_str(section, config_keys::SOURCE_TYPE)
            .ok_or_else(|| PluginError::Config(format!("source '{id}' has no SourceType")))?;
        let factory = catalogs
            .sources
            .get(type_name)
            .ok_or_else(|| PluginError::Config(format!("unknown source type '{type_name}'")))?;

        let ctx = make_context(section);
        let source = factory(type_name, &ctx)?;
        debug!(id = %id, source = type_name, "source constructed");
        Ok((id.to_string(), source))
    }

    /// Wire a built-in sink to the self-metrics source, whichever
    /// capability it offers
    fn subscribe_to_self_metrics(&self, sink: &Arc<dyn Sink>, state: &mut PipelineState) {
        if let Some(event_sink) = Arc::clone(sink).as_event_sink() {
            state
                .subscriptions
                .push(self.self_metrics.subscribe(event_sink));
        } else if let Some(data_sink) = sink.as_data_sink() {
            if let Some(data_source) =
                Arc::clone(&self.self_metrics).as_data_source()
            {
                data_sink.register_data_source(data_source);
            }
        } else {
            warn!(id = sink.id(), "built-in sink has no usable capability");
        }
    }

    fn connect_telemetry(
        &self,
        redirect: &str,
        sinks: &HashMap<String, Arc<dyn Sink>>,
    ) -> Result<Subscription, PluginError> {
        let connector = self.telemetry_connector.as_ref().ok_or_else(|| {
            PluginError::Config("no telemetry connector installed".into())
        })?;
        let event_source = connector.as_event_source().ok_or_else(|| {
            PluginError::Config("telemetry connector is not an event source".into())
        })?;
        let sink = sinks.get(redirect).ok_or_else(|| {
            PluginError::Config(format!("unknown telemetry redirect sink '{redirect}'"))
        })?;
        let event_sink = Arc::clone(sink).as_event_sink().ok_or_else(|| {
            PluginError::Config(format!(
                "telemetry redirect sink '{redirect}' is not an event sink"
            ))
        })?;
        Ok(event_source.subscribe(event_sink))
    }

    // ────────────────────────────────────────────────────────────────────
    // Stop
    // ────────────────────────────────────────────────────────────────────

    async fn stop_inner(&self, state: &mut PipelineState, service_stopping: bool) {
        if !state.running {
            debug!("stop ignored: pipeline not running");
            return;
        }
        state.running = false;
        info!(service_stopping, "stopping pipeline");

        // 1. Disarm timers; the tasks observe the signal and exit
        for timer in state.timers.drain(..) {
            let _ = timer.send(true);
        }

        // 2. Sources, concurrently with per-source error capture
        let mut source_stops: Vec<(String, JoinHandle<Result<(), PluginError>>)> = Vec::new();
        for (id, source) in state.sources.drain() {
            source_stops.push((id, tokio::spawn(async move { source.stop().await })));
        }
        if service_stopping {
            // Fire-and-forget: grace time goes to sink flushing instead
            debug!(count = source_stops.len(), "source stops detached");
        } else {
            join_stops(source_stops, SOURCE_STOP_TIMEOUT, "source").await;
        }

        // 3. Subscriptions: dropping the tokens severs the links
        state.subscriptions.clear();

        // 4. Sinks, pipes, and plugins; always awaited so sinks can flush
        let mut sink_stops: Vec<(String, JoinHandle<Result<(), PluginError>>)> = Vec::new();
        for pipe in state.pipes.drain(..) {
            let id = pipe.id().to_string();
            sink_stops.push((id, tokio::spawn(async move { pipe.stop().await })));
        }
        for (id, sink) in state.sinks.drain() {
            sink_stops.push((id, tokio::spawn(async move { sink.stop().await })));
        }
        for plugin in state.plugins.drain(..) {
            let id = plugin.name().to_string();
            sink_stops.push((id, tokio::spawn(async move { plugin.stop().await })));
        }
        join_stops(sink_stops, SINK_STOP_TIMEOUT, "sink").await;

        // 5. Process-wide teardown
        network::reset();
        state.credentials = Arc::new(CredentialRegistry::new());
        state.manifest = None;

        info!("pipeline stopped");
    }

    // ────────────────────────────────────────────────────────────────────
    // Timers
    // ────────────────────────────────────────────────────────────────────

    /// Stop and restart the pipeline under one state-lock hold
    async fn reload_cycle(&self) {
        let mut state = self.state.lock().await;
        self.stop_inner(&mut state, false).await;
        match self.start_inner(&mut state).await {
            Ok(()) => {
                self.publisher.publish(
                    "",
                    "Agent",
                    CounterType::Increment,
                    &[(counters::CONFIG_RELOAD_COUNT, 1.0)],
                );
                info!("configuration reloaded");
            }
            Err(e) => {
                self.publisher.publish(
                    "",
                    "Agent",
                    CounterType::Increment,
                    &[(counters::CONFIG_RELOAD_FAILED_COUNT, 1.0)],
                );
                error!(error = %e, "configuration reload failed, pipeline left stopped");
                // Keep watching so the next good document recovers the agent
                self.arm_config_watch(&mut state);
            }
        }
    }

    /// Arm the periodic config-change check
    ///
    /// The watcher compares the provider's modification time against the
    /// last load time and runs one full stop/start cycle when strictly
    /// newer. The task re-arms itself through the reload (which calls
    /// this method again), so reload cycles never overlap.
    fn arm_config_watch(&self, state: &mut PipelineState) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let weak = self.self_handle.clone();
        tokio::spawn(async move {
            loop {
                let Some(manager) = weak.upgrade() else { break };
                let interval =
                    Duration::from_millis(manager.config_interval_ms.load(Ordering::Relaxed));
                drop(manager);
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        let Some(manager) = weak.upgrade() else { break };
                        let load_time = *manager.config_load_time.lock();
                        let modified = manager.config_provider.modified_at();
                        if let (Some(load_time), Some(modified)) = (load_time, modified) {
                            if modified > load_time {
                                info!("configuration change detected");
                                manager.reload_cycle().await;
                                break; // the reload armed a fresh watcher
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        state.timers.push(shutdown_tx);
    }

    /// Arm the self-update timer with a randomized initial due time
    ///
    /// The first invocation lands uniformly within one interval to
    /// de-synchronize fleets updating from the same package repository.
    fn arm_self_update(&self, state: &mut PipelineState, minutes: u64) {
        let Some(updater) = self.updater.clone() else {
            return;
        };
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let interval = Duration::from_secs(minutes.saturating_mul(60));
        tokio::spawn(async move {
            let initial = interval.mul_f64(rand_jitter());
            tokio::select! {
                _ = tokio::time::sleep(initial) => {}
                _ = shutdown_rx.changed() => return,
            }
            loop {
                if let Err(e) = updater.check_and_update().await {
                    warn!(error = %e, "self-update check failed");
                }
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown_rx.changed() => break,
                }
            }
        });
        state.timers.push(shutdown_tx);
    }
}

/// Await a fan-out of stop tasks under one shared deadline
///
/// Every failure is logged and suppressed; on deadline the remaining
/// tasks are left to finish on their own (the manager proceeds, it does
/// not force-kill).
async fn join_stops(
    handles: Vec<(String, JoinHandle<Result<(), PluginError>>)>,
    cap: Duration,
    what: &str,
) {
    let deadline = tokio::time::Instant::now() + cap;
    for (id, handle) in handles {
        match tokio::time::timeout_at(deadline, handle).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(id = %id, error = %e, "{} stop failed", what),
            Ok(Err(e)) => warn!(id = %id, error = %e, "{} stop task panicked", what),
            Err(_) => warn!(id = %id, "{} stop timed out", what),
        }
    }
}
