//! VIRTA - host agent runtime
//!
//! Library for building long-running host agents that collect events
//! (log files, OS event logs, tracing providers, metrics) and forward
//! them to remote ingestion services. Topology IS configuration: a
//! declarative document names sources, pipes, and sinks, and the
//! lifecycle manager wires them into a live pipeline.
//!
//! # Pluggable dataflow
//!
//! ```text
//! Sources ──► Pipes ──► Sinks
//!     ▲                   │
//!     └── self-metrics ───┘
//! ```
//!
//! All component kinds are pluggable via traits and factory catalogs.
//! Concrete sources, sinks, and remote-service transports live in their
//! own crates; this crate provides the fabric that loads, binds, starts,
//! stops, and hot-reloads them, plus the reliable upload engine metrics
//! sinks are built on.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod binder;
pub mod catalog;
pub mod component;
pub mod config;
pub mod context;
pub mod error;
pub mod manager;
pub mod manifest;
pub mod network;
pub mod params;
pub mod reliable;
pub mod self_metrics;
pub mod subscription;

pub use binder::{BindOutcome, PipelineBinder};
pub use catalog::{load_factories, Factory, FactoryCatalog, FactoryCatalogs, FactoryProvider};
pub use component::{
    CredentialProvider, DataSink, DataSource, EventSink, EventSource, GenericPlugin, Pipe,
    RecordParser, Sink, Source,
};
pub use config::{AgentConfig, ConfigProvider, MemoryConfigProvider};
pub use context::{ContextData, CredentialRegistry, ParserCatalogView, PluginContext};
pub use error::{AgentError, Result};
pub use manager::{AgentBuilder, AgentManager, PackageUpdater, DEFAULT_CONFIG_INTERVAL};
pub use manifest::AgentManifest;
pub use network::NetworkStatusProvider;
pub use params::{MemoryParameterStore, ParameterStore};
pub use reliable::{
    sum_aggregator, Aggregator, MetricsBatch, MetricsTransport, ReliableMetricsSink, RetryConfig,
    RetryEngine, SendError, RETRY_QUEUE_LIMIT,
};
pub use self_metrics::{MetricsPublisher, SelfMetricsSource, SELF_METRICS_ID};
pub use subscription::{EventBus, Subscription};

// Re-export the core types alongside the runtime
pub use virta_core::{
    CounterType, Envelope, Metric, MetricKey, MetricUnit, MetricValue, Payload, PayloadKind,
    PluginError,
};
