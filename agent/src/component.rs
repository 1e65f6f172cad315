//! Component capability traits
//!
//! Virta components expose a small common surface ({id, start, stop}) plus
//! at most one data-plane capability per side:
//!
//! ```text
//! Source ──┬─ EventSource (push: subscribe/publish envelopes)
//!          └─ DataSource  (pull: query current metrics)
//!
//! Sink ────┬─ EventSink   (push: receive envelopes)
//!          └─ DataSink    (pull: register data sources)
//! ```
//!
//! The pipeline binder inspects capabilities at connect time and refuses
//! mismatched pairs. Capabilities are modeled as accessor methods returning
//! `Option` rather than as a class hierarchy, so a component advertises
//! exactly what it supports.

use crate::subscription::Subscription;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use virta_core::{Envelope, Metric, Payload, PayloadKind, PluginError};

/// A producer of timestamped envelopes
///
/// Sources are constructed during load but only started once the whole
/// topology is bound. `stop` must be idempotent; the manager may race a
/// reload against an external stop.
#[async_trait]
pub trait Source: Send + Sync {
    /// Component id, unique among sources in a running configuration
    fn id(&self) -> &str;

    /// Begin producing envelopes
    async fn start(&self) -> Result<(), PluginError>;

    /// Stop producing; double-stop is a no-op
    async fn stop(&self) -> Result<(), PluginError>;

    /// Event-stream capability, if this source pushes envelopes
    fn as_event_source(&self) -> Option<&dyn EventSource> {
        None
    }

    /// Data-pull capability, if this source answers queries
    fn as_data_source(self: Arc<Self>) -> Option<Arc<dyn DataSource>> {
        None
    }
}

/// Push side of a source: subscribers receive every published envelope
pub trait EventSource: Send + Sync {
    /// The payload variant this source publishes
    fn payload_kind(&self) -> PayloadKind;

    /// Attach a sink; dropping the token severs the link
    fn subscribe(&self, sink: Arc<dyn EventSink>) -> Subscription;
}

/// Pull side of a source: sinks query the current metric snapshot
pub trait DataSource: Send + Sync {
    /// Current samples; a monotone snapshot, not a delta
    fn query(&self) -> Vec<Metric>;
}

/// A consumer that forwards envelopes outward
#[async_trait]
pub trait Sink: Send + Sync {
    /// Component id, unique among sinks in a running configuration
    fn id(&self) -> &str;

    /// Open connections, start flush schedules
    async fn start(&self) -> Result<(), PluginError>;

    /// Flush buffered state and release resources; double-stop is a no-op
    async fn stop(&self) -> Result<(), PluginError>;

    /// Event-stream capability, if this sink accepts pushed envelopes
    fn as_event_sink(self: Arc<Self>) -> Option<Arc<dyn EventSink>> {
        None
    }

    /// Data-pull capability, if this sink pulls from registered sources
    fn as_data_sink(&self) -> Option<&dyn DataSink> {
        None
    }
}

/// Push side of a sink
#[async_trait]
pub trait EventSink: Send + Sync {
    /// The payload variant this sink accepts
    fn payload_kind(&self) -> PayloadKind;

    /// Consume one envelope
    async fn receive(&self, envelope: Envelope<Payload>) -> Result<(), PluginError>;
}

/// Pull side of a sink
pub trait DataSink: Send + Sync {
    /// Register a source this sink will query on its own schedule
    fn register_data_source(&self, source: Arc<dyn DataSource>);
}

/// An in-process transformer between a source and a sink
///
/// A pipe is simultaneously an event sink (its upstream side) and an
/// event source (its downstream side). The binder stashes the upstream
/// and downstream payload kinds in the plugin context before invoking the
/// pipe factory, so a pipe can refuse combinations it cannot convert.
#[async_trait]
pub trait Pipe: Send + Sync {
    /// Component id (may be derived from the pipe's type name)
    fn id(&self) -> &str;

    /// Start transforming
    async fn start(&self) -> Result<(), PluginError>;

    /// Stop transforming; double-stop is a no-op
    async fn stop(&self) -> Result<(), PluginError>;

    /// Upstream side: receives envelopes from the source
    fn upstream(self: Arc<Self>) -> Arc<dyn EventSink>;

    /// Downstream side: publishes transformed envelopes to the sink
    fn downstream(&self) -> &dyn EventSource;
}

/// A named secret provider constructed from the `Credentials` section
pub trait CredentialProvider: Send + Sync {
    /// Provider id, referenced by components needing credentials
    fn id(&self) -> &str;

    /// Look up a credential field by name
    fn credential(&self, key: &str) -> Option<String>;
}

/// A general-purpose plugin with start/stop lifecycle
///
/// Plugins participate in the pipeline only through side effects (health
/// probes, maintenance jobs). A plugin may additionally provide network
/// status, in which case the manager registers it with the process-wide
/// registry for the lifetime of the pipeline.
#[async_trait]
pub trait GenericPlugin: Send + Sync {
    /// Plugin name for logging
    fn name(&self) -> &str;

    /// Start background work
    async fn start(&self) -> Result<(), PluginError>;

    /// Stop background work; double-stop is a no-op
    async fn stop(&self) -> Result<(), PluginError>;

    /// Network-status capability, if this plugin monitors connectivity
    fn as_network_status(&self) -> Option<Arc<dyn crate::network::NetworkStatusProvider>> {
        None
    }
}

/// A record parser resolved by name through the plugin context
///
/// Parsing components (a file source with a `RecordParser` setting) look
/// parsers up through the read-only catalog view in their context rather
/// than owning the catalog.
pub trait RecordParser: Send + Sync {
    /// Parser name for catalog lookup
    fn name(&self) -> &str;

    /// Split raw bytes into payloads
    fn parse(&self, raw: &Bytes) -> Result<Vec<Payload>, PluginError>;
}
