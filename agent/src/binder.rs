//! Pipeline binder: wiring sources to sinks through pipes
//!
//! Each `Pipes` entry names a `SourceRef` and a required `SinkRef`,
//! optionally a pipe `Type`. The binder resolves both ends in the
//! component registries, inspects their capabilities, and installs the
//! connection:
//!
//! ```text
//! event-stream × event-stream, no Type:   source ──► sink
//! event-stream × event-stream, Type:      source ──► pipe ──► sink
//! data-pull    × data-sink:               sink.register_data_source(source)
//! anything else:                          refused (typed mismatch)
//! ```
//!
//! Every failure is counted and skipped; the rest of the section still
//! binds. The manager owns the returned subscription tokens and started
//! pipes for the lifetime of the load cycle.

use crate::catalog::FactoryCatalog;
use crate::component::{Pipe, Sink, Source};
use crate::config::config_keys;
use crate::context::{context_keys, ContextData, PluginContext};
use crate::subscription::Subscription;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use virta_core::PluginError;

/// Result of binding one `Pipes` section
#[derive(Default)]
pub struct BindOutcome {
    /// Entries successfully connected (including declaration-only pipes)
    pub connected: u64,
    /// Entries refused, unknown, or failed
    pub failed: u64,
    /// Tokens owning the installed links
    pub subscriptions: Vec<Subscription>,
    /// Pipes constructed and started during binding
    pub pipes: Vec<Arc<dyn Pipe>>,
}

/// Context factory handed to the binder by the manager
pub type MakeContext<'a> = dyn Fn(&Map<String, Value>) -> PluginContext + Sync + 'a;

/// Binds the `Pipes` section against the loaded component registries
pub struct PipelineBinder<'a> {
    /// Sources by id
    pub sources: &'a HashMap<String, Arc<dyn Source>>,
    /// Sinks by id
    pub sinks: &'a HashMap<String, Arc<dyn Sink>>,
    /// Pipe factories
    pub pipe_factories: &'a FactoryCatalog<Arc<dyn Pipe>>,
}

impl PipelineBinder<'_> {
    /// Bind every entry, isolating per-entry failures
    pub async fn bind(
        &self,
        entries: &[&Map<String, Value>],
        make_context: &MakeContext<'_>,
    ) -> BindOutcome {
        let mut outcome = BindOutcome::default();
        for entry in entries {
            let bound = self.bind_entry(entry, make_context, &mut outcome).await;
            match bound {
                Ok(()) => outcome.connected += 1,
                Err(e) => {
                    warn!(error = %e, "pipe entry skipped");
                    outcome.failed += 1;
                }
            }
        }
        outcome
    }

    async fn bind_entry(
        &self,
        entry: &Map<String, Value>,
        make_context: &MakeContext<'_>,
        outcome: &mut BindOutcome,
    ) -> Result<(), PluginError> {
        let sink_ref = entry
            .get(config_keys::SINK_REF)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| PluginError::Config("pipe entry has no SinkRef".into()))?;

        let sink = self
            .sinks
            .get(sink_ref)
            .ok_or_else(|| PluginError::Config(format!("unknown SinkRef '{sink_ref}'")))?;

        let source_ref = entry
            .get(config_keys::SOURCE_REF)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty());

        let Some(source_ref) = source_ref else {
            // Declaration-only pipe: the sink exists, nothing to connect yet
            info!(sink = sink_ref, "declaration-only pipe accepted");
            return Ok(());
        };

        let source = self
            .sources
            .get(source_ref)
            .ok_or_else(|| PluginError::Config(format!("unknown SourceRef '{source_ref}'")))?;

        let pipe_type = entry
            .get(config_keys::TYPE)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty());

        // Event-stream coupling
        if let (Some(event_source), Some(event_sink)) = (
            source.as_event_source(),
            Arc::clone(sink).as_event_sink(),
        ) {
            match pipe_type {
                None => {
                    if event_source.payload_kind() != event_sink.payload_kind() {
                        return Err(PluginError::Config(format!(
                            "payload mismatch: source '{source_ref}' publishes {}, sink '{sink_ref}' accepts {}",
                            event_source.payload_kind(),
                            event_sink.payload_kind()
                        )));
                    }
                    outcome.subscriptions.push(event_source.subscribe(event_sink));
                    info!(source = source_ref, sink = sink_ref, "pipe connected");
                }
                Some(type_name) => {
                    let factory = self.pipe_factories.get(type_name).ok_or_else(|| {
                        PluginError::Config(format!("unknown pipe type '{type_name}'"))
                    })?;

                    let mut ctx = make_context(entry);
                    ctx.set_data(
                        context_keys::SOURCE_PAYLOAD,
                        ContextData::PayloadKind(event_source.payload_kind()),
                    );
                    ctx.set_data(
                        context_keys::SINK_PAYLOAD,
                        ContextData::PayloadKind(event_sink.payload_kind()),
                    );

                    let pipe = factory(type_name, &ctx)?;
                    pipe.start().await?;

                    outcome
                        .subscriptions
                        .push(event_source.subscribe(Arc::clone(&pipe).upstream()));
                    outcome
                        .subscriptions
                        .push(pipe.downstream().subscribe(event_sink));
                    outcome.pipes.push(pipe);
                    info!(
                        source = source_ref,
                        sink = sink_ref,
                        pipe = type_name,
                        "typed pipe connected"
                    );
                }
            }
            return Ok(());
        }

        // Data-pull coupling: the sink queries the source on its own schedule
        if let (Some(data_source), Some(data_sink)) =
            (Arc::clone(source).as_data_source(), sink.as_data_sink())
        {
            if pipe_type.is_some() {
                return Err(PluginError::Config(
                    "pipe Type is not supported on data-pull connections".into(),
                ));
            }
            data_sink.register_data_source(data_source);
            info!(source = source_ref, sink = sink_ref, "data source registered");
            return Ok(());
        }

        Err(PluginError::Config(format!(
            "capability mismatch between source '{source_ref}' and sink '{sink_ref}'"
        )))
    }
}
