//! Per-component plugin context
//!
//! For each component section the manager builds a [`PluginContext`]
//! bundling everything a factory needs: the component's configuration
//! view, a logger scoped to its id, the shared self-metrics publisher, a
//! read-only view of the credential registry, the parameter store, and a
//! typed side-channel map the binder uses to pass connect-time data to
//! pipe constructors.

use crate::catalog::{Factory, FactoryCatalog};
use crate::component::{CredentialProvider, RecordParser};
use crate::params::ParameterStore;
use crate::self_metrics::MetricsPublisher;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::Span;
use virta_core::{PayloadKind, PluginError};

/// Reserved side-channel keys
pub mod context_keys {
    /// Payload kind of the upstream source (set by the binder)
    pub const SOURCE_PAYLOAD: &str = "source.payload";
    /// Payload kind of the downstream sink (set by the binder)
    pub const SINK_PAYLOAD: &str = "sink.payload";
    /// Read-only record-parser catalog view
    pub const PARSERS: &str = "parsers";
}

/// Typed side-channel data passed between the binder and constructors
#[derive(Clone)]
pub enum ContextData {
    /// A payload kind declaration
    PayloadKind(PayloadKind),
    /// The record-parser catalog view
    Parsers(Arc<ParserCatalogView>),
    /// A free-form string
    Text(String),
}

/// Registry of credential providers built from the `Credentials` section
///
/// Mutated only during load; every plugin context holds a read-only
/// `Arc` view afterwards.
#[derive(Default)]
pub struct CredentialRegistry {
    providers: HashMap<String, Arc<dyn CredentialProvider>>,
}

impl CredentialRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a provider under its id; returns false on duplicate
    pub fn insert(&mut self, provider: Arc<dyn CredentialProvider>) -> bool {
        let id = provider.id().to_string();
        if self.providers.contains_key(&id) {
            return false;
        }
        self.providers.insert(id, provider);
        true
    }

    /// Look up a provider by id (case-sensitive)
    pub fn get(&self, id: &str) -> Option<Arc<dyn CredentialProvider>> {
        self.providers.get(id).cloned()
    }

    /// Number of registered providers
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Read-only view over the record-parser factory catalog
///
/// Exposed through the context side-channel so parsing components can
/// instantiate parsers by name without owning the catalog.
pub struct ParserCatalogView {
    catalog: FactoryCatalog<Arc<dyn RecordParser>>,
}

impl ParserCatalogView {
    /// Snapshot the parser catalog
    pub fn new(catalog: FactoryCatalog<Arc<dyn RecordParser>>) -> Self {
        Self { catalog }
    }

    /// Resolve a parser factory by name
    pub fn factory(&self, name: &str) -> Option<Factory<Arc<dyn RecordParser>>> {
        self.catalog.get(name)
    }

    /// Instantiate a parser by name
    pub fn create(
        &self,
        name: &str,
        ctx: &PluginContext,
    ) -> Option<Result<Arc<dyn RecordParser>, PluginError>> {
        self.catalog.get(name).map(|factory| factory(name, ctx))
    }
}

/// Per-component handle given to every factory
pub struct PluginContext {
    id: String,
    section: Map<String, Value>,
    logger: Span,
    metrics: Arc<MetricsPublisher>,
    credentials: Arc<CredentialRegistry>,
    parameters: Arc<dyn ParameterStore>,
    data: HashMap<String, ContextData>,
}

impl PluginContext {
    /// Build a context for one component section
    ///
    /// When the section declares an `Id` a component-scoped logger span is
    /// created; otherwise the manager's span is reused.
    pub fn new(
        section: Map<String, Value>,
        manager_logger: &Span,
        metrics: Arc<MetricsPublisher>,
        credentials: Arc<CredentialRegistry>,
        parameters: Arc<dyn ParameterStore>,
    ) -> Self {
        let id = section
            .get(crate::config::config_keys::ID)
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_string();
        let logger = if id.is_empty() {
            manager_logger.clone()
        } else {
            tracing::info_span!("component", id = %id)
        };
        Self {
            id,
            section,
            logger,
            metrics,
            credentials,
            parameters,
            data: HashMap::new(),
        }
    }

    /// The component id declared in the section, or `""`
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The component's configuration section
    pub fn config(&self) -> &Map<String, Value> {
        &self.section
    }

    /// Convenience string accessor into the section
    pub fn config_str(&self, key: &str) -> Option<&str> {
        crate::config::section_str(&self.section, key)
    }

    /// Convenience integer accessor into the section
    pub fn config_u64(&self, key: &str) -> Option<u64> {
        crate::config::section_u64(&self.section, key)
    }

    /// Logger span bound to this component's id
    pub fn logger(&self) -> &Span {
        &self.logger
    }

    /// The shared self-metrics publisher
    pub fn metrics(&self) -> &Arc<MetricsPublisher> {
        &self.metrics
    }

    /// Read-only credential provider registry
    pub fn credentials(&self) -> &Arc<CredentialRegistry> {
        &self.credentials
    }

    /// The shared parameter store
    pub fn parameters(&self) -> &Arc<dyn ParameterStore> {
        &self.parameters
    }

    /// Set a side-channel entry
    pub fn set_data(&mut self, key: impl Into<String>, value: ContextData) {
        self.data.insert(key.into(), value);
    }

    /// Read a side-channel entry
    pub fn data(&self, key: &str) -> Option<&ContextData> {
        self.data.get(key)
    }

    /// Read a payload-kind side-channel entry
    pub fn payload_kind(&self, key: &str) -> Option<PayloadKind> {
        match self.data.get(key) {
            Some(ContextData::PayloadKind(kind)) => Some(*kind),
            _ => None,
        }
    }

    /// Read the parser catalog view, if the manager installed one
    pub fn parsers(&self) -> Option<Arc<ParserCatalogView>> {
        match self.data.get(context_keys::PARSERS) {
            Some(ContextData::Parsers(view)) => Some(Arc::clone(view)),
            _ => None,
        }
    }

    /// A bare context for unit tests
    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::new(
            Map::new(),
            &tracing::info_span!("test_manager"),
            Arc::new(MetricsPublisher::new()),
            Arc::new(CredentialRegistry::new()),
            Arc::new(crate::params::MemoryParameterStore::new()),
        )
    }
}
