//! Factory catalogs for pluggable components
//!
//! One catalog per component kind maps type names (case-insensitive) to
//! factories. On agent start the runtime asks each registered
//! [`FactoryProvider`] to populate the catalogs; a broken provider is
//! isolated so it cannot prevent the rest from loading. Unknown type
//! names encountered later during topology construction are lookup
//! misses, never errors — the caller logs and counts them.

use crate::component::{CredentialProvider, GenericPlugin, Pipe, RecordParser, Sink, Source};
use crate::context::PluginContext;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use virta_core::PluginError;

/// A component factory: given the resolved type name and a plugin
/// context, produce an instance
pub type Factory<K> = Arc<dyn Fn(&str, &PluginContext) -> Result<K, PluginError> + Send + Sync>;

/// Case-insensitive name → factory registry for one component kind
///
/// Registration is idempotent on name (last writer wins). Lookup of blank
/// or unknown names returns `None`.
pub struct FactoryCatalog<K> {
    factories: HashMap<String, Factory<K>>,
}

impl<K> FactoryCatalog<K> {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a factory under a type name
    ///
    /// Names are folded to lowercase; re-registering a name replaces the
    /// previous factory.
    pub fn register(&mut self, type_name: impl Into<String>, factory: Factory<K>) {
        let key = type_name.into().to_ascii_lowercase();
        if self.factories.insert(key.clone(), factory).is_some() {
            debug!(type_name = %key, "factory replaced");
        } else {
            debug!(type_name = %key, "factory registered");
        }
    }

    /// Look up a factory; blank and unknown names miss
    pub fn get(&self, type_name: &str) -> Option<Factory<K>> {
        let trimmed = type_name.trim();
        if trimmed.is_empty() {
            return None;
        }
        self.factories.get(&trimmed.to_ascii_lowercase()).cloned()
    }

    /// Whether a type name is registered
    pub fn contains(&self, type_name: &str) -> bool {
        self.get(type_name).is_some()
    }

    /// Number of registered type names
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl<K> Default for FactoryCatalog<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K> Clone for FactoryCatalog<K> {
    fn clone(&self) -> Self {
        Self {
            factories: self.factories.clone(),
        }
    }
}

/// The full set of per-kind catalogs built during a load cycle
///
/// Append-only within a cycle; a reload builds a fresh set.
#[derive(Default, Clone)]
pub struct FactoryCatalogs {
    /// Source factories
    pub sources: FactoryCatalog<Arc<dyn Source>>,
    /// Sink factories
    pub sinks: FactoryCatalog<Arc<dyn Sink>>,
    /// Pipe factories
    pub pipes: FactoryCatalog<Arc<dyn Pipe>>,
    /// Credential provider factories
    pub credentials: FactoryCatalog<Arc<dyn CredentialProvider>>,
    /// Generic plugin factories
    pub plugins: FactoryCatalog<Arc<dyn GenericPlugin>>,
    /// Record parser factories
    pub parsers: FactoryCatalog<Arc<dyn RecordParser>>,
}

impl FactoryCatalogs {
    /// Create empty catalogs
    pub fn new() -> Self {
        Self::default()
    }
}

/// A discovered plugin module that registers its factories
///
/// Discovery itself (scanning a plugin search path, loading modules) is a
/// host concern; the runtime receives the resulting providers and runs
/// each registration in isolation.
pub trait FactoryProvider: Send + Sync {
    /// Provider name for logging
    fn name(&self) -> &str;

    /// Register this provider's factories into the catalogs
    fn register(&self, catalogs: &mut FactoryCatalogs) -> Result<(), PluginError>;
}

/// Run every provider's registration, isolating failures
///
/// Returns `(loaded, failed)` provider counts. Registrations a provider
/// completed before failing are kept; the catalogs stay append-only
/// within a load cycle.
pub fn load_factories(
    providers: &[Arc<dyn FactoryProvider>],
    catalogs: &mut FactoryCatalogs,
) -> (u64, u64) {
    let mut loaded = 0;
    let mut failed = 0;

    for provider in providers {
        match provider.register(catalogs) {
            Ok(()) => {
                debug!(provider = provider.name(), "factory provider loaded");
                loaded += 1;
            }
            Err(e) => {
                warn!(provider = provider.name(), error = %e, "factory provider failed to load");
                failed += 1;
            }
        }
    }

    (loaded, failed)
}
