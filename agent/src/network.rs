//! Process-wide network status registry
//!
//! Network status crosses component boundaries by design: an upload sink
//! deciding whether to attempt a send should not need a reference to the
//! plugin that watches the link. Providers are registered during start and
//! the registry is reset during stop; the manager owns that discipline.

use parking_lot::RwLock;
use std::sync::{Arc, LazyLock};

/// Connectivity oracle implemented by network-aware plugins
pub trait NetworkStatusProvider: Send + Sync {
    /// Whether the host currently has the connectivity this provider tracks
    fn is_network_available(&self) -> bool;
}

static PROVIDERS: LazyLock<RwLock<Vec<Arc<dyn NetworkStatusProvider>>>> =
    LazyLock::new(|| RwLock::new(Vec::new()));

/// Register a provider for the lifetime of the current pipeline
pub fn register(provider: Arc<dyn NetworkStatusProvider>) {
    PROVIDERS.write().push(provider);
}

/// Whether every registered provider reports connectivity
///
/// With no providers registered the network is assumed available.
pub fn is_available() -> bool {
    PROVIDERS.read().iter().all(|p| p.is_network_available())
}

/// Number of registered providers
pub fn provider_count() -> usize {
    PROVIDERS.read().len()
}

/// Drop all registered providers; called when the pipeline stops
pub fn reset() {
    PROVIDERS.write().clear();
}
