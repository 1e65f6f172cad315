//! Key/value parameter store shared with components
//!
//! Components use the store for small persistent settings (last bookmark
//! directory, install markers). Persistence backends are host concerns;
//! the runtime ships an in-memory implementation and writes two
//! conventional keys at start: the configuration directory and the
//! structured-log config file path.

use parking_lot::Mutex;
use std::collections::HashMap;

/// Reserved parameter keys written by the runtime
pub mod parameter_keys {
    /// Directory the active configuration document was loaded from
    pub const CONFIG_DIR: &str = "config_dir";
    /// Path to the structured-log configuration file
    pub const LOG_CONFIG_PATH: &str = "log_config_path";
}

/// Key/value persistence used by components
pub trait ParameterStore: Send + Sync {
    /// Read a value
    fn get(&self, key: &str) -> Option<String>;

    /// Write a value, replacing any previous one
    fn set(&self, key: &str, value: String);
}

/// In-memory parameter store
///
/// The default backend; suitable for tests and for hosts that persist
/// parameters elsewhere.
#[derive(Default)]
pub struct MemoryParameterStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryParameterStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

impl ParameterStore for MemoryParameterStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn set(&self, key: &str, value: String) {
        self.entries.lock().insert(key.to_string(), value);
    }
}
