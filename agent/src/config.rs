//! Declarative agent configuration
//!
//! The agent topology is described by a JSON document with recognized
//! top-level sections (`Sources`, `Sinks`, `Pipes`, `Credentials`,
//! `Plugins`, `Metrics`, `Telemetrics`, `PerformanceCounter`,
//! `SelfUpdate`). Unknown keys are ignored so documents can carry
//! host-specific extras. Type names are matched case-insensitively by the
//! factory catalogs; ids are case-sensitive.
//!
//! Parsing files and watching them for changes are host concerns; the
//! manager consumes a [`ConfigProvider`] and only asks it two questions:
//! load the document, and when was it last modified.

use crate::error::AgentError;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};

/// Well-known field names inside component sections
pub mod config_keys {
    /// Component id
    pub const ID: &str = "Id";
    /// Source type name
    pub const SOURCE_TYPE: &str = "SourceType";
    /// Sink type name
    pub const SINK_TYPE: &str = "SinkType";
    /// Credential provider type name
    pub const CREDENTIAL_TYPE: &str = "CredentialType";
    /// Pipe/plugin type name
    pub const TYPE: &str = "Type";
    /// Pipe upstream reference
    pub const SOURCE_REF: &str = "SourceRef";
    /// Pipe downstream reference
    pub const SINK_REF: &str = "SinkRef";
    /// Telemetry redirect target
    pub const REDIRECT_TO_SINK_ID: &str = "RedirectToSinkId";
    /// Telemetry opt-out flag (string "true")
    pub const OFF: &str = "off";
    /// Self-metrics emission interval in seconds
    pub const INTERVAL_SECS: &str = "IntervalSecs";
}

/// A parsed configuration document
#[derive(Debug, Clone)]
pub struct AgentConfig {
    document: Map<String, Value>,
}

impl AgentConfig {
    /// Wrap a parsed JSON value; the root must be an object
    pub fn from_value(value: Value) -> Result<Self, AgentError> {
        match value {
            Value::Object(document) => Ok(Self { document }),
            other => Err(AgentError::Config(format!(
                "configuration root must be an object, got {other}"
            ))),
        }
    }

    /// Parse a JSON document
    pub fn from_str(text: &str) -> Result<Self, AgentError> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(value)
    }

    /// An empty configuration (no components)
    pub fn empty() -> Self {
        Self {
            document: Map::new(),
        }
    }

    fn section_array(&self, name: &str) -> Vec<&Map<String, Value>> {
        match self.document.get(name) {
            Some(Value::Array(entries)) => entries.iter().filter_map(Value::as_object).collect(),
            Some(_) => {
                tracing::warn!(section = name, "section is not an array, ignoring");
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    fn section_object(&self, name: &str) -> Option<&Map<String, Value>> {
        self.document.get(name).and_then(Value::as_object)
    }

    /// Entries of the `Sources` section
    pub fn sources(&self) -> Vec<&Map<String, Value>> {
        self.section_array("Sources")
    }

    /// Entries of the `Sinks` section
    pub fn sinks(&self) -> Vec<&Map<String, Value>> {
        self.section_array("Sinks")
    }

    /// Entries of the `Pipes` section
    pub fn pipes(&self) -> Vec<&Map<String, Value>> {
        self.section_array("Pipes")
    }

    /// Entries of the `Credentials` section
    pub fn credentials(&self) -> Vec<&Map<String, Value>> {
        self.section_array("Credentials")
    }

    /// Entries of the `Plugins` section
    pub fn plugins(&self) -> Vec<&Map<String, Value>> {
        self.section_array("Plugins")
    }

    /// The `Metrics` section, if present
    pub fn metrics(&self) -> Option<&Map<String, Value>> {
        self.section_object("Metrics")
    }

    /// The `Telemetrics` section, if present
    pub fn telemetrics(&self) -> Option<&Map<String, Value>> {
        self.section_object("Telemetrics")
    }

    /// The `PerformanceCounter` section, if present
    pub fn performance_counter(&self) -> Option<&Map<String, Value>> {
        self.section_object("PerformanceCounter")
    }

    /// Self-update interval in minutes; 0 disables
    pub fn self_update_minutes(&self) -> u64 {
        self.document
            .get("SelfUpdate")
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }
}

/// Read a string field out of a component section
pub fn section_str<'a>(section: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    section.get(key).and_then(Value::as_str)
}

/// Read an unsigned integer field out of a component section
pub fn section_u64(section: &Map<String, Value>, key: &str) -> Option<u64> {
    section.get(key).and_then(Value::as_u64)
}

/// Supplier of the active configuration document
///
/// Implementations wrap a file, an HTTP endpoint, a test fixture. A load
/// failure at first start is the agent's only fatal error; during reload
/// it leaves the previous pipeline stopped until the next successful
/// cycle.
pub trait ConfigProvider: Send + Sync {
    /// Load the current document
    fn load(&self) -> Result<AgentConfig, AgentError>;

    /// When the document last changed, if the backend can tell
    fn modified_at(&self) -> Option<DateTime<Utc>>;
}

/// In-memory configuration provider
///
/// Used by tests and by hosts that assemble configuration themselves.
/// `replace` swaps the document and stamps the modification time, which
/// the manager's config-watch timer picks up like any file change.
pub struct MemoryConfigProvider {
    document: Mutex<AgentConfig>,
    modified: Mutex<Option<DateTime<Utc>>>,
}

impl MemoryConfigProvider {
    /// Create a provider serving the given document
    pub fn new(config: AgentConfig) -> Self {
        Self {
            document: Mutex::new(config),
            modified: Mutex::new(Some(Utc::now())),
        }
    }

    /// Swap the served document and stamp the change time
    pub fn replace(&self, config: AgentConfig) {
        *self.document.lock() = config;
        *self.modified.lock() = Some(Utc::now());
    }
}

impl ConfigProvider for MemoryConfigProvider {
    fn load(&self) -> Result<AgentConfig, AgentError> {
        Ok(self.document.lock().clone())
    }

    fn modified_at(&self) -> Option<DateTime<Utc>> {
        *self.modified.lock()
    }
}
