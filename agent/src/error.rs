//! Error types for the Virta agent runtime

use thiserror::Error;

// Re-export PluginError from virta-core
pub use virta_core::PluginError;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;

/// Manager-level error type
///
/// Per the agent's error policy almost every failure is contained: logged,
/// counted, and skipped. `AgentError` is reserved for the few conditions
/// that must surface to the host, chiefly a configuration document that
/// cannot be loaded at all.
#[derive(Error, Debug)]
pub enum AgentError {
    /// Configuration document error (fatal at initial start)
    #[error("configuration error: {0}")]
    Config(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Component error surfaced with its id
    #[error("component '{id}' error: {message}")]
    Component {
        /// Offending component id
        id: String,
        /// What went wrong
        message: String,
    },
}

impl From<PluginError> for AgentError {
    fn from(err: PluginError) -> Self {
        AgentError::Component {
            id: "unknown".to_string(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plugin_error_to_agent_error() {
        let plugin_err = PluginError::Construct("no such channel".to_string());
        let agent_err: AgentError = plugin_err.into();
        assert!(matches!(agent_err, AgentError::Component { .. }));
    }
}
