//! Error types for Virta components

use thiserror::Error;

/// Error type for component operations
///
/// This is the standard error type used by all Virta components including
/// sources, pipes, sinks, credential providers, and generic plugins. It
/// provides structured error categories that help with debugging and with
/// the agent's contain-and-continue error policy.
///
/// # Example
///
/// ```
/// use virta_core::PluginError;
///
/// fn open_event_log() -> Result<(), PluginError> {
///     // Simulate a missing channel
///     Err(PluginError::Construct("channel 'Security' not found".to_string()))
/// }
///
/// match open_event_log() {
///     Ok(_) => println!("opened"),
///     Err(PluginError::Construct(msg)) => println!("construction failed: {}", msg),
///     Err(e) => println!("other error: {}", e),
/// }
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PluginError {
    /// Configuration error
    ///
    /// Returned when a component's configuration section is invalid.
    /// Examples: missing required field, malformed value, duplicate id.
    #[error("configuration error: {0}")]
    Config(String),

    /// Construction or start failed
    ///
    /// Returned when a factory cannot build a component or the component
    /// fails to start. Examples: resource not found, failed to bind.
    #[error("construction failed: {0}")]
    Construct(String),

    /// Send failed
    ///
    /// Returned when a sink fails to forward records to its destination.
    /// Examples: request rejected, quota exceeded, serialization failure.
    #[error("send failed: {0}")]
    Send(String),

    /// Connection error
    ///
    /// Returned when a network connection fails.
    /// Examples: DNS lookup failed, connection refused, TLS handshake error.
    #[error("connection error: {0}")]
    Connection(String),

    /// Not ready
    ///
    /// Returned when a component is used before it is ready to handle
    /// traffic. This is typically a transient state during startup.
    #[error("component not ready")]
    NotReady,

    /// Shutdown error
    ///
    /// Returned when graceful shutdown fails.
    /// Examples: failed to flush buffers, pending operations timed out.
    #[error("shutdown error: {0}")]
    Shutdown(String),
}
