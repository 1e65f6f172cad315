//! virta-core - Core types for the Virta host agent
//!
//! This crate provides the foundational types shared between the Virta
//! agent runtime and component implementations (sources, pipes, sinks):
//!
//! - [`Envelope`] - the timestamped record that flows through a pipeline
//! - [`Payload`] - the tagged payload union carried by event-stream wiring
//! - [`Metric`], [`MetricKey`], [`MetricValue`] - the self-metrics model
//! - [`PluginError`] - error type for component operations
//!
//! # Why this crate exists
//!
//! External component crates (a file tailer, an upload sink) need the
//! envelope and error types without pulling in the whole agent runtime.
//! Without `virta-core` they would depend on `virta-agent`, but the agent
//! also wants to optionally bundle built-in components, creating a cyclic
//! dependency. Extracting the shared types here breaks the cycle:
//!
//! ```text
//! virta-core ◄── virta-agent
//!     ▲
//!     └────────── component crates
//! ```

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]
#![warn(missing_docs)]

mod envelope;
mod error;
mod metric;

pub use envelope::{Envelope, Payload, PayloadKind};
pub use error::PluginError;
pub use metric::{CounterType, Metric, MetricKey, MetricUnit, MetricValue};
