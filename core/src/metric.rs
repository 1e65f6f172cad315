//! The self-metrics data model
//!
//! Every agent component publishes operational counters through the shared
//! metrics publisher; the self-metrics source aggregates them and feeds
//! them to metrics sinks like any other pipeline data. These are the types
//! that model a single sample.

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;

/// Identity of a metric: name, category, and free-form dimensions
///
/// The category groups related counters (e.g. `Sources`, `Sinks`,
/// `Pipes`); dimensions carry per-instance labels such as the component
/// id. Dimensions use a `BTreeMap` so keys hash and compare in a stable
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MetricKey {
    /// Counter name, e.g. `SourcesStarted`
    pub name: String,
    /// Counter category, e.g. `Sources`
    pub category: String,
    /// Free-form labels, e.g. `id` or `kind`
    pub dimensions: BTreeMap<String, String>,
}

impl MetricKey {
    /// Create a key with no dimensions
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            dimensions: BTreeMap::new(),
        }
    }

    /// Add a dimension label
    pub fn with_dimension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.dimensions.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.name)
    }
}

/// A sampled value with its unit and accumulation semantics
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricValue {
    /// The numeric sample
    pub value: f64,
    /// Unit of the sample
    pub unit: MetricUnit,
    /// How successive samples combine
    pub counter_type: CounterType,
}

impl MetricValue {
    /// A `Count`-unit sample
    pub fn count(value: f64, counter_type: CounterType) -> Self {
        Self {
            value,
            unit: MetricUnit::Count,
            counter_type,
        }
    }

    /// A `Milliseconds`-unit sample
    pub fn millis(value: f64, counter_type: CounterType) -> Self {
        Self {
            value,
            unit: MetricUnit::Milliseconds,
            counter_type,
        }
    }
}

/// Unit attached to a metric sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum MetricUnit {
    /// Dimensionless count
    Count,
    /// Wall-clock milliseconds
    Milliseconds,
    /// Byte sizes
    Bytes,
    /// No unit
    None,
}

/// Accumulation semantics of a counter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum CounterType {
    /// A gauge: each publication replaces the previous value
    CurrentValue,
    /// An accumulator: each publication adds to the previous value
    Increment,
    /// An average over the observation window; publications replace
    Average,
}

/// A single metric sample: key plus value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Metric {
    /// Metric identity
    pub key: MetricKey,
    /// Sampled value
    pub value: MetricValue,
}

impl Metric {
    /// Pair a key with a value
    pub fn new(key: MetricKey, value: MetricValue) -> Self {
        Self { key, value }
    }
}
