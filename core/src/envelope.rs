//! The universal record envelope for Virta pipelines
//!
//! The [`Envelope`] is the record that flows from sources through pipes to
//! sinks. It is payload-agnostic: a file tailer produces text lines, an OS
//! event-log reader produces structured records, the self-metrics source
//! produces metric snapshots. Bookmark and position travel alongside the
//! payload so sinks can checkpoint their progress per source.
//!
//! ```text
//! Source ──► Envelope<Payload> ──► Pipe ──► Envelope<Payload> ──► Sink
//! ```
//!
//! Event-stream wiring carries the [`Payload`] tagged union; pipes convert
//! between its variants. Ordering across envelopes from a single source is
//! the source's timestamp order; across sources it is unordered.

use crate::metric::Metric;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;

/// A timestamped record with bookmark metadata
///
/// Immutable once constructed. `bookmark` is an opaque token that a source
/// may attach so downstream checkpointing can resume from it; `position` is
/// an opaque offset into the source (byte offset, record number). Both are
/// optional because many sources have no durable position.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use virta_core::{Envelope, Payload};
///
/// let env = Envelope::new(Payload::Raw(Bytes::from_static(b"line 1\n")));
/// assert!(env.bookmark.is_none());
/// ```
#[derive(Debug, Clone)]
pub struct Envelope<T> {
    /// The record payload
    pub payload: T,
    /// UTC timestamp assigned by the source
    pub timestamp: DateTime<Utc>,
    /// Opaque bookmark token for checkpointing, if the source has one
    pub bookmark: Option<String>,
    /// Opaque position within the source, if the source has one
    pub position: Option<u64>,
}

impl<T> Envelope<T> {
    /// Create an envelope stamped with the current time and no bookmark
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            timestamp: Utc::now(),
            bookmark: None,
            position: None,
        }
    }

    /// Create an envelope with an explicit timestamp, bookmark, and position
    pub fn at(
        payload: T,
        timestamp: DateTime<Utc>,
        bookmark: Option<String>,
        position: Option<u64>,
    ) -> Self {
        Self {
            payload,
            timestamp,
            bookmark,
            position,
        }
    }

    /// Transform the payload while preserving timestamp and bookmark
    ///
    /// This is the primitive pipes are built on: a pipe maps the payload
    /// to another type but must not disturb the record's provenance.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Envelope<U> {
        Envelope {
            payload: f(self.payload),
            timestamp: self.timestamp,
            bookmark: self.bookmark,
            position: self.position,
        }
    }
}

/// Tagged payload union carried by event-stream wiring
///
/// Sources and sinks declare which variant they produce or accept via
/// [`PayloadKind`]; the pipeline binder checks the declarations at connect
/// time and pipes convert between variants.
#[derive(Debug, Clone)]
pub enum Payload {
    /// Raw bytes, zero-copy via [`Bytes`]
    Raw(Bytes),
    /// A text record (log line, rendered event)
    Text(String),
    /// A structured record
    Json(serde_json::Value),
    /// A batch of metric samples
    Metrics(Vec<Metric>),
}

impl Payload {
    /// The discriminant of this payload
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Raw(_) => PayloadKind::Raw,
            Payload::Text(_) => PayloadKind::Text,
            Payload::Json(_) => PayloadKind::Json,
            Payload::Metrics(_) => PayloadKind::Metrics,
        }
    }
}

/// Payload discriminant used for connect-time type declarations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// Raw bytes
    Raw,
    /// Text records
    Text,
    /// Structured records
    Json,
    /// Metric samples
    Metrics,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadKind::Raw => "raw",
            PayloadKind::Text => "text",
            PayloadKind::Json => "json",
            PayloadKind::Metrics => "metrics",
        };
        write!(f, "{name}")
    }
}
