//! Observer subscriptions between sources and sinks
//!
//! Source-to-sink wiring yields disposable [`Subscription`] tokens whose
//! drop severs the link. The manager owns every token created during a
//! load cycle and releases them all on stop. Sinks hold no back-reference
//! to their sources; the publisher side owns the only link.

use crate::component::EventSink;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error};
use virta_core::{Envelope, Payload};

struct BusInner {
    subscribers: Mutex<Vec<(u64, Arc<dyn EventSink>)>>,
    next_token: AtomicU64,
}

/// Shared publisher helper embedded by event sources and pipes
///
/// Fan-out is sequential per publish call; each subscriber receives a
/// clone of the envelope. Delivery failures are logged and do not stop
/// delivery to the remaining subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: Mutex::new(Vec::new()),
                next_token: AtomicU64::new(0),
            }),
        }
    }

    /// Attach a sink; the returned token severs the link when dropped
    pub fn subscribe(&self, sink: Arc<dyn EventSink>) -> Subscription {
        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((token, sink));
        debug!(token, "subscriber attached");
        Subscription {
            token,
            bus: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver an envelope to every subscriber
    ///
    /// Returns the number of successful deliveries.
    pub async fn publish(&self, envelope: Envelope<Payload>) -> usize {
        let sinks: Vec<Arc<dyn EventSink>> = self
            .inner
            .subscribers
            .lock()
            .iter()
            .map(|(_, sink)| Arc::clone(sink))
            .collect();

        let mut delivered = 0;
        for sink in sinks {
            match sink.receive(envelope.clone()).await {
                Ok(()) => delivered += 1,
                Err(e) => error!(error = %e, "subscriber rejected envelope"),
            }
        }
        delivered
    }

    /// Number of currently attached subscribers
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Disposable link between a source and a sink
///
/// Dropping the token removes the sink from the source's subscriber list.
/// If the source is already gone the drop is a no-op.
pub struct Subscription {
    token: u64,
    bus: Weak<BusInner>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.lock().retain(|(t, _)| *t != self.token);
            debug!(token = self.token, "subscriber detached");
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Subscription({})", self.token)
    }
}
