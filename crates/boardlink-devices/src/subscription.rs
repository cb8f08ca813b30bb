/*!
 * Telemetry subscriptions.
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};

use boardlink_core::telemetry::TelemetrySample;

/// Stream name that matches every telemetry stream
pub const ALL_STREAMS: &str = "*";

/// Callback invoked for each matching sample, on the reading task
pub type Handler = Arc<dyn Fn(&TelemetrySample) + Send + Sync>;

/// Stream name to handlers; shared by a session and its read task
#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: AtomicU64,
    handlers: RwLock<HashMap<String, Vec<(u64, Handler)>>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `handler` for `stream` (or [`ALL_STREAMS`])
    pub fn subscribe<F>(self: &Arc<Self>, stream: &str, handler: F) -> Subscription
    where
        F: Fn(&TelemetrySample) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(stream.to_string())
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            registry: Arc::downgrade(self),
            stream: stream.to_string(),
            id,
            active: true,
        }
    }

    /// Deliver `sample` to its stream's handlers, then to wildcard handlers
    ///
    /// Handlers run outside the registry lock and may unsubscribe themselves.
    pub fn dispatch(&self, sample: &TelemetrySample) -> usize {
        let targets: Vec<Handler> = {
            let handlers = self.handlers.read().unwrap_or_else(PoisonError::into_inner);
            let specific = handlers.get(&sample.channel).into_iter().flatten();
            let wildcard = if sample.channel == ALL_STREAMS {
                None
            } else {
                handlers.get(ALL_STREAMS)
            };
            specific
                .chain(wildcard.into_iter().flatten())
                .map(|(_, handler)| handler.clone())
                .collect()
        };
        for handler in &targets {
            handler(sample);
        }
        targets.len()
    }

    fn remove(&self, stream: &str, id: u64) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let Some(list) = handlers.get_mut(stream) else {
            return false;
        };
        let before = list.len();
        list.retain(|(handler_id, _)| *handler_id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            handlers.remove(stream);
        }
        removed
    }

    /// Drop every handler
    pub fn clear(&self) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Whether no handler is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("handlers", &self.len())
            .finish()
    }
}

/// Token for one registered handler; dropping it unsubscribes
#[must_use = "dropping a subscription unsubscribes it"]
pub struct Subscription {
    registry: Weak<SubscriptionRegistry>,
    stream: String,
    id: u64,
    active: bool,
}

impl Subscription {
    /// Stream this subscription listens to
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Deregister the handler now
    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.stream, self.id);
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("stream", &self.stream)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}
