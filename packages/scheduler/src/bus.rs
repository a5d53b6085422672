//! Typed in-process event bus.
//!
//! # Guarantees
//!
//! - **Publishers never block**: `publish` hands the event to each
//!   subscriber's unbounded channel and returns.
//! - **Per-subscriber ordering**: each subscriber drains its own channel in
//!   a dedicated task, so it sees events of its type in publish order.
//! - **Isolation**: a subscriber that returns an error (or hangs) cannot
//!   poison another; handler errors are logged and swallowed.
//! - **In-memory only**: nothing is persisted and late subscribers miss
//!   earlier events. Durable coordination belongs to the job and schedule
//!   rows, which is why the scheduler's completion *poll* is the source of
//!   truth and the event path is an optimisation.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::mpsc;
use tracing::warn;

/// Marker for values that can travel on the bus. Blanket-implemented for
/// any cloneable `'static` type.
pub trait Event: Any + Clone + Send + Sync + 'static {}
impl<T: Any + Clone + Send + Sync + 'static> Event for T {}

type AnyEvent = Arc<dyn Any + Send + Sync>;

struct Slot {
    id: u64,
    tx: mpsc::UnboundedSender<AnyEvent>,
}

#[derive(Default)]
struct Registry {
    slots: HashMap<TypeId, Vec<Slot>>,
}

/// Typed fire-and-forget pub/sub. Cheap to clone; clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
    next_id: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of type `E`.
    ///
    /// The handler runs in its own task and receives events in publish
    /// order. Must be called from within a tokio runtime.
    pub fn subscribe<E, F, Fut>(&self, handler: F) -> Subscription
    where
        E: Event,
        F: Fn(E) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<AnyEvent>();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .slots
            .entry(TypeId::of::<E>())
            .or_default()
            .push(Slot { id, tx });

        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(event) = event.downcast_ref::<E>() else {
                    continue;
                };
                if let Err(error) = handler(event.clone()).await {
                    warn!(
                        event = std::any::type_name::<E>(),
                        %error,
                        "event subscriber failed"
                    );
                }
            }
        });

        Subscription {
            registry: Arc::downgrade(&self.registry),
            type_id: TypeId::of::<E>(),
            id,
        }
    }

    /// Deliver `event` to every current subscriber of its type, in
    /// registration order. Returns the number of subscribers reached.
    pub fn publish<E: Event>(&self, event: E) -> usize {
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let Some(slots) = registry.slots.get_mut(&TypeId::of::<E>()) else {
            return 0;
        };

        let mut delivered = 0;
        slots.retain(|slot| {
            let alive = slot.tx.send(Arc::new(event.clone())).is_ok();
            if alive {
                delivered += 1;
            }
            alive
        });
        delivered
    }

    /// Number of live subscribers for an event type.
    pub fn subscriber_count<E: Event>(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .slots
            .get(&TypeId::of::<E>())
            .map_or(0, |slots| slots.len())
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let total: usize = registry.slots.values().map(Vec::len).sum();
        f.debug_struct("EventBus")
            .field("subscriber_count", &total)
            .finish()
    }
}

/// Handle returned by [`EventBus::subscribe`]. Removing the subscriber is
/// explicit and idempotent; dropping the handle leaves the subscription in
/// place for the life of the process.
pub struct Subscription {
    registry: Weak<Mutex<Registry>>,
    type_id: TypeId,
    id: u64,
}

impl Subscription {
    /// Remove the subscriber. Safe to call more than once.
    pub fn unsubscribe(&self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        let mut registry = registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(slots) = registry.slots.get_mut(&self.type_id) {
            slots.retain(|slot| slot.id != self.id);
        }
    }
}
