//! Change router
//!
//! Decodes each replication payload once and hands the mutation to every
//! subscriber the event names, in the order it names them. Nothing here
//! fails the stream: bad payloads and subscriber errors are logged and
//! counted, and the next payload is processed normally.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{FanoutError, Result};
use crate::event::{ChangeEvent, Mutation, SubscriberId};
use crate::registry::{RegistryGuard, SubscriberRegistry};
use crate::subscriber::Subscriber;

/// How long the registry lock is held while fanning out one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchLocking {
    /// One acquisition for the whole event
    #[default]
    PerEvent,
    /// One acquisition per target subscriber
    PerSubscriber,
}

/// Router counters
#[derive(Debug, Default)]
pub struct RouterStats {
    events_received: AtomicU64,
    decode_errors: AtomicU64,
    invalid_events: AtomicU64,
    mutations_dispatched: AtomicU64,
    subscribers_skipped: AtomicU64,
    dispatch_failures: AtomicU64,
}

impl RouterStats {
    fn record_rejected(&self, err: &FanoutError) {
        match err {
            FanoutError::Decode(_) => self.decode_errors.fetch_add(1, Ordering::Relaxed),
            _ => self.invalid_events.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    /// Payloads that were not JSON or lacked required fields
    pub fn decode_errors(&self) -> u64 {
        self.decode_errors.load(Ordering::Relaxed)
    }

    /// Events with an unknown action or a missing document/filter
    pub fn invalid_events(&self) -> u64 {
        self.invalid_events.load(Ordering::Relaxed)
    }

    pub fn mutations_dispatched(&self) -> u64 {
        self.mutations_dispatched.load(Ordering::Relaxed)
    }

    /// Targets that were unknown or disconnected
    pub fn subscribers_skipped(&self) -> u64 {
        self.subscribers_skipped.load(Ordering::Relaxed)
    }

    pub fn dispatch_failures(&self) -> u64 {
        self.dispatch_failures.load(Ordering::Relaxed)
    }
}

/// Routes decoded change events to registered subscribers.
pub struct ChangeRouter {
    registry: Arc<SubscriberRegistry>,
    locking: DispatchLocking,
    stats: Arc<RouterStats>,
}

impl ChangeRouter {
    pub fn new(registry: Arc<SubscriberRegistry>) -> Self {
        Self::with_locking(registry, DispatchLocking::default())
    }

    pub fn with_locking(registry: Arc<SubscriberRegistry>, locking: DispatchLocking) -> Self {
        Self {
            registry,
            locking,
            stats: Arc::new(RouterStats::default()),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    pub fn stats(&self) -> Arc<RouterStats> {
        self.stats.clone()
    }

    /// Apply one replication payload.
    pub fn apply(&self, payload: &[u8]) {
        self.stats.events_received.fetch_add(1, Ordering::Relaxed);

        let event = match ChangeEvent::decode(payload) {
            Ok(event) => event,
            Err(e) => {
                self.stats.record_rejected(&e);
                warn!(
                    error = %e,
                    payload = %String::from_utf8_lossy(payload),
                    "Skipping change event"
                );
                return;
            }
        };

        debug!(
            collection = %event.collection,
            action = %event.mutation.action(),
            targets = event.subscribers.len(),
            "Routing change event"
        );

        match self.locking {
            DispatchLocking::PerEvent => {
                let mut guard = self.registry.lock();
                for &id in &event.subscribers {
                    self.dispatch_one(&mut guard, id, &event);
                }
            }
            DispatchLocking::PerSubscriber => {
                for &id in &event.subscribers {
                    let mut guard = self.registry.lock();
                    self.dispatch_one(&mut guard, id, &event);
                }
            }
        }
    }

    fn dispatch_one(&self, guard: &mut RegistryGuard<'_>, id: SubscriberId, event: &ChangeEvent) {
        let subscriber = match guard.get_mut(id) {
            Some(s) if s.is_connected() => s,
            Some(_) => {
                self.stats.subscribers_skipped.fetch_add(1, Ordering::Relaxed);
                debug!(subscriber = id, "Subscriber not connected, skipping");
                return;
            }
            None => {
                self.stats.subscribers_skipped.fetch_add(1, Ordering::Relaxed);
                debug!(subscriber = id, "Unknown subscriber, skipping");
                return;
            }
        };

        match dispatch(subscriber, event) {
            Ok(()) => {
                self.stats
                    .mutations_dispatched
                    .fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.dispatch_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    subscriber = id,
                    collection = %event.collection,
                    error = %e,
                    "Subscriber rejected mutation"
                );
            }
        }
    }
}

fn dispatch(subscriber: &mut dyn Subscriber, event: &ChangeEvent) -> Result<()> {
    let collection = event.collection.as_str();
    match &event.mutation {
        Mutation::Insert { document } => subscriber.insert(collection, document),
        Mutation::Update { document, filter } => subscriber.update(collection, document, filter),
        Mutation::Delete { filter } => subscriber.delete(collection, filter),
    }
}
