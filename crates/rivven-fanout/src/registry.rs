//! Subscriber registry
//!
//! Append-only list of subscribers keyed by id. One mutex guards both the
//! list and every dispatch to its members, so a subscriber never sees two
//! mutations at once and a concurrent `add` cannot race a dispatch.

use parking_lot::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::error::{FanoutError, Result};
use crate::event::SubscriberId;
use crate::subscriber::{Subscriber, SubscriberDescriptor, SubscriberFactory};

/// Registered subscribers
#[derive(Default)]
pub struct SubscriberRegistry {
    subscribers: Mutex<Vec<Box<dyn Subscriber>>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber. Returns `false` and leaves the registry
    /// unchanged when the id is already taken.
    pub fn add(&self, subscriber: Box<dyn Subscriber>) -> bool {
        let mut subscribers = self.subscribers.lock();
        let id = subscriber.id();
        if subscribers.iter().any(|s| s.id() == id) {
            warn!(subscriber = id, "Subscriber already registered");
            return false;
        }
        subscribers.push(subscriber);
        info!(subscriber = id, "Subscriber registered");
        true
    }

    /// Connect a subscriber through `factory` and register it.
    pub async fn connect(
        &self,
        descriptor: &SubscriberDescriptor,
        factory: &dyn SubscriberFactory,
    ) -> Result<()> {
        if self.contains(descriptor.id) {
            return Err(FanoutError::DuplicateSubscriber(descriptor.id));
        }
        let subscriber = factory.connect(descriptor).await?;
        if self.add(subscriber) {
            Ok(())
        } else {
            Err(FanoutError::DuplicateSubscriber(descriptor.id))
        }
    }

    /// Run `f` on the subscriber with `id`, if any.
    pub fn lookup<R>(&self, id: SubscriberId, f: impl FnOnce(&mut dyn Subscriber) -> R) -> Option<R> {
        self.lock().get_mut(id).map(f)
    }

    pub fn contains(&self, id: SubscriberId) -> bool {
        self.subscribers.lock().iter().any(|s| s.id() == id)
    }

    /// `false` for unknown ids
    pub fn is_connected(&self, id: SubscriberId) -> bool {
        self.lookup(id, |s| s.is_connected()).unwrap_or(false)
    }

    /// Registered ids in registration order
    pub fn ids(&self) -> Vec<SubscriberId> {
        self.subscribers.lock().iter().map(|s| s.id()).collect()
    }

    pub fn len(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.lock().is_empty()
    }

    /// Hold the registry lock for a dispatch.
    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard {
            subscribers: self.subscribers.lock(),
        }
    }
}

/// Exclusive access to the registered subscribers.
pub struct RegistryGuard<'a> {
    subscribers: MutexGuard<'a, Vec<Box<dyn Subscriber>>>,
}

impl RegistryGuard<'_> {
    pub fn get_mut(&mut self, id: SubscriberId) -> Option<&mut dyn Subscriber> {
        self.subscribers
            .iter_mut()
            .find(|s| s.id() == id)
            .map(|s| s.as_mut() as &mut dyn Subscriber)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::LogSubscriberFactory;
    use crate::testing::RecordingSubscriber;

    #[test]
    fn test_duplicate_id_is_rejected() {
        let registry = SubscriberRegistry::new();
        let (first, first_calls) = RecordingSubscriber::new(7);
        let (second, _) = RecordingSubscriber::new(7);

        assert!(registry.add(Box::new(first)));
        assert!(!registry.add(Box::new(second)));
        assert_eq!(registry.len(), 1);

        // the original registration is kept
        registry.lookup(7, |s| s.delete("t", &Default::default()).unwrap());
        assert_eq!(first_calls.lock().len(), 1);
    }

    #[test]
    fn test_missing_subscriber_is_not_connected() {
        let registry = SubscriberRegistry::new();
        assert!(!registry.is_connected(1));
        assert!(registry.lookup(1, |_| ()).is_none());

        let (subscriber, _) = RecordingSubscriber::new(1);
        let connected = subscriber.connected_flag();
        registry.add(Box::new(subscriber));
        assert!(registry.is_connected(1));

        connected.set(false);
        assert!(!registry.is_connected(1));
    }

    #[test]
    fn test_ids_keep_registration_order() {
        let registry = SubscriberRegistry::new();
        for id in [3, 1, 2] {
            registry.add(Box::new(RecordingSubscriber::new(id).0));
        }
        assert_eq!(registry.ids(), vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn test_connect_through_factory() {
        let registry = SubscriberRegistry::new();
        let factory = LogSubscriberFactory::default();
        let descriptor = SubscriberDescriptor::new(5, "app", "localhost", 27017);

        registry.connect(&descriptor, &factory).await.unwrap();
        assert!(registry.is_connected(5));

        let err = registry.connect(&descriptor, &factory).await.unwrap_err();
        assert!(matches!(err, FanoutError::DuplicateSubscriber(5)));
    }
}
