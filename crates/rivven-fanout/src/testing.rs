//! Testing utilities
//!
//! [`RecordingSubscriber`] keeps every mutation it receives in a shared log
//! so tests can assert on dispatch order after the fact.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{FanoutError, Result};
use crate::event::{ChangeAction, Document, SubscriberId};
use crate::subscriber::Subscriber;

/// One mutation seen by a [`RecordingSubscriber`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub subscriber: SubscriberId,
    pub action: ChangeAction,
    pub collection: String,
    pub document: Option<Document>,
    pub filter: Option<Document>,
}

/// Shared call log
pub type CallLog = Arc<Mutex<Vec<RecordedCall>>>;

/// Toggle shared with a [`RecordingSubscriber`]
#[derive(Debug, Clone)]
pub struct Switch(Arc<AtomicBool>);

impl Switch {
    fn new(value: bool) -> Self {
        Self(Arc::new(AtomicBool::new(value)))
    }

    pub fn set(&self, value: bool) {
        self.0.store(value, Ordering::SeqCst);
    }

    pub fn get(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Subscriber that records calls instead of writing anywhere.
pub struct RecordingSubscriber {
    id: SubscriberId,
    calls: CallLog,
    connected: Switch,
    failing: Switch,
}

impl RecordingSubscriber {
    /// Create a connected subscriber with its own log.
    pub fn new(id: SubscriberId) -> (Self, CallLog) {
        let calls = CallLog::default();
        (Self::with_log(id, calls.clone()), calls)
    }

    /// Create a subscriber appending to an existing log.
    pub fn with_log(id: SubscriberId, calls: CallLog) -> Self {
        Self {
            id,
            calls,
            connected: Switch::new(true),
            failing: Switch::new(false),
        }
    }

    /// Controls what `is_connected` reports
    pub fn connected_flag(&self) -> Switch {
        self.connected.clone()
    }

    /// While set, every mutation is recorded and then fails
    pub fn failing_flag(&self) -> Switch {
        self.failing.clone()
    }

    fn record(
        &mut self,
        action: ChangeAction,
        collection: &str,
        document: Option<&Document>,
        filter: Option<&Document>,
    ) -> Result<()> {
        self.calls.lock().push(RecordedCall {
            subscriber: self.id,
            action,
            collection: collection.to_string(),
            document: document.cloned(),
            filter: filter.cloned(),
        });
        if self.failing.get() {
            return Err(FanoutError::subscriber(self.id, "injected failure"));
        }
        Ok(())
    }
}

impl Subscriber for RecordingSubscriber {
    fn id(&self) -> SubscriberId {
        self.id
    }

    fn is_connected(&self) -> bool {
        self.connected.get()
    }

    fn insert(&mut self, collection: &str, document: &Document) -> Result<()> {
        self.record(ChangeAction::Insert, collection, Some(document), None)
    }

    fn update(&mut self, collection: &str, document: &Document, filter: &Document) -> Result<()> {
        self.record(ChangeAction::Update, collection, Some(document), Some(filter))
    }

    fn delete(&mut self, collection: &str, filter: &Document) -> Result<()> {
        self.record(ChangeAction::Delete, collection, None, Some(filter))
    }
}
