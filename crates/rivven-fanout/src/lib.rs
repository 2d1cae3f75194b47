//! # rivven-fanout - change event routing
//!
//! Reads JSON change events from a PostgreSQL logical replication slot and
//! applies each one to the downstream subscribers it names.
//!
//! ```text
//! ┌──────────────┐ payload ┌──────────────┐ insert/update/delete ┌────────────┐
//! │ Bridge thread│───────▶ │ ChangeRouter │────────────────────▶ │ Subscriber │
//! │ (Supervisor) │         └──────┬───────┘                      └────────────┘
//! └──────────────┘                │ lock
//!                          ┌──────▼─────────────┐
//!                          │ SubscriberRegistry │ ◀── connect() from other threads
//!                          └────────────────────┘
//! ```

pub mod bridge;
pub mod config;
pub mod error;
pub mod event;
pub mod registry;
pub mod router;
pub mod subscriber;
pub mod testing;

pub use bridge::{Bridge, BridgeHandle};
pub use config::{FanoutConfig, RouterSettings};
pub use error::{ErrorCategory, FanoutError, Result};
pub use event::{ChangeAction, ChangeEvent, Document, Mutation, SubscriberId};
pub use registry::{RegistryGuard, SubscriberRegistry};
pub use router::{ChangeRouter, DispatchLocking, RouterStats};
pub use subscriber::{
    LogSubscriber, LogSubscriberFactory, Subscriber, SubscriberDescriptor, SubscriberFactory,
};
