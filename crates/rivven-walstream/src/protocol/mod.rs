//! PostgreSQL streaming replication protocol
//!
//! - [`wire`] - backend message framing
//! - [`message`] - XLogData / keepalive frames and standby status updates
//! - [`command`] - `START_REPLICATION` and `IDENTIFY_SYSTEM`

pub mod command;
pub mod message;
pub mod wire;

pub use command::*;
pub use message::*;
pub use wire::{BackendMessage, MAX_MESSAGE_SIZE};
