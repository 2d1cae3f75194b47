//! Change events
//!
//! The output plugin emits one JSON object per change:
//!
//! ```json
//! { "subsribers": [7, 9], "a": 0, "r": "public.orders", "d": {"_id": 1}, "c": {"_id": 1} }
//! ```
//!
//! | field        | meaning                                         |
//! |--------------|-------------------------------------------------|
//! | `subsribers` | target subscriber ids, in dispatch order        |
//! | `a`          | action: 0 = insert, 1 = update, 2 = delete      |
//! | `r`          | relation, possibly schema-qualified             |
//! | `d`          | document (insert, update)                       |
//! | `c`          | match clause (update, delete)                   |
//!
//! The field name `subsribers` is what the plugin emits; `subscribers` is
//! accepted as well.

use serde::Deserialize;
use serde_json::Value;
use std::fmt;

use crate::error::{FanoutError, Result};

/// Subscriber identifier carried in events
pub type SubscriberId = i64;

/// A JSON object passed to a subscriber
pub type Document = serde_json::Map<String, Value>;

/// Action code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeAction {
    Insert,
    Update,
    Delete,
}

impl TryFrom<i64> for ChangeAction {
    type Error = FanoutError;

    fn try_from(code: i64) -> Result<Self> {
        match code {
            0 => Ok(Self::Insert),
            1 => Ok(Self::Update),
            2 => Ok(Self::Delete),
            other => Err(FanoutError::invalid_event(format!(
                "unknown action code {other}"
            ))),
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => f.write_str("insert"),
            Self::Update => f.write_str("update"),
            Self::Delete => f.write_str("delete"),
        }
    }
}

/// What to do to the target collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Insert { document: Document },
    Update { document: Document, filter: Document },
    Delete { filter: Document },
}

impl Mutation {
    pub fn action(&self) -> ChangeAction {
        match self {
            Self::Insert { .. } => ChangeAction::Insert,
            Self::Update { .. } => ChangeAction::Update,
            Self::Delete { .. } => ChangeAction::Delete,
        }
    }
}

/// Event as it appears on the wire
#[derive(Debug, Deserialize)]
struct RawEvent {
    #[serde(rename = "subsribers", alias = "subscribers")]
    subscribers: Vec<SubscriberId>,
    a: i64,
    r: String,
    #[serde(default)]
    d: Option<Value>,
    #[serde(default)]
    c: Option<Value>,
}

/// A decoded change event.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    /// Target subscribers, in order
    pub subscribers: Vec<SubscriberId>,
    /// Relation name without schema qualification
    pub collection: String,
    pub mutation: Mutation,
}

impl ChangeEvent {
    /// Decode a payload and check it carries what its action needs.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let raw: RawEvent = serde_json::from_slice(payload)?;
        let action = ChangeAction::try_from(raw.a)?;

        let mutation = match action {
            ChangeAction::Insert => Mutation::Insert {
                document: object_field(raw.d, "d", action)?,
            },
            ChangeAction::Update => Mutation::Update {
                document: object_field(raw.d, "d", action)?,
                filter: object_field(raw.c, "c", action)?,
            },
            ChangeAction::Delete => Mutation::Delete {
                filter: object_field(raw.c, "c", action)?,
            },
        };

        Ok(Self {
            subscribers: raw.subscribers,
            collection: strip_schema(&raw.r).to_string(),
            mutation,
        })
    }
}

fn object_field(value: Option<Value>, name: &str, action: ChangeAction) -> Result<Document> {
    match value {
        Some(Value::Object(map)) => Ok(map),
        Some(_) => Err(FanoutError::invalid_event(format!(
            "{action} requires \"{name}\" to be an object"
        ))),
        None => Err(FanoutError::invalid_event(format!(
            "{action} requires \"{name}\""
        ))),
    }
}

/// Drop everything up to and including the last `.`.
pub fn strip_schema(relation: &str) -> &str {
    match relation.rfind('.') {
        Some(pos) => &relation[pos + 1..],
        None => relation,
    }
}
