use serde::{Deserialize, Serialize};

use super::Message;

/// Operation carried by a push-feed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PushOp {
    Insert,
    Update,
    Delete,
}

/// One notification from the push feed.
///
/// Delivery is at-least-once and may duplicate or reorder relative to the
/// client's own writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushEvent {
    pub op: PushOp,
    pub record: Message,
}

impl PushEvent {
    pub fn insert(record: Message) -> Self {
        Self {
            op: PushOp::Insert,
            record,
        }
    }

    pub fn update(record: Message) -> Self {
        Self {
            op: PushOp::Update,
            record,
        }
    }

    pub fn delete(record: Message) -> Self {
        Self {
            op: PushOp::Delete,
            record,
        }
    }
}
