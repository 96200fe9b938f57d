//! Conversation message types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ScopeKey, ScopeType};

/// Who authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SenderRole {
    /// Message from the user.
    User,
    /// Message from the coaching assistant.
    Assistant,
}

/// A single message in a conversation.
///
/// Before durability `id` is a client-generated temporary id (or a stream
/// session id); afterwards it is the globally unique id assigned by the store.
/// `created_at` is assigned by the durable store and defines display order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub content: String,
    pub sender_role: SenderRole,
    #[serde(default)]
    pub scope_type: ScopeType,
    #[serde(default)]
    pub scope_id: Option<String>,
    /// Pins the message to a specific version of the referenced artifact.
    #[serde(default)]
    pub scope_version_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited: bool,
    /// Temporary id or stream session id the client created this record under.
    #[serde(default)]
    pub client_ref: Option<String>,
}

impl Message {
    /// Materializes a draft under the given id and timestamp.
    pub fn from_draft(id: impl Into<String>, draft: &MessageDraft, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            content: draft.content.clone(),
            sender_role: draft.sender_role,
            scope_type: draft.scope.scope_type,
            scope_id: draft.scope.scope_id.clone(),
            scope_version_ref: draft.scope_version_ref.clone(),
            created_at,
            edited: false,
            client_ref: draft.client_ref.clone(),
        }
    }

    pub fn scope(&self) -> ScopeKey {
        ScopeKey::new(self.scope_type, self.scope_id.clone())
    }

    pub fn belongs_to(&self, scope: &ScopeKey) -> bool {
        self.scope_type == scope.scope_type && self.scope_id == scope.scope_id
    }

    /// Content-level equality, ignoring identity and timestamps.
    pub fn same_payload(&self, other: &Message) -> bool {
        self.content == other.content && self.edited == other.edited
    }
}

/// A message that has not been written to the durable store yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageDraft {
    pub content: String,
    pub sender_role: SenderRole,
    #[serde(default)]
    pub scope: ScopeKey,
    #[serde(default)]
    pub scope_version_ref: Option<String>,
    #[serde(default)]
    pub client_ref: Option<String>,
}

impl MessageDraft {
    pub fn user(content: impl Into<String>, scope: ScopeKey) -> Self {
        Self {
            content: content.into(),
            sender_role: SenderRole::User,
            scope,
            scope_version_ref: None,
            client_ref: None,
        }
    }

    /// An empty assistant reply, used as the placeholder of a stream.
    pub fn assistant(scope: ScopeKey) -> Self {
        Self {
            content: String::new(),
            sender_role: SenderRole::Assistant,
            scope,
            scope_version_ref: None,
            client_ref: None,
        }
    }

    pub fn with_version_ref(mut self, version_ref: impl Into<String>) -> Self {
        self.scope_version_ref = Some(version_ref.into());
        self
    }

    pub fn with_client_ref(mut self, client_ref: impl Into<String>) -> Self {
        self.client_ref = Some(client_ref.into());
        self
    }
}

/// Partial update sent to the durable store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePatch {
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub edited: Option<bool>,
}

impl MessagePatch {
    /// A content edit, which also flags the message as edited.
    pub fn edit(content: impl Into<String>) -> Self {
        Self {
            content: Some(content.into()),
            edited: Some(true),
        }
    }

    pub fn apply_to(&self, message: &mut Message) {
        if let Some(content) = &self.content {
            message.content = content.clone();
        }
        if let Some(edited) = self.edited {
            message.edited = edited;
        }
    }
}
