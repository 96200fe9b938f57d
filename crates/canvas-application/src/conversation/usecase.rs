//! User-facing conversation commands.
//!
//! `ConversationUseCase` coordinates the durable store with the conversation
//! actor: every command first touches the store, then reports the result to
//! the reconciler through the actor's event API.

use canvas_core::config::ReconcilerConfig;
use canvas_core::message::{Message, MessageDraft, MessagePatch, ScopeKey};
use canvas_core::store::MessageStore;
use canvas_core::{CanvasError, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::actor::ConversationHandle;
use crate::reconciler::ReconcileOutcome;

/// Acknowledgement of `edit_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditAck {
    pub message_id: String,
    pub record: Message,
    pub outcome: ReconcileOutcome,
}

/// Acknowledgement of `delete_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteAck {
    pub message_id: String,
    /// `false` when the store no longer had the record.
    pub deleted: bool,
    pub outcome: ReconcileOutcome,
}

/// Use case for sending, editing and deleting messages of one conversation.
pub struct ConversationUseCase {
    store: Arc<dyn MessageStore>,
    conversation: ConversationHandle,
    confirmation_timeout: Duration,
}

impl ConversationUseCase {
    pub fn new(store: Arc<dyn MessageStore>, conversation: ConversationHandle, config: &ReconcilerConfig) -> Self {
        Self {
            store,
            conversation,
            confirmation_timeout: config.confirmation_timeout(),
        }
    }

    pub fn conversation(&self) -> &ConversationHandle {
        &self.conversation
    }

    /// Loads the stored history of `scope` into the canonical list.
    ///
    /// Returns the number of records that were not already present.
    pub async fn open_conversation(&self, scope: &ScopeKey) -> Result<usize> {
        let records = self
            .store
            .query(scope.scope_type, scope.scope_id.as_deref())
            .await?;
        tracing::debug!(
            "[ConversationUseCase] loaded {} records for scope {}",
            records.len(),
            scope
        );
        self.conversation.seed(records).await
    }

    /// Sends a user message.
    ///
    /// The message appears in the canonical list immediately under a temporary
    /// id and is replaced by the durable record once the store confirms it.
    ///
    /// # Errors
    ///
    /// Returns `CanvasError::Durability` when the write fails or is not
    /// confirmed in time. The optimistic entry has been rolled back by then.
    pub async fn send(&self, text: &str, scope: ScopeKey) -> Result<Message> {
        self.send_draft(MessageDraft::user(text, scope)).await
    }

    /// Sends a user message pinned to one version of the scope's artifact.
    pub async fn send_pinned(&self, text: &str, scope: ScopeKey, version_ref: &str) -> Result<Message> {
        self.send_draft(MessageDraft::user(text, scope).with_version_ref(version_ref))
            .await
    }

    async fn send_draft(&self, draft: MessageDraft) -> Result<Message> {
        let temp_id = format!("tmp-{}", Uuid::new_v4());
        let draft = draft.with_client_ref(&temp_id);

        self.conversation
            .apply_optimistic(&temp_id, draft.clone())
            .await?;

        let persisted = tokio::time::timeout(self.confirmation_timeout, self.persist(&draft)).await;
        let failure = match persisted {
            Ok(Ok(record)) => {
                self.conversation.confirm(&temp_id, record.clone()).await?;
                return Ok(record);
            }
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!(
                "no confirmation within {}ms",
                self.confirmation_timeout.as_millis()
            ),
        };

        self.conversation.durability_failed(&temp_id).await?;
        tracing::warn!("[ConversationUseCase] send failed for '{}': {}", temp_id, failure);
        Err(CanvasError::durability(temp_id, failure))
    }

    /// Edits the content of a durable message.
    pub async fn edit_message(&self, message_id: &str, new_text: &str) -> Result<EditAck> {
        let record = self
            .store
            .update(message_id, &MessagePatch::edit(new_text))
            .await?;
        let outcome = self.conversation.apply_local_update(record.clone()).await?;
        Ok(EditAck {
            message_id: message_id.to_string(),
            record,
            outcome,
        })
    }

    /// Deletes a durable message.
    ///
    /// The local removal is applied even when the store reports the record as
    /// already gone, so the canonical list converges either way.
    pub async fn delete_message(&self, message_id: &str) -> Result<DeleteAck> {
        let deleted = self.store.delete(message_id).await?;
        let outcome = self.conversation.apply_local_delete(message_id).await?;
        Ok(DeleteAck {
            message_id: message_id.to_string(),
            deleted,
            outcome,
        })
    }

    async fn persist(&self, draft: &MessageDraft) -> Result<Message> {
        let id = self.store.create(draft).await?;
        self.store
            .fetch_by_id(&id)
            .await?
            .ok_or_else(|| CanvasError::not_found("Message", id))
    }
}
