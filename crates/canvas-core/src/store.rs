//! Durable message store interface.

use async_trait::async_trait;

use crate::error::Result;
use crate::message::{Message, MessageDraft, MessagePatch, ScopeType};

/// The hosted durable store.
///
/// The engine calls these operations but does not implement them; the
/// infrastructure crate provides an in-memory implementation. Implementations
/// assign ids and monotonically increasing `created_at` timestamps, persist the
/// draft's `client_ref`, and echo every write to the push feed.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Writes a new record and returns its durable id.
    async fn create(&self, draft: &MessageDraft) -> Result<String>;

    /// Fetches a record by its durable id.
    ///
    /// - `Ok(Some(message))`: record found
    /// - `Ok(None)`: no record with that id
    async fn fetch_by_id(&self, id: &str) -> Result<Option<Message>>;

    /// Applies a patch and returns the updated record.
    async fn update(&self, id: &str, patch: &MessagePatch) -> Result<Message>;

    /// Deletes a record. Returns `false` when it did not exist.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Lists the records of a scope in `created_at` order.
    async fn query(&self, scope_type: ScopeType, scope_id: Option<&str>) -> Result<Vec<Message>>;
}
