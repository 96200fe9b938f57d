//! Conversation ownership and user commands.
//!
//! - `actor`: single task owning the reconciler and stream tracker
//! - `usecase`: send / edit / delete against the durable store

mod actor;
mod usecase;

pub use actor::{ConversationCommand, ConversationHandle, ConversationView};
pub use usecase::{ConversationUseCase, DeleteAck, EditAck};
