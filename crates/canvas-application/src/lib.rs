//! Application layer of the canvas conversation engine.
//!
//! The [`reconciler::IdentityReconciler`] and the [`stream::StreamSessionTracker`]
//! are owned by a single conversation actor ([`conversation::ConversationHandle`]);
//! everything else talks to them through commands.

pub mod conversation;
pub mod reconciler;
pub mod stream;
pub mod subscription;

pub use conversation::{ConversationHandle, ConversationUseCase, ConversationView, DeleteAck, EditAck};
pub use reconciler::{IdentityReconciler, IgnoreReason, ReconcileOutcome};
pub use stream::{StreamSessionTracker, StreamState};
pub use subscription::{ContextSubscriptionManager, SubscriptionState};
