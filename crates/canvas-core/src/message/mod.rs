//! Message domain module.
//!
//! # Module Structure
//!
//! - `model`: The conversation record (`Message`) and its draft form
//! - `scope`: Conversation scope (`ScopeType`, `ScopeKey`)
//! - `event`: Push-feed events (`PushOp`, `PushEvent`)

mod event;
mod model;
mod scope;

pub use event::{PushEvent, PushOp};
pub use model::{Message, MessageDraft, MessagePatch, SenderRole};
pub use scope::{ScopeKey, ScopeType};
