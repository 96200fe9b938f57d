//! Conversation scope types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The conversational context a message belongs to.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ScopeType {
    /// General thread, not tied to any artifact.
    #[default]
    None,
    Document,
    Project,
    Capture,
    Ask,
    Reflect,
}

/// Identifies one conversation: a scope type plus an optional scope id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ScopeKey {
    pub scope_type: ScopeType,
    #[serde(default)]
    pub scope_id: Option<String>,
}

impl ScopeKey {
    pub fn new(scope_type: ScopeType, scope_id: Option<String>) -> Self {
        Self {
            scope_type,
            scope_id,
        }
    }

    /// The scope-free general thread.
    pub fn general() -> Self {
        Self::default()
    }

    /// Shorthand for a scope bound to a concrete artifact id.
    pub fn of(scope_type: ScopeType, scope_id: impl Into<String>) -> Self {
        Self::new(scope_type, Some(scope_id.into()))
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scope_id {
            Some(id) => write!(f, "{}:{}", self.scope_type, id),
            None => write!(f, "{}", self.scope_type),
        }
    }
}
