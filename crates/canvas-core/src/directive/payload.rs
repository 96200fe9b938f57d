//! The structured payload carried inside a document-edit directive.

use serde::{Deserialize, Serialize};

use crate::error::{CanvasError, Result};

/// What the assistant wants done to the referenced document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EditAction {
    Replace,
    Insert,
    Append,
    Delete,
}

/// A document edit proposed by the assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentEdit {
    pub action: EditAction,
    /// Anchor text or section the edit applies to.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub content: String,
    /// Short human-readable description of the change.
    #[serde(default)]
    pub summary: Option<String>,
}

impl DocumentEdit {
    /// Decodes and validates the raw text between the payload markers.
    pub fn from_payload(raw: &str) -> Result<Self> {
        let edit: DocumentEdit = serde_json::from_str(raw.trim())
            .map_err(|e| CanvasError::MalformedDirective(format!("payload is not a document edit: {}", e)))?;
        edit.validate()?;
        Ok(edit)
    }

    fn validate(&self) -> Result<()> {
        let has_target = self.target.as_deref().is_some_and(|t| !t.trim().is_empty());
        match self.action {
            EditAction::Delete | EditAction::Replace if !has_target => Err(
                CanvasError::MalformedDirective(format!("{} edit requires a target", self.action)),
            ),
            EditAction::Replace | EditAction::Insert | EditAction::Append
                if self.content.is_empty() =>
            {
                Err(CanvasError::MalformedDirective(format!(
                    "{} edit requires content",
                    self.action
                )))
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_append_edit() {
        let edit = DocumentEdit::from_payload(
            r#" {"action":"append","content":"New closing paragraph.","summary":"add outro"} "#,
        )
        .unwrap();
        assert_eq!(edit.action, EditAction::Append);
        assert_eq!(edit.content, "New closing paragraph.");
        assert_eq!(edit.summary.as_deref(), Some("add outro"));
        assert!(edit.target.is_none());
    }

    #[test]
    fn rejects_invalid_json() {
        let err = DocumentEdit::from_payload("{bad json").unwrap_err();
        assert!(matches!(err, CanvasError::MalformedDirective(_)));
    }

    #[test]
    fn rejects_unknown_action() {
        assert!(DocumentEdit::from_payload(r#"{"action":"rewrite","content":"x"}"#).is_err());
    }

    #[test]
    fn delete_needs_target_but_not_content() {
        assert!(DocumentEdit::from_payload(r#"{"action":"delete"}"#).is_err());
        let edit = DocumentEdit::from_payload(r#"{"action":"delete","target":"Intro"}"#).unwrap();
        assert_eq!(edit.target.as_deref(), Some("Intro"));
    }

    #[test]
    fn replace_needs_target_and_content() {
        assert!(DocumentEdit::from_payload(r#"{"action":"replace","content":"x"}"#).is_err());
        assert!(DocumentEdit::from_payload(r#"{"action":"replace","target":"t"}"#).is_err());
        assert!(
            DocumentEdit::from_payload(r#"{"action":"replace","target":"t","content":"x"}"#).is_ok()
        );
    }
}
