//! Incremental detection of the document-edit directive.
//!
//! A directive looks like
//!
//! ```text
//! <document_edit><edit_payload>{"action":"append","content":"..."}</edit_payload></document_edit>
//! ```
//!
//! embedded anywhere in otherwise free-form assistant text. The parse state is a
//! pure function of the buffer, so the same buffer may be re-parsed on every
//! incoming chunk. For a strictly growing buffer the state only advances (or
//! jumps to `Malformed`); a marker that is still partially received at the tail
//! of the buffer never changes the state.

use serde::{Deserialize, Serialize};
use std::ops::Range;

use super::payload::DocumentEdit;

pub const DIRECTIVE_OPEN: &str = "<document_edit>";
pub const PAYLOAD_OPEN: &str = "<edit_payload>";
pub const PAYLOAD_CLOSE: &str = "</edit_payload>";
pub const DIRECTIVE_CLOSE: &str = "</document_edit>";

/// Parse state of a directive.
///
/// The derived ordering is the progression order, with `Malformed` last.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    Serialize,
    Deserialize,
    strum::Display,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum DirectiveState {
    #[default]
    None,
    Opening,
    PayloadInProgress,
    PayloadComplete,
    Closed,
    Malformed,
}

impl DirectiveState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Malformed)
    }

    /// A directive has started but not finished.
    pub fn is_pending(self) -> bool {
        matches!(
            self,
            Self::Opening | Self::PayloadInProgress | Self::PayloadComplete
        )
    }

    /// Whether `next` is a legal successor of `self` for a growing buffer.
    pub fn can_advance_to(self, next: DirectiveState) -> bool {
        self == next || (!self.is_terminal() && next > self)
    }
}

/// Result of scanning one directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectiveMatch {
    pub state: DirectiveState,
    /// Byte range of the directive in the scanned text, from the first byte
    /// of its begin marker to the end of its end marker. Without an end
    /// marker the range stops at the payload close, or at the end of the text
    /// while the payload is still open.
    pub span: Range<usize>,
    pub edit: Option<DocumentEdit>,
    pub error: Option<String>,
}

/// Parse outcome for the first directive of a buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DirectiveParse {
    pub state: DirectiveState,
    pub directive: Option<DirectiveMatch>,
}

impl DirectiveParse {
    pub fn edit(&self) -> Option<&DocumentEdit> {
        self.directive.as_ref().and_then(|d| d.edit.as_ref())
    }

    pub fn error(&self) -> Option<&str> {
        self.directive.as_ref().and_then(|d| d.error.as_deref())
    }
}

/// True once a complete begin marker is present.
pub fn contains_directive(text: &str) -> bool {
    text.contains(DIRECTIVE_OPEN)
}

/// Classifies the first directive of `text`.
///
/// Later directives do not influence the result; they are still picked up by
/// [`classify`](super::classify) for display.
pub fn parse_directive(text: &str) -> DirectiveParse {
    let begin = text.find(DIRECTIVE_OPEN);
    let stray_close = text.find(DIRECTIVE_CLOSE);

    match (begin, stray_close) {
        (None, None) => DirectiveParse::default(),
        (None, Some(close)) => stray_close_parse(close),
        (Some(begin), Some(close)) if close < begin => stray_close_parse(close),
        (Some(begin), _) => {
            let directive = scan_directive_at(text, begin);
            DirectiveParse {
                state: directive.state,
                directive: Some(directive),
            }
        }
    }
}

/// Shorthand for `parse_directive(text).state`.
pub fn directive_state(text: &str) -> DirectiveState {
    parse_directive(text).state
}

fn stray_close_parse(close: usize) -> DirectiveParse {
    DirectiveParse {
        state: DirectiveState::Malformed,
        directive: Some(DirectiveMatch {
            state: DirectiveState::Malformed,
            span: close..close + DIRECTIVE_CLOSE.len(),
            edit: None,
            error: Some("end marker without a matching begin marker".to_string()),
        }),
    }
}

/// Scans the directive whose begin marker starts at byte `begin`.
pub(crate) fn scan_directive_at(text: &str, begin: usize) -> DirectiveMatch {
    debug_assert!(text[begin..].starts_with(DIRECTIVE_OPEN));
    let body_start = begin + DIRECTIVE_OPEN.len();
    let body = &text[body_start..];

    let pending = |state| DirectiveMatch {
        state,
        span: begin..text.len(),
        edit: None,
        error: None,
    };

    let payload_open = body.find(PAYLOAD_OPEN);
    let early_close = body.find(DIRECTIVE_CLOSE);

    let payload_open = match (payload_open, early_close) {
        (None, None) => return pending(DirectiveState::Opening),
        (None, Some(close)) => return closed_without_payload(begin, body_start + close),
        (Some(open), Some(close)) if close < open => {
            return closed_without_payload(begin, body_start + close);
        }
        (Some(open), _) => open,
    };

    let payload_start = body_start + payload_open + PAYLOAD_OPEN.len();
    let Some(payload_len) = text[payload_start..].find(PAYLOAD_CLOSE) else {
        return pending(DirectiveState::PayloadInProgress);
    };

    let raw_payload = &text[payload_start..payload_start + payload_len];
    let after_payload = payload_start + payload_len + PAYLOAD_CLOSE.len();
    let end = text[after_payload..]
        .find(DIRECTIVE_CLOSE)
        .map(|offset| after_payload + offset + DIRECTIVE_CLOSE.len());
    // Without an end marker the directive stops at its payload; what follows
    // stays prose until a marker arrives.
    let span = begin..end.unwrap_or(after_payload);

    match DocumentEdit::from_payload(raw_payload) {
        Ok(edit) => DirectiveMatch {
            state: if end.is_some() {
                DirectiveState::Closed
            } else {
                DirectiveState::PayloadComplete
            },
            span,
            edit: Some(edit),
            error: None,
        },
        Err(err) => DirectiveMatch {
            state: DirectiveState::Malformed,
            span,
            edit: None,
            error: Some(err.to_string()),
        },
    }
}

fn closed_without_payload(begin: usize, close: usize) -> DirectiveMatch {
    DirectiveMatch {
        state: DirectiveState::Malformed,
        span: begin..close + DIRECTIVE_CLOSE.len(),
        edit: None,
        error: Some("directive closed before its payload".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const GOOD_PAYLOAD: &str = r#"{"action":"append","content":"Add a conclusion."}"#;

    fn full_directive(payload: &str) -> String {
        format!("{DIRECTIVE_OPEN}{PAYLOAD_OPEN}{payload}{PAYLOAD_CLOSE}{DIRECTIVE_CLOSE}")
    }

    #[test]
    fn plain_prose_has_no_directive() {
        let parse = parse_directive("Your thesis reads well.");
        assert_eq!(parse.state, DirectiveState::None);
        assert!(parse.directive.is_none());
        assert!(!contains_directive("Your thesis reads well."));
    }

    #[test]
    fn walks_through_every_state() {
        let mut buffer = String::from("Here is a suggestion. ");
        assert_eq!(directive_state(&buffer), DirectiveState::None);

        buffer.push_str(DIRECTIVE_OPEN);
        assert_eq!(directive_state(&buffer), DirectiveState::Opening);

        buffer.push_str(PAYLOAD_OPEN);
        buffer.push_str(r#"{"action":"append","#);
        assert_eq!(directive_state(&buffer), DirectiveState::PayloadInProgress);

        buffer.push_str(r#""content":"Add a conclusion."}"#);
        buffer.push_str(PAYLOAD_CLOSE);
        assert_eq!(directive_state(&buffer), DirectiveState::PayloadComplete);

        buffer.push_str(DIRECTIVE_CLOSE);
        let parse = parse_directive(&buffer);
        assert_eq!(parse.state, DirectiveState::Closed);
        assert_eq!(parse.edit().unwrap().content, "Add a conclusion.");
        let span = parse.directive.unwrap().span;
        assert_eq!(span.start, "Here is a suggestion. ".len());
        assert_eq!(span.end, buffer.len());
    }

    #[test]
    fn begin_marker_split_across_chunks() {
        let first = "intro <docu";
        assert_eq!(directive_state(first), DirectiveState::None);
        let joined = format!("{first}ment_edit>");
        assert_eq!(directive_state(&joined), DirectiveState::Opening);
    }

    #[test]
    fn stray_end_marker_is_malformed() {
        let parse = parse_directive(&format!("oops {DIRECTIVE_CLOSE} then text"));
        assert_eq!(parse.state, DirectiveState::Malformed);
        assert!(parse.error().unwrap().contains("without a matching begin"));
    }

    #[test]
    fn end_marker_before_payload_is_malformed() {
        let text = format!("{DIRECTIVE_OPEN} nothing here {DIRECTIVE_CLOSE}");
        assert_eq!(directive_state(&text), DirectiveState::Malformed);
    }

    #[test]
    fn bad_json_is_malformed_once_payload_closes() {
        let mut buffer = format!("intro {DIRECTIVE_OPEN}{PAYLOAD_OPEN}{{bad json");
        assert_eq!(directive_state(&buffer), DirectiveState::PayloadInProgress);
        buffer.push_str(PAYLOAD_CLOSE);
        assert_eq!(directive_state(&buffer), DirectiveState::Malformed);
        buffer.push_str(DIRECTIVE_CLOSE);
        let parse = parse_directive(&buffer);
        assert_eq!(parse.state, DirectiveState::Malformed);
        assert_eq!(parse.directive.unwrap().span.end, buffer.len());
    }

    #[test]
    fn closed_payload_without_end_marker_spans_to_payload_close() {
        let directive = format!("{DIRECTIVE_OPEN}{PAYLOAD_OPEN}{{bad}}{PAYLOAD_CLOSE}");
        let text = format!("a{directive} trailing");
        let parse = parse_directive(&text);
        assert_eq!(parse.state, DirectiveState::Malformed);
        assert_eq!(parse.directive.unwrap().span, 1..1 + directive.len());

        let text = format!("a{DIRECTIVE_OPEN}{PAYLOAD_OPEN}{GOOD_PAYLOAD}{PAYLOAD_CLOSE} trailing");
        let parse = parse_directive(&text);
        assert_eq!(parse.state, DirectiveState::PayloadComplete);
        assert_eq!(parse.directive.unwrap().span.end, text.len() - " trailing".len());
    }

    #[test]
    fn only_first_directive_drives_state() {
        let text = format!(
            "{} and later {DIRECTIVE_OPEN}{PAYLOAD_OPEN}{{bad",
            full_directive(GOOD_PAYLOAD)
        );
        assert_eq!(directive_state(&text), DirectiveState::Closed);
    }

    #[test]
    fn end_marker_inside_payload_is_payload_text() {
        let payload = r#"{"action":"append","content":"literal </document_edit> text"}"#;
        let text = full_directive(payload);
        let parse = parse_directive(&text);
        assert_eq!(parse.state, DirectiveState::Closed);
        assert_eq!(parse.edit().unwrap().content, "literal </document_edit> text");
    }

    #[test]
    fn state_ordering_and_advancement() {
        assert!(DirectiveState::None < DirectiveState::Opening);
        assert!(DirectiveState::PayloadComplete < DirectiveState::Closed);
        assert!(DirectiveState::Opening.can_advance_to(DirectiveState::Malformed));
        assert!(DirectiveState::Opening.can_advance_to(DirectiveState::Opening));
        assert!(!DirectiveState::PayloadInProgress.can_advance_to(DirectiveState::Opening));
        assert!(!DirectiveState::Closed.can_advance_to(DirectiveState::Malformed));
        assert!(!DirectiveState::Malformed.can_advance_to(DirectiveState::Closed));
    }

    #[test]
    fn state_serializes_in_screaming_case() {
        assert_eq!(
            serde_json::to_string(&DirectiveState::PayloadInProgress).unwrap(),
            "\"PAYLOAD_IN_PROGRESS\""
        );
        assert_eq!(DirectiveState::Closed.to_string(), "CLOSED");
    }

    fn fragment() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec![
            "intro ",
            "é ",
            "<",
            "doc",
            DIRECTIVE_OPEN,
            PAYLOAD_OPEN,
            PAYLOAD_CLOSE,
            DIRECTIVE_CLOSE,
            GOOD_PAYLOAD,
            "{bad json",
            "}",
        ])
    }

    proptest! {
        #[test]
        fn state_is_monotonic_over_prefixes(parts in prop::collection::vec(fragment(), 0..12)) {
            let text: String = parts.concat();
            let mut previous = DirectiveState::None;
            for (index, _) in text.char_indices().skip(1).chain(std::iter::once((text.len(), ' '))) {
                let current = directive_state(&text[..index]);
                prop_assert!(
                    previous.can_advance_to(current),
                    "{previous} -> {current} at {index} in {text:?}"
                );
                previous = current;
            }
        }

        #[test]
        fn reparsing_is_idempotent(parts in prop::collection::vec(fragment(), 0..12)) {
            let text: String = parts.concat();
            prop_assert_eq!(parse_directive(&text), parse_directive(&text));
        }
    }
}
