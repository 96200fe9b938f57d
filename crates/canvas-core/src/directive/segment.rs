//! Splits message text into prose and directive segments for rendering.

use serde::{Deserialize, Serialize};

use super::parser::{DIRECTIVE_OPEN, DirectiveState, scan_directive_at};
use super::payload::DocumentEdit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SegmentKind {
    Prose,
    Directive,
}

/// A typed slice of message text.
///
/// Segments are always rebuilt from the source text and never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    pub kind: SegmentKind,
    pub text: String,
    /// Parse state of this directive segment; `None` for prose.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directive_state: Option<DirectiveState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit: Option<DocumentEdit>,
}

impl Segment {
    pub fn prose(text: impl Into<String>) -> Self {
        Self {
            kind: SegmentKind::Prose,
            text: text.into(),
            directive_state: None,
            edit: None,
        }
    }

    pub fn is_directive(&self) -> bool {
        self.kind == SegmentKind::Directive
    }
}

/// Splits `text` into an ordered list of segments.
///
/// Works for finalized messages and for partial stream buffers alike: a
/// trailing directive that has not finished yet is returned as a directive
/// segment carrying its in-progress state. Concatenating the segment texts
/// reproduces `text` exactly.
pub fn classify(text: &str) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut cursor = 0;

    while cursor < text.len() {
        let Some(offset) = text[cursor..].find(DIRECTIVE_OPEN) else {
            segments.push(Segment::prose(&text[cursor..]));
            break;
        };

        let begin = cursor + offset;
        if begin > cursor {
            segments.push(Segment::prose(&text[cursor..begin]));
        }

        let directive = scan_directive_at(text, begin);
        segments.push(Segment {
            kind: SegmentKind::Directive,
            text: text[directive.span.clone()].to_string(),
            directive_state: Some(directive.state),
            edit: directive.edit,
        });
        cursor = directive.span.end;
    }

    segments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directive::parser::{DIRECTIVE_CLOSE, PAYLOAD_CLOSE, PAYLOAD_OPEN};
    use proptest::prelude::*;

    const PAYLOAD: &str = r#"{"action":"insert","target":"Intro","content":"A hook."}"#;

    fn directive(payload: &str) -> String {
        format!("{DIRECTIVE_OPEN}{PAYLOAD_OPEN}{payload}{PAYLOAD_CLOSE}{DIRECTIVE_CLOSE}")
    }

    fn concat(segments: &[Segment]) -> String {
        segments.iter().map(|s| s.text.as_str()).collect()
    }

    #[test]
    fn empty_text_has_no_segments() {
        assert!(classify("").is_empty());
    }

    #[test]
    fn prose_only() {
        let segments = classify("Nice progress on the draft.");
        assert_eq!(segments, vec![Segment::prose("Nice progress on the draft.")]);
    }

    #[test]
    fn prose_directive_prose() {
        let text = format!("Try this: {} Let me know.", directive(PAYLOAD));
        let segments = classify(&text);

        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], Segment::prose("Try this: "));
        assert!(segments[1].is_directive());
        assert_eq!(segments[1].directive_state, Some(DirectiveState::Closed));
        assert_eq!(segments[1].edit.as_ref().unwrap().content, "A hook.");
        assert_eq!(segments[2], Segment::prose(" Let me know."));
        assert_eq!(concat(&segments), text);
    }

    #[test]
    fn multiple_directives_are_all_extracted() {
        let text = format!("{}between{}", directive(PAYLOAD), directive("{oops"));
        let segments = classify(&text);

        let states: Vec<_> = segments.iter().map(|s| s.directive_state).collect();
        assert_eq!(
            states,
            vec![
                Some(DirectiveState::Closed),
                None,
                Some(DirectiveState::Malformed)
            ]
        );
        assert_eq!(concat(&segments), text);
    }

    #[test]
    fn trailing_directive_carries_live_state() {
        let text = format!("intro {DIRECTIVE_OPEN}{PAYLOAD_OPEN}{{\"action\"");
        let segments = classify(&text);
        assert_eq!(segments[0], Segment::prose("intro "));
        assert_eq!(
            segments[1].directive_state,
            Some(DirectiveState::PayloadInProgress)
        );
        assert!(segments[1].edit.is_none());
    }

    #[test]
    fn malformed_directive_keeps_surrounding_prose() {
        let text = format!("intro {DIRECTIVE_OPEN}{PAYLOAD_OPEN}{{bad json{PAYLOAD_CLOSE}{DIRECTIVE_CLOSE} outro");
        let segments = classify(&text);
        assert_eq!(segments.first().unwrap(), &Segment::prose("intro "));
        assert_eq!(segments[1].directive_state, Some(DirectiveState::Malformed));
        assert_eq!(segments.last().unwrap(), &Segment::prose(" outro"));
    }

    #[test]
    fn prose_after_unterminated_directive_is_kept() {
        let text = format!("a{DIRECTIVE_OPEN}{PAYLOAD_OPEN}{{bad}}{PAYLOAD_CLOSE} trailing");
        let segments = classify(&text);

        assert_eq!(segments.len(), 3);
        assert_eq!(segments[0], Segment::prose("a"));
        assert_eq!(segments[1].directive_state, Some(DirectiveState::Malformed));
        assert!(segments[1].text.ends_with(PAYLOAD_CLOSE));
        assert_eq!(segments[2], Segment::prose(" trailing"));
        assert_eq!(concat(&segments), text);
    }

    #[test]
    fn stray_end_marker_stays_prose() {
        let text = format!("text {DIRECTIVE_CLOSE} more");
        assert_eq!(classify(&text), vec![Segment::prose(text.clone())]);
    }

    fn fragment() -> impl Strategy<Value = &'static str> {
        prop::sample::select(vec![
            "prose ",
            "ü",
            "<",
            DIRECTIVE_OPEN,
            PAYLOAD_OPEN,
            PAYLOAD_CLOSE,
            DIRECTIVE_CLOSE,
            PAYLOAD,
            "{bad",
        ])
    }

    proptest! {
        #[test]
        fn segments_round_trip(parts in prop::collection::vec(fragment(), 0..16)) {
            let text: String = parts.concat();
            let segments = classify(&text);
            prop_assert_eq!(concat(&segments), text.clone());
            prop_assert!(segments.iter().all(|s| !s.text.is_empty()));
            prop_assert_eq!(classify(&text), segments);
        }
    }
}
