//! Directive parsing and segment classification.
//!
//! - `parser`: detects the first document-edit directive and its parse state
//! - `segment`: splits text into prose and directive segments
//! - `payload`: the structured `DocumentEdit` payload

mod parser;
mod payload;
mod segment;

pub use parser::{
    DIRECTIVE_CLOSE, DIRECTIVE_OPEN, DirectiveMatch, DirectiveParse, DirectiveState,
    PAYLOAD_CLOSE, PAYLOAD_OPEN, contains_directive, directive_state, parse_directive,
};
pub use payload::{DocumentEdit, EditAction};
pub use segment::{Segment, SegmentKind, classify};
