//! Execution layer: drives token streams and sets up tracing.
//!
//! - `stream_executor`: consumes an external token stream and guarantees the
//!   session ends finalized or aborted
//! - `logging`: tracing subscriber setup
//! - `tracing_layer`: forwards engine warnings to the renderer

pub mod logging;
pub mod stream_executor;
pub mod tracing_layer;

pub use logging::{LogOptions, init_tracing, init_with_diagnostics};
pub use stream_executor::{StreamExecutor, StreamOutcome};
pub use tracing_layer::{DiagnosticEvent, DiagnosticsLayer};
