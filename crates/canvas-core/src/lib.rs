//! Domain layer of the canvas coaching chat engine.
//!
//! Holds the message model, the directive parser and segment classifier, the
//! error taxonomy, engine configuration and the interfaces of the external
//! collaborators (durable store, push feed, token stream).

pub mod config;
pub mod directive;
pub mod error;
pub mod feed;
pub mod message;
pub mod store;
pub mod stream;

pub use config::EngineConfig;
pub use error::{CanvasError, Result};
