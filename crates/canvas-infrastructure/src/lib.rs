//! Infrastructure adapters for the canvas conversation engine.
//!
//! - `in_memory_store` / `in_memory_feed`: durable store and push feed kept in
//!   process memory, with failure injection for tests
//! - `config_service` / `paths`: TOML configuration loading

pub mod config_service;
pub mod in_memory_feed;
pub mod in_memory_store;
pub mod paths;

pub use config_service::ConfigService;
pub use in_memory_feed::InMemoryPushFeed;
pub use in_memory_store::{InMemoryMessageStore, StoreOp};
pub use paths::CanvasPaths;
