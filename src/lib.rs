//! PMT — the Persistent Metadata Tree storage engine.
//!
//! Durable, random-access storage for a hierarchical metadata tree
//! (databases, devices, measurements) whose size exceeds memory.
//! [`Engine`] is the single entry point callers outside this crate are
//! expected to drive.

pub mod address;
pub mod arena;
pub mod cache;
pub mod codec;
pub mod config;
pub mod engine;
pub mod error;
pub mod node;
pub mod node_lock;
pub mod page;
pub mod schema_file;
pub mod segment;

pub use address::SegmentAddress;
pub use arena::NodeId;
pub use config::EngineConfig;
pub use engine::Engine;
pub use error::{PmtError, Result};
pub use node::NodeKind;
