//! # bidloop storage
//!
//! Repository interfaces and the in-memory store behind them.
//!
//! ## Layout
//!
//! - `repository` - one trait per concern, bundled as [`Store`]
//! - `memory` - [`MemoryStore`], every table behind one lock
//! - `snapshot` - JSON save/load so a node survives restarts

pub mod memory;
pub mod repository;
pub mod snapshot;

pub use memory::MemoryStore;
pub use repository::*;
pub use snapshot::SnapshotError;
