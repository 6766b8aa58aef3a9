//! Infrastructure layer - Storage adapters
//!
//! - `sqlite`: SQLite index store and column-reference builder
//! - `memory`: in-memory store/builder for tests
//! - `registry`: config-backed table catalog

pub mod memory;
pub mod registry;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::InMemoryReferenceIndex;
pub use registry::TableRegistry;

#[cfg(feature = "sqlite")]
pub use sqlite::{IndexLayout, SqliteRecordIndexBuilder, SqliteReferenceIndex};
