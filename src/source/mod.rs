//! Configuration sources feeding the session registry.

mod memory;
mod traits;

pub use memory::{InMemoryConfigSource, DEFAULT_CHANGE_QUEUE_CAPACITY};
pub use traits::{BatchId, ChangeBatch, ChangeKind, ConfigSource, PropertyChange};
