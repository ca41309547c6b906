pub mod core;
pub mod errors;
pub mod item;
pub mod queue;
pub mod store;

#[cfg(test)]
mod tests;

pub use crate::core::lock::{LockGuard, NamedLock};
pub use crate::core::{StoreConfig, StoreConfigBuilder, SLOT_HEADER_LEN};
pub use errors::{BlockqError, Result};
pub use item::{BlockItem, CodecError};
pub use queue::{Queue, QueueItemMeta, QueueMeta};
pub use store::{BlockStore, Iter, ReadOutcome};
