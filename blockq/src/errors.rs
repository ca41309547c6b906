use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::item::CodecError;

pub type Result<T> = std::result::Result<T, BlockqError>;

#[derive(Debug, Error)]
pub enum BlockqError {
    #[error("Invalid argument: {0}")]
    Validation(String),

    #[error("Slot index {index} is out of range (size {size})")]
    IndexOutOfRange { index: usize, size: usize },

    #[error("Item of {len} bytes does not fit a slot of {max} payload bytes")]
    ItemTooLarge { len: usize, max: usize },

    /// The slot has already been wiped when this is returned.
    #[error("Corrupt item in store {store} at slot {index}: {cause}")]
    CorruptItem {
        store: String,
        index: usize,
        cause: String,
    },

    #[error("Queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error(
        "Queue {name} was created with size={persisted_size}, item_size={persisted_item_size} \
         but opened with size={requested_size}, item_size={requested_item_size}"
    )]
    SignatureMismatch {
        name: String,
        requested_size: usize,
        requested_item_size: usize,
        persisted_size: usize,
        persisted_item_size: usize,
    },

    #[error("Metadata of queue {name} is unavailable")]
    MetadataUnavailable { name: String },

    #[error(
        "Queue {name} references slot {memory_index} at position {position} but the slot is empty"
    )]
    DataConsistencyViolation {
        name: String,
        position: u32,
        memory_index: u32,
    },

    #[error("Backing file {path} has {found} bytes, expected {expected}")]
    LayoutMismatch {
        path: PathBuf,
        expected: u64,
        found: u64,
    },

    #[error("Failed to encode item: {0}")]
    Encode(CodecError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
