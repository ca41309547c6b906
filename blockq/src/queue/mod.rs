//! Bounded persistent FIFO over two block stores.
//!
//! `<name>.meta` holds a single `QueueMeta` slot, `<name>.items` holds one
//! slot per queue entry. Every structural operation runs under the named
//! lock `<name>.queue`, so at most one enqueue, dequeue or clear is in flight
//! per queue name across all processes.

use std::fs;

use tracing::{debug, error, warn};

use crate::core::lock::NamedLock;
use crate::core::*;
use crate::errors::{BlockqError, Result};
use crate::item::BlockItem;
use crate::store::BlockStore;

mod meta;

pub use meta::{QueueItemMeta, QueueMeta};

const META_SLOT: usize = 0;

#[inline]
pub fn meta_store_name(queue: &str) -> String {
    format!("{}.meta", queue)
}

#[inline]
pub fn items_store_name(queue: &str) -> String {
    format!("{}.items", queue)
}

/// A named queue shared by every process that opens the same name in the
/// same data directory.
///
/// Ordering is only guaranteed among operations made through `Queue`.
/// Touching the item store directly (see [`Queue::item_store`]) bypasses the
/// queue lock and is not ordered against queue operations.
pub struct Queue<T> {
    name: String,
    size: usize,
    item_size: usize,
    lock: NamedLock,
    meta: BlockStore<QueueMeta>,
    items: BlockStore<T>,
}

struct Layout {
    size: u32,
    item_size: u32,
    item_block: usize,
    item_capacity: usize,
    meta_block: usize,
}

fn layout(item_size: usize, queue_size: usize) -> Result<Layout> {
    if item_size == 0 || queue_size == 0 {
        return Err(BlockqError::Validation(format!(
            "item size ({}) and queue size ({}) must be positive",
            item_size, queue_size
        )));
    }
    let too_large = || {
        BlockqError::Validation(format!(
            "queue of {} items of {} bytes is too large",
            queue_size, item_size
        ))
    };
    let size = u32::try_from(queue_size).map_err(|_| too_large())?;
    let item_size32 = u32::try_from(item_size).map_err(|_| too_large())?;
    let item_block = item_size.checked_add(SLOT_HEADER_LEN).ok_or_else(too_large)?;
    let item_capacity = item_block.checked_mul(queue_size).ok_or_else(too_large)?;
    let meta_block = queue_size
        .checked_mul(meta::META_ENTRY_LEN)
        .and_then(|n| n.checked_add(meta::META_HEADER_LEN + SLOT_HEADER_LEN))
        .ok_or_else(too_large)?;
    Ok(Layout {
        size,
        item_size: item_size32,
        item_block,
        item_capacity,
        meta_block,
    })
}

impl<T: BlockItem> Queue<T> {
    /// Opens the queue `name`, creating it on first use.
    ///
    /// A queue's size and item size are fixed by whoever created it; opening
    /// it with other values fails with `SignatureMismatch`.
    pub fn open(
        cfg: &StoreConfig,
        name: &str,
        item_size: usize,
        queue_size: usize,
    ) -> Result<Queue<T>> {
        cfg.validate()?;
        validate_name(name)?;
        let layout = layout(item_size, queue_size)?;

        let lock_dir = cfg.lock_dir();
        fs::create_dir_all(&lock_dir)?;
        let lock = NamedLock::new(&lock_dir, queue_lock_name(name));
        let _guard = lock.acquire()?;

        let meta_name = meta_store_name(name);
        let meta = match BlockStore::<QueueMeta>::open(
            cfg,
            &meta_name,
            layout.meta_block,
            layout.meta_block,
        ) {
            Ok(store) => store,
            Err(mismatch @ BlockqError::LayoutMismatch { .. }) => {
                return Err(persisted_signature(cfg, name, item_size, queue_size, mismatch));
            }
            Err(e) => return Err(e),
        };

        if meta.read(META_SLOT)?.is_none() {
            meta.write(META_SLOT, &QueueMeta::new(layout.size, layout.item_size))?;
            debug!(queue = %name, size = queue_size, item_size, "created queue");
        }
        let persisted = meta
            .read(META_SLOT)?
            .ok_or_else(|| BlockqError::MetadataUnavailable {
                name: name.to_string(),
            })?;
        if persisted.size != layout.size || persisted.item_size != layout.item_size {
            return Err(BlockqError::SignatureMismatch {
                name: name.to_string(),
                requested_size: queue_size,
                requested_item_size: item_size,
                persisted_size: persisted.size as usize,
                persisted_item_size: persisted.item_size as usize,
            });
        }

        let items = BlockStore::open(
            cfg,
            &items_store_name(name),
            layout.item_capacity,
            layout.item_block,
        )?;
        debug!(queue = %name, len = persisted.len(), "opened queue");

        Ok(Queue {
            name: name.to_string(),
            size: queue_size,
            item_size,
            lock,
            meta,
            items,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.size
    }

    /// Largest encoded item the queue accepts.
    pub fn item_size(&self) -> usize {
        self.item_size
    }

    /// The store holding item payloads. Access through it is not ordered
    /// against queue operations.
    pub fn item_store(&self) -> &BlockStore<T> {
        &self.items
    }

    fn load_meta(&self) -> Result<QueueMeta> {
        self.meta
            .read(META_SLOT)?
            .ok_or_else(|| BlockqError::MetadataUnavailable {
                name: self.name.clone(),
            })
    }

    #[inline]
    fn save_meta(&self, meta: &QueueMeta) -> Result<()> {
        self.meta.write(META_SLOT, meta)
    }

    /// Runs `f` on the current metadata while holding the queue lock.
    fn locked<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(QueueMeta) -> Result<R>,
    {
        let _guard = self.lock.acquire()?;
        let meta = self.load_meta()?;
        f(meta)
    }

    /// Reads the payload of `entry`. A corrupt payload has already been
    /// wiped by the store; its entry is dropped from `meta` and persisted so
    /// the queue moves past it.
    fn read_entry(&self, meta: &mut QueueMeta, entry: QueueItemMeta) -> Result<T> {
        match self.items.read(entry.memory_index as usize) {
            Ok(Some(item)) => Ok(item),
            Ok(None) => {
                error!(
                    queue = %self.name,
                    position = entry.position,
                    memory_index = entry.memory_index,
                    "metadata references an empty slot"
                );
                Err(BlockqError::DataConsistencyViolation {
                    name: self.name.clone(),
                    position: entry.position,
                    memory_index: entry.memory_index,
                })
            }
            Err(corrupt @ BlockqError::CorruptItem { .. }) => {
                meta.remove(entry);
                self.save_meta(meta)?;
                Err(corrupt)
            }
            Err(e) => Err(e),
        }
    }

    /// Appends `item`. Encoding and the size check happen before the queue
    /// lock is taken.
    pub fn enqueue(&self, item: &T) -> Result<()> {
        let encoded = self.items.encode_slot(item)?;
        self.locked(|mut meta| {
            let slot = meta
                .next_free()
                .ok_or(BlockqError::QueueFull {
                    capacity: self.size,
                })?;
            let index = slot.memory_index as usize;
            self.items.write_slot(index, &encoded)?;
            meta.items.push(slot);
            if let Err(e) = self.save_meta(&meta) {
                if let Err(rollback) = self.items.delete(index) {
                    warn!(
                        queue = %self.name,
                        memory_index = slot.memory_index,
                        error = %rollback,
                        "could not release item slot after failed enqueue"
                    );
                }
                return Err(e);
            }
            debug!(
                queue = %self.name,
                position = slot.position,
                memory_index = slot.memory_index,
                "enqueued"
            );
            Ok(())
        })
    }

    /// Removes and returns the oldest item, or `None` if the queue is empty.
    ///
    /// Once the shortened metadata is saved the item is handed out even if
    /// its slot cannot be wiped; the orphaned slot is overwritten by the next
    /// enqueue that picks it.
    pub fn try_dequeue(&self) -> Result<Option<T>> {
        self.locked(|mut meta| {
            let front = match meta.front() {
                Some(front) => front,
                None => return Ok(None),
            };
            let item = self.read_entry(&mut meta, front)?;
            meta.pop_front();
            self.save_meta(&meta)?;
            if let Err(e) = self.items.delete(front.memory_index as usize) {
                warn!(
                    queue = %self.name,
                    memory_index = front.memory_index,
                    error = %e,
                    "dequeued item left an orphan slot"
                );
            }
            debug!(
                queue = %self.name,
                memory_index = front.memory_index,
                remaining = meta.len(),
                "dequeued"
            );
            Ok(Some(item))
        })
    }

    /// Returns the oldest item without removing it.
    pub fn peek(&self) -> Result<Option<T>> {
        self.locked(|mut meta| match meta.front() {
            Some(front) => self.read_entry(&mut meta, front).map(Some),
            None => Ok(None),
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.locked(|mut meta| {
            meta.items.clear();
            self.save_meta(&meta)?;
            self.items.clear()?;
            debug!(queue = %self.name, "cleared");
            Ok(())
        })
    }

    pub fn len(&self) -> Result<usize> {
        self.locked(|meta| Ok(meta.len()))
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.locked(|meta| Ok(meta.is_empty()))
    }

    /// Copy of the control block as of this call.
    pub fn snapshot(&self) -> Result<QueueMeta> {
        self.locked(Ok)
    }
}

/// Builds the error for a metadata file whose length does not match the
/// requested queue size, reporting the persisted signature when readable.
fn persisted_signature(
    cfg: &StoreConfig,
    name: &str,
    item_size: usize,
    queue_size: usize,
    mismatch: BlockqError,
) -> BlockqError {
    let persisted = BlockStore::<QueueMeta>::open_whole(cfg, &meta_store_name(name))
        .and_then(|store| match store {
            Some(store) => store.read(META_SLOT),
            None => Ok(None),
        });
    match persisted {
        Ok(Some(meta)) => BlockqError::SignatureMismatch {
            name: name.to_string(),
            requested_size: queue_size,
            requested_item_size: item_size,
            persisted_size: meta.size as usize,
            persisted_item_size: meta.item_size as usize,
        },
        _ => mismatch,
    }
}
