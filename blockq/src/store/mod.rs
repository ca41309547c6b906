//! Fixed-block storage over a memory-mapped file.
//!
//! ```text
//! file: <data_dir>/<name>.blk, exactly `capacity` bytes
//! ┌──────────────┬──────────────┬─────┬────────────────┬──────────┐
//! │ slot 0       │ slot 1       │ ... │ slot size-1    │ unused   │
//! └──────────────┴──────────────┴─────┴────────────────┴──────────┘
//! slot: [u32 state][u32 length][payload][zero padding up to block_size]
//! ```
//!
//! Every slot is guarded by its own named lock, so independent processes can
//! open the same store and read or write different slots concurrently.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::ptr;
use std::thread;
use std::time::Duration;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use memmap2::{MmapOptions, MmapRaw};
use tracing::{debug, warn};

use crate::core::lock::NamedLock;
use crate::core::*;
use crate::errors::{BlockqError, Result};
use crate::item::BlockItem;

/// Result of a bounded read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome<T> {
    Present(T),
    Vacant,
    /// The slot lock was not acquired before the timeout.
    Locked,
}

impl<T> ReadOutcome<T> {
    pub fn is_locked(&self) -> bool {
        matches!(self, ReadOutcome::Locked)
    }

    /// `None` for both `Vacant` and `Locked`.
    pub fn into_option(self) -> Option<T> {
        match self {
            ReadOutcome::Present(item) => Some(item),
            ReadOutcome::Vacant | ReadOutcome::Locked => None,
        }
    }
}

pub struct BlockStore<T> {
    name: String,
    path: PathBuf,
    lock_dir: PathBuf,
    capacity: usize,
    block_size: usize,
    size: usize,
    sync_on_write: bool,
    clear_workers: usize,
    mmap: MmapRaw,
    _file: File,
    _item: PhantomData<fn() -> T>,
}

fn validate_layout(capacity: usize, block_size: usize) -> Result<()> {
    if capacity == 0 || block_size == 0 {
        return Err(BlockqError::Validation(format!(
            "capacity ({}) and block size ({}) must be positive",
            capacity, block_size
        )));
    }
    if block_size > capacity {
        return Err(BlockqError::Validation(format!(
            "block size {} exceeds capacity {}",
            block_size, capacity
        )));
    }
    if block_size < SLOT_HEADER_LEN {
        return Err(BlockqError::Validation(format!(
            "block size {} is smaller than the {} byte slot header",
            block_size, SLOT_HEADER_LEN
        )));
    }
    if u32::try_from(block_size - SLOT_HEADER_LEN).is_err() {
        return Err(BlockqError::Validation(format!(
            "block size {} does not fit the slot length field",
            block_size
        )));
    }
    Ok(())
}

/// `Err` carries the reason the slot is unusable.
fn decode_slot<T: BlockItem>(
    buf: &[u8],
    payload_capacity: usize,
) -> std::result::Result<Option<T>, String> {
    let mut header = io::Cursor::new(buf);
    let (state, len) = match (
        header.read_u32::<LittleEndian>(),
        header.read_u32::<LittleEndian>(),
    ) {
        (Ok(state), Ok(len)) => (state, len as usize),
        _ => return Err(format!("truncated slot header ({} bytes)", buf.len())),
    };
    match state {
        SLOT_STATE_EMPTY => Ok(None),
        SLOT_STATE_OCCUPIED if len <= payload_capacity => {
            let payload = &buf[SLOT_HEADER_LEN..SLOT_HEADER_LEN + len];
            T::decode(payload).map(Some).map_err(|e| e.to_string())
        }
        SLOT_STATE_OCCUPIED => Err(format!(
            "length {} exceeds payload capacity {}",
            len, payload_capacity
        )),
        other => Err(format!("unknown slot state {}", other)),
    }
}

impl<T: BlockItem> BlockStore<T> {
    pub fn open(
        cfg: &StoreConfig,
        name: &str,
        capacity: usize,
        block_size: usize,
    ) -> Result<BlockStore<T>> {
        cfg.validate()?;
        validate_name(name)?;
        validate_layout(capacity, block_size)?;

        let lock_dir = cfg.lock_dir();
        fs::create_dir_all(&cfg.data_dir)?;
        fs::create_dir_all(&lock_dir)?;

        let path = cfg.store_path(name);
        let file = {
            let _guard = NamedLock::new(&lock_dir, store_lock_name(name)).acquire()?;
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            let found = file.metadata()?.len();
            if found == 0 {
                file.set_len(capacity as u64)?;
            } else if found != capacity as u64 {
                return Err(BlockqError::LayoutMismatch {
                    path,
                    expected: capacity as u64,
                    found,
                });
            }
            file
        };
        let mmap = MmapOptions::new().len(capacity).map_raw(&file)?;

        let store = BlockStore {
            name: name.to_string(),
            path,
            lock_dir,
            capacity,
            block_size,
            size: capacity / block_size,
            sync_on_write: cfg.sync_on_write,
            clear_workers: cfg.clear_workers,
            mmap,
            _file: file,
            _item: PhantomData,
        };
        debug!(
            store = %store.name,
            path = ?store.path,
            size = store.size,
            block_size = store.block_size,
            "opened block store"
        );
        Ok(store)
    }

    /// Maps an existing file as a single slot spanning the whole file.
    /// Returns `None` when no such file exists.
    pub(crate) fn open_whole(cfg: &StoreConfig, name: &str) -> Result<Option<BlockStore<T>>> {
        let path = cfg.store_path(name);
        let len = match fs::metadata(&path) {
            Ok(meta) => meta.len() as usize,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if len < SLOT_HEADER_LEN {
            return Ok(None);
        }
        BlockStore::open(cfg, name, len, len).map(Some)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of slots.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Largest encoded item a slot accepts.
    #[inline]
    pub fn payload_capacity(&self) -> usize {
        self.block_size - SLOT_HEADER_LEN
    }

    #[inline]
    fn check_index(&self, index: usize) -> Result<()> {
        if index >= self.size {
            return Err(BlockqError::IndexOutOfRange {
                index,
                size: self.size,
            });
        }
        Ok(())
    }

    #[inline]
    fn slot_lock(&self, index: usize) -> NamedLock {
        NamedLock::new(&self.lock_dir, slot_lock_name(&self.name, index))
    }

    #[inline]
    fn slot_ptr(&self, index: usize) -> *mut u8 {
        // check_index keeps the slot inside the mapping
        unsafe { self.mmap.as_mut_ptr().add(index * self.block_size) }
    }

    fn load_slot(&self, index: usize) -> Vec<u8> {
        let mut buf = vec![0u8; self.block_size];
        unsafe {
            ptr::copy_nonoverlapping(self.slot_ptr(index), buf.as_mut_ptr(), self.block_size);
        }
        buf
    }

    fn store_slot(&self, index: usize, bytes: &[u8]) -> Result<()> {
        debug_assert_eq!(bytes.len(), self.block_size);
        unsafe {
            ptr::copy_nonoverlapping(bytes.as_ptr(), self.slot_ptr(index), self.block_size);
        }
        self.sync_slot(index)
    }

    fn zero_slot(&self, index: usize) -> Result<()> {
        unsafe {
            ptr::write_bytes(self.slot_ptr(index), 0, self.block_size);
        }
        self.sync_slot(index)
    }

    #[inline]
    fn sync_slot(&self, index: usize) -> Result<()> {
        if self.sync_on_write {
            self.mmap
                .flush_range(index * self.block_size, self.block_size)?;
        }
        Ok(())
    }

    /// Encodes `item` into a full slot image, rejecting payloads that do not
    /// fit. Takes no lock.
    pub(crate) fn encode_slot(&self, item: &T) -> Result<Vec<u8>> {
        let payload = item.encode().map_err(BlockqError::Encode)?;
        let max = self.payload_capacity();
        if payload.len() > max {
            return Err(BlockqError::ItemTooLarge {
                len: payload.len(),
                max,
            });
        }
        let mut buf = vec![0u8; self.block_size];
        let mut header = &mut buf[..SLOT_HEADER_LEN];
        header.write_u32::<LittleEndian>(SLOT_STATE_OCCUPIED)?;
        header.write_u32::<LittleEndian>(payload.len() as u32)?;
        buf[SLOT_HEADER_LEN..SLOT_HEADER_LEN + payload.len()].copy_from_slice(&payload);
        Ok(buf)
    }

    /// Caller holds the slot lock.
    fn read_locked(&self, index: usize) -> Result<Option<T>> {
        let buf = self.load_slot(index);
        match decode_slot::<T>(&buf, self.payload_capacity()) {
            Ok(item) => Ok(item),
            Err(cause) => {
                self.zero_slot(index)?;
                warn!(store = %self.name, index, %cause, "wiped corrupt slot");
                Err(BlockqError::CorruptItem {
                    store: self.name.clone(),
                    index,
                    cause,
                })
            }
        }
    }

    /// Reads a slot, waiting as long as it takes for its lock.
    pub fn read(&self, index: usize) -> Result<Option<T>> {
        self.check_index(index)?;
        let _guard = self.slot_lock(index).acquire()?;
        self.read_locked(index)
    }

    /// Reads a slot, giving up with `ReadOutcome::Locked` if its lock is
    /// not acquired within `timeout`.
    pub fn read_timeout(&self, index: usize, timeout: Duration) -> Result<ReadOutcome<T>> {
        self.check_index(index)?;
        let _guard = match self.slot_lock(index).try_acquire_for(timeout)? {
            Some(guard) => guard,
            None => return Ok(ReadOutcome::Locked),
        };
        Ok(match self.read_locked(index)? {
            Some(item) => ReadOutcome::Present(item),
            None => ReadOutcome::Vacant,
        })
    }

    pub fn write(&self, index: usize, item: &T) -> Result<()> {
        self.check_index(index)?;
        let buf = self.encode_slot(item)?;
        self.write_slot(index, &buf)
    }

    /// Stores a slot image produced by `encode_slot`.
    pub(crate) fn write_slot(&self, index: usize, buf: &[u8]) -> Result<()> {
        self.check_index(index)?;
        debug_assert_eq!(buf.len(), self.block_size);
        let _guard = self.slot_lock(index).acquire()?;
        self.store_slot(index, buf)
    }

    /// Empties a slot. Deleting an empty slot is a no-op.
    pub fn delete(&self, index: usize) -> Result<()> {
        self.check_index(index)?;
        let _guard = self.slot_lock(index).acquire()?;
        self.zero_slot(index)
    }

    /// Empties every slot, spreading the work over at most
    /// `clear_workers` threads.
    pub fn clear(&self) -> Result<()> {
        let workers = self.clear_workers.clamp(1, self.size);
        let chunk = (self.size + workers - 1) / workers;
        thread::scope(|s| {
            let handles: Vec<_> = (0..self.size)
                .step_by(chunk)
                .map(|start| {
                    let end = (start + chunk).min(self.size);
                    s.spawn(move || (start..end).try_for_each(|index| self.delete(index)))
                })
                .collect();
            let mut result = Ok(());
            for handle in handles {
                let outcome = match handle.join() {
                    Ok(outcome) => outcome,
                    Err(panic) => std::panic::resume_unwind(panic),
                };
                if result.is_ok() {
                    result = outcome;
                }
            }
            result
        })
    }

    /// Occupied slots in index order. Call again to restart.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            store: self,
            next: 0,
        }
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}

pub struct Iter<'a, T> {
    store: &'a BlockStore<T>,
    next: usize,
}

impl<'a, T: BlockItem> Iterator for Iter<'a, T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.next < self.store.size {
            let index = self.next;
            self.next += 1;
            if let Some(item) = self.store.read(index).transpose() {
                return Some(item);
            }
        }
        None
    }
}

impl<'a, T: BlockItem> IntoIterator for &'a BlockStore<T> {
    type Item = Result<T>;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
