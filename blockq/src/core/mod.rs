use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use serde_derive::{Deserialize, Serialize};

use crate::errors::{BlockqError, Result};

pub mod lock;

/// Bytes in front of every slot payload: `[u32 state][u32 length]`, little endian.
pub const SLOT_HEADER_LEN: usize = 8;

pub const SLOT_STATE_EMPTY: u32 = 0;
pub const SLOT_STATE_OCCUPIED: u32 = 1;

pub const STORE_FILE_EXTENSION: &str = "blk";
pub const LOCK_FILE_EXTENSION: &str = "lock";

const DEFAULT_CLEAR_WORKERS: usize = 4;

static DEFAULT_DATA_DIR: Lazy<PathBuf> = Lazy::new(|| std::env::temp_dir().join("blockq"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the `.blk` backing files.
    pub data_dir: PathBuf,
    /// Directory holding lock sentinel files. Defaults to `<data_dir>/locks`.
    pub lock_dir: Option<PathBuf>,
    /// msync the touched slot after every write or delete.
    pub sync_on_write: bool,
    /// Upper bound on threads used by `BlockStore::clear`.
    pub clear_workers: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            data_dir: DEFAULT_DATA_DIR.clone(),
            lock_dir: None,
            sync_on_write: false,
            clear_workers: DEFAULT_CLEAR_WORKERS,
        }
    }
}

impl StoreConfig {
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    pub fn lock_dir(&self) -> PathBuf {
        match &self.lock_dir {
            Some(dir) => dir.clone(),
            None => self.data_dir.join("locks"),
        }
    }

    #[inline]
    pub fn store_path(&self, name: &str) -> PathBuf {
        self.data_dir
            .join(format!("{}.{}", name, STORE_FILE_EXTENSION))
    }

    pub fn validate(&self) -> Result<()> {
        if self.clear_workers == 0 {
            return Err(BlockqError::Validation(
                "clear_workers must be at least 1".to_string(),
            ));
        }
        if self.data_dir.as_os_str().is_empty() {
            return Err(BlockqError::Validation("data_dir is empty".to_string()));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct StoreConfigBuilder {
    data_dir: Option<PathBuf>,
    lock_dir: Option<PathBuf>,
    sync_on_write: Option<bool>,
    clear_workers: Option<usize>,
}

impl StoreConfigBuilder {
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    pub fn sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = Some(sync);
        self
    }

    pub fn clear_workers(mut self, workers: usize) -> Self {
        self.clear_workers = Some(workers);
        self
    }

    pub fn build(self) -> Result<StoreConfig> {
        let defaults = StoreConfig::default();
        let cfg = StoreConfig {
            data_dir: self.data_dir.unwrap_or(defaults.data_dir),
            lock_dir: self.lock_dir,
            sync_on_write: self.sync_on_write.unwrap_or(defaults.sync_on_write),
            clear_workers: self.clear_workers.unwrap_or(defaults.clear_workers),
        };
        cfg.validate()?;
        Ok(cfg)
    }
}

/// Names end up as file names, so anything that could escape the data
/// directory or clash with the slot lock separator is refused.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(BlockqError::Validation("name is empty".to_string()));
    }
    if name == "." || name == ".." {
        return Err(BlockqError::Validation(format!("name {:?} is reserved", name)));
    }
    if let Some(c) = name.chars().find(|c| matches!(c, '/' | '\\' | '#' | '\0')) {
        return Err(BlockqError::Validation(format!(
            "name {:?} contains forbidden character {:?}",
            name, c
        )));
    }
    Ok(())
}

#[inline]
pub fn store_lock_name(store: &str) -> String {
    store.to_string()
}

#[inline]
pub fn slot_lock_name(store: &str, slot_index: usize) -> String {
    format!("{}#{}", store, slot_index)
}

#[inline]
pub fn queue_lock_name(queue: &str) -> String {
    format!("{}.queue", queue)
}

#[inline]
pub fn lock_path(lock_dir: &Path, lock_name: &str) -> PathBuf {
    lock_dir.join(format!("{}.{}", lock_name, LOCK_FILE_EXTENSION))
}
