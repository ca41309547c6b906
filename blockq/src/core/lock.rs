//! Named cross-process locks.
//!
//! A named lock is an exclusive advisory lock on a sentinel file
//! `<lock_dir>/<name>.lock`. Every acquisition opens its own handle, so two
//! threads of one process exclude each other exactly like two processes do.
//! The OS drops the lock when the holder's handle closes, including when the
//! holder crashes.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use fs2::FileExt;

use super::lock_path;
use crate::errors::Result;

const MIN_BACKOFF: Duration = Duration::from_micros(50);
const MAX_BACKOFF: Duration = Duration::from_millis(5);

#[derive(Debug, Clone)]
pub struct NamedLock {
    name: String,
    path: PathBuf,
}

/// Holds the lock until dropped.
#[derive(Debug)]
pub struct LockGuard {
    file: File,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl NamedLock {
    pub fn new(lock_dir: &Path, name: impl Into<String>) -> NamedLock {
        let name = name.into();
        let path = lock_path(lock_dir, &name);
        NamedLock { name, path }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> io::Result<File> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)
    }

    /// Blocks until the lock is held.
    pub fn acquire(&self) -> Result<LockGuard> {
        let file = self.open()?;
        file.lock_exclusive()?;
        Ok(LockGuard { file })
    }

    /// Returns `None` if the lock could not be taken within `timeout`.
    pub fn try_acquire_for(&self, timeout: Duration) -> Result<Option<LockGuard>> {
        let file = self.open()?;
        let deadline = Instant::now() + timeout;
        let mut backoff = MIN_BACKOFF;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => return Ok(Some(LockGuard { file })),
                Err(e) if is_contended(&e) => {}
                Err(e) => return Err(e.into()),
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            thread::sleep(backoff.min(deadline - now));
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }
}

#[inline]
fn is_contended(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
        || e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn second_handle_times_out_while_held() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lock = NamedLock::new(dir.path(), "held");
        let guard = lock.acquire()?;

        let other = NamedLock::new(dir.path(), "held");
        let start = Instant::now();
        assert!(other.try_acquire_for(Duration::from_millis(30))?.is_none());
        assert!(start.elapsed() >= Duration::from_millis(30));

        drop(guard);
        assert!(other.try_acquire_for(Duration::from_millis(30))?.is_some());
        Ok(())
    }

    #[test]
    fn distinct_names_do_not_conflict() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let _a = NamedLock::new(dir.path(), "a").acquire()?;
        let b = NamedLock::new(dir.path(), "b").try_acquire_for(Duration::ZERO)?;
        assert!(b.is_some());
        Ok(())
    }

    #[test]
    fn blocked_thread_proceeds_after_release() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let lock = NamedLock::new(dir.path(), "handoff");
        let guard = lock.acquire()?;

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let lock = lock.clone();
            thread::spawn(move || {
                let _g = lock.acquire().expect("acquire");
                tx.send(()).expect("send");
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        drop(guard);
        rx.recv_timeout(Duration::from_secs(5))
            .expect("waiter never got the lock");
        waiter.join().expect("waiter panicked");
        Ok(())
    }
}
