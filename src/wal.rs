//! Write-Ahead Logging (WAL) Module
//!
//! Durable, append-only persistence for the engine's active memtable.
//!
//! # On-disk layout
//!
//! ```text
//! [KEY_LEN_LE i32][KEY_BYTES][VALUE_LEN_LE i32][VALUE_BYTES]
//! [KEY_LEN_LE i32][KEY_BYTES][VALUE_LEN_LE i32][VALUE_BYTES]
//! ...
//! ```
//!
//! There is no header and no checksum — the engine's only corruption
//! story for this file is a torn tail left by a crash mid-write, and a
//! torn tail is tolerated silently: replay stops at the first record it
//! cannot fully decode and reports what came before it.
//!
//! # Rotation
//!
//! The active file is always `wal.log`. When the engine rotates to a
//! fresh memtable, the current `wal.log` is renamed to `wal.log.flushing`
//! and a new, empty `wal.log` is opened. The background flush worker
//! owns `wal.log.flushing` until its segment is durably written, then
//! deletes it. At most one such file exists at a time, because the
//! engine never starts a second rotation before the previous flush has
//! completed.

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use thiserror::Error;
use tracing::{error, info, trace, warn};

const I32_SIZE: usize = std::mem::size_of::<i32>();

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Internal consistency or locking error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// A single `(key, value)` record as it appears on the WAL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalRecord {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// The flushing-file name used during rotation (see module docs).
pub const FLUSHING_FILE_NAME: &str = "wal.log.flushing";

/// The active WAL file name.
pub const ACTIVE_FILE_NAME: &str = "wal.log";

/// An append-only, crash-tolerant log of `(key, value)` records.
#[derive(Debug)]
pub struct Wal {
    inner_file: Arc<Mutex<File>>,
    path: PathBuf,
}

impl Wal {
    /// Opens (creating if absent) the WAL file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        info!(path = %path.display(), "opened WAL file");

        Ok(Self {
            inner_file: Arc::new(Mutex::new(file)),
            path,
        })
    }

    /// Appends one record, durably (fsync'd before returning).
    pub fn append(&self, key: &[u8], value: &[u8]) -> Result<(), WalError> {
        trace!(key_len = key.len(), value_len = value.len(), "appending WAL record");

        let mut guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("mutex poisoned".into()))?;

        guard.write_all(&(key.len() as i32).to_le_bytes())?;
        guard.write_all(key)?;
        guard.write_all(&(value.len() as i32).to_le_bytes())?;
        guard.write_all(value)?;
        guard.sync_all()?;

        Ok(())
    }

    /// Returns an iterator that replays all well-formed records from the
    /// start of the file. A torn tail (a partial record at EOF) silently
    /// ends iteration rather than producing an error.
    pub fn replay_iter(&self) -> Result<WalIter, WalError> {
        info!(path = %self.path.display(), "replaying WAL");

        let mut guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("mutex poisoned".into()))?;
        guard.sync_all().ok();

        let file = OpenOptions::new().read(true).open(&self.path)?;
        Ok(WalIter { file, torn: false })
    }

    /// Renames the active file out of the way (to `wal.log.flushing`) and
    /// opens a fresh, empty file at the original path. Returns the path
    /// the old contents now live at, for the caller to hand to the
    /// background flush worker.
    pub fn rotate(&mut self) -> Result<PathBuf, WalError> {
        let flushing_path = self
            .path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(FLUSHING_FILE_NAME);

        let mut guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("mutex poisoned".into()))?;
        guard.sync_all()?;
        drop(guard);

        fs::rename(&self.path, &flushing_path)?;
        let fresh = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;

        info!(from = %self.path.display(), to = %flushing_path.display(), "rotated WAL");

        self.inner_file = Arc::new(Mutex::new(fresh));
        Ok(flushing_path)
    }

    /// Returns the path of the file on disk.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        match self.inner_file.lock() {
            Ok(guard) => {
                if let Err(e) = guard.sync_all() {
                    error!(error = %e, "failed to sync WAL on drop");
                }
            }
            Err(poisoned) => {
                let file = poisoned.into_inner();
                if let Err(e) = file.sync_all() {
                    error!(error = %e, "failed to sync WAL (poisoned) on drop");
                } else {
                    warn!("recovered and synced WAL after poisoned lock");
                }
            }
        }
    }
}

/// Deletes a flushing-WAL file after its contents are durably reflected
/// in a segment. Missing-file is not an error (idempotent cleanup).
pub fn remove_flushing_file(path: &Path) -> Result<(), WalError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(WalError::Io(e)),
    }
}

/// Sequential replay iterator. Stops cleanly (`None`) at EOF or at a torn
/// trailing record; never returns an `Err`, matching the spec's rule that
/// a torn WAL tail is never surfaced as an error.
pub struct WalIter {
    file: File,
    torn: bool,
}

impl WalIter {
    fn read_record(&mut self) -> io::Result<Option<WalRecord>> {
        let key_len = match read_i32_or_eof(&mut self.file)? {
            Some(n) => n,
            None => return Ok(None),
        };
        if key_len < 0 {
            return Ok(None);
        }
        let mut key = vec![0u8; key_len as usize];
        if self.file.read_exact(&mut key).is_err() {
            return Ok(None);
        }

        let value_len = match read_i32_or_eof(&mut self.file)? {
            Some(n) => n,
            None => return Ok(None),
        };
        if value_len < 0 {
            return Ok(None);
        }
        let mut value = vec![0u8; value_len as usize];
        if self.file.read_exact(&mut value).is_err() {
            return Ok(None);
        }

        Ok(Some(WalRecord { key, value }))
    }
}

fn read_i32_or_eof<R: Read>(r: &mut R) -> io::Result<Option<i32>> {
    let mut buf = [0u8; I32_SIZE];
    let mut read = 0;
    while read < I32_SIZE {
        match r.read(&mut buf[read..]) {
            Ok(0) => {
                if read == 0 {
                    return Ok(None);
                }
                // partial length prefix: torn tail.
                return Ok(None);
            }
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Some(i32::from_le_bytes(buf)))
}

impl Iterator for WalIter {
    type Item = WalRecord;

    fn next(&mut self) -> Option<Self::Item> {
        if self.torn {
            return None;
        }
        match self.read_record() {
            Ok(Some(rec)) => Some(rec),
            Ok(None) => {
                self.torn = true;
                None
            }
            Err(e) => {
                warn!(error = %e, "WAL replay I/O error, treating as end of log");
                self.torn = true;
                None
            }
        }
    }
}
