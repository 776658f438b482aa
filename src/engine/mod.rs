//! # LSM Storage Engine
//!
//! This module implements a synchronous-facing, crash-safe LSM-tree
//! storage engine backed by a write-ahead log, an in-memory sorted
//! buffer, and immutable on-disk segments.
//!
//! ## Design overview
//!
//! The engine organises data across two layers, queried newest-first:
//!
//! 1. **Active memtable** — an in-memory sorted map backed by a WAL.
//! 2. **Segments** — immutable, sorted, on-disk files with a sparse
//!    index for point lookups.
//!
//! Writes go through the WAL first, then into the active memtable. When
//! the memtable reaches [`EngineOptions::memtable_byte_budget`] it is
//! rotated: a fresh memtable and WAL are installed in its place and the
//! frozen memtable is handed to a background worker that writes it out
//! as a segment and truncates the superseded WAL file. A `put` never
//! waits for that flush to complete; at most one flush is ever
//! in-flight, so a second rotation blocks until the first finishes.
//!
//! ## Concurrency model
//!
//! Two primitives guard engine state: a **writer lock** serializing
//! `put`, memtable rotation, and installation of a new segment list; and
//! a **reader lock** protecting the brief snapshot of the current
//! memtable and segment-reader list that `get` takes. Both are
//! short-duration — the I/O of writing a segment happens outside both.
//! Waiting for a flush to finish (`flush`, `compact`) releases the
//! reader lock before blocking on the background worker, so a `get`
//! running concurrently is never held up for the duration of that I/O.

use std::{
    collections::BTreeMap,
    fs, io,
    path::{Path, PathBuf},
    sync::{
        mpsc::{self, Receiver, Sender},
        Arc, Condvar, Mutex, RwLock,
    },
    thread::JoinHandle,
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::memtable::Memtable;
use crate::segment::{SegmentError, SegmentReader, SegmentWriter};
use crate::wal::{self, Wal, WalError};

#[cfg(test)]
mod tests;

/// Errors that can occur during engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    #[error("segment error: {0}")]
    Segment(#[from] SegmentError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("bad argument: {0}")]
    BadArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Configuration for an [`Engine`] instance, passed to [`Engine::open`].
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Approximate memtable size (bytes) that triggers a rotation.
    pub memtable_byte_budget: usize,

    /// Whether writes go through the WAL. Disabling this trades
    /// durability for throughput; recovery after a crash only sees
    /// data already flushed to a segment.
    pub wal_enabled: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            memtable_byte_budget: 100 * 1024 * 1024,
            wal_enabled: true,
        }
    }
}

/// A read-only snapshot of engine state, useful for deciding when to
/// call [`Engine::compact`].
#[derive(Debug, Clone, Copy, Default)]
pub struct EngineStats {
    pub segment_count: usize,
    pub active_memtable_bytes: usize,
    pub total_segment_bytes: u64,
}

const ACTIVE_WAL_NAME: &str = wal::ACTIVE_FILE_NAME;
const FLUSHING_WAL_NAME: &str = wal::FLUSHING_FILE_NAME;

/// One message sent to the background flush worker: a frozen memtable
/// plus the path of the WAL file it must retire once durably flushed.
struct FlushJob {
    memtable: Memtable,
    flushing_wal_path: PathBuf,
    data_dir: PathBuf,
    seq_hint: u64,
}

/// Outcome of a completed flush, delivered back to the engine so it can
/// install the new segment reader at the front of the list.
struct FlushOutcome {
    result: Result<Option<Arc<SegmentReader>>, EngineError>,
}

struct FlushWorker {
    job_tx: Sender<FlushJob>,
    handle: Option<JoinHandle<()>>,
    completion: Arc<(Mutex<Option<FlushOutcome>>, Condvar)>,
}

impl FlushWorker {
    fn spawn() -> Self {
        let (job_tx, job_rx): (Sender<FlushJob>, Receiver<FlushJob>) = mpsc::channel();
        let completion = Arc::new((Mutex::new(None), Condvar::new()));
        let completion_for_thread = Arc::clone(&completion);

        let handle = std::thread::spawn(move || {
            for job in job_rx {
                let result = run_flush(job);
                let (lock, cvar) = &*completion_for_thread;
                let mut guard = lock.lock().unwrap();
                *guard = Some(FlushOutcome { result });
                cvar.notify_all();
            }
        });

        Self {
            job_tx,
            handle: Some(handle),
            completion,
        }
    }

    fn submit(&self, job: FlushJob) -> Result<(), EngineError> {
        self.job_tx
            .send(job)
            .map_err(|_| EngineError::Internal("flush worker gone".into()))
    }

    /// Blocks until the most recently submitted job completes, returning
    /// its outcome exactly once.
    fn wait(&self) -> Result<Option<Arc<SegmentReader>>, EngineError> {
        let (lock, cvar) = &*self.completion;
        let mut guard = lock.lock().unwrap();
        while guard.is_none() {
            guard = cvar.wait(guard).unwrap();
        }
        guard.take().unwrap().result
    }
}

impl Drop for FlushWorker {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            drop(std::mem::replace(&mut self.job_tx, mpsc::channel().0));
            let _ = handle.join();
        }
    }
}

fn run_flush(job: FlushJob) -> Result<Option<Arc<SegmentReader>>, EngineError> {
    if job.memtable.is_empty() {
        wal::remove_flushing_file(&job.flushing_wal_path)?;
        return Ok(None);
    }

    let file_name = segment_file_name(job.seq_hint);
    let final_path = job.data_dir.join(file_name);
    let count = job.memtable.len();

    info!(path = %final_path.display(), count, "flushing memtable to segment");
    let path = SegmentWriter::new(&final_path).write(job.memtable.drain_sorted(), count)?;
    let reader = SegmentReader::open(&path)?;

    wal::remove_flushing_file(&job.flushing_wal_path)?;
    info!(path = %path.display(), "flush complete");

    Ok(Some(Arc::new(reader)))
}

/// The engine's coordinator state, guarded by the writer/reader locks
/// described at module level.
struct EngineInner {
    data_dir: PathBuf,
    options: EngineOptions,
    active: Memtable,
    wal: Option<Wal>,
    segments: Vec<Arc<SegmentReader>>,
    seq: u64,
    flush_in_flight: bool,
}

/// An embeddable, persistent key-value store.
///
/// Cloning an [`Engine`] is cheap and yields a handle to the same
/// underlying store; all clones share one writer lock, one reader lock,
/// and one background flush worker.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<RwLock<EngineInner>>,
    writer_lock: Arc<Mutex<()>>,
    flush_worker: Arc<FlushWorker>,
}

impl Engine {
    /// Opens (creating if absent) a store rooted at `data_dir`.
    ///
    /// Recovery sequence: list existing segment files matching the
    /// segment filename pattern, ordered newest-first by filename
    /// (which sorts chronologically); corrupt segments are logged and
    /// skipped rather than failing the whole open. Then replay
    /// `wal.log.flushing` (if a crash interrupted a prior flush)
    /// followed by `wal.log` into a fresh memtable.
    pub fn open<P: AsRef<Path>>(data_dir: P, options: EngineOptions) -> Result<Self, EngineError> {
        if options.memtable_byte_budget == 0 {
            return Err(EngineError::BadArgument(
                "memtable_byte_budget must be greater than zero".into(),
            ));
        }

        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let mut segment_paths = Vec::new();
        for entry in fs::read_dir(&data_dir)? {
            let entry = entry?;
            let file_name = entry.file_name();
            let name = file_name.to_string_lossy();
            if name.starts_with("sstable_") && name.ends_with(".sst") {
                segment_paths.push(entry.path());
            } else if name.starts_with("sstable_") && name.ends_with(".tmp") {
                // Orphaned temp file from a crash mid-write; harmless, clean it up.
                let _ = fs::remove_file(entry.path());
            }
        }
        // Filenames embed a chronologically sortable timestamp; newest first.
        segment_paths.sort_unstable_by(|a, b| b.cmp(a));

        let mut segments = Vec::with_capacity(segment_paths.len());
        for path in segment_paths {
            match SegmentReader::open(&path) {
                Ok(reader) => segments.push(Arc::new(reader)),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable segment"),
            }
        }

        let mut active = Memtable::new(options.memtable_byte_budget);
        let wal = if options.wal_enabled {
            let flushing_path = data_dir.join(FLUSHING_WAL_NAME);
            if flushing_path.exists() {
                let recovering = Wal::open(&flushing_path)?;
                for record in recovering.replay_iter()? {
                    active.insert(record.key, record.value);
                }
            }

            let active_path = data_dir.join(ACTIVE_WAL_NAME);
            let active_wal = Wal::open(&active_path)?;
            for record in active_wal.replay_iter()? {
                active.insert(record.key, record.value);
            }

            Some(active_wal)
        } else {
            None
        };

        info!(
            data_dir = %data_dir.display(),
            segment_count = segments.len(),
            recovered_records = active.len(),
            "engine opened"
        );

        let inner = EngineInner {
            data_dir: data_dir.clone(),
            options,
            active,
            wal,
            segments,
            seq: 0,
            flush_in_flight: false,
        };

        Ok(Self {
            inner: Arc::new(RwLock::new(inner)),
            writer_lock: Arc::new(Mutex::new(())),
            flush_worker: Arc::new(FlushWorker::spawn()),
        })
    }

    /// Appends `key`/`value` to the WAL (if enabled) then inserts into
    /// the active memtable. If that insertion fills the memtable past
    /// its budget, rotates to a fresh memtable and hands the frozen one
    /// to the background flush pipeline. Never waits for that flush.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Result<(), EngineError> {
        let _writer_guard = self.writer_lock.lock().unwrap();

        let full = {
            let mut inner = self.inner.write().map_err(poison)?;
            if let Some(wal) = &inner.wal {
                wal.append(&key, &value)?;
            }
            inner.active.insert(key, value);
            inner.active.is_full()
        };

        if full {
            self.rotate_and_flush()?;
        }

        Ok(())
    }

    /// Looks up `key`: active memtable, then each segment newest-first.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, EngineError> {
        let (value, segments) = {
            let inner = self.inner.read().map_err(poison)?;
            let hit = inner.active.lookup(key).cloned();
            (hit, inner.segments.clone())
        };

        if let Some(value) = value {
            return Ok(Some(value));
        }

        for segment in &segments {
            if let Some(value) = segment.get(key)? {
                return Ok(Some(value));
            }
        }

        Ok(None)
    }

    /// Waits for any in-flight or pending flush to complete. If the
    /// active memtable is non-empty, forces a rotation first so its
    /// contents are durably written out before returning. Neither step
    /// holds the inner lock across the flush worker's I/O, so concurrent
    /// `get` calls are never blocked for the duration of a flush.
    pub fn flush(&self) -> Result<(), EngineError> {
        let _writer_guard = self.writer_lock.lock().unwrap();

        let active_is_empty = self.inner.read().map_err(poison)?.active.is_empty();
        if !active_is_empty {
            self.rotate_and_flush()?;
        }
        self.await_pending_flush()?;
        Ok(())
    }

    /// Merges every segment into a single new one, oldest-first so that
    /// newer segments' records overwrite older ones on key collision.
    /// A failed compaction leaves the existing segments unchanged.
    /// Foreground-flushes the active memtable first so no committed data
    /// is left out of the merge.
    pub fn compact(&self) -> Result<(), EngineError> {
        let _writer_guard = self.writer_lock.lock().unwrap();

        let active_is_empty = self.inner.read().map_err(poison)?.active.is_empty();
        if !active_is_empty {
            self.rotate_and_flush()?;
        }
        self.await_pending_flush()?;

        let segments = {
            let inner = self.inner.read().map_err(poison)?;
            inner.segments.clone()
        };
        if segments.len() < 2 {
            return Ok(());
        }

        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for segment in segments.iter().rev() {
            for (key, value) in segment.scan_all()? {
                merged.insert(key, value);
            }
        }

        let (data_dir, seq) = {
            let mut inner = self.inner.write().map_err(poison)?;
            inner.segments.clear();
            inner.seq += 1;
            (inner.data_dir.clone(), inner.seq)
        };

        let new_segment = if merged.is_empty() {
            None
        } else {
            let count = merged.len();
            let path = data_dir.join(segment_file_name(seq));
            let written = SegmentWriter::new(&path).write(merged.into_iter(), count)?;
            Some(Arc::new(SegmentReader::open(&written)?))
        };

        {
            let mut inner = self.inner.write().map_err(poison)?;
            inner.segments = new_segment.into_iter().collect();
        }

        for old in &segments {
            if let Err(e) = fs::remove_file(old.path()) {
                warn!(path = %old.path().display(), error = %e, "failed to remove old segment after compaction");
            }
        }

        debug!("compaction complete");
        Ok(())
    }

    /// Flushes any remaining data and releases resources. After
    /// `close`, no further calls should be made on this handle.
    pub fn close(&self) -> Result<(), EngineError> {
        self.flush()
    }

    /// Returns a snapshot of current engine statistics.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        let inner = self.inner.read().map_err(poison)?;
        let mut total_segment_bytes = 0u64;
        for segment in &inner.segments {
            total_segment_bytes += fs::metadata(segment.path()).map(|m| m.len()).unwrap_or(0);
        }
        Ok(EngineStats {
            segment_count: inner.segments.len(),
            active_memtable_bytes: inner.active.approximate_size_bytes(),
            total_segment_bytes,
        })
    }

    /// Rotates the active memtable/WAL and submits the frozen memtable
    /// to the background flush worker. Must be called with the writer
    /// lock held; only takes the inner write lock briefly to swap state,
    /// never across the flush worker's I/O.
    fn rotate_and_flush(&self) -> Result<(), EngineError> {
        self.await_pending_flush()?;

        let job = {
            let mut inner = self.inner.write().map_err(poison)?;

            inner.seq += 1;
            let seq = inner.seq;
            let fresh = Memtable::new(inner.options.memtable_byte_budget);
            let frozen = std::mem::replace(&mut inner.active, fresh);

            let flushing_wal_path = if let Some(wal) = inner.wal.as_mut() {
                wal.rotate()?
            } else {
                inner.data_dir.join(FLUSHING_WAL_NAME)
            };

            inner.flush_in_flight = true;
            FlushJob {
                memtable: frozen,
                flushing_wal_path,
                data_dir: inner.data_dir.clone(),
                seq_hint: seq,
            }
        };

        self.flush_worker.submit(job)
    }

    /// Blocks until a previously submitted flush finishes, and installs
    /// its segment at the front of the list. Must be called with the
    /// writer lock held, but never holds the inner lock across the
    /// blocking wait — only briefly, before and after, to check and then
    /// record the outcome. This keeps `get` unblocked for the duration
    /// of the flush's disk I/O.
    fn await_pending_flush(&self) -> Result<(), EngineError> {
        let in_flight = self.inner.read().map_err(poison)?.flush_in_flight;
        if !in_flight {
            return Ok(());
        }

        let new_segment = self.flush_worker.wait()?;

        let mut inner = self.inner.write().map_err(poison)?;
        inner.flush_in_flight = false;
        if let Some(new_segment) = new_segment {
            inner.segments.insert(0, new_segment);
        }
        Ok(())
    }
}

fn poison<T>(_: std::sync::PoisonError<T>) -> EngineError {
    EngineError::Internal("lock poisoned".into())
}

/// Formats a segment filename per the on-disk layout:
/// `sstable_<YYYYMMDD_HHMMSS_fff>_<seq>.sst`. The millisecond timestamp
/// keeps lexicographic sort aligned with chronological order; the
/// trailing sequence number (also monotonic) guarantees uniqueness for
/// flushes that land within the same millisecond.
fn segment_file_name(seq: u64) -> String {
    format!("sstable_{}_{:06}.sst", format_utc_millis(SystemTime::now()), seq)
}

/// Formats a [`SystemTime`] as UTC `YYYYMMDD_HHMMSS_fff`, using a
/// hand-rolled Gregorian calendar conversion (civil-from-days) rather
/// than pulling in a date/time crate.
fn format_utc_millis(t: SystemTime) -> String {
    let since_epoch = t.duration_since(UNIX_EPOCH).unwrap_or_default();
    let millis_total = since_epoch.as_millis();
    let secs_total = (millis_total / 1000) as i64;
    let millis = (millis_total % 1000) as u32;

    let days = secs_total.div_euclid(86_400);
    let secs_of_day = secs_total.rem_euclid(86_400);
    let (hour, minute, second) = (secs_of_day / 3600, (secs_of_day / 60) % 60, secs_of_day % 60);

    let (year, month, day) = civil_from_days(days);

    format!("{year:04}{month:02}{day:02}_{hour:02}{minute:02}{second:02}_{millis:03}")
}

/// Howard Hinnant's `civil_from_days` algorithm: days since the Unix
/// epoch to a proleptic-Gregorian (year, month, day).
fn civil_from_days(z: i64) -> (i32, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    let y = if m <= 2 { y + 1 } else { y };
    (y as i32, m, d)
}
