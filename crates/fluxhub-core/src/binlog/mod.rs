//! Segmented write-ahead binlog
//!
//! Append-only segment files named `binlog_<N>` under one log directory.
//! Only the highest-numbered segment is writable; rotation happens at a
//! fixed size threshold. One writer, many readers: the manager owns the
//! shared `WriterOffset` and the condition variable that wakes readers
//! blocked at end-of-log.

mod reader;
mod writer;

pub use reader::{BinlogReader, ReadOutcome, ReaderStopHandle};
pub use writer::BinlogWriter;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};
use crate::recency::RecencyCache;

/// Segment file name prefix.
pub const BINLOG_PREFIX: &str = "binlog_";

/// Rotation threshold for a segment file.
pub const MAX_SEGMENT_SIZE: u64 = 100 * 1024 * 1024;

/// End position of the last record durably appended. Ordered
/// lexicographically by `(segment, offset)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct WriterOffset {
    /// Active segment sequence number
    pub segment: u64,
    /// Bytes durably written within the active segment
    pub offset: u64,
}

/// Shared between the manager, the writer and every reader: the writer
/// offset and the condvar broadcast on every append. The mutex guards
/// only the offset, never any I/O.
pub(crate) struct LogState {
    pub(crate) offset: Mutex<WriterOffset>,
    pub(crate) cond: Condvar,
}

/// Path of segment `n` under `dir`.
pub(crate) fn segment_path(dir: &Path, n: u64) -> PathBuf {
    dir.join(format!("{}{}", BINLOG_PREFIX, n))
}

/// Scan a log directory for `binlog_<N>` files, returning the smallest
/// and largest segment numbers present.
fn scan_segments(dir: &Path) -> Result<Option<(u64, u64)>> {
    let mut smallest = u64::MAX;
    let mut largest = 0u64;
    let mut found = false;
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(num) = name.strip_prefix(BINLOG_PREFIX) else {
            continue;
        };
        let Ok(num) = num.parse::<u64>() else { continue };
        smallest = smallest.min(num);
        largest = largest.max(num);
        found = true;
    }
    Ok(found.then_some((smallest, largest)))
}

/// Owns the segment log: the writer slot, the recency cache, the shared
/// offset/condvar pair, crash recovery and the reset used on demotion.
pub struct BinlogManager {
    log_dir: PathBuf,
    state: Arc<LogState>,
    recency: Arc<RecencyCache>,
    max_segment_size: u64,
    writer_alive: Arc<AtomicBool>,
    first_segment: AtomicU64,
}

impl BinlogManager {
    /// Open (or create) the log directory. The next write segment is one
    /// past the largest on disk; numbering starts at 1 on an empty
    /// directory.
    pub fn create(
        log_dir: impl Into<PathBuf>,
        recency_capacity: usize,
        max_segment_size: u64,
    ) -> Result<Self> {
        let log_dir = log_dir.into();
        std::fs::create_dir_all(&log_dir)?;
        let (first, next) = match scan_segments(&log_dir)? {
            Some((smallest, largest)) => (smallest, largest + 1),
            None => (1, 1),
        };
        Ok(Self {
            log_dir,
            state: Arc::new(LogState {
                offset: Mutex::new(WriterOffset {
                    segment: next,
                    offset: 0,
                }),
                cond: Condvar::new(),
            }),
            recency: Arc::new(RecencyCache::new(recency_capacity)),
            max_segment_size,
            writer_alive: Arc::new(AtomicBool::new(false)),
            first_segment: AtomicU64::new(first),
        })
    }

    /// The writer-side recency cache.
    pub fn recency(&self) -> &Arc<RecencyCache> {
        &self.recency
    }

    /// Smallest retained segment number.
    pub fn first_segment(&self) -> u64 {
        self.first_segment.load(Ordering::SeqCst)
    }

    /// Current end of the durably written log.
    pub fn writer_offset(&self) -> WriterOffset {
        *self.state.offset.lock()
    }

    /// Create the single active writer. A second writer while one is live
    /// is a role-transition hazard and is rejected.
    pub fn add_writer(&self) -> Result<BinlogWriter> {
        if self.writer_alive.swap(true, Ordering::SeqCst) {
            return Err(Error::binlog("a writer is already active"));
        }
        let writer = BinlogWriter::create(
            self.log_dir.clone(),
            Arc::clone(&self.state),
            Arc::clone(&self.recency),
            self.max_segment_size,
            Arc::clone(&self.writer_alive),
        );
        if writer.is_err() {
            self.writer_alive.store(false, Ordering::SeqCst);
        }
        writer
    }

    /// Create a reader positioned at `(segment, offset)`. `exit_at_end`
    /// readers return a terminal signal instead of blocking when caught
    /// up; live readers block on the shared condvar.
    pub fn add_reader(&self, segment: u64, offset: u64, exit_at_end: bool) -> Result<BinlogReader> {
        BinlogReader::open(
            self.log_dir.clone(),
            Arc::clone(&self.state),
            segment,
            offset,
            exit_at_end,
        )
    }

    /// Replay every retained record into the recency cache. Called once
    /// at startup, before any writer or reader exists. Returns the number
    /// of records replayed.
    pub fn recover_cache(&self) -> Result<u64> {
        let first = self.first_segment.load(Ordering::SeqCst);
        if !segment_path(&self.log_dir, first).exists() {
            return Ok(0);
        }
        let mut reader = self.add_reader(first, 0, true)?;
        let replayed = self.recency.recover(&mut reader)?;
        tracing::info!(replayed, "recency cache recovered from binlog");
        Ok(replayed)
    }

    /// Discard every segment file, reset the writer offset to `(1, 0)`
    /// and clear the recency cache. Used on demotion from primary; must
    /// only be called once the writer and all readers are gone.
    pub fn reset_offset_and_log(&self) -> Result<()> {
        if self.writer_alive.load(Ordering::SeqCst) {
            return Err(Error::binlog("cannot reset the log while a writer is active"));
        }
        for entry in std::fs::read_dir(&self.log_dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(BINLOG_PREFIX) {
                    std::fs::remove_file(entry.path())?;
                }
            }
        }
        *self.state.offset.lock() = WriterOffset {
            segment: 1,
            offset: 0,
        };
        self.first_segment.store(1, Ordering::SeqCst);
        self.recency.clear();
        self.state.cond.notify_all();
        tracing::info!("binlog reset: all segments discarded");
        Ok(())
    }

    /// Advisory trim: delete segments strictly below `low_water`, never
    /// touching the active segment. Callers are responsible for choosing
    /// a low-water mark no reader still references. Returns the number of
    /// files removed.
    pub fn purge_segments_below(&self, low_water: u64) -> Result<u64> {
        let active = self.state.offset.lock().segment;
        let low_water = low_water.min(active);
        let first = self.first_segment.load(Ordering::SeqCst);
        let mut removed = 0u64;
        for n in first..low_water {
            let path = segment_path(&self.log_dir, n);
            if path.exists() {
                std::fs::remove_file(path)?;
                removed += 1;
            }
        }
        if low_water > first {
            self.first_segment.store(low_water, Ordering::SeqCst);
        }
        if removed > 0 {
            tracing::info!(removed, low_water, "purged binlog segments");
        }
        Ok(removed)
    }
}
