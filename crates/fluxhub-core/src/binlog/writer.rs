//! Group-commit binlog writer
//!
//! Callers enqueue an append ticket and block on its condvar. The first
//! caller to find no leader active becomes the batch leader: it drains
//! the queue, dedupes through the recency cache, writes the surviving
//! frames as one blob, publishes the new writer offset and completes
//! every ticket in the batch. Followers just wait.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use super::{segment_path, LogState, WriterOffset};
use crate::error::Result;
use crate::record::LogRecord;
use crate::recency::RecencyCache;

type CommitResult = std::result::Result<WriterOffset, String>;

struct AppendTicket {
    record: LogRecord,
    done: Mutex<Option<CommitResult>>,
    cv: Condvar,
}

impl AppendTicket {
    fn new(record: LogRecord) -> Self {
        Self {
            record,
            done: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn complete(&self, result: CommitResult) {
        *self.done.lock() = Some(result);
        self.cv.notify_one();
    }

    fn wait(&self) -> CommitResult {
        let mut done = self.done.lock();
        while done.is_none() {
            self.cv.wait(&mut done);
        }
        done.take().unwrap()
    }
}

struct CommitQueue {
    pending: VecDeque<Arc<AppendTicket>>,
    leader_active: bool,
}

struct ActiveSegment {
    file: File,
    segment: u64,
    size: u64,
}

struct WriterInner {
    log_dir: PathBuf,
    state: Arc<LogState>,
    recency: Arc<RecencyCache>,
    max_segment_size: u64,
    queue: Mutex<CommitQueue>,
    active: Mutex<ActiveSegment>,
    alive: Arc<AtomicBool>,
}

impl Drop for WriterInner {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

/// Handle to the single active writer. Cheap to clone; every inbound
/// connection thread appends through a clone.
#[derive(Clone)]
pub struct BinlogWriter {
    inner: Arc<WriterInner>,
}

fn open_segment(dir: &std::path::Path, n: u64) -> std::io::Result<(File, u64)> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(segment_path(dir, n))?;
    let size = file.metadata()?.len();
    Ok((file, size))
}

impl BinlogWriter {
    pub(super) fn create(
        log_dir: PathBuf,
        state: Arc<LogState>,
        recency: Arc<RecencyCache>,
        max_segment_size: u64,
        alive: Arc<AtomicBool>,
    ) -> Result<Self> {
        let start = *state.offset.lock();
        let (file, size) = open_segment(&log_dir, start.segment)?;
        {
            let mut off = state.offset.lock();
            off.offset = size;
        }
        tracing::debug!(segment = start.segment, size, "binlog writer opened");
        Ok(Self {
            inner: Arc::new(WriterInner {
                log_dir,
                state,
                recency,
                max_segment_size,
                queue: Mutex::new(CommitQueue {
                    pending: VecDeque::new(),
                    leader_active: false,
                }),
                active: Mutex::new(ActiveSegment {
                    file,
                    segment: start.segment,
                    size,
                }),
                alive,
            }),
        })
    }

    /// Append one record, blocking until its batch is durably written.
    /// A record rejected by the recency cache still succeeds; it simply
    /// contributes no bytes. Returns the writer offset after the batch.
    pub fn append(&self, record: LogRecord) -> Result<WriterOffset> {
        let ticket = Arc::new(AppendTicket::new(record));
        let lead = {
            let mut queue = self.inner.queue.lock();
            queue.pending.push_back(Arc::clone(&ticket));
            if queue.leader_active {
                false
            } else {
                queue.leader_active = true;
                true
            }
        };
        if lead {
            self.lead_commit();
        }
        ticket
            .wait()
            .map_err(|msg| std::io::Error::other(msg).into())
    }

    /// Drain and commit batches until the queue is empty, then step down
    /// as leader. Runs on the calling thread of the first waiter.
    fn lead_commit(&self) {
        loop {
            let batch: Vec<Arc<AppendTicket>> = {
                let mut queue = self.inner.queue.lock();
                if queue.pending.is_empty() {
                    queue.leader_active = false;
                    return;
                }
                queue.pending.drain(..).collect()
            };
            let result = self.write_batch(&batch);
            for ticket in &batch {
                ticket.complete(result.clone());
            }
        }
    }

    /// Dedupe the batch, write the surviving frames as one blob and
    /// publish the new offset. Errors are carried as strings so one
    /// result can fan out to every ticket.
    fn write_batch(&self, batch: &[Arc<AppendTicket>]) -> CommitResult {
        let mut blob = Vec::new();
        let mut accepted = 0usize;
        for ticket in batch {
            let r = &ticket.record;
            if self
                .inner
                .recency
                .check_and_update(&r.key, r.origin_id, r.logical_time)
            {
                blob.extend_from_slice(&r.encode_frame());
                accepted += 1;
            } else {
                tracing::trace!(
                    origin_id = r.origin_id,
                    logical_time = r.logical_time,
                    "stale record dropped before commit"
                );
            }
        }

        let mut active = self.inner.active.lock();
        if !blob.is_empty() {
            if active.size >= self.inner.max_segment_size {
                self.roll(&mut active).map_err(|e| e.to_string())?;
            }
            if let Err(e) = active.file.write_all(&blob) {
                // A torn blob must not leave bytes the next batch would
                // land after; truncate back to the published size.
                let _ = active.file.set_len(active.size);
                return Err(e.to_string());
            }
            active.size += blob.len() as u64;
            tracing::trace!(
                accepted,
                total = batch.len(),
                bytes = blob.len(),
                "batch committed"
            );
        }
        let committed = WriterOffset {
            segment: active.segment,
            offset: active.size,
        };
        drop(active);

        *self.inner.state.offset.lock() = committed;
        self.inner.state.cond.notify_all();
        Ok(committed)
    }

    fn roll(&self, active: &mut ActiveSegment) -> std::io::Result<()> {
        let next = active.segment + 1;
        let (file, size) = open_segment(&self.inner.log_dir, next)?;
        tracing::info!(from = active.segment, to = next, "binlog segment rotated");
        active.file = file;
        active.segment = next;
        active.size = size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binlog::{BinlogManager, ReadOutcome, MAX_SEGMENT_SIZE};
    use crate::record::RecordOp;
    use tempfile::TempDir;

    fn record(key: &str, value: &str, origin: i32, time: i32) -> LogRecord {
        LogRecord::new(
            RecordOp::Set,
            key.as_bytes().to_vec(),
            value.as_bytes().to_vec(),
            origin,
            time,
        )
    }

    #[test]
    fn test_append_advances_offset() {
        let dir = TempDir::new().unwrap();
        let manager = BinlogManager::create(dir.path(), 1024, MAX_SEGMENT_SIZE).unwrap();
        let writer = manager.add_writer().unwrap();
        let rec = record("k", "v", 1, 1);
        let off = writer.append(rec.clone()).unwrap();
        assert_eq!(off.segment, 1);
        assert_eq!(off.offset, rec.frame_len() as u64);
        assert_eq!(manager.writer_offset(), off);
    }

    #[test]
    fn test_stale_append_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let manager = BinlogManager::create(dir.path(), 1024, MAX_SEGMENT_SIZE).unwrap();
        let writer = manager.add_writer().unwrap();
        let first = writer.append(record("k", "new", 1, 10)).unwrap();
        // Older stamp for the same key: accepted call, zero bytes.
        let second = writer.append(record("k", "old", 2, 5)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_rotation_at_threshold() {
        let dir = TempDir::new().unwrap();
        let manager = BinlogManager::create(dir.path(), 1024, 64).unwrap();
        let writer = manager.add_writer().unwrap();
        for i in 0..8 {
            writer
                .append(record(&format!("key-{}", i), "0123456789abcdef", 1, i))
                .unwrap();
        }
        assert!(manager.writer_offset().segment > 1);
        // Every segment replays cleanly end to end.
        let mut reader = manager.add_reader(1, 0, true).unwrap();
        let mut seen = 0;
        while let ReadOutcome::Record(_) = reader.read_next().unwrap() {
            seen += 1;
        }
        assert_eq!(seen, 8);
    }

    /// When a batch cannot be written, every caller waiting on it sees
    /// the failure and the published offset does not move.
    #[test]
    fn test_batch_failure_reported_to_every_caller() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("log");
        // Threshold of 1 byte: every append after the first forces a
        // rotation, which needs the directory.
        let manager = BinlogManager::create(&log_dir, 1024, 1).unwrap();
        let writer = manager.add_writer().unwrap();
        writer.append(record("seed", "v", 1, 0)).unwrap();
        let before = manager.writer_offset();

        std::fs::remove_dir_all(&log_dir).unwrap();
        let mut handles = Vec::new();
        for t in 0..4 {
            let writer = writer.clone();
            handles.push(std::thread::spawn(move || {
                writer.append(record(&format!("k{}", t), "v", 1, t + 1))
            }));
        }
        for h in handles {
            assert!(h.join().unwrap().is_err());
        }
        assert_eq!(manager.writer_offset(), before);
    }

    #[test]
    fn test_concurrent_appends_all_commit() {
        let dir = TempDir::new().unwrap();
        let manager = BinlogManager::create(dir.path(), 4096, MAX_SEGMENT_SIZE).unwrap();
        let writer = manager.add_writer().unwrap();
        let mut handles = Vec::new();
        for t in 0..4 {
            let writer = writer.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..50 {
                    writer
                        .append(record(&format!("t{}-k{}", t, i), "v", t, i))
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let mut reader = manager.add_reader(1, 0, true).unwrap();
        let mut seen = 0;
        while let ReadOutcome::Record(_) = reader.read_next().unwrap() {
            seen += 1;
        }
        assert_eq!(seen, 200);
    }
}
