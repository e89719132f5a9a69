//! Blocking binlog reader
//!
//! Sequential cursor over the segment files. When a read hits the end of
//! the durably written log, an exit-at-end reader reports `EndOfLog`; a
//! live reader blocks on the shared condvar until the writer appends
//! more or the reader is stopped.

use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::{segment_path, LogState};
use crate::error::{Error, Result};
use crate::record::{LogRecord, FRAME_HEADER_LEN, MAX_FRAME_LEN};

/// Outcome of one `read_next` call.
#[derive(Debug)]
pub enum ReadOutcome {
    /// Next record in the stream
    Record(LogRecord),
    /// Caught up (exit-at-end readers only)
    EndOfLog,
    /// The reader was stopped while blocked or between reads
    Stopped,
}

enum FrameRead {
    Record(LogRecord),
    Eof,
    Partial,
}

/// Wakes and permanently stops a reader that may be blocked at
/// end-of-log. Safe to call from any thread, any number of times.
pub struct ReaderStopHandle {
    stopped: Arc<AtomicBool>,
    state: Arc<LogState>,
}

impl ReaderStopHandle {
    /// Stop the reader. Its next (or current, if blocked) `read_next`
    /// returns `Stopped`.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.state.cond.notify_all();
    }
}

/// Sequential reader over the segment log.
pub struct BinlogReader {
    log_dir: PathBuf,
    state: Arc<LogState>,
    file: BufReader<File>,
    segment: u64,
    offset: u64,
    exit_at_end: bool,
    stopped: Arc<AtomicBool>,
}

fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

impl BinlogReader {
    pub(super) fn open(
        log_dir: PathBuf,
        state: Arc<LogState>,
        segment: u64,
        offset: u64,
        exit_at_end: bool,
    ) -> Result<Self> {
        let file = open_at(&log_dir, segment, offset)?;
        Ok(Self {
            log_dir,
            state,
            file,
            segment,
            offset,
            exit_at_end,
            stopped: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Current position: the start of the next unread frame.
    pub fn position(&self) -> (u64, u64) {
        (self.segment, self.offset)
    }

    /// Handle for stopping this reader from another thread.
    pub fn stop_handle(&self) -> ReaderStopHandle {
        ReaderStopHandle {
            stopped: Arc::clone(&self.stopped),
            state: Arc::clone(&self.state),
        }
    }

    /// Like `read_next` but never blocks: `EndOfLog` when caught up,
    /// regardless of the reader's policy. Used to drain whatever is
    /// immediately available.
    pub fn read_next_nonblocking(&mut self) -> Result<ReadOutcome> {
        let saved = self.exit_at_end;
        self.exit_at_end = true;
        let outcome = self.read_next();
        self.exit_at_end = saved;
        outcome
    }

    /// Read the next record, blocking at end-of-log unless this reader is
    /// in exit-at-end mode. Corruption below the writer offset is fatal
    /// to the reader and surfaces as `Error::Corruption`.
    pub fn read_next(&mut self) -> Result<ReadOutcome> {
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return Ok(ReadOutcome::Stopped);
            }
            match self.read_frame()? {
                FrameRead::Record(record) => return Ok(ReadOutcome::Record(record)),
                FrameRead::Eof => {}
                FrameRead::Partial => {
                    // A torn tail with a successor segment on disk is a
                    // crash artifact; skip past it.
                    if self.try_roll()? {
                        continue;
                    }
                }
            }

            let caught_up = {
                let off = self.state.offset.lock();
                (self.segment, self.offset) >= (off.segment, off.offset)
            };
            if caught_up {
                if self.exit_at_end {
                    return Ok(ReadOutcome::EndOfLog);
                }
                let mut off = self.state.offset.lock();
                while !self.stopped.load(Ordering::SeqCst)
                    && (self.segment, self.offset) >= (off.segment, off.offset)
                {
                    self.state.cond.wait(&mut off);
                }
                continue;
            }

            // The writer offset is ahead of us. Either this segment has
            // more bytes we have not seen land yet, or the log rolled.
            let disk_len = std::fs::metadata(segment_path(&self.log_dir, self.segment))?.len();
            if disk_len > self.offset {
                std::thread::sleep(Duration::from_millis(1));
                continue;
            }
            if self.try_roll()? {
                continue;
            }
            // The published offset names a segment that has no file yet
            // (the slot reserved after a restart). This is the true end
            // of on-disk data.
            if self.exit_at_end {
                return Ok(ReadOutcome::EndOfLog);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Read one frame at the cursor. `Partial` leaves the cursor at the
    /// frame start so the read can be retried.
    fn read_frame(&mut self) -> Result<FrameRead> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let n = read_full(&mut self.file, &mut header)?;
        if n == 0 {
            return Ok(FrameRead::Eof);
        }
        if n < FRAME_HEADER_LEN {
            self.rewind()?;
            return Ok(FrameRead::Partial);
        }
        let len = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::corruption(format!(
                "frame length {} at segment {} offset {} exceeds maximum",
                len, self.segment, self.offset
            )));
        }
        let crc = u32::from_le_bytes(header[4..8].try_into().unwrap());
        let mut payload = vec![0u8; len];
        let m = read_full(&mut self.file, &mut payload)?;
        if m < len {
            self.rewind()?;
            return Ok(FrameRead::Partial);
        }
        if crc32fast::hash(&payload) != crc {
            return Err(Error::corruption(format!(
                "checksum mismatch at segment {} offset {}",
                self.segment, self.offset
            )));
        }
        self.offset += (FRAME_HEADER_LEN + len) as u64;
        Ok(FrameRead::Record(LogRecord::decode_payload(&payload)?))
    }

    fn rewind(&mut self) -> Result<()> {
        self.file.seek(SeekFrom::Start(self.offset))?;
        Ok(())
    }

    /// Advance to the next segment if it exists on disk.
    fn try_roll(&mut self) -> Result<bool> {
        let next = self.segment + 1;
        if !segment_path(&self.log_dir, next).exists() {
            return Ok(false);
        }
        self.file = open_at(&self.log_dir, next, 0)?;
        tracing::trace!(from = self.segment, to = next, "reader rolled to next segment");
        self.segment = next;
        self.offset = 0;
        Ok(true)
    }
}

fn open_at(log_dir: &std::path::Path, segment: u64, offset: u64) -> Result<BufReader<File>> {
    let path = segment_path(log_dir, segment);
    let file = File::open(&path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::not_found(format!("segment {} missing from {:?}", segment, log_dir))
        } else {
            e.into()
        }
    })?;
    let mut file = BufReader::new(file);
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))?;
    }
    Ok(file)
}
