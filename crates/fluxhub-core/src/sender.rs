//! Binlog sender
//!
//! One thread per connected peer. The sender owns a private live reader
//! anchored at the peer's send position and a private recency cache
//! modelling that peer's view of the stream. Records flow: blocking
//! read, drain whatever else is immediately available up to the batch
//! cap, filter (self-origin and stale records are skipped), translate
//! to wire mutations, flush as one send, then advance the acknowledged
//! position. A failed flush keeps the encoded batch pending so nothing
//! is skipped or re-read.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;

use crate::binlog::{BinlogReader, ReadOutcome, ReaderStopHandle};
use crate::error::Result;
use crate::hub::Hub;
use crate::peer::SyncStatus;
use crate::protocol;
use crate::recency::RecencyCache;
use crate::record::LogRecord;
use crate::transport::PeerTransport;

/// Stop plumbing shared with the running thread. The reader handle is
/// swapped whenever the sender re-subscribes, so `stop` always reaches
/// the reader currently in use.
struct StopShared {
    requested: AtomicBool,
    current: Mutex<Option<ReaderStopHandle>>,
}

impl StopShared {
    fn stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
        if let Some(handle) = self.current.lock().as_ref() {
            handle.stop();
        }
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Handle to a running sender thread.
pub struct SenderHandle {
    shared: Arc<StopShared>,
    thread: JoinHandle<()>,
}

impl SenderHandle {
    /// Stop the sender and join its thread.
    pub fn stop(self) {
        self.shared.stop();
        let _ = self.thread.join();
    }
}

// Each sender models one peer's view; a smaller cache than the writer's
// is enough because it only has to cover records in flight.
const SENDER_CACHE_CAPACITY: usize = 100_000;

/// Start a sender for `peer_id`, anchored at the peer's current send
/// position.
pub fn spawn(hub: Arc<Hub>, peer_id: i32) -> Result<SenderHandle> {
    let first = hub.manager().first_segment();
    let (segment, offset) = hub
        .peers()
        .with_peer(peer_id, |p| {
            // Segments below the anchor may have been trimmed while the
            // peer was away; resume at the first retained segment.
            if p.send_number < first {
                tracing::warn!(
                    peer = peer_id,
                    anchor = p.send_number,
                    first,
                    "send position predates the retained log, clamping"
                );
                p.send_number = first;
                p.send_offset = 0;
            }
            (p.send_number, p.send_offset)
        })
        .ok_or_else(|| crate::Error::not_found(format!("peer {}", peer_id)))?;
    let reader = hub.manager().add_reader(segment, offset, false)?;
    let shared = Arc::new(StopShared {
        requested: AtomicBool::new(false),
        current: Mutex::new(Some(reader.stop_handle())),
    });
    let thread = {
        let shared = Arc::clone(&shared);
        std::thread::Builder::new()
            .name(format!("fluxhub-sender-{}", peer_id))
            .spawn(move || {
                let mut sender = Sender {
                    hub,
                    peer_id,
                    shared,
                    recency: RecencyCache::new(SENDER_CACHE_CAPACITY),
                    conn: None,
                    errors: 0,
                    acked: (segment, offset),
                    pending: None,
                };
                sender.run(reader);
            })?
    };
    Ok(SenderHandle { shared, thread })
}

struct Sender {
    hub: Arc<Hub>,
    peer_id: i32,
    shared: Arc<StopShared>,
    recency: RecencyCache,
    conn: Option<Box<dyn PeerTransport>>,
    errors: u32,
    acked: (u64, u64),
    /// Encoded batch that failed to send, with the position it covers
    pending: Option<(Vec<u8>, (u64, u64))>,
}

impl Sender {
    fn run(&mut self, mut reader: BinlogReader) {
        tracing::info!(peer = self.peer_id, "sender started");
        loop {
            if self.shared.is_requested() {
                break;
            }
            let step = match self.pending.take() {
                Some((wire, position)) => self.flush(&wire, position).map(|_| true),
                None => self.forward_batch(&mut reader),
            };
            match step {
                Ok(true) => self.errors = 0,
                Ok(false) => break,
                Err(e) => {
                    self.errors += 1;
                    self.conn = None;
                    tracing::warn!(
                        peer = self.peer_id,
                        error = %e,
                        attempt = self.errors,
                        "sender iteration failed"
                    );
                    if self.errors >= self.hub.config().max_retry_times {
                        self.fail_peer();
                        return;
                    }
                    if !e.is_io() {
                        // Read-side corruption: only a fresh reader at the
                        // last acknowledged position can make progress.
                        match self.resubscribe() {
                            Ok(fresh) => reader = fresh,
                            Err(e) => {
                                tracing::error!(
                                    peer = self.peer_id,
                                    error = %e,
                                    "re-subscribe failed"
                                );
                                self.fail_peer();
                                return;
                            }
                        }
                    }
                }
            }
        }
        tracing::info!(peer = self.peer_id, "sender stopped");
    }

    /// One iteration: read a batch, filter, translate, flush, advance.
    /// `Ok(false)` means the reader was stopped and the sender exits.
    fn forward_batch(&mut self, reader: &mut BinlogReader) -> Result<bool> {
        let mut batch: Vec<(LogRecord, (u64, u64))> = Vec::new();
        match reader.read_next()? {
            ReadOutcome::Record(record) => batch.push((record, reader.position())),
            ReadOutcome::Stopped | ReadOutcome::EndOfLog => return Ok(false),
        }
        let cap = self.hub.config().sender_batch_max;
        while batch.len() < cap {
            match reader.read_next_nonblocking()? {
                ReadOutcome::Record(record) => batch.push((record, reader.position())),
                ReadOutcome::EndOfLog => break,
                ReadOutcome::Stopped => return Ok(false),
            }
        }

        let mut wire = Vec::new();
        for (record, (segment, offset)) in &batch {
            // A self-origin record still advances this peer's view so a
            // later stale record from elsewhere compares against it.
            if record.origin_id == self.peer_id {
                self.recency
                    .check_and_update(&record.key, record.origin_id, record.logical_time);
                continue;
            }
            if !self
                .recency
                .check_and_update(&record.key, record.origin_id, record.logical_time)
            {
                continue;
            }
            wire.extend_from_slice(&protocol::build_mutation(record, *segment, *offset));
        }

        let position = reader.position();
        if wire.is_empty() {
            self.commit(position);
            return Ok(true);
        }
        self.flush(&wire, position)?;
        Ok(true)
    }

    /// Send one encoded batch; on failure the batch stays pending for
    /// the next iteration.
    fn flush(&mut self, wire: &[u8], position: (u64, u64)) -> Result<()> {
        let result = (|| {
            if self.conn.is_none() {
                self.conn = Some(self.connect()?);
            }
            self.conn.as_mut().unwrap().send(wire)
        })();
        match result {
            Ok(()) => {
                self.commit(position);
                Ok(())
            }
            Err(e) => {
                self.pending = Some((wire.to_vec(), position));
                Err(e)
            }
        }
    }

    fn commit(&mut self, (segment, offset): (u64, u64)) {
        self.acked = (segment, offset);
        self.hub.peers().with_peer(self.peer_id, |p| {
            p.send_number = segment;
            p.send_offset = offset;
        });
    }

    fn connect(&self) -> Result<Box<dyn PeerTransport>> {
        let cfg = self.hub.config();
        let (ip, port, password) = self
            .hub
            .peers()
            .with_peer(self.peer_id, |p| (p.ip.clone(), p.port, p.password.clone()))
            .ok_or_else(|| crate::Error::not_found(format!("peer {}", self.peer_id)))?;
        let mut conn = self
            .hub
            .transport()
            .connect(&ip, port, cfg.connect_timeout())?;
        if let Some(password) = password {
            conn.send(&protocol::build_auth(&password))?;
            if !conn.recv_reply()?.is_ok() {
                return Err(crate::Error::protocol("auth rejected by peer"));
            }
        }
        Ok(conn)
    }

    /// Fresh reader at the last acknowledged position. The private cache
    /// is cleared so the replayed records are not mistaken for stale
    /// duplicates of themselves.
    fn resubscribe(&mut self) -> Result<BinlogReader> {
        let (segment, offset) = self.acked;
        self.pending = None;
        self.recency.clear();
        let reader = self.hub.manager().add_reader(segment, offset, false)?;
        *self.shared.current.lock() = Some(reader.stop_handle());
        if self.shared.is_requested() {
            // Stop raced the swap; make sure the new reader sees it.
            self.shared.stop();
        }
        tracing::warn!(
            peer = self.peer_id,
            segment,
            offset,
            "sender re-subscribed at last acknowledged position"
        );
        Ok(reader)
    }

    /// Retry ceiling reached: mark the peer failed and detach our own
    /// handle so trysync can arrange a fresh link later.
    fn fail_peer(&self) {
        tracing::error!(peer = self.peer_id, "sender giving up, marking peer failed");
        self.hub.peers().with_peer(self.peer_id, |p| {
            p.sync_status = SyncStatus::ErrorHappened;
            p.link.sender = None;
        });
    }
}
