//! Hub coordinator
//!
//! `Hub` assembles the engine: binlog manager, peer table, consensus
//! handle, transport factory, role state and counters. The elector
//! drives `promote`/`demote`; the inbound listener feeds
//! `apply_mutation` and `handle_admin`; worker threads reach the shared
//! pieces through accessors on `Arc<Hub>`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::admin::{AdminCommand, AdminReply};
use crate::binlog::{BinlogManager, BinlogWriter, WriterOffset};
use crate::config::HubConfig;
use crate::consensus::{recover_offset_key, ConsensusStore};
use crate::election::{read_lease, Role};
use crate::error::{Error, Result};
use crate::peer::{PeerStatus, PeerTable, RecoverOffset, SyncStatus};
use crate::record::LogRecord;
use crate::transport::TransportFactory;
use crate::trysync::{self, TrysyncHandle};

/// Seam for the network front end. Started on promotion, stopped on
/// demotion and shutdown.
pub trait InboundListener: Send + Sync + 'static {
    fn start(&self, hub: Arc<Hub>) -> Result<()>;
    fn stop(&self);
}

/// Request counters sampled on demand.
struct QpsCounter {
    total: AtomicU64,
    sample: Mutex<QpsSample>,
}

struct QpsSample {
    at_us: u64,
    count: u64,
    qps: u64,
}

impl QpsCounter {
    fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            sample: Mutex::new(QpsSample {
                at_us: crate::election::now_us(),
                count: 0,
                qps: 0,
            }),
        }
    }

    fn tick(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    /// `(total, queries per second over the last sample window)`.
    fn read(&self) -> (u64, u64) {
        let total = self.total.load(Ordering::Relaxed);
        let now = crate::election::now_us();
        let mut sample = self.sample.lock();
        let elapsed = now.saturating_sub(sample.at_us);
        if elapsed >= 1_000_000 {
            sample.qps = (total - sample.count) * 1_000_000 / elapsed;
            sample.count = total;
            sample.at_us = now;
        }
        (total, sample.qps)
    }
}

/// The assembled hub engine. Shared as `Arc<Hub>` across every worker
/// thread.
pub struct Hub {
    config: HubConfig,
    manager: BinlogManager,
    writer: RwLock<Option<BinlogWriter>>,
    peers: PeerTable,
    consensus: Arc<dyn ConsensusStore>,
    factory: Arc<dyn TransportFactory>,
    role: Mutex<Role>,
    trysync: Mutex<Option<TrysyncHandle>>,
    listener: Mutex<Option<Arc<dyn InboundListener>>>,
    qps: QpsCounter,
}

impl Hub {
    /// Build a hub from configuration. Replays the retained log into the
    /// recency cache before anything else runs.
    pub fn new(
        config: HubConfig,
        consensus: Arc<dyn ConsensusStore>,
        factory: Arc<dyn TransportFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let manager = BinlogManager::create(
            &config.log_path,
            config.recency_capacity,
            config.max_segment_size,
        )?;
        manager.recover_cache()?;
        let peers = PeerTable::new(&config.peers);
        Ok(Self {
            config,
            manager,
            writer: RwLock::new(None),
            peers,
            consensus,
            factory,
            role: Mutex::new(Role::Secondary),
            trysync: Mutex::new(None),
            listener: Mutex::new(None),
            qps: QpsCounter::new(),
        })
    }

    /// Install the network front end. Must happen before the elector can
    /// promote this hub.
    pub fn set_listener(&self, listener: Arc<dyn InboundListener>) {
        *self.listener.lock() = Some(listener);
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn manager(&self) -> &BinlogManager {
        &self.manager
    }

    pub fn consensus(&self) -> &Arc<dyn ConsensusStore> {
        &self.consensus
    }

    pub fn transport(&self) -> &Arc<dyn TransportFactory> {
        &self.factory
    }

    pub fn role(&self) -> Role {
        *self.role.lock()
    }

    pub fn is_primary(&self) -> bool {
        self.role() == Role::Primary
    }

    /// The inbound replication path: append the record (the writer
    /// dedupes stale ones silently) and advance the origin peer's
    /// received position.
    pub fn apply_mutation(&self, record: LogRecord, sequence: u64, offset: u64) -> Result<()> {
        self.qps.tick();
        let writer = self
            .writer
            .read()
            .clone()
            .ok_or_else(|| Error::binlog("not primary, mutations rejected"))?;
        let origin = record.origin_id;
        writer.append(record)?;
        self.peers.with_peer(origin, |p| {
            p.rcv_number = sequence;
            p.rcv_offset = offset;
        });
        Ok(())
    }

    /// End of the durably written log.
    pub fn writer_offset(&self) -> WriterOffset {
        self.manager.writer_offset()
    }

    /// Secondary to primary: recover per-peer offsets from consensus,
    /// open the writer, start the inbound listener and the trysync loop.
    pub fn promote(self: &Arc<Self>) -> Result<()> {
        if self.is_primary() {
            return Ok(());
        }
        tracing::info!(identity = %self.config.local_identity(), "promoting to primary");
        match self.promote_inner() {
            Ok(()) => {
                *self.role.lock() = Role::Primary;
                tracing::info!("promotion complete");
                Ok(())
            }
            Err(e) => {
                // Roll back whatever came up so the next attempt starts
                // from a clean secondary.
                self.stop_workers();
                *self.writer.write() = None;
                Err(e)
            }
        }
    }

    fn promote_inner(self: &Arc<Self>) -> Result<()> {
        for peer_id in self.peers.ids() {
            match self.consensus.read(&recover_offset_key(&peer_id.to_string())) {
                Ok(Some(buf)) => match RecoverOffset::decode(&buf) {
                    Ok(offset) => self.peers.apply_recover(peer_id, offset),
                    Err(e) => {
                        tracing::warn!(peer = peer_id, error = %e, "ignoring bad recover offset")
                    }
                },
                Ok(None) => {}
                Err(e) => tracing::warn!(peer = peer_id, error = %e, "recover offset unavailable"),
            }
        }

        let writer = self.manager.add_writer()?;
        *self.writer.write() = Some(writer);

        if let Some(listener) = self.listener.lock().clone() {
            listener.start(Arc::clone(self))?;
        }
        *self.trysync.lock() = Some(trysync::spawn(Arc::clone(self))?);
        Ok(())
    }

    /// Primary to secondary: stop inbound traffic and every worker, then
    /// discard the log and cache so a later promotion starts clean.
    pub fn demote(&self) {
        {
            let mut role = self.role.lock();
            if *role == Role::Secondary {
                return;
            }
            *role = Role::Secondary;
        }
        tracing::warn!("demoting to secondary");
        self.stop_workers();
        *self.writer.write() = None;
        for link in self.peers.reset_all() {
            link.teardown(false);
        }
        // An inbound handler that was mid-append when the listener
        // stopped may still hold a writer clone for a moment; the reset
        // is rejected until the last clone drops.
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match self.manager.reset_offset_and_log() {
                Ok(()) => break,
                Err(e) => {
                    if Instant::now() >= deadline {
                        tracing::error!(error = %e, "log reset failed during demotion");
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
        }
        tracing::info!("demotion complete");
    }

    fn stop_workers(&self) {
        if let Some(listener) = self.listener.lock().clone() {
            listener.stop();
        }
        if let Some(trysync) = self.trysync.lock().take() {
            trysync.stop();
        }
    }

    /// Tear down one peer's link and queue it for a fresh handshake.
    /// `skip_heartbeat_join` is set when the caller is the peer's own
    /// heartbeat thread.
    pub fn disconnect_peer(&self, peer_id: i32, skip_heartbeat_join: bool) {
        let link = self.peers.take_link(peer_id);
        self.peers.set_status(peer_id, SyncStatus::ShouldConnect);
        if let Some(link) = link {
            link.teardown(skip_heartbeat_join);
        }
        tracing::info!(peer = peer_id, "peer disconnected");
    }

    /// Persist every peer's acknowledged position. Runs on the election
    /// cadence while primary.
    pub fn persist_recover_offsets(&self) -> Result<()> {
        for (peer_id, offset) in self.peers.recover_snapshot() {
            self.consensus
                .write(&recover_offset_key(&peer_id.to_string()), &offset.encode()?)?;
        }
        Ok(())
    }

    /// Drop segments no connected peer still needs. Advisory: the low
    /// water mark is the smallest send position across connected peers.
    pub fn advisory_trim(&self) -> Result<u64> {
        match self.peers.min_send_number() {
            Some(low_water) => self.manager.purge_segments_below(low_water),
            None => Ok(0),
        }
    }

    /// Execute one admin command. Mutating commands require primary.
    pub fn handle_admin(&self, cmd: AdminCommand) -> AdminReply {
        match cmd {
            AdminCommand::Ping => AdminReply::Pong,
            AdminCommand::Info => AdminReply::Info(self.render_info()),
            AdminCommand::Auth { .. } => AdminReply::Err("no password is set".into()),
            cmd if !self.is_primary() => {
                tracing::debug!(?cmd, "mutating admin command rejected on secondary");
                AdminReply::Err("only allowed for primary".into())
            }
            AdminCommand::Add { ip, port } => self.admin_add(ip, port),
            AdminCommand::Remove { ip, port } => self.admin_remove(ip, port),
            AdminCommand::Transfer {
                server_id,
                ip,
                port,
            } => self.admin_transfer(server_id, ip, port),
            AdminCommand::Copy {
                src_id,
                new_id,
                ip,
                port,
                password,
            } => self.admin_copy(src_id, new_id, ip, port, password),
        }
    }

    fn admin_add(&self, ip: String, port: u16) -> AdminReply {
        if self.peers.find_by_addr(&ip, port).is_some() {
            return AdminReply::Err("peer already exists".into());
        }
        let new_id = self.peers.ids().into_iter().max().unwrap_or(0) + 1;
        match self.peers.insert(PeerStatus::new(new_id, ip, port, None)) {
            Ok(()) => AdminReply::Ok,
            Err(e) => AdminReply::Err(e.to_string()),
        }
    }

    fn admin_remove(&self, ip: String, port: u16) -> AdminReply {
        let Some(peer_id) = self.peers.find_by_addr(&ip, port) else {
            return AdminReply::Err("no such peer".into());
        };
        self.peers.set_status(peer_id, SyncStatus::ShouldDelete);
        // Best effort: the offset entry is useless once the peer is gone.
        let _ = self
            .consensus
            .delete(&recover_offset_key(&peer_id.to_string()));
        AdminReply::Ok
    }

    fn admin_transfer(&self, server_id: i32, ip: String, port: u16) -> AdminReply {
        if !self.peers.contains(server_id) {
            return AdminReply::Err("no such peer".into());
        }
        if let Some(link) = self.peers.take_link(server_id) {
            link.teardown(false);
        }
        self.peers.with_peer(server_id, |p| {
            p.ip = ip;
            p.port = port;
            p.sync_status = SyncStatus::ShouldConnect;
        });
        AdminReply::Ok
    }

    fn admin_copy(
        &self,
        src_id: i32,
        new_id: i32,
        ip: String,
        port: u16,
        password: Option<String>,
    ) -> AdminReply {
        if self.peers.contains(new_id) {
            return AdminReply::Err("peer already exists".into());
        }
        let Some((send_number, send_offset)) = self
            .peers
            .with_peer(src_id, |p| (p.send_number, p.send_offset))
        else {
            return AdminReply::Err("no such source peer".into());
        };
        let mut peer = PeerStatus::new(new_id, ip, port, password);
        peer.send_number = send_number;
        peer.send_offset = send_offset;
        match self.peers.insert(peer) {
            Ok(()) => AdminReply::Ok,
            Err(e) => AdminReply::Err(e.to_string()),
        }
    }

    fn render_info(&self) -> String {
        use std::fmt::Write;
        let (total, qps) = self.qps.read();
        let offset = self.writer_offset();
        let mut out = String::new();
        let _ = writeln!(out, "role: {}", self.role());
        let _ = writeln!(out, "identity: {}", self.config.local_identity());
        match read_lease(self.consensus.as_ref()) {
            Ok(Some(lease)) => {
                let _ = writeln!(out, "lease_holder: {}", lease.holder);
                let _ = writeln!(out, "lease_deadline_us: {}", lease.deadline_us);
            }
            Ok(None) => {
                let _ = writeln!(out, "lease_holder: none");
            }
            Err(e) => {
                let _ = writeln!(out, "lease_holder: unavailable ({})", e);
            }
        }
        let _ = writeln!(out, "queries_total: {}", total);
        let _ = writeln!(out, "qps: {}", qps);
        let _ = writeln!(
            out,
            "binlog_offset: {}:{}",
            offset.segment, offset.offset
        );
        let _ = writeln!(out, "recency_keys: {}", self.manager.recency().len());
        let _ = writeln!(out, "peers: {}", self.peers.len());
        for p in self.peers.snapshot() {
            let _ = writeln!(
                out,
                "peer{}: addr={} status={} rcv={}:{} send={}:{} fds={} sender={} heartbeat={}",
                p.server_id,
                p.addr,
                p.sync_status,
                p.rcv_number,
                p.rcv_offset,
                p.send_number,
                p.send_offset,
                p.rcv_fd_count,
                p.sender_running,
                p.heartbeat_running,
            );
        }
        out
    }

    /// Full cooperative shutdown: stop every loop and worker thread and
    /// close the writer. The on-disk log is kept.
    pub fn shutdown(&self) {
        tracing::info!("hub shutting down");
        *self.role.lock() = Role::Secondary;
        self.stop_workers();
        *self.writer.write() = None;
        for link in self.peers.reset_all() {
            link.teardown(false);
        }
        tracing::info!("hub shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::MemoryConsensus;
    use crate::record::RecordOp;
    use crate::transport::{PeerTransport, TransportFactory};
    use tempfile::TempDir;

    /// Factory whose connections always fail, for hubs with no live
    /// peers.
    struct DeadFactory;

    impl TransportFactory for DeadFactory {
        fn connect(
            &self,
            _ip: &str,
            _port: u16,
            _timeout: Duration,
        ) -> Result<Box<dyn PeerTransport>> {
            Err(Error::Io(std::io::ErrorKind::ConnectionRefused.into()))
        }
    }

    fn test_hub(dir: &TempDir) -> Arc<Hub> {
        let config = HubConfig::new()
            .with_log_path(dir.path())
            .with_peer(crate::config::PeerSeed {
                server_id: 2,
                ip: "10.0.0.2".into(),
                port: 9221,
                password: None,
            });
        Arc::new(
            Hub::new(
                config,
                Arc::new(MemoryConsensus::new()),
                Arc::new(DeadFactory),
            )
            .unwrap(),
        )
    }

    fn record(key: &str, origin: i32, time: i32) -> LogRecord {
        LogRecord::new(RecordOp::Set, key.as_bytes().to_vec(), b"v".to_vec(), origin, time)
    }

    #[test]
    fn test_mutations_rejected_on_secondary() {
        let dir = TempDir::new().unwrap();
        let hub = test_hub(&dir);
        assert!(hub.apply_mutation(record("k", 2, 1), 1, 10).is_err());
    }

    #[test]
    fn test_promote_apply_demote() {
        let dir = TempDir::new().unwrap();
        let hub = test_hub(&dir);
        hub.promote().unwrap();
        assert_eq!(hub.role(), Role::Primary);

        hub.apply_mutation(record("k", 2, 1), 3, 128).unwrap();
        assert!(hub.writer_offset().offset > 0);
        // Received position recorded against the origin peer.
        hub.peers()
            .with_peer(2, |p| assert_eq!((p.rcv_number, p.rcv_offset), (3, 128)));

        hub.demote();
        assert_eq!(hub.role(), Role::Secondary);
        assert_eq!(
            hub.writer_offset(),
            WriterOffset {
                segment: 1,
                offset: 0
            }
        );
        assert!(hub.manager().recency().is_empty());
        assert!(hub.apply_mutation(record("k", 2, 2), 1, 0).is_err());
        hub.shutdown();
    }

    /// Demotion must not skip the log reset just because an inbound
    /// handler was still holding the writer; it waits for the last
    /// clone to drop.
    #[test]
    fn test_demote_waits_for_inflight_writer_clone() {
        let dir = TempDir::new().unwrap();
        let hub = test_hub(&dir);
        hub.promote().unwrap();
        hub.apply_mutation(record("k", 2, 1), 1, 0).unwrap();

        let inflight = hub.writer.read().clone().unwrap();
        let dropper = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            drop(inflight);
        });
        hub.demote();
        dropper.join().unwrap();

        assert_eq!(hub.role(), Role::Secondary);
        assert_eq!(
            hub.writer_offset(),
            WriterOffset {
                segment: 1,
                offset: 0
            }
        );
        assert!(hub.manager().recency().is_empty());
        hub.shutdown();
    }

    #[test]
    fn test_info_reports_lease_state() {
        let dir = TempDir::new().unwrap();
        let hub = test_hub(&dir);
        let AdminReply::Info(text) = hub.handle_admin(AdminCommand::Info) else {
            panic!("expected info reply");
        };
        assert!(text.contains("lease_holder: none"));

        crate::election::try_claim_lease(hub.consensus().as_ref(), "10.0.0.5:9221", 1_000, 500)
            .unwrap();
        let AdminReply::Info(text) = hub.handle_admin(AdminCommand::Info) else {
            panic!("expected info reply");
        };
        assert!(text.contains("lease_holder: 10.0.0.5:9221"));
        assert!(text.contains("lease_deadline_us: 1500"));
    }

    #[test]
    fn test_promote_idempotent() {
        let dir = TempDir::new().unwrap();
        let hub = test_hub(&dir);
        hub.promote().unwrap();
        hub.promote().unwrap();
        assert_eq!(hub.role(), Role::Primary);
        hub.shutdown();
    }

    #[test]
    fn test_admin_gating_on_secondary() {
        let dir = TempDir::new().unwrap();
        let hub = test_hub(&dir);
        // Read-only commands always work.
        assert_eq!(hub.handle_admin(AdminCommand::Ping), AdminReply::Pong);
        assert!(matches!(
            hub.handle_admin(AdminCommand::Info),
            AdminReply::Info(_)
        ));
        // Mutations need primary.
        let reply = hub.handle_admin(AdminCommand::Add {
            ip: "10.0.0.9".into(),
            port: 9221,
        });
        assert_eq!(reply, AdminReply::Err("only allowed for primary".into()));
    }

    #[test]
    fn test_admin_add_remove_copy() {
        let dir = TempDir::new().unwrap();
        let hub = test_hub(&dir);
        hub.promote().unwrap();

        let reply = hub.handle_admin(AdminCommand::Add {
            ip: "10.0.0.9".into(),
            port: 9221,
        });
        assert_eq!(reply, AdminReply::Ok);
        // Auto-assigned id follows the largest registered.
        assert!(hub.peers().contains(3));

        hub.peers().with_peer(2, |p| {
            p.send_number = 7;
            p.send_offset = 99;
        });
        let reply = hub.handle_admin(AdminCommand::Copy {
            src_id: 2,
            new_id: 10,
            ip: "10.0.0.10".into(),
            port: 9221,
            password: None,
        });
        assert_eq!(reply, AdminReply::Ok);
        hub.peers().with_peer(10, |p| {
            assert_eq!((p.send_number, p.send_offset), (7, 99));
        });

        let reply = hub.handle_admin(AdminCommand::Remove {
            ip: "10.0.0.9".into(),
            port: 9221,
        });
        assert_eq!(reply, AdminReply::Ok);
        hub.peers()
            .with_peer(3, |p| assert_eq!(p.sync_status, SyncStatus::ShouldDelete));
        hub.shutdown();
    }

    #[test]
    fn test_recover_offsets_roundtrip_through_consensus() {
        let dir = TempDir::new().unwrap();
        let consensus: Arc<dyn ConsensusStore> = Arc::new(MemoryConsensus::new());
        let config = HubConfig::new()
            .with_log_path(dir.path())
            .with_peer(crate::config::PeerSeed {
                server_id: 2,
                ip: "10.0.0.2".into(),
                port: 9221,
                password: None,
            });
        let hub = Arc::new(
            Hub::new(config.clone(), Arc::clone(&consensus), Arc::new(DeadFactory)).unwrap(),
        );
        hub.promote().unwrap();
        hub.peers().with_peer(2, |p| {
            p.send_number = 4;
            p.send_offset = 2048;
        });
        hub.persist_recover_offsets().unwrap();
        hub.shutdown();

        // A new hub promoted against the same consensus resumes there.
        let dir2 = TempDir::new().unwrap();
        let hub2 = Arc::new(
            Hub::new(
                config.with_log_path(dir2.path()),
                consensus,
                Arc::new(DeadFactory),
            )
            .unwrap(),
        );
        hub2.promote().unwrap();
        hub2.peers().with_peer(2, |p| {
            assert_eq!((p.send_number, p.send_offset), (4, 2048));
        });
        hub2.shutdown();
    }
}
