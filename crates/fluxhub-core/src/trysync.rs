//! Peer synchronizer
//!
//! The trysync loop walks the peer table every couple of seconds.
//! Deletions are honored first (teardown outside the table lock), then
//! every peer in `ShouldConnect` gets one handshake attempt: connect,
//! authenticate when required, and send an `internaltrysync` request
//! asking to resume a few segments before the last received position to
//! tolerate lost acknowledgments. On success the peer becomes
//! `Connected` and gains a sender/heartbeat pair.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender as ChanSender};

use crate::error::{Error, Result};
use crate::hub::Hub;
use crate::peer::{HandshakeTarget, SyncStatus};
use crate::protocol;
use crate::{heartbeat, sender, RECV_ROLLBACK_SEGMENTS};

/// Handle to the running trysync loop.
pub struct TrysyncHandle {
    stop_tx: ChanSender<()>,
    thread: JoinHandle<()>,
}

impl TrysyncHandle {
    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.thread.join();
    }
}

/// Resume position requested from a peer: a fixed number of segments
/// before the last received position, offset 0 unless no rollback
/// happened.
pub fn rollback_position(rcv_number: u64, rcv_offset: u64) -> (u64, u64) {
    let sequence = rcv_number.saturating_sub(RECV_ROLLBACK_SEGMENTS).max(1);
    let offset = if sequence == rcv_number { rcv_offset } else { 0 };
    (sequence, offset)
}

/// Start the trysync loop.
pub fn spawn(hub: Arc<Hub>) -> Result<TrysyncHandle> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let interval = hub.config().trysync_interval();
    let thread = std::thread::Builder::new()
        .name("fluxhub-trysync".to_string())
        .spawn(move || {
            tracing::info!("trysync loop started");
            loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                run_cycle(&hub);
            }
            tracing::info!("trysync loop stopped");
        })?;
    Ok(TrysyncHandle { stop_tx, thread })
}

fn run_cycle(hub: &Arc<Hub>) {
    // Deletions first: detach, then join outside the lock, then drop
    // the table entry.
    for peer_id in hub.peers().deletable() {
        if let Some(link) = hub.peers().take_link(peer_id) {
            link.teardown(false);
        }
        hub.peers().remove(peer_id);
        tracing::info!(peer = peer_id, "peer removed");
    }

    // Failed links: reap whatever workers remain and queue the peer for
    // a fresh handshake.
    for peer_id in hub.peers().errored() {
        if let Some(link) = hub.peers().take_link(peer_id) {
            link.teardown(false);
        }
        hub.peers().set_status(peer_id, SyncStatus::ShouldConnect);
        tracing::info!(peer = peer_id, "failed peer queued for reconnect");
    }

    for target in hub.peers().handshake_targets() {
        let peer_id = target.server_id;
        match handshake(hub, &target) {
            Ok(()) => {
                if let Err(e) = attach_workers(hub, peer_id) {
                    tracing::error!(peer = peer_id, error = %e, "failed to start peer workers");
                    hub.disconnect_peer(peer_id, false);
                    continue;
                }
                hub.peers().set_status(peer_id, SyncStatus::Connected);
                tracing::info!(peer = peer_id, addr = %format!("{}:{}", target.ip, target.port), "peer connected");
            }
            Err(e) => {
                tracing::debug!(peer = peer_id, error = %e, "handshake failed, will retry");
            }
        }
    }
}

/// Connect, optionally authenticate, request a resync. Auth failure is
/// indistinguishable from connect failure by design.
fn handshake(hub: &Hub, target: &HandshakeTarget) -> Result<()> {
    let cfg = hub.config();
    let mut conn = hub
        .transport()
        .connect(&target.ip, target.port, cfg.connect_timeout())?;
    if let Some(password) = &target.password {
        conn.send(&protocol::build_auth(password))?;
        if !conn.recv_reply()?.is_ok() {
            return Err(Error::protocol("auth rejected"));
        }
    }
    let rcv_offset = hub
        .peers()
        .with_peer(target.server_id, |p| p.rcv_offset)
        .unwrap_or(0);
    let (sequence, offset) = rollback_position(target.rcv_number, rcv_offset);
    conn.send(&protocol::build_trysync(
        &cfg.local_ip,
        cfg.local_port,
        sequence,
        offset,
    ))?;
    let reply = conn.recv_reply()?;
    if !reply.is_ok() {
        return Err(Error::protocol(format!("trysync rejected: {:?}", reply)));
    }
    Ok(())
}

/// Create the sender and heartbeat for a freshly synced peer, unless
/// they already exist.
fn attach_workers(hub: &Arc<Hub>, peer_id: i32) -> Result<()> {
    let (need_sender, need_heartbeat) = hub
        .peers()
        .with_peer(peer_id, |p| {
            (p.link.sender.is_none(), p.link.heartbeat.is_none())
        })
        .ok_or_else(|| Error::not_found(format!("peer {}", peer_id)))?;
    if need_sender {
        let handle = sender::spawn(Arc::clone(hub), peer_id)?;
        hub.peers()
            .with_peer(peer_id, |p| p.link.sender = Some(handle));
    }
    if need_heartbeat {
        let handle = heartbeat::spawn(Arc::clone(hub), peer_id)?;
        hub.peers()
            .with_peer(peer_id, |p| p.link.heartbeat = Some(handle));
    }
    Ok(())
}
