//! Peer heartbeat
//!
//! One thread per connected peer, probing liveness with PING/PONG on
//! the peer's heartbeat port (base port plus a fixed delta). Failures
//! reconnect; past the retry ceiling the hub's disconnect path tears
//! the whole link down so trysync can start over.

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender as ChanSender};

use crate::hub::Hub;
use crate::protocol;
use crate::transport::PeerTransport;
use crate::HEARTBEAT_PORT_DELTA;

/// Handle to a running heartbeat thread.
pub struct HeartbeatHandle {
    stop_tx: ChanSender<()>,
    thread: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stop the heartbeat and join its thread.
    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.thread.join();
    }

    /// Stop without joining. Used when the heartbeat thread itself is
    /// driving the teardown and must not join itself.
    pub fn signal_stop(self) {
        let _ = self.stop_tx.send(());
    }
}

/// Start a heartbeat for `peer_id`.
pub fn spawn(hub: Arc<Hub>, peer_id: i32) -> crate::Result<HeartbeatHandle> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let interval = hub.config().heartbeat_interval();
    let thread = std::thread::Builder::new()
        .name(format!("fluxhub-heartbeat-{}", peer_id))
        .spawn(move || {
            tracing::debug!(peer = peer_id, "heartbeat started");
            let mut conn: Option<Box<dyn PeerTransport>> = None;
            let mut errors = 0u32;
            loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                match ping(&hub, peer_id, &mut conn) {
                    Ok(()) => errors = 0,
                    Err(e) => {
                        conn = None;
                        errors += 1;
                        tracing::warn!(
                            peer = peer_id,
                            error = %e,
                            attempt = errors,
                            "heartbeat failed"
                        );
                        if errors >= hub.config().max_retry_times {
                            tracing::error!(peer = peer_id, "heartbeat giving up, disconnecting peer");
                            hub.disconnect_peer(peer_id, true);
                            break;
                        }
                    }
                }
            }
            tracing::debug!(peer = peer_id, "heartbeat stopped");
        })?;
    Ok(HeartbeatHandle { stop_tx, thread })
}

fn ping(hub: &Hub, peer_id: i32, conn: &mut Option<Box<dyn PeerTransport>>) -> crate::Result<()> {
    if conn.is_none() {
        let (ip, port) = hub
            .peers()
            .with_peer(peer_id, |p| (p.ip.clone(), p.port))
            .ok_or_else(|| crate::Error::not_found(format!("peer {}", peer_id)))?;
        *conn = Some(hub.transport().connect(
            &ip,
            port + HEARTBEAT_PORT_DELTA,
            hub.config().connect_timeout(),
        )?);
    }
    let transport = conn.as_mut().unwrap();
    transport.send(&protocol::build_ping())?;
    let reply = transport.recv_reply()?;
    if !reply.is_pong() {
        return Err(crate::Error::protocol(format!(
            "unexpected heartbeat reply: {:?}",
            reply
        )));
    }
    Ok(())
}
