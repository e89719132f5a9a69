//! Peer registry
//!
//! One `PeerStatus` per remote hub, keyed by server id, behind a single
//! mutex. Critical sections stay short: worker threads copy what they
//! need out of the table and never hold the lock across I/O or thread
//! joins. Link teardown hands the typed handles out of the table so the
//! joins happen outside the lock.

use std::collections::BTreeMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::PeerSeed;
use crate::error::{Error, Result};
use crate::heartbeat::HeartbeatHandle;
use crate::sender::SenderHandle;

/// Trysync state machine position for one peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    /// Needs a (re)handshake
    ShouldConnect,
    /// Handshake done, sender/heartbeat running
    Connected,
    /// Link failed past the retry ceiling
    ErrorHappened,
    /// Marked for administrative removal
    ShouldDelete,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ShouldConnect => "should_connect",
            Self::Connected => "connected",
            Self::ErrorHappened => "error",
            Self::ShouldDelete => "should_delete",
        };
        f.write_str(s)
    }
}

/// Worker threads attached to a peer. Joins go through `teardown`, never
/// through the table lock.
#[derive(Default)]
pub struct PeerLink {
    pub sender: Option<SenderHandle>,
    pub heartbeat: Option<HeartbeatHandle>,
}

impl PeerLink {
    pub fn is_idle(&self) -> bool {
        self.sender.is_none() && self.heartbeat.is_none()
    }

    /// Stop and join both workers. `skip_heartbeat_join` lets the
    /// heartbeat thread tear down its own peer without joining itself.
    pub fn teardown(self, skip_heartbeat_join: bool) {
        if let Some(sender) = self.sender {
            sender.stop();
        }
        if let Some(heartbeat) = self.heartbeat {
            if skip_heartbeat_join {
                heartbeat.signal_stop();
            } else {
                heartbeat.stop();
            }
        }
    }
}

/// State for one replication peer.
pub struct PeerStatus {
    pub server_id: i32,
    pub ip: String,
    pub port: u16,
    pub password: Option<String>,
    pub sync_status: SyncStatus,
    /// Inbound connections currently open from this peer
    pub rcv_fd_count: u32,
    /// Last position received from this peer (its log coordinates)
    pub rcv_number: u64,
    pub rcv_offset: u64,
    /// Next position to forward from the local log
    pub send_number: u64,
    pub send_offset: u64,
    pub link: PeerLink,
}

impl PeerStatus {
    pub fn new(server_id: i32, ip: impl Into<String>, port: u16, password: Option<String>) -> Self {
        Self {
            server_id,
            ip: ip.into(),
            port,
            password,
            sync_status: SyncStatus::ShouldConnect,
            rcv_fd_count: 0,
            rcv_number: 1,
            rcv_offset: 0,
            send_number: 1,
            send_offset: 0,
            link: PeerLink::default(),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Point-in-time copy of one peer, for INFO dumps.
#[derive(Debug, Clone)]
pub struct PeerSnapshot {
    pub server_id: i32,
    pub addr: String,
    pub sync_status: SyncStatus,
    pub rcv_fd_count: u32,
    pub rcv_number: u64,
    pub rcv_offset: u64,
    pub send_number: u64,
    pub send_offset: u64,
    pub sender_running: bool,
    pub heartbeat_running: bool,
}

/// What trysync needs to attempt one handshake, copied out of the table.
#[derive(Debug, Clone)]
pub struct HandshakeTarget {
    pub server_id: i32,
    pub ip: String,
    pub port: u16,
    pub password: Option<String>,
    pub rcv_number: u64,
}

/// Last position a peer acknowledged, persisted to consensus so a new
/// primary resumes forwarding without a full resend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoverOffset {
    pub send_number: u64,
    pub send_offset: u64,
}

impl RecoverOffset {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::internal(format!("encode recover offset: {}", e)))
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        bincode::deserialize(buf)
            .map_err(|e| Error::consensus(format!("bad recover offset record: {}", e)))
    }
}

/// The shared peer table.
#[derive(Default)]
pub struct PeerTable {
    peers: Mutex<BTreeMap<i32, PeerStatus>>,
}

impl PeerTable {
    pub fn new(seeds: &[PeerSeed]) -> Self {
        let mut peers = BTreeMap::new();
        for seed in seeds {
            peers.insert(
                seed.server_id,
                PeerStatus::new(seed.server_id, seed.ip.clone(), seed.port, seed.password.clone()),
            );
        }
        Self {
            peers: Mutex::new(peers),
        }
    }

    pub fn insert(&self, peer: PeerStatus) -> Result<()> {
        let mut peers = self.peers.lock();
        if peers.contains_key(&peer.server_id) {
            return Err(Error::internal(format!(
                "peer {} already registered",
                peer.server_id
            )));
        }
        peers.insert(peer.server_id, peer);
        Ok(())
    }

    pub fn contains(&self, server_id: i32) -> bool {
        self.peers.lock().contains_key(&server_id)
    }

    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    /// Server id of the peer registered at `ip:port`, if any. Used by the
    /// inbound listener's access check and the address-based admin
    /// commands.
    pub fn find_by_addr(&self, ip: &str, port: u16) -> Option<i32> {
        self.peers
            .lock()
            .values()
            .find(|p| p.ip == ip && p.port == port)
            .map(|p| p.server_id)
    }

    /// Run `f` against one peer under the lock. `f` must not block.
    pub fn with_peer<R>(&self, server_id: i32, f: impl FnOnce(&mut PeerStatus) -> R) -> Option<R> {
        self.peers.lock().get_mut(&server_id).map(f)
    }

    pub fn set_status(&self, server_id: i32, status: SyncStatus) {
        self.with_peer(server_id, |p| p.sync_status = status);
    }

    /// Detach the worker handles so the caller can join them outside the
    /// lock.
    pub fn take_link(&self, server_id: i32) -> Option<PeerLink> {
        self.with_peer(server_id, |p| std::mem::take(&mut p.link))
    }

    pub fn remove(&self, server_id: i32) -> Option<PeerStatus> {
        self.peers.lock().remove(&server_id)
    }

    /// Peers awaiting a handshake this cycle.
    pub fn handshake_targets(&self) -> Vec<HandshakeTarget> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.sync_status == SyncStatus::ShouldConnect)
            .map(|p| HandshakeTarget {
                server_id: p.server_id,
                ip: p.ip.clone(),
                port: p.port,
                password: p.password.clone(),
                rcv_number: p.rcv_number,
            })
            .collect()
    }

    /// Peers whose link failed past the retry ceiling.
    pub fn errored(&self) -> Vec<i32> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.sync_status == SyncStatus::ErrorHappened)
            .map(|p| p.server_id)
            .collect()
    }

    /// Peers marked for removal.
    pub fn deletable(&self) -> Vec<i32> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.sync_status == SyncStatus::ShouldDelete)
            .map(|p| p.server_id)
            .collect()
    }

    /// Smallest segment any connected peer still needs, the low-water
    /// mark for advisory segment trimming.
    pub fn min_send_number(&self) -> Option<u64> {
        self.peers
            .lock()
            .values()
            .filter(|p| p.sync_status == SyncStatus::Connected)
            .map(|p| p.send_number)
            .min()
    }

    pub fn snapshot(&self) -> Vec<PeerSnapshot> {
        self.peers
            .lock()
            .values()
            .map(|p| PeerSnapshot {
                server_id: p.server_id,
                addr: p.addr(),
                sync_status: p.sync_status,
                rcv_fd_count: p.rcv_fd_count,
                rcv_number: p.rcv_number,
                rcv_offset: p.rcv_offset,
                send_number: p.send_number,
                send_offset: p.send_offset,
                sender_running: p.link.sender.is_some(),
                heartbeat_running: p.link.heartbeat.is_some(),
            })
            .collect()
    }

    /// Per-peer acknowledged positions, persisted by the primary.
    pub fn recover_snapshot(&self) -> Vec<(i32, RecoverOffset)> {
        self.peers
            .lock()
            .values()
            .map(|p| {
                (
                    p.server_id,
                    RecoverOffset {
                        send_number: p.send_number,
                        send_offset: p.send_offset,
                    },
                )
            })
            .collect()
    }

    /// Seed a peer's send position from a recovered offset.
    pub fn apply_recover(&self, server_id: i32, offset: RecoverOffset) {
        self.with_peer(server_id, |p| {
            p.send_number = offset.send_number;
            p.send_offset = offset.send_offset;
        });
    }

    /// Demotion: every peer back to square one. Returns the detached
    /// links so the caller can join the workers outside the lock.
    pub fn reset_all(&self) -> Vec<PeerLink> {
        let mut peers = self.peers.lock();
        let mut links = Vec::new();
        for p in peers.values_mut() {
            p.sync_status = SyncStatus::ShouldConnect;
            p.rcv_number = 1;
            p.rcv_offset = 0;
            p.send_number = 1;
            p.send_offset = 0;
            p.rcv_fd_count = 0;
            links.push(std::mem::take(&mut p.link));
        }
        links
    }

    pub fn ids(&self) -> Vec<i32> {
        self.peers.lock().keys().copied().collect()
    }
}
