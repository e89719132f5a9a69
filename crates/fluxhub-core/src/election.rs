//! Leader election and failover
//!
//! Every hub instance runs one elector loop against the consensus
//! store. A time-bounded lease names the current primary; claiming or
//! refreshing it happens under an advisory lock with a re-read, so two
//! instances racing a claim cannot both win. Losing the lease, or
//! sustained consensus errors while primary, demotes the local hub.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{SystemTime, UNIX_EPOCH};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender as ChanSender};
use serde::{Deserialize, Serialize};

use crate::consensus::{ConsensusStore, LEASE_KEY, LOCK_KEY};
use crate::error::{Error, Result};
use crate::hub::Hub;

/// Consensus errors tolerated while primary before demoting defensively.
pub const CONSENSUS_ERROR_THRESHOLD: u32 = 3;

/// Role of one hub instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        })
    }
}

/// The lease stored under `fluxhub/lease`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseRecord {
    /// `ip:port` identity of the holder
    pub holder: String,
    /// Expiry in microseconds since the epoch
    pub deadline_us: u64,
}

impl LeaseRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| Error::internal(format!("encode lease: {}", e)))
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        bincode::deserialize(buf).map_err(|e| Error::consensus(format!("bad lease record: {}", e)))
    }
}

/// Wall-clock microseconds since the epoch.
pub fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Read the current lease, if any.
pub fn read_lease(store: &dyn ConsensusStore) -> Result<Option<LeaseRecord>> {
    match store.read(LEASE_KEY)? {
        Some(buf) => Ok(Some(LeaseRecord::decode(&buf)?)),
        None => Ok(None),
    }
}

/// One claim/refresh attempt. Returns whether `identity` holds the
/// lease afterwards. The claim only proceeds when the lease is absent,
/// expired, or already ours; the advisory lock plus a re-read closes
/// the window against concurrent claimants.
pub fn try_claim_lease(
    store: &dyn ConsensusStore,
    identity: &str,
    now_us: u64,
    lease_us: u64,
) -> Result<bool> {
    let claimable = |lease: &Option<LeaseRecord>| match lease {
        None => true,
        Some(l) => l.holder == identity || l.deadline_us <= now_us,
    };
    if !claimable(&read_lease(store)?) {
        return Ok(false);
    }
    if !store.try_lock(LOCK_KEY, identity)? {
        return Ok(false);
    }
    let result = (|| {
        let lease = read_lease(store)?;
        if !claimable(&lease) {
            return Ok(false);
        }
        let record = LeaseRecord {
            holder: identity.to_string(),
            deadline_us: now_us + lease_us,
        };
        store.write(LEASE_KEY, &record.encode()?)?;
        Ok(true)
    })();
    let _ = store.unlock(LOCK_KEY, identity);
    result
}

/// Handle to the running elector loop.
pub struct ElectorHandle {
    stop_tx: ChanSender<()>,
    thread: JoinHandle<()>,
}

impl ElectorHandle {
    pub fn stop(self) {
        let _ = self.stop_tx.send(());
        let _ = self.thread.join();
    }
}

/// Start the election loop for this hub.
pub fn spawn(hub: Arc<Hub>) -> Result<ElectorHandle> {
    let (stop_tx, stop_rx) = bounded::<()>(1);
    let interval = hub.config().election_interval();
    let thread = std::thread::Builder::new()
        .name("fluxhub-elector".to_string())
        .spawn(move || {
            tracing::info!("elector started");
            let mut errors = 0u32;
            loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                cycle(&hub, &mut errors);
            }
            tracing::info!("elector stopped");
        })?;
    Ok(ElectorHandle { stop_tx, thread })
}

fn cycle(hub: &Arc<Hub>, errors: &mut u32) {
    let cfg = hub.config();
    let identity = cfg.local_identity();
    let lease_us = cfg.lease_duration().as_micros() as u64;
    match try_claim_lease(hub.consensus().as_ref(), &identity, now_us(), lease_us) {
        Ok(true) => {
            *errors = 0;
            if hub.role() != Role::Primary {
                if let Err(e) = hub.promote() {
                    tracing::error!(error = %e, "promotion failed");
                    return;
                }
            }
            // Primary housekeeping runs on the election cadence.
            if let Err(e) = hub.persist_recover_offsets() {
                tracing::warn!(error = %e, "failed to persist recover offsets");
            }
            if let Err(e) = hub.advisory_trim() {
                tracing::warn!(error = %e, "advisory segment trim failed");
            }
        }
        Ok(false) => {
            *errors = 0;
            if hub.role() == Role::Primary {
                tracing::warn!("lease lost, demoting");
                hub.demote();
            }
        }
        Err(e) => {
            *errors += 1;
            tracing::warn!(error = %e, consecutive = *errors, "consensus unavailable");
            if hub.role() == Role::Primary && *errors >= CONSENSUS_ERROR_THRESHOLD {
                tracing::error!("sustained consensus errors while primary, demoting defensively");
                hub.demote();
            }
        }
    }
}
