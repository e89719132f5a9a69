//! Hub configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::binlog::MAX_SEGMENT_SIZE;
use crate::error::{Error, Result};
use crate::{HEARTBEAT_PORT_DELTA, MAX_RETRY_TIMES};

/// A peer known at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct PeerSeed {
    /// Peer cluster identifier (matches the origin id in its records)
    pub server_id: i32,
    /// Replication address
    pub ip: String,
    pub port: u16,
    /// Password required by the peer, if any
    #[serde(default)]
    pub password: Option<String>,
}

/// Hub server configuration. Loadable from TOML; every field has a
/// default so a minimal file only needs the address and log path.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    /// Address peers connect to for replication traffic
    pub local_ip: String,
    pub local_port: u16,
    /// Port local producers and admin clients connect to
    pub sdk_port: u16,
    /// Binlog directory
    pub log_path: PathBuf,
    /// Recency cache capacity in keys
    pub recency_capacity: usize,
    /// Segment rotation threshold in bytes
    pub max_segment_size: u64,
    /// Leader lease duration in milliseconds
    pub lease_duration_ms: u64,
    /// Election loop period in milliseconds
    pub election_interval_ms: u64,
    /// Trysync loop period in milliseconds
    pub trysync_interval_ms: u64,
    /// Heartbeat period in milliseconds
    pub heartbeat_interval_ms: u64,
    /// Peer connect timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Read/write timeout on peer sockets in milliseconds
    pub io_timeout_ms: u64,
    /// Consecutive failures tolerated per peer link
    pub max_retry_times: u32,
    /// Records drained per sender batch
    pub sender_batch_max: usize,
    /// Peers configured at startup
    pub peers: Vec<PeerSeed>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            local_ip: "127.0.0.1".to_string(),
            local_port: 9221,
            sdk_port: 9222,
            log_path: PathBuf::from("./fluxhub-log"),
            recency_capacity: 1_000_000,
            max_segment_size: MAX_SEGMENT_SIZE,
            lease_duration_ms: 60_000,
            election_interval_ms: 3_000,
            trysync_interval_ms: 2_000,
            heartbeat_interval_ms: 3_000,
            connect_timeout_ms: 1_500,
            io_timeout_ms: 3_000,
            max_retry_times: MAX_RETRY_TIMES,
            sender_batch_max: 64,
            peers: Vec::new(),
        }
    }
}

impl HubConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_local_addr(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.local_ip = ip.into();
        self.local_port = port;
        self
    }

    pub fn with_log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = path.into();
        self
    }

    pub fn with_peer(mut self, seed: PeerSeed) -> Self {
        self.peers.push(seed);
        self
    }

    /// Identity written into the lease record.
    pub fn local_identity(&self) -> String {
        format!("{}:{}", self.local_ip, self.local_port)
    }

    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_duration_ms)
    }

    pub fn election_interval(&self) -> Duration {
        Duration::from_millis(self.election_interval_ms)
    }

    pub fn trysync_interval(&self) -> Duration {
        Duration::from_millis(self.trysync_interval_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Check the configuration for values that cannot work.
    pub fn validate(&self) -> Result<()> {
        if self.local_ip.is_empty() {
            return Err(Error::internal("local_ip must not be empty"));
        }
        if self.local_port == 0 || self.sdk_port == 0 {
            return Err(Error::internal("ports must be non-zero"));
        }
        if self.local_port == self.sdk_port {
            return Err(Error::internal("local_port and sdk_port must differ"));
        }
        let port_ceiling = u16::MAX - HEARTBEAT_PORT_DELTA;
        if self.local_port > port_ceiling {
            return Err(Error::internal(format!(
                "local_port must leave room for the heartbeat port (max {})",
                port_ceiling
            )));
        }
        if self.recency_capacity == 0 {
            return Err(Error::internal("recency_capacity must be non-zero"));
        }
        if self.max_segment_size == 0 {
            return Err(Error::internal("max_segment_size must be non-zero"));
        }
        if self.max_retry_times == 0 {
            return Err(Error::internal("max_retry_times must be non-zero"));
        }
        if self.sender_batch_max == 0 {
            return Err(Error::internal("sender_batch_max must be non-zero"));
        }
        if self.lease_duration_ms <= self.election_interval_ms {
            return Err(Error::internal(
                "lease_duration_ms must exceed election_interval_ms",
            ));
        }
        let mut seen = std::collections::BTreeSet::new();
        for peer in &self.peers {
            if !seen.insert(peer.server_id) {
                return Err(Error::internal(format!(
                    "duplicate peer server_id {}",
                    peer.server_id
                )));
            }
            if peer.port > port_ceiling {
                return Err(Error::internal(format!(
                    "peer {} port must leave room for the heartbeat port (max {})",
                    peer.server_id, port_ceiling
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(HubConfig::default().validate().is_ok());
    }

    #[test]
    fn test_duplicate_peer_rejected() {
        let cfg = HubConfig::new()
            .with_peer(PeerSeed {
                server_id: 1,
                ip: "10.0.0.1".into(),
                port: 9221,
                password: None,
            })
            .with_peer(PeerSeed {
                server_id: 1,
                ip: "10.0.0.2".into(),
                port: 9221,
                password: None,
            });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_port_heartbeat_headroom_enforced() {
        let mut cfg = HubConfig::new();
        cfg.local_port = 65_000;
        assert!(cfg.validate().is_err());

        let cfg = HubConfig::new().with_peer(PeerSeed {
            server_id: 1,
            ip: "10.0.0.1".into(),
            port: 65_000,
            password: None,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_toml_minimal() {
        let cfg: HubConfig = toml::from_str(
            r#"
            local_ip = "10.1.1.5"
            local_port = 9221
            log_path = "/data/fluxhub"

            [[peers]]
            server_id = 2
            ip = "10.2.2.5"
            port = 9221
            password = "secret"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.local_identity(), "10.1.1.5:9221");
        assert_eq!(cfg.peers.len(), 1);
        assert_eq!(cfg.peers[0].password.as_deref(), Some("secret"));
        assert!(cfg.validate().is_ok());
    }
}
