//! End-to-end replication behavior over an in-memory transport.

use std::io::BufReader;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tempfile::TempDir;

use fluxhub_core::config::{HubConfig, PeerSeed};
use fluxhub_core::consensus::MemoryConsensus;
use fluxhub_core::election::{self, Role};
use fluxhub_core::protocol::{self, Reply};
use fluxhub_core::transport::{PeerTransport, TransportFactory};
use fluxhub_core::{BinlogManager, Hub, LogRecord, ReadOutcome, RecordOp, Result};

/// Captures every byte each peer "receives", keyed by destination port.
#[derive(Default)]
struct WireLog {
    entries: Mutex<Vec<(u16, Vec<u8>)>>,
}

impl WireLog {
    /// All mutation commands sent to `port`, decoded.
    fn mutations_to(&self, port: u16) -> Vec<(LogRecord, u64, u64)> {
        let mut out = Vec::new();
        for (to, buf) in self.entries.lock().iter() {
            if *to != port {
                continue;
            }
            let mut reader = BufReader::new(buf.as_slice());
            while let Ok(Some(args)) = protocol::read_command(&mut reader) {
                if let Ok(Some(parsed)) = protocol::parse_mutation(&args) {
                    out.push(parsed);
                }
            }
        }
        out
    }
}

struct MockFactory {
    log: Arc<WireLog>,
}

struct MockConn {
    port: u16,
    log: Arc<WireLog>,
    last: Vec<u8>,
}

impl PeerTransport for MockConn {
    fn send(&mut self, buf: &[u8]) -> Result<()> {
        self.last = buf.to_vec();
        self.log.entries.lock().push((self.port, buf.to_vec()));
        Ok(())
    }

    fn recv_reply(&mut self) -> Result<Reply> {
        // Every request is acknowledged; PING gets its PONG.
        if self.last.windows(4).any(|w| w.eq_ignore_ascii_case(b"PING")) {
            Ok(Reply::Status("PONG".into()))
        } else {
            Ok(Reply::Status("ok".into()))
        }
    }
}

impl TransportFactory for MockFactory {
    fn connect(&self, _ip: &str, port: u16, _timeout: Duration) -> Result<Box<dyn PeerTransport>> {
        Ok(Box::new(MockConn {
            port,
            log: Arc::clone(&self.log),
            last: Vec::new(),
        }))
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    false
}

fn frame(key: &str, origin: i32, time: i32) -> Vec<u8> {
    LogRecord::new(
        RecordOp::Set,
        key.as_bytes().to_vec(),
        b"v".to_vec(),
        origin,
        time,
    )
    .encode_frame()
}

/// The origin/staleness filter: a log holding a fresh write from peer 1
/// followed by a stale write from peer 2 must reach peer 2 once and
/// peer 1 not at all.
#[test]
fn test_sender_origin_and_staleness_filter() {
    let dir = TempDir::new().unwrap();
    let mut blob = frame("k1", 1, 5);
    blob.extend_from_slice(&frame("k1", 2, 3));
    std::fs::write(dir.path().join("binlog_1"), &blob).unwrap();

    let mut config = HubConfig::new()
        .with_log_path(dir.path())
        .with_peer(PeerSeed {
            server_id: 1,
            ip: "127.0.0.1".into(),
            port: 7001,
            password: None,
        })
        .with_peer(PeerSeed {
            server_id: 2,
            ip: "127.0.0.1".into(),
            port: 7002,
            password: None,
        });
    config.trysync_interval_ms = 50;

    let wire = Arc::new(WireLog::default());
    let hub = Arc::new(
        Hub::new(
            config,
            Arc::new(MemoryConsensus::new()),
            Arc::new(MockFactory {
                log: Arc::clone(&wire),
            }),
        )
        .unwrap(),
    );
    hub.promote().unwrap();

    // Both senders drain to the end of the retained log.
    assert!(wait_until(Duration::from_secs(5), || {
        let done = |id| {
            hub.peers()
                .with_peer(id, |p| p.send_number == 2)
                .unwrap_or(false)
        };
        done(1) && done(2)
    }));
    hub.shutdown();

    // Peer 1 wrote the only fresh record itself: nothing forwarded.
    assert!(wire.mutations_to(7001).is_empty());
    // Peer 2 gets exactly the fresh record, not the stale one.
    let to_peer2 = wire.mutations_to(7002);
    assert_eq!(to_peer2.len(), 1);
    let (record, _, _) = &to_peer2[0];
    assert_eq!(record.key, b"k1");
    assert_eq!(record.origin_id, 1);
    assert_eq!(record.logical_time, 5);
}

/// A peer whose resume position names a segment that is no longer
/// retained gets clamped to the first retained segment and replicates
/// from there, instead of failing its reconnect forever.
#[test]
fn test_sender_clamps_to_retained_log() {
    let dir = TempDir::new().unwrap();
    // The log was trimmed while the peer was away: segment 1 is gone.
    std::fs::write(dir.path().join("binlog_2"), frame("a", 1, 1)).unwrap();
    std::fs::write(dir.path().join("binlog_3"), frame("b", 1, 2)).unwrap();

    let mut config = HubConfig::new()
        .with_log_path(dir.path())
        .with_peer(PeerSeed {
            server_id: 2,
            ip: "127.0.0.1".into(),
            port: 7003,
            password: None,
        });
    config.trysync_interval_ms = 50;

    let wire = Arc::new(WireLog::default());
    let hub = Arc::new(
        Hub::new(
            config,
            Arc::new(MemoryConsensus::new()),
            Arc::new(MockFactory {
                log: Arc::clone(&wire),
            }),
        )
        .unwrap(),
    );
    // The peer's default resume position still names segment 1.
    hub.promote().unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        hub.peers()
            .with_peer(2, |p| p.send_number == 4)
            .unwrap_or(false)
    }));
    hub.shutdown();

    // Both retained records were forwarded.
    let got = wire.mutations_to(7003);
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].0.key, b"a");
    assert_eq!(got[1].0.key, b"b");
}

/// Crossing the rotation threshold yields exactly two segment files,
/// and a reader replays the full sequence across the boundary.
#[test]
fn test_rotation_produces_two_segments() {
    let dir = TempDir::new().unwrap();
    let threshold = 1024u64;
    let manager = BinlogManager::create(dir.path(), 4096, threshold).unwrap();
    let writer = manager.add_writer().unwrap();

    let mut written = 0u64;
    let mut count = 0u32;
    while written < threshold + threshold / 2 {
        let record = LogRecord::new(
            RecordOp::Set,
            format!("k{:03}", count).into_bytes(),
            b"xy".to_vec(),
            1,
            count as i32,
        );
        written += record.frame_len() as u64;
        writer.append(record).unwrap();
        count += 1;
    }
    drop(writer);

    let mut segments: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .filter(|n| n.starts_with("binlog_"))
        .collect();
    segments.sort();
    assert_eq!(segments, vec!["binlog_1", "binlog_2"]);
    let first = std::fs::metadata(dir.path().join("binlog_1")).unwrap().len();
    let second = std::fs::metadata(dir.path().join("binlog_2")).unwrap().len();
    assert!(first >= threshold);
    assert_eq!(first + second, written);

    let mut reader = manager.add_reader(1, 0, true).unwrap();
    let mut replayed = 0u32;
    while let ReadOutcome::Record(r) = reader.read_next().unwrap() {
        assert_eq!(r.logical_time, replayed as i32);
        replayed += 1;
    }
    assert_eq!(replayed, count);
}

/// Concurrent claimants against one consensus store: exactly one wins.
#[test]
fn test_lease_mutual_exclusion_under_race() {
    let store = Arc::new(MemoryConsensus::new());
    let mut handles = Vec::new();
    for i in 0..4 {
        let store = Arc::clone(&store);
        handles.push(std::thread::spawn(move || {
            election::try_claim_lease(store.as_ref(), &format!("hub-{}:9221", i), 1_000, 500)
                .unwrap()
        }));
    }
    let winners: usize = handles
        .into_iter()
        .map(|h| h.join().unwrap() as usize)
        .sum();
    assert_eq!(winners, 1);
}

/// Failover: the lease moves from one hub to the other once it expires,
/// and the demoted hub resets its log.
#[test]
fn test_failover_between_two_hubs() {
    let consensus = Arc::new(MemoryConsensus::new());
    let wire = Arc::new(WireLog::default());
    let make_hub = |port: u16, dir: &TempDir| {
        let config = HubConfig::new()
            .with_local_addr("127.0.0.1", port)
            .with_log_path(dir.path());
        Arc::new(
            Hub::new(
                config,
                Arc::clone(&consensus) as Arc<dyn fluxhub_core::consensus::ConsensusStore>,
                Arc::new(MockFactory {
                    log: Arc::clone(&wire),
                }),
            )
            .unwrap(),
        )
    };
    let dir_a = TempDir::new().unwrap();
    let dir_b = TempDir::new().unwrap();
    let hub_a = make_hub(9301, &dir_a);
    let hub_b = make_hub(9401, &dir_b);
    let lease_us = 500u64;

    // First election: A claims, B is locked out.
    assert!(election::try_claim_lease(consensus.as_ref(), "127.0.0.1:9301", 1_000, lease_us).unwrap());
    hub_a.promote().unwrap();
    assert!(!election::try_claim_lease(consensus.as_ref(), "127.0.0.1:9401", 1_200, lease_us).unwrap());
    assert_eq!(hub_a.role(), Role::Primary);
    assert_eq!(hub_b.role(), Role::Secondary);

    // A commits something while primary.
    hub_a
        .apply_mutation(
            LogRecord::new(RecordOp::Set, b"k".to_vec(), b"v".to_vec(), 9, 1),
            1,
            0,
        )
        .unwrap();
    assert!(hub_a.writer_offset().offset > 0);

    // Lease expires; B takes over, A loses its claim and steps down.
    assert!(election::try_claim_lease(consensus.as_ref(), "127.0.0.1:9401", 2_000, lease_us).unwrap());
    hub_b.promote().unwrap();
    assert!(!election::try_claim_lease(consensus.as_ref(), "127.0.0.1:9301", 2_100, lease_us).unwrap());
    hub_a.demote();

    assert_eq!(hub_a.role(), Role::Secondary);
    assert_eq!(hub_b.role(), Role::Primary);
    // Demotion discarded A's log and cache.
    assert_eq!(hub_a.writer_offset().offset, 0);
    assert_eq!(hub_a.writer_offset().segment, 1);
    assert!(hub_a.manager().recency().is_empty());

    hub_a.shutdown();
    hub_b.shutdown();
}
