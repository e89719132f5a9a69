//! # FluxHub Core
//!
//! Core engine of FluxHub, a cross-datacenter replication hub. A cluster
//! of hub servers sits between datacenters: one server at a time holds a
//! consensus lease and acts as primary, accepting mutations from local
//! producers and from remote hubs, appending them to a segmented binlog,
//! and fanning them out to every registered peer over per-peer sender
//! threads. A bounded recency cache gives last-write-wins semantics and
//! stops a server's own writes from echoing back to it.
//!
//! Components:
//! - [`binlog`]: segmented write-ahead log with group commit and
//!   blocking readers
//! - [`recency`]: bounded LRU dedup cache
//! - [`consensus`]: pluggable lease/lock/metadata store
//! - [`election`]: leader lease acquisition, renewal and failover
//! - [`peer`]: peer registry and per-peer link state
//! - [`protocol`]: wire commands (mutations, trysync, heartbeat)
//! - [`transport`]: connection abstraction over TCP
//! - [`sender`], [`heartbeat`], [`trysync`]: per-peer worker threads
//! - [`hub`]: the assembled server engine
//! - [`admin`]: operator command surface

pub mod admin;
pub mod binlog;
pub mod config;
pub mod consensus;
pub mod election;
pub mod error;
pub mod heartbeat;
pub mod hub;
pub mod peer;
pub mod protocol;
pub mod recency;
pub mod record;
pub mod sender;
pub mod transport;
pub mod trysync;

pub use binlog::{BinlogManager, BinlogReader, BinlogWriter, ReadOutcome, WriterOffset};
pub use config::HubConfig;
pub use error::{Error, Result};
pub use hub::Hub;
pub use record::{LogRecord, RecordOp};

/// Consecutive send/connect failures tolerated before a peer link is
/// torn down and rescheduled for a fresh handshake.
pub const MAX_RETRY_TIMES: u32 = 10;

/// Segments of slack granted when a peer asks to resume at a position
/// newer than expected after a hub-side log reset.
pub const RECV_ROLLBACK_SEGMENTS: u64 = 10;

/// Heartbeat traffic runs on the peer's base port plus this delta.
pub const HEARTBEAT_PORT_DELTA: u16 = 1100;
