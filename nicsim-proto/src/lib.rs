//! Shared-memory co-simulation transport.
//!
//! A pair of simulators exchange fixed-size message frames through lock-free
//! SPSC queues carved out of one file-backed shared memory pool. The listener
//! creates the pool and carves the queues; the connecter receives the pool fd
//! over a unix socket during the intro handshake and maps it. Each frame
//! carries a delivery timestamp so the two sides can optionally run under a
//! bounded-skew synchronization discipline.

pub mod base;
pub mod intro;
pub mod msgs;
pub mod shm;

use std::path::PathBuf;

/// Protocol version exchanged in the intro handshake.
pub const PROTO_VERSION: u64 = 1;

/// Upper-layer protocol carried on top of the base transport.
pub const UPPER_PROTO_PCIE: u64 = 0x01;
pub const UPPER_PROTO_ETH: u64 = 0x02;
pub const UPPER_PROTO_MEM: u64 = 0x03;

/// Synchronization discipline for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Never synchronize, regardless of what the peer wants.
    Disabled,
    /// Synchronize if both peers request it.
    #[default]
    Optional,
    /// Synchronize, and fail the handshake if the peer cannot.
    Required,
}

impl std::str::FromStr for SyncMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "disabled" | "0" => Ok(SyncMode::Disabled),
            "optional" | "1" => Ok(SyncMode::Optional),
            "required" | "2" => Ok(SyncMode::Required),
            _ => Err(format!("invalid sync mode: {s}")),
        }
    }
}

/// Parameters for one base interface.
#[derive(Debug, Clone)]
pub struct Params {
    /// Link latency / propagation delay in picoseconds.
    pub link_latency: u64,
    /// Maximum gap between outbound messages in picoseconds.
    pub sync_interval: u64,
    /// Unix socket path to listen on / connect to.
    pub sock_path: PathBuf,
    pub sync_mode: SyncMode,
    /// Blocking vs non-blocking connection establishment.
    pub blocking_conn: bool,
    /// Listener only: queue geometry for both directions.
    pub in_num_entries: usize,
    pub in_entries_size: usize,
    pub out_num_entries: usize,
    pub out_entries_size: usize,
    pub upper_layer_proto: u64,
}

impl Params {
    pub fn new(sock_path: impl Into<PathBuf>, upper_layer_proto: u64) -> Self {
        Params {
            link_latency: 500_000,
            sync_interval: 500_000,
            sock_path: sock_path.into(),
            sync_mode: SyncMode::Optional,
            blocking_conn: false,
            in_num_entries: 8192,
            in_entries_size: 2048,
            out_num_entries: 8192,
            out_entries_size: 2048,
            upper_layer_proto,
        }
    }

    /// Required SHM pool space for this interface's queues.
    pub fn shm_size(&self) -> usize {
        self.in_num_entries * self.in_entries_size
            + self.out_num_entries * self.out_entries_size
    }
}

/// Transport errors. Setup failures are fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("syscall failed: {0}")]
    Sys(#[from] nix::errno::Errno),
    #[error("shared memory pool exhausted")]
    PoolExhausted,
    #[error("link latency must be >= sync interval when synchronizing")]
    LatencyBelowSyncInterval,
    #[error("peer protocol version {0:#x} does not match ours")]
    VersionMismatch(u64),
    #[error("peer upper-layer proto {theirs:#x} does not match ours ({ours:#x})")]
    UpperProtoMismatch { ours: u64, theirs: u64 },
    #[error("peer forces synchronization but it is disabled locally")]
    SyncForceConflict,
    #[error("synchronization required locally but peer offers none")]
    SyncRequired,
    #[error("operation invalid in connection state: {0}")]
    InvalidState(&'static str),
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("intro message truncated or oversized")]
    BadIntro,
    #[error("out queue full")]
    QueueFull,
}

pub type Result<T> = std::result::Result<T, Error>;
