//! Behavioral model of a pipe-based SmartNIC.
//!
//! Instead of descriptor rings, applications own contiguous RX buffers
//! ("pipes") that the device fills directly, with notification buffers
//! carrying progress updates. A flow director steers RX packets to pipes by
//! exact 4-tuple match with hashed or round-robin fallback queues; the TX
//! path reads raw byte ranges from host memory and reassembles packet
//! boundaries from the IP headers.

pub mod device;
pub mod rx;
pub mod tx;

pub use device::{DmaTag, PipeNic};

pub const MAX_NB_APPS: u32 = 1024;
pub const MAX_NB_QUEUES: u32 = 8192;

pub const MTU: usize = 1500;

/// Pipe size in 64-byte flits.
pub const PIPE_SIZE: u32 = 32768;
/// Notification buffer size in entries.
pub const NOTIFICATION_BUF_SIZE: u32 = 16384;

/// Register window per queue.
pub const MEMORY_SPACE_PER_QUEUE: u64 = 1 << 12;

/// Notification entry size in bytes.
pub const NOTIF_SIZE: usize = 64;
