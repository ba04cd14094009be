//! Behavioral model of a simple ring-based NIC.
//!
//! One event queue, one TX/RX queue pair with separate completion queues,
//! all backed by descriptor rings in host memory with driver-visible
//! head/tail pointer registers. Completion DMAs may finish out of order; a
//! per-ring completion bitmap keeps the visible pointers contiguous.

pub mod device;
pub mod rings;

pub use device::{DmaTag, RingNic};

pub const DESC_SIZE: usize = 16;
pub const CPL_SIZE: usize = 32;
pub const EVENT_SIZE: usize = 32;
/// Advertised port MTU; also the packet buffer bound.
pub const MTU: usize = 2048;
