//! Behavioral model of a 40G-class Ethernet controller.
//!
//! The device exposes an admin command queue for control-path commands, a
//! host-memory cache indirecting queue contexts, and a LAN engine with
//! per-queue RX/TX descriptor rings, TSO segmentation, RSS steering and PTP
//! timestamping. Drivers program it exclusively through the register file in
//! BAR 0.

pub mod adminq;
pub mod device;
pub mod hmc;
pub mod lan;
pub mod ptp;
pub mod regs;
pub mod rss;
pub mod xsum;

pub use device::{DmaTag, FortyGig};

/// Queues per function.
pub const NUM_QUEUES: usize = 1536;
/// PF interrupt vectors.
pub const NUM_PFINTS: usize = 128;
/// Virtual station interfaces advertised to the driver.
pub const NUM_VSIS: usize = 384;
/// Largest frame the device reports to the driver.
pub const MAX_MTU: u16 = 2048;
/// Interrupt throttling rate registers per vector.
pub const NUM_ITR: usize = 3;
