//! Device-side co-simulation runtime.
//!
//! A [`runner::Runner`] owns one device model and drives it from a
//! single-threaded loop: PCIe messages from the host simulator become
//! register accesses and DMA completions, Ethernet messages become packet
//! ingress, and a timed-event heap provides the device's notion of the
//! future. Device models talk back through the [`kernel::Kernel`] handle
//! passed into every callback.

pub mod args;
pub mod dma;
pub mod events;
pub mod kernel;
pub mod multi;
pub mod ring;
pub mod runner;
pub mod test_util;

pub use args::NicArgs;
pub use dma::DmaOp;
pub use kernel::{Device, Kernel};
pub use runner::Runner;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("transport: {0}")]
    Proto(#[from] nicsim_proto::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Setup(String),
}

pub type Result<T> = std::result::Result<T, Error>;
