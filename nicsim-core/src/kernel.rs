//! The device/runtime boundary.

use nicsim_proto::intro::PcieDevIntro;

use crate::dma::DmaOp;

/// Services the runtime offers a device model. Passed explicitly into every
/// device callback; there is no global runtime handle.
pub trait Kernel<T> {
    /// Current simulated time in picoseconds.
    fn time_ps(&self) -> u64;

    /// MAC address assigned to this device instance.
    fn mac_addr(&self) -> u64;

    /// Issue a DMA operation. Ownership of the op passes to the engine and
    /// returns to the model through [`Device::dma_complete`]. Operations
    /// larger than one message are split transparently; the completion fires
    /// once the whole transfer is done. Completions for ops issued by the
    /// same model arrive in issue order.
    fn issue_dma(&mut self, op: DmaOp<T>);

    /// Emit an Ethernet frame towards the network simulator.
    fn eth_send(&mut self, data: &[u8]);

    fn msi_issue(&mut self, vec: u8);
    fn msix_issue(&mut self, vec: u16);

    /// Schedule (or reschedule) the timed event identified by `key` for
    /// absolute time `time`. Fires through [`Device::timed_event`].
    fn event_schedule(&mut self, key: u64, time: u64);

    /// Cancel the timed event identified by `key`, if armed.
    fn event_cancel(&mut self, key: u64);

    /// Interrupt-delivery modes currently enabled by the host (DEVCTRL).
    fn intx_enabled(&self) -> bool;
    fn msi_enabled(&self) -> bool;
    fn msix_enabled(&self) -> bool;
}

/// A device model driven by the runtime. All methods run on the runtime's
/// thread; the model never needs internal synchronization.
pub trait Device {
    /// Tag carried by this device's DMA operations, used to route
    /// completions back to the right consumer inside the model.
    type DmaTag;

    /// Fill in PCI identity, BARs and interrupt geometry for the handshake.
    fn setup_intro(&self, di: &mut PcieDevIntro);

    /// Execute a register read from `bar:addr`, storing the result in `dest`.
    fn reg_read(&mut self, k: &mut dyn Kernel<Self::DmaTag>, bar: u8, addr: u64, dest: &mut [u8]);

    /// Execute a register write to `bar:addr` with the data in `src`.
    fn reg_write(&mut self, k: &mut dyn Kernel<Self::DmaTag>, bar: u8, addr: u64, src: &[u8]);

    /// A previously issued DMA operation completed. For reads, `op.data`
    /// now holds the fetched bytes.
    fn dma_complete(&mut self, k: &mut dyn Kernel<Self::DmaTag>, op: DmaOp<Self::DmaTag>);

    /// A frame arrived on the wire.
    fn eth_rx(&mut self, k: &mut dyn Kernel<Self::DmaTag>, port: u8, data: &[u8]);

    /// A timed event scheduled via [`Kernel::event_schedule`] is due.
    fn timed_event(&mut self, k: &mut dyn Kernel<Self::DmaTag>, key: u64) {
        let _ = (k, key);
    }

    /// Host changed the device-control flags (interrupt enables). The
    /// runtime already tracks them for the [`Kernel`] accessors.
    fn devctrl_update(&mut self, k: &mut dyn Kernel<Self::DmaTag>, flags: u64) {
        let _ = (k, flags);
    }
}
