//! The ring NIC device: register map, DMA flows, event delivery.

use std::collections::{HashMap, VecDeque};

use nicsim_core::kernel::{Device, Kernel};
use nicsim_core::DmaOp;
use nicsim_proto::intro::{Bar, PcieDevIntro, BAR_64};
use tracing::{debug, trace, warn};

use crate::rings::{Ptr, Ring};
use crate::{CPL_SIZE, DESC_SIZE, EVENT_SIZE, MTU};

// control/status block
pub const REG_FW_ID: u64 = 0x0000;
pub const REG_FW_VER: u64 = 0x0004;
pub const REG_BOARD_ID: u64 = 0x0008;
pub const REG_BOARD_VER: u64 = 0x000C;
pub const REG_PHC_COUNT: u64 = 0x0010;
pub const REG_PHC_OFFSET: u64 = 0x0014;
pub const REG_PHC_STRIDE: u64 = 0x0018;
pub const REG_IF_COUNT: u64 = 0x0020;
pub const REG_IF_STRIDE: u64 = 0x0024;
pub const REG_IF_CSR_OFFSET: u64 = 0x002C;

pub const PHC_REG_FEATURES: u64 = 0x0200;
pub const PHC_REG_PTP_CUR_SEC_L: u64 = 0x0218;
pub const PHC_REG_PTP_CUR_SEC_H: u64 = 0x021C;
pub const PHC_REG_PTP_SET_FNS: u64 = 0x0230;
pub const PHC_REG_PTP_SET_NS: u64 = 0x0234;
pub const PHC_REG_PTP_SET_SEC_L: u64 = 0x0238;
pub const PHC_REG_PTP_SET_SEC_H: u64 = 0x023C;

pub const IF_REG_IF_ID: u64 = 0x80000;
pub const IF_REG_IF_FEATURES: u64 = 0x80004;
pub const IF_REG_EVENT_QUEUE_COUNT: u64 = 0x80010;
pub const IF_REG_EVENT_QUEUE_OFFSET: u64 = 0x80014;
pub const IF_REG_TX_QUEUE_COUNT: u64 = 0x80020;
pub const IF_REG_TX_QUEUE_OFFSET: u64 = 0x80024;
pub const IF_REG_TX_CPL_QUEUE_COUNT: u64 = 0x80028;
pub const IF_REG_TX_CPL_QUEUE_OFFSET: u64 = 0x8002C;
pub const IF_REG_RX_QUEUE_COUNT: u64 = 0x80030;
pub const IF_REG_RX_QUEUE_OFFSET: u64 = 0x80034;
pub const IF_REG_RX_CPL_QUEUE_COUNT: u64 = 0x80038;
pub const IF_REG_RX_CPL_QUEUE_OFFSET: u64 = 0x8003C;
pub const IF_REG_PORT_COUNT: u64 = 0x80040;
pub const IF_REG_PORT_OFFSET: u64 = 0x80044;
pub const IF_REG_PORT_STRIDE: u64 = 0x80048;

pub const EVENT_QUEUE_BASE_ADDR_REG: u64 = 0x100000;
pub const EVENT_QUEUE_ACTIVE_LOG_SIZE_REG: u64 = 0x100008;
pub const EVENT_QUEUE_INTERRUPT_INDEX_REG: u64 = 0x10000C;
pub const EVENT_QUEUE_HEAD_PTR_REG: u64 = 0x100010;
pub const EVENT_QUEUE_TAIL_PTR_REG: u64 = 0x100018;

pub const TX_QUEUE_BASE_ADDR_REG: u64 = 0x200000;
pub const TX_QUEUE_ACTIVE_LOG_SIZE_REG: u64 = 0x200008;
pub const TX_QUEUE_CPL_QUEUE_INDEX_REG: u64 = 0x20000C;
pub const TX_QUEUE_HEAD_PTR_REG: u64 = 0x200010;
pub const TX_QUEUE_TAIL_PTR_REG: u64 = 0x200018;

pub const TX_CPL_QUEUE_BASE_ADDR_REG: u64 = 0x400000;
pub const TX_CPL_QUEUE_ACTIVE_LOG_SIZE_REG: u64 = 0x400008;
pub const TX_CPL_QUEUE_INTERRUPT_INDEX_REG: u64 = 0x40000C;
pub const TX_CPL_QUEUE_HEAD_PTR_REG: u64 = 0x400010;
pub const TX_CPL_QUEUE_TAIL_PTR_REG: u64 = 0x400018;

pub const RX_QUEUE_BASE_ADDR_REG: u64 = 0x600000;
pub const RX_QUEUE_ACTIVE_LOG_SIZE_REG: u64 = 0x600008;
pub const RX_QUEUE_CPL_QUEUE_INDEX_REG: u64 = 0x60000C;
pub const RX_QUEUE_HEAD_PTR_REG: u64 = 0x600010;
pub const RX_QUEUE_TAIL_PTR_REG: u64 = 0x600018;

pub const RX_CPL_QUEUE_BASE_ADDR_REG: u64 = 0x700000;
pub const RX_CPL_QUEUE_ACTIVE_LOG_SIZE_REG: u64 = 0x700008;
pub const RX_CPL_QUEUE_INTERRUPT_INDEX_REG: u64 = 0x70000C;
pub const RX_CPL_QUEUE_HEAD_PTR_REG: u64 = 0x700010;
pub const RX_CPL_QUEUE_TAIL_PTR_REG: u64 = 0x700018;

pub const PORT_REG_PORT_ID: u64 = 0x800000;
pub const PORT_REG_PORT_FEATURES: u64 = 0x800004;
pub const PORT_REG_PORT_MTU: u64 = 0x800008;
pub const PORT_REG_SCHED_COUNT: u64 = 0x800010;
pub const PORT_REG_SCHED_OFFSET: u64 = 0x800014;
pub const PORT_REG_SCHED_STRIDE: u64 = 0x800018;
pub const PORT_REG_SCHED_TYPE: u64 = 0x80001C;
pub const PORT_REG_SCHED_ENABLE: u64 = 0x800040;
pub const PORT_REG_RSS_MASK: u64 = 0x800080;

pub const PORT_QUEUE_ENABLE: u64 = 0x900000;

pub const EVENT_TYPE_TX_CPL: u16 = 0x0000;
pub const EVENT_TYPE_RX_CPL: u16 = 0x0001;

const VENDOR_ID: u16 = 0x5543;
const DEVICE_ID: u16 = 0x1001;

/// Completion routing for the DMA flows. `tag` is the ring pointer value
/// the op belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaTag {
    /// TX descriptor fetch.
    TxDesc { tag: Ptr },
    /// TX payload fetch.
    TxMem { tag: Ptr },
    /// RX descriptor fetch (a received packet is parked under the tag).
    RxDesc { tag: Ptr },
    /// RX payload write.
    RxMem { tag: Ptr, len: u16 },
    /// Completion record write.
    Cpl { tx: bool, tag: Ptr },
    /// Event record write.
    Event { tag: Ptr },
}

struct PortConfig {
    sched_enable: bool,
    queue_enable: bool,
    rss_mask: u32,
}

pub struct RingNic {
    event_ring: Ring,
    tx_ring: Ring,
    tx_cpl_ring: Ring,
    rx_ring: Ring,
    rx_cpl_ring: Ring,
    /// Completions waiting for free completion-ring slots.
    tx_cpl_pending: VecDeque<(Ptr, u16)>,
    rx_cpl_pending: VecDeque<(Ptr, u16)>,
    /// Received frames waiting for their descriptor fetch.
    rx_waiting: HashMap<Ptr, Vec<u8>>,
    port: PortConfig,
    features: u32,
}

impl RingNic {
    pub fn new() -> Self {
        RingNic {
            event_ring: Ring::new(),
            tx_ring: Ring::new(),
            tx_cpl_ring: Ring::new(),
            rx_ring: Ring::new(),
            rx_cpl_ring: Ring::new(),
            tx_cpl_pending: VecDeque::new(),
            rx_cpl_pending: VecDeque::new(),
            rx_waiting: HashMap::new(),
            port: PortConfig { sched_enable: false, queue_enable: false, rss_mask: 0 },
            features: 0,
        }
    }

    fn reg_read32(&mut self, addr: u64) -> u32 {
        match addr {
            REG_FW_ID => 32,
            REG_FW_VER => 1,
            REG_BOARD_ID => 0x4321_5678,
            REG_BOARD_VER => 1,
            REG_PHC_COUNT => 1,
            REG_PHC_OFFSET => 0x200,
            REG_PHC_STRIDE => 0x80,
            REG_IF_COUNT => 1,
            REG_IF_STRIDE => 0x80000,
            REG_IF_CSR_OFFSET => 0x80000,
            PHC_REG_FEATURES => 0x1,
            PHC_REG_PTP_CUR_SEC_L => 0,
            PHC_REG_PTP_CUR_SEC_H => 0,
            IF_REG_IF_ID => 0,
            IF_REG_IF_FEATURES => self.features,
            IF_REG_EVENT_QUEUE_COUNT => 1,
            IF_REG_EVENT_QUEUE_OFFSET => EVENT_QUEUE_BASE_ADDR_REG as u32,
            IF_REG_TX_QUEUE_COUNT => 1,
            IF_REG_TX_QUEUE_OFFSET => TX_QUEUE_BASE_ADDR_REG as u32,
            IF_REG_TX_CPL_QUEUE_COUNT => 1,
            IF_REG_TX_CPL_QUEUE_OFFSET => TX_CPL_QUEUE_BASE_ADDR_REG as u32,
            IF_REG_RX_QUEUE_COUNT => 1,
            IF_REG_RX_QUEUE_OFFSET => RX_QUEUE_BASE_ADDR_REG as u32,
            IF_REG_RX_CPL_QUEUE_COUNT => 1,
            IF_REG_RX_CPL_QUEUE_OFFSET => RX_CPL_QUEUE_BASE_ADDR_REG as u32,
            IF_REG_PORT_COUNT => 1,
            IF_REG_PORT_OFFSET => PORT_REG_PORT_ID as u32,
            IF_REG_PORT_STRIDE => 0x200000,
            EVENT_QUEUE_HEAD_PTR_REG => self.event_ring.head_ptr() as u32,
            EVENT_QUEUE_TAIL_PTR_REG => self.event_ring.tail_ptr() as u32,
            TX_QUEUE_ACTIVE_LOG_SIZE_REG => self.tx_ring.size_log(),
            TX_QUEUE_TAIL_PTR_REG => self.tx_ring.tail_ptr() as u32,
            TX_CPL_QUEUE_HEAD_PTR_REG => self.tx_cpl_ring.head_ptr() as u32,
            RX_QUEUE_TAIL_PTR_REG => self.rx_ring.tail_ptr() as u32,
            RX_CPL_QUEUE_HEAD_PTR_REG => self.rx_cpl_ring.head_ptr() as u32,
            PORT_REG_PORT_ID => 0,
            PORT_REG_PORT_FEATURES => self.features,
            PORT_REG_PORT_MTU => MTU as u32,
            PORT_REG_SCHED_COUNT => 1,
            PORT_REG_SCHED_OFFSET => 0x100000,
            PORT_REG_SCHED_STRIDE => 0x100000,
            PORT_REG_SCHED_TYPE => 0,
            PORT_REG_RSS_MASK => self.port.rss_mask,
            _ => {
                warn!(addr, "unknown register read");
                0
            }
        }
    }

    fn reg_write32(&mut self, k: &mut dyn Kernel<DmaTag>, addr: u64, val: u32) {
        match addr {
            // read-only identification block: writes ignored
            REG_FW_ID | REG_FW_VER | REG_BOARD_ID | REG_BOARD_VER | REG_PHC_COUNT
            | REG_PHC_OFFSET | REG_PHC_STRIDE | REG_IF_COUNT | REG_IF_STRIDE
            | REG_IF_CSR_OFFSET | PHC_REG_FEATURES | PHC_REG_PTP_SET_FNS | PHC_REG_PTP_SET_NS
            | PHC_REG_PTP_SET_SEC_L | PHC_REG_PTP_SET_SEC_H => {}

            EVENT_QUEUE_BASE_ADDR_REG => self.event_ring.set_dma_lower(val),
            a if a == EVENT_QUEUE_BASE_ADDR_REG + 4 => self.event_ring.set_dma_upper(val),
            EVENT_QUEUE_ACTIVE_LOG_SIZE_REG => self.event_ring.set_size_log(val),
            EVENT_QUEUE_INTERRUPT_INDEX_REG => self.event_ring.set_index(val),
            EVENT_QUEUE_HEAD_PTR_REG => self.event_ring.set_head_ptr(val as Ptr),
            EVENT_QUEUE_TAIL_PTR_REG => self.event_ring.set_tail_ptr(val as Ptr),

            TX_QUEUE_BASE_ADDR_REG => self.tx_ring.set_dma_lower(val),
            a if a == TX_QUEUE_BASE_ADDR_REG + 4 => self.tx_ring.set_dma_upper(val),
            TX_QUEUE_ACTIVE_LOG_SIZE_REG => self.tx_ring.set_size_log(val),
            TX_QUEUE_CPL_QUEUE_INDEX_REG => self.tx_ring.set_index(val),
            TX_QUEUE_HEAD_PTR_REG => self.tx_head_updated(k, val as Ptr),
            TX_QUEUE_TAIL_PTR_REG => self.tx_ring.set_tail_ptr(val as Ptr),

            TX_CPL_QUEUE_BASE_ADDR_REG => self.tx_cpl_ring.set_dma_lower(val),
            a if a == TX_CPL_QUEUE_BASE_ADDR_REG + 4 => self.tx_cpl_ring.set_dma_upper(val),
            TX_CPL_QUEUE_ACTIVE_LOG_SIZE_REG => self.tx_cpl_ring.set_size_log(val),
            TX_CPL_QUEUE_INTERRUPT_INDEX_REG => self.tx_cpl_ring.set_index(val),
            TX_CPL_QUEUE_HEAD_PTR_REG => self.tx_cpl_ring.set_head_ptr(val as Ptr),
            TX_CPL_QUEUE_TAIL_PTR_REG => self.tx_cpl_ring.set_tail_ptr(val as Ptr),

            RX_QUEUE_BASE_ADDR_REG => self.rx_ring.set_dma_lower(val),
            a if a == RX_QUEUE_BASE_ADDR_REG + 4 => self.rx_ring.set_dma_upper(val),
            RX_QUEUE_ACTIVE_LOG_SIZE_REG => self.rx_ring.set_size_log(val),
            RX_QUEUE_CPL_QUEUE_INDEX_REG => self.rx_ring.set_index(val),
            RX_QUEUE_HEAD_PTR_REG => self.rx_ring.set_head_ptr(val as Ptr),
            RX_QUEUE_TAIL_PTR_REG => self.rx_ring.set_tail_ptr(val as Ptr),

            RX_CPL_QUEUE_BASE_ADDR_REG => self.rx_cpl_ring.set_dma_lower(val),
            a if a == RX_CPL_QUEUE_BASE_ADDR_REG + 4 => self.rx_cpl_ring.set_dma_upper(val),
            RX_CPL_QUEUE_ACTIVE_LOG_SIZE_REG => self.rx_cpl_ring.set_size_log(val),
            RX_CPL_QUEUE_INTERRUPT_INDEX_REG => self.rx_cpl_ring.set_index(val),
            RX_CPL_QUEUE_HEAD_PTR_REG => self.rx_cpl_ring.set_head_ptr(val as Ptr),
            RX_CPL_QUEUE_TAIL_PTR_REG => self.rx_cpl_ring.set_tail_ptr(val as Ptr),

            PORT_REG_SCHED_ENABLE => self.port.sched_enable = val != 0,
            PORT_REG_RSS_MASK => self.port.rss_mask = val,
            PORT_QUEUE_ENABLE => self.port.queue_enable = val != 0,

            _ => {
                warn!(addr, val, "unknown register write");
            }
        }
    }

    /// Driver advanced the TX head: fetch the newly posted descriptors.
    fn tx_head_updated(&mut self, k: &mut dyn Kernel<DmaTag>, ptr: Ptr) {
        self.tx_ring.set_head_ptr(ptr);
        while self.tx_ring.curr_tail != self.tx_ring.head_ptr() {
            let tag = self.tx_ring.curr_tail;
            let addr = self.tx_ring.entry_addr(tag, DESC_SIZE);
            trace!(tag, addr, "fetching tx descriptor");
            k.issue_dma(DmaOp::read(addr, DESC_SIZE, DmaTag::TxDesc { tag }));
            self.tx_ring.curr_tail = self.tx_ring.curr_tail.wrapping_add(1);
        }
    }

    /// Queue a completion record and drain as many as fit the ring.
    fn complete(&mut self, k: &mut dyn Kernel<DmaTag>, tx: bool, index: Ptr, len: u16) {
        let (ring, pending) = if tx {
            (&mut self.tx_cpl_ring, &mut self.tx_cpl_pending)
        } else {
            (&mut self.rx_cpl_ring, &mut self.rx_cpl_pending)
        };

        pending.push_back((index, len));
        while !ring.full() && !pending.is_empty() {
            let (index, len) = pending.pop_front().expect("pending drained");
            let tag = ring.curr_head;
            let addr = ring.entry_addr(tag, CPL_SIZE);

            let mut cpl = vec![0u8; CPL_SIZE];
            cpl[2..4].copy_from_slice(&index.to_le_bytes());
            cpl[4..6].copy_from_slice(&len.to_le_bytes());
            k.issue_dma(DmaOp::write(addr, cpl, DmaTag::Cpl { tx, tag }));
            ring.curr_head = ring.curr_head.wrapping_add(1);
        }
    }

    /// Write an event record if the driver has armed the event ring.
    fn issue_event(&mut self, k: &mut dyn Kernel<DmaTag>, ev_type: u16, source: u16) {
        debug_assert!(ev_type == EVENT_TYPE_TX_CPL || ev_type == EVENT_TYPE_RX_CPL);
        if !self.event_ring.is_armed() {
            return;
        }
        if self.event_ring.full() {
            warn!("event ring full, event lost");
            return;
        }

        let tag = self.event_ring.curr_head;
        let addr = self.event_ring.entry_addr(tag, EVENT_SIZE);
        let mut event = vec![0u8; EVENT_SIZE];
        event[0..2].copy_from_slice(&ev_type.to_le_bytes());
        event[2..4].copy_from_slice(&source.to_le_bytes());
        k.issue_dma(DmaOp::write(addr, event, DmaTag::Event { tag }));
        self.event_ring.curr_head = self.event_ring.curr_head.wrapping_add(1);
        self.event_ring.disarm();
    }
}

impl Default for RingNic {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for RingNic {
    type DmaTag = DmaTag;

    fn setup_intro(&self, di: &mut PcieDevIntro) {
        di.bars[0] = Bar { len: 1 << 24, flags: BAR_64 };
        di.vendor_id = VENDOR_ID;
        di.device_id = DEVICE_ID;
        di.class = 0x02;
        di.subclass = 0x00;
        di.revision = 0x00;
        di.msi_nvecs = 32;
    }

    fn reg_read(&mut self, _k: &mut dyn Kernel<DmaTag>, _bar: u8, addr: u64, dest: &mut [u8]) {
        assert_eq!(dest.len(), 4, "ring nic registers are 32-bit");
        let val = self.reg_read32(addr);
        dest.copy_from_slice(&val.to_le_bytes());
    }

    fn reg_write(&mut self, k: &mut dyn Kernel<DmaTag>, _bar: u8, addr: u64, src: &[u8]) {
        assert_eq!(src.len(), 4, "ring nic registers are 32-bit");
        let val = u32::from_le_bytes(src.try_into().unwrap());
        self.reg_write32(k, addr, val);
    }

    fn dma_complete(&mut self, k: &mut dyn Kernel<DmaTag>, op: DmaOp<DmaTag>) {
        match op.tag {
            DmaTag::TxDesc { tag } => {
                // descriptor in hand: fetch the packet bytes
                let addr = u64::from_le_bytes(op.data[8..16].try_into().unwrap());
                let len = u32::from_le_bytes(op.data[4..8].try_into().unwrap()) as usize;
                trace!(tag, addr, len, "tx descriptor fetched");
                k.issue_dma(DmaOp::read(addr, len, DmaTag::TxMem { tag }));
            }
            DmaTag::TxMem { tag } => {
                k.eth_send(&op.data);
                self.tx_ring.update_ptr(tag, false);
                self.complete(k, true, tag, op.data.len() as u16);
            }
            DmaTag::RxDesc { tag } => {
                let packet = self.rx_waiting.remove(&tag).expect("no packet for rx descriptor");
                let addr = u64::from_le_bytes(op.data[8..16].try_into().unwrap());
                trace!(tag, addr, len = packet.len(), "rx descriptor fetched");
                let len = packet.len() as u16;
                k.issue_dma(DmaOp::write(addr, packet, DmaTag::RxMem { tag, len }));
            }
            DmaTag::RxMem { tag, len } => {
                self.rx_ring.update_ptr(tag, false);
                self.complete(k, false, tag, len);
            }
            DmaTag::Cpl { tx, tag } => {
                let ring = if tx { &mut self.tx_cpl_ring } else { &mut self.rx_cpl_ring };
                if ring.update_ptr(tag, true) {
                    let ev = if tx { EVENT_TYPE_TX_CPL } else { EVENT_TYPE_RX_CPL };
                    self.issue_event(k, ev, 0);
                }
            }
            DmaTag::Event { tag } => {
                if self.event_ring.update_ptr(tag, true) {
                    k.msi_issue(0);
                }
            }
        }
    }

    fn eth_rx(&mut self, k: &mut dyn Kernel<DmaTag>, _port: u8, data: &[u8]) {
        if self.rx_ring.empty() {
            debug!(len = data.len(), "rx ring empty, dropping packet");
            return;
        }

        let tag = self.rx_ring.curr_tail;
        let addr = self.rx_ring.entry_addr(tag, DESC_SIZE);
        self.rx_waiting.insert(tag, data.to_vec());
        k.issue_dma(DmaOp::read(addr, DESC_SIZE, DmaTag::RxDesc { tag }));
        self.rx_ring.curr_tail = self.rx_ring.curr_tail.wrapping_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nicsim_core::test_util::RecordingKernel;
    use crate::rings::{QUEUE_ACTIVE_MASK, QUEUE_ARM_MASK};

    type Kern = RecordingKernel<DmaTag>;

    fn write32(dev: &mut RingNic, k: &mut Kern, addr: u64, val: u32) {
        dev.reg_write(k, 0, addr, &val.to_le_bytes());
    }

    fn read32(dev: &mut RingNic, k: &mut Kern, addr: u64) -> u32 {
        let mut buf = [0u8; 4];
        dev.reg_read(k, 0, addr, &mut buf);
        u32::from_le_bytes(buf)
    }

    fn desc(addr: u64, len: u32) -> Vec<u8> {
        let mut d = vec![0u8; DESC_SIZE];
        d[4..8].copy_from_slice(&len.to_le_bytes());
        d[8..16].copy_from_slice(&addr.to_le_bytes());
        d
    }

    fn answer<F: FnOnce(&mut Vec<u8>)>(dev: &mut RingNic, k: &mut Kern, fill: F) {
        let mut op = k.pop_dma().expect("expected a dma op");
        fill(&mut op.data);
        dev.dma_complete(k, op);
    }

    fn setup_rings(dev: &mut RingNic, k: &mut Kern) {
        for base in [
            (EVENT_QUEUE_BASE_ADDR_REG, 0x1000u32),
            (TX_QUEUE_BASE_ADDR_REG, 0x2000),
            (TX_CPL_QUEUE_BASE_ADDR_REG, 0x3000),
            (RX_QUEUE_BASE_ADDR_REG, 0x4000),
            (RX_CPL_QUEUE_BASE_ADDR_REG, 0x5000),
        ] {
            write32(dev, k, base.0, base.1);
            write32(dev, k, base.0 + 8, QUEUE_ACTIVE_MASK | 4); // log size 4
        }
        // arm the event ring
        write32(dev, k, EVENT_QUEUE_INTERRUPT_INDEX_REG, QUEUE_ARM_MASK);
    }

    #[test]
    fn test_probe_registers() {
        let mut dev = RingNic::new();
        let mut k = Kern::new();
        assert_eq!(read32(&mut dev, &mut k, REG_FW_ID), 32);
        assert_eq!(read32(&mut dev, &mut k, REG_BOARD_ID), 0x4321_5678);
        assert_eq!(read32(&mut dev, &mut k, IF_REG_TX_QUEUE_COUNT), 1);
        assert_eq!(read32(&mut dev, &mut k, PORT_REG_PORT_MTU), MTU as u32);
        // unknown registers read as zero
        assert_eq!(read32(&mut dev, &mut k, 0xf_a000), 0);
    }

    #[test]
    fn test_tx_flow_end_to_end() {
        let mut dev = RingNic::new();
        let mut k = Kern::new();
        setup_rings(&mut dev, &mut k);

        // driver posts one descriptor and bumps the head
        write32(&mut dev, &mut k, TX_QUEUE_HEAD_PTR_REG, 1);

        // descriptor fetch from the ring base
        let op = k.pop_dma().unwrap();
        assert_eq!(op.tag, DmaTag::TxDesc { tag: 0 });
        assert_eq!(op.addr, 0x2000);
        let mut op = op;
        op.data = desc(0x9000, 60);
        dev.dma_complete(&mut k, op);

        // payload fetch, then the frame goes out
        let op = k.pop_dma().unwrap();
        assert_eq!(op.tag, DmaTag::TxMem { tag: 0 });
        assert_eq!((op.addr, op.data.len()), (0x9000, 60));
        answer(&mut dev, &mut k, |d| d.fill(0xee));
        assert_eq!(k.take_frames(), vec![vec![0xee; 60]]);
        assert_eq!(dev.tx_ring.tail_ptr(), 1);

        // completion record written to the tx completion ring
        let op = k.pop_dma().unwrap();
        assert_eq!(op.tag, DmaTag::Cpl { tx: true, tag: 0 });
        assert_eq!(op.addr, 0x3000);
        assert_eq!(u16::from_le_bytes([op.data[2], op.data[3]]), 0);
        assert_eq!(u16::from_le_bytes([op.data[4], op.data[5]]), 60);
        dev.dma_complete(&mut k, op);

        // completion advances the cpl ring head and emits an event
        assert_eq!(dev.tx_cpl_ring.head_ptr(), 1);
        let op = k.pop_dma().unwrap();
        assert_eq!(op.tag, DmaTag::Event { tag: 0 });
        assert_eq!(op.addr, 0x1000);
        assert_eq!(u16::from_le_bytes([op.data[0], op.data[1]]), EVENT_TYPE_TX_CPL);
        dev.dma_complete(&mut k, op);

        // event completion raises MSI vector 0
        assert_eq!(k.msis, vec![0]);
    }

    #[test]
    fn test_rx_flow_end_to_end() {
        let mut dev = RingNic::new();
        let mut k = Kern::new();
        setup_rings(&mut dev, &mut k);

        // driver posts two rx descriptors
        write32(&mut dev, &mut k, RX_QUEUE_HEAD_PTR_REG, 2);

        let frame = vec![0xabu8; 120];
        dev.eth_rx(&mut k, 0, &frame);

        // descriptor fetch for slot 0
        let op = k.pop_dma().unwrap();
        assert_eq!(op.tag, DmaTag::RxDesc { tag: 0 });
        assert_eq!(op.addr, 0x4000);
        let mut op = op;
        op.data = desc(0xa000, 2048);
        dev.dma_complete(&mut k, op);

        // packet written into the descriptor's buffer
        let op = k.pop_dma().unwrap();
        assert_eq!(op.tag, DmaTag::RxMem { tag: 0, len: 120 });
        assert_eq!(op.addr, 0xa000);
        assert_eq!(op.data, frame);
        dev.dma_complete(&mut k, op);
        assert_eq!(dev.rx_ring.tail_ptr(), 1);

        // completion + event + interrupt
        let op = k.pop_dma().unwrap();
        assert_eq!(op.tag, DmaTag::Cpl { tx: false, tag: 0 });
        assert_eq!(u16::from_le_bytes([op.data[4], op.data[5]]), 120);
        dev.dma_complete(&mut k, op);

        let op = k.pop_dma().unwrap();
        assert_eq!(op.tag, DmaTag::Event { tag: 0 });
        assert_eq!(u16::from_le_bytes([op.data[0], op.data[1]]), EVENT_TYPE_RX_CPL);
        dev.dma_complete(&mut k, op);
        assert_eq!(k.msis, vec![0]);
    }

    #[test]
    fn test_rx_drop_without_descriptors() {
        let mut dev = RingNic::new();
        let mut k = Kern::new();
        setup_rings(&mut dev, &mut k);

        dev.eth_rx(&mut k, 0, &[0u8; 64]);
        assert!(k.dmas.is_empty());
    }

    #[test]
    fn test_event_requires_rearm() {
        let mut dev = RingNic::new();
        let mut k = Kern::new();
        setup_rings(&mut dev, &mut k);

        // two tx packets back to back
        write32(&mut dev, &mut k, TX_QUEUE_HEAD_PTR_REG, 2);
        for i in 0..2u64 {
            let mut op = k.pop_dma().unwrap();
            assert_eq!(op.tag, DmaTag::TxDesc { tag: i as Ptr });
            op.data = desc(0x9000 + i * 0x100, 60);
            dev.dma_complete(&mut k, op);
        }
        for _ in 0..2 {
            let op = k.pop_dma().unwrap();
            assert!(matches!(op.tag, DmaTag::TxMem { .. }));
            answer(&mut dev, &mut k, |d| d.fill(0));
        }

        // first completion produces the armed event, second finds the ring
        // disarmed
        let cpl0 = k.pop_dma().unwrap();
        let cpl1 = k.pop_dma().unwrap();
        dev.dma_complete(&mut k, cpl0);
        let ev = k.pop_dma().unwrap();
        assert!(matches!(ev.tag, DmaTag::Event { .. }));
        dev.dma_complete(&mut k, cpl1);
        assert!(k.dmas.is_empty(), "no second event without re-arming");

        dev.dma_complete(&mut k, ev);
        assert_eq!(k.msis, vec![0]);
    }

    #[test]
    fn test_out_of_order_tx_mem_completions() {
        let mut dev = RingNic::new();
        let mut k = Kern::new();
        setup_rings(&mut dev, &mut k);

        write32(&mut dev, &mut k, TX_QUEUE_HEAD_PTR_REG, 2);
        let mut d0 = k.pop_dma().unwrap();
        let mut d1 = k.pop_dma().unwrap();
        d0.data = desc(0x9000, 10);
        d1.data = desc(0x9100, 20);
        dev.dma_complete(&mut k, d0);
        dev.dma_complete(&mut k, d1);

        let m0 = k.pop_dma().unwrap();
        let m1 = k.pop_dma().unwrap();
        // later descriptor's payload arrives first
        dev.dma_complete(&mut k, m1);
        assert_eq!(dev.tx_ring.tail_ptr(), 0, "tail held back");
        dev.dma_complete(&mut k, m0);
        assert_eq!(dev.tx_ring.tail_ptr(), 2, "tail jumps over both");
    }
}
