//! The pipe NIC device: per-queue register windows, notification plumbing
//! and the DMA flows between pipes and host memory.

use nicsim_core::kernel::{Device, Kernel};
use nicsim_core::DmaOp;
use nicsim_proto::intro::{Bar, PcieDevIntro, BAR_64, BAR_DUMMY};
use tracing::{debug, trace, warn};

use crate::rx::{RxPipeline, Steer};
use crate::tx::TxPipeline;
use crate::{
    MAX_NB_APPS, MAX_NB_QUEUES, MEMORY_SPACE_PER_QUEUE, NOTIFICATION_BUF_SIZE, NOTIF_SIZE,
    PIPE_SIZE,
};

pub const STANDARD_BAR: u8 = 0;
pub const QUEUES_BAR: u8 = 2;
pub const MSIX_BAR: u8 = 3;

const VENDOR_ID: u16 = 0x1172;
const DEVICE_ID: u16 = 0x0000;

// queue register window offsets
const REG_RX_TAIL: u64 = 0;
const REG_RX_HEAD: u64 = 4;
const REG_RX_MEM_LOW: u64 = 8;
const REG_RX_MEM_HIGH: u64 = 12;
const REG_TX_TAIL: u64 = 16;
const REG_TX_HEAD: u64 = 20;
const REG_TX_MEM_LOW: u64 = 24;
const REG_TX_MEM_HIGH: u64 = 28;

// notification signals
const SIGNAL_DATA: u64 = 1;
const SIGNAL_CONFIG: u64 = 2;

// configuration notification ids
const FLOW_TABLE_CONFIG_ID: u64 = 1;
const TIMESTAMP_CONFIG_ID: u64 = 2;
const RATE_LIMIT_CONFIG_ID: u64 = 3;
const FALLBACK_QUEUES_CONFIG_ID: u64 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaTag {
    /// Packet data or notification write; nothing to do on completion.
    Write,
    /// TX notification batch fetch for a queue.
    TxNotifFetch { queue: u32 },
    /// TX data fetch; the completion notification goes to `completion_addr`
    /// once the data is in.
    TxDataFetch { completion_addr: u64 },
}

/// One host ring buffer: base address plus head/tail in entry units.
#[derive(Debug, Clone, Copy, Default)]
struct RingBuf {
    buf: u64,
    tail: u32,
    head: u32,
}

impl RingBuf {
    fn set_low(&mut self, val: u32) {
        self.buf = (self.buf & 0xffff_ffff_0000_0000) | val as u64;
    }

    fn set_high(&mut self, val: u32) {
        self.buf = (self.buf & 0xffff_ffff) | ((val as u64) << 32);
    }

    /// Free entries between head and tail, modulo `size`.
    fn free_slots(&self, size: u32) -> u32 {
        self.head.wrapping_sub(self.tail).wrapping_sub(1) % size
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Stats {
    pub rx_pkts: u64,
    pub tx_pkts: u64,
    pub pkt_drops: u64,
    pub notif_drops: u64,
}

pub struct PipeNic {
    /// Application RX pipes, indexed by pipe id.
    rx_bufs: Vec<RingBuf>,
    rx_notif_bufs: Vec<RingBuf>,
    tx_notif_bufs: Vec<RingBuf>,
    rx_pipeline: RxPipeline,
    tx_pipeline: TxPipeline,
    stats: Stats,
}

impl PipeNic {
    pub fn new() -> Self {
        PipeNic {
            rx_bufs: vec![RingBuf::default(); MAX_NB_QUEUES as usize],
            rx_notif_bufs: vec![RingBuf::default(); MAX_NB_APPS as usize],
            tx_notif_bufs: vec![RingBuf::default(); MAX_NB_APPS as usize],
            rx_pipeline: RxPipeline::new(),
            tx_pipeline: TxPipeline::new(),
            stats: Stats::default(),
        }
    }

    pub fn stats(&self) -> Stats {
        self.stats
    }

    pub fn reset(&mut self) {
        self.rx_pipeline.reset();
        self.tx_pipeline.reset();
        self.rx_bufs.fill(RingBuf::default());
        self.rx_notif_bufs.fill(RingBuf::default());
        self.tx_notif_bufs.fill(RingBuf::default());
        self.stats = Stats::default();
    }

    fn reg_read32(&mut self, addr: u64) -> u32 {
        let queue_id = (addr / MEMORY_SPACE_PER_QUEUE) as u32;
        let offset = addr % MEMORY_SPACE_PER_QUEUE;

        if queue_id < MAX_NB_QUEUES {
            let b = &self.rx_bufs[queue_id as usize];
            match offset {
                REG_RX_TAIL => b.tail,
                REG_RX_HEAD => b.head,
                REG_RX_MEM_LOW => b.buf as u32,
                REG_RX_MEM_HIGH => (b.buf >> 32) as u32,
                _ => {
                    warn!(addr, "unhandled rx pipe register read");
                    0
                }
            }
        } else if queue_id - MAX_NB_QUEUES < MAX_NB_APPS {
            let app = (queue_id - MAX_NB_QUEUES) as usize;
            let rx = &self.rx_notif_bufs[app];
            let tx = &self.tx_notif_bufs[app];
            match offset {
                REG_RX_TAIL => rx.tail,
                REG_RX_HEAD => rx.head,
                REG_RX_MEM_LOW => rx.buf as u32,
                REG_RX_MEM_HIGH => (rx.buf >> 32) as u32,
                REG_TX_TAIL => tx.tail,
                REG_TX_HEAD => tx.head,
                REG_TX_MEM_LOW => tx.buf as u32,
                REG_TX_MEM_HIGH => (tx.buf >> 32) as u32,
                _ => {
                    warn!(addr, "unhandled notification register read");
                    0
                }
            }
        } else {
            warn!(addr, "register read out of range");
            0
        }
    }

    fn reg_write32(&mut self, k: &mut dyn Kernel<DmaTag>, addr: u64, val: u32) {
        let queue_id = (addr / MEMORY_SPACE_PER_QUEUE) as u32;
        let offset = addr % MEMORY_SPACE_PER_QUEUE;

        if queue_id < MAX_NB_QUEUES {
            match offset {
                REG_RX_TAIL => self.rx_bufs[queue_id as usize].tail = val,
                REG_RX_HEAD => {
                    self.rx_bufs[queue_id as usize].head = val;
                    // reactive notification if the pipe still holds data
                    let b = self.rx_bufs[queue_id as usize];
                    if b.head != b.tail {
                        self.send_rx_notif(k, queue_id);
                    }
                }
                REG_RX_MEM_LOW => self.rx_bufs[queue_id as usize].set_low(val),
                REG_RX_MEM_HIGH => self.rx_bufs[queue_id as usize].set_high(val),
                _ => {
                    warn!(addr, val, "unhandled rx pipe register write");
                }
            }
        } else if queue_id - MAX_NB_QUEUES < MAX_NB_APPS {
            let app = (queue_id - MAX_NB_QUEUES) as usize;
            match offset {
                REG_RX_TAIL => self.rx_notif_bufs[app].tail = val,
                REG_RX_HEAD => self.rx_notif_bufs[app].head = val,
                REG_RX_MEM_LOW => self.rx_notif_bufs[app].set_low(val),
                REG_RX_MEM_HIGH => self.rx_notif_bufs[app].set_high(val),
                REG_TX_TAIL => {
                    let old_tail = self.tx_notif_bufs[app].tail;
                    self.tx_notif_bufs[app].tail = val;
                    if old_tail != val {
                        self.fetch_tx_notifs(k, app as u32, old_tail);
                    }
                }
                REG_TX_HEAD => self.tx_notif_bufs[app].head = val,
                REG_TX_MEM_LOW => self.tx_notif_bufs[app].set_low(val),
                REG_TX_MEM_HIGH => self.tx_notif_bufs[app].set_high(val),
                _ => {
                    warn!(addr, val, "unhandled notification register write");
                }
            }
        } else {
            warn!(addr, val, "register write out of range");
        }
    }

    /// DMA-read the notifications the driver just posted, in up to two
    /// pieces if the tail wrapped.
    fn fetch_tx_notifs(&mut self, k: &mut dyn Kernel<DmaTag>, queue: u32, old_tail: u32) {
        let b = &self.tx_notif_bufs[queue as usize];
        let tail = b.tail;

        let ranges: [(u32, u32); 2] = if old_tail <= tail {
            [(old_tail, tail), (0, 0)]
        } else {
            [(old_tail, NOTIFICATION_BUF_SIZE), (0, tail)]
        };

        for (from, to) in ranges {
            if from == to {
                continue;
            }
            let addr = b.buf + from as u64 * NOTIF_SIZE as u64;
            let len = (to - from) as usize * NOTIF_SIZE;
            trace!(queue, from, to, "fetching tx notifications");
            k.issue_dma(DmaOp::read(addr, len, DmaTag::TxNotifFetch { queue }));
        }
    }

    /// A batch of TX notifications arrived from host memory.
    fn tx_notifs_fetched(&mut self, k: &mut dyn Kernel<DmaTag>, base_addr: u64, data: &[u8]) {
        for (i, notif) in data.chunks_exact(NOTIF_SIZE).enumerate() {
            let completion_addr = base_addr + (i * NOTIF_SIZE) as u64;
            self.process_tx_notif(k, notif, completion_addr);
        }
    }

    fn process_tx_notif(&mut self, k: &mut dyn Kernel<DmaTag>, notif: &[u8], completion_addr: u64) {
        let signal = u64::from_le_bytes(notif[0..8].try_into().unwrap());

        match signal {
            SIGNAL_DATA => {
                let phys_addr = u64::from_le_bytes(notif[8..16].try_into().unwrap());
                let length = u64::from_le_bytes(notif[16..24].try_into().unwrap()) as usize;
                trace!(phys_addr, length, "tx data notification");
                k.issue_dma(DmaOp::read(phys_addr, length, DmaTag::TxDataFetch { completion_addr }));
            }
            SIGNAL_CONFIG => {
                self.process_config(notif);
                self.write_completion(k, notif, completion_addr);
            }
            _ => {
                warn!(signal, "invalid tx notification signal");
            }
        }
    }

    /// Turn a TX notification into its completion form (signal cleared) and
    /// write it back over the original.
    fn write_completion(&mut self, k: &mut dyn Kernel<DmaTag>, notif: &[u8], completion_addr: u64) {
        let mut compl = notif.to_vec();
        compl[0..8].copy_from_slice(&0u64.to_le_bytes());
        k.issue_dma(DmaOp::write(completion_addr, compl, DmaTag::Write));
    }

    fn process_config(&mut self, notif: &[u8]) {
        let config_id = u64::from_le_bytes(notif[8..16].try_into().unwrap());
        match config_id {
            FLOW_TABLE_CONFIG_ID => {
                let dst_port = u16::from_le_bytes(notif[16..18].try_into().unwrap());
                let src_port = u16::from_le_bytes(notif[18..20].try_into().unwrap());
                let dst_ip = u32::from_le_bytes(notif[20..24].try_into().unwrap());
                let src_ip = u32::from_le_bytes(notif[24..28].try_into().unwrap());
                let pipe_id = u32::from_le_bytes(notif[32..36].try_into().unwrap());
                self.rx_pipeline
                    .add_flow_table_entry(dst_port, src_port, dst_ip, src_ip, pipe_id);
            }
            TIMESTAMP_CONFIG_ID => {
                debug!("timestamp configuration accepted (not modeled)");
            }
            RATE_LIMIT_CONFIG_ID => {
                debug!("rate limit configuration accepted (not modeled)");
            }
            FALLBACK_QUEUES_CONFIG_ID => {
                let nb = u32::from_le_bytes(notif[16..20].try_into().unwrap());
                let mask = u32::from_le_bytes(notif[20..24].try_into().unwrap());
                let enable_rr = u64::from_le_bytes(notif[24..32].try_into().unwrap()) != 0;
                debug!(nb, mask, enable_rr, "fallback queue configuration");
                self.rx_pipeline.enable_rr = enable_rr;
                self.rx_pipeline.set_fallback_queues(nb, mask);
            }
            _ => {
                warn!(config_id, "invalid configuration id");
            }
        }
    }

    /// Copy a packet into an application pipe and notify if it was empty.
    fn dma_data(&mut self, k: &mut dyn Kernel<DmaTag>, data: &[u8], pipe_id: u32) {
        let aligned_len = (data.len() + 63) & !63;
        let flits = (aligned_len / 64) as u32;

        let buf = self.rx_bufs[pipe_id as usize];
        let free = buf.free_slots(PIPE_SIZE);
        if free < flits {
            trace!(pipe_id, flits, free, "pipe full, dropping packet");
            self.stats.pkt_drops += 1;
            return;
        }

        // the low address bits of the pipe base carry its notification
        // buffer id
        let clean_addr = buf.buf & !(MAX_NB_APPS as u64 - 1);
        let dst_addr = clean_addr + buf.tail as u64 * 64;

        let mut padded = data.to_vec();
        padded.resize(aligned_len, 0);
        k.issue_dma(DmaOp::write(dst_addr, padded, DmaTag::Write));

        let old_tail = buf.tail;
        self.rx_bufs[pipe_id as usize].tail = (buf.tail + flits) % PIPE_SIZE;

        if old_tail == buf.head {
            // pipe was empty: the application needs a notification
            self.send_rx_notif(k, pipe_id);
        }
    }

    fn send_rx_notif(&mut self, k: &mut dyn Kernel<DmaTag>, pipe_id: u32) {
        let rx_buf = self.rx_bufs[pipe_id as usize];
        let notif_queue = (rx_buf.buf & (MAX_NB_APPS as u64 - 1)) as usize;
        let nbuf = self.rx_notif_bufs[notif_queue];

        if nbuf.free_slots(PIPE_SIZE) == 0 {
            trace!(pipe_id, notif_queue, "notification buffer full");
            self.stats.notif_drops += 1;
            return;
        }

        let mut notif = vec![0u8; NOTIF_SIZE];
        notif[0..8].copy_from_slice(&1u64.to_le_bytes()); // signal
        notif[8..16].copy_from_slice(&(pipe_id as u64).to_le_bytes());
        notif[16..24].copy_from_slice(&(rx_buf.tail as u64).to_le_bytes());

        let addr = nbuf.buf + nbuf.tail as u64 * NOTIF_SIZE as u64;
        k.issue_dma(DmaOp::write(addr, notif, DmaTag::Write));

        self.rx_notif_bufs[notif_queue].tail = (nbuf.tail + 1) % NOTIFICATION_BUF_SIZE;
    }
}

impl Default for PipeNic {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for PipeNic {
    type DmaTag = DmaTag;

    fn setup_intro(&self, di: &mut PcieDevIntro) {
        di.bars[STANDARD_BAR as usize] = Bar { len: 1 << 16, flags: BAR_64 | BAR_DUMMY };
        di.bars[QUEUES_BAR as usize] = Bar { len: 1 << 30, flags: BAR_64 };

        di.vendor_id = VENDOR_ID;
        di.device_id = DEVICE_ID;
        di.class = 0x02;
        di.subclass = 0x00;
        di.revision = 0x00;
        di.msi_nvecs = 32;
    }

    fn reg_read(&mut self, _k: &mut dyn Kernel<DmaTag>, bar: u8, addr: u64, dest: &mut [u8]) {
        assert_eq!(bar, QUEUES_BAR, "read from invalid BAR {bar}");
        for (i, chunk) in dest.chunks_mut(4).enumerate() {
            let val = self.reg_read32(addr + 4 * i as u64);
            chunk.copy_from_slice(&val.to_le_bytes());
        }
    }

    fn reg_write(&mut self, k: &mut dyn Kernel<DmaTag>, bar: u8, addr: u64, src: &[u8]) {
        assert_eq!(bar, QUEUES_BAR, "write to invalid BAR {bar}");
        for (i, chunk) in src.chunks(4).enumerate() {
            let val = u32::from_le_bytes(chunk.try_into().unwrap());
            self.reg_write32(k, addr + 4 * i as u64, val);
        }
    }

    fn dma_complete(&mut self, k: &mut dyn Kernel<DmaTag>, op: DmaOp<DmaTag>) {
        match op.tag {
            DmaTag::Write => {}
            DmaTag::TxNotifFetch { queue: _ } => {
                let data = op.data;
                self.tx_notifs_fetched(k, op.addr, &data);
            }
            DmaTag::TxDataFetch { completion_addr } => {
                // data in hand: complete the notification, then cut frames
                let notif_template = {
                    let mut n = vec![0u8; NOTIF_SIZE];
                    n[8..16].copy_from_slice(&op.addr.to_le_bytes());
                    n[16..24].copy_from_slice(&(op.data.len() as u64).to_le_bytes());
                    n
                };
                self.write_completion(k, &notif_template, completion_addr);

                let data = op.data;
                let stats = &mut self.stats;
                self.tx_pipeline.enqueue_data(&data, |frame| {
                    stats.tx_pkts += 1;
                    k.eth_send(frame);
                });
            }
        }
    }

    fn eth_rx(&mut self, k: &mut dyn Kernel<DmaTag>, _port: u8, data: &[u8]) {
        self.stats.rx_pkts += 1;
        match self.rx_pipeline.steer(data) {
            Steer::Pipe(pipe) => self.dma_data(k, data, pipe),
            Steer::Drop => {
                trace!(len = data.len(), "flow director dropped packet");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nicsim_core::test_util::RecordingKernel;
    use crate::MEMORY_SPACE_PER_QUEUE as QSPACE;

    type Kern = RecordingKernel<DmaTag>;

    fn write32(dev: &mut PipeNic, k: &mut Kern, addr: u64, val: u32) {
        dev.reg_write(k, QUEUES_BAR, addr, &val.to_le_bytes());
    }

    fn read32(dev: &mut PipeNic, k: &mut Kern, addr: u64) -> u32 {
        let mut buf = [0u8; 4];
        dev.reg_read(k, QUEUES_BAR, addr, &mut buf);
        u32::from_le_bytes(buf)
    }

    /// Set up pipe 0 (notification queue id 0 in the low addr bits) and its
    /// notification buffers.
    fn setup_app(dev: &mut PipeNic, k: &mut Kern) {
        // rx pipe 0 at host 0x10000, notif queue 0
        write32(dev, k, REG_RX_MEM_LOW, 0x10000);
        write32(dev, k, REG_RX_MEM_HIGH, 0);

        let app0 = MAX_NB_QUEUES as u64 * QSPACE;
        write32(dev, k, app0 + REG_RX_MEM_LOW, 0x20000);
        write32(dev, k, app0 + REG_TX_MEM_LOW, 0x30000);
    }

    fn flow_entry_notif(dst_port: u16, pipe_id: u32) -> Vec<u8> {
        let mut n = vec![0u8; NOTIF_SIZE];
        n[0..8].copy_from_slice(&SIGNAL_CONFIG.to_le_bytes());
        n[8..16].copy_from_slice(&FLOW_TABLE_CONFIG_ID.to_le_bytes());
        n[16..18].copy_from_slice(&dst_port.to_le_bytes());
        n[32..36].copy_from_slice(&pipe_id.to_le_bytes());
        n
    }

    fn tcp_frame(dst_port: u16, payload_len: usize) -> Vec<u8> {
        let mut f = vec![0u8; 54 + payload_len];
        f[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
        f[14] = 0x45;
        f[16..18].copy_from_slice(&((40 + payload_len) as u16).to_be_bytes());
        f[23] = 6;
        f[36..38].copy_from_slice(&dst_port.to_be_bytes());
        f[46] = 0x50;
        f
    }

    #[test]
    fn test_register_window_roundtrip() {
        let mut dev = PipeNic::new();
        let mut k = Kern::new();
        setup_app(&mut dev, &mut k);

        assert_eq!(read32(&mut dev, &mut k, REG_RX_MEM_LOW), 0x10000);
        let app0 = MAX_NB_QUEUES as u64 * QSPACE;
        assert_eq!(read32(&mut dev, &mut k, app0 + REG_TX_MEM_LOW), 0x30000);
        assert_eq!(read32(&mut dev, &mut k, REG_RX_TAIL), 0);
    }

    #[test]
    fn test_config_notification_programs_flow_table() {
        let mut dev = PipeNic::new();
        let mut k = Kern::new();
        setup_app(&mut dev, &mut k);

        // driver posts one notification: bump tx tail 0 -> 1
        let app0 = MAX_NB_QUEUES as u64 * QSPACE;
        write32(&mut dev, &mut k, app0 + REG_TX_TAIL, 1);

        let op = k.pop_dma().expect("notification fetch");
        assert_eq!(op.tag, DmaTag::TxNotifFetch { queue: 0 });
        assert_eq!(op.addr, 0x30000);
        assert_eq!(op.data.len(), NOTIF_SIZE);
        let mut op = op;
        op.data = flow_entry_notif(80, 0);
        dev.dma_complete(&mut k, op);

        // completion written back with the signal cleared
        let compl = k.pop_dma().expect("completion write");
        assert_eq!(compl.tag, DmaTag::Write);
        assert_eq!(compl.addr, 0x30000);
        assert_eq!(&compl.data[0..8], &[0; 8]);

        // a matching packet now lands in pipe 0
        let frame = tcp_frame(80, 20); // 74 bytes -> 2 flits
        dev.eth_rx(&mut k, 0, &frame);
        let data = k.pop_dma().expect("packet data write");
        assert_eq!(data.addr, 0x10000);
        assert_eq!(&data.data[..frame.len()], &frame[..]);
        assert_eq!(data.data.len(), 128); // padded to flits

        // pipe was empty: an rx notification goes to the app
        let notif = k.pop_dma().expect("rx notification write");
        assert_eq!(notif.addr, 0x20000);
        assert_eq!(u64::from_le_bytes(notif.data[0..8].try_into().unwrap()), 1);
        assert_eq!(u64::from_le_bytes(notif.data[8..16].try_into().unwrap()), 0); // pipe id
        assert_eq!(u64::from_le_bytes(notif.data[16..24].try_into().unwrap()), 2); // new tail
    }

    #[test]
    fn test_unmatched_packet_dropped_without_fallback() {
        let mut dev = PipeNic::new();
        let mut k = Kern::new();
        setup_app(&mut dev, &mut k);

        dev.eth_rx(&mut k, 0, &tcp_frame(81, 10));
        assert!(k.dmas.is_empty());
        assert_eq!(dev.stats().rx_pkts, 1);
    }

    #[test]
    fn test_tx_data_notification_emits_frames() {
        let mut dev = PipeNic::new();
        let mut k = Kern::new();
        setup_app(&mut dev, &mut k);

        let app0 = MAX_NB_QUEUES as u64 * QSPACE;
        write32(&mut dev, &mut k, app0 + REG_TX_TAIL, 1);

        // data notification: 128 bytes at 0x50000
        let op = k.pop_dma().unwrap();
        let mut op = op;
        let mut n = vec![0u8; NOTIF_SIZE];
        n[0..8].copy_from_slice(&SIGNAL_DATA.to_le_bytes());
        n[8..16].copy_from_slice(&0x50000u64.to_le_bytes());
        n[16..24].copy_from_slice(&128u64.to_le_bytes());
        op.data = n;
        dev.dma_complete(&mut k, op);

        // the device reads the data buffer
        let mut data_op = k.pop_dma().expect("data fetch");
        assert_eq!(data_op.tag, DmaTag::TxDataFetch { completion_addr: 0x30000 });
        assert_eq!((data_op.addr, data_op.data.len()), (0x50000, 128));

        // two 64-byte frames in the buffer
        let mut buf = Vec::new();
        for fill in [1u8, 2] {
            let mut f = vec![fill; 64];
            f[12] = 0x08;
            f[13] = 0x00;
            f[16..18].copy_from_slice(&50u16.to_be_bytes());
            buf.extend(f);
        }
        data_op.data = buf;
        dev.dma_complete(&mut k, data_op);

        // completion goes back over the notification slot
        let compl = k.pop_dma().expect("completion write");
        assert_eq!(compl.addr, 0x30000);
        assert_eq!(&compl.data[0..8], &[0; 8]);

        let frames = k.take_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), 64);
        assert_eq!(frames[0][20], 1);
        assert_eq!(frames[1][20], 2);
        assert_eq!(dev.stats().tx_pkts, 2);
    }

    #[test]
    fn test_tx_tail_wrap_fetches_in_two_pieces() {
        let mut dev = PipeNic::new();
        let mut k = Kern::new();
        setup_app(&mut dev, &mut k);

        let app0 = MAX_NB_QUEUES as u64 * QSPACE;
        // pretend the tail sits near the end of the notification ring
        dev.tx_notif_bufs[0].tail = NOTIFICATION_BUF_SIZE - 2;
        write32(&mut dev, &mut k, app0 + REG_TX_TAIL, 3);

        let first = k.pop_dma().unwrap();
        let second = k.pop_dma().unwrap();
        assert_eq!(
            first.addr,
            0x30000 + (NOTIFICATION_BUF_SIZE as u64 - 2) * NOTIF_SIZE as u64
        );
        assert_eq!(first.data.len(), 2 * NOTIF_SIZE);
        assert_eq!(second.addr, 0x30000);
        assert_eq!(second.data.len(), 3 * NOTIF_SIZE);
    }

    #[test]
    fn test_pipe_full_drops_packet() {
        let mut dev = PipeNic::new();
        let mut k = Kern::new();
        setup_app(&mut dev, &mut k);
        // a flow entry so the packet would otherwise be delivered
        dev.rx_pipeline.add_flow_table_entry(80, 0, 0, 0, 0);

        // simulate a completely full pipe: tail one behind head
        dev.rx_bufs[0].head = 0;
        dev.rx_bufs[0].tail = PIPE_SIZE - 1;

        let mut frame = tcp_frame(80, 10);
        // make it a UDP-shaped mismatch? no: tcp with dst 80 but src/ips zero
        frame[23] = 6;
        dev.eth_rx(&mut k, 0, &frame);
        assert_eq!(dev.stats().pkt_drops, 1);
        assert!(k.dmas.is_empty());
    }
}
