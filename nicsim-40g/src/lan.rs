//! LAN engine: per-queue RX/TX state machines on top of the generic
//! descriptor-ring pipeline.
//!
//! Queues come up when the driver sets the enable request bit: the queue
//! context blob is fetched through the HMC, parsed, and the ring armed.
//! From then on tail writes drive the fetch/prepare/process/write-back
//! pipeline. TX assembles transmission units (optional context descriptor,
//! data descriptors up to EOP), segments them when TSO is requested, and
//! emits frames; RX scatters arriving packets over prepared descriptors and
//! writes back their completion forms.

use nicsim_core::ring::DescRing;
use nicsim_core::{DmaOp, Kernel};
use smoltcp::wire::{EthernetFrame, EthernetProtocol, Ipv4Packet, TcpPacket, UdpPacket};
use std::collections::VecDeque;
use tracing::{debug, trace};

use crate::device::{DevCtx, DmaTag};
use crate::regs::{self, Regs};
use crate::rss::RssKeyCache;
use crate::xsum;

/// TX reassembly buffer size; frames beyond this are a driver bug.
pub const MTU: usize = 9024;

const IP_PROTO_TCP: u8 = 6;
const IP_PROTO_UDP: u8 = 17;
const ETH_TYPE_PTP: u16 = 0x88F7;

// TX descriptor qword1 layout
pub const TXD_DTYPE_MASK: u64 = 0xf;
pub const TXD_DTYPE_DATA: u64 = 0x0;
pub const TXD_DTYPE_CONTEXT: u64 = 0x1;
pub const TXD_DTYPE_DESC_DONE: u64 = 0xf;
pub const TXD_CMD_SHIFT: u64 = 4;
pub const TXD_CMD_MASK: u64 = 0x3ff << 4;
pub const TX_DESC_CMD_EOP: u16 = 0x1;
pub const TX_DESC_CMD_RS: u16 = 0x2;
pub const TX_DESC_CMD_IIPT_MASK: u16 = 0x60;
pub const TX_DESC_CMD_L4T_EOFT_MASK: u16 = 0x300;
pub const TX_DESC_CMD_L4T_EOFT_TCP: u16 = 0x100;
pub const TX_DESC_CMD_L4T_EOFT_UDP: u16 = 0x300;
pub const TXD_OFFSET_MACLEN_SHIFT: u64 = 16; // 2-byte words
pub const TXD_OFFSET_MACLEN_MASK: u64 = 0x7f << 16;
pub const TXD_OFFSET_IPLEN_SHIFT: u64 = 23; // 4-byte words
pub const TXD_OFFSET_IPLEN_MASK: u64 = 0x7f << 23;
pub const TXD_OFFSET_L4LEN_SHIFT: u64 = 30; // 4-byte words
pub const TXD_OFFSET_L4LEN_MASK: u64 = 0xf << 30;
pub const TXD_BUF_SZ_SHIFT: u64 = 34;
pub const TXD_BUF_SZ_MASK: u64 = 0x3fff << 34;

// TX context descriptor qword1 layout
pub const TXD_CTX_CMD_TSO: u16 = 0x1;
pub const TXD_CTX_CMD_TSYN: u16 = 0x2;
pub const TXD_CTX_MSS_SHIFT: u64 = 50;
pub const TXD_CTX_MSS_MASK: u64 = 0x3fff << 50;

// RX write-back qword1 layout
pub const RXD_STATUS_DD: u64 = 1 << 0;
pub const RXD_STATUS_EOF: u64 = 1 << 1;
pub const RXD_STATUS_L3L4P: u64 = 1 << 3;
pub const RXD_STATUS_TSYNINDX_SHIFT: u64 = 5;
pub const RXD_STATUS_TSYNVALID: u64 = 1 << 7;
pub const RXD_LEN_PBUF_SHIFT: u64 = 38;

fn qword(bytes: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(bytes[off..off + 8].try_into().unwrap())
}

fn put_qword(bytes: &mut [u8], off: usize, v: u64) {
    bytes[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

pub struct LanManager {
    pub rxqs: Vec<RxQueue>,
    pub txqs: Vec<TxQueue>,
    pub rss: RssKeyCache,
    /// Packets dropped for lack of RX descriptors.
    pub rx_drops: u64,
}

impl LanManager {
    pub fn new(num_qs: usize) -> Self {
        LanManager {
            rxqs: (0..num_qs).map(RxQueue::new).collect(),
            txqs: (0..num_qs).map(TxQueue::new).collect(),
            rss: RssKeyCache::new(),
            rx_drops: 0,
        }
    }

    pub fn reset(&mut self) {
        self.rss.set_dirty();
        for q in &mut self.rxqs {
            q.reset();
        }
        for q in &mut self.txqs {
            q.reset();
        }
    }

    /// A queue-enable register changed.
    pub fn qena_updated(
        &mut self,
        idx: usize,
        rx: bool,
        ctx: &mut DevCtx<'_>,
        hmc: &crate::hmc::HostMemCache,
    ) {
        let reg = if rx { ctx.regs.qrx_ena[idx] } else { ctx.regs.qtx_ena[idx] };
        debug!(idx, rx, reg, "queue enable updated");

        if rx {
            let q = &mut self.rxqs[idx];
            if reg & regs::QENA_REQ != 0 && !q.ring.is_enabled() {
                q.enable(ctx, hmc);
            } else if reg & regs::QENA_REQ == 0 && q.ring.is_enabled() {
                q.disable(ctx);
            }
        } else {
            let q = &mut self.txqs[idx];
            if reg & regs::QENA_REQ != 0 && !q.ring.is_enabled() {
                q.enable(ctx, hmc);
            } else if reg & regs::QENA_REQ == 0 && q.ring.is_enabled() {
                q.disable(ctx);
            }
        }
    }

    /// A tail register changed.
    pub fn tail_updated(&mut self, idx: usize, rx: bool, ctx: &mut DevCtx<'_>) {
        if rx {
            if self.rxqs[idx].ring.is_enabled() {
                self.rxqs[idx].trigger(ctx);
            }
        } else if self.txqs[idx].ring.is_enabled() {
            self.txqs[idx].trigger(ctx);
        }
    }

    pub fn rss_key_updated(&mut self) {
        self.rss.set_dirty();
    }

    /// Pick the destination queue for an arriving packet. IPv4 packets hash
    /// through the key cache and the LUT; everything else lands on queue 0.
    fn rss_steering(&mut self, regs: &Regs, data: &[u8]) -> (usize, u32) {
        let frame = EthernetFrame::new_unchecked(data);
        if frame.ethertype() != EthernetProtocol::Ipv4 {
            return (0, 0);
        }
        let Ok(ip) = Ipv4Packet::new_checked(frame.payload()) else {
            return (0, 0);
        };
        let sip = u32::from_be_bytes(ip.src_addr().octets());
        let dip = u32::from_be_bytes(ip.dst_addr().octets());

        let hash = match u8::from(ip.next_header()) {
            IP_PROTO_TCP => match TcpPacket::new_checked(ip.payload()) {
                Ok(tcp) => self.rss.hash_ipv4(
                    &regs.pfqf_hkey,
                    sip,
                    dip,
                    tcp.src_port(),
                    tcp.dst_port(),
                ),
                Err(_) => return (0, 0),
            },
            IP_PROTO_UDP => match UdpPacket::new_checked(ip.payload()) {
                Ok(udp) => self.rss.hash_ipv4(
                    &regs.pfqf_hkey,
                    sip,
                    dip,
                    udp.src_port(),
                    udp.dst_port(),
                ),
                Err(_) => return (0, 0),
            },
            _ => self.rss.hash_ipv4(&regs.pfqf_hkey, sip, dip, 0, 0),
        };

        let luts: u32 = if regs.pfqf_ctl_0 & regs::PFQF_CTL_0_HASHLUTSIZE == 0 { 128 } else { 512 };
        let idx = (hash % luts) as usize;
        let queue = (regs.pfqf_hlut[idx / 4] >> (8 * (idx % 4))) & 0x3f;
        trace!(queue, hash, lut_idx = idx, "rss steering");
        (queue as usize, hash)
    }

    /// A frame arrived from the network simulator.
    pub fn packet_received(&mut self, data: &[u8], ctx: &mut DevCtx<'_>) {
        let (queue, hash) = self.rss_steering(ctx.regs, data);
        let dropped = !self.rxqs[queue].packet_received(data, hash, ctx);
        if dropped {
            self.rx_drops += 1;
        }
    }
}

/// Shared queue-interrupt decode: raise the configured vector after a head
/// advance, if the cause is enabled.
fn queue_interrupt(idx: usize, rx: bool, ctx: &mut DevCtx<'_>) {
    let qctl = if rx { ctx.regs.qint_rqctl[idx] } else { ctx.regs.qint_tqctl[idx] };
    let gctl = ctx.regs.pfint_dyn_ctl0;

    let cause_ena =
        qctl & regs::QINT_CTL_CAUSE_ENA != 0 && gctl & regs::PFINT_DYN_CTL0_INTENA != 0;
    if !cause_ena {
        trace!(idx, rx, "interrupt cause disabled");
        return;
    }

    let msix_idx =
        ((qctl & regs::QINT_CTL_MSIX_INDX_MASK) >> regs::QINT_CTL_MSIX_INDX_SHIFT) as u16;
    let msix0_idx = (qctl & regs::QINT_CTL_MSIX0_INDX_MASK) >> regs::QINT_CTL_MSIX0_INDX_SHIFT;

    if msix_idx == 0 {
        ctx.regs.pfint_icr0 |= regs::PFINT_ICR0_INTEVENT
            | (1 << (regs::PFINT_ICR0_QUEUE_0_SHIFT + msix0_idx));
    }

    let itr = ((qctl & regs::QINT_CTL_ITR_INDX_MASK) >> regs::QINT_CTL_ITR_INDX_SHIFT) as u8;
    ctx.ints.signal(ctx.regs, ctx.k, msix_idx, itr);
}

pub struct RxQueue {
    pub idx: usize,
    pub ring: DescRing,
    enabling: bool,
    dbuff_size: u16,
    hbuff_size: u16,
    rxmax: u32,
    crc_strip: bool,
    /// Prepared descriptors waiting for packet data, oldest first.
    dcache: VecDeque<u32>,
}

impl RxQueue {
    fn new(idx: usize) -> Self {
        RxQueue {
            idx,
            // context selects the real descriptor size; init with the larger
            ring: DescRing::new(format!("rxq{idx}"), 32),
            enabling: false,
            dbuff_size: 0,
            hbuff_size: 0,
            rxmax: 0,
            crc_strip: false,
            dcache: VecDeque::new(),
        }
    }

    pub fn reset(&mut self) {
        self.enabling = false;
        self.dcache.clear();
        self.ring.reset();
    }

    fn enable(&mut self, ctx: &mut DevCtx<'_>, hmc: &crate::hmc::HostMemCache) {
        if self.enabling || self.ring.is_enabled() {
            return;
        }
        debug!(idx = self.idx, "enabling rx queue");
        self.enabling = true;

        let fpm_base = (ctx.regs.glhmc_lanrxbase[0] & regs::GLHMC_FPMBASE_MASK) as u64 * 512;
        let addr = fpm_base + 32 * self.idx as u64;
        hmc.issue_mem_op(
            ctx.regs,
            ctx.k,
            addr,
            32,
            false,
            Vec::new(),
            DmaTag::QueueCtxFetch { rx: true, idx: self.idx },
        );
    }

    fn disable(&mut self, ctx: &mut DevCtx<'_>) {
        debug!(idx = self.idx, "disabling rx queue");
        self.ring.set_enabled(false);
        ctx.regs.qrx_ena[self.idx] &= !regs::QENA_STAT;
    }

    /// Parse the 32-byte RX queue context fetched through the HMC.
    fn initialize(&mut self, raw: &[u8]) {
        let head = u16::from_le_bytes([raw[0], raw[1]]) & ((1 << 13) - 1);
        let base = qword(raw, 4) & ((1u64 << 57) - 1);
        let qlen = u16::from_le_bytes([raw[11], raw[12]]);
        let dbsz = u16::from_le_bytes([raw[12], raw[13]]);
        let hbsz = u16::from_le_bytes([raw[13], raw[14]]);
        let rxmax = u32::from_le_bytes(raw[21..25].try_into().unwrap());

        self.ring.base = base * 128;
        self.ring.len = ((qlen >> 1) & ((1 << 13) - 1)) as u32;
        self.ring.set_head(head as u32);

        self.dbuff_size = ((dbsz >> 6) & ((1 << 7) - 1)) * 128;
        self.hbuff_size = ((hbsz >> 5) & ((1 << 5) - 1)) * 64;
        let dtype = (hbsz >> 10) & 0x3;
        let longdesc = hbsz & (1 << 12) != 0;
        self.ring.desc_len = if longdesc { 32 } else { 16 };
        self.crc_strip = hbsz & (1 << 13) != 0;
        self.rxmax = ((rxmax >> 6) & ((1 << 14) - 1)) * 128;

        assert_eq!(dtype, 0, "rx queue {}: header split not supported", self.idx);

        debug!(
            idx = self.idx,
            head,
            base = self.ring.base,
            len = self.ring.len,
            dbsz = self.dbuff_size,
            hbsz = self.hbuff_size,
            longdesc,
            crc_strip = self.crc_strip,
            rxmax = self.rxmax,
            "rx queue context"
        );
    }

    pub fn ctx_fetched(&mut self, raw: &[u8], ctx: &mut DevCtx<'_>) {
        self.initialize(raw);
        self.enabling = false;
        self.ring.set_enabled(true);
        ctx.regs.qrx_ena[self.idx] |= regs::QENA_STAT;
        self.trigger(ctx);
    }

    pub fn trigger(&mut self, ctx: &mut DevCtx<'_>) {
        self.ring.set_tail(ctx.regs.qrx_tail[self.idx]);

        if let Some(f) = self.ring.start_fetch() {
            ctx.k.issue_dma(DmaOp::read(
                f.addr,
                f.len,
                DmaTag::LanFetch { rx: true, idx: self.idx, pos: f.pos },
            ));
        }

        // prepared descriptors queue up until packets arrive
        while let Some(pos) = self.ring.next_processable() {
            self.dcache.push_back(pos);
        }

        if let Some(wb) = self.ring.start_writeback() {
            let buf = self.ring.gather_descs(wb.pos, wb.cnt);
            ctx.k.issue_dma(DmaOp::write(
                wb.addr,
                buf,
                DmaTag::LanWriteback { rx: true, idx: self.idx, pos: wb.pos, cnt: wb.cnt },
            ));
        }
    }

    pub fn fetch_done(&mut self, pos: u32, bytes: &[u8], ctx: &mut DevCtx<'_>) {
        for p in self.ring.fetch_done(pos, bytes) {
            self.ring.prepared(p);
        }
        self.trigger(ctx);
    }

    /// Should this packet sample an RX timestamp? Decodes the PTP
    /// classification in `PRTTSYN_CTL1` against PTP-over-UDP (ports 319 and
    /// 320) and PTP-over-Ethernet frames.
    fn ptp_rx_sample(&self, regs: &Regs, data: &[u8]) -> bool {
        let ctl1 = regs.prtsyn_ctl_1;
        if ctl1 & regs::PRTTSYN_CTL1_TSYNENA == 0 {
            return false;
        }

        let tsyntype =
            (ctl1 & regs::PRTTSYN_CTL1_TSYNTYPE_MASK) >> regs::PRTTSYN_CTL1_TSYNTYPE_SHIFT;
        let udp_ena = (ctl1 & regs::PRTTSYN_CTL1_UDP_ENA_MASK) >> regs::PRTTSYN_CTL1_UDP_ENA_SHIFT;
        let v1msg0 =
            ((ctl1 & regs::PRTTSYN_CTL1_V1MESSTYPE0_MASK) >> regs::PRTTSYN_CTL1_V1MESSTYPE0_SHIFT) as u8;
        let v1msg1 =
            ((ctl1 & regs::PRTTSYN_CTL1_V1MESSTYPE1_MASK) >> regs::PRTTSYN_CTL1_V1MESSTYPE1_SHIFT) as u8;
        let v2msg0 =
            ((ctl1 & regs::PRTTSYN_CTL1_V2MESSTYPE0_MASK) >> regs::PRTTSYN_CTL1_V2MESSTYPE0_SHIFT) as u8;
        let v2msg1 =
            ((ctl1 & regs::PRTTSYN_CTL1_V2MESSTYPE1_MASK) >> regs::PRTTSYN_CTL1_V2MESSTYPE1_SHIFT) as u8;

        let frame = EthernetFrame::new_unchecked(data);
        let (ptp, is_udp) = match frame.ethertype() {
            EthernetProtocol::Ipv4 => {
                let Ok(ip) = Ipv4Packet::new_checked(frame.payload()) else {
                    return false;
                };
                if u8::from(ip.next_header()) != IP_PROTO_UDP {
                    return false;
                }
                // no udp packet types enabled
                if tsyntype == 0 {
                    return false;
                }
                let Ok(udp) = UdpPacket::new_checked(ip.payload()) else {
                    return false;
                };
                let port = udp.dst_port();
                if !(port == 0x013F && (udp_ena == 1 || udp_ena == 3))
                    && !(port == 0x0140 && (udp_ena == 2 || udp_ena == 3))
                {
                    return false;
                }
                (udp.payload().to_vec(), true)
            }
            EthernetProtocol::Unknown(t) if t == ETH_TYPE_PTP => (data[14..].to_vec(), false),
            _ => return false,
        };

        if ptp.len() < 34 {
            return false;
        }
        let v1_version = u16::from_be_bytes([ptp[0], ptp[1]]);
        let v2_version = ptp[1] & 0x0f;

        if v1_version == 1 {
            // v1 message type lives in the control field
            if tsyntype != 1 {
                return false;
            }
            let msg_type = ptp[32];
            if v1msg0 == 0xff || v1msg1 == 0xff {
                return true;
            }
            return msg_type == v1msg0 || msg_type == v1msg1;
        } else if v2_version == 2 {
            if tsyntype == 1 {
                return false;
            }
            if tsyntype == 0 && is_udp {
                return false;
            }
            let msg_type = ptp[0] & 0x0f;
            if tsyntype == 3 {
                return msg_type < 8;
            }
            if v2msg0 == 0xf {
                return true;
            }
            return msg_type == v2msg0 || msg_type == v2msg1;
        }

        false
    }

    /// Deliver a packet into this queue. Returns false when it had to be
    /// dropped for lack of prepared descriptors.
    pub fn packet_received(&mut self, data: &[u8], _hash: u32, ctx: &mut DevCtx<'_>) -> bool {
        if !self.ring.is_enabled() {
            return false;
        }
        let num_descs = data.len().div_ceil(self.dbuff_size as usize);
        if self.dcache.len() < num_descs {
            trace!(idx = self.idx, need = num_descs, have = self.dcache.len(), "rx drop");
            return false;
        }

        // sample a PTP rx timestamp if enabled, the packet matches, and a
        // free timestamp register exists
        let mut rxtime_id = None;
        if self.ptp_rx_sample(ctx.regs, data) {
            for i in 0..4 {
                if !ctx.regs.prtsyn_rxtime_lock[i] {
                    ctx.regs.prtsyn_rxtime[i] = ctx.ptp.phc_read(ctx.k.time_ps());
                    ctx.regs.prtsyn_rxtime_lock[i] = true;
                    ctx.regs.prtsyn_stat_1 |= 1 << (regs::PRTTSYN_STAT_1_RXT0_SHIFT + i as u32);
                    rxtime_id = Some(i as u64);
                    break;
                }
            }
        }

        for i in 0..num_descs {
            let pos = self.dcache.pop_front().expect("dcache underflow");
            let last = i == num_descs - 1;
            let seg =
                &data[i * self.dbuff_size as usize..((i + 1) * self.dbuff_size as usize).min(data.len())];

            let desc = &mut self.ring.ctx_mut(pos).desc;
            let pkt_addr = qword(desc, 0);

            // build the write-back form in place
            desc.iter_mut().for_each(|b| *b = 0);
            let mut qw1 = RXD_STATUS_DD | (seg.len() as u64) << RXD_LEN_PBUF_SHIFT;
            if last {
                qw1 |= RXD_STATUS_EOF;
                // checksum validation stub: always passes
                qw1 |= RXD_STATUS_L3L4P;
                if let Some(id) = rxtime_id {
                    qw1 |= id << RXD_STATUS_TSYNINDX_SHIFT | RXD_STATUS_TSYNVALID;
                }
            }
            put_qword(desc, 8, qw1);

            ctx.k.issue_dma(DmaOp::write(
                pkt_addr,
                seg.to_vec(),
                DmaTag::LanDataWrite { rx: true, idx: self.idx, pos },
            ));
        }
        true
    }

    pub fn data_write_done(&mut self, pos: u32, ctx: &mut DevCtx<'_>) {
        self.ring.processed(pos);
        self.trigger(ctx);
    }

    pub fn writeback_done(&mut self, pos: u32, cnt: u32, ctx: &mut DevCtx<'_>) {
        if self.ring.writeback_done(pos, cnt).is_some() {
            queue_interrupt(self.idx, true, ctx);
        }
        self.trigger(ctx);
    }
}

pub struct TxQueue {
    pub idx: usize,
    pub ring: DescRing,
    enabling: bool,
    hwb: bool,
    hwb_addr: u64,
    /// Prepared descriptors of (partial) transmission units, ring order.
    ready: VecDeque<u32>,
    tso_off: usize,
    tso_len: usize,
    pktbuf: Vec<u8>,
}

impl TxQueue {
    fn new(idx: usize) -> Self {
        TxQueue {
            idx,
            ring: DescRing::new(format!("txq{idx}"), 16),
            enabling: false,
            hwb: false,
            hwb_addr: 0,
            ready: VecDeque::new(),
            tso_off: 0,
            tso_len: 0,
            pktbuf: vec![0; MTU],
        }
    }

    pub fn reset(&mut self) {
        self.enabling = false;
        self.hwb = false;
        self.hwb_addr = 0;
        self.ready.clear();
        self.tso_off = 0;
        self.tso_len = 0;
        self.ring.reset();
    }

    fn enable(&mut self, ctx: &mut DevCtx<'_>, hmc: &crate::hmc::HostMemCache) {
        if self.enabling || self.ring.is_enabled() {
            return;
        }
        debug!(idx = self.idx, "enabling tx queue");
        self.enabling = true;

        let fpm_base = (ctx.regs.glhmc_lantxbase[0] & regs::GLHMC_FPMBASE_MASK) as u64 * 512;
        let addr = fpm_base + 128 * self.idx as u64;
        hmc.issue_mem_op(
            ctx.regs,
            ctx.k,
            addr,
            128,
            false,
            Vec::new(),
            DmaTag::QueueCtxFetch { rx: false, idx: self.idx },
        );
    }

    fn disable(&mut self, ctx: &mut DevCtx<'_>) {
        debug!(idx = self.idx, "disabling tx queue");
        self.ring.set_enabled(false);
        ctx.regs.qtx_ena[self.idx] &= !regs::QENA_STAT;
    }

    /// Parse the 128-byte TX queue context fetched through the HMC.
    fn initialize(&mut self, raw: &[u8]) {
        let head = u16::from_le_bytes([raw[0], raw[1]]) & ((1 << 13) - 1);
        let base = qword(raw, 4) & ((1u64 << 57) - 1);
        let hwb_qlen = u16::from_le_bytes([raw[20], raw[21]]);
        let hwb_addr = qword(raw, 24);

        self.ring.base = base * 128;
        self.ring.len = ((hwb_qlen >> 1) & ((1 << 13) - 1)) as u32;
        self.ring.set_head(head as u32);
        self.hwb = hwb_qlen & 1 != 0;
        self.hwb_addr = hwb_addr;

        debug!(
            idx = self.idx,
            head,
            base = self.ring.base,
            len = self.ring.len,
            hwb = self.hwb,
            hwb_addr = self.hwb_addr,
            "tx queue context"
        );
    }

    pub fn ctx_fetched(&mut self, raw: &[u8], ctx: &mut DevCtx<'_>) {
        self.initialize(raw);
        self.enabling = false;
        self.ring.set_enabled(true);
        ctx.regs.qtx_ena[self.idx] |= regs::QENA_STAT;
        self.trigger(ctx);
    }

    pub fn trigger(&mut self, ctx: &mut DevCtx<'_>) {
        self.ring.set_tail(ctx.regs.qtx_tail[self.idx]);

        if let Some(f) = self.ring.start_fetch() {
            ctx.k.issue_dma(DmaOp::read(
                f.addr,
                f.len,
                DmaTag::LanFetch { rx: false, idx: self.idx, pos: f.pos },
            ));
        }

        while let Some(pos) = self.ring.next_processable() {
            self.ready.push_back(pos);
        }
        self.trigger_tx(ctx);

        if let Some(wb) = self.ring.start_writeback() {
            if self.hwb {
                // head write-back: only the new head index goes to the host
                let next_head = (wb.idx + wb.cnt) % self.ring.len;
                ctx.k.issue_dma(DmaOp::write(
                    self.hwb_addr,
                    next_head.to_le_bytes().to_vec(),
                    DmaTag::TxHeadWriteback { idx: self.idx, pos: wb.pos, cnt: wb.cnt },
                ));
            } else {
                let buf = self.ring.gather_descs(wb.pos, wb.cnt);
                ctx.k.issue_dma(DmaOp::write(
                    wb.addr,
                    buf,
                    DmaTag::LanWriteback { rx: false, idx: self.idx, pos: wb.pos, cnt: wb.cnt },
                ));
            }
        }
    }

    pub fn fetch_done(&mut self, pos: u32, bytes: &[u8], ctx: &mut DevCtx<'_>) {
        for p in self.ring.fetch_done(pos, bytes) {
            self.prepare(p, ctx);
        }
        self.trigger(ctx);
    }

    fn prepare(&mut self, pos: u32, ctx: &mut DevCtx<'_>) {
        let d1 = qword(&self.ring.ctx(pos).desc, 8);
        let dtype = d1 & TXD_DTYPE_MASK;

        if dtype == TXD_DTYPE_DATA {
            let len = ((d1 & TXD_BUF_SZ_MASK) >> TXD_BUF_SZ_SHIFT) as usize;
            let addr = qword(&self.ring.ctx(pos).desc, 0);
            trace!(idx = self.idx, pos, addr, len, "fetching tx buffer");
            ctx.k.issue_dma(DmaOp::read(
                addr,
                len,
                DmaTag::LanDataFetch { rx: false, idx: self.idx, pos },
            ));
        } else if dtype == TXD_DTYPE_CONTEXT {
            self.ring.prepared(pos);
        } else {
            panic!("tx queue {}: unsupported descriptor type {dtype}", self.idx);
        }
    }

    pub fn data_fetch_done(&mut self, pos: u32, data: Vec<u8>, ctx: &mut DevCtx<'_>) {
        self.ring.ctx_mut(pos).data = data;
        self.ring.prepared(pos);
        self.trigger(ctx);
    }

    fn trigger_tx(&mut self, ctx: &mut DevCtx<'_>) {
        while self.trigger_tx_packet(ctx) {}
    }

    /// Try to emit one frame from the queued-up descriptors: either a whole
    /// non-TSO unit or the next TSO segment. Returns true if progress was
    /// made.
    fn trigger_tx_packet(&mut self, ctx: &mut DevCtx<'_>) -> bool {
        let n = self.ready.len();
        if n == 0 {
            return false;
        }

        // leading context descriptor?
        let mut d_skip = 0usize;
        let mut tso = false;
        let mut tsyn = false;
        let mut tso_mss = 0usize;
        let first_d1 = qword(&self.ring.ctx(self.ready[0]).desc, 8);
        if first_d1 & TXD_DTYPE_MASK == TXD_DTYPE_CONTEXT {
            let cmd = ((first_d1 & TXD_CMD_MASK) >> TXD_CMD_SHIFT) as u16;
            tso = cmd & TXD_CTX_CMD_TSO != 0;
            tsyn = cmd & TXD_CTX_CMD_TSYN != 0;
            tso_mss = ((first_d1 & TXD_CTX_MSS_MASK) >> TXD_CTX_MSS_SHIFT) as usize;
            d_skip = 1;
        }

        // walk data descriptors up to EOP
        let mut eop = false;
        let mut total_len = 0usize;
        let mut l4t = 0u16;
        let mut maclen = 0usize;
        let mut iplen = 0usize;
        let mut l4len = 0usize;
        let mut dcnt = d_skip;
        while dcnt < n && !eop {
            let d1 = qword(&self.ring.ctx(self.ready[dcnt]).desc, 8);
            assert_eq!(
                d1 & TXD_DTYPE_MASK,
                TXD_DTYPE_DATA,
                "tx queue {}: expected data descriptor",
                self.idx
            );

            let cmd = ((d1 & TXD_CMD_MASK) >> TXD_CMD_SHIFT) as u16;
            eop = cmd & TX_DESC_CMD_EOP != 0;
            if eop {
                l4t = cmd & TX_DESC_CMD_L4T_EOFT_MASK;
                maclen = (((d1 & TXD_OFFSET_MACLEN_MASK) >> TXD_OFFSET_MACLEN_SHIFT) as usize) * 2;
                iplen = (((d1 & TXD_OFFSET_IPLEN_MASK) >> TXD_OFFSET_IPLEN_SHIFT) as usize) * 4;
                l4len = (((d1 & TXD_OFFSET_L4LEN_MASK) >> TXD_OFFSET_L4LEN_SHIFT) as usize) * 4;
            }
            total_len += ((d1 & TXD_BUF_SZ_MASK) >> TXD_BUF_SZ_SHIFT) as usize;
            dcnt += 1;
        }

        // unit not completely fetched yet
        if !eop {
            return false;
        }

        let data_limit = if tso {
            let limit = if self.tso_off == 0 {
                maclen + iplen + l4len + tso_mss
            } else {
                self.tso_off + tso_mss
            };
            limit.min(total_len)
        } else {
            assert!(
                total_len <= MTU,
                "tx queue {}: packet of {total_len} bytes exceeds the reassembly buffer",
                self.idx
            );
            total_len
        };

        // copy this segment's bytes out of the data descriptors
        let mut off = 0usize;
        for i in d_skip..dcnt {
            let c = self.ring.ctx(self.ready[i]);
            let pkt_len = ((qword(&c.desc, 8) & TXD_BUF_SZ_MASK) >> TXD_BUF_SZ_SHIFT) as usize;

            if off <= self.tso_off && off + pkt_len > self.tso_off {
                let start = self.tso_off;
                let end = (off + pkt_len).min(data_limit);
                self.pktbuf[self.tso_len..self.tso_len + (end - start)]
                    .copy_from_slice(&c.data[start - off..end - off]);
                self.tso_off = end;
                self.tso_len += end - start;
            }
            off += pkt_len;
        }
        assert!(self.tso_len <= MTU);

        if !tso {
            if l4t == TX_DESC_CMD_L4T_EOFT_TCP {
                let tcp_off = maclen + iplen;
                xsum::xsum_tcp(&mut self.pktbuf[tcp_off..self.tso_len]);
            } else if l4t == TX_DESC_CMD_L4T_EOFT_UDP {
                let udp_off = maclen + iplen;
                xsum::xsum_udp(&mut self.pktbuf[udp_off..self.tso_len]);
            }
            ctx.k.eth_send(&self.pktbuf[..self.tso_len]);
        } else {
            let hdrlen = maclen + iplen + l4len;
            let tso_paylen = (self.tso_len - hdrlen).min(tso_mss);

            xsum::xsum_tcpip_tso(&mut self.pktbuf[maclen..self.tso_len], iplen, l4len, tso_paylen);
            ctx.k.eth_send(&self.pktbuf[..self.tso_len]);
            xsum::tso_postupdate_header(&mut self.pktbuf[maclen..], iplen, tso_paylen);

            // not done with this unit yet: keep the headers, continue
            if self.tso_off < total_len {
                self.tso_len = hdrlen;
                return true;
            }
        }

        // PTP transmit timestamping
        if tsyn {
            ctx.regs.prtsyn_txtime = ctx.ptp.phc_read(ctx.k.time_ps());
            ctx.regs.prtsyn_stat_0 |= regs::PRTTSYN_STAT_0_TXTIME;
            if ctx.regs.prtsyn_ctl_0 & regs::PRTTSYN_CTL0_TXTIME_INT_ENA != 0
                && ctx.regs.pfint_icr0_ena & regs::PFINT_ICR0_ENA_TIMESYNC != 0
            {
                ctx.regs.pfint_icr0 |= regs::PFINT_ICR0_INTEVENT | regs::PFINT_ICR0_TIMESYNC;
                ctx.ints.signal(ctx.regs, ctx.k, 0, 0);
            }
        }

        // unit done: mark all its descriptors for the driver
        for _ in 0..dcnt {
            let pos = self.ready.pop_front().expect("ready underflow");
            put_qword(&mut self.ring.ctx_mut(pos).desc, 8, TXD_DTYPE_DESC_DONE);
            self.ring.processed(pos);
        }
        self.tso_len = 0;
        self.tso_off = 0;
        true
    }

    pub fn writeback_done(&mut self, pos: u32, cnt: u32, ctx: &mut DevCtx<'_>) {
        if self.ring.writeback_done(pos, cnt).is_some() {
            queue_interrupt(self.idx, false, ctx);
        }
        self.trigger(ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rx_context_parse() {
        let mut q = RxQueue::new(0);
        let mut raw = vec![0u8; 32];
        raw[0..2].copy_from_slice(&5u16.to_le_bytes()); // head
        // base address field (units of 128 bytes)
        raw[4..12].copy_from_slice(&(0x1234u64).to_le_bytes());
        // qlen at byte 11 overlaps the base field; rebuild both
        let qlen_field: u16 = 64 << 1;
        raw[11] = qlen_field as u8;
        raw[12] = (qlen_field >> 8) as u8;
        // dbsz: 2048/128 = 16 at shift 6 of the u16 at offset 12
        let dbsz_field: u16 = (16 << 6) | (raw[12] as u16);
        raw[12] = dbsz_field as u8;
        raw[13] = (dbsz_field >> 8) as u8;

        q.initialize(&raw);
        assert_eq!(q.ring.len, 64);
        assert_eq!(q.ring.head(), 5);
        assert_eq!(q.dbuff_size, 2048);
        assert_eq!(q.ring.desc_len, 16);
    }

    #[test]
    fn test_tx_context_parse_hwb() {
        let mut q = TxQueue::new(0);
        let mut raw = vec![0u8; 128];
        raw[0..2].copy_from_slice(&0u16.to_le_bytes());
        raw[4..12].copy_from_slice(&(0x10u64).to_le_bytes()); // base = 0x10 * 128
        let hwb_qlen: u16 = (128 << 1) | 1;
        raw[20..22].copy_from_slice(&hwb_qlen.to_le_bytes());
        raw[24..32].copy_from_slice(&0xdead_f000u64.to_le_bytes());

        q.initialize(&raw);
        assert_eq!(q.ring.base, 0x10 * 128);
        assert_eq!(q.ring.len, 128);
        assert!(q.hwb);
        assert_eq!(q.hwb_addr, 0xdead_f000);
    }
}
