//! Shared helpers for driving the device model like a driver would: program
//! registers, then play host memory by answering the recorded DMA ops.
#![allow(dead_code)]

use nicsim_40g::device::DmaTag;
use nicsim_40g::{regs, FortyGig};
use nicsim_core::kernel::Device;
use nicsim_core::test_util::RecordingKernel;
use nicsim_core::DmaOp;

pub type Kern = RecordingKernel<DmaTag>;

pub fn write32(dev: &mut FortyGig, k: &mut Kern, addr: u64, val: u32) {
    dev.reg_write(k, 0, addr, &val.to_le_bytes());
}

pub fn read32(dev: &mut FortyGig, k: &mut Kern, addr: u64) -> u32 {
    let mut buf = [0u8; 4];
    dev.reg_read(k, 0, addr, &mut buf);
    u32::from_le_bytes(buf)
}

/// Program HMC segment `idx` as a valid direct mapping to `host_addr`.
pub fn program_hmc_segment(dev: &mut FortyGig, k: &mut Kern, idx: u32, host_addr: u64) {
    write32(
        dev,
        k,
        regs::PFHMC_SDDATALOW,
        (((host_addr >> 12) as u32) << regs::PFHMC_SDDATALOW_PMSDDATALOW_SHIFT)
            | (1 << regs::PFHMC_SDDATALOW_PMSDBPCOUNT_SHIFT)
            | regs::PFHMC_SDDATALOW_PMSDVALID
            | regs::PFHMC_SDDATALOW_PMSDTYPE,
    );
    write32(dev, k, regs::PFHMC_SDDATAHIGH, (host_addr >> 32) as u32);
    write32(dev, k, regs::PFHMC_SDCMD, regs::PFHMC_SDCMD_PMSDWR | idx);
}

/// Answer a recorded DMA read with `data`.
pub fn answer_read(dev: &mut FortyGig, k: &mut Kern, mut op: DmaOp<DmaTag>, data: &[u8]) {
    assert!(!op.write, "expected a read op, got a write: {:?}", op.tag);
    assert_eq!(op.data.len(), data.len(), "length mismatch for {:?}", op.tag);
    op.data = data.to_vec();
    dev.dma_complete(k, op);
}

/// Complete a recorded DMA write.
pub fn answer_write(dev: &mut FortyGig, k: &mut Kern, op: DmaOp<DmaTag>) {
    assert!(op.write, "expected a write op, got a read: {:?}", op.tag);
    dev.dma_complete(k, op);
}

/// Build a 128-byte TX queue context.
pub fn tx_queue_ctx(base: u64, len: u16, hwb: bool, hwb_addr: u64) -> Vec<u8> {
    assert_eq!(base % 128, 0);
    let mut raw = vec![0u8; 128];
    raw[4..12].copy_from_slice(&(base / 128).to_le_bytes());
    let hwb_qlen: u16 = (len << 1) | hwb as u16;
    raw[20..22].copy_from_slice(&hwb_qlen.to_le_bytes());
    raw[24..32].copy_from_slice(&hwb_addr.to_le_bytes());
    raw
}

/// Build a 32-byte RX queue context with 16-byte descriptors.
pub fn rx_queue_ctx(base: u64, len: u16, dbuff: u16) -> Vec<u8> {
    assert_eq!(base % 128, 0);
    assert_eq!(dbuff % 128, 0);
    let mut raw = vec![0u8; 32];
    raw[4..12].copy_from_slice(&(base / 128).to_le_bytes());
    let qlen_field: u16 = len << 1;
    raw[11] = qlen_field as u8;
    let dbsz_field: u16 = ((dbuff / 128) << 6) | (qlen_field >> 8);
    raw[12] = dbsz_field as u8;
    raw[13] = (dbsz_field >> 8) as u8;
    raw
}

/// Bring up TX queue `idx`: HMC segment 0 direct at `fpm_host`, queue ring
/// at `ring_base`.
pub fn enable_tx_queue(
    dev: &mut FortyGig,
    k: &mut Kern,
    idx: usize,
    fpm_host: u64,
    ring_base: u64,
    len: u16,
    hwb: bool,
    hwb_addr: u64,
) {
    program_hmc_segment(dev, k, 0, fpm_host);
    write32(dev, k, regs::glhmc_lantxbase(0), 0);
    write32(dev, k, regs::qtx_ena(idx), regs::QENA_REQ);

    let op = k.pop_dma().expect("queue context fetch");
    assert_eq!(op.tag, DmaTag::QueueCtxFetch { rx: false, idx });
    assert_eq!(op.addr, fpm_host + 128 * idx as u64);
    let ctx = tx_queue_ctx(ring_base, len, hwb, hwb_addr);
    answer_read(dev, k, op, &ctx);

    assert!(read32(dev, k, regs::qtx_ena(idx)) & regs::QENA_STAT != 0);
}

/// Bring up RX queue `idx` analogously.
pub fn enable_rx_queue(
    dev: &mut FortyGig,
    k: &mut Kern,
    idx: usize,
    fpm_host: u64,
    ring_base: u64,
    len: u16,
    dbuff: u16,
) {
    program_hmc_segment(dev, k, 0, fpm_host);
    write32(dev, k, regs::glhmc_lanrxbase(0), 0);
    write32(dev, k, regs::qrx_ena(idx), regs::QENA_REQ);

    let op = k.pop_dma().expect("queue context fetch");
    assert_eq!(op.tag, DmaTag::QueueCtxFetch { rx: true, idx });
    assert_eq!(op.addr, fpm_host + 32 * idx as u64);
    let ctx = rx_queue_ctx(ring_base, len, dbuff);
    answer_read(dev, k, op, &ctx);

    assert!(read32(dev, k, regs::qrx_ena(idx)) & regs::QENA_STAT != 0);
}

/// 16-byte TX data descriptor.
pub fn tx_data_desc(
    addr: u64,
    len: usize,
    eop: bool,
    l4t: u16,
    maclen: usize,
    iplen: usize,
    l4len: usize,
) -> [u8; 16] {
    use nicsim_40g::lan::*;
    let mut cmd = l4t;
    if eop {
        cmd |= TX_DESC_CMD_EOP;
    }
    let qw1 = TXD_DTYPE_DATA
        | ((cmd as u64) << TXD_CMD_SHIFT)
        | (((maclen / 2) as u64) << TXD_OFFSET_MACLEN_SHIFT)
        | (((iplen / 4) as u64) << TXD_OFFSET_IPLEN_SHIFT)
        | (((l4len / 4) as u64) << TXD_OFFSET_L4LEN_SHIFT)
        | ((len as u64) << TXD_BUF_SZ_SHIFT);

    let mut d = [0u8; 16];
    d[0..8].copy_from_slice(&addr.to_le_bytes());
    d[8..16].copy_from_slice(&qw1.to_le_bytes());
    d
}

/// 16-byte TX context descriptor requesting TSO (and optionally TSYN).
pub fn tx_context_desc(mss: u16, tso: bool, tsyn: bool) -> [u8; 16] {
    use nicsim_40g::lan::*;
    let mut cmd = 0u16;
    if tso {
        cmd |= TXD_CTX_CMD_TSO;
    }
    if tsyn {
        cmd |= TXD_CTX_CMD_TSYN;
    }
    let qw1 = TXD_DTYPE_CONTEXT
        | ((cmd as u64) << TXD_CMD_SHIFT)
        | ((mss as u64) << TXD_CTX_MSS_SHIFT);

    let mut d = [0u8; 16];
    d[8..16].copy_from_slice(&qw1.to_le_bytes());
    d
}

/// 16-byte RX descriptor pointing at a packet buffer.
pub fn rx_read_desc(pkt_addr: u64) -> [u8; 16] {
    let mut d = [0u8; 16];
    d[0..8].copy_from_slice(&pkt_addr.to_le_bytes());
    d
}

/// Minimal ethernet + ipv4 + tcp frame with `payload` bytes of data.
pub fn tcp_frame(
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ip_id: u16,
    payload: &[u8],
) -> Vec<u8> {
    let mut f = vec![0u8; 54 + payload.len()];
    // ethernet
    f[0..6].copy_from_slice(&[0x52, 0x54, 0, 0, 0, 2]);
    f[6..12].copy_from_slice(&[0x52, 0x54, 0, 0, 0, 1]);
    f[12..14].copy_from_slice(&0x0800u16.to_be_bytes());
    // ipv4
    f[14] = 0x45;
    f[16..18].copy_from_slice(&((40 + payload.len()) as u16).to_be_bytes());
    f[18..20].copy_from_slice(&ip_id.to_be_bytes());
    f[22] = 64; // ttl
    f[23] = 6; // tcp
    f[26..30].copy_from_slice(&src_ip);
    f[30..34].copy_from_slice(&dst_ip);
    // tcp
    f[34..36].copy_from_slice(&src_port.to_be_bytes());
    f[36..38].copy_from_slice(&dst_port.to_be_bytes());
    f[38..42].copy_from_slice(&seq.to_be_bytes());
    f[46] = 0x50; // data offset
    f[54..].copy_from_slice(payload);
    f
}

/// Reference internet checksum (big-endian word sum, complemented).
pub fn reference_cksum(buf: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut i = 0;
    while i + 1 < buf.len() {
        sum += u16::from_be_bytes([buf[i], buf[i + 1]]) as u32;
        i += 2;
    }
    if i < buf.len() {
        sum += (buf[i] as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}
