//! Admin command queue.
//!
//! A TX-only descriptor ring of 32-byte commands. Commands with the RD flag
//! carry an indirect buffer that is fetched before processing; responses
//! complete in place (flags, retval, optionally a rewritten indirect
//! buffer) and the descriptor is written back. Unknown opcodes complete
//! successfully so drivers that probe newer commands keep working.

use nicsim_core::ring::DescRing;
use nicsim_core::{DmaOp, Kernel};
use tracing::{debug, trace};

use crate::device::DmaTag;
use crate::regs::{self, Regs};
use crate::{MAX_MTU, NUM_PFINTS, NUM_QUEUES, NUM_VSIS};

// descriptor flags
pub const AQ_FLAG_DD: u16 = 1 << 0;
pub const AQ_FLAG_CMP: u16 = 1 << 1;
pub const AQ_FLAG_ERR: u16 = 1 << 2;
pub const AQ_FLAG_LB: u16 = 1 << 9;
pub const AQ_FLAG_RD: u16 = 1 << 10;
pub const AQ_FLAG_BUF: u16 = 1 << 12;

// return codes
pub const AQ_RC_OK: u16 = 0;
pub const AQ_RC_ENOMEM: u16 = 9;

// opcodes
pub const AQC_GET_VERSION: u16 = 0x0001;
pub const AQC_REQUEST_RESOURCE: u16 = 0x0008;
pub const AQC_RELEASE_RESOURCE: u16 = 0x0009;
pub const AQC_LIST_FUNC_CAPABILITIES: u16 = 0x000A;
pub const AQC_LIST_DEV_CAPABILITIES: u16 = 0x000B;
pub const AQC_MAC_ADDRESS_READ: u16 = 0x0107;
pub const AQC_CLEAR_PXE_MODE: u16 = 0x0110;
pub const AQC_GET_SWITCH_CONFIG: u16 = 0x0200;
pub const AQC_SET_SWITCH_CONFIG: u16 = 0x0205;
pub const AQC_REMOVE_MACVLAN: u16 = 0x0251;
pub const AQC_SET_DCB_PARAMETERS: u16 = 0x0303;
pub const AQC_UPDATE_VSI_PARAMETERS: u16 = 0x0211;
pub const AQC_GET_VSI_PARAMETERS: u16 = 0x0212;
pub const AQC_CONFIGURE_VSI_BW_LIMIT: u16 = 0x0400;
pub const AQC_QUERY_VSI_BW_CONFIG: u16 = 0x0408;
pub const AQC_QUERY_VSI_ETS_SLA_CONFIG: u16 = 0x040A;
pub const AQC_GET_PHY_ABILITIES: u16 = 0x0600;
pub const AQC_GET_LINK_STATUS: u16 = 0x0607;
pub const AQC_LLDP_STOP: u16 = 0x0A05;

// capability ids
pub const AQ_CAP_ID_VSI: u16 = 0x0017;
pub const AQ_CAP_ID_DCB: u16 = 0x0018;
pub const AQ_CAP_ID_RSS: u16 = 0x0040;
pub const AQ_CAP_ID_RXQ: u16 = 0x0041;
pub const AQ_CAP_ID_TXQ: u16 = 0x0042;
pub const AQ_CAP_ID_MSIX: u16 = 0x0043;

// link reporting
pub const PHY_TYPE_40GBASE_CR4_CU: u32 = 24;
pub const LINK_SPEED_40GB: u8 = 0x10;
pub const AQ_PHY_LINK_ENABLED: u8 = 0x08;
pub const AQ_PHY_AN_ENABLED: u8 = 0x04;
pub const AQ_LSE_IS_ENABLED: u16 = 0x01;
pub const AQ_LINK_UP_FUNCTION: u8 = 0x01;
pub const AQ_LINK_UP_PORT: u8 = 0x02;
pub const AQ_MEDIA_AVAILABLE: u8 = 0x04;
pub const AQ_SIGNAL_DETECT: u8 = 0x08;
pub const AQ_AN_COMPLETED: u8 = 0x01;
pub const AQ_LP_AN_ABILITY: u8 = 0x02;
pub const AQ_CONFIG_CRC_ENA: u8 = 0x04;
pub const AQ_PWR_CLASS_4: u8 = 3;
pub const AQ_PWR_CLASS_SHIFT_LB: u8 = 6;

// mac address read
pub const AQC_LAN_ADDR_VALID: u16 = 0x10;
pub const AQC_PORT_ADDR_VALID: u16 = 0x40;

// switch config
pub const AQ_SW_ELEM_TYPE_VSI: u8 = 19;
pub const AQ_SW_ELEM_REV_1: u8 = 1;
pub const AQ_CONN_TYPE_REGULAR: u8 = 1;

pub const FW_API_MAJOR: u16 = 1;
pub const FW_API_MINOR: u16 = 12;

const DESC_LEN: usize = 32;

fn get16(d: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([d[off], d[off + 1]])
}

fn put16(d: &mut [u8], off: usize, v: u16) {
    d[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

fn put32(d: &mut [u8], off: usize, v: u32) {
    d[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn get32(d: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(d[off..off + 4].try_into().unwrap())
}

/// Indirect buffer address from the external params area.
fn ext_addr(d: &[u8]) -> u64 {
    let hi = get32(d, 24) as u64;
    let lo = get32(d, 28) as u64;
    (hi << 32) | lo
}

pub struct AdminQueue {
    pub ring: DescRing,
}

impl AdminQueue {
    pub fn new() -> Self {
        AdminQueue { ring: DescRing::new("atx", DESC_LEN) }
    }

    pub fn reset(&mut self) {
        self.ring.reset();
    }

    /// Any of the ATQ registers changed: refresh geometry, enable state and
    /// tail, then run the pipeline.
    pub fn reg_updated(&mut self, regs: &mut Regs, k: &mut dyn Kernel<DmaTag>) {
        self.ring.base = regs.pf_atqba;
        self.ring.len = regs.pf_atqlen & regs::ATQLEN_LEN_MASK;

        let enable = regs.pf_atqlen & regs::ATQLEN_ENABLE != 0;
        if enable && !self.ring.is_enabled() {
            debug!(base = self.ring.base, len = self.ring.len, "admin queue enabled");
            self.ring.set_enabled(true);
        } else if !enable && self.ring.is_enabled() {
            debug!("admin queue disabled");
            self.ring.set_enabled(false);
        }

        self.trigger(regs, k);
    }

    fn trigger(&mut self, regs: &mut Regs, k: &mut dyn Kernel<DmaTag>) {
        self.ring.set_tail(regs.pf_atqt);

        if let Some(f) = self.ring.start_fetch() {
            k.issue_dma(DmaOp::read(f.addr, f.len, DmaTag::AtqFetch { pos: f.pos }));
        }

        while let Some(pos) = self.ring.next_processable() {
            self.process(pos, regs, k);
        }

        if let Some(wb) = self.ring.start_writeback() {
            let buf = self.ring.gather_descs(wb.pos, wb.cnt);
            k.issue_dma(DmaOp::write(
                wb.addr,
                buf,
                DmaTag::AtqWriteback { pos: wb.pos, cnt: wb.cnt },
            ));
        }
    }

    pub fn fetch_done(&mut self, pos: u32, bytes: &[u8], regs: &mut Regs, k: &mut dyn Kernel<DmaTag>) {
        for p in self.ring.fetch_done(pos, bytes) {
            // commands with an indirect buffer fetch it before processing
            let d = &self.ring.ctx(p).desc;
            let flags = get16(d, 0);
            if flags & AQ_FLAG_RD != 0 {
                let addr = ext_addr(d);
                let len = get16(d, 4) as usize;
                trace!(pos = p, addr, len, "fetching admin indirect buffer");
                k.issue_dma(DmaOp::read(addr, len, DmaTag::AtqDataFetch { pos: p }));
            } else {
                self.ring.prepared(p);
            }
        }
        self.trigger(regs, k);
    }

    pub fn data_fetch_done(
        &mut self,
        pos: u32,
        data: Vec<u8>,
        regs: &mut Regs,
        k: &mut dyn Kernel<DmaTag>,
    ) {
        self.ring.ctx_mut(pos).data = data;
        self.ring.prepared(pos);
        self.trigger(regs, k);
    }

    pub fn data_write_done(&mut self, pos: u32, regs: &mut Regs, k: &mut dyn Kernel<DmaTag>) {
        self.ring.processed(pos);
        self.trigger(regs, k);
    }

    pub fn writeback_done(&mut self, pos: u32, cnt: u32, regs: &mut Regs, k: &mut dyn Kernel<DmaTag>) {
        if let Some(head) = self.ring.writeback_done(pos, cnt) {
            regs.pf_atqh = head;
        }
        self.trigger(regs, k);
    }

    /// Fill in completion flags and retval without finishing the command.
    fn compl_prepare(&mut self, pos: u32, retval: u16, extra_flags: u16) {
        let d = &mut self.ring.ctx_mut(pos).desc;
        let mut flags = get16(d, 0);
        flags &= !0x1ff;
        flags |= AQ_FLAG_DD | AQ_FLAG_CMP | extra_flags;
        if retval != 0 {
            flags |= AQ_FLAG_ERR;
        }
        put16(d, 0, flags);
        put16(d, 6, retval);
        trace!(pos, retval, "admin command completed");
    }

    /// Complete a direct command.
    fn complete(&mut self, pos: u32, retval: u16) {
        self.compl_prepare(pos, retval, 0);
        self.ring.processed(pos);
    }

    /// Complete a command with an indirect response buffer. The descriptor
    /// is only processed once the buffer write lands in host memory.
    fn complete_indir(
        &mut self,
        pos: u32,
        retval: u16,
        data: &[u8],
        ignore_datalen: bool,
        k: &mut dyn Kernel<DmaTag>,
    ) {
        let datalen = get16(&self.ring.ctx(pos).desc, 4) as usize;
        assert!(
            ignore_datalen || data.len() <= datalen,
            "admin response of {} bytes exceeds the {} byte buffer",
            data.len(),
            datalen
        );

        let addr = ext_addr(&self.ring.ctx(pos).desc);
        put16(&mut self.ring.ctx_mut(pos).desc, 4, data.len() as u16);
        self.compl_prepare(pos, retval, AQ_FLAG_BUF);
        k.issue_dma(DmaOp::write(addr, data.to_vec(), DmaTag::AtqDataWrite { pos }));
    }

    fn process(&mut self, pos: u32, regs: &mut Regs, k: &mut dyn Kernel<DmaTag>) {
        let d = self.ring.ctx(pos).desc.clone();
        let opcode = get16(&d, 2);
        let datalen = get16(&d, 4) as usize;
        debug!(pos, opcode, "admin command");

        match opcode {
            AQC_GET_VERSION => {
                let d = &mut self.ring.ctx_mut(pos).desc;
                put32(d, 16, 0); // rom_ver
                put32(d, 20, 0); // fw_build
                put16(d, 24, 0); // fw_major
                put16(d, 26, 0); // fw_minor
                put16(d, 28, FW_API_MAJOR);
                put16(d, 30, FW_API_MINOR);
                self.complete(pos, AQ_RC_OK);
            }
            AQC_REQUEST_RESOURCE => {
                let d = &mut self.ring.ctx_mut(pos).desc;
                put32(d, 20, 180_000); // timeout
                self.complete(pos, AQ_RC_OK);
            }
            AQC_RELEASE_RESOURCE => self.complete(pos, AQ_RC_OK),
            AQC_CLEAR_PXE_MODE => {
                regs.gllan_rctl_0 &= !regs::GLLAN_RCTL_0_PXE_MODE;
                self.complete(pos, AQ_RC_OK);
            }
            AQC_LIST_FUNC_CAPABILITIES | AQC_LIST_DEV_CAPABILITIES => {
                // {id, major, minor, number, logical, phys}
                let caps: &[(u16, u8, u8, u32, u32, u32)] = &[
                    (AQ_CAP_ID_RSS, 1, 0, 512, 6, 0),
                    (AQ_CAP_ID_RXQ, 1, 0, NUM_QUEUES as u32, 0, 0),
                    (AQ_CAP_ID_TXQ, 1, 0, NUM_QUEUES as u32, 0, 0),
                    (AQ_CAP_ID_MSIX, 1, 0, NUM_PFINTS as u32, 0, 0),
                    (AQ_CAP_ID_VSI, 1, 0, NUM_VSIS as u32, 0, 0),
                    (AQ_CAP_ID_DCB, 1, 0, 1, 1, 1),
                ];
                let mut buf = Vec::with_capacity(caps.len() * 32);
                for &(id, major, minor, number, logical, phys) in caps {
                    let mut e = [0u8; 32];
                    put16(&mut e, 0, id);
                    e[2] = major;
                    e[3] = minor;
                    put32(&mut e, 4, number);
                    put32(&mut e, 8, logical);
                    put32(&mut e, 12, phys);
                    buf.extend_from_slice(&e);
                }

                if buf.len() <= datalen {
                    let d = &mut self.ring.ctx_mut(pos).desc;
                    put32(d, 16, caps.len() as u32); // count
                    self.complete_indir(pos, AQ_RC_OK, &buf, false, k);
                } else {
                    // buffer too small: report the required size
                    let d = &mut self.ring.ctx_mut(pos).desc;
                    put16(d, 4, buf.len() as u16);
                    self.complete(pos, AQ_RC_ENOMEM);
                }
            }
            AQC_LLDP_STOP => self.complete(pos, AQ_RC_OK),
            AQC_MAC_ADDRESS_READ => {
                let mac = k.mac_addr();
                let mac_bytes = [
                    (mac >> 40) as u8,
                    (mac >> 32) as u8,
                    (mac >> 24) as u8,
                    (mac >> 16) as u8,
                    (mac >> 8) as u8,
                    mac as u8,
                ];
                let mut data = [0u8; 24];
                data[0..6].copy_from_slice(&mac_bytes); // pf lan mac
                data[12..18].copy_from_slice(&mac_bytes); // port mac

                let d = &mut self.ring.ctx_mut(pos).desc;
                put16(d, 16, AQC_LAN_ADDR_VALID | AQC_PORT_ADDR_VALID);
                self.complete_indir(pos, AQ_RC_OK, &data, false, k);
            }
            AQC_GET_PHY_ABILITIES => {
                let mut par = [0u8; 32];
                put32(&mut par, 0, 1 << PHY_TYPE_40GBASE_CR4_CU);
                par[4] = LINK_SPEED_40GB;
                par[5] = AQ_PHY_LINK_ENABLED | AQ_PHY_AN_ENABLED;

                let d = &mut self.ring.ctx_mut(pos).desc;
                put32(d, 16, 0);
                put32(d, 20, 0);
                self.complete_indir(pos, AQ_RC_OK, &par, true, k);
            }
            AQC_GET_LINK_STATUS => {
                let d = &mut self.ring.ctx_mut(pos).desc;
                let flags = get16(d, 16) & AQ_LSE_IS_ENABLED;
                put16(d, 16, flags);
                d[18] = PHY_TYPE_40GBASE_CR4_CU as u8;
                d[19] = LINK_SPEED_40GB;
                d[20] = AQ_LINK_UP_FUNCTION
                    | AQ_LINK_UP_PORT
                    | AQ_MEDIA_AVAILABLE
                    | AQ_SIGNAL_DETECT;
                d[21] = AQ_AN_COMPLETED | AQ_LP_AN_ABILITY;
                d[22] = 0; // ext_info
                d[23] = AQ_PWR_CLASS_4 << AQ_PWR_CLASS_SHIFT_LB;
                put16(d, 24, MAX_MTU);
                d[26] = AQ_CONFIG_CRC_ENA;
                self.complete(pos, AQ_RC_OK);
            }
            AQC_GET_SWITCH_CONFIG => {
                // single PF VSI element
                let els: &[(u8, u8, u16, u16, u16)] = &[(
                    AQ_SW_ELEM_TYPE_VSI,
                    AQ_SW_ELEM_REV_1,
                    512, // seid
                    2,   // uplink
                    16,  // downlink
                )];
                let seid_cursor = get16(&d, 16);
                let first = els.iter().position(|e| e.2 >= seid_cursor).unwrap_or(els.len());

                let max = datalen.saturating_sub(16) / 16;
                let mut report = els.len() - first;
                let next_seid = if report > max {
                    report = max;
                    els[first + report].2
                } else {
                    0
                };
                {
                    let d = &mut self.ring.ctx_mut(pos).desc;
                    put16(d, 16, next_seid);
                }

                let mut buf = vec![0u8; 16 + report * 16];
                put16(&mut buf, 0, report as u16);
                put16(&mut buf, 2, els.len() as u16);
                for (i, &(etype, rev, seid, up, down)) in
                    els[first..first + report].iter().enumerate()
                {
                    let e = &mut buf[16 + i * 16..32 + i * 16];
                    e[0] = etype;
                    e[1] = rev;
                    put16(e, 2, seid);
                    put16(e, 4, up);
                    put16(e, 6, down);
                    e[11] = AQ_CONN_TYPE_REGULAR;
                }
                self.complete_indir(pos, AQ_RC_OK, &buf, false, k);
            }
            AQC_SET_SWITCH_CONFIG => self.complete(pos, AQ_RC_OK),
            AQC_GET_VSI_PARAMETERS => {
                // switch, queue map, queue opt and sched sections valid
                let mut pd = [0u8; 128];
                put16(&mut pd, 0, 0x0001 | 0x0040 | 0x0080 | 0x0200);
                self.complete_indir(pos, AQ_RC_OK, &pd, false, k);
            }
            AQC_UPDATE_VSI_PARAMETERS => self.complete(pos, AQ_RC_OK),
            AQC_SET_DCB_PARAMETERS => self.complete(pos, AQ_RC_OK),
            AQC_CONFIGURE_VSI_BW_LIMIT => self.complete(pos, AQ_RC_OK),
            AQC_QUERY_VSI_BW_CONFIG => {
                let mut bwc = [0u8; 40];
                for i in 0..8 {
                    put16(&mut bwc, 8 + 2 * i, 0xffff); // qs_handles
                }
                self.complete_indir(pos, AQ_RC_OK, &bwc, false, k);
            }
            AQC_QUERY_VSI_ETS_SLA_CONFIG => {
                let mut sla = [0u8; 32];
                for b in sla[8..16].iter_mut() {
                    *b = 127; // share_credits
                }
                self.complete_indir(pos, AQ_RC_OK, &sla, false, k);
            }
            AQC_REMOVE_MACVLAN => {
                let num = get16(&d, 16) as usize;
                let mut data = std::mem::take(&mut self.ring.ctx_mut(pos).data);
                for i in 0..num {
                    let off = i * 16 + 12;
                    if off < data.len() {
                        data[off] = 0; // per-entry success
                    }
                }
                self.complete_indir(pos, AQ_RC_OK, &data, false, k);
            }
            _ => {
                // deliberately permissive: unknown commands succeed so
                // probing drivers keep going
                trace!(opcode, "unknown admin opcode acked");
                self.complete(pos, AQ_RC_OK);
            }
        }
    }
}

impl Default for AdminQueue {
    fn default() -> Self {
        Self::new()
    }
}
