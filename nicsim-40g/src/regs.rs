//! Register map and register file.
//!
//! Addresses are BAR-0 byte offsets of 32-bit registers. Array registers are
//! expressed as `const fn`s over their index, matching the dispatch ranges
//! in [`crate::device`].

use crate::{NUM_ITR, NUM_PFINTS, NUM_QUEUES};

// general
pub const PFGEN_CTRL: u64 = 0x0009_2400;
pub const GL_FWSTS: u64 = 0x0008_3048;
pub const GLGEN_RSTCTL: u64 = 0x000B_8180;
pub const GLGEN_STAT: u64 = 0x000B_8188;
pub const GLVFGEN_TIMER: u64 = 0x0008_8000;
pub const PFGEN_PORTNUM: u64 = 0x001C_0480;
pub const PFLAN_QALLOC: u64 = 0x001C_0400;
pub const PF_VT_PFALLOC: u64 = 0x001C_0500;

pub const PFGEN_CTRL_PFSWR: u32 = 1 << 0;
pub const PFLAN_QALLOC_FIRSTQ_SHIFT: u32 = 0;
pub const PFLAN_QALLOC_LASTQ_SHIFT: u32 = 16;
pub const PFLAN_QALLOC_VALID_SHIFT: u32 = 31;

// PCI config shadows
pub const GLPCI_CAPSUP: u64 = 0x000B_E4A8;
pub const GLPCI_CNF2: u64 = 0x000B_E494;
pub const GLPCI_CNF2_MSI_X_PF_N_SHIFT: u32 = 2;
pub const GLPCI_CNF2_MSI_X_VF_N_SHIFT: u32 = 13;

// NVM / shadow RAM
pub const GLNVM_ULD: u64 = 0x000B_6008;
pub const GLNVM_GENS: u64 = 0x000B_6100;
pub const GLNVM_FLA: u64 = 0x000B_6108;
pub const GLNVM_SRCTL: u64 = 0x000B_6110;
pub const GLNVM_SRDATA: u64 = 0x000B_6114;

pub const GLNVM_GENS_NVM_PRES: u32 = 1 << 5;
pub const GLNVM_GENS_SR_SIZE_SHIFT: u32 = 6;
pub const GLNVM_FLA_LOCKED: u32 = 1 << 6;
pub const GLNVM_SRCTL_ADDR_SHIFT: u32 = 14;
pub const GLNVM_SRCTL_ADDR_MASK: u32 = 0x7fff << 14;
pub const GLNVM_SRCTL_WRITE: u32 = 1 << 29;
pub const GLNVM_SRCTL_START: u32 = 1 << 30;
pub const GLNVM_SRCTL_DONE: u32 = 1 << 31;
pub const GLNVM_SRDATA_WRDATA_MASK: u32 = 0xffff;
pub const GLNVM_SRDATA_RDDATA_SHIFT: u32 = 16;
pub const GLNVM_SRDATA_RDDATA_MASK: u32 = 0xffff_0000;

// shadow RAM words
pub const SR_NVM_CONTROL_WORD: u16 = 0x00;
pub const SR_NVM_DEV_STARTER_VERSION: u16 = 0x18;
pub const SR_BOOT_CONFIG_PTR: u16 = 0x17;
pub const SR_NVM_EETRACK_LO: u16 = 0x2D;
pub const SR_NVM_EETRACK_HI: u16 = 0x2E;
pub const SR_SW_CHECKSUM_WORD: u16 = 0x3F;
pub const SR_CONTROL_WORD_1_SHIFT: u32 = 6;

// LAN global
pub const GLLAN_RCTL_0: u64 = 0x0012_A500;
pub const GLLAN_RCTL_0_PXE_MODE: u32 = 1 << 0;

pub const fn gllan_txpre_qdis(i: usize) -> u64 {
    0x000E_6500 + 4 * i as u64
}
pub const GLLAN_TXPRE_QDIS_NUM: usize = 12;

// interrupts
pub const PFINT_LNKLST0: u64 = 0x0003_8500;
pub const PFINT_ICR0: u64 = 0x0003_8780;
pub const PFINT_ICR0_ENA: u64 = 0x0003_8800;
pub const PFINT_STAT_CTL0: u64 = 0x0003_8400;
pub const PFINT_DYN_CTL0: u64 = 0x0003_8480;

pub const fn pfint_itr0(i: usize) -> u64 {
    0x0003_8000 + 4 * i as u64
}
/// Per-vector ITR arrays, one block per throttle index. Vector 0 uses
/// `PFINT_ITR0` instead.
pub const fn pfint_itrn(i: usize, n: usize) -> u64 {
    0x0003_0000 + 0x800 * i as u64 + 4 * n as u64
}
/// Vector `n + 1` dynamic control; vector 0 uses `PFINT_DYN_CTL0`.
pub const fn pfint_dyn_ctln(n: usize) -> u64 {
    0x0003_4800 + 4 * n as u64
}
pub const fn pfint_lnklstn(n: usize) -> u64 {
    0x0003_5000 + 4 * n as u64
}
pub const fn pfint_raten(n: usize) -> u64 {
    0x0003_5800 + 4 * n as u64
}

pub const PFINT_DYN_CTL0_INTENA: u32 = 1 << 0;
pub const PFINT_ICR0_INTEVENT: u32 = 1 << 31;
pub const PFINT_ICR0_QUEUE_0_SHIFT: u32 = 1;
pub const PFINT_ICR0_TIMESYNC: u32 = 1 << 23;
pub const PFINT_ICR0_ENA_TIMESYNC: u32 = 1 << 23;

// per-queue interrupt cause control
pub const fn qint_tqctl(q: usize) -> u64 {
    0x0003_C000 + 4 * q as u64
}
pub const fn qint_rqctl(q: usize) -> u64 {
    0x0003_A000 + 4 * q as u64
}

pub const QINT_CTL_MSIX_INDX_SHIFT: u32 = 0;
pub const QINT_CTL_MSIX_INDX_MASK: u32 = 0xff;
pub const QINT_CTL_ITR_INDX_SHIFT: u32 = 11;
pub const QINT_CTL_ITR_INDX_MASK: u32 = 0x3 << 11;
pub const QINT_CTL_MSIX0_INDX_SHIFT: u32 = 13;
pub const QINT_CTL_MSIX0_INDX_MASK: u32 = 0x7 << 13;
pub const QINT_CTL_CAUSE_ENA: u32 = 1 << 30;

// queues
pub const fn qtx_ena(q: usize) -> u64 {
    0x0010_0000 + 4 * q as u64
}
pub const fn qtx_tail(q: usize) -> u64 {
    0x0010_8000 + 4 * q as u64
}
pub const fn qtx_ctl(q: usize) -> u64 {
    0x0011_0000 + 4 * q as u64
}
pub const fn qrx_ena(q: usize) -> u64 {
    0x0012_0000 + 4 * q as u64
}
pub const fn qrx_tail(q: usize) -> u64 {
    0x0012_8000 + 4 * q as u64
}

pub const QENA_REQ: u32 = 1 << 0;
pub const QENA_STAT: u32 = 1 << 2;

// host memory cache
pub const PFHMC_SDCMD: u64 = 0x000C_0000;
pub const PFHMC_SDDATALOW: u64 = 0x000C_0100;
pub const PFHMC_SDDATAHIGH: u64 = 0x000C_0200;
pub const PFHMC_PDINV: u64 = 0x000C_0300;
pub const PFHMC_ERRORINFO: u64 = 0x000C_0400;
pub const PFHMC_ERRORDATA: u64 = 0x000C_0500;

pub const PFHMC_SDCMD_PMSDIDX_MASK: u32 = 0xfff;
pub const PFHMC_SDCMD_PMSDWR: u32 = 1 << 31;
pub const PFHMC_SDDATALOW_PMSDVALID: u32 = 1 << 0;
pub const PFHMC_SDDATALOW_PMSDTYPE: u32 = 1 << 1;
pub const PFHMC_SDDATALOW_PMSDBPCOUNT_SHIFT: u32 = 2;
pub const PFHMC_SDDATALOW_PMSDBPCOUNT_MASK: u32 = 0x3ff << 2;
pub const PFHMC_SDDATALOW_PMSDDATALOW_SHIFT: u32 = 12;
pub const PFHMC_SDDATALOW_PMSDDATALOW_MASK: u32 = 0xffff_f000;
/// Error class reported for accesses through invalid segments.
pub const PFHMC_ERRORINFO_INVALID_SD: u32 = 1 << 31;

pub const fn glhmc_lantxbase(i: usize) -> u64 {
    0x000C_6200 + 4 * i as u64
}
pub const fn glhmc_lantxcnt(i: usize) -> u64 {
    0x000C_6300 + 4 * i as u64
}
pub const fn glhmc_lanrxbase(i: usize) -> u64 {
    0x000C_6400 + 4 * i as u64
}
pub const fn glhmc_lanrxcnt(i: usize) -> u64 {
    0x000C_6500 + 4 * i as u64
}
pub const GLHMC_LAN_MAX_INDEX: usize = 15;
pub const GLHMC_FPMBASE_MASK: u32 = 0x00ff_ffff;

pub const GLHMC_LANTXOBJSZ: u64 = 0x000C_2004;
pub const GLHMC_LANQMAX: u64 = 0x000C_2008;
pub const GLHMC_LANRXOBJSZ: u64 = 0x000C_200C;
pub const GLHMC_FCOEMAX: u64 = 0x000C_2014;
pub const GLHMC_FCOEDDPOBJSZ: u64 = 0x000C_2018;
pub const GLHMC_FCOEFMAX: u64 = 0x000C_201C;
pub const GLHMC_FCOEFOBJSZ: u64 = 0x000C_2020;
pub const GLHMC_FCOEFMAX_PMFCOEFMAX_SHIFT: u32 = 0;

// admin queues
pub const PF_ATQBAL: u64 = 0x0008_0000;
pub const PF_ATQBAH: u64 = 0x0008_0100;
pub const PF_ATQLEN: u64 = 0x0008_0200;
pub const PF_ATQH: u64 = 0x0008_0300;
pub const PF_ATQT: u64 = 0x0008_0400;
pub const PF_ARQBAL: u64 = 0x0008_0080;
pub const PF_ARQBAH: u64 = 0x0008_0180;
pub const PF_ARQLEN: u64 = 0x0008_0280;
pub const PF_ARQH: u64 = 0x0008_0380;
pub const PF_ARQT: u64 = 0x0008_0480;

pub const ATQLEN_LEN_MASK: u32 = 0x3ff;
pub const ATQLEN_ENABLE: u32 = 1 << 31;

// MAC / link
pub const PRTMAC_LINKSTA: u64 = 0x001E_2420;
pub const PRTMAC_MACC: u64 = 0x001E_24E0;
pub const REG_LINK_UP: u32 = 1 << 30;
pub const REG_SPEED_25_40GB: u32 = 1 << 8;

// RSS
pub const PFQF_CTL_0: u64 = 0x001C_0AC0;
pub const PFQF_CTL_0_HASHLUTSIZE: u32 = 1 << 16;
pub const fn pfqf_hkey(i: usize) -> u64 {
    0x0024_4800 + 128 * i as u64
}
pub const PFQF_HKEY_MAX_INDEX: usize = 12;
pub const fn pfqf_hlut(i: usize) -> u64 {
    0x0024_0000 + 128 * i as u64
}
pub const PFQF_HLUT_MAX_INDEX: usize = 127;

// DCB / flow control / tagging
pub const PRTDCB_FCCFG: u64 = 0x001E_4640;
pub const PRTDCB_MFLCN: u64 = 0x001E_2400;
pub const PRT_L2TAGSEN: u64 = 0x001C_0B20;
pub const PRTQF_CTL_0: u64 = 0x0025_6E60;

// packet buffer watermarks
pub const GLRPB_GHW: u64 = 0x000A_C830;
pub const GLRPB_GLW: u64 = 0x000A_C834;
pub const GLRPB_PHW: u64 = 0x000A_C844;
pub const GLRPB_PLW: u64 = 0x000A_C848;

// PTP
pub const PRTTSYN_CTL0: u64 = 0x001E_4200;
pub const PRTTSYN_CTL1: u64 = 0x0008_5020;
pub const PRTTSYN_INC_L: u64 = 0x001E_4040;
pub const PRTTSYN_INC_H: u64 = 0x001E_4060;
pub const PRTTSYN_TIME_L: u64 = 0x001E_4100;
pub const PRTTSYN_TIME_H: u64 = 0x001E_4120;
pub const PRTTSYN_ADJ: u64 = 0x001E_4280;
pub const PRTTSYN_TXTIME_L: u64 = 0x001E_41C0;
pub const PRTTSYN_TXTIME_H: u64 = 0x001E_41E0;
pub const PRTTSYN_STAT_0: u64 = 0x001E_4220;
pub const PRTTSYN_STAT_1: u64 = 0x0008_5140;
pub const fn prttsyn_rxtime_l(i: usize) -> u64 {
    0x0008_4000 + 32 * i as u64
}
pub const fn prttsyn_rxtime_h(i: usize) -> u64 {
    0x0008_4010 + 32 * i as u64
}

pub const PRTTSYN_CTL0_TXTIME_INT_ENA: u32 = 1 << 1;
pub const PRTTSYN_CTL1_TSYNENA: u32 = 1 << 31;
pub const PRTTSYN_CTL1_TSYNTYPE_SHIFT: u32 = 26;
pub const PRTTSYN_CTL1_TSYNTYPE_MASK: u32 = 0x3 << 26;
pub const PRTTSYN_CTL1_UDP_ENA_SHIFT: u32 = 24;
pub const PRTTSYN_CTL1_UDP_ENA_MASK: u32 = 0x3 << 24;
pub const PRTTSYN_CTL1_V1MESSTYPE0_SHIFT: u32 = 0;
pub const PRTTSYN_CTL1_V1MESSTYPE0_MASK: u32 = 0xff;
pub const PRTTSYN_CTL1_V1MESSTYPE1_SHIFT: u32 = 8;
pub const PRTTSYN_CTL1_V1MESSTYPE1_MASK: u32 = 0xff << 8;
pub const PRTTSYN_CTL1_V2MESSTYPE0_SHIFT: u32 = 16;
pub const PRTTSYN_CTL1_V2MESSTYPE0_MASK: u32 = 0xf << 16;
pub const PRTTSYN_CTL1_V2MESSTYPE1_SHIFT: u32 = 20;
pub const PRTTSYN_CTL1_V2MESSTYPE1_MASK: u32 = 0xf << 20;
pub const PRTTSYN_STAT_0_TXTIME: u32 = 1 << 4;
pub const PRTTSYN_STAT_1_RXT0_SHIFT: u32 = 0;
pub const PRTTSYN_ADJ_TSYNADJ_SHIFT: u32 = 0;
pub const PRTTSYN_ADJ_TSYNADJ_MASK: u32 = 0x7fff_ffff;
pub const PRTTSYN_ADJ_SIGN: u32 = 1 << 31;

/// The device register file. Everything the driver can see lives here;
/// queue engines keep references into it only conceptually (they are given
/// `&mut Regs` per call).
pub struct Regs {
    pub glgen_rstctl: u32,
    pub glgen_stat: u32,
    pub gllan_rctl_0: u32,
    pub pfint_lnklst0: u32,
    pub pfint_icr0_ena: u32,
    pub pfint_icr0: u32,
    pub pfint_itr0: [u32; NUM_ITR],
    pub pfint_itrn: Vec<[u32; NUM_ITR]>,

    pub pfint_stat_ctl0: u32,
    pub pfint_dyn_ctl0: u32,
    pub pfint_dyn_ctln: Vec<u32>,
    pub pfint_lnklstn: Vec<u32>,
    pub pfint_raten: Vec<u32>,
    pub gllan_txpre_qdis: [u32; GLLAN_TXPRE_QDIS_NUM],

    pub glnvm_srctl: u32,
    pub glnvm_srdata: u32,

    pub qint_tqctl: Vec<u32>,
    pub qtx_ena: Vec<u32>,
    pub qtx_tail: Vec<u32>,
    pub qtx_ctl: Vec<u32>,
    pub qint_rqctl: Vec<u32>,
    pub qrx_ena: Vec<u32>,
    pub qrx_tail: Vec<u32>,

    pub glhmc_lantxbase: [u32; GLHMC_LAN_MAX_INDEX + 1],
    pub glhmc_lantxcnt: [u32; GLHMC_LAN_MAX_INDEX + 1],
    pub glhmc_lanrxbase: [u32; GLHMC_LAN_MAX_INDEX + 1],
    pub glhmc_lanrxcnt: [u32; GLHMC_LAN_MAX_INDEX + 1],

    pub pfhmc_sdcmd: u32,
    pub pfhmc_sddatalow: u32,
    pub pfhmc_sddatahigh: u32,
    pub pfhmc_pdinv: u32,
    pub pfhmc_errorinfo: u32,
    pub pfhmc_errordata: u32,

    pub pf_atqba: u64,
    pub pf_atqlen: u32,
    pub pf_atqh: u32,
    pub pf_atqt: u32,

    pub pf_arqba: u64,
    pub pf_arqlen: u32,
    pub pf_arqh: u32,
    pub pf_arqt: u32,

    pub pfqf_ctl_0: u32,
    pub pfqf_hkey: [u32; PFQF_HKEY_MAX_INDEX + 1],
    pub pfqf_hlut: [u32; PFQF_HLUT_MAX_INDEX + 1],

    pub prtdcb_fccfg: u32,
    pub prtdcb_mflcn: u32,
    pub prt_l2tagsen: u32,
    pub prtqf_ctl_0: u32,

    pub glrpb_ghw: u32,
    pub glrpb_glw: u32,
    pub glrpb_phw: u32,
    pub glrpb_plw: u32,

    pub prtsyn_ctl_0: u32,
    pub prtsyn_ctl_1: u32,
    pub prtsyn_inc_l: u32,
    pub prtsyn_inc_h: u32,
    /// Latched full PHC sample for the TIME_L/TIME_H read pair.
    pub prtsyn_time: u64,
    pub prtsyn_time_set_l: u32,
    pub prtsyn_rxtime: [u64; 4],
    pub prtsyn_rxtime_lock: [bool; 4],
    pub prtsyn_txtime: u64,
    pub prtsyn_stat_0: u32,
    pub prtsyn_stat_1: u32,
}

impl Regs {
    pub fn new() -> Self {
        Regs {
            glgen_rstctl: 0,
            glgen_stat: 0,
            gllan_rctl_0: 0,
            pfint_lnklst0: 0,
            pfint_icr0_ena: 0,
            pfint_icr0: 0,
            pfint_itr0: [0; NUM_ITR],
            pfint_itrn: vec![[0; NUM_ITR]; NUM_PFINTS],
            pfint_stat_ctl0: 0,
            pfint_dyn_ctl0: 0,
            pfint_dyn_ctln: vec![0; NUM_PFINTS - 1],
            pfint_lnklstn: vec![0; NUM_PFINTS - 1],
            pfint_raten: vec![0; NUM_PFINTS - 1],
            gllan_txpre_qdis: [0; GLLAN_TXPRE_QDIS_NUM],
            glnvm_srctl: 0,
            glnvm_srdata: 0,
            qint_tqctl: vec![0; NUM_QUEUES],
            qtx_ena: vec![0; NUM_QUEUES],
            qtx_tail: vec![0; NUM_QUEUES],
            qtx_ctl: vec![0; NUM_QUEUES],
            qint_rqctl: vec![0; NUM_QUEUES],
            qrx_ena: vec![0; NUM_QUEUES],
            qrx_tail: vec![0; NUM_QUEUES],
            glhmc_lantxbase: [0; GLHMC_LAN_MAX_INDEX + 1],
            glhmc_lantxcnt: [0; GLHMC_LAN_MAX_INDEX + 1],
            glhmc_lanrxbase: [0; GLHMC_LAN_MAX_INDEX + 1],
            glhmc_lanrxcnt: [0; GLHMC_LAN_MAX_INDEX + 1],
            pfhmc_sdcmd: 0,
            pfhmc_sddatalow: 0,
            pfhmc_sddatahigh: 0,
            pfhmc_pdinv: 0,
            pfhmc_errorinfo: 0,
            pfhmc_errordata: 0,
            pf_atqba: 0,
            pf_atqlen: 0,
            pf_atqh: 0,
            pf_atqt: 0,
            pf_arqba: 0,
            pf_arqlen: 0,
            pf_arqh: 0,
            pf_arqt: 0,
            pfqf_ctl_0: 0,
            pfqf_hkey: [0; PFQF_HKEY_MAX_INDEX + 1],
            pfqf_hlut: [0; PFQF_HLUT_MAX_INDEX + 1],
            prtdcb_fccfg: 0,
            prtdcb_mflcn: 0,
            prt_l2tagsen: 0,
            prtqf_ctl_0: 0,
            glrpb_ghw: 0,
            glrpb_glw: 0,
            glrpb_phw: 0,
            glrpb_plw: 0,
            prtsyn_ctl_0: 0,
            prtsyn_ctl_1: 0,
            prtsyn_inc_l: 0,
            prtsyn_inc_h: 0,
            prtsyn_time: 0,
            prtsyn_time_set_l: 0,
            prtsyn_rxtime: [0; 4],
            prtsyn_rxtime_lock: [false; 4],
            prtsyn_txtime: 0,
            prtsyn_stat_0: 0,
            prtsyn_stat_1: 0,
        }
    }

    /// Power-on / software-reset state: everything cleared, then the
    /// defaults the driver expects.
    pub fn reset(&mut self) {
        *self = Regs::new();

        // default RSS hash key
        self.pfqf_hkey = [
            0xda565a6d, 0xc20e5b25, 0x3d256741, 0xb08fa343, 0xcb2bcad0, 0xb4307bae, 0xa32dcb77,
            0x0cf23080, 0x3bb7426a, 0xfa01acbe, 0x0, 0x0, 0x0,
        ];

        self.glrpb_ghw = 0xF2000;
        self.glrpb_phw = 0x1246;
        self.glrpb_plw = 0x0846;
    }
}

impl Default for Regs {
    fn default() -> Self {
        let mut r = Regs::new();
        r.reset();
        r
    }
}

/// Match `addr` against an array register block, yielding the index.
pub fn reg_index(addr: u64, base: u64, stride: u64, count: usize) -> Option<usize> {
    if addr < base {
        return None;
    }
    let off = addr - base;
    if off % stride != 0 {
        return None;
    }
    let idx = (off / stride) as usize;
    if idx < count {
        Some(idx)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reg_index() {
        assert_eq!(reg_index(qtx_ena(0), qtx_ena(0), 4, NUM_QUEUES), Some(0));
        assert_eq!(reg_index(qtx_ena(17), qtx_ena(0), 4, NUM_QUEUES), Some(17));
        assert_eq!(
            reg_index(qtx_ena(NUM_QUEUES), qtx_ena(0), 4, NUM_QUEUES),
            None
        );
        assert_eq!(reg_index(pfqf_hkey(3), pfqf_hkey(0), 128, 13), Some(3));
        assert_eq!(reg_index(pfqf_hkey(0) + 4, pfqf_hkey(0), 128, 13), None);
    }

    #[test]
    fn test_reset_defaults() {
        let mut r = Regs::new();
        r.pfint_icr0 = 0x123;
        r.reset();
        assert_eq!(r.pfint_icr0, 0);
        assert_eq!(r.pfqf_hkey[0], 0xda565a6d);
        assert_eq!(r.pfqf_hkey[9], 0xfa01acbe);
        assert_eq!(r.glrpb_ghw, 0xF2000);
    }
}
