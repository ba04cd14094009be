//! The device proper: MMIO dispatch, interrupt arbitration, shadow RAM and
//! reset, tying the admin queue, HMC, LAN engine and PHC together.

use nicsim_core::kernel::{Device, Kernel};
use nicsim_core::DmaOp;
use nicsim_proto::intro::{Bar, PcieDevIntro, BAR_64, BAR_DUMMY, BAR_IO};
use tracing::{debug, trace, warn};

use crate::adminq::AdminQueue;
use crate::hmc::HostMemCache;
use crate::lan::LanManager;
use crate::ptp::PtpClock;
use crate::regs::{self, Regs};
use crate::{NUM_PFINTS, NUM_QUEUES};

pub const BAR_REGS: u8 = 0;
pub const BAR_IO_IDX: u8 = 2;
pub const BAR_MSIX: u8 = 3;

pub const VENDOR_ID: u16 = 0x8086;
pub const DEVICE_ID: u16 = 0x1583;

/// Completion routing for every DMA the model issues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaTag {
    /// Admin queue descriptor batch fetch.
    AtqFetch { pos: u32 },
    /// Admin command indirect buffer fetch.
    AtqDataFetch { pos: u32 },
    /// Admin command indirect response write.
    AtqDataWrite { pos: u32 },
    /// Admin queue descriptor write-back.
    AtqWriteback { pos: u32, cnt: u32 },
    /// LAN queue context fetch through the HMC.
    QueueCtxFetch { rx: bool, idx: usize },
    /// LAN descriptor batch fetch.
    LanFetch { rx: bool, idx: usize, pos: u32 },
    /// TX payload fetch.
    LanDataFetch { rx: bool, idx: usize, pos: u32 },
    /// RX payload write into a host buffer.
    LanDataWrite { rx: bool, idx: usize, pos: u32 },
    /// Full-descriptor write-back.
    LanWriteback { rx: bool, idx: usize, pos: u32, cnt: u32 },
    /// TX head-index-only write-back.
    TxHeadWriteback { idx: usize, pos: u32, cnt: u32 },
}

/// Mutable device state handed down into the queue engines, so they can
/// touch registers, the PHC and the interrupt arbiter next to their own
/// state.
pub struct DevCtx<'a> {
    pub regs: &'a mut Regs,
    pub ptp: &'a mut PtpClock,
    pub ints: &'a mut IntArbiter,
    pub k: &'a mut dyn Kernel<DmaTag>,
}

#[derive(Debug, Clone, Copy, Default)]
struct IntEv {
    armed: bool,
    time: u64,
}

/// Per-vector interrupt throttling. Each vector owns one timed event keyed
/// by its number; coalescing keeps an earlier-armed event if it already
/// fires soon enough.
pub struct IntArbiter {
    evs: Vec<IntEv>,
}

impl IntArbiter {
    pub fn new() -> Self {
        IntArbiter { evs: vec![IntEv::default(); NUM_PFINTS] }
    }

    pub fn reset(&mut self, k: &mut dyn Kernel<DmaTag>) {
        for (vec, ev) in self.evs.iter_mut().enumerate() {
            if ev.armed {
                k.event_cancel(vec as u64);
            }
            *ev = IntEv::default();
        }
    }

    /// Request delivery of `vec` no earlier than the ITR interval allows.
    pub fn signal(&mut self, regs: &Regs, k: &mut dyn Kernel<DmaTag>, vec: u16, itr: u8) {
        let mindelay = match itr {
            0..=2 => {
                let itr_reg = if vec == 0 {
                    regs.pfint_itr0[itr as usize]
                } else {
                    regs.pfint_itrn[vec as usize][itr as usize]
                };
                itr_reg as u64 * 2_000_000 // ITR unit is 2 us
            }
            3 => 0, // no-throttle index
            _ => panic!("invalid itr index {itr}"),
        };

        let target = k.time_ps() + mindelay;
        let ev = &mut self.evs[vec as usize];
        if ev.armed && ev.time <= target {
            trace!(vec, "interrupt already scheduled");
            return;
        }
        if ev.armed {
            k.event_cancel(vec as u64);
        }

        ev.armed = true;
        ev.time = target;
        trace!(vec, time = target, itr, "interrupt scheduled");
        k.event_schedule(vec as u64, target);
    }

    /// The timed event for `vec` fired: deliver the interrupt.
    pub fn fire(&mut self, k: &mut dyn Kernel<DmaTag>, vec: u16) {
        self.evs[vec as usize].armed = false;

        if k.msix_enabled() {
            k.msix_issue(vec);
        } else if vec > 0 {
            panic!("MSI-X disabled but interrupt on vector {vec}");
        } else {
            k.msi_issue(0);
        }
    }
}

impl Default for IntArbiter {
    fn default() -> Self {
        Self::new()
    }
}

/// NVM shadow RAM register protocol. Reads return the few words drivers
/// check; writes are accepted and dropped.
struct ShadowRam;

impl ShadowRam {
    fn reg_updated(&mut self, regs: &mut Regs) {
        let val = regs.glnvm_srctl;
        if val & regs::GLNVM_SRCTL_START == 0 {
            return;
        }

        let addr = ((val & regs::GLNVM_SRCTL_ADDR_MASK) >> regs::GLNVM_SRCTL_ADDR_SHIFT) as u16;
        let is_write = val & regs::GLNVM_SRCTL_WRITE != 0;
        debug!(addr, is_write, "shadow ram access");

        if is_write {
            let data =
                (regs.glnvm_srdata & regs::GLNVM_SRDATA_WRDATA_MASK) as u16;
            self.write(addr, data);
        } else {
            regs.glnvm_srdata &= !regs::GLNVM_SRDATA_RDDATA_MASK;
            regs.glnvm_srdata |= (self.read(addr) as u32) << regs::GLNVM_SRDATA_RDDATA_SHIFT;
        }

        regs.glnvm_srctl &= !regs::GLNVM_SRCTL_START;
        regs.glnvm_srctl |= regs::GLNVM_SRCTL_DONE;
    }

    fn read(&self, addr: u16) -> u16 {
        match addr {
            // read by drivers but unused
            regs::SR_NVM_DEV_STARTER_VERSION
            | regs::SR_NVM_EETRACK_LO
            | regs::SR_NVM_EETRACK_HI
            | regs::SR_BOOT_CONFIG_PTR => 0,
            regs::SR_NVM_CONTROL_WORD => 1 << regs::SR_CONTROL_WORD_1_SHIFT,
            regs::SR_SW_CHECKSUM_WORD => 0xbaba,
            _ => {
                trace!(addr, "unmodeled shadow ram word");
                0
            }
        }
    }

    fn write(&mut self, addr: u16, val: u16) {
        trace!(addr, val, "shadow ram write dropped");
    }
}

pub struct FortyGig {
    regs: Regs,
    atq: AdminQueue,
    hmc: HostMemCache,
    shram: ShadowRam,
    lan: LanManager,
    ptp: PtpClock,
    ints: IntArbiter,
}

impl FortyGig {
    pub fn new() -> Self {
        let mut dev = FortyGig {
            regs: Regs::new(),
            atq: AdminQueue::new(),
            hmc: HostMemCache::new(),
            shram: ShadowRam,
            lan: LanManager::new(NUM_QUEUES),
            ptp: PtpClock::new(),
            ints: IntArbiter::new(),
        };
        dev.regs.reset();
        dev
    }

    /// Direct access to the register file (tests and tooling).
    pub fn regs(&self) -> &Regs {
        &self.regs
    }

    pub fn lan(&self) -> &LanManager {
        &self.lan
    }

    fn reset(&mut self, k: &mut dyn Kernel<DmaTag>, indicate_done: bool) {
        debug!("device reset");
        self.atq.reset();
        self.hmc.reset();
        self.lan.reset();
        self.ints.reset(k);
        self.regs.reset();
        if indicate_done {
            self.regs.glnvm_srctl = regs::GLNVM_SRCTL_DONE;
        }
    }

    fn reg_mem_read32(&mut self, k: &mut dyn Kernel<DmaTag>, addr: u64) -> u32 {
        use regs::reg_index as ri;
        let r = &mut self.regs;

        if let Some(i) = ri(addr, regs::pfint_dyn_ctln(0), 4, NUM_PFINTS - 1) {
            r.pfint_dyn_ctln[i]
        } else if let Some(i) = ri(addr, regs::pfint_lnklstn(0), 4, NUM_PFINTS - 1) {
            r.pfint_lnklstn[i]
        } else if let Some(i) = ri(addr, regs::pfint_raten(0), 4, NUM_PFINTS - 1) {
            r.pfint_raten[i]
        } else if let Some(i) =
            ri(addr, regs::gllan_txpre_qdis(0), 4, regs::GLLAN_TXPRE_QDIS_NUM)
        {
            r.gllan_txpre_qdis[i]
        } else if let Some(i) = ri(addr, regs::qint_tqctl(0), 4, NUM_QUEUES) {
            r.qint_tqctl[i]
        } else if let Some(i) = ri(addr, regs::qtx_ena(0), 4, NUM_QUEUES) {
            r.qtx_ena[i]
        } else if let Some(i) = ri(addr, regs::qtx_tail(0), 4, NUM_QUEUES) {
            r.qtx_tail[i]
        } else if let Some(i) = ri(addr, regs::qtx_ctl(0), 4, NUM_QUEUES) {
            r.qtx_ctl[i]
        } else if let Some(i) = ri(addr, regs::qint_rqctl(0), 4, NUM_QUEUES) {
            r.qint_rqctl[i]
        } else if let Some(i) = ri(addr, regs::qrx_ena(0), 4, NUM_QUEUES) {
            r.qrx_ena[i]
        } else if let Some(i) = ri(addr, regs::qrx_tail(0), 4, NUM_QUEUES) {
            r.qrx_tail[i]
        } else if let Some(i) =
            ri(addr, regs::glhmc_lantxbase(0), 4, regs::GLHMC_LAN_MAX_INDEX + 1)
        {
            r.glhmc_lantxbase[i]
        } else if let Some(i) =
            ri(addr, regs::glhmc_lantxcnt(0), 4, regs::GLHMC_LAN_MAX_INDEX + 1)
        {
            r.glhmc_lantxcnt[i]
        } else if let Some(i) =
            ri(addr, regs::glhmc_lanrxbase(0), 4, regs::GLHMC_LAN_MAX_INDEX + 1)
        {
            r.glhmc_lanrxbase[i]
        } else if let Some(i) =
            ri(addr, regs::glhmc_lanrxcnt(0), 4, regs::GLHMC_LAN_MAX_INDEX + 1)
        {
            r.glhmc_lanrxcnt[i]
        } else if let Some(i) = ri(addr, regs::pfqf_hkey(0), 128, regs::PFQF_HKEY_MAX_INDEX + 1) {
            r.pfqf_hkey[i]
        } else if let Some(i) = ri(addr, regs::pfqf_hlut(0), 128, regs::PFQF_HLUT_MAX_INDEX + 1) {
            r.pfqf_hlut[i]
        } else if let Some(i) = ri(addr, regs::pfint_itrn(0, 0), 4, NUM_PFINTS) {
            r.pfint_itrn[i][0]
        } else if let Some(i) = ri(addr, regs::pfint_itrn(1, 0), 4, NUM_PFINTS) {
            r.pfint_itrn[i][1]
        } else if let Some(i) = ri(addr, regs::pfint_itrn(2, 0), 4, NUM_PFINTS) {
            r.pfint_itrn[i][2]
        } else {
            match addr {
                // reset is simulated as instantaneous
                regs::PFGEN_CTRL => 0,
                regs::GL_FWSTS => 0,
                regs::GLPCI_CAPSUP => 0,
                regs::GLNVM_ULD => 0xffff_ffff,
                // shadow ram present, 64kb
                regs::GLNVM_GENS => {
                    regs::GLNVM_GENS_NVM_PRES | (6 << regs::GLNVM_GENS_SR_SIZE_SHIFT)
                }
                // normal flash programming mode
                regs::GLNVM_FLA => regs::GLNVM_FLA_LOCKED,
                regs::GLGEN_RSTCTL => r.glgen_rstctl,
                regs::GLGEN_STAT => r.glgen_stat,
                regs::GLVFGEN_TIMER => (k.time_ps() / 1_000_000) as u32,
                regs::PFINT_LNKLST0 => r.pfint_lnklst0,
                regs::PFINT_ICR0_ENA => r.pfint_icr0_ena,
                regs::PFINT_ICR0 => {
                    // read clears
                    let val = r.pfint_icr0;
                    r.pfint_icr0 = 0;
                    val
                }
                regs::PFINT_STAT_CTL0 => r.pfint_stat_ctl0,
                regs::PFINT_DYN_CTL0 => r.pfint_dyn_ctl0,
                a if a == regs::pfint_itr0(0) => r.pfint_itr0[0],
                a if a == regs::pfint_itr0(1) => r.pfint_itr0[1],
                a if a == regs::pfint_itr0(2) => r.pfint_itr0[2],
                // the driver sizes its vector allocation from this
                regs::GLPCI_CNF2 => {
                    ((NUM_PFINTS as u32 - 2) << regs::GLPCI_CNF2_MSI_X_PF_N_SHIFT)
                        | (2 << regs::GLPCI_CNF2_MSI_X_VF_N_SHIFT)
                }
                regs::GLNVM_SRCTL => r.glnvm_srctl,
                regs::GLNVM_SRDATA => r.glnvm_srdata,
                regs::PFLAN_QALLOC => {
                    (0 << regs::PFLAN_QALLOC_FIRSTQ_SHIFT)
                        | ((NUM_QUEUES as u32 - 1) << regs::PFLAN_QALLOC_LASTQ_SHIFT)
                        | (1 << regs::PFLAN_QALLOC_VALID_SHIFT)
                }
                regs::PF_VT_PFALLOC => 0, // no VFs
                regs::PFGEN_PORTNUM => 0,
                regs::GLLAN_RCTL_0 => r.gllan_rctl_0,
                regs::GLHMC_LANTXOBJSZ => 7, // 128 B
                regs::GLHMC_LANQMAX => NUM_QUEUES as u32,
                regs::GLHMC_LANRXOBJSZ => 5, // 32 B
                regs::GLHMC_FCOEMAX => 0,
                regs::GLHMC_FCOEDDPOBJSZ => 0,
                // needed to make the linux driver happy
                regs::GLHMC_FCOEFMAX => 0x1000 << regs::GLHMC_FCOEFMAX_PMFCOEFMAX_SHIFT,
                regs::GLHMC_FCOEFOBJSZ => 0,
                regs::PFHMC_SDCMD => r.pfhmc_sdcmd,
                regs::PFHMC_SDDATALOW => r.pfhmc_sddatalow,
                regs::PFHMC_SDDATAHIGH => r.pfhmc_sddatahigh,
                regs::PFHMC_PDINV => r.pfhmc_pdinv,
                regs::PFHMC_ERRORINFO => r.pfhmc_errorinfo,
                regs::PFHMC_ERRORDATA => r.pfhmc_errordata,
                regs::PF_ATQBAL => r.pf_atqba as u32,
                regs::PF_ATQBAH => (r.pf_atqba >> 32) as u32,
                regs::PF_ATQLEN => r.pf_atqlen,
                regs::PF_ATQH => r.pf_atqh,
                regs::PF_ATQT => r.pf_atqt,
                regs::PF_ARQBAL => r.pf_arqba as u32,
                regs::PF_ARQBAH => (r.pf_arqba >> 32) as u32,
                regs::PF_ARQLEN => r.pf_arqlen,
                regs::PF_ARQH => r.pf_arqh,
                regs::PF_ARQT => r.pf_arqt,
                regs::PRTMAC_LINKSTA => regs::REG_LINK_UP | regs::REG_SPEED_25_40GB,
                regs::PRTMAC_MACC => 0,
                regs::PFQF_CTL_0 => r.pfqf_ctl_0,
                regs::PRTDCB_FCCFG => r.prtdcb_fccfg,
                regs::PRTDCB_MFLCN => r.prtdcb_mflcn,
                regs::PRT_L2TAGSEN => r.prt_l2tagsen,
                regs::PRTQF_CTL_0 => r.prtqf_ctl_0,
                regs::GLRPB_GHW => r.glrpb_ghw,
                regs::GLRPB_GLW => r.glrpb_glw,
                regs::GLRPB_PHW => r.glrpb_phw,
                regs::GLRPB_PLW => r.glrpb_plw,
                regs::PRTTSYN_CTL0 => r.prtsyn_ctl_0,
                regs::PRTTSYN_CTL1 => r.prtsyn_ctl_1,
                regs::PRTTSYN_INC_L => r.prtsyn_inc_l,
                regs::PRTTSYN_INC_H => r.prtsyn_inc_h,
                regs::PRTTSYN_ADJ => self.ptp.adj_get(k.time_ps()),
                regs::PRTTSYN_STAT_0 => r.prtsyn_stat_0,
                regs::PRTTSYN_STAT_1 => r.prtsyn_stat_1,
                regs::PRTTSYN_TIME_L => {
                    // latch the full sample; TIME_H returns its upper half
                    r.prtsyn_time = self.ptp.phc_read(k.time_ps());
                    r.prtsyn_time as u32
                }
                regs::PRTTSYN_TIME_H => (r.prtsyn_time >> 32) as u32,
                regs::PRTTSYN_TXTIME_L => r.prtsyn_txtime as u32,
                regs::PRTTSYN_TXTIME_H => {
                    // reading the high half releases the timestamp
                    r.prtsyn_stat_0 &= !regs::PRTTSYN_STAT_0_TXTIME;
                    (r.prtsyn_txtime >> 32) as u32
                }
                a => {
                    if let Some(i) = ri(a, regs::prttsyn_rxtime_l(0), 32, 4) {
                        r.prtsyn_rxtime[i] as u32
                    } else if let Some(i) = ri(a, regs::prttsyn_rxtime_h(0), 32, 4) {
                        // reading the high half unlocks the register
                        r.prtsyn_rxtime_lock[i] = false;
                        r.prtsyn_stat_1 &= !(1 << (regs::PRTTSYN_STAT_1_RXT0_SHIFT + i as u32));
                        (r.prtsyn_rxtime[i] >> 32) as u32
                    } else {
                        warn!(addr = a, "unhandled register read");
                        0
                    }
                }
            }
        }
    }

    fn reg_mem_write32(&mut self, k: &mut dyn Kernel<DmaTag>, addr: u64, val: u32) {
        use regs::reg_index as ri;

        if let Some(i) = ri(addr, regs::pfint_dyn_ctln(0), 4, NUM_PFINTS - 1) {
            self.regs.pfint_dyn_ctln[i] = val;
        } else if let Some(i) = ri(addr, regs::pfint_lnklstn(0), 4, NUM_PFINTS - 1) {
            self.regs.pfint_lnklstn[i] = val;
        } else if let Some(i) = ri(addr, regs::pfint_raten(0), 4, NUM_PFINTS - 1) {
            self.regs.pfint_raten[i] = val;
        } else if let Some(i) =
            ri(addr, regs::gllan_txpre_qdis(0), 4, regs::GLLAN_TXPRE_QDIS_NUM)
        {
            self.regs.gllan_txpre_qdis[i] = val;
        } else if let Some(i) = ri(addr, regs::qint_tqctl(0), 4, NUM_QUEUES) {
            self.regs.qint_tqctl[i] = val;
        } else if let Some(i) = ri(addr, regs::qtx_ena(0), 4, NUM_QUEUES) {
            self.regs.qtx_ena[i] = val;
            let FortyGig { regs, ptp, ints, lan, hmc, .. } = self;
            lan.qena_updated(i, false, &mut DevCtx { regs, ptp, ints, k }, hmc);
        } else if let Some(i) = ri(addr, regs::qtx_tail(0), 4, NUM_QUEUES) {
            self.regs.qtx_tail[i] = val;
            let FortyGig { regs, ptp, ints, lan, .. } = self;
            lan.tail_updated(i, false, &mut DevCtx { regs, ptp, ints, k });
        } else if let Some(i) = ri(addr, regs::qtx_ctl(0), 4, NUM_QUEUES) {
            self.regs.qtx_ctl[i] = val;
        } else if let Some(i) = ri(addr, regs::qint_rqctl(0), 4, NUM_QUEUES) {
            self.regs.qint_rqctl[i] = val;
        } else if let Some(i) = ri(addr, regs::qrx_ena(0), 4, NUM_QUEUES) {
            self.regs.qrx_ena[i] = val;
            let FortyGig { regs, ptp, ints, lan, hmc, .. } = self;
            lan.qena_updated(i, true, &mut DevCtx { regs, ptp, ints, k }, hmc);
        } else if let Some(i) = ri(addr, regs::qrx_tail(0), 4, NUM_QUEUES) {
            self.regs.qrx_tail[i] = val;
            let FortyGig { regs, ptp, ints, lan, .. } = self;
            lan.tail_updated(i, true, &mut DevCtx { regs, ptp, ints, k });
        } else if let Some(i) =
            ri(addr, regs::glhmc_lantxbase(0), 4, regs::GLHMC_LAN_MAX_INDEX + 1)
        {
            self.regs.glhmc_lantxbase[i] = val;
        } else if let Some(i) =
            ri(addr, regs::glhmc_lantxcnt(0), 4, regs::GLHMC_LAN_MAX_INDEX + 1)
        {
            self.regs.glhmc_lantxcnt[i] = val;
        } else if let Some(i) =
            ri(addr, regs::glhmc_lanrxbase(0), 4, regs::GLHMC_LAN_MAX_INDEX + 1)
        {
            self.regs.glhmc_lanrxbase[i] = val;
        } else if let Some(i) =
            ri(addr, regs::glhmc_lanrxcnt(0), 4, regs::GLHMC_LAN_MAX_INDEX + 1)
        {
            self.regs.glhmc_lanrxcnt[i] = val;
        } else if let Some(i) = ri(addr, regs::pfqf_hkey(0), 128, regs::PFQF_HKEY_MAX_INDEX + 1) {
            self.regs.pfqf_hkey[i] = val;
            self.lan.rss_key_updated();
        } else if let Some(i) = ri(addr, regs::pfqf_hlut(0), 128, regs::PFQF_HLUT_MAX_INDEX + 1) {
            self.regs.pfqf_hlut[i] = val;
        } else if let Some(i) = ri(addr, regs::pfint_itrn(0, 0), 4, NUM_PFINTS) {
            self.regs.pfint_itrn[i][0] = val;
        } else if let Some(i) = ri(addr, regs::pfint_itrn(1, 0), 4, NUM_PFINTS) {
            self.regs.pfint_itrn[i][1] = val;
        } else if let Some(i) = ri(addr, regs::pfint_itrn(2, 0), 4, NUM_PFINTS) {
            self.regs.pfint_itrn[i][2] = val;
        } else {
            match addr {
                regs::PFGEN_CTRL => {
                    if val & regs::PFGEN_CTRL_PFSWR != 0 {
                        self.reset(k, true);
                    }
                }
                regs::GL_FWSTS => {}
                regs::GLGEN_RSTCTL => self.regs.glgen_rstctl = val,
                regs::GLLAN_RCTL_0 => {
                    if val & regs::GLLAN_RCTL_0_PXE_MODE != 0 {
                        self.regs.gllan_rctl_0 &= !regs::GLLAN_RCTL_0_PXE_MODE;
                    }
                }
                regs::GLNVM_SRCTL => {
                    self.regs.glnvm_srctl = val;
                    self.shram.reg_updated(&mut self.regs);
                }
                regs::GLNVM_SRDATA => {
                    self.regs.glnvm_srdata = val;
                    self.shram.reg_updated(&mut self.regs);
                }
                regs::PFINT_LNKLST0 => self.regs.pfint_lnklst0 = val,
                regs::PFINT_ICR0_ENA => self.regs.pfint_icr0_ena = val,
                regs::PFINT_ICR0 => self.regs.pfint_icr0 = val,
                regs::PFINT_STAT_CTL0 => self.regs.pfint_stat_ctl0 = val,
                regs::PFINT_DYN_CTL0 => self.regs.pfint_dyn_ctl0 = val,
                a if a == regs::pfint_itr0(0) => self.regs.pfint_itr0[0] = val,
                a if a == regs::pfint_itr0(1) => self.regs.pfint_itr0[1] = val,
                a if a == regs::pfint_itr0(2) => self.regs.pfint_itr0[2] = val,
                regs::PFHMC_SDCMD => {
                    self.regs.pfhmc_sdcmd = val;
                    self.hmc.sdcmd_updated(&mut self.regs);
                }
                regs::PFHMC_SDDATALOW => self.regs.pfhmc_sddatalow = val,
                regs::PFHMC_SDDATAHIGH => self.regs.pfhmc_sddatahigh = val,
                regs::PFHMC_PDINV => self.regs.pfhmc_pdinv = val,
                regs::PF_ATQBAL => {
                    self.regs.pf_atqba =
                        (self.regs.pf_atqba & 0xffff_ffff_0000_0000) | val as u64;
                    self.atq.reg_updated(&mut self.regs, k);
                }
                regs::PF_ATQBAH => {
                    self.regs.pf_atqba =
                        (self.regs.pf_atqba & 0xffff_ffff) | ((val as u64) << 32);
                    self.atq.reg_updated(&mut self.regs, k);
                }
                regs::PF_ATQLEN => {
                    self.regs.pf_atqlen = val;
                    self.atq.reg_updated(&mut self.regs, k);
                }
                regs::PF_ATQH => {
                    self.regs.pf_atqh = val;
                    self.atq.reg_updated(&mut self.regs, k);
                }
                regs::PF_ATQT => {
                    self.regs.pf_atqt = val;
                    self.atq.reg_updated(&mut self.regs, k);
                }
                regs::PF_ARQBAL => {
                    self.regs.pf_arqba =
                        (self.regs.pf_arqba & 0xffff_ffff_0000_0000) | val as u64;
                }
                regs::PF_ARQBAH => {
                    self.regs.pf_arqba =
                        (self.regs.pf_arqba & 0xffff_ffff) | ((val as u64) << 32);
                }
                regs::PF_ARQLEN => self.regs.pf_arqlen = val,
                regs::PF_ARQH => self.regs.pf_arqh = val,
                regs::PF_ARQT => self.regs.pf_arqt = val,
                regs::PFQF_CTL_0 => self.regs.pfqf_ctl_0 = val,
                regs::PRTDCB_FCCFG => self.regs.prtdcb_fccfg = val,
                regs::PRTDCB_MFLCN => self.regs.prtdcb_mflcn = val,
                regs::PRT_L2TAGSEN => self.regs.prt_l2tagsen = val,
                regs::PRTQF_CTL_0 => self.regs.prtqf_ctl_0 = val,
                regs::GLRPB_GHW => self.regs.glrpb_ghw = val,
                regs::GLRPB_GLW => self.regs.glrpb_glw = val,
                regs::GLRPB_PHW => self.regs.glrpb_phw = val,
                regs::GLRPB_PLW => self.regs.glrpb_plw = val,
                regs::PRTTSYN_CTL0 => self.regs.prtsyn_ctl_0 = val,
                regs::PRTTSYN_CTL1 => self.regs.prtsyn_ctl_1 = val,
                regs::PRTTSYN_INC_L => {
                    self.regs.prtsyn_inc_l = val;
                    let inc =
                        ((self.regs.prtsyn_inc_h as u64) << 32) | self.regs.prtsyn_inc_l as u64;
                    self.ptp.inc_set(k.time_ps(), inc);
                }
                regs::PRTTSYN_INC_H => {
                    self.regs.prtsyn_inc_h = val;
                    let inc =
                        ((self.regs.prtsyn_inc_h as u64) << 32) | self.regs.prtsyn_inc_l as u64;
                    self.ptp.inc_set(k.time_ps(), inc);
                }
                regs::PRTTSYN_ADJ => self.ptp.adj_set(k.time_ps(), val),
                regs::PRTTSYN_TIME_L => self.regs.prtsyn_time_set_l = val,
                regs::PRTTSYN_TIME_H => {
                    let t = ((val as u64) << 32) | self.regs.prtsyn_time_set_l as u64;
                    self.ptp.phc_write(k.time_ps(), t);
                }
                a => {
                    warn!(addr = a, val, "unhandled register write");
                }
            }
        }
    }
}

impl Default for FortyGig {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for FortyGig {
    type DmaTag = DmaTag;

    fn setup_intro(&self, di: &mut PcieDevIntro) {
        di.bars[BAR_REGS as usize] = Bar { len: 4 << 20, flags: BAR_64 };
        di.bars[BAR_IO_IDX as usize] = Bar { len: 32, flags: BAR_IO };
        di.bars[BAR_MSIX as usize] = Bar { len: 32 << 10, flags: BAR_64 | BAR_DUMMY };

        di.vendor_id = VENDOR_ID;
        di.device_id = DEVICE_ID;
        di.class = 0x02;
        di.subclass = 0x00;
        di.revision = 0x01;
        di.msi_nvecs = 32;

        di.msix_nvecs = NUM_PFINTS as u16;
        di.msix_table_bar = BAR_MSIX;
        di.msix_pba_bar = BAR_MSIX;
        di.msix_table_offset = 0x0;
        di.msix_pba_offset = 0x1000;
        di.msix_cap_offset = 0x70;
    }

    fn reg_read(&mut self, k: &mut dyn Kernel<DmaTag>, bar: u8, addr: u64, dest: &mut [u8]) {
        assert!(
            dest.len() == 4 || dest.len() == 8,
            "only 4/8 byte register reads supported (got {})",
            dest.len()
        );
        assert!(bar == BAR_REGS || bar == BAR_IO_IDX, "read from invalid BAR {bar}");

        for (i, chunk) in dest.chunks_mut(4).enumerate() {
            let val = if bar == BAR_REGS {
                self.reg_mem_read32(k, addr + 4 * i as u64)
            } else {
                warn!(addr, "unhandled io read");
                0
            };
            chunk.copy_from_slice(&val.to_le_bytes());
        }
    }

    fn reg_write(&mut self, k: &mut dyn Kernel<DmaTag>, bar: u8, addr: u64, src: &[u8]) {
        assert!(
            src.len() == 4 || src.len() == 8,
            "only 4/8 byte register writes supported (got {})",
            src.len()
        );
        assert!(bar == BAR_REGS || bar == BAR_IO_IDX, "write to invalid BAR {bar}");

        for (i, chunk) in src.chunks(4).enumerate() {
            let val = u32::from_le_bytes(chunk.try_into().unwrap());
            if bar == BAR_REGS {
                self.reg_mem_write32(k, addr + 4 * i as u64, val);
            } else {
                warn!(addr, val, "unhandled io write");
            }
        }
    }

    fn dma_complete(&mut self, k: &mut dyn Kernel<DmaTag>, op: DmaOp<DmaTag>) {
        let FortyGig { regs, ptp, ints, lan, atq, .. } = self;
        let data = op.data;

        match op.tag {
            DmaTag::AtqFetch { pos } => atq.fetch_done(pos, &data, regs, k),
            DmaTag::AtqDataFetch { pos } => atq.data_fetch_done(pos, data, regs, k),
            DmaTag::AtqDataWrite { pos } => atq.data_write_done(pos, regs, k),
            DmaTag::AtqWriteback { pos, cnt } => atq.writeback_done(pos, cnt, regs, k),
            DmaTag::QueueCtxFetch { rx, idx } => {
                let mut ctx = DevCtx { regs, ptp, ints, k };
                if rx {
                    lan.rxqs[idx].ctx_fetched(&data, &mut ctx);
                } else {
                    lan.txqs[idx].ctx_fetched(&data, &mut ctx);
                }
            }
            DmaTag::LanFetch { rx, idx, pos } => {
                let mut ctx = DevCtx { regs, ptp, ints, k };
                if rx {
                    lan.rxqs[idx].fetch_done(pos, &data, &mut ctx);
                } else {
                    lan.txqs[idx].fetch_done(pos, &data, &mut ctx);
                }
            }
            DmaTag::LanDataFetch { rx: _, idx, pos } => {
                let mut ctx = DevCtx { regs, ptp, ints, k };
                lan.txqs[idx].data_fetch_done(pos, data, &mut ctx);
            }
            DmaTag::LanDataWrite { rx: _, idx, pos } => {
                let mut ctx = DevCtx { regs, ptp, ints, k };
                lan.rxqs[idx].data_write_done(pos, &mut ctx);
            }
            DmaTag::LanWriteback { rx, idx, pos, cnt } => {
                let mut ctx = DevCtx { regs, ptp, ints, k };
                if rx {
                    lan.rxqs[idx].writeback_done(pos, cnt, &mut ctx);
                } else {
                    lan.txqs[idx].writeback_done(pos, cnt, &mut ctx);
                }
            }
            DmaTag::TxHeadWriteback { idx, pos, cnt } => {
                let mut ctx = DevCtx { regs, ptp, ints, k };
                lan.txqs[idx].writeback_done(pos, cnt, &mut ctx);
            }
        }
    }

    fn eth_rx(&mut self, k: &mut dyn Kernel<DmaTag>, _port: u8, data: &[u8]) {
        trace!(len = data.len(), "packet received");
        let FortyGig { regs, ptp, ints, lan, .. } = self;
        lan.packet_received(data, &mut DevCtx { regs, ptp, ints, k });
    }

    fn timed_event(&mut self, k: &mut dyn Kernel<DmaTag>, key: u64) {
        self.ints.fire(k, key as u16);
    }
}

