//! Host-memory cache: translation of device-virtual queue-context
//! addresses into host DMA addresses.
//!
//! The driver programs up to 4096 segment descriptors through the
//! `PFHMC_SD*` register protocol; queue engines then issue memory ops with
//! device-virtual addresses that resolve through the table. Operations
//! through invalid segments fail and report through `PFHMC_ERRORINFO`;
//! operations straddling a segment boundary are a driver bug the model does
//! not tolerate.

use nicsim_core::{DmaOp, Kernel};
use tracing::{debug, warn};

use crate::device::DmaTag;
use crate::regs::{self, Regs};

const MAX_SEGMENTS: usize = 0x1000;
/// Segment granularity: device-virtual address bits below the segment index.
const SEGMENT_SHIFT: u32 = 21;

#[derive(Debug, Clone, Copy, Default)]
struct Segment {
    addr: u64,
    pgcount: u16,
    valid: bool,
    direct: bool,
}

pub struct HostMemCache {
    segs: Vec<Segment>,
}

impl HostMemCache {
    pub fn new() -> Self {
        HostMemCache { segs: vec![Segment::default(); MAX_SEGMENTS] }
    }

    pub fn reset(&mut self) {
        for s in &mut self.segs {
            *s = Segment::default();
        }
    }

    /// `PFHMC_SDCMD` was written: transfer one segment descriptor between
    /// the data registers and the table.
    pub fn sdcmd_updated(&mut self, regs: &mut Regs) {
        let cmd = regs.pfhmc_sdcmd;
        let idx = (cmd & regs::PFHMC_SDCMD_PMSDIDX_MASK) as usize;

        if cmd & regs::PFHMC_SDCMD_PMSDWR != 0 {
            let lo = regs.pfhmc_sddatalow;
            let hi = regs.pfhmc_sddatahigh;
            let seg = &mut self.segs[idx];
            seg.addr = (((lo & regs::PFHMC_SDDATALOW_PMSDDATALOW_MASK)
                >> regs::PFHMC_SDDATALOW_PMSDDATALOW_SHIFT) as u64)
                << 12;
            seg.addr |= (hi as u64) << 32;
            seg.pgcount = ((lo & regs::PFHMC_SDDATALOW_PMSDBPCOUNT_MASK)
                >> regs::PFHMC_SDDATALOW_PMSDBPCOUNT_SHIFT) as u16;
            seg.valid = lo & regs::PFHMC_SDDATALOW_PMSDVALID != 0;
            seg.direct = lo & regs::PFHMC_SDDATALOW_PMSDTYPE != 0;
            debug!(
                idx,
                addr = seg.addr,
                pgcount = seg.pgcount,
                valid = seg.valid,
                direct = seg.direct,
                "hmc segment written"
            );
        } else {
            let seg = self.segs[idx];
            let mut lo = ((seg.addr >> 12) as u32) << regs::PFHMC_SDDATALOW_PMSDDATALOW_SHIFT
                & regs::PFHMC_SDDATALOW_PMSDDATALOW_MASK;
            lo |= ((seg.pgcount as u32) << regs::PFHMC_SDDATALOW_PMSDBPCOUNT_SHIFT)
                & regs::PFHMC_SDDATALOW_PMSDBPCOUNT_MASK;
            if seg.valid {
                lo |= regs::PFHMC_SDDATALOW_PMSDVALID;
            }
            if seg.direct {
                lo |= regs::PFHMC_SDDATALOW_PMSDTYPE;
            }
            regs.pfhmc_sddatalow = lo;
            regs.pfhmc_sddatahigh = (seg.addr >> 32) as u32;
        }
    }

    /// Resolve a device-virtual address and issue the memory op through the
    /// DMA engine. Returns false (with the error register set) if the
    /// segment cannot serve it.
    pub fn issue_mem_op(
        &self,
        regs: &mut Regs,
        k: &mut dyn Kernel<DmaTag>,
        addr: u64,
        len: usize,
        write: bool,
        data: Vec<u8>,
        tag: DmaTag,
    ) -> bool {
        let seg_idx = (addr >> SEGMENT_SHIFT) as usize;
        let seg_idx_last = ((addr + len as u64 - 1) >> SEGMENT_SHIFT) as usize;
        let dir_off = addr & ((1 << SEGMENT_SHIFT) - 1);

        assert!(seg_idx < MAX_SEGMENTS, "hmc segment index out of range: {seg_idx}");
        assert!(
            seg_idx == seg_idx_last,
            "hmc op straddles segments addr={addr:#x} len={len}"
        );

        let seg = &self.segs[seg_idx];
        if !seg.valid {
            warn!(addr, seg_idx, "hmc op through invalid segment");
            regs.pfhmc_errorinfo = regs::PFHMC_ERRORINFO_INVALID_SD | seg_idx as u32;
            return false;
        }
        if !seg.direct {
            warn!(addr, seg_idx, "hmc op through paged segment unsupported");
            regs.pfhmc_errorinfo = regs::PFHMC_ERRORINFO_INVALID_SD | seg_idx as u32;
            return false;
        }

        let host_addr = seg.addr + dir_off;
        debug!(hmc_addr = addr, host_addr, len, write, "hmc op resolved");
        if write {
            k.issue_dma(DmaOp::write(host_addr, data, tag));
        } else {
            k.issue_dma(DmaOp::read(host_addr, len, tag));
        }
        true
    }
}

impl Default for HostMemCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nicsim_core::test_util::RecordingKernel;

    fn program_segment(hmc: &mut HostMemCache, regs: &mut Regs, idx: u32, addr: u64, direct: bool) {
        regs.pfhmc_sddatalow = (((addr >> 12) as u32) << regs::PFHMC_SDDATALOW_PMSDDATALOW_SHIFT)
            | (1 << regs::PFHMC_SDDATALOW_PMSDBPCOUNT_SHIFT)
            | regs::PFHMC_SDDATALOW_PMSDVALID
            | if direct { regs::PFHMC_SDDATALOW_PMSDTYPE } else { 0 };
        regs.pfhmc_sddatahigh = (addr >> 32) as u32;
        regs.pfhmc_sdcmd = regs::PFHMC_SDCMD_PMSDWR | idx;
        hmc.sdcmd_updated(regs);
    }

    #[test]
    fn test_segment_write_read_roundtrip() {
        let mut hmc = HostMemCache::new();
        let mut regs = Regs::default();
        program_segment(&mut hmc, &mut regs, 2, 0x1_2345_6000, true);

        regs.pfhmc_sdcmd = 2; // read command
        regs.pfhmc_sddatalow = 0;
        regs.pfhmc_sddatahigh = 0;
        hmc.sdcmd_updated(&mut regs);

        assert_eq!(regs.pfhmc_sddatahigh, 0x1);
        assert!(regs.pfhmc_sddatalow & regs::PFHMC_SDDATALOW_PMSDVALID != 0);
        assert!(regs.pfhmc_sddatalow & regs::PFHMC_SDDATALOW_PMSDTYPE != 0);
        assert_eq!(
            (regs.pfhmc_sddatalow & regs::PFHMC_SDDATALOW_PMSDDATALOW_MASK)
                >> regs::PFHMC_SDDATALOW_PMSDDATALOW_SHIFT,
            0x23456
        );
    }

    #[test]
    fn test_mem_op_translates_through_segment() {
        let mut hmc = HostMemCache::new();
        let mut regs = Regs::default();
        let mut k: RecordingKernel<DmaTag> = RecordingKernel::new();
        program_segment(&mut hmc, &mut regs, 1, 0xaaaa_0000, true);

        // segment 1 covers device-virtual [1<<21, 2<<21)
        let dv_addr = (1u64 << 21) + 0x340;
        let ok = hmc.issue_mem_op(
            &mut regs,
            &mut k,
            dv_addr,
            32,
            false,
            Vec::new(),
            DmaTag::QueueCtxFetch { rx: true, idx: 0 },
        );
        assert!(ok);

        let op = k.pop_dma().unwrap();
        assert_eq!(op.addr, 0xaaaa_0000 + 0x340);
        assert_eq!(op.data.len(), 32);
        assert!(!op.write);
    }

    #[test]
    fn test_invalid_segment_sets_errorinfo() {
        let mut hmc = HostMemCache::new();
        let mut regs = Regs::default();
        let mut k: RecordingKernel<DmaTag> = RecordingKernel::new();

        let ok = hmc.issue_mem_op(
            &mut regs,
            &mut k,
            5 << 21,
            32,
            false,
            Vec::new(),
            DmaTag::QueueCtxFetch { rx: true, idx: 0 },
        );
        assert!(!ok);
        assert!(regs.pfhmc_errorinfo & regs::PFHMC_ERRORINFO_INVALID_SD != 0);
        assert_eq!(regs.pfhmc_errorinfo & 0xfff, 5);
        assert!(k.dmas.is_empty());
    }

    #[test]
    #[should_panic(expected = "straddles")]
    fn test_straddling_op_panics() {
        let mut hmc = HostMemCache::new();
        let mut regs = Regs::default();
        let mut k: RecordingKernel<DmaTag> = RecordingKernel::new();
        program_segment(&mut hmc, &mut regs, 0, 0x1000, true);
        program_segment(&mut hmc, &mut regs, 1, 0x2000, true);

        hmc.issue_mem_op(
            &mut regs,
            &mut k,
            (1 << 21) - 16,
            32,
            false,
            Vec::new(),
            DmaTag::QueueCtxFetch { rx: false, idx: 0 },
        );
    }
}
