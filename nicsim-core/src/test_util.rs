//! Test support: a [`Kernel`] that records everything a model does.
//!
//! Model crates drive their devices directly in unit tests, feeding DMA
//! completions back by hand and asserting on the recorded traffic.

use crate::dma::DmaOp;
use crate::kernel::Kernel;

/// One entry of the timed-event history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedOp {
    Schedule { key: u64, time: u64 },
    Cancel { key: u64 },
}

pub struct RecordingKernel<T> {
    pub now: u64,
    pub mac: u64,
    pub dmas: Vec<DmaOp<T>>,
    pub frames: Vec<Vec<u8>>,
    pub msis: Vec<u8>,
    pub msixs: Vec<u16>,
    pub sched_log: Vec<SchedOp>,
    pub intx_en: bool,
    pub msi_en: bool,
    pub msix_en: bool,
}

impl<T> RecordingKernel<T> {
    pub fn new() -> Self {
        RecordingKernel {
            now: 0,
            mac: 0x5254_0012_3456,
            dmas: Vec::new(),
            frames: Vec::new(),
            msis: Vec::new(),
            msixs: Vec::new(),
            sched_log: Vec::new(),
            intx_en: false,
            msi_en: false,
            msix_en: true,
        }
    }

    /// Pop the oldest recorded DMA op (issue order).
    pub fn pop_dma(&mut self) -> Option<DmaOp<T>> {
        if self.dmas.is_empty() {
            None
        } else {
            Some(self.dmas.remove(0))
        }
    }

    pub fn take_dmas(&mut self) -> Vec<DmaOp<T>> {
        std::mem::take(&mut self.dmas)
    }

    pub fn take_frames(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.frames)
    }

    /// Replay the schedule/cancel history: the time event `key` is armed
    /// for, or `None` if idle.
    pub fn armed_time(&self, key: u64) -> Option<u64> {
        let mut armed = None;
        for op in &self.sched_log {
            match *op {
                SchedOp::Schedule { key: k, time } if k == key => armed = Some(time),
                SchedOp::Cancel { key: k } if k == key => armed = None,
                _ => {}
            }
        }
        armed
    }

    /// Number of schedule calls recorded for `key`.
    pub fn times_scheduled(&self, key: u64) -> usize {
        self.sched_log
            .iter()
            .filter(|op| matches!(op, SchedOp::Schedule { key: k, .. } if *k == key))
            .count()
    }
}

impl<T> Default for RecordingKernel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Kernel<T> for RecordingKernel<T> {
    fn time_ps(&self) -> u64 {
        self.now
    }

    fn mac_addr(&self) -> u64 {
        self.mac
    }

    fn issue_dma(&mut self, op: DmaOp<T>) {
        self.dmas.push(op);
    }

    fn eth_send(&mut self, data: &[u8]) {
        self.frames.push(data.to_vec());
    }

    fn msi_issue(&mut self, vec: u8) {
        self.msis.push(vec);
    }

    fn msix_issue(&mut self, vec: u16) {
        self.msixs.push(vec);
    }

    fn event_schedule(&mut self, key: u64, time: u64) {
        self.sched_log.push(SchedOp::Schedule { key, time });
    }

    fn event_cancel(&mut self, key: u64) {
        self.sched_log.push(SchedOp::Cancel { key });
    }

    fn intx_enabled(&self) -> bool {
        self.intx_en
    }

    fn msi_enabled(&self) -> bool {
        self.msi_en
    }

    fn msix_enabled(&self) -> bool {
        self.msix_en
    }
}
