//! TX reassembly: byte ranges from host memory back into packet frames.
//!
//! TX notifications describe raw buffers of 64-byte-aligned packets. Packet
//! boundaries come from the IPv4 total-length field; a packet may straddle
//! two notifications, in which case its prefix is parked until the rest
//! arrives.

use tracing::trace;

use crate::MTU;

/// Frames larger than MTU + ethernet overhead indicate a confused driver.
const MAX_FRAME: usize = MTU + 18;

pub struct TxPipeline {
    incomplete_buf: [u8; MAX_FRAME],
    total_pkt_len: usize,
    incomplete_len: usize,
}

impl TxPipeline {
    pub fn new() -> Self {
        TxPipeline { incomplete_buf: [0; MAX_FRAME], total_pkt_len: 0, incomplete_len: 0 }
    }

    pub fn reset(&mut self) {
        self.total_pkt_len = 0;
        self.incomplete_len = 0;
    }

    /// Split `data` into frames, invoking `emit` per completed frame.
    pub fn enqueue_data(&mut self, data: &[u8], mut emit: impl FnMut(&[u8])) {
        let mut cur = data;

        while !cur.is_empty() {
            if self.incomplete_len != 0 {
                // finish the packet left over from the previous notification
                let missing = self.total_pkt_len - self.incomplete_len;
                let take = missing.min(cur.len());
                self.incomplete_buf[self.incomplete_len..self.incomplete_len + take]
                    .copy_from_slice(&cur[..take]);
                self.incomplete_len += take;
                cur = &cur[take..];

                if self.incomplete_len == self.total_pkt_len {
                    trace!(len = self.total_pkt_len, "stitched packet complete");
                    emit(&self.incomplete_buf[..self.total_pkt_len]);
                    // skip the flit padding of the stitched packet
                    let pad = ((self.total_pkt_len + 63) & !63) - self.total_pkt_len;
                    cur = &cur[pad.min(cur.len())..];
                    self.total_pkt_len = 0;
                    self.incomplete_len = 0;
                }
                continue;
            }

            if cur.len() < 34 {
                // not even an IP header worth of bytes: padding, done
                return;
            }
            let ip_len = u16::from_be_bytes([cur[16], cur[17]]) as usize;
            let packet_len = ip_len + 14;
            assert!(packet_len <= MAX_FRAME, "tx packet of {packet_len} bytes exceeds MTU");
            let aligned_len = (packet_len + 63) & !63;

            if packet_len > cur.len() {
                // incomplete packet: park the prefix
                self.incomplete_buf[..cur.len()].copy_from_slice(cur);
                self.total_pkt_len = packet_len;
                self.incomplete_len = cur.len();
                return;
            }

            emit(&cur[..packet_len]);
            cur = &cur[aligned_len.min(cur.len())..];
        }
    }
}

impl Default for TxPipeline {
    fn default() -> Self {
        Self::new()
    }
}
