//! RX flow director: exact-match steering of packets to pipes.

use std::collections::HashMap;

use smoltcp::wire::{EthernetFrame, EthernetProtocol, Ipv4Packet, TcpPacket, UdpPacket};
use tracing::{debug, trace};

const IP_PROTO_TCP: u8 = 6;
const IP_PROTO_UDP: u8 = 17;

/// Lookup key; unmatched fields are zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourTuple {
    pub dst_port: u16,
    pub src_port: u16,
    pub dst_ip: u32,
    pub src_ip: u32,
}

impl FourTuple {
    /// Fallback-queue spreading hash.
    fn fold(&self) -> u32 {
        self.dst_port as u32
            ^ ((self.src_port as u32) << 1)
            ^ (self.dst_ip << 2)
            ^ (self.src_ip << 3)
    }
}

/// Where the flow director sends a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Steer {
    Pipe(u32),
    Drop,
}

pub struct RxPipeline {
    pub enable_rr: bool,
    flow_table: HashMap<FourTuple, u32>,
    fallback_queues: u32,
    fallback_queue_mask: u32,
    next_queue: u32,
}

impl RxPipeline {
    pub fn new() -> Self {
        RxPipeline {
            enable_rr: false,
            flow_table: HashMap::new(),
            fallback_queues: 0,
            fallback_queue_mask: 0,
            next_queue: 0,
        }
    }

    pub fn add_flow_table_entry(
        &mut self,
        dst_port: u16,
        src_port: u16,
        dst_ip: u32,
        src_ip: u32,
        pipe_id: u32,
    ) {
        let tuple = FourTuple { dst_port, src_port, dst_ip, src_ip };
        debug!(?tuple, pipe_id, "flow table entry");
        self.flow_table.insert(tuple, pipe_id);
    }

    pub fn set_fallback_queues(&mut self, queues: u32, mask: u32) {
        self.fallback_queues = queues;
        self.fallback_queue_mask = mask;
    }

    pub fn reset(&mut self) {
        self.flow_table.clear();
        self.fallback_queues = 0;
        self.fallback_queue_mask = 0;
        self.next_queue = 0;
        self.enable_rr = false;
    }

    /// Extract the packet's tuple: full 4-tuple for TCP, destination-only
    /// for UDP, destination IP only for other IPv4 traffic.
    fn tuple_of(data: &[u8]) -> Option<FourTuple> {
        let frame = EthernetFrame::new_unchecked(data);
        if frame.ethertype() != EthernetProtocol::Ipv4 {
            return None;
        }
        let ip = Ipv4Packet::new_checked(frame.payload()).ok()?;
        let dst_ip = u32::from_be_bytes(ip.dst_addr().octets());
        let src_ip = u32::from_be_bytes(ip.src_addr().octets());

        Some(match u8::from(ip.next_header()) {
            IP_PROTO_TCP => {
                let tcp = TcpPacket::new_checked(ip.payload()).ok()?;
                FourTuple {
                    dst_port: tcp.dst_port(),
                    src_port: tcp.src_port(),
                    dst_ip,
                    src_ip,
                }
            }
            IP_PROTO_UDP => {
                let udp = UdpPacket::new_checked(ip.payload()).ok()?;
                FourTuple { dst_port: udp.dst_port(), src_port: 0, dst_ip, src_ip: 0 }
            }
            _ => FourTuple { dst_port: 0, src_port: 0, dst_ip, src_ip: 0 },
        })
    }

    /// Pick the destination pipe for a packet.
    pub fn steer(&mut self, data: &[u8]) -> Steer {
        let Some(tuple) = Self::tuple_of(data) else {
            return Steer::Drop;
        };

        if let Some(&pipe) = self.flow_table.get(&tuple) {
            trace!(?tuple, pipe, "flow table hit");
            return Steer::Pipe(pipe);
        }

        if self.fallback_queues == 0 {
            trace!(?tuple, "no flow match, dropping");
            return Steer::Drop;
        }

        let pipe = if self.enable_rr {
            let q = self.next_queue;
            self.next_queue = (self.next_queue + 1) & self.fallback_queue_mask;
            q
        } else {
            tuple.fold() & self.fallback_queue_mask
        };
        trace!(?tuple, pipe, "fallback queue");
        Steer::Pipe(pipe)
    }
}

impl Default for RxPipeline {
    fn default() -> Self {
        Self::new()
    }
}
