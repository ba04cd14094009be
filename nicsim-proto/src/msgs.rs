//! Message frame layouts.
//!
//! Every slot starts with a 16-byte header `{timestamp_ps: u64, pad: [u8; 7],
//! own_type: u8}`. The own/type octet is the synchronization point: bit 7 is
//! the owner flag, bits 0..6 the message type. All other bytes of a frame are
//! written before the release-store that flips the owner bit, and read only
//! after the acquire-load that observes it. All integers are little-endian
//! and encoded explicitly; nothing here relies on in-memory struct layout.

/// Byte offset of the own/type octet within a slot.
pub const OWN_TYPE_OFFSET: usize = 15;
/// Byte offset of the message payload within a slot.
pub const PAYLOAD_OFFSET: usize = 16;

/// Owner flag: set means the consumer side may read the slot.
pub const OWN_CONSUMER: u8 = 0x80;
pub const OWN_MASK: u8 = 0x80;
pub const TYPE_MASK: u8 = 0x7f;

/// Base message types, valid on every queue.
pub const MSG_SYNC: u8 = 0x01;
pub const MSG_TERMINATE: u8 = 0x02;

/// PCIe host-to-device message types.
pub const PCIE_H2D_READ: u8 = 0x40;
pub const PCIE_H2D_WRITE: u8 = 0x41;
pub const PCIE_H2D_READCOMP: u8 = 0x42;
pub const PCIE_H2D_WRITECOMP: u8 = 0x43;
pub const PCIE_H2D_DEVCTRL: u8 = 0x44;

/// PCIe device-to-host message types.
pub const PCIE_D2H_READ: u8 = 0x40;
pub const PCIE_D2H_WRITE: u8 = 0x41;
pub const PCIE_D2H_READCOMP: u8 = 0x42;
pub const PCIE_D2H_WRITECOMP: u8 = 0x43;
pub const PCIE_D2H_INTERRUPT: u8 = 0x44;

/// Ethernet message type (both directions).
pub const ETH_PACKET: u8 = 0x40;

/// Device-control flag bits (`DEVCTRL.flags`).
pub const DEVCTRL_INTX_EN: u64 = 1 << 0;
pub const DEVCTRL_MSI_EN: u64 = 1 << 1;
pub const DEVCTRL_MSIX_EN: u64 = 1 << 2;

/// Interrupt kinds carried by `PCIE_D2H_INTERRUPT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntType {
    LegacyHi = 0,
    LegacyLo = 1,
    Msi = 2,
    Msix = 3,
}

#[inline]
fn get_u16(b: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([b[off], b[off + 1]])
}

#[inline]
fn get_u64(b: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(b[off..off + 8].try_into().unwrap())
}

#[inline]
fn put_u16(b: &mut [u8], off: usize, v: u16) {
    b[off..off + 2].copy_from_slice(&v.to_le_bytes());
}

#[inline]
fn put_u64(b: &mut [u8], off: usize, v: u64) {
    b[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

/// A host-to-device PCIe message, decoded from a slot payload.
#[derive(Debug)]
pub enum PcieH2D<'a> {
    Read { req_id: u64, bar: u8, offset: u64, len: u16 },
    Write { req_id: u64, bar: u8, offset: u64, data: &'a [u8] },
    /// DMA read completion.
    ReadComp { req_id: u64, data: &'a [u8] },
    /// DMA write completion.
    WriteComp { req_id: u64 },
    Devctrl { flags: u64 },
}

/// Decode a host-to-device payload. Returns `None` for unknown types.
pub fn decode_pcie_h2d(msg_type: u8, payload: &[u8]) -> Option<PcieH2D<'_>> {
    match msg_type {
        PCIE_H2D_READ => Some(PcieH2D::Read {
            req_id: get_u64(payload, 0),
            offset: get_u64(payload, 8),
            len: get_u16(payload, 16),
            bar: payload[18],
        }),
        PCIE_H2D_WRITE => {
            let len = get_u16(payload, 16) as usize;
            Some(PcieH2D::Write {
                req_id: get_u64(payload, 0),
                offset: get_u64(payload, 8),
                bar: payload[18],
                data: &payload[24..24 + len],
            })
        }
        PCIE_H2D_READCOMP => {
            let len = get_u16(payload, 8) as usize;
            Some(PcieH2D::ReadComp {
                req_id: get_u64(payload, 0),
                data: &payload[16..16 + len],
            })
        }
        PCIE_H2D_WRITECOMP => Some(PcieH2D::WriteComp {
            req_id: get_u64(payload, 0),
        }),
        PCIE_H2D_DEVCTRL => Some(PcieH2D::Devctrl {
            flags: get_u64(payload, 0),
        }),
        _ => None,
    }
}

/// Encode an MMIO read completion into `payload`; returns the message type.
pub fn encode_d2h_readcomp(payload: &mut [u8], req_id: u64, data: &[u8]) -> u8 {
    put_u64(payload, 0, req_id);
    put_u16(payload, 8, data.len() as u16);
    payload[16..16 + data.len()].copy_from_slice(data);
    PCIE_D2H_READCOMP
}

/// Encode an MMIO write completion.
pub fn encode_d2h_writecomp(payload: &mut [u8], req_id: u64) -> u8 {
    put_u64(payload, 0, req_id);
    PCIE_D2H_WRITECOMP
}

/// Encode a device-initiated DMA read request.
pub fn encode_d2h_read(payload: &mut [u8], req_id: u64, addr: u64, len: u16) -> u8 {
    put_u64(payload, 0, req_id);
    put_u64(payload, 8, addr);
    put_u16(payload, 16, len);
    PCIE_D2H_READ
}

/// Encode a device-initiated DMA write request with its data.
pub fn encode_d2h_write(payload: &mut [u8], req_id: u64, addr: u64, data: &[u8]) -> u8 {
    put_u64(payload, 0, req_id);
    put_u64(payload, 8, addr);
    put_u16(payload, 16, data.len() as u16);
    payload[24..24 + data.len()].copy_from_slice(data);
    PCIE_D2H_WRITE
}

/// Encode an interrupt message.
pub fn encode_d2h_interrupt(payload: &mut [u8], vector: u16, inttype: IntType) -> u8 {
    put_u16(payload, 0, vector);
    payload[2] = inttype as u8;
    PCIE_D2H_INTERRUPT
}

/// Decoded host-side view of a device-to-host message (used by tests and
/// host-simulator adapters).
#[derive(Debug)]
pub enum PcieD2H<'a> {
    Read { req_id: u64, addr: u64, len: u16 },
    Write { req_id: u64, addr: u64, data: &'a [u8] },
    ReadComp { req_id: u64, data: &'a [u8] },
    WriteComp { req_id: u64 },
    Interrupt { vector: u16, inttype: u8 },
}

pub fn decode_pcie_d2h(msg_type: u8, payload: &[u8]) -> Option<PcieD2H<'_>> {
    match msg_type {
        PCIE_D2H_READ => Some(PcieD2H::Read {
            req_id: get_u64(payload, 0),
            addr: get_u64(payload, 8),
            len: get_u16(payload, 16),
        }),
        PCIE_D2H_WRITE => {
            let len = get_u16(payload, 16) as usize;
            Some(PcieD2H::Write {
                req_id: get_u64(payload, 0),
                addr: get_u64(payload, 8),
                data: &payload[24..24 + len],
            })
        }
        PCIE_D2H_READCOMP => {
            let len = get_u16(payload, 8) as usize;
            Some(PcieD2H::ReadComp {
                req_id: get_u64(payload, 0),
                data: &payload[16..16 + len],
            })
        }
        PCIE_D2H_WRITECOMP => Some(PcieD2H::WriteComp {
            req_id: get_u64(payload, 0),
        }),
        PCIE_D2H_INTERRUPT => Some(PcieD2H::Interrupt {
            vector: get_u16(payload, 0),
            inttype: payload[2],
        }),
        _ => None,
    }
}

/// Encode host-to-device messages (host-simulator side, also used by tests).
pub fn encode_h2d_read(payload: &mut [u8], req_id: u64, bar: u8, offset: u64, len: u16) -> u8 {
    put_u64(payload, 0, req_id);
    put_u64(payload, 8, offset);
    put_u16(payload, 16, len);
    payload[18] = bar;
    PCIE_H2D_READ
}

pub fn encode_h2d_write(payload: &mut [u8], req_id: u64, bar: u8, offset: u64, data: &[u8]) -> u8 {
    put_u64(payload, 0, req_id);
    put_u64(payload, 8, offset);
    put_u16(payload, 16, data.len() as u16);
    payload[18] = bar;
    payload[24..24 + data.len()].copy_from_slice(data);
    PCIE_H2D_WRITE
}

pub fn encode_h2d_readcomp(payload: &mut [u8], req_id: u64, data: &[u8]) -> u8 {
    put_u64(payload, 0, req_id);
    put_u16(payload, 8, data.len() as u16);
    payload[16..16 + data.len()].copy_from_slice(data);
    PCIE_H2D_READCOMP
}

pub fn encode_h2d_writecomp(payload: &mut [u8], req_id: u64) -> u8 {
    put_u64(payload, 0, req_id);
    PCIE_H2D_WRITECOMP
}

pub fn encode_h2d_devctrl(payload: &mut [u8], flags: u64) -> u8 {
    put_u64(payload, 0, flags);
    PCIE_H2D_DEVCTRL
}

/// Encode an Ethernet frame message; used in both directions.
pub fn encode_eth_packet(payload: &mut [u8], port: u8, data: &[u8]) -> u8 {
    put_u16(payload, 0, data.len() as u16);
    payload[2] = port;
    payload[8..8 + data.len()].copy_from_slice(data);
    ETH_PACKET
}

/// Decode an Ethernet frame message, returning `(port, data)`.
pub fn decode_eth_packet(payload: &[u8]) -> (u8, &[u8]) {
    let len = get_u16(payload, 0) as usize;
    (payload[2], &payload[8..8 + len])
}

/// Bytes of payload available for DMA data in a slot of `entry_size` bytes.
pub fn max_dma_payload(entry_size: usize) -> usize {
    entry_size - 64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_h2d_write_roundtrip() {
        let mut payload = vec![0u8; 256];
        let t = encode_h2d_write(&mut payload, 7, 2, 0x1000, &[1, 2, 3, 4]);
        assert_eq!(t, PCIE_H2D_WRITE);

        match decode_pcie_h2d(t, &payload).unwrap() {
            PcieH2D::Write { req_id, bar, offset, data } => {
                assert_eq!(req_id, 7);
                assert_eq!(bar, 2);
                assert_eq!(offset, 0x1000);
                assert_eq!(data, &[1, 2, 3, 4]);
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn test_d2h_dma_roundtrip() {
        let mut payload = vec![0u8; 256];
        let t = encode_d2h_write(&mut payload, 99, 0xdead_beef, &[0xaa; 32]);
        match decode_pcie_d2h(t, &payload).unwrap() {
            PcieD2H::Write { req_id, addr, data } => {
                assert_eq!(req_id, 99);
                assert_eq!(addr, 0xdead_beef);
                assert_eq!(data, &[0xaa; 32]);
            }
            other => panic!("decoded {other:?}"),
        }

        let t = encode_d2h_read(&mut payload, 100, 0x2000, 64);
        match decode_pcie_d2h(t, &payload).unwrap() {
            PcieD2H::Read { req_id, addr, len } => {
                assert_eq!((req_id, addr, len), (100, 0x2000, 64));
            }
            other => panic!("decoded {other:?}"),
        }
    }

    #[test]
    fn test_eth_roundtrip() {
        let mut payload = vec![0u8; 128];
        let frame = [0x52u8, 0x54, 0, 1, 2, 3, 0xff];
        let t = encode_eth_packet(&mut payload, 0, &frame);
        assert_eq!(t, ETH_PACKET);
        let (port, data) = decode_eth_packet(&payload);
        assert_eq!(port, 0);
        assert_eq!(data, &frame);
    }

    #[test]
    fn test_interrupt_roundtrip() {
        let mut payload = vec![0u8; 64];
        let t = encode_d2h_interrupt(&mut payload, 5, IntType::Msix);
        match decode_pcie_d2h(t, &payload).unwrap() {
            PcieD2H::Interrupt { vector, inttype } => {
                assert_eq!(vector, 5);
                assert_eq!(inttype, IntType::Msix as u8);
            }
            other => panic!("decoded {other:?}"),
        }
    }
}
