//! Intro handshake payloads.
//!
//! Two intro messages are exchanged over the unix socket after connecting,
//! in either order. The listener intro carries the queue geometry and is
//! accompanied by the SHM fd as ancillary data; a fixed-size upper-layer
//! intro (for PCIe: the device identity and BAR map) immediately follows the
//! base intro in the same datagram.

use crate::{Error, Result};

pub const FLAG_SYNC: u64 = 1 << 0;
pub const FLAG_SYNC_FORCE: u64 = 1 << 1;

pub const LISTENER_INTRO_LEN: usize = 80;
pub const CONNECTER_INTRO_LEN: usize = 32;

/// Base intro sent by the listener.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerIntro {
    pub version: u64,
    pub flags: u64,
    /// Listener-to-connecter queue: pool offset, entry size, entry count.
    pub l2c_offset: u64,
    pub l2c_elen: u64,
    pub l2c_nentries: u64,
    /// Connecter-to-listener queue.
    pub c2l_offset: u64,
    pub c2l_elen: u64,
    pub c2l_nentries: u64,
    pub upper_layer_proto: u64,
    pub upper_layer_intro_off: u64,
}

impl ListenerIntro {
    pub fn encode(&self) -> [u8; LISTENER_INTRO_LEN] {
        let mut b = [0u8; LISTENER_INTRO_LEN];
        for (i, v) in [
            self.version,
            self.flags,
            self.l2c_offset,
            self.l2c_elen,
            self.l2c_nentries,
            self.c2l_offset,
            self.c2l_elen,
            self.c2l_nentries,
            self.upper_layer_proto,
            self.upper_layer_intro_off,
        ]
        .iter()
        .enumerate()
        {
            b[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
        }
        b
    }

    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < LISTENER_INTRO_LEN {
            return Err(Error::BadIntro);
        }
        let f = |i: usize| u64::from_le_bytes(b[i * 8..i * 8 + 8].try_into().unwrap());
        Ok(ListenerIntro {
            version: f(0),
            flags: f(1),
            l2c_offset: f(2),
            l2c_elen: f(3),
            l2c_nentries: f(4),
            c2l_offset: f(5),
            c2l_elen: f(6),
            c2l_nentries: f(7),
            upper_layer_proto: f(8),
            upper_layer_intro_off: f(9),
        })
    }
}

/// Base intro sent by the connecter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnecterIntro {
    pub version: u64,
    pub flags: u64,
    pub upper_layer_proto: u64,
    pub upper_layer_intro_off: u64,
}

impl ConnecterIntro {
    pub fn encode(&self) -> [u8; CONNECTER_INTRO_LEN] {
        let mut b = [0u8; CONNECTER_INTRO_LEN];
        for (i, v) in [
            self.version,
            self.flags,
            self.upper_layer_proto,
            self.upper_layer_intro_off,
        ]
        .iter()
        .enumerate()
        {
            b[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
        }
        b
    }

    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < CONNECTER_INTRO_LEN {
            return Err(Error::BadIntro);
        }
        let f = |i: usize| u64::from_le_bytes(b[i * 8..i * 8 + 8].try_into().unwrap());
        Ok(ConnecterIntro {
            version: f(0),
            flags: f(1),
            upper_layer_proto: f(2),
            upper_layer_intro_off: f(3),
        })
    }
}

/// BAR flag bits in the PCIe device intro.
pub const BAR_64: u64 = 1 << 0;
pub const BAR_IO: u64 = 1 << 1;
pub const BAR_PREFETCH: u64 = 1 << 2;
/// The host allocates the region but never forwards accesses to it
/// (e.g. MSI-X tables the host itself interprets).
pub const BAR_DUMMY: u64 = 1 << 3;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Bar {
    pub len: u64,
    pub flags: u64,
}

/// Upper-layer intro for PCIe interfaces: everything the host needs to
/// enumerate the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PcieDevIntro {
    pub bars: [Bar; 6],
    pub vendor_id: u16,
    pub device_id: u16,
    pub class: u8,
    pub subclass: u8,
    pub revision: u8,
    pub msi_nvecs: u16,
    pub msix_nvecs: u16,
    pub msix_table_bar: u8,
    pub msix_pba_bar: u8,
    pub msix_table_offset: u32,
    pub msix_pba_offset: u32,
    pub msix_cap_offset: u16,
}

pub const PCIE_DEV_INTRO_LEN: usize = 128;

impl PcieDevIntro {
    pub fn encode(&self) -> [u8; PCIE_DEV_INTRO_LEN] {
        let mut b = [0u8; PCIE_DEV_INTRO_LEN];
        for (i, bar) in self.bars.iter().enumerate() {
            b[i * 16..i * 16 + 8].copy_from_slice(&bar.len.to_le_bytes());
            b[i * 16 + 8..i * 16 + 16].copy_from_slice(&bar.flags.to_le_bytes());
        }
        b[96..98].copy_from_slice(&self.vendor_id.to_le_bytes());
        b[98..100].copy_from_slice(&self.device_id.to_le_bytes());
        b[100] = self.class;
        b[101] = self.subclass;
        b[102] = self.revision;
        b[104..106].copy_from_slice(&self.msi_nvecs.to_le_bytes());
        b[106..108].copy_from_slice(&self.msix_nvecs.to_le_bytes());
        b[108] = self.msix_table_bar;
        b[109] = self.msix_pba_bar;
        b[112..116].copy_from_slice(&self.msix_table_offset.to_le_bytes());
        b[116..120].copy_from_slice(&self.msix_pba_offset.to_le_bytes());
        b[120..122].copy_from_slice(&self.msix_cap_offset.to_le_bytes());
        b
    }

    pub fn decode(b: &[u8]) -> Result<Self> {
        if b.len() < PCIE_DEV_INTRO_LEN {
            return Err(Error::BadIntro);
        }
        let mut di = PcieDevIntro::default();
        for i in 0..6 {
            di.bars[i].len = u64::from_le_bytes(b[i * 16..i * 16 + 8].try_into().unwrap());
            di.bars[i].flags =
                u64::from_le_bytes(b[i * 16 + 8..i * 16 + 16].try_into().unwrap());
        }
        di.vendor_id = u16::from_le_bytes(b[96..98].try_into().unwrap());
        di.device_id = u16::from_le_bytes(b[98..100].try_into().unwrap());
        di.class = b[100];
        di.subclass = b[101];
        di.revision = b[102];
        di.msi_nvecs = u16::from_le_bytes(b[104..106].try_into().unwrap());
        di.msix_nvecs = u16::from_le_bytes(b[106..108].try_into().unwrap());
        di.msix_table_bar = b[108];
        di.msix_pba_bar = b[109];
        di.msix_table_offset = u32::from_le_bytes(b[112..116].try_into().unwrap());
        di.msix_pba_offset = u32::from_le_bytes(b[116..120].try_into().unwrap());
        di.msix_cap_offset = u16::from_le_bytes(b[120..122].try_into().unwrap());
        Ok(di)
    }
}
