//! CLI surface of a device instance.

use std::path::PathBuf;

use clap::Parser;
use nicsim_proto::SyncMode;

/// One co-simulated NIC endpoint. Several instances can share a process by
/// separating their argument lists with `--`.
#[derive(Parser, Debug, Clone)]
#[command(about = "NIC behavioral model co-simulation endpoint")]
pub struct NicArgs {
    /// Unix socket to listen on for the PCIe peer (host simulator)
    pub pci_socket: PathBuf,

    /// Unix socket to listen on for the Ethernet peer (network simulator)
    pub eth_socket: PathBuf,

    /// Backing file for the shared memory pool
    pub shm_path: PathBuf,

    /// Synchronization mode: disabled, optional or required
    #[arg(default_value = "optional")]
    pub sync_mode: SyncMode,

    /// Simulated start time in picoseconds
    #[arg(default_value_t = 0)]
    pub start_tick: u64,

    /// Maximum gap between sync messages in nanoseconds
    #[arg(default_value_t = 500)]
    pub sync_period: u64,

    /// PCIe link latency in nanoseconds
    #[arg(default_value_t = 500)]
    pub pci_latency: u64,

    /// Ethernet link latency in nanoseconds
    #[arg(default_value_t = 500)]
    pub eth_latency: u64,

    /// Device clock frequency in MHz
    #[arg(default_value_t = 1000)]
    pub clock_mhz: u64,

    /// Override the device MAC address (aa:bb:cc:dd:ee:ff)
    #[arg(long)]
    pub mac: Option<String>,
}

impl NicArgs {
    /// MAC for device instance `idx`, honoring an explicit override.
    pub fn mac_addr(&self, idx: usize) -> u64 {
        self.mac
            .as_deref()
            .and_then(parse_mac)
            .unwrap_or(0x5254_0000_0000 | ((idx as u64 & 0xffff) << 8) | 0x01)
    }
}

/// Parse a `:`-separated MAC string into its u64 value (first octet in the
/// most significant used byte).
pub fn parse_mac(s: &str) -> Option<u64> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return None;
    }

    let mut mac = 0u64;
    for part in parts {
        mac = (mac << 8) | u8::from_str_radix(part, 16).ok()? as u64;
    }
    Some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        assert_eq!(parse_mac("52:54:00:12:34:56"), Some(0x5254_0012_3456));
        assert!(parse_mac("invalid").is_none());
        assert!(parse_mac("52:54:00:12:34").is_none()); // too short
        assert!(parse_mac("52:54:00:12:34:56:78").is_none()); // too long
        assert!(parse_mac("GG:54:00:12:34:56").is_none()); // invalid hex
    }

    #[test]
    fn test_args_defaults() {
        let args = NicArgs::parse_from(["nicsim", "/tmp/pci", "/tmp/eth", "/tmp/shm"]);
        assert_eq!(args.sync_mode, SyncMode::Optional);
        assert_eq!(args.start_tick, 0);
        assert_eq!(args.sync_period, 500);
        assert_eq!(args.mac_addr(3), 0x5254_0000_0301);
    }

    #[test]
    fn test_args_positional_overrides() {
        let args = NicArgs::parse_from([
            "nicsim", "/tmp/pci", "/tmp/eth", "/tmp/shm", "required", "1000", "250", "100", "100",
            "625",
        ]);
        assert_eq!(args.sync_mode, SyncMode::Required);
        assert_eq!(args.start_tick, 1000);
        assert_eq!(args.sync_period, 250);
        assert_eq!(args.pci_latency, 100);
        assert_eq!(args.clock_mhz, 625);
    }
}
