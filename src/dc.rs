//! Device configuration sequence (design §4.4), grounded in
//! `C_OscDcBasicSequences.cpp`'s `Init`/`ScanEnterFlashloader`/`ScanGetInfo`/
//! `ConfigureDevice`/`ResetSystem`.

use crate::dispatcher::{CanDispatcher, SocketCanTransport};
use crate::error::{Error, Result};
use crate::opensyde::{
    CanBroadcasts, CanTp, DataIdentifier, DiagnosticSession, OpenSydeClient, SecurityLevel, Tp,
};
use crate::reporter::Reporter;
use crate::types::{NodeAddress, SerialNumber};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

const SCAN_TIME: Duration = Duration::from_secs(5);
const PREPROGRAMMING_BROADCAST_INTERVAL: Duration = Duration::from_millis(5);

/// One unique, responding device surfaced by [`DcBasicSequences::scan_get_info`]
/// (design §3.1, supplemented from `C_OscDcDeviceInformation`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub node_id: u8,
    pub serial_number: SerialNumber,
    pub device_name: Option<String>,
    pub security_activated: bool,
}

impl fmt::Display for DiscoveredDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "   Node ID: {}", self.node_id)?;
        if let Some(name) = &self.device_name {
            writeln!(f, "   Device name: {}", name)?;
        }
        writeln!(f, "   Serial number: {}", self.serial_number)?;
        writeln!(f, "   Security activated: {}", if self.security_activated { "yes" } else { "no" })
    }
}

/// A human-readable discovery report (design §3.1, supplemented from
/// `h_DevicesInfoToString`), printed by the CLI's `scan` subcommand (design §6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoverySummary {
    pub devices: Vec<DiscoveredDevice>,
}

impl fmt::Display for DiscoverySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Found {} device(s):", self.devices.len())?;
        for (index, device) in self.devices.iter().enumerate() {
            writeln!(f, " Device #{}", index + 1)?;
            write!(f, "{}", device)?;
        }
        if !self.devices.is_empty() {
            let security_used = self.devices.iter().any(|d| d.security_activated);
            writeln!(f, " Security feature used for at least one device: {}", if security_used { "yes" } else { "no" })?;
        }
        Ok(())
    }
}

pub struct DcBasicSequences {
    dispatcher: Arc<CanDispatcher>,
    broadcasts: CanBroadcasts,
}

impl DcBasicSequences {
    /// `Init(can_dll, bitrate)`: opens the CAN hardware, binds the TP, and
    /// configures the fixed client identity `(bus=0, node=126)` (design §4.4
    /// step 1). `can_dll` is accepted for interface parity with the original
    /// multi-vendor DLL loader; this crate only ever opens a `socketcan`
    /// interface by name.
    pub fn init(can_interface: &str, _bitrate_kbps: u32) -> Result<Self> {
        let transport = SocketCanTransport::open(can_interface)?;
        let dispatcher = Arc::new(CanDispatcher::new(Box::new(transport)));
        let broadcasts = CanBroadcasts::new(&dispatcher);
        Ok(Self { dispatcher, broadcasts })
    }

    /// `ScanEnterFlashloader(wait_ms)` (design §4.4 step 2).
    pub fn scan_enter_flashloader(&self, wait_ms: u32, reporter: &dyn Reporter) -> Result<()> {
        reporter.info("dc-scan", "starting the scan for flashloader activation");
        let wait_time = Duration::from_millis(wait_ms as u64).max(SCAN_TIME);

        let results = self.broadcasts.request_programming()?;
        reporter.info(
            "dc-scan",
            &format!("broadcasting \"request programming\" flag: {} device(s) answered", results.len()),
        );
        if results.iter().any(|r| !r.request_accepted) {
            reporter.warning("dc-scan", "at least one reached device did not accept the request-programming flag");
        }

        self.broadcasts.ecu_reset()?;

        if results.is_empty() {
            reporter.warning(
                "dc-scan",
                &format!(
                    "you now have {} seconds time to turn on your target device...",
                    SCAN_TIME.as_secs()
                ),
            );
        }

        let deadline = std::time::Instant::now() + wait_time;
        while std::time::Instant::now() < deadline {
            self.broadcasts.enter_preprogramming_session()?;
            std::thread::sleep(PREPROGRAMMING_BROADCAST_INTERVAL);
        }

        reporter.info("dc-scan", "scan for flashloader activation finished");
        Ok(())
    }

    /// `ScanGetInfo()` (design §4.4 step 3). Fails `CHECKSUM` if any responder
    /// reports security activated while node IDs are not yet unique, since
    /// broadcast cannot safely address a secured, ambiguous device.
    pub fn scan_get_info(&self, reporter: &dyn Reporter) -> Result<DiscoverySummary> {
        reporter.info("dc-scan", "starting the scan for getting device information");
        let responses = self.broadcasts.read_serial_number()?;

        let duplicates = duplicate_node_ids(responses.iter().map(|r| r.sender.node_id()));

        let mut devices = Vec::new();
        for response in responses {
            if duplicates.contains(&response.sender.node_id()) {
                continue;
            }
            let device_name = self.read_device_name(response.sender).ok();
            devices.push(DiscoveredDevice {
                node_id: response.sender.node_id(),
                serial_number: response.serial_number,
                device_name,
                security_activated: response.security_activated,
            });
        }

        if !duplicates.is_empty() && devices.iter().any(|d| d.security_activated) {
            return Err(Error::Checksum(
                "security is activated on a node sharing a duplicate node ID; unique IDs are required before a \
                 secured device can be addressed"
                    .into(),
            ));
        }

        Ok(DiscoverySummary { devices })
    }

    fn read_device_name(&self, target: NodeAddress) -> Result<String> {
        let mut tp = CanTp::new(&self.dispatcher, 0x600 + target.node_id() as u32);
        tp.set_client_id(NodeAddress::client());
        tp.set_server_id(target);
        let client = OpenSydeClient::new(Box::new(tp));
        let name = client.read_data_by_identifier(DataIdentifier::DeviceName)?;
        Ok(String::from_utf8_lossy(&name).trim_end_matches('\0').to_string())
    }

    /// `ConfigureDevice(cur_id, new_id, bitrate_kbps, iface_idx)` (design §4.4
    /// step 4). Uses the fixed non-secure seed/key pair; a seed other than `42`
    /// is logged as a warning, not treated as a failure (grounded in
    /// `ConfigureDevice`'s `PrintFormatted` warning).
    pub fn configure_device(
        &self,
        current_node_id: u8,
        new_node_id: u8,
        bitrate_kbps: u32,
        _interface_index: u8,
        reporter: &dyn Reporter,
    ) -> Result<()> {
        let target = NodeAddress::new(0, current_node_id)
            .ok_or_else(|| Error::Range(format!("invalid current node ID {}", current_node_id)))?;
        let mut tp = CanTp::new(&self.dispatcher, 0x600 + target.node_id() as u32);
        tp.set_client_id(NodeAddress::client());
        tp.set_server_id(target);
        let mut client = OpenSydeClient::new(Box::new(tp));

        client.diagnostic_session_control(DiagnosticSession::Programming)?;
        client.authenticate(SecurityLevel::Level1, 1, false, None)?;

        client.write_data_by_identifier(DataIdentifier::NodeId, &[new_node_id])?;
        let bitrate_bps = bitrate_kbps * 1000;
        client.write_data_by_identifier(DataIdentifier::Bitrate, &bitrate_bps.to_be_bytes())?;

        reporter.info(
            "dc-configure",
            &format!("node {} reconfigured to ID {} at {} kbit/s", current_node_id, new_node_id, bitrate_kbps),
        );
        Ok(())
    }

    /// `ResetSystem()` (design §4.4 step 5).
    pub fn reset_system(&self) -> Result<()> {
        self.broadcasts.ecu_reset()
    }
}

/// Node IDs that appear more than once among broadcast responders (design
/// §4.4 step 3).
fn duplicate_node_ids(node_ids: impl Iterator<Item = u8>) -> HashSet<u8> {
    let mut seen = HashSet::new();
    let mut duplicates = HashSet::new();
    for id in node_ids {
        if !seen.insert(id) {
            duplicates.insert(id);
        }
    }
    duplicates
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_node_ids_are_flagged() {
        let duplicates = duplicate_node_ids([1, 2, 2, 3, 1].into_iter());
        assert_eq!(duplicates, [1, 2].into_iter().collect());
    }

    #[test]
    fn unique_node_ids_have_no_duplicates() {
        let duplicates = duplicate_node_ids([1, 2, 3].into_iter());
        assert!(duplicates.is_empty());
    }
}
