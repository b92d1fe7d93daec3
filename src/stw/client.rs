//! Request/response engine for a single STW Flashloader target (design §4.1).
//!
//! Grounded in `CXFLProtocol.h`'s method surface (`GetLocalID`, `GetSectorCount`,
//! `EraseSector`, `WakeupLocalId`, ...): each of those becomes one method here that
//! builds an 8-byte CAN frame and waits for a matching reply via
//! [`StwClient::request`].

use crate::dispatcher::{CanDispatcher, CanFilter, CanFrame, DispatcherHandle, RX_ID_WILDCARD};
use crate::error::{Error, Result};
use crate::types::{CompanyId, FlashIc, FlashInformation, FlashRegion, SerialNumber, ServiceBitmap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Command bytes for the STW Flashloader's one-request/one-response services
/// (design §4.1). These are this crate's own wire encoding: the original threads
/// every service through a single "node flash function" call gated by subcommand;
/// here each subcommand gets a named constant.
pub mod service_id {
    pub const WAKEUP_LOCAL_ID: u8 = 0x01;
    pub const WAKEUP_SERIAL_NUMBER: u8 = 0x02;
    pub const GET_DEVICE_ID: u8 = 0x10;
    pub const GET_SECTOR_COUNT: u8 = 0x11;
    pub const GET_VERSION_NUMBER: u8 = 0x12;
    pub const GET_SERIAL_NUMBER: u8 = 0x13;
    pub const GET_CONTROL_ID: u8 = 0x14;
    pub const GET_FLASH_INFORMATION: u8 = 0x15;
    pub const GET_IMPLEMENTATION_INFORMATION: u8 = 0x16;
    pub const GET_FINGERPRINT: u8 = 0x17;
    pub const GET_BLOCK_ADDRESSES: u8 = 0x18;
    pub const GET_BLOCK_CHECKSUM: u8 = 0x19;
    pub const GET_BLOCK_COMPARE_MODE: u8 = 0x1A;
    pub const GET_SECTOR_CHECKSUM: u8 = 0x1B;
    pub const GET_ERASE_COUNT: u8 = 0x1C;

    pub const ERASE_SECTOR: u8 = 0x20;
    pub const PROG_FLASH: u8 = 0x21;
    pub const SEND_HEX_LINE: u8 = 0x22;
    pub const SET_SECTOR_CHECKSUM: u8 = 0x23;
    pub const SET_BLOCK_CHECKSUM: u8 = 0x24;
    pub const SET_BLOCK_COMPARE_MODE: u8 = 0x25;
    pub const SET_FINGERPRINT: u8 = 0x26;
    pub const SET_LOCAL_ID: u8 = 0x27;
    pub const SET_CAN_BITRATE: u8 = 0x28;
    pub const SET_TEMP_BITRATE: u8 = 0x29;
    pub const SET_XFL_EXCHANGE: u8 = 0x2A;

    pub const NODE_SLEEP: u8 = 0x30;
    pub const NODE_RETURN: u8 = 0x31;
    pub const NODE_RESET: u8 = 0x32;
    pub const NET_SLEEP: u8 = 0x33;
    pub const NET_RESET: u8 = 0x34;
    pub const NET_START: u8 = 0x35;

    pub const FLASH_BROADCAST: &[u8; 5] = b"FLASH";
}

/// Addressing and timing settings for one STW target (design §4.1 frame model).
#[derive(Debug, Clone, Copy)]
pub struct StwClientConfig {
    pub tx_id: u32,
    pub rx_id: u32,
    pub extended: bool,
    pub local_id: u8,
    pub timeout_default: Duration,
    pub timeout_erase: Duration,
}

impl Default for StwClientConfig {
    fn default() -> Self {
        Self {
            tx_id: 0x51,
            rx_id: RX_ID_WILDCARD,
            extended: false,
            local_id: 0,
            timeout_default: Duration::from_millis(1000),
            timeout_erase: Duration::from_millis(15500),
        }
    }
}

pub struct StwClient {
    dispatcher: Weak<CanDispatcher>,
    handle: DispatcherHandle,
    config: StwClientConfig,
}

impl StwClient {
    pub fn new(dispatcher: &Arc<CanDispatcher>, config: StwClientConfig) -> Self {
        let handle = dispatcher.register(CanFilter { rx_id: config.rx_id });
        Self {
            dispatcher: Arc::downgrade(dispatcher),
            handle,
            config,
        }
    }

    pub fn local_id(&self) -> u8 {
        self.config.local_id
    }

    fn dispatcher(&self) -> Result<Arc<CanDispatcher>> {
        self.dispatcher
            .upgrade()
            .ok_or_else(|| Error::Config("STW client's dispatcher has been dropped".into()))
    }

    /// Retargets this client's RX filter, e.g. after it is handed to a
    /// legacy-routing dispatcher and back (design §4.3).
    pub fn reconfigure_rx(&self, rx_id: u32) -> Result<()> {
        self.dispatcher()?
            .reconfigure(self.handle, CanFilter { rx_id })
    }

    /// Sends one request frame and waits for a response whose first payload byte
    /// matches the target's local ID (or the broadcast marker `0xFF`) and whose
    /// following bytes match `match_prefix` (design §4.1 "Response matching").
    pub fn request(
        &self,
        cmd: u8,
        payload: &[u8],
        match_prefix: &[u8],
        timeout: Duration,
    ) -> Result<CanFrame> {
        let dispatcher = self.dispatcher()?;
        let mut data = Vec::with_capacity(8);
        data.push(self.config.local_id);
        data.push(cmd);
        data.extend_from_slice(payload);
        let frame = CanFrame::new(self.config.tx_id, self.config.extended, &data);
        dispatcher.send(frame)?;

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(response) = dispatcher.poll(self.handle)? {
                if self.response_matches(&response, match_prefix) {
                    return Ok(response);
                }
                continue;
            }
            if Instant::now() >= deadline {
                return Err(Error::NoResponse);
            }
        }
    }

    fn response_matches(&self, frame: &CanFrame, match_prefix: &[u8]) -> bool {
        let payload = frame.payload();
        if payload.is_empty() {
            return false;
        }
        let addressed = payload[0] == self.config.local_id || payload[0] == 0xFF;
        addressed && payload.len() >= 1 + match_prefix.len() && payload[1..1 + match_prefix.len()] == *match_prefix
    }

    fn default_timeout(&self) -> Duration {
        self.config.timeout_default
    }

    // ---- Wake-up variants (design §4.1) ----

    pub fn wakeup_local_id(&self, company_id: &CompanyId) -> Result<()> {
        self.request(
            service_id::WAKEUP_LOCAL_ID,
            company_id.as_bytes(),
            &[],
            self.default_timeout(),
        )?;
        Ok(())
    }

    pub fn wakeup_serial_number(&self, serial: &SerialNumber, company_id: &CompanyId) -> Result<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(company_id.as_bytes());
        let response = self.request(
            service_id::WAKEUP_SERIAL_NUMBER,
            &payload,
            &[],
            self.default_timeout(),
        )?;
        let local_id = response
            .payload()
            .get(2)
            .copied()
            .ok_or_else(|| Error::Range("wakeup-by-serial-number reply too short".into()))?;
        Ok(local_id)
    }

    /// Sends a "FLASH" wake-up burst every `interval` for `window`, to bring a
    /// just-powered node into a listening state (design §4.1).
    pub fn send_flash_burst(&self, window: Duration, interval: Duration) -> Result<()> {
        let dispatcher = self.dispatcher()?;
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            let frame = CanFrame::new(self.config.tx_id, self.config.extended, service_id::FLASH_BROADCAST);
            dispatcher.send(frame)?;
            std::thread::sleep(interval);
        }
        Ok(())
    }

    // ---- Reads ----

    pub fn get_device_id(&self, long_id: bool) -> Result<String> {
        let response = self.request(
            service_id::GET_DEVICE_ID,
            &[long_id as u8],
            &[],
            self.default_timeout(),
        )?;
        let bytes = &response.payload()[2..];
        Ok(String::from_utf8_lossy(bytes)
            .trim_end_matches('\0')
            .to_string())
    }

    pub fn get_sector_count(&self) -> Result<u16> {
        let response = self.request(service_id::GET_SECTOR_COUNT, &[], &[], self.default_timeout())?;
        Ok(u16::from_le_bytes([response.payload()[2], response.payload()[3]]))
    }

    pub fn get_version_number(&self) -> Result<Vec<u8>> {
        let response = self.request(
            service_id::GET_VERSION_NUMBER,
            &[],
            &[],
            self.default_timeout(),
        )?;
        Ok(response.payload()[2..].to_vec())
    }

    pub fn get_serial_number(&self) -> Result<SerialNumber> {
        let response = self.request(
            service_id::GET_SERIAL_NUMBER,
            &[],
            &[],
            self.default_timeout(),
        )?;
        let data = &response.payload()[2..];
        if data.len() < 6 {
            return Err(Error::Range("serial number reply too short".into()));
        }
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&data[..6]);
        SerialNumber::classic(bytes)
    }

    pub fn get_control_id(&self) -> Result<u32> {
        let response = self.request(service_id::GET_CONTROL_ID, &[], &[], self.default_timeout())?;
        let p = response.payload();
        Ok(u32::from_le_bytes([p[2], p[3], p[4], p[5]]))
    }

    /// Reads the full flash-information record by iterating the IC/region
    /// sub-index scheme `CXFLProtocol::GetFlashInformation` exposes.
    pub fn get_flash_information(&self) -> Result<FlashInformation> {
        let response = self.request(
            service_id::GET_FLASH_INFORMATION,
            &[0],
            &[0],
            self.default_timeout(),
        )?;
        let ic_count = response.payload()[2];

        let mut ics = Vec::with_capacity(ic_count as usize);
        for ic_index in 0..ic_count {
            let total_size_resp = self.request(
                service_id::GET_FLASH_INFORMATION,
                &[1, ic_index],
                &[1, ic_index],
                self.default_timeout(),
            )?;
            let p = total_size_resp.payload();
            let total_size = u32::from_le_bytes([p[2], p[3], p[4], p[5]]);

            let offset_resp = self.request(
                service_id::GET_FLASH_INFORMATION,
                &[2, ic_index],
                &[2, ic_index],
                self.default_timeout(),
            )?;
            let p = offset_resp.payload();
            let offset = u32::from_le_bytes([p[2], p[3], p[4], p[5]]);

            let region_count_resp = self.request(
                service_id::GET_FLASH_INFORMATION,
                &[3, ic_index],
                &[3, ic_index],
                self.default_timeout(),
            )?;
            let region_count = region_count_resp.payload()[2];

            let mut regions = Vec::with_capacity(region_count as usize);
            for region_index in 0..region_count {
                let region_resp = self.request(
                    service_id::GET_FLASH_INFORMATION,
                    &[4, ic_index, region_index],
                    &[4, ic_index, region_index],
                    self.default_timeout(),
                )?;
                let p = region_resp.payload();
                let block_size = u32::from_le_bytes([p[2], p[3], p[4], p[5]]);
                // Granularity 0 means "1" (design §9 resolution, see DESIGN.md).
                let block_size = if block_size == 0 { 1 } else { block_size };
                let block_count_resp = self.request(
                    service_id::GET_FLASH_INFORMATION,
                    &[5, ic_index, region_index],
                    &[5, ic_index, region_index],
                    self.default_timeout(),
                )?;
                let block_count = u16::from_le_bytes([
                    block_count_resp.payload()[2],
                    block_count_resp.payload()[3],
                ]) as u32;
                regions.push(FlashRegion {
                    block_size,
                    block_count,
                });
            }

            let erase_time_resp = self.request(
                service_id::GET_FLASH_INFORMATION,
                &[6, ic_index],
                &[6, ic_index],
                self.default_timeout(),
            )?;
            let p = erase_time_resp.payload();
            let max_erase_time_ms = u32::from_le_bytes([p[2], p[3], p[4], p[5]]);

            let write_time_resp = self.request(
                service_id::GET_FLASH_INFORMATION,
                &[7, ic_index],
                &[7, ic_index],
                self.default_timeout(),
            )?;
            let p = write_time_resp.payload();
            let max_write_time_ms = u32::from_le_bytes([p[2], p[3], p[4], p[5]]);

            ics.push(FlashIc {
                total_size,
                offset,
                regions,
                max_erase_time_ms,
                max_write_time_ms,
            });
        }

        Ok(FlashInformation {
            ics,
            aliases: Vec::new(),
        })
    }

    /// Implementation information sub-index 0: protocol version; 1: services bitmap.
    pub fn get_implementation_protocol_version(&self) -> Result<u16> {
        let response = self.request(
            service_id::GET_IMPLEMENTATION_INFORMATION,
            &[0],
            &[0],
            self.default_timeout(),
        )?;
        let p = response.payload();
        Ok(u16::from_le_bytes([p[2], p[3]]))
    }

    pub fn get_implementation_services(&self) -> Result<ServiceBitmap> {
        let num_bytes = (crate::types::NUM_SERVICE_BITS + 7) / 8;
        let mut bytes = Vec::with_capacity(num_bytes);
        for chunk_index in 0..num_bytes as u8 {
            let response = self.request(
                service_id::GET_IMPLEMENTATION_INFORMATION,
                &[1, chunk_index],
                &[1, chunk_index],
                self.default_timeout(),
            )?;
            bytes.push(response.payload()[2]);
        }
        Ok(ServiceBitmap::from_bytes(&bytes))
    }

    pub fn get_implementation_hex_records(&self) -> Result<(u8, u8)> {
        let response = self.request(
            service_id::GET_IMPLEMENTATION_INFORMATION,
            &[2],
            &[2],
            self.default_timeout(),
        )?;
        let p = response.payload();
        // Granularity of 0 is a legacy convention for "1" (design §9).
        let granularity = if p[3] == 0 { 1 } else { p[3] };
        Ok((p[2], granularity))
    }

    pub fn get_fingerprint_supported_indexes(&self) -> Result<u8> {
        let response = self.request(
            service_id::GET_FINGERPRINT,
            &[0xFF],
            &[0xFF],
            self.default_timeout(),
        )?;
        Ok(response.payload()[2])
    }

    // ---- Writes ----

    pub fn erase_sector(&self, sector_number: u16) -> Result<()> {
        self.erase_sector_with_timeout(sector_number, self.config.timeout_erase)
    }

    /// Erases one sector, waiting up to `timeout` instead of the client's
    /// default erase timeout. Used when the IC being erased reports its own
    /// max erase time (design §4.1 step 9).
    pub fn erase_sector_with_timeout(&self, sector_number: u16, timeout: Duration) -> Result<()> {
        self.request(service_id::ERASE_SECTOR, &sector_number.to_le_bytes(), &[], timeout)?;
        Ok(())
    }

    pub fn prog_flash(&self) -> Result<()> {
        self.request(service_id::PROG_FLASH, &[], &[], self.default_timeout())?;
        Ok(())
    }

    pub fn send_hex_line(&self, line: &[u8]) -> Result<()> {
        self.request(service_id::SEND_HEX_LINE, line, &[], self.default_timeout())?;
        Ok(())
    }

    pub fn set_sector_checksum(&self, sector_number: u16) -> Result<u32> {
        let response = self.request(
            service_id::SET_SECTOR_CHECKSUM,
            &sector_number.to_le_bytes(),
            &[],
            self.default_timeout(),
        )?;
        let p = response.payload();
        Ok(u32::from_le_bytes([p[2], p[3], p[4], p[5]]))
    }

    pub fn set_block_checksum(&self, block_number: u8) -> Result<u32> {
        let response = self.request(
            service_id::SET_BLOCK_CHECKSUM,
            &[block_number],
            &[],
            self.default_timeout(),
        )?;
        let p = response.payload();
        Ok(u32::from_le_bytes([p[2], p[3], p[4], p[5]]))
    }

    pub fn set_fingerprint_field(&self, index: u8, params: &[u8; 4]) -> Result<()> {
        let mut payload = vec![index];
        payload.extend_from_slice(params);
        self.request(service_id::SET_FINGERPRINT, &payload, &[], self.default_timeout())?;
        Ok(())
    }

    pub fn set_local_id(&mut self, new_local_id: u8) -> Result<()> {
        self.request(
            service_id::SET_LOCAL_ID,
            &[new_local_id],
            &[],
            self.default_timeout(),
        )?;
        self.config.local_id = new_local_id;
        Ok(())
    }

    pub fn set_can_bitrate(&self, bitrate_bps: u32) -> Result<()> {
        self.request(
            service_id::SET_CAN_BITRATE,
            &bitrate_bps.to_le_bytes(),
            &[],
            self.default_timeout(),
        )?;
        Ok(())
    }

    pub fn set_temp_bitrate(&self, bitrate_bps: u32) -> Result<()> {
        self.request(
            service_id::SET_TEMP_BITRATE,
            &bitrate_bps.to_le_bytes(),
            &[],
            self.default_timeout(),
        )?;
        Ok(())
    }

    pub fn set_xfl_exchange(&self) -> Result<()> {
        self.request(service_id::SET_XFL_EXCHANGE, &[], &[], self.default_timeout())?;
        Ok(())
    }

    // ---- Terminal services ----

    pub fn node_sleep(&self) -> Result<()> {
        self.request(service_id::NODE_SLEEP, &[], &[], self.default_timeout())?;
        Ok(())
    }

    pub fn node_return(&self) -> Result<()> {
        self.request(service_id::NODE_RETURN, &[], &[], self.default_timeout())?;
        Ok(())
    }

    pub fn node_reset(&self) -> Result<()> {
        self.request(service_id::NODE_RESET, &[], &[], self.default_timeout())?;
        Ok(())
    }

    pub fn net_sleep(&self) -> Result<()> {
        self.request(service_id::NET_SLEEP, &[], &[], self.default_timeout())?;
        Ok(())
    }

    pub fn net_reset(&self) -> Result<()> {
        self.request(service_id::NET_RESET, &[], &[], self.default_timeout())?;
        Ok(())
    }

    pub fn net_start(&self) -> Result<()> {
        self.request(service_id::NET_START, &[], &[], self.default_timeout())?;
        Ok(())
    }
}

impl Drop for StwClient {
    fn drop(&mut self) {
        if let Ok(dispatcher) = self.dispatcher() {
            dispatcher.unregister(self.handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::CanTransport;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockBus {
        inbox: Mutex<VecDeque<CanFrame>>,
        sent: Mutex<Vec<CanFrame>>,
    }

    impl CanTransport for MockBus {
        fn send_frame(&self, frame: &CanFrame) -> Result<()> {
            self.sent.lock().unwrap().push(*frame);
            Ok(())
        }

        fn try_recv_frame(&self) -> Result<Option<CanFrame>> {
            Ok(self.inbox.lock().unwrap().pop_front())
        }
    }

    struct SharedBus(Arc<MockBus>);
    impl CanTransport for SharedBus {
        fn send_frame(&self, frame: &CanFrame) -> Result<()> {
            self.0.send_frame(frame)
        }
        fn try_recv_frame(&self) -> Result<Option<CanFrame>> {
            self.0.try_recv_frame()
        }
    }

    #[test]
    fn request_times_out_with_no_response() {
        let bus = Arc::new(MockBus::default());
        let dispatcher = Arc::new(CanDispatcher::new(Box::new(SharedBus(bus))));
        let client = StwClient::new(
            &dispatcher,
            StwClientConfig {
                timeout_default: Duration::from_millis(20),
                ..Default::default()
            },
        );
        let result = client.get_sector_count();
        assert!(matches!(result, Err(Error::NoResponse)));
    }

    #[test]
    fn request_matches_addressed_response() {
        let bus = Arc::new(MockBus::default());
        bus.inbox.lock().unwrap().push_back(CanFrame::new(
            0x51,
            false,
            &[0, service_id::GET_SECTOR_COUNT, 0x10, 0x00, 0, 0, 0, 0],
        ));
        let dispatcher = Arc::new(CanDispatcher::new(Box::new(SharedBus(bus))));
        let client = StwClient::new(&dispatcher, StwClientConfig::default());
        let sectors = client.get_sector_count().unwrap();
        assert_eq!(sectors, 0x0010);
    }

    #[test]
    fn broadcast_addressed_response_is_accepted() {
        let bus = Arc::new(MockBus::default());
        bus.inbox.lock().unwrap().push_back(CanFrame::new(
            0x51,
            false,
            &[0xFF, service_id::GET_CONTROL_ID, 1, 0, 0, 0, 0, 0],
        ));
        let dispatcher = Arc::new(CanDispatcher::new(Box::new(SharedBus(bus))));
        let client = StwClient::new(&dispatcher, StwClientConfig::default());
        assert_eq!(client.get_control_id().unwrap(), 1);
    }
}
