//! Transport-neutral request/response plumbing shared by [`super::CanTp`] and
//! [`super::IpTp`] (design §4.2 "Layering").

use crate::error::{Error, Result};
use crate::types::NodeAddress;
use std::time::Duration;

/// Service identifiers used on the wire. Modeled on the UDS SIDs where a
/// standard one exists (`0x10`, `0x11`, `0x22`, `0x27`, `0x2E`, `0x34`, `0x36`,
/// `0x37`, `0x38`, `0x3E`); openSYDE-specific services beyond that set are
/// assigned from the manufacturer-specific `0xB0..=0xBF` range, this crate's own
/// wire encoding rather than a claim of byte-compatibility with any other stack.
pub mod service_id {
    pub const DIAGNOSTIC_SESSION_CONTROL: u8 = 0x10;
    pub const ECU_RESET: u8 = 0x11;
    pub const READ_DATA_BY_IDENTIFIER: u8 = 0x22;
    pub const SECURITY_ACCESS: u8 = 0x27;
    pub const WRITE_DATA_BY_IDENTIFIER: u8 = 0x2E;
    pub const REQUEST_DOWNLOAD: u8 = 0x34;
    pub const TRANSFER_DATA: u8 = 0x36;
    pub const REQUEST_TRANSFER_EXIT: u8 = 0x37;
    pub const REQUEST_FILE_TRANSFER: u8 = 0x38;
    pub const TESTER_PRESENT: u8 = 0x3E;
    pub const NEGATIVE_RESPONSE: u8 = 0x7F;

    pub const REQUEST_PROGRAMMING: u8 = 0xB0;
    pub const READ_FILE_BASED_TRANSFER_EXIT_RESULT: u8 = 0xB1;
    pub const ROUTING_ACTIVATION: u8 = 0xB2;
    pub const FACTORY_MODE_MASTER_RESET: u8 = 0xB3;
    pub const READ_ALL_FLASH_BLOCK_DATA: u8 = 0xB4;
    pub const TUNNEL_CAN_FRAME: u8 = 0xB5;
}

/// Negative response codes this crate distinguishes by name (design §4.2,
/// §7 NRC pass-through).
pub mod nrc {
    pub const CONDITIONS_NOT_CORRECT: u8 = 0x22;
    pub const REQUEST_OUT_OF_RANGE: u8 = 0x31;
    pub const INVALID_KEY: u8 = 0x35;
}

/// A positive or negative service response, already stripped of the leading
/// service-ID echo byte.
#[derive(Debug, Clone)]
pub enum ServiceResponse {
    Positive(Vec<u8>),
    Negative(u8),
}

/// The transport-protocol-neutral contract a CAN TP or IP TP provides to
/// [`super::OpenSydeClient`] (design §4.2 "Layering").
pub trait Tp: Send {
    fn set_client_id(&mut self, client: NodeAddress);
    fn set_server_id(&mut self, server: NodeAddress);

    /// Sends one request payload, SID-prefixed by the caller.
    fn send_request(&self, payload: &[u8]) -> Result<()>;

    /// Blocks up to `timeout` for the matching response, recognizing the
    /// `NEGATIVE_RESPONSE` (`0x7F`) wrapper.
    fn recv_response(&self, expected_sid: u8, timeout: Duration) -> Result<ServiceResponse>;

    /// Fire-and-forget `tester_present`, used to keep routed sessions alive
    /// (design §4.3).
    fn send_tester_present(&self) -> Result<()> {
        self.send_request(&[service_id::TESTER_PRESENT, 0x00])
    }
}

pub(super) fn decode_response(expected_sid: u8, payload: &[u8]) -> Result<ServiceResponse> {
    match payload.first() {
        Some(&sid) if sid == service_id::NEGATIVE_RESPONSE => {
            let nrc = *payload.get(2).ok_or_else(|| Error::Config("truncated negative response".into()))?;
            Ok(ServiceResponse::Negative(nrc))
        }
        Some(&sid) if sid == expected_sid | 0x40 => Ok(ServiceResponse::Positive(payload[1..].to_vec())),
        Some(&sid) => Err(Error::Config(format!(
            "unexpected response SID 0x{:02x}, expected 0x{:02x}",
            sid,
            expected_sid | 0x40
        ))),
        None => Err(Error::NoResponse),
    }
}
