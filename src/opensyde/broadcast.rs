//! CAN and IP broadcast primitives used for device discovery (design §4.2
//! "Broadcasts"). Each call sends once, then collects every distinct responder
//! that answers within a fixed window — multiple nodes may share a bus.

use crate::dispatcher::{CanDispatcher, CanFilter, CanFrame, DispatcherHandle, IpDispatcher, IpEndpoint, RX_ID_WILDCARD};
use crate::error::Result;
use crate::types::{ExtendedEncoding, NodeAddress, SerialNumber};
use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

const FUNCTIONAL_BROADCAST_ID: u32 = 0x7DF;
const COLLECTION_WINDOW: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastRequestProgrammingResult {
    pub sender: NodeAddress,
    pub request_accepted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastDeviceInfo {
    pub sender: NodeAddress,
    pub serial_number: SerialNumber,
    pub security_activated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastIpDeviceInfo {
    pub source_ip: Ipv4Addr,
    pub device_name: String,
}

/// CAN-side broadcasts (design §4.2 "Broadcasts: CAN").
pub struct CanBroadcasts {
    dispatcher: Weak<CanDispatcher>,
    handle: DispatcherHandle,
}

impl CanBroadcasts {
    pub fn new(dispatcher: &Arc<CanDispatcher>) -> Self {
        let handle = dispatcher.register(CanFilter { rx_id: RX_ID_WILDCARD });
        Self {
            dispatcher: Arc::downgrade(dispatcher),
            handle,
        }
    }

    fn dispatcher(&self) -> Result<Arc<CanDispatcher>> {
        self.dispatcher
            .upgrade()
            .ok_or_else(|| crate::error::Error::Config("CAN dispatcher has been dropped".into()))
    }

    fn collect(&self, request: CanFrame) -> Result<Vec<CanFrame>> {
        let dispatcher = self.dispatcher()?;
        dispatcher.drain(self.handle)?;
        dispatcher.send(request)?;
        let deadline = Instant::now() + COLLECTION_WINDOW;
        let mut responses = Vec::new();
        while Instant::now() < deadline {
            if let Some(frame) = dispatcher.poll(self.handle)? {
                responses.push(frame);
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(responses)
    }

    pub fn request_programming(&self) -> Result<Vec<BroadcastRequestProgrammingResult>> {
        let request = CanFrame::new(FUNCTIONAL_BROADCAST_ID, false, &[0xB0]);
        let responses = self.collect(request)?;
        Ok(responses
            .into_iter()
            .filter_map(|frame| {
                let data = frame.payload();
                let node_id = *data.first()?;
                let accepted = data.get(1).copied().unwrap_or(0) == 1;
                Some(BroadcastRequestProgrammingResult {
                    sender: NodeAddress::new(0, node_id)?,
                    request_accepted: accepted,
                })
            })
            .collect())
    }

    pub fn ecu_reset(&self) -> Result<()> {
        self.dispatcher()?.send(CanFrame::new(FUNCTIONAL_BROADCAST_ID, false, &[0x11, 0x01]))
    }

    pub fn enter_preprogramming_session(&self) -> Result<()> {
        self.dispatcher()?.send(CanFrame::new(FUNCTIONAL_BROADCAST_ID, false, &[0x10, 0x02]))
    }

    pub fn enter_default_session(&self) -> Result<()> {
        self.dispatcher()?.send(CanFrame::new(FUNCTIONAL_BROADCAST_ID, false, &[0x10, 0x01]))
    }

    /// Collects both classic and extended serial numbers reported within the
    /// collection window (design §4.2, §4.4 `ScanGetInfo`). The two forms are
    /// queried as separate broadcasts (DID `0xA001` classic, `0xA002`
    /// extended) since a single classic-CAN frame has no room for a format
    /// discriminant alongside a variable-length payload; a device answers
    /// whichever DID matches the serial-number form it actually carries.
    ///
    /// Every reply dedicates its last byte to a security-activated flag
    /// (design §4.4 step 3, §8 scenario 4: duplicate node IDs plus security
    /// activated must fail `ScanGetInfo` with `CHECKSUM`), which leaves the
    /// classic form's fixed 6 BCD bytes exactly filling the rest of an 8-byte
    /// frame, and caps the extended form at 5 bytes of serial data — this
    /// broadcast path has no multi-frame segmentation, unlike the
    /// point-to-point TP.
    pub fn read_serial_number(&self) -> Result<Vec<BroadcastDeviceInfo>> {
        let mut devices = Vec::new();

        let classic_request = CanFrame::new(FUNCTIONAL_BROADCAST_ID, false, &[0x22, 0xA0, 0x01]);
        for frame in self.collect(classic_request)? {
            let data = frame.payload();
            if data.len() < 8 {
                continue;
            }
            let (Some(node_id), Some(serial)) = (
                NodeAddress::new(0, data[0]),
                data[1..7].try_into().ok().and_then(|b| SerialNumber::classic(b).ok()),
            ) else {
                continue;
            };
            devices.push(BroadcastDeviceInfo {
                sender: node_id,
                serial_number: serial,
                security_activated: data[7] != 0,
            });
        }

        let extended_request = CanFrame::new(FUNCTIONAL_BROADCAST_ID, false, &[0x22, 0xA0, 0x02]);
        for frame in self.collect(extended_request)? {
            let data = frame.payload();
            if data.len() < 4 {
                continue;
            }
            let encoding = match data[1] {
                1 => ExtendedEncoding::Bcd,
                2 => ExtendedEncoding::Fsn,
                _ => continue,
            };
            let security_byte = data.len() - 1;
            let (Some(node_id), Some(serial)) = (
                NodeAddress::new(0, data[0]),
                SerialNumber::extended(encoding, data[2..security_byte].to_vec()).ok(),
            ) else {
                continue;
            };
            devices.push(BroadcastDeviceInfo {
                sender: node_id,
                serial_number: serial,
                security_activated: data[security_byte] != 0,
            });
        }

        Ok(devices)
    }

    pub fn set_node_id_by_serial(&self, serial: &SerialNumber, new_node_id: u8) -> Result<()> {
        let mut payload = vec![0x2E, 0xA0, 0x12];
        match serial {
            SerialNumber::Classic(bytes) => payload.extend_from_slice(bytes),
            SerialNumber::Extended { bytes, .. } => payload.extend_from_slice(bytes),
        }
        payload.push(new_node_id);
        self.dispatcher()?.send(CanFrame::new(FUNCTIONAL_BROADCAST_ID, false, &payload))
    }
}

/// IP-side broadcasts (design §4.2 "Broadcasts: IP"), using UDP on the
/// discovery port.
pub struct IpBroadcasts {
    dispatcher: Weak<IpDispatcher>,
    discovery: IpEndpoint,
}

impl IpBroadcasts {
    pub fn new(dispatcher: &Arc<IpDispatcher>, discovery: IpEndpoint) -> Self {
        Self {
            dispatcher: Arc::downgrade(dispatcher),
            discovery,
        }
    }

    fn dispatcher(&self) -> Result<Arc<IpDispatcher>> {
        self.dispatcher
            .upgrade()
            .ok_or_else(|| crate::error::Error::Config("IP dispatcher has been dropped".into()))
    }

    fn collect(&self, payload: &[u8]) -> Result<Vec<(IpEndpoint, Vec<u8>)>> {
        let dispatcher = self.dispatcher()?;
        dispatcher.send_broadcast(self.discovery, payload)?;
        let deadline = Instant::now() + COLLECTION_WINDOW;
        let mut responses = Vec::new();
        while Instant::now() < deadline {
            if let Some(response) = dispatcher.poll_broadcast()? {
                responses.push(response);
            } else {
                std::thread::sleep(Duration::from_millis(1));
            }
        }
        Ok(responses)
    }

    pub fn request_programming(&self) -> Result<()> {
        self.dispatcher()?.send_broadcast(self.discovery, &[0xB0])
    }

    pub fn net_reset(&self) -> Result<()> {
        self.dispatcher()?.send_broadcast(self.discovery, &[0x11, 0x01])
    }

    /// Collects `{source_ip, device_name}` from both classic and extended
    /// responders (design §4.2).
    pub fn get_device_info(&self) -> Result<Vec<BroadcastIpDeviceInfo>> {
        let responses = self.collect(&[0x22, 0xA0, 0x00])?;
        Ok(responses
            .into_iter()
            .map(|(from, data)| BroadcastIpDeviceInfo {
                source_ip: from.addr,
                device_name: String::from_utf8_lossy(&data).trim_end_matches('\0').to_string(),
            })
            .collect())
    }

    /// Targets a single node by serial number; returns the source IP of whoever
    /// accepted the new address (design §4.2).
    pub fn set_ip_address(&self, serial: &SerialNumber, new_address: Ipv4Addr) -> Result<Option<Ipv4Addr>> {
        let mut payload = vec![0x2E, 0xA0, 0x11];
        match serial {
            SerialNumber::Classic(bytes) => payload.extend_from_slice(bytes),
            SerialNumber::Extended { bytes, .. } => payload.extend_from_slice(bytes),
        }
        payload.extend_from_slice(&new_address.octets());
        let responses = self.collect(&payload)?;
        Ok(responses.into_iter().next().map(|(from, _)| from.addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::CanTransport;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    #[derive(Default)]
    struct LoopbackBus {
        inbox: Mutex<VecDeque<CanFrame>>,
    }

    impl CanTransport for LoopbackBus {
        fn send_frame(&self, _frame: &CanFrame) -> Result<()> {
            Ok(())
        }
        fn try_recv_frame(&self) -> Result<Option<CanFrame>> {
            Ok(self.inbox.lock().unwrap().pop_front())
        }
    }

    #[test]
    fn request_programming_collects_multiple_responders() {
        let bus = LoopbackBus::default();
        bus.inbox.lock().unwrap().push_back(CanFrame::new(0x7E8, false, &[1, 1]));
        bus.inbox.lock().unwrap().push_back(CanFrame::new(0x7E8, false, &[2, 0]));
        let dispatcher = Arc::new(CanDispatcher::new(Box::new(bus)));
        let broadcasts = CanBroadcasts::new(&dispatcher);
        let results = broadcasts.request_programming().unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().any(|r| r.sender.node_id() == 1 && r.request_accepted));
        assert!(results.iter().any(|r| r.sender.node_id() == 2 && !r.request_accepted));
    }

    /// Replies according to which DID the last-sent request carried, since
    /// `read_serial_number` issues the classic and extended queries as two
    /// separate broadcasts.
    #[derive(Default)]
    struct DidAwareBus {
        last_did: Mutex<Option<u8>>,
        classic: Mutex<VecDeque<CanFrame>>,
        extended: Mutex<VecDeque<CanFrame>>,
    }

    impl CanTransport for DidAwareBus {
        fn send_frame(&self, frame: &CanFrame) -> Result<()> {
            *self.last_did.lock().unwrap() = frame.payload().get(2).copied();
            Ok(())
        }
        fn try_recv_frame(&self) -> Result<Option<CanFrame>> {
            match *self.last_did.lock().unwrap() {
                Some(0x01) => Ok(self.classic.lock().unwrap().pop_front()),
                Some(0x02) => Ok(self.extended.lock().unwrap().pop_front()),
                _ => Ok(None),
            }
        }
    }

    #[test]
    fn read_serial_number_collects_classic_and_extended_forms() {
        let bus = DidAwareBus::default();
        bus.classic.lock().unwrap().push_back(CanFrame::new(
            0x7E8,
            false,
            &[1, 0x01, 0x23, 0x45, 0x67, 0x89, 0x01, 0x00],
        ));
        bus.extended
            .lock()
            .unwrap()
            .push_back(CanFrame::new(0x7E9, false, &[2, 2, b'A', b'B', b'C', 0x01]));
        let dispatcher = Arc::new(CanDispatcher::new(Box::new(bus)));
        let broadcasts = CanBroadcasts::new(&dispatcher);
        let devices = broadcasts.read_serial_number().unwrap();

        assert_eq!(devices.len(), 2);
        assert!(devices.iter().any(|d| d.sender.node_id() == 1
            && matches!(d.serial_number, SerialNumber::Classic(_))
            && !d.security_activated));
        assert!(devices.iter().any(|d| d.sender.node_id() == 2
            && matches!(d.serial_number, SerialNumber::Extended { encoding: ExtendedEncoding::Fsn, .. })
            && d.security_activated));
    }
}
