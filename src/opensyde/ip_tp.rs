//! Ethernet transport-protocol binding for [`super::OpenSydeClient`] (design §4.2
//! "Layering"), riding the IP dispatcher's TCP unicast channel. Framing is
//! `{length: u32 LE (bytes after the SID), service_id: u8, payload}`, matching
//! what [`crate::dispatcher::ip::StdNetTransport`] expects on the wire.

use super::transport::{decode_response, ServiceResponse, Tp};
use crate::dispatcher::{IpDispatcher, IpEndpoint, TcpHandle};
use crate::error::{Error, Result};
use crate::types::NodeAddress;
use std::sync::Weak;
use std::time::{Duration, Instant};

pub struct IpTp {
    dispatcher: Weak<IpDispatcher>,
    handle: TcpHandle,
    client: Option<NodeAddress>,
    server: Option<NodeAddress>,
}

impl IpTp {
    pub fn connect(dispatcher: &std::sync::Arc<IpDispatcher>, target: IpEndpoint) -> Result<Self> {
        let handle = dispatcher.register_tcp(target)?;
        Ok(Self {
            dispatcher: std::sync::Arc::downgrade(dispatcher),
            handle,
            client: None,
            server: None,
        })
    }

    fn dispatcher(&self) -> Result<std::sync::Arc<IpDispatcher>> {
        self.dispatcher
            .upgrade()
            .ok_or_else(|| Error::Config("IP dispatcher has been dropped".into()))
    }
}

impl Drop for IpTp {
    fn drop(&mut self) {
        if let Ok(dispatcher) = self.dispatcher() {
            dispatcher.unregister_tcp(self.handle);
        }
    }
}

impl Tp for IpTp {
    fn set_client_id(&mut self, client: NodeAddress) {
        self.client = Some(client);
    }

    fn set_server_id(&mut self, server: NodeAddress) {
        self.server = Some(server);
    }

    fn send_request(&self, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::Config("cannot send an empty openSYDE request".into()));
        }
        let dispatcher = self.dispatcher()?;
        let length = (payload.len() - 1) as u32;
        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(payload);
        dispatcher.send(self.handle, &frame)
    }

    fn recv_response(&self, expected_sid: u8, timeout: Duration) -> Result<ServiceResponse> {
        let dispatcher = self.dispatcher()?;
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(payload) = dispatcher.poll(self.handle)? {
                return decode_response(expected_sid, &payload);
            }
            std::thread::sleep(Duration::from_micros(200));
        }
        Err(Error::NoResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::IpTransport;
    use std::collections::{HashMap, VecDeque};
    use std::net::Ipv4Addr;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MockTransport {
        sent: Arc<Mutex<Vec<Vec<u8>>>>,
        inbox: Mutex<HashMap<IpEndpoint, VecDeque<Vec<u8>>>>,
    }

    impl IpTransport for MockTransport {
        fn send_udp(&self, _target: IpEndpoint, _payload: &[u8]) -> Result<()> {
            unimplemented!("unicast TP does not use broadcast")
        }
        fn try_recv_udp(&self) -> Result<Option<(IpEndpoint, Vec<u8>)>> {
            Ok(None)
        }
        fn connect_tcp(&self, target: IpEndpoint) -> Result<()> {
            self.inbox.lock().unwrap().entry(target).or_default();
            Ok(())
        }
        fn send_tcp(&self, _target: IpEndpoint, payload: &[u8]) -> Result<()> {
            self.sent.lock().unwrap().push(payload.to_vec());
            Ok(())
        }
        fn try_recv_tcp(&self, target: IpEndpoint) -> Result<Option<Vec<u8>>> {
            Ok(self.inbox.lock().unwrap().get_mut(&target).and_then(VecDeque::pop_front))
        }
        fn close_tcp(&self, _target: IpEndpoint) {}
    }

    fn endpoint() -> IpEndpoint {
        IpEndpoint {
            addr: Ipv4Addr::new(10, 0, 0, 5),
            port: 13400,
        }
    }

    #[test]
    fn request_is_length_prefixed_with_service_id_leading() {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let transport = MockTransport {
            sent: sent.clone(),
            ..Default::default()
        };
        let dispatcher = Arc::new(IpDispatcher::new(Box::new(transport)));
        let tp = IpTp::connect(&dispatcher, endpoint()).unwrap();
        tp.send_request(&[0x10, 0x01]).unwrap();

        let frames = sent.lock().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], [1u32.to_le_bytes().as_slice(), &[0x10, 0x01]].concat());
    }

    #[test]
    fn response_is_decoded_from_framed_payload() {
        let transport = MockTransport::default();
        transport
            .inbox
            .lock()
            .unwrap()
            .entry(endpoint())
            .or_default()
            .push_back(vec![0x50, 0x01]);
        let dispatcher = Arc::new(IpDispatcher::new(Box::new(transport)));
        let tp = IpTp::connect(&dispatcher, endpoint()).unwrap();
        let response = tp.recv_response(0x10, Duration::from_millis(50)).unwrap();
        assert!(matches!(response, ServiceResponse::Positive(ref p) if p == &[0x01]));
    }
}
