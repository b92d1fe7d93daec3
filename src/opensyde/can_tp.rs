//! CAN transport-protocol binding for [`super::OpenSydeClient`] (design §4.2
//! "Layering"). Segments payloads across classic 8-byte CAN frames with an
//! ISO-TP-flavored single/first/consecutive-frame split; this crate does not
//! implement ISO-TP flow control, since the dispatcher already serializes one
//! request/response exchange at a time per §5's single-threaded model.

use super::transport::{decode_response, service_id, ServiceResponse, Tp};
use crate::dispatcher::{CanDispatcher, CanFilter, CanFrame, DispatcherHandle};
use crate::error::{Error, Result};
use crate::types::NodeAddress;
use std::sync::Weak;
use std::time::{Duration, Instant};

const FRAME_SINGLE: u8 = 0x0;
const FRAME_FIRST: u8 = 0x1;
const FRAME_CONSECUTIVE: u8 = 0x2;

pub struct CanTp {
    dispatcher: Weak<CanDispatcher>,
    handle: DispatcherHandle,
    client: Option<NodeAddress>,
    server: Option<NodeAddress>,
}

impl CanTp {
    pub fn new(dispatcher: &std::sync::Arc<CanDispatcher>, rx_id: u32) -> Self {
        let handle = dispatcher.register(CanFilter { rx_id });
        Self {
            dispatcher: std::sync::Arc::downgrade(dispatcher),
            handle,
            client: None,
            server: None,
        }
    }

    fn dispatcher(&self) -> Result<std::sync::Arc<CanDispatcher>> {
        self.dispatcher
            .upgrade()
            .ok_or_else(|| Error::Config("CAN dispatcher has been dropped".into()))
    }

    fn tx_id(&self) -> Result<u32> {
        let server = self.server.ok_or_else(|| Error::Config("openSYDE server address not set".into()))?;
        Ok(0x600 | server.node_id() as u32)
    }

    fn send_frames(&self, id: u32, payload: &[u8]) -> Result<()> {
        let dispatcher = self.dispatcher()?;
        if payload.len() <= 7 {
            let mut data = vec![(FRAME_SINGLE << 4) | payload.len() as u8];
            data.extend_from_slice(payload);
            dispatcher.send(CanFrame::new(id, false, &data))?;
            return Ok(());
        }

        let mut first = vec![(FRAME_FIRST << 4) | ((payload.len() >> 8) as u8 & 0x0F), payload.len() as u8];
        first.extend_from_slice(&payload[..6]);
        dispatcher.send(CanFrame::new(id, false, &first))?;

        for (seq, chunk) in payload[6..].chunks(7).enumerate() {
            let mut data = vec![(FRAME_CONSECUTIVE << 4) | ((seq + 1) as u8 & 0x0F)];
            data.extend_from_slice(chunk);
            dispatcher.send(CanFrame::new(id, false, &data))?;
        }
        Ok(())
    }

    fn recv_frames(&self, timeout: Duration) -> Result<Vec<u8>> {
        let dispatcher = self.dispatcher()?;
        let deadline = Instant::now() + timeout;
        let mut payload: Vec<u8> = Vec::new();
        let mut expected_len: Option<usize> = None;

        while Instant::now() < deadline {
            match dispatcher.poll(self.handle)? {
                Some(frame) => {
                    let data = frame.payload();
                    if data.is_empty() {
                        continue;
                    }
                    let frame_type = data[0] >> 4;
                    match frame_type {
                        t if t == FRAME_SINGLE => {
                            let len = (data[0] & 0x0F) as usize;
                            return Ok(data[1..1 + len.min(data.len() - 1)].to_vec());
                        }
                        t if t == FRAME_FIRST => {
                            let len = (((data[0] & 0x0F) as usize) << 8) | data.get(1).copied().unwrap_or(0) as usize;
                            expected_len = Some(len);
                            payload.extend_from_slice(&data[2..]);
                        }
                        t if t == FRAME_CONSECUTIVE => {
                            payload.extend_from_slice(&data[1..]);
                        }
                        _ => continue,
                    }
                    if let Some(len) = expected_len {
                        if payload.len() >= len {
                            payload.truncate(len);
                            return Ok(payload);
                        }
                    }
                }
                None => std::thread::sleep(Duration::from_micros(200)),
            }
        }
        Err(Error::NoResponse)
    }
}

impl Drop for CanTp {
    fn drop(&mut self) {
        if let Ok(dispatcher) = self.dispatcher() {
            dispatcher.unregister(self.handle);
        }
    }
}

impl Tp for CanTp {
    fn set_client_id(&mut self, client: NodeAddress) {
        self.client = Some(client);
    }

    fn set_server_id(&mut self, server: NodeAddress) {
        self.server = Some(server);
    }

    fn send_request(&self, payload: &[u8]) -> Result<()> {
        self.send_frames(self.tx_id()?, payload)
    }

    fn recv_response(&self, expected_sid: u8, timeout: Duration) -> Result<ServiceResponse> {
        let payload = self.recv_frames(timeout)?;
        decode_response(expected_sid, &payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::CanTransport;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex as StdMutex};

    #[derive(Default)]
    struct LoopbackBus {
        inbox: StdMutex<VecDeque<CanFrame>>,
    }

    impl CanTransport for LoopbackBus {
        fn send_frame(&self, frame: &CanFrame) -> Result<()> {
            self.inbox.lock().unwrap().push_back(*frame);
            Ok(())
        }
        fn try_recv_frame(&self) -> Result<Option<CanFrame>> {
            Ok(self.inbox.lock().unwrap().pop_front())
        }
    }

    #[test]
    fn short_payload_is_sent_as_a_single_frame() {
        let dispatcher = Arc::new(CanDispatcher::new(Box::new(LoopbackBus::default())));
        let mut tp = CanTp::new(&dispatcher, 0x700);
        tp.set_server_id(NodeAddress::new(0, 1).unwrap());
        tp.send_request(&[0x10, 0x01]).unwrap();

        let watcher = dispatcher.register(CanFilter { rx_id: 0x601 });
        let frame = dispatcher.poll(watcher).unwrap().expect("request frame sent");
        assert_eq!(frame.payload(), &[(FRAME_SINGLE << 4) | 2, 0x10, 0x01]);
    }

    #[test]
    fn multi_frame_payload_reassembles_in_order() {
        let dispatcher = Arc::new(CanDispatcher::new(Box::new(LoopbackBus::default())));
        let tp = CanTp::new(&dispatcher, 0x700);
        let payload: Vec<u8> = (0..20u8).collect();
        tp.send_frames(0x700, &payload).unwrap();
        let reassembled = tp.recv_frames(Duration::from_millis(50)).unwrap();
        assert_eq!(reassembled, payload);
    }
}
