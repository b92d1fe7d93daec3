//! IP transport for the openSYDE Ethernet TP (design §6: UDP for broadcast/discovery,
//! TCP for unicast request/response streams). Kept strictly synchronous/polling per
//! design §9 ("do not introduce async... protocol responses are strictly serialized
//! per target").

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IpEndpoint {
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// Opaque handle for a registered TCP connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcpHandle(u32);

/// The raw socket operations an [`IpDispatcher`] needs. Implemented for real
/// `std::net` sockets; mockable for tests.
pub trait IpTransport: Send {
    fn send_udp(&self, target: IpEndpoint, payload: &[u8]) -> Result<()>;
    fn try_recv_udp(&self) -> Result<Option<(IpEndpoint, Vec<u8>)>>;

    fn connect_tcp(&self, target: IpEndpoint) -> Result<()>;
    fn send_tcp(&self, target: IpEndpoint, payload: &[u8]) -> Result<()>;
    /// Non-blocking: reads one framed `{length, service_id, payload}` message if a
    /// full one is already buffered, else `Ok(None)`.
    fn try_recv_tcp(&self, target: IpEndpoint) -> Result<Option<Vec<u8>>>;
    fn close_tcp(&self, target: IpEndpoint);
}

/// Multiplexes one UDP broadcast socket and N TCP unicast connections, mirroring
/// the CAN dispatcher's handle-based model (design §3 Ownership).
pub struct IpDispatcher {
    transport: Box<dyn IpTransport>,
    registrations: Mutex<HashMap<TcpHandle, IpEndpoint>>,
    next_handle: AtomicU32,
}

impl IpDispatcher {
    pub fn new(transport: Box<dyn IpTransport>) -> Self {
        Self {
            transport,
            registrations: Mutex::new(HashMap::new()),
            next_handle: AtomicU32::new(1),
        }
    }

    pub fn send_broadcast(&self, target: IpEndpoint, payload: &[u8]) -> Result<()> {
        self.transport.send_udp(target, payload)
    }

    pub fn poll_broadcast(&self) -> Result<Option<(IpEndpoint, Vec<u8>)>> {
        self.transport.try_recv_udp()
    }

    pub fn register_tcp(&self, target: IpEndpoint) -> Result<TcpHandle> {
        self.transport.connect_tcp(target)?;
        let handle = TcpHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.registrations.lock().unwrap().insert(handle, target);
        Ok(handle)
    }

    pub fn unregister_tcp(&self, handle: TcpHandle) {
        if let Some(target) = self.registrations.lock().unwrap().remove(&handle) {
            self.transport.close_tcp(target);
        }
    }

    pub fn send(&self, handle: TcpHandle, payload: &[u8]) -> Result<()> {
        let target = self.endpoint_of(handle)?;
        self.transport.send_tcp(target, payload)
    }

    pub fn poll(&self, handle: TcpHandle) -> Result<Option<Vec<u8>>> {
        let target = self.endpoint_of(handle)?;
        self.transport.try_recv_tcp(target)
    }

    fn endpoint_of(&self, handle: TcpHandle) -> Result<IpEndpoint> {
        self.registrations
            .lock()
            .unwrap()
            .get(&handle)
            .copied()
            .ok_or_else(|| Error::Config("unregistered IP dispatcher handle".into()))
    }
}

/// `std::net`-backed transport: blocking sockets with short read timeouts, polled
/// cooperatively rather than driven by an async reactor.
pub struct StdNetTransport {
    udp: UdpSocket,
    tcp: Mutex<HashMap<IpEndpoint, TcpStream>>,
}

const POLL_TIMEOUT: Duration = Duration::from_millis(1);

impl StdNetTransport {
    pub fn bind(local_port: u16) -> Result<Self> {
        let udp = UdpSocket::bind(("0.0.0.0", local_port))?;
        udp.set_broadcast(true)?;
        udp.set_read_timeout(Some(POLL_TIMEOUT))?;
        Ok(Self {
            udp,
            tcp: Mutex::new(HashMap::new()),
        })
    }
}

impl IpTransport for StdNetTransport {
    fn send_udp(&self, target: IpEndpoint, payload: &[u8]) -> Result<()> {
        self.udp.send_to(payload, (target.addr, target.port))?;
        Ok(())
    }

    fn try_recv_udp(&self) -> Result<Option<(IpEndpoint, Vec<u8>)>> {
        let mut buf = [0u8; 2048];
        match self.udp.recv_from(&mut buf) {
            Ok((n, from)) => {
                let addr = match from.ip() {
                    std::net::IpAddr::V4(v4) => v4,
                    std::net::IpAddr::V6(_) => {
                        return Err(Error::Config("IPv6 is not supported by this transport".into()))
                    }
                };
                Ok(Some((
                    IpEndpoint {
                        addr,
                        port: from.port(),
                    },
                    buf[..n].to_vec(),
                )))
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn connect_tcp(&self, target: IpEndpoint) -> Result<()> {
        let stream = TcpStream::connect((target.addr, target.port))
            .map_err(|e| Error::Busy(format!("TCP connect to {:?} failed: {}", target, e)))?;
        stream.set_read_timeout(Some(POLL_TIMEOUT))?;
        stream.set_nodelay(true)?;
        self.tcp.lock().unwrap().insert(target, stream);
        Ok(())
    }

    fn send_tcp(&self, target: IpEndpoint, payload: &[u8]) -> Result<()> {
        let mut tcp = self.tcp.lock().unwrap();
        let stream = tcp
            .get_mut(&target)
            .ok_or_else(|| Error::Config("TCP connection not established".into()))?;
        stream.write_all(payload)?;
        Ok(())
    }

    fn try_recv_tcp(&self, target: IpEndpoint) -> Result<Option<Vec<u8>>> {
        let mut tcp = self.tcp.lock().unwrap();
        let stream = tcp
            .get_mut(&target)
            .ok_or_else(|| Error::Config("TCP connection not established".into()))?;
        let mut header = [0u8; 5]; // length:u32 + service_id:u8
        match stream.read_exact(&mut header) {
            Ok(()) => {
                let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
                let mut body = vec![0u8; length + 1];
                body[0] = header[4];
                stream.read_exact(&mut body[1..])?;
                Ok(Some(body))
            }
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close_tcp(&self, target: IpEndpoint) {
        self.tcp.lock().unwrap().remove(&target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    #[derive(Default)]
    struct MockTransport {
        udp_inbox: Mutex<VecDeque<(IpEndpoint, Vec<u8>)>>,
        udp_sent: Mutex<Vec<(IpEndpoint, Vec<u8>)>>,
        connected: Mutex<Vec<IpEndpoint>>,
        tcp_inbox: Mutex<HashMap<IpEndpoint, VecDeque<Vec<u8>>>>,
        tcp_sent: Mutex<Vec<(IpEndpoint, Vec<u8>)>>,
    }

    impl IpTransport for MockTransport {
        fn send_udp(&self, target: IpEndpoint, payload: &[u8]) -> Result<()> {
            self.udp_sent.lock().unwrap().push((target, payload.to_vec()));
            Ok(())
        }

        fn try_recv_udp(&self) -> Result<Option<(IpEndpoint, Vec<u8>)>> {
            Ok(self.udp_inbox.lock().unwrap().pop_front())
        }

        fn connect_tcp(&self, target: IpEndpoint) -> Result<()> {
            self.connected.lock().unwrap().push(target);
            self.tcp_inbox.lock().unwrap().entry(target).or_default();
            Ok(())
        }

        fn send_tcp(&self, target: IpEndpoint, payload: &[u8]) -> Result<()> {
            self.tcp_sent.lock().unwrap().push((target, payload.to_vec()));
            Ok(())
        }

        fn try_recv_tcp(&self, target: IpEndpoint) -> Result<Option<Vec<u8>>> {
            Ok(self
                .tcp_inbox
                .lock()
                .unwrap()
                .get_mut(&target)
                .and_then(VecDeque::pop_front))
        }

        fn close_tcp(&self, target: IpEndpoint) {
            self.tcp_inbox.lock().unwrap().remove(&target);
        }
    }

    fn endpoint(port: u16) -> IpEndpoint {
        IpEndpoint {
            addr: Ipv4Addr::new(192, 168, 0, 10),
            port,
        }
    }

    #[test]
    fn broadcast_send_and_poll_roundtrip() {
        let transport = MockTransport::default();
        let broadcast_from = endpoint(13400);
        transport
            .udp_inbox
            .lock()
            .unwrap()
            .push_back((broadcast_from, vec![0xAA, 0xBB]));
        let dispatcher = IpDispatcher::new(Box::new(transport));

        dispatcher.send_broadcast(endpoint(13400), &[1, 2, 3]).unwrap();
        let (from, payload) = dispatcher.poll_broadcast().unwrap().unwrap();
        assert_eq!(from, broadcast_from);
        assert_eq!(payload, vec![0xAA, 0xBB]);
    }

    #[test]
    fn tcp_handle_routes_to_its_own_endpoint() {
        let transport = MockTransport::default();
        let a = endpoint(13401);
        let b = endpoint(13402);
        transport
            .tcp_inbox
            .lock()
            .unwrap()
            .entry(a)
            .or_default()
            .push_back(vec![0, 0, 0, 1, 0x22, 0xFF]);
        let dispatcher = IpDispatcher::new(Box::new(transport));

        let ha = dispatcher.register_tcp(a).unwrap();
        let hb = dispatcher.register_tcp(b).unwrap();

        assert!(dispatcher.poll(ha).unwrap().is_some());
        assert!(dispatcher.poll(hb).unwrap().is_none());
    }

    #[test]
    fn poll_unregistered_handle_is_config_error() {
        let transport = MockTransport::default();
        let dispatcher = IpDispatcher::new(Box::new(transport));
        let ghost = dispatcher.register_tcp(endpoint(13403)).unwrap();
        dispatcher.unregister_tcp(ghost);
        assert!(matches!(dispatcher.poll(ghost), Err(Error::Config(_))));
    }
}
