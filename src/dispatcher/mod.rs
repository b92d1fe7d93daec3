//! The shared CAN/IP dispatcher (design §3 Ownership, §4.3, §5).

mod can;
mod frame;
mod ip;
mod socketcan_transport;

pub use can::{CanDispatcher, CanTransport, DispatcherHandle};
pub use frame::{CanFilter, CanFrame, RX_ID_WILDCARD};
pub use ip::{IpDispatcher, IpEndpoint, IpTransport, TcpHandle};
pub use socketcan_transport::SocketCanTransport;
