//! Real CAN hardware backing for [`super::can::CanDispatcher`], via `socketcan`.
//!
//! This is the "CAN hardware dispatcher... modelled as a capability" boundary of
//! design §1: everything above this module only depends on the [`CanTransport`]
//! trait, never on `socketcan` directly.

use super::can::CanTransport;
use super::frame::CanFrame;
use crate::error::{Error, Result};
use socketcan::{CanFrame as SocketCanFrame, CanSocket, ExtendedId, Frame, Socket, StandardId};
use std::sync::Mutex;

pub struct SocketCanTransport {
    socket: Mutex<CanSocket>,
}

impl SocketCanTransport {
    /// Opens a SocketCAN interface by name (e.g. `can0`, `vcan0`) in non-blocking mode.
    pub fn open(interface: &str) -> Result<Self> {
        let socket = CanSocket::open(interface)
            .map_err(|e| Error::Busy(format!("could not open CAN interface {}: {}", interface, e)))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| Error::Busy(format!("could not set {} non-blocking: {}", interface, e)))?;
        Ok(Self {
            socket: Mutex::new(socket),
        })
    }
}

impl CanTransport for SocketCanTransport {
    fn send_frame(&self, frame: &CanFrame) -> Result<()> {
        let can_frame = if frame.extended {
            ExtendedId::new(frame.id)
                .map(|id| SocketCanFrame::new(id, frame.payload()))
                .flatten()
        } else {
            StandardId::new(frame.id as u16)
                .map(|id| SocketCanFrame::new(id, frame.payload()))
                .flatten()
        }
        .ok_or_else(|| Error::Range(format!("invalid CAN ID 0x{:08x}", frame.id)))?;

        self.socket
            .lock()
            .unwrap()
            .write_frame(&can_frame)
            .map_err(|e| Error::Busy(format!("CAN write failed: {}", e)))
    }

    fn try_recv_frame(&self) -> Result<Option<CanFrame>> {
        match self.socket.lock().unwrap().read_frame() {
            Ok(frame) => {
                let id = match frame.id() {
                    embedded_can::Id::Standard(id) => id.as_raw() as u32,
                    embedded_can::Id::Extended(id) => id.as_raw(),
                };
                let extended = matches!(frame.id(), embedded_can::Id::Extended(_));
                Ok(Some(CanFrame::new(id, extended, frame.data())))
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(Error::Busy(format!("CAN read failed: {}", e))),
        }
    }
}
