//! Production [`CanSink`] backed by a real non-blocking SocketCAN socket.

use super::transport::{CanSink, RawFrame};
use socketcan::{CanFrame, EmbeddedFrame, ExtendedId, Id, Socket, SocketOptions, StandardId};
use std::io;

/// Wraps a non-blocking `socketcan::CanSocket`.
pub struct SocketCanSink {
    socket: socketcan::CanSocket,
}

impl CanSink for SocketCanSink {
    fn open(ifname: &str) -> io::Result<Self> {
        let socket = socketcan::CanSocket::open(ifname)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }

    fn try_send(&self, frame: &RawFrame) -> io::Result<()> {
        let can_frame = to_can_frame(frame)?;
        self.socket.write_frame(&can_frame)
    }

    fn try_recv(&self) -> io::Result<RawFrame> {
        let frame = self.socket.read_frame()?;
        Ok(from_can_frame(&frame))
    }
}

fn to_can_frame(frame: &RawFrame) -> io::Result<CanFrame> {
    let id = if frame.extended {
        Id::Extended(
            ExtendedId::new(frame.can_id)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad extended id"))?,
        )
    } else {
        Id::Standard(
            StandardId::new(frame.can_id as u16)
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad standard id"))?,
        )
    };

    if frame.rtr {
        CanFrame::new_remote(id, frame.dlc as usize)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "bad rtr dlc"))
    } else {
        CanFrame::new(id, frame.payload())
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "payload too long"))
    }
}

fn from_can_frame(frame: &CanFrame) -> RawFrame {
    let (can_id, extended) = match frame.id() {
        Id::Standard(id) => (u32::from(id.as_raw()), false),
        Id::Extended(id) => (id.as_raw(), true),
    };
    RawFrame::new(can_id, extended, frame.is_remote_frame(), frame.data())
}
