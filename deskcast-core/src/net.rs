//! Local UDP socket carrying the send-buffer hint.
//!
//! The RTP packets themselves are written by the encoder process. This
//! socket only exists to request a large send buffer for the session and
//! is held open until the pipeline stops.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{info, warn};

use crate::error::CastError;

/// Default requested `SO_SNDBUF` size.
pub const DEFAULT_SEND_BUFFER: usize = 10 * 1024 * 1024;

/// UDP socket opened for the session's destination address family.
pub struct TunedSocket {
    /// Held open until the session stops.
    _socket: Socket,
    destination: SocketAddr,
    send_buffer: usize,
}

impl TunedSocket {
    /// Open a UDP socket and request `send_buffer` bytes of send buffer.
    ///
    /// Failing to apply the hint is logged, not returned.
    pub fn open(destination: SocketAddr, send_buffer: usize) -> Result<Self, CastError> {
        let socket = Socket::new(
            Domain::for_address(destination),
            Type::DGRAM,
            Some(Protocol::UDP),
        )?;

        if let Err(e) = socket.set_send_buffer_size(send_buffer) {
            warn!("could not set UDP send buffer to {send_buffer} bytes: {e}");
        }
        let effective = socket.send_buffer_size().unwrap_or(0);
        info!("UDP send buffer: requested {send_buffer} bytes, effective {effective} bytes");

        Ok(Self {
            _socket: socket,
            destination,
            send_buffer: effective,
        })
    }

    /// Send buffer size reported by the OS after tuning.
    pub fn send_buffer(&self) -> usize {
        self.send_buffer
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_and_reports_buffer() {
        let sock = TunedSocket::open("127.0.0.1:10000".parse().unwrap(), 256 * 1024).unwrap();
        assert!(sock.send_buffer() > 0);
        assert_eq!(sock.destination().port(), 10000);
    }
}
