//! Datagram implementation of the native primitives.
//!
//! Each datagram starts with a 16-byte preamble followed by the message:
//!
//! ```text
//! offset  size  field
//!      0     1  kind     1 = request, 2 = response
//!      1     7  reserved (zero)
//!      8     8  rpc_id   u64, little-endian
//! ```
//!
//! One request maps to one datagram and so does its response. Receives use
//! a short socket timeout so that blocked threads notice `shutdown`; a
//! response receive also returns on that timeout.

use super::{NativeTransport, TransportError};
use socket2::{Domain, Protocol, SockAddr, SockRef, Socket, Type};
use std::io::{self, IoSlice};
use std::net::{Shutdown, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

pub(crate) const PREAMBLE_LEN: usize = 16;

/// Largest message carried in one IPv4 UDP datagram after the preamble.
pub const MAX_DATAGRAM_MESSAGE: usize = 65_507 - PREAMBLE_LEN;

const KIND_REQUEST: u8 = 1;
const KIND_RESPONSE: u8 = 2;

const RECV_TIMEOUT: Duration = Duration::from_millis(50);
const SOCKET_BUFFER: usize = 4 * 1024 * 1024;

fn preamble(kind: u8, rpc_id: u64) -> [u8; PREAMBLE_LEN] {
    let mut out = [0u8; PREAMBLE_LEN];
    out[0] = kind;
    out[8..16].copy_from_slice(&rpc_id.to_le_bytes());
    out
}

pub struct UdpTransport {
    socket: UdpSocket,
    next_rpc: AtomicU64,
    shut_down: AtomicBool,
}

impl UdpTransport {
    /// Bind a datagram socket. Port 0 picks an ephemeral port.
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_reuse_address(true)?;
        // Large bursts of responses overflow the default buffers.
        if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER) {
            debug!(error = %e, "Could not enlarge receive buffer");
        }
        if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER) {
            debug!(error = %e, "Could not enlarge send buffer");
        }
        socket.bind(&addr.into())?;
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;
        Ok(Self {
            socket: socket.into(),
            next_rpc: AtomicU64::new(1),
            shut_down: AtomicBool::new(false),
        })
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    fn transmit(
        &self,
        dest: SocketAddr,
        kind: u8,
        rpc_id: u64,
        payload: &[IoSlice<'_>],
    ) -> Result<(), TransportError> {
        let len: usize = payload.iter().map(|s| s.len()).sum();
        if len > MAX_DATAGRAM_MESSAGE {
            return Err(TransportError::TooLong {
                len,
                max: MAX_DATAGRAM_MESSAGE,
            });
        }
        if payload.len() > 3 {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "too many payload segments",
            )));
        }

        let head = preamble(kind, rpc_id);
        let mut parts = [IoSlice::new(&[]); 4];
        parts[0] = IoSlice::new(&head);
        parts[1..=payload.len()].copy_from_slice(payload);
        let parts = &parts[..=payload.len()];

        let dest = SockAddr::from(dest);
        loop {
            match SockRef::from(&self.socket).send_to_vectored(parts, &dest) {
                Ok(_) => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    /// Receive the next datagram of `kind`, moving its message to the front
    /// of `buf`. Socket timeouts are retried unless `give_up` is set.
    fn receive(
        &self,
        kind: u8,
        buf: &mut [u8],
        give_up: bool,
    ) -> Result<(usize, SocketAddr, u64), TransportError> {
        loop {
            if self.is_shut_down() {
                return Err(TransportError::Shutdown);
            }
            let (n, peer) = match self.socket.recv_from(buf) {
                Ok(received) => received,
                Err(e) => match e.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut if give_up => {
                        return Err(TransportError::TimedOut)
                    }
                    io::ErrorKind::WouldBlock
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted => continue,
                    _ if self.is_shut_down() => return Err(TransportError::Shutdown),
                    _ => return Err(TransportError::Io(e)),
                },
            };
            if n < PREAMBLE_LEN {
                warn!(%peer, len = n, "Dropping runt datagram");
                continue;
            }
            if buf[0] != kind {
                warn!(%peer, kind = buf[0], expected = kind, "Dropping datagram of wrong kind");
                continue;
            }
            let mut id = [0u8; 8];
            id.copy_from_slice(&buf[8..16]);
            buf.copy_within(PREAMBLE_LEN..n, 0);
            return Ok((n - PREAMBLE_LEN, peer, u64::from_le_bytes(id)));
        }
    }
}

impl NativeTransport for UdpTransport {
    fn max_message_length(&self) -> usize {
        MAX_DATAGRAM_MESSAGE
    }

    fn send(&self, dest: SocketAddr, payload: &[IoSlice<'_>]) -> Result<u64, TransportError> {
        let rpc_id = self.next_rpc.fetch_add(1, Ordering::Relaxed);
        self.transmit(dest, KIND_REQUEST, rpc_id, payload)?;
        Ok(rpc_id)
    }

    fn receive_request(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr, u64), TransportError> {
        self.receive(KIND_REQUEST, buf, false)
    }

    fn reply(
        &self,
        dest: SocketAddr,
        rpc_id: u64,
        payload: &[IoSlice<'_>],
    ) -> Result<(), TransportError> {
        self.transmit(dest, KIND_RESPONSE, rpc_id, payload)
    }

    fn receive_response(
        &self,
        buf: &mut [u8],
    ) -> Result<(usize, SocketAddr, u64), TransportError> {
        self.receive(KIND_RESPONSE, buf, true)
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        // Unconnected sockets report ENOTCONN here; the receive timeout
        // covers that case.
        let _ = SockRef::from(&self.socket).shutdown(Shutdown::Both);
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    fn loopback() -> UdpTransport {
        UdpTransport::bind("127.0.0.1:0".parse().unwrap()).unwrap()
    }

    #[test]
    fn test_request_reply_roundtrip() {
        let client = loopback();
        let server = loopback();
        let server_addr = server.local_addr().unwrap();

        let rpc_id = client
            .send(server_addr, &[IoSlice::new(b"hello "), IoSlice::new(b"world")])
            .unwrap();

        let mut buf = vec![0u8; 2048];
        let (len, peer, id) = server.receive_request(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello world");
        assert_eq!(id, rpc_id);
        assert_eq!(peer, client.local_addr().unwrap());

        server
            .reply(peer, id, &[IoSlice::new(&buf[..len])])
            .unwrap();
        let mut buf = vec![0u8; 2048];
        let (len, _, id) = client.receive_response(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"hello world");
        assert_eq!(id, rpc_id);
    }

    #[test]
    fn test_rpc_ids_are_distinct() {
        let client = loopback();
        let sink = loopback().local_addr().unwrap();
        let a = client.send(sink, &[IoSlice::new(b"x")]).unwrap();
        let b = client.send(sink, &[IoSlice::new(b"y")]).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let client = loopback();
        let sink = loopback().local_addr().unwrap();
        let big = vec![0u8; MAX_DATAGRAM_MESSAGE + 1];
        assert!(matches!(
            client.send(sink, &[IoSlice::new(&big)]),
            Err(TransportError::TooLong { .. })
        ));
    }

    #[test]
    fn test_response_receive_times_out() {
        let client = loopback();
        let mut buf = vec![0u8; 64];
        let start = Instant::now();
        assert!(matches!(
            client.receive_response(&mut buf),
            Err(TransportError::TimedOut)
        ));
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_shutdown_unblocks_receiver() {
        let transport = Arc::new(loopback());
        let receiver = {
            let transport = Arc::clone(&transport);
            thread::spawn(move || {
                let mut buf = vec![0u8; 64];
                transport.receive_request(&mut buf)
            })
        };
        thread::sleep(Duration::from_millis(20));
        let start = Instant::now();
        transport.shutdown();
        let result = receiver.join().unwrap();
        assert!(matches!(result, Err(TransportError::Shutdown)));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
