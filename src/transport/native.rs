//! Client and server adapters over a `NativeTransport`.
//!
//! Every contract call maps onto one primitive. The 16-byte message header
//! travels as the first bytes of the message, so responses carry the issue
//! time and server index back to the client unchanged.

use super::{
    ClientTransport, NativeTransport, ReceiveScratch, ServerTransport, TransportError,
};
use crate::runtime::{Frame, MessageHeader};
use crate::stats::ServerMetrics;
use std::io::IoSlice;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{trace, warn};

pub struct NativeClient<T> {
    transport: Arc<T>,
    servers: Vec<SocketAddr>,
}

impl<T: NativeTransport> NativeClient<T> {
    pub fn new(transport: Arc<T>, servers: Vec<SocketAddr>) -> Self {
        Self { transport, servers }
    }
}

impl<T: NativeTransport> ClientTransport for NativeClient<T> {
    fn max_message_length(&self) -> usize {
        self.transport.max_message_length()
    }

    fn bounded(&self) -> bool {
        true
    }

    fn receive_buffer_len(&self) -> usize {
        self.transport.max_message_length() + super::udp::PREAMBLE_LEN
    }

    fn send(&self, server: usize, frame: Frame) -> Result<u64, TransportError> {
        let header = frame.header.encode();
        self.transport.send(
            self.servers[server],
            &[IoSlice::new(&header), IoSlice::new(&frame.body)],
        )
    }

    fn wait_responses(
        &self,
        scratch: &mut ReceiveScratch,
        deliver: &mut dyn FnMut(&MessageHeader),
    ) -> Result<bool, TransportError> {
        match self.transport.receive_response(&mut scratch.buf) {
            Ok((len, peer, rpc_id)) => {
                match MessageHeader::decode(&scratch.buf[..len]) {
                    Some(mut header) => {
                        header.length = len as i32;
                        deliver(&header);
                    }
                    None => warn!(%peer, rpc_id, len, "Response too short for a header"),
                }
                Ok(true)
            }
            Err(TransportError::TimedOut) => Ok(true),
            Err(TransportError::Shutdown) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn shutdown(&self) {
        self.transport.shutdown();
    }
}

pub struct NativeServer<T> {
    transport: Arc<T>,
    local_addr: SocketAddr,
    max_message_length: usize,
}

impl<T: NativeTransport> NativeServer<T> {
    pub fn new(transport: Arc<T>) -> std::io::Result<Self> {
        let local_addr = transport.local_addr()?;
        let max_message_length = transport.max_message_length();
        Ok(Self {
            transport,
            local_addr,
            max_message_length,
        })
    }
}

impl<T: NativeTransport> ServerTransport for NativeServer<T> {
    fn serve(&self, worker: usize, metrics: &ServerMetrics) -> Result<(), TransportError> {
        let mut buf = vec![0u8; self.max_message_length + super::udp::PREAMBLE_LEN];
        loop {
            let (len, peer, rpc_id) = match self.transport.receive_request(&mut buf) {
                Ok(request) => request,
                Err(TransportError::Shutdown) => {
                    trace!(worker, "Native server worker exiting");
                    return Ok(());
                }
                Err(e) => {
                    warn!(worker, error = %e, "Error receiving request");
                    continue;
                }
            };
            metrics.record(len);
            self.transport
                .reply(peer, rpc_id, &[IoSlice::new(&buf[..len])])?;
        }
    }

    fn shutdown(&self) {
        self.transport.shutdown();
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}
