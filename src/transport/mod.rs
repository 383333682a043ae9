//! Transport adapters.
//!
//! Roles talk to the network through two contracts: `ClientTransport` for a
//! client port (issue requests, collect responses) and `ServerTransport` for
//! a server port (echo every request). Each contract has two variants:
//!
//! - native: a message-oriented RPC transport with four primitives
//!   (`NativeTransport`); the bundled implementation runs over UDP
//! - stream: TCP connections framed by `StreamFramer` and driven by an
//!   `EventLoop`

mod native;
mod stream;
mod udp;

pub use native::{NativeClient, NativeServer};
pub use stream::{StreamClient, StreamServer};
pub use udp::UdpTransport;

use crate::runtime::{Frame, MessageHeader};
use crate::stats::ServerMetrics;
use clap::ValueEnum;
use mio::Events;
use serde::Deserialize;
use std::io::{self, IoSlice};
use std::net::SocketAddr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Message-oriented RPC transport.
    Native,
    /// Framed TCP.
    Stream,
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Native => write!(f, "native"),
            Protocol::Stream => write!(f, "stream"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport shut down")]
    Shutdown,

    #[error("no message arrived before the receive timeout")]
    TimedOut,

    #[error("connection to {0} is closed")]
    PeerClosed(SocketAddr),

    #[error("message of {len} bytes exceeds the {max} byte limit")]
    TooLong { len: usize, max: usize },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Per-thread scratch space for receiving responses.
pub struct ReceiveScratch {
    pub buf: Vec<u8>,
    pub events: Events,
}

impl ReceiveScratch {
    pub fn new(buffer_len: usize, batch: usize) -> Self {
        Self {
            buf: vec![0; buffer_len],
            events: Events::with_capacity(batch),
        }
    }
}

/// The four primitives of a message-oriented RPC transport.
///
/// Implementations deliver whole messages; request and response are
/// correlated by the `rpc_id` the transport assigns in `send`.
pub trait NativeTransport: Send + Sync {
    /// Largest message the transport can carry.
    fn max_message_length(&self) -> usize;

    /// Send a request, returning the transport's id for it.
    fn send(&self, dest: SocketAddr, payload: &[IoSlice<'_>]) -> Result<u64, TransportError>;

    /// Block until a request arrives; the message is written to the front of
    /// `buf`. Returns `(length, peer, rpc_id)`.
    fn receive_request(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr, u64), TransportError>;

    /// Send the response for `rpc_id` back to `dest`.
    fn reply(
        &self,
        dest: SocketAddr,
        rpc_id: u64,
        payload: &[IoSlice<'_>],
    ) -> Result<(), TransportError>;

    /// Wait for a response; same layout as `receive_request`.
    ///
    /// Unlike `receive_request` this gives up with `TransportError::TimedOut`
    /// after a short wait, so a client thread can check its stop flag.
    fn receive_response(&self, buf: &mut [u8])
        -> Result<(usize, SocketAddr, u64), TransportError>;

    /// Make blocked and future receives return `TransportError::Shutdown`.
    fn shutdown(&self);

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

/// Client side of a transport, shared by a port's sender and receivers.
pub trait ClientTransport: Send + Sync {
    fn max_message_length(&self) -> usize;

    /// Whether lengths above `max_message_length` may be sent at all.
    ///
    /// Stream transports can carry any length; datagram transports cannot.
    fn bounded(&self) -> bool;

    /// Bytes of `ReceiveScratch::buf` that `wait_responses` needs.
    fn receive_buffer_len(&self) -> usize {
        0
    }

    /// Issue a request to server index `server`; returns an id for it.
    fn send(&self, server: usize, frame: Frame) -> Result<u64, TransportError>;

    /// Wait for responses and pass each header to `deliver`.
    ///
    /// Returns `Ok(false)` once the transport has been shut down. May return
    /// `Ok(true)` without delivering anything.
    fn wait_responses(
        &self,
        scratch: &mut ReceiveScratch,
        deliver: &mut dyn FnMut(&MessageHeader),
    ) -> Result<bool, TransportError>;

    /// Retry output that backed up earlier. Called from the sender's idle loop.
    fn flush_backlog(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn shutdown(&self);
}

/// Server side of a transport.
pub trait ServerTransport: Send + Sync {
    /// Echo requests until shut down. Called once per worker thread.
    fn serve(&self, worker: usize, metrics: &ServerMetrics) -> Result<(), TransportError>;

    fn shutdown(&self);

    fn local_addr(&self) -> SocketAddr;
}
