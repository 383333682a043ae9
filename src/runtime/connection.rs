//! Stream connections and the table that owns them.
//!
//! Each connection pairs a non-blocking socket with its `StreamFramer` and
//! the readiness interest currently registered for it. Connections live in
//! a slab keyed by a stable token; the token, not the OS descriptor, is what
//! the poller reports, so a recycled descriptor can never reach a closed
//! connection's state.
//!
//! Every connection sits behind its own `SpinLock`. The table lock is only
//! taken to look an entry up (shared) or to insert/remove one (exclusive);
//! framing work happens under the connection lock alone.

use crate::runtime::framer::{FrameError, ReadMode, ReadStatus, StreamFramer};
use crate::runtime::header::Frame;
use crate::runtime::spin::SpinLock;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};
use parking_lot::RwLock;
use slab::Slab;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::debug;

/// A single stream connection.
pub struct Connection {
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub framer: StreamFramer,
    /// Scratch for frames read but not yet handled; reused across events.
    pub inbox: Vec<Frame>,
    token: Token,
    /// Interest currently registered with the poller, if any.
    interest: Option<Interest>,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr, max_frame_len: usize) -> Self {
        Self {
            stream,
            peer,
            framer: StreamFramer::new(max_frame_len),
            inbox: Vec::new(),
            token: Token(usize::MAX),
            interest: None,
        }
    }

    /// Assign the poller token for a connection not kept in a table.
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = token;
        self
    }

    /// Register or update the readiness interest for this connection.
    ///
    /// Does nothing if `interest` is already registered.
    pub fn set_interest(&mut self, registry: &Registry, interest: Interest) -> io::Result<()> {
        match self.interest {
            Some(current) if current == interest => return Ok(()),
            Some(_) => registry.reregister(&mut self.stream, self.token, interest)?,
            None => registry.register(&mut self.stream, self.token, interest)?,
        }
        self.interest = Some(interest);
        Ok(())
    }

    /// Re-arm the current registration so that still-pending readiness is
    /// reported again. Used to emulate level-triggered delivery.
    pub fn rearm(&mut self, registry: &Registry) -> io::Result<()> {
        match self.interest {
            Some(interest) => registry.reregister(&mut self.stream, self.token, interest),
            None => Ok(()),
        }
    }

    /// Read and reassemble whatever the socket has, delivering frames.
    pub fn read<F: FnMut(Frame)>(
        &mut self,
        mode: ReadMode,
        deliver: F,
    ) -> Result<ReadStatus, FrameError> {
        self.framer.read_from(&mut self.stream, mode, deliver)
    }

    /// Queue a frame; returns whether it was fully written.
    pub fn send(&mut self, frame: Frame) -> io::Result<bool> {
        self.framer.enqueue(&mut self.stream, frame)
    }

    /// Continue writing queued frames; returns whether the queue is empty.
    pub fn xmit(&mut self) -> io::Result<bool> {
        self.framer.drain(&mut self.stream)
    }

    /// Frames waiting to be written.
    pub fn pending(&self) -> usize {
        self.framer.pending()
    }

    pub fn deregister(&mut self, registry: &Registry) {
        if self.interest.take().is_some() {
            let _ = registry.deregister(&mut self.stream);
        }
    }
}

type ConnectionRef = Arc<SpinLock<Connection>>;

/// Slab of live connections keyed by poller token.
pub struct ConnectionTable {
    connections: RwLock<Slab<ConnectionRef>>,
    max_connections: usize,
}

impl ConnectionTable {
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: RwLock::new(Slab::with_capacity(max_connections.min(1024))),
            max_connections,
        }
    }

    /// Insert a connection and register it for `interest`.
    ///
    /// Returns `Ok(None)` if the table is full.
    pub fn insert(
        &self,
        mut conn: Connection,
        registry: &Registry,
        interest: Interest,
    ) -> io::Result<Option<Token>> {
        let mut connections = self.connections.write();
        if connections.len() >= self.max_connections {
            return Ok(None);
        }
        let entry = connections.vacant_entry();
        let token = Token(entry.key());
        conn.token = token;
        conn.set_interest(registry, interest)?;
        entry.insert(Arc::new(SpinLock::new(conn)));
        Ok(Some(token))
    }

    pub fn get(&self, token: Token) -> Option<ConnectionRef> {
        self.connections.read().get(token.0).cloned()
    }

    /// Remove a connection and deregister its socket.
    ///
    /// The caller must not hold that connection's lock.
    pub fn remove(&self, token: Token, registry: &Registry) -> Option<SocketAddr> {
        let conn = self.connections.write().try_remove(token.0)?;
        let mut conn = conn.lock();
        conn.deregister(registry);
        debug!(conn_id = token.0, peer = %conn.peer, "Connection closed");
        Some(conn.peer)
    }

    /// Remove every connection, deregistering each.
    pub fn clear(&self, registry: &Registry) -> usize {
        let drained: Vec<ConnectionRef> = self.connections.write().drain().collect();
        for conn in &drained {
            conn.lock().deregister(registry);
        }
        drained.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;
    use std::net::TcpListener;

    fn connected_pair() -> (TcpStream, SocketAddr, std::net::TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, peer) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (TcpStream::from_std(server), peer, client)
    }

    #[test]
    fn test_table_capacity_and_removal() {
        let poll = Poll::new().unwrap();
        let table = ConnectionTable::new(1);

        let (s1, p1, _c1) = connected_pair();
        let (s2, p2, _c2) = connected_pair();

        let t1 = table
            .insert(Connection::new(s1, p1, 1024), poll.registry(), Interest::READABLE)
            .unwrap()
            .unwrap();
        assert!(table
            .insert(Connection::new(s2, p2, 1024), poll.registry(), Interest::READABLE)
            .unwrap()
            .is_none());
        assert_eq!(table.connections.read().len(), 1);
        assert_eq!(table.get(t1).unwrap().lock().token, t1);

        assert_eq!(table.remove(t1, poll.registry()), Some(p1));
        assert!(table.get(t1).is_none());
        assert!(table.connections.read().is_empty());
        assert!(table.remove(t1, poll.registry()).is_none());
    }

    #[test]
    fn test_set_interest_tracks_registration() {
        let poll = Poll::new().unwrap();
        let table = ConnectionTable::new(4);
        let (s, p, _c) = connected_pair();
        let token = table
            .insert(Connection::new(s, p, 1024), poll.registry(), Interest::READABLE)
            .unwrap()
            .unwrap();

        let conn = table.get(token).unwrap();
        let mut conn = conn.lock();
        assert_eq!(conn.interest, Some(Interest::READABLE));
        conn.set_interest(poll.registry(), Interest::READABLE | Interest::WRITABLE)
            .unwrap();
        assert_eq!(conn.interest, Some(Interest::READABLE | Interest::WRITABLE));
        conn.rearm(poll.registry()).unwrap();
    }
}
