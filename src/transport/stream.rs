//! Framed TCP transport.
//!
//! A server port owns a listener, a connection table and an event loop shared
//! by its worker threads. Every frame a connection delivers is echoed back on
//! the same connection, in order.
//!
//! A client port opens one connection per server. The sender writes through
//! the connection's FIFO; receivers share the port's event loop and hand
//! each response header to the stats collector. Clients never register write
//! interest: output that backs up is retried from the sender's idle loop.

use super::{ClientTransport, ReceiveScratch, ServerTransport, TransportError};
use crate::runtime::event_loop::{create_listener, LISTENER_TOKEN, WAKE_TOKEN};
use crate::runtime::{
    Connection, ConnectionTable, EventHandler, EventLoop, Frame, MessageHeader, ReadStatus,
    SpinLock,
};
use crate::stats::ServerMetrics;
use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Interest, Token};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Lengths above this are truncated unless the client disables truncation.
pub const STREAM_TRUNCATE_LEN: usize = 1_000_000;

const LISTEN_BACKLOG: i32 = 1024;

/// How long a client receiver waits before re-checking for shutdown.
const RECEIVE_WAIT: Duration = Duration::from_millis(100);

pub struct StreamServer {
    event_loop: EventLoop,
    /// Doubles as the accept lock.
    listener: SpinLock<TcpListener>,
    table: ConnectionTable,
    local_addr: SocketAddr,
    max_frame_len: usize,
}

impl StreamServer {
    /// Listen on `addr` for a port served by `threads` workers.
    pub fn bind(
        addr: SocketAddr,
        threads: usize,
        max_connections: usize,
        max_frame_len: usize,
        batch: usize,
    ) -> io::Result<Self> {
        let event_loop = EventLoop::new(threads, batch)?;
        let mut listener = TcpListener::from_std(create_listener(addr, LISTEN_BACKLOG)?);
        event_loop
            .registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        let local_addr = listener.local_addr()?;

        debug!(
            addr = %local_addr,
            threads,
            trigger = ?event_loop.trigger(),
            "Stream server listening"
        );

        Ok(Self {
            event_loop,
            listener: SpinLock::new(listener),
            table: ConnectionTable::new(max_connections),
            local_addr,
            max_frame_len,
        })
    }

    fn accept_connections(&self, worker: usize) -> Result<(), TransportError> {
        let listener = self.listener.lock();
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                    }
                    let conn = Connection::new(stream, peer, self.max_frame_len);
                    match self
                        .table
                        .insert(conn, self.event_loop.registry(), Interest::READABLE)?
                    {
                        Some(token) => {
                            debug!(worker, conn_id = token.0, %peer, "Accepted connection");
                        }
                        None => warn!(%peer, "Connection limit reached"),
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => return Err(TransportError::Io(e)),
            }
        }
    }

    fn handle_connection(
        &self,
        token: Token,
        event: &Event,
        metrics: &ServerMetrics,
    ) -> Result<(), TransportError> {
        let Some(conn) = self.table.get(token) else {
            return Ok(());
        };
        let registry = self.event_loop.registry();
        let mode = self.event_loop.trigger().read_mode();

        let mut guard = conn.lock();
        let mut close = false;

        if event.is_readable() || event.is_read_closed() {
            let mut inbox = std::mem::take(&mut guard.inbox);
            let status = guard.read(mode, |frame| inbox.push(frame));

            let mut backed_up = false;
            for frame in inbox.drain(..) {
                metrics.record(frame.len());
                if !guard.send(frame)? {
                    backed_up = true;
                }
            }
            guard.inbox = inbox;

            if backed_up {
                guard.set_interest(registry, Interest::READABLE | Interest::WRITABLE)?;
            }
            match status {
                Ok(ReadStatus::Partial) => guard.rearm(registry)?,
                Ok(ReadStatus::WouldBlock) => {}
                Err(e) => {
                    debug!(conn_id = token.0, peer = %guard.peer, error = %e, "Closing connection");
                    close = true;
                }
            }
        }

        if !close && event.is_writable() && guard.xmit()? {
            guard.set_interest(registry, Interest::READABLE)?;
        }

        drop(guard);
        if close {
            self.table.remove(token, registry);
        }
        Ok(())
    }
}

struct Worker<'a> {
    server: &'a StreamServer,
    id: usize,
    metrics: &'a ServerMetrics,
}

impl EventHandler for Worker<'_> {
    type Error = TransportError;

    fn on_event(&self, event: &Event) -> Result<(), TransportError> {
        match event.token() {
            LISTENER_TOKEN => self.server.accept_connections(self.id),
            token => self.server.handle_connection(token, event, self.metrics),
        }
    }
}

impl ServerTransport for StreamServer {
    fn serve(&self, worker: usize, metrics: &ServerMetrics) -> Result<(), TransportError> {
        self.event_loop.run(&Worker {
            server: self,
            id: worker,
            metrics,
        })
    }

    fn shutdown(&self) {
        self.event_loop.shutdown();
        let closed = self.table.clear(self.event_loop.registry());
        info!(addr = %self.local_addr, connections = closed, "Stream server shut down");
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

struct Backlog {
    servers: Vec<usize>,
    next: usize,
}

pub struct StreamClient {
    event_loop: EventLoop,
    servers: Vec<SocketAddr>,
    /// One connection per server, indexed by server; `None` once closed.
    connections: Vec<SpinLock<Option<Connection>>>,
    /// Servers whose FIFO backed up, retried by `flush_backlog`.
    backlog: SpinLock<Backlog>,
}

impl StreamClient {
    /// Connect to every server. `receivers` threads will share the loop.
    pub fn connect(
        servers: Vec<SocketAddr>,
        receivers: usize,
        max_frame_len: usize,
        batch: usize,
    ) -> io::Result<Self> {
        let event_loop = EventLoop::new(receivers, batch)?;
        let mut connections = Vec::with_capacity(servers.len());
        for (index, &addr) in servers.iter().enumerate() {
            let stream = std::net::TcpStream::connect(addr)?;
            stream.set_nodelay(true)?;
            stream.set_nonblocking(true)?;
            let local = stream.local_addr()?;

            let mut conn = Connection::new(TcpStream::from_std(stream), addr, max_frame_len)
                .with_token(Token(index));
            conn.set_interest(event_loop.registry(), Interest::READABLE)?;
            debug!(server = index, %addr, local_port = local.port(), "Connected to server");
            connections.push(SpinLock::new(Some(conn)));
        }

        Ok(Self {
            event_loop,
            servers,
            connections,
            backlog: SpinLock::new(Backlog {
                servers: Vec::new(),
                next: 0,
            }),
        })
    }
}

impl ClientTransport for StreamClient {
    fn max_message_length(&self) -> usize {
        STREAM_TRUNCATE_LEN
    }

    fn bounded(&self) -> bool {
        false
    }

    fn send(&self, server: usize, frame: Frame) -> Result<u64, TransportError> {
        let id = u64::from(frame.header.message_id);
        let mut slot = self.connections[server].lock();
        let Some(conn) = slot.as_mut() else {
            return Err(TransportError::PeerClosed(self.servers[server]));
        };
        let was_idle = conn.pending() == 0;
        if !conn.send(frame)? && was_idle {
            self.backlog.lock().servers.push(server);
        }
        Ok(id)
    }

    fn wait_responses(
        &self,
        scratch: &mut ReceiveScratch,
        deliver: &mut dyn FnMut(&MessageHeader),
    ) -> Result<bool, TransportError> {
        if !self.event_loop.wait(&mut scratch.events, Some(RECEIVE_WAIT))? {
            return Ok(false);
        }
        let registry = self.event_loop.registry();
        let mode = self.event_loop.trigger().read_mode();

        for event in scratch.events.iter() {
            let token = event.token();
            if token == WAKE_TOKEN {
                continue;
            }
            let Some(slot) = self.connections.get(token.0) else {
                continue;
            };
            let mut slot = slot.lock();
            let Some(conn) = slot.as_mut() else {
                continue;
            };
            if !(event.is_readable() || event.is_read_closed()) {
                continue;
            }
            match conn.read(mode, |frame| deliver(&frame.header)) {
                Ok(ReadStatus::Partial) => conn.rearm(registry)?,
                Ok(ReadStatus::WouldBlock) => {}
                Err(e) => {
                    warn!(
                        server = token.0,
                        peer = %conn.peer,
                        error = %e,
                        "Connection to server closed"
                    );
                    if let Some(mut conn) = slot.take() {
                        conn.deregister(registry);
                    }
                }
            }
        }
        Ok(true)
    }

    fn flush_backlog(&self) -> Result<(), TransportError> {
        let (index, server) = {
            let backlog = self.backlog.lock();
            if backlog.servers.is_empty() {
                return Ok(());
            }
            let index = backlog.next % backlog.servers.len();
            (index, backlog.servers[index])
        };

        let drained = match self.connections[server].lock().as_mut() {
            Some(conn) => conn.xmit()?,
            None => true,
        };

        let mut backlog = self.backlog.lock();
        if drained {
            backlog.servers.swap_remove(index);
        } else {
            backlog.next = index + 1;
        }
        Ok(())
    }

    fn shutdown(&self) {
        self.event_loop.shutdown();
    }
}
