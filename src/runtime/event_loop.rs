//! mio event loop shared by a group of threads.
//!
//! Readiness-based model: poll tells us when sockets are ready, then the
//! handler performs non-blocking reads and writes. Uses epoll on Linux,
//! kqueue on macOS.
//!
//! ## Sharing one readiness set
//!
//! A `Poll` can only be waited on by one thread at a time, so the threads
//! of a group take turns: whoever holds the poll lock waits for a batch,
//! releases the lock and then handles the batch, letting the next thread
//! wait meanwhile. Handlers only ever lock the connection an event names.
//!
//! ## Triggering
//!
//! mio registrations are edge-triggered. With several threads that is what
//! we want: an event is handed to exactly one waiter, and the handler reads
//! until the socket would block. A single-thread loop instead behaves
//! level-triggered: one read per event, then the registration is re-armed
//! so that any bytes still buffered produce another event.
//!
//! ## Shutdown
//!
//! `shutdown` sets a stop flag and fires a `Waker` registered with the
//! poller. The thread parked in `poll` returns and sees the flag; every
//! other thread sees it before its next wait.

use crate::runtime::framer::ReadMode;
use mio::event::Event;
use mio::{Events, Poll, Registry, Token, Waker};
use parking_lot::Mutex;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{trace, warn};

/// Token reserved for the shutdown waker.
pub const WAKE_TOKEN: Token = Token(usize::MAX);

/// Token reserved for a listening socket.
pub const LISTENER_TOKEN: Token = Token(usize::MAX - 1);

/// Readiness delivery discipline for a loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Edge,
    Level,
}

impl Trigger {
    /// Edge-triggered when more than one thread shares the loop.
    pub fn for_threads(threads: usize) -> Self {
        if threads > 1 {
            Trigger::Edge
        } else {
            Trigger::Level
        }
    }

    pub fn read_mode(self) -> ReadMode {
        match self {
            Trigger::Edge => ReadMode::UntilWouldBlock,
            Trigger::Level => ReadMode::Once,
        }
    }
}

/// Callback invoked for each readiness event other than wake-ups.
pub trait EventHandler: Sync {
    type Error;

    fn on_event(&self, event: &Event) -> Result<(), Self::Error>;
}

pub struct EventLoop {
    poll: Mutex<Poll>,
    registry: Registry,
    waker: Waker,
    stopped: AtomicBool,
    trigger: Trigger,
    batch: usize,
}

impl EventLoop {
    /// Create a loop to be shared by `threads` threads.
    pub fn new(threads: usize, batch: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        Ok(Self {
            poll: Mutex::new(poll),
            registry,
            waker,
            stopped: AtomicBool::new(false),
            trigger: Trigger::for_threads(threads),
            batch: batch.max(1),
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn trigger(&self) -> Trigger {
        self.trigger
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Wait for one batch of events.
    ///
    /// Returns `false` once shutdown has been requested; `events` should then
    /// be ignored.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<bool> {
        if self.is_stopped() {
            return Ok(false);
        }
        let mut poll = self.poll.lock();
        if self.is_stopped() {
            return Ok(false);
        }
        loop {
            match poll.poll(events, timeout) {
                Ok(()) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        drop(poll);
        Ok(!self.is_stopped())
    }

    /// Handle events until shutdown.
    pub fn run<H>(&self, handler: &H) -> Result<(), H::Error>
    where
        H: EventHandler,
        H::Error: From<io::Error>,
    {
        let mut events = Events::with_capacity(self.batch);
        while self.wait(&mut events, None)? {
            for event in events.iter() {
                if event.token() == WAKE_TOKEN {
                    continue;
                }
                handler.on_event(event)?;
            }
        }
        trace!("Event loop exiting");
        Ok(())
    }

    /// Ask every thread using this loop to return.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            warn!(error = %e, "Failed to wake event loop");
        }
    }
}

/// Create a non-blocking TCP listener.
pub fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
