//! Networking runtime shared by the client and server roles.
//!
//! - `clock`: nanosecond ticks and 32-bit issue stamps
//! - `header`: the 16-byte message header and `Frame`
//! - `framer`: reassembly of inbound frames and the outbound FIFO
//! - `connection`: stream connections and the slab that owns them
//! - `event_loop`: mio loop shared by a group of threads
//! - `spin`: busy-wait lock for per-connection state

pub mod clock;
pub mod connection;
pub mod event_loop;
pub mod framer;
pub mod header;
pub mod spin;

pub use connection::{Connection, ConnectionTable};
pub use event_loop::{EventHandler, EventLoop};
pub use framer::ReadStatus;
pub use header::{Frame, MessageHeader, HEADER_LEN};
pub use spin::SpinLock;

use std::fmt::Display;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// Log an unrecoverable error and terminate the process.
pub fn fatal(context: &str, err: &dyn Display) -> ! {
    error!(error = %err, "{context}");
    std::process::exit(1)
}

/// Join `handle` if it finishes before `deadline`; otherwise leave it
/// running detached. Returns whether the thread was joined.
pub fn join_until(handle: JoinHandle<()>, deadline: Instant) -> bool {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            let name = handle.thread().name().unwrap_or("unnamed").to_string();
            warn!(thread = %name, "Thread did not exit in time, detaching");
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    if handle.join().is_err() {
        warn!("Thread panicked before exiting");
    }
    true
}
