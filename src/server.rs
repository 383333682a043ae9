//! Server ports.
//!
//! A server port echoes every request back to its sender. Native ports bind
//! one socket served by `threads` workers, each keeping its own counters;
//! stream ports share one listener, connection table and event loop between
//! their workers and keep a single set of counters.

use crate::runtime;
use crate::stats::ServerMetrics;
use crate::transport::{NativeServer, Protocol, ServerTransport, StreamServer, UdpTransport};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

const JOIN_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub protocol: Protocol,
    pub bind: IpAddr,
    /// Worker threads per port.
    pub threads: usize,
    pub max_connections: usize,
    pub max_frame_len: usize,
    pub batch: usize,
}

pub struct ServerRole {
    id: usize,
    transport: Arc<dyn ServerTransport>,
    metrics: Vec<Arc<ServerMetrics>>,
    workers: Vec<JoinHandle<()>>,
}

impl ServerRole {
    /// Start serving `port` (0 picks an ephemeral port).
    pub fn start(id: usize, port: u16, options: &ServerOptions) -> io::Result<Self> {
        let addr = SocketAddr::new(options.bind, port);
        let threads = options.threads.max(1);

        let (transport, metrics): (Arc<dyn ServerTransport>, Vec<Arc<ServerMetrics>>) =
            match options.protocol {
                Protocol::Native => {
                    let udp = Arc::new(UdpTransport::bind(addr)?);
                    let metrics = (0..threads).map(|_| Arc::default()).collect();
                    (Arc::new(NativeServer::new(udp)?), metrics)
                }
                Protocol::Stream => {
                    let server = StreamServer::bind(
                        addr,
                        threads,
                        options.max_connections,
                        options.max_frame_len,
                        options.batch,
                    )?;
                    (Arc::new(server), vec![Arc::default()])
                }
            };

        let local_addr = transport.local_addr();
        let mut workers = Vec::with_capacity(threads);
        for worker in 0..threads {
            let transport = Arc::clone(&transport);
            let metrics = Arc::clone(&metrics[worker % metrics.len()]);
            let handle = thread::Builder::new()
                .name(format!("server-{}-{worker}", local_addr.port()))
                .spawn(move || {
                    debug!(port = local_addr.port(), worker, "Server worker started");
                    if let Err(e) = transport.serve(worker, &metrics) {
                        runtime::fatal("Server worker failed", &e);
                    }
                })?;
            workers.push(handle);
        }

        info!(
            server = id,
            protocol = %options.protocol,
            addr = %local_addr,
            threads,
            "Server port started"
        );

        Ok(Self {
            id,
            transport,
            metrics,
            workers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Counters of this port, one entry per set of workers that keeps its own.
    pub fn metrics(&self) -> &[Arc<ServerMetrics>] {
        &self.metrics
    }

    /// Requests served by every worker of this port.
    pub fn requests(&self) -> u64 {
        self.metrics.iter().map(|m| m.requests()).sum()
    }

    pub fn stop(mut self) {
        self.transport.shutdown();
        let deadline = Instant::now() + JOIN_GRACE;
        for worker in self.workers.drain(..) {
            runtime::join_until(worker, deadline);
        }
        debug!(
            server = self.id,
            addr = %self.local_addr(),
            requests = self.requests(),
            "Server port stopped"
        );
    }
}
