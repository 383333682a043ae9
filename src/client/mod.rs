//! Client ports.
//!
//! Each port has one sender thread, driven by a `Scheduler`, and zero or
//! more receiver threads that collect responses into the port's
//! `ClientStats`. Receivers are running before the sender issues its first
//! request. With no receivers the sender waits for each response itself.

mod scheduler;

use scheduler::{clamp_length, RequestSequences, Scheduler, Selection};

use crate::runtime::{self, clock, Frame, MessageHeader};
use crate::stats::ClientStats;
use crate::transport::{
    ClientTransport, NativeClient, Protocol, ReceiveScratch, StreamClient, TransportError,
    UdpTransport,
};
use crate::workload::Workload;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How long `stop` waits for outstanding requests to complete.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// How long `stop` waits for threads to exit before detaching them.
const JOIN_GRACE: Duration = Duration::from_millis(500);

/// Parameters shared by every port of a `client` command.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub protocol: Protocol,
    pub ports: usize,
    pub port_receivers: usize,
    /// Outstanding requests allowed across all ports of this node.
    pub client_max: u32,
    /// Target message bandwidth across all ports in GB/s; 0 sends
    /// continuously.
    pub net_bw: f64,
    pub workload: Workload,
    /// Truncate stream requests to the transport's message limit.
    pub truncate: bool,
    pub seed: u64,
    pub ring_capacity: usize,
    pub max_frame_len: usize,
    pub batch: usize,
}

impl ClientOptions {
    /// Outstanding request cap of a single port.
    pub fn port_cap(&self) -> u64 {
        (u64::from(self.client_max) / self.ports.max(1) as u64).max(1)
    }

    /// Longest request a port will issue.
    ///
    /// Stream requests are truncated to the transport's message limit by
    /// default; without truncation they are still capped at the largest
    /// frame a server accepts.
    fn max_length(&self, transport: &dyn ClientTransport) -> i32 {
        let limit = if transport.bounded() || self.truncate {
            transport.max_message_length()
        } else {
            self.max_frame_len
        };
        limit.min(i32::MAX as usize) as i32
    }

    /// Target request rate of one port, in requests per second.
    fn port_rate(&self, mean_length: f64) -> Option<f64> {
        (self.net_bw > 0.0).then(|| 1e9 * self.net_bw / (mean_length * self.ports.max(1) as f64))
    }
}

/// State shared by a port's threads.
struct Shared {
    id: usize,
    stats: ClientStats,
    transport: Arc<dyn ClientTransport>,
    stop_sender: AtomicBool,
    receivers_running: AtomicUsize,
    message_ids: Arc<AtomicU32>,
    receivers: usize,
}

pub struct ClientRole {
    shared: Arc<Shared>,
    sender: Option<JoinHandle<()>>,
    receivers: Vec<JoinHandle<()>>,
}

impl ClientRole {
    /// Connect port `id` to `servers` and start its threads.
    ///
    /// `message_ids` is shared by every client port of the node so that
    /// message ids are unique node-wide.
    pub fn start(
        id: usize,
        options: &ClientOptions,
        servers: &[SocketAddr],
        message_ids: Arc<AtomicU32>,
    ) -> io::Result<Self> {
        let transport: Arc<dyn ClientTransport> = match options.protocol {
            Protocol::Native => {
                // Server targets always resolve to IPv4.
                let udp = Arc::new(UdpTransport::bind(SocketAddr::from(([0, 0, 0, 0], 0)))?);
                Arc::new(NativeClient::new(udp, servers.to_vec()))
            }
            Protocol::Stream => Arc::new(StreamClient::connect(
                servers.to_vec(),
                options.port_receivers,
                options.max_frame_len,
                options.batch,
            )?),
        };

        let max_length = options.max_length(&*transport);
        let mut rng = StdRng::seed_from_u64(options.seed.wrapping_add(id as u64));
        let sequences = RequestSequences::generate(
            servers.len(),
            &options.workload,
            options.port_rate(options.workload.mean(max_length)),
            &mut rng,
        );

        let avg_length = sequences.average_length(max_length);
        let interval_ticks: u64 = sequences.intervals.iter().sum();
        let rate = if interval_ticks == 0 {
            None
        } else {
            Some(sequences.intervals.len() as f64 / clock::to_seconds(interval_ticks))
        };
        info!(
            client = id,
            protocol = %options.protocol,
            avg_length_kb = avg_length * 1e-3,
            expected_length_kb = options.workload.mean(max_length) * 1e-3,
            rate_kops = rate.map(|r| r * 1e-3),
            expected_mbps = rate.map(|r| r * avg_length * 1e-6),
            "Client port created"
        );

        // Body bytes for every request are sliced from one zeroed buffer.
        let longest = sequences
            .lengths
            .iter()
            .map(|&len| clamp_length(len, max_length).0)
            .max()
            .unwrap_or(0) as usize;
        let fill = Bytes::from(vec![0u8; longest]);

        let shared = Arc::new(Shared {
            id,
            stats: ClientStats::new(servers.len(), options.ring_capacity),
            transport,
            stop_sender: AtomicBool::new(false),
            receivers_running: AtomicUsize::new(0),
            message_ids,
            receivers: options.port_receivers,
        });

        let mut receivers = Vec::with_capacity(options.port_receivers);
        for index in 0..options.port_receivers {
            let shared = Arc::clone(&shared);
            let scratch = ReceiveScratch::new(shared.transport.receive_buffer_len(), options.batch);
            let handle = thread::Builder::new()
                .name(format!("client-{id}-rx-{index}"))
                .spawn(move || receive_loop(&shared, scratch))?;
            receivers.push(handle);
        }
        while shared.receivers_running.load(Ordering::Acquire) < options.port_receivers {
            thread::yield_now();
        }

        let scheduler = Scheduler::new(sequences, options.port_cap(), max_length, clock::now());
        let sender = {
            let shared = Arc::clone(&shared);
            let scratch = ReceiveScratch::new(shared.transport.receive_buffer_len(), options.batch);
            thread::Builder::new()
                .name(format!("client-{id}-tx"))
                .spawn(move || {
                    if let Err(e) = send_loop(&shared, scheduler, &fill, scratch) {
                        runtime::fatal("Client sender failed", &e);
                    }
                })?
        };

        Ok(Self {
            shared,
            sender: Some(sender),
            receivers,
        })
    }

    pub fn stats(&self) -> &ClientStats {
        &self.shared.stats
    }

    /// Stop issuing new requests; receivers keep running.
    pub fn stop_sender(&mut self) {
        self.shared.stop_sender.store(true, Ordering::Release);
        if let Some(sender) = self.sender.take() {
            runtime::join_until(sender, Instant::now() + JOIN_GRACE);
        }
    }

    /// Stop the port: stop the sender, give outstanding requests a chance to
    /// complete, shut the transport down and join every thread.
    pub fn stop(mut self) {
        self.stop_sender();

        let deadline = Instant::now() + DRAIN_TIMEOUT;
        while self.shared.stats.outstanding() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }

        self.shared.transport.shutdown();
        let deadline = Instant::now() + JOIN_GRACE;
        for receiver in self.receivers.drain(..) {
            runtime::join_until(receiver, deadline);
        }
        self.check_completion();
    }

    /// Log requests that never received a response.
    fn check_completion(&self) {
        let stats = &self.shared.stats;
        let outstanding = stats.outstanding();
        let per_server = stats
            .incomplete()
            .iter()
            .map(|(server, missing)| format!("s{server}: {missing}"))
            .collect::<Vec<_>>()
            .join(", ");
        if outstanding != 0 || !per_server.is_empty() {
            warn!(
                client = self.shared.id,
                outstanding,
                per_server = %per_server,
                "Client stopped with incomplete requests"
            );
        }
    }
}

fn receive_loop(shared: &Shared, mut scratch: ReceiveScratch) {
    shared.receivers_running.fetch_add(1, Ordering::AcqRel);
    let stats = &shared.stats;
    loop {
        let mut deliver = |header: &MessageHeader| stats.record_response(header, clock::now32());
        match shared.transport.wait_responses(&mut scratch, &mut deliver) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => runtime::fatal("Client receiver failed", &e),
        }
    }
    debug!(client = shared.id, "Receiver exiting");
}

fn send_loop(
    shared: &Shared,
    mut scheduler: Scheduler,
    fill: &Bytes,
    mut scratch: ReceiveScratch,
) -> Result<(), TransportError> {
    let stats = &shared.stats;
    let transport = &*shared.transport;
    let mut issued: u64 = 0;

    loop {
        let now = loop {
            if shared.stop_sender.load(Ordering::Acquire) {
                return Ok(());
            }
            let now = clock::now();
            if scheduler.ready(now, issued, stats.total_responses()) {
                break now;
            }
            transport.flush_backlog()?;
        };

        let Selection { server, length } = scheduler.select();
        let header = MessageHeader {
            length,
            issue_time: now as u32,
            server_id: server as i32,
            message_id: shared.message_ids.fetch_add(1, Ordering::Relaxed),
        };
        let responses_before = stats.total_responses();
        let sent = match transport.send(server, Frame::new(header, fill)) {
            Ok(_) => {
                issued += 1;
                stats.record_issue(server);
                true
            }
            Err(TransportError::PeerClosed(peer)) => {
                debug!(client = shared.id, server, %peer, "Skipping request to closed server");
                false
            }
            Err(e) => return Err(e),
        };

        let behind = scheduler.reschedule(now);
        if behind > 0 {
            stats.add_lag(behind);
        }

        if sent && shared.receivers == 0 {
            let mut deliver =
                |header: &MessageHeader| stats.record_response(header, clock::now32());
            while stats.total_responses() == responses_before {
                if !transport.wait_responses(&mut scratch, &mut deliver)? {
                    return Ok(());
                }
                if stats.total_responses() != responses_before {
                    break;
                }
                if shared.stop_sender.load(Ordering::Acquire) {
                    return Ok(());
                }
                transport.flush_backlog()?;
            }
        }
    }
}
