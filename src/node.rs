//! Role lifecycle.
//!
//! A `Node` owns every client and server port started on this process. The
//! registry sits behind one coarse lock shared by command execution and the
//! periodic reporter, so a report never observes a half-started or
//! half-stopped set of roles.

use crate::client::ClientRole;
use crate::command::{Command, StopTarget};
use crate::config::Config;
use crate::runtime::clock;
use crate::server::ServerRole;
use crate::stats::{self, DumpInfo, Report, Reporter, ServerMetrics};
use crate::workload::WorkloadError;
use parking_lot::Mutex;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicU32;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Workload(#[from] WorkloadError),

    #[error("couldn't resolve server host '{host}': {source}")]
    Resolve { host: String, source: io::Error },

    #[error("couldn't start {role} port {index}: {source}")]
    Setup {
        role: &'static str,
        index: usize,
        source: io::Error,
    },

    #[error("couldn't write '{}': {source}", path.display())]
    Dump { path: PathBuf, source: io::Error },
}

impl CommandError {
    /// Setup failures terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CommandError::Resolve { .. } | CommandError::Setup { .. }
        )
    }
}

/// What the caller should do after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

struct Registry {
    clients: Vec<ClientRole>,
    servers: Vec<ServerRole>,
    reporter: Reporter,
    /// Parameters of the most recent `client` command, for dump headers.
    last_client: Option<DumpInfo>,
}

pub struct Node {
    config: Config,
    registry: Mutex<Registry>,
    message_ids: Arc<AtomicU32>,
}

impl Node {
    pub fn new(config: Config) -> Self {
        let reporter = Reporter::new(config.stats.cdf_samples);
        Self {
            config,
            registry: Mutex::new(Registry {
                clients: Vec::new(),
                servers: Vec::new(),
                reporter,
                last_client: None,
            }),
            message_ids: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn execute(&self, command: Command) -> Result<Flow, CommandError> {
        match command {
            Command::Client(args) => {
                let (options, targets) = args.resolve(&self.config.client, &self.config.stats)?;
                let servers = targets
                    .resolve()
                    .map_err(|(host, source)| CommandError::Resolve { host, source })?;

                let mut registry = self.registry.lock();
                let first = registry.clients.len();
                for index in first..first + options.ports {
                    let role =
                        ClientRole::start(index, &options, &servers, Arc::clone(&self.message_ids))
                            .map_err(|source| CommandError::Setup {
                                role: "client",
                                index,
                                source,
                            })?;
                    registry.clients.push(role);
                }
                registry.last_client = Some(DumpInfo {
                    protocol: options.protocol.to_string(),
                    workload: options.workload.to_string(),
                    net_bw: options.net_bw,
                    threads: options.ports,
                    server_nodes: targets.hosts.len(),
                    server_ports: targets.ports,
                    client_max: options.client_max,
                });
                registry.reporter.reset();
            }
            Command::Server(args) => {
                let (options, first_port, ports) =
                    args.resolve(&self.config.server)
                        .map_err(|source| CommandError::Setup {
                            role: "server",
                            index: 0,
                            source,
                        })?;

                let mut registry = self.registry.lock();
                for offset in 0..ports {
                    let index = registry.servers.len();
                    let port = match first_port {
                        0 => 0,
                        first => first.wrapping_add(offset as u16),
                    };
                    let role = ServerRole::start(index, port, &options).map_err(|source| {
                        CommandError::Setup {
                            role: "server",
                            index,
                            source,
                        }
                    })?;
                    registry.servers.push(role);
                }
                registry.reporter.reset();
            }
            Command::Stop { targets } => {
                let mut registry = self.registry.lock();
                for target in targets {
                    match target {
                        StopTarget::Clients => {
                            for client in registry.clients.drain(..) {
                                client.stop();
                            }
                        }
                        StopTarget::Senders => {
                            for client in registry.clients.iter_mut() {
                                client.stop_sender();
                            }
                        }
                        StopTarget::Servers => {
                            for server in registry.servers.drain(..) {
                                server.stop();
                            }
                        }
                    }
                }
                registry.reporter.reset();
            }
            Command::DumpTimes { file } => {
                let registry = self.registry.lock();
                let info = registry.last_client.clone().unwrap_or_else(|| DumpInfo {
                    protocol: self.config.client.protocol.to_string(),
                    workload: self.config.client.workload.clone(),
                    net_bw: self.config.client.net_bw,
                    threads: 0,
                    server_nodes: self.config.client.server_hosts.len(),
                    server_ports: self.config.client.server_ports,
                    client_max: self.config.client.client_max,
                });
                let clients: Vec<_> = registry.clients.iter().map(|c| c.stats()).collect();
                let written = stats::dump_times(&file, &info, &clients)
                    .map_err(|source| CommandError::Dump {
                        path: file.clone(),
                        source,
                    })?;
                info!(file = %file.display(), samples = written, "Dumped round-trip times");
            }
            Command::Log { message } => {
                info!(target: "rpc_bench::log", "{}", message.join(" "));
            }
            Command::Exit => return Ok(Flow::Exit),
        }
        Ok(Flow::Continue)
    }

    /// Compute and log one report.
    pub fn report(&self) -> Option<Report> {
        let mut registry = self.registry.lock();
        let registry = &mut *registry;
        let clients: Vec<_> = registry.clients.iter().map(|c| c.stats()).collect();
        let servers: Vec<Vec<&ServerMetrics>> = registry
            .servers
            .iter()
            .map(|s| s.metrics().iter().map(|m| &**m).collect())
            .collect();
        let report = registry.reporter.report(clock::now(), &clients, &servers)?;
        log_report(&report);
        Some(report)
    }

    /// Report every `interval` forever.
    pub fn report_forever(&self, interval: Duration) -> ! {
        loop {
            thread::sleep(interval);
            self.report();
        }
    }

    /// Start the reporter on its own thread.
    pub fn spawn_reporter(self: &Arc<Self>, interval: Duration) -> io::Result<()> {
        let node = Arc::clone(self);
        thread::Builder::new()
            .name("reporter".to_string())
            .spawn(move || node.report_forever(interval))?;
        Ok(())
    }
}

fn log_report(report: &Report) {
    if let Some(server) = &report.server {
        info!(
            kops = format_args!("{:.2}", server.kops),
            mbps = format_args!("{:.2}", server.mbps),
            avg_length = format_args!("{:.1}", server.avg_length),
            "Servers"
        );
        let per_server = server
            .per_server
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        info!(rpcs = %per_server, "RPCs per server");
    }
    if let Some(client) = &report.client {
        let (p50, p99, p999) = client.rtt_us.unwrap_or_default();
        info!(
            kops = format_args!("{:.2}", client.kops),
            mbps = format_args!("{:.2}", client.mbps),
            p50_us = format_args!("{:.2}", p50),
            p99_us = format_args!("{:.2}", p99),
            p999_us = format_args!("{:.2}", p999),
            avg_rtt_us = format_args!("{:.2}", client.avg_rtt_us),
            avg_length = format_args!("{:.1}", client.avg_length),
            "Clients"
        );
        if client.lag_fraction >= 0.01 {
            info!(
                lag_pct = format_args!("{:.1}", client.lag_fraction * 100.0),
                "Lag due to overload"
            );
        }
    }
    if report.outstanding != 0 {
        info!(outstanding = report.outstanding, "Outstanding client RPCs");
    }
}
