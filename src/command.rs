//! Command grammar.
//!
//! Commands arrive either as the process arguments or one per line on
//! standard input. Options omitted from a `client` or `server` command fall
//! back to the `[client]` and `[server]` sections of the config file.

use crate::client::ClientOptions;
use crate::config::{ClientConfig, ServerConfig, StatsConfig};
use crate::server::ServerOptions;
use crate::transport::Protocol;
use crate::workload::{Workload, WorkloadError};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "command", no_binary_name = true, disable_version_flag = true)]
pub struct CommandLine {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Start client ports that issue requests
    Client(ClientArgs),
    /// Start server ports that echo requests
    Server(ServerArgs),
    /// Stop running roles
    Stop {
        #[arg(required = true, value_enum)]
        targets: Vec<StopTarget>,
    },
    /// Write recorded round-trip times to a file
    DumpTimes { file: PathBuf },
    /// Write a message to the log
    Log {
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        message: Vec<String>,
    },
    /// Exit the process
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StopTarget {
    /// Stop client ports entirely
    Clients,
    /// Stop issuing requests but keep collecting responses
    Senders,
    /// Stop server ports
    Servers,
}

#[derive(Args, Debug, Clone, PartialEq, Default)]
pub struct ClientArgs {
    /// Transport protocol
    #[arg(long, value_enum)]
    pub protocol: Option<Protocol>,
    /// Number of client ports (one sender thread each)
    #[arg(long)]
    pub ports: Option<usize>,
    /// Receiver threads per client port
    #[arg(long)]
    pub port_receivers: Option<usize>,
    /// Outstanding requests allowed from this node, split across ports
    #[arg(long)]
    pub client_max: Option<u32>,
    /// Comma-separated hosts running server ports
    #[arg(long, value_delimiter = ',')]
    pub server_hosts: Option<Vec<String>>,
    /// Lowest server port number
    #[arg(long)]
    pub first_port: Option<u16>,
    /// Server ports on each server host
    #[arg(long)]
    pub server_ports: Option<usize>,
    /// Target message bandwidth in GB/s; 0 sends continuously
    #[arg(long)]
    pub net_bw: Option<f64>,
    /// Request lengths: N, uniform:MIN:MAX or exp:MEAN
    #[arg(long)]
    pub workload: Option<String>,
    /// Allow stream requests longer than the native message limit
    #[arg(long)]
    pub no_trunc: bool,
    /// Seed for request sequences
    #[arg(long)]
    pub seed: Option<u64>,
}

#[derive(Args, Debug, Clone, PartialEq, Default)]
pub struct ServerArgs {
    /// Transport protocol
    #[arg(long, value_enum)]
    pub protocol: Option<Protocol>,
    /// Number of ports to listen on
    #[arg(long)]
    pub ports: Option<usize>,
    /// Lowest port number; 0 picks ephemeral ports
    #[arg(long)]
    pub first_port: Option<u16>,
    /// Worker threads per port
    #[arg(long)]
    pub port_threads: Option<usize>,
}

/// Parse one command from its words.
pub fn parse<I, T>(words: I) -> Result<Command, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    CommandLine::try_parse_from(words).map(|line| line.command)
}

/// Where a client's servers live.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerTargets {
    pub hosts: Vec<String>,
    pub first_port: u16,
    pub ports: usize,
}

impl ServerTargets {
    /// Resolve every `(host, port)` pair, host-major. Server index `i`
    /// names entry `i`.
    pub fn resolve(&self) -> Result<Vec<SocketAddr>, (String, io::Error)> {
        let mut addrs = Vec::with_capacity(self.hosts.len() * self.ports);
        for host in &self.hosts {
            for offset in 0..self.ports {
                let port = self.first_port.wrapping_add(offset as u16);
                let addr = (host.as_str(), port)
                    .to_socket_addrs()
                    .map_err(|e| (host.clone(), e))?
                    .find(SocketAddr::is_ipv4)
                    .ok_or_else(|| {
                        let err = io::Error::new(io::ErrorKind::NotFound, "no IPv4 address");
                        (host.clone(), err)
                    })?;
                addrs.push(addr);
            }
        }
        Ok(addrs)
    }
}

impl ClientArgs {
    /// Fill in omitted options from `defaults`.
    pub fn resolve(
        &self,
        defaults: &ClientConfig,
        stats: &StatsConfig,
    ) -> Result<(ClientOptions, ServerTargets), WorkloadError> {
        let workload: Workload = self
            .workload
            .as_deref()
            .unwrap_or(&defaults.workload)
            .parse()?;
        let options = ClientOptions {
            protocol: self.protocol.unwrap_or(defaults.protocol),
            ports: self.ports.unwrap_or(defaults.ports).max(1),
            port_receivers: self.port_receivers.unwrap_or(defaults.port_receivers),
            client_max: self.client_max.unwrap_or(defaults.client_max),
            net_bw: self.net_bw.unwrap_or(defaults.net_bw),
            workload,
            truncate: defaults.truncate && !self.no_trunc,
            seed: self.seed.unwrap_or(defaults.seed),
            ring_capacity: stats.ring_capacity,
            max_frame_len: defaults.max_frame_len,
            batch: defaults.batch_size,
        };
        let targets = ServerTargets {
            hosts: self
                .server_hosts
                .clone()
                .unwrap_or_else(|| defaults.server_hosts.clone()),
            first_port: self.first_port.unwrap_or(defaults.first_port),
            ports: self.server_ports.unwrap_or(defaults.server_ports).max(1),
        };
        Ok((options, targets))
    }
}

impl ServerArgs {
    /// Fill in omitted options from `defaults`. Returns the options, the
    /// first port and the number of ports.
    pub fn resolve(&self, defaults: &ServerConfig) -> io::Result<(ServerOptions, u16, usize)> {
        let bind: IpAddr = defaults
            .bind
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let options = ServerOptions {
            protocol: self.protocol.unwrap_or(defaults.protocol),
            bind,
            threads: self.port_threads.unwrap_or(defaults.port_threads).max(1),
            max_connections: defaults.max_connections,
            max_frame_len: defaults.max_frame_len,
            batch: defaults.batch_size,
        };
        Ok((
            options,
            self.first_port.unwrap_or(defaults.first_port),
            self.ports.unwrap_or(defaults.ports),
        ))
    }
}
