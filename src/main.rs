//! rpc-bench: an RPC load generator and benchmark node
//!
//! One process can act as a server (echoing every request it receives), as
//! a client (issuing requests with a configured length distribution and
//! rate), or both. Two transports are supported:
//! - native: a message-oriented RPC transport
//! - stream: framed TCP connections
//!
//! Features:
//! - Closed-loop and open-loop (target bandwidth) request issue
//! - Per-port throughput, RTT percentiles and lag reports
//! - Round-trip time dumps for offline CDFs
//! - Configuration via CLI arguments, TOML file, or commands on stdin

mod client;
mod command;
mod config;
mod node;
mod runtime;
mod server;
mod stats;
mod transport;
mod workload;

use config::Config;
use node::{Flow, Node};
use std::io::{self, BufRead};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        client_protocol = %config.client.protocol,
        server_protocol = %config.server.protocol,
        report_interval_ms = config.stats.interval_ms,
        "Starting rpc-bench"
    );

    let interval = Duration::from_millis(config.stats.interval_ms.max(1));
    let startup = config.command.clone();
    let node = Arc::new(Node::new(config));

    if !startup.is_empty() {
        run_startup(&node, startup);
        node.report_forever(interval);
    }

    node.spawn_reporter(interval)?;
    run_interactive(&node)?;
    Ok(())
}

/// Run the command given on the command line; any failure is fatal.
fn run_startup(node: &Node, words: Vec<String>) {
    let command = match command::parse(words) {
        Ok(command) => command,
        Err(e) => e.exit(),
    };
    match node.execute(command) {
        Ok(Flow::Continue) => {}
        Ok(Flow::Exit) => std::process::exit(0),
        Err(e) => runtime::fatal("Startup command failed", &e),
    }
}

/// Read commands from stdin, one per line, until `exit` or end of input.
fn run_interactive(node: &Node) -> io::Result<()> {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        let words: Vec<&str> = line.split_whitespace().collect();
        if words.is_empty() {
            continue;
        }
        let command = match command::parse(words) {
            Ok(command) => command,
            Err(e) => {
                // Usage errors and help go to the terminal, not the log.
                let _ = e.print();
                continue;
            }
        };
        match node.execute(command) {
            Ok(Flow::Continue) => {}
            Ok(Flow::Exit) => return Ok(()),
            Err(e) if e.is_fatal() => runtime::fatal("Command failed", &e),
            Err(e) => eprintln!("{e}"),
        }
    }
    Ok(())
}
