//! Run a simulated raft cluster and drive it from an interactive console.
//!
//! Rank 0 is the console, clients take ranks `1..=clients` and servers the
//! ranks after them. Each server writes applied commands to
//! `<log-dir>/logs_server_<rank>.txt`; each client is seeded from
//! `<commands-dir>/commands_client_<rank>.txt` when that file exists.
//!
//! ```bash
//! cargo run --bin raft-cluster -- --servers 3 --clients 1
//! ```

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use raft_cluster::console::{help_text, process_informations};
use raft_cluster::{spawn_cluster, ClusterOptions, Console, ConsoleCommand};
use raft_core::{ClusterConfig, Topology};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Simulate a raft cluster with an operator console")]
struct Args {
    /// Number of consensus servers
    #[arg(long, default_value_t = 1)]
    servers: usize,

    /// Number of clients
    #[arg(long, default_value_t = 1)]
    clients: usize,

    /// Directory receiving the server output logs
    #[arg(long, default_value = "server_logs")]
    log_dir: PathBuf,

    /// Directory holding the client seed command files
    #[arg(long, default_value = "client_commands")]
    commands_dir: PathBuf,

    /// JSON file overriding timing defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// How long the console waits for a control acknowledgement
    #[arg(long, default_value_t = 500)]
    console_timeout_ms: u64,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let topology = Topology::new(args.clients, args.servers).context("invalid cluster size")?;
    let config = match &args.config {
        Some(path) => ClusterConfig::from_json_file(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ClusterConfig::default(),
    };

    let options = ClusterOptions {
        topology,
        config,
        log_dir: args.log_dir,
        commands_dir: Some(args.commands_dir),
        console_timeout: Duration::from_millis(args.console_timeout_ms),
    };
    let mut cluster = spawn_cluster(&options).context("failed to start cluster")?;

    let stopped_all = run_repl(cluster.console())?;
    if stopped_all {
        cluster.join();
    } else {
        cluster.shutdown();
    }
    Ok(())
}

/// Read commands until `stop_all` (returns true) or end of input (returns false).
fn run_repl(console: &mut Console) -> Result<bool> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    writeln!(stdout, "Enter your command (help for usage):")?;

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).context("failed to read stdin")? == 0 {
            return Ok(false);
        }
        if line.trim().is_empty() {
            continue;
        }

        let command = match console.parse(&line) {
            Ok(command) => command,
            Err(err) => {
                writeln!(stdout, "warning: {err}")?;
                continue;
            }
        };

        match command {
            ConsoleCommand::Help => writeln!(stdout, "{}", help_text())?,
            ConsoleCommand::ProcessInformations => {
                writeln!(stdout, "{}", process_informations(console.topology()))?
            }
            command => {
                for (rank, outcome) in console.execute(&command) {
                    writeln!(stdout, "rank {rank}: {outcome}")?;
                }
                if command == ConsoleCommand::StopAll {
                    return Ok(true);
                }
            }
        }
    }
}
