//! rtproxy-ctl - control and status tool for the rtproxy relay engine.
//!
//! Loads start-up settings into a relay, applies control commands given as
//! arguments or read from stdin, and prints the status listing.

use std::io::BufRead;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rtproxy_net::{Relay, Settings, control, status};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "rtproxy-ctl")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Settings file (default: /etc/rtproxy/rtproxy.toml).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Read additional commands from stdin, one per line.
    #[arg(long)]
    stdin: bool,

    /// Print the derived routing context of these proxy ports.
    #[arg(long = "route", value_name = "PORT")]
    routes: Vec<u16>,

    /// Enable debug logging.
    #[arg(short, long)]
    debug: bool,

    /// Control commands, e.g. "c 10.1.40.121 10.1.40.121".
    commands: Vec<String>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        "rtproxy=debug"
    } else {
        "rtproxy=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    run(&args)
}

fn run(args: &Args) -> Result<()> {
    let settings = match &args.config {
        Some(path) => Settings::load_from(path)
            .with_context(|| format!("Failed to load settings from {}", path.display()))?,
        None => Settings::load().context("Failed to load settings")?,
    };

    let relay = Relay::new();
    settings
        .apply(&relay)
        .context("Failed to apply settings")?;

    let mut rejected = 0usize;
    for line in &args.commands {
        rejected += usize::from(!execute(&relay, line));
    }

    if args.stdin {
        for line in std::io::stdin().lock().lines() {
            let line = line.context("Failed to read command from stdin")?;
            if line.trim().is_empty() {
                continue;
            }
            rejected += usize::from(!execute(&relay, &line));
        }
    }

    print!("{}", status::render(&relay));
    for &port in &args.routes {
        match relay.derive_routing(port) {
            Some((_, routing)) => print!("{}", status::routing_lines(&routing)),
            None => warn!(port, "no session at proxy port"),
        }
    }

    if rejected > 0 {
        info!(rejected, "some commands were rejected");
    }
    Ok(())
}

fn execute(relay: &Relay, line: &str) -> bool {
    match control::handle_command(relay, line) {
        Ok(command) => {
            info!(%command, "command applied");
            true
        }
        Err(err) => {
            warn!(command = line.trim(), %err, "command rejected");
            false
        }
    }
}
