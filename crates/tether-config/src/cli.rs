//! Command-line flags that override `config.ron`.

use std::path::PathBuf;

use clap::Parser;

use crate::{Config, SyncMode};

/// Tether loopback host.
#[derive(Parser, Debug, Default)]
#[command(name = "tether", about = "Replicated game state over a loopback network")]
pub struct CliArgs {
    /// Replication ticks per second.
    #[arg(long)]
    pub tick_rate: Option<u32>,

    /// Simulated clients.
    #[arg(long)]
    pub clients: Option<u16>,

    /// Ticks to run before exiting.
    #[arg(long, default_value_t = 100)]
    pub ticks: u32,

    /// Frame acknowledgement style.
    #[arg(long, value_parser = parse_sync_mode)]
    pub sync: Option<SyncMode>,

    /// Reassembly pacing in bytes per second.
    #[arg(long)]
    pub reassembly_rate: Option<i32>,

    /// Address events by legacy type index.
    #[arg(long)]
    pub legacy_events: bool,

    /// Log level (error, warn, info, debug, trace).
    #[arg(long)]
    pub log_level: Option<String>,

    /// Config directory instead of the per-user default.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

fn parse_sync_mode(value: &str) -> Result<SyncMode, String> {
    match value.to_ascii_lowercase().as_str() {
        "arq" => Ok(SyncMode::Arq),
        "nak" => Ok(SyncMode::Nak),
        other => Err(format!("unknown sync mode '{other}', expected arq or nak")),
    }
}

impl Config {
    /// Apply flags given on the command line.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(rate) = args.tick_rate {
            self.network.tick_rate_hz = rate;
        }
        if let Some(clients) = args.clients {
            self.network.max_peers = clients;
        }
        if let Some(mode) = args.sync {
            self.sync.mode = mode;
        }
        if let Some(rate) = args.reassembly_rate {
            self.reassembly.bytes_per_second = rate;
        }
        if args.legacy_events {
            self.events.use_v2 = false;
        }
        if let Some(ref level) = args.log_level {
            self.debug.log_level = level.clone();
        }
    }
}
