//! Veles CLI - traffic-obfuscating multipath relay.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};

use veles::config::init_logging;
use veles::cover::ProtoRegistry;
use veles::error::Result;
use veles::node::{EntryNode, ExitNode};
use veles::observe::RunContext;
use veles::Config;

/// Veles - traffic-obfuscating multipath relay
#[derive(Parser, Debug)]
#[command(
    name = "veles",
    author,
    version,
    about = "Tunnels a TCP stream across parallel relay paths while reshaping its traffic",
    long_about = r#"
Veles disperses a TCP application stream over several parallel relay hops,
reshaping frame lengths, timing, and cover-protocol identity once per
observation window so that a passive observer on any single middle link
cannot reliably fingerprint the application.

QUICK START (local topology):
  Exit:   veles exit
  Entry:  veles entry
  Client: connect to the entry port (default 9001)
"#
)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the entry node (client-facing)
    Entry(EntryArgs),

    /// Run the exit node (server-facing)
    Exit(ExitArgs),

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Args, Debug)]
struct EntryArgs {
    /// Listen port override
    #[arg(long)]
    listen: Option<u16>,

    /// Middle relay ports override, comma separated (e.g. 9103,9102)
    #[arg(long)]
    middle_ports: Option<String>,
}

#[derive(Args, Debug)]
struct ExitArgs {
    /// Listen port override
    #[arg(long)]
    listen: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level)?;

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    config.apply_env()?;

    match cli.command {
        Commands::Entry(args) => {
            if let Some(port) = args.listen {
                config.entry_port = port;
            }
            if let Some(csv) = &args.middle_ports {
                config.middle_ports = parse_ports(csv)?;
            }
            config.validate()?;
            let run = RunContext::initialise(&config)?;
            let registry = Arc::new(ProtoRegistry::builtin());
            EntryNode::new(config, registry, run)?.run().await
        }
        Commands::Exit(args) => {
            if let Some(port) = args.listen {
                config.exit_port = port;
            }
            config.validate()?;
            let run = RunContext::initialise(&config)?;
            let registry = Arc::new(ProtoRegistry::builtin());
            ExitNode::new(config, registry, run)?.run().await
        }
        Commands::Config => {
            config.validate()?;
            let rendered = toml::to_string_pretty(&config)
                .map_err(|e| veles::Error::Config(format!("render failed: {e}")))?;
            println!("{rendered}");
            Ok(())
        }
    }
}

fn parse_ports(csv: &str) -> Result<Vec<u16>> {
    csv.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<u16>()
                .map_err(|_| veles::Error::Config(format!("invalid port: {s}")))
        })
        .collect()
}
