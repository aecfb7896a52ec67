use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use lanshare::config::{format_config, Config};
use lanshare::discovery::{broadcast_target, probe};
use lanshare::logging::{init_logging, LogConfig, Verbosity};
use lanshare::server::{run_server, ServerConfig};

#[derive(Parser)]
#[command(name = "lanshare")]
#[command(version)]
#[command(about = "Share a folder with every device on your local network")]
#[command(
    long_about = "Runs a small web server that lets any browser on the same network upload, browse, preview, download, and delete files in a shared folder. Changes show up on every connected device immediately, and clients can find the server through UDP broadcast discovery."
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Also write debug logs to this file
    #[arg(long, global = true)]
    log_file: Option<String>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    /// Use this config file instead of ~/.config/lanshare/config.toml
    #[arg(long, global = true)]
    config_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Share a directory on the local network
    Serve {
        /// Directory to share (default: ./uploads)
        #[arg(short, long)]
        dir: Option<PathBuf>,

        /// Port to start the server on (default: 3000)
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface address to listen on
        #[arg(long, default_value = "0.0.0.0")]
        bind: IpAddr,

        /// Don't answer network discovery queries
        #[arg(long)]
        no_discovery: bool,
    },
    /// Look for servers on the local network
    Discover {
        /// Discovery port to query
        #[arg(short, long)]
        port: Option<u16>,

        /// How long to wait for replies, in milliseconds
        #[arg(short, long, default_value = "1500")]
        timeout_ms: u64,
    },
    /// Show the effective configuration
    Config {
        /// Write a config file with every default filled in
        #[arg(long)]
        init: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Config::load().context("Failed to load config"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = init_logging(&LogConfig {
        verbosity: Verbosity::from_flags(cli.verbose, cli.quiet),
        log_file: cli.log_file.clone(),
        json: cli.log_json,
    });

    let config = load_config(cli.config_file.as_ref())?;

    match cli.command {
        Commands::Serve {
            dir,
            port,
            bind,
            no_discovery,
        } => {
            let mut server_config = ServerConfig::from_config(&config, port);
            server_config.bind = bind;
            if let Some(dir) = dir {
                server_config.upload_dir = dir;
            }
            if no_discovery {
                server_config.discovery = None;
            }

            run_server(server_config).await?;
        }
        Commands::Discover { port, timeout_ms } => {
            let port = port.unwrap_or_else(|| config.effective_discovery_port());
            let found = probe(broadcast_target(port), Duration::from_millis(timeout_ms))
                .await
                .context("Discovery query failed")?;

            if found.is_empty() {
                println!("No servers found on UDP port {}", port);
            }
            for (from, announcement) in found {
                println!(
                    "{}  {}  (answered from {})",
                    announcement.url, announcement.service_name, from
                );
            }
        }
        Commands::Config { init } => {
            if init {
                let path = match &cli.config_file {
                    Some(path) => {
                        Config::with_defaults().save_to(path)?;
                        path.clone()
                    }
                    None => Config::with_defaults().save()?,
                };
                println!("Wrote {}", path.display());
            } else {
                if config.is_empty() {
                    println!("No settings configured, showing defaults");
                }
                println!("{}", format_config(&config));
            }
        }
    }

    Ok(())
}
