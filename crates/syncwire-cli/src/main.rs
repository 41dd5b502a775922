//! Syncwire - mirror a directory to a peer over one correlated connection.
//!
//! `syncwire watch --dir ./data` connects to the peer and pushes every file
//! under `./data` on a fixed cadence until interrupted. `syncwire echo hi`
//! checks the peer answers at all.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use syncwire::{Client, ClientConfig, DeliveryPolicy, ProtocolConfig, SyncConfig, SyncDefaults};
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(name = "syncwire")]
#[command(about = "Directory sync over a correlated WebSocket connection")]
struct Args {
    /// Peer address (ws://host:port/ or tcp://host:port)
    #[arg(long, global = true, default_value = ProtocolConfig::DEFAULT_PEER_URL)]
    peer: String,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Connection attempts before giving up
    #[arg(long, global = true, default_value_t = ProtocolConfig::MAX_CONNECT_ATTEMPTS)]
    max_attempts: u32,

    /// Reply timeout in milliseconds
    #[arg(long, global = true)]
    request_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Push every file under a directory until Ctrl-C
    Watch {
        /// Local directory to mirror
        #[arg(long)]
        dir: PathBuf,

        /// Remote directory label sent with each file
        #[arg(long)]
        directory: Option<String>,

        /// Pause between scans in milliseconds
        #[arg(long)]
        scan_interval_ms: Option<u64>,

        /// Pause before each file in milliseconds
        #[arg(long)]
        file_interval_ms: Option<u64>,

        /// Do not wait for acknowledgements
        #[arg(long)]
        detached: bool,

        /// Skip files whose contents did not change since the last send
        #[arg(long)]
        skip_unchanged: bool,
    },

    /// Send one echo request and print the reply
    Echo {
        /// Value to echo
        value: String,
    },
}

fn init_logging(debug: bool, json: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false);

    if json {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}

fn client_config(args: &Args) -> ClientConfig {
    let mut config = ClientConfig::new().with_peer_url(args.peer.clone());
    config.retry = config.retry.with_max_attempts(args.max_attempts);
    if let Some(ms) = args.request_timeout_ms {
        config = config.with_request_timeout(Duration::from_millis(ms));
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.debug, args.json_logs);

    let mut config = client_config(&args);

    match args.command {
        Command::Watch {
            dir,
            directory,
            scan_interval_ms,
            file_interval_ms,
            detached,
            skip_unchanged,
        } => {
            if !dir.is_dir() {
                anyhow::bail!("{} is not a directory", dir.display());
            }
            if detached {
                config = config.with_delivery(DeliveryPolicy::Detached);
            }

            let mut sync = SyncConfig::new(&dir)
                .with_scan_interval(
                    scan_interval_ms
                        .map(Duration::from_millis)
                        .unwrap_or(SyncDefaults::SCAN_INTERVAL),
                )
                .with_file_interval(
                    file_interval_ms
                        .map(Duration::from_millis)
                        .unwrap_or(SyncDefaults::FILE_INTERVAL),
                )
                .with_skip_unchanged(skip_unchanged);
            if let Some(label) = directory {
                sync = sync.with_directory(label);
            }

            watch(config, sync).await
        }
        Command::Echo { value } => echo(config, value).await,
    }
}

async fn watch(config: ClientConfig, sync: SyncConfig) -> Result<()> {
    info!("Starting syncwire against {}", config.peer_url);

    let client = Client::connect(config)
        .await
        .context("Could not connect to peer")?;
    let span = info_span!("session", id = %client.session_id());

    async {
        let handle = client.start_sync(sync);

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl-C")?;
                info!("Shutdown signal received, stopping");
            }
            _ = client.closed() => {
                warn!(
                    "Peer closed the connection: {}",
                    client
                        .close_reason()
                        .map(|reason| reason.to_string())
                        .unwrap_or_else(|| "unknown".to_string())
                );
            }
        }

        handle.stop();
        handle.join().await?;
        client.close().await;
        info!("Sync stopped");
        Ok::<(), anyhow::Error>(())
    }
    .instrument(span)
    .await
}

async fn echo(config: ClientConfig, value: String) -> Result<()> {
    let client = Client::connect(config)
        .await
        .context("Could not connect to peer")?;
    let span = info_span!("session", id = %client.session_id());

    let reply = client.echo(value).instrument(span).await;
    client.close().await;

    println!("{}", reply?.value);
    Ok(())
}
