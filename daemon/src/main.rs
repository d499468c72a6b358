mod bridge;
mod logging;

use clap::{Parser, Subcommand};
use logging::LogFormat;
use nubus_router::{FrameSink, Gateway, ListenPort, RouterConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "nubus-daemon")]
#[command(about = "User-space NAT gateway for an emulated Macintosh")]
struct Cli {
    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty, global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway on a unix datagram socket
    Start {
        /// JSON configuration file
        #[arg(long)]
        config: Option<PathBuf>,

        /// Socket the emulator exchanges Ethernet frames on
        #[arg(long, default_value = "/tmp/nubus.sock")]
        socket: PathBuf,

        /// Inbound TCP port to forward to the guest, as port[,bind-ip]
        #[arg(long = "tcp-port")]
        tcp_ports: Vec<ListenPort>,

        /// TCP port treated as an FTP control channel
        #[arg(long = "ftp-port")]
        ftp_ports: Vec<u16>,
    },
    /// Print the effective configuration as JSON
    Config {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long = "tcp-port")]
        tcp_ports: Vec<ListenPort>,

        #[arg(long = "ftp-port")]
        ftp_ports: Vec<u16>,
    },
}

/// File settings, with command-line lists replacing the file's.
fn load_config(
    path: Option<&Path>,
    tcp_ports: Vec<ListenPort>,
    ftp_ports: Vec<u16>,
) -> nubus_router::Result<RouterConfig> {
    let mut config = match path {
        Some(path) => RouterConfig::load(path)?,
        None => RouterConfig::default(),
    };
    if !tcp_ports.is_empty() {
        config.tcp_ports = tcp_ports;
    }
    if !ftp_ports.is_empty() {
        config.ftp_ports = ftp_ports;
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(cli.log_format);

    match cli.command {
        Commands::Start {
            config,
            socket,
            tcp_ports,
            ftp_ports,
        } => {
            let config = load_config(config.as_deref(), tcp_ports, ftp_ports)?;

            let (tx, rx) = mpsc::unbounded_channel();
            let sink: Arc<dyn FrameSink> = Arc::new(move |frame: Vec<u8>| {
                let _ = tx.send(frame);
            });
            let gateway = Gateway::start(config, sink)?;
            let link = bridge::bind(&socket)?;
            tracing::info!(socket = %socket.display(), "waiting for emulator frames");

            bridge::run(&gateway, &link, rx, async {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::warn!(error = %e, "could not listen for ctrl-c");
                    std::future::pending::<()>().await;
                }
            })
            .await;

            let stats = gateway.stats();
            tracing::info!(
                tcp_connections = stats.tcp_connections,
                datagram_sessions = stats.datagram_sessions,
                "shutting down"
            );
            gateway.shutdown().await;
            if let Err(e) = std::fs::remove_file(&socket) {
                tracing::debug!(error = %e, "could not remove socket");
            }
        }
        Commands::Config {
            config,
            tcp_ports,
            ftp_ports,
        } => {
            let config = load_config(config.as_deref(), tcp_ports, ftp_ports)?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
