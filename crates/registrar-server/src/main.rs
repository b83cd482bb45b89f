//! sipreg: SIP registrar daemon

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use sipreg_registrar_core::{RegistrarConfig, SERVER_AGENT};
use sipreg_server::RegistrarServer;
use sipreg_server::logging::{LoggingConfig, parse_log_level, setup_logging, verbosity_level};
use tracing::{error, info, warn};

/// SIP registrar with digest authentication and a synchronized extension directory
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file (INI)
    #[arg(short, long, default_value = "sipreg.ini")]
    config: PathBuf,

    /// Increase verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log level; overrides -v. RUST_LOG takes precedence when set
    #[arg(long)]
    log_level: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match &args.log_level {
        Some(level) => parse_log_level(level)?,
        None => verbosity_level(args.verbose),
    };
    let mut logging = LoggingConfig::new(level);
    if args.json {
        logging = logging.with_json();
    }
    setup_logging(logging)?;
    info!("Starting {}", SERVER_AGENT);

    let config = RegistrarConfig::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    let server = RegistrarServer::new(Some(args.config.clone()), config)?;

    match server.start().await {
        Ok(addr) => info!("registrar listening on udp {}", addr),
        Err(e) => {
            error!("startup failed: {}", e);
            server.shutdown().await;
            return Err(e.into());
        }
    }

    wait_for_shutdown(&server).await?;
    server.shutdown().await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown(server: &RegistrarServer) -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = hangup.recv() => {
                if let Err(e) = server.reload().await {
                    warn!("reload failed: {}", e);
                }
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_server: &RegistrarServer) -> anyhow::Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
