//! XTraders - local trading service
//!
//! Starts the UI server and the trading services behind it.

use xtraders::config::AppConfig;
use xtraders::launcher::Launcher;

use clap::Parser;
use std::path::PathBuf;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "xtraders")]
#[command(about = "XTraders trading service with demo wallet and auto trader")]
struct Args {
    /// Path to TOML configuration file
    #[arg(short, long, env = "XTRADERS_CONFIG")]
    config: Option<PathBuf>,

    /// UI server port (overrides config and environment)
    #[arg(short, long)]
    port: Option<u16>,

    /// UI server bind address
    #[arg(long)]
    host: Option<String>,

    /// Exchange used for trading ("sushiswap", "binance", "kucoin")
    #[arg(long)]
    exchange: Option<String>,

    /// Serve the UI only, without starting trading services
    #[arg(long)]
    standalone: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("xtraders=info")))
        .with_target(false)
        .with_thread_ids(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║          XTraders - Rust Trading Service v{}          ║", env!("CARGO_PKG_VERSION"));
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = AppConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(exchange) = args.exchange {
        config.exchange.default = exchange.to_lowercase();
    }
    let standalone = args.standalone || config.startup.standalone;

    let launcher = Launcher::new(config)?;
    launcher.start(standalone, shutdown_signal()).await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
