use clap::Parser;
use snafu::prelude::*;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use magpie::config::MagpieConfig;
use magpie::server::Gateway;

#[derive(Debug, Snafu)]
enum Error {
    #[snafu(display("Config error: {source}"))]
    Config { source: magpie::config::Error },

    #[snafu(display("Server error: {source}"))]
    Server { source: magpie::server::Error },
}

#[derive(Parser, Debug)]
#[command(name = "magpie")]
#[command(version)]
#[command(about = "An HTTP-to-process gateway: turn incoming webhooks into command executions", long_about = None)]
struct Cli {
    /// Path to the configuration file. Defaults to magpie.yaml in the
    /// working directory or in ./config
    #[arg(short, long, env = "MAGPIE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured HTTP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let filter_layer = if verbose {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug"))
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    // Load configuration from file, env vars, and defaults
    let mut config = MagpieConfig::load(cli.config.as_deref()).context(ConfigSnafu)?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    init_tracing(cli.verbose || config.debug);

    tracing::info!("magpie version: v{}", env!("CARGO_PKG_VERSION"));

    let address = SocketAddr::from(([0, 0, 0, 0], config.port));
    let gateway = Gateway::new(config).await.context(ServerSnafu)?;
    gateway.serve(address, shutdown_signal()).await.context(ServerSnafu)
}
