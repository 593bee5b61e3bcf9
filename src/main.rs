//! Runway: CI server transport bootstrap.
//!
//! Entry point. Initializes tracing, loads and validates configuration, then
//! runs the supervised listeners until a signal or the first fatal error. This
//! is the only place that decides the process exit code.

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use runway::config::{AppConfig, DEFAULT_CONFIG_PATH, DEFAULT_LOG_FILTER};
use runway::http::shutdown;
use runway::{routes, Server, ServerError};

/// Runway: agent channel and web listeners for a CI server
#[derive(Parser, Debug)]
#[command(name = "runway", version, about)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: String,

    /// Log level filter (e.g., "runway=debug,tower_http=info")
    #[arg(short, long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match AppConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            init_tracing(args.log_level, "text");
            tracing::error!(config = %args.config, error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    init_tracing(args.log_level, &config.logging.format);

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Fatal error, exiting");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: AppConfig) -> Result<(), ServerError> {
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("rustls crypto provider already installed");
    }

    let identity = config.identity()?;
    tracing::info!(
        host = %identity.public.url,
        root_path = %identity.root_path,
        grpc = %identity.grpc.addr,
        "Loaded configuration"
    );

    let shutdown = CancellationToken::new();
    shutdown::spawn_signal_handler(shutdown.clone());

    Server::new(identity, routes::default_router())?
        .run(shutdown)
        .await
}

/// Initialize tracing with priority: CLI > env > default
fn init_tracing(cli_filter: Option<String>, format: &str) {
    let log_filter = cli_filter
        .or_else(|| std::env::var("RUST_LOG").ok())
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

    let registry =
        tracing_subscriber::registry().with(tracing_subscriber::EnvFilter::new(&log_filter));

    if format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
