//! Service entry point: configuration, logging, lifecycle.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use tracing::{error, info, warn};

use countersrv::api::{create_router, AppState};
use countersrv::core::config::ConfigManager;
use countersrv::core::service::CollectorService;
use countersrv::core::storage::TimescaleSink;

/// Command line arguments for the counter collection service.
#[derive(Parser)]
#[command(
    name = "countersrv",
    version = env!("CARGO_PKG_VERSION"),
    about = "Counter collection service for Modbus TCP and MQTT field devices"
)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/countersrv.yaml", env = "COUNTERSRV_CONFIG")]
    config: String,

    /// Log directory path
    #[arg(long, default_value = "logs")]
    log_dir: String,

    /// Override the configured log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    if let Err(e) = dotenv() {
        // Missing .env is normal outside development.
        if !e.not_found() {
            eprintln!("warning: failed to load .env file: {e}");
        }
    }

    // Configuration errors are fatal and must be readable without a log
    // pipeline, so load before tracing is up.
    let config_manager = match ConfigManager::from_file(&args.config) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("configuration error in {}: {e}", args.config);
            std::process::exit(1);
        }
    };

    let level = args
        .log_level
        .clone()
        .unwrap_or_else(|| config_manager.log_level().to_string());
    let service_name = config_manager.service().name.clone();

    if let Err(e) = std::fs::create_dir_all(&args.log_dir) {
        eprintln!("failed to create log directory {}: {e}", args.log_dir);
        std::process::exit(1);
    }
    let file_appender = tracing_appender::rolling::daily(&args.log_dir, format!("{service_name}.log"));
    let (non_blocking, _log_guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::fmt::writer::MakeWriterExt;
    tracing_subscriber::fmt()
        .with_writer(std::io::stdout.and(non_blocking))
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(level.parse().unwrap_or(tracing::Level::INFO.into())),
        )
        .init();

    info!(
        service = %service_name,
        version = env!("CARGO_PKG_VERSION"),
        config = %args.config,
        "starting counter collection service"
    );

    let config = config_manager.into_config();

    // The sink pool is required at startup; an unreachable database is a
    // startup failure, not a runtime retry case.
    let sink = match TimescaleSink::connect(&config.timescale).await {
        Ok(sink) => Arc::new(sink),
        Err(e) => {
            error!(error = %e, "failed to connect to TimescaleDB");
            eprintln!("startup failure: {e}");
            std::process::exit(1);
        }
    };

    let api_config = config.api.clone();
    let service = match CollectorService::start(config, sink.clone()).await {
        Ok(service) => service,
        Err(e) => {
            error!(error = %e, "failed to start collection service");
            eprintln!("startup failure: {e}");
            std::process::exit(1);
        }
    };

    let mut server_handle = None;
    if api_config.enabled {
        let addr = match api_config.bind_address.parse::<SocketAddr>() {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, address = %api_config.bind_address, "invalid api.bind_address");
                service.shutdown().await;
                std::process::exit(1);
            }
        };

        let router = create_router(AppState::new(service.clone()));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, %addr, "failed to bind API listener");
                service.shutdown().await;
                std::process::exit(1);
            }
        };

        info!(%addr, "HTTP API listening");
        info!("health check: http://{addr}/health");
        server_handle = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "API server terminated");
            }
        }));
    } else {
        info!("HTTP API disabled in configuration");
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received shutdown signal"),
        Err(e) => error!(error = %e, "failed to listen for shutdown signal"),
    }

    service.shutdown().await;
    if let Some(handle) = server_handle {
        handle.abort();
        let _ = handle.await;
    }
    sink.close().await;

    if let Some(pending) = service.dlq_pending() {
        if pending > 0 {
            warn!(pending, "dead-letter batches remain on disk for the next run");
        }
    }
    info!("counter collection service stopped");
}
