//! Swift Upload Proxy - resumable chunked uploads into OpenStack Swift

use clap::Parser;
use std::sync::Arc;
use swift_upload_proxy::api::handlers::AppState;
use swift_upload_proxy::config::{AuthConfig, BackendConfig, Config};
use swift_upload_proxy::metrics::Metrics;
use swift_upload_proxy::storage;
use swift_upload_proxy::upload::SessionRegistry;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Swift Upload Proxy - resumable chunked uploads into Swift
#[derive(Parser, Debug)]
#[command(name = "swift_upload_proxy")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration from file if specified, otherwise use default loading
    let mut config = if let Some(ref path) = cli.config {
        Config::from_file(path)?
    } else {
        Config::load()?
    };

    // CLI overrides
    if let Some(ref addr) = cli.listen {
        config.listen_addr = addr.parse()?;
    }

    // Initialize tracing (RUST_LOG wins over config)
    let log_level = if cli.verbose {
        "swift_upload_proxy=trace,tower_http=trace".to_string()
    } else {
        config.log_level.clone()
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_level.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Swift Upload Proxy");
    info!("  Listen address: {}", config.listen_addr);
    match &config.backend {
        BackendConfig::Filesystem { path } => {
            info!("  Backend: Filesystem");
            info!("  Data directory: {:?}", path);
        }
        BackendConfig::Swift {
            storage_url,
            timeout_secs,
        } => {
            info!("  Backend: Swift");
            info!("  Storage URL: {}", storage_url);
            info!("  Timeout: {}s", timeout_secs);
            if matches!(config.auth, AuthConfig::None) {
                warn!("  No auth configured; Swift requests are sent without a token");
            }
        }
    }
    info!("  Reorder window: {} chunks", config.reorder_window);
    info!("  Session idle timeout: {}s", config.session_idle_secs);
    info!(
        "  Max chunk request size: {} MB",
        config.max_chunk_size / 1024 / 1024
    );

    let store = storage::from_config(&config).await?;
    let metrics = Metrics::new();
    metrics
        .build_info
        .with_label_values(&[env!("CARGO_PKG_VERSION"), store.kind()])
        .set(1.0);
    metrics
        .process_start_time_seconds
        .set(chrono::Utc::now().timestamp() as f64);

    let sessions = Arc::new(SessionRegistry::new(
        Arc::clone(&store),
        config.reorder_window,
        config.session_idle_timeout(),
        metrics.clone(),
    ));
    let state = Arc::new(AppState {
        sessions,
        metrics,
        backend: store.kind(),
    });

    let app = swift_upload_proxy::api::router(state, config.max_chunk_size as usize);

    // Start server with graceful shutdown
    let listener = TcpListener::bind(&config.listen_addr).await?;
    info!("Swift Upload Proxy listening on http://{}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Handle shutdown signals (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
