//! Stagehand agent entry point.

use stagehand_api::{AppState, ServerConfig, routes, tls};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::from_env()?;
    init_tracing(&config);

    // The TLS stack needs a process-wide crypto provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let state = AppState::new(config.proxy_envs.clone(), config.log_file.clone());
    let app = routes::router(state);

    let listener = TcpListener::bind(config.bind).await?;

    if config.insecure || !config.tls_configured() {
        if !config.insecure {
            warn!("TLS material not configured, serving plaintext");
        }
        info!(addr = %config.bind, "serving plaintext HTTP");
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        let tls_config = tls::build_tls_config(&config)?;
        tls::serve(listener, tls_config, app).await?;
    }

    Ok(())
}

/// Log to stderr and tee to the agent logfile whose tail `/destroy`
/// uploads to the log service.
fn init_tracing(config: &ServerConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter()));

    let log_file = std::path::Path::new(&config.log_file);
    if let Some(parent) = log_file.parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file);

    match file {
        Ok(file) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .with(
                    fmt::layer()
                        .with_ansi(false)
                        .with_writer(std::sync::Arc::new(file)),
                )
                .init();
        }
        Err(e) => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
            warn!(path = %config.log_file, error = %e, "agent logfile unavailable");
        }
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
