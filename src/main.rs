use idlegate::adapter::ContainerAdapter;
use idlegate::api::{ApiServer, PKG_NAME, VERSION};
use idlegate::config::Config;
use idlegate::docker::DockerEngine;
use idlegate::registry::ServiceRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("idlegate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = Config::load_or_default(config_path.as_deref()).map_err(|e| {
        error!(path = ?config_path, error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config);

    let engine = DockerEngine::new(config.docker.host.as_deref()).await.map_err(|e| {
        error!(error = %e, "Failed to connect to Docker");
        e
    })?;
    info!("Connected to Docker daemon");

    let adapter = ContainerAdapter::new(
        Arc::new(engine),
        config.labels.clone(),
        config.docker.stop_grace(),
    );
    let registry = ServiceRegistry::new(adapter, config.supervisor.status_retry_backoff());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let server = ApiServer::new(addr, Arc::clone(&registry), shutdown_rx)
        .with_strict_status_codes(config.server.strict_status_codes);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Controller API error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Containers keep running; the next ping after a restart re-supervises them
    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!(
        services = registry.len(),
        "Shutdown complete, supervised containers left as they are"
    );
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting container controller");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        strict_status_codes = config.server.strict_status_codes,
        "Server configuration"
    );
    info!(
        docker_host = ?config.docker.host,
        stop_grace_secs = ?config.docker.stop_grace_secs,
        "Docker settings"
    );
    info!(
        label_prefix = %config.labels.prefix,
        sentinel = %config.labels.sentinel,
        status_retry_backoff_ms = config.supervisor.status_retry_backoff_ms,
        "Discovery settings"
    );
}
