use fleetgate::cluster::Cluster;
use fleetgate::config::Config;
use fleetgate::management::{PKG_NAME, VERSION};
use fleetgate::proxy::{Gateway, ProxyServer};
use fleetgate::reconcile::{reconcile, RunnerClient};
use fleetgate::routes::RoutingTable;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

const DEFAULT_CONFIG: &str = "config.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fleetgate=debug".parse().expect("valid log directive")),
        )
        .init();

    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config = load_config(explicit_path)?;

    print_startup_banner(&config);

    let cluster = Arc::new(Cluster::load(config.server.registry_path()).map_err(|e| {
        error!(error = %e, "Failed to load runner registry");
        e
    })?);
    info!(
        path = %cluster.path().display(),
        runners = cluster.len(),
        "Runner registry loaded"
    );

    let routes = Arc::new(RoutingTable::new());
    let client = Arc::new(RunnerClient::new(config.reconcile.query_timeout())?);
    reconcile(&cluster, &routes, client.as_ref()).await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let gateway = Arc::new(Gateway::new(cluster, routes, client, &config.server));
    let server = ProxyServer::new(
        config.server.bind_addr()?,
        gateway,
        shutdown_rx,
        config.server.shutdown_grace(),
    );

    let mut server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
            _ = &mut server_handle => {
                anyhow::bail!("Gateway server stopped unexpectedly");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, shutting down..."),
            _ = &mut server_handle => {
                anyhow::bail!("Gateway server stopped unexpectedly");
            }
        }
    }

    let _ = shutdown_tx.send(true);

    // The server bounds its own drain by the grace period
    let _ = server_handle.await;

    info!("Shutdown complete");
    Ok(())
}

/// Load the config named on the command line, or `config.toml` if present,
/// or fall back to built-in defaults.
fn load_config(explicit_path: Option<PathBuf>) -> anyhow::Result<Config> {
    let (path, explicit) = match explicit_path {
        Some(path) => (path, true),
        None => (PathBuf::from(DEFAULT_CONFIG), false),
    };

    if !explicit && !path.exists() {
        info!(path = %path.display(), "No configuration file, using defaults");
        return Ok(Config::default());
    }

    let config = Config::load(&path).map_err(|e| {
        error!(path = %path.display(), error = %e, "Failed to load configuration");
        e
    })?;
    info!(path = %path.display(), "Configuration loaded");
    Ok(config)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        data_dir = %config.server.data_dir.display(),
        default_app = config.server.default_app().unwrap_or("-"),
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        request_timeout_secs = config.server.request_timeout_secs,
        shutdown_grace_secs = config.server.shutdown_grace_secs,
        "Connection settings"
    );
    info!(
        query_timeout_secs = config.reconcile.query_timeout_secs,
        "Reconciliation settings"
    );
}
