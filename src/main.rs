use anyhow::Context;
use sessiongate::api::{GatewayApi, PKG_NAME, VERSION};
use sessiongate::config::Config;
use sessiongate::db::Database;
use sessiongate::provision::ScriptProvisioner;
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
                .add_directive("sessiongate=debug".parse().context("invalid log directive")?),
        )
        .init();

    // Load configuration
    let explicit_path = std::env::args().nth(1).map(PathBuf::from);
    let config_path = explicit_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let mut config = if explicit_path.is_none() && !config_path.exists() {
        info!(path = %config_path.display(), "No configuration file found, using defaults");
        Config::default()
    } else {
        let config = Config::load(&config_path).map_err(|e| {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            e
        })?;
        info!(path = %config_path.display(), "Configuration loaded");
        config
    };

    config.apply_env_overrides();
    config.validate()?;

    print_startup_banner(&config);
    ensure_not_root(config.server.allow_root)?;

    // Bootstrap the working repository before any session is provisioned
    let provisioner = ScriptProvisioner::new(&config.provisioning)?;
    provisioner
        .clone_repository()
        .await
        .map_err(|e| anyhow::anyhow!(e.diagnostic()))
        .context("Failed to clone repository")?;

    let registry = Database::open(&config.server.database_path).with_context(|| {
        format!(
            "Failed to open session registry at {}",
            config.server.database_path.display()
        )
    })?;
    info!(path = %config.server.database_path.display(), "Session registry initialized");

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api = Arc::new(GatewayApi::new(&config, registry, shutdown_rx)?);
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

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
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for the server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;

    info!("Shutdown complete");
    Ok(())
}

/// Refuse to serve as UID 0 unless explicitly permitted
fn ensure_not_root(allow_root: bool) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let uid = unsafe { libc::geteuid() };
        if uid == 0 && !allow_root {
            anyhow::bail!(
                "Refusing to run as root (UID 0); set server.allow_root = true to override"
            );
        }
        info!(uid, "Running as UID {}", uid);
    }

    #[cfg(not(unix))]
    let _ = allow_root;

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting session gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        database = %config.server.database_path.display(),
        request_timeout_secs = config.server.request_timeout_secs,
        delete_rate_limit_per_minute = config.server.delete_rate_limit_per_minute,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        setup_command = %config.provisioning.setup_command,
        cleanup_command = %config.provisioning.cleanup_command,
        worktree_base = %config.provisioning.worktree_base,
        repo_url = ?config.provisioning.repo_url,
        "Provisioning settings"
    );
    info!(
        program = %config.backend.program,
        spec_path = %config.backend.spec_path,
        spec_ttl_secs = config.backend.spec_ttl_secs,
        health_path = %config.backend.health_path,
        kill_grace_period_secs = config.backend.kill_grace_period_secs,
        "Backend settings"
    );
}
