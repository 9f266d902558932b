use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use agito::auth::FileKeyStore;
use agito::config::{self, Config};
use agito::git::SystemGit;
use agito::health::{self, HealthState};
use agito::metrics::MetricsRegistry;
use agito::AppState;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "agito-server", about = "Sandboxed Git-over-SSH gateway")]
struct Cli {
    /// Path to the YAML configuration file.  Built-in defaults are used when
    /// omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Directory holding the bare repositories.
    #[arg(long)]
    repos: Option<PathBuf>,

    /// SSH listen address, e.g. `0.0.0.0:2222`.
    #[arg(long)]
    ssh_listen: Option<String>,

    /// SSH host key file.  Generated on first start if absent.
    #[arg(long)]
    host_key: Option<PathBuf>,

    /// authorized_keys file.  Created empty if absent.
    #[arg(long)]
    authorized_keys: Option<PathBuf>,
}

impl Cli {
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(ref repos) = self.repos {
            config.repos.root = repos.clone();
        }
        if let Some(ref listen) = self.ssh_listen {
            config.ssh.listen = listen.clone();
        }
        if let Some(ref host_key) = self.host_key {
            config.ssh.host_key_path = host_key.clone();
        }
        if let Some(ref keys) = self.authorized_keys {
            config.ssh.authorized_keys_path = keys.clone();
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP server (axum)
// ---------------------------------------------------------------------------

async fn run_http_server(listen: String, state: HealthState) -> Result<()> {
    let app = health::create_router(state);

    let listen_addr: std::net::SocketAddr =
        listen.parse().context("invalid http.listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let mut config = match cli.config {
        Some(ref path) => config::load_config(path)?,
        None => Config::default(),
    };
    cli.apply_overrides(&mut config);
    config::validate_config(&config)?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(config_path = ?cli.config, "starting agito-server");

    // ---- Ensure repository root exists ----
    tokio::fs::create_dir_all(&config.repos.root)
        .await
        .with_context(|| {
            format!(
                "failed to create repository root: {}",
                config.repos.root.display()
            )
        })?;

    // ---- Authorized keys ----
    let keys = FileKeyStore::new(&config.ssh.authorized_keys_path);
    keys.ensure_exists().await?;

    // ---- App state ----
    let metrics = MetricsRegistry::new();
    let state = Arc::new(AppState::new(
        Arc::clone(&config),
        Arc::new(keys),
        Arc::new(SystemGit::new(config.git.binary.clone())),
        metrics.clone(),
    )?);
    tracing::info!(
        root = %state.sandbox.root().display(),
        authorized_keys = %config.ssh.authorized_keys_path.display(),
        "repository root ready"
    );

    // ---- Health / metrics ----
    if let Some(listen) = config.http.listen.clone() {
        let health_state = HealthState {
            repos_root: state.sandbox.root().to_path_buf(),
            authorized_keys: config.ssh.authorized_keys_path.clone(),
            metrics,
        };
        tokio::spawn(async move {
            if let Err(e) = run_http_server(listen, health_state).await {
                tracing::error!(error = %format!("{e:#}"), "HTTP server failed");
            }
        });
    }

    // ---- SSH ----
    // Host key or bind failures end the process.
    tokio::select! {
        result = agito::ssh::start_ssh_server(state) => result?,
        () = shutdown_signal() => {}
    }

    tracing::info!("agito-server shut down cleanly");
    Ok(())
}
