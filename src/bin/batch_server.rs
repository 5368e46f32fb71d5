use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::Parser;
use newtube_batch::{
    config::{self, EnvConfig},
    resolver::{YtDlpConfig, YtDlpResolver},
    security::ensure_not_root,
    server::{AppState, router},
    workspace::WorkspaceManager,
};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_LOG_FILTER: &str = "newtube_batch=info,tower_http=info";

#[derive(Parser, Debug)]
#[command(author, version, about = "Serve batch media downloads over HTTP.")]
struct Cli {
    #[arg(
        long = "config",
        value_name = "PATH",
        help = "Path to the env-style config file (default /etc/newtube-batch-env, optional)"
    )]
    config: Option<PathBuf>,
    #[arg(long = "host", value_name = "ADDR", help = "Address to bind")]
    host: Option<String>,
    #[arg(short = 'p', long = "port", value_name = "PORT", help = "Port to bind")]
    port: Option<u16>,
    #[arg(
        long = "workspace-root",
        value_name = "PATH",
        help = "Directory under which per-request workspaces are created"
    )]
    workspace_root: Option<PathBuf>,
    #[arg(long = "allow-root", help = "Allow running as root")]
    allow_root: bool,
}

impl Cli {
    fn overrides(&self) -> EnvConfig {
        EnvConfig {
            newtube_host: self.host.clone(),
            newtube_port: self.port,
            workspace_root: self.workspace_root.clone(),
            ..EnvConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();
    ensure_not_root("batch_server", cli.allow_root)?;

    let settings = config::load_env_layers(cli.config.as_deref())
        .context("loading configuration")?
        .merge(cli.overrides())
        .into_service_config()
        .context("validating configuration")?;

    let resolver = YtDlpResolver::new(YtDlpConfig {
        binary: settings.ytdlp_bin.clone(),
        ffmpeg: settings.ffmpeg_bin.clone(),
        cookies: settings.cookies_file.clone(),
    });
    resolver
        .initialize()
        .await
        .with_context(|| format!("checking {}", settings.ytdlp_bin.display()))?;

    let workspaces = WorkspaceManager::new(&settings.workspace_root);
    if let Err(err) = workspaces.sweep_stale(settings.cleanup_delay) {
        warn!(root = %workspaces.root().display(), error = %err, "could not sweep stale workspaces");
    }

    let state = AppState::from_config(&settings, Arc::new(resolver));
    let cleanup = state.cleanup().clone();
    let app = router(state);

    let addr = settings.socket_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(
        %addr,
        workspace_root = %settings.workspace_root.display(),
        concurrency = settings.fetch_concurrency,
        "batch server listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running batch server")?;

    cleanup.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(error = %err, "failed to install Ctrl+C handler");
    }
    info!("shutdown requested");
}
