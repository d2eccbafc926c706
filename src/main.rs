use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use pages_builder::config::{Config, DEFAULT_CONFIG_PATH};
use pages_builder::coordinator::Coordinator;
use pages_builder::git::GitCli;
use pages_builder::server::{AppState, build_router};
use pages_builder::services::builder::CommandSiteBuilder;
use pages_builder::services::credentials::AesCredentials;
use pages_builder::services::store::JsonRepoStore;
use pages_builder::services::{LiveServices, ServiceSet};
use pages_builder::types::RepoKey;
use pages_builder::webhooks::WebhookSecret;

/// Log filter used when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "pages_builder=debug";

#[derive(Debug, Parser)]
#[command(name = "pages-builder", version, about)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, short, global = true, env = "PAGES_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the webhook server.
    Serve,

    /// Register a repository, or replace its credentials.
    Register {
        /// Repository as `owner/name`.
        repo: RepoKey,

        /// Account the access token belongs to.
        #[arg(long)]
        username: String,

        /// Access token with push rights.
        #[arg(long, env = "PAGES_ACCESS_TOKEN", hide_env_values = true)]
        token: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    match cli.command {
        Commands::Serve => serve(config).await,
        Commands::Register {
            repo,
            username,
            token,
        } => register(config, repo, username, token).await,
    }
}

async fn serve(config: Config) -> Result<()> {
    let credentials = AesCredentials::from_hex(&config.secret_key)?;
    let store = JsonRepoStore::new(config.state_dir.clone());
    let services: LiveServices = ServiceSet {
        store: store.clone(),
        credentials,
        vcs: GitCli::new(config.commit_identity()),
        builder: CommandSiteBuilder::new(config.builder_command.clone()),
        sink: store,
    };

    let coordinator = Arc::new(Coordinator::new(Arc::new(services), config.run_settings()));
    let stale = coordinator
        .cleanup_stale_workdirs()
        .with_context(|| format!("clearing {}", config.work_root.display()))?;
    if !stale.is_empty() {
        info!(count = stale.len(), "removed stale working directories");
    }
    let state = AppState::new(coordinator, WebhookSecret::new(config.webhook_secret.as_str()));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(
        addr = %config.listen_addr,
        source_branch = %config.source_branch,
        "listening"
    );

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            shutdown_signal().await;
            shutdown.cancel();
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    info!("server stopped");
    Ok(())
}

async fn register(config: Config, repo: RepoKey, username: String, token: String) -> Result<()> {
    let credentials = AesCredentials::from_hex(&config.secret_key)?;
    let sealed = credentials.encrypt(&token)?;
    let store = JsonRepoStore::new(config.state_dir.clone());
    store.register(&repo, &username, &sealed).await?;
    info!(repo = %repo, username = %username, "registered repository");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install Ctrl+C handler: {}", err);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(err) => error!("failed to install SIGTERM handler: {}", err),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
