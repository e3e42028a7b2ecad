//! cowrite daemon (cowrited)
//!
//! # Usage
//!
//! ```bash
//! # Development: in-memory documents, any token is accepted as the user name
//! cowrited --anonymous
//!
//! # Signed tokens and SQLite persistence
//! cowrited --secret change-me --db /var/lib/cowrite/documents.db
//!
//! # Mint a token for a user
//! cowrited --secret change-me --issue-token alice:Alice
//!
//! # With configuration file
//! cowrited --config /etc/cowrite/cowrite.toml
//! ```

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cowrite_core::SessionManager;
use cowrite_storage::{MemoryStorage, SqliteStorage, Storage};
use cowrite_transport::{
    AllowAnonymous, Authenticator, Identity, Metrics, MetricsServer, StaticTokens, TokenSigner,
    WebSocketServer,
};

use crate::config::{AuthMode, DaemonConfig, StorageBackend};

/// cowrite daemon - real-time collaborative document sync
#[derive(Parser, Debug)]
#[command(name = "cowrited")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, env = "COWRITE_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address
    #[arg(long, env = "COWRITE_BIND")]
    bind: Option<String>,

    /// WebSocket port to listen on
    #[arg(long, env = "COWRITE_PORT")]
    port: Option<u16>,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "COWRITE_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Log filter, e.g. info or cowrite_core=debug
    #[arg(long, env = "COWRITE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// SQLite database path; selects the sqlite backend
    #[arg(long, env = "COWRITE_DB")]
    db: Option<PathBuf>,

    /// Token signing secret; selects HMAC authentication
    #[arg(long, env = "COWRITE_SECRET", conflicts_with = "anonymous")]
    secret: Option<String>,

    /// Accept any token as the user name (development only)
    #[arg(long)]
    anonymous: bool,

    /// Print a signed token for USER[:DISPLAY NAME] and exit
    #[arg(long, value_name = "USER[:NAME]")]
    issue_token: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let config = resolve_config(&args)?;

    if let Some(user) = &args.issue_token {
        let signer = signer(&config)?;
        let (user_id, display_name) = user.split_once(':').unwrap_or((user.as_str(), user.as_str()));
        println!("{}", signer.issue(user_id, display_name));
        return Ok(());
    }

    print_banner();

    let storage = open_storage(&config)?;
    let auth = authenticator(&config)?;

    let manager = Arc::new(SessionManager::new(storage, config.engine()));
    manager.start();

    let ws_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .context("Invalid bind address")?;

    info!(
        addr = %ws_addr,
        merge = %config.session.merge,
        storage = ?config.storage.backend,
        auth = ?config.auth.mode,
        "Starting cowrite daemon"
    );

    let mut ws_server = WebSocketServer::new(manager.clone(), auth, ws_addr);
    let mut handles = Vec::new();

    if let Some(port) = config.server.metrics_port {
        let metrics = Arc::new(Metrics::new()?);
        ws_server = ws_server.with_metrics(metrics.clone());

        let metrics_addr: SocketAddr = format!("{}:{}", config.server.bind, port)
            .parse()
            .context("Invalid metrics address")?;
        let metrics_server = MetricsServer::new(metrics, manager.clone(), metrics_addr);
        handles.push(tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!(error = %e, "Metrics server error");
            }
        }));
    }

    let mut ws_task = tokio::spawn(async move { ws_server.run().await });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutting down...");
        }
        result = &mut ws_task => {
            match result {
                Ok(Err(e)) => error!(error = %e, "WebSocket server error"),
                Err(e) => error!(error = %e, "WebSocket server task failed"),
                Ok(Ok(())) => {}
            }
        }
    }

    ws_task.abort();
    for handle in handles {
        handle.abort();
    }

    // Flush every dirty document before exiting
    manager.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

/// Config file, then CLI and environment overrides
fn resolve_config(args: &Args) -> Result<DaemonConfig> {
    let mut config = match &args.config {
        Some(path) => DaemonConfig::load(path)?,
        None => DaemonConfig::default(),
    };

    if let Some(bind) = &args.bind {
        config.server.bind = bind.clone();
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(port) = args.metrics_port {
        config.server.metrics_port = Some(port);
    }
    if let Some(db) = &args.db {
        config.storage.backend = StorageBackend::Sqlite;
        config.storage.path = Some(db.clone());
    }
    if let Some(secret) = &args.secret {
        config.auth.mode = AuthMode::Hmac;
        config.auth.secret = Some(secret.clone());
    }
    if args.anonymous {
        config.auth.mode = AuthMode::Anonymous;
    }

    config.validate()?;
    Ok(config)
}

fn signer(config: &DaemonConfig) -> Result<TokenSigner> {
    match (config.auth.mode, &config.auth.secret) {
        (AuthMode::Hmac, Some(secret)) => Ok(TokenSigner::new(secret.as_bytes())
            .with_ttl(Duration::from_secs(config.auth.token_ttl_secs))),
        _ => bail!("Issuing tokens requires HMAC authentication with a secret"),
    }
}

fn authenticator(config: &DaemonConfig) -> Result<Arc<dyn Authenticator>> {
    let auth: Arc<dyn Authenticator> = match config.auth.mode {
        AuthMode::Hmac => Arc::new(signer(config)?),
        AuthMode::Static => {
            let tokens: StaticTokens = config
                .auth
                .tokens
                .iter()
                .map(|entry| {
                    let name = entry.display_name.as_deref().unwrap_or(&entry.user_id);
                    (entry.token.clone(), Identity::new(&entry.user_id, name))
                })
                .collect();
            info!(count = tokens.len(), "Loaded static tokens");
            Arc::new(tokens)
        }
        AuthMode::Anonymous => {
            warn!("Anonymous authentication enabled; do not expose this server");
            Arc::new(AllowAnonymous)
        }
    };
    Ok(auth)
}

fn open_storage(config: &DaemonConfig) -> Result<Arc<dyn Storage>> {
    match (config.storage.backend, &config.storage.path) {
        (StorageBackend::Sqlite, Some(path)) => {
            info!(path = %path.display(), "Initializing SQLite persistence");
            let storage = SqliteStorage::new(path)
                .with_context(|| format!("Failed to open {}", path.display()))?;
            Ok(Arc::new(storage))
        }
        (StorageBackend::Sqlite, None) => bail!("storage.path is required for sqlite"),
        (StorageBackend::Memory, _) => {
            warn!("Running in-memory only; documents are lost on exit");
            Ok(Arc::new(MemoryStorage::new()))
        }
    }
}

fn print_banner() {
    println!(
        r#"
  cowrite
  Real-time collaborative documents
  Version {}
"#,
        env!("CARGO_PKG_VERSION")
    );
}
