mod config;
mod error;
mod gate;
mod handler;
mod index;
mod props;
mod sessions;
mod state;
mod template;
mod users;
mod watcher;

use anyhow::Context;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use config::ServerConfig;
use index::{ContentIndex, MarkdownRenderer};
use sessions::SessionStore;
use state::AppState;
use users::{Argon2Scheme, CredentialStore};

#[derive(Parser, Debug)]
#[command(name = "md-gate", about = "Serve a markdown tree behind a login wall")]
struct Args {
    /// Content root: the markdown tree, the resources/ directory, and the
    /// persisted store files. Defaults to the current working directory.
    #[arg(long, env = "MD_ROOT")]
    root: Option<PathBuf>,

    /// Override the configured bind host.
    #[arg(long, env = "HOST")]
    host: Option<String>,

    /// Override the configured port.
    #[arg(short, long, env = "PORT")]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "md_gate=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load .env file if present (silently ignored if absent).
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let root = match args.root {
        Some(path) => path,
        None => std::env::current_dir().context("Cannot determine working directory")?,
    };
    let root = tokio::fs::canonicalize(&root)
        .await
        .with_context(|| format!("Content root {} is not accessible", root.display()))?;
    tracing::info!("Directory to be served: {}", root.display());

    let mut config = ServerConfig::load(&root);
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    let config = Arc::new(config);

    let users = Arc::new(CredentialStore::open(&root, Box::new(Argon2Scheme::default())));
    let sessions = Arc::new(SessionStore::open(&root, config.cookie_age));

    // The initial scan completes before the listener binds, so the first
    // wave of requests can never observe an empty index.
    let index = Arc::new(ContentIndex::new(root.clone(), Box::new(MarkdownRenderer)));
    index.rescan();

    let shutdown = Arc::new(AtomicBool::new(false));
    if config.live_reload {
        let events = watcher::spawn(root.clone(), shutdown.clone());
        watcher::spawn_consumer(events, index.clone(), users.clone(), sessions.clone());
    } else {
        tracing::info!("Live reload disabled");
    }

    let state = AppState {
        config: config.clone(),
        index,
        sessions,
        users,
    };

    // CatchPanicLayer is outermost so it recovers from panics anywhere in
    // the stack.
    let app = handler::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CatchPanicLayer::new());

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Cannot bind to {addr}"))?;

    tracing::info!("Address: http://{addr}");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal(shutdown))
    .await
    .context("Server error")?;

    Ok(())
}

async fn shutdown_signal(watcher_shutdown: Arc<AtomicBool>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to register SIGTERM handler");
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result { tracing::error!("ctrl-c error: {}", e); }
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
    watcher_shutdown.store(true, Ordering::Relaxed);
    tracing::info!("Shutting down gracefully");
}
