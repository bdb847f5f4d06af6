use std::{path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use ntpc_openid::{
    auth::{DirectVerifier, MemorySessionStore, SessionStore},
    config::AppConfig,
    observability,
    routes::{self, AppState},
    service::LoginService,
};

#[derive(Parser, Debug)]
#[command(version, about = "New Taipei City OpenID login service", long_about = None)]
struct Args {
    /// Path to config file
    #[arg(short, long, default_value = "ntpc-openid.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match AppConfig::from_file(&args.config) {
        Ok(c) => c,
        Err(e) => {
            eprintln!(
                "Failed to load config from {}: {}",
                args.config.display(),
                e
            );
            std::process::exit(1);
        }
    };

    if let Err(e) = observability::init_tracing(&config.observability) {
        eprintln!("{e}");
        std::process::exit(1);
    }

    tracing::info!(
        config_file = %args.config.display(),
        identity = %config.openid.identity,
        "Starting OpenID login service"
    );

    let ttl = Duration::from_secs(config.session.duration_secs);
    let sessions = Arc::new(MemorySessionStore::new(ttl));
    let verifier = Arc::new(DirectVerifier::new(&config.openid));
    let login = match LoginService::new(config.openid.clone(), verifier, sessions.clone()) {
        Ok(login) => login,
        Err(e) => {
            tracing::error!(error = %e, "Failed to build login service");
            std::process::exit(1);
        }
    };

    let cleanup = tokio::spawn(session_cleanup(sessions, ttl));

    let bind_addr = config.server.bind_addr();
    let app = routes::router(AppState::new(config, login));

    let listener = match tokio::net::TcpListener::bind(bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(error = %e, address = %bind_addr, "Failed to bind to address");
            std::process::exit(1);
        }
    };

    tracing::info!("Server listening on http://{}", bind_addr);

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        tracing::error!(error = %e, "Server error");
    }

    cleanup.abort();
}

/// Periodically drop expired login sessions.
async fn session_cleanup(store: Arc<MemorySessionStore>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        if let Err(e) = store.cleanup().await {
            tracing::warn!(error = %e, "Session cleanup failed");
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
