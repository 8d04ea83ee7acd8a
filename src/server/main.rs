use std::net::SocketAddr;

use activator::config::ActivatorConfig;
use activator::errors::{LicenseError, LicenseResult};
use activator::server::logging::init_tracing;
use activator::server::{build_router, ActivationEngine, AppState, Database, SecretGuard};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("activator_server: {e}");
        std::process::exit(1);
    }
}

async fn run() -> LicenseResult<()> {
    let config = ActivatorConfig::load()?;
    init_tracing(&config.logging)?;

    let db = Database::connect(&config.database).await?;
    db.migrate().await?;

    let engine = ActivationEngine::new(db.clone(), config.database.timeout());
    let state = AppState::new(db.clone(), engine);

    let client_guard = SecretGuard::client(&config.auth)?;
    let admin_guard = SecretGuard::admin(&config.auth)?;
    let app = build_router(state, client_guard, admin_guard, &config.rate_limit)?;

    let addr = config.bind_address();
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| LicenseError::ServerError(format!("failed to bind {addr}: {e}")))?;

    info!(
        address = %addr,
        backend = db.backend(),
        "activation server listening"
    );

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| LicenseError::ServerError(format!("server error: {e}")))?;

    info!("activation server stopped");
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for Ctrl-C: {e}");
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
                tracing::error!("failed to listen for SIGTERM: {e}");
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

    info!("shutdown signal received, draining connections");
}
