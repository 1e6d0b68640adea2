use axum::{
    http::HeaderValue,
    routing::{get, post, put},
    Router,
};
use custody_session::{BackendCoordinator, RefreshOutcome};
use std::future::Future;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use super::handlers;
use crate::config::WalletConfig;
use crate::error::WalletError;
use crate::manager;
use crate::storage::KdfParams;

fn cors_layer(allowed_origins: &[String]) -> Result<CorsLayer, WalletError> {
    let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if allowed_origins.is_empty() {
        log::warn!("CORS: Allowing all origins (development mode). Set ALLOWED_ORIGINS for production.");
        return Ok(base.allow_origin(Any));
    }

    let origins = allowed_origins
        .iter()
        .map(|origin| {
            origin
                .parse::<HeaderValue>()
                .map_err(|_| WalletError::Config(format!("invalid CORS origin '{}'", origin)))
        })
        .collect::<Result<Vec<_>, _>>()?;
    log::info!("CORS configured for origins: {}", allowed_origins.join(", "));
    Ok(base.allow_origin(AllowOrigin::list(origins)))
}

pub fn router(coordinator: BackendCoordinator, config: &WalletConfig) -> Result<Router, WalletError> {
    let cors = cors_layer(&config.allowed_origins)?;

    let app = Router::new()
        // Session and backends
        .route("/api/session", get(handlers::get_session_handler))
        .route("/api/backend/switch", post(handlers::switch_backend_handler))
        .route(
            "/api/backend/:backend",
            axum::routing::delete(handlers::reset_backend_handler),
        )
        .route(
            "/api/backend/:backend/connect",
            post(handlers::connect_handler),
        )
        .route("/api/backend/:backend/unlock", post(handlers::unlock_handler))
        .route("/api/backend/:backend/lock", post(handlers::lock_handler))
        .route(
            "/api/backend/:backend/disconnect",
            post(handlers::disconnect_handler),
        )
        // Wallet setup and derivation
        .route("/api/wallet/create", post(handlers::create_wallet_handler))
        .route("/api/wallet/import", post(handlers::import_wallet_handler))
        .route("/api/wallet/derive", post(handlers::derive_wallets_handler))
        .route(
            "/api/wallet/additional",
            post(handlers::additional_wallet_handler),
        )
        .route("/api/wallet/new-seed", post(handlers::new_seed_wallet_handler))
        .route("/api/wallet/change-pin", post(handlers::change_pin_handler))
        // Accounts
        .route("/api/accounts", get(handlers::list_accounts_handler))
        .route(
            "/api/accounts/active",
            put(handlers::set_active_account_handler),
        )
        .route(
            "/api/accounts/:index/label",
            put(handlers::rename_account_handler),
        )
        // Balances
        .route(
            "/api/balances/refresh",
            post(handlers::refresh_balances_handler),
        )
        .route(
            "/api/balances/fetch-missing",
            post(handlers::fetch_missing_balances_handler),
        )
        .route("/api/balances/status", get(handlers::cache_status_handler))
        // Activity and settings
        .route("/api/activity", post(handlers::activity_handler))
        .route(
            "/api/settings/idle-timeout",
            put(handlers::idle_timeout_handler),
        )
        .layer(cors)
        .with_state(coordinator);

    Ok(app)
}

/// Serves `app` on an already bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> Result<(), WalletError>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

pub async fn start_server(config: WalletConfig) -> Result<(), WalletError> {
    let coordinator = manager::build_coordinator(&config, KdfParams::DEFAULT)?;
    let _event_logger = manager::spawn_event_logger(&coordinator);

    let snapshot = coordinator.initialize().await?;
    log::info!(
        "Active backend: {} ({} wallet record(s))",
        snapshot.active_backend,
        snapshot.wallets.len()
    );

    if snapshot.cache.is_stale && !snapshot.wallets.is_empty() {
        let background = coordinator.clone();
        tokio::spawn(async move {
            match background.refresh_balances().await {
                Ok(RefreshOutcome::Updated { succeeded, failed }) => {
                    log::debug!("Startup refresh: {} ok, {} failed", succeeded, failed)
                }
                Ok(outcome) => log::debug!("Startup refresh: {:?}", outcome),
                Err(e) => log::warn!("Startup refresh failed: {}", e),
            }
        });
    }

    let app = router(coordinator, &config)?;
    let listener = TcpListener::bind(&config.bind_address).await?;
    log::info!("Server listening on http://{}", config.bind_address);

    serve(listener, app, shutdown_signal()).await
}

/// Handle graceful shutdown signals (Ctrl+C, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl+C: {}", e);
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
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            log::info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            log::info!("Received SIGTERM signal");
        },
    }

    log::info!("Shutting down gracefully...");
}
