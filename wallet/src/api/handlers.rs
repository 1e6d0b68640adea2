use axum::{
    extract::{Path, State},
    Json,
};
use chrono::Utc;
use custody_session::{
    Backend, BackendCoordinator, IdleTimeout, RefreshOutcome, SessionSnapshot, SessionState,
    SwitchOutcome,
};

use super::types::*;
use crate::error::WalletError;

fn parse_backend(raw: &str) -> Result<Backend, WalletError> {
    Ok(raw.parse::<Backend>()?)
}

fn accounts_of(coordinator: &BackendCoordinator) -> AccountsResponse {
    AccountsResponse {
        active_account: coordinator.active_account(),
        accounts: coordinator.accounts(),
    }
}

// Session and backends

pub async fn get_session_handler(
    State(coordinator): State<BackendCoordinator>,
) -> Json<SessionSnapshot> {
    Json(coordinator.snapshot())
}

pub async fn switch_backend_handler(
    State(coordinator): State<BackendCoordinator>,
    Json(req): Json<SwitchBackendRequest>,
) -> Result<Json<SwitchOutcome>, WalletError> {
    let outcome = coordinator.switch_backend(req.backend).await?;
    Ok(Json(outcome))
}

pub async fn connect_handler(
    State(coordinator): State<BackendCoordinator>,
    Path(backend): Path<String>,
) -> Result<Json<SessionState>, WalletError> {
    let state = coordinator.connect(parse_backend(&backend)?).await?;
    Ok(Json(state))
}

pub async fn unlock_handler(
    State(coordinator): State<BackendCoordinator>,
    Path(backend): Path<String>,
    Json(req): Json<PinRequest>,
) -> Result<Json<SessionState>, WalletError> {
    let state = coordinator.unlock(parse_backend(&backend)?, &req.pin).await?;
    Ok(Json(state))
}

pub async fn lock_handler(
    State(coordinator): State<BackendCoordinator>,
    Path(backend): Path<String>,
) -> Result<Json<SessionState>, WalletError> {
    Ok(Json(coordinator.lock(parse_backend(&backend)?)))
}

pub async fn disconnect_handler(
    State(coordinator): State<BackendCoordinator>,
    Path(backend): Path<String>,
) -> Result<Json<SessionState>, WalletError> {
    let state = coordinator.disconnect(parse_backend(&backend)?).await?;
    Ok(Json(state))
}

pub async fn reset_backend_handler(
    State(coordinator): State<BackendCoordinator>,
    Path(backend): Path<String>,
) -> Result<Json<ResetBackendResponse>, WalletError> {
    let backend = parse_backend(&backend)?;
    coordinator.reset_backend(backend).await?;
    Ok(Json(ResetBackendResponse {
        backend,
        status: "reset".to_string(),
    }))
}

// Wallet setup and derivation

pub async fn create_wallet_handler(
    State(coordinator): State<BackendCoordinator>,
    Json(req): Json<PinRequest>,
) -> Result<Json<CreatedWalletResponse>, WalletError> {
    let created = coordinator.create_wallet(&req.pin).await?;
    Ok(Json(CreatedWalletResponse {
        mnemonic: created.mnemonic.as_str().to_string(),
        wallets: created.records,
    }))
}

pub async fn import_wallet_handler(
    State(coordinator): State<BackendCoordinator>,
    Json(req): Json<ImportWalletRequest>,
) -> Result<Json<WalletsResponse>, WalletError> {
    let wallets = coordinator.import_wallet(&req.mnemonic, &req.pin).await?;
    Ok(Json(WalletsResponse { wallets }))
}

pub async fn derive_wallets_handler(
    State(coordinator): State<BackendCoordinator>,
) -> Result<Json<WalletsResponse>, WalletError> {
    let wallets = coordinator.derive_wallets().await?;
    Ok(Json(WalletsResponse { wallets }))
}

pub async fn additional_wallet_handler(
    State(coordinator): State<BackendCoordinator>,
    Json(req): Json<AdditionalWalletRequest>,
) -> Result<Json<WalletsResponse>, WalletError> {
    let wallets = coordinator
        .create_additional_wallet(req.label.as_deref())
        .await?;
    Ok(Json(WalletsResponse { wallets }))
}

pub async fn new_seed_wallet_handler(
    State(coordinator): State<BackendCoordinator>,
    Json(req): Json<NewSeedWalletRequest>,
) -> Result<Json<NewSeedWalletResponse>, WalletError> {
    let wallet = coordinator
        .create_wallet_with_new_seed(&req.pin, req.label.as_deref())
        .await?;
    Ok(Json(NewSeedWalletResponse {
        wallet_group_id: wallet.wallet_group_id,
        account_index: wallet.account_index,
        mnemonic: wallet.mnemonic.as_str().to_string(),
        wallets: wallet.records,
    }))
}

pub async fn change_pin_handler(
    State(coordinator): State<BackendCoordinator>,
    Json(req): Json<ChangePinRequest>,
) -> Result<Json<ChangePinResponse>, WalletError> {
    let updated_groups = coordinator.change_pin(&req.old_pin, &req.new_pin).await?;
    Ok(Json(ChangePinResponse { updated_groups }))
}

// Accounts

pub async fn list_accounts_handler(
    State(coordinator): State<BackendCoordinator>,
) -> Json<AccountsResponse> {
    Json(accounts_of(&coordinator))
}

pub async fn set_active_account_handler(
    State(coordinator): State<BackendCoordinator>,
    Json(req): Json<SetActiveAccountRequest>,
) -> Result<Json<AccountsResponse>, WalletError> {
    coordinator.set_active_account(req.account_index)?;
    Ok(Json(accounts_of(&coordinator)))
}

pub async fn rename_account_handler(
    State(coordinator): State<BackendCoordinator>,
    Path(account_index): Path<u32>,
    Json(req): Json<RenameAccountRequest>,
) -> Result<Json<AccountsResponse>, WalletError> {
    coordinator
        .rename_account(account_index, req.label.as_deref())
        .await?;
    Ok(Json(accounts_of(&coordinator)))
}

// Balances

pub async fn refresh_balances_handler(
    State(coordinator): State<BackendCoordinator>,
) -> Result<Json<RefreshOutcome>, WalletError> {
    Ok(Json(coordinator.refresh_balances().await?))
}

pub async fn fetch_missing_balances_handler(
    State(coordinator): State<BackendCoordinator>,
) -> Result<Json<RefreshOutcome>, WalletError> {
    Ok(Json(coordinator.fetch_missing_balances().await?))
}

pub async fn cache_status_handler(
    State(coordinator): State<BackendCoordinator>,
) -> Json<CacheStatusResponse> {
    Json(CacheStatusResponse::new(coordinator.cache_status(), Utc::now()))
}

// Activity and settings

pub async fn activity_handler(
    State(coordinator): State<BackendCoordinator>,
    Json(req): Json<ActivityRequest>,
) -> Json<AckResponse> {
    coordinator.record_activity(req.kind);
    Json(AckResponse { ok: true })
}

pub async fn idle_timeout_handler(
    State(coordinator): State<BackendCoordinator>,
    Json(req): Json<IdleTimeoutRequest>,
) -> Result<Json<AckResponse>, WalletError> {
    let timeout = IdleTimeout::parse(&req.timeout).ok_or_else(|| {
        WalletError::InvalidInput(format!(
            "idle timeout must be minutes or \"never\", got '{}'",
            req.timeout
        ))
    })?;
    coordinator.set_idle_timeout(timeout);
    log::info!("Idle timeout set to {:?}", timeout);
    Ok(Json(AckResponse { ok: true }))
}
