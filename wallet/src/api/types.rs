use chrono::{DateTime, Utc};
use custody_session::{AccountGroup, ActivityKind, Backend, CacheStatus, WalletRecord};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct SwitchBackendRequest {
    pub backend: Backend,
}

#[derive(Debug, Deserialize)]
pub struct PinRequest {
    pub pin: String,
}

#[derive(Debug, Deserialize)]
pub struct ImportWalletRequest {
    pub mnemonic: String,
    pub pin: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct AdditionalWalletRequest {
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct NewSeedWalletRequest {
    pub pin: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChangePinRequest {
    pub old_pin: String,
    pub new_pin: String,
}

#[derive(Debug, Deserialize)]
pub struct SetActiveAccountRequest {
    pub account_index: u32,
}

#[derive(Debug, Deserialize)]
pub struct RenameAccountRequest {
    pub label: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ActivityRequest {
    pub kind: ActivityKind,
}

#[derive(Debug, Deserialize)]
pub struct IdleTimeoutRequest {
    /// Minutes, or "never"
    pub timeout: String,
}

/// Returned once, when a wallet is created; the phrase is not stored in clear.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedWalletResponse {
    pub mnemonic: String,
    pub wallets: Vec<WalletRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NewSeedWalletResponse {
    pub wallet_group_id: String,
    pub account_index: u32,
    pub mnemonic: String,
    pub wallets: Vec<WalletRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WalletsResponse {
    pub wallets: Vec<WalletRecord>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChangePinResponse {
    pub updated_groups: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccountsResponse {
    pub active_account: u32,
    pub accounts: Vec<AccountGroup>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResetBackendResponse {
    pub backend: Backend,
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CacheStatusResponse {
    pub is_stale: bool,
    pub is_refreshing: bool,
    pub last_updated: Option<DateTime<Utc>>,
    /// Seconds since the last successful full refresh
    pub age_secs: Option<u64>,
}

impl CacheStatusResponse {
    pub fn new(status: CacheStatus, now: DateTime<Utc>) -> Self {
        Self {
            is_stale: status.is_stale,
            is_refreshing: status.is_refreshing,
            last_updated: status.last_updated,
            age_secs: status.age(now).map(|age| age.as_secs()),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AckResponse {
    pub ok: bool,
}
