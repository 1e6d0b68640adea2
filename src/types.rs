//! Data model shared by the coordinator, the balance cache and the
//! collaborator traits.

use blake2::{Blake2b512, Digest};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Wallet group id of the backend's primary seed.
pub const DEFAULT_WALLET_GROUP: &str = "default";

/// Balance carried by a freshly derived record until the first fetch lands.
pub const PLACEHOLDER_BALANCE: &str = "0";

/// Key-custody backend. Exactly one is active at any settled time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Software,
    Hardware,
}

impl Backend {
    pub const ALL: [Backend; 2] = [Backend::Software, Backend::Hardware];

    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Software => "software",
            Backend::Hardware => "hardware",
        }
    }

    pub fn other(&self) -> Backend {
        match self {
            Backend::Software => Backend::Hardware,
            Backend::Hardware => Backend::Software,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Backend {
    type Err = crate::SessionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "software" => Ok(Backend::Software),
            "hardware" => Ok(Backend::Hardware),
            other => Err(crate::SessionError::InvalidInput(format!(
                "unknown backend '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Disconnected,
    Locked,
    Unlocked,
}

/// Observable state of one backend's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub status: SessionStatus,
    /// `false` while the backend is awaiting setup
    pub has_wallet: bool,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            has_wallet: false,
        }
    }
}

/// One derived address on one chain for one account index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletRecord {
    pub id: String,
    pub backend: Backend,
    pub chain_id: u64,
    pub chain_symbol: String,
    pub address: String,
    pub derivation_path: String,
    pub balance: String,
    pub account_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_group_id: Option<String>,
}

impl WalletRecord {
    /// Deterministic id: unique per (backend, chain, account index, address).
    pub fn record_id(backend: Backend, chain_id: u64, account_index: u32, address: &str) -> String {
        let mut hasher = Blake2b512::new();
        hasher.update(backend.as_str().as_bytes());
        hasher.update(chain_id.to_be_bytes());
        hasher.update(account_index.to_be_bytes());
        hasher.update(address.to_lowercase().as_bytes());
        let digest = hasher.finalize();
        hex::encode(&digest[..16])
    }

    pub fn has_placeholder_balance(&self) -> bool {
        self.balance == PLACEHOLDER_BALANCE
    }

    /// Group id with the primary seed spelled out explicitly.
    pub fn group_id(&self) -> &str {
        self.wallet_group_id.as_deref().unwrap_or(DEFAULT_WALLET_GROUP)
    }
}

/// Last known balance for an (address, chain symbol) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceCacheEntry {
    pub address: String,
    pub chain_symbol: String,
    pub chain_id: u64,
    pub balance: String,
    pub cached_at: DateTime<Utc>,
}

impl BalanceCacheEntry {
    pub fn matches(&self, record: &WalletRecord) -> bool {
        self.chain_symbol == record.chain_symbol
            && self.address.eq_ignore_ascii_case(&record.address)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub is_stale: bool,
    pub last_updated: Option<DateTime<Utc>>,
    pub is_refreshing: bool,
}

impl Default for CacheStatus {
    fn default() -> Self {
        Self {
            is_stale: true,
            last_updated: None,
            is_refreshing: false,
        }
    }
}

impl CacheStatus {
    /// `true` when the last refresh is older than `threshold` or never happened.
    pub fn compute_stale(
        last_updated: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
        threshold: Duration,
    ) -> bool {
        match last_updated {
            None => true,
            // A timestamp in the future (clock skew) counts as fresh
            Some(at) => match now.signed_duration_since(at).to_std() {
                Ok(age) => age > threshold,
                Err(_) => false,
            },
        }
    }

    /// Time elapsed since the last successful refresh ("updated N ago").
    pub fn age(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.last_updated
            .map(|at| now.signed_duration_since(at).to_std().unwrap_or_default())
    }
}

/// Encrypted seed phrase for one wallet group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedSeedRecord {
    pub wallet_group_id: String,
    pub encrypted_seed: String,
    pub pin_hash: String,
    pub pin_salt: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainConfig {
    pub symbol: String,
    pub chain_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_url: Option<String>,
}

impl ChainConfig {
    pub fn new(symbol: impl Into<String>, chain_id: u64) -> Self {
        Self {
            symbol: symbol.into(),
            chain_id,
            rpc_url: None,
        }
    }
}

/// Output of the address deriver for a single chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedAddress {
    pub chain_symbol: String,
    pub address: String,
    pub path: String,
}

/// User-visible account: every record sharing one account index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountGroup {
    pub account_index: u32,
    pub label: Option<String>,
    pub wallet_group_id: Option<String>,
    pub chains: Vec<String>,
    /// All configured chains are covered
    pub complete: bool,
}

/// User activity that keeps an unlocked session alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityKind {
    Pointer,
    Key,
    Touch,
    Scroll,
}

/// Informational events; none of these are errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    ContaminationQuarantined { addresses: Vec<String> },
    RequiresSetup { backend: Backend },
    AutoLocked { backend: Backend },
    SwitchSuperseded { backend: Backend },
    RefreshCompleted { succeeded: usize, failed: usize },
}
