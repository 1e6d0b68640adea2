//! Collaborator contracts consumed by the coordinator
//!
//! Implementations are constructed by the embedding application and passed
//! in through [`Services`]; nothing here is a global.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use zeroize::Zeroizing;

use crate::error::{SessionError, StorageError};
use crate::types::{Backend, BalanceCacheEntry, DerivedAddress, EncryptedSeedRecord, WalletRecord};

/// Deterministic multi-chain derivation: seed + chains + account index -> addresses.
pub trait AddressDeriver: Send + Sync {
    fn derive(
        &self,
        seed: &str,
        chain_symbols: &[String],
        account_index: u32,
    ) -> Result<Vec<DerivedAddress>, SessionError>;
}

/// Produces and validates recovery phrases.
pub trait SeedGenerator: Send + Sync {
    fn generate(&self) -> Result<Zeroizing<String>, SessionError>;

    fn validate(&self, phrase: &str) -> Result<(), SessionError>;
}

#[async_trait]
pub trait BalanceOracle: Send + Sync {
    /// Resolves to `"0"` on ordinary network trouble where possible; hard
    /// failures are returned as errors.
    async fn get_balance(
        &self,
        address: &str,
        chain_id: u64,
        chain_symbol: &str,
        rpc_url_override: Option<&str>,
    ) -> Result<String, SessionError>;
}

/// PIN-based encryption of seed phrases, one record per wallet group.
#[async_trait]
pub trait SecureSeedStore: Send + Sync {
    /// Encrypts `seed` under `pin` and persists it as the record for `group_id`,
    /// replacing any previous record for that group.
    async fn encrypt(
        &self,
        seed: &str,
        pin: &str,
        group_id: &str,
    ) -> Result<EncryptedSeedRecord, SessionError>;

    /// `Ok(None)` on PIN mismatch or unknown group.
    async fn decrypt(&self, group_id: &str, pin: &str)
        -> Result<Option<Zeroizing<String>>, SessionError>;

    async fn remove(&self, group_id: &str) -> Result<(), SessionError>;

    async fn group_ids(&self) -> Result<Vec<String>, SessionError>;
}

/// Durable per-backend state plus the global preference values.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn load_wallets(&self, backend: Backend) -> Result<Vec<WalletRecord>, StorageError>;

    async fn save_wallets(
        &self,
        backend: Backend,
        records: &[WalletRecord],
    ) -> Result<(), StorageError>;

    async fn is_setup(&self, backend: Backend) -> Result<bool, StorageError>;

    async fn set_setup(&self, backend: Backend, setup: bool) -> Result<(), StorageError>;

    async fn load_balance_cache(
        &self,
        backend: Backend,
    ) -> Result<Vec<BalanceCacheEntry>, StorageError>;

    async fn save_balance_cache(
        &self,
        backend: Backend,
        entries: &[BalanceCacheEntry],
    ) -> Result<(), StorageError>;

    async fn last_full_refresh(&self) -> Result<Option<DateTime<Utc>>, StorageError>;

    async fn set_last_full_refresh(&self, at: DateTime<Utc>) -> Result<(), StorageError>;

    async fn active_backend(&self) -> Result<Option<Backend>, StorageError>;

    async fn set_active_backend(&self, backend: Backend) -> Result<(), StorageError>;

    /// Drops the whole namespace: records, setup flag and balance cache.
    async fn clear_backend(&self, backend: Backend) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceStatus {
    /// The device holds an initialised wallet
    pub initialized: bool,
}

/// Hardware-resident key backend, reached through its transport.
#[async_trait]
pub trait HardwareDevice: Send + Sync {
    async fn connect(&self) -> Result<DeviceStatus, SessionError>;

    /// Re-establish the transport session after a backend switch.
    async fn reconnect(&self) -> Result<(), SessionError>;

    /// `Ok(false)` when the device rejects the PIN.
    async fn unlock(&self, pin: &str) -> Result<bool, SessionError>;

    /// `Ok(None)` when the device refuses to export seed material.
    async fn export_seed(&self) -> Result<Option<Zeroizing<String>>, SessionError>;

    async fn disconnect(&self) -> Result<(), SessionError>;
}

/// Everything the coordinator needs from the outside world.
#[derive(Clone)]
pub struct Services {
    pub deriver: Arc<dyn AddressDeriver>,
    pub seed_generator: Arc<dyn SeedGenerator>,
    pub oracle: Arc<dyn BalanceOracle>,
    pub seed_store: Arc<dyn SecureSeedStore>,
    pub store: Arc<dyn PersistentStore>,
    /// `None` until a device transport is attached
    pub device: Option<Arc<dyn HardwareDevice>>,
}
