//! In-memory persistent store
//!
//! Same namespace layout as the on-disk store, kept in process memory.
//! Used for ephemeral sessions and as the reference store in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::error::StorageError;
use crate::services::PersistentStore;
use crate::types::{Backend, BalanceCacheEntry, WalletRecord};

/// Everything persisted for one backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Namespace {
    pub setup_flag: bool,
    pub wallet_records: Vec<WalletRecord>,
    pub balance_cache: Vec<BalanceCacheEntry>,
}

/// Values shared by both backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GlobalState {
    pub last_full_refresh: Option<DateTime<Utc>>,
    pub active_backend: Option<Backend>,
}

#[derive(Default)]
struct Inner {
    namespaces: HashMap<Backend, Namespace>,
    global: GlobalState,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of one namespace, for inspection.
    pub fn namespace(&self, backend: Backend) -> Namespace {
        self.inner().namespaces.get(&backend).cloned().unwrap_or_default()
    }

    pub fn global(&self) -> GlobalState {
        self.inner().global.clone()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn load_wallets(&self, backend: Backend) -> Result<Vec<WalletRecord>, StorageError> {
        Ok(self.namespace(backend).wallet_records)
    }

    async fn save_wallets(
        &self,
        backend: Backend,
        records: &[WalletRecord],
    ) -> Result<(), StorageError> {
        self.inner()
            .namespaces
            .entry(backend)
            .or_default()
            .wallet_records = records.to_vec();
        Ok(())
    }

    async fn is_setup(&self, backend: Backend) -> Result<bool, StorageError> {
        Ok(self.namespace(backend).setup_flag)
    }

    async fn set_setup(&self, backend: Backend, setup: bool) -> Result<(), StorageError> {
        self.inner().namespaces.entry(backend).or_default().setup_flag = setup;
        Ok(())
    }

    async fn load_balance_cache(
        &self,
        backend: Backend,
    ) -> Result<Vec<BalanceCacheEntry>, StorageError> {
        Ok(self.namespace(backend).balance_cache)
    }

    async fn save_balance_cache(
        &self,
        backend: Backend,
        entries: &[BalanceCacheEntry],
    ) -> Result<(), StorageError> {
        self.inner()
            .namespaces
            .entry(backend)
            .or_default()
            .balance_cache = entries.to_vec();
        Ok(())
    }

    async fn last_full_refresh(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self.inner().global.last_full_refresh)
    }

    async fn set_last_full_refresh(&self, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.inner().global.last_full_refresh = Some(at);
        Ok(())
    }

    async fn active_backend(&self) -> Result<Option<Backend>, StorageError> {
        Ok(self.inner().global.active_backend)
    }

    async fn set_active_backend(&self, backend: Backend) -> Result<(), StorageError> {
        self.inner().global.active_backend = Some(backend);
        Ok(())
    }

    async fn clear_backend(&self, backend: Backend) -> Result<(), StorageError> {
        self.inner().namespaces.remove(&backend);
        Ok(())
    }
}
