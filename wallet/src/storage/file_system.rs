use async_trait::async_trait;
use chrono::{DateTime, Utc};
use custody_session::store::{GlobalState, Namespace};
use custody_session::{Backend, BalanceCacheEntry, PersistentStore, StorageError, WalletRecord};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// JSON file store: one file per backend namespace plus `global.json`.
pub struct FileStore {
    base_path: PathBuf,
    /// Serialises read-modify-write cycles
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_path
    }

    fn namespace_path(&self, backend: Backend) -> PathBuf {
        self.base_path.join(format!("{}.json", backend.as_str()))
    }

    fn global_path(&self) -> PathBuf {
        self.base_path.join("global.json")
    }

    async fn read_namespace(&self, backend: Backend) -> Result<Namespace, StorageError> {
        read_json(&self.namespace_path(backend)).await
    }

    async fn update_namespace<F>(&self, backend: Backend, update: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut Namespace),
    {
        let _guard = self.write_lock.lock().await;
        let path = self.namespace_path(backend);
        let mut namespace: Namespace = read_json(&path).await?;
        update(&mut namespace);
        write_json(&path, &namespace).await
    }

    async fn update_global<F>(&self, update: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut GlobalState),
    {
        let _guard = self.write_lock.lock().await;
        let path = self.global_path();
        let mut global: GlobalState = read_json(&path).await?;
        update(&mut global);
        write_json(&path, &global).await
    }
}

/// Missing file reads as the default value.
pub(super) async fn read_json<T: DeserializeOwned + Default>(path: &Path) -> Result<T, StorageError> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Ok(serde_json::from_str(&contents)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

/// Writes to a sibling temp file and renames it into place.
pub(super) async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[async_trait]
impl PersistentStore for FileStore {
    async fn load_wallets(&self, backend: Backend) -> Result<Vec<WalletRecord>, StorageError> {
        Ok(self.read_namespace(backend).await?.wallet_records)
    }

    async fn save_wallets(
        &self,
        backend: Backend,
        records: &[WalletRecord],
    ) -> Result<(), StorageError> {
        let records = records.to_vec();
        self.update_namespace(backend, move |ns| ns.wallet_records = records)
            .await
    }

    async fn is_setup(&self, backend: Backend) -> Result<bool, StorageError> {
        Ok(self.read_namespace(backend).await?.setup_flag)
    }

    async fn set_setup(&self, backend: Backend, setup: bool) -> Result<(), StorageError> {
        self.update_namespace(backend, move |ns| ns.setup_flag = setup)
            .await
    }

    async fn load_balance_cache(
        &self,
        backend: Backend,
    ) -> Result<Vec<BalanceCacheEntry>, StorageError> {
        Ok(self.read_namespace(backend).await?.balance_cache)
    }

    async fn save_balance_cache(
        &self,
        backend: Backend,
        entries: &[BalanceCacheEntry],
    ) -> Result<(), StorageError> {
        let entries = entries.to_vec();
        self.update_namespace(backend, move |ns| ns.balance_cache = entries)
            .await
    }

    async fn last_full_refresh(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let global: GlobalState = read_json(&self.global_path()).await?;
        Ok(global.last_full_refresh)
    }

    async fn set_last_full_refresh(&self, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.update_global(move |g| g.last_full_refresh = Some(at))
            .await
    }

    async fn active_backend(&self) -> Result<Option<Backend>, StorageError> {
        let global: GlobalState = read_json(&self.global_path()).await?;
        Ok(global.active_backend)
    }

    async fn set_active_backend(&self, backend: Backend) -> Result<(), StorageError> {
        self.update_global(move |g| g.active_backend = Some(backend))
            .await
    }

    async fn clear_backend(&self, backend: Backend) -> Result<(), StorageError> {
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(self.namespace_path(backend)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
