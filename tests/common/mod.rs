//! Common test utilities for coordinator integration tests
//!
//! In-process fakes for every collaborator the coordinator consumes, plus
//! gates that let a test hold an async call at a suspension point and
//! release it in a chosen order.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Notify};
use zeroize::Zeroizing;

use custody_session::{
    AddressDeriver, Backend, BackendCoordinator, BalanceCacheEntry, BalanceOracle, ChainConfig,
    DerivedAddress, DeviceStatus, EncryptedSeedRecord, HardwareDevice, MemoryStore,
    PersistentStore, SecureSeedStore, SeedGenerator, Services, SessionConfig, SessionError,
    StorageError, WalletRecord,
};

pub const PIN: &str = "1234";
pub const PRIMARY_SEED: &str = "abandon ability able about above absent absorb abstract absurd abuse access accident";
pub const SECOND_SEED: &str = "legal winner thank year wave sausage worth useful legal winner thank yellow";
pub const DEVICE_SEED: &str = "zoo zone zero youth young you yellow year yard wrong write wrist";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn eth_btc_config() -> SessionConfig {
    SessionConfig::with_chains(vec![ChainConfig::new("ETH", 1), ChainConfig::new("BTC", 0)])
}

// ============================================================================
// Gate
// ============================================================================

/// Holds every caller of [`Gate::pass`] until [`Gate::open`].
pub struct Gate {
    open: watch::Sender<bool>,
    arrived: Notify,
}

impl Gate {
    pub fn closed() -> Arc<Self> {
        let (open, _) = watch::channel(false);
        Arc::new(Self {
            open,
            arrived: Notify::new(),
        })
    }

    pub async fn pass(&self) {
        self.arrived.notify_one();
        let mut rx = self.open.subscribe();
        let _ = rx.wait_for(|open| *open).await;
    }

    /// Resolves once some caller is parked at the gate.
    pub async fn arrival(&self) {
        self.arrived.notified().await;
    }

    pub fn open(&self) {
        self.open.send_replace(true);
    }
}

// ============================================================================
// Deriver & seed generator
// ============================================================================

/// Addresses depend only on (seed, chain, index), like a real HD deriver.
pub struct ScriptedDeriver;

impl ScriptedDeriver {
    pub fn address_for(seed: &str, symbol: &str, account_index: u32) -> String {
        let tag: String = seed
            .split_whitespace()
            .map(|w| w.chars().next().unwrap_or('x'))
            .collect();
        format!("{}-{}-{}", symbol.to_lowercase(), tag, account_index)
    }
}

impl AddressDeriver for ScriptedDeriver {
    fn derive(
        &self,
        seed: &str,
        chain_symbols: &[String],
        account_index: u32,
    ) -> Result<Vec<DerivedAddress>, SessionError> {
        Ok(chain_symbols
            .iter()
            .map(|symbol| DerivedAddress {
                chain_symbol: symbol.clone(),
                address: Self::address_for(seed, symbol, account_index),
                path: format!("m/44'/{}'/{}'/0/0", symbol.len(), account_index),
            })
            .collect())
    }
}

/// Hands out a fixed sequence of phrases.
pub struct SequenceSeeds {
    phrases: Mutex<Vec<String>>,
}

impl SequenceSeeds {
    pub fn new(phrases: &[&str]) -> Self {
        let mut phrases: Vec<String> = phrases.iter().map(|p| p.to_string()).collect();
        phrases.reverse();
        Self {
            phrases: Mutex::new(phrases),
        }
    }
}

impl SeedGenerator for SequenceSeeds {
    fn generate(&self) -> Result<Zeroizing<String>, SessionError> {
        self.phrases
            .lock()
            .unwrap()
            .pop()
            .map(Zeroizing::new)
            .ok_or_else(|| SessionError::Internal("no more scripted seeds".into()))
    }

    fn validate(&self, phrase: &str) -> Result<(), SessionError> {
        if phrase.split_whitespace().count() == 12 {
            Ok(())
        } else {
            Err(SessionError::InvalidInput("expected 12 words".into()))
        }
    }
}

// ============================================================================
// Oracle
// ============================================================================

#[derive(Default)]
pub struct FakeOracle {
    balances: Mutex<HashMap<String, String>>,
    failing: Mutex<HashSet<String>>,
    fail_all: AtomicBool,
    gate: Mutex<Option<Arc<Gate>>>,
    pub calls: AtomicUsize,
}

impl FakeOracle {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_balance(&self, address: &str, balance: &str) {
        self.balances
            .lock()
            .unwrap()
            .insert(address.to_string(), balance.to_string());
    }

    pub fn fail_address(&self, address: &str) {
        self.failing.lock().unwrap().insert(address.to_string());
    }

    pub fn fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    /// Park every subsequent call at `gate`.
    pub fn hold(&self, gate: Arc<Gate>) {
        *self.gate.lock().unwrap() = Some(gate);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BalanceOracle for FakeOracle {
    async fn get_balance(
        &self,
        address: &str,
        _chain_id: u64,
        _chain_symbol: &str,
        _rpc_url_override: Option<&str>,
    ) -> Result<String, SessionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        if self.fail_all.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(address) {
            return Err(SessionError::Network(format!("{} unreachable", address)));
        }
        Ok(self
            .balances
            .lock()
            .unwrap()
            .get(address)
            .cloned()
            .unwrap_or_else(|| "0".to_string()))
    }
}

// ============================================================================
// Seed store
// ============================================================================

#[derive(Default)]
pub struct MemorySeedStore {
    records: Mutex<HashMap<String, (String, String)>>,
}

impl MemorySeedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn groups(&self) -> Vec<String> {
        let mut groups: Vec<String> = self.records.lock().unwrap().keys().cloned().collect();
        groups.sort();
        groups
    }
}

#[async_trait]
impl SecureSeedStore for MemorySeedStore {
    async fn encrypt(
        &self,
        seed: &str,
        pin: &str,
        group_id: &str,
    ) -> Result<EncryptedSeedRecord, SessionError> {
        self.records
            .lock()
            .unwrap()
            .insert(group_id.to_string(), (pin.to_string(), seed.to_string()));
        Ok(EncryptedSeedRecord {
            wallet_group_id: group_id.to_string(),
            encrypted_seed: hex::encode(seed),
            pin_hash: hex::encode(pin),
            pin_salt: String::new(),
            created_at: Utc::now(),
        })
    }

    async fn decrypt(
        &self,
        group_id: &str,
        pin: &str,
    ) -> Result<Option<Zeroizing<String>>, SessionError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(group_id)
            .filter(|(stored_pin, _)| stored_pin == pin)
            .map(|(_, seed)| Zeroizing::new(seed.clone())))
    }

    async fn remove(&self, group_id: &str) -> Result<(), SessionError> {
        self.records.lock().unwrap().remove(group_id);
        Ok(())
    }

    async fn group_ids(&self) -> Result<Vec<String>, SessionError> {
        Ok(self.groups())
    }
}

// ============================================================================
// Store with fault injection
// ============================================================================

/// [`MemoryStore`] with per-backend load gates and failure switches.
#[derive(Default)]
pub struct GatedStore {
    pub inner: MemoryStore,
    load_gates: Mutex<HashMap<Backend, Arc<Gate>>>,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
}

impl GatedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `load_wallets(backend)` waits at the returned gate.
    pub fn hold_next_load(&self, backend: Backend) -> Arc<Gate> {
        let gate = Gate::closed();
        self.load_gates.lock().unwrap().insert(backend, gate.clone());
        gate
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    fn check(&self, flag: &AtomicBool) -> Result<(), StorageError> {
        if flag.load(Ordering::SeqCst) {
            Err(StorageError::Unavailable("injected failure".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PersistentStore for GatedStore {
    async fn load_wallets(&self, backend: Backend) -> Result<Vec<WalletRecord>, StorageError> {
        let gate = self.load_gates.lock().unwrap().remove(&backend);
        if let Some(gate) = gate {
            gate.pass().await;
        }
        self.check(&self.fail_loads)?;
        self.inner.load_wallets(backend).await
    }

    async fn save_wallets(
        &self,
        backend: Backend,
        records: &[WalletRecord],
    ) -> Result<(), StorageError> {
        self.check(&self.fail_saves)?;
        self.inner.save_wallets(backend, records).await
    }

    async fn is_setup(&self, backend: Backend) -> Result<bool, StorageError> {
        self.inner.is_setup(backend).await
    }

    async fn set_setup(&self, backend: Backend, setup: bool) -> Result<(), StorageError> {
        self.check(&self.fail_saves)?;
        self.inner.set_setup(backend, setup).await
    }

    async fn load_balance_cache(
        &self,
        backend: Backend,
    ) -> Result<Vec<BalanceCacheEntry>, StorageError> {
        self.inner.load_balance_cache(backend).await
    }

    async fn save_balance_cache(
        &self,
        backend: Backend,
        entries: &[BalanceCacheEntry],
    ) -> Result<(), StorageError> {
        self.check(&self.fail_saves)?;
        self.inner.save_balance_cache(backend, entries).await
    }

    async fn last_full_refresh(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        self.inner.last_full_refresh().await
    }

    async fn set_last_full_refresh(&self, at: DateTime<Utc>) -> Result<(), StorageError> {
        self.inner.set_last_full_refresh(at).await
    }

    async fn active_backend(&self) -> Result<Option<Backend>, StorageError> {
        self.inner.active_backend().await
    }

    async fn set_active_backend(&self, backend: Backend) -> Result<(), StorageError> {
        self.inner.set_active_backend(backend).await
    }

    async fn clear_backend(&self, backend: Backend) -> Result<(), StorageError> {
        self.inner.clear_backend(backend).await
    }
}

// ============================================================================
// Hardware device
// ============================================================================

pub struct FakeDevice {
    seed: String,
    pin: String,
    initialized: bool,
    refuse_export: AtomicBool,
    reconnect_gate: Mutex<Option<Arc<Gate>>>,
    pub reconnects: AtomicUsize,
}

impl FakeDevice {
    pub fn new(seed: &str) -> Arc<Self> {
        Arc::new(Self {
            seed: seed.to_string(),
            pin: PIN.to_string(),
            initialized: true,
            refuse_export: AtomicBool::new(false),
            reconnect_gate: Mutex::new(None),
            reconnects: AtomicUsize::new(0),
        })
    }

    pub fn refuse_export(&self, refuse: bool) {
        self.refuse_export.store(refuse, Ordering::SeqCst);
    }

    /// The next `reconnect()` waits at the returned gate.
    pub fn hold_next_reconnect(&self) -> Arc<Gate> {
        let gate = Gate::closed();
        *self.reconnect_gate.lock().unwrap() = Some(gate.clone());
        gate
    }
}

#[async_trait]
impl HardwareDevice for FakeDevice {
    async fn connect(&self) -> Result<DeviceStatus, SessionError> {
        Ok(DeviceStatus {
            initialized: self.initialized,
        })
    }

    async fn reconnect(&self) -> Result<(), SessionError> {
        self.reconnects.fetch_add(1, Ordering::SeqCst);
        let gate = self.reconnect_gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.pass().await;
        }
        Ok(())
    }

    async fn unlock(&self, pin: &str) -> Result<bool, SessionError> {
        Ok(pin == self.pin)
    }

    async fn export_seed(&self) -> Result<Option<Zeroizing<String>>, SessionError> {
        if self.refuse_export.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(Some(Zeroizing::new(self.seed.clone())))
    }

    async fn disconnect(&self) -> Result<(), SessionError> {
        Ok(())
    }
}

// ============================================================================
// Harness
// ============================================================================

pub struct Harness {
    pub coordinator: BackendCoordinator,
    pub store: Arc<GatedStore>,
    pub oracle: Arc<FakeOracle>,
    pub seeds: Arc<MemorySeedStore>,
    pub device: Arc<FakeDevice>,
}

impl Harness {
    pub fn new(config: SessionConfig) -> Self {
        Self::with_device(config, FakeDevice::new(DEVICE_SEED))
    }

    pub fn with_device(config: SessionConfig, device: Arc<FakeDevice>) -> Self {
        Self::with_store(config, device, GatedStore::new())
    }

    pub fn with_store(config: SessionConfig, device: Arc<FakeDevice>, store: Arc<GatedStore>) -> Self {
        init_logging();
        let oracle = FakeOracle::new();
        let seeds = MemorySeedStore::new();

        let services = Services {
            deriver: Arc::new(ScriptedDeriver),
            seed_generator: Arc::new(SequenceSeeds::new(&[PRIMARY_SEED, SECOND_SEED])),
            oracle: oracle.clone(),
            seed_store: seeds.clone(),
            store: store.clone(),
            device: Some(device.clone()),
        };

        Self {
            coordinator: BackendCoordinator::new(services, config),
            store,
            oracle,
            seeds,
            device,
        }
    }

    /// Software wallet created from [`PRIMARY_SEED`] and unlocked.
    pub async fn with_software_wallet(config: SessionConfig) -> Self {
        let harness = Self::new(config);
        harness.coordinator.initialize().await.unwrap();
        harness
            .coordinator
            .import_wallet(PRIMARY_SEED, PIN)
            .await
            .unwrap();
        harness
    }

    /// Hardware backend active, unlocked and derived.
    pub async fn switch_to_unlocked_hardware(&self) {
        self.coordinator.switch_backend(Backend::Hardware).await.unwrap();
        self.coordinator.connect(Backend::Hardware).await.unwrap();
        self.coordinator.unlock(Backend::Hardware, PIN).await.unwrap();
        self.coordinator.derive_wallets().await.unwrap();
    }
}

/// Every visible record belongs to the active backend.
pub fn assert_exclusive(coordinator: &BackendCoordinator) {
    let snapshot = coordinator.snapshot();
    assert!(
        snapshot
            .wallets
            .iter()
            .all(|w| w.backend == snapshot.active_backend),
        "visible wallets mix backends: {:?}",
        snapshot.wallets
    );
}
