/// Backend Switch Coordinator - Orchestration Layer
///
/// Single source of truth for which custody backend is active. Drives both
/// session state machines, the address deriver, the seed store and the
/// balance cache, and guarantees that at any settled time the visible
/// wallet list holds only the active backend's records.
///
/// Concurrency discipline:
/// - state lives behind a std mutex that is never held across an await;
/// - every switch takes a [`SwitchToken`]; only the newest may commit;
/// - results of other async work (derivation, refresh) are committed only
///   if the backend they were computed for is still the active one and its
///   data epoch has not moved (reset, quarantine, disconnect);
/// - persistence goes through an async barrier so a later switch observes
///   every earlier write.
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use zeroize::Zeroizing;

use crate::accounts;
use crate::balance::{BalanceCacheManager, BatchOutcome};
use crate::config::{IdleTimeout, SessionConfig};
use crate::error::SessionError;
use crate::generation::{SwitchGeneration, SwitchToken};
use crate::guard::{self, QuarantineReport};
use crate::idle::IdleTimer;
use crate::services::{HardwareDevice, Services};
use crate::session::SessionStateMachine;
use crate::types::{
    AccountGroup, ActivityKind, Backend, CacheStatus, SessionEvent, SessionState, SessionStatus,
    WalletRecord,
    DEFAULT_WALLET_GROUP,
};

const EVENT_CAPACITY: usize = 64;

/// Synchronous view handed to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub active_backend: Backend,
    /// A switch is loading; `wallets` is empty meanwhile
    pub switching: bool,
    pub software: SessionState,
    pub hardware: SessionState,
    pub wallets: Vec<WalletRecord>,
    pub active_account: u32,
    pub cache: CacheStatus,
}

impl SessionSnapshot {
    pub fn session(&self, backend: Backend) -> SessionState {
        match backend {
            Backend::Software => self.software,
            Backend::Hardware => self.hardware,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SwitchOutcome {
    /// Target was already active
    Unchanged,
    Switched { backend: Backend, wallets: usize },
    /// The target has no usable records; the caller must run setup
    RequiresSetup { backend: Backend },
    /// A newer switch started before this one finished
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RefreshOutcome {
    AlreadyRunning,
    NothingToRefresh,
    /// The active backend changed while fetching
    Discarded,
    AllFailed { failed: usize },
    Updated { succeeded: usize, failed: usize },
}

/// Result of creating a brand-new software wallet.
pub struct CreatedWallet {
    /// Recovery phrase to show the user once
    pub mnemonic: Zeroizing<String>,
    pub records: Vec<WalletRecord>,
}

/// Result of `create_wallet_with_new_seed`.
pub struct NewSeedWallet {
    pub wallet_group_id: String,
    pub account_index: u32,
    pub mnemonic: Zeroizing<String>,
    pub records: Vec<WalletRecord>,
}

struct Sessions {
    software: SessionStateMachine,
    hardware: SessionStateMachine,
}

impl Sessions {
    fn get(&self, backend: Backend) -> &SessionStateMachine {
        match backend {
            Backend::Software => &self.software,
            Backend::Hardware => &self.hardware,
        }
    }

    fn get_mut(&mut self, backend: Backend) -> &mut SessionStateMachine {
        match backend {
            Backend::Software => &mut self.software,
            Backend::Hardware => &mut self.hardware,
        }
    }

    fn any_unlocked(&self) -> bool {
        self.software.is_unlocked() || self.hardware.is_unlocked()
    }
}

struct State {
    active: Backend,
    switching: bool,
    wallets: Vec<WalletRecord>,
    active_account: u32,
    sessions: Sessions,
    /// Decrypted software seeds by wallet group, present only while unlocked
    seeds: HashMap<String, Zeroizing<String>>,
    /// Bumped when a backend's data is destroyed or its session torn down.
    /// Work captured under an older epoch must not commit.
    software_epoch: u64,
    hardware_epoch: u64,
}

impl State {
    fn epoch(&self, backend: Backend) -> u64 {
        match backend {
            Backend::Software => self.software_epoch,
            Backend::Hardware => self.hardware_epoch,
        }
    }

    fn bump_epoch(&mut self, backend: Backend) {
        let epoch = match backend {
            Backend::Software => &mut self.software_epoch,
            Backend::Hardware => &mut self.hardware_epoch,
        };
        *epoch = epoch.wrapping_add(1);
    }
}

struct Inner {
    services: Services,
    config: SessionConfig,
    state: Mutex<State>,
    generation: SwitchGeneration,
    balances: BalanceCacheManager,
    io_barrier: tokio::sync::Mutex<()>,
    snapshot_tx: watch::Sender<SessionSnapshot>,
    events_tx: broadcast::Sender<SessionEvent>,
    idle: IdleTimer,
}

#[derive(Clone)]
pub struct BackendCoordinator {
    inner: Arc<Inner>,
}

async fn with_timeout<T, F>(operation: &'static str, after: Duration, fut: F) -> Result<T, SessionError>
where
    F: Future<Output = Result<T, SessionError>>,
{
    tokio::time::timeout(after, fut)
        .await
        .map_err(|_| SessionError::timeout(operation, after))?
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot_of(&self, state: &State) -> SessionSnapshot {
        SessionSnapshot {
            active_backend: state.active,
            switching: state.switching,
            software: state.sessions.software.state(),
            hardware: state.sessions.hardware.state(),
            wallets: state.wallets.clone(),
            active_account: state.active_account,
            cache: self.balances.status(),
        }
    }

    /// Push a new snapshot to observers if anything changed.
    fn publish(&self) {
        let snapshot = {
            let state = self.state();
            self.snapshot_of(&state)
        };
        self.snapshot_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events_tx.send(event);
    }

    fn sync_idle_timer(&self, any_unlocked: bool) {
        if any_unlocked {
            if !self.idle.is_armed() {
                self.idle.arm();
            }
        } else {
            self.idle.disarm();
        }
    }

    fn lock_backend(&self, backend: Backend) -> SessionState {
        let (session, any_unlocked) = {
            let mut state = self.state();
            if state.sessions.get_mut(backend).lock() {
                log::info!("{} backend locked", backend);
            }
            if backend == Backend::Software {
                state.seeds.clear();
            }
            (state.sessions.get(backend).state(), state.sessions.any_unlocked())
        };
        self.sync_idle_timer(any_unlocked);
        self.publish();
        session
    }

    /// Idle timer callback.
    fn expire_idle(&self) {
        let unlocked: Vec<Backend> = {
            let state = self.state();
            Backend::ALL
                .into_iter()
                .filter(|b| state.sessions.get(*b).is_unlocked())
                .collect()
        };
        for backend in unlocked {
            log::info!("Idle timeout reached, locking {} backend", backend);
            self.lock_backend(backend);
            self.emit(SessionEvent::AutoLocked { backend });
        }
    }

    /// Drop every in-memory trace of the software backend after quarantine.
    fn apply_quarantine(&self, report: &QuarantineReport) {
        let any_unlocked = {
            let mut state = self.state();
            state.sessions.software.reset();
            state.seeds.clear();
            state.bump_epoch(Backend::Software);
            if state.active == Backend::Software {
                state.wallets.clear();
                state.active_account = 0;
                self.balances.reset_attempted();
            }
            state.sessions.any_unlocked()
        };
        self.sync_idle_timer(any_unlocked);
        self.emit(SessionEvent::ContaminationQuarantined {
            addresses: report.addresses.clone(),
        });
        self.publish();
    }

    fn device(&self) -> Result<Arc<dyn HardwareDevice>, SessionError> {
        self.services
            .device
            .clone()
            .ok_or_else(|| SessionError::Transport("no hardware device transport attached".into()))
    }
}

impl BackendCoordinator {
    // ============================================================================
    // Constructor & observation
    // ============================================================================

    /// Must be called inside a tokio runtime (spawns the idle timer).
    pub fn new(services: Services, config: SessionConfig) -> Self {
        let inner = Arc::new_cyclic(|weak: &Weak<Inner>| {
            let balances = BalanceCacheManager::new(
                services.oracle.clone(),
                services.store.clone(),
                &config,
            );

            let state = State {
                active: Backend::Software,
                switching: false,
                wallets: Vec::new(),
                active_account: 0,
                sessions: Sessions {
                    software: SessionStateMachine::new(Backend::Software),
                    hardware: SessionStateMachine::new(Backend::Hardware),
                },
                seeds: HashMap::new(),
                software_epoch: 0,
                hardware_epoch: 0,
            };

            let initial = SessionSnapshot {
                active_backend: state.active,
                switching: false,
                software: state.sessions.software.state(),
                hardware: state.sessions.hardware.state(),
                wallets: Vec::new(),
                active_account: 0,
                cache: balances.status(),
            };
            let (snapshot_tx, _) = watch::channel(initial);
            let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

            let expire = weak.clone();
            let idle = IdleTimer::spawn(config.idle_timeout.as_duration(), move || {
                if let Some(inner) = expire.upgrade() {
                    inner.expire_idle();
                }
            });

            Inner {
                services,
                config,
                state: Mutex::new(state),
                generation: SwitchGeneration::new(),
                balances,
                io_barrier: tokio::sync::Mutex::new(()),
                snapshot_tx,
                events_tx,
                idle,
            }
        });

        Self { inner }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.inner.state();
        self.inner.snapshot_of(&state)
    }

    /// Snapshot plus change notification.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn active_backend(&self) -> Backend {
        self.inner.state().active
    }

    pub fn session_state(&self, backend: Backend) -> SessionState {
        self.inner.state().sessions.get(backend).state()
    }

    pub fn active_wallets(&self) -> Vec<WalletRecord> {
        self.inner.state().wallets.clone()
    }

    pub fn cache_status(&self) -> CacheStatus {
        self.inner.balances.status()
    }

    // ============================================================================
    // Startup
    // ============================================================================

    /// Restore the preferred backend, run the consistency guard and show
    /// last-known balances before any network call.
    pub async fn initialize(&self) -> Result<SessionSnapshot, SessionError> {
        let inner = &self.inner;
        let store = inner.services.store.clone();

        let preferred = store.active_backend().await?.unwrap_or(Backend::Software);
        log::info!("Initializing session coordinator (preferred backend: {})", preferred);

        self.run_guard().await?;

        let token = {
            let mut state = inner.state();
            state.active = preferred;
            state.switching = true;
            state.wallets.clear();
            inner.balances.reset_attempted();
            inner.generation.begin()
        };
        inner.publish();

        let loaded = self.load_backend_view(preferred).await;
        let (records, software_ready) = match loaded {
            Ok(v) => v,
            Err(e) => return Err(self.fail_switch(token, e)),
        };

        if let Err(e) = inner.balances.load_status().await {
            log::warn!("Could not restore cache status: {}", e);
        }

        {
            let mut state = inner.state();
            if inner.generation.is_current(token) {
                state.sessions.software.connected(software_ready);
                state.active_account = accounts::normalize_active_index(&records, state.active_account);
                state.wallets = records;
                state.switching = false;
            }
        }
        inner.publish();

        if !software_ready && preferred == Backend::Software {
            inner.emit(SessionEvent::RequiresSetup {
                backend: Backend::Software,
            });
        }

        Ok(self.snapshot())
    }

    // ============================================================================
    // Backend switching
    // ============================================================================

    pub async fn switch_backend(&self, target: Backend) -> Result<SwitchOutcome, SessionError> {
        let inner = &self.inner;

        let (token, previous, outgoing_epoch, outgoing) = {
            let mut state = inner.state();
            if state.active == target {
                return Ok(SwitchOutcome::Unchanged);
            }
            let token = inner.generation.begin();
            let previous = state.active;
            let outgoing_epoch = state.epoch(previous);
            // Only records that really belong to the outgoing backend are written back
            let outgoing: Vec<WalletRecord> = std::mem::take(&mut state.wallets)
                .into_iter()
                .filter(|r| r.backend == previous)
                .collect();
            state.active = target;
            state.switching = true;
            inner.balances.reset_attempted();
            (token, previous, outgoing_epoch, outgoing)
        };
        inner.publish();
        log::info!(
            "Switching backend {} -> {} (switch #{})",
            previous,
            target,
            token.value()
        );

        if !outgoing.is_empty() {
            let _barrier = inner.io_barrier.lock().await;
            let unchanged = inner.state().epoch(previous) == outgoing_epoch;
            if unchanged {
                if let Err(e) = inner.services.store.save_wallets(previous, &outgoing).await {
                    log::error!("Failed to persist {} wallets before switching: {}", previous, e);
                    return Err(self.fail_switch(token, e.into()));
                }
            } else {
                log::debug!("{} data changed during switch; not writing it back", previous);
            }
        }

        // Wait for every earlier write before reading
        drop(inner.io_barrier.lock().await);
        if !inner.generation.is_current(token) {
            return Ok(self.superseded(token, target));
        }

        let (mut records, mut software_ready) = match self.load_backend_view(target).await {
            Ok(v) => v,
            Err(e) => return Err(self.fail_switch(token, e)),
        };
        if !inner.generation.is_current(token) {
            return Ok(self.superseded(token, target));
        }

        match self.run_guard().await {
            Ok(Some(_)) => {
                // The software namespace and every seed group are gone
                software_ready = false;
                if target == Backend::Software {
                    records.clear();
                }
            }
            Ok(None) => {}
            Err(e) => return Err(self.fail_switch(token, e)),
        }

        if records.is_empty() {
            return self.commit_switch(token, target, records, software_ready).await;
        }

        if target == Backend::Hardware {
            let reconnected = match inner.device() {
                Ok(device) => {
                    with_timeout("device reconnect", inner.config.device_timeout, device.reconnect())
                        .await
                }
                Err(e) => Err(e),
            };
            if let Err(e) = reconnected {
                log::warn!("Hardware reconnect failed during switch: {}", e);
                return Err(self.fail_switch(token, e));
            }
        }

        self.commit_switch(token, target, records, software_ready).await
    }

    async fn commit_switch(
        &self,
        token: SwitchToken,
        target: Backend,
        records: Vec<WalletRecord>,
        software_ready: bool,
    ) -> Result<SwitchOutcome, SessionError> {
        let inner = &self.inner;

        if let Err(e) = inner.balances.load_status().await {
            log::warn!("Could not restore cache status: {}", e);
        }

        {
            let _barrier = inner.io_barrier.lock().await;
            if !inner.generation.is_current(token) {
                return Ok(self.superseded(token, target));
            }
            if let Err(e) = inner.services.store.set_active_backend(target).await {
                log::warn!("Failed to persist active backend preference: {}", e);
            }
        }

        let count = {
            let mut state = inner.state();
            if !inner.generation.is_current(token) {
                drop(state);
                return Ok(self.superseded(token, target));
            }
            state.wallets = records.into_iter().filter(|r| r.backend == target).collect();
            state.switching = false;
            state.active_account =
                accounts::normalize_active_index(&state.wallets, state.active_account);
            match target {
                Backend::Software => state.sessions.software.connected(software_ready),
                Backend::Hardware => {
                    if !state.wallets.is_empty() {
                        state.sessions.hardware.connected(true);
                    }
                }
            }
            state.wallets.len()
        };
        inner.publish();

        if count == 0 {
            log::info!("{} backend requires setup", target);
            inner.emit(SessionEvent::RequiresSetup { backend: target });
            Ok(SwitchOutcome::RequiresSetup { backend: target })
        } else {
            log::info!("Switched to {} backend with {} wallet(s)", target, count);
            Ok(SwitchOutcome::Switched {
                backend: target,
                wallets: count,
            })
        }
    }

    fn superseded(&self, token: SwitchToken, target: Backend) -> SwitchOutcome {
        log::debug!(
            "Switch #{} to {} superseded by a newer switch",
            token.value(),
            target
        );
        self.inner
            .emit(SessionEvent::SwitchSuperseded { backend: target });
        SwitchOutcome::Superseded
    }

    /// Fall back to an empty active set; never leave mixed data behind.
    fn fail_switch(&self, token: SwitchToken, error: SessionError) -> SessionError {
        let inner = &self.inner;
        {
            let mut state = inner.state();
            if inner.generation.is_current(token) {
                state.wallets.clear();
                state.switching = false;
            }
        }
        inner.publish();
        error
    }

    /// Persisted records of `backend` with cached balances applied, plus
    /// whether the software backend is ready to unlock.
    async fn load_backend_view(
        &self,
        backend: Backend,
    ) -> Result<(Vec<WalletRecord>, bool), SessionError> {
        let inner = &self.inner;
        let store = &inner.services.store;

        let mut records = store.load_wallets(backend).await?;
        let entries = inner.balances.load_cached(backend).await?;
        let applied = BalanceCacheManager::apply_cached(&mut records, &entries);
        log::debug!(
            "Loaded {} {} wallet(s), {} cached balance(s) applied",
            records.len(),
            backend,
            applied
        );

        let software_ready = self.software_ready().await?;
        Ok((records, software_ready))
    }

    /// Consistency guard with storage quiesced; quarantine is applied in
    /// memory before the barrier is released.
    async fn run_guard(&self) -> Result<Option<QuarantineReport>, SessionError> {
        let inner = &self.inner;
        let _barrier = inner.io_barrier.lock().await;
        let report = guard::check_and_quarantine(
            inner.services.store.as_ref(),
            inner.services.seed_store.as_ref(),
        )
        .await?;
        if let Some(report) = &report {
            inner.apply_quarantine(report);
        }
        Ok(report)
    }

    async fn software_ready(&self) -> Result<bool, SessionError> {
        let inner = &self.inner;
        if !inner.services.store.is_setup(Backend::Software).await? {
            return Ok(false);
        }
        let groups = inner.services.seed_store.group_ids().await?;
        Ok(groups.iter().any(|g| g == DEFAULT_WALLET_GROUP))
    }

    // ============================================================================
    // Session transitions
    // ============================================================================

    pub async fn connect(&self, backend: Backend) -> Result<SessionState, SessionError> {
        let inner = &self.inner;
        let has_wallet = match backend {
            Backend::Software => self.software_ready().await?,
            Backend::Hardware => {
                let device = inner.device()?;
                with_timeout("device connect", inner.config.device_timeout, device.connect())
                    .await?
                    .initialized
            }
        };

        let session = {
            let mut state = inner.state();
            state.sessions.get_mut(backend).connected(has_wallet);
            state.sessions.get(backend).state()
        };
        inner.publish();

        log::info!("{} backend connected (wallet present: {})", backend, has_wallet);
        if has_wallet {
            self.reload_active(backend).await?;
        } else {
            inner.emit(SessionEvent::RequiresSetup { backend });
        }
        Ok(session)
    }

    /// Bring back the persisted records of the active backend after a
    /// disconnect emptied the visible set.
    async fn reload_active(&self, backend: Backend) -> Result<(), SessionError> {
        let inner = &self.inner;
        let token = {
            let state = inner.state();
            if state.active != backend || state.switching || !state.wallets.is_empty() {
                return Ok(());
            }
            inner.generation.current()
        };

        let mut records = inner.services.store.load_wallets(backend).await?;
        let entries = inner.balances.load_cached(backend).await?;
        BalanceCacheManager::apply_cached(&mut records, &entries);

        {
            let mut state = inner.state();
            if state.active != backend || state.switching || !inner.generation.is_current(token) {
                return Ok(());
            }
            state.active_account = accounts::normalize_active_index(&records, state.active_account);
            state.wallets = records;
        }
        inner.publish();
        Ok(())
    }

    pub async fn unlock(&self, backend: Backend, pin: &str) -> Result<SessionState, SessionError> {
        let inner = &self.inner;

        let needs_connect =
            inner.state().sessions.get(backend).status() == SessionStatus::Disconnected;
        if needs_connect {
            self.connect(backend).await?;
        }

        let ticket = inner.state().sessions.get(backend).begin_unlock()?;

        let mut unlocked_seeds = HashMap::new();
        match backend {
            Backend::Software => {
                let seed_store = &inner.services.seed_store;
                let primary = with_timeout(
                    "PIN verification",
                    inner.config.pin_timeout,
                    seed_store.decrypt(DEFAULT_WALLET_GROUP, pin),
                )
                .await?
                .ok_or_else(|| SessionError::Authentication("incorrect PIN".into()))?;
                unlocked_seeds.insert(DEFAULT_WALLET_GROUP.to_string(), primary);

                // Independent groups may carry their own PIN
                for group_id in seed_store.group_ids().await? {
                    if group_id == DEFAULT_WALLET_GROUP {
                        continue;
                    }
                    let decrypted = with_timeout(
                        "PIN verification",
                        inner.config.pin_timeout,
                        seed_store.decrypt(&group_id, pin),
                    )
                    .await?;
                    match decrypted {
                        Some(seed) => {
                            unlocked_seeds.insert(group_id, seed);
                        }
                        None => log::debug!("Wallet group {} uses a different PIN", group_id),
                    }
                }
            }
            Backend::Hardware => {
                let device = inner.device()?;
                let accepted =
                    with_timeout("device unlock", inner.config.device_timeout, device.unlock(pin))
                        .await?;
                if !accepted {
                    return Err(SessionError::Authentication(
                        "device rejected the PIN".into(),
                    ));
                }
            }
        }

        let (session, needs_gap_fill) = {
            let mut state = inner.state();
            state.sessions.get_mut(backend).complete_unlock(ticket)?;
            if backend == Backend::Software {
                state.seeds.extend(unlocked_seeds);
            }
            let needs_gap_fill = backend == Backend::Software
                && state.active == backend
                && !state.switching
                && accounts::account_indices(&state.wallets).iter().any(|index| {
                    !accounts::missing_chains(&state.wallets, &inner.config.chains, *index)
                        .is_empty()
                });
            (state.sessions.get(backend).state(), needs_gap_fill)
        };
        inner.sync_idle_timer(true);
        inner.publish();
        log::info!("{} backend unlocked", backend);

        if needs_gap_fill {
            if let Err(e) = self.derive_wallets().await {
                log::warn!("Lazy derivation of missing chains failed: {}", e);
            }
        }

        Ok(session)
    }

    pub fn lock(&self, backend: Backend) -> SessionState {
        self.inner.lock_backend(backend)
    }

    /// Any state -> Disconnected. In-memory wallets of the backend are
    /// dropped; persisted data is untouched.
    pub async fn disconnect(&self, backend: Backend) -> Result<SessionState, SessionError> {
        let inner = &self.inner;

        let (session, any_unlocked) = {
            let mut state = inner.state();
            let previous = state.sessions.get_mut(backend).disconnect();
            state.bump_epoch(backend);
            log::info!("{} backend disconnected (was {:?})", backend, previous);
            if backend == Backend::Software {
                state.seeds.clear();
            }
            if state.active == backend {
                state.wallets.clear();
                inner.balances.reset_attempted();
            }
            (state.sessions.get(backend).state(), state.sessions.any_unlocked())
        };
        inner.sync_idle_timer(any_unlocked);
        inner.publish();

        if backend == Backend::Hardware {
            if let Some(device) = inner.services.device.clone() {
                if let Err(e) =
                    with_timeout("device disconnect", inner.config.device_timeout, device.disconnect())
                        .await
                {
                    log::warn!("Device disconnect reported an error: {}", e);
                }
            }
        }

        Ok(session)
    }

    pub fn record_activity(&self, kind: ActivityKind) {
        self.inner.idle.record_activity(kind);
    }

    pub fn set_idle_timeout(&self, timeout: IdleTimeout) {
        log::info!("Idle timeout set to {:?}", timeout);
        self.inner.idle.set_timeout(timeout.as_duration());
    }

    // ============================================================================
    // Wallet creation & derivation
    // ============================================================================

    /// First-time software setup with a freshly generated recovery phrase.
    pub async fn create_wallet(&self, pin: &str) -> Result<CreatedWallet, SessionError> {
        self.ensure_software_free(pin).await?;
        let mnemonic = self.inner.services.seed_generator.generate()?;
        let records = self.setup_software(&mnemonic, pin).await?;
        Ok(CreatedWallet { mnemonic, records })
    }

    /// First-time software setup from an existing recovery phrase.
    pub async fn import_wallet(
        &self,
        mnemonic: &str,
        pin: &str,
    ) -> Result<Vec<WalletRecord>, SessionError> {
        self.ensure_software_free(pin).await?;
        self.inner.services.seed_generator.validate(mnemonic)?;
        self.setup_software(mnemonic, pin).await
    }

    async fn ensure_software_free(&self, pin: &str) -> Result<(), SessionError> {
        if pin.is_empty() {
            return Err(SessionError::InvalidInput("PIN must not be empty".into()));
        }
        if self.inner.services.store.is_setup(Backend::Software).await? {
            return Err(SessionError::WalletExists(Backend::Software));
        }
        Ok(())
    }

    async fn setup_software(
        &self,
        mnemonic: &str,
        pin: &str,
    ) -> Result<Vec<WalletRecord>, SessionError> {
        let inner = &self.inner;
        let epoch = inner.state().epoch(Backend::Software);

        with_timeout(
            "seed encryption",
            inner.config.pin_timeout,
            inner
                .services
                .seed_store
                .encrypt(mnemonic, pin, DEFAULT_WALLET_GROUP),
        )
        .await?;

        let derived =
            inner
                .services
                .deriver
                .derive(mnemonic, &inner.config.chain_symbols(), 0)?;
        let records = accounts::build_records(
            Backend::Software,
            &inner.config.chains,
            derived,
            0,
            DEFAULT_WALLET_GROUP,
            None,
        )?;

        {
            let mut state = inner.state();
            state.sessions.software.setup_completed();
            state
                .seeds
                .insert(DEFAULT_WALLET_GROUP.to_string(), Zeroizing::new(mnemonic.to_string()));
        }
        inner.sync_idle_timer(true);
        log::info!("Software wallet set up with {} record(s)", records.len());

        self.persist_and_commit(Backend::Software, epoch, records, None).await
    }

    /// Derive accountIndex 0 for every configured chain, and complete any
    /// account whose records miss chains, for the active unlocked backend.
    pub async fn derive_wallets(&self) -> Result<Vec<WalletRecord>, SessionError> {
        let inner = &self.inner;
        let backend = self.settled_active_backend()?;
        let epoch = {
            let state = inner.state();
            state.sessions.get(backend).require_unlocked()?;
            state.epoch(backend)
        };

        let seeds = self.available_seeds(backend).await?;
        let mut records = inner.services.store.load_wallets(backend).await?;
        let chains = &inner.config.chains;

        let mut indices = accounts::account_indices(&records);
        indices.insert(0);

        let mut added = 0;
        for index in indices {
            let missing = accounts::missing_chains(&records, chains, index);
            if missing.is_empty() {
                continue;
            }
            let group_id = accounts::group_of(&records, index);
            let Some(seed) = seeds.get(&group_id) else {
                log::debug!(
                    "Seed for wallet group {} not unlocked; account {} stays incomplete",
                    group_id,
                    index
                );
                continue;
            };
            let label = records
                .iter()
                .find(|r| r.account_index == index)
                .and_then(|r| r.label.clone());
            let derived = inner.services.deriver.derive(seed, &missing, index)?;
            let fresh = accounts::build_records(
                backend,
                chains,
                derived,
                index,
                &group_id,
                label.as_deref(),
            )?;
            added += accounts::merge_records(&mut records, fresh);
        }

        log::info!(
            "Derivation for {} backend added {} record(s)",
            backend,
            added
        );
        self.persist_and_commit(backend, epoch, records, None).await
    }

    /// New account on the same seed at `max(existing) + 1`.
    pub async fn create_additional_wallet(
        &self,
        label: Option<&str>,
    ) -> Result<Vec<WalletRecord>, SessionError> {
        let inner = &self.inner;
        let backend = self.settled_active_backend()?;
        let epoch = {
            let state = inner.state();
            state.sessions.get(backend).require_unlocked()?;
            state.epoch(backend)
        };

        let seeds = self.available_seeds(backend).await?;
        let seed = seeds.get(DEFAULT_WALLET_GROUP).ok_or_else(|| {
            SessionError::Derivation(format!("{} backend has no primary seed available", backend))
        })?;

        let mut records = inner.services.store.load_wallets(backend).await?;
        let index = accounts::next_account_index(&records)?;
        let derived = inner
            .services
            .deriver
            .derive(seed, &inner.config.chain_symbols(), index)?;
        let fresh = accounts::build_records(
            backend,
            &inner.config.chains,
            derived,
            index,
            DEFAULT_WALLET_GROUP,
            label,
        )?;
        accounts::merge_records(&mut records, fresh.clone());

        log::info!("Created account {} on {} backend", index, backend);
        self.persist_and_commit(backend, epoch, records, Some(index)).await?;
        Ok(fresh)
    }

    /// New account backed by a brand-new, independently recoverable seed.
    pub async fn create_wallet_with_new_seed(
        &self,
        pin: &str,
        label: Option<&str>,
    ) -> Result<NewSeedWallet, SessionError> {
        let inner = &self.inner;
        let backend = self.settled_active_backend()?;
        if backend != Backend::Software {
            return Err(SessionError::Unsupported(
                "independent seeds are only available on the software backend".into(),
            ));
        }
        if pin.is_empty() {
            return Err(SessionError::InvalidInput("PIN must not be empty".into()));
        }
        let epoch = {
            let state = inner.state();
            state.sessions.software.require_unlocked()?;
            state.epoch(backend)
        };

        let mnemonic = inner.services.seed_generator.generate()?;
        let wallet_group_id = uuid::Uuid::new_v4().to_string();

        let mut records = inner.services.store.load_wallets(backend).await?;
        let account_index = accounts::next_account_index(&records)?;
        let derived = inner
            .services
            .deriver
            .derive(&mnemonic, &inner.config.chain_symbols(), account_index)?;
        let fresh = accounts::build_records(
            backend,
            &inner.config.chains,
            derived,
            account_index,
            &wallet_group_id,
            label,
        )?;
        accounts::merge_records(&mut records, fresh.clone());

        let seed_store = &inner.services.seed_store;
        with_timeout(
            "seed encryption",
            inner.config.pin_timeout,
            seed_store.encrypt(&mnemonic, pin, &wallet_group_id),
        )
        .await?;

        if let Err(e) = self
            .persist_and_commit(backend, epoch, records, Some(account_index))
            .await
        {
            log::warn!(
                "Account {} not persisted, discarding wallet group {}: {}",
                account_index,
                wallet_group_id,
                e
            );
            if let Err(cleanup) = seed_store.remove(&wallet_group_id).await {
                log::error!(
                    "Failed to remove orphaned wallet group {}: {}",
                    wallet_group_id,
                    cleanup
                );
            }
            return Err(e);
        }

        {
            let mut state = inner.state();
            if state.epoch(backend) == epoch {
                state.seeds.insert(wallet_group_id.clone(), mnemonic.clone());
            }
        }
        log::info!(
            "Created account {} with independent wallet group {}",
            account_index,
            wallet_group_id
        );
        Ok(NewSeedWallet {
            wallet_group_id,
            account_index,
            mnemonic,
            records: fresh,
        })
    }

    /// Re-encrypt every wallet group readable with `old_pin` under `new_pin`.
    pub async fn change_pin(&self, old_pin: &str, new_pin: &str) -> Result<usize, SessionError> {
        let inner = &self.inner;
        if new_pin.is_empty() {
            return Err(SessionError::InvalidInput("PIN must not be empty".into()));
        }
        let seed_store = &inner.services.seed_store;

        let primary = with_timeout(
            "PIN verification",
            inner.config.pin_timeout,
            seed_store.decrypt(DEFAULT_WALLET_GROUP, old_pin),
        )
        .await?;
        if primary.is_none() {
            return Err(SessionError::Authentication("incorrect PIN".into()));
        }

        let mut changed = 0;
        for group_id in seed_store.group_ids().await? {
            let seed = with_timeout(
                "PIN verification",
                inner.config.pin_timeout,
                seed_store.decrypt(&group_id, old_pin),
            )
            .await?;
            if let Some(seed) = seed {
                with_timeout(
                    "seed encryption",
                    inner.config.pin_timeout,
                    seed_store.encrypt(&seed, new_pin, &group_id),
                )
                .await?;
                changed += 1;
            }
        }
        log::info!("PIN changed for {} wallet group(s)", changed);
        Ok(changed)
    }

    fn settled_active_backend(&self) -> Result<Backend, SessionError> {
        let state = self.inner.state();
        if state.switching {
            return Err(SessionError::InvalidState(
                "a backend switch is in progress".into(),
            ));
        }
        Ok(state.active)
    }

    /// Seeds usable for derivation on `backend`, keyed by wallet group.
    async fn available_seeds(
        &self,
        backend: Backend,
    ) -> Result<HashMap<String, Zeroizing<String>>, SessionError> {
        let inner = &self.inner;
        match backend {
            Backend::Software => {
                let seeds = inner.state().seeds.clone();
                if !seeds.contains_key(DEFAULT_WALLET_GROUP) {
                    return Err(SessionError::Derivation(
                        "software seed is not available; unlock again".into(),
                    ));
                }
                Ok(seeds)
            }
            Backend::Hardware => {
                let device = inner.device()?;
                let seed = with_timeout(
                    "device seed export",
                    inner.config.device_timeout,
                    device.export_seed(),
                )
                .await?
                .ok_or_else(|| {
                    SessionError::Derivation("device refused to export seed material".into())
                })?;
                let mut seeds = HashMap::new();
                seeds.insert(DEFAULT_WALLET_GROUP.to_string(), seed);
                Ok(seeds)
            }
        }
    }

    /// Write `records` as the backend's full set, run the consistency guard
    /// and, if the backend is still the active one, make them visible.
    async fn persist_and_commit(
        &self,
        backend: Backend,
        epoch: u64,
        mut records: Vec<WalletRecord>,
        select_account: Option<u32>,
    ) -> Result<Vec<WalletRecord>, SessionError> {
        let inner = &self.inner;
        let store = &inner.services.store;

        {
            let _barrier = inner.io_barrier.lock().await;
            let current = inner.state().epoch(backend);
            if current != epoch {
                return Err(SessionError::InvalidState(format!(
                    "{} backend was reset or disconnected while deriving",
                    backend
                )));
            }
            store.save_wallets(backend, &records).await?;
            store.set_setup(backend, true).await?;
        }

        if self.run_guard().await?.is_some() && backend == Backend::Software {
            return Ok(Vec::new());
        }

        let entries = inner.balances.load_cached(backend).await?;
        BalanceCacheManager::apply_cached(&mut records, &entries);

        let visible = {
            let mut state = inner.state();
            if state.active != backend || state.switching {
                log::debug!(
                    "{} backend no longer active; derived records persisted but not shown",
                    backend
                );
                return Ok(records);
            }
            // In-memory balances may be newer than the persisted ones
            for record in records.iter_mut() {
                if let Some(current) = state.wallets.iter().find(|w| w.id == record.id) {
                    if !current.has_placeholder_balance() {
                        record.balance = current.balance.clone();
                    }
                }
            }
            state.wallets = records;
            state.active_account = match select_account {
                Some(index) => index,
                None => accounts::normalize_active_index(&state.wallets, state.active_account),
            };
            state.wallets.clone()
        };
        inner.publish();
        Ok(visible)
    }

    // ============================================================================
    // Accounts
    // ============================================================================

    pub fn accounts(&self) -> Vec<AccountGroup> {
        let state = self.inner.state();
        accounts::group_accounts(&state.wallets, &self.inner.config.chains)
    }

    pub fn active_account(&self) -> u32 {
        self.inner.state().active_account
    }

    pub fn set_active_account(&self, account_index: u32) -> Result<(), SessionError> {
        {
            let mut state = self.inner.state();
            if !accounts::account_indices(&state.wallets).contains(&account_index) {
                return Err(SessionError::InvalidInput(format!(
                    "account {} does not exist",
                    account_index
                )));
            }
            state.active_account = account_index;
        }
        self.inner.publish();
        Ok(())
    }

    pub async fn rename_account(
        &self,
        account_index: u32,
        label: Option<&str>,
    ) -> Result<(), SessionError> {
        let inner = &self.inner;
        let backend = self.settled_active_backend()?;

        let _barrier = inner.io_barrier.lock().await;
        let mut records = inner.services.store.load_wallets(backend).await?;
        if accounts::apply_label(&mut records, account_index, label) == 0 {
            return Err(SessionError::InvalidInput(format!(
                "account {} does not exist",
                account_index
            )));
        }
        inner.services.store.save_wallets(backend, &records).await?;

        {
            let mut state = inner.state();
            if state.active == backend {
                accounts::apply_label(&mut state.wallets, account_index, label);
            }
        }
        inner.publish();
        Ok(())
    }

    // ============================================================================
    // Reset
    // ============================================================================

    /// Destroy every persisted trace of a backend's wallet.
    pub async fn reset_backend(&self, backend: Backend) -> Result<(), SessionError> {
        let inner = &self.inner;
        log::warn!("Resetting {} backend wallet data", backend);

        {
            let _barrier = inner.io_barrier.lock().await;
            inner.state().bump_epoch(backend);
            inner.services.store.clear_backend(backend).await?;
            if backend == Backend::Software {
                let seed_store = &inner.services.seed_store;
                for group_id in seed_store.group_ids().await? {
                    seed_store.remove(&group_id).await?;
                }
            }
        }

        let (was_active, any_unlocked) = {
            let mut state = inner.state();
            state.sessions.get_mut(backend).reset();
            if backend == Backend::Software {
                state.seeds.clear();
            }
            let was_active = state.active == backend;
            if was_active {
                state.wallets.clear();
                state.active_account = 0;
                inner.balances.reset_attempted();
            }
            (was_active, state.sessions.any_unlocked())
        };
        inner.sync_idle_timer(any_unlocked);
        inner.publish();

        if was_active {
            inner.emit(SessionEvent::RequiresSetup { backend });
        }
        Ok(())
    }

    // ============================================================================
    // Balances
    // ============================================================================

    /// Refresh every active record. Concurrent calls while one is in flight
    /// return [`RefreshOutcome::AlreadyRunning`] without queueing.
    pub async fn refresh_balances(&self) -> Result<RefreshOutcome, SessionError> {
        let inner = &self.inner;
        let Some(guard) = inner.balances.try_begin_refresh() else {
            log::debug!("Balance refresh already in flight");
            return Ok(RefreshOutcome::AlreadyRunning);
        };
        inner.publish();

        let outcome = self.run_refresh().await;

        drop(guard);
        inner.publish();
        outcome
    }

    async fn run_refresh(&self) -> Result<RefreshOutcome, SessionError> {
        let inner = &self.inner;

        let (backend, token, epoch, records) = {
            let state = inner.state();
            if state.switching {
                return Ok(RefreshOutcome::NothingToRefresh);
            }
            (
                state.active,
                inner.generation.current(),
                state.epoch(state.active),
                state.wallets.clone(),
            )
        };
        if records.is_empty() {
            return Ok(RefreshOutcome::NothingToRefresh);
        }

        let BatchOutcome { succeeded, failed } =
            inner.balances.fetch_batch(&records, &inner.config.chains).await;

        // Held until the cache is written so a reset cannot interleave
        let _barrier = inner.io_barrier.lock().await;
        let current = {
            let mut state = inner.state();
            let current = self.still_current(&state, backend, token, epoch);
            if current {
                BalanceCacheManager::apply_fetched(&mut state.wallets, &succeeded);
            }
            current
        };
        if !current {
            log::debug!("Discarding balance refresh for {}: backend changed", backend);
            return Ok(RefreshOutcome::Discarded);
        }

        if succeeded.is_empty() {
            log::info!("Balance refresh failed for all {} wallet(s); keeping cached values", failed);
            inner.emit(SessionEvent::RefreshCompleted {
                succeeded: 0,
                failed,
            });
            return Ok(RefreshOutcome::AllFailed { failed });
        }

        if let Err(e) = inner
            .balances
            .commit_refresh(backend, &succeeded, Utc::now())
            .await
        {
            log::error!("Failed to persist refreshed balances: {}", e);
        }

        log::info!(
            "Balance refresh: {} updated, {} failed",
            succeeded.len(),
            failed
        );
        inner.emit(SessionEvent::RefreshCompleted {
            succeeded: succeeded.len(),
            failed,
        });
        Ok(RefreshOutcome::Updated {
            succeeded: succeeded.len(),
            failed,
        })
    }

    /// Lazily fetch balances for records still at the placeholder, each at
    /// most once per backend cycle.
    pub async fn fetch_missing_balances(&self) -> Result<RefreshOutcome, SessionError> {
        let inner = &self.inner;

        let (backend, token, epoch, targets) = {
            let state = inner.state();
            if state.switching || state.wallets.is_empty() {
                if state.wallets.is_empty() {
                    inner.balances.reset_attempted();
                }
                return Ok(RefreshOutcome::NothingToRefresh);
            }
            let targets: Vec<WalletRecord> = state
                .wallets
                .iter()
                .filter(|r| r.has_placeholder_balance())
                .filter(|r| inner.balances.mark_attempted(&r.id))
                .cloned()
                .collect();
            (
                state.active,
                inner.generation.current(),
                state.epoch(state.active),
                targets,
            )
        };
        if targets.is_empty() {
            return Ok(RefreshOutcome::NothingToRefresh);
        }

        let BatchOutcome { succeeded, failed } =
            inner.balances.fetch_batch(&targets, &inner.config.chains).await;

        let _barrier = inner.io_barrier.lock().await;
        let current = {
            let mut state = inner.state();
            let current = self.still_current(&state, backend, token, epoch);
            if current {
                BalanceCacheManager::apply_fetched(&mut state.wallets, &succeeded);
            }
            current
        };
        if !current {
            return Ok(RefreshOutcome::Discarded);
        }
        if succeeded.is_empty() {
            return Ok(RefreshOutcome::AllFailed { failed });
        }
        inner.publish();

        if let Err(e) = inner
            .balances
            .store_entries(backend, &succeeded, Utc::now())
            .await
        {
            log::error!("Failed to cache lazily fetched balances: {}", e);
        }

        Ok(RefreshOutcome::Updated {
            succeeded: succeeded.len(),
            failed,
        })
    }

    /// Backend identity, its data epoch and the switch generation all
    /// unchanged since `token` and `epoch` were taken.
    fn still_current(&self, state: &State, backend: Backend, token: SwitchToken, epoch: u64) -> bool {
        state.active == backend
            && !state.switching
            && state.epoch(backend) == epoch
            && self.inner.generation.is_current(token)
    }
}
