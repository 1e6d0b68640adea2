/// Balance cache manager
///
/// Keeps the displayed balance of every record fresh without blocking on the
/// network and without dropping known-good values on transient failures.
/// Commit decisions (is the backend still active?) belong to the caller;
/// this type fetches, tracks status and persists cache entries.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::services::{BalanceOracle, PersistentStore};
use crate::types::{Backend, BalanceCacheEntry, CacheStatus, ChainConfig, WalletRecord};

/// One successful (address, chain) fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedBalance {
    pub record_id: String,
    pub address: String,
    pub chain_symbol: String,
    pub chain_id: u64,
    pub balance: String,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub succeeded: Vec<FetchedBalance>,
    pub failed: usize,
}

/// Clears the in-flight flag when dropped.
pub struct RefreshGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RefreshGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct BalanceCacheManager {
    oracle: Arc<dyn BalanceOracle>,
    store: Arc<dyn PersistentStore>,
    oracle_timeout: Duration,
    stale_threshold: Duration,
    refreshing: AtomicBool,
    last_updated: Mutex<Option<DateTime<Utc>>>,
    /// Record ids already tried by the lazy per-wallet path
    attempted: Mutex<HashSet<String>>,
}

impl BalanceCacheManager {
    pub fn new(
        oracle: Arc<dyn BalanceOracle>,
        store: Arc<dyn PersistentStore>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            oracle,
            store,
            oracle_timeout: config.oracle_timeout,
            stale_threshold: config.stale_threshold,
            refreshing: AtomicBool::new(false),
            last_updated: Mutex::new(None),
            attempted: Mutex::new(HashSet::new()),
        }
    }

    fn last_updated_slot(&self) -> MutexGuard<'_, Option<DateTime<Utc>>> {
        self.last_updated.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn attempted_set(&self) -> MutexGuard<'_, HashSet<String>> {
        self.attempted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status_at(&self, now: DateTime<Utc>) -> CacheStatus {
        let last_updated = *self.last_updated_slot();
        CacheStatus {
            is_stale: CacheStatus::compute_stale(last_updated, now, self.stale_threshold),
            last_updated,
            is_refreshing: self.is_refreshing(),
        }
    }

    pub fn status(&self) -> CacheStatus {
        self.status_at(Utc::now())
    }

    pub fn is_refreshing(&self) -> bool {
        self.refreshing.load(Ordering::SeqCst)
    }

    /// `None` while another refresh is in flight. Requests do not queue.
    pub fn try_begin_refresh(&self) -> Option<RefreshGuard<'_>> {
        self.refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RefreshGuard {
                flag: &self.refreshing,
            })
    }

    /// Reload `last_updated` from the persisted last full refresh.
    pub async fn load_status(&self) -> Result<CacheStatus, SessionError> {
        let last = self.store.last_full_refresh().await?;
        *self.last_updated_slot() = last;
        Ok(self.status())
    }

    /// Fetch every record's balance. Each call is independent; failures and
    /// timeouts are counted, never propagated.
    pub async fn fetch_batch(&self, records: &[WalletRecord], chains: &[ChainConfig]) -> BatchOutcome {
        let fetches = records.iter().map(|record| {
            let rpc_url = chains
                .iter()
                .find(|c| c.symbol == record.chain_symbol)
                .and_then(|c| c.rpc_url.as_deref());
            async move { (record, self.fetch_one(record, rpc_url).await) }
        });

        let results = futures::future::join_all(fetches).await;

        let mut outcome = BatchOutcome::default();
        for (record, result) in results {
            match result {
                Ok(balance) => outcome.succeeded.push(FetchedBalance {
                    record_id: record.id.clone(),
                    address: record.address.clone(),
                    chain_symbol: record.chain_symbol.clone(),
                    chain_id: record.chain_id,
                    balance,
                }),
                Err(e) => {
                    log::debug!(
                        "Balance fetch failed for {} on {}: {}",
                        record.address,
                        record.chain_symbol,
                        e
                    );
                    outcome.failed += 1;
                }
            }
        }

        log::debug!(
            "Balance batch finished: {} succeeded, {} failed",
            outcome.succeeded.len(),
            outcome.failed
        );
        outcome
    }

    async fn fetch_one(
        &self,
        record: &WalletRecord,
        rpc_url: Option<&str>,
    ) -> Result<String, SessionError> {
        tokio::time::timeout(
            self.oracle_timeout,
            self.oracle.get_balance(
                &record.address,
                record.chain_id,
                &record.chain_symbol,
                rpc_url,
            ),
        )
        .await
        .map_err(|_| SessionError::timeout("balance fetch", self.oracle_timeout))?
    }

    /// Overwrite balances of the matching records. Returns how many changed.
    pub fn apply_fetched(records: &mut [WalletRecord], fetched: &[FetchedBalance]) -> usize {
        let mut applied = 0;
        for record in records.iter_mut() {
            if let Some(f) = fetched.iter().find(|f| f.record_id == record.id) {
                record.balance = f.balance.clone();
                applied += 1;
            }
        }
        applied
    }

    /// Seed records with last-known balances before any network call.
    pub fn apply_cached(records: &mut [WalletRecord], entries: &[BalanceCacheEntry]) -> usize {
        let mut applied = 0;
        for record in records.iter_mut() {
            if let Some(entry) = entries.iter().find(|e| e.matches(record)) {
                record.balance = entry.balance.clone();
                applied += 1;
            }
        }
        applied
    }

    pub async fn load_cached(&self, backend: Backend) -> Result<Vec<BalanceCacheEntry>, SessionError> {
        Ok(self.store.load_balance_cache(backend).await?)
    }

    /// Upsert cache entries for the fetched subset, keyed by (address, chain symbol).
    pub async fn store_entries(
        &self,
        backend: Backend,
        fetched: &[FetchedBalance],
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        let mut entries = self.store.load_balance_cache(backend).await?;
        for f in fetched {
            let fresh = BalanceCacheEntry {
                address: f.address.clone(),
                chain_symbol: f.chain_symbol.clone(),
                chain_id: f.chain_id,
                balance: f.balance.clone(),
                cached_at: now,
            };
            match entries.iter_mut().find(|e| {
                e.chain_symbol == f.chain_symbol && e.address.eq_ignore_ascii_case(&f.address)
            }) {
                Some(existing) => *existing = fresh,
                None => entries.push(fresh),
            }
        }
        self.store.save_balance_cache(backend, &entries).await?;
        Ok(())
    }

    /// A batch with at least one success: persist it and mark the cache fresh.
    pub async fn commit_refresh(
        &self,
        backend: Backend,
        fetched: &[FetchedBalance],
        now: DateTime<Utc>,
    ) -> Result<(), SessionError> {
        *self.last_updated_slot() = Some(now);
        self.store_entries(backend, fetched, now).await?;
        self.store.set_last_full_refresh(now).await?;
        Ok(())
    }

    /// `true` the first time a record id is seen in this cycle.
    pub fn mark_attempted(&self, record_id: &str) -> bool {
        self.attempted_set().insert(record_id.to_string())
    }

    pub fn reset_attempted(&self) {
        let mut attempted = self.attempted_set();
        if !attempted.is_empty() {
            log::trace!("Clearing {} lazily attempted balance fetch(es)", attempted.len());
            attempted.clear();
        }
    }
}
