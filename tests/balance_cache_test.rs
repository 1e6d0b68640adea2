//! Balance cache integration tests
//!
//! Stale-while-revalidate refresh through the coordinator: cached values on
//! cold start, partial success, total failure, in-flight deduplication and
//! the lazy per-wallet path.

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use custody_session::{
    Backend, BalanceCacheEntry, ChainConfig, PersistentStore, RefreshOutcome, SecureSeedStore,
    SessionConfig, WalletRecord, DEFAULT_WALLET_GROUP, PLACEHOLDER_BALANCE,
};

fn eth_address(index: u32) -> String {
    ScriptedDeriver::address_for(PRIMARY_SEED, "ETH", index)
}

fn btc_address(index: u32) -> String {
    ScriptedDeriver::address_for(PRIMARY_SEED, "BTC", index)
}

fn balance_of(harness: &Harness, address: &str) -> String {
    harness
        .coordinator
        .active_wallets()
        .into_iter()
        .find(|w| w.address == address)
        .map(|w| w.balance)
        .unwrap_or_else(|| panic!("no wallet for {}", address))
}

#[tokio::test]
async fn test_cached_balance_shown_before_any_network_call() {
    let config = SessionConfig::with_chains(vec![ChainConfig::new("ETH", 1)]);
    let harness = Harness::new(config);
    let address = "0xCafe";

    let store = &harness.store.inner;
    let record = WalletRecord {
        id: WalletRecord::record_id(Backend::Software, 1, 0, address),
        backend: Backend::Software,
        chain_id: 1,
        chain_symbol: "ETH".into(),
        address: address.into(),
        derivation_path: "m/44'/60'/0'/0/0".into(),
        balance: PLACEHOLDER_BALANCE.into(),
        account_index: 0,
        label: None,
        wallet_group_id: None,
    };
    store.save_wallets(Backend::Software, &[record]).await.unwrap();
    store.set_setup(Backend::Software, true).await.unwrap();
    store
        .save_balance_cache(
            Backend::Software,
            &[BalanceCacheEntry {
                address: "0xcafe".into(),
                chain_symbol: "ETH".into(),
                chain_id: 1,
                balance: "1.5".into(),
                cached_at: Utc::now() - ChronoDuration::hours(3),
            }],
        )
        .await
        .unwrap();
    let last_refresh = Utc::now() - ChronoDuration::hours(3);
    store.set_last_full_refresh(last_refresh).await.unwrap();
    harness
        .seeds
        .encrypt(PRIMARY_SEED, PIN, DEFAULT_WALLET_GROUP)
        .await
        .unwrap();

    let snapshot = harness.coordinator.initialize().await.unwrap();

    assert_eq!(snapshot.wallets.len(), 1);
    assert_eq!(snapshot.wallets[0].balance, "1.5");
    assert_eq!(harness.oracle.call_count(), 0);
    assert!(snapshot.software.has_wallet);

    // Three hours exceeds the default five minute threshold
    assert!(snapshot.cache.is_stale);
    assert_eq!(snapshot.cache.last_updated, Some(last_refresh));
    let age = snapshot.cache.age(Utc::now()).unwrap();
    assert!(age >= std::time::Duration::from_secs(3 * 3600));
}

#[tokio::test]
async fn test_partial_success_keeps_failed_balances() {
    let harness = Harness::with_software_wallet(eth_btc_config()).await;
    harness.oracle.set_balance(&eth_address(0), "1.0");
    harness.oracle.set_balance(&btc_address(0), "0.25");
    harness.coordinator.refresh_balances().await.unwrap();

    harness.oracle.set_balance(&eth_address(0), "2.0");
    harness.oracle.fail_address(&btc_address(0));
    let before = Utc::now();

    let outcome = harness.coordinator.refresh_balances().await.unwrap();
    assert_eq!(
        outcome,
        RefreshOutcome::Updated {
            succeeded: 1,
            failed: 1
        }
    );
    assert_eq!(balance_of(&harness, &eth_address(0)), "2.0");
    assert_eq!(balance_of(&harness, &btc_address(0)), "0.25");

    let status = harness.coordinator.cache_status();
    assert!(!status.is_stale);
    assert!(!status.is_refreshing);
    assert!(status.last_updated.unwrap() >= before);

    // The cache holds the new value for the success and the old one for the failure
    let cached = harness
        .store
        .inner
        .namespace(Backend::Software)
        .balance_cache;
    let find = |address: &str| {
        cached
            .iter()
            .find(|e| e.address == address)
            .map(|e| e.balance.clone())
    };
    assert_eq!(find(&eth_address(0)).as_deref(), Some("2.0"));
    assert_eq!(find(&btc_address(0)).as_deref(), Some("0.25"));
}

#[tokio::test]
async fn test_total_failure_changes_nothing() {
    let harness = Harness::with_software_wallet(eth_btc_config()).await;

    // Never refreshed: stays stale with no timestamp
    harness.oracle.fail_all(true);
    let outcome = harness.coordinator.refresh_balances().await.unwrap();
    assert_eq!(outcome, RefreshOutcome::AllFailed { failed: 2 });
    let status = harness.coordinator.cache_status();
    assert!(status.is_stale);
    assert_eq!(status.last_updated, None);
    assert!(!status.is_refreshing);

    // Refreshed once: balances and freshness survive a failed round
    harness.oracle.fail_all(false);
    harness.oracle.set_balance(&eth_address(0), "3.5");
    harness.coordinator.refresh_balances().await.unwrap();
    let fresh = harness.coordinator.cache_status();

    harness.oracle.fail_all(true);
    let outcome = harness.coordinator.refresh_balances().await.unwrap();
    assert_eq!(outcome, RefreshOutcome::AllFailed { failed: 2 });

    assert_eq!(balance_of(&harness, &eth_address(0)), "3.5");
    let after = harness.coordinator.cache_status();
    assert_eq!(after.is_stale, fresh.is_stale);
    assert_eq!(after.last_updated, fresh.last_updated);
    assert_eq!(
        harness.store.inner.global().last_full_refresh,
        fresh.last_updated
    );
}

#[tokio::test]
async fn test_concurrent_refresh_is_a_no_op() {
    let harness = Harness::with_software_wallet(eth_btc_config()).await;
    let gate = Gate::closed();
    harness.oracle.hold(gate.clone());

    let coordinator = harness.coordinator.clone();
    let first = tokio::spawn(async move { coordinator.refresh_balances().await });
    gate.arrival().await;

    assert!(harness.coordinator.cache_status().is_refreshing);
    assert_eq!(
        harness.coordinator.refresh_balances().await.unwrap(),
        RefreshOutcome::AlreadyRunning
    );

    gate.open();
    let outcome = first.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        RefreshOutcome::Updated {
            succeeded: 2,
            failed: 0
        }
    );
    // Only the first request reached the oracle
    assert_eq!(harness.oracle.call_count(), 2);
    assert!(!harness.coordinator.cache_status().is_refreshing);
}

#[tokio::test]
async fn test_refresh_discarded_after_switch() {
    let harness = Harness::with_software_wallet(eth_btc_config()).await;
    harness.oracle.set_balance(&eth_address(0), "9.0");
    let gate = Gate::closed();
    harness.oracle.hold(gate.clone());

    let coordinator = harness.coordinator.clone();
    let refresh = tokio::spawn(async move { coordinator.refresh_balances().await });
    gate.arrival().await;

    harness
        .coordinator
        .switch_backend(Backend::Hardware)
        .await
        .unwrap();

    gate.open();
    assert_eq!(
        refresh.await.unwrap().unwrap(),
        RefreshOutcome::Discarded
    );

    assert!(harness.coordinator.active_wallets().is_empty());
    assert!(harness
        .store
        .inner
        .namespace(Backend::Software)
        .balance_cache
        .is_empty());
    assert_eq!(harness.coordinator.cache_status().last_updated, None);
}

#[tokio::test]
async fn test_refresh_discarded_after_reset() {
    let harness = Harness::with_software_wallet(eth_btc_config()).await;
    harness.oracle.set_balance(&eth_address(0), "9.0");
    let gate = Gate::closed();
    harness.oracle.hold(gate.clone());

    let coordinator = harness.coordinator.clone();
    let refresh = tokio::spawn(async move { coordinator.refresh_balances().await });
    gate.arrival().await;

    harness
        .coordinator
        .reset_backend(Backend::Software)
        .await
        .unwrap();

    gate.open();
    assert_eq!(
        refresh.await.unwrap().unwrap(),
        RefreshOutcome::Discarded
    );

    let software = harness.store.inner.namespace(Backend::Software);
    assert!(software.balance_cache.is_empty());
    assert!(software.wallet_records.is_empty());
    assert!(!software.setup_flag);
    assert!(harness.coordinator.active_wallets().is_empty());
    assert_eq!(harness.coordinator.cache_status().last_updated, None);
}

#[tokio::test]
async fn test_lazy_fetch_discarded_after_disconnect() {
    let harness = Harness::with_software_wallet(eth_btc_config()).await;
    let gate = Gate::closed();
    harness.oracle.hold(gate.clone());

    let coordinator = harness.coordinator.clone();
    let fetch = tokio::spawn(async move { coordinator.fetch_missing_balances().await });
    gate.arrival().await;

    harness
        .coordinator
        .disconnect(Backend::Software)
        .await
        .unwrap();

    gate.open();
    assert_eq!(fetch.await.unwrap().unwrap(), RefreshOutcome::Discarded);
    assert!(harness
        .store
        .inner
        .namespace(Backend::Software)
        .balance_cache
        .is_empty());
}

#[tokio::test]
async fn test_lazy_fetch_tries_each_wallet_once_per_cycle() {
    let harness = Harness::with_software_wallet(eth_btc_config()).await;
    harness.oracle.set_balance(&eth_address(0), "0.5");
    harness.oracle.fail_address(&btc_address(0));

    let outcome = harness.coordinator.fetch_missing_balances().await.unwrap();
    assert_eq!(
        outcome,
        RefreshOutcome::Updated {
            succeeded: 1,
            failed: 1
        }
    );
    assert_eq!(balance_of(&harness, &eth_address(0)), "0.5");
    assert_eq!(balance_of(&harness, &btc_address(0)), PLACEHOLDER_BALANCE);
    assert_eq!(harness.oracle.call_count(), 2);

    // The failed wallet is not retried in the same cycle
    assert_eq!(
        harness.coordinator.fetch_missing_balances().await.unwrap(),
        RefreshOutcome::NothingToRefresh
    );
    assert_eq!(harness.oracle.call_count(), 2);

    // Lazy fetches do not count as a full refresh
    assert_eq!(harness.coordinator.cache_status().last_updated, None);

    // A backend change starts a new cycle
    harness
        .coordinator
        .switch_backend(Backend::Hardware)
        .await
        .unwrap();
    harness
        .coordinator
        .switch_backend(Backend::Software)
        .await
        .unwrap();
    harness
        .coordinator
        .fetch_missing_balances()
        .await
        .unwrap();
    assert_eq!(harness.oracle.call_count(), 3);
}

#[tokio::test]
async fn test_refreshed_balances_survive_switch_round_trip() {
    let harness = Harness::with_software_wallet(eth_btc_config()).await;
    harness.oracle.set_balance(&eth_address(0), "4.2");
    harness.coordinator.refresh_balances().await.unwrap();

    harness
        .coordinator
        .switch_backend(Backend::Hardware)
        .await
        .unwrap();
    harness.oracle.fail_all(true);
    harness
        .coordinator
        .switch_backend(Backend::Software)
        .await
        .unwrap();

    assert_eq!(balance_of(&harness, &eth_address(0)), "4.2");
}
