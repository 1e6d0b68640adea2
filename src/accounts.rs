/// Account and wallet-group model
///
/// Maps derived records to account indices and wallet groups. Everything
/// here is pure; the coordinator owns the records and persists them.

use std::collections::{BTreeMap, BTreeSet};

use crate::error::SessionError;
use crate::types::{
    AccountGroup, Backend, ChainConfig, DerivedAddress, WalletRecord, DEFAULT_WALLET_GROUP,
    PLACEHOLDER_BALANCE,
};

/// Distinct account indices, ascending.
pub fn account_indices(records: &[WalletRecord]) -> BTreeSet<u32> {
    records.iter().map(|r| r.account_index).collect()
}

/// `max(existing) + 1`, never reusing a gap below the maximum.
pub fn next_account_index(records: &[WalletRecord]) -> Result<u32, SessionError> {
    match records.iter().map(|r| r.account_index).max() {
        None => Ok(0),
        Some(max) => max.checked_add(1).ok_or_else(|| {
            SessionError::InvalidState("no account index left above the highest one".into())
        }),
    }
}

/// Keep `current` if some record still uses it, otherwise fall back to the
/// lowest remaining index (0 when there are no records at all).
pub fn normalize_active_index(records: &[WalletRecord], current: u32) -> u32 {
    let indices = account_indices(records);
    if indices.contains(&current) {
        current
    } else {
        indices.into_iter().next().unwrap_or(0)
    }
}

/// Configured chains without a record at `account_index`.
pub fn missing_chains(
    records: &[WalletRecord],
    chains: &[ChainConfig],
    account_index: u32,
) -> Vec<String> {
    let present: BTreeSet<&str> = records
        .iter()
        .filter(|r| r.account_index == account_index)
        .map(|r| r.chain_symbol.as_str())
        .collect();

    chains
        .iter()
        .filter(|c| !present.contains(c.symbol.as_str()))
        .map(|c| c.symbol.clone())
        .collect()
}

/// Wallet group that owns `account_index` (the primary seed when unknown).
pub fn group_of(records: &[WalletRecord], account_index: u32) -> String {
    records
        .iter()
        .find(|r| r.account_index == account_index)
        .map(|r| r.group_id().to_string())
        .unwrap_or_else(|| DEFAULT_WALLET_GROUP.to_string())
}

/// User-visible accounts list, one entry per account index.
pub fn group_accounts(records: &[WalletRecord], chains: &[ChainConfig]) -> Vec<AccountGroup> {
    let mut by_index: BTreeMap<u32, Vec<&WalletRecord>> = BTreeMap::new();
    for record in records {
        by_index.entry(record.account_index).or_default().push(record);
    }

    by_index
        .into_iter()
        .map(|(account_index, members)| {
            // Configured order first, then anything no longer configured
            let mut covered: Vec<String> = chains
                .iter()
                .filter(|c| members.iter().any(|r| r.chain_symbol == c.symbol))
                .map(|c| c.symbol.clone())
                .collect();
            for record in &members {
                if !covered.contains(&record.chain_symbol) {
                    covered.push(record.chain_symbol.clone());
                }
            }

            let complete = chains
                .iter()
                .all(|c| covered.iter().any(|s| *s == c.symbol));

            AccountGroup {
                account_index,
                label: members.iter().find_map(|r| r.label.clone()),
                wallet_group_id: members.iter().find_map(|r| r.wallet_group_id.clone()),
                chains: covered,
                complete,
            }
        })
        .collect()
}

/// Turn deriver output into records with placeholder balances.
pub fn build_records(
    backend: Backend,
    chains: &[ChainConfig],
    derived: Vec<DerivedAddress>,
    account_index: u32,
    group_id: &str,
    label: Option<&str>,
) -> Result<Vec<WalletRecord>, SessionError> {
    let wallet_group_id = if group_id == DEFAULT_WALLET_GROUP {
        None
    } else {
        Some(group_id.to_string())
    };

    derived
        .into_iter()
        .map(|d| {
            let chain = chains
                .iter()
                .find(|c| c.symbol == d.chain_symbol)
                .ok_or_else(|| {
                    SessionError::Derivation(format!(
                        "deriver returned unconfigured chain {}",
                        d.chain_symbol
                    ))
                })?;

            Ok(WalletRecord {
                id: WalletRecord::record_id(backend, chain.chain_id, account_index, &d.address),
                backend,
                chain_id: chain.chain_id,
                chain_symbol: d.chain_symbol,
                address: d.address,
                derivation_path: d.path,
                balance: PLACEHOLDER_BALANCE.to_string(),
                account_index,
                label: label.map(str::to_string),
                wallet_group_id: wallet_group_id.clone(),
            })
        })
        .collect()
}

/// Append records whose id is not present yet. Returns how many were added.
pub fn merge_records(existing: &mut Vec<WalletRecord>, incoming: Vec<WalletRecord>) -> usize {
    let mut added = 0;
    for record in incoming {
        if !existing.iter().any(|r| r.id == record.id) {
            existing.push(record);
            added += 1;
        }
    }
    existing.sort_by(|a, b| {
        a.account_index
            .cmp(&b.account_index)
            .then_with(|| a.chain_id.cmp(&b.chain_id))
            .then_with(|| a.chain_symbol.cmp(&b.chain_symbol))
    });
    added
}

/// Set (or clear) the label on every record of an account.
pub fn apply_label(records: &mut [WalletRecord], account_index: u32, label: Option<&str>) -> usize {
    let mut touched = 0;
    for record in records.iter_mut().filter(|r| r.account_index == account_index) {
        record.label = label.map(str::to_string);
        touched += 1;
    }
    touched
}
