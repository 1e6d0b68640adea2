//! Cross-backend consistency guard
//!
//! An address present in both backends' persisted record sets means the
//! software backend was seeded from hardware-derived material. The software
//! side is the lower-trust one and gets quarantined.

use std::collections::BTreeSet;

use crate::error::SessionError;
use crate::services::{PersistentStore, SecureSeedStore};
use crate::types::{Backend, WalletRecord};

/// Addresses present in both sets, lowercased and sorted.
pub fn overlapping_addresses(software: &[WalletRecord], hardware: &[WalletRecord]) -> Vec<String> {
    let hardware_set: BTreeSet<String> = hardware.iter().map(|r| r.address.to_lowercase()).collect();
    software
        .iter()
        .map(|r| r.address.to_lowercase())
        .filter(|a| hardware_set.contains(a))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuarantineReport {
    pub addresses: Vec<String>,
    pub removed_groups: Vec<String>,
}

/// Compare both persisted namespaces and clear the software one on overlap.
pub async fn check_and_quarantine(
    store: &dyn PersistentStore,
    seed_store: &dyn SecureSeedStore,
) -> Result<Option<QuarantineReport>, SessionError> {
    let software = store.load_wallets(Backend::Software).await?;
    let hardware = store.load_wallets(Backend::Hardware).await?;

    let addresses = overlapping_addresses(&software, &hardware);
    if addresses.is_empty() {
        return Ok(None);
    }

    log::warn!(
        "Found {} address(es) shared by software and hardware storage; quarantining software wallet data",
        addresses.len()
    );

    store.clear_backend(Backend::Software).await?;

    let mut removed_groups = Vec::new();
    for group_id in seed_store.group_ids().await? {
        seed_store.remove(&group_id).await?;
        removed_groups.push(group_id);
    }

    log::info!(
        "Software backend cleared ({} seed group(s) removed)",
        removed_groups.len()
    );

    Ok(Some(QuarantineReport {
        addresses,
        removed_groups,
    }))
}
