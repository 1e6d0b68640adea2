//! Wires the concrete collaborators into a session coordinator.

use custody_session::{BackendCoordinator, Services, SessionEvent};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::chain::{Bip39SeedGenerator, Bip84Deriver, EsploraOracle};
use crate::config::WalletConfig;
use crate::error::WalletError;
use crate::storage::{FileStore, KdfParams, PinSeedVault};

/// File-backed services rooted at `config.data_dir`.
///
/// No hardware transport is attached; hardware operations report a
/// transport error.
pub fn build_services(config: &WalletConfig, kdf: KdfParams) -> Result<Services, WalletError> {
    let deriver = Bip84Deriver::new(config.chain_networks()?);

    Ok(Services {
        deriver: Arc::new(deriver),
        seed_generator: Arc::new(Bip39SeedGenerator),
        oracle: Arc::new(EsploraOracle::new(config.esplora_url.clone())),
        seed_store: Arc::new(PinSeedVault::new(&config.data_dir, kdf)),
        store: Arc::new(FileStore::new(config.data_dir.clone())),
        device: None,
    })
}

pub fn build_coordinator(
    config: &WalletConfig,
    kdf: KdfParams,
) -> Result<BackendCoordinator, WalletError> {
    let services = build_services(config, kdf)?;
    Ok(BackendCoordinator::new(services, config.session_config()))
}

/// Logs every informational event until the coordinator goes away.
pub fn spawn_event_logger(coordinator: &BackendCoordinator) -> JoinHandle<()> {
    let mut events = coordinator.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!("Event logger lagged, {} event(s) skipped", skipped)
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &SessionEvent) {
    match event {
        SessionEvent::ContaminationQuarantined { addresses } => {
            log::warn!(
                "Software wallet quarantined: {} address(es) overlapped the hardware backend",
                addresses.len()
            )
        }
        SessionEvent::RequiresSetup { backend } => {
            log::info!("Backend {} requires setup", backend)
        }
        SessionEvent::AutoLocked { backend } => {
            log::info!("Backend {} locked after inactivity", backend)
        }
        SessionEvent::SwitchSuperseded { backend } => {
            log::debug!("Switch to {} superseded", backend)
        }
        SessionEvent::RefreshCompleted { succeeded, failed } => {
            log::info!("Balance refresh: {} updated, {} failed", succeeded, failed)
        }
    }
}
