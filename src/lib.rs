//! Custody Session: Dual-Backend Wallet Session Coordination
//!
//! This crate keeps a wallet application's view of its keys consistent when
//! the keys can live in two places: a PIN-encrypted software keystore and an
//! external hardware device.
//!
//! # Architecture
//!
//! - **Backend Coordinator**: single source of truth for the active backend;
//!   switches are cancellable and only the newest one commits
//! - **Session State Machines**: `Disconnected -> Locked -> Unlocked` per backend
//! - **Balance Cache**: stale-while-revalidate balances with deduplicated refresh
//! - **Consistency Guard**: quarantines software data that leaked hardware addresses
//! - **Idle Timer**: auto-locks unlocked backends after inactivity
//!
//! # Example
//!
//! ```ignore
//! use custody_session::{Backend, BackendCoordinator, SessionConfig};
//!
//! let coordinator = BackendCoordinator::new(services, SessionConfig::default());
//! coordinator.initialize().await?;
//!
//! coordinator.unlock(Backend::Software, "1234").await?;
//! coordinator.refresh_balances().await?;
//!
//! let mut updates = coordinator.subscribe();
//! coordinator.switch_backend(Backend::Hardware).await?;
//! updates.changed().await?;
//! ```

// Public modules
pub mod accounts;
pub mod balance;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod generation;
pub mod guard;
pub mod idle;
pub mod services;
pub mod session;
pub mod store;
pub mod types;

// Re-exports for convenience
pub use balance::{BalanceCacheManager, FetchedBalance};
pub use config::{IdleTimeout, SessionConfig};
pub use coordinator::{
    BackendCoordinator, CreatedWallet, NewSeedWallet, RefreshOutcome, SessionSnapshot,
    SwitchOutcome,
};
pub use error::{ErrorKind, SessionError, StorageError};
pub use guard::QuarantineReport;
pub use services::{
    AddressDeriver, BalanceOracle, DeviceStatus, HardwareDevice, PersistentStore, SecureSeedStore,
    SeedGenerator, Services,
};
pub use session::SessionStateMachine;
pub use store::MemoryStore;
pub use types::{
    AccountGroup, ActivityKind, Backend, BalanceCacheEntry, CacheStatus, ChainConfig,
    DerivedAddress, EncryptedSeedRecord, SessionEvent, SessionState, SessionStatus, WalletRecord,
    DEFAULT_WALLET_GROUP, PLACEHOLDER_BALANCE,
};

// Common result type
pub type Result<T> = std::result::Result<T, SessionError>;
