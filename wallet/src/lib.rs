//! Custody Wallet: HTTP daemon for the dual-backend custody session
//!
//! Concrete collaborators for [`custody_session`] and the JSON API that
//! exposes its coordinator.
//!
//! # Modules
//!
//! - **chain**: BIP39 seeds, BIP84 derivation, Esplora balances
//! - **storage**: JSON file store and PIN-encrypted seed vault
//! - **manager**: builds the coordinator from [`config::WalletConfig`]
//! - **api**: axum router, handlers and request/response types

pub mod api;
pub mod chain;
pub mod config;
pub mod error;
pub mod manager;
pub mod storage;

pub use config::WalletConfig;
pub use error::WalletError;
