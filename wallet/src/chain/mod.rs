//! Bitcoin-family chain collaborators
//!
//! - BIP39 seed generation
//! - BIP84 address derivation per configured network
//! - Esplora balance lookups

pub mod esplora;
pub mod keys;

pub use esplora::{format_btc, EsploraOracle};
pub use keys::{Bip39SeedGenerator, Bip84Deriver};
