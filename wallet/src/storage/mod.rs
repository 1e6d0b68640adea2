//! Storage and persistence layer
//!
//! - JSON namespaces per backend
//! - PIN-encrypted seed vault

mod file_system;
mod vault;

pub use file_system::FileStore;
pub use vault::{KdfParams, PinSeedVault};
