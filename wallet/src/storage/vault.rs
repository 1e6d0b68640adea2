//! PIN-encrypted seed vault
//!
//! Each wallet group's recovery phrase is sealed with XChaCha20-Poly1305
//! under a key stretched from the PIN by Argon2id. A Blake2b digest of the
//! key is stored alongside so a wrong PIN is told apart from a damaged
//! record.

use argon2::{Algorithm, Argon2, Params, Version};
use async_trait::async_trait;
use bitcoin::key::rand::{self, RngCore};
use blake2::{Blake2b512, Digest};
use chacha20poly1305::{
    aead::{generic_array::GenericArray, Aead, KeyInit},
    XChaCha20Poly1305,
};
use chrono::Utc;
use custody_session::{EncryptedSeedRecord, SecureSeedStore, SessionError, StorageError};
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use zeroize::Zeroizing;

use super::file_system::{read_json, write_json};

pub const SALT_SIZE: usize = 16;
pub const NONCE_SIZE: usize = 24;
pub const KEY_SIZE: usize = 32;
pub const TAG_SIZE: usize = 16;

/// Argon2id cost parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl KdfParams {
    /// Cheap parameters for tests only
    pub const TESTING: Self = Self {
        memory_kib: 1024,
        iterations: 1,
        parallelism: 1,
    };

    pub const DEFAULT: Self = Self {
        memory_kib: 64 * 1024,
        iterations: 3,
        parallelism: 4,
    };
}

impl Default for KdfParams {
    fn default() -> Self {
        Self::DEFAULT
    }
}

type SeedFile = BTreeMap<String, EncryptedSeedRecord>;

pub struct PinSeedVault {
    path: PathBuf,
    params: KdfParams,
    write_lock: Mutex<()>,
}

impl PinSeedVault {
    /// Vault stored as `seeds.json` under `base_path`.
    pub fn new(base_path: impl AsRef<Path>, params: KdfParams) -> Self {
        Self {
            path: base_path.as_ref().join("seeds.json"),
            params,
            write_lock: Mutex::new(()),
        }
    }

    async fn records(&self) -> Result<SeedFile, SessionError> {
        Ok(read_json(&self.path).await?)
    }
}

fn derive_key(
    pin: &[u8],
    salt: &[u8],
    params: KdfParams,
) -> Result<Zeroizing<[u8; KEY_SIZE]>, SessionError> {
    let argon2_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| SessionError::Crypto(format!("Argon2 params error: {}", e)))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut output = Zeroizing::new([0u8; KEY_SIZE]);
    argon2
        .hash_password_into(pin, salt, &mut output[..])
        .map_err(|e| SessionError::Crypto(format!("Argon2 error: {}", e)))?;
    Ok(output)
}

fn key_check(key: &[u8; KEY_SIZE]) -> String {
    let digest = Blake2b512::digest(key);
    hex::encode(&digest[..32])
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    bool::from(a.ct_eq(b))
}

fn corrupt(group_id: &str, what: &str) -> SessionError {
    SessionError::Storage(StorageError::Corrupt(format!(
        "seed record {}: {}",
        group_id, what
    )))
}

fn seal(
    seed: &str,
    pin: &str,
    group_id: &str,
    params: KdfParams,
) -> Result<EncryptedSeedRecord, SessionError> {
    let mut salt = [0u8; SALT_SIZE];
    let mut nonce = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    rand::thread_rng().fill_bytes(&mut nonce);

    let key = derive_key(pin.as_bytes(), &salt, params)?;
    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(&key[..]));
    let ciphertext = cipher
        .encrypt(GenericArray::from_slice(&nonce), seed.as_bytes())
        .map_err(|_| SessionError::Crypto("seed encryption failed".into()))?;

    let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);

    Ok(EncryptedSeedRecord {
        wallet_group_id: group_id.to_string(),
        encrypted_seed: hex::encode(sealed),
        pin_hash: key_check(&key),
        pin_salt: hex::encode(salt),
        created_at: Utc::now(),
    })
}

fn open(
    record: &EncryptedSeedRecord,
    pin: &str,
    params: KdfParams,
) -> Result<Option<Zeroizing<String>>, SessionError> {
    let group_id = record.wallet_group_id.as_str();
    let salt = hex::decode(&record.pin_salt).map_err(|_| corrupt(group_id, "bad salt"))?;
    let key = derive_key(pin.as_bytes(), &salt, params)?;
    if !constant_time_eq(key_check(&key).as_bytes(), record.pin_hash.as_bytes()) {
        return Ok(None);
    }

    let sealed = hex::decode(&record.encrypted_seed)
        .map_err(|_| corrupt(group_id, "bad ciphertext encoding"))?;
    if sealed.len() < NONCE_SIZE + TAG_SIZE {
        return Err(corrupt(group_id, "ciphertext too short"));
    }
    let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

    let cipher = XChaCha20Poly1305::new(GenericArray::from_slice(&key[..]));
    let plaintext = Zeroizing::new(
        cipher
            .decrypt(GenericArray::from_slice(nonce), ciphertext)
            .map_err(|_| corrupt(group_id, "authentication tag mismatch"))?,
    );
    let seed = std::str::from_utf8(&plaintext).map_err(|_| corrupt(group_id, "not UTF-8"))?;
    Ok(Some(Zeroizing::new(seed.to_string())))
}

/// Runs the KDF off the async workers.
async fn blocking<T, F>(work: F) -> Result<T, SessionError>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T, SessionError> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| SessionError::Internal(format!("KDF task failed: {}", e)))?
}

#[async_trait]
impl SecureSeedStore for PinSeedVault {
    async fn encrypt(
        &self,
        seed: &str,
        pin: &str,
        group_id: &str,
    ) -> Result<EncryptedSeedRecord, SessionError> {
        let seed = Zeroizing::new(seed.to_string());
        let pin = Zeroizing::new(pin.to_string());
        let group = group_id.to_string();
        let params = self.params;
        let record = blocking(move || seal(&seed, &pin, &group, params)).await?;

        let _guard = self.write_lock.lock().await;
        let mut records = self.records().await?;
        records.insert(group_id.to_string(), record.clone());
        write_json(&self.path, &records).await?;
        log::debug!("Stored encrypted seed for group {}", group_id);
        Ok(record)
    }

    async fn decrypt(
        &self,
        group_id: &str,
        pin: &str,
    ) -> Result<Option<Zeroizing<String>>, SessionError> {
        let Some(record) = self.records().await?.remove(group_id) else {
            return Ok(None);
        };
        let pin = Zeroizing::new(pin.to_string());
        let params = self.params;
        blocking(move || open(&record, &pin, params)).await
    }

    async fn remove(&self, group_id: &str) -> Result<(), SessionError> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.records().await?;
        if records.remove(group_id).is_some() {
            write_json(&self.path, &records).await?;
            log::info!("Removed encrypted seed for group {}", group_id);
        }
        Ok(())
    }

    async fn group_ids(&self) -> Result<Vec<String>, SessionError> {
        Ok(self.records().await?.into_keys().collect())
    }
}
