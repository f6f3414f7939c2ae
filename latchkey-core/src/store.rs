//! Persistent license cache.
//!
//! Durable key-value storage for the current license, offline token,
//! signing-key cache, and last-seen timestamp, isolated per storage
//! prefix. Entries are encrypted at rest with XChaCha20-Poly1305 under a
//! key derived from the prefix, and every write is atomic per entity
//! (temp file + rename), so a concurrent reader never observes a
//! half-written record. No validation logic lives here.

// Allow deprecated from_slice until chacha20poly1305 upgrades to generic-array 1.x
#![allow(deprecated)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use chacha20poly1305::{
    aead::{Aead, KeyInit, OsRng},
    XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::LicenseError;
use crate::token::SignedOfflineToken;
use crate::types::License;

/// XChaCha20-Poly1305 nonce size (24 bytes)
const NONCE_SIZE: usize = 24;

const ENTITY_LICENSE: &str = "license";
const ENTITY_OFFLINE_TOKEN: &str = "offline_token";
const ENTITY_PUBLIC_KEYS: &str = "public_keys";
const ENTITY_LAST_SEEN: &str = "last_seen_ts";

/// In-memory mirror of the persisted entities.
#[derive(Debug, Default)]
struct StoreState {
    license: Option<License>,
    offline_token: Option<SignedOfflineToken>,
    public_keys: HashMap<String, Vec<u8>>,
    last_seen: Option<i64>,
}

/// Storage backend for persistent cache.
struct StorageBackend {
    cache_dir: PathBuf,
}

/// Encrypted, prefix-isolated license cache.
///
/// Reads are served from the in-memory mirror; the filesystem is only
/// touched on open and on writes. Tampered or undecodable files behave
/// as absent.
pub struct CacheStore {
    /// In-memory mirror, loaded at open.
    state: RwLock<StoreState>,
    /// Storage backend (optional; `None` keeps state memory-only).
    storage: Option<StorageBackend>,
    /// Encryption key (derived from the storage prefix).
    encryption_key: [u8; 32],
}

impl CacheStore {
    /// Open a cache store for a storage prefix.
    ///
    /// # Errors
    ///
    /// Returns error if the cache directory cannot be created.
    pub fn open(prefix: &str, cache_dir: Option<PathBuf>) -> Result<Self, LicenseError> {
        let mut hasher = Sha256::new();
        hasher.update(b"latchkey-cache-key:");
        hasher.update(prefix.as_bytes());
        let encryption_key: [u8; 32] = hasher.finalize().into();

        let storage = match cache_dir {
            Some(dir) => {
                std::fs::create_dir_all(&dir).map_err(|e| LicenseError::Storage {
                    message: format!("Failed to create cache directory: {}", e),
                })?;
                Some(StorageBackend { cache_dir: dir })
            },
            None => None,
        };

        let store = Self {
            state: RwLock::new(StoreState::default()),
            storage,
            encryption_key,
        };
        store.load_all();
        Ok(store)
    }

    /// Get a copy of the cached license.
    #[must_use]
    pub fn license(&self) -> Option<License> {
        self.state.read().ok().and_then(|s| s.license.clone())
    }

    /// Replace the cached license.
    ///
    /// # Errors
    ///
    /// Returns error if the write cannot be persisted.
    pub fn set_license(&self, license: &License) -> Result<(), LicenseError> {
        self.persist(ENTITY_LICENSE, license)?;
        if let Ok(mut state) = self.state.write() {
            state.license = Some(license.clone());
        }
        Ok(())
    }

    /// Get a copy of the cached offline token.
    #[must_use]
    pub fn offline_token(&self) -> Option<SignedOfflineToken> {
        self.state.read().ok().and_then(|s| s.offline_token.clone())
    }

    /// Replace the cached offline token.
    ///
    /// # Errors
    ///
    /// Returns error if the write cannot be persisted.
    pub fn set_offline_token(&self, token: &SignedOfflineToken) -> Result<(), LicenseError> {
        self.persist(ENTITY_OFFLINE_TOKEN, token)?;
        if let Ok(mut state) = self.state.write() {
            state.offline_token = Some(token.clone());
        }
        Ok(())
    }

    /// Get the cached public key for a signing-key id.
    #[must_use]
    pub fn public_key(&self, kid: &str) -> Option<Vec<u8>> {
        self.state
            .read()
            .ok()
            .and_then(|s| s.public_keys.get(kid).cloned())
    }

    /// Cache a public key. Entries are never evicted automatically.
    ///
    /// # Errors
    ///
    /// Returns error if the write cannot be persisted.
    pub fn set_public_key(&self, kid: &str, key: &[u8]) -> Result<(), LicenseError> {
        let keys = {
            let mut state = self.state.write().map_err(|_| LicenseError::Storage {
                message: "Cache state lock poisoned".into(),
            })?;
            state.public_keys.insert(kid.to_string(), key.to_vec());
            state.public_keys.clone()
        };
        self.persist(ENTITY_PUBLIC_KEYS, &keys)
    }

    /// Get the last-seen timestamp (Unix seconds).
    #[must_use]
    pub fn last_seen(&self) -> Option<i64> {
        self.state.read().ok().and_then(|s| s.last_seen)
    }

    /// Record the last time liveness was proven with the server.
    ///
    /// Monotonic non-decreasing under normal operation; the verifier
    /// reads it for clock-tamper detection.
    ///
    /// # Errors
    ///
    /// Returns error if the write cannot be persisted.
    pub fn set_last_seen(&self, ts: i64) -> Result<(), LicenseError> {
        self.persist(ENTITY_LAST_SEEN, &ts)?;
        if let Ok(mut state) = self.state.write() {
            state.last_seen = Some(ts);
        }
        Ok(())
    }

    /// Remove everything stored under this prefix.
    pub fn clear(&self) {
        if let Ok(mut state) = self.state.write() {
            *state = StoreState::default();
        }

        if let Some(ref storage) = self.storage {
            for entity in [
                ENTITY_LICENSE,
                ENTITY_OFFLINE_TOKEN,
                ENTITY_PUBLIC_KEYS,
                ENTITY_LAST_SEEN,
            ] {
                let path = storage.entity_path(entity, &self.encryption_key);
                let _ = std::fs::remove_file(path);
            }
        }
    }

    /// Load all entities from disk into the mirror.
    fn load_all(&self) {
        let Some(ref storage) = self.storage else {
            return;
        };

        let license: Option<License> = self.read_entity(storage, ENTITY_LICENSE);
        let token: Option<SignedOfflineToken> = self.read_entity(storage, ENTITY_OFFLINE_TOKEN);
        let keys: Option<HashMap<String, Vec<u8>>> = self.read_entity(storage, ENTITY_PUBLIC_KEYS);
        let last_seen: Option<i64> = self.read_entity(storage, ENTITY_LAST_SEEN);

        debug!(
            has_license = license.is_some(),
            has_token = token.is_some(),
            key_count = keys.as_ref().map_or(0, HashMap::len),
            "Cache: loaded persisted state"
        );

        if let Ok(mut state) = self.state.write() {
            state.license = license;
            state.offline_token = token;
            state.public_keys = keys.unwrap_or_default();
            state.last_seen = last_seen;
        }
    }

    /// Read and decrypt one entity. Missing, tampered, or undecodable
    /// files all behave as absent.
    fn read_entity<T: DeserializeOwned>(&self, storage: &StorageBackend, entity: &str) -> Option<T> {
        let path = storage.entity_path(entity, &self.encryption_key);
        let encrypted = std::fs::read(&path).ok()?;

        let decrypted = match self.decrypt(&encrypted) {
            Some(d) => d,
            None => {
                warn!(entity = entity, "Cache: entry undecryptable (possibly tampered), treating as absent");
                return None;
            },
        };

        match serde_json::from_slice(&decrypted) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(entity = entity, error = %e, "Cache: failed to parse entry");
                None
            },
        }
    }

    /// Encrypt and atomically write one entity.
    fn persist<T: Serialize>(&self, entity: &str, value: &T) -> Result<(), LicenseError> {
        let Some(ref storage) = self.storage else {
            return Ok(());
        };

        let data = serde_json::to_vec(value).map_err(|e| LicenseError::Storage {
            message: format!("Failed to serialize {}: {}", entity, e),
        })?;

        let encrypted = self.encrypt(&data).ok_or_else(|| LicenseError::Storage {
            message: format!("Failed to encrypt {}", entity),
        })?;

        let path = storage.entity_path(entity, &self.encryption_key);
        let tmp = path.with_extension("tmp");

        std::fs::write(&tmp, &encrypted).map_err(|e| LicenseError::Storage {
            message: format!("Failed to write {}: {}", entity, e),
        })?;
        std::fs::rename(&tmp, &path).map_err(|e| LicenseError::Storage {
            message: format!("Failed to commit {}: {}", entity, e),
        })?;

        Ok(())
    }

    /// Encrypt data using XChaCha20-Poly1305 authenticated encryption.
    ///
    /// Returns nonce || ciphertext (24 bytes nonce prepended to ciphertext).
    fn encrypt(&self, plaintext: &[u8]) -> Option<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = XNonce::from_slice(&nonce_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(&self.encryption_key).ok()?;
        let ciphertext = cipher.encrypt(nonce, plaintext).ok()?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend_from_slice(&ciphertext);
        Some(result)
    }

    /// Decrypt data using XChaCha20-Poly1305 authenticated encryption.
    ///
    /// Expects nonce || ciphertext format.
    fn decrypt(&self, data: &[u8]) -> Option<Vec<u8>> {
        if data.len() < NONCE_SIZE {
            return None;
        }

        let (nonce_bytes, ciphertext) = data.split_at(NONCE_SIZE);
        let nonce = XNonce::from_slice(nonce_bytes);

        let cipher = XChaCha20Poly1305::new_from_slice(&self.encryption_key).ok()?;
        cipher.decrypt(nonce, ciphertext).ok()
    }
}

impl StorageBackend {
    /// File path for an entity. The filename hashes the encryption key
    /// with the entity name, which also keeps prefixes in a shared
    /// directory from colliding.
    fn entity_path(&self, entity: &str, key: &[u8; 32]) -> PathBuf {
        let mut hasher = Sha256::new();
        hasher.update(key);
        hasher.update(entity.as_bytes());
        let hash = hex::encode(&hasher.finalize()[..16]);

        self.cache_dir.join(format!("{}.cache", hash))
    }
}
