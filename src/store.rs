//! Encrypted at-rest storage for key material and session state.
//!
//! [`BlobStore`] is the persistence seam: an opaque byte store scoped by the
//! owning device. [`EncryptedKeyStore`] layers AES-256-GCM on top, binding
//! each ciphertext to its `(owner, scope, id)` slot so records cannot be
//! swapped between slots.

use crate::address::DeviceAddress;
use crate::error::{Error, Result};
use crate::primitives::{aead_encrypt, SealedBox, SymmetricKey};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

/// Logical namespace of a stored record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyScope {
    Identity,
    SignedPrekey,
    OneTimePrekey,
    PrekeyIndex,
    Session,
    SafetyNumber,
    /// Non-secret vault parameters (salt, verification tag, wrapped key)
    Vault,
}

impl KeyScope {
    pub const ALL: [KeyScope; 7] = [
        KeyScope::Identity,
        KeyScope::SignedPrekey,
        KeyScope::OneTimePrekey,
        KeyScope::PrekeyIndex,
        KeyScope::Session,
        KeyScope::SafetyNumber,
        KeyScope::Vault,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            KeyScope::Identity => "identity",
            KeyScope::SignedPrekey => "signed_prekey",
            KeyScope::OneTimePrekey => "one_time_prekey",
            KeyScope::PrekeyIndex => "prekey_index",
            KeyScope::Session => "session",
            KeyScope::SafetyNumber => "safety_number",
            KeyScope::Vault => "vault",
        }
    }
}

/// Persistent byte store, scoped by the owning device.
///
/// Implementations must be thread-safe and make a single `put` atomic with
/// respect to concurrent `get` on the same slot.
pub trait BlobStore: Send + Sync {
    fn get(&self, owner: &DeviceAddress, scope: KeyScope, id: &str) -> Result<Option<Vec<u8>>>;

    /// Replaces any existing value.
    fn put(&self, owner: &DeviceAddress, scope: KeyScope, id: &str, bytes: Vec<u8>) -> Result<()>;

    /// Removes the value; absent slots are not an error.
    fn delete(&self, owner: &DeviceAddress, scope: KeyScope, id: &str) -> Result<()>;

    /// Ids present in `scope`, in no particular order.
    fn list(&self, owner: &DeviceAddress, scope: KeyScope) -> Result<Vec<String>>;
}

type Slot = (DeviceAddress, KeyScope, String);

/// Thread-safe in-memory blob store.
///
/// Cloning shares the underlying map, which lets tests simulate a fresh
/// install reading the same storage.
#[derive(Clone, Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: Arc<Mutex<HashMap<Slot, Vec<u8>>>>,
}

impl InMemoryBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored blobs across all owners.
    pub fn len(&self) -> Result<usize> {
        Ok(self.lock()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.lock()?.is_empty())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<Slot, Vec<u8>>>> {
        self.blobs
            .lock()
            .map_err(|_| Error::Storage("blob store mutex poisoned".into()))
    }
}

impl BlobStore for InMemoryBlobStore {
    fn get(&self, owner: &DeviceAddress, scope: KeyScope, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .lock()?
            .get(&(owner.clone(), scope, id.to_owned()))
            .cloned())
    }

    fn put(&self, owner: &DeviceAddress, scope: KeyScope, id: &str, bytes: Vec<u8>) -> Result<()> {
        self.lock()?
            .insert((owner.clone(), scope, id.to_owned()), bytes);
        Ok(())
    }

    fn delete(&self, owner: &DeviceAddress, scope: KeyScope, id: &str) -> Result<()> {
        self.lock()?.remove(&(owner.clone(), scope, id.to_owned()));
        Ok(())
    }

    fn list(&self, owner: &DeviceAddress, scope: KeyScope) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .keys()
            .filter(|(o, s, _)| o == owner && *s == scope)
            .map(|(_, _, id)| id.clone())
            .collect())
    }
}

/// Encrypts records before handing them to a [`BlobStore`].
#[derive(Clone)]
pub struct EncryptedKeyStore {
    owner: DeviceAddress,
    blobs: Arc<dyn BlobStore>,
}

impl EncryptedKeyStore {
    pub fn new(owner: DeviceAddress, blobs: Arc<dyn BlobStore>) -> Self {
        Self { owner, blobs }
    }

    #[must_use]
    pub fn owner(&self) -> &DeviceAddress {
        &self.owner
    }

    /// Encrypts `plaintext` under `key` and stores it at `(scope, id)`.
    pub fn put(&self, scope: KeyScope, id: &str, plaintext: &[u8], key: &SymmetricKey) -> Result<()> {
        let ad = self.record_ad(scope, id);
        let sealed = aead_encrypt(key, plaintext, Some(&ad))?;
        self.blobs.put(&self.owner, scope, id, sealed.to_bytes())
    }

    /// Decrypts the record at `(scope, id)`.
    ///
    /// `NotFound` when absent; `AuthenticationFailed` for a wrong key or a
    /// corrupted or relocated record.
    pub fn get(&self, scope: KeyScope, id: &str, key: &SymmetricKey) -> Result<Zeroizing<Vec<u8>>> {
        let bytes = self
            .blobs
            .get(&self.owner, scope, id)?
            .ok_or(Error::NotFound)?;
        let sealed = SealedBox::from_bytes(&bytes)?;
        sealed.open(key, Some(&self.record_ad(scope, id)))
    }

    /// Idempotent.
    pub fn delete(&self, scope: KeyScope, id: &str) -> Result<()> {
        self.blobs.delete(&self.owner, scope, id)
    }

    pub fn list(&self, scope: KeyScope) -> Result<Vec<String>> {
        self.blobs.list(&self.owner, scope)
    }

    pub fn contains(&self, scope: KeyScope, id: &str) -> Result<bool> {
        Ok(self.blobs.get(&self.owner, scope, id)?.is_some())
    }

    /// Deletes every record in `scope`.
    pub fn clear(&self, scope: KeyScope) -> Result<()> {
        for id in self.list(scope)? {
            self.delete(scope, &id)?;
        }
        Ok(())
    }

    /// Serializes `value` with bincode and stores it encrypted.
    pub fn put_record<T: Serialize>(
        &self,
        scope: KeyScope,
        id: &str,
        value: &T,
        key: &SymmetricKey,
    ) -> Result<()> {
        let bytes = encode(value)?;
        self.put(scope, id, &bytes, key)
    }

    pub fn get_record<T: DeserializeOwned>(
        &self,
        scope: KeyScope,
        id: &str,
        key: &SymmetricKey,
    ) -> Result<T> {
        let bytes = self.get(scope, id, key)?;
        decode(&bytes)
    }

    /// Like [`get_record`](Self::get_record) but maps `NotFound` to `None`.
    pub fn find_record<T: DeserializeOwned>(
        &self,
        scope: KeyScope,
        id: &str,
        key: &SymmetricKey,
    ) -> Result<Option<T>> {
        match self.get_record(scope, id, key) {
            Ok(value) => Ok(Some(value)),
            Err(Error::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Stores a non-secret record in the clear.
    pub fn put_public<T: Serialize>(&self, scope: KeyScope, id: &str, value: &T) -> Result<()> {
        let bytes = encode(value)?;
        self.blobs.put(&self.owner, scope, id, bytes.to_vec())
    }

    pub fn get_public<T: DeserializeOwned>(&self, scope: KeyScope, id: &str) -> Result<Option<T>> {
        self.blobs
            .get(&self.owner, scope, id)?
            .map(|bytes| decode(&bytes))
            .transpose()
    }

    fn record_ad(&self, scope: KeyScope, id: &str) -> Vec<u8> {
        let mut ad = Vec::with_capacity(64 + id.len());
        ad.extend_from_slice(b"e2ee-record-v1");
        ad.extend_from_slice(&(self.owner.user_id.len() as u64).to_be_bytes());
        ad.extend_from_slice(self.owner.user_id.as_bytes());
        ad.extend_from_slice(&self.owner.device_id.to_be_bytes());
        ad.extend_from_slice(scope.as_str().as_bytes());
        ad.push(0);
        ad.extend_from_slice(id.as_bytes());
        ad
    }
}

impl std::fmt::Debug for EncryptedKeyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedKeyStore")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Zeroizing<Vec<u8>>> {
    Ok(Zeroizing::new(bincode::serde::encode_to_vec(
        value,
        bincode::config::standard(),
    )?))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    let (value, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())?;
    Ok(value)
}
