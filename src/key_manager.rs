//! Lifecycle of a device's own key material.
//!
//! Generates, stores (encrypted under the master key), publishes and retires
//! the identity key, signed prekeys and one-time prekeys.
//!
//! One-time prekey consumption follows a write-ahead scheme with the
//! directory as the authority:
//!
//! 1. `reserve_one_time_prekey` takes an in-memory reservation so no other
//!    handshake can use the key; dropping the reservation releases it.
//! 2. `OneTimePrekeyReservation::commit` persists `PendingConsumption`, then
//!    calls `mark_prekey_consumed` on the directory.
//! 3. Only once the directory acknowledges is the private key deleted. If it
//!    does not, the key stays parked (never reusable) until
//!    `retry_pending_consumptions` succeeds.

use crate::address::DeviceAddress;
use crate::audit::{AuditEvent, AuditSink, Auditor};
use crate::clock::Clock;
use crate::config::E2eeConfig;
use crate::directory::{Directory, SignedPrekeyPublic};
use crate::error::{Error, Result};
use crate::keys::{IdentityKeyPair, KeyPair, MasterKey, PublicKey, Signature};
use crate::store::{EncryptedKeyStore, KeyScope};
use crate::x3dh::sign_prekey;

use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

const IDENTITY_ID: &str = "self";
const INDEX_ID: &str = "index";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrekeyStatus {
    Available,
    /// Used by a completed handshake; the directory has not acknowledged it.
    PendingConsumption,
}

/// Encrypted bookkeeping of which prekeys exist and their state.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PrekeyIndex {
    next_signed_prekey_id: u32,
    active_signed_prekey: u32,
    active_created_at: i64,
    /// Generated and being published, not yet active
    pending_signed_prekey: Option<u32>,
    /// Retired signed prekey id to retirement time
    retired_signed_prekeys: BTreeMap<u32, i64>,
    next_one_time_prekey_id: u32,
    one_time_prekeys: BTreeMap<u32, PrekeyStatus>,
}

#[derive(Clone, Serialize, Deserialize)]
struct StoredSignedPrekey {
    key: KeyPair,
    signature: Signature,
    created_at: i64,
}

/// Manages the local device's keys.
pub struct KeyManager {
    device: DeviceAddress,
    store: EncryptedKeyStore,
    directory: Arc<dyn Directory>,
    config: Arc<E2eeConfig>,
    clock: Arc<dyn Clock>,
    auditor: Auditor,
    /// Serializes read-modify-write of the prekey index
    index_lock: tokio::sync::Mutex<()>,
    /// Serializes operations that publish to the directory
    publish_lock: tokio::sync::Mutex<()>,
    reserved: Mutex<HashSet<u32>>,
}

impl KeyManager {
    pub fn new(
        store: EncryptedKeyStore,
        directory: Arc<dyn Directory>,
        config: Arc<E2eeConfig>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let device = store.owner().clone();
        Self {
            auditor: Auditor::new(device.clone(), audit, clock.clone()),
            device,
            store,
            directory,
            config,
            clock,
            index_lock: tokio::sync::Mutex::new(()),
            publish_lock: tokio::sync::Mutex::new(()),
            reserved: Mutex::new(HashSet::new()),
        }
    }

    #[must_use]
    pub fn device(&self) -> &DeviceAddress {
        &self.device
    }

    /// Whether an identity record exists for this device.
    pub fn is_initialized(&self) -> Result<bool> {
        self.store.contains(KeyScope::Identity, IDENTITY_ID)
    }

    /// Generates the identity key, one signed prekey and a batch of one-time
    /// prekeys, stores the private halves and publishes the public halves.
    ///
    /// Fails with `AlreadyInitialized` when an identity exists. If publishing
    /// fails, local records are removed again so the call can be retried.
    pub async fn initialize_device(&self, master: &MasterKey) -> Result<PublicKey> {
        let _publish = self.publish_lock.lock().await;
        let _index = self.index_lock.lock().await;

        if self.is_initialized()? {
            return Err(Error::AlreadyInitialized);
        }

        let now = self.clock.now();
        let identity = IdentityKeyPair::generate(&mut OsRng);
        let identity_key = identity.public_key();
        self.store
            .put_record(KeyScope::Identity, IDENTITY_ID, &identity, master.as_key())?;

        let result = async {
            let signed = self.create_signed_prekey(master, &identity, 1, now)?;
            let batch = self.config.one_time_prekey_batch;
            let one_time_prekeys = self.create_one_time_prekeys(master, 1, batch)?;

            let index = PrekeyIndex {
                next_signed_prekey_id: 2,
                active_signed_prekey: 1,
                active_created_at: now,
                pending_signed_prekey: None,
                retired_signed_prekeys: BTreeMap::new(),
                next_one_time_prekey_id: batch + 1,
                one_time_prekeys: one_time_prekeys
                    .iter()
                    .map(|(id, _)| (*id, PrekeyStatus::Available))
                    .collect(),
            };
            self.save_index(master, &index)?;

            self.directory
                .publish_bundle(&self.device, identity_key, signed, one_time_prekeys)
                .await
        }
        .await;

        if let Err(e) = result {
            warn!(device = %self.device, error = %e, "device initialization failed, rolling back");
            self.wipe()?;
            return Err(e);
        }

        info!(
            device = %self.device,
            identity = %identity_key.short_id(),
            one_time_prekeys = self.config.one_time_prekey_batch,
            "device initialized"
        );
        self.auditor.emit(AuditEvent::IdentityCreated {
            identity: identity_key.short_id(),
        });
        self.auditor.emit(AuditEvent::SignedPrekeyCreated { id: 1 });
        self.auditor.emit(AuditEvent::OneTimePrekeysGenerated {
            first_id: 1,
            count: self.config.one_time_prekey_batch,
        });
        Ok(identity_key)
    }

    /// Removes every key record owned by this manager.
    pub fn wipe(&self) -> Result<()> {
        for scope in [
            KeyScope::Identity,
            KeyScope::SignedPrekey,
            KeyScope::OneTimePrekey,
            KeyScope::PrekeyIndex,
        ] {
            self.store.clear(scope)?;
        }
        Ok(())
    }

    /// The identity key pair; `NotInitialized` when absent.
    pub fn identity(&self, master: &MasterKey) -> Result<IdentityKeyPair> {
        match self
            .store
            .get_record(KeyScope::Identity, IDENTITY_ID, master.as_key())
        {
            Err(Error::NotFound) => Err(Error::NotInitialized),
            other => other,
        }
    }

    /// Generates, signs and publishes a new signed prekey, retires the
    /// previous one and purges retired prekeys past the grace window.
    ///
    /// Returns the new prekey id.
    pub async fn rotate_signed_prekey(&self, master: &MasterKey) -> Result<u32> {
        let _publish = self.publish_lock.lock().await;
        let identity = self.identity(master)?;
        let now = self.clock.now();

        let (id, signed) = {
            let _index = self.index_lock.lock().await;
            let mut index = self.load_index(master)?;
            let id = index.next_signed_prekey_id;
            index.next_signed_prekey_id = id.checked_add(1).ok_or(Error::CryptoError)?;
            let signed = self.create_signed_prekey(master, &identity, id, now)?;
            index.pending_signed_prekey = Some(id);
            self.save_index(master, &index)?;
            (id, signed)
        };

        if let Err(e) = self
            .directory
            .publish_bundle(&self.device, identity.public_key(), signed, Vec::new())
            .await
        {
            warn!(device = %self.device, signed_prekey_id = id, error = %e, "signed prekey publish failed");
            let _index = self.index_lock.lock().await;
            let mut index = self.load_index(master)?;
            index.pending_signed_prekey = None;
            self.save_index(master, &index)?;
            self.store.delete(KeyScope::SignedPrekey, &id.to_string())?;
            return Err(e);
        }

        let (previous, purged) = {
            let _index = self.index_lock.lock().await;
            let mut index = self.load_index(master)?;
            let previous = index.active_signed_prekey;
            index.retired_signed_prekeys.insert(previous, now);
            index.active_signed_prekey = id;
            index.active_created_at = now;
            index.pending_signed_prekey = None;
            let purged = self.purge_expired(&mut index, now)?;
            self.save_index(master, &index)?;
            (previous, purged)
        };

        info!(device = %self.device, previous, current = id, purged = purged.len(), "signed prekey rotated");
        self.auditor.emit(AuditEvent::SignedPrekeyCreated { id });
        self.auditor.emit(AuditEvent::SignedPrekeyRotated {
            previous: Some(previous),
            current: id,
        });
        for id in purged {
            self.auditor.emit(AuditEvent::SignedPrekeyPurged { id });
        }
        Ok(id)
    }

    /// Deletes retired signed prekeys whose grace window has closed.
    ///
    /// Returns the number purged.
    pub async fn purge_retired_signed_prekeys(&self, master: &MasterKey) -> Result<usize> {
        let purged = {
            let _index = self.index_lock.lock().await;
            let mut index = self.load_index(master)?;
            let purged = self.purge_expired(&mut index, self.clock.now())?;
            if !purged.is_empty() {
                self.save_index(master, &index)?;
            }
            purged
        };

        if !purged.is_empty() {
            info!(device = %self.device, purged = purged.len(), "retired signed prekeys purged");
        }
        for id in &purged {
            self.auditor.emit(AuditEvent::SignedPrekeyPurged { id: *id });
        }
        Ok(purged.len())
    }

    /// Whether the active signed prekey is older than the rotation period.
    pub async fn rotation_due(&self, master: &MasterKey) -> Result<bool> {
        let _index = self.index_lock.lock().await;
        let index = self.load_index(master)?;
        Ok(self.clock.now() - index.active_created_at >= self.config.signed_prekey_rotation_secs)
    }

    /// Tops the published pool back up to `target` when the directory
    /// reports fewer than the low watermark. Existing prekeys are never
    /// regenerated; new ones get fresh ids.
    ///
    /// Returns the number generated.
    pub async fn replenish_one_time_prekeys(&self, master: &MasterKey, target: u32) -> Result<u32> {
        let _publish = self.publish_lock.lock().await;

        let remaining = self.directory.remaining_one_time_prekeys(&self.device).await?;
        let remaining = u32::try_from(remaining).unwrap_or(u32::MAX);
        if remaining >= self.config.one_time_prekey_low_watermark {
            debug!(device = %self.device, remaining, "one-time prekey pool healthy");
            return Ok(0);
        }
        let count = target.saturating_sub(remaining);
        if count == 0 {
            return Ok(0);
        }

        let identity = self.identity(master)?;
        let (first_id, fresh, signed) = {
            let _index = self.index_lock.lock().await;
            let mut index = self.load_index(master)?;
            let first_id = index.next_one_time_prekey_id;
            index.next_one_time_prekey_id = first_id.checked_add(count).ok_or(Error::CryptoError)?;

            let fresh = self.create_one_time_prekeys(master, first_id, count)?;
            for (id, _) in &fresh {
                index.one_time_prekeys.insert(*id, PrekeyStatus::Available);
            }
            self.save_index(master, &index)?;
            let signed = self.signed_prekey_public(master, index.active_signed_prekey)?;
            (first_id, fresh, signed)
        };

        let ids: Vec<u32> = fresh.iter().map(|(id, _)| *id).collect();
        if let Err(e) = self
            .directory
            .publish_bundle(&self.device, identity.public_key(), signed, fresh)
            .await
        {
            warn!(device = %self.device, error = %e, "one-time prekey publish failed");
            let _index = self.index_lock.lock().await;
            let mut index = self.load_index(master)?;
            for id in &ids {
                index.one_time_prekeys.remove(id);
                self.store.delete(KeyScope::OneTimePrekey, &id.to_string())?;
            }
            self.save_index(master, &index)?;
            return Err(e);
        }

        info!(device = %self.device, remaining, generated = count, "one-time prekeys replenished");
        self.auditor
            .emit(AuditEvent::OneTimePrekeysGenerated { first_id, count });
        Ok(count)
    }

    /// Signed prekey pair by id: the active one, one being published, or a
    /// retired one still inside the grace window. Anything else is
    /// `HandshakeFailed`.
    pub async fn signed_prekey(&self, master: &MasterKey, id: u32) -> Result<KeyPair> {
        let _index = self.index_lock.lock().await;
        let index = self.load_index(master)?;

        let usable = index.active_signed_prekey == id
            || index.pending_signed_prekey == Some(id)
            || index
                .retired_signed_prekeys
                .get(&id)
                .is_some_and(|retired_at| {
                    self.clock.now() - retired_at < self.config.signed_prekey_grace_secs
                });
        if !usable {
            debug!(device = %self.device, signed_prekey_id = id, "unknown or expired signed prekey");
            return Err(Error::HandshakeFailed);
        }

        let stored: StoredSignedPrekey = self
            .store
            .get_record(KeyScope::SignedPrekey, &id.to_string(), master.as_key())
            .map_err(|e| match e {
                Error::NotFound => Error::HandshakeFailed,
                other => other,
            })?;
        Ok(stored.key)
    }

    /// Reserves an available one-time prekey for an in-flight handshake.
    ///
    /// `OneTimePrekeyUnavailable` if it is unknown, pending consumption or
    /// already reserved.
    pub async fn reserve_one_time_prekey(
        &self,
        master: &MasterKey,
        id: u32,
    ) -> Result<OneTimePrekeyReservation<'_>> {
        let _index = self.index_lock.lock().await;
        let index = self.load_index(master)?;
        if index.one_time_prekeys.get(&id) != Some(&PrekeyStatus::Available) {
            return Err(Error::OneTimePrekeyUnavailable);
        }

        let key_pair: KeyPair = self
            .store
            .get_record(KeyScope::OneTimePrekey, &id.to_string(), master.as_key())
            .map_err(|e| match e {
                Error::NotFound => Error::OneTimePrekeyUnavailable,
                other => other,
            })?;

        if !self.reserved()?.insert(id) {
            return Err(Error::OneTimePrekeyUnavailable);
        }
        Ok(OneTimePrekeyReservation {
            manager: self,
            id,
            key_pair,
        })
    }

    /// Reserves and immediately commits consumption of a one-time prekey.
    pub async fn consume_one_time_prekey(&self, master: &MasterKey, id: u32) -> Result<()> {
        self.reserve_one_time_prekey(master, id)
            .await?
            .commit(master)
            .await
    }

    /// Re-attempts directory acknowledgement for parked prekeys.
    ///
    /// Returns how many were completed; stops at the first directory error.
    pub async fn retry_pending_consumptions(&self, master: &MasterKey) -> Result<usize> {
        let pending = self.pending_consumptions(master).await?;
        let mut completed = 0;
        for id in pending {
            if let Err(e) = self.directory.mark_prekey_consumed(&self.device, id).await {
                warn!(device = %self.device, prekey_id = id, error = %e, "pending consumption still unacknowledged");
                break;
            }
            self.forget_one_time_prekey(master, id).await?;
            self.auditor.emit(AuditEvent::OneTimePrekeyConsumed { id });
            completed += 1;
        }
        if completed > 0 {
            info!(device = %self.device, completed, "pending prekey consumptions completed");
        }
        Ok(completed)
    }

    /// Ids parked in `PendingConsumption`.
    pub async fn pending_consumptions(&self, master: &MasterKey) -> Result<Vec<u32>> {
        let _index = self.index_lock.lock().await;
        let index = self.load_index(master)?;
        Ok(index
            .one_time_prekeys
            .iter()
            .filter(|(_, status)| **status == PrekeyStatus::PendingConsumption)
            .map(|(id, _)| *id)
            .collect())
    }

    /// Local state of a one-time prekey; `None` once fully consumed.
    pub async fn one_time_prekey_status(&self, master: &MasterKey, id: u32) -> Result<Option<PrekeyStatus>> {
        let _index = self.index_lock.lock().await;
        Ok(self.load_index(master)?.one_time_prekeys.get(&id).copied())
    }

    /// Number of one-time prekeys held locally in any state.
    pub async fn local_one_time_prekey_count(&self, master: &MasterKey) -> Result<usize> {
        let _index = self.index_lock.lock().await;
        Ok(self.load_index(master)?.one_time_prekeys.len())
    }

    pub async fn active_signed_prekey_id(&self, master: &MasterKey) -> Result<u32> {
        let _index = self.index_lock.lock().await;
        Ok(self.load_index(master)?.active_signed_prekey)
    }

    async fn commit_consumption(&self, master: &MasterKey, id: u32) -> Result<()> {
        {
            let _index = self.index_lock.lock().await;
            let mut index = self.load_index(master)?;
            index
                .one_time_prekeys
                .insert(id, PrekeyStatus::PendingConsumption);
            self.save_index(master, &index)?;
        }

        match self.directory.mark_prekey_consumed(&self.device, id).await {
            Ok(()) => {
                self.forget_one_time_prekey(master, id).await?;
                debug!(device = %self.device, prekey_id = id, "one-time prekey consumed");
                self.auditor.emit(AuditEvent::OneTimePrekeyConsumed { id });
                Ok(())
            }
            Err(e) => {
                warn!(device = %self.device, prekey_id = id, error = %e, "prekey consumption deferred");
                self.auditor
                    .emit(AuditEvent::OneTimePrekeyConsumptionDeferred { id });
                Err(Error::HandshakeFailed)
            }
        }
    }

    async fn forget_one_time_prekey(&self, master: &MasterKey, id: u32) -> Result<()> {
        let _index = self.index_lock.lock().await;
        self.store.delete(KeyScope::OneTimePrekey, &id.to_string())?;
        let mut index = self.load_index(master)?;
        index.one_time_prekeys.remove(&id);
        self.save_index(master, &index)
    }

    fn create_signed_prekey(
        &self,
        master: &MasterKey,
        identity: &IdentityKeyPair,
        id: u32,
        now: i64,
    ) -> Result<SignedPrekeyPublic> {
        let key = KeyPair::generate(&mut OsRng);
        let signature = sign_prekey(&mut OsRng, identity, &key.public_key())?;
        let public = SignedPrekeyPublic {
            id,
            key: key.public_key(),
            signature,
        };
        let stored = StoredSignedPrekey {
            key,
            signature,
            created_at: now,
        };
        self.store
            .put_record(KeyScope::SignedPrekey, &id.to_string(), &stored, master.as_key())?;
        Ok(public)
    }

    fn signed_prekey_public(&self, master: &MasterKey, id: u32) -> Result<SignedPrekeyPublic> {
        let stored: StoredSignedPrekey =
            self.store
                .get_record(KeyScope::SignedPrekey, &id.to_string(), master.as_key())?;
        debug!(device = %self.device, signed_prekey_id = id, created_at = stored.created_at, "loaded signed prekey");
        Ok(SignedPrekeyPublic {
            id,
            key: stored.key.public_key(),
            signature: stored.signature,
        })
    }

    fn create_one_time_prekeys(
        &self,
        master: &MasterKey,
        first_id: u32,
        count: u32,
    ) -> Result<Vec<(u32, PublicKey)>> {
        (0..count)
            .map(|offset| {
                let id = first_id.checked_add(offset).ok_or(Error::CryptoError)?;
                let key = KeyPair::generate(&mut OsRng);
                self.store
                    .put_record(KeyScope::OneTimePrekey, &id.to_string(), &key, master.as_key())?;
                Ok((id, key.public_key()))
            })
            .collect()
    }

    fn load_index(&self, master: &MasterKey) -> Result<PrekeyIndex> {
        match self
            .store
            .get_record(KeyScope::PrekeyIndex, INDEX_ID, master.as_key())
        {
            Err(Error::NotFound) => Err(Error::NotInitialized),
            other => other,
        }
    }

    fn save_index(&self, master: &MasterKey, index: &PrekeyIndex) -> Result<()> {
        self.store
            .put_record(KeyScope::PrekeyIndex, INDEX_ID, index, master.as_key())
    }

    /// Drops retired signed prekeys at or past the grace window from
    /// `index` and deletes their records. Caller holds the index lock.
    fn purge_expired(&self, index: &mut PrekeyIndex, now: i64) -> Result<Vec<u32>> {
        let grace = self.config.signed_prekey_grace_secs;
        let purged: Vec<u32> = index
            .retired_signed_prekeys
            .iter()
            .filter(|(_, retired_at)| now - **retired_at >= grace)
            .map(|(id, _)| *id)
            .collect();
        for id in &purged {
            index.retired_signed_prekeys.remove(id);
            self.store.delete(KeyScope::SignedPrekey, &id.to_string())?;
        }
        Ok(purged)
    }

    fn reserved(&self) -> Result<MutexGuard<'_, HashSet<u32>>> {
        self.reserved
            .lock()
            .map_err(|_| Error::Storage("reservation mutex poisoned".into()))
    }

    fn release(&self, id: u32) {
        if let Ok(mut reserved) = self.reserved() {
            reserved.remove(&id);
        }
    }
}

impl std::fmt::Debug for KeyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyManager")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// A one-time prekey held for one handshake.
///
/// Dropping it without [`commit`](Self::commit) makes the key available
/// again.
pub struct OneTimePrekeyReservation<'a> {
    manager: &'a KeyManager,
    id: u32,
    key_pair: KeyPair,
}

impl OneTimePrekeyReservation<'_> {
    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    /// Marks the prekey consumed: locally parked first, then acknowledged
    /// by the directory, then deleted.
    ///
    /// `HandshakeFailed` if the directory call fails; the key then stays
    /// parked and is never handed to another handshake.
    pub async fn commit(self, master: &MasterKey) -> Result<()> {
        self.manager.commit_consumption(master, self.id).await
    }
}

impl Drop for OneTimePrekeyReservation<'_> {
    fn drop(&mut self) {
        self.manager.release(self.id);
    }
}

impl std::fmt::Debug for OneTimePrekeyReservation<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OneTimePrekeyReservation")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}
