//! Directory service seam: where devices publish and fetch prekey bundles.
//!
//! The directory is authoritative for one-time prekey consumption. Each
//! `fetch_bundle` hands out at most one one-time prekey and never hands the
//! same one out twice.

use crate::address::DeviceAddress;
use crate::error::{Error, Result};
use crate::keys::{PublicKey, Signature};
use crate::x3dh::PreKeyBundle;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Public half of a signed prekey as published.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPrekeyPublic {
    pub id: u32,
    pub key: PublicKey,
    pub signature: Signature,
}

#[async_trait]
pub trait Directory: Send + Sync {
    /// Publishes the device's identity and active signed prekey, and adds
    /// `one_time_prekeys` to its pool.
    ///
    /// The signed prekey is last-write-wins. A changed identity key discards
    /// one-time prekeys published under the previous identity.
    async fn publish_bundle(
        &self,
        device: &DeviceAddress,
        identity_key: PublicKey,
        signed_prekey: SignedPrekeyPublic,
        one_time_prekeys: Vec<(u32, PublicKey)>,
    ) -> Result<()>;

    /// Returns the peer's bundle with at most one one-time prekey, which is
    /// removed from the pool as part of the fetch.
    async fn fetch_bundle(&self, peer: &DeviceAddress) -> Result<PreKeyBundle>;

    /// Acknowledges that the device used one of its one-time prekeys.
    /// Idempotent.
    async fn mark_prekey_consumed(&self, device: &DeviceAddress, prekey_id: u32) -> Result<()>;

    /// One-time prekeys still available to hand out.
    async fn remaining_one_time_prekeys(&self, device: &DeviceAddress) -> Result<usize>;

    /// The peer's identity key without touching its prekey pool.
    async fn fetch_identity_key(&self, peer: &DeviceAddress) -> Result<PublicKey>;
}

#[derive(Debug)]
struct DeviceEntry {
    identity_key: PublicKey,
    signed_prekey: SignedPrekeyPublic,
    available: BTreeMap<u32, PublicKey>,
    handed_out: BTreeSet<u32>,
    consumed: BTreeSet<u32>,
}

/// In-memory directory for tests and single-process embedding.
///
/// Carries switches to simulate network failures and latency.
#[derive(Debug, Default)]
pub struct InMemoryDirectory {
    devices: Mutex<HashMap<DeviceAddress, DeviceEntry>>,
    fetches: AtomicUsize,
    fail_fetch: AtomicBool,
    fail_mark_consumed: AtomicBool,
    fetch_delay_ms: AtomicUsize,
}

impl InMemoryDirectory {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes `fetch_bundle` fail with a directory error.
    pub fn set_fail_fetch(&self, fail: bool) {
        self.fail_fetch.store(fail, Ordering::SeqCst);
    }

    /// Makes `mark_prekey_consumed` fail with a directory error.
    pub fn set_fail_mark_consumed(&self, fail: bool) {
        self.fail_mark_consumed.store(fail, Ordering::SeqCst);
    }

    /// Adds latency before `fetch_bundle` answers.
    pub fn set_fetch_delay(&self, delay: Duration) {
        let ms = usize::try_from(delay.as_millis()).unwrap_or(usize::MAX);
        self.fetch_delay_ms.store(ms, Ordering::SeqCst);
    }

    /// Number of `fetch_bundle` calls that returned a bundle.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Prekey ids the device acknowledged as consumed.
    pub fn consumed_prekeys(&self, device: &DeviceAddress) -> Result<Vec<u32>> {
        Ok(self
            .lock()?
            .get(device)
            .map(|e| e.consumed.iter().copied().collect())
            .unwrap_or_default())
    }

    /// Active signed prekey id of a device.
    pub fn signed_prekey_id(&self, device: &DeviceAddress) -> Result<Option<u32>> {
        Ok(self.lock()?.get(device).map(|e| e.signed_prekey.id))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<DeviceAddress, DeviceEntry>>> {
        self.devices
            .lock()
            .map_err(|_| Error::Directory("directory mutex poisoned".into()))
    }
}

#[async_trait]
impl Directory for InMemoryDirectory {
    async fn publish_bundle(
        &self,
        device: &DeviceAddress,
        identity_key: PublicKey,
        signed_prekey: SignedPrekeyPublic,
        one_time_prekeys: Vec<(u32, PublicKey)>,
    ) -> Result<()> {
        let mut devices = self.lock()?;
        let entry = devices
            .entry(device.clone())
            .or_insert_with(|| DeviceEntry {
                identity_key,
                signed_prekey,
                available: BTreeMap::new(),
                handed_out: BTreeSet::new(),
                consumed: BTreeSet::new(),
            });

        if entry.identity_key != identity_key {
            entry.identity_key = identity_key;
            entry.available.clear();
            entry.handed_out.clear();
            entry.consumed.clear();
        }
        entry.signed_prekey = signed_prekey;
        for (id, key) in one_time_prekeys {
            if !entry.handed_out.contains(&id) && !entry.consumed.contains(&id) {
                entry.available.entry(id).or_insert(key);
            }
        }
        Ok(())
    }

    async fn fetch_bundle(&self, peer: &DeviceAddress) -> Result<PreKeyBundle> {
        let delay = self.fetch_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(u64::try_from(delay).unwrap_or(u64::MAX))).await;
        }
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(Error::Directory("bundle fetch failed".into()));
        }

        let mut devices = self.lock()?;
        let entry = devices.get_mut(peer).ok_or(Error::NotFound)?;

        let one_time_prekey = entry.available.pop_first();
        if let Some((id, _)) = one_time_prekey {
            entry.handed_out.insert(id);
        }
        self.fetches.fetch_add(1, Ordering::SeqCst);

        Ok(PreKeyBundle {
            identity_key: entry.identity_key,
            signed_prekey_id: entry.signed_prekey.id,
            signed_prekey: entry.signed_prekey.key,
            signature: entry.signed_prekey.signature,
            one_time_prekey,
        })
    }

    async fn mark_prekey_consumed(&self, device: &DeviceAddress, prekey_id: u32) -> Result<()> {
        if self.fail_mark_consumed.load(Ordering::SeqCst) {
            return Err(Error::Directory("mark consumed failed".into()));
        }
        let mut devices = self.lock()?;
        let entry = devices.get_mut(device).ok_or(Error::NotFound)?;
        entry.available.remove(&prekey_id);
        entry.handed_out.remove(&prekey_id);
        entry.consumed.insert(prekey_id);
        Ok(())
    }

    async fn remaining_one_time_prekeys(&self, device: &DeviceAddress) -> Result<usize> {
        Ok(self
            .lock()?
            .get(device)
            .map_or(0, |e| e.available.len()))
    }

    async fn fetch_identity_key(&self, peer: &DeviceAddress) -> Result<PublicKey> {
        self.lock()?
            .get(peer)
            .map(|e| e.identity_key)
            .ok_or(Error::NotFound)
    }
}
