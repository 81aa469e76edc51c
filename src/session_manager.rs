//! Pairwise sessions with peer devices.
//!
//! Per peer the state machine is `NoSession -> Establishing -> Established
//! -> Expired`. All operations on one peer's session run under that peer's
//! async mutex; different peers proceed in parallel.
//!
//! Encrypting to a peer without a session fetches its bundle and runs the
//! initiator side of X3DH while holding the peer's lock, so concurrent
//! encrypts to the same new peer produce exactly one handshake. After the
//! fetch returns there are no further await points before the session is
//! persisted: a cancelled encrypt either leaves no trace or a complete
//! session.

use crate::address::DeviceAddress;
use crate::audit::{AuditEvent, AuditSink, Auditor};
use crate::clock::Clock;
use crate::config::E2eeConfig;
use crate::directory::Directory;
use crate::double_ratchet::DoubleRatchet;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::key_manager::KeyManager;
use crate::keys::{MasterKey, PublicKey};
use crate::store::{EncryptedKeyStore, KeyScope};
use crate::x3dh::{self, InitialMessage, ResponderKeys};

use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

/// Handshake ephemeral keys remembered per peer for replay detection.
const HANDSHAKE_HISTORY: usize = 32;

/// Lifecycle state of the session with one peer device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NoSession,
    /// A handshake with this peer is in flight
    Establishing,
    Established,
    /// Idle past the timeout or revoked; a fresh handshake is required
    Expired,
}

#[derive(Serialize, Deserialize)]
struct SessionRecord {
    peer: DeviceAddress,
    ratchet: DoubleRatchet,
    peer_identity: PublicKey,
    /// `IK_initiator || IK_responder`
    associated_data: Vec<u8>,
    /// Initiator ephemeral key of the handshake that created this session
    handshake: PublicKey,
    /// Peer handshakes accepted so far, oldest first
    accepted_handshakes: VecDeque<PublicKey>,
    created_at: i64,
    last_used_at: i64,
}

#[derive(Serialize, Deserialize)]
enum StoredSession {
    Active(Box<SessionRecord>),
    /// Ratchet state is discarded; identity and handshake history are kept
    Expired {
        peer: DeviceAddress,
        peer_identity: PublicKey,
        accepted_handshakes: VecDeque<PublicKey>,
        expired_at: i64,
    },
}

impl StoredSession {
    fn peer(&self) -> &DeviceAddress {
        match self {
            StoredSession::Active(record) => &record.peer,
            StoredSession::Expired { peer, .. } => peer,
        }
    }

    fn peer_identity(&self) -> PublicKey {
        match self {
            StoredSession::Active(record) => record.peer_identity,
            StoredSession::Expired { peer_identity, .. } => *peer_identity,
        }
    }

    fn accepted_handshakes(&self) -> &VecDeque<PublicKey> {
        match self {
            StoredSession::Active(record) => &record.accepted_handshakes,
            StoredSession::Expired {
                accepted_handshakes,
                ..
            } => accepted_handshakes,
        }
    }
}

/// What a replacement session inherits from the one it replaces.
#[derive(Default)]
struct Lineage {
    identity: Option<PublicKey>,
    handshakes: VecDeque<PublicKey>,
}

impl Lineage {
    fn of(stored: Option<&StoredSession>) -> Self {
        stored.map_or_else(Self::default, |stored| Self {
            identity: Some(stored.peer_identity()),
            handshakes: stored.accepted_handshakes().clone(),
        })
    }

    fn seen(&self, handshake: &PublicKey) -> bool {
        self.handshakes.contains(handshake)
    }

    fn accept(mut self, handshake: PublicKey) -> VecDeque<PublicKey> {
        self.handshakes.push_back(handshake);
        while self.handshakes.len() > HANDSHAKE_HISTORY {
            self.handshakes.pop_front();
        }
        self.handshakes
    }
}

pub struct SessionManager {
    device: DeviceAddress,
    store: EncryptedKeyStore,
    keys: Arc<KeyManager>,
    directory: Arc<dyn Directory>,
    config: Arc<E2eeConfig>,
    clock: Arc<dyn Clock>,
    auditor: Auditor,
    slots: Mutex<HashMap<DeviceAddress, Arc<tokio::sync::Mutex<()>>>>,
    establishing: Mutex<HashSet<DeviceAddress>>,
}

impl SessionManager {
    pub fn new(
        store: EncryptedKeyStore,
        keys: Arc<KeyManager>,
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
            keys,
            directory,
            config,
            clock,
            slots: Mutex::new(HashMap::new()),
            establishing: Mutex::new(HashSet::new()),
        }
    }

    /// Encrypts `plaintext` for `peer`, establishing a session first when
    /// there is none (or it expired).
    ///
    /// The first envelope of a new session is a `PreKeyMessage`; later ones
    /// are normal messages. If that first envelope is lost the peer answers
    /// the next with `UnknownSession` and the caller revokes and retries.
    pub async fn encrypt(
        &self,
        master: &MasterKey,
        peer: &DeviceAddress,
        plaintext: &[u8],
    ) -> Result<Envelope> {
        let slot = self.slot(peer)?;
        let _session = slot.lock().await;
        let now = self.clock.now();

        let stored = self.load(master, peer)?;
        let lineage = Lineage::of(stored.as_ref());
        let (mut record, prekey) = match self.live(master, stored, now)? {
            Some(record) => (record, None),
            None => {
                let _establishing = self.begin_establishing(peer)?;
                let (record, initial) = self.initiate(master, peer, lineage, now).await?;
                (record, Some(initial))
            }
        };

        let message = record
            .ratchet
            .encrypt(plaintext, &record.associated_data)?;
        record.last_used_at = now;
        self.save(master, record)?;

        debug!(
            peer = %peer,
            counter = message.header.counter,
            prekey = prekey.is_some(),
            "message encrypted"
        );
        Ok(Envelope {
            sender: self.device.clone(),
            prekey,
            message,
        })
    }

    /// Decrypts an envelope from its sender.
    ///
    /// A `PreKeyMessage` carrying a new handshake creates (or replaces) the
    /// session; one matching the current session is treated as a normal
    /// message. A handshake this peer already completed once is a replay
    /// and fails with `DecryptionFailed`. A normal message without a live
    /// session is `UnknownSession`.
    pub async fn decrypt(&self, master: &MasterKey, envelope: &Envelope) -> Result<Zeroizing<Vec<u8>>> {
        let peer = &envelope.sender;
        let slot = self.slot(peer)?;
        let _session = slot.lock().await;
        let now = self.clock.now();

        let stored = self.load(master, peer)?;
        let lineage = Lineage::of(stored.as_ref());
        let live = self.live(master, stored, now)?;

        match (envelope.prekey, live) {
            (Some(initial), Some(record)) if record.handshake == initial.ephemeral_key => {
                self.decrypt_with(master, record, envelope, now)
            }
            (Some(initial), _) if lineage.seen(&initial.ephemeral_key) => {
                warn!(peer = %peer, "replayed handshake rejected");
                Err(Error::DecryptionFailed)
            }
            (Some(initial), _) => {
                let _establishing = self.begin_establishing(peer)?;
                self.respond(master, envelope, &initial, lineage, now).await
            }
            (None, Some(record)) => self.decrypt_with(master, record, envelope, now),
            (None, None) => {
                debug!(peer = %peer, "normal message without a session");
                Err(Error::UnknownSession)
            }
        }
    }

    pub fn session_state(&self, master: &MasterKey, peer: &DeviceAddress) -> Result<SessionState> {
        if self.establishing()?.contains(peer) {
            return Ok(SessionState::Establishing);
        }
        Ok(match self.load(master, peer)? {
            None => SessionState::NoSession,
            Some(StoredSession::Expired { .. }) => SessionState::Expired,
            Some(StoredSession::Active(record)) if self.is_idle(&record, self.clock.now()) => {
                SessionState::Expired
            }
            Some(StoredSession::Active(_)) => SessionState::Established,
        })
    }

    /// Identity key the live or expired session with `peer` was built on.
    pub fn peer_identity(&self, master: &MasterKey, peer: &DeviceAddress) -> Result<Option<PublicKey>> {
        Ok(self
            .load(master, peer)?
            .as_ref()
            .map(StoredSession::peer_identity))
    }

    /// Ends the session with `peer`. Returns whether one was live.
    pub async fn revoke_session(&self, master: &MasterKey, peer: &DeviceAddress) -> Result<bool> {
        let slot = self.slot(peer)?;
        let _session = slot.lock().await;

        match self.load(master, peer)? {
            Some(StoredSession::Active(record)) => {
                self.store_expired(master, &record, self.clock.now())?;
                info!(peer = %peer, "session revoked");
                self.auditor.emit(AuditEvent::SessionRevoked { peer: peer.clone() });
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Expires every session idle past the timeout. Returns how many.
    pub async fn expire_idle_sessions(&self, master: &MasterKey) -> Result<usize> {
        let mut expired = 0;
        for id in self.store.list(KeyScope::Session)? {
            let Some(stored) =
                self.store
                    .find_record::<StoredSession>(KeyScope::Session, &id, master.as_key())?
            else {
                continue;
            };
            let peer = stored.peer().clone();

            let slot = self.slot(&peer)?;
            let _session = slot.lock().await;
            if let Some(StoredSession::Active(record)) = self.load(master, &peer)? {
                let now = self.clock.now();
                if self.is_idle(&record, now) {
                    self.expire(master, &record, now)?;
                    expired += 1;
                }
            }
        }
        Ok(expired)
    }

    /// Removes all session state.
    pub fn wipe(&self) -> Result<()> {
        self.store.clear(KeyScope::Session)
    }

    async fn initiate(
        &self,
        master: &MasterKey,
        peer: &DeviceAddress,
        lineage: Lineage,
        now: i64,
    ) -> Result<(Box<SessionRecord>, InitialMessage)> {
        let identity = self.keys.identity(master)?;

        debug!(peer = %peer, "fetching prekey bundle");
        let bundle = self.directory.fetch_bundle(peer).await?;
        if bundle.one_time_prekey.is_none() {
            warn!(peer = %peer, "peer has no one-time prekeys left");
        }

        let result = x3dh::initiate(&mut OsRng, &identity, &bundle)?;
        let ratchet =
            DoubleRatchet::init_sender(&mut OsRng, &result.shared_secret, bundle.signed_prekey)
                .map_err(|_| Error::HandshakeFailed)?;

        self.track_identity(peer, lineage.identity, bundle.identity_key)?;

        info!(
            peer = %peer,
            peer_identity = %bundle.identity_key.short_id(),
            one_time_prekey = ?result.initial_message.one_time_prekey_id,
            "session established as initiator"
        );
        self.auditor.emit(AuditEvent::SessionEstablished {
            peer: peer.clone(),
            initiator: true,
        });

        let record = Box::new(SessionRecord {
            peer: peer.clone(),
            ratchet,
            peer_identity: bundle.identity_key,
            associated_data: result.associated_data,
            handshake: result.initial_message.ephemeral_key,
            accepted_handshakes: lineage.handshakes,
            created_at: now,
            last_used_at: now,
        });
        Ok((record, result.initial_message))
    }

    async fn respond(
        &self,
        master: &MasterKey,
        envelope: &Envelope,
        initial: &InitialMessage,
        lineage: Lineage,
        now: i64,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let peer = &envelope.sender;
        let identity = self.keys.identity(master)?;

        // The sender address is unauthenticated; the handshake must come
        // from the identity the directory publishes for it.
        let published = match self.directory.fetch_identity_key(peer).await {
            Ok(key) => key,
            Err(Error::NotFound) => {
                warn!(peer = %peer, "handshake from an unpublished device");
                return Err(Error::HandshakeFailed);
            }
            Err(e) => return Err(e),
        };
        if published != initial.identity_key {
            warn!(
                peer = %peer,
                published = %published.short_id(),
                claimed = %initial.identity_key.short_id(),
                "handshake identity does not match the sender's published identity"
            );
            return Err(Error::HandshakeFailed);
        }

        let signed_prekey = self
            .keys
            .signed_prekey(master, initial.signed_prekey_id)
            .await?;

        let reservation = match initial.one_time_prekey_id {
            Some(id) => Some(
                self.keys
                    .reserve_one_time_prekey(master, id)
                    .await
                    .map_err(|e| match e {
                        Error::OneTimePrekeyUnavailable => {
                            warn!(peer = %peer, prekey_id = id, "handshake names an unavailable one-time prekey");
                            Error::HandshakeFailed
                        }
                        other => other,
                    })?,
            ),
            None => None,
        };

        let result = x3dh::respond(
            &ResponderKeys {
                identity: &identity,
                signed_prekey: &signed_prekey,
                one_time_prekey: reservation.as_ref().map(|r| r.key_pair()),
            },
            initial,
        )?;

        // Trial decrypt before anything is consumed or persisted.
        let mut ratchet = DoubleRatchet::init_receiver(result.shared_secret, signed_prekey);
        let plaintext = ratchet.decrypt(
            &mut OsRng,
            &envelope.message,
            &result.associated_data,
            &self.config.ratchet_limits(),
        )?;

        if let Some(reservation) = reservation {
            reservation.commit(master).await?;
        }

        self.track_identity(peer, lineage.identity, initial.identity_key)?;

        let record = Box::new(SessionRecord {
            peer: peer.clone(),
            ratchet,
            peer_identity: initial.identity_key,
            associated_data: result.associated_data,
            handshake: initial.ephemeral_key,
            accepted_handshakes: lineage.accept(initial.ephemeral_key),
            created_at: now,
            last_used_at: now,
        });
        self.save(master, record)?;

        info!(
            peer = %peer,
            peer_identity = %initial.identity_key.short_id(),
            one_time_prekey = ?initial.one_time_prekey_id,
            "session established as responder"
        );
        self.auditor.emit(AuditEvent::SessionEstablished {
            peer: peer.clone(),
            initiator: false,
        });
        Ok(plaintext)
    }

    fn decrypt_with(
        &self,
        master: &MasterKey,
        mut record: Box<SessionRecord>,
        envelope: &Envelope,
        now: i64,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let plaintext = record.ratchet.decrypt(
            &mut OsRng,
            &envelope.message,
            &record.associated_data,
            &self.config.ratchet_limits(),
        )?;
        record.last_used_at = now;
        let skipped_keys = record.ratchet.skipped_key_count();
        self.save(master, record)?;

        debug!(
            peer = %envelope.sender,
            counter = envelope.message.header.counter,
            skipped_keys,
            "message decrypted"
        );
        Ok(plaintext)
    }

    /// Records a change of the peer's identity key.
    fn track_identity(
        &self,
        peer: &DeviceAddress,
        previous: Option<PublicKey>,
        current: PublicKey,
    ) -> Result<()> {
        match previous {
            Some(previous) if previous != current => {
                warn!(
                    peer = %peer,
                    previous = %previous.short_id(),
                    current = %current.short_id(),
                    "peer identity key changed"
                );
                self.store.delete(KeyScope::SafetyNumber, &peer.storage_id())?;
                self.auditor
                    .emit(AuditEvent::PeerIdentityChanged { peer: peer.clone() });
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// The live session in `stored`, expiring it first if idle too long.
    fn live(
        &self,
        master: &MasterKey,
        stored: Option<StoredSession>,
        now: i64,
    ) -> Result<Option<Box<SessionRecord>>> {
        match stored {
            Some(StoredSession::Active(record)) if self.is_idle(&record, now) => {
                self.expire(master, &record, now)?;
                Ok(None)
            }
            Some(StoredSession::Active(record)) => Ok(Some(record)),
            _ => Ok(None),
        }
    }

    fn is_idle(&self, record: &SessionRecord, now: i64) -> bool {
        now - record.last_used_at > self.config.session_idle_timeout_secs
    }

    fn expire(&self, master: &MasterKey, record: &SessionRecord, now: i64) -> Result<()> {
        self.store_expired(master, record, now)?;
        info!(peer = %record.peer, last_used_at = record.last_used_at, "session expired");
        self.auditor.emit(AuditEvent::SessionExpired {
            peer: record.peer.clone(),
        });
        Ok(())
    }

    fn store_expired(&self, master: &MasterKey, record: &SessionRecord, now: i64) -> Result<()> {
        let tombstone = StoredSession::Expired {
            peer: record.peer.clone(),
            peer_identity: record.peer_identity,
            accepted_handshakes: record.accepted_handshakes.clone(),
            expired_at: now,
        };
        self.store.put_record(
            KeyScope::Session,
            &record.peer.storage_id(),
            &tombstone,
            master.as_key(),
        )
    }

    fn load(&self, master: &MasterKey, peer: &DeviceAddress) -> Result<Option<StoredSession>> {
        self.store
            .find_record(KeyScope::Session, &peer.storage_id(), master.as_key())
    }

    fn save(&self, master: &MasterKey, record: Box<SessionRecord>) -> Result<()> {
        let id = record.peer.storage_id();
        self.store.put_record(
            KeyScope::Session,
            &id,
            &StoredSession::Active(record),
            master.as_key(),
        )
    }

    fn slot(&self, peer: &DeviceAddress) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut slots = self
            .slots
            .lock()
            .map_err(|_| Error::Storage("session slot mutex poisoned".into()))?;
        Ok(slots.entry(peer.clone()).or_default().clone())
    }

    fn establishing(&self) -> Result<MutexGuard<'_, HashSet<DeviceAddress>>> {
        self.establishing
            .lock()
            .map_err(|_| Error::Storage("establishing mutex poisoned".into()))
    }

    fn begin_establishing(&self, peer: &DeviceAddress) -> Result<Establishing<'_>> {
        self.establishing()?.insert(peer.clone());
        Ok(Establishing {
            sessions: self,
            peer: peer.clone(),
        })
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// Marks a peer as `Establishing` for as long as it lives.
struct Establishing<'a> {
    sessions: &'a SessionManager,
    peer: DeviceAddress,
}

impl Drop for Establishing<'_> {
    fn drop(&mut self) {
        if let Ok(mut establishing) = self.sessions.establishing() {
            establishing.remove(&self.peer);
        }
    }
}
