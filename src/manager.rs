//! Top-level entry point used by the messaging layer.
//!
//! Owns the in-memory master key and the vault that keeps it wrapped twice:
//! once under a password-derived key and once under a recovery-code key.

use crate::address::DeviceAddress;
use crate::audit::{AuditEvent, AuditSink, Auditor, TracingAuditSink};
use crate::clock::{Clock, SystemClock};
use crate::config::E2eeConfig;
use crate::directory::Directory;
use crate::envelope::Envelope;
use crate::error::{Error, Result};
use crate::key_manager::KeyManager;
use crate::keys::{MasterKey, PublicKey};
use crate::primitives::{
    aead_encrypt, byte_array, constant_time_eq, derive_key, hmac_sha256, random_array, SealedBox,
    SymmetricKey, KEY_SIZE_32, SALT_SIZE,
};
use crate::safety_number::{SafetyNumber, SafetyNumberService};
use crate::session_manager::{SessionManager, SessionState};
use crate::store::{BlobStore, EncryptedKeyStore, KeyScope};

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};
use zeroize::Zeroizing;

const VAULT_ID: &str = "params";
const VERIFICATION_LABEL: &[u8] = b"e2ee-master-key-check-v1";
const PASSWORD_LABEL: &[u8] = b"e2ee-password-v1";
const RECOVERY_LABEL: &[u8] = b"e2ee-recovery-v1";

pub const RECOVERY_CODE_BYTES: usize = 24;
const RECOVERY_GROUP_BYTES: usize = 2;

/// Non-secret parameters stored in the clear.
#[derive(Serialize, Deserialize)]
struct VaultParams {
    #[serde(with = "byte_array")]
    salt: [u8; SALT_SIZE],
    iterations: u32,
    /// HMAC-SHA256 of a fixed label under the master key
    #[serde(with = "byte_array")]
    verification: [u8; KEY_SIZE_32],
    /// Master key sealed under the password key
    password_wrapped: SealedBox,
    #[serde(with = "byte_array")]
    recovery_salt: [u8; SALT_SIZE],
    recovery_iterations: u32,
    /// Master key sealed under the recovery-code key
    recovery_wrapped: SealedBox,
}

#[derive(Serialize, Deserialize)]
struct VerifiedSafetyNumber {
    digits: String,
    verified_at: i64,
}

/// Backup secret shown to the user once at initialization.
///
/// Rendered as 12 dash-separated groups of 4 hex digits.
#[derive(Clone, PartialEq, Eq)]
pub struct RecoveryCode(Zeroizing<[u8; RECOVERY_CODE_BYTES]>);

impl RecoveryCode {
    fn generate() -> Self {
        Self(Zeroizing::new(random_array()))
    }

    /// Parses user input, ignoring case, whitespace and dashes.
    pub fn parse(input: &str) -> Result<Self> {
        let normalized: Zeroizing<String> = Zeroizing::new(
            input
                .chars()
                .filter(|c| !c.is_whitespace() && *c != '-')
                .map(|c| c.to_ascii_lowercase())
                .collect(),
        );
        let mut bytes = Zeroizing::new([0u8; RECOVERY_CODE_BYTES]);
        hex::decode_to_slice(normalized.as_bytes(), &mut bytes[..])
            .map_err(|_| Error::InvalidRecoveryCode)?;
        Ok(Self(bytes))
    }

    fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl std::fmt::Display for RecoveryCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, group) in self.0.chunks(RECOVERY_GROUP_BYTES).enumerate() {
            if i > 0 {
                f.write_str("-")?;
            }
            f.write_str(&hex::encode(group))?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for RecoveryCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecoveryCode([REDACTED])")
    }
}

/// What one [`E2eeManager::run_maintenance`] pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub rotated_signed_prekey: Option<u32>,
    pub signed_prekeys_purged: usize,
    pub one_time_prekeys_generated: u32,
    pub pending_consumptions_completed: usize,
    pub sessions_expired: usize,
}

/// End-to-end encryption engine for one local device.
pub struct E2eeManager {
    device: DeviceAddress,
    store: EncryptedKeyStore,
    directory: Arc<dyn Directory>,
    config: Arc<E2eeConfig>,
    clock: Arc<dyn Clock>,
    keys: Arc<KeyManager>,
    sessions: SessionManager,
    safety: SafetyNumberService,
    auditor: Auditor,
    master: Mutex<Option<MasterKey>>,
    /// Serializes initialize, recover, password change and reset
    lifecycle: tokio::sync::Mutex<()>,
}

impl E2eeManager {
    /// Engine with the system clock and audit events sent to `tracing`.
    pub fn new(
        device: DeviceAddress,
        blobs: Arc<dyn BlobStore>,
        directory: Arc<dyn Directory>,
        config: E2eeConfig,
    ) -> Result<Self> {
        Self::with_clock_and_audit(
            device,
            blobs,
            directory,
            config,
            Arc::new(SystemClock),
            Arc::new(TracingAuditSink),
        )
    }

    pub fn with_clock_and_audit(
        device: DeviceAddress,
        blobs: Arc<dyn BlobStore>,
        directory: Arc<dyn Directory>,
        config: E2eeConfig,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let store = EncryptedKeyStore::new(device.clone(), blobs);

        let keys = Arc::new(KeyManager::new(
            store.clone(),
            directory.clone(),
            config.clone(),
            clock.clone(),
            audit.clone(),
        ));
        let sessions = SessionManager::new(
            store.clone(),
            keys.clone(),
            directory.clone(),
            config.clone(),
            clock.clone(),
            audit.clone(),
        );

        Ok(Self {
            auditor: Auditor::new(device.clone(), audit, clock.clone()),
            safety: SafetyNumberService::new(config.safety_number_iterations),
            device,
            store,
            directory,
            config,
            clock,
            keys,
            sessions,
            master: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    #[must_use]
    pub fn device(&self) -> &DeviceAddress {
        &self.device
    }

    #[must_use]
    pub fn key_manager(&self) -> &Arc<KeyManager> {
        &self.keys
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.master_slot().is_none()
    }

    pub fn is_initialized(&self) -> Result<bool> {
        Ok(self.vault()?.is_some())
    }

    /// Generates the master key, creates and publishes the device keys,
    /// and returns the recovery code. The master key is stored wrapped
    /// under `password` and under the code; the code itself is not stored
    /// and cannot be retrieved again.
    ///
    /// Leaves the engine unlocked.
    pub async fn initialize(&self, password: &str) -> Result<RecoveryCode> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.vault()?.is_some() || self.keys.is_initialized()? {
            return Err(Error::AlreadyInitialized);
        }
        self.create_vault(password).await
    }

    /// Unwraps the master key with the recovery code and unlocks.
    ///
    /// `InvalidRecoveryCode` unless the recovered key opens the stored
    /// identity record.
    pub async fn recover(&self, recovery_code: &str) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let code = RecoveryCode::parse(recovery_code)?;
        let params = self.vault()?.ok_or(Error::NotInitialized)?;

        let recovery_key = derive_key(
            code.as_bytes(),
            &params.recovery_salt,
            params.recovery_iterations,
        );
        let master = self
            .unwrap_master(&params, &recovery_key, &params.recovery_wrapped, RECOVERY_LABEL)
            .map_err(|_| Error::InvalidRecoveryCode)?;

        self.keys.identity(&master).map_err(|e| {
            warn!(device = %self.device, error = %e, "recovered key does not open identity");
            Error::InvalidRecoveryCode
        })?;

        *self.master_slot() = Some(master);
        info!(device = %self.device, "recovered with recovery code");
        Ok(())
    }

    /// Unwraps the master key with `password`.
    ///
    /// `AuthenticationFailed` for a wrong password.
    pub fn unlock(&self, password: &str) -> Result<()> {
        let params = self.vault()?.ok_or(Error::NotInitialized)?;
        let password_key = derive_key(password.as_bytes(), &params.salt, params.iterations);
        let master = self
            .unwrap_master(&params, &password_key, &params.password_wrapped, PASSWORD_LABEL)
            .map_err(|_| {
                warn!(device = %self.device, "unlock rejected");
                Error::AuthenticationFailed
            })?;
        *self.master_slot() = Some(master);
        info!(device = %self.device, "unlocked");
        Ok(())
    }

    /// Re-wraps the master key under `new_password`. Requires the engine
    /// unlocked, by password or by recovery code; the recovery code stays
    /// valid.
    pub async fn change_password(&self, new_password: &str) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let master = self.master()?;
        let mut params = self.vault()?.ok_or(Error::NotInitialized)?;

        let iterations = self.config.kdf_iterations;
        let salt = random_array::<SALT_SIZE>();
        let password_key = derive_key(new_password.as_bytes(), &salt, iterations);
        params.password_wrapped = self.wrap_master(&password_key, &master, PASSWORD_LABEL)?;
        params.salt = salt;
        params.iterations = iterations;
        self.store.put_public(KeyScope::Vault, VAULT_ID, &params)?;

        info!(device = %self.device, iterations, "password changed");
        self.auditor.emit(AuditEvent::PasswordChanged);
        Ok(())
    }

    /// Drops (and zeroizes) the in-memory master key.
    pub fn lock(&self) {
        *self.master_slot() = None;
        info!(device = %self.device, "locked");
    }

    /// Encrypts for one peer device and returns the wire envelope.
    pub async fn encrypt_for_send(
        &self,
        peer_user_id: &str,
        peer_device_id: u32,
        plaintext: &[u8],
    ) -> Result<Vec<u8>> {
        let master = self.master()?;
        let peer = DeviceAddress::new(peer_user_id, peer_device_id);
        self.sessions
            .encrypt(&master, &peer, plaintext)
            .await?
            .to_bytes()
    }

    /// Decrypts a wire envelope from any peer.
    pub async fn decrypt_received(&self, envelope: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let master = self.master()?;
        let envelope = Envelope::from_bytes(envelope)?;
        self.sessions.decrypt(&master, &envelope).await
    }

    /// Safety number with a peer device, flagged verified while it matches
    /// the number the user last confirmed.
    ///
    /// Uses the identity key of the session when there is one, otherwise
    /// asks the directory.
    pub async fn safety_number(&self, peer_user_id: &str, peer_device_id: u32) -> Result<SafetyNumber> {
        let master = self.master()?;
        let peer = DeviceAddress::new(peer_user_id, peer_device_id);
        let local = self.keys.identity(&master)?.public_key();
        let remote = self.peer_identity_key(&master, &peer).await?;

        let mut number = self
            .safety
            .generate(&local, &self.device.user_id, &remote, &peer.user_id);

        if let Some(stored) = self.store.find_record::<VerifiedSafetyNumber>(
            KeyScope::SafetyNumber,
            &peer.storage_id(),
            master.as_key(),
        )? {
            if constant_time_eq(stored.digits.as_bytes(), number.digits().as_bytes()) {
                number.set_verified(true);
            }
        }
        Ok(number)
    }

    /// Compares `displayed` (as read off the peer's screen) with the current
    /// safety number and remembers a match.
    pub async fn mark_safety_number_verified(
        &self,
        peer_user_id: &str,
        peer_device_id: u32,
        displayed: &str,
    ) -> Result<bool> {
        let master = self.master()?;
        let mut number = self.safety_number(peer_user_id, peer_device_id).await?;
        if !self.safety.verify(&mut number, displayed) {
            return Ok(false);
        }

        let peer = DeviceAddress::new(peer_user_id, peer_device_id);
        let record = VerifiedSafetyNumber {
            digits: number.digits().to_owned(),
            verified_at: self.clock.now(),
        };
        self.store.put_record(
            KeyScope::SafetyNumber,
            &peer.storage_id(),
            &record,
            master.as_key(),
        )?;
        info!(device = %self.device, peer = %peer, "safety number verified");
        Ok(true)
    }

    pub fn session_state(&self, peer_user_id: &str, peer_device_id: u32) -> Result<SessionState> {
        let master = self.master()?;
        self.sessions
            .session_state(&master, &DeviceAddress::new(peer_user_id, peer_device_id))
    }

    pub async fn revoke_session(&self, peer_user_id: &str, peer_device_id: u32) -> Result<bool> {
        let master = self.master()?;
        self.sessions
            .revoke_session(&master, &DeviceAddress::new(peer_user_id, peer_device_id))
            .await
    }

    /// Periodic housekeeping; scheduling is up to the caller.
    ///
    /// Purges signed prekeys past their grace window, rotates the signed
    /// prekey when due, tops up one-time prekeys, retries deferred prekey
    /// consumptions and expires idle sessions.
    pub async fn run_maintenance(&self) -> Result<MaintenanceReport> {
        let master = self.master()?;
        let mut report = MaintenanceReport::default();

        report.signed_prekeys_purged = self.keys.purge_retired_signed_prekeys(&master).await?;
        if self.keys.rotation_due(&master).await? {
            report.rotated_signed_prekey = Some(self.keys.rotate_signed_prekey(&master).await?);
        }
        report.one_time_prekeys_generated = self
            .keys
            .replenish_one_time_prekeys(&master, self.config.one_time_prekey_batch)
            .await?;
        report.pending_consumptions_completed =
            self.keys.retry_pending_consumptions(&master).await?;
        report.sessions_expired = self.sessions.expire_idle_sessions(&master).await?;

        info!(device = %self.device, ?report, "maintenance complete");
        Ok(report)
    }

    /// Destroys identity, prekeys, sessions and verifications, then
    /// initializes afresh under `password`. Requires the engine unlocked.
    pub async fn reset(&self, password: &str) -> Result<RecoveryCode> {
        let _lifecycle = self.lifecycle.lock().await;
        self.master()?;

        self.sessions.wipe()?;
        self.keys.wipe()?;
        self.store.clear(KeyScope::SafetyNumber)?;
        self.store.delete(KeyScope::Vault, VAULT_ID)?;
        *self.master_slot() = None;

        warn!(device = %self.device, "device reset");
        self.auditor.emit(AuditEvent::DeviceReset);
        self.create_vault(password).await
    }

    async fn create_vault(&self, password: &str) -> Result<RecoveryCode> {
        let iterations = self.config.kdf_iterations;
        let master = MasterKey::new(SymmetricKey::random());

        let salt = random_array::<SALT_SIZE>();
        let password_key = derive_key(password.as_bytes(), &salt, iterations);
        let code = RecoveryCode::generate();
        let recovery_salt = random_array::<SALT_SIZE>();
        let recovery_key = derive_key(code.as_bytes(), &recovery_salt, iterations);
        let params = VaultParams {
            salt,
            iterations,
            verification: verification_tag(&master),
            password_wrapped: self.wrap_master(&password_key, &master, PASSWORD_LABEL)?,
            recovery_salt,
            recovery_iterations: iterations,
            recovery_wrapped: self.wrap_master(&recovery_key, &master, RECOVERY_LABEL)?,
        };

        self.keys.initialize_device(&master).await?;
        if let Err(e) = self.store.put_public(KeyScope::Vault, VAULT_ID, &params) {
            warn!(device = %self.device, error = %e, "vault write failed, discarding device keys");
            if let Err(wipe) = self.keys.wipe() {
                warn!(device = %self.device, error = %wipe, "device key cleanup failed");
            }
            return Err(e);
        }
        *self.master_slot() = Some(master);

        info!(device = %self.device, iterations, "vault created");
        Ok(code)
    }

    async fn peer_identity_key(&self, master: &MasterKey, peer: &DeviceAddress) -> Result<PublicKey> {
        match self.sessions.peer_identity(master, peer)? {
            Some(key) => Ok(key),
            None => self.directory.fetch_identity_key(peer).await,
        }
    }

    fn vault(&self) -> Result<Option<VaultParams>> {
        self.store.get_public(KeyScope::Vault, VAULT_ID)
    }

    fn wrap_master(&self, key: &SymmetricKey, master: &MasterKey, label: &[u8]) -> Result<SealedBox> {
        aead_encrypt(key, master.as_key().as_bytes(), Some(&self.wrap_ad(label)))
    }

    fn unwrap_master(
        &self,
        params: &VaultParams,
        key: &SymmetricKey,
        sealed: &SealedBox,
        label: &[u8],
    ) -> Result<MasterKey> {
        let unwrapped = sealed.open(key, Some(&self.wrap_ad(label)))?;
        if unwrapped.len() != KEY_SIZE_32 {
            return Err(Error::DecryptionFailed);
        }
        let mut bytes = Zeroizing::new([0u8; KEY_SIZE_32]);
        bytes.copy_from_slice(&unwrapped);
        let master = MasterKey::new(SymmetricKey::from_bytes(*bytes));
        if !constant_time_eq(&verification_tag(&master), &params.verification) {
            return Err(Error::AuthenticationFailed);
        }
        Ok(master)
    }

    fn wrap_ad(&self, label: &[u8]) -> Vec<u8> {
        let mut ad = label.to_vec();
        ad.extend_from_slice(self.device.storage_id().as_bytes());
        ad
    }

    fn master(&self) -> Result<MasterKey> {
        self.master_slot().clone().ok_or(Error::Locked)
    }

    fn master_slot(&self) -> std::sync::MutexGuard<'_, Option<MasterKey>> {
        self.master.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn verification_tag(master: &MasterKey) -> [u8; KEY_SIZE_32] {
    hmac_sha256(master.as_key().as_bytes(), VERIFICATION_LABEL)
}

impl std::fmt::Debug for E2eeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("E2eeManager")
            .field("device", &self.device)
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}
