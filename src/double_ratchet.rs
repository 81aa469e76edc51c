//! Double Ratchet for forward-secure message encryption.
//!
//! Implements Signal's Double Ratchet:
//! - Forward secrecy: a message key is used once and discarded
//! - Post-compromise security: every DH ratchet step mixes in fresh entropy
//! - Out-of-order delivery through a bounded cache of skipped message keys
//!
//! ## State
//!
//! Each party maintains:
//! - Root key (RK): updated on each DH ratchet step
//! - Sending chain key (`CK_s`): advanced on each sent message
//! - Receiving chain key (`CK_r`): advanced on each received message
//! - Ratchet key pair: replaced on each DH ratchet step
//!
//! The whole state is `serde`-serializable so a session can be persisted
//! (encrypted) between messages.

use crate::error::{Error, Result};
use crate::kdf::{kdf_chain, kdf_root};
use crate::keys::{KeyPair, PublicKey};
use crate::primitives::{aead_encrypt, SealedBox, SymmetricKey};

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use zeroize::Zeroizing;

/// Bounds on skipped-key bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RatchetLimits {
    /// Largest gap accepted within one receiving chain
    pub max_skip: u32,
    /// Total skipped keys retained; the oldest are evicted first
    pub max_skipped_keys: usize,
}

impl Default for RatchetLimits {
    fn default() -> Self {
        Self {
            max_skip: 1000,
            max_skipped_keys: 2000,
        }
    }
}

/// Message header, authenticated but not encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Sender's current ratchet public key
    pub ratchet_key: PublicKey,

    /// Message number in the sender's current chain
    pub counter: u32,

    /// Length of the sender's previous sending chain
    pub previous_counter: u32,
}

impl Header {
    pub const SIZE: usize = PublicKey::SIZE + 8;

    /// Fixed layout used as associated data: `key || previous || counter`.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[..32].copy_from_slice(self.ratchet_key.as_bytes());
        bytes[32..36].copy_from_slice(&self.previous_counter.to_le_bytes());
        bytes[36..40].copy_from_slice(&self.counter.to_le_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != Self::SIZE {
            return Err(Error::InvalidEnvelope);
        }
        let word = |range: std::ops::Range<usize>| -> Result<u32> {
            Ok(u32::from_le_bytes(
                bytes[range].try_into().map_err(|_| Error::InvalidEnvelope)?,
            ))
        };
        Ok(Self {
            ratchet_key: PublicKey::from_slice(&bytes[..32]).map_err(|_| Error::InvalidEnvelope)?,
            previous_counter: word(32..36)?,
            counter: word(36..40)?,
        })
    }
}

/// Header plus AEAD output of one ratchet message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatchetMessage {
    pub header: Header,
    pub sealed: SealedBox,
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    ratchet_key: PublicKey,
    counter: u32,
    key: SymmetricKey,
}

/// Double Ratchet state for one session.
#[derive(Clone, Serialize, Deserialize)]
pub struct DoubleRatchet {
    root_key: SymmetricKey,
    send_chain_key: Option<SymmetricKey>,
    recv_chain_key: Option<SymmetricKey>,
    dh_send: KeyPair,
    dh_recv: Option<PublicKey>,
    send_count: u32,
    recv_count: u32,
    prev_chain_length: u32,
    skipped: VecDeque<SkippedKey>,
}

impl DoubleRatchet {
    /// Initialize as the X3DH initiator.
    ///
    /// `remote_ratchet_key` is the responder's signed prekey, which doubles
    /// as its initial ratchet key.
    pub fn init_sender<R: CryptoRngCore>(
        rng: &mut R,
        shared_secret: &SymmetricKey,
        remote_ratchet_key: PublicKey,
    ) -> Result<Self> {
        let dh_send = KeyPair::generate(rng);
        let dh_output = dh_send.secret().diffie_hellman(&remote_ratchet_key)?;
        let (root_key, send_chain_key) = kdf_root(shared_secret, &dh_output)?;

        Ok(Self {
            root_key,
            send_chain_key: Some(send_chain_key),
            recv_chain_key: None,
            dh_send,
            dh_recv: Some(remote_ratchet_key),
            send_count: 0,
            recv_count: 0,
            prev_chain_length: 0,
            skipped: VecDeque::new(),
        })
    }

    /// Initialize as the X3DH responder with the signed prekey pair.
    #[must_use]
    pub fn init_receiver(shared_secret: SymmetricKey, signed_prekey: KeyPair) -> Self {
        Self {
            root_key: shared_secret,
            send_chain_key: None,
            recv_chain_key: None,
            dh_send: signed_prekey,
            dh_recv: None,
            send_count: 0,
            recv_count: 0,
            prev_chain_length: 0,
            skipped: VecDeque::new(),
        }
    }

    /// Encrypts under the next sending message key, then advances the chain.
    pub fn encrypt(&mut self, plaintext: &[u8], associated_data: &[u8]) -> Result<RatchetMessage> {
        let chain_key = self.send_chain_key.as_ref().ok_or(Error::UnknownSession)?;
        let (next_chain_key, message_key) = kdf_chain(chain_key)?;

        let header = Header {
            ratchet_key: self.dh_send.public_key(),
            counter: self.send_count,
            previous_counter: self.prev_chain_length,
        };
        let next_count = self.send_count.checked_add(1).ok_or(Error::CryptoError)?;

        let ad = message_ad(associated_data, &header);
        let sealed = aead_encrypt(&message_key, plaintext, Some(&ad))?;

        self.send_chain_key = Some(next_chain_key);
        self.send_count = next_count;

        Ok(RatchetMessage { header, sealed })
    }

    /// Decrypts a message, performing a DH ratchet step when the header
    /// carries a new ratchet key.
    ///
    /// State is left untouched on any failure. A replayed or already
    /// consumed counter is `DecryptionFailed`.
    pub fn decrypt<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        message: &RatchetMessage,
        associated_data: &[u8],
        limits: &RatchetLimits,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let mut next = self.clone();
        let plaintext = next.advance_and_open(rng, message, associated_data, limits)?;
        *self = next;
        Ok(plaintext)
    }

    fn advance_and_open<R: CryptoRngCore>(
        &mut self,
        rng: &mut R,
        message: &RatchetMessage,
        associated_data: &[u8],
        limits: &RatchetLimits,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let header = &message.header;

        if let Some(pos) = self
            .skipped
            .iter()
            .position(|k| k.ratchet_key == header.ratchet_key && k.counter == header.counter)
        {
            let entry = self.skipped.remove(pos).ok_or(Error::CryptoError)?;
            return open(&entry.key, message, associated_data);
        }

        if self.dh_recv != Some(header.ratchet_key) {
            self.skip_message_keys(header.previous_counter, limits)?;
            self.dh_ratchet(rng, header.ratchet_key)?;
        }

        if header.counter < self.recv_count {
            return Err(Error::DecryptionFailed);
        }
        self.skip_message_keys(header.counter, limits)?;

        let chain_key = self.recv_chain_key.as_ref().ok_or(Error::DecryptionFailed)?;
        let (next_chain_key, message_key) = kdf_chain(chain_key)?;
        self.recv_chain_key = Some(next_chain_key);
        self.recv_count = self.recv_count.checked_add(1).ok_or(Error::DecryptionFailed)?;

        open(&message_key, message, associated_data)
    }

    fn dh_ratchet<R: CryptoRngCore>(&mut self, rng: &mut R, remote: PublicKey) -> Result<()> {
        self.prev_chain_length = self.send_count;
        self.send_count = 0;
        self.recv_count = 0;

        let dh_output = self
            .dh_send
            .secret()
            .diffie_hellman(&remote)
            .map_err(|_| Error::DecryptionFailed)?;
        let (root_key, recv_chain_key) = kdf_root(&self.root_key, &dh_output)?;
        self.root_key = root_key;
        self.recv_chain_key = Some(recv_chain_key);
        self.dh_recv = Some(remote);

        self.dh_send = KeyPair::generate(rng);
        let dh_output = self
            .dh_send
            .secret()
            .diffie_hellman(&remote)
            .map_err(|_| Error::DecryptionFailed)?;
        let (root_key, send_chain_key) = kdf_root(&self.root_key, &dh_output)?;
        self.root_key = root_key;
        self.send_chain_key = Some(send_chain_key);

        Ok(())
    }

    /// Derives and caches keys for messages `recv_count..until`.
    fn skip_message_keys(&mut self, until: u32, limits: &RatchetLimits) -> Result<()> {
        let (Some(chain_key), Some(ratchet_key)) = (self.recv_chain_key.as_ref(), self.dh_recv)
        else {
            return Ok(());
        };
        if until <= self.recv_count {
            return Ok(());
        }
        if until - self.recv_count > limits.max_skip {
            return Err(Error::TooManySkippedMessages);
        }

        let mut current = chain_key.clone();
        for counter in self.recv_count..until {
            let (next_chain_key, message_key) = kdf_chain(&current)?;
            self.skipped.push_back(SkippedKey {
                ratchet_key,
                counter,
                key: message_key,
            });
            while self.skipped.len() > limits.max_skipped_keys {
                self.skipped.pop_front();
            }
            current = next_chain_key;
        }

        self.recv_chain_key = Some(current);
        self.recv_count = until;
        Ok(())
    }

    /// Number of messages sent on the current sending chain.
    #[must_use]
    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    #[must_use]
    pub fn recv_count(&self) -> u32 {
        self.recv_count
    }

    #[must_use]
    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    /// Current local ratchet public key.
    #[must_use]
    pub fn ratchet_key(&self) -> PublicKey {
        self.dh_send.public_key()
    }

    /// Whether this side can encrypt yet.
    #[must_use]
    pub fn can_send(&self) -> bool {
        self.send_chain_key.is_some()
    }
}

fn message_ad(associated_data: &[u8], header: &Header) -> Vec<u8> {
    let mut ad = Vec::with_capacity(associated_data.len() + Header::SIZE);
    ad.extend_from_slice(associated_data);
    ad.extend_from_slice(&header.to_bytes());
    ad
}

fn open(
    message_key: &SymmetricKey,
    message: &RatchetMessage,
    associated_data: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let ad = message_ad(associated_data, &message.header);
    message
        .sealed
        .open(message_key, Some(&ad))
        .map_err(|_| Error::DecryptionFailed)
}

impl std::fmt::Debug for DoubleRatchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleRatchet")
            .field("send_count", &self.send_count)
            .field("recv_count", &self.recv_count)
            .field("skipped_keys", &self.skipped.len())
            .finish_non_exhaustive()
    }
}
