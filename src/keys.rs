//! Key types with memory safety guarantees.
//!
//! Every private type zeroizes on drop and prints `[REDACTED]` under `Debug`.

use crate::error::{Error, Result};
use crate::primitives::{byte_array, SymmetricKey, KEY_SIZE_32};
use crate::xeddsa;

use rand_core::CryptoRngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// X25519 public key (32 bytes)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "byte_array")] [u8; KEY_SIZE_32]);

impl PublicKey {
    /// Size in bytes
    pub const SIZE: usize = KEY_SIZE_32;

    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(bytes)
    }

    /// Parses from a slice, rejecting the wrong length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_SIZE_32] = bytes.try_into().map_err(|_| Error::InvalidPublicKey)?;
        Ok(Self(arr))
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }

    /// Short hex prefix for log fields. Not a fingerprint.
    #[must_use]
    pub fn short_id(&self) -> String {
        hex::encode(&self.0[..4])
    }

    pub(crate) fn to_x25519(self) -> X25519PublicKey {
        X25519PublicKey::from(self.0)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.short_id())
    }
}

impl From<X25519PublicKey> for PublicKey {
    fn from(pk: X25519PublicKey) -> Self {
        Self(*pk.as_bytes())
    }
}

impl From<&StaticSecret> for PublicKey {
    fn from(secret: &StaticSecret) -> Self {
        PublicKey::from(X25519PublicKey::from(secret))
    }
}

/// X25519 secret key with automatic zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey(StaticSecret);

impl SecretKey {
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self(StaticSecret::random_from_rng(rng))
    }

    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(StaticSecret::from(bytes))
    }

    /// Raw scalar bytes, zeroized when the wrapper drops.
    #[must_use]
    pub fn to_bytes(&self) -> Zeroizing<[u8; KEY_SIZE_32]> {
        Zeroizing::new(self.0.to_bytes())
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        PublicKey::from(&self.0)
    }

    /// X25519 key agreement.
    ///
    /// Fails with `InvalidPublicKey` when the peer key is a low-order point
    /// (the shared secret would be all zeroes).
    pub fn diffie_hellman(&self, public: &PublicKey) -> Result<DhOutput> {
        let shared = self.0.diffie_hellman(&public.to_x25519());
        if !shared.was_contributory() {
            return Err(Error::InvalidPublicKey);
        }
        Ok(DhOutput(*shared.as_bytes()))
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

impl Serialize for SecretKey {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(self.to_bytes().as_ref())
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        let arr: std::result::Result<[u8; KEY_SIZE_32], _> = bytes.as_slice().try_into();
        bytes.zeroize();
        let mut arr = arr.map_err(|_| serde::de::Error::custom("invalid secret key length"))?;
        let key = Self::from_bytes(arr);
        arr.zeroize();
        Ok(key)
    }
}

/// Output of a Diffie-Hellman operation, zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct DhOutput([u8; KEY_SIZE_32]);

impl DhOutput {
    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }
}

impl std::fmt::Debug for DhOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "DhOutput([REDACTED])")
    }
}

/// An X25519 key pair: ratchet keys, signed prekeys and one-time prekeys.
#[derive(Clone, Serialize, Deserialize)]
pub struct KeyPair {
    secret: SecretKey,
    public: PublicKey,
}

impl KeyPair {
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self::from_secret(SecretKey::generate(rng))
    }

    #[must_use]
    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    #[must_use]
    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// XEdDSA signature (R || s)
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "byte_array")] [u8; xeddsa::SIGNATURE_LENGTH]);

impl Signature {
    #[must_use]
    pub fn from_bytes(bytes: [u8; xeddsa::SIGNATURE_LENGTH]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; xeddsa::SIGNATURE_LENGTH] {
        &self.0
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Signature({})", hex::encode(&self.0[..8]))
    }
}

/// Long-term identity key.
///
/// A single X25519 key serves both key agreement and, via XEdDSA, signing
/// of signed prekeys. Read-only once created.
#[derive(Clone, Serialize, Deserialize)]
pub struct IdentityKeyPair {
    key: KeyPair,
}

impl IdentityKeyPair {
    pub fn generate<R: CryptoRngCore>(rng: &mut R) -> Self {
        Self {
            key: KeyPair::generate(rng),
        }
    }

    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.key.public_key()
    }

    #[must_use]
    pub fn secret(&self) -> &SecretKey {
        self.key.secret()
    }

    /// Signs `message` with XEdDSA under the identity key.
    pub fn sign<R: CryptoRngCore>(&self, rng: &mut R, message: &[u8]) -> Result<Signature> {
        xeddsa::sign(rng, self.key.secret(), message)
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.key.public_key())
            .finish_non_exhaustive()
    }
}

/// Random key that encrypts every record at rest, persisted only wrapped.
///
/// Only ever held in memory; the holder zeroizes it on lock.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey(SymmetricKey);

impl MasterKey {
    #[must_use]
    pub fn new(key: SymmetricKey) -> Self {
        Self(key)
    }

    #[must_use]
    pub fn as_key(&self) -> &SymmetricKey {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}
