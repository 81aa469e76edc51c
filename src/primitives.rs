//! Thin wrappers over the symmetric primitives the engine composes.
//!
//! - Secure randomness from the operating system
//! - PBKDF2-HMAC-SHA256 password stretching
//! - AES-256-GCM with nonces generated internally, never accepted from callers
//! - SHA-256 / SHA-512 / HMAC-SHA256
//! - Constant-time comparison
//!
//! No protocol logic lives here.

use crate::error::{Error, Result};

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use hmac::{Hmac, Mac};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

pub const KEY_SIZE_32: usize = 32;
pub const KEY_SIZE_64: usize = 64;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;
pub const SALT_SIZE: usize = 16;

/// Iteration count for password-derived keys.
pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;

/// 256-bit symmetric key with automatic zeroization on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop, serde::Serialize, serde::Deserialize)]
pub struct SymmetricKey(#[serde(with = "byte_array")] [u8; KEY_SIZE_32]);

impl SymmetricKey {
    /// Creates a symmetric key from raw bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_SIZE_32]) -> Self {
        Self(bytes)
    }

    /// Generates a fresh random key.
    #[must_use]
    pub fn random() -> Self {
        Self(random_array())
    }

    /// Returns the key as a byte array reference.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE_32] {
        &self.0
    }
}

impl PartialEq for SymmetricKey {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(&self.0, &other.0)
    }
}

impl Eq for SymmetricKey {}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey([REDACTED])")
    }
}

/// Fills `n` bytes from the OS CSPRNG.
#[must_use]
pub fn random_bytes(n: usize) -> Vec<u8> {
    let mut out = vec![0u8; n];
    OsRng.fill_bytes(&mut out);
    out
}

/// Fixed-size variant of [`random_bytes`].
#[must_use]
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut out = [0u8; N];
    OsRng.fill_bytes(&mut out);
    out
}

/// PBKDF2-HMAC-SHA256 producing a 32-byte key.
///
/// Deterministic for identical `(password, salt, iterations)`.
#[must_use]
pub fn derive_key(password: &[u8], salt: &[u8], iterations: u32) -> SymmetricKey {
    let mut out = [0u8; KEY_SIZE_32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut out);
    let key = SymmetricKey::from_bytes(out);
    out.zeroize();
    key
}

/// Output of [`aead_encrypt`]: nonce, ciphertext and detached tag.
#[derive(Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SealedBox {
    #[serde(with = "byte_array")]
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
    #[serde(with = "byte_array")]
    pub tag: [u8; TAG_SIZE],
}

impl SealedBox {
    /// Minimum encoded size (empty ciphertext).
    pub const OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

    /// Encodes as `nonce || tag || ciphertext`.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::OVERHEAD + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.tag);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Decodes the layout written by [`SealedBox::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::OVERHEAD {
            return Err(Error::AuthenticationFailed);
        }
        let (nonce, rest) = bytes.split_at(NONCE_SIZE);
        let (tag, ciphertext) = rest.split_at(TAG_SIZE);
        Ok(Self {
            nonce: nonce.try_into().map_err(|_| Error::AuthenticationFailed)?,
            tag: tag.try_into().map_err(|_| Error::AuthenticationFailed)?,
            ciphertext: ciphertext.to_vec(),
        })
    }

    /// Decrypts with [`aead_decrypt`].
    pub fn open(&self, key: &SymmetricKey, aad: Option<&[u8]>) -> Result<Zeroizing<Vec<u8>>> {
        aead_decrypt(key, &self.nonce, &self.ciphertext, &self.tag, aad)
    }
}

impl std::fmt::Debug for SealedBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedBox")
            .field("ciphertext_len", &self.ciphertext.len())
            .finish()
    }
}

/// Encrypts with AES-256-GCM under a fresh random 96-bit nonce.
///
/// The nonce is always generated here; callers cannot supply one.
///
/// # Errors
/// Returns `Error::CryptoError` if the cipher rejects the input length.
pub fn aead_encrypt(key: &SymmetricKey, plaintext: &[u8], aad: Option<&[u8]>) -> Result<SealedBox> {
    let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce: [u8; NONCE_SIZE] = random_array();

    let mut buffer = plaintext.to_vec();
    let tag = cipher
        .encrypt_in_place_detached(
            aes_gcm::Nonce::from_slice(&nonce),
            aad.unwrap_or_default(),
            &mut buffer,
        )
        .map_err(|_| Error::CryptoError)?;

    let mut tag_bytes = [0u8; TAG_SIZE];
    tag_bytes.copy_from_slice(tag.as_slice());

    Ok(SealedBox {
        nonce,
        ciphertext: buffer,
        tag: tag_bytes,
    })
}

/// Decrypts AES-256-GCM output.
///
/// Tag verification inside `aes-gcm` is constant time; every failure maps to
/// the same `Error::AuthenticationFailed` regardless of cause.
pub fn aead_decrypt(
    key: &SymmetricKey,
    nonce: &[u8; NONCE_SIZE],
    ciphertext: &[u8],
    tag: &[u8; TAG_SIZE],
    aad: Option<&[u8]>,
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let mut buffer = Zeroizing::new(ciphertext.to_vec());

    cipher
        .decrypt_in_place_detached(
            aes_gcm::Nonce::from_slice(nonce),
            aad.unwrap_or_default(),
            &mut *buffer,
            aes_gcm::Tag::from_slice(tag),
        )
        .map_err(|_| Error::AuthenticationFailed)?;

    Ok(buffer)
}

#[must_use]
pub fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

#[must_use]
pub fn sha512(data: &[u8]) -> [u8; 64] {
    let digest = Sha512::digest(data);
    let mut out = [0u8; 64];
    out.copy_from_slice(&digest);
    out
}

/// HMAC-SHA256 over `data`.
#[must_use]
pub fn hmac_sha256(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac =
        <Hmac<Sha256> as Mac>::new_from_slice(key).unwrap_or_else(|_| unreachable!("HMAC accepts any key size"));
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Compares two byte strings in time independent of their contents.
///
/// Lengths are not secret; differing lengths return `false` immediately.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Serde helper for fixed-size byte arrays, written as byte strings.
pub(crate) mod byte_array {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(crate) fn serialize<S, const N: usize>(
        bytes: &[u8; N],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(bytes)
    }

    pub(crate) fn deserialize<'de, D, const N: usize>(
        deserializer: D,
    ) -> std::result::Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("invalid byte array length"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes_length_and_freshness() {
        let a = random_bytes(32);
        let b = random_bytes(32);
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(random_bytes(0).is_empty());
    }

    #[test]
    fn test_derive_key_deterministic() {
        let salt = [7u8; SALT_SIZE];
        let k1 = derive_key(b"correct-horse", &salt, 1_000);
        let k2 = derive_key(b"correct-horse", &salt, 1_000);
        let k3 = derive_key(b"correct-horse", &[8u8; SALT_SIZE], 1_000);
        let k4 = derive_key(b"battery-staple", &salt, 1_000);

        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
        assert_ne!(k1, k4);
    }

    #[test]
    fn test_derive_key_default_iterations() {
        let salt = [1u8; SALT_SIZE];
        let a = derive_key(b"pw", &salt, DEFAULT_KDF_ITERATIONS);
        let b = derive_key(b"pw", &salt, DEFAULT_KDF_ITERATIONS - 1);
        assert_ne!(a, b);
    }

    #[test]
    fn test_encrypt_decrypt() {
        let key = SymmetricKey::random();
        let sealed = aead_encrypt(&key, b"Hello, World!", Some(b"ad")).unwrap();
        assert_eq!(sealed.ciphertext.len(), 13);

        let plain = sealed.open(&key, Some(b"ad")).unwrap();
        assert_eq!(&plain[..], b"Hello, World!");
    }

    #[test]
    fn test_nonce_fresh_per_call() {
        let key = SymmetricKey::random();
        let a = aead_encrypt(&key, b"same", None).unwrap();
        let b = aead_encrypt(&key, b"same", None).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.ciphertext, b.ciphertext);
    }

    #[test]
    fn test_decrypt_wrong_key_or_aad() {
        let key = SymmetricKey::random();
        let sealed = aead_encrypt(&key, b"secret", Some(b"ctx")).unwrap();

        assert_eq!(
            sealed.open(&SymmetricKey::random(), Some(b"ctx")).unwrap_err(),
            Error::AuthenticationFailed
        );
        assert_eq!(
            sealed.open(&key, Some(b"other")).unwrap_err(),
            Error::AuthenticationFailed
        );
        assert_eq!(sealed.open(&key, None).unwrap_err(), Error::AuthenticationFailed);
    }

    #[test]
    fn test_tampered_tag_and_ciphertext() {
        let key = SymmetricKey::random();
        let sealed = aead_encrypt(&key, b"payload", None).unwrap();

        let mut bad_tag = sealed.clone();
        bad_tag.tag[TAG_SIZE - 1] ^= 0x01;
        assert!(bad_tag.open(&key, None).is_err());

        let mut bad_ct = sealed.clone();
        bad_ct.ciphertext[0] ^= 0x80;
        assert!(bad_ct.open(&key, None).is_err());
    }

    #[test]
    fn test_sealed_box_bytes() {
        let key = SymmetricKey::random();
        let sealed = aead_encrypt(&key, b"", None).unwrap();
        let bytes = sealed.to_bytes();
        assert_eq!(bytes.len(), SealedBox::OVERHEAD);
        assert_eq!(SealedBox::from_bytes(&bytes).unwrap(), sealed);
        assert!(SealedBox::from_bytes(&bytes[..SealedBox::OVERHEAD - 1]).is_err());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"hellp"));
        assert!(!constant_time_eq(b"hello", b"hell"));
        assert!(constant_time_eq(b"", b""));
    }

    #[test]
    fn test_hash_lengths() {
        assert_eq!(sha256(b"abc").len(), 32);
        assert_eq!(sha512(b"abc").len(), 64);
        assert_ne!(hmac_sha256(b"k1", b"m"), hmac_sha256(b"k2", b"m"));
    }
}
