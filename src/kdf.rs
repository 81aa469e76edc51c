//! Protocol key derivation: the X3DH secret, root ratchet and chain ratchet.
//!
//! All derivations are HKDF-SHA256 or HMAC-SHA256; intermediate buffers are
//! zeroized before returning.

use crate::error::{Error, Result};
use crate::keys::DhOutput;
use crate::primitives::{KEY_SIZE_32, KEY_SIZE_64, SymmetricKey};

use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use zeroize::Zeroize;

pub(crate) const X3DH_INFO: &[u8] = b"E2EE_X3DH_v1";
pub(crate) const ROOT_INFO: &[u8] = b"E2EE_DoubleRatchet_Root";

const MESSAGE_KEY_SEED: u8 = 0x01;
const CHAIN_KEY_SEED: u8 = 0x02;

type HmacSha256 = Hmac<Sha256>;

/// X3DH key derivation.
///
/// Computes `SK = HKDF(F || DH1 || DH2 || DH3 || [DH4])` where:
/// - `F = 0xFF^32` (domain separation for X25519)
/// - `salt = 0x00^32`
/// - `info = "E2EE_X3DH_v1"`
///
/// The fourth DH output is present when a one-time prekey was used.
pub fn derive_x3dh_secret(
    dh1: &DhOutput,
    dh2: &DhOutput,
    dh3: &DhOutput,
    dh4: Option<&DhOutput>,
) -> Result<SymmetricKey> {
    const F: [u8; 32] = [0xFF; 32];

    let mut ikm = [0u8; 32 + 32 * 4];
    let mut len = 0;

    let parts = [
        Some(&F),
        Some(dh1.as_bytes()),
        Some(dh2.as_bytes()),
        Some(dh3.as_bytes()),
        dh4.map(DhOutput::as_bytes),
    ];
    for part in parts.into_iter().flatten() {
        ikm[len..len + 32].copy_from_slice(part);
        len += 32;
    }

    let salt = [0u8; 32];
    let hkdf = Hkdf::<Sha256>::new(Some(&salt), &ikm[..len]);

    let mut output = [0u8; KEY_SIZE_32];
    let expanded = hkdf.expand(X3DH_INFO, &mut output);
    ikm.zeroize();
    expanded.map_err(|_| Error::CryptoError)?;

    let key = SymmetricKey::from_bytes(output);
    output.zeroize();
    Ok(key)
}

/// Root KDF for a DH ratchet step.
///
/// `(RK', CK) = HKDF(salt = RK, ikm = DH_out, info = ROOT_INFO)`, split 32/32.
pub fn kdf_root(root_key: &SymmetricKey, dh_output: &DhOutput) -> Result<(SymmetricKey, SymmetricKey)> {
    let hkdf = Hkdf::<Sha256>::new(Some(root_key.as_bytes()), dh_output.as_bytes());

    let mut output = [0u8; KEY_SIZE_64];
    hkdf.expand(ROOT_INFO, &mut output)
        .map_err(|_| Error::CryptoError)?;

    let split = split_pair(&output);
    output.zeroize();
    split
}

/// Chain KDF for the symmetric ratchet.
///
/// - `MK = HMAC(CK, 0x01)` is the message key
/// - `CK' = HMAC(CK, 0x02)` is the next chain key
///
/// Returns `(next_chain_key, message_key)`.
pub fn kdf_chain(chain_key: &SymmetricKey) -> Result<(SymmetricKey, SymmetricKey)> {
    let message_key = hmac_step(chain_key, MESSAGE_KEY_SEED)?;
    let next_chain_key = hmac_step(chain_key, CHAIN_KEY_SEED)?;
    Ok((next_chain_key, message_key))
}

fn hmac_step(chain_key: &SymmetricKey, seed: u8) -> Result<SymmetricKey> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(chain_key.as_bytes())
        .map_err(|_| Error::CryptoError)?;
    mac.update(&[seed]);
    let mut bytes: [u8; KEY_SIZE_32] = mac.finalize().into_bytes().into();
    let key = SymmetricKey::from_bytes(bytes);
    bytes.zeroize();
    Ok(key)
}

fn split_pair(output: &[u8; KEY_SIZE_64]) -> Result<(SymmetricKey, SymmetricKey)> {
    let first = output[..KEY_SIZE_32]
        .try_into()
        .map_err(|_| Error::CryptoError)?;
    let second = output[KEY_SIZE_32..]
        .try_into()
        .map_err(|_| Error::CryptoError)?;
    Ok((SymmetricKey::from_bytes(first), SymmetricKey::from_bytes(second)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_domain_separation() {
        let dh1 = DhOutput::from_bytes([1u8; 32]);
        let dh2 = DhOutput::from_bytes([2u8; 32]);
        let dh3 = DhOutput::from_bytes([3u8; 32]);

        let sk = derive_x3dh_secret(&dh1, &dh2, &dh3, None).unwrap();

        let mut expected_ikm = vec![0xFF; 32];
        expected_ikm.extend_from_slice(&[1u8; 32]);
        expected_ikm.extend_from_slice(&[2u8; 32]);
        expected_ikm.extend_from_slice(&[3u8; 32]);

        let hkdf = Hkdf::<Sha256>::new(Some(&[0u8; 32]), &expected_ikm);
        let mut expected = [0u8; 32];
        hkdf.expand(X3DH_INFO, &mut expected).unwrap();

        assert_eq!(sk.as_bytes(), &expected);
    }

    #[test]
    fn test_kdf_opk_changes_secret() {
        let dh1 = DhOutput::from_bytes([1u8; 32]);
        let dh2 = DhOutput::from_bytes([2u8; 32]);
        let dh3 = DhOutput::from_bytes([3u8; 32]);
        let dh4 = DhOutput::from_bytes([4u8; 32]);

        let sk_3dh = derive_x3dh_secret(&dh1, &dh2, &dh3, None).unwrap();
        let sk_4dh = derive_x3dh_secret(&dh1, &dh2, &dh3, Some(&dh4)).unwrap();

        assert_ne!(sk_3dh, sk_4dh);
    }

    #[test]
    fn test_kdf_chain_separates_outputs() {
        let ck = SymmetricKey::from_bytes([42u8; 32]);
        let (next, mk) = kdf_chain(&ck).unwrap();
        assert_ne!(next, mk);
        assert_ne!(next, ck);

        let (next2, mk2) = kdf_chain(&next).unwrap();
        assert_ne!(mk, mk2);
        assert_ne!(next, next2);
    }

    #[test]
    fn test_kdf_chain_deterministic() {
        let ck = SymmetricKey::from_bytes([9u8; 32]);
        assert_eq!(kdf_chain(&ck).unwrap().1, kdf_chain(&ck).unwrap().1);
    }

    #[test]
    fn test_kdf_root_depends_on_both_inputs() {
        let rk = SymmetricKey::from_bytes([1u8; 32]);
        let dh = DhOutput::from_bytes([2u8; 32]);
        let (rk1, ck1) = kdf_root(&rk, &dh).unwrap();
        assert_ne!(rk1, ck1);

        let (rk2, _) = kdf_root(&SymmetricKey::from_bytes([3u8; 32]), &dh).unwrap();
        assert_ne!(rk1, rk2);

        let (rk3, _) = kdf_root(&rk, &DhOutput::from_bytes([4u8; 32])).unwrap();
        assert_ne!(rk1, rk3);
    }
}
