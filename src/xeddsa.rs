//! XEdDSA signatures over X25519 identity keys.
//!
//! Follows "The XEdDSA and VXEdDSA Signature Schemes" (Perrin, rev. 1). The
//! identity key is converted to its Edwards form with the sign bit forced to
//! zero, so a verifier only needs the published X25519 public key.

use crate::error::{Error, Result};
use crate::keys::{PublicKey, SecretKey, Signature};

use curve25519_dalek::{
    constants::ED25519_BASEPOINT_TABLE,
    edwards::{CompressedEdwardsY, EdwardsPoint},
    montgomery::MontgomeryPoint,
    scalar::Scalar,
};
use rand_core::CryptoRngCore;
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// XEdDSA signature: 64 bytes (R point + s scalar)
pub const SIGNATURE_LENGTH: usize = 64;

/// Signs `message` under the X25519 secret `secret`.
pub fn sign<R: CryptoRngCore>(rng: &mut R, secret: &SecretKey, message: &[u8]) -> Result<Signature> {
    let signing = SigningScalar::from_secret(secret)?;
    let mut random = [0u8; 64];
    rng.fill_bytes(&mut random);
    let signature = signing.sign(message, &random);
    random.zeroize();
    Ok(Signature::from_bytes(signature))
}

/// Verifies an XEdDSA signature against an X25519 public key.
///
/// Returns `InvalidSignature` for any verification failure and
/// `InvalidPublicKey` when the key has no usable Edwards form.
pub fn verify(public: &PublicKey, message: &[u8], signature: &Signature) -> Result<()> {
    EdwardsKey::from_montgomery(public.as_bytes())?.verify(message, signature.as_bytes())
}

/// Edwards private scalar `a` with `A = aB` of sign zero.
#[derive(Zeroize, ZeroizeOnDrop)]
struct SigningScalar {
    a: Scalar,
    #[zeroize(skip)]
    public: EdwardsKey,
}

impl SigningScalar {
    fn from_secret(secret: &SecretKey) -> Result<Self> {
        let mut k = *secret.to_bytes();
        k[0] &= 248;
        k[31] &= 127;
        k[31] |= 64;

        let k_scalar = Scalar::from_bytes_mod_order(k);
        k.zeroize();

        let e = (&k_scalar * ED25519_BASEPOINT_TABLE).compress();
        let a = if e.as_bytes()[31] >> 7 == 1 {
            -k_scalar
        } else {
            k_scalar
        };

        let public = EdwardsKey::from_montgomery(secret.public_key().as_bytes())?;
        Ok(Self { a, public })
    }

    fn sign(&self, message: &[u8], random: &[u8; 64]) -> [u8; SIGNATURE_LENGTH] {
        // r = hash1(a || M || Z)
        let mut hasher = Sha512::new();
        hasher.update([0xFE]);
        hasher.update([0xFF; 31]);
        hasher.update(self.a.as_bytes());
        hasher.update(message);
        hasher.update(random);
        let r = wide_scalar(hasher);

        let r_compressed = (&r * ED25519_BASEPOINT_TABLE).compress();
        let h = self.public.challenge(&r_compressed, message);
        let s = r + h * self.a;

        let mut signature = [0u8; SIGNATURE_LENGTH];
        signature[..32].copy_from_slice(r_compressed.as_bytes());
        signature[32..].copy_from_slice(s.as_bytes());
        signature
    }
}

/// Edwards form of an X25519 public key.
#[derive(Clone, Copy)]
struct EdwardsKey {
    compressed: CompressedEdwardsY,
}

impl EdwardsKey {
    fn from_montgomery(u_bytes: &[u8; 32]) -> Result<Self> {
        let mut u = *u_bytes;
        u[31] &= 0x7F;

        let edwards = MontgomeryPoint(u)
            .to_edwards(0)
            .ok_or(Error::InvalidPublicKey)?;

        let mut bytes = *edwards.compress().as_bytes();
        bytes[31] &= 0x7F;
        Ok(Self {
            compressed: CompressedEdwardsY(bytes),
        })
    }

    fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_LENGTH]) -> Result<()> {
        let mut r_bytes = [0u8; 32];
        let mut s_bytes = [0u8; 32];
        r_bytes.copy_from_slice(&signature[..32]);
        s_bytes.copy_from_slice(&signature[32..]);

        let r_compressed = CompressedEdwardsY(r_bytes);
        r_compressed.decompress().ok_or(Error::InvalidSignature)?;

        // s must be below 2^253
        if s_bytes[31] & 0xE0 != 0 {
            return Err(Error::InvalidSignature);
        }
        let s = Scalar::from_bytes_mod_order(s_bytes);

        let a_point = self
            .compressed
            .decompress()
            .ok_or(Error::InvalidPublicKey)?;
        if !a_point.is_torsion_free() {
            return Err(Error::InvalidPublicKey);
        }

        let h = self.challenge(&r_compressed, message);
        let r_check = EdwardsPoint::vartime_double_scalar_mul_basepoint(&h, &-a_point, &s);

        if r_check.compress().as_bytes().ct_eq(&r_bytes).into() {
            Ok(())
        } else {
            Err(Error::InvalidSignature)
        }
    }

    /// h = hash(R || A || M) mod q
    fn challenge(&self, r: &CompressedEdwardsY, message: &[u8]) -> Scalar {
        let mut hasher = Sha512::new();
        hasher.update(r.as_bytes());
        hasher.update(self.compressed.as_bytes());
        hasher.update(message);
        wide_scalar(hasher)
    }
}

fn wide_scalar(hasher: Sha512) -> Scalar {
    let digest = hasher.finalize();
    let mut wide = [0u8; 64];
    wide.copy_from_slice(&digest);
    let scalar = Scalar::from_bytes_mod_order_wide(&wide);
    wide.zeroize();
    scalar
}
