//! X3DH (Extended Triple Diffie-Hellman) key agreement.
//!
//! Signal's asynchronous key agreement:
//! <https://signal.org/docs/specifications/x3dh/>
//!
//! ## Protocol Flow
//!
//! 1. **Responder** publishes a bundle: identity key, signed prekey with an
//!    XEdDSA signature over `IK || SPK`, and optionally a one-time prekey.
//!
//! 2. **Initiator** verifies the signature, then computes:
//!    - DH1 = `DH(IK_A, SPK_B)`
//!    - DH2 = `DH(EK_A, IK_B)`
//!    - DH3 = `DH(EK_A, SPK_B)`
//!    - DH4 = `DH(EK_A, OPK_B)` [if OPK available]
//!    - SK = KDF(DH1 || DH2 || DH3 || DH4)
//!
//! 3. **Responder** recomputes SK from the initial message.
//!
//! Prekey bookkeeping (which prekeys exist, which are consumed) belongs to
//! the key manager; this module is pure computation.

use crate::error::{Error, Result};
use crate::kdf::derive_x3dh_secret;
use crate::keys::{IdentityKeyPair, KeyPair, PublicKey, SecretKey, Signature};
use crate::primitives::SymmetricKey;
use crate::xeddsa;

use rand_core::CryptoRngCore;
use serde::{Deserialize, Serialize};

/// Bytes covered by a signed prekey signature: `IK || SPK`.
///
/// Binding the identity key prevents substituting it while keeping a
/// legitimate signature.
#[must_use]
pub fn signed_prekey_message(identity_key: &PublicKey, signed_prekey: &PublicKey) -> [u8; 64] {
    let mut message = [0u8; 64];
    message[..32].copy_from_slice(identity_key.as_bytes());
    message[32..].copy_from_slice(signed_prekey.as_bytes());
    message
}

/// Signs a signed prekey with the identity key.
pub fn sign_prekey<R: CryptoRngCore>(
    rng: &mut R,
    identity: &IdentityKeyPair,
    signed_prekey: &PublicKey,
) -> Result<Signature> {
    identity.sign(rng, &signed_prekey_message(&identity.public_key(), signed_prekey))
}

/// A peer's published keys, as handed out by the directory for one handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// Long-term identity key
    pub identity_key: PublicKey,

    pub signed_prekey_id: u32,

    /// Medium-term signed prekey
    pub signed_prekey: PublicKey,

    /// XEdDSA signature over `identity_key || signed_prekey`
    pub signature: Signature,

    /// One-time prekey id and key, if the peer still had any
    pub one_time_prekey: Option<(u32, PublicKey)>,
}

impl PreKeyBundle {
    /// Verifies the signature on the signed prekey.
    pub fn verify_signature(&self) -> Result<()> {
        let message = signed_prekey_message(&self.identity_key, &self.signed_prekey);
        xeddsa::verify(&self.identity_key, &message, &self.signature)
            .map_err(|_| Error::InvalidSignature)
    }
}

/// Handshake data the initiator embeds in its first message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitialMessage {
    /// Initiator identity key
    pub identity_key: PublicKey,

    /// Initiator ephemeral key
    pub ephemeral_key: PublicKey,

    /// Responder signed prekey that was used
    pub signed_prekey_id: u32,

    /// Responder one-time prekey that was used, if any
    pub one_time_prekey_id: Option<u32>,
}

#[derive(Debug)]
pub struct InitiatorResult {
    pub shared_secret: SymmetricKey,
    pub initial_message: InitialMessage,
    /// `IK_A || IK_B`
    pub associated_data: Vec<u8>,
}

#[derive(Debug)]
pub struct ResponderResult {
    pub shared_secret: SymmetricKey,
    /// `IK_A || IK_B`
    pub associated_data: Vec<u8>,
}

/// Private keys the responder needs to answer one initial message.
#[derive(Debug)]
pub struct ResponderKeys<'a> {
    pub identity: &'a IdentityKeyPair,
    pub signed_prekey: &'a KeyPair,
    pub one_time_prekey: Option<&'a KeyPair>,
}

/// Initiator side.
///
/// Any failure (bad signature, low-order key) is `HandshakeFailed`.
pub fn initiate<R: CryptoRngCore>(
    rng: &mut R,
    identity: &IdentityKeyPair,
    bundle: &PreKeyBundle,
) -> Result<InitiatorResult> {
    bundle
        .verify_signature()
        .map_err(|_| Error::HandshakeFailed)?;

    let ephemeral = SecretKey::generate(rng);

    let dh = || -> Result<_> {
        let dh1 = identity.secret().diffie_hellman(&bundle.signed_prekey)?;
        let dh2 = ephemeral.diffie_hellman(&bundle.identity_key)?;
        let dh3 = ephemeral.diffie_hellman(&bundle.signed_prekey)?;
        let dh4 = bundle
            .one_time_prekey
            .map(|(_, opk)| ephemeral.diffie_hellman(&opk))
            .transpose()?;
        derive_x3dh_secret(&dh1, &dh2, &dh3, dh4.as_ref())
    };
    let shared_secret = dh().map_err(|_| Error::HandshakeFailed)?;

    Ok(InitiatorResult {
        shared_secret,
        initial_message: InitialMessage {
            identity_key: identity.public_key(),
            ephemeral_key: ephemeral.public_key(),
            signed_prekey_id: bundle.signed_prekey_id,
            one_time_prekey_id: bundle.one_time_prekey.map(|(id, _)| id),
        },
        associated_data: associated_data(&identity.public_key(), &bundle.identity_key),
    })
}

/// Responder side.
///
/// The caller resolves the prekeys named in `initial`; a message naming a
/// one-time prekey that was not supplied is `HandshakeFailed`.
pub fn respond(keys: &ResponderKeys<'_>, initial: &InitialMessage) -> Result<ResponderResult> {
    if initial.one_time_prekey_id.is_some() != keys.one_time_prekey.is_some() {
        return Err(Error::HandshakeFailed);
    }

    let dh = || -> Result<_> {
        let spk = keys.signed_prekey.secret();
        let dh1 = spk.diffie_hellman(&initial.identity_key)?;
        let dh2 = keys.identity.secret().diffie_hellman(&initial.ephemeral_key)?;
        let dh3 = spk.diffie_hellman(&initial.ephemeral_key)?;
        let dh4 = keys
            .one_time_prekey
            .map(|opk| opk.secret().diffie_hellman(&initial.ephemeral_key))
            .transpose()?;
        derive_x3dh_secret(&dh1, &dh2, &dh3, dh4.as_ref())
    };
    let shared_secret = dh().map_err(|_| Error::HandshakeFailed)?;

    Ok(ResponderResult {
        shared_secret,
        associated_data: associated_data(&initial.identity_key, &keys.identity.public_key()),
    })
}

fn associated_data(initiator: &PublicKey, responder: &PublicKey) -> Vec<u8> {
    let mut ad = Vec::with_capacity(64);
    ad.extend_from_slice(initiator.as_bytes());
    ad.extend_from_slice(responder.as_bytes());
    ad
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    struct Responder {
        identity: IdentityKeyPair,
        signed_prekey: KeyPair,
        one_time_prekey: KeyPair,
    }

    impl Responder {
        fn new() -> Self {
            Self {
                identity: IdentityKeyPair::generate(&mut OsRng),
                signed_prekey: KeyPair::generate(&mut OsRng),
                one_time_prekey: KeyPair::generate(&mut OsRng),
            }
        }

        fn bundle(&self, with_opk: bool) -> PreKeyBundle {
            PreKeyBundle {
                identity_key: self.identity.public_key(),
                signed_prekey_id: 1,
                signed_prekey: self.signed_prekey.public_key(),
                signature: sign_prekey(&mut OsRng, &self.identity, &self.signed_prekey.public_key())
                    .unwrap(),
                one_time_prekey: with_opk.then(|| (7, self.one_time_prekey.public_key())),
            }
        }

        fn keys(&self, with_opk: bool) -> ResponderKeys<'_> {
            ResponderKeys {
                identity: &self.identity,
                signed_prekey: &self.signed_prekey,
                one_time_prekey: with_opk.then_some(&self.one_time_prekey),
            }
        }
    }

    #[test]
    fn test_x3dh_handshake_with_opk() {
        let alice = IdentityKeyPair::generate(&mut OsRng);
        let bob = Responder::new();

        let bundle = bob.bundle(true);
        assert!(bundle.verify_signature().is_ok());

        let alice_result = initiate(&mut OsRng, &alice, &bundle).unwrap();
        assert_eq!(alice_result.initial_message.one_time_prekey_id, Some(7));
        assert_eq!(alice_result.initial_message.signed_prekey_id, 1);

        let bob_result = respond(&bob.keys(true), &alice_result.initial_message).unwrap();

        assert_eq!(alice_result.shared_secret, bob_result.shared_secret);
        assert_eq!(alice_result.associated_data, bob_result.associated_data);
    }

    #[test]
    fn test_x3dh_handshake_without_opk() {
        let alice = IdentityKeyPair::generate(&mut OsRng);
        let bob = Responder::new();

        let alice_result = initiate(&mut OsRng, &alice, &bob.bundle(false)).unwrap();
        assert_eq!(alice_result.initial_message.one_time_prekey_id, None);

        let bob_result = respond(&bob.keys(false), &alice_result.initial_message).unwrap();
        assert_eq!(alice_result.shared_secret, bob_result.shared_secret);
    }

    #[test]
    fn test_missing_opk_rejected() {
        let alice = IdentityKeyPair::generate(&mut OsRng);
        let bob = Responder::new();

        let alice_result = initiate(&mut OsRng, &alice, &bob.bundle(true)).unwrap();
        assert_eq!(
            respond(&bob.keys(false), &alice_result.initial_message).unwrap_err(),
            Error::HandshakeFailed
        );
    }

    #[test]
    fn test_invalid_signature() {
        let alice = IdentityKeyPair::generate(&mut OsRng);
        let bob = Responder::new();
        let mut bundle = bob.bundle(true);

        let mut sig = *bundle.signature.as_bytes();
        sig[0] ^= 0xFF;
        bundle.signature = Signature::from_bytes(sig);

        assert!(bundle.verify_signature().is_err());
        assert_eq!(
            initiate(&mut OsRng, &alice, &bundle).unwrap_err(),
            Error::HandshakeFailed
        );
    }

    #[test]
    fn test_identity_substitution_rejected() {
        let bob = Responder::new();
        let eve = IdentityKeyPair::generate(&mut OsRng);

        let mut bundle = bob.bundle(true);
        bundle.identity_key = eve.public_key();

        assert!(bundle.verify_signature().is_err());
    }

    #[test]
    fn test_signature_not_reusable_for_other_prekey() {
        let bob = Responder::new();
        let mut bundle = bob.bundle(false);
        bundle.signed_prekey = KeyPair::generate(&mut OsRng).public_key();

        assert!(bundle.verify_signature().is_err());
    }

    #[test]
    fn test_low_order_prekey_rejected() {
        let alice = IdentityKeyPair::generate(&mut OsRng);
        let bob = Responder::new();

        // A correctly signed low-order prekey still fails the handshake.
        let zero = PublicKey::from_bytes([0u8; 32]);
        let bundle = PreKeyBundle {
            identity_key: bob.identity.public_key(),
            signed_prekey_id: 1,
            signed_prekey: zero,
            signature: sign_prekey(&mut OsRng, &bob.identity, &zero).unwrap(),
            one_time_prekey: None,
        };

        assert_eq!(
            initiate(&mut OsRng, &alice, &bundle).unwrap_err(),
            Error::HandshakeFailed
        );
    }

    #[test]
    fn test_wrong_responder_derives_different_secret() {
        let alice = IdentityKeyPair::generate(&mut OsRng);
        let bob = Responder::new();
        let eve = Responder::new();

        let alice_result = initiate(&mut OsRng, &alice, &eve.bundle(false)).unwrap();
        let bob_result = respond(&bob.keys(false), &alice_result.initial_message).unwrap();

        assert_ne!(alice_result.shared_secret, bob_result.shared_secret);
    }
}
