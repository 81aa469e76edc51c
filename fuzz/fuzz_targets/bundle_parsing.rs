#![no_main]

use e2ee_core::keys::{PublicKey, Signature};
use e2ee_core::x3dh::{initiate, PreKeyBundle};
use e2ee_core::xeddsa::SIGNATURE_LENGTH;
use e2ee_core::IdentityKeyPair;
use libfuzzer_sys::fuzz_target;
use rand_core::OsRng;

const BASE: usize = 32 + 32 + SIGNATURE_LENGTH;

// Layout: identity_key (32) || signed_prekey (32) || signature (64)
// Optional: otpk_id (4) || one_time_prekey (32)
fuzz_target!(|data: &[u8]| {
    if data.len() < BASE {
        return;
    }

    let key = |range: std::ops::Range<usize>| PublicKey::from_slice(&data[range]).unwrap();
    let mut signature = [0u8; SIGNATURE_LENGTH];
    signature.copy_from_slice(&data[64..BASE]);

    let one_time_prekey = (data.len() >= BASE + 36).then(|| {
        let id = u32::from_le_bytes(data[BASE..BASE + 4].try_into().unwrap());
        (id, key(BASE + 4..BASE + 36))
    });

    let bundle = PreKeyBundle {
        identity_key: key(0..32),
        signed_prekey_id: 1,
        signed_prekey: key(32..64),
        signature: Signature::from_bytes(signature),
        one_time_prekey,
    };

    // Forged bundles must be rejected before any DH is attempted.
    let verified = bundle.verify_signature().is_ok();
    let alice = IdentityKeyPair::generate(&mut OsRng);
    let initiated = initiate(&mut OsRng, &alice, &bundle);
    if !verified {
        assert!(initiated.is_err());
    }
});
