#![no_main]

use e2ee_core::keys::{PublicKey, Signature};
use e2ee_core::xeddsa::{verify, SIGNATURE_LENGTH};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 32 + SIGNATURE_LENGTH {
        return;
    }

    let public = PublicKey::from_slice(&data[..32]).unwrap();
    let mut signature = [0u8; SIGNATURE_LENGTH];
    signature.copy_from_slice(&data[32..32 + SIGNATURE_LENGTH]);

    let message = if data.len() > 32 + SIGNATURE_LENGTH {
        &data[32 + SIGNATURE_LENGTH..]
    } else {
        b"test"
    };

    // Invalid points and forged signatures fail, never panic.
    let _ = verify(&public, message, &Signature::from_bytes(signature));
});
