//! Fuzz target for AEAD sealing with corrupted inputs
//!
//! Ensures decryption failures don't cause panics

#![no_main]

use e2ee_core::primitives::{aead_encrypt, SealedBox, SymmetricKey};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if data.len() < 32 {
        return;
    }

    let key = SymmetricKey::from_bytes(data[..32].try_into().unwrap());
    let plaintext = &data[32..];

    let sealed = aead_encrypt(&key, plaintext, Some(b"ad")).expect("encryption should succeed");
    let opened = sealed.open(&key, Some(b"ad")).expect("decryption should succeed");
    assert_eq!(&opened[..], plaintext);

    // Any single flipped byte must fail authentication.
    let mut bytes = sealed.to_bytes();
    let index = usize::from(data[0]) % bytes.len();
    bytes[index] ^= 1;
    let corrupted = SealedBox::from_bytes(&bytes).unwrap();
    assert!(corrupted.open(&key, Some(b"ad")).is_err());

    assert!(sealed.open(&key, Some(b"wrong")).is_err());

    // Arbitrary bytes as a sealed box.
    if let Ok(parsed) = SealedBox::from_bytes(plaintext) {
        let _ = parsed.open(&key, None);
    }
});
