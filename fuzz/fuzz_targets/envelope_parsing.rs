//! Fuzz target for wire envelope parsing
//!
//! Arbitrary bytes must either parse or fail with an error, never panic

#![no_main]

use e2ee_core::Envelope;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = Envelope::from_bytes(data) {
        let encoded = envelope.to_bytes().expect("parsed envelope re-encodes");
        let roundtrip = Envelope::from_bytes(&encoded).expect("roundtrip should succeed");
        assert_eq!(envelope, roundtrip);
    }
});
