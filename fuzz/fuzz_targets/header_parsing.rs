//! Fuzz target for ratchet header parsing

#![no_main]

use e2ee_core::Header;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(header) = Header::from_bytes(data) {
        assert_eq!(&header.to_bytes()[..], data);
    }
});
