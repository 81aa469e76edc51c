//! Safety numbers: a numeric fingerprint of two identity keys, compared out
//! of band to detect a man in the middle.
//!
//! Each side contributes 30 digits derived from an iterated SHA-512 over its
//! identity key and user id. The two halves are sorted before being joined,
//! so both parties see the same 60 digits.

use crate::keys::PublicKey;
use crate::primitives::{constant_time_eq, sha512};

const FINGERPRINT_VERSION: u16 = 0;
const HALF_DIGITS: usize = 30;
pub const DIGITS: usize = 2 * HALF_DIGITS;
const GROUP: usize = 5;

/// A computed safety number and whether the user has confirmed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafetyNumber {
    digits: String,
    verified: bool,
}

impl SafetyNumber {
    /// The 60 digits without separators.
    #[must_use]
    pub fn digits(&self) -> &str {
        &self.digits
    }

    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.verified
    }

    pub(crate) fn set_verified(&mut self, verified: bool) {
        self.verified = verified;
    }

    /// Twelve space-separated groups of five digits.
    #[must_use]
    pub fn display_string(&self) -> String {
        self.digits
            .as_bytes()
            .chunks(GROUP)
            .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl std::fmt::Display for SafetyNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.display_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SafetyNumberService {
    iterations: u32,
}

impl SafetyNumberService {
    #[must_use]
    pub fn new(iterations: u32) -> Self {
        Self { iterations }
    }

    /// Order-independent: swapping local and remote gives the same number.
    #[must_use]
    pub fn generate(
        &self,
        local_identity: &PublicKey,
        local_user_id: &str,
        remote_identity: &PublicKey,
        remote_user_id: &str,
    ) -> SafetyNumber {
        let local = self.half(local_identity, local_user_id);
        let remote = self.half(remote_identity, remote_user_id);

        let (first, second) = if local <= remote {
            (local, remote)
        } else {
            (remote, local)
        };
        SafetyNumber {
            digits: first + &second,
            verified: false,
        }
    }

    /// Compares against what the user read from the peer's screen in
    /// constant time, and marks `number` verified on a match.
    ///
    /// Spaces and dashes in `expected` are ignored.
    pub fn verify(&self, number: &mut SafetyNumber, expected: &str) -> bool {
        let expected: String = expected
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-')
            .collect();
        let matches = constant_time_eq(number.digits.as_bytes(), expected.as_bytes());
        if matches {
            number.verified = true;
        }
        matches
    }

    fn half(&self, identity: &PublicKey, user_id: &str) -> String {
        let mut input = Vec::with_capacity(2 + 32 + user_id.len());
        input.extend_from_slice(&FINGERPRINT_VERSION.to_be_bytes());
        input.extend_from_slice(identity.as_bytes());
        input.extend_from_slice(user_id.as_bytes());

        let mut hash = sha512(&input);
        let mut round = Vec::with_capacity(64 + 32);
        for _ in 0..self.iterations {
            round.clear();
            round.extend_from_slice(&hash);
            round.extend_from_slice(identity.as_bytes());
            hash = sha512(&round);
        }

        hash[..HALF_DIGITS]
            .chunks(5)
            .map(|chunk| {
                let value = chunk
                    .iter()
                    .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
                format!("{:05}", value % 100_000)
            })
            .collect()
    }
}

impl Default for SafetyNumberService {
    fn default() -> Self {
        Self::new(5200)
    }
}
