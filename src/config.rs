//! Engine configuration.
//!
//! Durations are plain seconds so the struct deserializes directly from
//! whatever format the embedding application uses.

use crate::double_ratchet::RatchetLimits;
use crate::error::{Error, Result};
use crate::primitives::DEFAULT_KDF_ITERATIONS;

use serde::Deserialize;

const DAY_SECS: i64 = 24 * 60 * 60;

/// Tunables for key lifetimes, pool sizes and ratchet bounds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct E2eeConfig {
    /// PBKDF2 iterations for password and recovery-code derivation
    pub kdf_iterations: u32,
    /// One-time prekeys generated at initialization and replenish target
    pub one_time_prekey_batch: u32,
    /// Replenish when the directory reports fewer than this
    pub one_time_prekey_low_watermark: u32,
    pub signed_prekey_rotation_secs: i64,
    /// How long a retired signed prekey still answers handshakes
    pub signed_prekey_grace_secs: i64,
    pub session_idle_timeout_secs: i64,
    pub max_skip: u32,
    pub max_skipped_keys: usize,
    pub safety_number_iterations: u32,
}

impl Default for E2eeConfig {
    fn default() -> Self {
        Self {
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
            one_time_prekey_batch: 100,
            one_time_prekey_low_watermark: 20,
            signed_prekey_rotation_secs: 7 * DAY_SECS,
            signed_prekey_grace_secs: 7 * DAY_SECS,
            session_idle_timeout_secs: 30 * DAY_SECS,
            max_skip: 1000,
            max_skipped_keys: 2000,
            safety_number_iterations: 5200,
        }
    }
}

impl E2eeConfig {
    pub fn validate(&self) -> Result<()> {
        if self.kdf_iterations == 0 {
            return Err(Error::InvalidConfig("kdf_iterations must be non-zero"));
        }
        if self.one_time_prekey_batch == 0 {
            return Err(Error::InvalidConfig("one_time_prekey_batch must be non-zero"));
        }
        if self.one_time_prekey_low_watermark >= self.one_time_prekey_batch {
            return Err(Error::InvalidConfig(
                "one_time_prekey_low_watermark must be below one_time_prekey_batch",
            ));
        }
        if self.signed_prekey_rotation_secs <= 0
            || self.signed_prekey_grace_secs <= 0
            || self.session_idle_timeout_secs <= 0
        {
            return Err(Error::InvalidConfig("durations must be positive"));
        }
        if self.max_skip == 0 || self.max_skipped_keys == 0 {
            return Err(Error::InvalidConfig("skipped-key limits must be non-zero"));
        }
        if self.safety_number_iterations == 0 {
            return Err(Error::InvalidConfig("safety_number_iterations must be non-zero"));
        }
        Ok(())
    }

    #[must_use]
    pub fn ratchet_limits(&self) -> RatchetLimits {
        RatchetLimits {
            max_skip: self.max_skip,
            max_skipped_keys: self.max_skipped_keys,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_valid() {
        let config = E2eeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.kdf_iterations, 100_000);
        assert_eq!(config.one_time_prekey_batch, 100);
        assert_eq!(config.one_time_prekey_low_watermark, 20);
        assert_eq!(config.session_idle_timeout_secs, 30 * 24 * 60 * 60);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let zero_iter = E2eeConfig {
            kdf_iterations: 0,
            ..E2eeConfig::default()
        };
        assert!(zero_iter.validate().is_err());

        let watermark = E2eeConfig {
            one_time_prekey_batch: 10,
            one_time_prekey_low_watermark: 10,
            ..E2eeConfig::default()
        };
        assert!(matches!(watermark.validate(), Err(Error::InvalidConfig(_))));

        let grace = E2eeConfig {
            signed_prekey_grace_secs: 0,
            ..E2eeConfig::default()
        };
        assert!(grace.validate().is_err());
    }

    #[test]
    fn test_ratchet_limits() {
        let limits = E2eeConfig::default().ratchet_limits();
        assert_eq!(limits, RatchetLimits::default());
    }
}
