//! Addressing of devices.

use serde::{Deserialize, Serialize};

/// One device of one user.
///
/// Scopes local storage and names peers for session lookup.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceAddress {
    pub user_id: String,
    pub device_id: u32,
}

impl DeviceAddress {
    pub fn new(user_id: impl Into<String>, device_id: u32) -> Self {
        Self {
            user_id: user_id.into(),
            device_id,
        }
    }

    /// Stable string form used as a storage id.
    #[must_use]
    pub fn storage_id(&self) -> String {
        format!("{}:{}", hex::encode(self.user_id.as_bytes()), self.device_id)
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.user_id, self.device_id)
    }
}
