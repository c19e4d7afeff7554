//! Legacy JSON identity file, read once when moving identities into the
//! account database.
//!
//! ```json
//! { "trustedKeys": [
//!     { "name": "+15550001", "uuid": "6d1f…", "identityKey": "BQ…",
//!       "trustLevel": "TRUSTED_UNVERIFIED", "addedTimestamp": 1700000000000 } ] }
//! ```

use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, StoreError};
use crate::models::{IdentityKey, IdentityRecord, TrustLevel};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyIdentityFile {
    #[serde(default)]
    pub trusted_keys: Vec<LegacyTrustedKey>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyTrustedKey {
    pub name: String,
    #[serde(default)]
    pub uuid: Option<String>,
    /// Base64 of the serialised identity key.
    pub identity_key: String,
    pub trust_level: TrustLevel,
    /// Milliseconds since the epoch.
    pub added_timestamp: i64,
}

impl LegacyTrustedKey {
    /// Records are keyed by service id where the file has one.
    pub fn address(&self) -> &str {
        self.uuid
            .as_deref()
            .filter(|u| !u.is_empty())
            .unwrap_or(&self.name)
    }

    pub fn to_record(&self) -> Result<IdentityRecord> {
        let bytes = STANDARD
            .decode(self.identity_key.trim())
            .map_err(|e| StoreError::InvalidIdentityKey(e.to_string()))?;
        Ok(IdentityRecord {
            address: self.address().to_owned(),
            identity_key: IdentityKey::from_bytes(&bytes)?,
            trust_level: self.trust_level,
            added_at: DateTime::from_timestamp_millis(self.added_timestamp).unwrap_or_default(),
        })
    }
}

impl LegacyIdentityFile {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Every readable entry. Unreadable keys are logged and skipped.
    pub fn into_records(self) -> Vec<IdentityRecord> {
        self.trusted_keys
            .iter()
            .filter_map(|entry| match entry.to_record() {
                Ok(record) => Some(record),
                Err(e) => {
                    warn!(address = entry.address(), error = %e, "skipping legacy identity");
                    None
                }
            })
            .collect()
    }
}
