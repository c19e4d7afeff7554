//! Row models and the enums the trust policy is expressed in.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

// ── Identity key ─────────────────────────────────────────────────────────────

/// Serialised length of a remote identity public key: type byte + 32 key bytes.
pub const IDENTITY_KEY_LEN: usize = 33;

/// Type byte of a Curve25519 (DJB) public key.
pub const DJB_KEY_TYPE: u8 = 0x05;

/// A remote party's long-term public identity key, in its serialised form.
/// Opaque beyond its framing.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey([u8; IDENTITY_KEY_LEN]);

impl IdentityKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StoreError> {
        let raw: [u8; IDENTITY_KEY_LEN] = bytes.try_into().map_err(|_| {
            StoreError::InvalidIdentityKey(format!(
                "expected {} bytes, got {}",
                IDENTITY_KEY_LEN,
                bytes.len()
            ))
        })?;
        if raw[0] != DJB_KEY_TYPE {
            return Err(StoreError::InvalidIdentityKey(format!(
                "unknown key type 0x{:02x}",
                raw[0]
            )));
        }
        Ok(Self(raw))
    }

    /// Frame a bare 32-byte Curve25519 public key.
    pub fn from_public_key(public: &[u8; 32]) -> Self {
        let mut raw = [0u8; IDENTITY_KEY_LEN];
        raw[0] = DJB_KEY_TYPE;
        raw[1..].copy_from_slice(public);
        Self(raw)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Short hex fingerprint used in logs, e.g. `05a1 b2c3 d4e5 f607`.
    pub fn fingerprint(&self) -> String {
        hex::encode(&self.0[..8])
            .as_bytes()
            .chunks(4)
            .map(|c| String::from_utf8_lossy(c).into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Debug for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKey({})", self.fingerprint())
    }
}

// ── Trust level ──────────────────────────────────────────────────────────────

/// Stored trust in one remote identity key. Persisted by ordinal, so the
/// order of the variants is part of the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustLevel {
    Untrusted = 0,
    TrustedUnverified = 1,
    TrustedVerified = 2,
}

impl TrustLevel {
    pub fn ordinal(self) -> i64 {
        self as i64
    }

    pub fn from_ordinal(value: i64) -> Result<Self, StoreError> {
        match value {
            0 => Ok(TrustLevel::Untrusted),
            1 => Ok(TrustLevel::TrustedUnverified),
            2 => Ok(TrustLevel::TrustedVerified),
            other => Err(StoreError::InvalidTrustLevel(other)),
        }
    }

    pub fn is_trusted(self) -> bool {
        matches!(self, TrustLevel::TrustedUnverified | TrustLevel::TrustedVerified)
    }
}

// ── Trust policy ─────────────────────────────────────────────────────────────

/// How newly seen identity keys are trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrustPolicy {
    NeverAutoTrust,
    #[default]
    OnFirstUse,
    AlwaysTrust,
}

impl TrustPolicy {
    /// Trust level given to a key being stored under this policy.
    pub fn level_for_new_identity(self, first_identity: bool) -> TrustLevel {
        match self {
            TrustPolicy::AlwaysTrust => TrustLevel::TrustedUnverified,
            TrustPolicy::OnFirstUse if first_identity => TrustLevel::TrustedUnverified,
            _ => TrustLevel::Untrusted,
        }
    }
}

impl FromStr for TrustPolicy {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "NEVER_AUTO_TRUST" | "NEVER" => Ok(TrustPolicy::NeverAutoTrust),
            "ON_FIRST_USE" | "TOFU" => Ok(TrustPolicy::OnFirstUse),
            "ALWAYS_TRUST" | "ALWAYS" => Ok(TrustPolicy::AlwaysTrust),
            _ => Err(StoreError::Config(format!("unknown trust policy `{s}`"))),
        }
    }
}

// ── Direction ────────────────────────────────────────────────────────────────

/// Whether a trust decision guards an outbound encryption or an inbound decryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Sending,
    Receiving,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Sending => f.write_str("sending"),
            Direction::Receiving => f.write_str("receiving"),
        }
    }
}

// ── Identity record ──────────────────────────────────────────────────────────

/// The one stored identity for a remote address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRecord {
    pub address: String,
    pub identity_key: IdentityKey,
    pub trust_level: TrustLevel,
    /// When the current key was first accepted. Millisecond precision, as stored.
    pub added_at: DateTime<Utc>,
}

impl IdentityRecord {
    pub fn is_trusted(&self) -> bool {
        self.trust_level.is_trusted()
    }

    pub(crate) fn added_timestamp_millis(&self) -> i64 {
        self.added_at.timestamp_millis()
    }
}

/// `Utc::now()` truncated to the millisecond precision the identity table keeps.
pub(crate) fn now_millis() -> DateTime<Utc> {
    let millis = Utc::now().timestamp_millis();
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_key_rejects_bad_framing() {
        assert!(IdentityKey::from_bytes(&[DJB_KEY_TYPE; 32]).is_err());
        let mut raw = [7u8; IDENTITY_KEY_LEN];
        assert!(IdentityKey::from_bytes(&raw).is_err());
        raw[0] = DJB_KEY_TYPE;
        let key = IdentityKey::from_bytes(&raw).unwrap();
        assert_eq!(key.as_bytes(), &raw[..]);
        assert_eq!(key, IdentityKey::from_public_key(&[7u8; 32]));
    }

    #[test]
    fn fingerprint_is_grouped_hex() {
        let key = IdentityKey::from_public_key(&[0xab; 32]);
        assert_eq!(key.fingerprint(), "05ab abab abab abab");
    }

    #[test]
    fn trust_level_ordinals_are_stable() {
        for level in [
            TrustLevel::Untrusted,
            TrustLevel::TrustedUnverified,
            TrustLevel::TrustedVerified,
        ] {
            assert_eq!(TrustLevel::from_ordinal(level.ordinal()).unwrap(), level);
        }
        assert_eq!(TrustLevel::Untrusted.ordinal(), 0);
        assert_eq!(TrustLevel::TrustedVerified.ordinal(), 2);
        assert!(matches!(
            TrustLevel::from_ordinal(9),
            Err(StoreError::InvalidTrustLevel(9))
        ));
        assert!(!TrustLevel::Untrusted.is_trusted());
        assert!(TrustLevel::TrustedVerified.is_trusted());
    }

    #[test]
    fn policy_decides_level_of_new_identity() {
        use TrustLevel::*;
        assert_eq!(TrustPolicy::OnFirstUse.level_for_new_identity(true), TrustedUnverified);
        assert_eq!(TrustPolicy::OnFirstUse.level_for_new_identity(false), Untrusted);
        assert_eq!(TrustPolicy::NeverAutoTrust.level_for_new_identity(true), Untrusted);
        assert_eq!(TrustPolicy::AlwaysTrust.level_for_new_identity(false), TrustedUnverified);
    }

    #[test]
    fn policy_parses_config_spellings() {
        assert_eq!("on_first_use".parse::<TrustPolicy>().unwrap(), TrustPolicy::OnFirstUse);
        assert_eq!("ALWAYS-TRUST".parse::<TrustPolicy>().unwrap(), TrustPolicy::AlwaysTrust);
        assert_eq!("never".parse::<TrustPolicy>().unwrap(), TrustPolicy::NeverAutoTrust);
        assert!("sometimes".parse::<TrustPolicy>().is_err());
    }
}
