//! Store configuration: where the account database lives, how the pool is
//! sized and which trust policy applies to new identities.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use directories::ProjectDirs;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::models::TrustPolicy;

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "darklock";
pub const APP_NAME: &str = "secure-channel";

pub const DATABASE_FILE_NAME: &str = "account.db";

pub const ENV_DATABASE_PATH: &str = "DL_STORE_PATH";
pub const ENV_TRUST_POLICY: &str = "DL_TRUST_POLICY";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// How long a caller waits for the single pooled connection.
    pub acquire_timeout_secs: u64,
    /// SQLite busy handler timeout for lock contention with other processes.
    pub busy_timeout_secs: u64,
}

impl PoolSettings {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs.max(1))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_secs(self.busy_timeout_secs)
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            acquire_timeout_secs: 30,
            busy_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub database_path: Option<PathBuf>,
    #[serde(default)]
    pub trust_new_identities: TrustPolicy,
    #[serde(default)]
    pub pool: PoolSettings,
}

impl StoreConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Like [`StoreConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "no store config, using defaults");
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(
            std::env::var(ENV_DATABASE_PATH).ok(),
            std::env::var(ENV_TRUST_POLICY).ok(),
        )
    }

    fn with_overrides(mut self, path: Option<String>, policy: Option<String>) -> Result<Self> {
        if let Some(path) = path.filter(|p| !p.is_empty()) {
            self.database_path = Some(PathBuf::from(path));
        }
        if let Some(policy) = policy.filter(|p| !p.is_empty()) {
            self.trust_new_identities = policy.parse()?;
        }
        Ok(self)
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join(DATABASE_FILE_NAME)),
        }
    }

    /// A live policy cell seeded from this config. Stores read it on every
    /// trust evaluation, so updates apply without rebuilding them.
    pub fn policy_handle(&self) -> SharedPolicy {
        SharedPolicy::new(self.trust_new_identities)
    }
}

pub fn data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| StoreError::Config("cannot determine data directory".into()))?;
    Ok(dirs.data_dir().to_path_buf())
}

/// Shared, updatable trust policy.
#[derive(Debug, Clone)]
pub struct SharedPolicy(Arc<RwLock<TrustPolicy>>);

impl SharedPolicy {
    pub fn new(policy: TrustPolicy) -> Self {
        Self(Arc::new(RwLock::new(policy)))
    }

    pub fn get(&self) -> TrustPolicy {
        *self.0.read()
    }

    pub fn set(&self, policy: TrustPolicy) {
        *self.0.write() = policy;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_match_pool_policy() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.trust_new_identities, TrustPolicy::OnFirstUse);
        assert_eq!(cfg.pool.acquire_timeout(), Duration::from_secs(30));
        assert_eq!(cfg.pool.busy_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn partial_json_fills_defaults() {
        let cfg: StoreConfig =
            serde_json::from_str(r#"{ "trust_new_identities": "NEVER_AUTO_TRUST" }"#).unwrap();
        assert_eq!(cfg.trust_new_identities, TrustPolicy::NeverAutoTrust);
        assert_eq!(cfg.pool, PoolSettings::default());
        assert!(cfg.database_path.is_none());
    }

    #[test]
    fn partial_pool_section_fills_defaults() {
        let cfg: StoreConfig =
            serde_json::from_str(r#"{ "pool": { "acquire_timeout_secs": 5 } }"#).unwrap();
        assert_eq!(cfg.pool.acquire_timeout_secs, 5);
        assert_eq!(cfg.pool.busy_timeout_secs, PoolSettings::default().busy_timeout_secs);
    }

    #[test]
    fn save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("conf").join("store.json");
        assert!(StoreConfig::load_or_default(&path).unwrap().database_path.is_none());

        let cfg = StoreConfig {
            database_path: Some(dir.path().join("a.db")),
            trust_new_identities: TrustPolicy::AlwaysTrust,
            pool: PoolSettings {
                acquire_timeout_secs: 5,
                busy_timeout_secs: 1,
            },
        };
        cfg.save(&path).unwrap();
        let loaded = StoreConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded.database_path, cfg.database_path);
        assert_eq!(loaded.trust_new_identities, TrustPolicy::AlwaysTrust);
        assert_eq!(loaded.pool.acquire_timeout_secs, 5);
        assert_eq!(loaded.database_path().unwrap(), dir.path().join("a.db"));
    }

    #[test]
    fn overrides_replace_values() {
        let cfg = StoreConfig::default()
            .with_overrides(Some("/tmp/x.db".into()), Some("always".into()))
            .unwrap();
        assert_eq!(cfg.database_path, Some(PathBuf::from("/tmp/x.db")));
        assert_eq!(cfg.trust_new_identities, TrustPolicy::AlwaysTrust);

        let err = StoreConfig::default().with_overrides(None, Some("bogus".into()));
        assert!(matches!(err, Err(StoreError::Config(_))));
    }

    #[test]
    fn shared_policy_is_live() {
        let policy = StoreConfig::default().policy_handle();
        let other = policy.clone();
        other.set(TrustPolicy::AlwaysTrust);
        assert_eq!(policy.get(), TrustPolicy::AlwaysTrust);
    }
}
