//! Account database schema.
//!
//! When changing a CREATE statement here, add the matching step to
//! [`AccountSchema::upgrade`] and bump [`ACCOUNT_SCHEMA_VERSION`].

use rusqlite::Transaction;
use tracing::info;

use crate::database::Schema;
use crate::error::Result;
use crate::models::{DJB_KEY_TYPE, IDENTITY_KEY_LEN};

pub const ACCOUNT_SCHEMA_VERSION: i64 = 3;

const CREATE_RECIPIENT: &str = "
    CREATE TABLE recipient (
      _id INTEGER PRIMARY KEY,
      address TEXT UNIQUE NOT NULL,
      storage_id BLOB
    ) STRICT;
";

const CREATE_IDENTITY: &str = "
    CREATE TABLE identity (
      _id INTEGER PRIMARY KEY,
      address TEXT UNIQUE NOT NULL,
      identity_key BLOB NOT NULL,
      added_timestamp INTEGER NOT NULL,
      trust_level INTEGER NOT NULL
    ) STRICT;
";

#[derive(Debug, Clone, Copy, Default)]
pub struct AccountSchema;

impl Schema for AccountSchema {
    fn create(&self, tx: &Transaction<'_>) -> Result<()> {
        tx.execute_batch(CREATE_RECIPIENT)?;
        tx.execute_batch(CREATE_IDENTITY)?;
        Ok(())
    }

    fn upgrade(&self, tx: &Transaction<'_>, from_version: i64) -> Result<()> {
        if from_version < 2 {
            info!("account schema v2: adding recipient table");
            tx.execute_batch(CREATE_RECIPIENT)?;
        }
        if from_version < 3 {
            // Keys that can no longer be parsed would be reset on every read.
            let purged = tx.execute(
                "DELETE FROM identity WHERE length(identity_key) != ?1 OR substr(identity_key, 1, 1) != ?2",
                rusqlite::params![IDENTITY_KEY_LEN as i64, vec![DJB_KEY_TYPE]],
            )?;
            info!(purged, "account schema v3: removed malformed identity keys");
        }
        Ok(())
    }
}
