//! dl_store: account database for Darklock Secure Channel
//!
//! # Layout
//! - [`database`]: SQLite behind a single-connection pool, schema versioned
//!   through `PRAGMA user_version`, every connection lease tracked.
//! - [`scope`]: stores run either on a leased connection per call or on a
//!   caller's connection, so several stores can share one transaction.
//! - [`identity`]: remote identity keys and the trust decision made before
//!   every encryption and decryption.
//! - [`recipients`]: address resolution and storage-id rotation.
//!
//! # Concurrency
//! Everything here is blocking. The pool holds exactly one connection, so all
//! store calls serialise on acquisition; keep leases short.

pub mod config;
pub mod database;
pub mod error;
pub mod identity;
pub mod lease;
pub mod legacy;
pub mod models;
pub mod notify;
pub mod recipients;
pub mod schema;
pub mod scope;

pub use config::{SharedPolicy, StoreConfig};
pub use database::{Database, Schema};
pub use error::{Result, StoreError};
pub use identity::{IdentityStore, RetryingDecryption};
pub use lease::{LeaseSnapshot, LeasedConnection};
pub use models::{Direction, IdentityKey, IdentityRecord, TrustLevel, TrustPolicy};
pub use notify::IdentityChanges;
pub use recipients::{RecipientId, RecipientStorageIds, RecipientStore, StorageIdRotation};
pub use schema::{AccountSchema, ACCOUNT_SCHEMA_VERSION};
pub use scope::ConnectionSource;

/// Open the account database described by `config`.
pub fn open_account_database(config: &StoreConfig) -> Result<Database> {
    Database::open_with(
        &config.database_path()?,
        ACCOUNT_SCHEMA_VERSION,
        &AccountSchema,
        &config.pool,
    )
}
