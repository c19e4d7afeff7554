//! Identity trust store.
//!
//! Holds the one identity key recorded for each remote address and decides,
//! per outbound encryption or inbound decryption, whether that key is trusted.
//!
//! ## Decision table (`evaluate_trust`)
//!
//! | policy         | stored record    | direction | result                        |
//! |----------------|------------------|-----------|-------------------------------|
//! | `ALWAYS_TRUST` | any              | any       | trusted, storage untouched    |
//! | other          | none             | any       | store key, trusted if TOFU    |
//! | other          | same key         | any       | stored level                  |
//! | other          | different key    | sending   | replace key as `UNTRUSTED`    |
//! | other          | different key    | receiving | not trusted, storage untouched|
//!
//! An inbound message is unauthenticated, so it may never replace a recorded
//! key. Only a send, which the local user started, accepts a changed key, and
//! it does so untrusted so the send is blocked until the user re-verifies.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, trace, warn};

use crate::config::SharedPolicy;
use crate::database::Database;
use crate::error::Result;
use crate::legacy::LegacyIdentityFile;
use crate::models::{now_millis, Direction, IdentityKey, IdentityRecord, TrustLevel, TrustPolicy};
use crate::notify::IdentityChanges;
use crate::recipients::StorageIdRotation;
use crate::scope::ConnectionSource;

/// Policy input, read on every evaluation.
pub type PolicySource = Arc<dyn Fn() -> TrustPolicy + Send + Sync>;

#[derive(Clone)]
pub struct IdentityStore<'c> {
    source: ConnectionSource<'c>,
    policy: PolicySource,
    storage_ids: Arc<dyn StorageIdRotation>,
    changes: IdentityChanges,
    retrying_decryption: Arc<Suppression>,
}

/// Recording is suppressed while `forced` is set or any batch guard is alive.
#[derive(Default)]
struct Suppression {
    forced: AtomicBool,
    batches: AtomicUsize,
}

impl Suppression {
    fn is_active(&self) -> bool {
        self.forced.load(Ordering::SeqCst) || self.batches.load(Ordering::SeqCst) > 0
    }
}

impl IdentityStore<'static> {
    pub fn new<P>(database: Database, policy: P, storage_ids: Arc<dyn StorageIdRotation>) -> Self
    where
        P: Fn() -> TrustPolicy + Send + Sync + 'static,
    {
        Self::from_source(ConnectionSource::Pool(database), Arc::new(policy), storage_ids)
    }

    pub fn with_shared_policy(
        database: Database,
        policy: SharedPolicy,
        storage_ids: Arc<dyn StorageIdRotation>,
    ) -> Self {
        Self::new(database, move || policy.get(), storage_ids)
    }
}

impl<'c> IdentityStore<'c> {
    /// Run on the pool or on a caller's connection. Exactly one of the two
    /// must be given.
    pub fn from_parts(
        database: Option<Database>,
        connection: Option<&'c Connection>,
        policy: PolicySource,
        storage_ids: Arc<dyn StorageIdRotation>,
    ) -> Result<Self> {
        let source = ConnectionSource::from_parts(database, connection)?;
        Ok(Self::from_source(source, policy, storage_ids))
    }

    fn from_source(
        source: ConnectionSource<'c>,
        policy: PolicySource,
        storage_ids: Arc<dyn StorageIdRotation>,
    ) -> Self {
        Self {
            source,
            policy,
            storage_ids,
            changes: IdentityChanges::default(),
            retrying_decryption: Arc::default(),
        }
    }

    /// A copy bound to `conn`. It shares the change stream, the suppression
    /// state, the policy and the recipient collaborator with `self`.
    pub fn with_connection<'a>(&self, conn: &'a Connection) -> IdentityStore<'a> {
        IdentityStore {
            source: ConnectionSource::Connection(conn),
            policy: Arc::clone(&self.policy),
            storage_ids: Arc::clone(&self.storage_ids),
            changes: self.changes.clone(),
            retrying_decryption: Arc::clone(&self.retrying_decryption),
        }
    }

    /// Addresses whose identity was newly stored or replaced.
    pub fn subscribe(&self) -> UnboundedReceiver<String> {
        self.changes.subscribe()
    }

    // ── Suppression ──────────────────────────────────────────────────────────

    /// Switch suppression on or off by hand. Guards from
    /// [`retrying_decryption`](Self::retrying_decryption) are counted
    /// separately, so turning this off does not end a live batch.
    pub fn set_retrying_decryption(&self, on: bool) {
        self.retrying_decryption.forced.store(on, Ordering::SeqCst);
        debug!(on, "retrying-decryption suppression");
    }

    pub fn is_retrying_decryption(&self) -> bool {
        self.retrying_decryption.is_active()
    }

    /// Suppress identity recording until the guard is dropped. Hold one guard
    /// per replay batch; batches may overlap and recording resumes only once
    /// the last guard is gone.
    pub fn retrying_decryption(&self) -> RetryingDecryption {
        let batches = self.retrying_decryption.batches.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(batches, "retrying-decryption batch started");
        RetryingDecryption {
            suppression: Arc::clone(&self.retrying_decryption),
        }
    }

    // ── Writes ───────────────────────────────────────────────────────────────

    /// Store `key` for `address` unless it is already the recorded key.
    /// Returns whether anything was written. Always `false` while
    /// retrying decryption.
    pub fn record_identity_if_changed(&self, address: &str, key: &IdentityKey) -> Result<bool> {
        if self.is_retrying_decryption() {
            trace!(address, "retrying decryption, not recording identity");
            return Ok(false);
        }

        let changed = self.source.run_in_transaction(|conn| {
            let existing = load_identity(conn, address)?;
            if let Some(record) = &existing {
                if record.identity_key == *key {
                    trace!(address, "identity already stored, keeping trust level");
                    return Ok(false);
                }
            }
            self.save_new_identity(conn, address, key, existing.is_none())?;
            Ok(true)
        })?;

        if changed {
            self.changes.publish(address);
        }
        Ok(changed)
    }

    /// Change the trust level of the recorded key. `false` when there is no
    /// record, the record holds a different key than `expected_key`, or the
    /// level is already `level`; the caller should re-read in that case.
    pub fn set_trust_level(
        &self,
        address: &str,
        expected_key: &IdentityKey,
        level: TrustLevel,
    ) -> Result<bool> {
        self.source.run_in_transaction(|conn| {
            let Some(record) = load_identity(conn, address)? else {
                debug!(address, "no identity stored, not updating trust");
                return Ok(false);
            };
            if record.identity_key != *expected_key {
                debug!(address, "identity key changed, not updating trust");
                return Ok(false);
            }
            if record.trust_level == level {
                trace!(address, ?level, "trust level unchanged");
                return Ok(false);
            }

            let updated = IdentityRecord {
                trust_level: level,
                ..record
            };
            self.store_identity(conn, &updated)?;
            Ok(true)
        })
    }

    /// Whether `key` may be used for `address` in `direction`. May record a
    /// first-use key or, when sending, a replacement key.
    pub fn evaluate_trust(
        &self,
        address: &str,
        key: &IdentityKey,
        direction: Direction,
    ) -> Result<bool> {
        let policy = (self.policy)();
        if policy == TrustPolicy::AlwaysTrust {
            trace!(address, %direction, "trusting identity, policy is always-trust");
            return Ok(true);
        }

        let (trusted, saved) = self.source.run_in_transaction(|conn| {
            let (record, saved) = match load_identity(conn, address)? {
                None => {
                    debug!(address, "initial identity found, saving");
                    self.save_new_identity_with(conn, address, key, policy, true)?;
                    (load_identity(conn, address)?, true)
                }
                Some(record) if record.identity_key == *key => (Some(record), false),
                Some(_) if direction == Direction::Sending => {
                    debug!(address, "changed identity found, saving");
                    self.save_new_identity_with(conn, address, key, policy, false)?;
                    (load_identity(conn, address)?, true)
                }
                Some(_) => (None, false),
            };
            Ok((record.map_or(false, |r| r.is_trusted()), saved))
        })?;

        if saved {
            self.changes.publish(address);
        }
        trace!(address, %direction, trusted, "trusting identity");
        Ok(trusted)
    }

    // ── Bulk ─────────────────────────────────────────────────────────────────

    /// Store every record in one transaction. Any failure rolls the whole
    /// batch back. No change notifications are sent.
    pub fn import_legacy_records<I>(&self, records: I) -> Result<usize>
    where
        I: IntoIterator<Item = IdentityRecord>,
    {
        let count = self.source.run_in_transaction(|conn| {
            let mut count = 0;
            for record in records {
                self.store_identity(conn, &record)?;
                count += 1;
            }
            Ok(count)
        })?;
        debug!(count, "imported legacy identities");
        Ok(count)
    }

    /// Import a legacy JSON identity file. Entries with unreadable keys are skipped.
    pub fn import_legacy_file(&self, path: &Path) -> Result<usize> {
        let file = LegacyIdentityFile::load(path)?;
        self.import_legacy_records(file.into_records())
    }

    // ── Reads ────────────────────────────────────────────────────────────────

    pub fn get_identity(&self, address: &str) -> Result<Option<IdentityRecord>> {
        self.source
            .run_with_connection_returning(|conn| load_identity(conn, address))
    }

    /// All readable records, ordered by address. Corrupt rows are skipped.
    pub fn list_identities(&self) -> Result<Vec<IdentityRecord>> {
        self.source.run_with_connection_returning(|conn| {
            let mut stmt = conn.prepare(
                "SELECT address, identity_key, added_timestamp, trust_level
                 FROM identity ORDER BY address",
            )?;
            let rows = stmt.query_map([], RawIdentity::from_row)?;
            let mut records = Vec::new();
            for row in rows {
                if let Some(record) = row?.decode() {
                    records.push(record);
                }
            }
            Ok(records)
        })
    }

    /// Returns whether a record existed.
    pub fn delete_identity(&self, address: &str) -> Result<bool> {
        self.source.run_with_connection_returning(|conn| {
            let deleted = conn.execute("DELETE FROM identity WHERE address = ?1", params![address])?;
            debug!(address, deleted, "deleted identity");
            Ok(deleted > 0)
        })
    }

    // ── Internals ────────────────────────────────────────────────────────────

    fn save_new_identity(
        &self,
        conn: &Connection,
        address: &str,
        key: &IdentityKey,
        first_identity: bool,
    ) -> Result<()> {
        let policy = (self.policy)();
        self.save_new_identity_with(conn, address, key, policy, first_identity)
    }

    fn save_new_identity_with(
        &self,
        conn: &Connection,
        address: &str,
        key: &IdentityKey,
        policy: TrustPolicy,
        first_identity: bool,
    ) -> Result<()> {
        let trust_level = policy.level_for_new_identity(first_identity);
        debug!(
            address,
            fingerprint = %key.fingerprint(),
            ?trust_level,
            first_identity,
            "storing new identity"
        );
        let record = IdentityRecord {
            address: address.to_owned(),
            identity_key: key.clone(),
            trust_level,
            added_at: now_millis(),
        };
        self.store_identity(conn, &record)
    }

    fn store_identity(&self, conn: &Connection, record: &IdentityRecord) -> Result<()> {
        trace!(
            address = %record.address,
            trust_level = ?record.trust_level,
            added = record.added_timestamp_millis(),
            "storing identity"
        );
        conn.execute(
            "INSERT OR REPLACE INTO identity (address, identity_key, added_timestamp, trust_level)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.address,
                record.identity_key.as_bytes(),
                record.added_timestamp_millis(),
                record.trust_level.ordinal(),
            ],
        )?;
        self.storage_ids.rotate_storage_id(conn, &record.address)
    }
}

/// Suppresses identity recording while alive. See
/// [`IdentityStore::retrying_decryption`].
#[must_use = "suppression ends when the guard is dropped"]
pub struct RetryingDecryption {
    suppression: Arc<Suppression>,
}

impl Drop for RetryingDecryption {
    fn drop(&mut self) {
        let batches = self.suppression.batches.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!(batches, "retrying-decryption batch finished");
    }
}

struct RawIdentity {
    address: String,
    key: Vec<u8>,
    added_timestamp: i64,
    trust_level: i64,
}

impl RawIdentity {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            address: row.get(0)?,
            key: row.get(1)?,
            added_timestamp: row.get(2)?,
            trust_level: row.get(3)?,
        })
    }

    /// `None` for rows that can no longer be read; such a record is treated
    /// as absent and overwritten by the next accepted key.
    fn decode(self) -> Option<IdentityRecord> {
        let identity_key = match IdentityKey::from_bytes(&self.key) {
            Ok(key) => key,
            Err(e) => {
                warn!(address = %self.address, error = %e, "failed to load identity key, resetting");
                return None;
            }
        };
        let trust_level = match TrustLevel::from_ordinal(self.trust_level) {
            Ok(level) => level,
            Err(e) => {
                warn!(address = %self.address, error = %e, "failed to load trust level, resetting");
                return None;
            }
        };
        let added_at: DateTime<Utc> =
            DateTime::from_timestamp_millis(self.added_timestamp).unwrap_or_default();
        Some(IdentityRecord {
            address: self.address,
            identity_key,
            trust_level,
            added_at,
        })
    }
}

fn load_identity(conn: &Connection, address: &str) -> Result<Option<IdentityRecord>> {
    let raw = conn
        .query_row(
            "SELECT address, identity_key, added_timestamp, trust_level
             FROM identity WHERE address = ?1",
            params![address],
            RawIdentity::from_row,
        )
        .optional()?;
    Ok(raw.and_then(RawIdentity::decode))
}
