//! Storage engine: one SQLite database behind a single-connection pool, with
//! the schema version kept in the database header (`PRAGMA user_version`).
//!
//! Foreign-key enforcement and the busy timeout are set per connection in the
//! pool's init hook. WAL journal mode is persisted in the file itself, so it is
//! switched on only after the stored version has been accepted: a database
//! written by a newer release is refused without being touched. It is never
//! set inside a migration because SQLite refuses to change `journal_mode`
//! inside a transaction.

use std::panic::Location;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, Transaction};
use tracing::{debug, error, info};

use crate::config::PoolSettings;
use crate::error::{Result, StoreError};
use crate::lease::{LeaseRegistry, LeaseSnapshot, LeasedConnection};

/// Table bootstrap and migration ladder for one database.
///
/// Both hooks run inside the transaction that also stamps the new version,
/// so a failing step leaves the stored version and tables untouched.
pub trait Schema {
    /// Create every table of a fresh database (stored version 0).
    fn create(&self, tx: &Transaction<'_>) -> Result<()>;

    /// Migrate forward from `from_version`. Steps are forward-only; the
    /// target version is stamped by the engine afterwards.
    fn upgrade(&self, tx: &Transaction<'_>, from_version: i64) -> Result<()>;
}

/// Handle to an open database. Cheap to clone (Arc internally).
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

struct DatabaseInner {
    path: PathBuf,
    version: i64,
    pool: RwLock<Option<Pool<SqliteConnectionManager>>>,
    leases: Arc<LeaseRegistry>,
}

impl Database {
    /// Open (or create) the database at `path` with the default pool settings.
    pub fn open(path: &Path, expected_version: i64, schema: &dyn Schema) -> Result<Self> {
        Self::open_with(path, expected_version, schema, &PoolSettings::default())
    }

    pub fn open_with(
        path: &Path,
        expected_version: i64,
        schema: &dyn Schema,
        settings: &PoolSettings,
    ) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let pool = build_pool(path, settings)?;
        let db = Self {
            inner: Arc::new(DatabaseInner {
                path: path.to_path_buf(),
                version: expected_version,
                pool: RwLock::new(Some(pool)),
                leases: Arc::new(LeaseRegistry::default()),
            }),
        };
        // On failure `db` is dropped here, which closes the pool.
        db.initialise(schema)?;
        db.enable_wal()?;
        Ok(db)
    }

    fn enable_wal(&self) -> Result<()> {
        let conn = self.acquire_connection()?;
        let mode = conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        debug!(mode = %mode, "journal mode set");
        Ok(())
    }

    fn initialise(&self, schema: &dyn Schema) -> Result<()> {
        let expected = self.inner.version;
        let mut conn = self.acquire_connection()?;
        let tx = conn.transaction()?;

        let stored = read_user_version(&tx)?;
        debug!(
            stored,
            expected,
            path = %self.inner.path.display(),
            "checking database schema version"
        );

        if stored == 0 {
            info!(version = expected, "creating database schema");
            schema.create(&tx)?;
            tx.pragma_update(None, "user_version", expected)?;
        } else if stored > expected {
            error!(
                stored,
                expected,
                "database has been updated by a newer release"
            );
            return Err(StoreError::IncompatibleSchemaVersion { stored, expected });
        } else if stored < expected {
            info!(from = stored, to = expected, "upgrading database schema");
            schema.upgrade(&tx, stored)?;
            tx.pragma_update(None, "user_version", expected)?;
        }

        tx.commit()?;
        Ok(())
    }

    /// Lease the pooled connection. The lease is recorded with the caller's
    /// location until the returned handle is dropped.
    #[track_caller]
    pub fn acquire_connection(&self) -> Result<LeasedConnection> {
        let call_site = Location::caller();
        let pool = self.inner.pool.read().clone().ok_or(StoreError::Closed)?;

        let id = self.inner.leases.register(call_site);
        match pool.get() {
            Ok(conn) => Ok(LeasedConnection::new(conn, id, Arc::clone(&self.inner.leases))),
            Err(e) => {
                error!(
                    lease = %id,
                    error = %e,
                    "connection acquisition failed, possible deadlock. Open leases (the last one failed):{}",
                    self.inner.leases.describe()
                );
                self.inner.leases.release(id);
                Err(StoreError::ConnectionAcquire(e))
            }
        }
    }

    /// Run `f` inside one transaction on a leased connection. Commits on
    /// `Ok`, rolls back on `Err`. Stores rebound to the transaction with
    /// `with_connection` share it.
    #[track_caller]
    pub fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.acquire_connection()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    pub fn schema_version(&self) -> Result<i64> {
        let conn = self.acquire_connection()?;
        read_user_version(&conn)
    }

    /// The version this handle was opened for.
    pub fn expected_version(&self) -> i64 {
        self.inner.version
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Outstanding leases, oldest first.
    pub fn open_leases(&self) -> Vec<LeaseSnapshot> {
        self.inner.leases.snapshot()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.pool.read().is_none()
    }

    /// Release the pool. Later acquisitions fail with [`StoreError::Closed`];
    /// closing again is a no-op.
    pub fn close(&self) {
        if self.inner.pool.write().take().is_some() {
            let leases = self.inner.leases.snapshot().len();
            info!(path = %self.inner.path.display(), open_leases = leases, "database closed");
        }
    }
}

fn build_pool(path: &Path, settings: &PoolSettings) -> Result<Pool<SqliteConnectionManager>> {
    let busy_timeout = settings.busy_timeout();
    let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(())
    });

    // One connection and a short wait: a second concurrent lease is a bug,
    // and it should surface as a timeout rather than a long stall.
    Pool::builder()
        .max_size(1)
        .min_idle(Some(0))
        .max_lifetime(None)
        .connection_timeout(settings.acquire_timeout())
        .build(manager)
        .map_err(StoreError::Pool)
}

fn read_user_version(conn: &Connection) -> Result<i64> {
    Ok(conn.pragma_query_value(None, "user_version", |row| row.get(0))?)
}
