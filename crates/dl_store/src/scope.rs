//! Where a store gets its connection from.
//!
//! A store either leases the pooled connection for the duration of each call,
//! or is bound to a connection somebody else owns (usually an open
//! transaction), in which case it never releases it. Rebinding several stores
//! to the same transaction makes their writes commit or roll back together:
//!
//! ```no_run
//! # use dl_store::{Database, IdentityStore, RecipientStore};
//! # fn demo(db: &Database, identities: &IdentityStore<'static>, recipients: &RecipientStore<'static>) -> dl_store::Result<()> {
//! db.transaction(|tx| {
//!     let recipients = recipients.with_connection(tx);
//!     let identities = identities.with_connection(tx);
//!     recipients.resolve("peer-a")?;
//!     identities.delete_identity("peer-a")?;
//!     Ok(())
//! })
//! # }
//! ```

use rusqlite::Connection;

use crate::database::Database;
use crate::error::{Result, StoreError};

#[derive(Clone)]
pub enum ConnectionSource<'c> {
    /// Lease from the engine per call; released on every exit path.
    Pool(Database),
    /// Caller-owned connection; never released here.
    Connection(&'c Connection),
}

impl<'c> ConnectionSource<'c> {
    /// Exactly one of `database` and `connection` must be given.
    pub fn from_parts(
        database: Option<Database>,
        connection: Option<&'c Connection>,
    ) -> Result<Self> {
        match (database, connection) {
            (Some(db), None) => Ok(ConnectionSource::Pool(db)),
            (None, Some(conn)) => Ok(ConnectionSource::Connection(conn)),
            (Some(_), Some(_)) => Err(StoreError::InvalidConnectionSource(
                "both a database and a connection were supplied",
            )),
            (None, None) => Err(StoreError::InvalidConnectionSource(
                "a database or a connection is required",
            )),
        }
    }

    #[track_caller]
    pub fn run_with_connection<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&Connection) -> Result<()>,
    {
        self.run_with_connection_returning(f)
    }

    #[track_caller]
    pub fn run_with_connection_returning<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        match self {
            ConnectionSource::Pool(db) => {
                let conn = db.acquire_connection()?;
                f(&conn)
            }
            ConnectionSource::Connection(conn) => f(conn),
        }
    }

    /// Like [`run_with_connection_returning`](Self::run_with_connection_returning),
    /// with `f` wrapped in a transaction unless the connection is already in one,
    /// in which case `f` joins the caller's transaction.
    #[track_caller]
    pub fn run_in_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        self.run_with_connection_returning(|conn| within_transaction(conn, f))
    }
}

pub(crate) fn within_transaction<T, F>(conn: &Connection, f: F) -> Result<T>
where
    F: FnOnce(&Connection) -> Result<T>,
{
    if !conn.is_autocommit() {
        return f(conn);
    }
    let tx = conn.unchecked_transaction()?;
    let value = f(&tx)?;
    tx.commit()?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AccountSchema, ACCOUNT_SCHEMA_VERSION};
    use tempfile::tempdir;

    fn open(dir: &tempfile::TempDir) -> Database {
        Database::open(&dir.path().join("scope.db"), ACCOUNT_SCHEMA_VERSION, &AccountSchema).unwrap()
    }

    fn count(conn: &Connection) -> i64 {
        conn.query_row("SELECT COUNT(*) FROM recipient", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn exactly_one_source_is_required() {
        let dir = tempdir().unwrap();
        let db = open(&dir);
        let conn = Connection::open_in_memory().unwrap();

        assert!(matches!(
            ConnectionSource::from_parts(None, None),
            Err(StoreError::InvalidConnectionSource(_))
        ));
        assert!(matches!(
            ConnectionSource::from_parts(Some(db.clone()), Some(&conn)),
            Err(StoreError::InvalidConnectionSource(_))
        ));
        assert!(matches!(
            ConnectionSource::from_parts(Some(db), None),
            Ok(ConnectionSource::Pool(_))
        ));
        assert!(matches!(
            ConnectionSource::from_parts(None, Some(&conn)),
            Ok(ConnectionSource::Connection(_))
        ));
    }

    #[test]
    fn pooled_source_releases_on_error() {
        let dir = tempdir().unwrap();
        let db = open(&dir);
        let source = ConnectionSource::Pool(db.clone());

        let res: Result<()> =
            source.run_with_connection(|_| Err(StoreError::Config("fail".into())));
        assert!(res.is_err());
        assert!(db.open_leases().is_empty());

        source
            .run_with_connection(|conn| {
                conn.execute("INSERT INTO recipient (address) VALUES ('a')", [])?;
                Ok(())
            })
            .unwrap();
        assert!(db.open_leases().is_empty());
    }

    #[test]
    fn borrowed_source_leaves_the_lease_to_its_owner() {
        let dir = tempdir().unwrap();
        let db = open(&dir);
        let conn = db.acquire_connection().unwrap();
        let source = ConnectionSource::Connection(&conn);

        let n = source.run_with_connection_returning(|c| Ok(count(c))).unwrap();
        assert_eq!(n, 0);
        assert_eq!(db.open_leases().len(), 1);
        drop(conn);
        assert!(db.open_leases().is_empty());
    }

    #[test]
    fn nested_transaction_joins_the_outer_one() {
        let dir = tempdir().unwrap();
        let db = open(&dir);

        let res: Result<()> = db.transaction(|tx| {
            let source = ConnectionSource::Connection(tx);
            source.run_in_transaction(|c| {
                c.execute("INSERT INTO recipient (address) VALUES ('x')", [])?;
                Ok(())
            })?;
            Err(StoreError::Config("outer abort".into()))
        });
        assert!(res.is_err());

        let conn = db.acquire_connection().unwrap();
        assert_eq!(count(&conn), 0);
    }

    #[test]
    fn autocommit_connection_gets_its_own_transaction() {
        let dir = tempdir().unwrap();
        let db = open(&dir);
        let source = ConnectionSource::Pool(db.clone());

        let res: Result<()> = source.run_in_transaction(|c| {
            c.execute("INSERT INTO recipient (address) VALUES ('y')", [])?;
            Err(StoreError::Config("abort".into()))
        });
        assert!(res.is_err());
        source
            .run_in_transaction(|c| {
                c.execute("INSERT INTO recipient (address) VALUES ('z')", [])?;
                Ok(())
            })
            .unwrap();

        let conn = db.acquire_connection().unwrap();
        assert_eq!(count(&conn), 1);
    }
}
