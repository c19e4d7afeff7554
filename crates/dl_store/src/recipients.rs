//! Recipient directory: address → stable internal id, plus the storage id
//! that marks a recipient for re-synchronisation with the remote directory.

use rusqlite::{params, Connection, OptionalExtension};
use tracing::trace;

use crate::database::Database;
use crate::error::Result;
use crate::scope::{within_transaction, ConnectionSource};

const STORAGE_ID_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecipientId(pub i64);

/// Marks an address for re-sync. Called by the identity store on the same
/// connection as the identity write, so both land in one transaction.
pub trait StorageIdRotation: Send + Sync {
    fn rotate_storage_id(&self, conn: &Connection, address: &str) -> Result<()>;
}

/// [`StorageIdRotation`] backed by the `recipient` table.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecipientStorageIds;

impl StorageIdRotation for RecipientStorageIds {
    fn rotate_storage_id(&self, conn: &Connection, address: &str) -> Result<()> {
        write_storage_id(conn, address)
    }
}

#[derive(Clone)]
pub struct RecipientStore<'c> {
    source: ConnectionSource<'c>,
}

impl RecipientStore<'static> {
    pub fn new(database: Database) -> Self {
        Self {
            source: ConnectionSource::Pool(database),
        }
    }
}

impl<'c> RecipientStore<'c> {
    /// Run on the pool or on a caller's connection. Exactly one of the two
    /// must be given.
    pub fn from_parts(
        database: Option<Database>,
        connection: Option<&'c Connection>,
    ) -> Result<Self> {
        Ok(Self {
            source: ConnectionSource::from_parts(database, connection)?,
        })
    }

    /// A copy that runs on `conn` and never releases it.
    pub fn with_connection<'a>(&self, conn: &'a Connection) -> RecipientStore<'a> {
        RecipientStore {
            source: ConnectionSource::Connection(conn),
        }
    }

    /// Id for `address`, creating the recipient on first sight.
    pub fn resolve(&self, address: &str) -> Result<RecipientId> {
        self.source
            .run_in_transaction(|conn| resolve_recipient(conn, address))
    }

    /// Id for `address` without creating it.
    pub fn find(&self, address: &str) -> Result<Option<RecipientId>> {
        self.source.run_with_connection_returning(|conn| {
            Ok(conn
                .query_row(
                    "SELECT _id FROM recipient WHERE address = ?1",
                    params![address],
                    |row| row.get(0),
                )
                .optional()?
                .map(RecipientId))
        })
    }

    pub fn rotate_storage_id(&self, address: &str) -> Result<()> {
        self.source
            .run_in_transaction(|conn| write_storage_id(conn, address))
    }

    pub fn storage_id(&self, address: &str) -> Result<Option<Vec<u8>>> {
        self.source.run_with_connection_returning(|conn| {
            Ok(conn
                .query_row(
                    "SELECT storage_id FROM recipient WHERE address = ?1",
                    params![address],
                    |row| row.get::<_, Option<Vec<u8>>>(0),
                )
                .optional()?
                .flatten())
        })
    }
}

fn resolve_recipient(conn: &Connection, address: &str) -> Result<RecipientId> {
    conn.execute(
        "INSERT INTO recipient (address) VALUES (?1) ON CONFLICT(address) DO NOTHING",
        params![address],
    )?;
    let id = conn.query_row(
        "SELECT _id FROM recipient WHERE address = ?1",
        params![address],
        |row| row.get(0),
    )?;
    Ok(RecipientId(id))
}

fn write_storage_id(conn: &Connection, address: &str) -> Result<()> {
    within_transaction(conn, |conn| {
        let storage_id: [u8; STORAGE_ID_LEN] = rand::random();
        conn.execute(
            "INSERT INTO recipient (address, storage_id) VALUES (?1, ?2)
             ON CONFLICT(address) DO UPDATE SET storage_id = excluded.storage_id",
            params![address, storage_id.as_slice()],
        )?;
        trace!(address, "rotated recipient storage id");
        Ok(())
    })
}
