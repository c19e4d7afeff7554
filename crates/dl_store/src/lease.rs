//! Connection lease tracking.
//!
//! The pool holds a single physical connection, so a borrower that forgets to
//! give it back shows up as an acquisition timeout somewhere unrelated. Every
//! lease is therefore recorded here with where and when it was taken, and the
//! whole table is logged when an acquisition fails.

use std::backtrace::{Backtrace, BacktraceStatus};
use std::fmt::Write as _;
use std::ops::{Deref, DerefMut};
use std::panic::Location;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::trace;
use uuid::Uuid;

#[derive(Debug)]
struct LeaseEntry {
    id: Uuid,
    call_site: &'static Location<'static>,
    thread: Option<String>,
    acquired_at: Instant,
    backtrace: Option<Backtrace>,
}

/// Point-in-time view of one outstanding lease.
#[derive(Debug, Clone)]
pub struct LeaseSnapshot {
    pub id: Uuid,
    pub call_site: String,
    pub thread: Option<String>,
    pub age: Duration,
}

#[derive(Debug, Default)]
pub(crate) struct LeaseRegistry {
    entries: Mutex<Vec<LeaseEntry>>,
}

impl LeaseRegistry {
    pub(crate) fn register(&self, call_site: &'static Location<'static>) -> Uuid {
        let id = Uuid::new_v4();
        let backtrace = Backtrace::capture();
        let entry = LeaseEntry {
            id,
            call_site,
            thread: std::thread::current().name().map(str::to_owned),
            acquired_at: Instant::now(),
            backtrace: (backtrace.status() == BacktraceStatus::Captured).then_some(backtrace),
        };
        trace!(lease = %id, call_site = %call_site, "acquiring connection");
        self.entries.lock().push(entry);
        id
    }

    pub(crate) fn release(&self, id: Uuid) {
        let mut entries = self.entries.lock();
        if let Some(pos) = entries.iter().position(|e| e.id == id) {
            entries.remove(pos);
        }
    }

    pub(crate) fn snapshot(&self) -> Vec<LeaseSnapshot> {
        self.entries
            .lock()
            .iter()
            .map(|e| LeaseSnapshot {
                id: e.id,
                call_site: e.call_site.to_string(),
                thread: e.thread.clone(),
                age: e.acquired_at.elapsed(),
            })
            .collect()
    }

    /// One line per lease, oldest first: `id: age_ms: thread @ call site`.
    pub(crate) fn describe(&self) -> String {
        let entries = self.entries.lock();
        let mut out = String::new();
        for e in entries.iter() {
            let _ = write!(
                out,
                "\n  {}: {}ms: {} @ {}",
                e.id,
                e.acquired_at.elapsed().as_millis(),
                e.thread.as_deref().unwrap_or("<unnamed>"),
                e.call_site
            );
            if let Some(bt) = &e.backtrace {
                let _ = write!(out, "\n{bt}");
            }
        }
        out
    }
}

/// A pooled connection whose lease is visible in the registry until dropped.
pub struct LeasedConnection {
    conn: PooledConnection<SqliteConnectionManager>,
    id: Uuid,
    registry: Arc<LeaseRegistry>,
}

impl LeasedConnection {
    pub(crate) fn new(
        conn: PooledConnection<SqliteConnectionManager>,
        id: Uuid,
        registry: Arc<LeaseRegistry>,
    ) -> Self {
        Self { conn, id, registry }
    }

    pub fn lease_id(&self) -> Uuid {
        self.id
    }
}

impl Deref for LeasedConnection {
    type Target = Connection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl DerefMut for LeasedConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for LeasedConnection {
    fn drop(&mut self) {
        trace!(lease = %self.id, "releasing connection");
        self.registry.release(self.id);
    }
}
