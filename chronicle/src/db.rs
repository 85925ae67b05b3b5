//! The governance database.
//!
//! All relational state shares a single SQLite database. The schema is
//! versioned through the `user_version` header field: migration `N` brings
//! the database to version `N` and is applied in its own transaction when
//! the database is opened. Storage-level invariants live in the migration
//! SQL itself, so they bind direct writes too: the decision and audit logs
//! carry append-only triggers, and a partial unique index keeps a document
//! to one open proposal.
//!
//! Writes that span several tables run through [`transaction`]; units that
//! must not interleave with other writers, like merging a proposal, take
//! the write lock up front with [`transaction_immediate`].
use std::ops::Deref;
use std::path::Path;
use std::sync::Arc;
use std::{fmt, time};

use sqlite as sql;
use thiserror::Error;

/// How long to wait for the database lock before failing a statement.
const BUSY_TIMEOUT: time::Duration = time::Duration::from_secs(6);

/// Database migrations. Migration `N` brings the schema to version `N`.
const MIGRATIONS: &[&str] = &[include_str!("db/migrations/1.sql")];

/// Message raised by the append-only triggers.
const APPEND_ONLY: &str = "append-only";

#[derive(Error, Debug)]
pub enum Error {
    /// An internal error.
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
    /// No rows returned in query result.
    #[error("no rows returned")]
    NoRows,
    /// The database was written by a newer version of the software.
    #[error("database schema version {0} is ahead of this binary")]
    UnknownVersion(usize),
    /// Schema is out of date, migrations need to be run.
    #[error("database is out of date (version {0})")]
    OutOfDate(usize),
}

/// Whether an SQL error was raised by one of the append-only triggers,
/// ie. an `UPDATE` or `DELETE` was attempted on an immutable table.
pub fn is_append_only_violation(err: &sql::Error) -> bool {
    err.message
        .as_deref()
        .is_some_and(|m| m.contains(APPEND_ONLY))
}

/// Transaction behavior. Deferred transactions take the write lock lazily;
/// immediate ones take it on entry, serializing against other writers.
#[derive(Clone, Copy)]
enum Behavior {
    Deferred,
    Immediate,
}

impl Behavior {
    fn begin(&self) -> &'static str {
        match self {
            Self::Deferred => "BEGIN",
            Self::Immediate => "BEGIN IMMEDIATE",
        }
    }
}

fn run<T, E: From<sql::Error>>(
    db: &sql::Connection,
    behavior: Behavior,
    query: impl FnOnce(&sql::Connection) -> Result<T, E>,
) -> Result<T, E> {
    db.execute(behavior.begin())?;

    match query(db) {
        Ok(result) => {
            db.execute("COMMIT")?;
            Ok(result)
        }
        Err(err) => {
            db.execute("ROLLBACK")?;
            Err(err)
        }
    }
}

/// Run an SQL query inside a transaction.
/// Commits the transaction on success, and rolls back on error.
pub fn transaction<T, E: From<sql::Error>>(
    db: &sql::Connection,
    query: impl FnOnce(&sql::Connection) -> Result<T, E>,
) -> Result<T, E> {
    run(db, Behavior::Deferred, query)
}

/// Same as [`transaction`], but takes the write lock up front, so the unit
/// cannot race with other writers.
pub fn transaction_immediate<T, E: From<sql::Error>>(
    db: &sql::Connection,
    query: impl FnOnce(&sql::Connection) -> Result<T, E>,
) -> Result<T, E> {
    run(db, Behavior::Immediate, query)
}

/// Bind an optional string column.
pub(crate) fn opt_text(value: Option<&str>) -> sql::Value {
    match value {
        Some(s) => sql::Value::String(s.to_owned()),
        None => sql::Value::Null,
    }
}

/// Bind an optional integer column.
pub(crate) fn opt_int(value: Option<i64>) -> sql::Value {
    match value {
        Some(i) => sql::Value::Integer(i),
        None => sql::Value::Null,
    }
}

/// Handle to the governance database, shared between stores.
#[derive(Clone)]
pub struct Database {
    pub db: Arc<sql::ConnectionThreadSafe>,
}

impl Deref for Database {
    type Target = sql::ConnectionThreadSafe;

    fn deref(&self) -> &Self::Target {
        &self.db
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database").finish()
    }
}

impl Database {
    /// Open a database at the given path, creating and migrating it as
    /// needed. File-backed databases run in WAL mode so readers don't
    /// block the writer.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let mut db = sql::Connection::open_thread_safe(path)?;
        configure(&mut db)?;
        db.execute("PRAGMA journal_mode = WAL")?;
        migrate(&db)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Same as [`Self::open`], but read-only and without migrating. Useful
    /// for reporting against a live database.
    pub fn reader<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let mut db = sql::Connection::open_thread_safe_with_flags(
            path,
            sqlite::OpenFlags::new().with_read_only(),
        )?;
        configure(&mut db)?;

        let this = Self { db: Arc::new(db) };
        let version = this.version()?;
        if version < MIGRATIONS.len() {
            return Err(Error::OutOfDate(version));
        }
        Ok(this)
    }

    /// Create a new in-memory database. Used by tests.
    pub fn memory() -> Result<Self, Error> {
        let mut db = sql::Connection::open_thread_safe(":memory:")?;
        configure(&mut db)?;
        migrate(&db)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// The schema version this database is at.
    pub fn version(&self) -> Result<usize, Error> {
        version(&self.db)
    }
}

fn configure(db: &mut sql::ConnectionThreadSafe) -> Result<(), Error> {
    db.set_busy_timeout(BUSY_TIMEOUT.as_millis() as usize)?;
    db.execute("PRAGMA foreign_keys = ON")?;

    Ok(())
}

/// Get the `user_version` value from the database header.
pub fn version(db: &sql::Connection) -> Result<usize, Error> {
    let version = db
        .prepare("PRAGMA user_version")?
        .into_iter()
        .next()
        .ok_or(Error::NoRows)??
        .read::<i64, _>(0);

    Ok(version as usize)
}

/// Apply any pending migrations, each in its own transaction, and return
/// the resulting schema version. A database from a newer binary is refused
/// rather than misread.
pub fn migrate(db: &sql::Connection) -> Result<usize, Error> {
    let current = version(db)?;
    if current > MIGRATIONS.len() {
        return Err(Error::UnknownVersion(current));
    }
    for (i, migration) in MIGRATIONS.iter().enumerate().skip(current) {
        transaction(db, |db| {
            db.execute(migration)?;
            db.execute(format!("PRAGMA user_version = {}", i + 1))?;

            Ok::<_, Error>(())
        })?;
    }
    version(db)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_version() {
        let db = Database::memory().unwrap();
        assert_eq!(db.version().unwrap(), MIGRATIONS.len());

        // Migrating again is a no-op.
        assert_eq!(migrate(&db).unwrap(), MIGRATIONS.len());
    }

    #[test]
    fn test_newer_schema_is_refused() {
        let db = Database::memory().unwrap();
        db.execute("PRAGMA user_version = 99").unwrap();
        assert!(matches!(migrate(&db), Err(Error::UnknownVersion(99))));
    }

    #[test]
    fn test_transaction_rolls_back() {
        let db = Database::memory().unwrap();
        let result: Result<(), Error> = transaction(&db, |conn| {
            conn.execute("INSERT INTO workspaces (id, name, created_at) VALUES ('w', 'w', 0)")?;
            Err(Error::NoRows)
        });
        assert!(result.is_err());

        let rows = db
            .prepare("SELECT COUNT(*) AS n FROM workspaces")
            .unwrap()
            .into_iter()
            .next()
            .unwrap()
            .unwrap()
            .read::<i64, _>("n");
        assert_eq!(rows, 0);
    }
}
