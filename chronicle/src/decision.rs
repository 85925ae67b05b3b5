//! The append-only decision log.
//!
//! A decision-log entry is an immutable fact: a thread was resolved with a
//! specific outcome against a specific commit. The storage layer rejects
//! `UPDATE` and `DELETE` with triggers, and retries of the same logical
//! decision are no-ops keyed on `(thread, proposal, commitHash, outcome)`.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlite as sql;
use thiserror::Error;

use crate::common::Timestamp;
use crate::db::{self, transaction, Database};

#[derive(Error, Debug)]
pub enum Error {
    /// An internal error.
    #[error("internal error: {0}")]
    Internal(sql::Error),
    /// The decision log cannot be modified.
    #[error("immutable write: {0}")]
    Immutable(sql::Error),
    /// Malformed participants column.
    #[error("malformed participants: {0}")]
    Participants(#[from] serde_json::Error),
    /// Could not parse a stored outcome.
    #[error("invalid outcome `{0}`")]
    InvalidOutcome(String),
}

impl From<sql::Error> for Error {
    fn from(err: sql::Error) -> Self {
        if db::is_append_only_violation(&err) {
            Self::Immutable(err)
        } else {
            Self::Internal(err)
        }
    }
}

/// Outcome of a resolved deliberation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Accepted,
    Rejected,
    Deferred,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Accepted => write!(f, "accepted"),
            Self::Rejected => write!(f, "rejected"),
            Self::Deferred => write!(f, "deferred"),
        }
    }
}

impl FromStr for Outcome {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            "deferred" => Ok(Self::Deferred),
            other => Err(Error::InvalidOutcome(other.to_owned())),
        }
    }
}

/// A decision-log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Entry {
    pub id: i64,
    pub thread_id: String,
    pub document_id: String,
    pub proposal_id: String,
    pub outcome: Outcome,
    pub rationale: String,
    pub decided_by: String,
    pub decided_at: Timestamp,
    pub commit_hash: String,
    pub participants: Vec<String>,
}

/// A decision about to be recorded.
#[derive(Debug, Clone)]
pub struct NewEntry<'a> {
    pub thread_id: &'a str,
    pub document_id: &'a str,
    pub proposal_id: &'a str,
    pub outcome: Outcome,
    pub rationale: &'a str,
    pub decided_by: &'a str,
    pub commit_hash: &'a str,
    pub participants: &'a [String],
}

/// Filters for listing the decision log.
#[derive(Debug, Clone, Default)]
pub struct Filter<'a> {
    pub outcome: Option<Outcome>,
    pub author: Option<&'a str>,
    pub q: Option<&'a str>,
    pub limit: Option<i64>,
}

/// The decision-log store.
#[derive(Clone)]
pub struct DecisionLog {
    db: Database,
}

impl DecisionLog {
    pub fn open(db: Database) -> Self {
        Self { db }
    }

    /// Append an entry. Returns `None` when the same logical decision was
    /// already recorded.
    pub fn append(&self, entry: &NewEntry) -> Result<Option<i64>, Error> {
        transaction(&self.db, |conn| {
            query::append(conn, entry, Timestamp::now())
        })
    }

    /// List entries for a document, newest first.
    pub fn list(&self, document_id: &str, filter: &Filter) -> Result<Vec<Entry>, Error> {
        let mut sql = String::from(
            "SELECT id, thread_id, document_id, proposal_id, outcome, rationale,
                    decided_by, decided_at, commit_hash, participants
             FROM decision_log
             WHERE document_id = ?1",
        );
        if filter.outcome.is_some() {
            sql.push_str(" AND outcome = ?2");
        }
        if filter.author.is_some() {
            sql.push_str(" AND decided_by = ?3");
        }
        if filter.q.is_some() {
            sql.push_str(" AND rationale LIKE ?4");
        }
        sql.push_str(" ORDER BY decided_at DESC, id DESC LIMIT ?5");

        let mut stmt = self.db.prepare(&sql)?;
        stmt.bind((1, document_id))?;
        if let Some(outcome) = filter.outcome {
            stmt.bind((2, outcome.to_string().as_str()))?;
        }
        if let Some(author) = filter.author {
            stmt.bind((3, author))?;
        }
        if let Some(q) = filter.q {
            stmt.bind((4, format!("%{q}%").as_str()))?;
        }
        stmt.bind((5, filter.limit.unwrap_or(i64::MAX)))?;

        stmt.into_iter()
            .map(|row| row.map_err(Error::from).and_then(|r| query::parse(&r)))
            .collect()
    }

    /// List entries recorded for a proposal.
    pub fn for_proposal(&self, proposal_id: &str) -> Result<Vec<Entry>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT id, thread_id, document_id, proposal_id, outcome, rationale,
                    decided_by, decided_at, commit_hash, participants
             FROM decision_log
             WHERE proposal_id = ?1
             ORDER BY id",
        )?;
        stmt.bind((1, proposal_id))?;

        stmt.into_iter()
            .map(|row| row.map_err(Error::from).and_then(|r| query::parse(&r)))
            .collect()
    }
}

/// Helper SQL queries, shared within the crate.
pub(crate) mod query {
    use super::*;

    /// Append an entry within the caller's transaction. `INSERT OR IGNORE`
    /// against the natural-key index makes retries idempotent.
    pub(crate) fn append(
        db: &sql::Connection,
        entry: &NewEntry,
        now: Timestamp,
    ) -> Result<Option<i64>, Error> {
        let participants = serde_json::to_string(entry.participants)?;
        let mut stmt = db.prepare(
            "INSERT OR IGNORE INTO decision_log
               (thread_id, document_id, proposal_id, outcome, rationale,
                decided_by, decided_at, commit_hash, participants)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )?;
        stmt.bind((1, entry.thread_id))?;
        stmt.bind((2, entry.document_id))?;
        stmt.bind((3, entry.proposal_id))?;
        stmt.bind((4, entry.outcome.to_string().as_str()))?;
        stmt.bind((5, entry.rationale))?;
        stmt.bind((6, entry.decided_by))?;
        stmt.bind((7, now.as_millis() as i64))?;
        stmt.bind((8, entry.commit_hash))?;
        stmt.bind((9, participants.as_str()))?;
        stmt.next()?;

        if db.change_count() == 0 {
            return Ok(None);
        }
        let row = db
            .prepare("SELECT last_insert_rowid() AS id")?
            .into_iter()
            .next()
            .transpose()?;

        Ok(row.map(|r| r.read::<i64, _>("id")))
    }

    pub(super) fn parse(row: &sql::Row) -> Result<Entry, Error> {
        Ok(Entry {
            id: row.read::<i64, _>("id"),
            thread_id: row.read::<&str, _>("thread_id").to_owned(),
            document_id: row.read::<&str, _>("document_id").to_owned(),
            proposal_id: row.read::<&str, _>("proposal_id").to_owned(),
            outcome: row.read::<&str, _>("outcome").parse()?,
            rationale: row.read::<&str, _>("rationale").to_owned(),
            decided_by: row.read::<&str, _>("decided_by").to_owned(),
            decided_at: Timestamp::from_millis(row.read::<i64, _>("decided_at") as u128),
            commit_hash: row.read::<&str, _>("commit_hash").to_owned(),
            participants: serde_json::from_str(row.read::<&str, _>("participants"))?,
        })
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn entry<'a>(thread: &'a str, outcome: Outcome, rationale: &'a str) -> NewEntry<'a> {
        NewEntry {
            thread_id: thread,
            document_id: "doc1",
            proposal_id: "p1",
            outcome,
            rationale,
            decided_by: "alice",
            commit_hash: "abc123",
            participants: &[],
        }
    }

    #[test]
    fn test_append_and_list() {
        let log = DecisionLog::open(Database::memory().unwrap());
        let id = log
            .append(&entry("t1", Outcome::Accepted, "ok"))
            .unwrap()
            .unwrap();
        assert!(id > 0);

        let entries = log.list("doc1", &Filter::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].thread_id, "t1");
        assert_eq!(entries[0].outcome, Outcome::Accepted);
        assert_eq!(entries[0].commit_hash, "abc123");
    }

    #[test]
    fn test_append_is_idempotent_on_natural_key() {
        let log = DecisionLog::open(Database::memory().unwrap());
        log.append(&entry("t1", Outcome::Accepted, "ok")).unwrap();
        let second = log.append(&entry("t1", Outcome::Accepted, "retried")).unwrap();
        assert_eq!(second, None);
        assert_eq!(log.list("doc1", &Filter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_update_fails_at_storage_layer() {
        let log = DecisionLog::open(Database::memory().unwrap());
        let id = log
            .append(&entry("t1", Outcome::Accepted, "ok"))
            .unwrap()
            .unwrap();

        let result = log
            .db
            .execute(format!("UPDATE decision_log SET rationale = 'x' WHERE id = {id}"));
        let err = result.unwrap_err();
        assert!(db::is_append_only_violation(&err));

        // And the row is unchanged.
        let entries = log.list("doc1", &Filter::default()).unwrap();
        assert_eq!(entries[0].rationale, "ok");
    }

    #[test]
    fn test_delete_fails_at_storage_layer() {
        let log = DecisionLog::open(Database::memory().unwrap());
        log.append(&entry("t1", Outcome::Rejected, "no")).unwrap();

        let err = log.db.execute("DELETE FROM decision_log").unwrap_err();
        assert!(db::is_append_only_violation(&err));
        assert_eq!(log.list("doc1", &Filter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_filters() {
        let log = DecisionLog::open(Database::memory().unwrap());
        log.append(&entry("t1", Outcome::Accepted, "looks good"))
            .unwrap();
        log.append(&entry("t2", Outcome::Rejected, "too risky"))
            .unwrap();

        let accepted = log
            .list(
                "doc1",
                &Filter {
                    outcome: Some(Outcome::Accepted),
                    ..Filter::default()
                },
            )
            .unwrap();
        assert_eq!(accepted.len(), 1);
        assert_eq!(accepted[0].thread_id, "t1");

        let risky = log
            .list(
                "doc1",
                &Filter {
                    q: Some("risky"),
                    ..Filter::default()
                },
            )
            .unwrap();
        assert_eq!(risky.len(), 1);
        assert_eq!(risky[0].thread_id, "t2");

        // `limit=0` returns no items.
        let none = log
            .list(
                "doc1",
                &Filter {
                    limit: Some(0),
                    ..Filter::default()
                },
            )
            .unwrap();
        assert!(none.is_empty());
    }
}
