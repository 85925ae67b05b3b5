//! Append-only audit trail of governance mutations.
use sqlite as sql;
use thiserror::Error;

use crate::common::Timestamp;
use crate::db::{self, opt_text, transaction, Database};

#[derive(Error, Debug)]
pub enum Error {
    /// An internal error.
    #[error("internal error: {0}")]
    Internal(sql::Error),
    /// The audit log cannot be modified.
    #[error("immutable write: {0}")]
    Immutable(sql::Error),
    /// Malformed payload column.
    #[error("malformed payload: {0}")]
    Payload(#[from] serde_json::Error),
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

/// A recorded audit event.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: i64,
    pub event_type: String,
    pub actor: String,
    pub document_id: String,
    pub proposal_id: Option<String>,
    pub change_id: Option<String>,
    pub thread_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: Timestamp,
}

/// An event about to be recorded.
#[derive(Debug, Clone)]
pub struct NewEvent<'a> {
    pub event_type: &'a str,
    pub actor: &'a str,
    pub document_id: &'a str,
    pub proposal_id: Option<&'a str>,
    pub change_id: Option<&'a str>,
    pub thread_id: Option<&'a str>,
    pub payload: serde_json::Value,
}

impl<'a> NewEvent<'a> {
    pub fn new(event_type: &'a str, actor: &'a str, document_id: &'a str) -> Self {
        Self {
            event_type,
            actor,
            document_id,
            proposal_id: None,
            change_id: None,
            thread_id: None,
            payload: serde_json::Value::Object(Default::default()),
        }
    }

    pub fn proposal(mut self, proposal_id: &'a str) -> Self {
        self.proposal_id = Some(proposal_id);
        self
    }

    pub fn change(mut self, change_id: &'a str) -> Self {
        self.change_id = Some(change_id);
        self
    }

    pub fn thread(mut self, thread_id: &'a str) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// The audit-event store.
#[derive(Clone)]
pub struct AuditLog {
    db: Database,
}

impl AuditLog {
    pub fn open(db: Database) -> Self {
        Self { db }
    }

    /// Record an event.
    pub fn record(&self, event: &NewEvent) -> Result<(), Error> {
        transaction(&self.db, |conn| query::record(conn, event, Timestamp::now()))
    }

    /// List events for a document, newest first, optionally scoped to a
    /// proposal.
    pub fn list(
        &self,
        document_id: &str,
        proposal_id: Option<&str>,
        limit: i64,
    ) -> Result<Vec<Event>, Error> {
        let mut sql = String::from(
            "SELECT id, event_type, actor, document_id, proposal_id, change_id, thread_id,
                    payload, created_at
             FROM audit_log
             WHERE document_id = ?1",
        );
        if proposal_id.is_some() {
            sql.push_str(" AND proposal_id = ?2");
        }
        sql.push_str(" ORDER BY created_at DESC, id DESC LIMIT ?3");

        let mut stmt = self.db.prepare(&sql)?;
        stmt.bind((1, document_id))?;
        if let Some(proposal_id) = proposal_id {
            stmt.bind((2, proposal_id))?;
        }
        stmt.bind((3, limit))?;

        stmt.into_iter()
            .map(|row| {
                let row = row?;
                Ok(Event {
                    id: row.read::<i64, _>("id"),
                    event_type: row.read::<&str, _>("event_type").to_owned(),
                    actor: row.read::<&str, _>("actor").to_owned(),
                    document_id: row.read::<&str, _>("document_id").to_owned(),
                    proposal_id: row
                        .read::<Option<&str>, _>("proposal_id")
                        .map(|s| s.to_owned()),
                    change_id: row.read::<Option<&str>, _>("change_id").map(|s| s.to_owned()),
                    thread_id: row.read::<Option<&str>, _>("thread_id").map(|s| s.to_owned()),
                    payload: serde_json::from_str(row.read::<&str, _>("payload"))?,
                    created_at: Timestamp::from_millis(row.read::<i64, _>("created_at") as u128),
                })
            })
            .collect()
    }
}

/// Helper SQL queries, shared within the crate.
pub(crate) mod query {
    use super::*;

    pub(crate) fn record(
        db: &sql::Connection,
        event: &NewEvent,
        now: Timestamp,
    ) -> Result<(), Error> {
        let payload = serde_json::to_string(&event.payload)?;
        let mut stmt = db.prepare(
            "INSERT INTO audit_log (event_type, actor, document_id, proposal_id, change_id,
                                    thread_id, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        stmt.bind((1, event.event_type))?;
        stmt.bind((2, event.actor))?;
        stmt.bind((3, event.document_id))?;
        stmt.bind((4, opt_text(event.proposal_id)))?;
        stmt.bind((5, opt_text(event.change_id)))?;
        stmt.bind((6, opt_text(event.thread_id)))?;
        stmt.bind((7, payload.as_str()))?;
        stmt.bind((8, now.as_millis() as i64))?;
        stmt.next()?;

        Ok(())
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_and_list() {
        let log = AuditLog::open(Database::memory().unwrap());
        log.record(
            &NewEvent::new("proposal.created", "alice", "doc1")
                .proposal("p1")
                .payload(json!({ "title": "Security review" })),
        )
        .unwrap();
        log.record(&NewEvent::new("document.moved", "bob", "doc1"))
            .unwrap();
        log.record(&NewEvent::new("proposal.created", "carol", "doc2"))
            .unwrap();

        let events = log.list("doc1", None, 50).unwrap();
        assert_eq!(events.len(), 2);
        // Newest first.
        assert_eq!(events[0].event_type, "document.moved");
        assert_eq!(events[1].payload["title"], "Security review");

        let scoped = log.list("doc1", Some("p1"), 50).unwrap();
        assert_eq!(scoped.len(), 1);
        assert_eq!(scoped[0].actor, "alice");
    }

    #[test]
    fn test_audit_is_append_only() {
        let log = AuditLog::open(Database::memory().unwrap());
        log.record(&NewEvent::new("thread.resolved", "alice", "doc1"))
            .unwrap();

        let err = log
            .db
            .execute("UPDATE audit_log SET actor = 'mallory'")
            .unwrap_err();
        assert!(db::is_append_only_violation(&err));
    }
}
