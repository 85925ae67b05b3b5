//! Inbound contract of the realtime sync collaborator.
//!
//! When an editing session ends, the gateway flushes the final snapshot
//! here. The flush is idempotent by session id: replays are no-op
//! successes, and a snapshot identical to the branch head produces no
//! commit. Recovery of lost updates is owned by the gateway, not by this
//! core.
use serde::{Deserialize, Serialize};
use sqlite as sql;
use thiserror::Error;

use crate::audit;
use crate::common::Timestamp;
use crate::db::{opt_text, transaction, Database};
use crate::git;
use crate::proposal;

#[derive(Error, Debug)]
pub enum Error {
    /// An internal error.
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
    /// Git error.
    #[error("git: {0}")]
    Git(#[from] git::Error),
    /// Audit log error.
    #[error(transparent)]
    Audit(#[from] audit::Error),
    /// The referenced proposal is missing.
    #[error("proposal `{0}` not found")]
    NotFound(String),
    /// The proposal no longer accepts content.
    #[error("proposal `{0}` is `{1}` and no longer accepts content")]
    Closed(String, proposal::Status),
}

/// A `session-ended` event from the sync gateway.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionEnded {
    pub session_id: String,
    pub document_id: String,
    pub proposal_id: String,
    pub actor: String,
    #[serde(default)]
    pub update_count: i64,
    /// Canonical document content: a JSON array of editor blocks.
    pub snapshot: serde_json::Value,
}

/// What a flush amounted to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum Outcome {
    /// A new commit was produced on the proposal branch.
    Committed { commit: String },
    /// The snapshot was byte-identical to the branch head.
    Unchanged,
    /// The session was already flushed; replay is a no-op success.
    Duplicate,
}

/// Ingests session flushes.
#[derive(Clone)]
pub struct Sessions {
    db: Database,
}

impl Sessions {
    pub fn open(db: Database) -> Self {
        Self { db }
    }

    /// Apply a `session-ended` flush.
    pub fn session_ended(
        &self,
        repos: &git::Repos,
        event: &SessionEnded,
    ) -> Result<Outcome, Error> {
        let now = Timestamp::now();

        transaction(&self.db, |conn| {
            let mut stmt =
                conn.prepare("SELECT 1 FROM sync_sessions WHERE session_id = ?1")?;
            stmt.bind((1, event.session_id.as_str()))?;
            if stmt.into_iter().next().transpose()?.is_some() {
                return Ok(Outcome::Duplicate);
            }

            let p = proposal::query::proposal(conn, &event.proposal_id)
                .map_err(|e| match e {
                    proposal::Error::Internal(e) => Error::Internal(e),
                    _ => Error::NotFound(event.proposal_id.clone()),
                })?
                .ok_or_else(|| Error::NotFound(event.proposal_id.clone()))?;
            if !matches!(
                p.status,
                proposal::Status::Draft | proposal::Status::UnderReview | proposal::Status::Approved
            ) {
                return Err(Error::Closed(p.id.clone(), p.status));
            }

            let content = git::canonical_bytes(&event.snapshot)?;
            let repo = repos.repository(&p.document_id)?;
            let commit = repo.commit_content(
                &p.branch_name,
                &event.actor,
                &format!("Autosave of session {}", event.session_id),
                &content,
            )?;

            let mut stmt = conn.prepare(
                "INSERT INTO sync_sessions (session_id, document_id, proposal_id, commit_hash,
                                            update_count, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            stmt.bind((1, event.session_id.as_str()))?;
            stmt.bind((2, event.document_id.as_str()))?;
            stmt.bind((3, event.proposal_id.as_str()))?;
            stmt.bind((4, opt_text(commit.map(|c| c.to_string()).as_deref())))?;
            stmt.bind((5, event.update_count))?;
            stmt.bind((6, now.as_millis() as i64))?;
            stmt.next()?;

            audit::query::record(
                conn,
                &audit::NewEvent::new("sync.session-ended", &event.actor, &event.document_id)
                    .proposal(&event.proposal_id)
                    .payload(serde_json::json!({
                        "sessionId": event.session_id,
                        "updateCount": event.update_count,
                        "committed": commit.is_some(),
                    })),
                now,
            )?;

            Ok(match commit {
                Some(oid) => Outcome::Committed {
                    commit: oid.to_string(),
                },
                None => Outcome::Unchanged,
            })
        })
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::proposal::Proposals;
    use crate::registry::{Registry, SpaceVisibility};

    struct Fixture {
        sessions: Sessions,
        proposals: Proposals,
        repos: git::Repos,
        proposal: proposal::Proposal,
        _tmp: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::memory().unwrap();
        let registry = Registry::open(db.clone());
        let workspace = registry.create_workspace("Acme").unwrap();
        let space = registry
            .create_space(&workspace.id, "Legal", "", SpaceVisibility::Organization)
            .unwrap();
        let document = registry
            .create_document(&space.id, "Contract", "", None, "alice")
            .unwrap();
        let repos = git::Repos::open(tmp.path().join("repos")).unwrap();
        let proposals = Proposals::open(db.clone());
        let proposal = proposals
            .create(&repos, &document.id, "Round 1", "alice")
            .unwrap();

        Fixture {
            sessions: Sessions::open(db),
            proposals,
            repos,
            proposal,
            _tmp: tmp,
        }
    }

    fn event(f: &Fixture, session_id: &str, text: &str) -> SessionEnded {
        SessionEnded {
            session_id: session_id.to_owned(),
            document_id: f.proposal.document_id.clone(),
            proposal_id: f.proposal.id.clone(),
            actor: "alice".to_owned(),
            update_count: 7,
            snapshot: serde_json::json!([
                { "id": "n1", "kind": "paragraph", "text": text }
            ]),
        }
    }

    #[test]
    fn test_flush_commits_snapshot() {
        let f = fixture();
        let outcome = f
            .sessions
            .session_ended(&f.repos, &event(&f, "s1", "hello"))
            .unwrap();
        let Outcome::Committed { commit } = outcome else {
            panic!("expected a commit");
        };

        let repo = f.repos.repository(&f.proposal.document_id).unwrap();
        assert_eq!(repo.head(&f.proposal.branch_name).unwrap().to_string(), commit);
        assert_eq!(repo.blocks(&f.proposal.branch_name).unwrap()[0].text, "hello");
    }

    #[test]
    fn test_flush_is_idempotent_by_session() {
        let f = fixture();
        f.sessions
            .session_ended(&f.repos, &event(&f, "s1", "hello"))
            .unwrap();

        // A replay with different content is still a no-op.
        let outcome = f
            .sessions
            .session_ended(&f.repos, &event(&f, "s1", "changed"))
            .unwrap();
        assert_eq!(outcome, Outcome::Duplicate);

        let repo = f.repos.repository(&f.proposal.document_id).unwrap();
        assert_eq!(repo.blocks(&f.proposal.branch_name).unwrap()[0].text, "hello");
        assert_eq!(repo.commits(&f.proposal.branch_name, 10).unwrap().len(), 2);
    }

    #[test]
    fn test_identical_snapshot_produces_no_commit() {
        let f = fixture();
        f.sessions
            .session_ended(&f.repos, &event(&f, "s1", "hello"))
            .unwrap();
        let outcome = f
            .sessions
            .session_ended(&f.repos, &event(&f, "s2", "hello"))
            .unwrap();
        assert_eq!(outcome, Outcome::Unchanged);
    }

    #[test]
    fn test_flush_to_unknown_proposal() {
        let f = fixture();
        let mut bad = event(&f, "s1", "hello");
        bad.proposal_id = "missing".to_owned();
        assert!(matches!(
            f.sessions.session_ended(&f.repos, &bad),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_flush_to_rejected_proposal() {
        let f = fixture();
        f.proposals.reject(&f.proposal.id, "bob").unwrap();
        assert!(matches!(
            f.sessions.session_ended(&f.repos, &event(&f, "s1", "hello")),
            Err(Error::Closed(_, _))
        ));
    }
}
