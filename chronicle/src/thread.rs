//! Deliberation threads, annotations, votes and reactions.
//!
//! Threads anchor to persistent block identifiers issued by the editor and
//! survive edits until the block disappears, at which point they are marked
//! orphaned. Visibility segregation between internal and external
//! principals is enforced in the SQL predicate of every list query, not
//! only in the application layer.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlite as sql;
use thiserror::Error;

use crate::audit;
use crate::common::{self, Reaction, Timestamp};
use crate::db::{opt_int, transaction, Database};
use crate::decision;
use crate::git;

#[derive(Error, Debug)]
pub enum Error {
    /// An internal error.
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
    /// Thread or annotation not found.
    #[error("{0} `{1}` not found")]
    NotFound(&'static str, String),
    /// The transition is not allowed from the current status.
    #[error("invalid transition from `{from}`")]
    InvalidTransition { from: Status },
    /// The principal may not perform this operation.
    #[error("forbidden: {0}")]
    Forbidden(&'static str),
    /// Git error.
    #[error("git: {0}")]
    Git(#[from] git::Error),
    /// Decision log error.
    #[error("decision log: {0}")]
    Decision(#[from] decision::Error),
    /// Audit log error.
    #[error(transparent)]
    Audit(#[from] audit::Error),
    /// Could not parse a stored enum value.
    #[error("invalid value `{0}`")]
    InvalidValue(String),
    /// Invalid reaction emoji.
    #[error(transparent)]
    Reaction(#[from] common::ReactionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Open,
    Resolved,
    Orphaned,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Resolved => write!(f, "resolved"),
            Self::Orphaned => write!(f, "orphaned"),
        }
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "resolved" => Ok(Self::Resolved),
            "orphaned" => Ok(Self::Orphaned),
            other => Err(Error::InvalidValue(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Internal,
    External,
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal => write!(f, "internal"),
            Self::External => write!(f, "external"),
        }
    }
}

impl FromStr for Visibility {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "internal" => Ok(Self::Internal),
            "external" => Ok(Self::External),
            other => Err(Error::InvalidValue(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    General,
    Legal,
    Commercial,
    Technical,
    Security,
    Query,
    Editorial,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::General => write!(f, "general"),
            Self::Legal => write!(f, "legal"),
            Self::Commercial => write!(f, "commercial"),
            Self::Technical => write!(f, "technical"),
            Self::Security => write!(f, "security"),
            Self::Query => write!(f, "query"),
            Self::Editorial => write!(f, "editorial"),
        }
    }
}

impl FromStr for Kind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "general" => Ok(Self::General),
            "legal" => Ok(Self::Legal),
            "commercial" => Ok(Self::Commercial),
            "technical" => Ok(Self::Technical),
            "security" => Ok(Self::Security),
            "query" => Ok(Self::Query),
            "editorial" => Ok(Self::Editorial),
            other => Err(Error::InvalidValue(other.to_owned())),
        }
    }
}

/// Where a thread points in the document. The node id is a persistent block
/// identifier assigned by the editor; the core never interprets offsets.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Anchor {
    #[serde(default)]
    pub label: String,
    pub node_id: String,
    pub start: Option<i64>,
    pub end: Option<i64>,
}

/// A deliberation thread on a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Thread {
    pub id: String,
    pub proposal_id: String,
    pub anchor: Anchor,
    pub body: String,
    pub status: Status,
    pub visibility: Visibility,
    pub kind: Kind,
    pub resolved_outcome: Option<decision::Outcome>,
    pub resolved_note: Option<String>,
    pub orphaned_reason: Option<String>,
    pub author: String,
    pub created_at: Timestamp,
}

/// A reply within a thread. Immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: String,
    pub thread_id: String,
    pub author: String,
    pub body: String,
    pub created_at: Timestamp,
}

/// An up- or down-vote on a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    fn as_i64(self) -> i64 {
        match self {
            Self::Up => 1,
            Self::Down => -1,
        }
    }
}

/// Vote tally of a thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tally {
    pub up: i64,
    pub down: i64,
}

/// A thread about to be opened.
#[derive(Debug, Clone)]
pub struct NewThread<'a> {
    pub proposal_id: &'a str,
    pub anchor: Anchor,
    pub body: &'a str,
    pub visibility: Visibility,
    pub kind: Kind,
    pub author: &'a str,
}

/// The thread store.
#[derive(Clone)]
pub struct Threads {
    db: Database,
}

impl Threads {
    pub fn open(db: Database) -> Self {
        Self { db }
    }

    /// Open a thread on a proposal.
    pub fn create(&self, new: &NewThread) -> Result<Thread, Error> {
        let now = Timestamp::now();
        let id = common::id();

        transaction(&self.db, |conn| {
            let proposal = query::proposal_of(conn, new.proposal_id)?;

            let mut stmt = conn.prepare(
                "INSERT INTO threads (id, proposal_id, anchor_label, anchor_node_id, anchor_start,
                                      anchor_end, body, visibility, kind, author, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            stmt.bind((1, id.as_str()))?;
            stmt.bind((2, new.proposal_id))?;
            stmt.bind((3, new.anchor.label.as_str()))?;
            stmt.bind((4, new.anchor.node_id.as_str()))?;
            stmt.bind((5, opt_int(new.anchor.start)))?;
            stmt.bind((6, opt_int(new.anchor.end)))?;
            stmt.bind((7, new.body))?;
            stmt.bind((8, new.visibility.to_string().as_str()))?;
            stmt.bind((9, new.kind.to_string().as_str()))?;
            stmt.bind((10, new.author))?;
            stmt.bind((11, now.as_millis() as i64))?;
            stmt.next()?;

            audit::query::record(
                conn,
                &audit::NewEvent::new("thread.created", new.author, &proposal.document_id)
                    .proposal(new.proposal_id)
                    .thread(&id)
                    .payload(serde_json::json!({
                        "anchor": new.anchor.node_id,
                        "visibility": new.visibility.to_string(),
                    })),
                now,
            )?;

            Ok::<(), Error>(())
        })?;

        self.get(&id)
    }

    /// Get a thread by id.
    pub fn get(&self, id: &str) -> Result<Thread, Error> {
        query::thread(&self.db, id)?.ok_or_else(|| Error::NotFound("thread", id.to_owned()))
    }

    /// List a proposal's threads.
    ///
    /// `include_internal` is derived from the principal: external guests
    /// never see internal threads. The filter lives in the SQL predicate so
    /// that it also binds direct store reads.
    pub fn list(&self, proposal_id: &str, include_internal: bool) -> Result<Vec<Thread>, Error> {
        let mut stmt = self.db.prepare(&format!(
            "{} WHERE proposal_id = ?1 AND (visibility = 'external' OR ?2 = 1)
             ORDER BY created_at, id",
            query::SELECT_THREAD
        ))?;
        stmt.bind((1, proposal_id))?;
        stmt.bind((2, include_internal as i64))?;

        stmt.into_iter()
            .map(|row| row.map_err(Error::from).and_then(|r| query::parse(&r)))
            .collect()
    }

    /// Reply to a thread. Annotations cannot be edited afterwards.
    pub fn reply(&self, thread_id: &str, author: &str, body: &str) -> Result<Annotation, Error> {
        let now = Timestamp::now();
        let id = common::id();

        transaction(&self.db, |conn| {
            let thread = query::thread(conn, thread_id)?
                .ok_or_else(|| Error::NotFound("thread", thread_id.to_owned()))?;
            let proposal = query::proposal_of(conn, &thread.proposal_id)?;

            let mut stmt = conn.prepare(
                "INSERT INTO annotations (id, thread_id, author, body, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            stmt.bind((1, id.as_str()))?;
            stmt.bind((2, thread_id))?;
            stmt.bind((3, author))?;
            stmt.bind((4, body))?;
            stmt.bind((5, now.as_millis() as i64))?;
            stmt.next()?;

            audit::query::record(
                conn,
                &audit::NewEvent::new("thread.replied", author, &proposal.document_id)
                    .proposal(&thread.proposal_id)
                    .thread(thread_id),
                now,
            )?;

            Ok::<(), Error>(())
        })?;

        Ok(Annotation {
            id,
            thread_id: thread_id.to_owned(),
            author: author.to_owned(),
            body: body.to_owned(),
            created_at: now,
        })
    }

    /// List a thread's annotations, oldest first.
    pub fn annotations(&self, thread_id: &str) -> Result<Vec<Annotation>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT id, thread_id, author, body, created_at FROM annotations
             WHERE thread_id = ?1 ORDER BY created_at, id",
        )?;
        stmt.bind((1, thread_id))?;

        stmt.into_iter()
            .map(|row| {
                let row = row?;
                Ok(Annotation {
                    id: row.read::<&str, _>("id").to_owned(),
                    thread_id: row.read::<&str, _>("thread_id").to_owned(),
                    author: row.read::<&str, _>("author").to_owned(),
                    body: row.read::<&str, _>("body").to_owned(),
                    created_at: Timestamp::from_millis(row.read::<i64, _>("created_at") as u128),
                })
            })
            .collect()
    }

    /// Resolve a thread, writing the decision-log entry in the same
    /// transaction. The commit hash anchoring the decision is the current
    /// head of the proposal branch.
    pub fn resolve(
        &self,
        repos: &git::Repos,
        thread_id: &str,
        outcome: decision::Outcome,
        rationale: &str,
        actor: &str,
    ) -> Result<(Thread, Option<i64>), Error> {
        let now = Timestamp::now();

        let decision_id = transaction(&self.db, |conn| {
            let thread = query::thread(conn, thread_id)?
                .ok_or_else(|| Error::NotFound("thread", thread_id.to_owned()))?;
            if !matches!(thread.status, Status::Open | Status::Orphaned) {
                return Err(Error::InvalidTransition {
                    from: thread.status,
                });
            }
            let proposal = query::proposal_of(conn, &thread.proposal_id)?;
            let commit_hash = repos
                .repository(&proposal.document_id)?
                .head(&proposal.branch_name)?
                .to_string();

            let mut stmt = conn.prepare(
                "UPDATE threads SET status = 'resolved', resolved_outcome = ?2, resolved_note = ?3
                 WHERE id = ?1",
            )?;
            stmt.bind((1, thread_id))?;
            stmt.bind((2, outcome.to_string().as_str()))?;
            stmt.bind((3, rationale))?;
            stmt.next()?;

            let mut participants = query::participants(conn, thread_id)?;
            participants.push(thread.author.clone());
            participants.push(actor.to_owned());
            participants.sort();
            participants.dedup();

            let decision_id = decision::query::append(
                conn,
                &decision::NewEntry {
                    thread_id,
                    document_id: &proposal.document_id,
                    proposal_id: &thread.proposal_id,
                    outcome,
                    rationale,
                    decided_by: actor,
                    commit_hash: &commit_hash,
                    participants: &participants,
                },
                now,
            )?;

            audit::query::record(
                conn,
                &audit::NewEvent::new("thread.resolved", actor, &proposal.document_id)
                    .proposal(&thread.proposal_id)
                    .thread(thread_id)
                    .payload(serde_json::json!({
                        "outcome": outcome.to_string(),
                        "commit": commit_hash,
                    })),
                now,
            )?;

            Ok(decision_id)
        })?;

        Ok((self.get(thread_id)?, decision_id))
    }

    /// Reopen a resolved or orphaned thread. Not permitted once the owning
    /// proposal has been merged.
    pub fn reopen(&self, thread_id: &str) -> Result<Thread, Error> {
        let now = Timestamp::now();

        transaction(&self.db, |conn| {
            let thread = query::thread(conn, thread_id)?
                .ok_or_else(|| Error::NotFound("thread", thread_id.to_owned()))?;
            if !matches!(thread.status, Status::Resolved | Status::Orphaned) {
                return Err(Error::InvalidTransition {
                    from: thread.status,
                });
            }
            let proposal = query::proposal_of(conn, &thread.proposal_id)?;
            if proposal.status == "merged" {
                return Err(Error::Forbidden("proposal is already merged"));
            }

            let mut stmt = conn.prepare(
                "UPDATE threads SET status = 'open', resolved_outcome = NULL, resolved_note = NULL,
                                    orphaned_reason = NULL
                 WHERE id = ?1",
            )?;
            stmt.bind((1, thread_id))?;
            stmt.next()?;

            audit::query::record(
                conn,
                &audit::NewEvent::new("thread.reopened", &thread.author, &proposal.document_id)
                    .proposal(&thread.proposal_id)
                    .thread(thread_id),
                now,
            )?;

            Ok(())
        })?;

        self.get(thread_id)
    }

    /// Change a thread's visibility. Only internal principals may do this.
    pub fn set_visibility(
        &self,
        thread_id: &str,
        visibility: Visibility,
        principal_is_internal: bool,
    ) -> Result<Thread, Error> {
        if !principal_is_internal {
            return Err(Error::Forbidden(
                "external principals cannot change thread visibility",
            ));
        }
        let now = Timestamp::now();

        transaction(&self.db, |conn| {
            let thread = query::thread(conn, thread_id)?
                .ok_or_else(|| Error::NotFound("thread", thread_id.to_owned()))?;
            let proposal = query::proposal_of(conn, &thread.proposal_id)?;

            let mut stmt = conn.prepare("UPDATE threads SET visibility = ?2 WHERE id = ?1")?;
            stmt.bind((1, thread_id))?;
            stmt.bind((2, visibility.to_string().as_str()))?;
            stmt.next()?;

            audit::query::record(
                conn,
                &audit::NewEvent::new("thread.visibility", &thread.author, &proposal.document_id)
                    .proposal(&thread.proposal_id)
                    .thread(thread_id)
                    .payload(serde_json::json!({ "visibility": visibility.to_string() })),
                now,
            )?;

            Ok::<(), Error>(())
        })?;

        self.get(thread_id)
    }

    /// Mark an open thread as orphaned because its anchor disappeared.
    pub fn orphan(&self, thread_id: &str, reason: &str) -> Result<Thread, Error> {
        let now = Timestamp::now();

        transaction(&self.db, |conn| {
            let thread = query::thread(conn, thread_id)?
                .ok_or_else(|| Error::NotFound("thread", thread_id.to_owned()))?;
            if thread.status != Status::Open {
                return Err(Error::InvalidTransition {
                    from: thread.status,
                });
            }
            let proposal = query::proposal_of(conn, &thread.proposal_id)?;
            query::orphan(conn, thread_id, reason)?;

            audit::query::record(
                conn,
                &audit::NewEvent::new("thread.orphaned", &thread.author, &proposal.document_id)
                    .proposal(&thread.proposal_id)
                    .thread(thread_id)
                    .payload(serde_json::json!({ "reason": reason })),
                now,
            )?;

            Ok(())
        })?;

        self.get(thread_id)
    }

    /// Toggle a vote: voting the same direction again removes it, a
    /// different direction flips it.
    pub fn toggle_vote(
        &self,
        thread_id: &str,
        user_name: &str,
        direction: Direction,
    ) -> Result<Option<Direction>, Error> {
        let now = Timestamp::now();

        transaction(&self.db, |conn| {
            let thread = query::thread(conn, thread_id)?
                .ok_or_else(|| Error::NotFound("thread", thread_id.to_owned()))?;

            let mut stmt = conn
                .prepare("SELECT direction FROM thread_votes WHERE thread_id = ?1 AND user_name = ?2")?;
            stmt.bind((1, thread_id))?;
            stmt.bind((2, user_name))?;
            let existing = stmt
                .into_iter()
                .next()
                .transpose()?
                .map(|row| row.read::<i64, _>("direction"));

            match existing {
                Some(current) if current == direction.as_i64() => {
                    let mut stmt = conn.prepare(
                        "DELETE FROM thread_votes WHERE thread_id = ?1 AND user_name = ?2",
                    )?;
                    stmt.bind((1, thread_id))?;
                    stmt.bind((2, user_name))?;
                    stmt.next()?;

                    Ok(None)
                }
                Some(_) => {
                    let mut stmt = conn.prepare(
                        "UPDATE thread_votes SET direction = ?3
                         WHERE thread_id = ?1 AND user_name = ?2",
                    )?;
                    stmt.bind((1, thread_id))?;
                    stmt.bind((2, user_name))?;
                    stmt.bind((3, direction.as_i64()))?;
                    stmt.next()?;

                    Ok(Some(direction))
                }
                None => {
                    let mut stmt = conn.prepare(
                        "INSERT INTO thread_votes (proposal_id, thread_id, user_name, direction, created_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)",
                    )?;
                    stmt.bind((1, thread.proposal_id.as_str()))?;
                    stmt.bind((2, thread_id))?;
                    stmt.bind((3, user_name))?;
                    stmt.bind((4, direction.as_i64()))?;
                    stmt.bind((5, now.as_millis() as i64))?;
                    stmt.next()?;

                    Ok(Some(direction))
                }
            }
        })
    }

    /// Vote tally for a thread.
    pub fn tally(&self, thread_id: &str) -> Result<Tally, Error> {
        let mut stmt = self.db.prepare(
            "SELECT direction, COUNT(*) AS count FROM thread_votes
             WHERE thread_id = ?1 GROUP BY direction",
        )?;
        stmt.bind((1, thread_id))?;

        let mut tally = Tally::default();
        for row in stmt.into_iter() {
            let row = row?;
            match row.read::<i64, _>("direction") {
                1 => tally.up = row.read::<i64, _>("count"),
                _ => tally.down = row.read::<i64, _>("count"),
            }
        }
        Ok(tally)
    }

    /// Toggle an emoji reaction: delete if present, insert otherwise.
    /// Returns whether the reaction is now present.
    pub fn toggle_reaction(
        &self,
        thread_id: &str,
        user_name: &str,
        reaction: Reaction,
    ) -> Result<bool, Error> {
        let now = Timestamp::now();
        let emoji = reaction.to_string();

        transaction(&self.db, |conn| {
            let thread = query::thread(conn, thread_id)?
                .ok_or_else(|| Error::NotFound("thread", thread_id.to_owned()))?;

            let mut stmt = conn.prepare(
                "DELETE FROM thread_reactions
                 WHERE thread_id = ?1 AND user_name = ?2 AND emoji = ?3",
            )?;
            stmt.bind((1, thread_id))?;
            stmt.bind((2, user_name))?;
            stmt.bind((3, emoji.as_str()))?;
            stmt.next()?;

            if conn.change_count() > 0 {
                return Ok(false);
            }

            let mut stmt = conn.prepare(
                "INSERT INTO thread_reactions (proposal_id, thread_id, user_name, emoji, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            stmt.bind((1, thread.proposal_id.as_str()))?;
            stmt.bind((2, thread_id))?;
            stmt.bind((3, user_name))?;
            stmt.bind((4, emoji.as_str()))?;
            stmt.bind((5, now.as_millis() as i64))?;
            stmt.next()?;

            Ok(true)
        })
    }

    /// List reactions on a thread as `(emoji, users)` pairs.
    pub fn reactions(&self, thread_id: &str) -> Result<Vec<(String, Vec<String>)>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT emoji, user_name FROM thread_reactions
             WHERE thread_id = ?1 ORDER BY emoji, created_at",
        )?;
        stmt.bind((1, thread_id))?;

        let mut reactions: Vec<(String, Vec<String>)> = Vec::new();
        for row in stmt.into_iter() {
            let row = row?;
            let emoji = row.read::<&str, _>("emoji").to_owned();
            let user = row.read::<&str, _>("user_name").to_owned();
            match reactions.last_mut() {
                Some((e, users)) if *e == emoji => users.push(user),
                _ => reactions.push((emoji, vec![user])),
            }
        }
        Ok(reactions)
    }
}

/// A proposal row as seen by the thread store.
pub(crate) struct ProposalRef {
    pub(crate) document_id: String,
    pub(crate) branch_name: String,
    pub(crate) status: String,
}

/// Helper SQL queries, shared within the crate.
pub(crate) mod query {
    use super::*;

    pub(crate) const SELECT_THREAD: &str =
        "SELECT id, proposal_id, anchor_label, anchor_node_id, anchor_start, anchor_end, body,
                status, visibility, kind, resolved_outcome, resolved_note, orphaned_reason,
                author, created_at
         FROM threads";

    pub(crate) fn thread(db: &sql::Connection, id: &str) -> Result<Option<Thread>, Error> {
        let mut stmt = db.prepare(&format!("{SELECT_THREAD} WHERE id = ?1"))?;
        stmt.bind((1, id))?;

        stmt.into_iter()
            .next()
            .transpose()?
            .map(|row| parse(&row))
            .transpose()
    }

    /// All threads of a proposal, regardless of visibility. Used by the
    /// merge gate, which must consider internal threads too.
    pub(crate) fn all_of_proposal(
        db: &sql::Connection,
        proposal_id: &str,
    ) -> Result<Vec<Thread>, Error> {
        let mut stmt =
            db.prepare(&format!("{SELECT_THREAD} WHERE proposal_id = ?1 ORDER BY created_at"))?;
        stmt.bind((1, proposal_id))?;

        stmt.into_iter()
            .map(|row| row.map_err(Error::from).and_then(|r| parse(&r)))
            .collect()
    }

    /// Orphan every open thread whose anchor is among `missing`.
    pub(crate) fn orphan_missing(
        db: &sql::Connection,
        proposal_id: &str,
        missing: &[&str],
        reason: &str,
    ) -> Result<usize, Error> {
        let mut orphaned = 0;
        for anchor in missing {
            let mut stmt = db.prepare(
                "UPDATE threads SET status = 'orphaned', orphaned_reason = ?3
                 WHERE proposal_id = ?1 AND anchor_node_id = ?2 AND status = 'open'",
            )?;
            stmt.bind((1, proposal_id))?;
            stmt.bind((2, *anchor))?;
            stmt.bind((3, reason))?;
            stmt.next()?;
            orphaned += db.change_count();
        }
        Ok(orphaned)
    }

    pub(super) fn orphan(db: &sql::Connection, id: &str, reason: &str) -> Result<(), Error> {
        let mut stmt = db.prepare(
            "UPDATE threads SET status = 'orphaned', orphaned_reason = ?2 WHERE id = ?1",
        )?;
        stmt.bind((1, id))?;
        stmt.bind((2, reason))?;
        stmt.next()?;

        Ok(())
    }

    pub(crate) fn proposal_of(
        db: &sql::Connection,
        proposal_id: &str,
    ) -> Result<ProposalRef, Error> {
        let mut stmt = db.prepare(
            "SELECT document_id, branch_name, status FROM proposals WHERE id = ?1",
        )?;
        stmt.bind((1, proposal_id))?;

        let row = stmt
            .into_iter()
            .next()
            .transpose()?
            .ok_or_else(|| Error::NotFound("proposal", proposal_id.to_owned()))?;

        Ok(ProposalRef {
            document_id: row.read::<&str, _>("document_id").to_owned(),
            branch_name: row.read::<&str, _>("branch_name").to_owned(),
            status: row.read::<&str, _>("status").to_owned(),
        })
    }

    pub(super) fn participants(db: &sql::Connection, thread_id: &str) -> Result<Vec<String>, Error> {
        let mut stmt = db
            .prepare("SELECT DISTINCT author FROM annotations WHERE thread_id = ?1 ORDER BY author")?;
        stmt.bind((1, thread_id))?;

        let mut authors = Vec::new();
        for row in stmt.into_iter() {
            authors.push(row?.read::<&str, _>("author").to_owned());
        }
        Ok(authors)
    }

    pub(crate) fn parse(row: &sql::Row) -> Result<Thread, Error> {
        Ok(Thread {
            id: row.read::<&str, _>("id").to_owned(),
            proposal_id: row.read::<&str, _>("proposal_id").to_owned(),
            anchor: Anchor {
                label: row.read::<&str, _>("anchor_label").to_owned(),
                node_id: row.read::<&str, _>("anchor_node_id").to_owned(),
                start: row.read::<Option<i64>, _>("anchor_start"),
                end: row.read::<Option<i64>, _>("anchor_end"),
            },
            body: row.read::<&str, _>("body").to_owned(),
            status: row.read::<&str, _>("status").parse()?,
            visibility: row.read::<&str, _>("visibility").parse()?,
            kind: row.read::<&str, _>("kind").parse()?,
            resolved_outcome: row
                .read::<Option<&str>, _>("resolved_outcome")
                .map(|s| s.parse())
                .transpose()
                .map_err(|_: decision::Error| {
                    Error::InvalidValue("resolved_outcome".to_owned())
                })?,
            resolved_note: row
                .read::<Option<&str>, _>("resolved_note")
                .map(|s| s.to_owned()),
            orphaned_reason: row
                .read::<Option<&str>, _>("orphaned_reason")
                .map(|s| s.to_owned()),
            author: row.read::<&str, _>("author").to_owned(),
            created_at: Timestamp::from_millis(row.read::<i64, _>("created_at") as u128),
        })
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use std::str::FromStr as _;

    use super::*;
    use crate::decision::{DecisionLog, Filter, Outcome};

    fn fixture() -> (Database, Threads, git::Repos, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        let db = Database::memory().unwrap();
        db.execute(
            "INSERT INTO workspaces (id, name, created_at) VALUES ('w1', 'Acme', 0);
             INSERT INTO spaces (id, workspace_id, name, slug) VALUES ('sp1', 'w1', 'Legal', 'legal');
             INSERT INTO documents (id, space_id, title, path, updated_at, created_at)
               VALUES ('doc1', 'sp1', 'Contract', '/doc1', 0, 0);
             INSERT INTO proposals (id, document_id, title, branch_name, created_by, created_at)
               VALUES ('p1', 'doc1', 'Round 1', 'proposal/doc1-round-1', 'alice', 0);",
        )
        .unwrap();
        let repos = git::Repos::open(tmp.path().join("repos")).unwrap();
        let repo = repos.repository("doc1").unwrap();
        repo.create_branch("proposal/doc1-round-1", git::DEFAULT_BRANCH)
            .unwrap();
        (db.clone(), Threads::open(db), repos, tmp)
    }

    fn new_thread<'a>(visibility: Visibility) -> NewThread<'a> {
        NewThread {
            proposal_id: "p1",
            anchor: Anchor {
                node_id: "n1".to_owned(),
                ..Anchor::default()
            },
            body: "does this clause hold?",
            visibility,
            kind: Kind::Legal,
            author: "alice",
        }
    }

    #[test]
    fn test_create_and_list() {
        let (_, threads, _, _tmp) = fixture();
        assert!(threads.list("p1", true).unwrap().is_empty());

        let thread = threads.create(&new_thread(Visibility::Internal)).unwrap();
        assert_eq!(thread.status, Status::Open);
        assert_eq!(thread.kind, Kind::Legal);
        assert_eq!(thread.anchor.node_id, "n1");

        let listed = threads.list("p1", true).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], thread);
    }

    #[test]
    fn test_visibility_is_filtered_in_sql() {
        let (_, threads, _, _tmp) = fixture();
        let internal = threads.create(&new_thread(Visibility::Internal)).unwrap();
        let external = threads.create(&new_thread(Visibility::External)).unwrap();

        // Internal principal sees both.
        let all = threads.list("p1", true).unwrap();
        assert_eq!(all.len(), 2);

        // External principal only sees the external thread, even through a
        // direct store read.
        let visible = threads.list("p1", false).unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, external.id);
        assert_ne!(visible[0].id, internal.id);
    }

    #[test]
    fn test_resolve_writes_decision_in_same_transaction() {
        let (db, threads, repos, _tmp) = fixture();
        let thread = threads.create(&new_thread(Visibility::Internal)).unwrap();
        threads.reply(&thread.id, "bob", "agreed").unwrap();

        let (resolved, decision_id) = threads
            .resolve(&repos, &thread.id, Outcome::Accepted, "ok", "carol")
            .unwrap();
        assert_eq!(resolved.status, Status::Resolved);
        assert_eq!(resolved.resolved_outcome, Some(Outcome::Accepted));
        assert!(decision_id.is_some());

        let log = DecisionLog::open(db);
        let entries = log.list("doc1", &Filter::default()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].thread_id, thread.id);
        assert_ne!(entries[0].commit_hash, "");
        assert_eq!(
            entries[0].participants,
            vec!["alice".to_owned(), "bob".to_owned(), "carol".to_owned()]
        );

        // Resolving an already-resolved thread is an invalid transition.
        assert!(matches!(
            threads.resolve(&repos, &thread.id, Outcome::Accepted, "ok", "carol"),
            Err(Error::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_reopen() {
        let (_, threads, repos, _tmp) = fixture();
        let thread = threads.create(&new_thread(Visibility::Internal)).unwrap();

        assert!(matches!(
            threads.reopen(&thread.id),
            Err(Error::InvalidTransition { from: Status::Open })
        ));

        threads
            .resolve(&repos, &thread.id, Outcome::Deferred, "later", "alice")
            .unwrap();
        let reopened = threads.reopen(&thread.id).unwrap();
        assert_eq!(reopened.status, Status::Open);
        assert_eq!(reopened.resolved_outcome, None);
    }

    #[test]
    fn test_reopen_after_merge_is_forbidden() {
        let (db, threads, repos, _tmp) = fixture();
        let thread = threads.create(&new_thread(Visibility::Internal)).unwrap();
        threads
            .resolve(&repos, &thread.id, Outcome::Accepted, "ok", "alice")
            .unwrap();
        db.execute("UPDATE proposals SET status = 'merged' WHERE id = 'p1'")
            .unwrap();

        assert!(matches!(
            threads.reopen(&thread.id),
            Err(Error::Forbidden(_))
        ));
    }

    #[test]
    fn test_orphan_and_reopen() {
        let (db, threads, _, _tmp) = fixture();
        let thread = threads.create(&new_thread(Visibility::Internal)).unwrap();

        let orphaned = threads.orphan(&thread.id, "block n1 deleted").unwrap();
        assert_eq!(orphaned.status, Status::Orphaned);
        assert_eq!(orphaned.orphaned_reason.as_deref(), Some("block n1 deleted"));

        // Orphaned threads can be reopened explicitly.
        let reopened = threads.reopen(&thread.id).unwrap();
        assert_eq!(reopened.status, Status::Open);
        assert_eq!(reopened.orphaned_reason, None);

        // Batch orphaning via a compare pass only touches open threads.
        transaction(&db, |conn| {
            query::orphan_missing(conn, "p1", &["n1"], "anchor missing in target")
        })
        .unwrap();
        assert_eq!(threads.get(&thread.id).unwrap().status, Status::Orphaned);
    }

    #[test]
    fn test_visibility_gate() {
        let (_, threads, _, _tmp) = fixture();
        let thread = threads.create(&new_thread(Visibility::Internal)).unwrap();

        assert!(matches!(
            threads.set_visibility(&thread.id, Visibility::External, false),
            Err(Error::Forbidden(_))
        ));
        let updated = threads
            .set_visibility(&thread.id, Visibility::External, true)
            .unwrap();
        assert_eq!(updated.visibility, Visibility::External);
    }

    #[test]
    fn test_vote_toggle() {
        let (_, threads, _, _tmp) = fixture();
        let thread = threads.create(&new_thread(Visibility::Internal)).unwrap();

        assert_eq!(
            threads
                .toggle_vote(&thread.id, "bob", Direction::Up)
                .unwrap(),
            Some(Direction::Up)
        );
        assert_eq!(threads.tally(&thread.id).unwrap(), Tally { up: 1, down: 0 });

        // Flipping the direction updates the row.
        assert_eq!(
            threads
                .toggle_vote(&thread.id, "bob", Direction::Down)
                .unwrap(),
            Some(Direction::Down)
        );
        assert_eq!(threads.tally(&thread.id).unwrap(), Tally { up: 0, down: 1 });

        // Voting the same direction again deletes the row.
        assert_eq!(
            threads
                .toggle_vote(&thread.id, "bob", Direction::Down)
                .unwrap(),
            None
        );
        assert_eq!(threads.tally(&thread.id).unwrap(), Tally::default());
    }

    #[test]
    fn test_reaction_toggle() {
        let (_, threads, _, _tmp) = fixture();
        let thread = threads.create(&new_thread(Visibility::Internal)).unwrap();
        let rocket = Reaction::from_str("🚀").unwrap();

        assert!(threads.toggle_reaction(&thread.id, "bob", rocket).unwrap());
        assert!(threads.toggle_reaction(&thread.id, "carol", rocket).unwrap());
        let reactions = threads.reactions(&thread.id).unwrap();
        assert_eq!(reactions.len(), 1);
        assert_eq!(reactions[0].1, vec!["bob".to_owned(), "carol".to_owned()]);

        assert!(!threads.toggle_reaction(&thread.id, "bob", rocket).unwrap());
        let reactions = threads.reactions(&thread.id).unwrap();
        assert_eq!(reactions[0].1, vec!["carol".to_owned()]);
    }
}
