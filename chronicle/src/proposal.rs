//! Proposal lifecycle, approvals and merge execution.
//!
//! A proposal owns a working branch off the document's authoritative
//! branch. It moves through `draft → under-review → approved → merged`,
//! with a reject path out of the first two states. Merging consults the
//! [`crate::gate`] evaluator and delegates content mutation to the git
//! collaborator.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlite as sql;
use thiserror::Error;

use crate::audit;
use crate::common::{self, Timestamp};
use crate::db::{opt_int, opt_text, transaction, transaction_immediate, Database};
use crate::decision;
use crate::gate;
use crate::git::{self, MergeOutcome};
use crate::registry::{self, DocumentStatus};
use crate::thread;

#[derive(Error, Debug)]
pub enum Error {
    /// An internal error.
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
    /// Git error.
    #[error("git: {0}")]
    Git(#[from] git::Error),
    /// Registry error.
    #[error(transparent)]
    Registry(#[from] registry::Error),
    /// Thread store error.
    #[error(transparent)]
    Thread(#[from] thread::Error),
    /// Decision log error.
    #[error(transparent)]
    Decision(#[from] decision::Error),
    /// Audit log error.
    #[error(transparent)]
    Audit(#[from] audit::Error),
    /// Proposal not found.
    #[error("proposal `{0}` not found")]
    NotFound(String),
    /// Another proposal is already open for the document.
    #[error("document `{document_id}` already has an active proposal")]
    ActiveProposalExists { document_id: String },
    /// The operation is not allowed from the current status.
    #[error("cannot {action} a proposal in status `{from}`")]
    InvalidTransition { from: Status, action: &'static str },
    /// Approval ordering violated; lists only the unsatisfied dependencies.
    #[error("approval blocked on {pending:?}")]
    ApprovalOrderBlocked { pending: Vec<ApprovalRole> },
    /// The merge gate is not clear.
    #[error("merge gate blocked")]
    MergeGateBlocked(gate::Blockers),
    /// The three-way merge conflicted; no state was changed.
    #[error("merge conflict")]
    MergeConflict,
    /// Could not parse a stored enum value.
    #[error("invalid value `{0}`")]
    InvalidValue(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Draft,
    UnderReview,
    Approved,
    Merged,
    Rejected,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::UnderReview => write!(f, "under-review"),
            Self::Approved => write!(f, "approved"),
            Self::Merged => write!(f, "merged"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

impl FromStr for Status {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "under-review" => Ok(Self::UnderReview),
            "approved" => Ok(Self::Approved),
            "merged" => Ok(Self::Merged),
            "rejected" => Ok(Self::Rejected),
            other => Err(Error::InvalidValue(other.to_owned())),
        }
    }
}

/// Gate roles seeded on every proposal. The legal sign-off comes last:
/// it may only be granted once both technical reviews are in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalRole {
    #[serde(rename = "security")]
    Security,
    #[serde(rename = "architectureCommittee")]
    ArchitectureCommittee,
    #[serde(rename = "legal")]
    Legal,
}

impl ApprovalRole {
    pub const ALL: [ApprovalRole; 3] = [
        ApprovalRole::Security,
        ApprovalRole::ArchitectureCommittee,
        ApprovalRole::Legal,
    ];

    /// Roles that must be approved before this one may be.
    pub fn dependencies(&self) -> &'static [ApprovalRole] {
        match self {
            Self::Legal => &[ApprovalRole::Security, ApprovalRole::ArchitectureCommittee],
            _ => &[],
        }
    }
}

impl fmt::Display for ApprovalRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Security => write!(f, "security"),
            Self::ArchitectureCommittee => write!(f, "architectureCommittee"),
            Self::Legal => write!(f, "legal"),
        }
    }
}

impl FromStr for ApprovalRole {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "security" => Ok(Self::Security),
            "architectureCommittee" => Ok(Self::ArchitectureCommittee),
            "legal" => Ok(Self::Legal),
            other => Err(Error::InvalidValue(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
        }
    }
}

impl FromStr for ApprovalStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            other => Err(Error::InvalidValue(other.to_owned())),
        }
    }
}

/// A per-role approval row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub proposal_id: String,
    pub role: ApprovalRole,
    pub status: ApprovalStatus,
    pub approved_by: Option<String>,
    pub approved_at: Option<Timestamp>,
    /// SHA-256 over the canonical branch content at approval time.
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReviewState {
    Pending,
    Accepted,
    Rejected,
    Deferred,
}

impl fmt::Display for ReviewState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Accepted => write!(f, "accepted"),
            Self::Rejected => write!(f, "rejected"),
            Self::Deferred => write!(f, "deferred"),
        }
    }
}

impl FromStr for ReviewState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            "deferred" => Ok(Self::Deferred),
            other => Err(Error::InvalidValue(other.to_owned())),
        }
    }
}

/// Stored review state of a single change between two refs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeReview {
    pub proposal_id: String,
    pub change_id: String,
    pub from_ref: String,
    pub to_ref: String,
    pub review_state: ReviewState,
    pub rejected_rationale: Option<String>,
    pub reviewed_by: String,
    pub reviewed_at: Timestamp,
}

/// A computed change joined with its stored review state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeWithReview {
    #[serde(flatten)]
    pub change: git::Change,
    pub review_state: ReviewState,
    pub rejected_rationale: Option<String>,
    pub reviewed_by: Option<String>,
}

/// A human-named tag over a commit within a proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedVersion {
    pub id: String,
    pub proposal_id: String,
    pub name: String,
    pub commit_hash: String,
    pub created_by: String,
    pub created_at: Timestamp,
}

/// A proposal over a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub id: String,
    pub document_id: String,
    pub title: String,
    pub branch_name: String,
    pub target_branch: String,
    pub status: Status,
    pub created_by: String,
    pub created_at: Timestamp,
    pub merged_at: Option<Timestamp>,
}

/// The proposal store and engine.
#[derive(Clone)]
pub struct Proposals {
    db: Database,
}

impl Proposals {
    pub fn open(db: Database) -> Self {
        Self { db }
    }

    /// Create a proposal for a document.
    ///
    /// Seeds one pending approval per gate role and creates the working
    /// branch off the document's authoritative branch. Fails while another
    /// proposal is still open on the document.
    pub fn create(
        &self,
        repos: &git::Repos,
        document_id: &str,
        title: &str,
        created_by: &str,
    ) -> Result<Proposal, Error> {
        let now = Timestamp::now();
        let id = common::id();

        transaction(&self.db, |conn| {
            let document = registry::query::document(conn, document_id)?.ok_or_else(|| {
                Error::Registry(registry::Error::NotFound("document", document_id.to_owned()))
            })?;
            if query::active_exists(conn, document_id)? {
                return Err(Error::ActiveProposalExists {
                    document_id: document_id.to_owned(),
                });
            }

            let repo = repos.repository(document_id)?;
            let base = format!("proposal/{document_id}-{}", common::slug(title));
            let mut branch_name = base.clone();
            let mut n = 2;
            while repo.has_branch(&branch_name) {
                branch_name = format!("{base}-{n}");
                n += 1;
            }

            let mut stmt = conn.prepare(
                "INSERT INTO proposals (id, document_id, title, branch_name, target_branch,
                                        created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            stmt.bind((1, id.as_str()))?;
            stmt.bind((2, document_id))?;
            stmt.bind((3, title))?;
            stmt.bind((4, branch_name.as_str()))?;
            stmt.bind((5, git::DEFAULT_BRANCH))?;
            stmt.bind((6, created_by))?;
            stmt.bind((7, now.as_millis() as i64))?;
            stmt.next()?;

            for role in ApprovalRole::ALL {
                let mut stmt = conn.prepare(
                    "INSERT INTO approvals (proposal_id, role) VALUES (?1, ?2)",
                )?;
                stmt.bind((1, id.as_str()))?;
                stmt.bind((2, role.to_string().as_str()))?;
                stmt.next()?;
            }

            if document.status == DocumentStatus::Draft {
                registry::query::set_status(
                    conn,
                    document_id,
                    DocumentStatus::InReview,
                    created_by,
                    now,
                )?;
            }

            audit::query::record(
                conn,
                &audit::NewEvent::new("proposal.created", created_by, document_id)
                    .proposal(&id)
                    .payload(serde_json::json!({ "title": title, "branch": branch_name })),
                now,
            )?;

            // Last, so a failure aborts the whole unit.
            repo.create_branch(&branch_name, git::DEFAULT_BRANCH)?;

            Ok(())
        })?;

        self.get(&id)
    }

    /// Get a proposal by id.
    pub fn get(&self, id: &str) -> Result<Proposal, Error> {
        query::proposal(&self.db, id)?.ok_or_else(|| Error::NotFound(id.to_owned()))
    }

    /// List a document's proposals, newest first.
    pub fn for_document(&self, document_id: &str) -> Result<Vec<Proposal>, Error> {
        let mut stmt = self.db.prepare(&format!(
            "{} WHERE document_id = ?1 ORDER BY created_at DESC, id",
            query::SELECT_PROPOSAL
        ))?;
        stmt.bind((1, document_id))?;

        stmt.into_iter()
            .map(|row| row.map_err(Error::from).and_then(|r| query::parse(&r)))
            .collect()
    }

    /// Submit a draft proposal for review.
    pub fn submit(&self, id: &str, actor: &str) -> Result<Proposal, Error> {
        let now = Timestamp::now();

        transaction(&self.db, |conn| {
            let proposal =
                query::proposal(conn, id)?.ok_or_else(|| Error::NotFound(id.to_owned()))?;
            if proposal.status != Status::Draft {
                return Err(Error::InvalidTransition {
                    from: proposal.status,
                    action: "submit",
                });
            }
            query::set_status(conn, id, Status::UnderReview, None)?;
            audit::query::record(
                conn,
                &audit::NewEvent::new("proposal.submitted", actor, &proposal.document_id)
                    .proposal(id),
                now,
            )?;

            Ok(())
        })?;

        self.get(id)
    }

    /// Reject a proposal.
    pub fn reject(&self, id: &str, actor: &str) -> Result<Proposal, Error> {
        let now = Timestamp::now();

        transaction(&self.db, |conn| {
            let proposal =
                query::proposal(conn, id)?.ok_or_else(|| Error::NotFound(id.to_owned()))?;
            if !matches!(proposal.status, Status::Draft | Status::UnderReview) {
                return Err(Error::InvalidTransition {
                    from: proposal.status,
                    action: "reject",
                });
            }
            query::set_status(conn, id, Status::Rejected, None)?;
            audit::query::record(
                conn,
                &audit::NewEvent::new("proposal.rejected", actor, &proposal.document_id)
                    .proposal(id),
                now,
            )?;

            Ok(())
        })?;

        self.get(id)
    }

    /// List a proposal's approval rows.
    pub fn approvals(&self, id: &str) -> Result<Vec<Approval>, Error> {
        query::approvals(&self.db, id)
    }

    /// Record an approval for a gate role.
    ///
    /// Ordering: `legal` only once `security` and `architectureCommittee`
    /// are both approved. Approving an already-approved role is a no-op
    /// success. The canonical content hash of the branch head is stored on
    /// the row as tamper evidence.
    pub fn approve(
        &self,
        repos: &git::Repos,
        id: &str,
        role: ApprovalRole,
        actor: &str,
    ) -> Result<Approval, Error> {
        let now = Timestamp::now();

        transaction(&self.db, |conn| {
            let proposal =
                query::proposal(conn, id)?.ok_or_else(|| Error::NotFound(id.to_owned()))?;
            if !matches!(proposal.status, Status::UnderReview | Status::Approved) {
                return Err(Error::InvalidTransition {
                    from: proposal.status,
                    action: "approve",
                });
            }

            let approvals = query::approvals(conn, id)?;
            let row = approvals
                .iter()
                .find(|a| a.role == role)
                .ok_or_else(|| Error::NotFound(id.to_owned()))?;
            if row.status == ApprovalStatus::Approved {
                return Ok(());
            }

            let pending: Vec<ApprovalRole> = role
                .dependencies()
                .iter()
                .filter(|dep| {
                    approvals
                        .iter()
                        .any(|a| a.role == **dep && a.status != ApprovalStatus::Approved)
                })
                .copied()
                .collect();
            if !pending.is_empty() {
                return Err(Error::ApprovalOrderBlocked { pending });
            }

            let content_hash = hash_branch(repos, &proposal)?;
            let mut stmt = conn.prepare(
                "UPDATE approvals SET status = 'approved', approved_by = ?3, approved_at = ?4,
                                      content_hash = ?5
                 WHERE proposal_id = ?1 AND role = ?2",
            )?;
            stmt.bind((1, id))?;
            stmt.bind((2, role.to_string().as_str()))?;
            stmt.bind((3, actor))?;
            stmt.bind((4, now.as_millis() as i64))?;
            stmt.bind((5, content_hash.as_str()))?;
            stmt.next()?;

            let all_approved = query::approvals(conn, id)?
                .iter()
                .all(|a| a.status == ApprovalStatus::Approved);
            if all_approved {
                query::set_status(conn, id, Status::Approved, None)?;
                registry::query::set_status(
                    conn,
                    &proposal.document_id,
                    DocumentStatus::ReadyForApproval,
                    actor,
                    now,
                )?;
            }

            audit::query::record(
                conn,
                &audit::NewEvent::new("proposal.approved", actor, &proposal.document_id)
                    .proposal(id)
                    .payload(serde_json::json!({
                        "role": role.to_string(),
                        "contentHash": content_hash,
                    })),
                now,
            )?;

            Ok(())
        })?;

        self.approvals(id)?
            .into_iter()
            .find(|a| a.role == role)
            .ok_or_else(|| Error::NotFound(id.to_owned()))
    }

    /// Compute the canonical content hash of the proposal branch head.
    pub fn content_hash(&self, repos: &git::Repos, id: &str) -> Result<String, Error> {
        let proposal = self.get(id)?;
        hash_branch(repos, &proposal)
    }

    /// Evaluate the merge gate without side effects. Used for previews.
    pub fn gate(&self, id: &str) -> Result<gate::Verdict, Error> {
        let proposal = self.get(id)?;
        let approvals = query::approvals(&self.db, id)?;
        let threads = thread::query::all_of_proposal(&self.db, &proposal.id)?;
        let reviews = query::reviews(&self.db, id)?;

        Ok(gate::evaluate(&approvals, &threads, &reviews))
    }

    /// Merge the proposal into its target branch.
    ///
    /// The whole unit runs in an immediate transaction so concurrent merges
    /// of the same proposal serialize; the second one sees `merged` and
    /// fails with an invalid transition.
    pub fn merge(&self, repos: &git::Repos, id: &str, actor: &str) -> Result<Proposal, Error> {
        let now = Timestamp::now();
        let mut cleared_branch = None;

        transaction_immediate(&self.db, |conn| {
            let proposal =
                query::proposal(conn, id)?.ok_or_else(|| Error::NotFound(id.to_owned()))?;
            if !matches!(proposal.status, Status::UnderReview | Status::Approved) {
                return Err(Error::InvalidTransition {
                    from: proposal.status,
                    action: "merge",
                });
            }

            let approvals = query::approvals(conn, id)?;
            let threads = thread::query::all_of_proposal(conn, id)?;
            let reviews = query::reviews(conn, id)?;
            let verdict = gate::evaluate(&approvals, &threads, &reviews);
            if !verdict.ready {
                return Err(Error::MergeGateBlocked(verdict.blockers));
            }

            let repo = repos.repository(&proposal.document_id)?;
            let commit = match repo.merge(&proposal.branch_name, &proposal.target_branch, actor)? {
                MergeOutcome::Conflict => return Err(Error::MergeConflict),
                MergeOutcome::Merged(oid) => oid.to_string(),
            };

            query::set_status(conn, id, Status::Merged, Some(now))?;
            registry::query::set_status(
                conn,
                &proposal.document_id,
                DocumentStatus::Approved,
                actor,
                now,
            )?;

            // Backfill decision entries for resolved threads that somehow
            // missed theirs; retries are no-ops on the natural key.
            for t in &threads {
                if t.status != thread::Status::Resolved {
                    continue;
                }
                if query::has_decision(conn, &t.id, id)? {
                    continue;
                }
                let outcome = t.resolved_outcome.unwrap_or(decision::Outcome::Accepted);
                decision::query::append(
                    conn,
                    &decision::NewEntry {
                        thread_id: &t.id,
                        document_id: &proposal.document_id,
                        proposal_id: id,
                        outcome,
                        rationale: t.resolved_note.as_deref().unwrap_or(""),
                        decided_by: actor,
                        commit_hash: &commit,
                        participants: &[t.author.clone()],
                    },
                    now,
                )?;
            }

            audit::query::record(
                conn,
                &audit::NewEvent::new("proposal.merged", actor, &proposal.document_id)
                    .proposal(id)
                    .payload(serde_json::json!({ "commit": commit })),
                now,
            )?;

            cleared_branch = Some((proposal.document_id.clone(), proposal.branch_name.clone()));

            Ok(())
        })?;

        // Clearing the working branch is cleanup, not part of the unit.
        if let Some((document_id, branch)) = cleared_branch {
            if let Err(e) = repos
                .repository(&document_id)
                .and_then(|repo| repo.remove_branch(&branch))
            {
                log::warn!(target: "proposal", "Failed to clear branch {branch}: {e}");
            }
        }

        self.get(id)
    }

    /// Tag the current branch head with a human-chosen name.
    pub fn create_named_version(
        &self,
        repos: &git::Repos,
        id: &str,
        name: &str,
        actor: &str,
    ) -> Result<NamedVersion, Error> {
        let now = Timestamp::now();
        let version_id = common::id();

        transaction(&self.db, |conn| {
            let proposal =
                query::proposal(conn, id)?.ok_or_else(|| Error::NotFound(id.to_owned()))?;
            let repo = repos.repository(&proposal.document_id)?;
            let head = repo.head(&proposal.branch_name)?;

            let mut stmt = conn.prepare(
                "INSERT INTO named_versions (id, proposal_id, name, commit_hash, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            stmt.bind((1, version_id.as_str()))?;
            stmt.bind((2, id))?;
            stmt.bind((3, name))?;
            stmt.bind((4, head.to_string().as_str()))?;
            stmt.bind((5, actor))?;
            stmt.bind((6, now.as_millis() as i64))?;
            stmt.next()?;

            repo.tag(
                &format!("{}-{}", common::slug(name), &id[..8.min(id.len())]),
                head,
            )?;

            audit::query::record(
                conn,
                &audit::NewEvent::new("proposal.version", actor, &proposal.document_id)
                    .proposal(id)
                    .payload(serde_json::json!({ "name": name, "commit": head.to_string() })),
                now,
            )?;

            Ok::<(), Error>(())
        })?;

        self.versions(id)?
            .into_iter()
            .find(|v| v.id == version_id)
            .ok_or_else(|| Error::NotFound(version_id))
    }

    /// List a proposal's named versions.
    pub fn versions(&self, id: &str) -> Result<Vec<NamedVersion>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT id, proposal_id, name, commit_hash, created_by, created_at
             FROM named_versions WHERE proposal_id = ?1 ORDER BY created_at, id",
        )?;
        stmt.bind((1, id))?;

        stmt.into_iter()
            .map(|row| {
                let row = row?;
                Ok(NamedVersion {
                    id: row.read::<&str, _>("id").to_owned(),
                    proposal_id: row.read::<&str, _>("proposal_id").to_owned(),
                    name: row.read::<&str, _>("name").to_owned(),
                    commit_hash: row.read::<&str, _>("commit_hash").to_owned(),
                    created_by: row.read::<&str, _>("created_by").to_owned(),
                    created_at: Timestamp::from_millis(row.read::<i64, _>("created_at") as u128),
                })
            })
            .collect()
    }

    /// Compute the proposal's changes against its target branch, joined
    /// with stored review state.
    ///
    /// Threads whose anchors disappeared from the branch are orphaned as a
    /// side effect of the compare pass.
    pub fn changes(&self, repos: &git::Repos, id: &str) -> Result<Vec<ChangeWithReview>, Error> {
        let proposal = self.get(id)?;
        let repo = repos.repository(&proposal.document_id)?;
        let comparison = repo.compare(&proposal.target_branch, &proposal.branch_name)?;

        let missing: Vec<&str> = comparison.missing_anchors().collect();
        if !missing.is_empty() {
            transaction(&self.db, |conn| {
                thread::query::orphan_missing(
                    conn,
                    &proposal.id,
                    &missing,
                    "anchor missing from proposal branch",
                )
            })?;
        }

        let reviews = query::reviews(&self.db, id)?;
        Ok(comparison
            .changes
            .into_iter()
            .map(|change| {
                let stored = reviews.iter().find(|r| r.change_id == change.id);
                ChangeWithReview {
                    review_state: stored.map_or(ReviewState::Pending, |r| r.review_state),
                    rejected_rationale: stored.and_then(|r| r.rejected_rationale.clone()),
                    reviewed_by: stored.map(|r| r.reviewed_by.clone()),
                    change,
                }
            })
            .collect())
    }

    /// Record the review state of a single change.
    pub fn review_change(
        &self,
        id: &str,
        change_id: &str,
        from_ref: &str,
        to_ref: &str,
        state: ReviewState,
        rationale: Option<&str>,
        actor: &str,
    ) -> Result<ChangeReview, Error> {
        let now = Timestamp::now();

        transaction(&self.db, |conn| {
            let proposal =
                query::proposal(conn, id)?.ok_or_else(|| Error::NotFound(id.to_owned()))?;
            let mut stmt = conn.prepare(
                "INSERT INTO change_reviews (proposal_id, change_id, from_ref, to_ref, review_state,
                                             rejected_rationale, reviewed_by, reviewed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (proposal_id, change_id, from_ref, to_ref)
                 DO UPDATE SET review_state = ?5, rejected_rationale = ?6, reviewed_by = ?7,
                               reviewed_at = ?8",
            )?;
            stmt.bind((1, id))?;
            stmt.bind((2, change_id))?;
            stmt.bind((3, from_ref))?;
            stmt.bind((4, to_ref))?;
            stmt.bind((5, state.to_string().as_str()))?;
            stmt.bind((6, opt_text(rationale)))?;
            stmt.bind((7, actor))?;
            stmt.bind((8, now.as_millis() as i64))?;
            stmt.next()?;

            audit::query::record(
                conn,
                &audit::NewEvent::new("change.reviewed", actor, &proposal.document_id)
                    .proposal(id)
                    .change(change_id)
                    .payload(serde_json::json!({ "state": state.to_string() })),
                now,
            )?;

            Ok::<(), Error>(())
        })?;

        query::reviews(&self.db, id)?
            .into_iter()
            .find(|r| r.change_id == change_id && r.from_ref == from_ref && r.to_ref == to_ref)
            .ok_or_else(|| Error::NotFound(id.to_owned()))
    }

    /// Stored change reviews for a proposal.
    pub fn change_reviews(&self, id: &str) -> Result<Vec<ChangeReview>, Error> {
        query::reviews(&self.db, id)
    }
}

fn hash_branch(repos: &git::Repos, proposal: &Proposal) -> Result<String, Error> {
    let repo = repos.repository(&proposal.document_id)?;
    let bytes = repo.content(&proposal.branch_name)?;

    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Helper SQL queries, shared within the crate.
pub(crate) mod query {
    use super::*;

    pub(crate) const SELECT_PROPOSAL: &str =
        "SELECT id, document_id, title, branch_name, target_branch, status, created_by,
                created_at, merged_at
         FROM proposals";

    pub(crate) fn proposal(db: &sql::Connection, id: &str) -> Result<Option<Proposal>, Error> {
        let mut stmt = db.prepare(&format!("{SELECT_PROPOSAL} WHERE id = ?1"))?;
        stmt.bind((1, id))?;

        stmt.into_iter()
            .next()
            .transpose()?
            .map(|row| parse(&row))
            .transpose()
    }

    pub(crate) fn parse(row: &sql::Row) -> Result<Proposal, Error> {
        Ok(Proposal {
            id: row.read::<&str, _>("id").to_owned(),
            document_id: row.read::<&str, _>("document_id").to_owned(),
            title: row.read::<&str, _>("title").to_owned(),
            branch_name: row.read::<&str, _>("branch_name").to_owned(),
            target_branch: row.read::<&str, _>("target_branch").to_owned(),
            status: row.read::<&str, _>("status").parse()?,
            created_by: row.read::<&str, _>("created_by").to_owned(),
            created_at: Timestamp::from_millis(row.read::<i64, _>("created_at") as u128),
            merged_at: row
                .read::<Option<i64>, _>("merged_at")
                .map(|t| Timestamp::from_millis(t as u128)),
        })
    }

    pub(super) fn active_exists(db: &sql::Connection, document_id: &str) -> Result<bool, Error> {
        let mut stmt = db.prepare(
            "SELECT 1 FROM proposals
             WHERE document_id = ?1 AND status IN ('draft', 'under-review')",
        )?;
        stmt.bind((1, document_id))?;

        Ok(stmt.into_iter().next().transpose()?.is_some())
    }

    pub(super) fn set_status(
        db: &sql::Connection,
        id: &str,
        status: Status,
        merged_at: Option<Timestamp>,
    ) -> Result<(), Error> {
        let mut stmt = db.prepare(
            "UPDATE proposals SET status = ?2, merged_at = COALESCE(?3, merged_at) WHERE id = ?1",
        )?;
        stmt.bind((1, id))?;
        stmt.bind((2, status.to_string().as_str()))?;
        stmt.bind((3, opt_int(merged_at.map(|t| t.as_millis() as i64))))?;
        stmt.next()?;

        Ok(())
    }

    pub(crate) fn approvals(db: &sql::Connection, id: &str) -> Result<Vec<Approval>, Error> {
        let mut stmt = db.prepare(
            "SELECT proposal_id, role, status, approved_by, approved_at, content_hash
             FROM approvals WHERE proposal_id = ?1
             ORDER BY role",
        )?;
        stmt.bind((1, id))?;

        stmt.into_iter()
            .map(|row| {
                let row = row?;
                Ok(Approval {
                    proposal_id: row.read::<&str, _>("proposal_id").to_owned(),
                    role: row.read::<&str, _>("role").parse()?,
                    status: row.read::<&str, _>("status").parse()?,
                    approved_by: row
                        .read::<Option<&str>, _>("approved_by")
                        .map(|s| s.to_owned()),
                    approved_at: row
                        .read::<Option<i64>, _>("approved_at")
                        .map(|t| Timestamp::from_millis(t as u128)),
                    content_hash: row
                        .read::<Option<&str>, _>("content_hash")
                        .map(|s| s.to_owned()),
                })
            })
            .collect()
    }

    pub(super) fn reviews(db: &sql::Connection, id: &str) -> Result<Vec<ChangeReview>, Error> {
        let mut stmt = db.prepare(
            "SELECT proposal_id, change_id, from_ref, to_ref, review_state, rejected_rationale,
                    reviewed_by, reviewed_at
             FROM change_reviews WHERE proposal_id = ?1
             ORDER BY reviewed_at, change_id",
        )?;
        stmt.bind((1, id))?;

        stmt.into_iter()
            .map(|row| {
                let row = row?;
                Ok(ChangeReview {
                    proposal_id: row.read::<&str, _>("proposal_id").to_owned(),
                    change_id: row.read::<&str, _>("change_id").to_owned(),
                    from_ref: row.read::<&str, _>("from_ref").to_owned(),
                    to_ref: row.read::<&str, _>("to_ref").to_owned(),
                    review_state: row.read::<&str, _>("review_state").parse()?,
                    rejected_rationale: row
                        .read::<Option<&str>, _>("rejected_rationale")
                        .map(|s| s.to_owned()),
                    reviewed_by: row.read::<&str, _>("reviewed_by").to_owned(),
                    reviewed_at: Timestamp::from_millis(row.read::<i64, _>("reviewed_at") as u128),
                })
            })
            .collect()
    }

    pub(super) fn has_decision(
        db: &sql::Connection,
        thread_id: &str,
        proposal_id: &str,
    ) -> Result<bool, Error> {
        let mut stmt = db.prepare(
            "SELECT 1 FROM decision_log WHERE thread_id = ?1 AND proposal_id = ?2",
        )?;
        stmt.bind((1, thread_id))?;
        stmt.bind((2, proposal_id))?;

        Ok(stmt.into_iter().next().transpose()?.is_some())
    }
}
