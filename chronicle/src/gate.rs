//! The merge gate.
//!
//! A proposal may merge only when every approval is granted, no thread is
//! left unresolved, and no reviewed change is pending or rejected. The
//! evaluator is deterministic and side-effect-free; the proposal engine
//! loads the rows and consults it both before merging and when building
//! gate previews.
use serde::Serialize;

use crate::proposal::{Approval, ApprovalRole, ApprovalStatus, ChangeReview, ReviewState};
use crate::thread::{self, Thread};

/// What still blocks a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Blockers {
    /// Gate roles that haven't approved.
    pub approvals: Vec<ApprovalRole>,
    /// Threads that are not resolved. Orphaned threads count: they must be
    /// resolved explicitly, not silently dropped.
    pub threads: Vec<String>,
    /// Changes whose review is pending or rejected.
    pub changes: Vec<String>,
}

impl Blockers {
    pub fn is_empty(&self) -> bool {
        self.approvals.is_empty() && self.threads.is_empty() && self.changes.is_empty()
    }
}

/// Result of evaluating the gate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub ready: bool,
    pub blockers: Blockers,
}

/// Evaluate the merge gate over a proposal's rows.
pub fn evaluate(approvals: &[Approval], threads: &[Thread], reviews: &[ChangeReview]) -> Verdict {
    let blockers = Blockers {
        approvals: approvals
            .iter()
            .filter(|a| a.status != ApprovalStatus::Approved)
            .map(|a| a.role)
            .collect(),
        threads: threads
            .iter()
            .filter(|t| t.status != thread::Status::Resolved)
            .map(|t| t.id.clone())
            .collect(),
        changes: reviews
            .iter()
            .filter(|c| matches!(c.review_state, ReviewState::Pending | ReviewState::Rejected))
            .map(|c| c.change_id.clone())
            .collect(),
    };

    Verdict {
        ready: blockers.is_empty(),
        blockers,
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::Timestamp;
    use crate::thread::{Anchor, Kind, Status, Visibility};

    fn approval(role: ApprovalRole, status: ApprovalStatus) -> Approval {
        Approval {
            proposal_id: "p1".to_owned(),
            role,
            status,
            approved_by: None,
            approved_at: None,
            content_hash: None,
        }
    }

    fn thread(id: &str, status: Status) -> Thread {
        Thread {
            id: id.to_owned(),
            proposal_id: "p1".to_owned(),
            anchor: Anchor {
                node_id: "n1".to_owned(),
                ..Anchor::default()
            },
            body: String::new(),
            status,
            visibility: Visibility::Internal,
            kind: Kind::General,
            resolved_outcome: None,
            resolved_note: None,
            orphaned_reason: None,
            author: "alice".to_owned(),
            created_at: Timestamp::from_millis(0),
        }
    }

    fn review(change_id: &str, state: ReviewState) -> ChangeReview {
        ChangeReview {
            proposal_id: "p1".to_owned(),
            change_id: change_id.to_owned(),
            from_ref: "main".to_owned(),
            to_ref: "proposal/doc1-x".to_owned(),
            review_state: state,
            rejected_rationale: None,
            reviewed_by: "alice".to_owned(),
            reviewed_at: Timestamp::from_millis(0),
        }
    }

    fn all_approved() -> Vec<Approval> {
        ApprovalRole::ALL
            .iter()
            .map(|role| approval(*role, ApprovalStatus::Approved))
            .collect()
    }

    #[test]
    fn test_ready_when_empty() {
        let verdict = evaluate(&all_approved(), &[], &[]);
        assert!(verdict.ready);
        assert!(verdict.blockers.is_empty());
    }

    #[test]
    fn test_pending_approvals_block() {
        let approvals = vec![
            approval(ApprovalRole::Security, ApprovalStatus::Approved),
            approval(ApprovalRole::ArchitectureCommittee, ApprovalStatus::Pending),
            approval(ApprovalRole::Legal, ApprovalStatus::Pending),
        ];
        let verdict = evaluate(&approvals, &[], &[]);
        assert!(!verdict.ready);
        assert_eq!(
            verdict.blockers.approvals,
            vec![ApprovalRole::ArchitectureCommittee, ApprovalRole::Legal]
        );
    }

    #[test]
    fn test_open_and_orphaned_threads_block() {
        let threads = vec![
            thread("t1", Status::Open),
            thread("t2", Status::Resolved),
            thread("t3", Status::Orphaned),
        ];
        let verdict = evaluate(&all_approved(), &threads, &[]);
        assert!(!verdict.ready);
        assert_eq!(
            verdict.blockers.threads,
            vec!["t1".to_owned(), "t3".to_owned()]
        );
    }

    #[test]
    fn test_pending_and_rejected_changes_block() {
        let reviews = vec![
            review("c1", ReviewState::Pending),
            review("c2", ReviewState::Accepted),
            review("c3", ReviewState::Rejected),
            review("c4", ReviewState::Deferred),
        ];
        let verdict = evaluate(&all_approved(), &[], &reviews);
        assert!(!verdict.ready);
        assert_eq!(
            verdict.blockers.changes,
            vec!["c1".to_owned(), "c3".to_owned()]
        );
    }

    #[test]
    fn test_evaluation_is_deterministic() {
        let approvals = vec![approval(ApprovalRole::Legal, ApprovalStatus::Pending)];
        let threads = vec![thread("t1", Status::Open)];
        assert_eq!(
            evaluate(&approvals, &threads, &[]),
            evaluate(&approvals, &threads, &[])
        );
    }
}
