use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use chronicle::{access, audit, decision, identity, proposal, registry, sync, thread};

/// Errors relating to the API backend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The entity was not found.
    #[error("entity not found")]
    NotFound,

    /// Malformed or missing input.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Missing or unusable credentials.
    #[error("could not authenticate: {0}")]
    Auth(&'static str),

    /// Permission denied after authentication succeeded.
    #[error("forbidden")]
    Forbidden,

    /// Identity error.
    #[error(transparent)]
    Identity(#[from] identity::Error),

    /// Permission resolver error.
    #[error(transparent)]
    Access(#[from] access::Error),

    /// Registry error.
    #[error(transparent)]
    Registry(#[from] registry::Error),

    /// Proposal engine error.
    #[error(transparent)]
    Proposal(#[from] proposal::Error),

    /// Thread store error.
    #[error(transparent)]
    Thread(#[from] thread::Error),

    /// Decision log error.
    #[error(transparent)]
    Decision(#[from] decision::Error),

    /// Audit log error.
    #[error(transparent)]
    Audit(#[from] audit::Error),

    /// Sync ingestion error.
    #[error(transparent)]
    Sync(#[from] sync::Error),

    /// Database error.
    #[error(transparent)]
    Db(#[from] chronicle::db::Error),
}

impl Error {
    /// Map onto the wire taxonomy: status, stable code, public message and
    /// optional details.
    fn parts(&self) -> (StatusCode, &'static str, Option<String>, Option<serde_json::Value>) {
        match self {
            Self::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", None, None),
            Self::Validation(msg) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_ERROR",
                Some(msg.clone()),
                None,
            ),
            Self::Auth(msg) => (
                StatusCode::UNAUTHORIZED,
                "AUTH_REQUIRED",
                Some((*msg).to_owned()),
                None,
            ),
            Self::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", None, None),

            Self::Identity(e) => match e {
                identity::Error::InvalidCredentials => (
                    StatusCode::UNAUTHORIZED,
                    "AUTH_REQUIRED",
                    Some("invalid credentials".to_owned()),
                    None,
                ),
                identity::Error::UnverifiedEmail => (
                    StatusCode::FORBIDDEN,
                    "FORBIDDEN",
                    Some(e.to_string()),
                    None,
                ),
                identity::Error::TokenExpired | identity::Error::TokenRevoked => (
                    StatusCode::UNAUTHORIZED,
                    "AUTH_REQUIRED",
                    Some(e.to_string()),
                    None,
                ),
                identity::Error::RateLimited => (
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMITED",
                    Some(e.to_string()),
                    None,
                ),
                identity::Error::EmailTaken(_) => {
                    (StatusCode::CONFLICT, "CONFLICT", Some(e.to_string()), None)
                }
                identity::Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", None, None),
                _ => internal(),
            },

            Self::Access(e) => match e {
                access::Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", None, None),
                access::Error::PasswordRequired => (
                    StatusCode::FORBIDDEN,
                    "FORBIDDEN",
                    Some(e.to_string()),
                    None,
                ),
                _ => internal(),
            },

            Self::Registry(e) => match e {
                registry::Error::NotFound(_, _) => (StatusCode::NOT_FOUND, "NOT_FOUND", None, None),
                registry::Error::CyclicMove(_) => (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "VALIDATION_ERROR",
                    Some(e.to_string()),
                    None,
                ),
                registry::Error::SpaceNotEmpty(_) => {
                    (StatusCode::CONFLICT, "CONFLICT", Some(e.to_string()), None)
                }
                _ => internal(),
            },

            Self::Proposal(e) => match e {
                proposal::Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", None, None),
                proposal::Error::ActiveProposalExists { .. } => (
                    StatusCode::CONFLICT,
                    "ACTIVE_PROPOSAL_EXISTS",
                    Some(e.to_string()),
                    None,
                ),
                proposal::Error::InvalidTransition { .. } => (
                    StatusCode::CONFLICT,
                    "INVALID_TRANSITION",
                    Some(e.to_string()),
                    None,
                ),
                proposal::Error::ApprovalOrderBlocked { pending } => (
                    StatusCode::CONFLICT,
                    "APPROVAL_ORDER_BLOCKED",
                    Some(e.to_string()),
                    Some(json!({
                        "blockers": pending,
                        "pendingDependencies": pending,
                    })),
                ),
                proposal::Error::MergeGateBlocked(blockers) => (
                    StatusCode::CONFLICT,
                    "MERGE_GATE_BLOCKED",
                    Some(e.to_string()),
                    Some(json!({
                        "pendingApprovals": blockers.approvals,
                        "openThreads": blockers.threads,
                        "unresolvedChanges": blockers.changes,
                    })),
                ),
                proposal::Error::MergeConflict => (
                    StatusCode::CONFLICT,
                    "MERGE_CONFLICT",
                    Some(e.to_string()),
                    None,
                ),
                proposal::Error::Git(e) => upstream(e),
                proposal::Error::Registry(registry::Error::NotFound(_, _)) => {
                    (StatusCode::NOT_FOUND, "NOT_FOUND", None, None)
                }
                _ => internal(),
            },

            Self::Thread(e) => match e {
                thread::Error::NotFound(_, _) => (StatusCode::NOT_FOUND, "NOT_FOUND", None, None),
                thread::Error::InvalidTransition { .. } => (
                    StatusCode::CONFLICT,
                    "INVALID_TRANSITION",
                    Some(e.to_string()),
                    None,
                ),
                thread::Error::Forbidden(_) => (
                    StatusCode::FORBIDDEN,
                    "FORBIDDEN",
                    Some(e.to_string()),
                    None,
                ),
                thread::Error::Git(e) => upstream(e),
                thread::Error::Decision(decision::Error::Immutable(_)) => immutable(),
                _ => internal(),
            },

            Self::Decision(e) => match e {
                decision::Error::Immutable(_) => immutable(),
                _ => internal(),
            },

            Self::Audit(e) => match e {
                audit::Error::Immutable(_) => immutable(),
                _ => internal(),
            },

            Self::Sync(e) => match e {
                sync::Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", None, None),
                sync::Error::Closed(_, _) => (
                    StatusCode::CONFLICT,
                    "INVALID_TRANSITION",
                    Some(e.to_string()),
                    None,
                ),
                sync::Error::Git(e) => upstream(e),
                _ => internal(),
            },

            Self::Db(_) => internal(),
        }
    }
}

fn internal() -> (StatusCode, &'static str, Option<String>, Option<serde_json::Value>) {
    (StatusCode::INTERNAL_SERVER_ERROR, "SERVER_ERROR", None, None)
}

fn immutable() -> (StatusCode, &'static str, Option<String>, Option<serde_json::Value>) {
    (
        StatusCode::CONFLICT,
        "IMMUTABLE",
        Some("record is append-only".to_owned()),
        None,
    )
}

fn upstream(
    e: &chronicle::git::Error,
) -> (StatusCode, &'static str, Option<String>, Option<serde_json::Value>) {
    match e {
        chronicle::git::Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", None, None),
        _ => (
            StatusCode::BAD_GATEWAY,
            "UPSTREAM_UNAVAILABLE",
            Some("git collaborator failed".to_owned()),
            None,
        ),
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, code, msg, details) = self.parts();

        if status == StatusCode::INTERNAL_SERVER_ERROR {
            // Internal context stays in the logs, never in the response.
            tracing::error!("Error: {:?}", &self);
        }

        let mut body = json!({
            "error": msg.or_else(|| status.canonical_reason().map(|r| r.to_string())),
            "code": code,
        });
        if let Some(details) = details {
            body["details"] = details;
        }

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chronicle::gate;
    use chronicle::proposal::ApprovalRole;

    #[test]
    fn test_approval_order_blocked_details() {
        let err = Error::Proposal(proposal::Error::ApprovalOrderBlocked {
            pending: vec![ApprovalRole::Security, ApprovalRole::ArchitectureCommittee],
        });
        let (status, code, _, details) = err.parts();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(code, "APPROVAL_ORDER_BLOCKED");
        let details = details.unwrap();
        assert_eq!(
            details["blockers"],
            json!(["security", "architectureCommittee"])
        );
    }

    #[test]
    fn test_merge_gate_blocked_details() {
        let err = Error::Proposal(proposal::Error::MergeGateBlocked(gate::Blockers {
            approvals: vec![],
            threads: vec!["t1".to_owned()],
            changes: vec![],
        }));
        let (status, code, _, details) = err.parts();
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(code, "MERGE_GATE_BLOCKED");
        assert_eq!(details.unwrap()["openThreads"], json!(["t1"]));
    }

    #[test]
    fn test_not_found_has_no_details() {
        let (status, code, _, details) = Error::NotFound.parts();
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(code, "NOT_FOUND");
        assert!(details.is_none());
    }

    #[test]
    fn test_expired_link_is_not_found() {
        // An expired or revoked link must read as missing, not forbidden.
        let (status, _, _, _) = Error::Access(access::Error::NotFound("link")).parts();
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
