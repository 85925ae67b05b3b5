//! End-to-end governance scenarios, exercising the public API the way the
//! HTTP surface does.
use chronicle::access::{Permissions, Resource, Role, Subject};
use chronicle::db::Database;
use chronicle::decision::{DecisionLog, Filter, Outcome};
use chronicle::git::Repos;
use chronicle::identity::Users;
use chronicle::proposal::{ApprovalRole, Error as ProposalError, Proposals, Status};
use chronicle::registry::{DocumentStatus, Registry, SpaceVisibility};
use chronicle::sync::{Outcome as SyncOutcome, SessionEnded, Sessions};
use chronicle::thread::{Anchor, Kind, NewThread, Threads, Visibility};

struct Harness {
    db: Database,
    registry: Registry,
    proposals: Proposals,
    threads: Threads,
    decisions: DecisionLog,
    permissions: Permissions,
    users: Users,
    sessions: Sessions,
    repos: Repos,
    workspace_id: String,
    space_id: String,
    document_id: String,
    _tmp: tempfile::TempDir,
}

fn harness() -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let db = Database::memory().unwrap();
    let registry = Registry::open(db.clone());
    let workspace = registry.create_workspace("Acme").unwrap();
    let space = registry
        .create_space(&workspace.id, "Contracts", "", SpaceVisibility::Organization)
        .unwrap();
    let document = registry
        .create_document(&space.id, "Master agreement", "", None, "alice")
        .unwrap();
    let repos = Repos::open(tmp.path().join("repos")).unwrap();

    Harness {
        registry,
        proposals: Proposals::open(db.clone()),
        threads: Threads::open(db.clone()),
        decisions: DecisionLog::open(db.clone()),
        permissions: Permissions::open(db.clone()),
        users: Users::open(db.clone()),
        sessions: Sessions::open(db.clone()),
        db,
        repos,
        workspace_id: workspace.id,
        space_id: space.id,
        document_id: document.id,
        _tmp: tmp,
    }
}

fn thread_on<'a>(proposal_id: &'a str, node: &str, visibility: Visibility) -> NewThread<'a> {
    NewThread {
        proposal_id,
        anchor: Anchor {
            node_id: node.to_owned(),
            ..Anchor::default()
        },
        body: "please check this clause",
        visibility,
        kind: Kind::Legal,
        author: "alice",
    }
}

/// Scenario 1: create, deliberate, approve in order, resolve, merge.
#[test]
fn happy_merge() {
    let h = harness();
    let p1 = h
        .proposals
        .create(&h.repos, &h.document_id, "Round 1", "alice")
        .unwrap();
    h.proposals.submit(&p1.id, "alice").unwrap();

    let t1 = h
        .threads
        .create(&thread_on(&p1.id, "n1", Visibility::Internal))
        .unwrap();

    for role in ApprovalRole::ALL {
        h.proposals.approve(&h.repos, &p1.id, role, "root").unwrap();
    }
    h.threads
        .resolve(&h.repos, &t1.id, Outcome::Accepted, "ok", "alice")
        .unwrap();

    let merged = h.proposals.merge(&h.repos, &p1.id, "alice").unwrap();
    assert_eq!(merged.status, Status::Merged);
    assert_eq!(
        h.registry.document(&h.document_id).unwrap().status,
        DocumentStatus::Approved
    );

    let entries = h.decisions.list(&h.document_id, &Filter::default()).unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].thread_id, t1.id);
    assert_eq!(entries[0].outcome, Outcome::Accepted);
    assert_eq!(entries[0].rationale, "ok");
    assert_ne!(entries[0].commit_hash, "");
}

/// Scenario 2: legal cannot approve before the technical roles.
#[test]
fn approval_order_violation() {
    let h = harness();
    let p2 = h
        .proposals
        .create(&h.repos, &h.document_id, "Round 2", "alice")
        .unwrap();
    h.proposals.submit(&p2.id, "alice").unwrap();

    match h
        .proposals
        .approve(&h.repos, &p2.id, ApprovalRole::Legal, "userA")
    {
        Err(ProposalError::ApprovalOrderBlocked { pending }) => {
            assert!(pending.contains(&ApprovalRole::Security));
            assert!(pending.contains(&ApprovalRole::ArchitectureCommittee));
        }
        other => panic!("unexpected: {other:?}"),
    }

    let legal = h
        .proposals
        .approvals(&p2.id)
        .unwrap()
        .into_iter()
        .find(|a| a.role == ApprovalRole::Legal)
        .unwrap();
    assert_eq!(legal.approved_by, None);
}

/// Scenario 3: all approvals in, but an open thread blocks the merge.
#[test]
fn merge_gate_blocked_by_open_thread() {
    let h = harness();
    let p3 = h
        .proposals
        .create(&h.repos, &h.document_id, "Round 3", "alice")
        .unwrap();
    h.proposals.submit(&p3.id, "alice").unwrap();
    for role in ApprovalRole::ALL {
        h.proposals.approve(&h.repos, &p3.id, role, "root").unwrap();
    }
    h.threads
        .create(&thread_on(&p3.id, "n1", Visibility::Internal))
        .unwrap();

    match h.proposals.merge(&h.repos, &p3.id, "alice") {
        Err(ProposalError::MergeGateBlocked(blockers)) => {
            assert!(!blockers.threads.is_empty());
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(h.proposals.get(&p3.id).unwrap().status, Status::Approved);
}

/// Scenario 4: external guests never see internal threads, including via
/// direct store reads.
#[test]
fn external_visibility() {
    let h = harness();
    let p1 = h
        .proposals
        .create(&h.repos, &h.document_id, "Round 1", "alice")
        .unwrap();

    let t_int = h
        .threads
        .create(&thread_on(&p1.id, "n1", Visibility::Internal))
        .unwrap();
    let t_ext = h
        .threads
        .create(&thread_on(&p1.id, "n2", Visibility::External))
        .unwrap();

    let g1 = h
        .users
        .invite_guest("g1@partner.test", "G1", &h.space_id, None)
        .unwrap();
    assert!(g1.is_external);

    // The listing an external principal gets.
    let visible = h.threads.list(&p1.id, g1.is_internal()).unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].id, t_ext.id);
    assert!(visible.iter().all(|t| t.id != t_int.id));

    // And the guest's effective role stays clamped to their space.
    h.permissions
        .grant(
            &h.workspace_id,
            &Subject::User(g1.id.clone()),
            &Resource::Space(h.space_id.clone()),
            Role::Commenter,
            "root",
            None,
        )
        .unwrap();
    assert_eq!(
        h.permissions
            .effective(&g1, &Resource::Document(h.document_id.clone()))
            .unwrap(),
        Some(Role::Commenter)
    );
    assert_eq!(
        h.permissions
            .effective(&g1, &Resource::Workspace(h.workspace_id.clone()))
            .unwrap(),
        None
    );
}

/// Scenario 5: the decision log rejects mutation at the storage layer.
#[test]
fn decision_log_immutability() {
    let h = harness();
    let p1 = h
        .proposals
        .create(&h.repos, &h.document_id, "Round 1", "alice")
        .unwrap();
    let t1 = h
        .threads
        .create(&thread_on(&p1.id, "n1", Visibility::Internal))
        .unwrap();
    h.threads
        .resolve(&h.repos, &t1.id, Outcome::Accepted, "ok", "alice")
        .unwrap();

    let e1 = &h.decisions.list(&h.document_id, &Filter::default()).unwrap()[0];
    let err = h
        .db
        .execute(format!(
            "UPDATE decision_log SET rationale = 'x' WHERE id = {}",
            e1.id
        ))
        .unwrap_err();
    assert!(chronicle::db::is_append_only_violation(&err));

    let after = &h.decisions.list(&h.document_id, &Filter::default()).unwrap()[0];
    assert_eq!(after.rationale, "ok");
}

/// Scenario 6: flushing the same session twice yields one commit.
#[test]
fn sync_idempotency() {
    let h = harness();
    let p1 = h
        .proposals
        .create(&h.repos, &h.document_id, "Round 1", "alice")
        .unwrap();

    let flush = SessionEnded {
        session_id: "s1".to_owned(),
        document_id: h.document_id.clone(),
        proposal_id: p1.id.clone(),
        actor: "alice".to_owned(),
        update_count: 3,
        snapshot: serde_json::json!([
            { "id": "n1", "kind": "paragraph", "text": "final wording" }
        ]),
    };

    let first = h.sessions.session_ended(&h.repos, &flush).unwrap();
    assert!(matches!(first, SyncOutcome::Committed { .. }));
    let second = h.sessions.session_ended(&h.repos, &flush).unwrap();
    assert_eq!(second, SyncOutcome::Duplicate);

    let repo = h.repos.repository(&h.document_id).unwrap();
    let commits = repo.commits(&p1.branch_name, 10).unwrap();
    let autosaves = commits
        .iter()
        .filter(|c| c.message.contains("session s1"))
        .count();
    assert_eq!(autosaves, 1);
}

/// Boundary: a fresh proposal has no threads; decision-log `limit=0`
/// returns nothing.
#[test]
fn boundaries() {
    let h = harness();
    let p1 = h
        .proposals
        .create(&h.repos, &h.document_id, "Round 1", "alice")
        .unwrap();
    assert!(h.threads.list(&p1.id, true).unwrap().is_empty());

    let t1 = h
        .threads
        .create(&thread_on(&p1.id, "n1", Visibility::Internal))
        .unwrap();
    h.threads
        .resolve(&h.repos, &t1.id, Outcome::Deferred, "later", "alice")
        .unwrap();
    let none = h
        .decisions
        .list(
            &h.document_id,
            &Filter {
                limit: Some(0),
                ..Filter::default()
            },
        )
        .unwrap();
    assert!(none.is_empty());
}

/// Moving a document rewrites every descendant path (P7), checked through
/// the same registry the HTTP surface uses.
#[test]
fn move_updates_descendant_paths() {
    let h = harness();
    let child = h
        .registry
        .create_document(&h.space_id, "Annex", "", Some(&h.document_id), "alice")
        .unwrap();
    let grandchild = h
        .registry
        .create_document(&h.space_id, "Schedule", "", Some(&child.id), "alice")
        .unwrap();
    let target = h
        .registry
        .create_document(&h.space_id, "Archive", "", None, "alice")
        .unwrap();

    let moved = h
        .registry
        .move_document(&h.document_id, Some(&target.id), None, "alice")
        .unwrap();

    for id in [&child.id, &grandchild.id] {
        let doc = h.registry.document(id).unwrap();
        assert!(doc.path.starts_with(&format!("{}/", moved.path)));
    }
}
