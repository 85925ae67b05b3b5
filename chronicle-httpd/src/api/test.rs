//! API tests, driving the router the way a client would.
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt as _;

use chronicle::db::Database;
use chronicle::git::Repos;

use crate::api::{self, Context};
use crate::Options;

const SYNC_TOKEN: &str = "test-sync-token";

struct TestServer {
    router: Router,
    _tmp: tempfile::TempDir,
}

impl TestServer {
    fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let options = Options {
            listen: ([127, 0, 0, 1], 0).into(),
            db: tmp.path().join("chronicle.db"),
            repos: tmp.path().join("repos"),
            cors_origin: None,
            sync_token: Some(SYNC_TOKEN.to_owned()),
            session_secret: Some("test-secret".to_owned()),
        };
        let db = Database::memory().unwrap();
        let repos = Repos::open(&options.repos).unwrap();
        let ctx = Context::new(db, repos, &options);

        Self {
            router: api::router(ctx, None),
            _tmp: tmp,
        }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder().method(method).uri(path);
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let request = match body {
            Some(body) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response: Response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    /// Sign up, verify and log in a user; returns their access token.
    async fn login(&self, email: &str, name: &str) -> String {
        let (status, body) = self
            .request(
                Method::POST,
                "/auth/signup",
                None,
                Some(json!({
                    "email": email,
                    "password": "hunter2hunter2",
                    "displayName": name,
                })),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{body}");
        let token = body["verificationToken"].as_str().unwrap().to_owned();

        let (status, _) = self
            .request(
                Method::POST,
                "/auth/verify",
                None,
                Some(json!({ "token": token })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = self
            .request(
                Method::POST,
                "/auth/login",
                None,
                Some(json!({ "email": email, "password": "hunter2hunter2" })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        body["tokens"]["accessToken"].as_str().unwrap().to_owned()
    }
}

#[tokio::test]
async fn test_root() {
    let server = TestServer::new();
    let (status, body) = server.request(Method::GET, "/", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["service"], "chronicle");
}

#[tokio::test]
async fn test_auth_is_required() {
    let server = TestServer::new();

    let (status, body) = server.request(Method::GET, "/spaces", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "AUTH_REQUIRED");

    let (status, _) = server
        .request(Method::GET, "/spaces", Some("not-a-token"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_login_requires_verified_email() {
    let server = TestServer::new();
    let (status, _) = server
        .request(
            Method::POST,
            "/auth/signup",
            None,
            Some(json!({
                "email": "bob@acme.test",
                "password": "hunter2hunter2",
                "displayName": "Bob",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = server
        .request(
            Method::POST,
            "/auth/login",
            None,
            Some(json!({ "email": "bob@acme.test", "password": "hunter2hunter2" })),
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");
}

#[tokio::test]
async fn test_signup_validation() {
    let server = TestServer::new();
    let (status, body) = server
        .request(
            Method::POST,
            "/auth/signup",
            None,
            Some(json!({ "email": "nope", "password": "short", "displayName": "X" })),
        )
        .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn test_sync_requires_shared_token() {
    let server = TestServer::new();
    let event = json!({
        "sessionId": "s1",
        "documentId": "doc1",
        "proposalId": "p1",
        "actor": "gateway",
        "updateCount": 1,
        "snapshot": [],
    });

    let request = Request::builder()
        .method(Method::POST)
        .uri("/internal/sync/session-ended")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(event.to_string()))
        .unwrap();
    let response = server.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // With the token, the request is authenticated; the unknown proposal
    // is then a 404.
    let request = Request::builder()
        .method(Method::POST)
        .uri("/internal/sync/session-ended")
        .header(header::CONTENT_TYPE, "application/json")
        .header("x-chronicle-sync-token", SYNC_TOKEN)
        .body(Body::from(event.to_string()))
        .unwrap();
    let response = server.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

/// The whole governance flow, through the HTTP surface: space, document,
/// proposal, thread, ordered approvals, resolution, merge.
#[tokio::test]
async fn test_governance_flow() {
    let server = TestServer::new();
    // First signup bootstraps the workspace as admin.
    let token = server.login("alice@acme.test", "Alice").await;
    let token = Some(token.as_str());

    let (status, space) = server
        .request(
            Method::POST,
            "/spaces",
            token,
            Some(json!({ "name": "Contracts" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{space}");
    let space_id = space["id"].as_str().unwrap();

    let (status, document) = server
        .request(
            Method::POST,
            "/documents",
            token,
            Some(json!({ "spaceId": space_id, "title": "Master agreement" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{document}");
    let doc = document["id"].as_str().unwrap();

    let (status, proposal) = server
        .request(
            Method::POST,
            &format!("/documents/{doc}/proposals"),
            token,
            Some(json!({ "title": "Round 1" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{proposal}");
    let pid = proposal["id"].as_str().unwrap();
    assert_eq!(proposal["status"], "draft");

    // A second proposal on the same document conflicts.
    let (status, body) = server
        .request(
            Method::POST,
            &format!("/documents/{doc}/proposals"),
            token,
            Some(json!({ "title": "Round 2" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "ACTIVE_PROPOSAL_EXISTS");

    let (status, _) = server
        .request(
            Method::POST,
            &format!("/documents/{doc}/proposals/{pid}/submit"),
            token,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, thread) = server
        .request(
            Method::POST,
            &format!("/documents/{doc}/proposals/{pid}/threads"),
            token,
            Some(json!({
                "anchor": { "nodeId": "n1" },
                "body": "is clause 4 enforceable?",
                "type": "legal",
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{thread}");
    let tid = thread["id"].as_str().unwrap();

    // Legal before the technical approvals is blocked, with the
    // unsatisfied dependencies in the details.
    let (status, body) = server
        .request(
            Method::POST,
            &format!("/documents/{doc}/proposals/{pid}/approvals"),
            token,
            Some(json!({ "role": "legal" })),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "APPROVAL_ORDER_BLOCKED");
    assert_eq!(
        body["details"]["blockers"],
        json!(["security", "architectureCommittee"])
    );

    for role in ["security", "architectureCommittee", "legal"] {
        let (status, _) = server
            .request(
                Method::POST,
                &format!("/documents/{doc}/proposals/{pid}/approvals"),
                token,
                Some(json!({ "role": role })),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
    }

    // The open thread still blocks the merge.
    let (status, body) = server
        .request(
            Method::POST,
            &format!("/documents/{doc}/proposals/{pid}/merge"),
            token,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "MERGE_GATE_BLOCKED");
    assert_eq!(body["details"]["openThreads"], json!([tid]));

    let (status, _) = server
        .request(
            Method::POST,
            &format!("/documents/{doc}/proposals/{pid}/threads/{tid}/resolve"),
            token,
            Some(json!({ "outcome": "accepted", "rationale": "ok" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, merged) = server
        .request(
            Method::POST,
            &format!("/documents/{doc}/proposals/{pid}/merge"),
            token,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{merged}");
    assert_eq!(merged["status"], "merged");

    let (status, doc_after) = server
        .request(Method::GET, &format!("/documents/{doc}"), token, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc_after["status"], "approved");

    let (status, log) = server
        .request(
            Method::GET,
            &format!("/documents/{doc}/decision-log"),
            token,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(log.as_array().unwrap().len(), 1);
    assert_eq!(log[0]["threadId"], json!(tid));
    assert_eq!(log[0]["outcome"], "accepted");
}

#[tokio::test]
async fn test_public_link_roundtrip() {
    let server = TestServer::new();
    let token = server.login("alice@acme.test", "Alice").await;
    let token = Some(token.as_str());

    let (_, space) = server
        .request(Method::POST, "/spaces", token, Some(json!({ "name": "S" })))
        .await;
    let (_, document) = server
        .request(
            Method::POST,
            "/documents",
            token,
            Some(json!({ "spaceId": space["id"], "title": "Doc" })),
        )
        .await;
    let doc = document["id"].as_str().unwrap();

    let (status, link) = server
        .request(
            Method::POST,
            &format!("/documents/{doc}/public-links"),
            token,
            Some(json!({ "role": "viewer" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{link}");
    let share_token = link["token"].as_str().unwrap();

    // Anonymous access through the link.
    let (status, body) = server
        .request(Method::GET, &format!("/share/{share_token}"), None, None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["document"]["id"], document["id"]);
    assert_eq!(body["role"], "viewer");

    // Revoked links read as missing.
    let (status, _) = server
        .request(
            Method::DELETE,
            &format!("/documents/{doc}/public-links/{}", link["id"].as_str().unwrap()),
            token,
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = server
        .request(Method::GET, &format!("/share/{share_token}"), None, None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
