//! Document endpoints: the tree, sharing, permissions and the logs.
use axum::extract::{Path, Query};
use axum::http::{HeaderMap, Method};
use axum::response::IntoResponse;
use axum::routing::{delete, get, post, put};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;

use chronicle::access::{Resource, Role, Subject};
use chronicle::common::Timestamp;
use chronicle::decision;
use chronicle::registry::ShareMode;

use crate::api::auth::AuthenticatedUser;
use crate::api::error::Error;
use crate::api::Context;

/// Header carrying the password of a protected public link.
const SHARE_PASSWORD_HEADER: &str = "x-share-password";

pub fn router(ctx: Context) -> Router {
    Router::new()
        .route(
            "/documents",
            get(document_list_handler).post(document_create_handler),
        )
        .route(
            "/documents/:id",
            get(document_get_handler).put(document_update_handler),
        )
        .route("/documents/:id/share-mode", put(share_mode_handler))
        .route("/documents/:id/move", post(document_move_handler))
        .route("/documents/:id/decision-log", get(decision_log_handler))
        .route("/documents/:id/audit", get(audit_handler))
        .route(
            "/documents/:id/permissions",
            get(permission_list_handler).post(permission_grant_handler),
        )
        .route(
            "/documents/:id/permissions/:pid",
            delete(permission_revoke_handler),
        )
        .route(
            "/documents/:id/public-links",
            get(link_list_handler).post(link_create_handler),
        )
        .route("/documents/:id/public-links/:lid", delete(link_revoke_handler))
        .route("/share/:token", get(share_handler))
        .layer(Extension(ctx))
}

#[derive(Deserialize)]
struct SpaceQuery {
    space: String,
}

/// List documents of a space, in tree order.
/// `GET /documents?space=<id>`
async fn document_list_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Query(query): Query<SpaceQuery>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Space(query.space.clone()),
        Role::Viewer,
        "document.list",
        "/documents",
        Method::GET.as_str(),
    )?;

    Ok::<_, Error>(Json(json!(ctx.registry().documents(&query.space)?)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateDocumentRequest {
    space_id: String,
    title: String,
    #[serde(default)]
    subtitle: String,
    parent_id: Option<String>,
}

/// Create a document.
/// `POST /documents`
async fn document_create_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Json(request): Json<CreateDocumentRequest>,
) -> impl IntoResponse {
    if request.title.is_empty() {
        return Err(Error::Validation("a title is required".to_owned()));
    }
    ctx.require(
        &principal.user,
        &Resource::Space(request.space_id.clone()),
        Role::Editor,
        "document.create",
        "/documents",
        Method::POST.as_str(),
    )?;

    let document = ctx.registry().create_document(
        &request.space_id,
        &request.title,
        &request.subtitle,
        request.parent_id.as_deref(),
        &principal.user.display_name,
    )?;

    Ok::<_, Error>(Json(json!(document)))
}

/// Get a document.
/// `GET /documents/:id`
async fn document_get_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Viewer,
        "document.read",
        "/documents/:id",
        Method::GET.as_str(),
    )?;

    Ok::<_, Error>(Json(json!(ctx.registry().document(&id)?)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateDocumentRequest {
    title: String,
    #[serde(default)]
    subtitle: String,
    #[serde(default)]
    sort_order: i64,
}

/// Update a document's metadata.
/// `PUT /documents/:id`
async fn document_update_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path(id): Path<String>,
    Json(request): Json<UpdateDocumentRequest>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Editor,
        "document.update",
        "/documents/:id",
        Method::PUT.as_str(),
    )?;

    let document = ctx.registry().update_document(
        &id,
        &request.title,
        &request.subtitle,
        request.sort_order,
        &principal.user.display_name,
    )?;

    Ok::<_, Error>(Json(json!(document)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShareModeRequest {
    share_mode: ShareMode,
}

/// Set a document's share mode.
/// `PUT /documents/:id/share-mode`
async fn share_mode_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path(id): Path<String>,
    Json(request): Json<ShareModeRequest>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Admin,
        "document.share-mode",
        "/documents/:id/share-mode",
        Method::PUT.as_str(),
    )?;

    let document =
        ctx.registry()
            .set_share_mode(&id, request.share_mode, &principal.user.display_name)?;

    Ok::<_, Error>(Json(json!(document)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MoveRequest {
    parent_id: Option<String>,
    space_id: Option<String>,
}

/// Move a document, rewriting its whole subtree atomically.
/// `POST /documents/:id/move`
async fn document_move_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path(id): Path<String>,
    Json(request): Json<MoveRequest>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Editor,
        "document.move",
        "/documents/:id/move",
        Method::POST.as_str(),
    )?;

    let document = ctx.registry().move_document(
        &id,
        request.parent_id.as_deref(),
        request.space_id.as_deref(),
        &principal.user.display_name,
    )?;

    Ok::<_, Error>(Json(json!(document)))
}

#[derive(Deserialize)]
struct DecisionLogQuery {
    outcome: Option<decision::Outcome>,
    author: Option<String>,
    q: Option<String>,
    limit: Option<i64>,
}

/// List the decision log of a document.
/// `GET /documents/:id/decision-log?outcome=&author=&q=&limit=`
async fn decision_log_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<DecisionLogQuery>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Viewer,
        "decision-log.read",
        "/documents/:id/decision-log",
        Method::GET.as_str(),
    )?;

    let entries = ctx.decisions().list(
        &id,
        &decision::Filter {
            outcome: query.outcome,
            author: query.author.as_deref(),
            q: query.q.as_deref(),
            limit: query.limit,
        },
    )?;

    Ok::<_, Error>(Json(json!(entries)))
}

#[derive(Deserialize)]
struct AuditQuery {
    proposal: Option<String>,
    limit: Option<i64>,
}

/// List audit events of a document, newest first.
/// `GET /documents/:id/audit?proposal=&limit=`
async fn audit_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<AuditQuery>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Admin,
        "audit.read",
        "/documents/:id/audit",
        Method::GET.as_str(),
    )?;

    let events = ctx
        .audit()
        .list(&id, query.proposal.as_deref(), query.limit.unwrap_or(100))?;

    Ok::<_, Error>(Json(json!(events)))
}

/// List grants on a document.
/// `GET /documents/:id/permissions`
async fn permission_list_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let resource = Resource::Document(id.clone());
    ctx.require(
        &principal.user,
        &resource,
        Role::Admin,
        "permission.list",
        "/documents/:id/permissions",
        Method::GET.as_str(),
    )?;

    Ok::<_, Error>(Json(json!(ctx.permissions().list(&resource)?)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GrantRequest {
    #[serde(flatten)]
    subject: Subject,
    role: Role,
    expires_at: Option<i64>,
}

/// Grant a role on a document.
/// `POST /documents/:id/permissions`
async fn permission_grant_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path(id): Path<String>,
    Json(request): Json<GrantRequest>,
) -> impl IntoResponse {
    let resource = Resource::Document(id.clone());
    ctx.require(
        &principal.user,
        &resource,
        Role::Admin,
        "permission.grant",
        "/documents/:id/permissions",
        Method::POST.as_str(),
    )?;

    let workspace = ctx.workspace_of(&resource)?;
    let grant = ctx.permissions().grant(
        &workspace,
        &request.subject,
        &resource,
        request.role,
        &principal.user.display_name,
        request.expires_at.map(|t| Timestamp::from_millis(t as u128)),
    )?;

    Ok::<_, Error>(Json(json!(grant)))
}

/// Revoke a grant.
/// `DELETE /documents/:id/permissions/:pid`
async fn permission_revoke_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid)): Path<(String, String)>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Admin,
        "permission.revoke",
        "/documents/:id/permissions/:pid",
        Method::DELETE.as_str(),
    )?;
    ctx.permissions().revoke(&pid, &principal.user.display_name)?;

    Ok::<_, Error>(Json(json!({})))
}

/// List a document's public links.
/// `GET /documents/:id/public-links`
async fn link_list_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Admin,
        "link.list",
        "/documents/:id/public-links",
        Method::GET.as_str(),
    )?;

    Ok::<_, Error>(Json(json!(ctx.permissions().list_links(&id)?)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateLinkRequest {
    role: Option<Role>,
    password: Option<String>,
    expires_at: Option<i64>,
}

/// Create a public link.
/// `POST /documents/:id/public-links`
async fn link_create_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path(id): Path<String>,
    Json(request): Json<CreateLinkRequest>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Admin,
        "link.create",
        "/documents/:id/public-links",
        Method::POST.as_str(),
    )?;
    // Make sure the document exists before minting a token for it.
    ctx.registry().document(&id)?;

    let link = ctx.permissions().create_link(
        &id,
        request.role.unwrap_or(Role::Viewer),
        request.password.as_deref(),
        request.expires_at.map(|t| Timestamp::from_millis(t as u128)),
        &principal.user.display_name,
    )?;

    Ok::<_, Error>(Json(json!(link)))
}

/// Revoke a public link.
/// `DELETE /documents/:id/public-links/:lid`
async fn link_revoke_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, lid)): Path<(String, String)>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Admin,
        "link.revoke",
        "/documents/:id/public-links/:lid",
        Method::DELETE.as_str(),
    )?;
    ctx.permissions().revoke_link(&lid, &principal.user.display_name)?;

    Ok::<_, Error>(Json(json!({})))
}

/// Resolve a public link into an anonymous, link-scoped principal.
/// `GET /share/:token`
///
/// The password, when required, is taken from the `x-share-password`
/// header. Bumping the access statistics is best-effort and never denies
/// access.
async fn share_handler(
    Extension(ctx): Extension<Context>,
    Path(token): Path<String>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let password = headers
        .get(SHARE_PASSWORD_HEADER)
        .and_then(|v| v.to_str().ok());

    let link = ctx.permissions().verify_link(&token, password)?;
    if let Err(e) = ctx.permissions().touch_link(&link.link_id) {
        tracing::warn!("Failed to update link statistics: {e}");
    }

    let document = ctx.registry().document(&link.document_id)?;

    Ok::<_, Error>(Json(json!({
        "document": {
            "id": document.id,
            "title": document.title,
            "subtitle": document.subtitle,
            "status": document.status,
        },
        "role": link.role,
    })))
}
