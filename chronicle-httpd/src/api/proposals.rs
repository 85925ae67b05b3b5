//! Proposal endpoints.
use axum::extract::Path;
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;

use chronicle::access::{Resource, Role};
use chronicle::proposal::{ApprovalRole, Proposal, ReviewState};

use crate::api::auth::AuthenticatedUser;
use crate::api::error::Error;
use crate::api::Context;

pub fn router(ctx: Context) -> Router {
    Router::new()
        .route(
            "/documents/:id/proposals",
            get(proposal_list_handler).post(proposal_create_handler),
        )
        .route("/documents/:id/proposals/:pid", get(proposal_get_handler))
        .route(
            "/documents/:id/proposals/:pid/submit",
            post(proposal_submit_handler),
        )
        .route(
            "/documents/:id/proposals/:pid/reject",
            post(proposal_reject_handler),
        )
        .route(
            "/documents/:id/proposals/:pid/approvals",
            get(approval_list_handler).post(approval_handler),
        )
        .route("/documents/:id/proposals/:pid/gate", get(gate_handler))
        .route("/documents/:id/proposals/:pid/merge", post(merge_handler))
        .route(
            "/documents/:id/proposals/:pid/versions",
            get(version_list_handler).post(version_create_handler),
        )
        .route("/documents/:id/proposals/:pid/changes", get(changes_handler))
        .route(
            "/documents/:id/proposals/:pid/changes/:cid/review",
            post(change_review_handler),
        )
        .layer(Extension(ctx))
}

/// Load a proposal and check it belongs to the routed document.
fn scoped(ctx: &Context, document: &str, pid: &str) -> Result<Proposal, Error> {
    let proposal = ctx.proposals().get(pid)?;
    if proposal.document_id != document {
        return Err(Error::NotFound);
    }
    Ok(proposal)
}

#[derive(Deserialize)]
struct CreateProposalRequest {
    title: String,
}

/// Create a proposal for a document.
/// `POST /documents/:id/proposals`
async fn proposal_create_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path(id): Path<String>,
    Json(request): Json<CreateProposalRequest>,
) -> impl IntoResponse {
    if request.title.is_empty() {
        return Err(Error::Validation("a title is required".to_owned()));
    }
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Suggester,
        "proposal.create",
        "/documents/:id/proposals",
        Method::POST.as_str(),
    )?;

    let proposal =
        ctx.proposals()
            .create(ctx.repos(), &id, &request.title, &principal.user.display_name)?;

    Ok::<_, Error>(Json(json!(proposal)))
}

/// List a document's proposals.
/// `GET /documents/:id/proposals`
async fn proposal_list_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path(id): Path<String>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Viewer,
        "proposal.list",
        "/documents/:id/proposals",
        Method::GET.as_str(),
    )?;

    Ok::<_, Error>(Json(json!(ctx.proposals().for_document(&id)?)))
}

/// Get a proposal with its approvals.
/// `GET /documents/:id/proposals/:pid`
async fn proposal_get_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid)): Path<(String, String)>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Viewer,
        "proposal.read",
        "/documents/:id/proposals/:pid",
        Method::GET.as_str(),
    )?;

    let proposal = scoped(&ctx, &id, &pid)?;
    let approvals = ctx.proposals().approvals(&pid)?;

    Ok::<_, Error>(Json(json!({
        "proposal": proposal,
        "approvals": approvals,
    })))
}

/// Submit a draft proposal for review.
/// `POST /documents/:id/proposals/:pid/submit`
async fn proposal_submit_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid)): Path<(String, String)>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Suggester,
        "proposal.submit",
        "/documents/:id/proposals/:pid/submit",
        Method::POST.as_str(),
    )?;
    scoped(&ctx, &id, &pid)?;

    let proposal = ctx.proposals().submit(&pid, &principal.user.display_name)?;

    Ok::<_, Error>(Json(json!(proposal)))
}

/// Reject a proposal.
/// `POST /documents/:id/proposals/:pid/reject`
async fn proposal_reject_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid)): Path<(String, String)>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Editor,
        "proposal.reject",
        "/documents/:id/proposals/:pid/reject",
        Method::POST.as_str(),
    )?;
    scoped(&ctx, &id, &pid)?;

    let proposal = ctx.proposals().reject(&pid, &principal.user.display_name)?;

    Ok::<_, Error>(Json(json!(proposal)))
}

/// List approvals.
/// `GET /documents/:id/proposals/:pid/approvals`
async fn approval_list_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid)): Path<(String, String)>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Viewer,
        "approval.list",
        "/documents/:id/proposals/:pid/approvals",
        Method::GET.as_str(),
    )?;
    scoped(&ctx, &id, &pid)?;

    Ok::<_, Error>(Json(json!(ctx.proposals().approvals(&pid)?)))
}

#[derive(Deserialize)]
struct ApprovalRequest {
    role: ApprovalRole,
}

/// Record an approval for a gate role.
/// `POST /documents/:id/proposals/:pid/approvals`
async fn approval_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid)): Path<(String, String)>,
    Json(request): Json<ApprovalRequest>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Editor,
        "proposal.approve",
        "/documents/:id/proposals/:pid/approvals",
        Method::POST.as_str(),
    )?;
    scoped(&ctx, &id, &pid)?;

    let approval = ctx.proposals().approve(
        ctx.repos(),
        &pid,
        request.role,
        &principal.user.display_name,
    )?;

    Ok::<_, Error>(Json(json!(approval)))
}

/// Preview the merge gate.
/// `GET /documents/:id/proposals/:pid/gate`
async fn gate_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid)): Path<(String, String)>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Viewer,
        "gate.read",
        "/documents/:id/proposals/:pid/gate",
        Method::GET.as_str(),
    )?;
    scoped(&ctx, &id, &pid)?;

    Ok::<_, Error>(Json(json!(ctx.proposals().gate(&pid)?)))
}

/// Merge the proposal into its target branch.
/// `POST /documents/:id/proposals/:pid/merge`
async fn merge_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid)): Path<(String, String)>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Editor,
        "proposal.merge",
        "/documents/:id/proposals/:pid/merge",
        Method::POST.as_str(),
    )?;
    scoped(&ctx, &id, &pid)?;

    let proposal = ctx
        .proposals()
        .merge(ctx.repos(), &pid, &principal.user.display_name)?;

    Ok::<_, Error>(Json(json!(proposal)))
}

#[derive(Deserialize)]
struct VersionRequest {
    name: String,
}

/// Tag the current branch head with a name.
/// `POST /documents/:id/proposals/:pid/versions`
async fn version_create_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid)): Path<(String, String)>,
    Json(request): Json<VersionRequest>,
) -> impl IntoResponse {
    if request.name.is_empty() {
        return Err(Error::Validation("a version name is required".to_owned()));
    }
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Suggester,
        "version.create",
        "/documents/:id/proposals/:pid/versions",
        Method::POST.as_str(),
    )?;
    scoped(&ctx, &id, &pid)?;

    let version = ctx.proposals().create_named_version(
        ctx.repos(),
        &pid,
        &request.name,
        &principal.user.display_name,
    )?;

    Ok::<_, Error>(Json(json!(version)))
}

/// List named versions.
/// `GET /documents/:id/proposals/:pid/versions`
async fn version_list_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid)): Path<(String, String)>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Viewer,
        "version.list",
        "/documents/:id/proposals/:pid/versions",
        Method::GET.as_str(),
    )?;
    scoped(&ctx, &id, &pid)?;

    Ok::<_, Error>(Json(json!(ctx.proposals().versions(&pid)?)))
}

/// Compute the proposal's changes joined with review state. Threads whose
/// anchors disappeared are orphaned as part of this pass.
/// `GET /documents/:id/proposals/:pid/changes`
async fn changes_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid)): Path<(String, String)>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Viewer,
        "change.list",
        "/documents/:id/proposals/:pid/changes",
        Method::GET.as_str(),
    )?;
    scoped(&ctx, &id, &pid)?;

    Ok::<_, Error>(Json(json!(ctx.proposals().changes(ctx.repos(), &pid)?)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangeReviewRequest {
    from_ref: String,
    to_ref: String,
    state: ReviewState,
    rationale: Option<String>,
}

/// Record the review state of a single change.
/// `POST /documents/:id/proposals/:pid/changes/:cid/review`
async fn change_review_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid, cid)): Path<(String, String, String)>,
    Json(request): Json<ChangeReviewRequest>,
) -> impl IntoResponse {
    if request.state == ReviewState::Rejected && request.rationale.is_none() {
        return Err(Error::Validation(
            "rejecting a change requires a rationale".to_owned(),
        ));
    }
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Editor,
        "change.review",
        "/documents/:id/proposals/:pid/changes/:cid/review",
        Method::POST.as_str(),
    )?;
    scoped(&ctx, &id, &pid)?;

    let review = ctx.proposals().review_change(
        &pid,
        &cid,
        &request.from_ref,
        &request.to_ref,
        request.state,
        request.rationale.as_deref(),
        &principal.user.display_name,
    )?;

    Ok::<_, Error>(Json(json!(review)))
}
