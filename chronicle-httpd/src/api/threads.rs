//! Deliberation endpoints.
use std::str::FromStr as _;

use axum::extract::Path;
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;

use chronicle::access::{Resource, Role};
use chronicle::common::Reaction;
use chronicle::decision::Outcome;
use chronicle::thread::{Anchor, Direction, Kind, NewThread, Thread, Visibility};

use crate::api::auth::AuthenticatedUser;
use crate::api::error::Error;
use crate::api::Context;

pub fn router(ctx: Context) -> Router {
    Router::new()
        .route(
            "/documents/:id/proposals/:pid/threads",
            get(thread_list_handler).post(thread_create_handler),
        )
        .route(
            "/documents/:id/proposals/:pid/threads/:tid",
            get(thread_get_handler),
        )
        .route(
            "/documents/:id/proposals/:pid/threads/:tid/replies",
            post(reply_handler),
        )
        .route(
            "/documents/:id/proposals/:pid/threads/:tid/resolve",
            post(resolve_handler),
        )
        .route(
            "/documents/:id/proposals/:pid/threads/:tid/reopen",
            post(reopen_handler),
        )
        .route(
            "/documents/:id/proposals/:pid/threads/:tid/vote",
            post(vote_handler),
        )
        .route(
            "/documents/:id/proposals/:pid/threads/:tid/reactions",
            post(reaction_handler),
        )
        .route(
            "/documents/:id/proposals/:pid/threads/:tid/visibility",
            put(visibility_handler),
        )
        .layer(Extension(ctx))
}

/// Load a thread, checking both that it belongs to the routed proposal and
/// that the principal is allowed to see it. Internal threads read as
/// missing to external principals.
fn scoped(
    ctx: &Context,
    principal: &AuthenticatedUser,
    pid: &str,
    tid: &str,
) -> Result<Thread, Error> {
    let thread = ctx.threads().get(tid)?;
    if thread.proposal_id != pid {
        return Err(Error::NotFound);
    }
    if thread.visibility == Visibility::Internal && !principal.is_internal() {
        return Err(Error::NotFound);
    }
    Ok(thread)
}

/// List a proposal's threads, with vote tallies.
/// `GET /documents/:id/proposals/:pid/threads`
async fn thread_list_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid)): Path<(String, String)>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Viewer,
        "thread.list",
        "/documents/:id/proposals/:pid/threads",
        Method::GET.as_str(),
    )?;

    let threads = ctx.threads();
    let listed = threads.list(&pid, principal.is_internal())?;
    let mut out = Vec::with_capacity(listed.len());
    for thread in listed {
        let tally = threads.tally(&thread.id)?;
        out.push(json!({ "thread": thread, "votes": tally }));
    }

    Ok::<_, Error>(Json(json!(out)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateThreadRequest {
    anchor: Anchor,
    body: String,
    visibility: Option<Visibility>,
    #[serde(rename = "type")]
    kind: Option<Kind>,
}

/// Open a thread on a proposal.
/// `POST /documents/:id/proposals/:pid/threads`
async fn thread_create_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid)): Path<(String, String)>,
    Json(request): Json<CreateThreadRequest>,
) -> impl IntoResponse {
    if request.anchor.node_id.is_empty() {
        return Err(Error::Validation("an anchor node id is required".to_owned()));
    }
    if request.body.is_empty() {
        return Err(Error::Validation("a thread body is required".to_owned()));
    }
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Commenter,
        "thread.create",
        "/documents/:id/proposals/:pid/threads",
        Method::POST.as_str(),
    )?;

    // External guests cannot author internal threads.
    let visibility = if principal.is_internal() {
        request.visibility.unwrap_or(Visibility::Internal)
    } else {
        Visibility::External
    };

    let thread = ctx.threads().create(&NewThread {
        proposal_id: &pid,
        anchor: request.anchor,
        body: &request.body,
        visibility,
        kind: request.kind.unwrap_or(Kind::General),
        author: &principal.user.display_name,
    })?;

    Ok::<_, Error>(Json(json!(thread)))
}

/// Get a thread with its annotations, votes and reactions.
/// `GET /documents/:id/proposals/:pid/threads/:tid`
async fn thread_get_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid, tid)): Path<(String, String, String)>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Viewer,
        "thread.read",
        "/documents/:id/proposals/:pid/threads/:tid",
        Method::GET.as_str(),
    )?;
    let thread = scoped(&ctx, &principal, &pid, &tid)?;

    let threads = ctx.threads();
    let annotations = threads.annotations(&tid)?;
    let tally = threads.tally(&tid)?;
    let reactions: Vec<_> = threads
        .reactions(&tid)?
        .into_iter()
        .map(|(emoji, users)| json!({ "emoji": emoji, "users": users }))
        .collect();

    Ok::<_, Error>(Json(json!({
        "thread": thread,
        "annotations": annotations,
        "votes": tally,
        "reactions": reactions,
    })))
}

#[derive(Deserialize)]
struct ReplyRequest {
    body: String,
}

/// Reply to a thread. Replies are immutable once written.
/// `POST /documents/:id/proposals/:pid/threads/:tid/replies`
async fn reply_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid, tid)): Path<(String, String, String)>,
    Json(request): Json<ReplyRequest>,
) -> impl IntoResponse {
    if request.body.is_empty() {
        return Err(Error::Validation("a reply body is required".to_owned()));
    }
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Commenter,
        "thread.reply",
        "/documents/:id/proposals/:pid/threads/:tid/replies",
        Method::POST.as_str(),
    )?;
    scoped(&ctx, &principal, &pid, &tid)?;

    let annotation = ctx
        .threads()
        .reply(&tid, &principal.user.display_name, &request.body)?;

    Ok::<_, Error>(Json(json!(annotation)))
}

#[derive(Deserialize)]
struct ResolveRequest {
    outcome: Outcome,
    rationale: String,
}

/// Resolve a thread; the decision-log entry is written in the same
/// transaction, anchored to the proposal branch head.
/// `POST /documents/:id/proposals/:pid/threads/:tid/resolve`
async fn resolve_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid, tid)): Path<(String, String, String)>,
    Json(request): Json<ResolveRequest>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Commenter,
        "thread.resolve",
        "/documents/:id/proposals/:pid/threads/:tid/resolve",
        Method::POST.as_str(),
    )?;
    scoped(&ctx, &principal, &pid, &tid)?;

    let (thread, _) = ctx.threads().resolve(
        ctx.repos(),
        &tid,
        request.outcome,
        &request.rationale,
        &principal.user.display_name,
    )?;

    Ok::<_, Error>(Json(json!(thread)))
}

/// Reopen a resolved or orphaned thread.
/// `POST /documents/:id/proposals/:pid/threads/:tid/reopen`
async fn reopen_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid, tid)): Path<(String, String, String)>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Commenter,
        "thread.reopen",
        "/documents/:id/proposals/:pid/threads/:tid/reopen",
        Method::POST.as_str(),
    )?;
    scoped(&ctx, &principal, &pid, &tid)?;

    Ok::<_, Error>(Json(json!(ctx.threads().reopen(&tid)?)))
}

#[derive(Deserialize)]
struct VoteRequest {
    direction: Direction,
}

/// Toggle a vote.
/// `POST /documents/:id/proposals/:pid/threads/:tid/vote`
async fn vote_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid, tid)): Path<(String, String, String)>,
    Json(request): Json<VoteRequest>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Commenter,
        "thread.vote",
        "/documents/:id/proposals/:pid/threads/:tid/vote",
        Method::POST.as_str(),
    )?;
    scoped(&ctx, &principal, &pid, &tid)?;

    let threads = ctx.threads();
    let direction =
        threads.toggle_vote(&tid, &principal.user.display_name, request.direction)?;
    let tally = threads.tally(&tid)?;

    Ok::<_, Error>(Json(json!({ "direction": direction, "votes": tally })))
}

#[derive(Deserialize)]
struct ReactionRequest {
    emoji: String,
}

/// Toggle an emoji reaction.
/// `POST /documents/:id/proposals/:pid/threads/:tid/reactions`
async fn reaction_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid, tid)): Path<(String, String, String)>,
    Json(request): Json<ReactionRequest>,
) -> impl IntoResponse {
    let reaction = Reaction::from_str(&request.emoji)
        .map_err(|_| Error::Validation("not a valid reaction emoji".to_owned()))?;
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Commenter,
        "thread.react",
        "/documents/:id/proposals/:pid/threads/:tid/reactions",
        Method::POST.as_str(),
    )?;
    scoped(&ctx, &principal, &pid, &tid)?;

    let active = ctx
        .threads()
        .toggle_reaction(&tid, &principal.user.display_name, reaction)?;

    Ok::<_, Error>(Json(json!({ "emoji": request.emoji, "active": active })))
}

#[derive(Deserialize)]
struct VisibilityRequest {
    visibility: Visibility,
}

/// Change a thread's visibility. External principals cannot do this, at
/// either layer.
/// `PUT /documents/:id/proposals/:pid/threads/:tid/visibility`
async fn visibility_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path((id, pid, tid)): Path<(String, String, String)>,
    Json(request): Json<VisibilityRequest>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Document(id.clone()),
        Role::Commenter,
        "thread.visibility",
        "/documents/:id/proposals/:pid/threads/:tid/visibility",
        Method::PUT.as_str(),
    )?;
    scoped(&ctx, &principal, &pid, &tid)?;

    let thread =
        ctx.threads()
            .set_visibility(&tid, request.visibility, principal.is_internal())?;

    Ok::<_, Error>(Json(json!(thread)))
}
