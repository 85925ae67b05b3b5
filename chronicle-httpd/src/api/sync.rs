//! Inbound endpoint for the realtime sync collaborator.
//!
//! Authenticated by a shared token header, not by a bearer token.
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde_json::json;

use chronicle::sync::SessionEnded;

use crate::api::error::Error;
use crate::api::Context;

/// Header carrying the shared sync token.
const SYNC_TOKEN_HEADER: &str = "x-chronicle-sync-token";

pub fn router(ctx: Context) -> Router {
    Router::new()
        .route("/internal/sync/session-ended", post(session_ended_handler))
        .layer(Extension(ctx))
}

/// Flush an ended editing session onto the proposal branch.
/// `POST /internal/sync/session-ended`
async fn session_ended_handler(
    Extension(ctx): Extension<Context>,
    headers: HeaderMap,
    Json(event): Json<SessionEnded>,
) -> impl IntoResponse {
    // Fail closed when no token is configured.
    let expected = ctx.sync_token().ok_or(Error::Auth("sync disabled"))?;
    let presented = headers
        .get(SYNC_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or(Error::Auth("sync token required"))?;
    if presented != expected {
        return Err(Error::Auth("invalid sync token"));
    }
    if event.session_id.is_empty() {
        return Err(Error::Validation("a session id is required".to_owned()));
    }

    let outcome = ctx.sync_sessions().session_ended(ctx.repos(), &event)?;

    Ok::<_, Error>(Json(json!(outcome)))
}
