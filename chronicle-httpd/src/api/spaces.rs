//! Space endpoints.
use axum::extract::Path;
use axum::http::Method;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;

use chronicle::access::{Resource, Role};
use chronicle::registry::SpaceVisibility;

use crate::api::auth::AuthenticatedUser;
use crate::api::error::Error;
use crate::api::Context;

pub fn router(ctx: Context) -> Router {
    Router::new()
        .route("/spaces", get(space_list_handler).post(space_create_handler))
        .route(
            "/spaces/:space",
            get(space_get_handler)
                .put(space_update_handler)
                .delete(space_delete_handler),
        )
        .layer(Extension(ctx))
}

/// List spaces.
/// `GET /spaces`
async fn space_list_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
) -> impl IntoResponse {
    let registry = ctx.registry();

    // External guests only ever see their scoped space.
    if let Some(scope) = principal.user.external_space_id.as_deref() {
        let space = registry.space(scope)?;
        return Ok::<_, Error>(Json(json!([space])));
    }

    let Some(workspace) = registry.default_workspace()? else {
        return Ok(Json(json!([])));
    };
    ctx.require(
        &principal.user,
        &Resource::Workspace(workspace.id.clone()),
        Role::Viewer,
        "space.list",
        "/spaces",
        Method::GET.as_str(),
    )?;

    Ok(Json(json!(registry.spaces(&workspace.id)?)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSpaceRequest {
    name: String,
    #[serde(default)]
    description: String,
    visibility: Option<SpaceVisibility>,
}

/// Create a space.
/// `POST /spaces`
async fn space_create_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Json(request): Json<CreateSpaceRequest>,
) -> impl IntoResponse {
    if request.name.is_empty() {
        return Err(Error::Validation("a space name is required".to_owned()));
    }
    let registry = ctx.registry();
    let workspace = registry.default_workspace()?.ok_or(Error::NotFound)?;
    ctx.require(
        &principal.user,
        &Resource::Workspace(workspace.id.clone()),
        Role::Editor,
        "space.create",
        "/spaces",
        Method::POST.as_str(),
    )?;

    let space = registry.create_space(
        &workspace.id,
        &request.name,
        &request.description,
        request.visibility.unwrap_or(SpaceVisibility::Organization),
    )?;

    Ok::<_, Error>(Json(json!(space)))
}

/// Get a space.
/// `GET /spaces/:space`
async fn space_get_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path(space): Path<String>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Space(space.clone()),
        Role::Viewer,
        "space.read",
        "/spaces/:space",
        Method::GET.as_str(),
    )?;

    Ok::<_, Error>(Json(json!(ctx.registry().space(&space)?)))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSpaceRequest {
    name: String,
    #[serde(default)]
    description: String,
    visibility: SpaceVisibility,
    #[serde(default)]
    sort_order: i64,
}

/// Update a space.
/// `PUT /spaces/:space`
async fn space_update_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path(space): Path<String>,
    Json(request): Json<UpdateSpaceRequest>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Space(space.clone()),
        Role::Admin,
        "space.update",
        "/spaces/:space",
        Method::PUT.as_str(),
    )?;

    let space = ctx.registry().update_space(
        &space,
        &request.name,
        &request.description,
        request.visibility,
        request.sort_order,
    )?;

    Ok::<_, Error>(Json(json!(space)))
}

/// Delete a space. Refused while documents still live in it.
/// `DELETE /spaces/:space`
async fn space_delete_handler(
    Extension(ctx): Extension<Context>,
    principal: AuthenticatedUser,
    Path(space): Path<String>,
) -> impl IntoResponse {
    ctx.require(
        &principal.user,
        &Resource::Space(space.clone()),
        Role::Admin,
        "space.delete",
        "/spaces/:space",
        Method::DELETE.as_str(),
    )?;
    ctx.registry().delete_space(&space)?;

    Ok::<_, Error>(Json(json!({})))
}
