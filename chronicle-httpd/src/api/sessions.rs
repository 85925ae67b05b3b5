//! Authentication endpoints.
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Extension, Json, Router};
use serde::Deserialize;
use serde_json::json;

use chronicle::common::Timestamp;
use chronicle::identity;

use crate::api::auth::AuthenticatedUser;
use crate::api::error::Error;
use crate::api::Context;

pub fn router(ctx: Context) -> Router {
    Router::new()
        .route("/auth/signup", post(signup_handler))
        .route("/auth/verify", post(verify_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/refresh", post(refresh_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/auth/forgot-password", post(forgot_password_handler))
        .route("/auth/reset-password", post(reset_password_handler))
        .layer(Extension(ctx))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignupRequest {
    email: String,
    password: String,
    display_name: String,
}

/// Register a user.
/// `POST /auth/signup`
///
/// E-mail delivery is out of scope: the verification token is returned to
/// the operator-facing caller for delivery out of band.
async fn signup_handler(
    Extension(ctx): Extension<Context>,
    Json(request): Json<SignupRequest>,
) -> impl IntoResponse {
    if request.email.is_empty() || !request.email.contains('@') {
        return Err(Error::Validation("a valid e-mail address is required".to_owned()));
    }
    if request.password.len() < 8 {
        return Err(Error::Validation(
            "password must be at least 8 characters".to_owned(),
        ));
    }
    if request.display_name.is_empty() {
        return Err(Error::Validation("a display name is required".to_owned()));
    }

    let (user, verification_token) =
        ctx.users()
            .signup(&request.email, &request.password, &request.display_name)?;
    ctx.bootstrap_membership(&user)?;

    Ok::<_, Error>(Json(json!({
        "user": user,
        "verificationToken": verification_token,
    })))
}

#[derive(Deserialize)]
struct VerifyRequest {
    token: String,
}

/// Verify an e-mail address.
/// `POST /auth/verify`
async fn verify_handler(
    Extension(ctx): Extension<Context>,
    Json(request): Json<VerifyRequest>,
) -> impl IntoResponse {
    let user = ctx.users().verify_email(&request.token)?;

    Ok::<_, Error>(Json(json!({ "user": user })))
}

#[derive(Deserialize)]
struct LoginRequest {
    email: String,
    password: String,
}

/// Log in with e-mail and password.
/// `POST /auth/login`
async fn login_handler(
    Extension(ctx): Extension<Context>,
    Json(request): Json<LoginRequest>,
) -> impl IntoResponse {
    let (user, tokens) = ctx
        .users()
        .login(&request.email, &request.password, ctx.signer())?;

    Ok::<_, Error>(Json(json!({ "user": user, "tokens": tokens })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest {
    refresh_token: String,
}

/// Rotate a refresh token.
/// `POST /auth/refresh`
async fn refresh_handler(
    Extension(ctx): Extension<Context>,
    Json(request): Json<RefreshRequest>,
) -> impl IntoResponse {
    let tokens = ctx.users().refresh(&request.refresh_token, ctx.signer())?;

    Ok::<_, Error>(Json(json!({ "tokens": tokens })))
}

/// Log out: revoke the refresh session and, when a bearer token was
/// presented, its access-token id as well.
/// `POST /auth/logout`
async fn logout_handler(
    Extension(ctx): Extension<Context>,
    principal: Option<AuthenticatedUser>,
    Json(request): Json<RefreshRequest>,
) -> impl IntoResponse {
    let users = ctx.users();
    users.logout(&request.refresh_token)?;
    if let Some(principal) = principal {
        users.revoke_access(
            &principal.claims.jti,
            Timestamp::from_millis((principal.claims.exp as u128) * 1000),
        )?;
    }

    Ok::<_, Error>(Json(json!({})))
}

#[derive(Deserialize)]
struct ForgotPasswordRequest {
    email: String,
}

/// Begin a password reset.
/// `POST /auth/forgot-password`
///
/// Responds identically whether or not the address is registered; the
/// reset token is returned for out-of-band delivery when it exists.
async fn forgot_password_handler(
    Extension(ctx): Extension<Context>,
    Json(request): Json<ForgotPasswordRequest>,
) -> impl IntoResponse {
    match ctx.users().request_password_reset(&request.email) {
        Ok(token) => Ok::<_, Error>(Json(json!({ "resetToken": token }))),
        Err(identity::Error::InvalidCredentials) => Ok(Json(json!({}))),
        Err(e) => Err(e.into()),
    }
}

#[derive(Deserialize)]
struct ResetPasswordRequest {
    token: String,
    password: String,
}

/// Complete a password reset.
/// `POST /auth/reset-password`
async fn reset_password_handler(
    Extension(ctx): Extension<Context>,
    Json(request): Json<ResetPasswordRequest>,
) -> impl IntoResponse {
    if request.password.len() < 8 {
        return Err(Error::Validation(
            "password must be at least 8 characters".to_owned(),
        ));
    }
    ctx.users().reset_password(&request.token, &request.password)?;

    Ok::<_, Error>(Json(json!({})))
}
