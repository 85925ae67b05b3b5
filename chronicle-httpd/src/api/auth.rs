//! Request authentication.
use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::Extension;
use axum_auth::AuthBearer;

use chronicle::identity::{Claims, User};

use crate::api::error::Error;
use crate::api::Context;

/// An authenticated principal, extracted from the bearer token.
///
/// Verifies the token signature and expiry, rejects revoked token ids, and
/// refuses deactivated accounts.
#[derive(Clone, Debug)]
pub struct AuthenticatedUser {
    pub user: User,
    pub claims: Claims,
}

impl AuthenticatedUser {
    /// Whether this principal may see internal-only deliberation.
    pub fn is_internal(&self) -> bool {
        self.user.is_internal()
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Extension(ctx) = Extension::<Context>::from_request_parts(parts, state)
            .await
            .map_err(|_| Error::Auth("context missing"))?;
        let AuthBearer(token) = AuthBearer::from_request_parts(parts, state)
            .await
            .map_err(|_| Error::Auth("bearer token required"))?;

        let claims = ctx.signer().verify(&token)?;
        let users = ctx.users();
        if users.is_revoked(&claims.jti)? {
            return Err(Error::Auth("token revoked"));
        }
        let user = users.get(&claims.sub).map_err(|e| match e {
            chronicle::identity::Error::NotFound(_) => Error::Auth("unknown user"),
            e => Error::Identity(e),
        })?;
        if user.deactivated_at.is_some() {
            return Err(Error::Auth("account deactivated"));
        }

        Ok(Self { user, claims })
    }
}
