pub mod auth;

use std::sync::Arc;
use std::time::Duration;

use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderValue, Method};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tower_http::cors::{self, CorsLayer};

use chronicle::access::{Denial, Permissions, Resource, Role};
use chronicle::audit::AuditLog;
use chronicle::common;
use chronicle::db::Database;
use chronicle::decision::DecisionLog;
use chronicle::git;
use chronicle::identity::{TokenSigner, User, Users};
use chronicle::proposal::Proposals;
use chronicle::registry::Registry;
use chronicle::sync::Sessions;
use chronicle::thread::Threads;

mod documents;
mod error;
mod proposals;
mod sessions;
mod spaces;
mod sync;
#[cfg(test)]
mod test;
mod threads;

use crate::Options;
use error::Error;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Baseline role given to users who join after the first one.
const DEFAULT_MEMBER_ROLE: &str = "editor";

#[derive(Clone)]
pub struct Context {
    db: Database,
    repos: Arc<git::Repos>,
    signer: TokenSigner,
    sync_token: Option<String>,
}

impl Context {
    pub fn new(db: Database, repos: git::Repos, options: &Options) -> Self {
        // Without a configured secret, access tokens do not survive a
        // restart.
        let secret = options
            .session_secret
            .clone()
            .unwrap_or_else(common::token);

        Self {
            db,
            repos: Arc::new(repos),
            signer: TokenSigner::new(secret.as_bytes()),
            sync_token: options.sync_token.clone(),
        }
    }

    pub fn users(&self) -> Users {
        Users::open(self.db.clone())
    }

    pub fn registry(&self) -> Registry {
        Registry::open(self.db.clone())
    }

    pub fn permissions(&self) -> Permissions {
        Permissions::open(self.db.clone())
    }

    pub fn proposals(&self) -> Proposals {
        Proposals::open(self.db.clone())
    }

    pub fn threads(&self) -> Threads {
        Threads::open(self.db.clone())
    }

    pub fn decisions(&self) -> DecisionLog {
        DecisionLog::open(self.db.clone())
    }

    pub fn audit(&self) -> AuditLog {
        AuditLog::open(self.db.clone())
    }

    pub fn sync_sessions(&self) -> Sessions {
        Sessions::open(self.db.clone())
    }

    pub fn repos(&self) -> &git::Repos {
        &self.repos
    }

    pub fn signer(&self) -> &TokenSigner {
        &self.signer
    }

    pub(crate) fn sync_token(&self) -> Option<&str> {
        self.sync_token.as_deref()
    }

    /// Permission preflight: the user needs at least `min` on `resource`.
    /// Denials are recorded for audit before the request is refused.
    pub fn require(
        &self,
        user: &User,
        resource: &Resource,
        min: Role,
        action: &str,
        path: &str,
        method: &str,
    ) -> Result<Role, Error> {
        let effective = self.permissions().effective(user, resource)?;
        match effective {
            Some(role) if role >= min => Ok(role),
            role => {
                if let Err(e) = self.permissions().record_denial(&Denial {
                    actor: &user.id,
                    action,
                    resource,
                    role,
                    path,
                    method,
                }) {
                    tracing::warn!("Failed to record permission denial: {e}");
                }
                Err(Error::Forbidden)
            }
        }
    }

    /// Put a fresh signup into the default workspace. The first user
    /// bootstraps the workspace and becomes its admin.
    pub fn bootstrap_membership(&self, user: &User) -> Result<(), Error> {
        let registry = self.registry();
        match registry.default_workspace()? {
            Some(workspace) => registry.add_member(&workspace.id, &user.id, DEFAULT_MEMBER_ROLE)?,
            None => {
                let workspace = registry.create_workspace("Workspace")?;
                registry.add_member(&workspace.id, &user.id, "admin")?;
            }
        }
        Ok(())
    }

    /// The workspace a resource belongs to, for grant bookkeeping.
    pub fn workspace_of(&self, resource: &Resource) -> Result<String, Error> {
        let registry = self.registry();
        match resource {
            Resource::Workspace(id) => Ok(id.clone()),
            Resource::Space(id) => Ok(registry.space(id)?.workspace_id),
            Resource::Document(id) => {
                let document = registry.document(id)?;
                Ok(registry.space(&document.space_id)?.workspace_id)
            }
        }
    }
}

pub fn router(ctx: Context, cors_origin: Option<&str>) -> Router {
    let cors = CorsLayer::new()
        .max_age(Duration::from_secs(86400))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::PUT,
            Method::DELETE,
        ])
        .allow_headers([CONTENT_TYPE, AUTHORIZATION]);
    let cors = match cors_origin.and_then(|o| o.parse::<HeaderValue>().ok()) {
        Some(origin) => cors.allow_origin(origin),
        None => cors.allow_origin(cors::Any),
    };

    Router::new()
        .route("/", get(root_handler))
        .merge(sessions::router(ctx.clone()))
        .merge(spaces::router(ctx.clone()))
        .merge(documents::router(ctx.clone()))
        .merge(proposals::router(ctx.clone()))
        .merge(threads::router(ctx.clone()))
        .merge(sync::router(ctx))
        .layer(cors)
}

async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": "chronicle",
        "version": VERSION,
    }))
}
