//! Role-based access control.
//!
//! Permissions are polymorphic grants `(subject, resource, role)` where the
//! subject is a user or a group and the resource is a workspace, space or
//! document. The model is additive: a principal's effective role on a
//! resource is the *maximum* over every applicable grant path.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlite as sql;
use thiserror::Error;

use crate::audit;
use crate::common::{self, Timestamp};
use crate::db::{opt_int, opt_text, transaction, Database};
use crate::identity::{self, User};

#[derive(Error, Debug)]
pub enum Error {
    /// An internal error.
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
    /// A referenced entity is missing.
    #[error("{0} not found")]
    NotFound(&'static str),
    /// The public link requires a password.
    #[error("link password required")]
    PasswordRequired,
    /// Could not parse a stored role.
    #[error("invalid role `{0}`")]
    InvalidRole(String),
    /// Audit log error.
    #[error(transparent)]
    Audit(#[from] audit::Error),
}

/// Roles are totally ordered; the capability matrix derives from the order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Viewer,
    Commenter,
    Suggester,
    Editor,
    Admin,
}

impl Role {
    pub fn can_read(&self) -> bool {
        *self >= Role::Viewer
    }

    pub fn can_comment(&self) -> bool {
        *self >= Role::Commenter
    }

    pub fn can_suggest(&self) -> bool {
        *self >= Role::Suggester
    }

    pub fn can_edit(&self) -> bool {
        *self >= Role::Editor
    }

    pub fn can_manage(&self) -> bool {
        *self >= Role::Admin
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Viewer => write!(f, "viewer"),
            Self::Commenter => write!(f, "commenter"),
            Self::Suggester => write!(f, "suggester"),
            Self::Editor => write!(f, "editor"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "viewer" => Ok(Self::Viewer),
            "commenter" => Ok(Self::Commenter),
            "suggester" => Ok(Self::Suggester),
            "editor" => Ok(Self::Editor),
            "admin" => Ok(Self::Admin),
            other => Err(Error::InvalidRole(other.to_owned())),
        }
    }
}

/// The subject of a grant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "subjectType", content = "subjectId", rename_all = "lowercase")]
pub enum Subject {
    User(String),
    Group(String),
}

impl Subject {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::User(_) => "user",
            Self::Group(_) => "group",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::User(id) | Self::Group(id) => id,
        }
    }
}

/// The resource a grant applies to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resourceType", content = "resourceId", rename_all = "lowercase")]
pub enum Resource {
    Workspace(String),
    Space(String),
    Document(String),
}

impl Resource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Workspace(_) => "workspace",
            Self::Space(_) => "space",
            Self::Document(_) => "document",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Workspace(id) | Self::Space(id) | Self::Document(id) => id,
        }
    }
}

/// A stored permission grant.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Grant {
    pub id: String,
    pub workspace_id: String,
    #[serde(flatten)]
    pub subject: Subject,
    #[serde(flatten)]
    pub resource: Resource,
    pub role: Role,
    pub granted_by: String,
    pub granted_at: Timestamp,
    pub expires_at: Option<Timestamp>,
}

/// A public sharing link for a document.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicLink {
    pub id: String,
    pub token: String,
    pub document_id: String,
    pub role: Role,
    pub has_password: bool,
    pub expires_at: Option<Timestamp>,
    pub access_count: i64,
    pub last_accessed_at: Option<Timestamp>,
    pub revoked_at: Option<Timestamp>,
    pub created_by: String,
    pub created_at: Timestamp,
}

/// Synthetic principal produced by verifying a public link.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkPrincipal {
    pub link_id: String,
    pub document_id: String,
    pub role: Role,
}

/// A recorded permission denial, kept for audit.
#[derive(Debug, Clone)]
pub struct Denial<'a> {
    pub actor: &'a str,
    pub action: &'a str,
    pub resource: &'a Resource,
    pub role: Option<Role>,
    pub path: &'a str,
    pub method: &'a str,
}

/// Permission store and resolver.
#[derive(Clone)]
pub struct Permissions {
    db: Database,
}

impl Permissions {
    pub fn open(db: Database) -> Self {
        Self { db }
    }

    /// Compute the effective role of a user on a resource.
    ///
    /// This always recomputes from the raw grant tables; the materialized
    /// view is never consulted for enforcement.
    pub fn effective(&self, user: &User, resource: &Resource) -> Result<Option<Role>, Error> {
        effective_role(&self.db, user, resource, Timestamp::now())
    }

    /// Upsert a grant and refresh the materialized view for affected users.
    pub fn grant(
        &self,
        workspace_id: &str,
        subject: &Subject,
        resource: &Resource,
        role: Role,
        granted_by: &str,
        expires_at: Option<Timestamp>,
    ) -> Result<Grant, Error> {
        let now = Timestamp::now();
        let id = common::id();

        transaction(&self.db, |conn| {
            let mut stmt = conn.prepare(
                "INSERT INTO permissions (id, workspace_id, subject_type, subject_id,
                                          resource_type, resource_id, role, granted_by, granted_at, expires_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT (workspace_id, subject_type, subject_id, resource_type, resource_id)
                 DO UPDATE SET role = ?7, granted_by = ?8, granted_at = ?9, expires_at = ?10,
                               deleted_at = NULL",
            )?;
            stmt.bind((1, id.as_str()))?;
            stmt.bind((2, workspace_id))?;
            stmt.bind((3, subject.kind()))?;
            stmt.bind((4, subject.id()))?;
            stmt.bind((5, resource.kind()))?;
            stmt.bind((6, resource.id()))?;
            stmt.bind((7, role.to_string().as_str()))?;
            stmt.bind((8, granted_by))?;
            stmt.bind((9, now.as_millis() as i64))?;
            stmt.bind((10, opt_int(expires_at.map(|t| t.as_millis() as i64))))?;
            stmt.next()?;

            query::materialize(conn, subject, resource, now)?;

            if let Resource::Document(document_id) = resource {
                audit::query::record(
                    conn,
                    &audit::NewEvent::new("permission.granted", granted_by, document_id).payload(
                        serde_json::json!({
                            "subjectType": subject.kind(),
                            "subjectId": subject.id(),
                            "role": role.to_string(),
                        }),
                    ),
                    now,
                )?;
            }

            Ok::<(), Error>(())
        })?;

        let grants = self.list(resource)?;
        grants
            .into_iter()
            .find(|g| g.subject == *subject)
            .ok_or(Error::NotFound("permission"))
    }

    /// Soft-delete a grant and refresh the materialized view.
    pub fn revoke(&self, permission_id: &str, revoked_by: &str) -> Result<(), Error> {
        let now = Timestamp::now();

        transaction(&self.db, |conn| {
            let mut stmt = conn.prepare(
                "SELECT subject_type, subject_id, resource_type, resource_id
                 FROM permissions WHERE id = ?1 AND deleted_at IS NULL",
            )?;
            stmt.bind((1, permission_id))?;
            let row = stmt
                .into_iter()
                .next()
                .transpose()?
                .ok_or(Error::NotFound("permission"))?;
            let subject = query::parse_subject(&row)?;
            let resource = query::parse_resource(&row)?;

            let mut stmt = conn.prepare("UPDATE permissions SET deleted_at = ?2 WHERE id = ?1")?;
            stmt.bind((1, permission_id))?;
            stmt.bind((2, now.as_millis() as i64))?;
            stmt.next()?;

            query::materialize(conn, &subject, &resource, now)?;

            if let Resource::Document(document_id) = &resource {
                audit::query::record(
                    conn,
                    &audit::NewEvent::new("permission.revoked", revoked_by, document_id).payload(
                        serde_json::json!({
                            "subjectType": subject.kind(),
                            "subjectId": subject.id(),
                        }),
                    ),
                    now,
                )?;
            }

            Ok(())
        })
    }

    /// List active grants on a resource.
    pub fn list(&self, resource: &Resource) -> Result<Vec<Grant>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT id, workspace_id, subject_type, subject_id, resource_type, resource_id,
                    role, granted_by, granted_at, expires_at
             FROM permissions
             WHERE resource_type = ?1 AND resource_id = ?2 AND deleted_at IS NULL
             ORDER BY granted_at",
        )?;
        stmt.bind((1, resource.kind()))?;
        stmt.bind((2, resource.id()))?;

        let mut grants = Vec::new();
        for row in stmt.into_iter() {
            let row = row?;
            grants.push(Grant {
                id: row.read::<&str, _>("id").to_owned(),
                workspace_id: row.read::<&str, _>("workspace_id").to_owned(),
                subject: query::parse_subject(&row)?,
                resource: query::parse_resource(&row)?,
                role: row.read::<&str, _>("role").parse()?,
                granted_by: row.read::<&str, _>("granted_by").to_owned(),
                granted_at: Timestamp::from_millis(row.read::<i64, _>("granted_at") as u128),
                expires_at: row
                    .read::<Option<i64>, _>("expires_at")
                    .map(|t| Timestamp::from_millis(t as u128)),
            });
        }
        Ok(grants)
    }

    /// Read the materialized role of a user on a resource, if any.
    ///
    /// Advisory only; must match [`Permissions::effective`] whenever the
    /// underlying grants haven't changed since the last refresh.
    pub fn cached(&self, user_id: &str, resource: &Resource) -> Result<Option<Role>, Error> {
        let mut stmt = self.db.prepare(
            "SELECT role FROM effective_permissions
             WHERE user_id = ?1 AND resource_type = ?2 AND resource_id = ?3",
        )?;
        stmt.bind((1, user_id))?;
        stmt.bind((2, resource.kind()))?;
        stmt.bind((3, resource.id()))?;

        match stmt.into_iter().next().transpose()? {
            None => Ok(None),
            Some(row) => Ok(Some(row.read::<&str, _>("role").parse()?)),
        }
    }

    /// Create a group within a workspace.
    pub fn create_group(&self, workspace_id: &str, name: &str) -> Result<String, Error> {
        let now = Timestamp::now();
        let id = common::id();
        let mut stmt = self.db.prepare(
            "INSERT INTO groups (id, workspace_id, name, created_at) VALUES (?1, ?2, ?3, ?4)",
        )?;
        stmt.bind((1, id.as_str()))?;
        stmt.bind((2, workspace_id))?;
        stmt.bind((3, name))?;
        stmt.bind((4, now.as_millis() as i64))?;
        stmt.next()?;

        Ok(id)
    }

    /// Add a user to a group.
    pub fn add_group_member(&self, group_id: &str, user_id: &str) -> Result<(), Error> {
        let now = Timestamp::now();
        let mut stmt = self.db.prepare(
            "INSERT INTO group_memberships (group_id, user_id, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT DO NOTHING",
        )?;
        stmt.bind((1, group_id))?;
        stmt.bind((2, user_id))?;
        stmt.bind((3, now.as_millis() as i64))?;
        stmt.next()?;

        Ok(())
    }

    /// Soft-delete a group. Its grants stop applying immediately.
    pub fn delete_group(&self, group_id: &str) -> Result<(), Error> {
        let now = Timestamp::now();
        let mut stmt = self
            .db
            .prepare("UPDATE groups SET deleted_at = ?2 WHERE id = ?1")?;
        stmt.bind((1, group_id))?;
        stmt.bind((2, now.as_millis() as i64))?;
        stmt.next()?;

        Ok(())
    }

    /// Record a permission denial for audit.
    pub fn record_denial(&self, denial: &Denial) -> Result<(), Error> {
        let now = Timestamp::now();
        let mut stmt = self.db.prepare(
            "INSERT INTO permission_denials (actor, action, resource_type, resource_id, role, path, method, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        stmt.bind((1, denial.actor))?;
        stmt.bind((2, denial.action))?;
        stmt.bind((3, denial.resource.kind()))?;
        stmt.bind((4, denial.resource.id()))?;
        stmt.bind((5, opt_text(denial.role.map(|r| r.to_string()).as_deref())))?;
        stmt.bind((6, denial.path))?;
        stmt.bind((7, denial.method))?;
        stmt.bind((8, now.as_millis() as i64))?;
        stmt.next()?;

        Ok(())
    }

    /// Create a public link for a document.
    ///
    /// Only `viewer` and `commenter` roles are meaningful for links; anything
    /// higher is clamped to `commenter`.
    pub fn create_link(
        &self,
        document_id: &str,
        role: Role,
        password: Option<&str>,
        expires_at: Option<Timestamp>,
        created_by: &str,
    ) -> Result<PublicLink, Error> {
        let now = Timestamp::now();
        let id = common::id();
        let token = common::token();
        let role = role.min(Role::Commenter);
        let password_hash = password.map(identity::hash_password);

        transaction(&self.db, |conn| {
            let mut stmt = conn.prepare(
                "INSERT INTO public_links (id, token, document_id, role, password_hash, expires_at, created_by, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            stmt.bind((1, id.as_str()))?;
            stmt.bind((2, token.as_str()))?;
            stmt.bind((3, document_id))?;
            stmt.bind((4, role.to_string().as_str()))?;
            stmt.bind((5, opt_text(password_hash.as_deref())))?;
            stmt.bind((6, opt_int(expires_at.map(|t| t.as_millis() as i64))))?;
            stmt.bind((7, created_by))?;
            stmt.bind((8, now.as_millis() as i64))?;
            stmt.next()?;

            audit::query::record(
                conn,
                &audit::NewEvent::new("link.created", created_by, document_id)
                    .payload(serde_json::json!({ "role": role.to_string() })),
                now,
            )?;

            Ok::<(), Error>(())
        })?;

        self.get_link(&id)
    }

    /// Verify a public-link token, yielding a synthetic principal.
    ///
    /// Expired and revoked links are indistinguishable from missing ones.
    /// The access counter is bumped by the caller via [`Permissions::touch_link`];
    /// that write is best-effort and must not gate access.
    pub fn verify_link(
        &self,
        token: &str,
        password: Option<&str>,
    ) -> Result<LinkPrincipal, Error> {
        let now = Timestamp::now();
        let mut stmt = self.db.prepare(
            "SELECT id, document_id, role, password_hash, expires_at, revoked_at
             FROM public_links WHERE token = ?1",
        )?;
        stmt.bind((1, token))?;

        let row = stmt
            .into_iter()
            .next()
            .transpose()?
            .ok_or(Error::NotFound("link"))?;

        if row.read::<Option<i64>, _>("revoked_at").is_some() {
            return Err(Error::NotFound("link"));
        }
        if row
            .read::<Option<i64>, _>("expires_at")
            .is_some_and(|t| (t as u64) < now.as_millis())
        {
            return Err(Error::NotFound("link"));
        }
        if let Some(hash) = row.read::<Option<&str>, _>("password_hash") {
            let ok = password.is_some_and(|p| identity::verify_password(hash, p));
            if !ok {
                return Err(Error::PasswordRequired);
            }
        }

        Ok(LinkPrincipal {
            link_id: row.read::<&str, _>("id").to_owned(),
            document_id: row.read::<&str, _>("document_id").to_owned(),
            role: row.read::<&str, _>("role").parse()?,
        })
    }

    /// Bump a link's access statistics. Best-effort: errors are for the
    /// caller to log, never to deny access over.
    pub fn touch_link(&self, link_id: &str) -> Result<(), Error> {
        let now = Timestamp::now();
        let mut stmt = self.db.prepare(
            "UPDATE public_links SET access_count = access_count + 1, last_accessed_at = ?2
             WHERE id = ?1",
        )?;
        stmt.bind((1, link_id))?;
        stmt.bind((2, now.as_millis() as i64))?;
        stmt.next()?;

        Ok(())
    }

    /// Revoke a public link.
    pub fn revoke_link(&self, link_id: &str, revoked_by: &str) -> Result<(), Error> {
        let now = Timestamp::now();

        transaction(&self.db, |conn| {
            let mut stmt = conn.prepare(
                "UPDATE public_links SET revoked_at = ?2 WHERE id = ?1 AND revoked_at IS NULL",
            )?;
            stmt.bind((1, link_id))?;
            stmt.bind((2, now.as_millis() as i64))?;
            stmt.next()?;

            if conn.change_count() == 0 {
                return Err(Error::NotFound("link"));
            }
            let link = query::link_document(conn, link_id)?;
            audit::query::record(
                conn,
                &audit::NewEvent::new("link.revoked", revoked_by, &link),
                now,
            )?;

            Ok(())
        })
    }

    /// List a document's public links.
    pub fn list_links(&self, document_id: &str) -> Result<Vec<PublicLink>, Error> {
        let mut stmt = self.db.prepare(&format!(
            "{} WHERE document_id = ?1 ORDER BY created_at",
            query::SELECT_LINK
        ))?;
        stmt.bind((1, document_id))?;

        stmt.into_iter()
            .map(|row| row.map_err(Error::from).and_then(|r| query::parse_link(&r)))
            .collect()
    }

    fn get_link(&self, id: &str) -> Result<PublicLink, Error> {
        let mut stmt = self
            .db
            .prepare(&format!("{} WHERE id = ?1", query::SELECT_LINK))?;
        stmt.bind((1, id))?;

        stmt.into_iter()
            .next()
            .transpose()?
            .ok_or(Error::NotFound("link"))
            .and_then(|r| query::parse_link(&r))
    }
}

/// Compute the effective role of a user on a resource at a point in time.
///
/// Search order, unioned additively: direct grants on the resource, direct
/// grants on its ancestors, the same two steps for each of the user's
/// groups, the workspace membership baseline, and the legacy per-document
/// table. Expired and deleted grants never apply. External principals are
/// clamped to their scoped space.
pub fn effective_role(
    db: &sql::Connection,
    user: &User,
    resource: &Resource,
    now: Timestamp,
) -> Result<Option<Role>, Error> {
    if user.deactivated_at.is_some() {
        return Ok(None);
    }
    if user.is_external && user.external_expires_at.is_some_and(|t| t < now) {
        return Ok(None);
    }

    let Some(chain) = query::ancestry(db, resource)? else {
        return Ok(None);
    };

    // External guests only see their scoped space and its documents;
    // workspace-level grants are invisible to them.
    let chain: Vec<Resource> = if user.is_external {
        let Some(scope) = user.external_space_id.as_deref() else {
            return Ok(None);
        };
        if !chain
            .iter()
            .any(|r| matches!(r, Resource::Space(id) if id == scope))
        {
            return Ok(None);
        }
        chain
            .into_iter()
            .filter(|r| !matches!(r, Resource::Workspace(_)))
            .collect()
    } else {
        chain
    };

    let mut best: Option<Role> = None;

    // Direct grants, resource first, then ancestors.
    for target in &chain {
        best = best.max(query::grant_role(db, "user", &user.id, target, now)?);
    }

    // Group grants, same traversal.
    for group in query::groups_of(db, &user.id)? {
        for target in &chain {
            best = best.max(query::grant_role(db, "group", &group, target, now)?);
        }
    }

    // Workspace membership baseline.
    if !user.is_external {
        if let Some(Resource::Workspace(workspace)) = chain
            .iter()
            .find(|r| matches!(r, Resource::Workspace(_)))
        {
            best = best.max(query::membership_role(db, workspace, &user.id)?);
        }
    }

    // Legacy per-document grants.
    if let Resource::Document(document) = resource {
        best = best.max(query::legacy_role(db, document, &user.id)?);
    }

    Ok(best)
}

/// Soft-delete every grant on a resource and purge its cached roles,
/// within the caller's transaction. Used when the resource itself is
/// deleted, so the grants cannot outlive it.
pub(crate) fn cascade_revoke(
    db: &sql::Connection,
    resource: &Resource,
    now: Timestamp,
) -> Result<(), Error> {
    let mut stmt = db.prepare(
        "UPDATE permissions SET deleted_at = ?3
         WHERE resource_type = ?1 AND resource_id = ?2 AND deleted_at IS NULL",
    )?;
    stmt.bind((1, resource.kind()))?;
    stmt.bind((2, resource.id()))?;
    stmt.bind((3, now.as_millis() as i64))?;
    stmt.next()?;

    let mut stmt = db.prepare(
        "DELETE FROM effective_permissions WHERE resource_type = ?1 AND resource_id = ?2",
    )?;
    stmt.bind((1, resource.kind()))?;
    stmt.bind((2, resource.id()))?;
    stmt.next()?;

    Ok(())
}

/// Helper SQL queries.
mod query {
    use super::*;

    pub(super) const SELECT_LINK: &str =
        "SELECT id, token, document_id, role, password_hash, expires_at, access_count,
                last_accessed_at, revoked_at, created_by, created_at
         FROM public_links";

    pub(super) fn parse_subject(row: &sql::Row) -> Result<Subject, Error> {
        let id = row.read::<&str, _>("subject_id").to_owned();
        match row.read::<&str, _>("subject_type") {
            "group" => Ok(Subject::Group(id)),
            _ => Ok(Subject::User(id)),
        }
    }

    pub(super) fn parse_resource(row: &sql::Row) -> Result<Resource, Error> {
        let id = row.read::<&str, _>("resource_id").to_owned();
        match row.read::<&str, _>("resource_type") {
            "workspace" => Ok(Resource::Workspace(id)),
            "space" => Ok(Resource::Space(id)),
            _ => Ok(Resource::Document(id)),
        }
    }

    pub(super) fn parse_link(row: &sql::Row) -> Result<PublicLink, Error> {
        Ok(PublicLink {
            id: row.read::<&str, _>("id").to_owned(),
            token: row.read::<&str, _>("token").to_owned(),
            document_id: row.read::<&str, _>("document_id").to_owned(),
            role: row.read::<&str, _>("role").parse()?,
            has_password: row.read::<Option<&str>, _>("password_hash").is_some(),
            expires_at: row
                .read::<Option<i64>, _>("expires_at")
                .map(|t| Timestamp::from_millis(t as u128)),
            access_count: row.read::<i64, _>("access_count"),
            last_accessed_at: row
                .read::<Option<i64>, _>("last_accessed_at")
                .map(|t| Timestamp::from_millis(t as u128)),
            revoked_at: row
                .read::<Option<i64>, _>("revoked_at")
                .map(|t| Timestamp::from_millis(t as u128)),
            created_by: row.read::<&str, _>("created_by").to_owned(),
            created_at: Timestamp::from_millis(row.read::<i64, _>("created_at") as u128),
        })
    }

    /// Resolve a resource into `[resource, ..ancestors]`, ending at its
    /// workspace. Returns `None` if the resource doesn't exist.
    pub(super) fn ancestry(
        db: &sql::Connection,
        resource: &Resource,
    ) -> Result<Option<Vec<Resource>>, Error> {
        match resource {
            Resource::Workspace(id) => Ok(Some(vec![Resource::Workspace(id.clone())])),
            Resource::Space(id) => {
                let mut stmt = db.prepare("SELECT workspace_id FROM spaces WHERE id = ?1")?;
                stmt.bind((1, id.as_str()))?;
                match stmt.into_iter().next().transpose()? {
                    None => Ok(None),
                    Some(row) => Ok(Some(vec![
                        Resource::Space(id.clone()),
                        Resource::Workspace(row.read::<&str, _>("workspace_id").to_owned()),
                    ])),
                }
            }
            Resource::Document(id) => {
                let mut stmt = db.prepare(
                    "SELECT documents.space_id AS space_id, spaces.workspace_id AS workspace_id
                     FROM documents JOIN spaces ON spaces.id = documents.space_id
                     WHERE documents.id = ?1",
                )?;
                stmt.bind((1, id.as_str()))?;
                match stmt.into_iter().next().transpose()? {
                    None => Ok(None),
                    Some(row) => Ok(Some(vec![
                        Resource::Document(id.clone()),
                        Resource::Space(row.read::<&str, _>("space_id").to_owned()),
                        Resource::Workspace(row.read::<&str, _>("workspace_id").to_owned()),
                    ])),
                }
            }
        }
    }

    /// Best non-expired, non-deleted grant for a subject on a single target.
    pub(super) fn grant_role(
        db: &sql::Connection,
        subject_type: &str,
        subject_id: &str,
        target: &Resource,
        now: Timestamp,
    ) -> Result<Option<Role>, Error> {
        let mut stmt = db.prepare(
            "SELECT role FROM permissions
             WHERE subject_type = ?1 AND subject_id = ?2
               AND resource_type = ?3 AND resource_id = ?4
               AND deleted_at IS NULL
               AND (expires_at IS NULL OR expires_at >= ?5)",
        )?;
        stmt.bind((1, subject_type))?;
        stmt.bind((2, subject_id))?;
        stmt.bind((3, target.kind()))?;
        stmt.bind((4, target.id()))?;
        stmt.bind((5, now.as_millis() as i64))?;

        let mut best: Option<Role> = None;
        for row in stmt.into_iter() {
            let role = row?.read::<&str, _>("role").parse()?;
            best = best.max(Some(role));
        }
        Ok(best)
    }

    /// Non-deleted groups the user belongs to.
    pub(super) fn groups_of(db: &sql::Connection, user_id: &str) -> Result<Vec<String>, Error> {
        let mut stmt = db.prepare(
            "SELECT groups.id AS id FROM groups
             JOIN group_memberships ON group_memberships.group_id = groups.id
             WHERE group_memberships.user_id = ?1 AND groups.deleted_at IS NULL",
        )?;
        stmt.bind((1, user_id))?;

        let mut groups = Vec::new();
        for row in stmt.into_iter() {
            groups.push(row?.read::<&str, _>("id").to_owned());
        }
        Ok(groups)
    }

    pub(super) fn membership_role(
        db: &sql::Connection,
        workspace_id: &str,
        user_id: &str,
    ) -> Result<Option<Role>, Error> {
        let mut stmt = db.prepare(
            "SELECT role FROM workspace_memberships WHERE workspace_id = ?1 AND user_id = ?2",
        )?;
        stmt.bind((1, workspace_id))?;
        stmt.bind((2, user_id))?;

        match stmt.into_iter().next().transpose()? {
            None => Ok(None),
            Some(row) => Ok(Some(row.read::<&str, _>("role").parse()?)),
        }
    }

    pub(super) fn legacy_role(
        db: &sql::Connection,
        document_id: &str,
        user_id: &str,
    ) -> Result<Option<Role>, Error> {
        let mut stmt = db.prepare(
            "SELECT role FROM document_permissions WHERE document_id = ?1 AND user_id = ?2",
        )?;
        stmt.bind((1, document_id))?;
        stmt.bind((2, user_id))?;

        match stmt.into_iter().next().transpose()? {
            None => Ok(None),
            Some(row) => Ok(Some(row.read::<&str, _>("role").parse()?)),
        }
    }

    pub(super) fn link_document(db: &sql::Connection, link_id: &str) -> Result<String, Error> {
        let mut stmt = db.prepare("SELECT document_id FROM public_links WHERE id = ?1")?;
        stmt.bind((1, link_id))?;

        stmt.into_iter()
            .next()
            .transpose()?
            .map(|row| row.read::<&str, _>("document_id").to_owned())
            .ok_or(Error::NotFound("link"))
    }

    /// Refresh the materialized view for every user affected by a grant
    /// mutation, within the caller's transaction.
    pub(super) fn materialize(
        db: &sql::Connection,
        subject: &Subject,
        resource: &Resource,
        now: Timestamp,
    ) -> Result<(), Error> {
        let users: Vec<String> = match subject {
            Subject::User(id) => vec![id.clone()],
            Subject::Group(id) => {
                let mut stmt =
                    db.prepare("SELECT user_id FROM group_memberships WHERE group_id = ?1")?;
                stmt.bind((1, id.as_str()))?;
                let mut users = Vec::new();
                for row in stmt.into_iter() {
                    users.push(row?.read::<&str, _>("user_id").to_owned());
                }
                users
            }
        };

        for user_id in users {
            let Some(user) = identity::query::by_id(db, &user_id).map_err(|e| match e {
                identity::Error::Internal(e) => Error::Internal(e),
                _ => Error::NotFound("user"),
            })?
            else {
                continue;
            };
            match effective_role(db, &user, resource, now)? {
                Some(role) => {
                    let mut stmt = db.prepare(
                        "INSERT INTO effective_permissions (user_id, resource_type, resource_id, role, computed_at)
                         VALUES (?1, ?2, ?3, ?4, ?5)
                         ON CONFLICT (user_id, resource_type, resource_id)
                         DO UPDATE SET role = ?4, computed_at = ?5",
                    )?;
                    stmt.bind((1, user_id.as_str()))?;
                    stmt.bind((2, resource.kind()))?;
                    stmt.bind((3, resource.id()))?;
                    stmt.bind((4, role.to_string().as_str()))?;
                    stmt.bind((5, now.as_millis() as i64))?;
                    stmt.next()?;
                }
                None => {
                    let mut stmt = db.prepare(
                        "DELETE FROM effective_permissions
                         WHERE user_id = ?1 AND resource_type = ?2 AND resource_id = ?3",
                    )?;
                    stmt.bind((1, user_id.as_str()))?;
                    stmt.bind((2, resource.kind()))?;
                    stmt.bind((3, resource.id()))?;
                    stmt.next()?;
                }
            }
        }
        Ok(())
    }
}
