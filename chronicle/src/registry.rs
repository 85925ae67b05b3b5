//! Workspaces, spaces and the document tree.
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlite as sql;
use thiserror::Error;

use crate::access;
use crate::audit;
use crate::common::{self, Timestamp};
use crate::db::{opt_text, transaction, Database};

#[derive(Error, Debug)]
pub enum Error {
    /// An internal error.
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
    /// A referenced entity is missing.
    #[error("{0} `{1}` not found")]
    NotFound(&'static str, String),
    /// Moving a document under its own descendant.
    #[error("cannot move document `{0}` under its own subtree")]
    CyclicMove(String),
    /// Deleting a space that still contains documents.
    #[error("space `{0}` is not empty")]
    SpaceNotEmpty(String),
    /// Could not parse a stored enum value.
    #[error("invalid value `{0}`")]
    InvalidValue(String),
    /// Audit log error.
    #[error(transparent)]
    Audit(#[from] audit::Error),
    /// Permission store error.
    #[error(transparent)]
    Access(#[from] access::Error),
}

/// A tenancy root owning spaces and users.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Workspace {
    pub id: String,
    pub name: String,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpaceVisibility {
    Organization,
    Restricted,
}

impl fmt::Display for SpaceVisibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Organization => write!(f, "organization"),
            Self::Restricted => write!(f, "restricted"),
        }
    }
}

impl FromStr for SpaceVisibility {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "organization" => Ok(Self::Organization),
            "restricted" => Ok(Self::Restricted),
            other => Err(Error::InvalidValue(other.to_owned())),
        }
    }
}

/// A grouping of documents within a workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Space {
    pub id: String,
    pub workspace_id: String,
    pub name: String,
    pub slug: String,
    pub description: String,
    pub visibility: SpaceVisibility,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DocumentStatus {
    Draft,
    InReview,
    ReadyForApproval,
    Approved,
}

impl fmt::Display for DocumentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Draft => write!(f, "draft"),
            Self::InReview => write!(f, "in-review"),
            Self::ReadyForApproval => write!(f, "ready-for-approval"),
            Self::Approved => write!(f, "approved"),
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(Self::Draft),
            "in-review" => Ok(Self::InReview),
            "ready-for-approval" => Ok(Self::ReadyForApproval),
            "approved" => Ok(Self::Approved),
            other => Err(Error::InvalidValue(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShareMode {
    Private,
    Space,
    Invite,
    Link,
}

impl fmt::Display for ShareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Private => write!(f, "private"),
            Self::Space => write!(f, "space"),
            Self::Invite => write!(f, "invite"),
            Self::Link => write!(f, "link"),
        }
    }
}

impl FromStr for ShareMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "private" => Ok(Self::Private),
            "space" => Ok(Self::Space),
            "invite" => Ok(Self::Invite),
            "link" => Ok(Self::Link),
            other => Err(Error::InvalidValue(other.to_owned())),
        }
    }
}

/// A governed document. The body lives in the git collaborator; this row
/// carries placement and lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub space_id: String,
    pub title: String,
    pub subtitle: String,
    pub status: DocumentStatus,
    pub parent_id: Option<String>,
    pub sort_order: i64,
    pub path: String,
    pub share_mode: ShareMode,
    pub updated_by: Option<String>,
    pub updated_at: Timestamp,
    pub created_at: Timestamp,
}

/// Registry of workspaces, spaces and documents.
#[derive(Clone)]
pub struct Registry {
    db: Database,
}

impl Registry {
    pub fn open(db: Database) -> Self {
        Self { db }
    }

    /// Create a workspace.
    pub fn create_workspace(&self, name: &str) -> Result<Workspace, Error> {
        let now = Timestamp::now();
        let id = common::id();
        let mut stmt = self
            .db
            .prepare("INSERT INTO workspaces (id, name, created_at) VALUES (?1, ?2, ?3)")?;
        stmt.bind((1, id.as_str()))?;
        stmt.bind((2, name))?;
        stmt.bind((3, now.as_millis() as i64))?;
        stmt.next()?;

        Ok(Workspace {
            id,
            name: name.to_owned(),
            created_at: now,
        })
    }

    /// Look up a workspace.
    pub fn workspace(&self, id: &str) -> Result<Workspace, Error> {
        let mut stmt = self
            .db
            .prepare("SELECT id, name, created_at FROM workspaces WHERE id = ?1")?;
        stmt.bind((1, id))?;

        let row = stmt
            .into_iter()
            .next()
            .transpose()?
            .ok_or_else(|| Error::NotFound("workspace", id.to_owned()))?;

        Ok(Workspace {
            id: row.read::<&str, _>("id").to_owned(),
            name: row.read::<&str, _>("name").to_owned(),
            created_at: Timestamp::from_millis(row.read::<i64, _>("created_at") as u128),
        })
    }

    /// The first workspace created, if any. Used for bootstrap.
    pub fn default_workspace(&self) -> Result<Option<Workspace>, Error> {
        let mut stmt = self
            .db
            .prepare("SELECT id, name, created_at FROM workspaces ORDER BY created_at LIMIT 1")?;

        match stmt.into_iter().next().transpose()? {
            None => Ok(None),
            Some(row) => Ok(Some(Workspace {
                id: row.read::<&str, _>("id").to_owned(),
                name: row.read::<&str, _>("name").to_owned(),
                created_at: Timestamp::from_millis(row.read::<i64, _>("created_at") as u128),
            })),
        }
    }

    /// Add a user to a workspace with a baseline role.
    pub fn add_member(&self, workspace_id: &str, user_id: &str, role: &str) -> Result<(), Error> {
        let now = Timestamp::now();
        let mut stmt = self.db.prepare(
            "INSERT INTO workspace_memberships (workspace_id, user_id, role, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (workspace_id, user_id) DO UPDATE SET role = ?3",
        )?;
        stmt.bind((1, workspace_id))?;
        stmt.bind((2, user_id))?;
        stmt.bind((3, role))?;
        stmt.bind((4, now.as_millis() as i64))?;
        stmt.next()?;

        Ok(())
    }

    /// Create a space. Slugs are unique within a workspace; collisions are
    /// suffixed `-2`, `-3` and so on.
    pub fn create_space(
        &self,
        workspace_id: &str,
        name: &str,
        description: &str,
        visibility: SpaceVisibility,
    ) -> Result<Space, Error> {
        let id = common::id();

        transaction(&self.db, |conn| {
            let slug = query::free_slug(conn, workspace_id, &common::slug(name))?;
            let mut stmt = conn.prepare(
                "INSERT INTO spaces (id, workspace_id, name, slug, description, visibility)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            stmt.bind((1, id.as_str()))?;
            stmt.bind((2, workspace_id))?;
            stmt.bind((3, name))?;
            stmt.bind((4, slug.as_str()))?;
            stmt.bind((5, description))?;
            stmt.bind((6, visibility.to_string().as_str()))?;
            stmt.next()?;

            Ok::<(), Error>(())
        })?;

        self.space(&id)
    }

    /// Look up a space.
    pub fn space(&self, id: &str) -> Result<Space, Error> {
        let mut stmt = self
            .db
            .prepare(&format!("{} WHERE id = ?1", query::SELECT_SPACE))?;
        stmt.bind((1, id))?;

        stmt.into_iter()
            .next()
            .transpose()?
            .ok_or_else(|| Error::NotFound("space", id.to_owned()))
            .and_then(|row| query::parse_space(&row))
    }

    /// List spaces of a workspace, in sort order.
    pub fn spaces(&self, workspace_id: &str) -> Result<Vec<Space>, Error> {
        let mut stmt = self.db.prepare(&format!(
            "{} WHERE workspace_id = ?1 ORDER BY sort_order, slug",
            query::SELECT_SPACE
        ))?;
        stmt.bind((1, workspace_id))?;

        stmt.into_iter()
            .map(|row| row.map_err(Error::from).and_then(|r| query::parse_space(&r)))
            .collect()
    }

    /// Update a space's metadata.
    pub fn update_space(
        &self,
        id: &str,
        name: &str,
        description: &str,
        visibility: SpaceVisibility,
        sort_order: i64,
    ) -> Result<Space, Error> {
        let mut stmt = self.db.prepare(
            "UPDATE spaces SET name = ?2, description = ?3, visibility = ?4, sort_order = ?5
             WHERE id = ?1",
        )?;
        stmt.bind((1, id))?;
        stmt.bind((2, name))?;
        stmt.bind((3, description))?;
        stmt.bind((4, visibility.to_string().as_str()))?;
        stmt.bind((5, sort_order))?;
        stmt.next()?;

        if self.db.change_count() == 0 {
            return Err(Error::NotFound("space", id.to_owned()));
        }
        self.space(id)
    }

    /// Delete a space. Fails while documents still live in it; grants on
    /// the space are cascaded so they cannot outlive it.
    pub fn delete_space(&self, id: &str) -> Result<(), Error> {
        let now = Timestamp::now();

        transaction(&self.db, |conn| {
            let mut stmt =
                conn.prepare("SELECT COUNT(*) AS n FROM documents WHERE space_id = ?1")?;
            stmt.bind((1, id))?;
            let n = stmt
                .into_iter()
                .next()
                .transpose()?
                .map(|row| row.read::<i64, _>("n"))
                .unwrap_or(0);
            if n > 0 {
                return Err(Error::SpaceNotEmpty(id.to_owned()));
            }

            access::cascade_revoke(conn, &access::Resource::Space(id.to_owned()), now)?;

            let mut stmt = conn.prepare("DELETE FROM spaces WHERE id = ?1")?;
            stmt.bind((1, id))?;
            stmt.next()?;
            if conn.change_count() == 0 {
                return Err(Error::NotFound("space", id.to_owned()));
            }
            Ok(())
        })
    }

    /// Create a document. If a parent is given, the document lands in the
    /// parent's space regardless of `space_id`.
    pub fn create_document(
        &self,
        space_id: &str,
        title: &str,
        subtitle: &str,
        parent_id: Option<&str>,
        created_by: &str,
    ) -> Result<Document, Error> {
        let now = Timestamp::now();
        let id = common::id();

        transaction(&self.db, |conn| {
            let (space_id, path) = match parent_id {
                None => (space_id.to_owned(), format!("/{id}")),
                Some(parent) => {
                    let parent = query::document(conn, parent)?
                        .ok_or_else(|| Error::NotFound("document", parent.to_owned()))?;
                    (parent.space_id, format!("{}/{id}", parent.path))
                }
            };
            let mut stmt = conn.prepare(
                "INSERT INTO documents (id, space_id, title, subtitle, parent_id, path,
                                        updated_by, updated_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
            )?;
            stmt.bind((1, id.as_str()))?;
            stmt.bind((2, space_id.as_str()))?;
            stmt.bind((3, title))?;
            stmt.bind((4, subtitle))?;
            stmt.bind((5, opt_text(parent_id)))?;
            stmt.bind((6, path.as_str()))?;
            stmt.bind((7, created_by))?;
            stmt.bind((8, now.as_millis() as i64))?;
            stmt.next()?;

            audit::query::record(
                conn,
                &audit::NewEvent::new("document.created", created_by, &id)
                    .payload(json!({ "title": title, "spaceId": space_id })),
                now,
            )?;

            Ok::<(), Error>(())
        })?;

        self.document(&id)
    }

    /// Look up a document.
    pub fn document(&self, id: &str) -> Result<Document, Error> {
        query::document(&self.db, id)?.ok_or_else(|| Error::NotFound("document", id.to_owned()))
    }

    /// List documents of a space, in tree order.
    pub fn documents(&self, space_id: &str) -> Result<Vec<Document>, Error> {
        let mut stmt = self.db.prepare(&format!(
            "{} WHERE space_id = ?1 ORDER BY path",
            query::SELECT_DOCUMENT
        ))?;
        stmt.bind((1, space_id))?;

        stmt.into_iter()
            .map(|row| {
                row.map_err(Error::from)
                    .and_then(|r| query::parse_document(&r))
            })
            .collect()
    }

    /// List a document's subtree, excluding the document itself.
    pub fn descendants(&self, id: &str) -> Result<Vec<Document>, Error> {
        let doc = self.document(id)?;
        let mut stmt = self.db.prepare(&format!(
            "{} WHERE path LIKE ?1 ORDER BY path",
            query::SELECT_DOCUMENT
        ))?;
        stmt.bind((1, format!("{}/%", doc.path).as_str()))?;

        stmt.into_iter()
            .map(|row| {
                row.map_err(Error::from)
                    .and_then(|r| query::parse_document(&r))
            })
            .collect()
    }

    /// Update a document's metadata.
    pub fn update_document(
        &self,
        id: &str,
        title: &str,
        subtitle: &str,
        sort_order: i64,
        updated_by: &str,
    ) -> Result<Document, Error> {
        let now = Timestamp::now();

        transaction(&self.db, |conn| {
            let mut stmt = conn.prepare(
                "UPDATE documents SET title = ?2, subtitle = ?3, sort_order = ?4,
                                      updated_by = ?5, updated_at = ?6
                 WHERE id = ?1",
            )?;
            stmt.bind((1, id))?;
            stmt.bind((2, title))?;
            stmt.bind((3, subtitle))?;
            stmt.bind((4, sort_order))?;
            stmt.bind((5, updated_by))?;
            stmt.bind((6, now.as_millis() as i64))?;
            stmt.next()?;

            if conn.change_count() == 0 {
                return Err(Error::NotFound("document", id.to_owned()));
            }
            audit::query::record(
                conn,
                &audit::NewEvent::new("document.updated", updated_by, id)
                    .payload(json!({ "title": title })),
                now,
            )?;

            Ok(())
        })?;

        self.document(id)
    }

    /// Set a document's share mode.
    pub fn set_share_mode(
        &self,
        id: &str,
        share_mode: ShareMode,
        updated_by: &str,
    ) -> Result<Document, Error> {
        let now = Timestamp::now();

        transaction(&self.db, |conn| {
            let mut stmt = conn.prepare(
                "UPDATE documents SET share_mode = ?2, updated_by = ?3, updated_at = ?4 WHERE id = ?1",
            )?;
            stmt.bind((1, id))?;
            stmt.bind((2, share_mode.to_string().as_str()))?;
            stmt.bind((3, updated_by))?;
            stmt.bind((4, now.as_millis() as i64))?;
            stmt.next()?;

            if conn.change_count() == 0 {
                return Err(Error::NotFound("document", id.to_owned()));
            }
            audit::query::record(
                conn,
                &audit::NewEvent::new("document.share-mode", updated_by, id)
                    .payload(json!({ "shareMode": share_mode.to_string() })),
                now,
            )?;

            Ok(())
        })?;

        self.document(id)
    }

    /// Set a document's lifecycle status.
    pub fn set_status(
        &self,
        id: &str,
        status: DocumentStatus,
        updated_by: &str,
    ) -> Result<(), Error> {
        query::set_status(&self.db, id, status, updated_by, Timestamp::now())
    }

    /// Move a document under a new parent and/or into a new space.
    ///
    /// The document row and the `path` of every descendant are rewritten in
    /// a single transaction; descendants follow the target space.
    pub fn move_document(
        &self,
        id: &str,
        new_parent: Option<&str>,
        new_space: Option<&str>,
        moved_by: &str,
    ) -> Result<Document, Error> {
        let now = Timestamp::now();

        transaction(&self.db, |conn| {
            let doc = query::document(conn, id)?
                .ok_or_else(|| Error::NotFound("document", id.to_owned()))?;

            let (parent_id, space_id, new_path) = match new_parent {
                Some(parent_id) => {
                    let parent = query::document(conn, parent_id)?
                        .ok_or_else(|| Error::NotFound("document", parent_id.to_owned()))?;
                    if parent.id == doc.id || parent.path.starts_with(&format!("{}/", doc.path)) {
                        return Err(Error::CyclicMove(id.to_owned()));
                    }
                    let path = format!("{}/{id}", parent.path);
                    (Some(parent.id), parent.space_id, path)
                }
                None => {
                    let space = new_space.unwrap_or(&doc.space_id).to_owned();
                    (None, space, format!("/{id}"))
                }
            };

            let mut stmt = conn.prepare(
                "UPDATE documents SET parent_id = ?2, space_id = ?3, path = ?4,
                                      updated_by = ?5, updated_at = ?6
                 WHERE id = ?1",
            )?;
            stmt.bind((1, id))?;
            stmt.bind((2, opt_text(parent_id.as_deref())))?;
            stmt.bind((3, space_id.as_str()))?;
            stmt.bind((4, new_path.as_str()))?;
            stmt.bind((5, moved_by))?;
            stmt.bind((6, now.as_millis() as i64))?;
            stmt.next()?;

            // Rewrite the subtree: substitute the path prefix and override
            // the space.
            let mut stmt = conn.prepare(
                "UPDATE documents
                 SET path = ?2 || substr(path, ?3), space_id = ?4, updated_at = ?5
                 WHERE path LIKE ?1",
            )?;
            stmt.bind((1, format!("{}/%", doc.path).as_str()))?;
            stmt.bind((2, new_path.as_str()))?;
            stmt.bind((3, (doc.path.len() + 1) as i64))?;
            stmt.bind((4, space_id.as_str()))?;
            stmt.bind((5, now.as_millis() as i64))?;
            stmt.next()?;

            audit::query::record(
                conn,
                &audit::NewEvent::new("document.moved", moved_by, id).payload(json!({
                    "from": doc.path,
                    "to": new_path,
                    "spaceId": space_id,
                })),
                now,
            )?;

            Ok(())
        })?;

        self.document(id)
    }
}

/// Helper SQL queries, shared within the crate.
pub(crate) mod query {
    use super::*;

    pub(crate) const SELECT_DOCUMENT: &str =
        "SELECT id, space_id, title, subtitle, status, parent_id, sort_order, path,
                share_mode, updated_by, updated_at, created_at
         FROM documents";

    pub(super) const SELECT_SPACE: &str =
        "SELECT id, workspace_id, name, slug, description, visibility, sort_order FROM spaces";

    pub(crate) fn document(db: &sql::Connection, id: &str) -> Result<Option<Document>, Error> {
        let mut stmt = db.prepare(&format!("{SELECT_DOCUMENT} WHERE id = ?1"))?;
        stmt.bind((1, id))?;

        stmt.into_iter()
            .next()
            .transpose()?
            .map(|row| parse_document(&row))
            .transpose()
    }

    pub(crate) fn parse_document(row: &sql::Row) -> Result<Document, Error> {
        Ok(Document {
            id: row.read::<&str, _>("id").to_owned(),
            space_id: row.read::<&str, _>("space_id").to_owned(),
            title: row.read::<&str, _>("title").to_owned(),
            subtitle: row.read::<&str, _>("subtitle").to_owned(),
            status: row.read::<&str, _>("status").parse()?,
            parent_id: row.read::<Option<&str>, _>("parent_id").map(|s| s.to_owned()),
            sort_order: row.read::<i64, _>("sort_order"),
            path: row.read::<&str, _>("path").to_owned(),
            share_mode: row.read::<&str, _>("share_mode").parse()?,
            updated_by: row.read::<Option<&str>, _>("updated_by").map(|s| s.to_owned()),
            updated_at: Timestamp::from_millis(row.read::<i64, _>("updated_at") as u128),
            created_at: Timestamp::from_millis(row.read::<i64, _>("created_at") as u128),
        })
    }

    pub(super) fn parse_space(row: &sql::Row) -> Result<Space, Error> {
        Ok(Space {
            id: row.read::<&str, _>("id").to_owned(),
            workspace_id: row.read::<&str, _>("workspace_id").to_owned(),
            name: row.read::<&str, _>("name").to_owned(),
            slug: row.read::<&str, _>("slug").to_owned(),
            description: row.read::<&str, _>("description").to_owned(),
            visibility: row.read::<&str, _>("visibility").parse()?,
            sort_order: row.read::<i64, _>("sort_order"),
        })
    }

    /// Find a free slug within a workspace, suffixing `-N` on collision.
    pub(super) fn free_slug(
        db: &sql::Connection,
        workspace_id: &str,
        base: &str,
    ) -> Result<String, Error> {
        let mut stmt =
            db.prepare("SELECT 1 FROM spaces WHERE workspace_id = ?1 AND slug = ?2")?;
        stmt.bind((1, workspace_id))?;
        stmt.bind((2, base))?;
        if stmt.into_iter().next().transpose()?.is_none() {
            return Ok(base.to_owned());
        }

        for n in 2.. {
            let candidate = format!("{base}-{n}");
            let mut stmt =
                db.prepare("SELECT 1 FROM spaces WHERE workspace_id = ?1 AND slug = ?2")?;
            stmt.bind((1, workspace_id))?;
            stmt.bind((2, candidate.as_str()))?;
            if stmt.into_iter().next().transpose()?.is_none() {
                return Ok(candidate);
            }
        }
        unreachable!("free_slug: the suffix space is unbounded")
    }

    pub(crate) fn set_status(
        db: &sql::Connection,
        id: &str,
        status: DocumentStatus,
        updated_by: &str,
        now: Timestamp,
    ) -> Result<(), Error> {
        let mut stmt = db.prepare(
            "UPDATE documents SET status = ?2, updated_by = ?3, updated_at = ?4 WHERE id = ?1",
        )?;
        stmt.bind((1, id))?;
        stmt.bind((2, status.to_string().as_str()))?;
        stmt.bind((3, updated_by))?;
        stmt.bind((4, now.as_millis() as i64))?;
        stmt.next()?;

        if db.change_count() == 0 {
            return Err(Error::NotFound("document", id.to_owned()));
        }
        Ok(())
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> (Registry, Workspace, Space) {
        let registry = Registry::open(Database::memory().unwrap());
        let workspace = registry.create_workspace("Acme").unwrap();
        let space = registry
            .create_space(&workspace.id, "Legal", "", SpaceVisibility::Organization)
            .unwrap();
        (registry, workspace, space)
    }

    #[test]
    fn test_slug_collision_suffixing() {
        let (registry, workspace, space) = fixture();
        assert_eq!(space.slug, "legal");

        let second = registry
            .create_space(&workspace.id, "Legal", "", SpaceVisibility::Organization)
            .unwrap();
        assert_eq!(second.slug, "legal-2");

        let third = registry
            .create_space(&workspace.id, "Legal", "", SpaceVisibility::Restricted)
            .unwrap();
        assert_eq!(third.slug, "legal-3");
    }

    #[test]
    fn test_document_paths() {
        let (registry, _, space) = fixture();
        let root = registry
            .create_document(&space.id, "Contract", "", None, "alice")
            .unwrap();
        assert_eq!(root.path, format!("/{}", root.id));
        assert_eq!(root.parent_id, None);
        assert_eq!(root.status, DocumentStatus::Draft);

        let child = registry
            .create_document(&space.id, "Annex", "", Some(&root.id), "alice")
            .unwrap();
        assert_eq!(child.path, format!("/{}/{}", root.id, child.id));
        assert_eq!(child.parent_id.as_deref(), Some(root.id.as_str()));
    }

    #[test]
    fn test_move_rewrites_subtree() {
        let (registry, _, space) = fixture();
        let a = registry
            .create_document(&space.id, "A", "", None, "alice")
            .unwrap();
        let b = registry
            .create_document(&space.id, "B", "", Some(&a.id), "alice")
            .unwrap();
        let c = registry
            .create_document(&space.id, "C", "", Some(&b.id), "alice")
            .unwrap();
        let target = registry
            .create_document(&space.id, "Target", "", None, "alice")
            .unwrap();

        let moved = registry
            .move_document(&a.id, Some(&target.id), None, "alice")
            .unwrap();
        assert_eq!(moved.path, format!("/{}/{}", target.id, a.id));

        // Every descendant path starts with the new prefix.
        let b = registry.document(&b.id).unwrap();
        let c = registry.document(&c.id).unwrap();
        assert_eq!(b.path, format!("{}/{}", moved.path, b.id));
        assert_eq!(c.path, format!("{}/{}", b.path, c.id));
        assert!(c.path.starts_with(&format!("{}/", moved.path)));
    }

    #[test]
    fn test_move_overrides_space() {
        let (registry, workspace, space) = fixture();
        let other = registry
            .create_space(&workspace.id, "Eng", "", SpaceVisibility::Organization)
            .unwrap();
        let a = registry
            .create_document(&space.id, "A", "", None, "alice")
            .unwrap();
        let b = registry
            .create_document(&space.id, "B", "", Some(&a.id), "alice")
            .unwrap();

        registry
            .move_document(&a.id, None, Some(&other.id), "alice")
            .unwrap();
        assert_eq!(registry.document(&a.id).unwrap().space_id, other.id);
        assert_eq!(registry.document(&b.id).unwrap().space_id, other.id);
    }

    #[test]
    fn test_cyclic_move_is_rejected() {
        let (registry, _, space) = fixture();
        let a = registry
            .create_document(&space.id, "A", "", None, "alice")
            .unwrap();
        let b = registry
            .create_document(&space.id, "B", "", Some(&a.id), "alice")
            .unwrap();

        assert!(matches!(
            registry.move_document(&a.id, Some(&b.id), None, "alice"),
            Err(Error::CyclicMove(_))
        ));
        assert!(matches!(
            registry.move_document(&a.id, Some(&a.id), None, "alice"),
            Err(Error::CyclicMove(_))
        ));
    }

    #[test]
    fn test_delete_space() {
        let (registry, workspace, space) = fixture();
        let doc = registry
            .create_document(&space.id, "Contract", "", None, "alice")
            .unwrap();

        assert!(matches!(
            registry.delete_space(&space.id),
            Err(Error::SpaceNotEmpty(_))
        ));

        let empty = registry
            .create_space(&workspace.id, "Empty", "", SpaceVisibility::Organization)
            .unwrap();
        registry.delete_space(&empty.id).unwrap();
        assert!(matches!(
            registry.space(&empty.id),
            Err(Error::NotFound(_, _))
        ));

        // The occupied space is still there.
        registry.space(&space.id).unwrap();
        registry.document(&doc.id).unwrap();
    }

    #[test]
    fn test_delete_space_cascades_grants() {
        use crate::access::{Permissions, Resource, Role, Subject};
        use crate::identity::Users;

        let db = Database::memory().unwrap();
        let registry = Registry::open(db.clone());
        let perms = Permissions::open(db.clone());
        let users = Users::open(db);

        let workspace = registry.create_workspace("Acme").unwrap();
        let space = registry
            .create_space(&workspace.id, "Legal", "", SpaceVisibility::Organization)
            .unwrap();
        let (_, token) = users.signup("alice@acme.test", "hunter2!", "Alice").unwrap();
        let alice = users.verify_email(&token).unwrap();

        let resource = Resource::Space(space.id.clone());
        perms
            .grant(
                &workspace.id,
                &Subject::User(alice.id.clone()),
                &resource,
                Role::Editor,
                "root",
                None,
            )
            .unwrap();
        assert_eq!(
            perms.cached(&alice.id, &resource).unwrap(),
            Some(Role::Editor)
        );

        registry.delete_space(&space.id).unwrap();

        // The grant did not outlive the space, and the cached role is gone.
        assert!(perms.list(&resource).unwrap().is_empty());
        assert_eq!(perms.cached(&alice.id, &resource).unwrap(), None);
        assert_eq!(perms.effective(&alice, &resource).unwrap(), None);
    }

    #[test]
    fn test_share_mode() {
        let (registry, _, space) = fixture();
        let doc = registry
            .create_document(&space.id, "Contract", "", None, "alice")
            .unwrap();
        assert_eq!(doc.share_mode, ShareMode::Space);

        let doc = registry
            .set_share_mode(&doc.id, ShareMode::Link, "alice")
            .unwrap();
        assert_eq!(doc.share_mode, ShareMode::Link);
        assert_eq!(doc.updated_by.as_deref(), Some("alice"));
    }
}
