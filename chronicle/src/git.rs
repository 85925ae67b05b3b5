//! Git collaborator interface.
//!
//! Each document is materialized as a bare repository under a common root.
//! The canonical document content is a JSON array of editor blocks stored in
//! a single file; the rest of the core never parses raw diffs and relies on
//! [`Repo::compare`] for block-level changes.
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::common::Timestamp;

pub use git2 as raw;

/// File holding the canonical document content inside a repository.
pub const CONTENT_FILE: &str = "document.json";
/// The authoritative branch of every document repository.
pub const DEFAULT_BRANCH: &str = "main";

const COMMITTER_EMAIL: &str = "noreply@chronicle.works";

#[derive(Error, Debug)]
pub enum Error {
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Git error.
    #[error("git: {0}")]
    Git(#[from] git2::Error),
    /// The stored content is not a canonical block array.
    #[error("invalid document content: {0}")]
    InvalidContent(#[from] serde_json::Error),
    /// A ref could not be resolved.
    #[error("ref `{0}` not found")]
    NotFound(String),
}

/// A single editor block. Blocks carry persistent identifiers assigned by
/// the editor; the core treats them as opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub id: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub text: String,
}

/// Re-serialize a snapshot into canonical bytes.
///
/// Canonical form is the pretty-printed JSON of the block array in stored
/// order; it is byte-for-byte reproducible for equal content.
pub fn canonical_bytes(snapshot: &serde_json::Value) -> Result<Vec<u8>, Error> {
    let blocks: Vec<Block> = serde_json::from_value(snapshot.clone())?;
    Ok(serde_json::to_vec_pretty(&blocks)?)
}

/// The kind of a block-level change between two refs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Inserted,
    Deleted,
    Modified,
    Moved,
    FormatOnly,
}

/// Context around a changed block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeContext {
    pub before: Option<String>,
    pub after: Option<String>,
}

/// A block-level change, as consumed by change review.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub id: String,
    #[serde(rename = "type")]
    pub change_type: ChangeType,
    pub anchor_node_id: String,
    pub context: ChangeContext,
    pub snippet: String,
    pub author: String,
    pub edited_at: Timestamp,
}

/// Output of [`Repo::compare`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comparison {
    pub changed_fields: Vec<String>,
    pub changes: Vec<Change>,
}

impl Comparison {
    /// Anchor ids present in `from` but no longer in `to`.
    pub fn missing_anchors(&self) -> impl Iterator<Item = &str> {
        self.changes.iter().filter_map(|c| {
            (c.change_type == ChangeType::Deleted).then_some(c.anchor_node_id.as_str())
        })
    }
}

/// A commit, as surfaced to version listings.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub hash: String,
    pub author: String,
    pub message: String,
    pub time: Timestamp,
}

/// Outcome of a three-way merge.
#[derive(Debug)]
pub enum MergeOutcome {
    Merged(git2::Oid),
    Conflict,
}

/// Manages the bare repositories of all documents.
pub struct Repos {
    root: PathBuf,
}

impl Repos {
    /// Open the repository root, creating it if necessary.
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, Error> {
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    /// Open a document's repository, initializing it on first use.
    pub fn repository(&self, document_id: &str) -> Result<Repo, Error> {
        let path = self.root.join(format!("{document_id}.git"));
        if path.exists() {
            Ok(Repo {
                backend: git2::Repository::open_bare(&path)?,
            })
        } else {
            Repo::init(&path)
        }
    }
}

/// A single document repository.
pub struct Repo {
    backend: git2::Repository,
}

impl Repo {
    /// Initialize a bare repository with an empty canonical document
    /// committed to the default branch.
    fn init(path: &Path) -> Result<Self, Error> {
        let mut opts = git2::RepositoryInitOptions::new();
        opts.bare(true);
        opts.initial_head(DEFAULT_BRANCH);

        let backend = git2::Repository::init_opts(path, &opts)?;
        let repo = Self { backend };

        let tree = repo.write_content_tree(b"[]")?;
        let sig = git2::Signature::now("chronicle", COMMITTER_EMAIL)?;
        repo.backend.commit(
            Some(&format!("refs/heads/{DEFAULT_BRANCH}")),
            &sig,
            &sig,
            "Initial commit",
            &repo.backend.find_tree(tree)?,
            &[],
        )?;

        Ok(repo)
    }

    /// Get the head commit id of a ref.
    pub fn head(&self, refspec: &str) -> Result<git2::Oid, Error> {
        Ok(self.resolve(refspec)?.id())
    }

    /// Whether a local branch exists.
    pub fn has_branch(&self, name: &str) -> bool {
        self.backend
            .find_branch(name, git2::BranchType::Local)
            .is_ok()
    }

    /// Create a branch off the given base.
    pub fn create_branch(&self, name: &str, base: &str) -> Result<(), Error> {
        let commit = self.resolve(base)?;
        self.backend.branch(name, &commit, false)?;

        Ok(())
    }

    /// Delete a branch. Missing branches are fine.
    pub fn remove_branch(&self, name: &str) -> Result<(), Error> {
        match self.backend.find_branch(name, git2::BranchType::Local) {
            Ok(mut branch) => {
                branch.delete()?;
                Ok(())
            }
            Err(e) if e.code() == git2::ErrorCode::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read the canonical content at a ref.
    pub fn content(&self, refspec: &str) -> Result<Vec<u8>, Error> {
        let commit = self.resolve(refspec)?;
        let tree = commit.tree()?;
        let entry = tree
            .get_name(CONTENT_FILE)
            .ok_or_else(|| Error::NotFound(format!("{refspec}:{CONTENT_FILE}")))?;
        let blob = self.backend.find_blob(entry.id())?;

        Ok(blob.content().to_vec())
    }

    /// Read the content at a ref as a block array.
    pub fn blocks(&self, refspec: &str) -> Result<Vec<Block>, Error> {
        Ok(serde_json::from_slice(&self.content(refspec)?)?)
    }

    /// Commit canonical content onto a branch.
    ///
    /// Returns `None` without committing when the content is byte-identical
    /// to the branch head.
    pub fn commit_content(
        &self,
        branch: &str,
        author: &str,
        message: &str,
        content: &[u8],
    ) -> Result<Option<git2::Oid>, Error> {
        let parent = self.resolve(branch)?;
        if self.content(branch)? == content {
            return Ok(None);
        }

        let tree = self.write_content_tree(content)?;
        let sig = git2::Signature::now(author, COMMITTER_EMAIL)?;
        let oid = self.backend.commit(
            Some(&format!("refs/heads/{branch}")),
            &sig,
            &sig,
            message,
            &self.backend.find_tree(tree)?,
            &[&parent],
        )?;

        Ok(Some(oid))
    }

    /// Tag a commit with a human-chosen name.
    pub fn tag(&self, name: &str, oid: git2::Oid) -> Result<(), Error> {
        let object = self.backend.find_object(oid, None)?;
        self.backend.tag_lightweight(name, &object, false)?;

        Ok(())
    }

    /// Three-way merge of `source` into `target`.
    ///
    /// On conflict, nothing is written and the caller decides how to
    /// proceed.
    pub fn merge(&self, source: &str, target: &str, author: &str) -> Result<MergeOutcome, Error> {
        let source_commit = self.resolve(source)?;
        let target_commit = self.resolve(target)?;

        // Nothing to merge: the source is already contained in the target.
        if source_commit.id() == target_commit.id()
            || self
                .backend
                .graph_descendant_of(target_commit.id(), source_commit.id())?
        {
            return Ok(MergeOutcome::Merged(target_commit.id()));
        }

        let mut index = self
            .backend
            .merge_commits(&target_commit, &source_commit, None)?;
        if index.has_conflicts() {
            return Ok(MergeOutcome::Conflict);
        }

        let tree_id = index.write_tree_to(&self.backend)?;
        let tree = self.backend.find_tree(tree_id)?;
        let sig = git2::Signature::now(author, COMMITTER_EMAIL)?;
        let oid = self.backend.commit(
            Some(&format!("refs/heads/{target}")),
            &sig,
            &sig,
            &format!("Merge {source} into {target}"),
            &tree,
            &[&target_commit, &source_commit],
        )?;

        Ok(MergeOutcome::Merged(oid))
    }

    /// Compare canonical content between two refs, block by block.
    pub fn compare(&self, from_ref: &str, to_ref: &str) -> Result<Comparison, Error> {
        let from_bytes = self.content(from_ref)?;
        let to_bytes = self.content(to_ref)?;
        let from: Vec<Block> = serde_json::from_slice(&from_bytes)?;
        let to: Vec<Block> = serde_json::from_slice(&to_bytes)?;

        let to_commit = self.resolve(to_ref)?;
        let author = to_commit
            .author()
            .name()
            .unwrap_or("unknown")
            .to_owned();
        let edited_at = Timestamp::from_millis((to_commit.time().seconds() as u128) * 1000);

        let changed_fields = if from_bytes == to_bytes {
            vec![]
        } else {
            vec!["content".to_owned()]
        };

        let mut changes = Vec::new();
        let neighbor = |blocks: &[Block], ix: usize| ChangeContext {
            before: ix.checked_sub(1).map(|i| blocks[i].text.clone()),
            after: blocks.get(ix + 1).map(|b| b.text.clone()),
        };

        // Relative order among blocks common to both sides; used to flag
        // moves without counting shifts caused by insertions or deletions.
        let common_from: Vec<&str> = from
            .iter()
            .filter(|b| to.iter().any(|t| t.id == b.id))
            .map(|b| b.id.as_str())
            .collect();
        let common_to: Vec<&str> = to
            .iter()
            .filter(|b| from.iter().any(|f| f.id == b.id))
            .map(|b| b.id.as_str())
            .collect();

        for (ix, block) in to.iter().enumerate() {
            let Some(old) = from.iter().find(|f| f.id == block.id) else {
                changes.push(Change {
                    id: format!("inserted:{}", block.id),
                    change_type: ChangeType::Inserted,
                    anchor_node_id: block.id.clone(),
                    context: neighbor(&to, ix),
                    snippet: block.text.clone(),
                    author: author.clone(),
                    edited_at,
                });
                continue;
            };
            let change_type = if old.text != block.text {
                Some(ChangeType::Modified)
            } else if old.kind != block.kind {
                Some(ChangeType::FormatOnly)
            } else if common_from.iter().position(|id| *id == block.id)
                != common_to.iter().position(|id| *id == block.id)
            {
                Some(ChangeType::Moved)
            } else {
                None
            };
            if let Some(change_type) = change_type {
                let kind = match change_type {
                    ChangeType::Modified => "modified",
                    ChangeType::FormatOnly => "format_only",
                    ChangeType::Moved => "moved",
                    _ => unreachable!(),
                };
                changes.push(Change {
                    id: format!("{kind}:{}", block.id),
                    change_type,
                    anchor_node_id: block.id.clone(),
                    context: neighbor(&to, ix),
                    snippet: block.text.clone(),
                    author: author.clone(),
                    edited_at,
                });
            }
        }

        for (ix, block) in from.iter().enumerate() {
            if !to.iter().any(|t| t.id == block.id) {
                changes.push(Change {
                    id: format!("deleted:{}", block.id),
                    change_type: ChangeType::Deleted,
                    anchor_node_id: block.id.clone(),
                    context: neighbor(&from, ix),
                    snippet: block.text.clone(),
                    author: author.clone(),
                    edited_at,
                });
            }
        }

        Ok(Comparison {
            changed_fields,
            changes,
        })
    }

    /// List commits reachable from a ref, newest first.
    pub fn commits(&self, refspec: &str, limit: usize) -> Result<Vec<CommitInfo>, Error> {
        let head = self.resolve(refspec)?;
        let mut walk = self.backend.revwalk()?;
        walk.push(head.id())?;

        let mut commits = Vec::new();
        for oid in walk.take(limit) {
            let commit = self.backend.find_commit(oid?)?;
            commits.push(CommitInfo {
                hash: commit.id().to_string(),
                author: commit.author().name().unwrap_or("unknown").to_owned(),
                message: commit.summary().unwrap_or_default().to_owned(),
                time: Timestamp::from_millis((commit.time().seconds() as u128) * 1000),
            });
        }
        Ok(commits)
    }

    fn resolve(&self, refspec: &str) -> Result<git2::Commit<'_>, Error> {
        self.backend
            .revparse_single(refspec)
            .and_then(|o| o.peel_to_commit())
            .map_err(|_| Error::NotFound(refspec.to_owned()))
    }

    fn write_content_tree(&self, content: &[u8]) -> Result<git2::Oid, Error> {
        let blob = self.backend.blob(content)?;
        let mut builder = self.backend.treebuilder(None)?;
        builder.insert(CONTENT_FILE, blob, 0o100_644)?;

        Ok(builder.write()?)
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn blocks_json(blocks: &[(&str, &str)]) -> Vec<u8> {
        let blocks: Vec<Block> = blocks
            .iter()
            .map(|(id, text)| Block {
                id: (*id).to_owned(),
                kind: "paragraph".to_owned(),
                text: (*text).to_owned(),
            })
            .collect();
        serde_json::to_vec_pretty(&blocks).unwrap()
    }

    fn fixture() -> (tempfile::TempDir, Repos) {
        let tmp = tempfile::tempdir().unwrap();
        let repos = Repos::open(tmp.path().join("repos")).unwrap();
        (tmp, repos)
    }

    #[test]
    fn test_init_and_reopen() {
        let (_tmp, repos) = fixture();
        let repo = repos.repository("doc1").unwrap();
        let head = repo.head(DEFAULT_BRANCH).unwrap();
        assert_eq!(repo.content(DEFAULT_BRANCH).unwrap(), b"[]");

        // Re-opening yields the same repository.
        let repo = repos.repository("doc1").unwrap();
        assert_eq!(repo.head(DEFAULT_BRANCH).unwrap(), head);
    }

    #[test]
    fn test_commit_content_skips_identical() {
        let (_tmp, repos) = fixture();
        let repo = repos.repository("doc1").unwrap();
        let content = blocks_json(&[("n1", "hello")]);

        let oid = repo
            .commit_content(DEFAULT_BRANCH, "alice", "edit", &content)
            .unwrap();
        assert!(oid.is_some());

        let again = repo
            .commit_content(DEFAULT_BRANCH, "alice", "edit", &content)
            .unwrap();
        assert_eq!(again, None);
        assert_eq!(repo.head(DEFAULT_BRANCH).unwrap(), oid.unwrap());
    }

    #[test]
    fn test_branch_and_merge() {
        let (_tmp, repos) = fixture();
        let repo = repos.repository("doc1").unwrap();
        repo.create_branch("proposal/doc1-test", DEFAULT_BRANCH)
            .unwrap();
        repo.commit_content(
            "proposal/doc1-test",
            "alice",
            "edit",
            &blocks_json(&[("n1", "hello")]),
        )
        .unwrap();

        match repo.merge("proposal/doc1-test", DEFAULT_BRANCH, "alice").unwrap() {
            MergeOutcome::Merged(oid) => {
                assert_eq!(repo.head(DEFAULT_BRANCH).unwrap(), oid);
                let blocks = repo.blocks(DEFAULT_BRANCH).unwrap();
                assert_eq!(blocks.len(), 1);
                assert_eq!(blocks[0].text, "hello");
            }
            MergeOutcome::Conflict => panic!("unexpected conflict"),
        }
    }

    #[test]
    fn test_merge_conflict_leaves_target_untouched() {
        let (_tmp, repos) = fixture();
        let repo = repos.repository("doc1").unwrap();
        repo.commit_content(
            DEFAULT_BRANCH,
            "alice",
            "seed",
            &blocks_json(&[("n1", "base")]),
        )
        .unwrap();
        repo.create_branch("proposal/doc1-test", DEFAULT_BRANCH)
            .unwrap();
        repo.commit_content(
            "proposal/doc1-test",
            "bob",
            "theirs",
            &blocks_json(&[("n1", "theirs")]),
        )
        .unwrap();
        let main_head = repo
            .commit_content(
                DEFAULT_BRANCH,
                "alice",
                "ours",
                &blocks_json(&[("n1", "ours")]),
            )
            .unwrap()
            .unwrap();

        match repo.merge("proposal/doc1-test", DEFAULT_BRANCH, "bob").unwrap() {
            MergeOutcome::Conflict => {
                assert_eq!(repo.head(DEFAULT_BRANCH).unwrap(), main_head);
            }
            MergeOutcome::Merged(_) => panic!("expected a conflict"),
        }
    }

    #[test]
    fn test_compare() {
        let (_tmp, repos) = fixture();
        let repo = repos.repository("doc1").unwrap();
        repo.commit_content(
            DEFAULT_BRANCH,
            "alice",
            "seed",
            &blocks_json(&[("n1", "one"), ("n2", "two"), ("n3", "three")]),
        )
        .unwrap();
        repo.create_branch("work", DEFAULT_BRANCH).unwrap();
        repo.commit_content(
            "work",
            "bob",
            "edit",
            &blocks_json(&[("n1", "one"), ("n4", "four"), ("n2", "TWO")]),
        )
        .unwrap();

        let cmp = repo.compare(DEFAULT_BRANCH, "work").unwrap();
        assert_eq!(cmp.changed_fields, vec!["content".to_owned()]);

        let find = |ty: ChangeType| {
            cmp.changes
                .iter()
                .find(|c| c.change_type == ty)
                .unwrap_or_else(|| panic!("missing {ty:?}"))
        };
        assert_eq!(find(ChangeType::Inserted).anchor_node_id, "n4");
        assert_eq!(find(ChangeType::Modified).anchor_node_id, "n2");
        assert_eq!(find(ChangeType::Deleted).anchor_node_id, "n3");
        assert_eq!(cmp.missing_anchors().collect::<Vec<_>>(), vec!["n3"]);
        assert_eq!(find(ChangeType::Inserted).author, "bob");
    }

    #[test]
    fn test_compare_identical_is_empty() {
        let (_tmp, repos) = fixture();
        let repo = repos.repository("doc1").unwrap();
        let cmp = repo.compare(DEFAULT_BRANCH, DEFAULT_BRANCH).unwrap();
        assert!(cmp.changed_fields.is_empty());
        assert!(cmp.changes.is_empty());
    }

    #[test]
    fn test_tag_and_commits() {
        let (_tmp, repos) = fixture();
        let repo = repos.repository("doc1").unwrap();
        let oid = repo
            .commit_content(
                DEFAULT_BRANCH,
                "alice",
                "first edit",
                &blocks_json(&[("n1", "hello")]),
            )
            .unwrap()
            .unwrap();
        repo.tag("v1", oid).unwrap();
        assert_eq!(repo.head("v1").unwrap(), oid);

        let commits = repo.commits(DEFAULT_BRANCH, 10).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].message, "first edit");
        assert_eq!(commits[0].author, "alice");

        let limited = repo.commits(DEFAULT_BRANCH, 1).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn test_canonical_bytes() {
        let snapshot = serde_json::json!([
            { "id": "n1", "kind": "paragraph", "text": "hello" }
        ]);
        let bytes = canonical_bytes(&snapshot).unwrap();
        assert_eq!(bytes, canonical_bytes(&snapshot).unwrap());
        assert!(canonical_bytes(&serde_json::json!({"not": "blocks"})).is_err());
    }
}
