//! Content-addressed history of experiment source trees.
//!
//! The history is a bare git repository owned by flint. Source files are read
//! straight from the experiment directory into blobs and trees; the user's own
//! repository (if any) is never opened, staged or committed to.

use crate::config::{Config, SnapshotPolicy};
use crate::{ensure_dir, Error, Result};
use chrono::{DateTime, Utc};
use git2::{
    Commit, ErrorCode, FileMode, ObjectType, Oid, Repository, RepositoryInitOptions, Signature,
    TreeWalkMode, TreeWalkResult,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const BRANCH: &str = "main";

/// Directory names never captured, at any depth.
pub const SOURCE_EXCLUDES: &[&str] = &[
    ".git",
    ".flint",
    "target",
    "node_modules",
    ".venv",
    "__pycache__",
    ".tox",
    ".mypy_cache",
    ".pytest_cache",
    ".ruff_cache",
    ".idea",
    ".vscode",
];

/// Commit id of one captured source state.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SnapshotId(String);

impl TryFrom<String> for SnapshotId {
    type Error = Error;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

impl From<SnapshotId> for String {
    fn from(id: SnapshotId) -> Self {
        id.0
    }
}

impl SnapshotId {
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.len() != 40 || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::configuration(format!(
                "'{}' is not a snapshot id (expected 40 hex characters)",
                raw
            )));
        }
        Ok(Self(raw.to_ascii_lowercase()))
    }

    fn from_oid(oid: Oid) -> Self {
        Self(oid.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        self.0.get(..12).unwrap_or(&self.0)
    }

    fn oid(&self) -> Result<Oid> {
        Oid::from_str(&self.0).map_err(|e| Error::snapshot("invalid snapshot id", e))
    }
}

impl fmt::Display for SnapshotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub parent: Option<SnapshotId>,
    /// Tree id; equal trees mean byte-identical captured sources.
    pub tree: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
    /// True when `capture` handed back an existing snapshot.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reused: bool,
}

impl Snapshot {
    fn from_commit(commit: &Commit<'_>, reused: bool) -> Self {
        let created_at =
            DateTime::<Utc>::from_timestamp(commit.time().seconds(), 0).unwrap_or_default();
        Self {
            id: SnapshotId::from_oid(commit.id()),
            parent: commit.parent_ids().next().map(SnapshotId::from_oid),
            tree: commit.tree_id().to_string(),
            message: commit.message().unwrap_or_default().to_string(),
            created_at,
            reused,
        }
    }
}

enum Node {
    Blob(Oid, i32),
    Dir(BTreeMap<String, Node>),
}

pub struct SnapshotStore {
    repo: Repository,
    path: PathBuf,
    policy: SnapshotPolicy,
    author_name: String,
    author_email: String,
}

impl fmt::Debug for SnapshotStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SnapshotStore")
            .field("path", &self.path)
            .field("policy", &self.policy)
            .finish()
    }
}

impl SnapshotStore {
    /// Open the bare history at `path`, creating it on first use.
    pub fn open(path: &Path, config: &Config) -> Result<Self> {
        let repo = if path.exists() {
            let repo = Repository::open_bare(path)
                .map_err(|e| Error::snapshot(format!("cannot open history {}", path.display()), e))?;
            let bare = repo
                .config()
                .and_then(|c| c.get_bool("core.bare"))
                .unwrap_or(false);
            if !bare {
                return Err(Error::configuration(format!(
                    "{} is a working repository; flint only writes to a bare history it created",
                    path.display()
                )));
            }
            repo
        } else {
            if let Some(parent) = path.parent() {
                ensure_dir(parent).map_err(|e| {
                    Error::configuration(format!("cannot create {}: {}", parent.display(), e))
                })?;
            }
            let mut opts = RepositoryInitOptions::new();
            opts.bare(true).initial_head(BRANCH);
            let repo = Repository::init_opts(path, &opts)
                .map_err(|e| Error::snapshot(format!("cannot init history {}", path.display()), e))?;
            info!(history = %path.display(), "initialised snapshot history");
            repo
        };
        Ok(Self {
            repo,
            path: path.to_path_buf(),
            policy: config.snapshot_policy,
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn policy(&self) -> SnapshotPolicy {
        self.policy
    }

    pub fn set_policy(&mut self, policy: SnapshotPolicy) {
        self.policy = policy;
    }

    /// Record `source` as it is right now.
    ///
    /// Objects are written before the branch moves, so a failure leaves at
    /// most unreachable objects behind, never a half-recorded snapshot.
    pub fn capture(&self, source: &Path, message: &str) -> Result<Snapshot> {
        self.check_source(source)?;
        let root = self.collect_tree(source)?;
        let tree_oid = self.write_tree(&root).map_err(|e| Error::snapshot("cannot write tree", e))?;

        let parent = self.head_commit()?;
        if self.policy == SnapshotPolicy::ReuseUnchanged {
            if let Some(parent) = parent.as_ref() {
                if parent.tree_id() == tree_oid {
                    let snapshot = Snapshot::from_commit(parent, true);
                    info!(snapshot = %snapshot.id.short(), "source unchanged, reusing snapshot");
                    return Ok(snapshot);
                }
            }
        }

        let tree = self
            .repo
            .find_tree(tree_oid)
            .map_err(|e| Error::snapshot("cannot load written tree", e))?;
        let sig = Signature::now(&self.author_name, &self.author_email)
            .map_err(|e| Error::snapshot("invalid author signature", e))?;
        let message = if message.trim().is_empty() {
            "snapshot"
        } else {
            message
        };
        let parents: Vec<&Commit<'_>> = parent.iter().collect();
        let oid = self
            .repo
            .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
            .map_err(|e| Error::snapshot("cannot commit snapshot", e))?;
        let commit = self
            .repo
            .find_commit(oid)
            .map_err(|e| Error::snapshot("cannot read back snapshot", e))?;
        let snapshot = Snapshot::from_commit(&commit, false);
        info!(snapshot = %snapshot.id.short(), tree = %tree_oid, "captured snapshot");
        Ok(snapshot)
    }

    pub fn resolve(&self, id: &SnapshotId) -> Result<Snapshot> {
        let commit = self.find_commit(id)?;
        Ok(Snapshot::from_commit(&commit, false))
    }

    pub fn head(&self) -> Result<Option<Snapshot>> {
        Ok(self
            .head_commit()?
            .map(|commit| Snapshot::from_commit(&commit, false)))
    }

    /// Every snapshot, newest first.
    pub fn list(&self) -> Result<Vec<Snapshot>> {
        let head = match self.head_commit()? {
            Some(head) => head,
            None => return Ok(Vec::new()),
        };
        self.walk_from(head.id())
    }

    /// Snapshots preceding `id`, nearest first.
    pub fn ancestors(&self, id: &SnapshotId) -> Result<Vec<SnapshotId>> {
        let mut all = self.walk_from(id.oid()?)?;
        if !all.is_empty() {
            all.remove(0);
        }
        Ok(all.into_iter().map(|s| s.id).collect())
    }

    /// Relative paths of every captured file.
    pub fn files(&self, id: &SnapshotId) -> Result<Vec<PathBuf>> {
        Ok(self
            .entries(id)?
            .into_iter()
            .map(|(path, _, _)| path)
            .collect())
    }

    pub fn read_file(&self, id: &SnapshotId, rel: &Path) -> Result<Vec<u8>> {
        let commit = self.find_commit(id)?;
        let tree = commit
            .tree()
            .map_err(|e| Error::snapshot("cannot load snapshot tree", e))?;
        let entry = tree.get_path(rel).map_err(|e| {
            Error::snapshot(format!("{} is not in snapshot {}", rel.display(), id.short()), e)
        })?;
        let blob = entry
            .to_object(&self.repo)
            .and_then(|o| o.peel_to_blob())
            .map_err(|e| Error::snapshot(format!("{} is not a file", rel.display()), e))?;
        Ok(blob.content().to_vec())
    }

    /// Write the snapshot's files under `dest`, which must be absent or empty.
    pub fn materialize(&self, id: &SnapshotId, dest: &Path) -> Result<usize> {
        if dest.exists() {
            let occupied = fs::read_dir(dest)
                .map(|mut it| it.next().is_some())
                .unwrap_or(true);
            if occupied {
                return Err(Error::configuration(format!(
                    "refusing to materialize into non-empty {}",
                    dest.display()
                )));
            }
        }
        let entries = self.entries(id)?;
        for (rel, oid, mode) in entries.iter() {
            let target = dest.join(rel);
            let blob = self
                .repo
                .find_blob(*oid)
                .map_err(|e| Error::snapshot(format!("missing blob for {}", rel.display()), e))?;
            write_entry(&target, blob.content(), *mode).map_err(|e| {
                Error::allocation_io(&target, "cannot write materialized file", e)
            })?;
        }
        debug!(snapshot = %id.short(), files = entries.len(), dest = %dest.display(), "materialized snapshot");
        Ok(entries.len())
    }

    fn check_source(&self, source: &Path) -> Result<()> {
        let source = source.canonicalize().map_err(|e| {
            Error::configuration(format!("experiment source {}: {}", source.display(), e))
        })?;
        if !source.is_dir() {
            return Err(Error::configuration(format!(
                "experiment source {} is not a directory",
                source.display()
            )));
        }
        let history = self.path.canonicalize().unwrap_or_else(|_| self.path.clone());
        if history.starts_with(&source) {
            return Err(Error::configuration(format!(
                "storage {} lies inside the experiment source {}; choose a storage_path outside it",
                history.display(),
                source.display()
            )));
        }
        Ok(())
    }

    fn collect_tree(&self, source: &Path) -> Result<BTreeMap<String, Node>> {
        let walker = walkdir::WalkDir::new(source)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| {
                e.depth() == 0
                    || !(e.file_type().is_dir()
                        && SOURCE_EXCLUDES
                            .iter()
                            .any(|ex| e.file_name().to_str() == Some(*ex)))
            });
        let mut root: BTreeMap<String, Node> = BTreeMap::new();
        let mut count = 0usize;
        for entry in walker {
            let entry = entry.map_err(|e| {
                Error::configuration(format!("cannot walk {}: {}", source.display(), e))
            })?;
            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            let path = entry.path();
            let (content, mode) = if file_type.is_symlink() {
                let target = fs::read_link(path).map_err(|e| read_error(path, e))?;
                (
                    target.to_string_lossy().into_owned().into_bytes(),
                    i32::from(FileMode::Link),
                )
            } else {
                let content = fs::read(path).map_err(|e| read_error(path, e))?;
                (content, file_mode(&entry))
            };
            let oid = self
                .repo
                .blob(&content)
                .map_err(|e| Error::snapshot(format!("cannot store {}", path.display()), e))?;
            let rel = path.strip_prefix(source).unwrap_or(path);
            insert_node(&mut root, rel, Node::Blob(oid, mode))?;
            count += 1;
        }
        if count == 0 {
            return Err(Error::configuration(format!(
                "experiment source {} has no files to snapshot",
                source.display()
            )));
        }
        debug!(files = count, source = %source.display(), "collected source tree");
        Ok(root)
    }

    fn write_tree(&self, dir: &BTreeMap<String, Node>) -> std::result::Result<Oid, git2::Error> {
        let mut builder = self.repo.treebuilder(None)?;
        for (name, node) in dir {
            match node {
                Node::Blob(oid, mode) => {
                    builder.insert(name.as_str(), *oid, *mode)?;
                }
                Node::Dir(children) => {
                    let sub = self.write_tree(children)?;
                    builder.insert(name.as_str(), sub, i32::from(FileMode::Tree))?;
                }
            }
        }
        builder.write()
    }

    fn head_commit(&self) -> Result<Option<Commit<'_>>> {
        match self.repo.head() {
            Ok(head) => head
                .peel_to_commit()
                .map(Some)
                .map_err(|e| Error::snapshot("history HEAD is not a commit", e)),
            Err(e) if e.code() == ErrorCode::UnbornBranch || e.code() == ErrorCode::NotFound => {
                Ok(None)
            }
            Err(e) => Err(Error::snapshot("cannot read history HEAD", e)),
        }
    }

    fn find_commit(&self, id: &SnapshotId) -> Result<Commit<'_>> {
        self.repo
            .find_commit(id.oid()?)
            .map_err(|e| Error::snapshot(format!("unknown snapshot {}", id), e))
    }

    fn walk_from(&self, start: Oid) -> Result<Vec<Snapshot>> {
        let mut walk = self
            .repo
            .revwalk()
            .map_err(|e| Error::snapshot("cannot walk history", e))?;
        walk.push(start)
            .map_err(|e| Error::snapshot("cannot walk history", e))?;
        let mut out = Vec::new();
        for oid in walk {
            let oid = oid.map_err(|e| Error::snapshot("cannot walk history", e))?;
            let commit = self
                .repo
                .find_commit(oid)
                .map_err(|e| Error::snapshot("cannot walk history", e))?;
            out.push(Snapshot::from_commit(&commit, false));
        }
        Ok(out)
    }

    fn entries(&self, id: &SnapshotId) -> Result<Vec<(PathBuf, Oid, i32)>> {
        let commit = self.find_commit(id)?;
        let tree = commit
            .tree()
            .map_err(|e| Error::snapshot("cannot load snapshot tree", e))?;
        let mut out = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    out.push((Path::new(root).join(name), entry.id(), entry.filemode()));
                }
            }
            TreeWalkResult::Ok
        })
        .map_err(|e| Error::snapshot("cannot walk snapshot tree", e))?;
        Ok(out)
    }
}

fn read_error(path: &Path, e: std::io::Error) -> Error {
    Error::configuration(format!("cannot read source file {}: {}", path.display(), e))
}

fn insert_node(root: &mut BTreeMap<String, Node>, rel: &Path, node: Node) -> Result<()> {
    let mut parts = Vec::new();
    for component in rel.components() {
        let name = component.as_os_str().to_str().ok_or_else(|| {
            Error::configuration(format!("non UTF-8 path in source: {}", rel.display()))
        })?;
        parts.push(name.to_string());
    }
    let (file, dirs) = match parts.split_last() {
        Some(split) => split,
        None => return Ok(()),
    };
    let mut cur = root;
    for dir in dirs {
        let next = cur
            .entry(dir.clone())
            .or_insert_with(|| Node::Dir(BTreeMap::new()));
        cur = match next {
            Node::Dir(children) => children,
            Node::Blob(..) => {
                return Err(Error::configuration(format!(
                    "{} is both a file and a directory",
                    dir
                )))
            }
        };
    }
    cur.insert(file.clone(), node);
    Ok(())
}

#[cfg(unix)]
fn file_mode(entry: &walkdir::DirEntry) -> i32 {
    use std::os::unix::fs::PermissionsExt;
    let executable = entry
        .metadata()
        .map(|m| m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false);
    if executable {
        i32::from(FileMode::BlobExecutable)
    } else {
        i32::from(FileMode::Blob)
    }
}

#[cfg(not(unix))]
fn file_mode(_entry: &walkdir::DirEntry) -> i32 {
    i32::from(FileMode::Blob)
}

fn write_entry(target: &Path, content: &[u8], mode: i32) -> std::io::Result<()> {
    if let Some(parent) = target.parent() {
        ensure_dir(parent)?;
    }
    if mode == i32::from(FileMode::Link) {
        #[cfg(unix)]
        {
            let link = String::from_utf8_lossy(content).into_owned();
            return std::os::unix::fs::symlink(link, target);
        }
    }
    fs::write(target, content)?;
    #[cfg(unix)]
    {
        if mode == i32::from(FileMode::BlobExecutable) {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(target, fs::Permissions::from_mode(0o755))?;
        }
    }
    Ok(())
}
