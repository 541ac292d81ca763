//! One output directory per snapshot, created whole or not at all.

use crate::snapshot::{Snapshot, SnapshotId};
use crate::{atomic_write_json_pretty, ensure_dir, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

pub const IDENTITY_FILE: &str = "snapshot.json";
pub const OWNER_LOCK: &str = ".owner.lock";

static STAGING_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
pub struct ArtifactAllocator {
    root: PathBuf,
}

impl ArtifactAllocator {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_of(&self, id: &SnapshotId) -> PathBuf {
        self.root.join(id.as_str())
    }

    /// Directory for `snapshot`, created on first request.
    ///
    /// Repeated calls return the same path and leave existing contents alone.
    /// The first creation is staged in a hidden sibling and renamed into place,
    /// so no caller ever sees a directory without its identity file.
    pub fn allocate(&self, snapshot: &Snapshot) -> Result<ArtifactDir> {
        let target = self.path_of(&snapshot.id);
        if target.is_dir() {
            let dir = ArtifactDir::new(target, snapshot.id.clone());
            dir.verify_identity()?;
            debug!(dir = %dir.path().display(), "artifact directory already allocated");
            return Ok(dir);
        }
        if target.exists() {
            return Err(Error::allocation(&target, "exists and is not a directory"));
        }
        ensure_dir(&self.root)
            .map_err(|e| Error::allocation_io(&self.root, "cannot create artifact root", e))?;

        let staging = self.root.join(format!(
            ".{}.tmp.{}.{}.{}",
            snapshot.id,
            std::process::id(),
            Utc::now().timestamp_micros(),
            STAGING_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        fs::create_dir(&staging)
            .map_err(|e| Error::allocation_io(&staging, "cannot create staging directory", e))?;
        if let Err(e) = atomic_write_json_pretty(&staging.join(IDENTITY_FILE), snapshot) {
            let _ = fs::remove_dir_all(&staging);
            return Err(Error::allocation_io(&staging, "cannot write identity file", e));
        }
        match fs::rename(&staging, &target) {
            Ok(()) => {
                info!(dir = %target.display(), "allocated artifact directory");
            }
            Err(_) if target.is_dir() => {
                // Another caller won the race; theirs is complete.
                let _ = fs::remove_dir_all(&staging);
                debug!(dir = %target.display(), "artifact directory created concurrently");
            }
            Err(e) => {
                let _ = fs::remove_dir_all(&staging);
                return Err(Error::allocation_io(&target, "cannot move directory into place", e));
            }
        }
        Ok(ArtifactDir::new(target, snapshot.id.clone()))
    }

    /// Directory for `id` if one was ever allocated.
    pub fn existing(&self, id: &SnapshotId) -> Option<ArtifactDir> {
        let path = self.path_of(id);
        path.is_dir().then(|| ArtifactDir::new(path, id.clone()))
    }
}

/// `dir/name`, refusing names that would leave `dir`.
pub fn join_inside(dir: &Path, name: &Path) -> Result<PathBuf> {
    let escapes = name
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || name.as_os_str().is_empty() {
        return Err(Error::allocation(
            dir,
            format!("artifact name {} must stay inside the directory", name.display()),
        ));
    }
    Ok(dir.join(name))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OwnerInfo {
    pub pid: u32,
    pub run_id: String,
    pub acquired_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDir {
    path: PathBuf,
    snapshot: SnapshotId,
}

impl ArtifactDir {
    fn new(path: PathBuf, snapshot: SnapshotId) -> Self {
        Self { path, snapshot }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> &SnapshotId {
        &self.snapshot
    }

    /// Location for an output file; only relative paths inside the directory.
    pub fn path_for(&self, name: impl AsRef<Path>) -> Result<PathBuf> {
        join_inside(&self.path, name.as_ref())
    }

    /// Take exclusive ownership for one run. A second claimant fails fast.
    pub fn claim(&self, run_id: &str) -> Result<OwnerLock> {
        let lock_path = self.path.join(OWNER_LOCK);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut file) => {
                let info = OwnerInfo {
                    pid: std::process::id(),
                    run_id: run_id.to_string(),
                    acquired_at: Utc::now(),
                };
                let payload = serde_json::to_vec(&info).unwrap_or_default();
                let _ = file.write_all(&payload);
                let _ = file.sync_all();
                Ok(OwnerLock { path: lock_path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = self
                    .owner()
                    .map(|o| format!("run {} (pid {})", o.run_id, o.pid))
                    .unwrap_or_else(|| "another run".to_string());
                Err(Error::allocation(
                    &self.path,
                    format!("directory is in use by {}", holder),
                ))
            }
            Err(e) => Err(Error::allocation_io(&lock_path, "cannot create owner lock", e)),
        }
    }

    pub fn owner(&self) -> Option<OwnerInfo> {
        let raw = fs::read(self.path.join(OWNER_LOCK)).ok()?;
        serde_json::from_slice(&raw).ok()
    }

    /// Remove a lock left behind by a killed process. Returns whether one existed.
    pub fn release_stale_lock(&self) -> Result<bool> {
        let lock_path = self.path.join(OWNER_LOCK);
        match fs::remove_file(&lock_path) {
            Ok(()) => {
                warn!(dir = %self.path.display(), "removed stale owner lock");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::allocation_io(&lock_path, "cannot remove owner lock", e)),
        }
    }

    /// Names of everything in the directory except flint's own bookkeeping.
    pub fn outputs(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(&self.path)
            .map_err(|e| Error::allocation_io(&self.path, "cannot list directory", e))?;
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n != IDENTITY_FILE && n != OWNER_LOCK)
            .collect();
        names.sort();
        Ok(names)
    }

    fn verify_identity(&self) -> Result<()> {
        let identity = self.path.join(IDENTITY_FILE);
        let raw = match fs::read(&identity) {
            Ok(raw) => raw,
            Err(e) => {
                return Err(Error::allocation_io(
                    &self.path,
                    "directory exists without an identity file",
                    e,
                ))
            }
        };
        let recorded: Snapshot = serde_json::from_slice(&raw).map_err(|e| {
            Error::allocation(&self.path, format!("unreadable identity file: {}", e))
        })?;
        if recorded.id != self.snapshot {
            return Err(Error::allocation(
                &self.path,
                format!(
                    "directory belongs to snapshot {}, not {}",
                    recorded.id, self.snapshot
                ),
            ));
        }
        Ok(())
    }
}

/// Held for the duration of a run; removing the file on drop frees the directory.
#[derive(Debug)]
pub struct OwnerLock {
    path: PathBuf,
}

impl Drop for OwnerLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::temp_root;

    fn snapshot(hex: char) -> Snapshot {
        Snapshot {
            id: SnapshotId::parse(&hex.to_string().repeat(40)).expect("id"),
            parent: None,
            tree: "0".repeat(40),
            message: "test".to_string(),
            created_at: Utc::now(),
            reused: false,
        }
    }

    #[test]
    fn concurrent_allocations_agree_on_one_directory() {
        let root = temp_root("alloc_race");
        let allocator = ArtifactAllocator::new(root.join("artifacts"));
        let snap = snapshot('c');
        let barrier = std::sync::Barrier::new(8);

        let paths: Vec<PathBuf> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    scope.spawn(|| {
                        barrier.wait();
                        allocator.allocate(&snap).map(|dir| dir.path().to_path_buf())
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().expect("join").expect("allocate"))
                .collect()
        });

        assert!(paths.iter().all(|p| p == &allocator.path_of(&snap.id)));
        let entries: Vec<String> = fs::read_dir(allocator.root())
            .expect("read root")
            .map(|e| e.expect("entry").file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec![snap.id.to_string()]);
        assert!(allocator.path_of(&snap.id).join(IDENTITY_FILE).is_file());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn allocate_is_idempotent_and_keeps_contents() {
        let root = temp_root("alloc_idem");
        let allocator = ArtifactAllocator::new(root.join("artifacts"));
        let snap = snapshot('a');

        let first = allocator.allocate(&snap).expect("first allocate");
        fs::write(first.path_for("model.bin").expect("path"), b"weights").expect("write");
        let second = allocator.allocate(&snap).expect("second allocate");

        assert_eq!(first.path(), second.path());
        assert_eq!(
            fs::read(second.path().join("model.bin")).expect("read"),
            b"weights"
        );
        assert_eq!(second.outputs().expect("outputs"), vec!["model.bin".to_string()]);
        let staging_left: Vec<_> = fs::read_dir(allocator.root())
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with('.'))
            .collect();
        assert!(staging_left.is_empty());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn distinct_snapshots_get_distinct_directories() {
        let root = temp_root("alloc_distinct");
        let allocator = ArtifactAllocator::new(root.join("artifacts"));
        let a = allocator.allocate(&snapshot('a')).expect("a");
        let b = allocator.allocate(&snapshot('b')).expect("b");
        assert_ne!(a.path(), b.path());
        assert!(allocator.existing(&snapshot('c').id).is_none());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn foreign_identity_is_rejected() {
        let root = temp_root("alloc_foreign");
        let allocator = ArtifactAllocator::new(root.join("artifacts"));
        let a = snapshot('a');
        let dir = allocator.allocate(&a).expect("allocate");
        atomic_write_json_pretty(&dir.path().join(IDENTITY_FILE), &snapshot('b')).expect("tamper");
        let err = allocator.allocate(&a).expect_err("identity mismatch");
        assert!(matches!(err, Error::Allocation { .. }));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn claim_is_exclusive_until_dropped() {
        let root = temp_root("alloc_claim");
        let allocator = ArtifactAllocator::new(root.join("artifacts"));
        let dir = allocator.allocate(&snapshot('a')).expect("allocate");

        let lock = dir.claim("run_1").expect("first claim");
        assert_eq!(dir.owner().expect("owner").run_id, "run_1");
        let err = dir.claim("run_2").expect_err("second claim must fail");
        assert!(err.to_string().contains("run_1"), "{}", err);
        drop(lock);
        let again = dir.claim("run_2").expect("re-claimable");
        drop(again);
        assert!(!dir.release_stale_lock().expect("nothing to release"));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn artifact_names_cannot_escape() {
        let root = temp_root("alloc_escape");
        let allocator = ArtifactAllocator::new(root.join("artifacts"));
        let dir = allocator.allocate(&snapshot('a')).expect("allocate");
        assert!(dir.path_for("../other").is_err());
        assert!(dir.path_for("/etc/passwd").is_err());
        assert!(dir.path_for("ckpt/epoch_1.bin").is_ok());
        let _ = fs::remove_dir_all(root);
    }
}
