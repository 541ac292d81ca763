//! Storage side of flint: the snapshot history, artifact directories and the
//! run ledger, all rooted under one configured `storage_path`.

pub mod artifacts;
pub mod config;
pub mod error;
pub mod ledger;
pub mod library;
pub mod snapshot;

pub use artifacts::{ArtifactAllocator, ArtifactDir, OwnerLock};
pub use config::{Config, SnapshotPolicy};
pub use error::{error_chain, Error, Result};
pub use ledger::{RunGuard, RunLedger, RunRecord, RunStatus};
pub use library::{Experiment, Library};
pub use snapshot::{Snapshot, SnapshotId, SnapshotStore};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::str::FromStr;

/// Which skeleton a run drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Train,
    Test,
    Eval,
}

impl Mode {
    pub const ALL: [Mode; 3] = [Mode::Train, Mode::Test, Mode::Eval];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Test => "test",
            Mode::Eval => "eval",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Mode::ALL
            .into_iter()
            .find(|m| m.as_str() == s)
            .ok_or_else(|| {
                Error::configuration(format!(
                    "unknown mode '{}': expected one of train, test, eval",
                    s
                ))
            })
    }
}

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    fs::create_dir_all(path)
}

/// Write through a temp sibling and rename, so readers never see a torn file.
pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let ts = Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    let tmp = path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

pub fn atomic_write_json_pretty<T: Serialize + ?Sized>(path: &Path, value: &T) -> std::io::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    atomic_write_bytes(path, &bytes)
}

pub fn sha256_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parses_known_names_only() {
        assert_eq!("train".parse::<Mode>().expect("train"), Mode::Train);
        assert_eq!("eval".parse::<Mode>().expect("eval"), Mode::Eval);
        let err = "deploy".parse::<Mode>().expect_err("deploy is not a mode");
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("deploy"));
    }

    #[test]
    fn atomic_write_replaces_whole_file() {
        let root = testutil::temp_root("atomic");
        let path = root.join("nested").join("out.json");
        atomic_write_json_pretty(&path, &serde_json::json!({"a": 1})).expect("first write");
        atomic_write_json_pretty(&path, &serde_json::json!({"b": 2})).expect("second write");
        let value: serde_json::Value =
            serde_json::from_slice(&fs::read(&path).expect("read")).expect("parse");
        assert_eq!(value, serde_json::json!({"b": 2}));
        let leftovers: Vec<_> = fs::read_dir(path.parent().expect("parent"))
            .expect("list")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
            .collect();
        assert!(leftovers.is_empty());
        let _ = fs::remove_dir_all(root);
    }
}
