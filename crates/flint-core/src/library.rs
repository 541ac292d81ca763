//! Layout of experiments under the configured storage path.
//!
//! ```text
//! <storage_path>/<experiment>/history.git
//! <storage_path>/<experiment>/artifacts/<snapshot-id>/
//! <storage_path>/<experiment>/ledger.jsonl
//! ```

use crate::artifacts::{ArtifactAllocator, ArtifactDir};
use crate::config::Config;
use crate::ledger::RunLedger;
use crate::snapshot::{SnapshotId, SnapshotStore};
use crate::{ensure_dir, Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const HISTORY_DIR: &str = "history.git";
pub const ARTIFACTS_DIR: &str = "artifacts";
pub const LEDGER_FILE: &str = "ledger.jsonl";

#[derive(Debug, Clone)]
pub struct Library {
    config: Config,
}

impl Library {
    pub fn open(config: &Config) -> Result<Self> {
        ensure_dir(&config.storage_path).map_err(|e| {
            Error::configuration(format!(
                "cannot create storage path {}: {}",
                config.storage_path.display(),
                e
            ))
        })?;
        Ok(Self {
            config: config.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.config.storage_path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Names of experiments that have a history, sorted.
    pub fn experiments(&self) -> Result<Vec<String>> {
        let entries = fs::read_dir(self.root()).map_err(|e| {
            Error::configuration(format!("cannot list {}: {}", self.root().display(), e))
        })?;
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().join(HISTORY_DIR).is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .filter(|n| validate_name(n).is_ok())
            .collect();
        names.sort();
        Ok(names)
    }

    /// An experiment that has been recorded at least once.
    pub fn experiment(&self, name: &str) -> Result<Experiment> {
        let experiment = self.layout(name)?;
        if !experiment.history_path().is_dir() {
            return Err(Error::configuration(format!(
                "no experiment named '{}' under {}",
                name,
                self.root().display()
            )));
        }
        Ok(experiment)
    }

    pub fn get_or_create(&self, name: &str) -> Result<Experiment> {
        let experiment = self.layout(name)?;
        ensure_dir(&experiment.root).map_err(|e| {
            Error::configuration(format!("cannot create {}: {}", experiment.root.display(), e))
        })?;
        Ok(experiment)
    }

    fn layout(&self, name: &str) -> Result<Experiment> {
        validate_name(name)?;
        Ok(Experiment {
            name: name.to_string(),
            root: self.root().join(name),
            config: self.config.clone(),
        })
    }
}

/// Experiment names become directory names, so keep them to one plain segment.
pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if ok {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "invalid experiment name '{}': use letters, digits, '-', '_' or '.'",
            name
        )))
    }
}

#[derive(Debug, Clone)]
pub struct Experiment {
    name: String,
    root: PathBuf,
    config: Config,
}

impl Experiment {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn history_path(&self) -> PathBuf {
        self.root.join(HISTORY_DIR)
    }

    pub fn history(&self) -> Result<SnapshotStore> {
        SnapshotStore::open(&self.history_path(), &self.config)
    }

    pub fn allocator(&self) -> ArtifactAllocator {
        ArtifactAllocator::new(self.root.join(ARTIFACTS_DIR))
    }

    pub fn ledger(&self) -> RunLedger {
        RunLedger::open(self.root.join(LEDGER_FILE), self.name.clone())
    }

    /// Artifact directories of `id` and then of its ancestors, skipping
    /// snapshots that never got one.
    pub fn lineage_dirs(&self, store: &SnapshotStore, id: &SnapshotId) -> Result<Vec<ArtifactDir>> {
        let allocator = self.allocator();
        let mut lineage = vec![id.clone()];
        lineage.extend(store.ancestors(id)?);
        Ok(lineage
            .iter()
            .filter_map(|snap| allocator.existing(snap))
            .collect())
    }
}
