//! Persisted settings. Built once at process start and handed by reference to
//! the snapshot store and the artifact allocator.

use crate::{atomic_write_json_pretty, ensure_dir, Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

pub const CONFIG_ENV: &str = "FLINT_CONFIG";
pub const STORAGE_ENV: &str = "FLINT_STORAGE_PATH";

/// What `capture` does when the source tree is identical to the last snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SnapshotPolicy {
    /// Commit anyway; every run gets its own snapshot and directory.
    #[default]
    AlwaysCommit,
    /// Hand back the previous snapshot, and with it the previous directory.
    ReuseUnchanged,
}

impl SnapshotPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SnapshotPolicy::AlwaysCommit => "always-commit",
            SnapshotPolicy::ReuseUnchanged => "reuse-unchanged",
        }
    }
}

impl fmt::Display for SnapshotPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SnapshotPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "always-commit" | "always_commit" => Ok(SnapshotPolicy::AlwaysCommit),
            "reuse-unchanged" | "reuse_unchanged" => Ok(SnapshotPolicy::ReuseUnchanged),
            other => Err(Error::configuration(format!(
                "unknown snapshot policy '{}': expected always-commit or reuse-unchanged",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Root of every experiment's history, artifacts and ledger.
    #[serde(alias = "data_path")]
    pub storage_path: PathBuf,
    #[serde(default)]
    pub snapshot_policy: SnapshotPolicy,
    #[serde(default = "default_author_name")]
    pub author_name: String,
    #[serde(default = "default_author_email")]
    pub author_email: String,
}

fn default_author_name() -> String {
    "flint".to_string()
}

fn default_author_email() -> String {
    "flint@localhost".to_string()
}

/// Outcome of checking a candidate storage path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageCheck {
    pub created: bool,
    pub non_empty: bool,
}

impl Config {
    pub fn new(storage_path: impl Into<PathBuf>) -> Self {
        Self {
            storage_path: storage_path.into(),
            snapshot_policy: SnapshotPolicy::default(),
            author_name: default_author_name(),
            author_email: default_author_email(),
        }
    }

    pub fn with_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshot_policy = policy;
        self
    }

    /// `$FLINT_CONFIG`, else `<user config dir>/flint/config.json`.
    pub fn default_path() -> Result<PathBuf> {
        if let Some(explicit) = std::env::var_os(CONFIG_ENV) {
            return Ok(PathBuf::from(explicit));
        }
        directories::ProjectDirs::from("", "", "flint")
            .map(|dirs| dirs.config_dir().join("config.json"))
            .ok_or_else(|| {
                Error::configuration(format!(
                    "cannot determine a config directory; set {}",
                    CONFIG_ENV
                ))
            })
    }

    /// `Ok(None)` when no file exists yet.
    pub fn load(path: &Path) -> Result<Option<Config>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::configuration(format!(
                    "cannot read config {}: {}",
                    path.display(),
                    e
                )))
            }
        };
        let config: Config = serde_json::from_slice(&raw).map_err(|e| {
            Error::configuration(format!("malformed config {}: {}", path.display(), e))
        })?;
        if config.storage_path.as_os_str().is_empty() {
            return Err(Error::configuration(format!(
                "config {} has an empty storage_path",
                path.display()
            )));
        }
        Ok(Some(config))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json_pretty(path, self).map_err(|e| {
            Error::configuration(format!("cannot write config {}: {}", path.display(), e))
        })
    }

    /// Environment overrides on top of whatever was persisted.
    pub fn apply_env(mut self) -> Self {
        if let Some(storage) = std::env::var_os(STORAGE_ENV) {
            if !storage.is_empty() {
                self.storage_path = PathBuf::from(storage);
            }
        }
        self
    }

    /// Load the persisted config, asking on the terminal the first time.
    pub fn load_or_prompt(path: &Path) -> Result<Config> {
        if let Some(config) = Config::load(path)? {
            return Ok(config);
        }
        let config = Config::new(prompt_storage_path()?);
        config.save(path)?;
        info!(config = %path.display(), storage = %config.storage_path.display(), "wrote new configuration");
        Ok(config)
    }

    /// What a script entry uses: default location, prompt if absent, env on top.
    pub fn resolve() -> Result<Config> {
        let path = Config::default_path()?;
        Ok(Config::load_or_prompt(&path)?.apply_env())
    }
}

fn prompt_storage_path() -> Result<PathBuf> {
    let cwd = std::env::current_dir()
        .map_err(|e| Error::configuration(format!("cannot read current directory: {}", e)))?;
    eprintln!("flint is not configured yet.");
    eprintln!("Your current path is: {}", cwd.display());
    let answer: String = dialoguer::Input::new()
        .with_prompt("Where would you like to store the experiments data?")
        .interact_text()
        .map_err(|e| Error::configuration(format!("no storage path given: {}", e)))?;
    let storage = absolutize(&cwd, Path::new(answer.trim()));
    let check = validate_storage_path(&storage)?;
    if check.non_empty {
        warn!(path = %storage.display(), "the requested storage folder is not empty");
    }
    eprintln!("This path evaluates to: {}", storage.display());
    Ok(storage)
}

pub fn absolutize(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// The path must exist or be creatable, and must accept writes.
pub fn validate_storage_path(path: &Path) -> Result<StorageCheck> {
    let mut created = false;
    if !path.is_dir() {
        if path.exists() {
            return Err(Error::configuration(format!(
                "storage path {} exists and is not a directory",
                path.display()
            )));
        }
        ensure_dir(path).map_err(|e| {
            Error::configuration(format!(
                "storage path {} does not exist and cannot be created: {}",
                path.display(),
                e
            ))
        })?;
        created = true;
    }
    let probe = path.join(format!(".flint-probe-{}", std::process::id()));
    fs::write(&probe, b"").map_err(|e| {
        Error::configuration(format!("storage path {} is not writable: {}", path.display(), e))
    })?;
    let _ = fs::remove_file(&probe);
    let non_empty = fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false);
    Ok(StorageCheck { created, non_empty })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::temp_root;

    #[test]
    fn load_missing_config_is_none() {
        let root = temp_root("cfg_missing");
        assert!(Config::load(&root.join("config.json")).expect("load").is_none());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn save_then_load_keeps_policy_and_defaults_author() {
        let root = temp_root("cfg_roundtrip");
        let path = root.join("config.json");
        let config = Config::new(root.join("store")).with_policy(SnapshotPolicy::ReuseUnchanged);
        config.save(&path).expect("save");
        let loaded = Config::load(&path).expect("load").expect("present");
        assert_eq!(loaded, config);
        assert_eq!(loaded.author_name, "flint");
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn legacy_data_path_key_is_accepted() {
        let root = temp_root("cfg_legacy");
        let path = root.join("config.json");
        fs::write(&path, br#"{"data_path": "/srv/experiments"}"#).expect("write");
        let loaded = Config::load(&path).expect("load").expect("present");
        assert_eq!(loaded.storage_path, PathBuf::from("/srv/experiments"));
        assert_eq!(loaded.snapshot_policy, SnapshotPolicy::AlwaysCommit);
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn malformed_config_is_a_configuration_error() {
        let root = temp_root("cfg_bad");
        let path = root.join("config.json");
        fs::write(&path, b"{not json").expect("write");
        let err = Config::load(&path).expect_err("malformed");
        assert!(matches!(err, Error::Configuration(_)));
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn validate_storage_path_creates_and_reports_contents() {
        let root = temp_root("cfg_storage");
        let fresh = root.join("fresh");
        let check = validate_storage_path(&fresh).expect("creatable");
        assert!(check.created);
        assert!(!check.non_empty);

        fs::write(fresh.join("keep.txt"), b"x").expect("write");
        let again = validate_storage_path(&fresh).expect("writable");
        assert!(!again.created);
        assert!(again.non_empty);

        let file = root.join("plain-file");
        fs::write(&file, b"x").expect("write");
        assert!(validate_storage_path(&file).is_err());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn policy_names_parse() {
        assert_eq!(
            "reuse-unchanged".parse::<SnapshotPolicy>().expect("parse"),
            SnapshotPolicy::ReuseUnchanged
        );
        assert!("sometimes".parse::<SnapshotPolicy>().is_err());
    }
}
