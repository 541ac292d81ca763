//! What extension points can see about the run they are part of.

use flint_core::artifacts::join_inside;
use flint_core::{ArtifactDir, Error, Mode, Result, SnapshotId};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct StepContext {
    mode: Mode,
    run_id: Option<String>,
    artifact: Option<ArtifactDir>,
    scratch: Option<PathBuf>,
    /// Artifact directories of earlier snapshots, nearest first.
    lineage: Vec<PathBuf>,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
}

impl StepContext {
    /// A run with no snapshot and no ledger entry. Outputs go to `scratch`
    /// when given; otherwise `path_for` fails.
    pub fn detached(mode: Mode, scratch: Option<PathBuf>) -> Self {
        Self {
            mode,
            run_id: None,
            artifact: None,
            scratch,
            lineage: Vec::new(),
            input: None,
            output: None,
        }
    }

    pub fn recorded(mode: Mode, run_id: String, artifact: ArtifactDir, lineage: Vec<PathBuf>) -> Self {
        Self {
            mode,
            run_id: Some(run_id),
            artifact: Some(artifact),
            scratch: None,
            lineage,
            input: None,
            output: None,
        }
    }

    pub fn with_eval_paths(mut self, input: Option<PathBuf>, output: Option<PathBuf>) -> Self {
        self.input = input;
        self.output = output;
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn run_id(&self) -> Option<&str> {
        self.run_id.as_deref()
    }

    pub fn snapshot(&self) -> Option<&SnapshotId> {
        self.artifact.as_ref().map(ArtifactDir::snapshot)
    }

    pub fn is_recorded(&self) -> bool {
        self.artifact.is_some()
    }

    /// Where this run writes its outputs, if anywhere.
    pub fn output_dir(&self) -> Option<&Path> {
        match &self.artifact {
            Some(dir) => Some(dir.path()),
            None => self.scratch.as_deref(),
        }
    }

    pub fn path_for(&self, name: impl AsRef<Path>) -> Result<PathBuf> {
        match &self.artifact {
            Some(dir) => dir.path_for(name),
            None => match &self.scratch {
                Some(scratch) => join_inside(scratch, name.as_ref()),
                None => Err(Error::configuration(format!(
                    "detached {} run has no output directory for {}",
                    self.mode,
                    name.as_ref().display()
                ))),
            },
        }
    }

    /// Optional `[INPUT] [OUTPUT]` given on the command line.
    pub fn eval_paths(&self) -> (Option<&Path>, Option<&Path>) {
        (self.input.as_deref(), self.output.as_deref())
    }

    /// First existing `name`, looking in this run's directory and then in the
    /// directories of ancestor snapshots.
    pub fn find_artifact(&self, name: impl AsRef<Path>) -> Option<PathBuf> {
        let name = name.as_ref();
        self.output_dir()
            .into_iter()
            .chain(self.lineage.iter().map(PathBuf::as_path))
            .filter_map(|dir| join_inside(dir, name).ok())
            .find(|candidate| candidate.exists())
    }
}
