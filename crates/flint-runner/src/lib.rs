//! Task orchestration. Running an experiment's binary through [`script_main!`]
//! is a recorded run; calling [`Task::train`] and friends directly is not.

pub mod backend;
pub mod context;
pub mod metrics;
pub mod skeleton;

pub use anyhow;
pub use flint_core;
pub use serde_json;

pub use backend::{Backend, DataSource, Loss, Model, Optimizer};
pub use context::StepContext;
pub use flint_core::{Config, Error, Mode, Result, RunStatus, SnapshotId, SnapshotPolicy};
pub use metrics::MetricLog;
pub use skeleton::{
    EvalSkeleton, ExtensionPoint, Extensions, PassReport, Settings, Skeleton, TestSkeleton,
    TrainSkeleton,
};

use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use flint_core::{atomic_write_json_pretty, error_chain, ArtifactDir, Experiment, Library, SnapshotStore};
use serde::Serialize;
use serde_json::{json, Value};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

pub const LOG_ENV: &str = "FLINT_LOG";

#[derive(Debug, Clone)]
pub enum Invocation {
    Script(ScriptEntry),
    Imported,
}

#[derive(Debug, Clone)]
pub struct ScriptEntry {
    pub name: String,
    /// Directory whose contents are snapshotted.
    pub source: PathBuf,
    /// Includes the program name.
    pub args: Vec<OsString>,
    pub config: Option<Config>,
}

impl ScriptEntry {
    pub fn new(name: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        let name = name.into();
        Self {
            args: vec![OsString::from(&name)],
            name,
            source: source.into(),
            config: None,
        }
    }

    pub fn from_env(name: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        let mut entry = Self::new(name, source);
        entry.args = std::env::args_os().collect();
        entry
    }

    pub fn with_args<I, T>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    #[value(name = "train")]
    Train,
    #[value(name = "test")]
    Test,
    #[value(name = "eval")]
    Eval,
}

impl From<ModeArg> for Mode {
    fn from(value: ModeArg) -> Self {
        match value {
            ModeArg::Train => Mode::Train,
            ModeArg::Test => Mode::Test,
            ModeArg::Eval => Mode::Eval,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum PolicyArg {
    #[value(name = "always-commit")]
    AlwaysCommit,
    #[value(name = "reuse-unchanged")]
    ReuseUnchanged,
}

impl From<PolicyArg> for SnapshotPolicy {
    fn from(value: PolicyArg) -> Self {
        match value {
            PolicyArg::AlwaysCommit => SnapshotPolicy::AlwaysCommit,
            PolicyArg::ReuseUnchanged => SnapshotPolicy::ReuseUnchanged,
        }
    }
}

#[derive(Parser, Debug)]
#[command(about = "Run one recorded step of this experiment")]
struct ScriptArgs {
    #[arg(value_enum)]
    mode: ModeArg,
    /// Input path handed to eval.
    input: Option<PathBuf>,
    /// Output path handed to eval.
    output: Option<PathBuf>,
    /// Message stored with the snapshot.
    #[arg(short, long)]
    message: Option<String>,
    #[arg(long, value_enum)]
    policy: Option<PolicyArg>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub experiment: String,
    pub snapshot: SnapshotId,
    pub reused_snapshot: bool,
    pub artifact_dir: PathBuf,
    pub mode: Mode,
    pub status: RunStatus,
    pub metrics: Value,
}

pub struct Task<B: Backend> {
    model: Mutex<B::Model>,
    extensions: Extensions<B>,
    settings: Settings,
    active: Mutex<Option<Mode>>,
}

impl<B: Backend> Task<B> {
    pub fn new(model: B::Model, extensions: Extensions<B>) -> Self {
        Self {
            model: Mutex::new(model),
            extensions,
            settings: Settings::default(),
            active: Mutex::new(None),
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn extensions(&self) -> &Extensions<B> {
        &self.extensions
    }

    pub fn with_model<R>(&self, f: impl FnOnce(&B::Model) -> R) -> R {
        f(&self.lock_model())
    }

    pub fn into_model(self) -> B::Model {
        self.model.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    /// Unrecorded training: no snapshot, no directory, no ledger entry.
    pub fn train(&self) -> Result<MetricLog> {
        self.run_in(&StepContext::detached(Mode::Train, None))
    }

    pub fn test(&self) -> Result<MetricLog> {
        self.run_in(&StepContext::detached(Mode::Test, None))
    }

    pub fn eval(&self) -> Result<MetricLog> {
        self.run_in(&StepContext::detached(Mode::Eval, None))
    }

    /// Run the skeleton for `ctx.mode()`. Fails with a state conflict while
    /// another operation on this task is in progress.
    pub fn run_in(&self, ctx: &StepContext) -> Result<MetricLog> {
        let _activity = self.enter(ctx.mode())?;
        let mut model = self.lock_model();
        skeleton::run(ctx.mode(), &self.extensions, &mut *model, &self.settings, ctx)
    }

    /// Entry point. A script entry performs a recorded run and returns its
    /// summary; an imported entry does nothing and returns `None`.
    pub fn main(&self, invocation: Invocation) -> Result<Option<RunSummary>> {
        match invocation {
            Invocation::Imported => {
                debug!("experiment imported, not running");
                Ok(None)
            }
            Invocation::Script(entry) => self.run_script(entry),
        }
    }

    fn run_script(&self, entry: ScriptEntry) -> Result<Option<RunSummary>> {
        let args = match ScriptArgs::try_parse_from(&entry.args) {
            Ok(args) => args,
            Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => {
                let _ = e.print();
                return Ok(None);
            }
            Err(e) => return Err(Error::configuration(e.to_string().trim_end().to_string())),
        };
        let mode = Mode::from(args.mode);
        skeleton::validate(mode, &self.extensions, &self.settings)?;

        let mut config = match entry.config {
            Some(config) => config,
            None => Config::resolve()?,
        };
        if let Some(policy) = args.policy {
            config.snapshot_policy = policy.into();
        }
        let library = Library::open(&config)?;
        let experiment = library.get_or_create(&entry.name)?;
        let store = experiment.history()?;
        let message = args
            .message
            .clone()
            .unwrap_or_else(|| format!("{} {}", entry.name, mode));
        let snapshot = store.capture(&entry.source, &message)?;
        let dir = experiment.allocator().allocate(&snapshot)?;

        let mut guard = experiment.ledger().begin(&snapshot.id, dir.path(), mode)?;
        let run_id = guard.run_id().to_string();
        let recorded = self.run_recorded(
            &experiment,
            &store,
            &dir,
            &run_id,
            mode,
            (args.input, args.output),
        );

        match recorded {
            Ok(log) => {
                guard.complete(RunStatus::Success, None)?;
                info!(run_id = %run_id, dir = %dir.path().display(), "recorded run succeeded");
                Ok(Some(RunSummary {
                    run_id,
                    experiment: entry.name,
                    snapshot: snapshot.id,
                    reused_snapshot: snapshot.reused,
                    artifact_dir: dir.path().to_path_buf(),
                    mode,
                    status: RunStatus::Success,
                    metrics: log.summary(),
                }))
            }
            Err(e) => {
                if let Err(ledger_err) = guard.complete(RunStatus::Failed, Some(error_chain(&e))) {
                    warn!(run_id = %run_id, error = %ledger_err, "could not record failure");
                }
                Err(e)
            }
        }
    }

    fn run_recorded(
        &self,
        experiment: &Experiment,
        store: &SnapshotStore,
        dir: &ArtifactDir,
        run_id: &str,
        mode: Mode,
        (input, output): (Option<PathBuf>, Option<PathBuf>),
    ) -> Result<MetricLog> {
        let _owner = dir.claim(run_id)?;
        let lineage = experiment
            .lineage_dirs(store, dir.snapshot())?
            .into_iter()
            .filter(|d| d.snapshot() != dir.snapshot())
            .map(|d| d.path().to_path_buf())
            .collect();
        let ctx = StepContext::recorded(mode, run_id.to_string(), dir.clone(), lineage)
            .with_eval_paths(input, output);

        let log = self.run_in(&ctx)?;
        if !log.is_empty() {
            let path = dir.path_for(format!("metrics-{}.json", mode))?;
            let payload = json!({
                "run_id": run_id,
                "mode": mode,
                "metrics": log.summary(),
            });
            atomic_write_json_pretty(&path, &payload)
                .map_err(|e| Error::allocation_io(&path, "cannot write metrics", e))?;
        }
        Ok(log)
    }

    fn enter(&self, mode: Mode) -> Result<Activity<'_>> {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = *active {
            return Err(Error::StateConflict {
                active: current,
                requested: mode,
            });
        }
        *active = Some(mode);
        Ok(Activity { slot: &self.active })
    }

    fn lock_model(&self) -> MutexGuard<'_, B::Model> {
        self.model.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Activity<'a> {
    slot: &'a Mutex<Option<Mode>>,
}

impl Drop for Activity<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Generate `fn main` for an experiment binary.
///
/// ```ignore
/// flint_runner::script_main!(linear_fit::build_task());
/// ```
///
/// The experiment name is the package name and the snapshotted source is the
/// package directory as it is when the binary runs. Rebuild after editing the
/// source, or the snapshot records code the running binary was not built from.
#[macro_export]
macro_rules! script_main {
    ($task:expr) => {
        fn main() -> $crate::anyhow::Result<()> {
            $crate::init_tracing();
            let task = $task;
            let entry = $crate::ScriptEntry::from_env(
                env!("CARGO_PKG_NAME"),
                env!("CARGO_MANIFEST_DIR"),
            );
            if let Some(summary) = task.main($crate::Invocation::Script(entry))? {
                println!("{}", $crate::serde_json::to_string_pretty(&summary)?);
            }
            Ok(())
        }
    };
}
