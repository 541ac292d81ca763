use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use flint_core::config::validate_storage_path;
use flint_core::{Config, Experiment, Library, RunRecord, Snapshot, SnapshotId, SnapshotPolicy, SnapshotStore};
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "flint", version, about = "Inspect recorded flint experiments")]
struct Cli {
    /// Config file to use instead of the default location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
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

#[derive(Subcommand)]
enum Commands {
    /// Write the config file; prompts for the storage path when not given.
    Init {
        #[arg(long)]
        storage: Option<PathBuf>,
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,
        #[arg(long)]
        json: bool,
    },
    /// List experiments under the storage path.
    Experiments {
        #[arg(long)]
        json: bool,
    },
    /// List snapshots of an experiment, newest first.
    Snapshots {
        experiment: String,
        #[arg(long)]
        json: bool,
    },
    /// List recorded runs of an experiment.
    Runs {
        experiment: String,
        #[arg(long)]
        json: bool,
    },
    /// Describe one snapshot: files, outputs and runs.
    Show {
        experiment: String,
        snapshot: String,
        #[arg(long)]
        json: bool,
    },
    /// Write a snapshot's source files into an empty directory.
    Checkout {
        experiment: String,
        snapshot: String,
        dest: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Remove an owner lock left behind by a killed run.
    Release {
        experiment: String,
        snapshot: String,
        #[arg(long)]
        yes: bool,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.config, cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                let code = err
                    .downcast_ref::<flint_core::Error>()
                    .map(|e| e.kind())
                    .unwrap_or("command_failed");
                emit_json(&json_error(code, format!("{:#}", err), json!({})));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("FLINT_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn run_command(config_path: Option<PathBuf>, command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Init {
            storage,
            policy,
            json,
        } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let mut config = match storage {
                Some(storage) => {
                    let cwd = std::env::current_dir().context("reading current directory")?;
                    let storage = flint_core::config::absolutize(&cwd, &storage);
                    let check = validate_storage_path(&storage)?;
                    if check.non_empty && !json {
                        eprintln!("warning: {} is not empty", storage.display());
                    }
                    Config::new(storage)
                }
                None => Config::load_or_prompt(&path)?,
            };
            if let Some(policy) = policy {
                config.snapshot_policy = policy.into();
            }
            config.save(&path)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "init",
                    "config_path": path.display().to_string(),
                    "config": config,
                })));
            }
            println!("config: {}", path.display());
            println!("storage_path: {}", config.storage_path.display());
            println!("snapshot_policy: {}", config.snapshot_policy);
        }
        Commands::Experiments { json } => {
            let library = open_library(config_path)?;
            let names = library.experiments()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "experiments",
                    "storage_path": library.root().display().to_string(),
                    "experiments": names,
                })));
            }
            if names.is_empty() {
                println!("no experiments under {}", library.root().display());
            }
            for name in names {
                println!("{}", name);
            }
        }
        Commands::Snapshots { experiment, json } => {
            let experiment = open_library(config_path)?.experiment(&experiment)?;
            let store = experiment.history()?;
            let snapshots = store.list()?;
            if json {
                let items: Vec<Value> = snapshots
                    .iter()
                    .map(|s| snapshot_to_json(&experiment, s))
                    .collect();
                return Ok(Some(json!({
                    "ok": true,
                    "command": "snapshots",
                    "experiment": experiment.name(),
                    "snapshots": items,
                })));
            }
            for snapshot in &snapshots {
                let has_dir = experiment.allocator().existing(&snapshot.id).is_some();
                println!(
                    "{}  {}  {}{}",
                    snapshot.id.short(),
                    snapshot.created_at.format("%Y-%m-%d %H:%M:%S"),
                    first_line(&snapshot.message),
                    if has_dir { "" } else { "  (no artifacts)" }
                );
            }
        }
        Commands::Runs { experiment, json } => {
            let experiment = open_library(config_path)?.experiment(&experiment)?;
            let records = experiment.ledger().records()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "runs",
                    "experiment": experiment.name(),
                    "runs": records,
                })));
            }
            for record in &records {
                print_record(record);
            }
        }
        Commands::Show {
            experiment,
            snapshot,
            json,
        } => {
            let experiment = open_library(config_path)?.experiment(&experiment)?;
            let store = experiment.history()?;
            let snapshot = store.resolve(&find_snapshot(&store, &snapshot)?)?;
            let files = store.files(&snapshot.id)?;
            let dir = experiment.allocator().existing(&snapshot.id);
            let outputs = match &dir {
                Some(dir) => dir.outputs()?,
                None => Vec::new(),
            };
            let owner = dir.as_ref().and_then(|d| d.owner());
            let runs: Vec<RunRecord> = experiment
                .ledger()
                .records()?
                .into_iter()
                .filter(|r| r.snapshot == snapshot.id)
                .collect();
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "show",
                    "snapshot": snapshot_to_json(&experiment, &snapshot),
                    "files": files.iter().map(|f| f.display().to_string()).collect::<Vec<_>>(),
                    "outputs": outputs,
                    "owner": owner,
                    "runs": runs,
                })));
            }
            println!("snapshot: {}", snapshot.id);
            if let Some(parent) = &snapshot.parent {
                println!("parent: {}", parent);
            }
            println!("created_at: {}", snapshot.created_at.to_rfc3339());
            println!("message: {}", snapshot.message.trim_end());
            match &dir {
                Some(dir) => println!("artifact_dir: {}", dir.path().display()),
                None => println!("artifact_dir: none"),
            }
            if let Some(owner) = owner {
                println!("in_use_by: {} (pid {})", owner.run_id, owner.pid);
            }
            println!("files:");
            for file in &files {
                println!("  {}", file.display());
            }
            println!("outputs:");
            for output in &outputs {
                println!("  {}", output);
            }
            println!("runs:");
            for record in &runs {
                print_record(record);
            }
        }
        Commands::Checkout {
            experiment,
            snapshot,
            dest,
            json,
        } => {
            let experiment = open_library(config_path)?.experiment(&experiment)?;
            let store = experiment.history()?;
            let id = find_snapshot(&store, &snapshot)?;
            let count = store.materialize(&id, &dest)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "checkout",
                    "snapshot": id,
                    "dest": dest.display().to_string(),
                    "files": count,
                })));
            }
            println!("wrote {} files of {} to {}", count, id.short(), dest.display());
        }
        Commands::Release {
            experiment,
            snapshot,
            yes,
            json,
        } => {
            let experiment = open_library(config_path)?.experiment(&experiment)?;
            let store = experiment.history()?;
            let id = find_snapshot(&store, &snapshot)?;
            let dir = experiment
                .allocator()
                .existing(&id)
                .ok_or_else(|| anyhow!("snapshot {} has no artifact directory", id.short()))?;
            let owner = dir.owner();
            if let Some(owner) = &owner {
                if !yes {
                    if json {
                        bail!("refusing to release a lock held by {} without --yes", owner.run_id);
                    }
                    let confirmed = dialoguer::Confirm::new()
                        .with_prompt(format!(
                            "Release the lock held by {} (pid {})? Only do this if that process is gone",
                            owner.run_id, owner.pid
                        ))
                        .default(false)
                        .interact()?;
                    if !confirmed {
                        println!("left the lock in place");
                        return Ok(None);
                    }
                }
            }
            let released = dir.release_stale_lock()?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "release",
                    "snapshot": id,
                    "released": released,
                    "previous_owner": owner,
                })));
            }
            if released {
                println!("released {}", dir.path().display());
            } else {
                println!("{} was not locked", dir.path().display());
            }
        }
    }
    Ok(None)
}

fn open_library(config_path: Option<PathBuf>) -> Result<Library> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };
    let config = Config::load(&path)?
        .ok_or_else(|| anyhow!("flint is not configured ({} missing); run `flint init`", path.display()))?
        .apply_env();
    Ok(Library::open(&config)?)
}

/// Full ids as-is; shorter input must be an unambiguous prefix.
fn find_snapshot(store: &SnapshotStore, raw: &str) -> Result<SnapshotId> {
    let raw = raw.trim().to_ascii_lowercase();
    if raw.len() == 40 {
        return Ok(SnapshotId::parse(&raw)?);
    }
    if raw.len() < 4 || !raw.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("'{}' is not a snapshot id or a prefix of at least 4 hex characters", raw);
    }
    let matches: Vec<SnapshotId> = store
        .list()?
        .into_iter()
        .map(|s| s.id)
        .filter(|id| id.as_str().starts_with(&raw))
        .collect();
    match matches.as_slice() {
        [only] => Ok(only.clone()),
        [] => bail!("no snapshot starts with {}", raw),
        _ => bail!("{} matches {} snapshots; use more characters", raw, matches.len()),
    }
}

fn snapshot_to_json(experiment: &Experiment, snapshot: &Snapshot) -> Value {
    json!({
        "id": snapshot.id,
        "parent": snapshot.parent,
        "message": snapshot.message,
        "created_at": snapshot.created_at,
        "artifact_dir": experiment
            .allocator()
            .existing(&snapshot.id)
            .map(|d| d.path().display().to_string()),
    })
}

fn print_record(record: &RunRecord) {
    let finished = record
        .finished_at
        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{}  {:5}  {:7}  {}  {}  {}",
        record.run_id,
        record.mode.as_str(),
        record.status.to_string(),
        record.snapshot.short(),
        record.started_at.format("%Y-%m-%d %H:%M:%S"),
        finished
    );
    if let Some(error) = &record.error {
        println!("    error: {}", error);
    }
}

fn first_line(message: &str) -> &str {
    message.lines().next().unwrap_or("")
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\",\"details\":{{}}}}}}"
        ),
    }
}

fn json_error(code: &str, message: String, details: Value) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message,
            "details": details
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Init { json, .. }
        | Commands::Experiments { json }
        | Commands::Snapshots { json, .. }
        | Commands::Runs { json, .. }
        | Commands::Show { json, .. }
        | Commands::Checkout { json, .. }
        | Commands::Release { json, .. } => *json,
    }
}
