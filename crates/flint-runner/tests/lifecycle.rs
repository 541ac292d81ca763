use flint_core::{Library, RunStatus};
use flint_runner::{
    Backend, Config, Error, Extensions, Invocation, Loss, Mode, Model, Optimizer, ScriptEntry,
    Settings, Task,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Barrier};

#[derive(Debug, Default)]
struct Scalar {
    w: f64,
    grad: f64,
    mode: Option<Mode>,
    loaded: bool,
}

impl Model for Scalar {
    fn set_mode(&mut self, mode: Mode) {
        self.mode = Some(mode);
    }
}

struct Squared {
    value: f64,
    dw: f64,
}

impl Loss<Scalar> for Squared {
    fn value(&self) -> f64 {
        self.value
    }

    fn backward(&self, model: &mut Scalar) -> anyhow::Result<()> {
        model.grad += self.dw;
        Ok(())
    }
}

struct Sgd {
    lr: f64,
}

impl Optimizer<Scalar> for Sgd {
    fn zero_grad(&mut self, model: &mut Scalar) -> anyhow::Result<()> {
        model.grad = 0.0;
        Ok(())
    }

    fn step(&mut self, model: &mut Scalar) -> anyhow::Result<()> {
        model.w -= self.lr * model.grad;
        Ok(())
    }
}

enum Toy {}

impl Backend for Toy {
    type Model = Scalar;
    type Sample = (f64, f64);
    type Output = f64;
    type Criterion = ();
    type Loss = Squared;
    type Optimizer = Sgd;
    type Metric = ();
}

fn points() -> Vec<(f64, f64)> {
    vec![(1.0, 2.0), (2.0, 4.0), (3.0, 6.0)]
}

fn extensions() -> Extensions<Toy> {
    Extensions::<Toy>::new()
        .training_data(|_ctx| Ok(points()))
        .testing_data(|_ctx| Ok(points()))
        .criterion(|_model| Ok(()))
        .optimizer(|_model| Ok(Sgd { lr: 0.02 }))
        .forward(|model: &mut Scalar, sample: &(f64, f64)| Ok(model.w * sample.0))
        .compute_loss(|_criterion, output: &f64, sample: &(f64, f64)| {
            let diff = output - sample.1;
            Ok(Squared {
                value: diff * diff,
                dw: 2.0 * diff * sample.0,
            })
        })
        .after_training(|model: &mut Scalar, ctx| {
            if ctx.output_dir().is_some() {
                let path = ctx.path_for("model.json")?;
                fs::write(path, serde_json::json!({ "w": model.w }).to_string())?;
            }
            Ok(())
        })
        .metric(|| Ok(()))
        .load_model(|model: &mut Scalar, ctx| {
            let path = ctx
                .find_artifact("model.json")
                .ok_or_else(|| anyhow::anyhow!("no trained model found"))?;
            let saved: serde_json::Value = serde_json::from_slice(&fs::read(path)?)?;
            model.w = saved["w"].as_f64().unwrap_or_default();
            model.loaded = true;
            Ok(())
        })
        .compute_metrics(|_metric, output: &f64, sample: &(f64, f64)| {
            let mut values = BTreeMap::new();
            values.insert("abs_error".to_string(), (output - sample.1).abs());
            Ok(values)
        })
}

fn task() -> Task<Toy> {
    Task::new(Scalar::default(), extensions()).with_settings(Settings {
        passes: 50,
        ..Settings::default()
    })
}

struct Workspace {
    root: PathBuf,
    source: PathBuf,
    config: Config,
}

impl Workspace {
    fn new(tag: &str) -> Self {
        let root = std::env::temp_dir().join(format!(
            "flint_lifecycle_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        let source = root.join("toy-src");
        fs::create_dir_all(source.join("src")).expect("source dir");
        fs::write(source.join("src").join("lib.rs"), "pub fn fit() {}\n").expect("write");
        let config = Config::new(root.join("store"));
        Self {
            root,
            source,
            config,
        }
    }

    fn entry(&self, args: &[&str]) -> Invocation {
        let mut argv = vec!["toy"];
        argv.extend_from_slice(args);
        Invocation::Script(
            ScriptEntry::new("toy", &self.source)
                .with_args(argv)
                .with_config(self.config.clone()),
        )
    }

    fn storage(&self) -> &Path {
        &self.config.storage_path
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

#[test]
fn script_train_records_snapshot_directory_and_success() {
    let ws = Workspace::new("train");
    let summary = task()
        .main(ws.entry(&["train", "-m", "first fit"]))
        .expect("train run")
        .expect("recorded run returns a summary");

    assert_eq!(summary.status, RunStatus::Success);
    assert_eq!(summary.mode, Mode::Train);
    assert!(summary.artifact_dir.join("model.json").is_file());
    assert!(summary.artifact_dir.join("metrics-train.json").is_file());
    assert!(!summary.artifact_dir.join(".owner.lock").exists());
    assert_eq!(
        summary.metrics["loss_data"].as_array().expect("loss series").len(),
        50
    );

    let library = Library::open(&ws.config).expect("library");
    let experiment = library.experiment("toy").expect("experiment exists");
    let snapshots = experiment.history().expect("history").list().expect("list");
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].message, "first fit");
    assert_eq!(snapshots[0].id, summary.snapshot);
    assert_eq!(
        summary.artifact_dir,
        experiment.allocator().path_of(&summary.snapshot)
    );

    let records = experiment.ledger().records().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].run_id, summary.run_id);
    assert_eq!(records[0].status, RunStatus::Success);
    assert!(records[0].finished_at.is_some());
}

#[test]
fn test_run_loads_model_saved_under_an_earlier_snapshot() {
    let ws = Workspace::new("test_after_train");
    let trained = task()
        .main(ws.entry(&["train"]))
        .expect("train")
        .expect("summary");
    let tested = task()
        .main(ws.entry(&["test"]))
        .expect("test finds the trained model")
        .expect("summary");

    assert_ne!(trained.snapshot, tested.snapshot);
    assert_ne!(trained.artifact_dir, tested.artifact_dir);
    let error = tested.metrics["abs_error"].as_f64().expect("average");
    assert!(error < 0.1, "abs_error {}", error);
    assert_eq!(
        tested.metrics["abs_error_data"].as_array().expect("raw").len(),
        3
    );

    let library = Library::open(&ws.config).expect("library");
    let records = library
        .experiment("toy")
        .expect("experiment")
        .ledger()
        .records()
        .expect("records");
    let modes: Vec<Mode> = records.iter().map(|r| r.mode).collect();
    assert_eq!(modes, vec![Mode::Train, Mode::Test]);
    assert!(records.iter().all(|r| r.status == RunStatus::Success));
}

#[test]
fn imported_entry_and_direct_calls_leave_no_trace() {
    let ws = Workspace::new("imported");
    let task = task();
    assert!(task.main(Invocation::Imported).expect("no-op").is_none());
    let log = task.train().expect("direct train");
    assert_eq!(log.all("loss").len(), 50);
    task.with_model(|model| assert!((model.w - 2.0).abs() < 1e-3, "w {}", model.w));
    assert!(!ws.storage().exists());
}

#[test]
fn invalid_or_missing_mode_fails_before_any_snapshot() {
    let ws = Workspace::new("bad_mode");
    for args in [&["deploy"][..], &[][..]] {
        let err = task().main(ws.entry(args)).expect_err("bad mode");
        assert!(matches!(err, Error::Configuration(_)), "{}", err);
    }
    assert!(!ws.storage().exists());
}

#[test]
fn missing_extension_point_fails_before_any_snapshot() {
    let ws = Workspace::new("missing_point");
    let partial = Extensions::<Toy>::new().testing_data(|_ctx| Ok(points()));
    let err = Task::new(Scalar::default(), partial)
        .main(ws.entry(&["test"]))
        .expect_err("incomplete test wiring");
    match err {
        Error::Configuration(msg) => {
            assert!(msg.contains("metric, forward, compute_metrics"), "{}", msg)
        }
        other => panic!("expected configuration error, got {other}"),
    }
    assert!(!ws.storage().exists());
}

#[test]
fn failing_run_is_recorded_exactly_once_as_failed() {
    let ws = Workspace::new("failure");
    let broken = extensions().forward(|_model: &mut Scalar, sample: &(f64, f64)| {
        if sample.0 > 2.5 {
            anyhow::bail!("diverged at x={}", sample.0)
        }
        Ok(sample.0)
    });
    let err = Task::new(Scalar::default(), broken)
        .main(ws.entry(&["train"]))
        .expect_err("forward fails");
    assert!(matches!(err, Error::Execution { point: "forward", .. }), "{}", err);

    let library = Library::open(&ws.config).expect("library");
    let experiment = library.experiment("toy").expect("snapshot was taken");
    let records = experiment.ledger().records().expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, RunStatus::Failed);
    let message = records[0].error.as_deref().expect("error recorded");
    assert!(message.contains("forward"), "{}", message);
    assert!(message.contains("diverged"), "{}", message);
    assert!(!records[0].artifact_dir.join(".owner.lock").exists());
}

#[test]
fn reuse_policy_shares_snapshot_and_directory_for_unchanged_source() {
    let ws = Workspace::new("reuse");
    let first = task()
        .main(ws.entry(&["train", "--policy", "reuse-unchanged"]))
        .expect("first")
        .expect("summary");
    let second = task()
        .main(ws.entry(&["train", "--policy", "reuse-unchanged"]))
        .expect("second")
        .expect("summary");
    assert_eq!(first.snapshot, second.snapshot);
    assert_eq!(first.artifact_dir, second.artifact_dir);
    assert!(!first.reused_snapshot);
    assert!(second.reused_snapshot);
    assert_ne!(first.run_id, second.run_id);

    let third = task()
        .main(ws.entry(&["train"]))
        .expect("default policy")
        .expect("summary");
    assert_ne!(third.snapshot, first.snapshot);
}

#[test]
fn busy_directory_fails_the_run_and_records_it() {
    let ws = Workspace::new("busy_dir");
    let first = task()
        .main(ws.entry(&["train", "--policy", "reuse-unchanged"]))
        .expect("first")
        .expect("summary");

    let library = Library::open(&ws.config).expect("library");
    let experiment = library.experiment("toy").expect("experiment");
    let dir = experiment
        .allocator()
        .existing(&first.snapshot)
        .expect("allocated");
    let held = dir.claim("run_elsewhere").expect("claim");

    let err = task()
        .main(ws.entry(&["test", "--policy", "reuse-unchanged"]))
        .expect_err("directory is busy");
    assert!(matches!(err, Error::Allocation { .. }), "{}", err);
    assert!(err.to_string().contains("run_elsewhere"), "{}", err);

    let records = experiment.ledger().records().expect("records");
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].snapshot, first.snapshot);
    assert_eq!(records[1].mode, Mode::Test);
    assert_eq!(records[1].status, RunStatus::Failed);
    assert!(!dir.path().join("metrics-test.json").exists());

    drop(held);
    assert!(!dir.path().join(".owner.lock").exists());
}

#[test]
fn overlapping_train_and_test_is_a_state_conflict() {
    let barrier = Arc::new(Barrier::new(2));
    let gate = barrier.clone();
    let ext = extensions()
        .training_data(move |_ctx| {
            gate.wait();
            gate.wait();
            Ok(points())
        })
        .load_model(|model: &mut Scalar, _ctx| {
            model.loaded = true;
            Ok(())
        });
    let task = Task::new(Scalar::default(), ext);

    std::thread::scope(|scope| {
        let training = scope.spawn(|| task.train());
        barrier.wait();
        let err = task.test().expect_err("test while training");
        assert!(
            matches!(
                err,
                Error::StateConflict {
                    active: Mode::Train,
                    requested: Mode::Test
                }
            ),
            "{}",
            err
        );
        barrier.wait();
        training.join().expect("join").expect("training finishes");
    });

    task.with_model(|model| {
        assert!(!model.loaded);
        assert_eq!(model.mode, Some(Mode::Train));
    });
    task.test().expect("test once training is done");
}
