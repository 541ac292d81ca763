//! Fits `y = a * x + b` by per-sample gradient descent.
//!
//! The binary in `main.rs` is the recorded entry point; anything that depends
//! on this crate and calls [`build_task`] gets an unrecorded task.

use anyhow::{bail, Context};
use flint_runner::{
    Backend, Extensions, Loss, Mode, Model, Optimizer, PassReport, Settings, StepContext, Task,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

pub const MODEL_FILE: &str = "model.json";
pub const PREDICTIONS_FILE: &str = "predictions.csv";
const CHECKPOINT_EVERY: usize = 10;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Line {
    pub a: f64,
    pub b: f64,
    grad_a: f64,
    grad_b: f64,
    training: bool,
}

impl Line {
    pub fn predict(&self, x: f64) -> f64 {
        self.a * x + self.b
    }

    fn save(&self, path: &Path) -> anyhow::Result<()> {
        let body = json!({ "a": self.a, "b": self.b });
        fs::write(path, serde_json::to_vec_pretty(&body)?)
            .with_context(|| format!("writing {}", path.display()))
    }

    fn load(&mut self, path: &Path) -> anyhow::Result<()> {
        let raw = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
        let saved: serde_json::Value = serde_json::from_slice(&raw)?;
        match (saved["a"].as_f64(), saved["b"].as_f64()) {
            (Some(a), Some(b)) => {
                self.a = a;
                self.b = b;
                Ok(())
            }
            _ => bail!("{} does not hold a fitted line", path.display()),
        }
    }
}

impl Model for Line {
    fn set_mode(&mut self, mode: Mode) {
        self.training = mode == Mode::Train;
    }
}

pub struct SquaredError {
    value: f64,
    residual: f64,
    x: f64,
}

impl Loss<Line> for SquaredError {
    fn value(&self) -> f64 {
        self.value
    }

    fn backward(&self, model: &mut Line) -> anyhow::Result<()> {
        model.grad_a += 2.0 * self.residual * self.x;
        model.grad_b += 2.0 * self.residual;
        Ok(())
    }
}

pub struct Sgd {
    pub learning_rate: f64,
}

impl Optimizer<Line> for Sgd {
    fn zero_grad(&mut self, model: &mut Line) -> anyhow::Result<()> {
        model.grad_a = 0.0;
        model.grad_b = 0.0;
        Ok(())
    }

    fn step(&mut self, model: &mut Line) -> anyhow::Result<()> {
        if !model.training {
            bail!("optimizer stepped outside training");
        }
        model.a -= self.learning_rate * model.grad_a;
        model.b -= self.learning_rate * model.grad_b;
        Ok(())
    }
}

pub enum LinearFit {}

impl Backend for LinearFit {
    type Model = Line;
    /// `(x, y)`; eval samples carry `NaN` for `y`.
    type Sample = (f64, f64);
    type Output = f64;
    type Criterion = ();
    type Loss = SquaredError;
    type Optimizer = Sgd;
    type Metric = f64;
}

/// Points on `y = 3x - 1` with a small deterministic wobble.
pub fn synthetic(count: usize, offset: f64) -> Vec<(f64, f64)> {
    (0..count)
        .map(|i| {
            let x = offset + i as f64 / count as f64;
            let wobble = ((i * 7919) % 13) as f64 / 13.0 - 0.5;
            (x, 3.0 * x - 1.0 + 0.01 * wobble)
        })
        .collect()
}

fn read_inputs(path: &Path) -> anyhow::Result<Vec<(f64, f64)>> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| {
            let x = line.split(',').next().unwrap_or(line).trim();
            x.parse::<f64>()
                .map(|x| (x, f64::NAN))
                .with_context(|| format!("not a number: {}", x))
        })
        .collect()
}

fn predictions_path(ctx: &StepContext) -> anyhow::Result<PathBuf> {
    Ok(match ctx.eval_paths().1 {
        Some(path) => path.to_path_buf(),
        None => ctx.path_for(PREDICTIONS_FILE)?,
    })
}

/// Each eval run starts from an empty predictions file.
fn reset_predictions(ctx: &StepContext) -> anyhow::Result<()> {
    let path = predictions_path(ctx)?;
    fs::File::create(&path).with_context(|| format!("truncating {}", path.display()))?;
    Ok(())
}

fn append_prediction(ctx: &StepContext, x: f64, y: f64) -> anyhow::Result<()> {
    let path = predictions_path(ctx)?;
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("opening {}", path.display()))?;
    writeln!(file, "{},{}", x, y)?;
    Ok(())
}

pub fn extensions() -> Extensions<LinearFit> {
    Extensions::<LinearFit>::new()
        .training_data(|_ctx| Ok(synthetic(64, 0.0)))
        .testing_data(|_ctx| Ok(synthetic(16, 0.5)))
        .eval_data(|ctx| {
            reset_predictions(ctx)?;
            match ctx.eval_paths().0 {
                Some(input) => read_inputs(input),
                None => Ok(synthetic(8, 1.0).into_iter().map(|(x, _)| (x, f64::NAN)).collect()),
            }
        })
        .criterion(|_line| Ok(()))
        .optimizer(|_line| Ok(Sgd { learning_rate: 0.05 }))
        .forward(|line: &mut Line, sample: &(f64, f64)| Ok(line.predict(sample.0)))
        .compute_loss(|_criterion, prediction: &f64, sample: &(f64, f64)| {
            let residual = prediction - sample.1;
            Ok(SquaredError {
                value: residual * residual,
                residual,
                x: sample.0,
            })
        })
        .after_pass(|line: &mut Line, report: &PassReport, ctx| {
            if report.pass % CHECKPOINT_EVERY == 0 && ctx.output_dir().is_some() {
                line.save(&ctx.path_for(format!("checkpoint_{:03}.json", report.pass))?)?;
            }
            Ok(())
        })
        .after_training(|line: &mut Line, ctx| {
            if ctx.output_dir().is_some() {
                line.save(&ctx.path_for(MODEL_FILE)?)?;
            }
            Ok(())
        })
        .load_model(|line: &mut Line, ctx| {
            if let Some(path) = ctx.find_artifact(MODEL_FILE) {
                line.load(&path)?;
            } else if ctx.is_recorded() {
                bail!("no {} in this or any earlier snapshot; run train first", MODEL_FILE);
            }
            Ok(())
        })
        .metric(|| Ok(0.1))
        .compute_metrics(|tolerance: &f64, prediction: &f64, sample: &(f64, f64)| {
            let error = (prediction - sample.1).abs();
            let mut values = BTreeMap::new();
            values.insert("abs_error".to_string(), error);
            values.insert(
                "within_tolerance".to_string(),
                if error <= *tolerance { 1.0 } else { 0.0 },
            );
            Ok(values)
        })
        .capture_output(|prediction: &f64, sample: &(f64, f64), ctx| {
            append_prediction(ctx, sample.0, *prediction)
        })
}

pub fn build_task() -> Task<LinearFit> {
    Task::new(Line::default(), extensions()).with_settings(Settings {
        passes: 200,
        validate_every: 50,
    })
}
