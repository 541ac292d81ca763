//! Fixed train, test and eval loops with named holes for the author's code.
//!
//! An experiment fills the holes it needs on an [`Extensions`] value. Each
//! skeleton lists the points it cannot run without and checks all of them
//! before asking for any data, so a half-wired experiment fails with one error
//! naming everything that is missing.

use crate::backend::{Backend, DataSource, Loss, Model, Optimizer};
use crate::context::StepContext;
use crate::metrics::MetricLog;
use flint_core::{Error, Mode, Result};
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ExtensionPoint {
    TrainingData,
    TestingData,
    ValidationData,
    EvalData,
    Criterion,
    Optimizer,
    Forward,
    ComputeLoss,
    PrepareSample,
    AfterPass,
    AfterTraining,
    Metric,
    ComputeMetrics,
    LoadModel,
    CaptureOutput,
}

impl ExtensionPoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtensionPoint::TrainingData => "training_data",
            ExtensionPoint::TestingData => "testing_data",
            ExtensionPoint::ValidationData => "validation_data",
            ExtensionPoint::EvalData => "eval_data",
            ExtensionPoint::Criterion => "criterion",
            ExtensionPoint::Optimizer => "optimizer",
            ExtensionPoint::Forward => "forward",
            ExtensionPoint::ComputeLoss => "compute_loss",
            ExtensionPoint::PrepareSample => "prepare_sample",
            ExtensionPoint::AfterPass => "after_pass",
            ExtensionPoint::AfterTraining => "after_training",
            ExtensionPoint::Metric => "metric",
            ExtensionPoint::ComputeMetrics => "compute_metrics",
            ExtensionPoint::LoadModel => "load_model",
            ExtensionPoint::CaptureOutput => "capture_output",
        }
    }
}

impl fmt::Display for ExtensionPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reported to `after_pass` once a pass over the training data is done.
#[derive(Debug, Clone, PartialEq)]
pub struct PassReport {
    /// 1-based.
    pub pass: usize,
    pub passes: usize,
    pub samples: usize,
    pub mean_loss: f64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Full passes over the training data. At least one.
    pub passes: usize,
    /// Run a validation round after every n-th pass; 0 turns it off.
    pub validate_every: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            passes: 1,
            validate_every: 0,
        }
    }
}

type DataFn<S> = Box<dyn Fn(&StepContext) -> anyhow::Result<Box<dyn DataSource<S>>> + Send + Sync>;
type ModelFn<M, T> = Box<dyn Fn(&M) -> anyhow::Result<T> + Send + Sync>;
type ForwardFn<M, S, O> = Box<dyn Fn(&mut M, &S) -> anyhow::Result<O> + Send + Sync>;
type LossFn<C, O, S, L> = Box<dyn Fn(&C, &O, &S) -> anyhow::Result<L> + Send + Sync>;
type PrepareFn<S> = Box<dyn Fn(S) -> anyhow::Result<S> + Send + Sync>;
type ModelHook<M> = Box<dyn Fn(&mut M, &StepContext) -> anyhow::Result<()> + Send + Sync>;
type PassHook<M> = Box<dyn Fn(&mut M, &PassReport, &StepContext) -> anyhow::Result<()> + Send + Sync>;
type MetricFn<T> = Box<dyn Fn() -> anyhow::Result<T> + Send + Sync>;
type MetricsFn<K, O, S> = Box<dyn Fn(&K, &O, &S) -> anyhow::Result<BTreeMap<String, f64>> + Send + Sync>;
type CaptureFn<O, S> = Box<dyn Fn(&O, &S, &StepContext) -> anyhow::Result<()> + Send + Sync>;

/// The author's implementations, one optional slot per extension point.
pub struct Extensions<B: Backend> {
    training_data: Option<DataFn<B::Sample>>,
    testing_data: Option<DataFn<B::Sample>>,
    validation_data: Option<DataFn<B::Sample>>,
    eval_data: Option<DataFn<B::Sample>>,
    criterion: Option<ModelFn<B::Model, B::Criterion>>,
    optimizer: Option<ModelFn<B::Model, B::Optimizer>>,
    forward: Option<ForwardFn<B::Model, B::Sample, B::Output>>,
    compute_loss: Option<LossFn<B::Criterion, B::Output, B::Sample, B::Loss>>,
    prepare_sample: Option<PrepareFn<B::Sample>>,
    after_pass: Option<PassHook<B::Model>>,
    after_training: Option<ModelHook<B::Model>>,
    metric: Option<MetricFn<B::Metric>>,
    compute_metrics: Option<MetricsFn<B::Metric, B::Output, B::Sample>>,
    load_model: Option<ModelHook<B::Model>>,
    capture_output: Option<CaptureFn<B::Output, B::Sample>>,
}

impl<B: Backend> Default for Extensions<B> {
    fn default() -> Self {
        Self {
            training_data: None,
            testing_data: None,
            validation_data: None,
            eval_data: None,
            criterion: None,
            optimizer: None,
            forward: None,
            compute_loss: None,
            prepare_sample: None,
            after_pass: None,
            after_training: None,
            metric: None,
            compute_metrics: None,
            load_model: None,
            capture_output: None,
        }
    }
}

impl<B: Backend> fmt::Debug for Extensions<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.provided()).finish()
    }
}

impl<B: Backend> Extensions<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn training_data<D>(mut self, f: impl Fn(&StepContext) -> anyhow::Result<D> + Send + Sync + 'static) -> Self
    where
        D: DataSource<B::Sample> + 'static,
    {
        self.training_data = Some(boxed_source(f));
        self
    }

    pub fn testing_data<D>(mut self, f: impl Fn(&StepContext) -> anyhow::Result<D> + Send + Sync + 'static) -> Self
    where
        D: DataSource<B::Sample> + 'static,
    {
        self.testing_data = Some(boxed_source(f));
        self
    }

    /// Data for validation rounds during training. Testing data when absent.
    pub fn validation_data<D>(mut self, f: impl Fn(&StepContext) -> anyhow::Result<D> + Send + Sync + 'static) -> Self
    where
        D: DataSource<B::Sample> + 'static,
    {
        self.validation_data = Some(boxed_source(f));
        self
    }

    pub fn eval_data<D>(mut self, f: impl Fn(&StepContext) -> anyhow::Result<D> + Send + Sync + 'static) -> Self
    where
        D: DataSource<B::Sample> + 'static,
    {
        self.eval_data = Some(boxed_source(f));
        self
    }

    pub fn criterion(mut self, f: impl Fn(&B::Model) -> anyhow::Result<B::Criterion> + Send + Sync + 'static) -> Self {
        self.criterion = Some(Box::new(f));
        self
    }

    pub fn optimizer(mut self, f: impl Fn(&B::Model) -> anyhow::Result<B::Optimizer> + Send + Sync + 'static) -> Self {
        self.optimizer = Some(Box::new(f));
        self
    }

    pub fn forward(
        mut self,
        f: impl Fn(&mut B::Model, &B::Sample) -> anyhow::Result<B::Output> + Send + Sync + 'static,
    ) -> Self {
        self.forward = Some(Box::new(f));
        self
    }

    pub fn compute_loss(
        mut self,
        f: impl Fn(&B::Criterion, &B::Output, &B::Sample) -> anyhow::Result<B::Loss> + Send + Sync + 'static,
    ) -> Self {
        self.compute_loss = Some(Box::new(f));
        self
    }

    /// Transform each sample before `forward`. Identity when absent.
    pub fn prepare_sample(mut self, f: impl Fn(B::Sample) -> anyhow::Result<B::Sample> + Send + Sync + 'static) -> Self {
        self.prepare_sample = Some(Box::new(f));
        self
    }

    pub fn after_pass(
        mut self,
        f: impl Fn(&mut B::Model, &PassReport, &StepContext) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.after_pass = Some(Box::new(f));
        self
    }

    pub fn after_training(
        mut self,
        f: impl Fn(&mut B::Model, &StepContext) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.after_training = Some(Box::new(f));
        self
    }

    pub fn metric(mut self, f: impl Fn() -> anyhow::Result<B::Metric> + Send + Sync + 'static) -> Self {
        self.metric = Some(Box::new(f));
        self
    }

    pub fn compute_metrics(
        mut self,
        f: impl Fn(&B::Metric, &B::Output, &B::Sample) -> anyhow::Result<BTreeMap<String, f64>> + Send + Sync + 'static,
    ) -> Self {
        self.compute_metrics = Some(Box::new(f));
        self
    }

    /// Restore weights before testing or evaluating.
    pub fn load_model(
        mut self,
        f: impl Fn(&mut B::Model, &StepContext) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.load_model = Some(Box::new(f));
        self
    }

    pub fn capture_output(
        mut self,
        f: impl Fn(&B::Output, &B::Sample, &StepContext) -> anyhow::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.capture_output = Some(Box::new(f));
        self
    }

    pub fn provides(&self, point: ExtensionPoint) -> bool {
        match point {
            ExtensionPoint::TrainingData => self.training_data.is_some(),
            ExtensionPoint::TestingData => self.testing_data.is_some(),
            ExtensionPoint::ValidationData => self.validation_data.is_some(),
            ExtensionPoint::EvalData => self.eval_data.is_some(),
            ExtensionPoint::Criterion => self.criterion.is_some(),
            ExtensionPoint::Optimizer => self.optimizer.is_some(),
            ExtensionPoint::Forward => self.forward.is_some(),
            ExtensionPoint::ComputeLoss => self.compute_loss.is_some(),
            ExtensionPoint::PrepareSample => self.prepare_sample.is_some(),
            ExtensionPoint::AfterPass => self.after_pass.is_some(),
            ExtensionPoint::AfterTraining => self.after_training.is_some(),
            ExtensionPoint::Metric => self.metric.is_some(),
            ExtensionPoint::ComputeMetrics => self.compute_metrics.is_some(),
            ExtensionPoint::LoadModel => self.load_model.is_some(),
            ExtensionPoint::CaptureOutput => self.capture_output.is_some(),
        }
    }

    pub fn provided(&self) -> Vec<ExtensionPoint> {
        ALL_POINTS.iter().copied().filter(|p| self.provides(*p)).collect()
    }

    fn prepare(&self, sample: B::Sample) -> Result<B::Sample> {
        match &self.prepare_sample {
            Some(prepare) => call(ExtensionPoint::PrepareSample, prepare(sample)),
            None => Ok(sample),
        }
    }

    fn load(&self, model: &mut B::Model, ctx: &StepContext) -> Result<()> {
        match &self.load_model {
            Some(load) => call(ExtensionPoint::LoadModel, load(model, ctx)),
            None => Ok(()),
        }
    }
}

const ALL_POINTS: &[ExtensionPoint] = &[
    ExtensionPoint::TrainingData,
    ExtensionPoint::TestingData,
    ExtensionPoint::ValidationData,
    ExtensionPoint::EvalData,
    ExtensionPoint::Criterion,
    ExtensionPoint::Optimizer,
    ExtensionPoint::Forward,
    ExtensionPoint::ComputeLoss,
    ExtensionPoint::PrepareSample,
    ExtensionPoint::AfterPass,
    ExtensionPoint::AfterTraining,
    ExtensionPoint::Metric,
    ExtensionPoint::ComputeMetrics,
    ExtensionPoint::LoadModel,
    ExtensionPoint::CaptureOutput,
];

fn boxed_source<S, D>(
    f: impl Fn(&StepContext) -> anyhow::Result<D> + Send + Sync + 'static,
) -> DataFn<S>
where
    D: DataSource<S> + 'static,
{
    Box::new(move |ctx: &StepContext| Ok(Box::new(f(ctx)?) as Box<dyn DataSource<S>>))
}

fn call<T>(point: ExtensionPoint, result: anyhow::Result<T>) -> Result<T> {
    result.map_err(|e| Error::execution(point.as_str(), e))
}

fn fixed<T>(step: &'static str, result: anyhow::Result<T>) -> Result<T> {
    result.map_err(|e| Error::execution(step, e))
}

fn slot<T>(slot: &Option<T>, point: ExtensionPoint) -> Result<&T> {
    slot.as_ref()
        .ok_or_else(|| Error::configuration(format!("extension point {} is not provided", point)))
}

pub trait Skeleton {
    const MODE: Mode;
    const REQUIRED: &'static [ExtensionPoint];
    const OPTIONAL: &'static [ExtensionPoint];

    /// Every required point present and the settings usable.
    fn validate<B: Backend>(ext: &Extensions<B>, settings: &Settings) -> Result<()>;

    fn run<B: Backend>(
        ext: &Extensions<B>,
        model: &mut B::Model,
        settings: &Settings,
        ctx: &StepContext,
    ) -> Result<MetricLog>;
}

fn check_required<B: Backend>(mode: Mode, required: &[ExtensionPoint], ext: &Extensions<B>) -> Result<()> {
    let missing: Vec<&str> = required
        .iter()
        .filter(|p| !ext.provides(**p))
        .map(ExtensionPoint::as_str)
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(Error::configuration(format!(
            "{} needs extension points that were not provided: {}",
            mode,
            missing.join(", ")
        )))
    }
}

pub struct TrainSkeleton;

impl Skeleton for TrainSkeleton {
    const MODE: Mode = Mode::Train;
    const REQUIRED: &'static [ExtensionPoint] = &[
        ExtensionPoint::TrainingData,
        ExtensionPoint::Criterion,
        ExtensionPoint::Optimizer,
        ExtensionPoint::Forward,
        ExtensionPoint::ComputeLoss,
    ];
    const OPTIONAL: &'static [ExtensionPoint] = &[
        ExtensionPoint::PrepareSample,
        ExtensionPoint::AfterPass,
        ExtensionPoint::AfterTraining,
        ExtensionPoint::ValidationData,
        ExtensionPoint::Metric,
        ExtensionPoint::ComputeMetrics,
    ];

    fn validate<B: Backend>(ext: &Extensions<B>, settings: &Settings) -> Result<()> {
        check_required(Self::MODE, Self::REQUIRED, ext)?;
        if settings.passes == 0 {
            return Err(Error::configuration("training needs at least one pass"));
        }
        if settings.validate_every > 0 {
            check_required(
                Self::MODE,
                &[ExtensionPoint::Metric, ExtensionPoint::ComputeMetrics],
                ext,
            )?;
            if ext.validation_data.is_none() && ext.testing_data.is_none() {
                return Err(Error::configuration(
                    "validation during training needs validation_data or testing_data",
                ));
            }
        }
        Ok(())
    }

    fn run<B: Backend>(
        ext: &Extensions<B>,
        model: &mut B::Model,
        settings: &Settings,
        ctx: &StepContext,
    ) -> Result<MetricLog> {
        Self::validate(ext, settings)?;
        let training_data = slot(&ext.training_data, ExtensionPoint::TrainingData)?;
        let make_criterion = slot(&ext.criterion, ExtensionPoint::Criterion)?;
        let make_optimizer = slot(&ext.optimizer, ExtensionPoint::Optimizer)?;
        let forward = slot(&ext.forward, ExtensionPoint::Forward)?;
        let compute_loss = slot(&ext.compute_loss, ExtensionPoint::ComputeLoss)?;

        model.set_mode(Mode::Train);
        let mut data = call(ExtensionPoint::TrainingData, training_data(ctx))?;
        let criterion = call(ExtensionPoint::Criterion, make_criterion(&*model))?;
        let mut optimizer = call(ExtensionPoint::Optimizer, make_optimizer(&*model))?;
        let mut validation: Option<Validation<B>> = None;

        let mut log = MetricLog::new();
        for pass in 1..=settings.passes {
            let mut total = 0.0;
            let mut count = 0usize;
            for sample in call(ExtensionPoint::TrainingData, data.samples())? {
                fixed("zero_grad", optimizer.zero_grad(&mut *model))?;
                let sample = ext.prepare(sample)?;
                let output = call(ExtensionPoint::Forward, forward(&mut *model, &sample))?;
                let loss = call(
                    ExtensionPoint::ComputeLoss,
                    compute_loss(&criterion, &output, &sample),
                )?;
                total += loss.value();
                count += 1;
                fixed("backward", loss.backward(&mut *model))?;
                fixed("step", optimizer.step(&mut *model))?;
            }
            if count == 0 {
                warn!(pass, "training data yielded no samples");
            }
            let mean_loss = if count == 0 { 0.0 } else { total / count as f64 };
            log.record("loss", mean_loss);
            debug!(pass, passes = settings.passes, samples = count, mean_loss, "pass finished");
            if settings.validate_every > 0 && pass % settings.validate_every == 0 {
                if validation.is_none() {
                    validation = Some(Validation::open(ext, ctx)?);
                }
                if let Some(validation) = validation.as_mut() {
                    model.set_mode(Mode::Test);
                    let outcome = validation.run(ext, &mut *model, &mut log);
                    model.set_mode(Mode::Train);
                    outcome?;
                }
            }
            if let Some(after_pass) = &ext.after_pass {
                let report = PassReport {
                    pass,
                    passes: settings.passes,
                    samples: count,
                    mean_loss,
                };
                call(ExtensionPoint::AfterPass, after_pass(&mut *model, &report, ctx))?;
            }
        }
        if let Some(after_training) = &ext.after_training {
            call(ExtensionPoint::AfterTraining, after_training(&mut *model, ctx))?;
        }
        Ok(log)
    }
}

/// Validation data and metric, built on the first round and kept for the rest.
struct Validation<B: Backend> {
    data: Box<dyn DataSource<B::Sample>>,
    metric: B::Metric,
}

impl<B: Backend> Validation<B> {
    fn open(ext: &Extensions<B>, ctx: &StepContext) -> Result<Self> {
        let data = match (&ext.validation_data, &ext.testing_data) {
            (Some(source), _) => call(ExtensionPoint::ValidationData, source(ctx))?,
            (None, Some(source)) => call(ExtensionPoint::TestingData, source(ctx))?,
            (None, None) => {
                return Err(Error::configuration(
                    "validation during training needs validation_data or testing_data",
                ))
            }
        };
        let make_metric = slot(&ext.metric, ExtensionPoint::Metric)?;
        let metric = call(ExtensionPoint::Metric, make_metric())?;
        Ok(Self { data, metric })
    }

    fn run(&mut self, ext: &Extensions<B>, model: &mut B::Model, log: &mut MetricLog) -> Result<()> {
        let forward = slot(&ext.forward, ExtensionPoint::Forward)?;
        let compute_metrics = slot(&ext.compute_metrics, ExtensionPoint::ComputeMetrics)?;
        let mut round = MetricLog::new();
        for sample in call(ExtensionPoint::ValidationData, self.data.samples())? {
            let sample = ext.prepare(sample)?;
            let output = call(ExtensionPoint::Forward, forward(&mut *model, &sample))?;
            let values = call(
                ExtensionPoint::ComputeMetrics,
                compute_metrics(&self.metric, &output, &sample),
            )?;
            for (name, value) in values {
                round.record(name, value);
            }
        }
        for name in round.names() {
            if let Some(mean) = round.average(name) {
                log.record(format!("val_{}", name), mean);
            }
        }
        Ok(())
    }
}

pub struct TestSkeleton;

impl Skeleton for TestSkeleton {
    const MODE: Mode = Mode::Test;
    const REQUIRED: &'static [ExtensionPoint] = &[
        ExtensionPoint::TestingData,
        ExtensionPoint::Metric,
        ExtensionPoint::Forward,
        ExtensionPoint::ComputeMetrics,
    ];
    const OPTIONAL: &'static [ExtensionPoint] =
        &[ExtensionPoint::PrepareSample, ExtensionPoint::LoadModel];

    fn validate<B: Backend>(ext: &Extensions<B>, _settings: &Settings) -> Result<()> {
        check_required(Self::MODE, Self::REQUIRED, ext)
    }

    fn run<B: Backend>(
        ext: &Extensions<B>,
        model: &mut B::Model,
        settings: &Settings,
        ctx: &StepContext,
    ) -> Result<MetricLog> {
        Self::validate(ext, settings)?;
        let testing_data = slot(&ext.testing_data, ExtensionPoint::TestingData)?;
        let make_metric = slot(&ext.metric, ExtensionPoint::Metric)?;
        let forward = slot(&ext.forward, ExtensionPoint::Forward)?;
        let compute_metrics = slot(&ext.compute_metrics, ExtensionPoint::ComputeMetrics)?;

        model.set_mode(Mode::Test);
        ext.load(model, ctx)?;
        let metric = call(ExtensionPoint::Metric, make_metric())?;
        let mut data = call(ExtensionPoint::TestingData, testing_data(ctx))?;

        let mut log = MetricLog::new();
        for sample in call(ExtensionPoint::TestingData, data.samples())? {
            let sample = ext.prepare(sample)?;
            let output = call(ExtensionPoint::Forward, forward(&mut *model, &sample))?;
            let values = call(
                ExtensionPoint::ComputeMetrics,
                compute_metrics(&metric, &output, &sample),
            )?;
            for (name, value) in values {
                log.record(name, value);
            }
        }
        Ok(log)
    }
}

pub struct EvalSkeleton;

impl Skeleton for EvalSkeleton {
    const MODE: Mode = Mode::Eval;
    const REQUIRED: &'static [ExtensionPoint] = &[
        ExtensionPoint::EvalData,
        ExtensionPoint::Forward,
        ExtensionPoint::CaptureOutput,
    ];
    const OPTIONAL: &'static [ExtensionPoint] =
        &[ExtensionPoint::PrepareSample, ExtensionPoint::LoadModel];

    fn validate<B: Backend>(ext: &Extensions<B>, _settings: &Settings) -> Result<()> {
        check_required(Self::MODE, Self::REQUIRED, ext)
    }

    fn run<B: Backend>(
        ext: &Extensions<B>,
        model: &mut B::Model,
        settings: &Settings,
        ctx: &StepContext,
    ) -> Result<MetricLog> {
        Self::validate(ext, settings)?;
        let eval_data = slot(&ext.eval_data, ExtensionPoint::EvalData)?;
        let forward = slot(&ext.forward, ExtensionPoint::Forward)?;
        let capture_output = slot(&ext.capture_output, ExtensionPoint::CaptureOutput)?;

        model.set_mode(Mode::Eval);
        ext.load(model, ctx)?;
        let mut data = call(ExtensionPoint::EvalData, eval_data(ctx))?;

        let mut count = 0usize;
        for sample in call(ExtensionPoint::EvalData, data.samples())? {
            let sample = ext.prepare(sample)?;
            let output = call(ExtensionPoint::Forward, forward(&mut *model, &sample))?;
            call(
                ExtensionPoint::CaptureOutput,
                capture_output(&output, &sample, ctx),
            )?;
            count += 1;
        }
        debug!(samples = count, "evaluation finished");
        Ok(MetricLog::new())
    }
}

pub fn validate<B: Backend>(mode: Mode, ext: &Extensions<B>, settings: &Settings) -> Result<()> {
    match mode {
        Mode::Train => TrainSkeleton::validate(ext, settings),
        Mode::Test => TestSkeleton::validate(ext, settings),
        Mode::Eval => EvalSkeleton::validate(ext, settings),
    }
}

pub fn run<B: Backend>(
    mode: Mode,
    ext: &Extensions<B>,
    model: &mut B::Model,
    settings: &Settings,
    ctx: &StepContext,
) -> Result<MetricLog> {
    match mode {
        Mode::Train => TrainSkeleton::run(ext, model, settings, ctx),
        Mode::Test => TestSkeleton::run(ext, model, settings, ctx),
        Mode::Eval => EvalSkeleton::run(ext, model, settings, ctx),
    }
}
