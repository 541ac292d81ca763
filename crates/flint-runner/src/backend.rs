//! The numeric side of an experiment, seen only through these traits.
//!
//! flint never does tensor math itself. A [`Backend`] names the concrete types
//! an experiment works with; the fixed steps of each skeleton (zeroing
//! gradients, back-propagating, stepping the optimizer, switching the model
//! between training and inference) go through [`Model`], [`Loss`] and
//! [`Optimizer`].

use flint_core::Mode;

pub trait Backend: Sized + 'static {
    type Model: Model;
    /// One item yielded by a data source.
    type Sample;
    /// What `forward` produces for one sample.
    type Output;
    type Criterion;
    type Loss: Loss<Self::Model>;
    type Optimizer: Optimizer<Self::Model>;
    type Metric;
}

pub trait Model: Send {
    /// Called before every loop with the mode about to run.
    fn set_mode(&mut self, _mode: Mode) {}
}

pub trait Loss<M> {
    fn value(&self) -> f64;
    fn backward(&self, model: &mut M) -> anyhow::Result<()>;
}

pub trait Optimizer<M> {
    fn zero_grad(&mut self, model: &mut M) -> anyhow::Result<()>;
    fn step(&mut self, model: &mut M) -> anyhow::Result<()>;
}

/// A re-iterable stream of samples; the train skeleton walks it once per pass.
pub trait DataSource<S> {
    fn samples(&mut self) -> anyhow::Result<Box<dyn Iterator<Item = S> + '_>>;
}

impl<S: Clone> DataSource<S> for Vec<S> {
    fn samples(&mut self) -> anyhow::Result<Box<dyn Iterator<Item = S> + '_>> {
        Ok(Box::new(self.iter().cloned()))
    }
}
