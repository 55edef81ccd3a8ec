//! The `System`: a model and its training collaborators behind one step protocol.
//!
//! A system owns the model, criterion, optimizer, scheduler, inferer, per-mode metric
//! collections and per-mode dataloader factories. An engine drives it by calling the
//! per-mode step methods with raw batches from the dataloaders it gets from the system.

use crate::backend::Backend;
use crate::batch::{Batch, RawBatch, SampleId};
use crate::criterion::{Criterion, CriterionInput};
use crate::data::{DataLoader, DataLoaderFactory};
use crate::error::{ConfigError, LighterError, Result};
use crate::logging::{StatsLogger, StepStats};
use crate::metrics::MetricCollection;
use crate::mode::{Mode, ModeSlots};
use crate::model::{ForwardContext, Inferer, Model, ModelCapabilities};
use crate::optim::{self, LrScheduler, Optimizer};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Engine state a step needs besides the batch.
pub struct StepContext<'a> {
    pub epoch: usize,
    pub global_step: usize,
    pub logger: &'a mut StatsLogger,
}

impl<'a> StepContext<'a> {
    pub fn new(logger: &'a mut StatsLogger) -> Self {
        Self {
            epoch: 0,
            global_step: 0,
            logger,
        }
    }

    pub fn at(mut self, epoch: usize, global_step: usize) -> Self {
        self.epoch = epoch;
        self.global_step = global_step;
        self
    }
}

/// Output of a train, val or test step.
#[derive(Debug, Clone)]
pub struct StepResult<B: Backend> {
    /// The optimized loss value. `None` in test mode.
    pub loss: Option<B::Scalar>,
    pub metrics: Option<BTreeMap<String, f64>>,
    pub input: B::Tensor,
    pub target: Option<B::Tensor>,
    pub pred: B::Tensor,
    pub id: Option<Vec<SampleId>>,
}

/// Output of a predict step.
#[derive(Debug, Clone)]
pub struct Prediction<B: Backend> {
    pub pred: B::Tensor,
    pub id: Option<Vec<SampleId>>,
}

#[derive(Debug, Clone)]
pub enum StepOutput<B: Backend> {
    Step(StepResult<B>),
    Prediction(Prediction<B>),
}

impl<B: Backend> StepOutput<B> {
    pub fn into_step(self) -> Option<StepResult<B>> {
        match self {
            StepOutput::Step(result) => Some(result),
            StepOutput::Prediction(_) => None,
        }
    }

    pub fn into_prediction(self) -> Option<Prediction<B>> {
        match self {
            StepOutput::Prediction(prediction) => Some(prediction),
            StepOutput::Step(_) => None,
        }
    }
}

pub struct System<B: Backend> {
    model: Box<dyn Model<B>>,
    capabilities: ModelCapabilities,
    criterion: Option<Box<dyn Criterion<B>>>,
    optimizer: Option<Box<dyn Optimizer<B>>>,
    scheduler: Option<Box<dyn LrScheduler>>,
    inferer: Option<Box<dyn Inferer<B>>>,
    metrics: ModeSlots<MetricCollection<B>>,
    dataloaders: ModeSlots<DataLoaderFactory<B>>,
}

impl<B: Backend> System<B> {
    /// Wrap a model. Its capabilities are read once, here.
    pub fn new(model: Box<dyn Model<B>>) -> Self {
        let capabilities = model.capabilities();
        debug!(?capabilities, "model capabilities");
        Self {
            model,
            capabilities,
            criterion: None,
            optimizer: None,
            scheduler: None,
            inferer: None,
            metrics: ModeSlots::new(),
            dataloaders: ModeSlots::new(),
        }
    }

    pub fn with_criterion(mut self, criterion: Box<dyn Criterion<B>>) -> Self {
        self.criterion = Some(criterion);
        self
    }

    pub fn with_optimizer(mut self, optimizer: Box<dyn Optimizer<B>>) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Box<dyn LrScheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_inferer(mut self, inferer: Box<dyn Inferer<B>>) -> Self {
        self.inferer = Some(inferer);
        self
    }

    pub fn with_metrics(mut self, mode: Mode, metrics: MetricCollection<B>) -> Self {
        self.metrics.insert(mode, metrics);
        self
    }

    pub fn with_dataloader(mut self, mode: Mode, factory: DataLoaderFactory<B>) -> Self {
        self.dataloaders.insert(mode, factory);
        self
    }

    pub fn capabilities(&self) -> ModelCapabilities {
        self.capabilities
    }

    pub fn model(&self) -> &dyn Model<B> {
        self.model.as_ref()
    }

    pub fn model_mut(&mut self) -> &mut dyn Model<B> {
        self.model.as_mut()
    }

    pub fn has_criterion(&self) -> bool {
        self.criterion.is_some()
    }

    pub fn has_inferer(&self) -> bool {
        self.inferer.is_some()
    }

    pub fn metrics(&self, mode: Mode) -> Option<&MetricCollection<B>> {
        self.metrics.get(mode)
    }

    /// Modes that have a dataloader, and therefore a step method.
    pub fn configured_modes(&self) -> Vec<Mode> {
        self.dataloaders.modes()
    }

    pub fn has_dataloader(&self, mode: Mode) -> bool {
        self.dataloaders.contains(mode)
    }

    /// A fresh loader for `mode`, shuffled (when enabled) with `seed`.
    pub fn dataloader(&self, mode: Mode, seed: u64) -> Result<DataLoader<B>> {
        self.dataloaders
            .get(mode)
            .map(|factory| factory.build(seed))
            .ok_or(LighterError::ModeNotConfigured(mode))
    }

    /// Optimizer and optional scheduler for the engine.
    pub fn configure_optimizers(&self) -> Result<(&dyn Optimizer<B>, Option<&dyn LrScheduler>)> {
        let optimizer = self
            .optimizer
            .as_deref()
            .ok_or_else(|| ConfigError::missing("system.optimizer"))?;
        Ok((optimizer, self.scheduler.as_deref()))
    }

    /// Apply one optimizer update from the loss a train step returned.
    pub fn optimizer_step(&mut self, loss: &B::Scalar) -> Result<()> {
        let optimizer = self
            .optimizer
            .as_mut()
            .ok_or_else(|| ConfigError::missing("system.optimizer"))?;
        optimizer.step(self.model.as_mut(), loss)
    }

    /// Advance the scheduler by one epoch. No-op without a scheduler.
    pub fn scheduler_step(&mut self) {
        if let (Some(scheduler), Some(optimizer)) = (self.scheduler.as_mut(), self.optimizer.as_mut())
        {
            scheduler.step(optimizer.param_groups_mut());
        }
    }

    pub fn reset_metrics(&mut self, mode: Mode) {
        if let Some(metrics) = self.metrics.get_mut(mode) {
            metrics.reset();
        }
    }

    /// Values accumulated by the metrics of `mode` since the last reset.
    pub fn compute_metrics(&self, mode: Mode) -> BTreeMap<String, f64> {
        self.metrics
            .get(mode)
            .map(MetricCollection::compute)
            .unwrap_or_default()
    }

    /// Learning rate of the optimizer's only parameter group.
    pub fn learning_rate(&self) -> Result<f64> {
        let (optimizer, _) = self.configure_optimizers()?;
        optim::learning_rate(optimizer.param_groups())
    }

    pub fn set_learning_rate(&mut self, lr: f64) -> Result<()> {
        let optimizer = self
            .optimizer
            .as_mut()
            .ok_or_else(|| ConfigError::missing("system.optimizer"))?;
        optim::set_learning_rate(optimizer.param_groups_mut(), lr)
    }

    pub fn training_step(
        &mut self,
        batch: RawBatch<B::Tensor>,
        batch_idx: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepResult<B>> {
        self.require_dataloader(Mode::Train)?;
        self.evaluate(Mode::Train, batch, batch_idx, ctx)
    }

    pub fn validation_step(
        &mut self,
        batch: RawBatch<B::Tensor>,
        batch_idx: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepResult<B>> {
        self.require_dataloader(Mode::Val)?;
        self.evaluate(Mode::Val, batch, batch_idx, ctx)
    }

    pub fn test_step(
        &mut self,
        batch: RawBatch<B::Tensor>,
        batch_idx: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepResult<B>> {
        self.require_dataloader(Mode::Test)?;
        self.evaluate(Mode::Test, batch, batch_idx, ctx)
    }

    pub fn predict_step(
        &mut self,
        batch: RawBatch<B::Tensor>,
        batch_idx: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<Prediction<B>> {
        self.require_dataloader(Mode::Predict)?;
        self.run_prediction(batch, batch_idx, ctx)
    }

    /// Run one step in `mode`, regardless of which dataloaders are configured.
    pub fn step(
        &mut self,
        mode: Mode,
        batch: RawBatch<B::Tensor>,
        batch_idx: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepOutput<B>> {
        match mode {
            Mode::Predict => self
                .run_prediction(batch, batch_idx, ctx)
                .map(StepOutput::Prediction),
            _ => self
                .evaluate(mode, batch, batch_idx, ctx)
                .map(StepOutput::Step),
        }
    }

    fn require_dataloader(&self, mode: Mode) -> Result<()> {
        if self.dataloaders.contains(mode) {
            Ok(())
        } else {
            Err(LighterError::ModeNotConfigured(mode))
        }
    }

    fn forward(&mut self, mode: Mode, input: &B::Tensor, ctx: &StepContext<'_>) -> Result<B::Tensor> {
        let forward_ctx = ForwardContext::for_capabilities(self.capabilities, ctx.epoch, ctx.global_step);
        let model = &mut self.model;
        match self.inferer.as_mut() {
            Some(inferer) if mode.uses_inferer() => {
                let mut predictor = |x: &B::Tensor| model.forward(x, forward_ctx);
                inferer.infer(input, &mut predictor)
            }
            _ => model.forward(input, forward_ctx),
        }
    }

    fn run_prediction(
        &mut self,
        batch: RawBatch<B::Tensor>,
        batch_idx: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<Prediction<B>> {
        let batch = Batch::validate(batch)?;
        let pred = self.forward(Mode::Predict, &batch.input, ctx)?;
        trace!(batch_idx, "predict step");
        Ok(Prediction { pred, id: batch.id })
    }

    fn evaluate(
        &mut self,
        mode: Mode,
        batch: RawBatch<B::Tensor>,
        batch_idx: usize,
        ctx: &mut StepContext<'_>,
    ) -> Result<StepResult<B>> {
        let batch = Batch::validate(batch)?;
        let pred = self.forward(mode, &batch.input, ctx)?;

        let loss = if mode.computes_loss() {
            let criterion = self
                .criterion
                .as_mut()
                .ok_or_else(|| ConfigError::missing("system.criterion"))?;
            Some(criterion.compute(CriterionInput {
                input: &batch.input,
                pred: &pred,
                target: batch.target.as_ref(),
            })?)
        } else {
            None
        };

        let metrics = match self.metrics.get_mut(mode) {
            Some(collection) => Some(collection.update(&pred, batch.target.as_ref())?),
            None => None,
        };

        if let Some(loss) = &loss {
            loss.check_total()?;
        }

        if ctx.logger.is_enabled() {
            let loss_values = loss.as_ref().map(|l| l.map(B::scalar_value));
            let optimizer_stats = match self.optimizer.as_deref() {
                Some(opt) if mode == Mode::Train && batch_idx == 0 => {
                    Some(optim::optimizer_stats(opt.name(), opt.param_groups()))
                }
                _ => None,
            };
            ctx.logger.log_stats(StepStats {
                mode,
                loss: loss_values.as_ref(),
                metrics: metrics.as_ref(),
                optimizer: optimizer_stats.as_ref(),
                batch_idx,
                batch_size: B::batch_size(&batch.input),
                global_step: ctx.global_step,
            })?;
        }
        trace!(%mode, batch_idx, "step complete");

        Ok(StepResult {
            loss: loss.map(|l| l.into_total()).transpose()?,
            metrics,
            input: batch.input,
            target: batch.target,
            pred,
            id: batch.id,
        })
    }
}

impl<B: Backend> std::fmt::Debug for System<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("capabilities", &self.capabilities)
            .field("criterion", &self.criterion.is_some())
            .field("optimizer", &self.optimizer.as_ref().map(|o| o.name().to_string()))
            .field("scheduler", &self.scheduler.as_ref().map(|s| s.name().to_string()))
            .field("inferer", &self.inferer.is_some())
            .field("metrics", &self.metrics.modes())
            .field("dataloaders", &self.dataloaders.modes())
            .finish()
    }
}
