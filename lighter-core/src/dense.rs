//! A small dense CPU backend.
//!
//! Enough to run Lighter end to end without a tensor library: row-major `f32` tensors,
//! elementwise criteria and metrics, a JSON-lines dataset, an affine model and SGD. There is
//! no autograd: `mse` and `l1` record the gradient with respect to the prediction in a shared
//! [`PredGrad`], and [`Affine`] turns it into parameter gradients when the optimizer steps.
//! Projects that train real networks plug in their own [`Backend`].

use crate::backend::Backend;
use crate::batch::{BatchField, RawBatch, SampleId};
use crate::config::registry::{Registry, parse_args};
use crate::criterion::{Criterion, CriterionInput, Loss};
use crate::data::Dataset;
use crate::error::{LighterError, Result};
use crate::metrics::Metric;
use crate::model::{ForwardContext, Model, ParameterUpdate};
use crate::optim::{Optimizer, ParamGroup};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

/// Row-major tensor of `f32` values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DenseTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl DenseTensor {
    pub fn new(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(LighterError::data(format!(
                "shape {shape:?} needs {expected} values, got {}",
                data.len()
            )));
        }
        Ok(Self { shape, data })
    }

    /// A rank-0 tensor.
    pub fn scalar(value: f32) -> Self {
        Self {
            shape: Vec::new(),
            data: vec![value],
        }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            shape: self.shape.clone(),
            data: self.data.iter().map(|v| f(*v)).collect(),
        }
    }

    /// Parse a number or a (nested, rectangular) array of numbers.
    pub fn from_json(value: &Value) -> Result<Self> {
        let mut shape = Vec::new();
        let mut cursor = value;
        while let Value::Array(items) = cursor {
            shape.push(items.len());
            match items.first() {
                Some(first) => cursor = first,
                None => break,
            }
        }
        let mut data = Vec::with_capacity(shape.iter().product());
        flatten(value, &shape, 0, &mut data)?;
        Self::new(shape, data)
    }

    fn row_len(&self) -> usize {
        self.shape.iter().skip(1).product()
    }

    fn zip_with(&self, other: &Self, f: impl Fn(f32, f32) -> f64) -> Result<Vec<f64>> {
        if self.shape != other.shape {
            return Err(LighterError::data(format!(
                "shape mismatch: {:?} vs {:?}",
                self.shape, other.shape
            )));
        }
        Ok(self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| f(*a, *b))
            .collect())
    }
}

fn flatten(value: &Value, shape: &[usize], depth: usize, out: &mut Vec<f32>) -> Result<()> {
    match value {
        Value::Number(n) if depth == shape.len() => {
            let v = n
                .as_f64()
                .ok_or_else(|| LighterError::data(format!("'{n}' is not a finite number")))?;
            out.push(v as f32);
            Ok(())
        }
        Value::Array(items) if depth < shape.len() && items.len() == shape[depth] => {
            for item in items {
                flatten(item, shape, depth + 1, out)?;
            }
            Ok(())
        }
        _ => Err(LighterError::data(
            "tensor must be a number or a rectangular array of numbers",
        )),
    }
}

/// Backend over [`DenseTensor`] with `f64` losses.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenseBackend;

impl Backend for DenseBackend {
    type Tensor = DenseTensor;
    type Scalar = f64;

    fn scalar_value(scalar: &f64) -> f64 {
        *scalar
    }

    fn batch_size(tensor: &DenseTensor) -> usize {
        tensor.shape.first().copied().unwrap_or(1)
    }

    fn stack(items: Vec<DenseTensor>) -> Result<DenseTensor> {
        let Some(first) = items.first() else {
            return Err(LighterError::data("cannot stack zero tensors"));
        };
        let inner = first.shape.clone();
        let mut data = Vec::with_capacity(items.len() * first.data.len());
        for item in &items {
            if item.shape != inner {
                return Err(LighterError::data(format!(
                    "cannot stack tensors of shapes {inner:?} and {:?}",
                    item.shape
                )));
            }
            data.extend_from_slice(&item.data);
        }
        let mut shape = Vec::with_capacity(inner.len() + 1);
        shape.push(items.len());
        shape.extend(inner);
        DenseTensor::new(shape, data)
    }

    fn split(tensor: &DenseTensor, chunk: usize) -> Result<Vec<DenseTensor>> {
        if tensor.shape.is_empty() {
            return Err(LighterError::data("cannot split a rank-0 tensor"));
        }
        let row = tensor.row_len();
        let rows = tensor.shape[0];
        let chunk = chunk.max(1);
        (0..rows)
            .step_by(chunk)
            .map(|start| {
                let end = (start + chunk).min(rows);
                let mut shape = tensor.shape.clone();
                shape[0] = end - start;
                DenseTensor::new(shape, tensor.data[start * row..end * row].to_vec())
            })
            .collect()
    }

    fn concat(items: Vec<DenseTensor>) -> Result<DenseTensor> {
        let Some(first) = items.first() else {
            return Err(LighterError::data("cannot concatenate zero tensors"));
        };
        if first.shape.is_empty() {
            return Err(LighterError::data("cannot concatenate rank-0 tensors"));
        }
        let tail = first.shape[1..].to_vec();
        let mut rows = 0;
        let mut data = Vec::new();
        for item in &items {
            if item.shape.is_empty() || item.shape[1..] != tail[..] {
                return Err(LighterError::data(format!(
                    "cannot concatenate tensors of shapes {:?} and {:?}",
                    first.shape, item.shape
                )));
            }
            rows += item.shape[0];
            data.extend_from_slice(&item.data);
        }
        let mut shape = vec![rows];
        shape.extend(tail);
        DenseTensor::new(shape, data)
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}

/// Gradient of the last dense loss with respect to the prediction it scored.
///
/// Criteria write it, the model consumes it on the next optimizer step. Clones share the slot.
#[derive(Debug, Clone, Default)]
pub struct PredGrad(Arc<Mutex<Option<DenseTensor>>>);

impl PredGrad {
    pub fn record(&self, grad: DenseTensor) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(grad);
    }

    pub fn take(&self) -> Option<DenseTensor> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

/// Record `d(mean(f(p - t)))/dp` when a slot is attached.
fn record_grad(
    slot: Option<&PredGrad>,
    pred: &DenseTensor,
    target: &DenseTensor,
    df: impl Fn(f64) -> f64,
) -> Result<()> {
    let Some(slot) = slot else {
        return Ok(());
    };
    let n = pred.data.len().max(1) as f64;
    let grad = pred.zip_with(target, |p, t| df(f64::from(p - t)) / n)?;
    slot.record(DenseTensor {
        shape: pred.shape.clone(),
        data: grad.into_iter().map(|g| g as f32).collect(),
    });
    Ok(())
}

fn require_target<'a>(name: &str, target: Option<&'a DenseTensor>) -> Result<&'a DenseTensor> {
    target.ok_or_else(|| LighterError::component(name, "requires a target but the batch has none"))
}

/// Mean squared error criterion (`mse`).
#[derive(Debug, Clone, Default)]
pub struct Mse {
    grad: Option<PredGrad>,
}

impl Mse {
    /// Also record the loss gradient into `grad` on every call.
    pub fn recording(grad: PredGrad) -> Self {
        Self { grad: Some(grad) }
    }
}

impl Criterion<DenseBackend> for Mse {
    fn compute(&mut self, args: CriterionInput<'_, DenseTensor>) -> Result<Loss<f64>> {
        let target = require_target("mse", args.target)?;
        let sq = args.pred.zip_with(target, |p, t| f64::from(p - t).powi(2))?;
        record_grad(self.grad.as_ref(), args.pred, target, |d| 2.0 * d)?;
        Ok(Loss::Scalar(mean(&sq)))
    }
}

/// Mean absolute error criterion (`l1`).
#[derive(Debug, Clone, Default)]
pub struct L1 {
    grad: Option<PredGrad>,
}

impl L1 {
    pub fn recording(grad: PredGrad) -> Self {
        Self { grad: Some(grad) }
    }
}

impl Criterion<DenseBackend> for L1 {
    fn compute(&mut self, args: CriterionInput<'_, DenseTensor>) -> Result<Loss<f64>> {
        let target = require_target("l1", args.target)?;
        let abs = args.pred.zip_with(target, |p, t| f64::from(p - t).abs())?;
        // subgradient 0 where the prediction is exact
        record_grad(self.grad.as_ref(), args.pred, target, |d| {
            if d == 0.0 { 0.0 } else { d.signum() }
        })?;
        Ok(Loss::Scalar(mean(&abs)))
    }
}

/// Running elementwise mean of an error term.
#[derive(Debug, Clone, Default)]
struct ElementwiseMean {
    sum: f64,
    count: usize,
}

impl ElementwiseMean {
    fn update(&mut self, values: &[f64]) -> f64 {
        self.sum += values.iter().sum::<f64>();
        self.count += values.len();
        mean(values)
    }

    fn compute(&self) -> Option<f64> {
        (self.count > 0).then(|| self.sum / self.count as f64)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MeanAbsoluteError {
    state: ElementwiseMean,
}

impl Metric<DenseBackend> for MeanAbsoluteError {
    fn name(&self) -> &str {
        "mean_absolute_error"
    }

    fn update(&mut self, pred: &DenseTensor, target: Option<&DenseTensor>) -> Result<f64> {
        let target = require_target(self.name(), target)?;
        let abs = pred.zip_with(target, |p, t| f64::from(p - t).abs())?;
        Ok(self.state.update(&abs))
    }

    fn compute(&self) -> Option<f64> {
        self.state.compute()
    }

    fn reset(&mut self) {
        self.state = ElementwiseMean::default();
    }
}

#[derive(Debug, Clone, Default)]
pub struct MeanSquaredError {
    state: ElementwiseMean,
}

impl Metric<DenseBackend> for MeanSquaredError {
    fn name(&self) -> &str {
        "mean_squared_error"
    }

    fn update(&mut self, pred: &DenseTensor, target: Option<&DenseTensor>) -> Result<f64> {
        let target = require_target(self.name(), target)?;
        let sq = pred.zip_with(target, |p, t| f64::from(p - t).powi(2))?;
        Ok(self.state.update(&sq))
    }

    fn compute(&self) -> Option<f64> {
        self.state.compute()
    }

    fn reset(&mut self) {
        self.state = ElementwiseMean::default();
    }
}

/// `pred = weight * input + bias`, elementwise.
#[derive(Debug, Clone, Deserialize)]
pub struct Affine {
    #[serde(default = "default_weight")]
    pub weight: f32,
    #[serde(default)]
    pub bias: f32,
    #[serde(skip)]
    grad: Option<PredGrad>,
    #[serde(skip)]
    last_input: Option<DenseTensor>,
}

fn default_weight() -> f32 {
    1.0
}

impl Affine {
    pub fn new(weight: f32, bias: f32) -> Self {
        Self {
            weight,
            bias,
            grad: None,
            last_input: None,
        }
    }

    /// Read loss gradients from `grad` when the optimizer steps.
    pub fn with_gradients(mut self, grad: PredGrad) -> Self {
        self.grad = Some(grad);
        self
    }
}

impl Model<DenseBackend> for Affine {
    fn forward(&mut self, input: &DenseTensor, _ctx: ForwardContext) -> Result<DenseTensor> {
        if self.grad.is_some() {
            self.last_input = Some(input.clone());
        }
        let (w, b) = (self.weight, self.bias);
        Ok(input.map(|x| w * x + b))
    }

    fn parameters(&self) -> Vec<String> {
        vec!["weight".into(), "bias".into()]
    }

    fn apply_gradients(&mut self, update: &mut ParameterUpdate<'_>) -> Result<bool> {
        let (Some(slot), Some(input)) = (&self.grad, &self.last_input) else {
            return Ok(false);
        };
        let Some(grad) = slot.take() else {
            return Ok(false);
        };
        if grad.shape != input.shape {
            return Err(LighterError::component(
                "affine",
                format!(
                    "loss gradient of shape {:?} does not match the last input {:?}",
                    grad.shape, input.shape
                ),
            ));
        }
        let (grad_w, grad_b) = input
            .data
            .iter()
            .zip(&grad.data)
            .fold((0.0, 0.0), |(w, b), (x, g)| {
                (w + f64::from(*x) * f64::from(*g), b + f64::from(*g))
            });
        self.weight = update("weight", f64::from(self.weight), grad_w) as f32;
        self.bias = update("bias", f64::from(self.bias), grad_b) as f32;
        Ok(true)
    }
}

/// SGD with optional momentum and weight decay, per parameter group.
///
/// `p -= lr * v` with `v = momentum * v + grad + weight_decay * p`. Parameters outside every
/// group stay frozen.
#[derive(Debug, Clone)]
pub struct Sgd {
    groups: Vec<ParamGroup>,
    velocity: BTreeMap<String, f64>,
    steps: u64,
}

impl Sgd {
    pub fn new(groups: Vec<ParamGroup>) -> Self {
        Self {
            groups,
            velocity: BTreeMap::new(),
            steps: 0,
        }
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }
}

impl Optimizer<DenseBackend> for Sgd {
    fn name(&self) -> &str {
        "SGD"
    }

    fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }

    fn step(&mut self, model: &mut dyn Model<DenseBackend>, loss: &f64) -> Result<()> {
        if !loss.is_finite() {
            return Err(LighterError::component("SGD", format!("non-finite loss {loss}")));
        }
        let groups = &self.groups;
        let velocity = &mut self.velocity;
        let applied = model.apply_gradients(&mut |name, value, grad| {
            let Some(group) = groups.iter().find(|g| g.params.iter().any(|p| p == name)) else {
                return value;
            };
            let mut delta = grad + group.weight_decay * value;
            if let Some(momentum) = group.momentum.filter(|m| *m != 0.0) {
                let v = velocity.entry(name.to_string()).or_insert(0.0);
                *v = momentum * *v + delta;
                delta = *v;
            }
            value - group.lr * delta
        })?;
        if !applied {
            return Err(LighterError::component(
                "SGD",
                "the model recorded no gradients; pair it with a criterion that records them",
            ));
        }
        self.steps += 1;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct JsonlRecord {
    input: Value,
    #[serde(default)]
    target: Option<Value>,
    #[serde(default)]
    id: Option<SampleId>,
}

/// One sample per line: `{"input": ..., "target": ..., "id": ...}`.
///
/// Lines that do not parse are kept as corrupted samples so the loader's collate strategy
/// decides what to do with them.
#[derive(Debug, Clone)]
pub struct JsonlDataset {
    path: PathBuf,
    samples: Vec<Option<RawBatch<DenseTensor>>>,
}

#[derive(Debug, Deserialize)]
struct JsonlArgs {
    path: PathBuf,
}

impl JsonlDataset {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let content = std::fs::read_to_string(&path)?;
        let mut samples = Vec::new();
        let mut corrupted = 0;
        for line in content.lines().filter(|l| !l.trim().is_empty()) {
            let sample = parse_record(line);
            if sample.is_none() {
                corrupted += 1;
            }
            samples.push(sample);
        }
        if corrupted > 0 {
            tracing::warn!(path = %path.display(), corrupted, "dataset contains unreadable samples");
        }
        tracing::debug!(path = %path.display(), samples = samples.len(), "loaded jsonl dataset");
        Ok(Self { path, samples })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse_record(line: &str) -> Option<RawBatch<DenseTensor>> {
    let record: JsonlRecord = serde_json::from_str(line).ok()?;
    let mut raw = RawBatch::new();
    raw.insert(
        crate::batch::INPUT.into(),
        BatchField::Tensor(DenseTensor::from_json(&record.input).ok()?),
    );
    let target = match record.target {
        Some(Value::Null) | None => BatchField::Null,
        Some(value) => BatchField::Tensor(DenseTensor::from_json(&value).ok()?),
    };
    raw.insert(crate::batch::TARGET.into(), target);
    let id = match record.id {
        Some(id) => BatchField::Ids(vec![id]),
        None => BatchField::Null,
    };
    raw.insert(crate::batch::ID.into(), id);
    Some(raw)
}

impl Dataset<DenseBackend> for JsonlDataset {
    fn len(&self) -> usize {
        self.samples.len()
    }

    fn get(&self, index: usize) -> Result<Option<RawBatch<DenseTensor>>> {
        self.samples
            .get(index)
            .cloned()
            .ok_or_else(|| LighterError::data(format!("index {index} out of range")))
    }
}

/// Register the dense components under their root names.
///
/// Models and criteria built from this registry share one gradient slot, so a system built
/// from it trains with `sgd`.
pub fn register(registry: &mut Registry<DenseBackend>) {
    let grad = PredGrad::default();
    let (model_grad, mse_grad, l1_grad) = (grad.clone(), grad.clone(), grad);
    registry
        .root_mut()
        .register_model("affine", move |args| {
            let model: Affine = parse_args("affine", args)?;
            Ok(Box::new(model.with_gradients(model_grad.clone())))
        })
        .register_criterion("mse", move |_| Ok(Box::new(Mse::recording(mse_grad.clone()))))
        .register_criterion("l1", move |_| Ok(Box::new(L1::recording(l1_grad.clone()))))
        .register_metric("mean_absolute_error", |_| {
            Ok(Box::new(MeanAbsoluteError::default()))
        })
        .register_metric("mean_squared_error", |_| {
            Ok(Box::new(MeanSquaredError::default()))
        })
        .register_optimizer("sgd", |groups, _| Ok(Box::new(Sgd::new(groups))))
        .register_dataset("jsonl", |args| {
            let args: JsonlArgs = parse_args("jsonl", args)?;
            Ok(Arc::new(JsonlDataset::open(args.path)?))
        });
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn t(shape: &[usize], data: &[f32]) -> DenseTensor {
        DenseTensor::new(shape.to_vec(), data.to_vec()).unwrap()
    }

    #[test]
    fn test_new_checks_length() {
        assert!(DenseTensor::new(vec![2, 2], vec![1.0; 3]).is_err());
        assert_eq!(DenseTensor::scalar(2.0).shape(), &[] as &[usize]);
    }

    #[test]
    fn test_from_json() {
        let tensor = DenseTensor::from_json(&json!([[1, 2, 3], [4, 5, 6]])).unwrap();
        assert_eq!(tensor.shape(), &[2, 3]);
        assert_eq!(tensor.data(), &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(DenseTensor::from_json(&json!(0.5)).unwrap().shape(), &[] as &[usize]);
        assert!(DenseTensor::from_json(&json!([[1, 2], [3]])).is_err());
        assert!(DenseTensor::from_json(&json!("x")).is_err());
    }

    #[test]
    fn test_stack_split_concat() {
        let stacked = DenseBackend::stack(vec![t(&[2], &[1.0, 2.0]), t(&[2], &[3.0, 4.0])]).unwrap();
        assert_eq!(stacked.shape(), &[2, 2]);
        assert_eq!(DenseBackend::batch_size(&stacked), 2);

        let parts = DenseBackend::split(&stacked, 1).unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[1].data(), &[3.0, 4.0]);
        assert_eq!(DenseBackend::concat(parts).unwrap(), stacked);

        assert!(DenseBackend::stack(vec![t(&[2], &[1.0, 2.0]), t(&[1], &[3.0])]).is_err());
        assert!(DenseBackend::split(&DenseTensor::scalar(1.0), 1).is_err());
    }

    #[test]
    fn test_criteria() {
        let input = t(&[2], &[0.0, 0.0]);
        let pred = t(&[2], &[1.0, 3.0]);
        let target = t(&[2], &[0.0, 0.0]);
        let args = CriterionInput {
            input: &input,
            pred: &pred,
            target: Some(&target),
        };
        assert_eq!(Mse::default().compute(args).unwrap(), Loss::Scalar(5.0));
        assert_eq!(L1::default().compute(args).unwrap(), Loss::Scalar(2.0));
        let no_target = CriterionInput {
            target: None,
            ..args
        };
        assert!(Mse::default().compute(no_target).is_err());
    }

    #[test]
    fn test_criteria_record_prediction_gradients() {
        let input = t(&[2], &[0.0, 0.0]);
        let pred = t(&[2], &[1.0, 3.0]);
        let target = t(&[2], &[0.0, 3.0]);
        let args = CriterionInput {
            input: &input,
            pred: &pred,
            target: Some(&target),
        };
        let grad = PredGrad::default();
        Mse::recording(grad.clone()).compute(args).unwrap();
        assert_eq!(grad.take().unwrap().data(), &[1.0, 0.0]);
        assert!(grad.take().is_none());

        L1::recording(grad.clone()).compute(args).unwrap();
        assert_eq!(grad.take().unwrap().data(), &[0.5, 0.0]);
    }

    #[test]
    fn test_affine() {
        let mut model = Affine::new(2.0, 1.0);
        let out = model
            .forward(&t(&[2], &[1.0, 2.0]), ForwardContext::default())
            .unwrap();
        assert_eq!(out.data(), &[3.0, 5.0]);
    }

    fn group(params: &[&str], lr: f64, momentum: Option<f64>) -> ParamGroup {
        ParamGroup {
            params: params.iter().map(|p| p.to_string()).collect(),
            lr,
            momentum,
            betas: None,
            weight_decay: 0.0,
        }
    }

    /// One forward and `mse` pass over `x = [1, 2]`, `t = [2, 4]`.
    fn mse_pass(model: &mut Affine, grad: &PredGrad) -> f64 {
        let input = t(&[2, 1], &[1.0, 2.0]);
        let target = t(&[2, 1], &[2.0, 4.0]);
        let pred = model.forward(&input, ForwardContext::default()).unwrap();
        let loss = Mse::recording(grad.clone())
            .compute(CriterionInput {
                input: &input,
                pred: &pred,
                target: Some(&target),
            })
            .unwrap();
        *loss.total().unwrap()
    }

    #[test]
    fn test_sgd_updates_affine_parameters() {
        let grad = PredGrad::default();
        let mut model = Affine::new(0.0, 0.0).with_gradients(grad.clone());
        let mut sgd = Sgd::new(vec![group(&["weight", "bias"], 0.1, None)]);

        let loss = mse_pass(&mut model, &grad);
        assert_eq!(loss, 10.0);
        sgd.step(&mut model, &loss).unwrap();
        // d/dpred = [-2, -4]; d/dw = -10, d/db = -6
        assert!((model.weight - 1.0).abs() < 1e-6);
        assert!((model.bias - 0.6).abs() < 1e-6);
        assert_eq!(sgd.steps(), 1);

        assert!(mse_pass(&mut model, &grad) < loss);
    }

    #[test]
    fn test_sgd_momentum_and_frozen_parameters() {
        let grad = PredGrad::default();
        let mut model = Affine::new(0.0, 0.0).with_gradients(grad.clone());
        let mut sgd = Sgd::new(vec![group(&["weight"], 0.1, Some(0.5))]);

        let loss = mse_pass(&mut model, &grad);
        sgd.step(&mut model, &loss).unwrap();
        assert!((model.weight - 1.0).abs() < 1e-6);
        assert_eq!(model.bias, 0.0);

        // pred = [1, 2]; d/dw = -5; v = 0.5 * -10 + -5
        let loss = mse_pass(&mut model, &grad);
        sgd.step(&mut model, &loss).unwrap();
        assert!((model.weight - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_sgd_without_gradients_is_an_error() {
        let mut sgd = Sgd::new(vec![group(&["weight"], 0.1, None)]);
        let mut model = Affine::new(1.0, 0.0);
        let err = sgd.step(&mut model, &0.5).unwrap_err();
        assert!(err.to_string().contains("no gradients"));
        assert_eq!(sgd.steps(), 0);
        assert!(sgd.step(&mut model, &f64::NAN).is_err());
        assert_eq!(Optimizer::<DenseBackend>::name(&sgd), "SGD");
    }

    #[test]
    fn test_jsonl_dataset_marks_bad_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"input": [1, 2], "target": [0, 0], "id": 7}}"#).unwrap();
        writeln!(file, "not json").unwrap();
        writeln!(file).unwrap();
        writeln!(file, r#"{{"input": [3, 4]}}"#).unwrap();
        let ds = JsonlDataset::open(file.path()).unwrap();
        assert_eq!(ds.len(), 3);

        let first = ds.get(0).unwrap().unwrap();
        assert_eq!(first["id"], BatchField::Ids(vec![SampleId::Int(7)]));
        assert!(ds.get(1).unwrap().is_none());
        let third = ds.get(2).unwrap().unwrap();
        assert_eq!(third["target"], BatchField::Null);
        assert!(ds.get(3).is_err());
    }
}
