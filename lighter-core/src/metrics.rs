//! Accumulating metrics and per-mode metric collections.

use crate::backend::Backend;
use crate::error::{ConfigError, Result};
use std::collections::BTreeMap;

/// A metric that accumulates state across steps.
///
/// `update` folds one batch into the running state and returns the batch value; `compute`
/// returns the value over everything seen since the last `reset`.
pub trait Metric<B: Backend>: Send {
    fn name(&self) -> &str;

    fn update(&mut self, pred: &B::Tensor, target: Option<&B::Tensor>) -> Result<f64>;

    fn compute(&self) -> Option<f64>;

    fn reset(&mut self);
}

/// Named group of metrics evaluated together for one mode.
pub struct MetricCollection<B: Backend> {
    metrics: BTreeMap<String, Box<dyn Metric<B>>>,
}

impl<B: Backend> Default for MetricCollection<B> {
    fn default() -> Self {
        Self {
            metrics: BTreeMap::new(),
        }
    }
}

impl<B: Backend> MetricCollection<B> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a metric under its own name. Duplicate names are rejected.
    pub fn push(&mut self, metric: Box<dyn Metric<B>>) -> Result<()> {
        let name = metric.name().to_string();
        self.insert(name, metric)
    }

    /// Add a metric under an explicit name. Duplicate names are rejected.
    pub fn insert(&mut self, name: impl Into<String>, metric: Box<dyn Metric<B>>) -> Result<()> {
        let name = name.into();
        if self.metrics.contains_key(&name) {
            return Err(ConfigError::invalid(
                format!("system.metrics.{name}"),
                "duplicate metric name",
            )
            .into());
        }
        self.metrics.insert(name, metric);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.metrics.keys().map(String::as_str).collect()
    }

    /// Update every metric with one batch and return the batch values by name.
    pub fn update(
        &mut self,
        pred: &B::Tensor,
        target: Option<&B::Tensor>,
    ) -> Result<BTreeMap<String, f64>> {
        self.metrics
            .iter_mut()
            .map(|(name, metric)| metric.update(pred, target).map(|v| (name.clone(), v)))
            .collect()
    }

    /// Values accumulated since the last reset. Metrics with no data are skipped.
    pub fn compute(&self) -> BTreeMap<String, f64> {
        self.metrics
            .iter()
            .filter_map(|(name, metric)| metric.compute().map(|v| (name.clone(), v)))
            .collect()
    }

    pub fn reset(&mut self) {
        for metric in self.metrics.values_mut() {
            metric.reset();
        }
    }
}

impl<B: Backend> std::fmt::Debug for MetricCollection<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricCollection")
            .field("metrics", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense::{DenseBackend, DenseTensor, MeanAbsoluteError, MeanSquaredError};

    fn tensor(values: &[f32]) -> DenseTensor {
        DenseTensor::new(vec![values.len()], values.to_vec()).unwrap()
    }

    #[test]
    fn test_update_and_compute() {
        let mut coll = MetricCollection::<DenseBackend>::new();
        coll.push(Box::new(MeanAbsoluteError::default())).unwrap();
        coll.push(Box::new(MeanSquaredError::default())).unwrap();
        assert_eq!(coll.names(), vec!["mean_absolute_error", "mean_squared_error"]);

        let step = coll
            .update(&tensor(&[1.0, 2.0]), Some(&tensor(&[0.0, 0.0])))
            .unwrap();
        assert_eq!(step["mean_absolute_error"], 1.5);
        assert_eq!(step["mean_squared_error"], 2.5);

        coll.update(&tensor(&[0.0, 0.0]), Some(&tensor(&[0.0, 0.0])))
            .unwrap();
        let epoch = coll.compute();
        assert_eq!(epoch["mean_absolute_error"], 0.75);

        coll.reset();
        assert!(coll.compute().is_empty());
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut coll = MetricCollection::<DenseBackend>::new();
        coll.push(Box::new(MeanAbsoluteError::default())).unwrap();
        assert!(coll.push(Box::new(MeanAbsoluteError::default())).is_err());
        assert!(coll
            .insert("mae", Box::new(MeanAbsoluteError::default()))
            .is_ok());
        assert_eq!(coll.len(), 2);
    }
}
