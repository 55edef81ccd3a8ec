//! Batch assembly strategies.
//!
//! A collate strategy turns the samples drawn for one batch into a single [`RawBatch`].
//! Strategies are chosen per dataloader instead of patching any shared table.

use crate::backend::Backend;
use crate::batch::{BatchField, RawBatch};
use crate::data::Dataset;
use crate::error::{LighterError, Result};
use rand::Rng;
use rand::rngs::StdRng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Strategy names accepted in `system.dataloaders.<mode>.collate`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollateKind {
    #[default]
    Default,
    ReplaceCorrupted,
}

pub trait Collate<B: Backend>: Send {
    /// Assemble one batch. `None` marks a sample the dataset could not produce.
    fn collate(&mut self, samples: Vec<Option<RawBatch<B::Tensor>>>) -> Result<RawBatch<B::Tensor>>;
}

/// Stacks tensors, concatenates ids and keeps all-null fields as `Null`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultCollate;

impl DefaultCollate {
    pub fn stack<B: Backend>(samples: Vec<RawBatch<B::Tensor>>) -> Result<RawBatch<B::Tensor>> {
        let Some(first) = samples.first() else {
            return Err(LighterError::data("cannot collate an empty batch"));
        };
        let keys: Vec<String> = first.keys().cloned().collect();

        let mut columns: BTreeMap<String, Vec<BatchField<B::Tensor>>> =
            keys.iter().map(|k| (k.clone(), Vec::with_capacity(samples.len()))).collect();
        for (i, sample) in samples.into_iter().enumerate() {
            if sample.len() != keys.len() || !keys.iter().all(|k| sample.contains_key(k)) {
                return Err(LighterError::data(format!(
                    "sample {i} has keys {:?}, expected {keys:?}",
                    sample.keys().collect::<Vec<_>>()
                )));
            }
            for (key, field) in sample {
                if let Some(column) = columns.get_mut(&key) {
                    column.push(field);
                }
            }
        }

        columns
            .into_iter()
            .map(|(key, column)| {
                let field = collate_column::<B>(&key, column)?;
                Ok((key, field))
            })
            .collect()
    }
}

fn collate_column<B: Backend>(
    key: &str,
    column: Vec<BatchField<B::Tensor>>,
) -> Result<BatchField<B::Tensor>> {
    if column.iter().all(BatchField::is_null) {
        return Ok(BatchField::Null);
    }
    if column.iter().all(|f| matches!(f, BatchField::Ids(_))) {
        let ids = column
            .into_iter()
            .flat_map(|f| match f {
                BatchField::Ids(ids) => ids,
                _ => Vec::new(),
            })
            .collect();
        return Ok(BatchField::Ids(ids));
    }
    let mut tensors = Vec::with_capacity(column.len());
    for field in column {
        match field {
            BatchField::Tensor(t) => tensors.push(t),
            _ => {
                return Err(LighterError::data(format!(
                    "field '{key}' mixes tensors with ids or nulls across samples"
                )));
            }
        }
    }
    Ok(BatchField::Tensor(B::stack(tensors)?))
}

impl<B: Backend> Collate<B> for DefaultCollate {
    fn collate(&mut self, samples: Vec<Option<RawBatch<B::Tensor>>>) -> Result<RawBatch<B::Tensor>> {
        let samples = samples
            .into_iter()
            .enumerate()
            .map(|(i, s)| {
                s.ok_or_else(|| {
                    LighterError::data(format!(
                        "sample {i} of the batch is missing; use `collate: replace_corrupted` \
                         to substitute corrupted samples"
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        DefaultCollate::stack::<B>(samples)
    }
}

/// Drops missing samples and refills the batch with randomly drawn valid ones.
pub struct ReplaceCorrupted<B: Backend> {
    dataset: Arc<dyn Dataset<B>>,
    rng: StdRng,
    max_attempts: usize,
}

impl<B: Backend> ReplaceCorrupted<B> {
    pub fn new(dataset: Arc<dyn Dataset<B>>, rng: StdRng) -> Self {
        Self {
            dataset,
            rng,
            max_attempts: 100,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

impl<B: Backend> Collate<B> for ReplaceCorrupted<B> {
    fn collate(&mut self, samples: Vec<Option<RawBatch<B::Tensor>>>) -> Result<RawBatch<B::Tensor>> {
        let wanted = samples.len();
        let mut valid: Vec<RawBatch<B::Tensor>> = samples.into_iter().flatten().collect();
        let dropped = wanted - valid.len();
        if dropped > 0 {
            tracing::debug!(dropped, "replacing corrupted samples");
        }

        let len = self.dataset.len();
        let mut attempts = 0;
        while valid.len() < wanted {
            if len == 0 || attempts >= self.max_attempts {
                return Err(LighterError::data(format!(
                    "could not replace corrupted samples after {attempts} attempts"
                )));
            }
            attempts += 1;
            let index = self.rng.gen_range(0..len);
            if let Some(sample) = self.dataset.get(index)? {
                valid.push(sample);
            }
        }
        DefaultCollate::stack::<B>(valid)
    }
}
