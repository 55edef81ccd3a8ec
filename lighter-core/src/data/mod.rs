//! Datasets, dataloader factories and batch iteration.

pub mod collate;

pub use collate::{Collate, CollateKind, DefaultCollate, ReplaceCorrupted};

use crate::backend::Backend;
use crate::batch::RawBatch;
use crate::error::Result;
use crate::mode::Mode;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Deserialize;
use std::sync::Arc;

/// Indexable source of samples.
pub trait Dataset<B: Backend>: Send + Sync {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Load one sample. `Ok(None)` marks a corrupted sample the collate strategy may replace.
    fn get(&self, index: usize) -> Result<Option<RawBatch<B::Tensor>>>;
}

/// Loader options under `system.dataloaders.<mode>` (besides `dataset`).
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoaderSettings {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Defaults to `true` for the train loader and `false` elsewhere.
    #[serde(default)]
    pub shuffle: Option<bool>,
    #[serde(default)]
    pub drop_last: bool,
    #[serde(default)]
    pub collate: CollateKind,
}

fn default_batch_size() -> usize {
    1
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            shuffle: None,
            drop_last: false,
            collate: CollateKind::default(),
        }
    }
}

/// Builds a fresh [`DataLoader`] for one mode each time the engine asks for it.
pub struct DataLoaderFactory<B: Backend> {
    mode: Mode,
    dataset: Arc<dyn Dataset<B>>,
    settings: LoaderSettings,
}

impl<B: Backend> Clone for DataLoaderFactory<B> {
    fn clone(&self) -> Self {
        Self {
            mode: self.mode,
            dataset: Arc::clone(&self.dataset),
            settings: self.settings.clone(),
        }
    }
}

impl<B: Backend> DataLoaderFactory<B> {
    pub fn new(mode: Mode, dataset: Arc<dyn Dataset<B>>, settings: LoaderSettings) -> Self {
        Self {
            mode,
            dataset,
            settings,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn settings(&self) -> &LoaderSettings {
        &self.settings
    }

    pub fn dataset_len(&self) -> usize {
        self.dataset.len()
    }

    /// Build a loader. `seed` drives shuffling and corrupted-sample replacement.
    pub fn build(&self, seed: u64) -> DataLoader<B> {
        let shuffle = self.settings.shuffle.unwrap_or(self.mode == Mode::Train);
        let collate: Box<dyn Collate<B>> = match self.settings.collate {
            CollateKind::Default => Box::new(DefaultCollate),
            CollateKind::ReplaceCorrupted => Box::new(ReplaceCorrupted::new(
                Arc::clone(&self.dataset),
                StdRng::seed_from_u64(seed.wrapping_add(1)),
            )),
        };
        DataLoader::new(
            Arc::clone(&self.dataset),
            self.settings.batch_size.max(1),
            shuffle,
            self.settings.drop_last,
            collate,
            seed,
        )
    }
}

/// Iterates a dataset in batches.
pub struct DataLoader<B: Backend> {
    dataset: Arc<dyn Dataset<B>>,
    collate: Box<dyn Collate<B>>,
    order: Vec<usize>,
    batch_size: usize,
    drop_last: bool,
    cursor: usize,
}

impl<B: Backend> DataLoader<B> {
    pub fn new(
        dataset: Arc<dyn Dataset<B>>,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        collate: Box<dyn Collate<B>>,
        seed: u64,
    ) -> Self {
        let mut order: Vec<usize> = (0..dataset.len()).collect();
        if shuffle {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        Self {
            dataset,
            collate,
            order,
            batch_size,
            drop_last,
            cursor: 0,
        }
    }

    /// Number of batches this loader yields.
    pub fn len(&self) -> usize {
        let n = self.order.len();
        if self.drop_last {
            n / self.batch_size
        } else {
            n.div_ceil(self.batch_size)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn next_batch(&mut self) -> Result<RawBatch<B::Tensor>> {
        let end = (self.cursor + self.batch_size).min(self.order.len());
        let indices = &self.order[self.cursor..end];
        self.cursor = end;
        let samples = indices
            .iter()
            .map(|&i| self.dataset.get(i))
            .collect::<Result<Vec<_>>>()?;
        self.collate.collate(samples)
    }
}

impl<B: Backend> Iterator for DataLoader<B> {
    type Item = Result<RawBatch<B::Tensor>>;

    fn next(&mut self) -> Option<Self::Item> {
        let remaining = self.order.len() - self.cursor;
        if remaining == 0 || (self.drop_last && remaining < self.batch_size) {
            return None;
        }
        Some(self.next_batch())
    }
}
