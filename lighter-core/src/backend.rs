//! The tensor backend a system is generic over.
//!
//! Lighter never does numeric work itself. It only needs to move tensors between
//! collaborators, read scalar losses for logging, and stack or split along the batch
//! dimension when collating samples or running chunked inference.

use crate::error::Result;
use std::fmt::Debug;

pub trait Backend: Sized + Send + Sync + 'static {
    /// Tensor-like value flowing through model, criterion and metrics.
    type Tensor: Clone + Debug + Send + Sync;
    /// Scalar loss value. Engines use it for the backward pass.
    type Scalar: Clone + Debug + Send + Sync;

    /// Read a scalar loss as `f64` for logging.
    fn scalar_value(scalar: &Self::Scalar) -> f64;

    /// Number of samples along the batch dimension.
    fn batch_size(tensor: &Self::Tensor) -> usize;

    /// Stack per-sample tensors into a batch.
    fn stack(items: Vec<Self::Tensor>) -> Result<Self::Tensor>;

    /// Split a batch into chunks of at most `chunk` samples.
    fn split(tensor: &Self::Tensor, chunk: usize) -> Result<Vec<Self::Tensor>>;

    /// Concatenate batches along the batch dimension.
    fn concat(items: Vec<Self::Tensor>) -> Result<Self::Tensor>;
}
