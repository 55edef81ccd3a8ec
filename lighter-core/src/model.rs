//! Model and inferer collaborator traits.

use crate::backend::Backend;
use crate::error::{LighterError, Result};
use serde::{Deserialize, Serialize};

/// Optional scheduling signals a model may receive on each forward pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCapabilities {
    /// The model wants the current epoch.
    pub epoch: bool,
    /// The model wants the global step count.
    pub step: bool,
}

/// Context handed to [`Model::forward`]. Fields the model did not ask for stay `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardContext {
    pub epoch: Option<usize>,
    pub step: Option<usize>,
}

impl ForwardContext {
    /// Build the context for a model with the given capabilities.
    pub fn for_capabilities(caps: ModelCapabilities, epoch: usize, step: usize) -> Self {
        Self {
            epoch: caps.epoch.then_some(epoch),
            step: caps.step.then_some(step),
        }
    }
}

/// A trainable model.
pub trait Model<B: Backend>: Send {
    fn forward(&mut self, input: &B::Tensor, ctx: ForwardContext) -> Result<B::Tensor>;

    /// Names of the trainable parameters, used to build optimizer parameter groups.
    fn parameters(&self) -> Vec<String>;

    /// Declares which optional forward context fields this model accepts.
    fn capabilities(&self) -> ModelCapabilities {
        ModelCapabilities::default()
    }

    /// Update parameters in place from the gradients of the last loss.
    ///
    /// `update(name, value, grad)` returns the new value of one parameter. Returns `false`
    /// when the model holds no gradients, as for models whose engine owns the backward pass.
    fn apply_gradients(&mut self, _update: &mut ParameterUpdate<'_>) -> Result<bool> {
        Ok(false)
    }
}

/// Per-parameter update rule an optimizer hands to [`Model::apply_gradients`].
pub type ParameterUpdate<'a> = dyn FnMut(&str, f64, f64) -> f64 + 'a;

/// A prediction function handed to an inferer. Wraps the model's forward pass.
pub type Predictor<'a, B> = dyn FnMut(&<B as Backend>::Tensor) -> Result<<B as Backend>::Tensor> + 'a;

/// An alternate prediction strategy used outside of training
/// (sliding windows, patches, test-time augmentation).
pub trait Inferer<B: Backend>: Send {
    fn infer(&mut self, input: &B::Tensor, predictor: &mut Predictor<'_, B>) -> Result<B::Tensor>;
}

/// Runs the predictor over chunks of the batch and concatenates the results.
#[derive(Debug, Clone)]
pub struct ChunkedInferer {
    chunk_size: usize,
}

impl ChunkedInferer {
    pub fn new(chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(LighterError::component(
                "chunked inferer",
                "chunk_size must be at least 1",
            ));
        }
        Ok(Self { chunk_size })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }
}

impl<B: Backend> Inferer<B> for ChunkedInferer {
    fn infer(&mut self, input: &B::Tensor, predictor: &mut Predictor<'_, B>) -> Result<B::Tensor> {
        let chunks = B::split(input, self.chunk_size)?;
        if chunks.is_empty() {
            return predictor(input);
        }
        let preds = chunks
            .iter()
            .map(|chunk| predictor(chunk))
            .collect::<Result<Vec<_>>>()?;
        B::concat(preds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense::{DenseBackend, DenseTensor};

    #[test]
    fn test_forward_context_respects_capabilities() {
        let none = ForwardContext::for_capabilities(ModelCapabilities::default(), 3, 40);
        assert_eq!(none, ForwardContext::default());

        let both = ForwardContext::for_capabilities(
            ModelCapabilities {
                epoch: true,
                step: true,
            },
            3,
            40,
        );
        assert_eq!(both.epoch, Some(3));
        assert_eq!(both.step, Some(40));

        let step_only = ForwardContext::for_capabilities(
            ModelCapabilities {
                epoch: false,
                step: true,
            },
            3,
            40,
        );
        assert_eq!(step_only.epoch, None);
        assert_eq!(step_only.step, Some(40));
    }

    #[test]
    fn test_chunked_inferer_calls_per_chunk() {
        let input = DenseTensor::new(vec![5, 1], vec![1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
        let mut inferer = ChunkedInferer::new(2).unwrap();
        let mut calls = 0;
        let mut double = |t: &DenseTensor| -> Result<DenseTensor> {
            calls += 1;
            Ok(t.map(|v| v * 2.0))
        };
        let out = Inferer::<DenseBackend>::infer(&mut inferer, &input, &mut double).unwrap();
        assert_eq!(calls, 3);
        assert_eq!(out.shape(), &[5, 1]);
        assert_eq!(out.data(), &[2.0, 4.0, 6.0, 8.0, 10.0]);
    }

    #[test]
    fn test_chunked_inferer_passes_empty_batch_through() {
        let input = DenseTensor::new(vec![0, 3], Vec::new()).unwrap();
        let mut inferer = ChunkedInferer::new(2).unwrap();
        let mut calls = 0;
        let mut identity = |t: &DenseTensor| -> Result<DenseTensor> {
            calls += 1;
            Ok(t.clone())
        };
        let out = Inferer::<DenseBackend>::infer(&mut inferer, &input, &mut identity).unwrap();
        assert_eq!(calls, 1);
        assert_eq!(out.shape(), &[0, 3]);
    }

    #[test]
    fn test_chunked_inferer_rejects_zero() {
        assert!(ChunkedInferer::new(0).is_err());
    }
}
