//! Loss values and the criterion adapter.

use crate::backend::Backend;
use crate::error::{LighterError, Result};
use std::collections::BTreeMap;

/// Key a multi-term loss must carry.
pub const TOTAL: &str = "total";

/// A criterion's output: a single scalar or a set of named sub-losses.
#[derive(Debug, Clone, PartialEq)]
pub enum Loss<S> {
    Scalar(S),
    Terms(BTreeMap<String, S>),
}

impl<S> Loss<S> {
    /// Build a multi-term loss from `(name, value)` pairs.
    pub fn terms<K: Into<String>>(terms: impl IntoIterator<Item = (K, S)>) -> Self {
        Loss::Terms(terms.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Fails with `MissingTotalLoss` for a multi-term loss without `"total"`.
    pub fn check_total(&self) -> Result<()> {
        match self {
            Loss::Terms(terms) if !terms.contains_key(TOTAL) => Err(LighterError::MissingTotalLoss {
                keys: terms.keys().cloned().collect(),
            }),
            _ => Ok(()),
        }
    }

    /// The value the engine optimizes: the scalar itself or the `"total"` term.
    pub fn total(&self) -> Result<&S> {
        match self {
            Loss::Scalar(s) => Ok(s),
            Loss::Terms(terms) => terms.get(TOTAL).ok_or_else(|| LighterError::MissingTotalLoss {
                keys: terms.keys().cloned().collect(),
            }),
        }
    }

    /// Consume the loss and keep only the value the engine optimizes.
    pub fn into_total(self) -> Result<S> {
        match self {
            Loss::Scalar(s) => Ok(s),
            Loss::Terms(mut terms) => match terms.remove(TOTAL) {
                Some(total) => Ok(total),
                None => Err(LighterError::MissingTotalLoss {
                    keys: terms.into_keys().collect(),
                }),
            },
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(&S) -> U) -> Loss<U> {
        match self {
            Loss::Scalar(s) => Loss::Scalar(f(s)),
            Loss::Terms(terms) => Loss::Terms(terms.iter().map(|(k, v)| (k.clone(), f(v))).collect()),
        }
    }
}

/// Everything a criterion may want to look at. Implementations pick what they need.
#[derive(Debug)]
pub struct CriterionInput<'a, T> {
    pub input: &'a T,
    pub pred: &'a T,
    pub target: Option<&'a T>,
}

impl<T> Clone for CriterionInput<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for CriterionInput<'_, T> {}

/// A loss function.
pub trait Criterion<B: Backend>: Send {
    fn compute(&mut self, args: CriterionInput<'_, B::Tensor>) -> Result<Loss<B::Scalar>>;
}

/// Adapts a `(pred, target)` closure into a [`Criterion`]. A missing target is an error.
pub struct PredTarget<F> {
    name: String,
    f: F,
}

impl<F> PredTarget<F> {
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<B, F> Criterion<B> for PredTarget<F>
where
    B: Backend,
    F: FnMut(&B::Tensor, &B::Tensor) -> Result<Loss<B::Scalar>> + Send,
{
    fn compute(&mut self, args: CriterionInput<'_, B::Tensor>) -> Result<Loss<B::Scalar>> {
        let target = args.target.ok_or_else(|| {
            LighterError::component(&self.name, "criterion requires a target but the batch has none")
        })?;
        (self.f)(args.pred, target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense::{DenseBackend, DenseTensor};

    #[test]
    fn test_total_of_scalar() {
        let loss = Loss::Scalar(0.3);
        assert_eq!(*loss.total().unwrap(), 0.3);
        assert!(loss.check_total().is_ok());
    }

    #[test]
    fn test_total_of_terms() {
        let loss = Loss::terms([("total", 0.5), ("aux", 0.2)]);
        assert_eq!(*loss.total().unwrap(), 0.5);
        assert!(loss.check_total().is_ok());
        assert_eq!(loss.into_total().unwrap(), 0.5);
    }

    #[test]
    fn test_missing_total() {
        let loss = Loss::terms([("dice", 0.5), ("aux", 0.2)]);
        match loss.check_total() {
            Err(LighterError::MissingTotalLoss { keys }) => {
                assert_eq!(keys, vec!["aux".to_string(), "dice".to_string()])
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(loss.total().is_err());
    }

    #[test]
    fn test_map() {
        let loss = Loss::terms([("total", 2), ("aux", 1)]).map(|v| *v as f64 * 0.5);
        assert_eq!(loss, Loss::terms([("total", 1.0), ("aux", 0.5)]));
    }

    #[test]
    fn test_pred_target_adapter() {
        let mut crit = PredTarget::new(
            "diff",
            |pred: &DenseTensor, target: &DenseTensor| -> Result<Loss<f64>> {
                Ok(Loss::Scalar((pred.data()[0] - target.data()[0]) as f64))
            },
        );
        let input = DenseTensor::scalar(0.0);
        let pred = DenseTensor::scalar(3.0);
        let target = DenseTensor::scalar(1.0);

        let loss = Criterion::<DenseBackend>::compute(
            &mut crit,
            CriterionInput {
                input: &input,
                pred: &pred,
                target: Some(&target),
            },
        )
        .unwrap();
        assert_eq!(loss, Loss::Scalar(2.0));

        let err = Criterion::<DenseBackend>::compute(
            &mut crit,
            CriterionInput {
                input: &input,
                pred: &pred,
                target: None,
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("requires a target"));
    }
}
