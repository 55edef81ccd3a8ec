//! Cross-replica reduction of epoch aggregates.

use crate::error::Result;

/// Sums values element-wise across every replica of a distributed run.
///
/// Each replica passes a buffer of the same length; on return every replica holds the
/// element-wise total.
pub trait Reducer: Send {
    fn all_reduce_sum(&mut self, values: &mut [f64]) -> Result<()>;

    fn world_size(&self) -> usize {
        1
    }
}

/// Single-replica reducer. Leaves values untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalReducer;

impl Reducer for LocalReducer {
    fn all_reduce_sum(&mut self, _values: &mut [f64]) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_reducer_is_identity() {
        let mut values = [1.0, 2.0, 3.0];
        LocalReducer.all_reduce_sum(&mut values).unwrap();
        assert_eq!(values, [1.0, 2.0, 3.0]);
        assert_eq!(LocalReducer.world_size(), 1);
    }
}
