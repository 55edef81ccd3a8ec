//! Batch schema and validation.
//!
//! Dataloaders hand the system loosely-typed mappings. Before a step runs, the mapping is
//! normalized into a [`Batch`]: an `input`, an optional `target` and optional sample ids.
//! Any other key is rejected so that typos in dataset code surface immediately.

use crate::error::{InvalidBatchError, InvalidBatchReason};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const INPUT: &str = "input";
pub const TARGET: &str = "target";
pub const ID: &str = "id";

/// Identifier of a single sample.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SampleId {
    Int(i64),
    Str(String),
}

impl fmt::Display for SampleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleId::Int(i) => write!(f, "{i}"),
            SampleId::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for SampleId {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<&str> for SampleId {
    fn from(value: &str) -> Self {
        Self::Str(value.to_string())
    }
}

/// A value inside a raw batch mapping.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchField<T> {
    Tensor(T),
    Ids(Vec<SampleId>),
    Null,
}

impl<T> BatchField<T> {
    pub fn is_null(&self) -> bool {
        matches!(self, BatchField::Null)
    }

    fn kind(&self) -> &'static str {
        match self {
            BatchField::Tensor(_) => "tensor",
            BatchField::Ids(_) => "ids",
            BatchField::Null => "null",
        }
    }
}

/// The mapping a dataloader yields for one batch (or a dataset for one sample).
pub type RawBatch<T> = BTreeMap<String, BatchField<T>>;

/// A validated batch.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch<T> {
    pub id: Option<Vec<SampleId>>,
    pub input: T,
    pub target: Option<T>,
}

impl<T> Batch<T> {
    pub fn new(input: T) -> Self {
        Self {
            id: None,
            input,
            target: None,
        }
    }

    pub fn with_target(mut self, target: T) -> Self {
        self.target = Some(target);
        self
    }

    pub fn with_ids(mut self, ids: Vec<SampleId>) -> Self {
        self.id = Some(ids);
        self
    }

    /// Validate a raw mapping against the `{input, target?, id?}` schema.
    ///
    /// `Null` values for `target` and `id` are treated as absent.
    pub fn validate(raw: RawBatch<T>) -> Result<Self, InvalidBatchError> {
        let unexpected: Vec<String> = raw
            .keys()
            .filter(|k| !matches!(k.as_str(), INPUT | TARGET | ID))
            .cloned()
            .collect();
        if !unexpected.is_empty() {
            return Err(InvalidBatchReason::UnexpectedKeys(unexpected).into());
        }

        let mut raw = raw;
        let input = match raw.remove(INPUT) {
            None | Some(BatchField::Null) => return Err(InvalidBatchReason::MissingInput.into()),
            Some(BatchField::Tensor(t)) => t,
            Some(other) => return Err(wrong_kind(INPUT, "a tensor", &other)),
        };
        let target = match raw.remove(TARGET) {
            None | Some(BatchField::Null) => None,
            Some(BatchField::Tensor(t)) => Some(t),
            Some(other) => return Err(wrong_kind(TARGET, "a tensor or null", &other)),
        };
        let id = match raw.remove(ID) {
            None | Some(BatchField::Null) => None,
            Some(BatchField::Ids(ids)) => Some(ids),
            Some(other) => return Err(wrong_kind(ID, "a list of sample ids or null", &other)),
        };

        Ok(Self { id, input, target })
    }
}

impl<T> TryFrom<RawBatch<T>> for Batch<T> {
    type Error = InvalidBatchError;

    fn try_from(raw: RawBatch<T>) -> Result<Self, Self::Error> {
        Batch::validate(raw)
    }
}

impl<T> From<Batch<T>> for RawBatch<T> {
    /// Absent optional fields are omitted rather than written as `Null`.
    fn from(batch: Batch<T>) -> Self {
        let mut raw = RawBatch::new();
        raw.insert(INPUT.to_string(), BatchField::Tensor(batch.input));
        if let Some(target) = batch.target {
            raw.insert(TARGET.to_string(), BatchField::Tensor(target));
        }
        if let Some(id) = batch.id {
            raw.insert(ID.to_string(), BatchField::Ids(id));
        }
        raw
    }
}

fn wrong_kind<T>(key: &str, expected: &'static str, found: &BatchField<T>) -> InvalidBatchError {
    tracing::debug!(key, found = found.kind(), "batch field has the wrong kind");
    InvalidBatchReason::WrongKind {
        key: key.to_string(),
        expected,
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn raw(entries: Vec<(&str, BatchField<i32>)>) -> RawBatch<i32> {
        entries
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }

    #[test]
    fn test_input_only() {
        let batch = Batch::validate(raw(vec![("input", BatchField::Tensor(1))])).unwrap();
        assert_eq!(batch, Batch::new(1));
    }

    #[test]
    fn test_full_batch() {
        let batch = Batch::validate(raw(vec![
            ("input", BatchField::Tensor(1)),
            ("target", BatchField::Tensor(2)),
            ("id", BatchField::Ids(vec![SampleId::from("a")])),
        ]))
        .unwrap();
        assert_eq!(batch.target, Some(2));
        assert_eq!(batch.id, Some(vec![SampleId::Str("a".into())]));
    }

    #[test]
    fn test_null_target_is_absent() {
        let batch = Batch::validate(raw(vec![
            ("input", BatchField::Tensor(1)),
            ("target", BatchField::Null),
            ("id", BatchField::Null),
        ]))
        .unwrap();
        assert_eq!(batch.target, None);
        assert_eq!(batch.id, None);
    }

    #[test]
    fn test_missing_input() {
        let err = Batch::validate(raw(vec![("target", BatchField::Tensor(2))])).unwrap_err();
        assert_eq!(err.reason, InvalidBatchReason::MissingInput);

        let err = Batch::validate(raw(vec![("input", BatchField::Null)])).unwrap_err();
        assert_eq!(err.reason, InvalidBatchReason::MissingInput);
    }

    #[test]
    fn test_unexpected_keys() {
        let err = Batch::validate(raw(vec![
            ("input", BatchField::Tensor(1)),
            ("label", BatchField::Tensor(2)),
            ("mask", BatchField::Null),
        ]))
        .unwrap_err();
        assert_eq!(
            err.reason,
            InvalidBatchReason::UnexpectedKeys(vec!["label".into(), "mask".into()])
        );
        assert!(err.to_string().contains("'target' (optional)"));
    }

    #[test]
    fn test_wrong_kind() {
        let err = Batch::validate(raw(vec![("input", BatchField::Ids(vec![]))])).unwrap_err();
        assert!(matches!(err.reason, InvalidBatchReason::WrongKind { ref key, .. } if key == "input"));

        let err = Batch::validate(raw(vec![
            ("input", BatchField::Tensor(1)),
            ("id", BatchField::Tensor(3)),
        ]))
        .unwrap_err();
        assert!(matches!(err.reason, InvalidBatchReason::WrongKind { ref key, .. } if key == "id"));
    }

    #[test]
    fn test_roundtrip_through_raw() {
        let batch = Batch::new(7).with_target(8).with_ids(vec![SampleId::Int(3)]);
        let again = Batch::validate(RawBatch::from(batch.clone())).unwrap();
        assert_eq!(again, batch);
    }

    #[test]
    fn test_sample_id_untagged() {
        let ids: Vec<SampleId> = serde_json::from_str(r#"[1, "b"]"#).unwrap();
        assert_eq!(ids, vec![SampleId::Int(1), SampleId::Str("b".into())]);
        assert_eq!(ids[0].to_string(), "1");
    }
}
