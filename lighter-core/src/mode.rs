//! Execution modes and engine stages.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The mode a step runs in. Selects which optional components are active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Train,
    Val,
    Test,
    Predict,
}

impl Mode {
    pub const ALL: [Mode; 4] = [Mode::Train, Mode::Val, Mode::Test, Mode::Predict];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Train => "train",
            Mode::Val => "val",
            Mode::Test => "test",
            Mode::Predict => "predict",
        }
    }

    /// Modes in which the criterion is evaluated.
    pub fn computes_loss(&self) -> bool {
        matches!(self, Mode::Train | Mode::Val)
    }

    /// Modes in which a configured inferer replaces the direct model call.
    pub fn uses_inferer(&self) -> bool {
        !matches!(self, Mode::Train)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An engine entry point, one per CLI subcommand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fit,
    Validate,
    Test,
    Predict,
    Tune,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Fit => "fit",
            Stage::Validate => "validate",
            Stage::Test => "test",
            Stage::Predict => "predict",
            Stage::Tune => "tune",
        }
    }

    /// Modes whose dataloaders are built for this stage.
    pub fn modes(&self) -> &'static [Mode] {
        match self {
            Stage::Fit | Stage::Tune => &[Mode::Train, Mode::Val],
            Stage::Validate => &[Mode::Val],
            Stage::Test => &[Mode::Test],
            Stage::Predict => &[Mode::Predict],
        }
    }

    /// The mode whose dataloader must be present for this stage to run.
    pub fn required_mode(&self) -> Mode {
        match self {
            Stage::Fit | Stage::Tune => Mode::Train,
            Stage::Validate => Mode::Val,
            Stage::Test => Mode::Test,
            Stage::Predict => Mode::Predict,
        }
    }

    pub fn requires_optimizer(&self) -> bool {
        matches!(self, Stage::Fit | Stage::Tune)
    }

    pub fn requires_criterion(&self) -> bool {
        matches!(self, Stage::Fit | Stage::Validate | Stage::Tune)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One optional slot per mode, populated at construction and checked by presence.
#[derive(Debug, Clone)]
pub struct ModeSlots<T> {
    train: Option<T>,
    val: Option<T>,
    test: Option<T>,
    predict: Option<T>,
}

impl<T> Default for ModeSlots<T> {
    fn default() -> Self {
        Self {
            train: None,
            val: None,
            test: None,
            predict: None,
        }
    }
}

impl<T> ModeSlots<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, mode: Mode) -> Option<&T> {
        match mode {
            Mode::Train => self.train.as_ref(),
            Mode::Val => self.val.as_ref(),
            Mode::Test => self.test.as_ref(),
            Mode::Predict => self.predict.as_ref(),
        }
    }

    pub fn get_mut(&mut self, mode: Mode) -> Option<&mut T> {
        match mode {
            Mode::Train => self.train.as_mut(),
            Mode::Val => self.val.as_mut(),
            Mode::Test => self.test.as_mut(),
            Mode::Predict => self.predict.as_mut(),
        }
    }

    /// Fill a slot, returning the previous occupant.
    pub fn insert(&mut self, mode: Mode, value: T) -> Option<T> {
        self.slot_mut(mode).replace(value)
    }

    pub fn contains(&self, mode: Mode) -> bool {
        self.get(mode).is_some()
    }

    /// Populated modes in `Mode::ALL` order.
    pub fn modes(&self) -> Vec<Mode> {
        Mode::ALL
            .into_iter()
            .filter(|m| self.contains(*m))
            .collect()
    }

    fn slot_mut(&mut self, mode: Mode) -> &mut Option<T> {
        match mode {
            Mode::Train => &mut self.train,
            Mode::Val => &mut self.val,
            Mode::Test => &mut self.test,
            Mode::Predict => &mut self.predict,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_display() {
        assert_eq!(Mode::Train.to_string(), "train");
        assert_eq!(Mode::Val.to_string(), "val");
        assert_eq!(Mode::Test.to_string(), "test");
        assert_eq!(Mode::Predict.to_string(), "predict");
    }

    #[test]
    fn test_mode_serde() {
        let mode: Mode = serde_json::from_str("\"val\"").unwrap();
        assert_eq!(mode, Mode::Val);
    }

    #[test]
    fn test_stage_modes() {
        assert_eq!(Stage::Fit.modes(), &[Mode::Train, Mode::Val]);
        assert_eq!(Stage::Validate.required_mode(), Mode::Val);
        assert!(Stage::Fit.requires_optimizer());
        assert!(!Stage::Test.requires_criterion());
    }

    #[test]
    fn test_mode_slots() {
        let mut slots = ModeSlots::new();
        assert!(!slots.contains(Mode::Train));
        slots.insert(Mode::Val, 2);
        slots.insert(Mode::Train, 1);
        assert_eq!(slots.get(Mode::Train), Some(&1));
        assert_eq!(slots.modes(), vec![Mode::Train, Mode::Val]);
        assert_eq!(slots.insert(Mode::Train, 3), Some(1));
    }
}
