//! Error types for the lighter-core crate.
//!
//! Uses `thiserror` for public error types. Every variant is fatal for the run that
//! raised it; nothing here is retried.

use crate::mode::Mode;

/// Top-level error type for Lighter.
#[derive(Debug, thiserror::Error)]
pub enum LighterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    InvalidBatch(#[from] InvalidBatchError),

    #[error(
        "The loss dictionary must include a 'total' key that combines all sublosses \
         (found: {}). Example: {{'total': combined_loss, 'subloss1': loss1, ...}}",
        .keys.join(", ")
    )]
    MissingTotalLoss { keys: Vec<String> },

    #[error(
        "The learning rate is not available when there are multiple optimizer parameter \
         groups ({groups} groups)"
    )]
    MultiGroupLearningRate { groups: usize },

    #[error("No dataloader is configured for mode '{0}'")]
    ModeNotConfigured(Mode),

    #[error("{component} failed: {message}")]
    Component { component: String, message: String },

    #[error("Data error: {0}")]
    Data(String),

    #[error("Unsupported: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl LighterError {
    pub fn component(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Component {
            component: component.into(),
            message: message.into(),
        }
    }

    pub fn data(msg: impl Into<String>) -> Self {
        Self::Data(msg.into())
    }

    /// Whether this error is a user configuration defect.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            Self::Config(_) | Self::MissingTotalLoss { .. } | Self::MultiGroupLearningRate { .. }
        )
    }
}

/// Errors from config resolution and system construction.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("`project` must be specified in one config only (found in '{first}' and '{second}')")]
    DuplicateProject { first: String, second: String },

    #[error(
        "Found the following prohibited argument(s) in 'args#{field}': {keys:?}. \
         Model and datasets should be defined within the 'system'."
    )]
    ProhibitedArgs { field: String, keys: Vec<String> },

    #[error("Please specify '{field}' in the config.")]
    MissingField { field: String },

    #[error("Unknown configuration key '{key}'")]
    UnknownKey { key: String },

    #[error("Unknown {kind} target '{target}' at '{key}'")]
    UnknownTarget {
        kind: String,
        target: String,
        key: String,
    },

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Reference '@{reference}' at '{key}' does not point to a config value")]
    UnresolvedReference { key: String, reference: String },

    #[error("Circular reference detected while resolving '@{reference}'")]
    CircularReference { reference: String },

    #[error("Project '{name}' ({path}) is not registered with this binary")]
    ProjectNotRegistered { name: String, path: String },

    #[error("Invalid override '{raw}': expected key=value")]
    InvalidOverride { raw: String },

    #[error("Configuration parse error: {message}")]
    Parse { message: String },
}

impl ConfigError {
    pub fn missing(field: impl Into<String>) -> Self {
        Self::MissingField {
            field: field.into(),
        }
    }

    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse {
            message: message.into(),
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::parse(err.to_string())
    }
}

impl From<serde_yaml::Error> for ConfigError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::parse(err.to_string())
    }
}

/// A batch that does not follow the `{input, target?, id?}` schema.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error(
    "Batch must be a dict with keys: 'input', 'target' (optional), 'id' (optional).\nError: {reason}"
)]
pub struct InvalidBatchError {
    pub reason: InvalidBatchReason,
}

/// What exactly was wrong with the batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InvalidBatchReason {
    #[error("missing required key 'input'")]
    MissingInput,

    #[error("unexpected key(s): {}", .0.join(", "))]
    UnexpectedKeys(Vec<String>),

    #[error("'{key}' must be {expected}")]
    WrongKind { key: String, expected: &'static str },
}

impl From<InvalidBatchReason> for InvalidBatchError {
    fn from(reason: InvalidBatchReason) -> Self {
        Self { reason }
    }
}

/// A type alias for results using `LighterError`.
pub type Result<T> = std::result::Result<T, LighterError>;
