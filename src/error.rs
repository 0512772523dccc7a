use std::{
    error::Error,
    fmt::{self, Display},
};

use crate::{initialization::RandErr, storage::ParameterKey};

/// The result type used across the optimizer core.
pub type Result<T> = std::result::Result<T, OptimError>;

/// The optimizer core's error type.
///
/// Every variant except `Json` and `Initialization` is a precondition violation
/// and is expected to be fatal to the training run.
#[derive(Debug)]
pub enum OptimError {
    ShapeMismatch {
        key: ParameterKey,
        what: &'static str,
        got: usize,
        expected: usize,
    },
    UnknownKey(ParameterKey),
    DuplicateKey(ParameterKey),
    ParameterSetMismatch {
        got: usize,
        expected: usize,
    },
    UnpairedRestore,
    DuplicateSnapshot,
    StepDuringEvaluation,
    InvalidConfig(String),
    StateMismatch(String),
    Initialization(RandErr),
    Json(serde_json::Error),
}

impl OptimError {
    /// Shorthand for building a `ShapeMismatch` for `key`.
    pub(crate) fn shape(key: &ParameterKey, what: &'static str, got: usize, expected: usize) -> Self {
        Self::ShapeMismatch {
            key: key.clone(),
            what,
            got,
            expected,
        }
    }
}

impl Display for OptimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptimError::ShapeMismatch {
                key,
                what,
                got,
                expected,
            } => write!(
                f,
                "shape mismatch for {what} of parameter {key}: got {got}, expected {expected}"
            ),
            OptimError::UnknownKey(key) => write!(f, "unknown parameter key {key}"),
            OptimError::DuplicateKey(key) => write!(f, "parameter key {key} is already present"),
            OptimError::ParameterSetMismatch { got, expected } => write!(
                f,
                "the parameter set changed: got {got} parameters, expected {expected}"
            ),
            OptimError::UnpairedRestore => {
                f.write_str("restore requested but there is no outstanding backup")
            }
            OptimError::DuplicateSnapshot => {
                f.write_str("snapshot requested while a backup is still outstanding")
            }
            OptimError::StepDuringEvaluation => {
                f.write_str("an optimization step was attempted while slow weights are loaded")
            }
            OptimError::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
            OptimError::StateMismatch(msg) => write!(f, "state mismatch: {msg}"),
            OptimError::Initialization(e) => write!(f, "initialization error: {e}"),
            OptimError::Json(e) => write!(f, "json error: {e}"),
        }
    }
}

impl Error for OptimError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            OptimError::Initialization(e) => Some(e),
            OptimError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RandErr> for OptimError {
    fn from(value: RandErr) -> Self {
        Self::Initialization(value)
    }
}

impl From<serde_json::Error> for OptimError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}
