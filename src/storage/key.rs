use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

/// Stable identifier of one parameter tensor, e.g. `"conv1.weight"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterKey(String);

impl ParameterKey {
    /// Creates a new `ParameterKey`.
    ///
    /// # Arguments
    /// * `name` - The unique name of the parameter.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the key as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParameterKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for ParameterKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}
