mod key;
mod store;

use std::collections::HashMap;

pub use key::ParameterKey;
pub(crate) use store::check_layout;
pub use store::{Parameter, ParameterStore};

/// One gradient per parameter key, produced by the backward computation for a
/// single step.
pub type Gradients = HashMap<ParameterKey, Vec<f32>>;
