use std::collections::HashMap;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::{Value, json};

use crate::{
    error::{OptimError, Result},
    storage::ParameterKey,
};

/// Per-parameter moment estimates of the adaptive rules.
///
/// Created lazily and zero-initialized on the first update of a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentState {
    t: u64,
    m: Box<[f32]>,
    v: Box<[f32]>,
    v_max: Option<Box<[f32]>>,
}

impl MomentState {
    /// Creates a new zeroed `MomentState`.
    ///
    /// # Arguments
    /// * `len` - The length of the parameter vector.
    /// * `amsgrad` - Whether to track the running maximum of `v`.
    pub fn new(len: usize, amsgrad: bool) -> Self {
        Self {
            t: 0,
            m: vec![0.; len].into_boxed_slice(),
            v: vec![0.; len].into_boxed_slice(),
            v_max: amsgrad.then(|| vec![0.; len].into_boxed_slice()),
        }
    }

    /// The amount of updates applied so far.
    pub fn t(&self) -> u64 {
        self.t
    }

    /// The first moment estimate.
    pub fn m(&self) -> &[f32] {
        &self.m
    }

    /// The second moment estimate.
    pub fn v(&self) -> &[f32] {
        &self.v
    }

    /// The running maximum of `v`, only tracked with AMSGrad.
    pub fn v_max(&self) -> Option<&[f32]> {
        self.v_max.as_deref()
    }

    /// The second moment the update should divide by.
    pub(crate) fn denominator_source(&self) -> &[f32] {
        self.v_max.as_deref().unwrap_or(&self.v)
    }

    /// Checks that every buffer matches a parameter of `len` values.
    pub(crate) fn check_shape(&self, key: &ParameterKey, len: usize) -> Result<()> {
        if self.m.len() != len {
            return Err(OptimError::shape(key, "first moment", self.m.len(), len));
        }

        if self.v.len() != len {
            return Err(OptimError::shape(key, "second moment", self.v.len(), len));
        }

        if let Some(v_max) = &self.v_max {
            if v_max.len() != len {
                return Err(OptimError::shape(key, "second moment max", v_max.len(), len));
            }
        }

        Ok(())
    }

    /// Increments `t` and folds `grad` into the moment estimates.
    ///
    /// The running maximum, when tracked, never decreases for the lifetime of the key.
    pub(crate) fn advance(&mut self, grad: &[f32], beta1: f32, beta2: f32) {
        self.t += 1;

        self.m
            .iter_mut()
            .zip(self.v.iter_mut())
            .zip(grad)
            .for_each(|((m, v), g)| {
                *m = beta1 * *m + (1. - beta1) * g;
                *v = beta2 * *v + (1. - beta2) * g * g;
            });

        if let Some(v_max) = &mut self.v_max {
            v_max
                .iter_mut()
                .zip(self.v.iter())
                .for_each(|(vm, v)| *vm = vm.max(*v));
        }
    }
}

/// Wire shape of a rule's serialized state.
#[derive(Deserialize)]
struct RuleState<S> {
    rule: String,
    states: HashMap<ParameterKey, S>,
}

/// Serializes a per-key state map tagged with the rule's name.
pub(crate) fn dump_states<S: Serialize>(rule: &str, states: &HashMap<ParameterKey, S>) -> Result<Value> {
    let states = serde_json::to_value(states)?;
    Ok(json!({ "rule": rule, "states": states }))
}

/// Parses a per-key state map produced by `dump_states` for the same rule.
pub(crate) fn load_states<S: DeserializeOwned>(
    rule: &str,
    value: Value,
) -> Result<HashMap<ParameterKey, S>> {
    let state: RuleState<S> = serde_json::from_value(value)?;

    if state.rule != rule {
        return Err(OptimError::StateMismatch(format!(
            "expected {rule} state, got {}",
            state.rule
        )));
    }

    Ok(state.states)
}

/// Loads the moment states of `rule`, checking they were produced with the same
/// `amsgrad` setting.
///
/// # Returns
/// A `StateMismatch` if any state carries a running maximum while `amsgrad` is
/// off, or lacks one while it's on.
pub(crate) fn load_moment_states(
    rule: &str,
    value: Value,
    amsgrad: bool,
) -> Result<HashMap<ParameterKey, MomentState>> {
    let states: HashMap<ParameterKey, MomentState> = load_states(rule, value)?;

    if let Some(key) = states
        .iter()
        .find(|(_, state)| state.v_max().is_some() != amsgrad)
        .map(|(key, _)| key)
    {
        return Err(OptimError::StateMismatch(format!(
            "state of parameter {key} doesn't match amsgrad = {amsgrad}"
        )));
    }

    Ok(states)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_counts_and_accumulates() {
        let mut state = MomentState::new(2, false);
        state.advance(&[1., -2.], 0.9, 0.99);

        assert_eq!(state.t(), 1);
        assert!((state.m()[0] - 0.1).abs() < 1e-7);
        assert!((state.m()[1] + 0.2).abs() < 1e-7);
        assert!((state.v()[1] - 0.04).abs() < 1e-7);
        assert!(state.v_max().is_none());
    }

    #[test]
    fn test_running_max_never_decreases() {
        let mut state = MomentState::new(1, true);
        state.advance(&[10.], 0.9, 0.5);
        let peak = state.v_max().unwrap()[0];

        for _ in 0..5 {
            state.advance(&[0.], 0.9, 0.5);
            assert_eq!(state.v_max().unwrap()[0], peak);
        }

        assert!(state.v()[0] < peak);
        assert_eq!(state.denominator_source()[0], peak);
    }

    #[test]
    fn test_check_shape() {
        let state = MomentState::new(3, true);
        assert!(state.check_shape(&"w".into(), 3).is_ok());
        assert!(matches!(
            state.check_shape(&"w".into(), 4),
            Err(OptimError::ShapeMismatch {
                what: "first moment",
                ..
            })
        ));
    }

    #[test]
    fn test_load_rejects_other_rule() {
        let states = HashMap::from([(ParameterKey::from("w"), MomentState::new(1, false))]);
        let value = dump_states("radam", &states).unwrap();

        let back: HashMap<ParameterKey, MomentState> = load_states("radam", value.clone()).unwrap();
        assert_eq!(back, states);

        let err = load_states::<MomentState>("adamw", value).unwrap_err();
        assert!(matches!(err, OptimError::StateMismatch(_)));
    }

    #[test]
    fn test_load_rejects_other_amsgrad_setting() {
        let plain = HashMap::from([(ParameterKey::from("w"), MomentState::new(2, false))]);
        let value = dump_states("radam", &plain).unwrap();

        assert!(load_moment_states("radam", value.clone(), false).is_ok());
        let err = load_moment_states("radam", value, true).unwrap_err();
        assert!(matches!(err, OptimError::StateMismatch(_)));

        let tracked = HashMap::from([(ParameterKey::from("w"), MomentState::new(2, true))]);
        let value = dump_states("radam", &tracked).unwrap();

        assert!(load_moment_states("radam", value.clone(), true).is_ok());
        let err = load_moment_states("radam", value, false).unwrap_err();
        assert!(matches!(err, OptimError::StateMismatch(_)));
    }
}
