use serde_json::Value;

use crate::{
    error::{OptimError, Result},
    optimization::NumericInstability,
    storage::{Gradients, ParameterKey, ParameterStore},
};

/// Defines the strategy for updating parameters based on their gradients.
///
/// Base rules implement `update` and keep their own per-key state. Wrappers hold an
/// owned instance of another `Optimizer` and delegate to it, hooking into
/// `end_step` and the evaluation methods to add their own behaviour.
pub trait Optimizer {
    /// Updates one parameter vector in place.
    ///
    /// Must be called exactly once per key per logical step.
    ///
    /// # Arguments
    /// * `key` - The identity of the parameter being updated.
    /// * `params` - The live values of the parameter.
    /// * `grad` - The gradient of the loss with respect to `params`.
    /// * `learning_rate` - The learning rate for the current epoch.
    ///
    /// # Returns
    /// A `ShapeMismatch` if `grad` or the persisted state for `key` doesn't match
    /// the length of `params`.
    fn update(
        &mut self,
        key: &ParameterKey,
        params: &mut [f32],
        grad: &[f32],
        learning_rate: f32,
    ) -> Result<()>;

    /// Checks that the persisted state for `key` fits a parameter of `len` values.
    fn check_state(&self, _key: &ParameterKey, _len: usize) -> Result<()> {
        Ok(())
    }

    /// Validates a whole step before any parameter is touched.
    ///
    /// # Arguments
    /// * `store` - The live parameters.
    /// * `grads` - The gradients for this step.
    ///
    /// # Returns
    /// An `UnknownKey` if a gradient doesn't belong to any parameter, or a
    /// `ShapeMismatch` if a gradient or a persisted state has the wrong length.
    fn validate(&self, store: &ParameterStore, grads: &Gradients) -> Result<()> {
        for (key, grad) in grads {
            let params = store
                .get(key)
                .ok_or_else(|| OptimError::UnknownKey(key.clone()))?;

            if grad.len() != params.len() {
                return Err(OptimError::shape(key, "gradient", grad.len(), params.len()));
            }

            self.check_state(key, params.len())?;
        }

        Ok(())
    }

    /// Called once after every key has been updated for the current step.
    fn end_step(&mut self, _store: &mut ParameterStore) -> Result<()> {
        Ok(())
    }

    /// Runs one full optimization step.
    ///
    /// The step is validated up front so that a bad gradient never leaves the store
    /// half updated. Keys are visited in insertion order; keys without a gradient are
    /// treated as frozen for this step.
    ///
    /// # Arguments
    /// * `store` - The live parameters.
    /// * `grads` - One gradient per parameter key.
    /// * `learning_rate` - The learning rate for the current epoch.
    fn step(
        &mut self,
        store: &mut ParameterStore,
        grads: &Gradients,
        learning_rate: f32,
    ) -> Result<()> {
        self.validate(store, grads)?;

        for param in store.entries_mut() {
            let (key, values) = param.split_mut();

            if let Some(grad) = grads.get(key) {
                self.update(key, values, grad, learning_rate)?;
            }
        }

        self.end_step(store)
    }

    /// Prepares `store` for an evaluation pass.
    fn begin_evaluation(&mut self, _store: &mut ParameterStore) -> Result<()> {
        Ok(())
    }

    /// Undoes whatever `begin_evaluation` did to `store`.
    fn end_evaluation(&mut self, _store: &mut ParameterStore) -> Result<()> {
        Ok(())
    }

    /// Drains the numeric diagnostics collected since the last call.
    fn take_diagnostics(&mut self) -> Vec<NumericInstability> {
        Vec::new()
    }

    /// Serializes the full internal state of the optimizer.
    fn state_dict(&self) -> Result<Value>;

    /// Replaces the internal state with one produced by `state_dict`.
    ///
    /// # Returns
    /// A `StateMismatch` if `state` was produced by a different rule.
    fn load_state_dict(&mut self, state: Value) -> Result<()>;
}

impl<T: Optimizer + ?Sized> Optimizer for Box<T> {
    fn update(
        &mut self,
        key: &ParameterKey,
        params: &mut [f32],
        grad: &[f32],
        learning_rate: f32,
    ) -> Result<()> {
        (**self).update(key, params, grad, learning_rate)
    }

    fn check_state(&self, key: &ParameterKey, len: usize) -> Result<()> {
        (**self).check_state(key, len)
    }

    fn validate(&self, store: &ParameterStore, grads: &Gradients) -> Result<()> {
        (**self).validate(store, grads)
    }

    fn end_step(&mut self, store: &mut ParameterStore) -> Result<()> {
        (**self).end_step(store)
    }

    fn step(
        &mut self,
        store: &mut ParameterStore,
        grads: &Gradients,
        learning_rate: f32,
    ) -> Result<()> {
        (**self).step(store, grads, learning_rate)
    }

    fn begin_evaluation(&mut self, store: &mut ParameterStore) -> Result<()> {
        (**self).begin_evaluation(store)
    }

    fn end_evaluation(&mut self, store: &mut ParameterStore) -> Result<()> {
        (**self).end_evaluation(store)
    }

    fn take_diagnostics(&mut self) -> Vec<NumericInstability> {
        (**self).take_diagnostics()
    }

    fn state_dict(&self) -> Result<Value> {
        (**self).state_dict()
    }

    fn load_state_dict(&mut self, state: Value) -> Result<()> {
        (**self).load_state_dict(state)
    }
}
