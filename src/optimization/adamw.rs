use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    BiasTerm, MomentState, NumericInstability, Optimizer,
    diagnostics::BiasCorrection,
    radam::{check_beta, check_epsilon, check_weight_decay},
    state::{dump_states, load_moment_states},
};
use crate::{
    error::{OptimError, Result},
    storage::ParameterKey,
};

const RULE: &str = "adamw";

/// Hyperparameters of the `AdamW` rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamWConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    pub amsgrad: bool,
}

impl Default for AdamWConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.1,
            amsgrad: false,
        }
    }
}

impl AdamWConfig {
    pub fn validate(&self) -> Result<()> {
        check_beta("beta1", self.beta1)?;
        check_beta("beta2", self.beta2)?;
        check_epsilon(self.epsilon)?;
        check_weight_decay(self.weight_decay)
    }
}

/// Adam with decoupled weight decay.
#[derive(Debug)]
pub struct AdamW {
    config: AdamWConfig,
    states: HashMap<ParameterKey, MomentState>,
    diagnostics: Vec<NumericInstability>,
}

impl AdamW {
    /// Creates a new `AdamW` optimizer.
    ///
    /// # Returns
    /// An `InvalidConfig` error if any hyperparameter is out of its domain.
    pub fn new(config: AdamWConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            states: HashMap::new(),
            diagnostics: Vec::new(),
        })
    }

    pub fn state(&self, key: &ParameterKey) -> Option<&MomentState> {
        self.states.get(key)
    }
}

impl Optimizer for AdamW {
    fn update(
        &mut self,
        key: &ParameterKey,
        params: &mut [f32],
        grad: &[f32],
        learning_rate: f32,
    ) -> Result<()> {
        if grad.len() != params.len() {
            return Err(OptimError::shape(key, "gradient", grad.len(), params.len()));
        }

        let AdamWConfig {
            beta1,
            beta2,
            epsilon: eps,
            weight_decay: wd,
            amsgrad,
        } = self.config;

        let state = self
            .states
            .entry(key.clone())
            .or_insert_with(|| MomentState::new(params.len(), amsgrad));
        state.check_shape(key, params.len())?;

        if wd > 0. {
            let decay = 1. - learning_rate * wd;
            params.iter_mut().for_each(|p| *p *= decay);
        }

        state.advance(grad, beta1, beta2);

        let t = state.t();
        let bc1 = BiasCorrection::new(beta1, t, eps);
        let bc2 = BiasCorrection::new(beta2, t, eps);
        bc1.report(&mut self.diagnostics, key, t, BiasTerm::FirstMoment);
        bc2.report(&mut self.diagnostics, key, t, BiasTerm::SecondMoment);

        let step_size = (f64::from(learning_rate) / bc1.value) as f32;
        let bc2_sqrt = bc2.value.sqrt() as f32;

        params
            .iter_mut()
            .zip(state.m())
            .zip(state.denominator_source())
            .for_each(|((p, m), v)| {
                *p -= step_size * m / (v.sqrt() / bc2_sqrt + eps);
            });

        Ok(())
    }

    fn check_state(&self, key: &ParameterKey, len: usize) -> Result<()> {
        match self.states.get(key) {
            Some(state) => state.check_shape(key, len),
            None => Ok(()),
        }
    }

    fn take_diagnostics(&mut self) -> Vec<NumericInstability> {
        std::mem::take(&mut self.diagnostics)
    }

    fn state_dict(&self) -> Result<Value> {
        dump_states(RULE, &self.states)
    }

    fn load_state_dict(&mut self, state: Value) -> Result<()> {
        self.states = load_moment_states(RULE, state, self.config.amsgrad)?;
        Ok(())
    }
}
