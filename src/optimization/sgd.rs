use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    Optimizer,
    radam::check_weight_decay,
    state::{dump_states, load_states},
};
use crate::{
    error::{OptimError, Result},
    storage::ParameterKey,
};

const RULE: &str = "sgd";

/// Hyperparameters of the `Sgd` rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgdConfig {
    pub momentum: f32,
    pub nesterov: bool,
    pub weight_decay: f32,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            momentum: 0.9,
            nesterov: true,
            weight_decay: 5e-4,
        }
    }
}

impl SgdConfig {
    pub fn validate(&self) -> Result<()> {
        if !(self.momentum >= 0. && self.momentum.is_finite()) {
            return Err(OptimError::InvalidConfig(format!(
                "momentum must be non negative, got {}",
                self.momentum
            )));
        }

        if self.nesterov && self.momentum == 0. {
            return Err(OptimError::InvalidConfig(
                "nesterov momentum requires a positive momentum".to_string(),
            ));
        }

        check_weight_decay(self.weight_decay)
    }
}

/// Stochastic gradient descent with momentum and optional Nesterov lookahead.
///
/// Weight decay is an L2 penalty folded into the gradient.
#[derive(Debug)]
pub struct Sgd {
    config: SgdConfig,
    velocity: HashMap<ParameterKey, Box<[f32]>>,
}

impl Sgd {
    /// Creates a new `Sgd` optimizer.
    ///
    /// # Returns
    /// An `InvalidConfig` error if any hyperparameter is out of its domain.
    pub fn new(config: SgdConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            velocity: HashMap::new(),
        })
    }

    pub fn velocity(&self, key: &ParameterKey) -> Option<&[f32]> {
        self.velocity.get(key).map(|v| &**v)
    }
}

impl Optimizer for Sgd {
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

        self.check_state(key, params.len())?;

        let SgdConfig {
            momentum: mu,
            nesterov,
            weight_decay: wd,
        } = self.config;
        let lr = learning_rate;

        let velocity = self
            .velocity
            .entry(key.clone())
            .or_insert_with(|| vec![0.; params.len()].into_boxed_slice());

        params
            .iter_mut()
            .zip(grad)
            .zip(velocity.iter_mut())
            .for_each(|((p, g), v)| {
                let g = g + wd * *p;
                *v = mu * *v + g;
                let d = if nesterov { g + mu * *v } else { *v };
                *p -= lr * d;
            });

        Ok(())
    }

    fn check_state(&self, key: &ParameterKey, len: usize) -> Result<()> {
        match self.velocity.get(key) {
            Some(v) if v.len() != len => Err(OptimError::shape(key, "velocity", v.len(), len)),
            _ => Ok(()),
        }
    }

    fn state_dict(&self) -> Result<Value> {
        dump_states(RULE, &self.velocity)
    }

    fn load_state_dict(&mut self, state: Value) -> Result<()> {
        self.velocity = load_states(RULE, state)?;
        Ok(())
    }
}
