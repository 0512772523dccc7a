use std::collections::HashMap;

use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{
    BiasTerm, MomentState, NumericInstability, Optimizer,
    diagnostics::BiasCorrection,
    state::{dump_states, load_moment_states},
};
use crate::{
    error::{OptimError, Result},
    storage::ParameterKey,
};

const RULE: &str = "radam";

/// Rectification is only applied once the approximated SMA length exceeds this.
const RHO_THRESHOLD: f64 = 4.;

/// Hyperparameters of the `RAdam` rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RAdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub weight_decay: f32,
    pub degenerate_to_sgd: bool,
    pub amsgrad: bool,
}

impl Default for RAdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.1,
            degenerate_to_sgd: true,
            amsgrad: false,
        }
    }
}

impl RAdamConfig {
    /// Checks every hyperparameter is inside its domain.
    pub fn validate(&self) -> Result<()> {
        check_beta("beta1", self.beta1)?;
        check_beta("beta2", self.beta2)?;
        check_epsilon(self.epsilon)?;
        check_weight_decay(self.weight_decay)
    }
}

pub(crate) fn check_beta(name: &str, beta: f32) -> Result<()> {
    if beta > 0. && beta < 1. {
        return Ok(());
    }

    Err(OptimError::InvalidConfig(format!(
        "{name} must be in (0, 1), got {beta}"
    )))
}

pub(crate) fn check_epsilon(epsilon: f32) -> Result<()> {
    if epsilon > 0. && epsilon.is_finite() {
        return Ok(());
    }

    Err(OptimError::InvalidConfig(format!(
        "epsilon must be positive, got {epsilon}"
    )))
}

pub(crate) fn check_weight_decay(weight_decay: f32) -> Result<()> {
    if weight_decay >= 0. && weight_decay.is_finite() {
        return Ok(());
    }

    Err(OptimError::InvalidConfig(format!(
        "weight_decay must be non negative, got {weight_decay}"
    )))
}

/// What an update does at a given step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Phase {
    /// The variance estimate is not trustworthy yet, parameters stay put.
    WarmUp,
    /// Plain momentum step while the variance estimate warms up.
    Momentum,
    /// Adaptive step scaled by the rectification term.
    Rectified(f64),
}

/// Variance-rectified Adam.
///
/// Keeps a `MomentState` per parameter key. During the first steps, while the
/// approximated length of the SMA `rho_t` is at most 4, the adaptive learning rate
/// has unbounded variance: the rule then either takes a momentum-only step or no
/// step at all, depending on `degenerate_to_sgd`.
#[derive(Debug)]
pub struct RAdam {
    config: RAdamConfig,
    rho_inf: f64,
    states: HashMap<ParameterKey, MomentState>,
    diagnostics: Vec<NumericInstability>,
}

impl RAdam {
    /// Creates a new `RAdam` optimizer.
    ///
    /// # Arguments
    /// * `config` - The hyperparameters of the rule.
    ///
    /// # Returns
    /// An `InvalidConfig` error if any hyperparameter is out of its domain.
    pub fn new(config: RAdamConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            config,
            rho_inf: 2. / (1. - f64::from(config.beta2)) - 1.,
            states: HashMap::new(),
            diagnostics: Vec::new(),
        })
    }

    pub fn config(&self) -> &RAdamConfig {
        &self.config
    }

    /// Returns the moment state of `key`, if it was ever updated.
    pub fn state(&self, key: &ParameterKey) -> Option<&MomentState> {
        self.states.get(key)
    }

    /// Computes `rho_t`, the approximated length of the SMA at step `t`.
    pub fn rho(&self, t: u64) -> f64 {
        rho(self.rho_inf, self.config.beta2, t)
    }

    /// Returns what an update at step `t` does.
    pub fn phase(&self, t: u64) -> Phase {
        let rho_t = self.rho(t);
        phase(self.rho_inf, rho_t, self.config.degenerate_to_sgd)
    }
}

/// `rho_t` uses the unfloored `1 - beta2^t`; the epsilon floor only guards the
/// second moment division.
fn rho(rho_inf: f64, beta2: f32, t: u64) -> f64 {
    let beta2_t = f64::from(beta2).powf(t as f64);
    let bc2 = (1. - beta2_t).max(f64::MIN_POSITIVE);
    rho_inf - 2. * t as f64 * beta2_t / bc2
}

fn phase(rho_inf: f64, rho_t: f64, degenerate_to_sgd: bool) -> Phase {
    if rho_t > RHO_THRESHOLD {
        let r_t = ((rho_t - 4.) * (rho_t - 2.) * rho_inf
            / ((rho_inf - 4.) * (rho_inf - 2.) * rho_t))
            .sqrt();
        Phase::Rectified(r_t)
    } else if degenerate_to_sgd {
        Phase::Momentum
    } else {
        Phase::WarmUp
    }
}

impl Optimizer for RAdam {
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

        let RAdamConfig {
            beta1,
            beta2,
            epsilon: eps,
            weight_decay: wd,
            degenerate_to_sgd,
            amsgrad,
        } = self.config;
        let rho_inf = self.rho_inf;

        let state = self
            .states
            .entry(key.clone())
            .or_insert_with(|| MomentState::new(params.len(), amsgrad));
        state.check_shape(key, params.len())?;
        state.advance(grad, beta1, beta2);

        let t = state.t();
        let bc1 = BiasCorrection::new(beta1, t, eps);
        let bc2 = BiasCorrection::new(beta2, t, eps);
        bc1.report(&mut self.diagnostics, key, t, BiasTerm::FirstMoment);
        bc2.report(&mut self.diagnostics, key, t, BiasTerm::SecondMoment);

        let rho_t = rho(rho_inf, beta2, t);
        let phase = phase(rho_inf, rho_t, degenerate_to_sgd);

        if matches!(phase, Phase::WarmUp) {
            return Ok(());
        }

        if wd > 0. {
            let decay = learning_rate * wd;
            params.iter_mut().for_each(|p| *p -= decay * *p);
        }

        match phase {
            Phase::Rectified(r_t) => {
                if t > 1 && rho(rho_inf, beta2, t - 1) <= RHO_THRESHOLD {
                    debug!(key = key.as_str(), step = t, r_t = r_t; "rectification engaged");
                }

                let step_size = (f64::from(learning_rate) * r_t / bc1.value) as f32;
                let bc2 = bc2.value as f32;

                params
                    .iter_mut()
                    .zip(state.m())
                    .zip(state.denominator_source())
                    .for_each(|((p, m), v)| {
                        *p -= step_size * m / ((v / bc2).sqrt() + eps);
                    });
            }
            Phase::Momentum => {
                let step_size = (f64::from(learning_rate) / bc1.value) as f32;

                params
                    .iter_mut()
                    .zip(state.m())
                    .for_each(|(p, m)| *p -= step_size * m);
            }
            Phase::WarmUp => {}
        }

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
