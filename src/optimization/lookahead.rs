use std::num::NonZeroUsize;

use log::debug;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{NumericInstability, Optimizer};
use crate::{
    checkpoint::{Backup, CheckpointSwap},
    error::{OptimError, Result},
    storage::{Gradients, Parameter, ParameterKey, ParameterStore, check_layout},
};

const RULE: &str = "lookahead";

const DEFAULT_K: NonZeroUsize = NonZeroUsize::new(5).unwrap();

/// Hyperparameters of the `Lookahead` wrapper.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LookaheadConfig {
    /// The amount of steps between two interpolations.
    pub k: NonZeroUsize,
    /// The interpolation factor, in `(0, 1]`.
    pub alpha: f32,
}

impl Default for LookaheadConfig {
    fn default() -> Self {
        Self {
            k: DEFAULT_K,
            alpha: 0.5,
        }
    }
}

impl LookaheadConfig {
    pub fn validate(&self) -> Result<()> {
        if self.alpha > 0. && self.alpha <= 1. {
            return Ok(());
        }

        Err(OptimError::InvalidConfig(format!(
            "alpha must be in (0, 1], got {}",
            self.alpha
        )))
    }
}

#[derive(Deserialize)]
struct LookaheadState {
    rule: String,
    step: u64,
    slow: Vec<Parameter>,
    inner: Value,
}

/// Wraps any `Optimizer`, keeping a slow copy of the parameters that is pulled
/// towards the fast ones every `k` steps.
///
/// The fast weights are updated by the inner rule on every step. On every `k`-th
/// step both the slow copy and the live parameters become
/// `slow + alpha * (fast - slow)`.
#[derive(Debug)]
pub struct Lookahead<O: Optimizer> {
    inner: O,
    config: LookaheadConfig,
    step: u64,
    slow: Vec<Parameter>,
    swap: CheckpointSwap,
}

impl<O: Optimizer> Lookahead<O> {
    /// Creates a new `Lookahead` wrapper.
    ///
    /// # Arguments
    /// * `inner` - The base rule updating the fast weights.
    /// * `store` - The parameters to optimize, copied as the initial slow weights.
    /// * `config` - The cadence and interpolation factor.
    ///
    /// # Returns
    /// An `InvalidConfig` error if `alpha` is out of `(0, 1]`.
    pub fn new(inner: O, store: &ParameterStore, config: LookaheadConfig) -> Result<Self> {
        config.validate()?;

        Ok(Self {
            inner,
            config,
            step: 0,
            slow: store.snapshot(),
            swap: CheckpointSwap::new(),
        })
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut O {
        &mut self.inner
    }

    pub fn config(&self) -> &LookaheadConfig {
        &self.config
    }

    /// The global step counter, shared by every parameter key.
    pub fn step_count(&self) -> u64 {
        self.step
    }

    /// Returns the slow weights of `key`.
    pub fn slow_weights(&self, key: &ParameterKey) -> Option<&[f32]> {
        self.slow
            .iter()
            .find(|p| p.key() == key)
            .map(Parameter::values)
    }

    /// Whether slow weights are currently loaded for evaluation.
    pub fn is_evaluating(&self) -> bool {
        self.swap.is_outstanding()
    }

    /// Copies the live (fast) values of `store`.
    pub fn take_snapshot(&self, store: &ParameterStore) -> Backup {
        Backup::capture(store)
    }

    /// Writes a snapshot back into `store`.
    pub fn restore(&self, store: &mut ParameterStore, backup: Backup) -> Result<()> {
        backup.restore_into(store)
    }

    /// Backs up the fast weights and loads the slow weights into `store`.
    ///
    /// # Returns
    /// A `DuplicateSnapshot` if the slow weights are already loaded.
    pub fn snapshot_and_load_slow(&mut self, store: &mut ParameterStore) -> Result<()> {
        self.swap.snapshot_and_load(store, &self.slow)
    }

    /// Puts the fast weights backed up by `snapshot_and_load_slow` back into `store`.
    ///
    /// # Returns
    /// An `UnpairedRestore` if there's no outstanding backup.
    pub fn restore_from_backup(&mut self, store: &mut ParameterStore) -> Result<()> {
        self.swap.restore_from_backup(store)
    }

    fn ensure_not_evaluating(&self) -> Result<()> {
        if self.swap.is_outstanding() {
            return Err(OptimError::StepDuringEvaluation);
        }

        Ok(())
    }

    /// Pulls the slow weights towards the fast ones and loads them into `store`.
    fn interpolate(&mut self, store: &mut ParameterStore) -> Result<()> {
        check_layout(store.entries(), &self.slow)?;

        let alpha = self.config.alpha;

        store
            .entries_mut()
            .par_iter_mut()
            .zip(self.slow.par_iter_mut())
            .for_each(|(fast, slow)| {
                let fast = fast.values_mut();
                let slow = slow.values_mut();

                if alpha == 1. {
                    slow.copy_from_slice(fast);
                    return;
                }

                fast.iter_mut().zip(slow.iter_mut()).for_each(|(f, s)| {
                    *s += alpha * (*f - *s);
                    *f = *s;
                });
            });

        debug!(step = self.step, alpha = alpha; "slow weights synchronized");
        Ok(())
    }
}

impl<O: Optimizer> Optimizer for Lookahead<O> {
    /// Updates the fast weights of one key through the inner rule.
    ///
    /// The global counter and the interpolation live in `end_step`. Callers driving
    /// keys one by one must call `end_step` once per logical step, or use `step`,
    /// which does both.
    fn update(
        &mut self,
        key: &ParameterKey,
        params: &mut [f32],
        grad: &[f32],
        learning_rate: f32,
    ) -> Result<()> {
        self.ensure_not_evaluating()?;
        self.inner.update(key, params, grad, learning_rate)
    }

    fn check_state(&self, key: &ParameterKey, len: usize) -> Result<()> {
        self.inner.check_state(key, len)
    }

    fn validate(&self, store: &ParameterStore, grads: &Gradients) -> Result<()> {
        self.ensure_not_evaluating()?;
        check_layout(store.entries(), &self.slow)?;
        self.inner.validate(store, grads)
    }

    fn end_step(&mut self, store: &mut ParameterStore) -> Result<()> {
        self.ensure_not_evaluating()?;
        self.inner.end_step(store)?;

        self.step += 1;

        if self.step % self.config.k.get() as u64 == 0 {
            self.interpolate(store)?;
        }

        Ok(())
    }

    fn begin_evaluation(&mut self, store: &mut ParameterStore) -> Result<()> {
        self.snapshot_and_load_slow(store)
    }

    fn end_evaluation(&mut self, store: &mut ParameterStore) -> Result<()> {
        self.restore_from_backup(store)
    }

    fn take_diagnostics(&mut self) -> Vec<NumericInstability> {
        self.inner.take_diagnostics()
    }

    fn state_dict(&self) -> Result<Value> {
        let inner = self.inner.state_dict()?;
        let slow = serde_json::to_value(&self.slow)?;

        Ok(json!({
            "rule": RULE,
            "step": self.step,
            "slow": slow,
            "inner": inner,
        }))
    }

    fn load_state_dict(&mut self, state: Value) -> Result<()> {
        let state: LookaheadState = serde_json::from_value(state)?;

        if state.rule != RULE {
            return Err(OptimError::StateMismatch(format!(
                "expected {RULE} state, got {}",
                state.rule
            )));
        }

        check_layout(&self.slow, &state.slow)?;
        self.inner.load_state_dict(state.inner)?;
        self.step = state.step;
        self.slow = state.slow;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Moves every parameter by `-lr * grad`.
    struct Descent;

    impl Optimizer for Descent {
        fn update(
            &mut self,
            _key: &ParameterKey,
            params: &mut [f32],
            grad: &[f32],
            learning_rate: f32,
        ) -> Result<()> {
            params
                .iter_mut()
                .zip(grad)
                .for_each(|(p, g)| *p -= learning_rate * g);
            Ok(())
        }

        fn state_dict(&self) -> Result<Value> {
            Ok(json!({ "rule": "descent" }))
        }

        fn load_state_dict(&mut self, _state: Value) -> Result<()> {
            Ok(())
        }
    }

    fn create_test_store() -> ParameterStore {
        let mut store = ParameterStore::new();
        store.insert("w", vec![1.0, -1.0]).unwrap();
        store.insert("b", vec![0.25]).unwrap();
        store
    }

    fn grads() -> Gradients {
        Gradients::from([("w".into(), vec![0.3, -0.7]), ("b".into(), vec![0.1])])
    }

    fn lookahead(k: usize, alpha: f32, store: &ParameterStore) -> Lookahead<Descent> {
        let config = LookaheadConfig {
            k: NonZeroUsize::new(k).unwrap(),
            alpha,
        };
        Lookahead::new(Descent, store, config).unwrap()
    }

    #[test]
    fn test_slow_weights_only_change_on_boundaries() {
        let mut store = create_test_store();
        let mut optimizer = lookahead(5, 0.5, &store);

        for step in 1..=15 {
            let before: Vec<_> = optimizer.slow.clone();
            optimizer.step(&mut store, &grads(), 0.1).unwrap();

            if step % 5 == 0 {
                assert_ne!(optimizer.slow, before, "step {step}");
            } else {
                assert_eq!(optimizer.slow, before, "step {step}");
            }
        }

        assert_eq!(optimizer.step_count(), 15);
    }

    #[test]
    fn test_counter_is_global_not_per_key() {
        let mut store = create_test_store();
        let mut optimizer = lookahead(5, 0.5, &store);

        optimizer.step(&mut store, &grads(), 0.1).unwrap();
        assert_eq!(optimizer.step_count(), 1);
    }

    #[test]
    fn test_interpolation_is_exact() {
        for alpha in [0.1, 0.5, 1.0] {
            let mut store = create_test_store();
            let mut optimizer = lookahead(1, alpha, &store);
            let slow: Vec<f32> = optimizer.slow_weights(&"w".into()).unwrap().to_vec();

            // Reproduce the fast step by hand to know `f` before interpolation.
            let mut fast = store.get(&"w".into()).unwrap().to_vec();
            fast.iter_mut()
                .zip([0.3, -0.7])
                .for_each(|(p, g): (&mut f32, f32)| *p -= 0.1 * g);

            optimizer.step(&mut store, &grads(), 0.1).unwrap();

            let expected: Vec<f32> = if alpha == 1.0 {
                fast.clone()
            } else {
                slow.iter()
                    .zip(&fast)
                    .map(|(s, f)| s + alpha * (f - s))
                    .collect()
            };

            assert_eq!(store.get(&"w".into()).unwrap(), expected.as_slice());
            assert_eq!(optimizer.slow_weights(&"w".into()).unwrap(), expected.as_slice());
        }
    }

    #[test]
    fn test_snapshot_round_trip_is_bit_identical() {
        let mut store = create_test_store();
        let mut optimizer = lookahead(3, 0.5, &store);
        for _ in 0..4 {
            optimizer.step(&mut store, &grads(), 0.1).unwrap();
        }
        let before = store.clone();

        optimizer.snapshot_and_load_slow(&mut store).unwrap();
        assert_eq!(
            store.get(&"w".into()).unwrap(),
            optimizer.slow_weights(&"w".into()).unwrap()
        );
        optimizer.restore_from_backup(&mut store).unwrap();

        assert_eq!(store, before);
    }

    #[test]
    fn test_protocol_misuse() {
        let mut store = create_test_store();
        let mut optimizer = lookahead(3, 0.5, &store);

        assert!(matches!(
            optimizer.restore_from_backup(&mut store),
            Err(OptimError::UnpairedRestore)
        ));

        optimizer.snapshot_and_load_slow(&mut store).unwrap();
        assert!(matches!(
            optimizer.snapshot_and_load_slow(&mut store),
            Err(OptimError::DuplicateSnapshot)
        ));
    }

    #[test]
    fn test_step_is_rejected_while_evaluating() {
        let mut store = create_test_store();
        let mut optimizer = lookahead(3, 0.5, &store);

        optimizer.snapshot_and_load_slow(&mut store).unwrap();
        let err = optimizer.step(&mut store, &grads(), 0.1).unwrap_err();
        assert!(matches!(err, OptimError::StepDuringEvaluation));
        assert_eq!(optimizer.step_count(), 0);

        optimizer.restore_from_backup(&mut store).unwrap();
        optimizer.step(&mut store, &grads(), 0.1).unwrap();
        assert_eq!(optimizer.step_count(), 1);
    }

    #[test]
    fn test_per_key_updates_wait_for_end_step() {
        let mut store = create_test_store();
        let mut optimizer = lookahead(2, 0.5, &store);
        let slow = optimizer.slow.clone();
        let grads = grads();

        for _ in 0..2 {
            for param in store.entries_mut() {
                let (key, values) = param.split_mut();
                optimizer.update(key, values, &grads[key], 0.1).unwrap();
            }
        }
        assert_eq!(optimizer.step_count(), 0);
        assert_eq!(optimizer.slow, slow);

        optimizer.end_step(&mut store).unwrap();
        optimizer.end_step(&mut store).unwrap();
        assert_eq!(optimizer.step_count(), 2);
        assert_ne!(optimizer.slow, slow);
        assert_eq!(optimizer.slow, store.snapshot());
    }

    #[test]
    fn test_manual_snapshot_and_restore() {
        let mut store = create_test_store();
        let mut optimizer = lookahead(3, 0.5, &store);
        let backup = optimizer.take_snapshot(&store);

        optimizer.step(&mut store, &grads(), 0.1).unwrap();
        assert_ne!(store.get(&"b".into()).unwrap(), [0.25]);

        optimizer.restore(&mut store, backup).unwrap();
        assert_eq!(store.get(&"b".into()).unwrap(), [0.25]);
    }

    #[test]
    fn test_changed_parameter_set_is_rejected() {
        let mut store = create_test_store();
        let mut optimizer = lookahead(3, 0.5, &store);
        store.insert("extra", vec![0.]).unwrap();

        let err = optimizer.step(&mut store, &grads(), 0.1).unwrap_err();
        assert!(matches!(err, OptimError::ParameterSetMismatch { got: 2, expected: 3 }));
    }

    #[test]
    fn test_invalid_alpha() {
        let store = create_test_store();
        for alpha in [0.0, -0.5, 1.5] {
            let config = LookaheadConfig {
                alpha,
                ..LookaheadConfig::default()
            };
            assert!(Lookahead::new(Descent, &store, config).is_err());
        }
    }

    #[test]
    fn test_state_dict_round_trip() {
        let mut store = create_test_store();
        let mut a = lookahead(2, 0.5, &store);
        for _ in 0..3 {
            a.step(&mut store, &grads(), 0.1).unwrap();
        }

        let mut b = lookahead(2, 0.5, &create_test_store());
        b.load_state_dict(a.state_dict().unwrap()).unwrap();

        assert_eq!(b.step_count(), 3);
        assert_eq!(b.slow, a.slow);
    }
}
