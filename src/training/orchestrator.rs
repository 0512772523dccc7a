use log::info;

use super::LrSchedule;
use crate::{
    checkpoint::EvalGuard,
    error::Result,
    optimization::Optimizer,
    storage::{Gradients, ParameterStore},
};

/// Drives the optimizer over a parameter store, one step at a time.
///
/// The learning rate is pulled from the schedule once per epoch and held constant
/// until the next call to `begin_epoch`.
pub struct StepOrchestrator<O: Optimizer, S: LrSchedule> {
    optimizer: O,
    store: ParameterStore,
    schedule: S,
    learning_rate: f32,
    epoch: usize,
    steps: u64,
    instabilities: u64,
}

impl<O: Optimizer, S: LrSchedule> StepOrchestrator<O, S> {
    /// Creates a new `StepOrchestrator` positioned at the start of epoch `0`.
    ///
    /// # Arguments
    /// * `optimizer` - The update rule, optionally wrapped in `Lookahead`.
    /// * `store` - The parameters to optimize.
    /// * `schedule` - The source of the per-epoch learning rate.
    pub fn new(optimizer: O, store: ParameterStore, mut schedule: S) -> Self {
        let learning_rate = schedule.learning_rate(0);

        Self {
            optimizer,
            store,
            schedule,
            learning_rate,
            epoch: 0,
            steps: 0,
            instabilities: 0,
        }
    }

    /// Starts `epoch`, refreshing the learning rate from the schedule.
    pub fn begin_epoch(&mut self, epoch: usize) {
        self.epoch = epoch;
        self.learning_rate = self.schedule.learning_rate(epoch);
        info!(epoch = epoch, learning_rate = self.learning_rate; "epoch started");
    }

    /// Applies one optimization step with this step's gradients.
    ///
    /// # Arguments
    /// * `grads` - One gradient per parameter key, read only for this call.
    ///
    /// # Returns
    /// Any shape or protocol error, which should end the training run.
    pub fn step(&mut self, grads: &Gradients) -> Result<()> {
        self.optimizer
            .step(&mut self.store, grads, self.learning_rate)?;
        self.steps += 1;
        self.instabilities += self.optimizer.take_diagnostics().len() as u64;

        Ok(())
    }

    /// Runs `steps` steps, pulling each step's gradients from `backward`.
    ///
    /// # Arguments
    /// * `steps` - The amount of steps in the epoch.
    /// * `backward` - Computes the gradients for the current parameters.
    pub fn train_epoch<F>(&mut self, steps: usize, mut backward: F) -> Result<()>
    where
        F: FnMut(&ParameterStore) -> Result<Gradients>,
    {
        for _ in 0..steps {
            let grads = backward(&self.store)?;
            self.step(&grads)?;
        }

        Ok(())
    }

    /// Runs `eval` against the evaluation weights of the optimizer.
    ///
    /// With `Lookahead` these are the slow weights; the fast weights are put back
    /// afterwards on every exit path, including a panic inside `eval`. Plain rules
    /// evaluate the live parameters directly.
    pub fn evaluate<R, F>(&mut self, eval: F) -> Result<R>
    where
        F: FnOnce(&ParameterStore) -> R,
    {
        let guard = EvalGuard::begin(&mut self.optimizer, &mut self.store)?;
        let out = eval(&guard);
        guard.finish()?;
        Ok(out)
    }

    pub fn parameters(&self) -> &ParameterStore {
        &self.store
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut O {
        &mut self.optimizer
    }

    pub fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// The total amount of steps applied.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// The amount of bias corrections that hit the epsilon floor so far.
    ///
    /// Each one was already logged as a warning by the rule that raised it.
    pub fn instabilities(&self) -> u64 {
        self.instabilities
    }

    /// Consumes the orchestrator, returning the optimizer and the final parameters.
    pub fn into_parts(self) -> (O, ParameterStore) {
        (self.optimizer, self.store)
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroUsize;

    use super::*;
    use crate::{
        optimization::{Lookahead, LookaheadConfig, RAdam, RAdamConfig, Sgd, SgdConfig},
        training::ConstantLr,
    };

    fn create_test_store() -> ParameterStore {
        let mut store = ParameterStore::new();
        store.insert("w", vec![2.0]).unwrap();
        store
    }

    fn sgd() -> Sgd {
        Sgd::new(SgdConfig {
            momentum: 0.,
            nesterov: false,
            weight_decay: 0.,
        })
        .unwrap()
    }

    fn quadratic(store: &ParameterStore) -> Result<Gradients> {
        let w = store.get(&"w".into()).unwrap()[0];
        Ok(Gradients::from([("w".into(), vec![2. * w])]))
    }

    #[test]
    fn test_learning_rate_changes_only_at_epoch_boundaries() {
        let schedule = |epoch: usize| if epoch < 2 { 0.1 } else { 0.01 };
        let mut orchestrator = StepOrchestrator::new(sgd(), create_test_store(), schedule);
        assert_eq!(orchestrator.learning_rate(), 0.1);

        orchestrator.train_epoch(3, quadratic).unwrap();
        assert_eq!(orchestrator.learning_rate(), 0.1);

        orchestrator.begin_epoch(2);
        assert_eq!(orchestrator.learning_rate(), 0.01);
        assert_eq!(orchestrator.steps(), 3);
    }

    #[test]
    fn test_evaluate_without_lookahead_sees_live_weights() {
        let mut orchestrator = StepOrchestrator::new(sgd(), create_test_store(), ConstantLr(0.1));
        orchestrator.train_epoch(1, quadratic).unwrap();

        let live = orchestrator.parameters().get(&"w".into()).unwrap()[0];
        let seen = orchestrator
            .evaluate(|store| store.get(&"w".into()).unwrap()[0])
            .unwrap();
        assert_eq!(seen, live);
    }

    #[test]
    fn test_evaluate_with_lookahead_sees_slow_weights_and_restores() {
        let store = create_test_store();
        let config = LookaheadConfig {
            k: NonZeroUsize::new(5).unwrap(),
            alpha: 0.5,
        };
        let optimizer = Lookahead::new(sgd(), &store, config).unwrap();
        let mut orchestrator = StepOrchestrator::new(optimizer, store, ConstantLr(0.1));

        orchestrator.train_epoch(3, quadratic).unwrap();
        let fast = orchestrator.parameters().clone();

        let seen = orchestrator
            .evaluate(|store| store.get(&"w".into()).unwrap()[0])
            .unwrap();

        assert_eq!(seen, 2.0);
        assert_eq!(orchestrator.parameters(), &fast);
        assert!(!orchestrator.optimizer().is_evaluating());
    }

    #[test]
    fn test_panicking_evaluation_still_restores_fast_weights() {
        let store = create_test_store();
        let optimizer = Lookahead::new(sgd(), &store, LookaheadConfig::default()).unwrap();
        let mut orchestrator = StepOrchestrator::new(optimizer, store, ConstantLr(0.1));
        orchestrator.train_epoch(2, quadratic).unwrap();
        let fast = orchestrator.parameters().clone();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _ = orchestrator.evaluate(|_| -> f32 { panic!("evaluation failed") });
        }));

        assert!(result.is_err());
        assert_eq!(orchestrator.parameters(), &fast);
        orchestrator.train_epoch(1, quadratic).unwrap();
    }

    #[test]
    fn test_instabilities_are_drained_each_step() {
        let radam = RAdam::new(RAdamConfig {
            epsilon: 1e-2,
            ..RAdamConfig::default()
        })
        .unwrap();
        let mut orchestrator = StepOrchestrator::new(radam, create_test_store(), ConstantLr(0.01));

        orchestrator.train_epoch(2, quadratic).unwrap();

        assert_eq!(orchestrator.instabilities(), 2);
        assert!(orchestrator.optimizer_mut().take_diagnostics().is_empty());
    }
}
