use std::{env, fs};

use anyhow::{Context, Result};
use log::info;
use rand::{Rng, SeedableRng, rngs::StdRng};

use lookahead_optim::{
    Gradients, ParameterStore, StepOrchestrator, TrainingConfig,
    initialization::{ConstParamGen, ParamGen, RandParamGen},
};

const FEATURES: usize = 4;
const SAMPLES: usize = 256;
const TRUE_WEIGHTS: [f32; FEATURES] = [1.5, -2.0, 0.5, 3.0];
const TRUE_BIAS: f32 = -1.0;

/// A synthetic linear regression problem, `y = x . w + b`.
struct Dataset {
    x: Vec<f32>,
    y: Vec<f32>,
}

impl Dataset {
    fn generate<R: Rng>(rng: R) -> Result<Self> {
        let mut param_gen = RandParamGen::uniform(rng, SAMPLES * FEATURES, -1., 1.)?;
        let x = param_gen
            .sample(SAMPLES * FEATURES)
            .context("failed to sample the dataset")?;

        let y = x
            .chunks_exact(FEATURES)
            .map(|row| dot(row, &TRUE_WEIGHTS) + TRUE_BIAS)
            .collect();

        Ok(Self { x, y })
    }

    fn split(store: &ParameterStore) -> lookahead_optim::Result<(&[f32], f32)> {
        let w = store
            .get(&"w".into())
            .ok_or_else(|| lookahead_optim::OptimError::UnknownKey("w".into()))?;
        let b = store
            .get(&"b".into())
            .ok_or_else(|| lookahead_optim::OptimError::UnknownKey("b".into()))?;

        Ok((w, b[0]))
    }

    /// The mean squared error over the whole dataset.
    fn loss(&self, store: &ParameterStore) -> lookahead_optim::Result<f32> {
        let (w, b) = Self::split(store)?;

        let sum: f32 = self
            .x
            .chunks_exact(FEATURES)
            .zip(&self.y)
            .map(|(row, y)| (dot(row, w) + b - y).powi(2))
            .sum();

        Ok(sum / self.y.len() as f32)
    }

    fn gradients(&self, store: &ParameterStore) -> lookahead_optim::Result<Gradients> {
        let (w, b) = Self::split(store)?;
        let scale = 2. / self.y.len() as f32;

        let mut grad_w = vec![0.; FEATURES];
        let mut grad_b = 0.;

        for (row, y) in self.x.chunks_exact(FEATURES).zip(&self.y) {
            let err = dot(row, w) + b - y;
            grad_w.iter_mut().zip(row).for_each(|(g, x)| *g += scale * err * x);
            grad_b += scale * err;
        }

        Ok(Gradients::from([
            ("w".into(), grad_w),
            ("b".into(), vec![grad_b]),
        ]))
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(a, b)| a * b).sum()
}

fn load_config() -> Result<TrainingConfig> {
    let Some(path) = env::args().nth(1) else {
        info!("no config given, using the defaults");
        return Ok(TrainingConfig::default());
    };

    let json = fs::read_to_string(&path).with_context(|| format!("failed to read {path}"))?;
    let config = TrainingConfig::from_json(&json).with_context(|| format!("invalid config {path}"))?;
    Ok(config)
}

fn main() -> Result<()> {
    env_logger::init();

    let config = load_config()?;
    let seed = config.seed.unwrap_or_else(rand::random);
    info!(seed = seed; "starting training run");

    let mut rng = StdRng::seed_from_u64(seed);
    let dataset = Dataset::generate(&mut rng)?;

    let mut w_gen = RandParamGen::xavier_uniform(&mut rng, FEATURES, FEATURES, 1)?;
    let mut store = ParameterStore::from_param_gen([("w", FEATURES)], &mut w_gen)?;
    let mut b_gen = ConstParamGen::new(0., 1);
    store.insert("b", b_gen.sample(1).context("failed to sample b")?)?;

    let optimizer = config.optimizer.build(&store)?;
    let (base_lr, decay) = (config.learning_rate, config.lr_decay);
    let schedule = move |epoch: usize| base_lr * decay.powi(epoch as i32);
    let mut orchestrator = StepOrchestrator::new(optimizer, store, schedule);

    for epoch in 0..config.epochs.get() {
        orchestrator.begin_epoch(epoch);
        orchestrator.train_epoch(config.steps_per_epoch.get(), |store| {
            dataset.gradients(store)
        })?;

        let loss = orchestrator.evaluate(|store| dataset.loss(store))??;
        info!(epoch = epoch, steps = orchestrator.steps(), loss = loss; "epoch finished");
    }

    let (_, store) = orchestrator.into_parts();
    println!("{}", serde_json::to_string_pretty(&store)?);
    Ok(())
}
