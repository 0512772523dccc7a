//! RAdam with a Lookahead wrapper, for single process training loops.
//!
//! The crate is organised around a `ParameterStore` holding every trainable
//! vector under a `ParameterKey`, an `Optimizer` that updates it one step at a
//! time, and a `StepOrchestrator` that drives the optimizer and swaps the
//! Lookahead slow weights in for evaluation.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod initialization;
pub mod optimization;
pub mod storage;
pub mod training;

pub use checkpoint::{Backup, CheckpointSwap, EvalGuard};
pub use config::{OptimizerConfig, RuleConfig, TrainingConfig};
pub use error::{OptimError, Result};
pub use optimization::{
    AdamW, AdamWConfig, Lookahead, LookaheadConfig, Optimizer, RAdam, RAdamConfig, Sgd, SgdConfig,
};
pub use storage::{Gradients, Parameter, ParameterKey, ParameterStore};
pub use training::{ConstantLr, LrSchedule, StepOrchestrator};
