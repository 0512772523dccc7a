use std::num::NonZeroUsize;

use serde::{Deserialize, Serialize};

use crate::{
    error::{OptimError, Result},
    optimization::{
        AdamW, AdamWConfig, Lookahead, LookaheadConfig, Optimizer, RAdam, RAdamConfig, Sgd,
        SgdConfig,
    },
    storage::ParameterStore,
};

const DEFAULT_EPOCHS: NonZeroUsize = NonZeroUsize::new(10).unwrap();
const DEFAULT_STEPS_PER_EPOCH: NonZeroUsize = NonZeroUsize::new(50).unwrap();

/// The base rule to build, tagged by `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuleConfig {
    #[serde(rename = "radam")]
    RAdam(RAdamConfig),
    #[serde(rename = "adamw")]
    AdamW(AdamWConfig),
    Sgd(SgdConfig),
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self::RAdam(RAdamConfig::default())
    }
}

/// The settings of a full optimizer: a base rule, optionally wrapped in
/// `Lookahead`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default)]
    pub rule: RuleConfig,
    #[serde(default)]
    pub lookahead: Option<LookaheadConfig>,
}

impl OptimizerConfig {
    /// Parses an `OptimizerConfig` from its json representation.
    ///
    /// # Returns
    /// A `Json` error if the document is malformed, or an `InvalidConfig` if it
    /// parses but any hyperparameter is out of its domain.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        match &self.rule {
            RuleConfig::RAdam(cfg) => cfg.validate()?,
            RuleConfig::AdamW(cfg) => cfg.validate()?,
            RuleConfig::Sgd(cfg) => cfg.validate()?,
        }

        match &self.lookahead {
            Some(cfg) => cfg.validate(),
            None => Ok(()),
        }
    }

    /// Builds the configured optimizer.
    ///
    /// # Arguments
    /// * `store` - The parameters that will be optimized, used to seed the slow
    ///   weights when `lookahead` is set.
    ///
    /// # Returns
    /// The boxed optimizer, or an `InvalidConfig` error.
    pub fn build(&self, store: &ParameterStore) -> Result<Box<dyn Optimizer>> {
        let rule: Box<dyn Optimizer> = match self.rule {
            RuleConfig::RAdam(cfg) => Box::new(RAdam::new(cfg)?),
            RuleConfig::AdamW(cfg) => Box::new(AdamW::new(cfg)?),
            RuleConfig::Sgd(cfg) => Box::new(Sgd::new(cfg)?),
        };

        match self.lookahead {
            Some(cfg) => Ok(Box::new(Lookahead::new(rule, store, cfg)?)),
            None => Ok(rule),
        }
    }
}

/// The settings of a training run of the `lookahead-train` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    pub learning_rate: f32,
    pub epochs: NonZeroUsize,
    pub steps_per_epoch: NonZeroUsize,
    /// Multiplies the learning rate at every epoch boundary.
    #[serde(default = "default_lr_decay")]
    pub lr_decay: f32,
    pub seed: Option<u64>,
}

fn default_lr_decay() -> f32 {
    1.
}

impl TrainingConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.learning_rate > 0. && self.learning_rate.is_finite()) {
            return Err(OptimError::InvalidConfig(format!(
                "learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }

        if !(self.lr_decay > 0. && self.lr_decay <= 1.) {
            return Err(OptimError::InvalidConfig(format!(
                "lr_decay must be in (0, 1], got {}",
                self.lr_decay
            )));
        }

        self.optimizer.validate()
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerConfig {
                rule: RuleConfig::default(),
                lookahead: Some(LookaheadConfig::default()),
            },
            learning_rate: 1e-2,
            epochs: DEFAULT_EPOCHS,
            steps_per_epoch: DEFAULT_STEPS_PER_EPOCH,
            lr_decay: 0.95,
            seed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Gradients;

    fn create_test_store() -> ParameterStore {
        let mut store = ParameterStore::new();
        store.insert("w", vec![1.0, -1.0]).unwrap();
        store
    }

    #[test]
    fn test_missing_fields_take_defaults() {
        let config = OptimizerConfig::from_json(r#"{ "rule": { "kind": "radam" } }"#).unwrap();

        assert_eq!(config.rule, RuleConfig::RAdam(RAdamConfig::default()));
        assert_eq!(config.lookahead, None);
    }

    #[test]
    fn test_parse_sgd_with_lookahead() {
        let json = r#"{
            "rule": { "kind": "sgd", "momentum": 0.5, "nesterov": false },
            "lookahead": { "k": 3, "alpha": 0.8 }
        }"#;
        let config = OptimizerConfig::from_json(json).unwrap();

        let RuleConfig::Sgd(sgd) = config.rule else {
            panic!("expected an sgd rule, got {:?}", config.rule);
        };
        assert_eq!(sgd.momentum, 0.5);
        assert!(!sgd.nesterov);
        assert_eq!(sgd.weight_decay, SgdConfig::default().weight_decay);

        let lookahead = config.lookahead.unwrap();
        assert_eq!(lookahead.k.get(), 3);
        assert_eq!(lookahead.alpha, 0.8);
    }

    #[test]
    fn test_out_of_domain_values_are_rejected() {
        let bad = [
            r#"{ "rule": { "kind": "radam", "beta1": 1.0 } }"#,
            r#"{ "rule": { "kind": "adamw", "epsilon": 0.0 } }"#,
            r#"{ "rule": { "kind": "sgd", "weight_decay": -1.0 } }"#,
            r#"{ "lookahead": { "alpha": 0.0 } }"#,
        ];

        for json in bad {
            assert!(
                matches!(OptimizerConfig::from_json(json), Err(OptimError::InvalidConfig(_))),
                "{json} should be rejected"
            );
        }
    }

    #[test]
    fn test_zero_k_fails_to_parse() {
        let err = OptimizerConfig::from_json(r#"{ "lookahead": { "k": 0 } }"#).unwrap_err();
        assert!(matches!(err, OptimError::Json(_)));
    }

    #[test]
    fn test_unknown_rule_fails_to_parse() {
        let err = OptimizerConfig::from_json(r#"{ "rule": { "kind": "adagrad" } }"#).unwrap_err();
        assert!(matches!(err, OptimError::Json(_)));
    }

    #[test]
    fn test_build_wraps_in_lookahead() {
        let store = create_test_store();
        let config = OptimizerConfig {
            rule: RuleConfig::Sgd(SgdConfig {
                momentum: 0.,
                nesterov: false,
                weight_decay: 0.,
            }),
            lookahead: Some(LookaheadConfig::default()),
        };
        let mut optimizer = config.build(&store).unwrap();

        let state = optimizer.state_dict().unwrap();
        assert_eq!(state["rule"], "lookahead");
        assert_eq!(state["inner"]["rule"], "sgd");

        let mut store = store;
        optimizer.begin_evaluation(&mut store).unwrap();
        let grads = Gradients::from([("w".into(), vec![1.0, 1.0])]);
        assert!(matches!(
            optimizer.step(&mut store, &grads, 0.1),
            Err(OptimError::StepDuringEvaluation)
        ));
        optimizer.end_evaluation(&mut store).unwrap();
    }

    #[test]
    fn test_build_plain_rule() {
        let store = create_test_store();
        let optimizer = OptimizerConfig::default().build(&store).unwrap();

        let state = optimizer.state_dict().unwrap();
        assert_eq!(state["rule"], "radam");
    }

    #[test]
    fn test_training_config_defaults() {
        let json = r#"{ "learning_rate": 0.001, "epochs": 2, "steps_per_epoch": 10 }"#;
        let config = TrainingConfig::from_json(json).unwrap();

        assert_eq!(config.lr_decay, 1.);
        assert_eq!(config.seed, None);
        assert_eq!(config.optimizer, OptimizerConfig::default());
    }

    #[test]
    fn test_training_config_rejects_bad_learning_rate() {
        let json = r#"{ "learning_rate": -1.0, "epochs": 2, "steps_per_epoch": 10 }"#;
        assert!(matches!(
            TrainingConfig::from_json(json),
            Err(OptimError::InvalidConfig(_))
        ));
    }
}
