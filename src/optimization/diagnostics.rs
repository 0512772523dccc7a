use log::warn;

use crate::storage::ParameterKey;

/// The bias correction denominator that hit the epsilon floor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BiasTerm {
    FirstMoment,
    SecondMoment,
}

/// A non-fatal numeric condition observed during an update.
///
/// Raised when `1 - beta^t` falls below epsilon and gets clamped; the update still
/// happens, but the rectification may have silently degraded.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericInstability {
    pub key: ParameterKey,
    pub step: u64,
    pub term: BiasTerm,
    pub denominator: f64,
}

/// A bias correction denominator `1 - beta^t`, floored at epsilon.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BiasCorrection {
    pub value: f64,
    pub floored: Option<f64>,
}

impl BiasCorrection {
    /// Computes `1 - beta^t`, clamping it to `epsilon` when it would be smaller.
    pub fn new(beta: f32, t: u64, epsilon: f32) -> Self {
        let raw = 1. - f64::from(beta).powf(t as f64);
        let eps = f64::from(epsilon);

        if raw < eps {
            Self {
                value: eps,
                floored: Some(raw),
            }
        } else {
            Self {
                value: raw,
                floored: None,
            }
        }
    }

    /// Records a diagnostic if this correction was floored.
    pub fn report(
        &self,
        diagnostics: &mut Vec<NumericInstability>,
        key: &ParameterKey,
        step: u64,
        term: BiasTerm,
    ) {
        let Some(denominator) = self.floored else {
            return;
        };

        warn!(
            key = key.as_str(), step = step, denominator = denominator;
            "bias correction hit the epsilon floor"
        );

        diagnostics.push(NumericInstability {
            key: key.clone(),
            step,
            term,
            denominator,
        });
    }
}
