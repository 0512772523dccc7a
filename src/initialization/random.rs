use rand::Rng;
use rand_distr::{Distribution, Uniform};

use super::{ParamGen, Result};

/// A parameter generator that samples from a probability distribution.
pub struct RandParamGen<R: Rng, D: Distribution<f32>> {
    rng: R,
    distribution: D,
    remaining: usize,
}

impl<R: Rng, D: Distribution<f32>> RandParamGen<R, D> {
    /// Creates a new `RandParamGen`.
    ///
    /// # Arguments
    /// * `rng` - A random number generator.
    /// * `distribution` - The distribution to sample from.
    /// * `limit` - The total amount of values to generate.
    pub fn new(rng: R, distribution: D, limit: usize) -> Self {
        Self {
            rng,
            distribution,
            remaining: limit,
        }
    }
}

impl<R: Rng> RandParamGen<R, Uniform<f32>> {
    /// Creates a new `RandParamGen` over the uniform range `[low, high)`.
    ///
    /// # Returns
    /// An error if the range is empty or not finite.
    pub fn uniform(rng: R, limit: usize, low: f32, high: f32) -> Result<Self> {
        Ok(Self::new(rng, Uniform::new(low, high)?, limit))
    }

    /// Creates a new `RandParamGen` using Xavier (Glorot) uniform initialization.
    ///
    /// # Arguments
    /// * `fan_in` - The number of input units of the tensor.
    /// * `fan_out` - The number of output units of the tensor.
    pub fn xavier_uniform(rng: R, limit: usize, fan_in: usize, fan_out: usize) -> Result<Self> {
        let range = (6. / (fan_in + fan_out) as f32).sqrt();
        Self::uniform(rng, limit, -range, range)
    }
}

impl<R: Rng, D: Distribution<f32>> ParamGen for RandParamGen<R, D> {
    fn sample(&mut self, n: usize) -> Option<Vec<f32>> {
        if self.remaining == 0 {
            return None;
        }

        let n = n.min(self.remaining);
        self.remaining -= n;

        let values = (&self.distribution)
            .sample_iter(&mut self.rng)
            .take(n)
            .collect();

        Some(values)
    }
}
