/// Produces the initial values of the parameter vectors.
pub trait ParamGen {
    /// Samples at most `n` values.
    ///
    /// # Arguments
    /// * `n` - The upper limit of values to generate.
    ///
    /// # Returns
    /// `None` once the generator is exhausted, otherwise up to `n` values.
    fn sample(&mut self, n: usize) -> Option<Vec<f32>>;
}

impl<P: ParamGen + ?Sized> ParamGen for Box<P> {
    fn sample(&mut self, n: usize) -> Option<Vec<f32>> {
        (**self).sample(n)
    }
}
