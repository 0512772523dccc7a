/// The source of the learning rate, queried once per epoch.
pub trait LrSchedule {
    /// Returns the learning rate to use during `epoch`.
    fn learning_rate(&mut self, epoch: usize) -> f32;
}

impl<F: FnMut(usize) -> f32> LrSchedule for F {
    fn learning_rate(&mut self, epoch: usize) -> f32 {
        self(epoch)
    }
}

/// The same learning rate for every epoch.
#[derive(Debug, Clone, Copy)]
pub struct ConstantLr(pub f32);

impl LrSchedule for ConstantLr {
    fn learning_rate(&mut self, _epoch: usize) -> f32 {
        self.0
    }
}
