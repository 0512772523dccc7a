mod orchestrator;
mod schedule;

pub use orchestrator::StepOrchestrator;
pub use schedule::{ConstantLr, LrSchedule};
