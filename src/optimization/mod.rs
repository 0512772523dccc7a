mod adamw;
mod diagnostics;
mod lookahead;
mod optimizer;
mod radam;
mod sgd;
mod state;

pub use adamw::{AdamW, AdamWConfig};
pub use diagnostics::{BiasTerm, NumericInstability};
pub use lookahead::{Lookahead, LookaheadConfig};
pub use optimizer::Optimizer;
pub use radam::{Phase, RAdam, RAdamConfig};
pub use sgd::{Sgd, SgdConfig};
pub use state::MomentState;
