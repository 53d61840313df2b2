pub mod collective;
pub mod config;
pub mod divergence;
pub mod driver;
pub mod error;
pub mod learning_rate;
pub mod schedule;
pub mod scheduler;
pub mod signal;
pub mod state;
pub mod stopping;
pub mod validation;

pub use collective::{Collective, LocalGroup, Solo};
pub use config::{CostType, SchedulerConfig};
pub use error::{CollectiveErr, ConfigErr, DivergenceErr, Result, SchedulerErr};
pub use schedule::{SchedulingParameter, SchedulingUnit};
pub use scheduler::{BatchStats, Scheduler, StaticLoss};
pub use signal::ShutdownSignal;
pub use state::{TrainingObserver, TrainingState, Transition};
pub use stopping::{StallPolicy, StopReason};
pub use validation::{ScoreTracker, Validator};
