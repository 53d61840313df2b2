use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{
    config::SchedulerConfig,
    error::ConfigErr,
    schedule::{SchedulingParameter, SchedulingUnit},
    state::TrainingState,
};

/// Which validators' stall counts drive early stopping.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StallPolicy {
    /// The first registered validator only.
    #[default]
    First,
    /// The most stalled validator, stops soonest.
    Any,
    /// The least stalled validator, stops only once every validator stalled.
    All,
}

impl StallPolicy {
    /// Aggregates per-validator stall counts, given in registration order.
    ///
    /// Without validators nothing ever stalls.
    pub fn aggregate(self, stalled: &[usize]) -> usize {
        match self {
            StallPolicy::First => stalled.first().copied().unwrap_or(0),
            StallPolicy::Any => stalled.iter().copied().max().unwrap_or(0),
            StallPolicy::All => stalled.iter().copied().min().unwrap_or(0),
        }
    }
}

/// A user-defined epoch: a multiple of data epochs, updates or labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicalEpoch {
    unit: SchedulingParameter,
    width: usize,
}

impl Default for LogicalEpoch {
    fn default() -> Self {
        Self {
            unit: SchedulingParameter::new(1, SchedulingUnit::Epochs),
            width: 0,
        }
    }
}

impl LogicalEpoch {
    /// Parses `logical-epoch: [param]` or `[param, width]`.
    ///
    /// Without an explicit width, plain data epochs print as integers and anything else
    /// with three decimals.
    pub fn parse(args: &[String]) -> Result<Self, ConfigErr> {
        let malformed = |detail: String| ConfigErr::Malformed {
            setting: "logical-epoch",
            detail,
        };

        let (unit, width) = match args {
            [unit] => (SchedulingParameter::parse(unit)?, None),
            [unit, width] => {
                let width = width
                    .parse()
                    .map_err(|_| malformed(format!("width {width:?} is not a count")))?;
                (SchedulingParameter::parse(unit)?, Some(width))
            }
            _ => return Err(malformed(format!("expected 1 or 2 values, got {}", args.len()))),
        };
        if !unit.is_defined() {
            return Err(malformed(format!("{unit} is not a valid epoch size")));
        }

        let plain = unit == SchedulingParameter::new(1, SchedulingUnit::Epochs);
        let width = width.unwrap_or(if plain { 0 } else { 3 });
        Ok(Self { unit, width })
    }

    /// Returns true for the classic one-data-epoch definition.
    pub fn is_data_epoch(&self) -> bool {
        self.unit == SchedulingParameter::new(1, SchedulingUnit::Epochs)
    }

    pub fn calculate(&self, state: &TrainingState) -> f32 {
        state.progress_in(self.unit.unit) as f32 / self.unit.n as f32
    }

    pub fn format(&self, state: &TrainingState) -> String {
        format!("{:.*}", self.width, self.calculate(state))
    }
}

/// Why training should stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    ShutdownRequested,
    AfterEpochs(u64),
    AfterBatches(u64),
    Criterion(SchedulingParameter),
    EarlyStopping { stalled: usize },
    EndOfInput,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ShutdownRequested => f.write_str("shutdown requested"),
            Self::AfterEpochs(n) => write!(f, "reached {n} epochs"),
            Self::AfterBatches(n) => write!(f, "reached {n} updates"),
            Self::Criterion(param) => write!(f, "reached stopping criterion {param}"),
            Self::EarlyStopping { stalled } => {
                write!(f, "validation stalled {stalled} times")
            }
            Self::EndOfInput => f.write_str("end of input"),
        }
    }
}

/// Compound stop criteria, evaluated without side effects.
#[derive(Debug, Clone, PartialEq)]
pub struct StoppingPolicy {
    after_epochs: u64,
    after_batches: u64,
    criteria: Vec<SchedulingParameter>,
    early_stopping: usize,
    logical_epoch: LogicalEpoch,
}

impl StoppingPolicy {
    /// Builds the policy from `after-epochs`, `after-batches`, `after`, `early-stopping`
    /// and `logical-epoch`.
    ///
    /// # Errors
    /// `ConfigErr` on a malformed entry in the `after` list or in `logical-epoch`.
    pub fn new(config: &SchedulerConfig) -> Result<Self, ConfigErr> {
        let criteria = config
            .after
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(SchedulingParameter::parse)
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .filter(SchedulingParameter::is_defined)
            .collect();

        Ok(Self {
            after_epochs: config.after_epochs,
            after_batches: config.after_batches,
            criteria,
            early_stopping: config.early_stopping,
            logical_epoch: LogicalEpoch::parse(&config.logical_epoch)?,
        })
    }

    pub fn logical_epoch(&self) -> &LogicalEpoch {
        &self.logical_epoch
    }

    /// Returns the first satisfied stop criterion, if any.
    ///
    /// # Args
    /// * `state` - Current training progress.
    /// * `stalled` - Stall count aggregated with the configured `StallPolicy`.
    /// * `shutdown` - An external shutdown was requested.
    /// * `end_of_input` - The training data stream ended.
    pub fn stop_reason(
        &self,
        state: &TrainingState,
        stalled: usize,
        shutdown: bool,
        end_of_input: bool,
    ) -> Option<StopReason> {
        if shutdown {
            return Some(StopReason::ShutdownRequested);
        }

        let epoch = self.logical_epoch.calculate(state);
        if self.after_epochs > 0 && epoch > self.after_epochs as f32 {
            return Some(StopReason::AfterEpochs(self.after_epochs));
        }
        if self.after_batches > 0 && state.batches >= self.after_batches {
            return Some(StopReason::AfterBatches(self.after_batches));
        }

        for criterion in &self.criteria {
            let reached = match criterion.unit {
                SchedulingUnit::Epochs => epoch > criterion.n as f32,
                SchedulingUnit::Updates => state.batches >= criterion.n,
                SchedulingUnit::TargetLabels => state.labels_total >= criterion.n,
            };
            if reached {
                return Some(StopReason::Criterion(*criterion));
            }
        }

        if self.early_stopping > 0 && stalled >= self.early_stopping {
            return Some(StopReason::EarlyStopping { stalled });
        }

        end_of_input.then_some(StopReason::EndOfInput)
    }

    pub fn keep_going(
        &self,
        state: &TrainingState,
        stalled: usize,
        shutdown: bool,
        end_of_input: bool,
    ) -> bool {
        self.stop_reason(state, stalled, shutdown, end_of_input).is_none()
    }
}
