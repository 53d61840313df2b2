use log::info;

use crate::{
    config::SchedulerConfig,
    error::ConfigErr,
    schedule::{SchedulingParameter, SchedulingUnit},
    state::{TrainingObserver, TrainingState},
};

/// What triggers a learning-rate decay event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecayStrategy {
    /// Every epoch from `start_epoch` on.
    Epoch { start_epoch: u64 },
    /// Every epoch once both thresholds are reached.
    EpochBatches { start_epoch: u64, start_batches: u64 },
    /// Every epoch once both thresholds are reached, stalls counted by `max_stalled`.
    EpochStalled { start_epoch: u64, start_stalled: u64 },
    /// At `start`, `start + freq`, `start + 2 * freq`, ... updates.
    Batches { start: u64, freq: u64 },
    /// Whenever the stall count is a positive multiple of `start`.
    Stalled { start: u64 },
}

impl DecayStrategy {
    /// Resolves `lr-decay-strategy` together with its `lr-decay-start` / `lr-decay-freq`.
    pub fn parse(strategy: &str, start: &[u64], freq: u64) -> Result<Self, ConfigErr> {
        let first = || {
            start.first().copied().ok_or(ConfigErr::Malformed {
                setting: "lr-decay-start",
                detail: format!("strategy {strategy} needs a start value"),
            })
        };
        let second = || {
            start.get(1).copied().ok_or(ConfigErr::Malformed {
                setting: "lr-decay-start",
                detail: format!("strategy {strategy} needs two start values"),
            })
        };

        Ok(match strategy {
            "epoch" => Self::Epoch {
                start_epoch: first()?,
            },
            "epoch+batches" => Self::EpochBatches {
                start_epoch: first()?,
                start_batches: second()?,
            },
            "epoch+stalled" => Self::EpochStalled {
                start_epoch: first()?,
                start_stalled: second()?,
            },
            "batches" => Self::Batches {
                start: first()?,
                freq,
            },
            "stalled" => Self::Stalled { start: first()? },
            other => {
                return Err(ConfigErr::UnknownValue {
                    setting: "lr-decay-strategy",
                    value: other.to_string(),
                });
            }
        })
    }

    fn decays_after_epoch(&self, state: &TrainingState) -> bool {
        let epoch_reached = |start_epoch: u64| start_epoch > 0 && state.epochs >= start_epoch;
        match *self {
            Self::Epoch { start_epoch } => epoch_reached(start_epoch),
            Self::EpochBatches {
                start_epoch,
                start_batches,
            } => epoch_reached(start_epoch) && start_batches > 0 && state.batches >= start_batches,
            Self::EpochStalled {
                start_epoch,
                start_stalled,
            } => {
                epoch_reached(start_epoch)
                    && start_stalled > 0
                    && state.max_stalled as u64 >= start_stalled
            }
            Self::Batches { .. } | Self::Stalled { .. } => false,
        }
    }

    fn decays_after_batches(&self, state: &TrainingState) -> bool {
        match *self {
            Self::Batches { start, freq } => {
                start > 0 && freq > 0 && state.batches >= start && (state.batches - start) % freq == 0
            }
            _ => false,
        }
    }

    fn decays_after_stalled(&self, state: &TrainingState) -> bool {
        match *self {
            Self::Stalled { start } => {
                let stalled = state.stalled as u64;
                start > 0 && stalled > 0 && stalled % start == 0
            }
            _ => false,
        }
    }
}

/// Inverse square-root decay `sqrt(n / (progress - start + n))` past `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct InvSqrtDecay {
    n: SchedulingParameter,
    start: u64,
}

/// Computes the effective learning rate and reacts to decay-triggering transitions.
///
/// Registered as the first training observer of every scheduler.
#[derive(Debug, Clone)]
pub struct LearningRateController {
    base_rate: f32,
    warmup: SchedulingParameter,
    warmup_start_rate: f32,
    warmup_cycle: bool,
    warmup_at_reload: bool,

    decay_factor: f32,
    strategy: DecayStrategy,
    reset_optimizer: bool,
    repeat_warmup: bool,
    inv_sqrt: Option<InvSqrtDecay>,

    mb_warmup: SchedulingParameter,
    mb_track_lr: bool,

    /// No update happened since construction (or reload).
    first: bool,
}

impl LearningRateController {
    /// Builds the controller from the learning-rate related settings.
    ///
    /// # Errors
    /// `ConfigErr` for unknown decay strategies, missing decay starts and inverse
    /// square-root arguments in different units.
    pub fn new(config: &SchedulerConfig) -> Result<Self, ConfigErr> {
        let strategy = DecayStrategy::parse(
            &config.lr_decay_strategy,
            &config.lr_decay_start,
            config.lr_decay_freq,
        )?;

        let inv_sqrt = match config.lr_decay_inv_sqrt.as_slice() {
            [] => None,
            [n] => Some(InvSqrtDecay { n: *n, start: n.n }),
            [n, start] => {
                if start.is_defined() && start.unit != n.unit {
                    return Err(ConfigErr::UnitMismatch {
                        setting: "lr-decay-inv-sqrt",
                        detail: format!("{n} and {start} must have the same unit"),
                    });
                }
                Some(InvSqrtDecay {
                    n: *n,
                    start: start.n,
                })
            }
            more => {
                return Err(ConfigErr::Malformed {
                    setting: "lr-decay-inv-sqrt",
                    detail: format!("expected one or two values, got {}", more.len()),
                });
            }
        }
        .filter(|decay| decay.n.is_defined());

        Ok(Self {
            base_rate: config.learn_rate,
            warmup: config.lr_warmup,
            warmup_start_rate: config.lr_warmup_start_rate,
            warmup_cycle: config.lr_warmup_cycle,
            warmup_at_reload: config.lr_warmup_at_reload,
            decay_factor: config.lr_decay,
            strategy,
            reset_optimizer: config.lr_decay_reset_optimizer,
            repeat_warmup: config.lr_decay_repeat_warmup,
            inv_sqrt,
            mb_warmup: config.mini_batch_warmup,
            mb_track_lr: config.mini_batch_track_lr,
            first: true,
        })
    }

    /// Fraction of the warmup window completed, 1 without warmup.
    pub fn warmup_factor(&self, state: &TrainingState) -> f32 {
        if !self.warmup.is_defined() {
            return 1.0;
        }
        let progress = state
            .progress_in(self.warmup.unit)
            .saturating_sub(state.warmup_start.n);
        (progress as f32 / self.warmup.n as f32).min(1.0)
    }

    /// Scheduled inverse square-root decay, 1 until the decay starts.
    pub fn inv_sqrt_decay_factor(&self, state: &TrainingState) -> f32 {
        match self.inv_sqrt {
            Some(InvSqrtDecay { n, start }) => {
                let progress = state.progress_in(n.unit);
                if progress > start {
                    // shifted so that the factor is 1 at progress == start
                    let shifted = progress - start + n.n;
                    (n.n as f64 / shifted as f64).sqrt() as f32
                } else {
                    1.0
                }
            }
            None => 1.0,
        }
    }

    /// Learning rate before the cumulative decay factor is applied.
    ///
    /// The warmup start rate always comes from the settings, also on resume.
    fn scheduled_rate(&self, state: &TrainingState) -> f32 {
        let warmup = self.warmup_factor(state);
        let rate = self.warmup_start_rate * (1.0 - warmup) + self.base_rate * warmup;
        rate * self.inv_sqrt_decay_factor(state)
    }

    /// The learning rate the optimizer should use for `state`.
    pub fn effective_rate(&self, state: &TrainingState) -> f32 {
        self.scheduled_rate(state) * state.factor
    }

    /// Recomputes `state.eta`.
    pub fn update_learning_rate(&self, state: &mut TrainingState) {
        state.update_eta(self.scheduled_rate(state));
    }

    /// Restarts the warmup window at the current progress.
    pub fn restart_warmup(&self, state: &mut TrainingState) {
        state.warmup_start =
            SchedulingParameter::new(state.progress_in(self.warmup.unit), self.warmup.unit);
    }

    /// Checks that a restored warmup start is measured like the configured warmup.
    pub fn check_restored(&self, state: &TrainingState) -> Result<(), ConfigErr> {
        if self.warmup.is_defined()
            && state.warmup_start.is_defined()
            && state.warmup_start.unit != self.warmup.unit
        {
            return Err(ConfigErr::UnitMismatch {
                setting: "lr-warmup",
                detail: format!(
                    "warmup {} and restored warmup start {} differ",
                    self.warmup, state.warmup_start
                ),
            });
        }
        Ok(())
    }

    fn decay_enabled(&self) -> bool {
        self.decay_factor > 0.0
    }

    fn decay(&self, state: &mut TrainingState, reason: &str) {
        state.factor *= self.decay_factor;
        self.update_learning_rate(state);
        info!("Decaying learning rate to {} {reason}", state.eta);

        state.reset = self.reset_optimizer;
        if state.reset {
            info!("Resetting optimizer statistics");
        }

        if self.repeat_warmup {
            info!("Restarting learning rate warmup");
            self.restart_warmup(state);
        }
    }

    /// Returns true if any setting rescales the mini-batch size.
    pub fn is_dynamic_mb_scaling(&self) -> bool {
        self.mb_warmup.is_defined() || self.mb_track_lr
    }

    /// Multiplier for the mini-batch size.
    ///
    /// Ramps from 0 to 1 over `mini-batch-warmup` (square-root shaped when counted in
    /// labels, since each update then consumes more labels than the last). With
    /// `mini-batch-track-lr` the size also grows as the decayed rate shrinks; warmup is
    /// left out of that factor.
    pub fn dynamic_mb_size_multiplier(&self, state: &TrainingState) -> f64 {
        let mut ratio = 1.0;

        if self.mb_warmup.is_defined() {
            let progress = state.progress_in(self.mb_warmup.unit);
            let mut progress_ratio = progress as f64 / self.mb_warmup.n as f64;
            if self.mb_warmup.unit == SchedulingUnit::TargetLabels {
                progress_ratio = progress_ratio.sqrt();
            }
            if progress_ratio < 1.0 {
                ratio *= progress_ratio;
            }
        }

        if self.mb_track_lr {
            let lr_factor = self.inv_sqrt_decay_factor(state) as f64 * state.factor as f64;
            ratio /= lr_factor;
        }

        ratio
    }
}

impl TrainingObserver for LearningRateController {
    fn act_after_epoch(&mut self, state: &mut TrainingState) {
        state.reset = false;
        self.update_learning_rate(state);

        if self.decay_enabled() && self.strategy.decays_after_epoch(state) {
            let reason = format!("in epoch {}", state.epochs);
            self.decay(state, &reason);
        }
    }

    fn act_after_batches(&mut self, state: &mut TrainingState) {
        state.reset = false;
        self.update_learning_rate(state);

        if self.decay_enabled() && self.strategy.decays_after_batches(state) {
            let reason = format!("after {} batches", state.batches);
            self.decay(state, &reason);
        }

        if self.first && self.warmup_at_reload {
            info!("Restarting learning rate warmup");
            self.restart_warmup(state);
        }

        if self.warmup_cycle && state.entered_new_period_of(&self.warmup) {
            self.restart_warmup(state);
        }

        self.first = false;
    }

    fn act_after_stalled(&mut self, state: &mut TrainingState) {
        state.reset = false;
        self.update_learning_rate(state);

        if self.decay_enabled() && self.strategy.decays_after_stalled(state) {
            let reason = format!("after having stalled {} time(s)", state.stalled);
            self.decay(state, &reason);
        }
    }

    fn act_after_loaded(&mut self, _state: &mut TrainingState) {
        self.first = true;
    }
}
