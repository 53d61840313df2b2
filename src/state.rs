use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::schedule::{SchedulingParameter, SchedulingUnit};

/// Checkpointed bookkeeping of a single validator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ValidatorRecord {
    pub last_best: f32,
    pub stalled: usize,
}

/// The single source of truth for training progress.
///
/// Owned by the `Scheduler` and persisted as `<name>.progress.yml`. Every field except
/// `loaded` survives a save/load round trip bit-for-bit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TrainingState {
    /// Current data epoch, training starts in epoch 1.
    pub epochs: u64,
    /// Number of optimizer updates.
    pub batches: u64,
    /// Batches read by the corpus reader in this epoch, used for seeking on restart.
    pub batches_epoch: u64,
    pub samples_epoch: u64,
    pub samples_total: u64,
    pub labels_total: u64,

    /// Progress remembered at the start of the current update.
    pub prev_epochs: u64,
    pub prev_batches: u64,
    pub prev_labels_total: u64,

    // Reset whenever a display period elapses.
    pub cost_sum: f32,
    pub cost_count: f32,
    pub updates_disp: u64,
    pub samples_disp: u64,
    pub words_disp: u64,

    // Divergence detection statistics over the normalized loss.
    pub loss_avg_slow: f32,
    pub loss_avg_fast: f32,
    pub loss_var_slow: f32,

    pub gradient_norm_avg: f32,
    pub gradient_norm_var: f32,
    pub log_gradient_norm_avg: f32,
    pub log_gradient_norm_var: f32,

    /// Effective learning rate.
    pub eta: f32,
    /// Cumulative decay multiplier.
    pub factor: f32,
    /// Progress at which the current warmup window began.
    pub warmup_start: SchedulingParameter,
    /// Optimizer statistics must be reset after this step.
    pub reset: bool,

    pub validators: BTreeMap<String, ValidatorRecord>,
    /// Stalled validations w.r.t. `early-stopping-on`.
    pub stalled: usize,
    pub max_stalled: usize,
    /// Already validated for the current update.
    pub validated: bool,

    /// Identifier of the primary validator.
    pub validator: String,
    /// Restored from a checkpoint and no update happened since.
    #[serde(skip)]
    pub loaded: bool,
}

impl Default for TrainingState {
    fn default() -> Self {
        Self {
            epochs: 1,
            batches: 0,
            batches_epoch: 0,
            samples_epoch: 0,
            samples_total: 0,
            labels_total: 0,
            prev_epochs: 1,
            prev_batches: 0,
            prev_labels_total: 0,
            cost_sum: 0.0,
            cost_count: 0.0,
            updates_disp: 0,
            samples_disp: 0,
            words_disp: 0,
            loss_avg_slow: 0.0,
            loss_avg_fast: 0.0,
            loss_var_slow: 0.0,
            gradient_norm_avg: 0.0,
            gradient_norm_var: 0.0,
            log_gradient_norm_avg: 0.0,
            log_gradient_norm_var: 0.0,
            eta: 0.0,
            factor: 1.0,
            warmup_start: SchedulingParameter::default(),
            reset: false,
            validators: BTreeMap::new(),
            stalled: 0,
            max_stalled: 0,
            validated: false,
            validator: String::new(),
            loaded: false,
        }
    }
}

impl TrainingState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current progress measured in `unit`.
    pub fn progress_in(&self, unit: SchedulingUnit) -> u64 {
        match unit {
            SchedulingUnit::Epochs => self.epochs,
            SchedulingUnit::Updates => self.batches,
            SchedulingUnit::TargetLabels => self.labels_total,
        }
    }

    fn prev_progress_in(&self, unit: SchedulingUnit) -> u64 {
        match unit {
            SchedulingUnit::Epochs => self.prev_epochs,
            SchedulingUnit::Updates => self.prev_batches,
            SchedulingUnit::TargetLabels => self.prev_labels_total,
        }
    }

    /// Snapshots progress before the current update mutates any counter.
    pub fn remember_previous_progress(&mut self) {
        self.prev_epochs = self.epochs;
        self.prev_batches = self.batches;
        self.prev_labels_total = self.labels_total;
    }

    /// Returns true if the current update crossed a multiple of `period`.
    ///
    /// Never true for an undefined period.
    pub fn entered_new_period_of(&self, period: &SchedulingParameter) -> bool {
        period.is_defined()
            && self.progress_in(period.unit) / period.n
                != self.prev_progress_in(period.unit) / period.n
    }

    /// Returns true if progress in the parameter's unit reached `param.n`.
    pub fn larger_than(&self, param: &SchedulingParameter) -> bool {
        self.progress_in(param.unit) >= param.n
    }

    /// Sets the effective learning rate from a rate that excludes the decay factor.
    #[inline]
    pub fn update_eta(&mut self, base_rate: f32) {
        self.eta = base_rate * self.factor;
    }

    /// Records one optimizer update made of `read_batches` corpus batches.
    pub fn new_update(&mut self, read_batches: u64) {
        self.batches += 1;
        self.batches_epoch += read_batches;
        self.loaded = false;
        self.validated = false;
    }

    pub fn new_epoch(&mut self) {
        self.epochs += 1;
    }

    /// Clears the per-epoch corpus counters once every observer saw the new epoch.
    pub fn reset_epoch_counters(&mut self) {
        self.samples_epoch = 0;
        self.batches_epoch = 0;
    }

    pub fn new_stalled(&mut self, stalled: usize) {
        self.stalled = stalled;
        if stalled > self.max_stalled {
            self.max_stalled += 1;
        }
    }

    pub fn new_load(&mut self) {
        self.loaded = true;
    }

    /// Zeroes the display accumulators.
    pub fn reset_display(&mut self) {
        self.cost_sum = 0.0;
        self.cost_count = 0.0;
        self.updates_disp = 0;
        self.samples_disp = 0;
        self.words_disp = 0;
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Overwrites this state with a serialized snapshot.
    ///
    /// Fields missing from the snapshot take their fresh-start values.
    pub fn load_from_str(&mut self, yaml: &str) -> Result<(), serde_yaml::Error> {
        *self = serde_yaml::from_str(yaml)?;
        Ok(())
    }
}

/// Lifecycle transitions of a `TrainingState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Epoch,
    Batches,
    Stalled,
    Loaded,
}

/// Reacts to lifecycle transitions of the training state.
///
/// Observers are invoked synchronously in registration order.
pub trait TrainingObserver {
    fn act_after_epoch(&mut self, _state: &mut TrainingState) {}
    fn act_after_batches(&mut self, _state: &mut TrainingState) {}
    fn act_after_stalled(&mut self, _state: &mut TrainingState) {}
    fn act_after_loaded(&mut self, _state: &mut TrainingState) {}
}

impl Transition {
    /// Invokes the callback matching this transition.
    pub fn notify<O>(self, observer: &mut O, state: &mut TrainingState)
    where
        O: TrainingObserver + ?Sized,
    {
        match self {
            Transition::Epoch => observer.act_after_epoch(state),
            Transition::Batches => observer.act_after_batches(state),
            Transition::Stalled => observer.act_after_stalled(state),
            Transition::Loaded => observer.act_after_loaded(state),
        }
    }
}
