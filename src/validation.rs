use log::info;

use crate::{
    collective::Collective,
    config::SchedulerConfig,
    error::CollectiveErr,
    schedule::SchedulingParameter,
    state::{TrainingObserver, TrainingState, Transition, ValidatorRecord},
    stopping::StallPolicy,
};

/// A pluggable validation metric.
///
/// Created once at setup and reused every validation period. Each validator keeps its own
/// best score and stall counter; the scheduler mirrors them into the training state.
pub trait Validator<G>: TrainingObserver + Send {
    /// Stable identifier, used as the checkpoint key.
    fn kind(&self) -> &str;

    /// Scores the current model and updates the stall bookkeeping.
    fn validate(&mut self, graphs: &G, state: &TrainingState) -> f32;

    /// Consecutive validations without improvement.
    fn stalled(&self) -> usize;

    fn last_best(&self) -> f32;

    /// The worst possible score, used before the first validation.
    fn init_score(&self) -> f32;

    /// Overwrites the bookkeeping, e.g. with the primary worker's values or a checkpoint.
    fn restore(&mut self, stalled: usize, last_best: f32);
}

/// Best-score and stall bookkeeping for validator implementations.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreTracker {
    lower_is_better: bool,
    last_best: f32,
    stalled: usize,
}

impl ScoreTracker {
    /// Tracks a metric such as cross-entropy or perplexity.
    pub fn lower_is_better() -> Self {
        Self {
            lower_is_better: true,
            last_best: f32::MAX,
            stalled: 0,
        }
    }

    /// Tracks a metric such as accuracy or BLEU.
    pub fn higher_is_better() -> Self {
        Self {
            lower_is_better: false,
            last_best: f32::MIN,
            stalled: 0,
        }
    }

    pub fn init_score(&self) -> f32 {
        if self.lower_is_better { f32::MAX } else { f32::MIN }
    }

    /// Records a new score.
    ///
    /// # Returns
    /// True if the score improved on the best so far.
    pub fn record(&mut self, score: f32) -> bool {
        let improved = if self.lower_is_better {
            score < self.last_best
        } else {
            score > self.last_best
        };

        if improved {
            self.last_best = score;
            self.stalled = 0;
        } else {
            self.stalled += 1;
        }
        improved
    }

    pub fn stalled(&self) -> usize {
        self.stalled
    }

    pub fn last_best(&self) -> f32 {
        self.last_best
    }

    pub fn restore(&mut self, stalled: usize, last_best: f32) {
        self.stalled = stalled;
        self.last_best = last_best;
    }
}

/// Runs the registered validators on validation period boundaries.
pub struct ValidationDriver<G> {
    validators: Vec<Box<dyn Validator<G>>>,
    valid_freq: SchedulingParameter,
    valid_from: SchedulingParameter,
    policy: StallPolicy,
}

impl<G> ValidationDriver<G> {
    pub fn new(config: &SchedulerConfig) -> Self {
        Self {
            validators: Vec::new(),
            valid_freq: config.valid_freq,
            valid_from: config.valid_from,
            policy: config.early_stopping_on,
        }
    }

    /// Registers a validator and seeds its checkpoint record on a fresh start.
    ///
    /// After a load, a validator with a restored record picks up its stall count and best
    /// score from it.
    ///
    /// # Returns
    /// The validator's index, used to dispatch lifecycle transitions to it.
    pub fn add(
        &mut self,
        mut validator: Box<dyn Validator<G>>,
        state: &mut TrainingState,
    ) -> usize {
        let record = ValidatorRecord {
            last_best: validator.init_score(),
            stalled: 0,
        };
        let kind = validator.kind().to_string();
        if state.loaded {
            let restored = *state.validators.entry(kind.clone()).or_insert(record);
            validator.restore(restored.stalled, restored.last_best);
        } else {
            state.validators.insert(kind.clone(), record);
        }

        if self.validators.is_empty() {
            state.validator = kind;
        }
        self.validators.push(validator);
        self.validators.len() - 1
    }

    /// Returns true if the current update entered a validation period past `valid-from`.
    pub fn due(&self, state: &TrainingState) -> bool {
        !self.validators.is_empty()
            && state.entered_new_period_of(&self.valid_freq)
            && state.larger_than(&self.valid_from)
    }

    pub fn entered_new_period(&self, state: &TrainingState) -> bool {
        state.entered_new_period_of(&self.valid_freq)
    }

    /// Stall count aggregated with `early-stopping-on`.
    pub fn stalled(&self) -> usize {
        let counts: Vec<usize> = self.validators.iter().map(|v| v.stalled()).collect();
        self.policy.aggregate(&counts)
    }

    /// Runs every validator once.
    ///
    /// Only the primary worker scores. The score, the stall count and the best score are
    /// then broadcast so every replica's validators and state stay identical.
    ///
    /// # Args
    /// * `graphs` - The model handles the validators score.
    /// * `state` - Receives the `{last-best, stalled}` record of every validator.
    /// * `collective` - Transport used for the broadcasts.
    /// * `epoch` - Formatted logical epoch for the log lines.
    ///
    /// # Errors
    /// Propagates transport failures unchanged.
    pub fn run(
        &mut self,
        graphs: &G,
        state: &mut TrainingState,
        collective: &dyn Collective,
        epoch: &str,
    ) -> Result<(), CollectiveErr> {
        for validator in &mut self.validators {
            let mut score = 0.0;
            if collective.is_primary() {
                score = validator.validate(graphs, state);
                if validator.stalled() > 0 {
                    info!(
                        target: "valid",
                        "Ep. {epoch} : Up. {} : {} : {score} : stalled {} times (last best: {})",
                        state.batches,
                        validator.kind(),
                        validator.stalled(),
                        validator.last_best()
                    );
                } else {
                    info!(
                        target: "valid",
                        "Ep. {epoch} : Up. {} : {} : {score} : new best",
                        state.batches,
                        validator.kind()
                    );
                }
            }

            if collective.size() > 1 {
                let mut scores = [score, validator.last_best()];
                collective.broadcast_f32(&mut scores)?;
                let mut stalled = validator.stalled();
                collective.broadcast_usize(&mut stalled)?;
                validator.restore(stalled, scores[1]);
            }

            state.validators.insert(
                validator.kind().to_string(),
                ValidatorRecord {
                    last_best: validator.last_best(),
                    stalled: validator.stalled(),
                },
            );
        }
        Ok(())
    }

    /// Applies `valid-reset-stalled` / `valid-reset-all` to the restored records.
    pub fn reset_records(&self, state: &mut TrainingState, reset_best: bool) {
        for validator in &self.validators {
            if let Some(record) = state.validators.get_mut(validator.kind()) {
                record.stalled = 0;
                if reset_best {
                    record.last_best = validator.init_score();
                }
            }
        }
    }

    /// Brings every validator up to date with its record in `state`.
    pub fn restore_from(&mut self, state: &TrainingState) {
        for validator in &mut self.validators {
            if let Some(record) = state.validators.get(validator.kind()) {
                validator.restore(record.stalled, record.last_best);
            }
        }
    }

    /// Dispatches a lifecycle transition to the validator at `index`.
    pub fn notify(&mut self, index: usize, transition: Transition, state: &mut TrainingState) {
        if let Some(validator) = self.validators.get_mut(index) {
            transition.notify(validator.as_mut(), state);
        }
    }
}
