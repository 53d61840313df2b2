use std::{fs, io, path::Path, time::Instant};

use log::{debug, info};

use crate::{
    collective::Collective,
    config::{CostType, SchedulerConfig},
    divergence::DivergenceDetector,
    error::{Result, SchedulerErr},
    learning_rate::LearningRateController,
    signal::ShutdownSignal,
    state::{TrainingObserver, TrainingState, Transition},
    stopping::{StopReason, StoppingPolicy},
    validation::{ValidationDriver, Validator},
};

/// Loss of one update as a sum over its labels.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StaticLoss {
    pub loss: f32,
    pub count: f32,
}

/// Size statistics of one update, as reported by the training loop.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BatchStats {
    /// Corpus batches consumed by this update, used for seeking on restart.
    pub read_batches: u64,
    pub samples: u64,
    pub labels: u64,
    /// Gradient norm of the update, 0 if unknown.
    pub gradient_norm: f32,
}

enum ObserverSlot {
    Validator(usize),
    External(Box<dyn TrainingObserver + Send>),
}

/// Drives a training run update by update.
///
/// Owns the `TrainingState` and decides when to log, validate, save, decay the learning
/// rate and stop. Every worker of a distributed run owns one scheduler; they stay identical
/// as long as they issue the same calls in the same order.
pub struct Scheduler<G = ()> {
    config: SchedulerConfig,
    state: TrainingState,
    lr: LearningRateController,
    divergence: Option<DivergenceDetector>,
    stopping: StoppingPolicy,
    validation: ValidationDriver<G>,
    observers: Vec<ObserverSlot>,
    collective: Box<dyn Collective>,
    shutdown: ShutdownSignal,
    end_of_input: bool,
    timer: Instant,
}

impl<G> Scheduler<G> {
    /// Creates a scheduler for a fresh run.
    ///
    /// # Args
    /// * `config` - The scheduling settings, validated here.
    /// * `collective` - The transport shared with the other workers, `Solo` if none.
    ///
    /// # Errors
    /// `SchedulerErr::Config` on any invalid setting.
    pub fn new(config: SchedulerConfig, collective: Box<dyn Collective>) -> Result<Self> {
        config.validate()?;

        let lr = LearningRateController::new(&config)?;
        let divergence = DivergenceDetector::from_args(config.throw_on_divergence.as_deref())?;
        let stopping = StoppingPolicy::new(&config)?;
        let validation = ValidationDriver::new(&config);

        if let Some(detector) = &divergence {
            info!(
                "Divergence detection enabled: slow window {}, fast window {}, tolerance {} sigmas",
                detector.slow_window(),
                detector.fast_window(),
                detector.tolerance()
            );
        }

        let mut state = TrainingState::new();
        lr.update_learning_rate(&mut state);

        Ok(Self {
            config,
            state,
            lr,
            divergence,
            stopping,
            validation,
            observers: Vec::new(),
            collective,
            shutdown: ShutdownSignal::new(),
            end_of_input: false,
            timer: Instant::now(),
        })
    }

    /// Replaces the internal shutdown flag with a shared one.
    pub fn with_shutdown_signal(mut self, shutdown: ShutdownSignal) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn state(&self) -> &TrainingState {
        &self.state
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_primary(&self) -> bool {
        self.collective.is_primary()
    }

    /// Registers a validator, which also becomes a training observer.
    pub fn add_validator(&mut self, validator: Box<dyn Validator<G>>) {
        let index = self.validation.add(validator, &mut self.state);
        self.observers.push(ObserverSlot::Validator(index));
    }

    /// Registers an observer invoked after every validator registered before it.
    pub fn register_observer(&mut self, observer: Box<dyn TrainingObserver + Send>) {
        self.observers.push(ObserverSlot::External(observer));
    }

    fn notify(&mut self, transition: Transition) {
        transition.notify(&mut self.lr, &mut self.state);
        for slot in &mut self.observers {
            match slot {
                ObserverSlot::Validator(index) => {
                    self.validation.notify(*index, transition, &mut self.state)
                }
                ObserverSlot::External(observer) => {
                    transition.notify(observer.as_mut(), &mut self.state)
                }
            }
        }
    }

    /// Stall count aggregated with `early-stopping-on`.
    pub fn stalled(&self) -> usize {
        self.validation.stalled()
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stopping.stop_reason(
            &self.state,
            self.stalled(),
            self.shutdown.is_requested(),
            self.end_of_input,
        )
    }

    pub fn keep_going(&self) -> bool {
        self.stop_reason().is_none()
    }

    /// Marks the training input as exhausted.
    pub fn signal_end_of_input(&mut self) {
        self.end_of_input = true;
    }

    pub fn started(&self) {
        info!("Training started");
    }

    pub fn finished(&self) {
        match self.stop_reason() {
            Some(StopReason::ShutdownRequested) => info!("Training interrupted (via signal)"),
            Some(reason) => info!("Training finished: {reason}"),
            None => info!("Training finished"),
        }
    }

    /// Returns true if a validation is due after the current update.
    pub fn validating(&self) -> bool {
        self.validation.due(&self.state) && self.keep_going()
    }

    /// Returns true if a checkpoint should be written after the current update.
    ///
    /// Always true once a shutdown was requested, so the run can be resumed.
    pub fn saving(&self) -> bool {
        if self.shutdown.is_requested() {
            return true;
        }
        self.state.entered_new_period_of(&self.config.save_freq)
            && self.state.larger_than(&self.config.save_from)
    }

    /// Returns true if the workers' model replicas should be synchronized.
    pub fn syncing(&self) -> bool {
        self.state.entered_new_period_of(&self.config.sync_freq)
    }

    /// Returns true if the model should be replaced with its smoothed copy.
    pub fn replacing_with_smoothed(&self) -> bool {
        self.config.exponential_smoothing > 0.0
            && self
                .state
                .entered_new_period_of(&self.config.exponential_smoothing_replace_freq)
    }

    /// Runs the validators if a validation period was entered.
    ///
    /// Does nothing after a shutdown request or if the current update was already validated.
    ///
    /// # Args
    /// * `graphs` - The model handles passed to the validators.
    /// * `is_final` - Validate regardless of the validation frequency.
    ///
    /// # Errors
    /// `SchedulerErr::Collective` if the broadcasts fail.
    pub fn validate(&mut self, graphs: &G, is_final: bool) -> Result<()> {
        if self.shutdown.is_requested()
            || self.state.validated
            || (!self.validation.entered_new_period(&self.state) && !is_final)
        {
            return Ok(());
        }

        let before = self.stalled();
        let epoch = self.stopping.logical_epoch().format(&self.state);
        self.validation
            .run(graphs, &mut self.state, self.collective.as_ref(), &epoch)?;

        let after = self.stalled();
        if after > before {
            self.state.new_stalled(after);
            self.notify(Transition::Stalled);
        } else {
            self.state.stalled = after;
        }

        self.state.validated = true;
        Ok(())
    }

    /// Records one optimizer update.
    ///
    /// Sums the loss across workers, advances the progress counters, fires the batch
    /// transition, checks for divergence and logs on display boundaries.
    ///
    /// # Args
    /// * `loss` - This worker's share of the update's loss.
    /// * `batch` - Size statistics of the update.
    ///
    /// # Errors
    /// `SchedulerErr::Divergence` if the loss diverged, `SchedulerErr::Collective` if the
    /// all-reduce failed.
    pub fn update(&mut self, loss: StaticLoss, batch: BatchStats) -> Result<()> {
        self.state.remember_previous_progress();
        self.state.validated = false;

        let mut reduced = [loss.loss, loss.count];
        self.collective.all_reduce_sum(&mut reduced)?;
        let [loss_sum, label_count] = reduced;

        let state = &mut self.state;
        state.cost_sum += loss_sum;
        state.cost_count += label_count;
        state.updates_disp += 1;
        state.samples_disp += batch.samples;
        state.words_disp += batch.labels;
        state.samples_epoch += batch.samples;
        state.samples_total += batch.samples;
        state.labels_total += batch.labels;

        state.new_update(batch.read_batches);
        self.notify(Transition::Batches);

        let display = self.state.entered_new_period_of(&self.config.disp_freq)
            || self.state.batches <= self.config.disp_first;

        if let Some(detector) = &self.divergence {
            detector.observe(&mut self.state, loss_sum / label_count, display)?;
        }

        if batch.gradient_norm > 0.0 && batch.gradient_norm.is_finite() {
            self.update_gradient_norm(batch.gradient_norm);
        }

        if display {
            if self.collective.is_primary() {
                self.log_progress(batch.labels);
            }
            self.timer = Instant::now();
            self.state.reset_display();
        }
        Ok(())
    }

    fn update_gradient_norm(&mut self, norm: f32) {
        let window = self.config.gradient_norm_average_window;
        let range = window.min(usize::try_from(self.state.batches).unwrap_or(usize::MAX));
        if range == 0 {
            return;
        }
        let alpha = 2.0 / (range + 1) as f32;
        let state = &mut self.state;

        let delta = norm - state.gradient_norm_avg;
        state.gradient_norm_avg += alpha * delta;
        state.gradient_norm_var = (1.0 - alpha) * (state.gradient_norm_var + alpha * delta * delta);

        let log_delta = norm.ln() - state.log_gradient_norm_avg;
        state.log_gradient_norm_avg += alpha * log_delta;
        state.log_gradient_norm_var =
            (1.0 - alpha) * (state.log_gradient_norm_var + alpha * log_delta * log_delta);
    }

    fn log_progress(&self, batch_labels: u64) {
        let elapsed = self.timer.elapsed().as_secs_f64();
        let words_per_sec = self.state.words_disp as f64 / elapsed;
        let line = format!(
            "Ep. {} : Up. {} : Sen. {} : {} : Time {elapsed:.2}s : {words_per_sec:.2} words/s : gNorm {:.4}",
            self.format_logical_epoch(),
            self.state.batches,
            with_commas(self.state.samples_epoch),
            self.format_loss(batch_labels),
            self.state.gradient_norm_avg,
        );
        if self.config.lr_report {
            info!("{line} : L.r. {:.4e}", self.state.eta);
        } else {
            info!("{line}");
        }
    }

    /// Formats the accumulated display cost according to `cost-type`.
    pub fn format_loss(&self, batch_labels: u64) -> String {
        let state = &self.state;
        let cost = match self.config.cost_type {
            CostType::CeMeanWords => format!("{:.8}", state.cost_sum / state.cost_count),
            CostType::CeSum if self.config.disp_label_counts => {
                let mut cost = format!(
                    "{:.8} * {}",
                    state.cost_sum / state.cost_count,
                    with_commas(state.cost_count as u64)
                );
                if batch_labels > 0 {
                    cost.push_str(&format!(" @ {}", with_commas(batch_labels)));
                }
                cost.push_str(&format!(" after {}", with_commas(state.labels_total)));
                cost
            }
            CostType::CeSum => format!("{:.8}", state.cost_sum / state.updates_disp as f32),
            CostType::Perplexity => format!("{:.8}", (state.cost_sum / state.cost_count).exp()),
            CostType::CeMean => format!("{:.8}", state.cost_sum / state.samples_disp as f32),
        };
        format!("Cost {cost}")
    }

    pub fn format_logical_epoch(&self) -> String {
        self.stopping.logical_epoch().format(&self.state)
    }

    /// Moves on to the next data epoch.
    pub fn increase_epoch(&mut self) {
        info!("Seen {} samples", with_commas(self.state.samples_epoch));

        self.state.new_epoch();
        self.notify(Transition::Epoch);
        self.state.reset_epoch_counters();

        if self.config.input_from_stdin {
            self.end_of_input = true;
        }

        if self.stopping.logical_epoch().is_data_epoch() {
            info!("Starting epoch {}", self.state.epochs);
        } else {
            info!(
                "Starting data epoch {} in logical epoch {}",
                self.state.epochs,
                self.format_logical_epoch()
            );
        }
    }

    /// Averaging window, mean and variance of the gradient norm.
    pub fn gradient_norm_stats(&self) -> (usize, f32, f32) {
        (
            self.gradient_norm_window(),
            self.state.gradient_norm_avg,
            self.state.gradient_norm_var,
        )
    }

    /// Averaging window, mean and variance of the log gradient norm.
    pub fn log_gradient_norm_stats(&self) -> (usize, f32, f32) {
        (
            self.gradient_norm_window(),
            self.state.log_gradient_norm_avg,
            self.state.log_gradient_norm_var,
        )
    }

    fn gradient_norm_window(&self) -> usize {
        let batches = usize::try_from(self.state.batches).unwrap_or(usize::MAX);
        self.config.gradient_norm_average_window.min(batches)
    }

    pub fn is_dynamic_mb_scaling(&self) -> bool {
        self.lr.is_dynamic_mb_scaling()
    }

    pub fn dynamic_mb_size_multiplier(&self) -> f64 {
        self.lr.dynamic_mb_size_multiplier(&self.state)
    }

    /// Restores progress from `<name>.progress.yml`.
    ///
    /// Only the primary worker reads the file; its content is broadcast so every worker
    /// restores the same state. A read failure on the primary fails every worker.
    ///
    /// # Returns
    /// False if there was no progress file, i.e. the run starts fresh.
    ///
    /// # Errors
    /// `SchedulerErr` if the file could not be read or parsed, or the broadcast failed.
    pub fn load(&mut self, name: &str) -> Result<bool> {
        let path = format!("{name}.progress.yml");

        let read = if self.collective.is_primary() && Path::new(&path).exists() {
            fs::read_to_string(&path)
        } else {
            Ok(String::new())
        };

        // the read status goes first so every worker fails together
        let mut failed = usize::from(read.is_err());
        self.collective.broadcast_usize(&mut failed)?;
        let mut yaml = match &read {
            Ok(yaml) => yaml.clone(),
            Err(e) => e.to_string(),
        };
        self.collective.broadcast_string(&mut yaml)?;
        if failed != 0 {
            let err = match read {
                Err(e) => e,
                Ok(_) => io::Error::other(format!("primary worker cannot read {path}: {yaml}")),
            };
            return Err(SchedulerErr::Io(err));
        }

        if yaml.is_empty() {
            debug!("no training progress at {path}, starting fresh");
            return Ok(false);
        }

        self.load_from_str(&yaml)?;
        info!(
            "Restored training progress from {path}: epoch {}, update {}",
            self.state.epochs, self.state.batches
        );
        Ok(true)
    }

    /// Restores progress from a serialized state and fires the loaded transition.
    ///
    /// An empty string leaves the fresh state untouched but still counts as a load.
    pub fn load_from_str(&mut self, yaml: &str) -> Result<()> {
        if !yaml.is_empty() {
            self.state
                .load_from_str(yaml)
                .map_err(SchedulerErr::Checkpoint)?;
        }
        self.lr.check_restored(&self.state)?;

        if self.config.no_restore_corpus {
            self.state.samples_epoch = 0;
            self.state.batches_epoch = 0;
            self.state.reset_display();
        }

        if self.config.valid_reset_stalled || self.config.valid_reset_all {
            self.state.stalled = 0;
            self.state.max_stalled = 0;
            self.validation
                .reset_records(&mut self.state, self.config.valid_reset_all);
        }

        self.validation.restore_from(&self.state);
        self.state.new_load();
        self.notify(Transition::Loaded);
        Ok(())
    }

    /// Writes `<name>.yml` with the settings and `<name>.progress.yml` with the progress.
    ///
    /// # Errors
    /// `SchedulerErr` on serialization or I/O failure.
    pub fn save(&self, name: &str) -> Result<()> {
        let config = self.config.to_yaml().map_err(SchedulerErr::Checkpoint)?;
        fs::write(format!("{name}.yml"), config)?;

        let progress = self.state.to_yaml().map_err(SchedulerErr::Checkpoint)?;
        fs::write(format!("{name}.progress.yml"), progress)?;
        Ok(())
    }
}

/// Formats `n` with thousands separators, e.g. `1,234,567`.
fn with_commas(n: u64) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::{
        collective::Solo,
        schedule::{SchedulingParameter, SchedulingUnit},
        validation::ScoreTracker,
    };

    fn scheduler(configure: impl FnOnce(&mut SchedulerConfig)) -> Scheduler {
        let mut config = SchedulerConfig::default();
        configure(&mut config);
        Scheduler::new(config, Box::new(Solo)).unwrap()
    }

    fn batch(labels: u64) -> BatchStats {
        BatchStats {
            read_batches: 1,
            samples: 2,
            labels,
            gradient_norm: 0.0,
        }
    }

    fn step(scheduler: &mut Scheduler, loss: f32) {
        scheduler
            .update(StaticLoss { loss, count: 10.0 }, batch(10))
            .unwrap();
    }

    /// Records transitions in the order observers see them.
    struct Recorder(Arc<Mutex<Vec<(&'static str, Transition)>>>, &'static str);

    impl TrainingObserver for Recorder {
        fn act_after_epoch(&mut self, _state: &mut TrainingState) {
            self.0.lock().push((self.1, Transition::Epoch));
        }

        fn act_after_batches(&mut self, _state: &mut TrainingState) {
            self.0.lock().push((self.1, Transition::Batches));
        }

        fn act_after_stalled(&mut self, _state: &mut TrainingState) {
            self.0.lock().push((self.1, Transition::Stalled));
        }
    }

    struct Constant(ScoreTracker, f32);

    impl TrainingObserver for Constant {}

    impl Validator<()> for Constant {
        fn kind(&self) -> &str {
            "constant"
        }

        fn validate(&mut self, _graphs: &(), _state: &TrainingState) -> f32 {
            self.0.record(self.1);
            self.1
        }

        fn stalled(&self) -> usize {
            self.0.stalled()
        }

        fn last_best(&self) -> f32 {
            self.0.last_best()
        }

        fn init_score(&self) -> f32 {
            self.0.init_score()
        }

        fn restore(&mut self, stalled: usize, last_best: f32) {
            self.0.restore(stalled, last_best);
        }
    }

    #[test]
    fn with_commas_groups_thousands() {
        assert_eq!(with_commas(0), "0");
        assert_eq!(with_commas(999), "999");
        assert_eq!(with_commas(1_000), "1,000");
        assert_eq!(with_commas(1_234_567), "1,234,567");
    }

    #[test]
    fn fresh_scheduler_uses_start_rate() {
        let scheduler = scheduler(|c| {
            c.learn_rate = 1e-3;
            c.lr_warmup = SchedulingParameter::new(10, SchedulingUnit::Updates);
            c.lr_warmup_start_rate = 1e-4;
        });
        assert_eq!(scheduler.state().eta, 1e-4);
    }

    #[test]
    fn invalid_settings_fail_construction() {
        let mut config = SchedulerConfig::default();
        config.lr_decay_strategy = "sometimes".into();
        assert!(matches!(
            Scheduler::<()>::new(config, Box::new(Solo)),
            Err(SchedulerErr::Config(_))
        ));
    }

    #[test]
    fn update_accumulates_counters() {
        let mut scheduler = scheduler(|c| c.disp_freq = SchedulingParameter::default());
        for _ in 0..3 {
            step(&mut scheduler, 25.0);
        }
        let state = scheduler.state();
        assert_eq!(state.batches, 3);
        assert_eq!(state.batches_epoch, 3);
        assert_eq!(state.samples_epoch, 6);
        assert_eq!(state.labels_total, 30);
        assert_eq!(state.cost_sum, 75.0);
        assert_eq!(state.cost_count, 30.0);
        assert_eq!(state.updates_disp, 3);
    }

    #[test]
    fn display_boundary_resets_accumulators() {
        let mut scheduler =
            scheduler(|c| c.disp_freq = SchedulingParameter::new(2, SchedulingUnit::Updates));
        step(&mut scheduler, 1.0);
        assert_eq!(scheduler.state().updates_disp, 1);
        step(&mut scheduler, 1.0);
        assert_eq!(scheduler.state().updates_disp, 0);
        assert_eq!(scheduler.state().cost_sum, 0.0);
        assert_eq!(scheduler.state().labels_total, 20);
    }

    #[test]
    fn loss_formats_follow_cost_type() {
        let mut scheduler = scheduler(|c| c.disp_freq = SchedulingParameter::default());
        for _ in 0..2 {
            scheduler
                .update(
                    StaticLoss {
                        loss: 1500.0,
                        count: 1000.0,
                    },
                    batch(1000),
                )
                .unwrap();
        }
        assert_eq!(
            scheduler.format_loss(1000),
            "Cost 1.50000000 * 2,000 @ 1,000 after 2,000"
        );

        scheduler.config.cost_type = CostType::CeMeanWords;
        assert_eq!(scheduler.format_loss(0), "Cost 1.50000000");
        scheduler.config.cost_type = CostType::CeMean;
        assert_eq!(scheduler.format_loss(0), "Cost 750.00000000");
        scheduler.config.cost_type = CostType::CeSum;
        scheduler.config.disp_label_counts = false;
        assert_eq!(scheduler.format_loss(0), "Cost 1500.00000000");
    }

    #[test]
    fn observers_run_after_learning_rate_in_registration_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut scheduler = scheduler(|c| {
            c.lr_decay = 0.5;
            c.lr_decay_strategy = "batches".into();
            c.lr_decay_start = vec![1];
            c.lr_decay_freq = 1;
        });
        scheduler.register_observer(Box::new(Recorder(Arc::clone(&log), "a")));
        scheduler.register_observer(Box::new(Recorder(Arc::clone(&log), "b")));

        step(&mut scheduler, 1.0);
        scheduler.increase_epoch();

        assert_eq!(
            *log.lock(),
            vec![
                ("a", Transition::Batches),
                ("b", Transition::Batches),
                ("a", Transition::Epoch),
                ("b", Transition::Epoch),
            ]
        );
        // the controller decayed before the observers ran
        assert_eq!(scheduler.state().factor, 0.5);
    }

    #[test]
    fn increase_epoch_resets_epoch_counters() {
        let mut scheduler = scheduler(|_| {});
        step(&mut scheduler, 1.0);
        scheduler.increase_epoch();
        let state = scheduler.state();
        assert_eq!(state.epochs, 2);
        assert_eq!(state.samples_epoch, 0);
        assert_eq!(state.batches_epoch, 0);
        assert_eq!(state.samples_total, 2);
        assert!(scheduler.keep_going());
    }

    #[test]
    fn stdin_input_ends_after_first_epoch() {
        let mut scheduler = scheduler(|c| c.input_from_stdin = true);
        assert!(scheduler.keep_going());
        scheduler.increase_epoch();
        assert_eq!(scheduler.stop_reason(), Some(StopReason::EndOfInput));
    }

    #[test]
    fn shutdown_stops_and_forces_saving() {
        let mut scheduler = scheduler(|c| c.save_freq = SchedulingParameter::default());
        step(&mut scheduler, 1.0);
        assert!(!scheduler.saving());

        scheduler.shutdown_signal().request();
        assert!(scheduler.saving());
        assert_eq!(scheduler.stop_reason(), Some(StopReason::ShutdownRequested));
    }

    #[test]
    fn periodic_queries() {
        let mut scheduler = scheduler(|c| {
            c.save_freq = SchedulingParameter::new(4, SchedulingUnit::Updates);
            c.save_from = SchedulingParameter::new(5, SchedulingUnit::Updates);
            c.sync_freq = SchedulingParameter::new(3, SchedulingUnit::Updates);
            c.exponential_smoothing = 1e-4;
            c.exponential_smoothing_replace_freq =
                SchedulingParameter::new(6, SchedulingUnit::Updates);
        });
        let mut saves = Vec::new();
        let mut syncs = Vec::new();
        let mut swaps = Vec::new();
        for _ in 0..12 {
            step(&mut scheduler, 1.0);
            let batches = scheduler.state().batches;
            if scheduler.saving() {
                saves.push(batches);
            }
            if scheduler.syncing() {
                syncs.push(batches);
            }
            if scheduler.replacing_with_smoothed() {
                swaps.push(batches);
            }
        }
        assert_eq!(saves, vec![8, 12]);
        assert_eq!(syncs, vec![3, 6, 9, 12]);
        assert_eq!(swaps, vec![6, 12]);
    }

    #[test]
    fn validation_is_idempotent_per_update() {
        let mut scheduler = scheduler(|c| {
            c.valid_freq = SchedulingParameter::new(2, SchedulingUnit::Updates);
        });
        scheduler.add_validator(Box::new(Constant(ScoreTracker::lower_is_better(), 1.0)));

        step(&mut scheduler, 1.0);
        assert!(!scheduler.validating());
        step(&mut scheduler, 1.0);
        assert!(scheduler.validating());

        scheduler.validate(&(), false).unwrap();
        scheduler.validate(&(), false).unwrap();
        // a second pass would have counted a stall
        assert_eq!(scheduler.stalled(), 0);
        assert!(scheduler.state().validated);

        step(&mut scheduler, 1.0);
        scheduler.validate(&(), true).unwrap();
        assert_eq!(scheduler.stalled(), 1);
        assert_eq!(scheduler.state().stalled, 1);
        assert_eq!(scheduler.state().max_stalled, 1);
    }

    #[test]
    fn gradient_norm_statistics() {
        let mut scheduler = scheduler(|c| c.gradient_norm_average_window = 3);
        for norm in [1.0, 1.0, 0.0, 1.0] {
            let stats = BatchStats {
                gradient_norm: norm,
                ..batch(1)
            };
            scheduler.update(StaticLoss { loss: 1.0, count: 1.0 }, stats).unwrap();
        }
        let (window, avg, var) = scheduler.gradient_norm_stats();
        assert_eq!(window, 3);
        assert!((avg - 1.0).abs() < 1e-6);
        assert!(var.abs() < 1e-6);
        let (_, log_avg, _) = scheduler.log_gradient_norm_stats();
        assert!(log_avg.abs() < 1e-6);
    }
}
