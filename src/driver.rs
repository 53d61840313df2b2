//! A synthetic training run that exercises the scheduler end to end.
//!
//! Each worker runs the training loop on tokio's blocking pool; the workers talk through a
//! `LocalGroup`. The loss follows a fixed decaying curve, so runs are reproducible.

use std::io;

use log::{info, warn};
use tokio::task;

use crate::{
    collective::{Collective, LocalGroup},
    config::SchedulerConfig,
    error::Result,
    scheduler::{BatchStats, Scheduler, StaticLoss},
    signal::ShutdownSignal,
    state::{TrainingObserver, TrainingState},
    validation::{ScoreTracker, Validator},
};

/// The stand-in for a model: its loss only depends on the number of updates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyntheticModel {
    pub floor: f32,
    pub scale: f32,
    pub half_life: f32,
}

impl Default for SyntheticModel {
    fn default() -> Self {
        Self {
            floor: 2.0,
            scale: 8.0,
            half_life: 50.0,
        }
    }
}

impl SyntheticModel {
    pub fn loss_at(&self, batches: u64) -> f32 {
        self.floor + self.scale / (1.0 + batches as f32 / self.half_life)
    }
}

/// Held-out cross-entropy that stops improving once it reaches `plateau`.
#[derive(Debug, Clone)]
pub struct HeldOutLoss {
    tracker: ScoreTracker,
    plateau: f32,
}

impl HeldOutLoss {
    pub fn new(plateau: f32) -> Self {
        Self {
            tracker: ScoreTracker::lower_is_better(),
            plateau,
        }
    }
}

impl TrainingObserver for HeldOutLoss {}

impl Validator<SyntheticModel> for HeldOutLoss {
    fn kind(&self) -> &str {
        "cross-entropy"
    }

    fn validate(&mut self, model: &SyntheticModel, state: &TrainingState) -> f32 {
        let score = model.loss_at(state.batches).max(self.plateau);
        self.tracker.record(score);
        score
    }

    fn stalled(&self) -> usize {
        self.tracker.stalled()
    }

    fn last_best(&self) -> f32 {
        self.tracker.last_best()
    }

    fn init_score(&self) -> f32 {
        self.tracker.init_score()
    }

    fn restore(&mut self, stalled: usize, last_best: f32) {
        self.tracker.restore(stalled, last_best);
    }
}

/// Shape of the synthetic run.
#[derive(Debug, Clone, PartialEq)]
pub struct DemoRun {
    /// Checkpoint prefix: `<name>.yml` and `<name>.progress.yml`.
    pub name: String,
    pub workers: usize,
    pub updates_per_epoch: u64,
    /// Labels per update and worker.
    pub labels_per_update: u64,
    pub samples_per_update: u64,
    pub plateau: f32,
    pub model: SyntheticModel,
}

impl Default for DemoRun {
    fn default() -> Self {
        Self {
            name: "model".into(),
            workers: 1,
            updates_per_epoch: 100,
            labels_per_update: 1_000,
            samples_per_update: 32,
            plateau: 2.5,
            model: SyntheticModel::default(),
        }
    }
}

/// Runs one worker's training loop to completion.
///
/// The primary worker's view of `interrupt` is broadcast before every update, so all
/// workers stop after the same update.
///
/// # Args
/// * `config` - Scheduling settings, identical on every worker.
/// * `collective` - This worker's handle of the group.
/// * `demo` - Shape of the run.
/// * `interrupt` - Set by the signal handler; only read on the primary worker.
///
/// # Returns
/// The final training state.
///
/// # Errors
/// `SchedulerErr` on divergence, collective failures or a failed final save.
pub fn run_worker<C>(
    config: SchedulerConfig,
    collective: C,
    demo: &DemoRun,
    interrupt: &ShutdownSignal,
) -> Result<TrainingState>
where
    C: Collective + Clone + 'static,
{
    let workers = collective.size() as u64;
    let mut scheduler: Scheduler<SyntheticModel> =
        Scheduler::new(config, Box::new(collective.clone()))?;
    scheduler.add_validator(Box::new(HeldOutLoss::new(demo.plateau)));
    scheduler.load(&demo.name)?;
    scheduler.started();

    let model = demo.model;
    loop {
        let mut requested = usize::from(collective.is_primary() && interrupt.is_requested());
        collective.broadcast_usize(&mut requested)?;
        if requested != 0 {
            scheduler.shutdown_signal().request();
        }
        if !scheduler.keep_going() {
            break;
        }

        let per_label = model.loss_at(scheduler.state().batches);
        let labels = demo.labels_per_update;
        let loss = StaticLoss {
            loss: per_label * labels as f32,
            count: labels as f32,
        };
        let batch = BatchStats {
            read_batches: 1,
            samples: demo.samples_per_update * workers,
            labels: labels * workers,
            gradient_norm: per_label.sqrt(),
        };
        scheduler.update(loss, batch)?;

        if scheduler.validating() {
            scheduler.validate(&model, false)?;
        }

        if scheduler.saving() && scheduler.is_primary() {
            if let Err(e) = scheduler.save(&demo.name) {
                warn!("failed to save checkpoint {}: {e}", demo.name);
            }
        }

        if scheduler.state().batches_epoch >= demo.updates_per_epoch {
            scheduler.increase_epoch();
        }
    }

    scheduler.validate(&model, true)?;
    if scheduler.is_primary() {
        scheduler.save(&demo.name)?;
        info!("saved {}.progress.yml", demo.name);
    }
    scheduler.finished();

    Ok(scheduler.state().clone())
}

/// Runs `demo.workers` workers in-process and waits for all of them.
///
/// # Returns
/// Every worker's final state, in rank order.
pub async fn run(
    config: SchedulerConfig,
    demo: DemoRun,
    interrupt: ShutdownSignal,
) -> io::Result<Vec<TrainingState>> {
    let handles: Vec<_> = LocalGroup::new(demo.workers)
        .into_iter()
        .map(|group| {
            let config = config.clone();
            let demo = demo.clone();
            let interrupt = interrupt.clone();
            task::spawn_blocking(move || run_worker(config, group, &demo, &interrupt))
        })
        .collect();

    let mut states = Vec::with_capacity(handles.len());
    for handle in handles {
        let state = handle.await.map_err(io::Error::other)??;
        states.push(state);
    }
    Ok(states)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthetic_loss_decays_towards_floor() {
        let model = SyntheticModel::default();
        assert_eq!(model.loss_at(0), 10.0);
        assert_eq!(model.loss_at(50), 6.0);
        assert!(model.loss_at(1_000_000) - model.floor < 1e-3);
    }

    #[test]
    fn held_out_loss_stalls_on_plateau() {
        let model = SyntheticModel::default();
        let mut validator = HeldOutLoss::new(5.0);
        let mut state = TrainingState::new();
        for batches in [50, 100, 150] {
            state.batches = batches;
            validator.validate(&model, &state);
        }
        assert_eq!(validator.last_best(), 5.0);
        assert_eq!(validator.stalled(), 1);
    }
}
