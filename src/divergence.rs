use log::{debug, warn};

use crate::{
    error::{ConfigErr, DivergenceErr},
    schedule::{SchedulingParameter, SchedulingUnit},
    state::TrainingState,
};

pub const DEFAULT_SLOW_WINDOW: usize = 1000;
pub const DEFAULT_FAST_WINDOW: usize = 10;
pub const DEFAULT_TOLERANCE: f32 = 5.0;

/// Compares a fast-moving against a slow-moving exponential average of the normalized loss
/// and reports a divergence once the gap exceeds `tolerance` slow-moving standard deviations.
#[derive(Debug, Clone, PartialEq)]
pub struct DivergenceDetector {
    slow_window: usize,
    fast_window: usize,
    tolerance: f32,
    /// Diagnostic only: diverge unconditionally once training progressed this far.
    throw_after: SchedulingParameter,
}

impl Default for DivergenceDetector {
    fn default() -> Self {
        Self {
            slow_window: DEFAULT_SLOW_WINDOW,
            fast_window: DEFAULT_FAST_WINDOW,
            tolerance: DEFAULT_TOLERANCE,
            throw_after: SchedulingParameter::default(),
        }
    }
}

impl DivergenceDetector {
    pub fn new(slow_window: usize, fast_window: usize, tolerance: f32) -> Self {
        Self {
            slow_window,
            fast_window,
            tolerance,
            throw_after: SchedulingParameter::default(),
        }
    }

    pub fn with_throw_after(mut self, throw_after: SchedulingParameter) -> Self {
        self.throw_after = throw_after;
        self
    }

    /// Builds the detector from the `throw-on-divergence` arguments.
    ///
    /// # Args
    /// * `args` - `[slowWindow, fastWindow, tolerance, throwAfter]`, any prefix of it.
    ///
    /// # Returns
    /// `None` if `args` is absent or empty, which disables detection.
    ///
    /// # Errors
    /// `ConfigErr::Malformed` on unparsable or surplus arguments.
    pub fn from_args(args: Option<&[String]>) -> Result<Option<Self>, ConfigErr> {
        let Some(args) = args.filter(|args| !args.is_empty()) else {
            return Ok(None);
        };

        let malformed = |detail: String| ConfigErr::Malformed {
            setting: "throw-on-divergence",
            detail,
        };
        if args.len() > 4 {
            return Err(malformed(format!("expected at most 4 values, got {}", args.len())));
        }

        let mut detector = Self::default();
        if let Some(slow) = args.first() {
            detector.slow_window = slow
                .parse()
                .map_err(|_| malformed(format!("slow window {slow:?} is not a count")))?;
        }
        if let Some(fast) = args.get(1) {
            detector.fast_window = fast
                .parse()
                .map_err(|_| malformed(format!("fast window {fast:?} is not a count")))?;
        }
        if let Some(tolerance) = args.get(2) {
            detector.tolerance = tolerance
                .parse()
                .map_err(|_| malformed(format!("tolerance {tolerance:?} is not a number")))?;
        }
        if let Some(after) = args.get(3) {
            let after = SchedulingParameter::parse(after)?;
            if after.is_defined() && after.unit == SchedulingUnit::Epochs {
                return Err(ConfigErr::UnitMismatch {
                    setting: "throw-on-divergence",
                    detail: format!("{after}: epochs are not supported for throwAfter"),
                });
            }
            detector.throw_after = after;
        }

        if detector.slow_window == 0 || detector.fast_window == 0 {
            return Err(malformed("averaging windows must be positive".into()));
        }
        Ok(Some(detector))
    }

    pub fn slow_window(&self) -> usize {
        self.slow_window
    }

    pub fn fast_window(&self) -> usize {
        self.fast_window
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    pub fn throw_after(&self) -> SchedulingParameter {
        self.throw_after
    }

    /// Folds the normalized loss of the latest update into the moving statistics.
    ///
    /// The check runs against the statistics before `loss` is folded in and only once more
    /// than `slow_window` updates have been observed. Non-finite losses are skipped.
    ///
    /// # Args
    /// * `state` - Training state, already advanced to the current update.
    /// * `loss` - Loss over label count, summed across workers.
    /// * `report` - Whether to emit the per-display debug line.
    ///
    /// # Errors
    /// `DivergenceErr` carrying the slow and fast averages and the gap in sigmas.
    pub fn observe(
        &self,
        state: &mut TrainingState,
        loss: f32,
        report: bool,
    ) -> Result<(), DivergenceErr> {
        if !loss.is_finite() {
            warn!(batches = state.batches; "ignoring non-finite loss {loss} for divergence detection");
            return Ok(());
        }

        let batches = usize::try_from(state.batches).unwrap_or(usize::MAX);
        let alpha_slow = 2.0 / (self.slow_window.min(batches) + 1) as f32;
        let alpha_fast = 2.0 / (self.fast_window.min(batches) + 1) as f32;

        // The averages are only zero on a fresh start.
        if state.loss_avg_slow == 0.0 {
            state.loss_avg_slow = loss;
            state.loss_avg_fast = loss;
            state.loss_var_slow = 0.0;
        }

        if batches > self.slow_window {
            let delta = state.loss_avg_fast - state.loss_avg_slow;
            let sigma = state.loss_var_slow.sqrt();

            if delta > 0.0 && sigma > 0.0 {
                let sigmas = delta / sigma;
                if sigmas > self.tolerance {
                    let err = DivergenceErr {
                        avg_slow: state.loss_avg_slow,
                        avg_fast: state.loss_avg_fast,
                        sigmas,
                    };
                    warn!("{err}");
                    return Err(err);
                }
            }

            if report {
                debug!(
                    "delta(={delta:.4}) = avgFast(={:.4}) - avgSlow(={:.4}) = {:.4} * sigma(={sigma:.4}) < {:.4} * sigma",
                    state.loss_avg_fast,
                    state.loss_avg_slow,
                    delta / sigma,
                    self.tolerance
                );
            }
        }

        if state.entered_new_period_of(&self.throw_after) {
            warn!("Training reached {}; raising diagnostic divergence", self.throw_after);
            return Err(DivergenceErr {
                avg_slow: state.loss_avg_slow,
                avg_fast: state.loss_avg_fast,
                sigmas: 0.0,
            });
        }

        let delta_slow = loss - state.loss_avg_slow;
        state.loss_avg_slow += alpha_slow * delta_slow;
        state.loss_var_slow =
            (1.0 - alpha_slow) * (state.loss_var_slow + alpha_slow * delta_slow * delta_slow);

        let delta_fast = loss - state.loss_avg_fast;
        state.loss_avg_fast += alpha_fast * delta_fast;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Feeds `losses` one update at a time and returns the update that diverged.
    fn first_divergence(
        detector: &DivergenceDetector,
        losses: &[f32],
    ) -> Option<(u64, DivergenceErr)> {
        let mut state = TrainingState::new();
        for &loss in losses {
            state.remember_previous_progress();
            state.new_update(1);
            if let Err(err) = detector.observe(&mut state, loss, false) {
                return Some((state.batches, err));
            }
        }
        None
    }

    #[test]
    fn parses_arguments() {
        let args: Vec<String> = ["100", "5", "3.5", "2Ku"].map(String::from).to_vec();
        let detector = DivergenceDetector::from_args(Some(&args)).unwrap().unwrap();
        assert_eq!(detector.slow_window(), 100);
        assert_eq!(detector.fast_window(), 5);
        assert_eq!(detector.tolerance(), 3.5);
        assert_eq!(
            detector.throw_after(),
            SchedulingParameter::new(2_000, SchedulingUnit::Updates)
        );

        let slow_only = vec!["1000".to_string()];
        let defaults = DivergenceDetector::from_args(Some(&slow_only)).unwrap().unwrap();
        assert_eq!(defaults, DivergenceDetector::default());
        assert!(DivergenceDetector::from_args(None).unwrap().is_none());
        assert!(DivergenceDetector::from_args(Some(&[])).unwrap().is_none());
    }

    #[test]
    fn rejects_bad_arguments() {
        let bad: Vec<String> = vec!["many".into()];
        assert!(DivergenceDetector::from_args(Some(&bad)).is_err());
        let zero: Vec<String> = vec!["0".into()];
        assert!(DivergenceDetector::from_args(Some(&zero)).is_err());
        let epochs: Vec<String> = ["100", "5", "3.5", "2e"].map(String::from).to_vec();
        assert!(matches!(
            DivergenceDetector::from_args(Some(&epochs)),
            Err(ConfigErr::UnitMismatch {
                setting: "throw-on-divergence",
                ..
            })
        ));
    }

    #[test]
    fn never_fires_within_the_slow_window() {
        let detector = DivergenceDetector::new(5, 1, 0.01);
        let losses = [1.0, 1e3, 1.0, 1e6, 1e9];
        assert!(first_divergence(&detector, &losses).is_none());
    }

    #[test]
    fn fires_when_fast_average_runs_away() {
        let detector = DivergenceDetector::new(5, 1, 1.0);
        let mut losses = vec![1.0; 10];
        losses.extend([100.0, 100.0]);

        let (batches, err) = first_divergence(&detector, &losses).unwrap();
        // The spike at update 11 is folded in after the check, so update 12 sees it.
        assert_eq!(batches, 12);
        assert!((err.avg_slow - 34.0).abs() < 1e-3);
        assert!((err.avg_fast - 100.0).abs() < 1e-3);
        assert!(err.sigmas > 1.0);
    }

    #[test]
    fn a_step_stays_below_one_sigma_with_a_two_update_window() {
        // The fast/slow gap of a step change peaks at ~0.71 sigma for windows 5 and 2.
        let mut losses = vec![1.0; 10];
        losses.extend([100.0; 5]);
        assert!(first_divergence(&DivergenceDetector::new(5, 2, 1.0), &losses).is_none());

        let (batches, err) =
            first_divergence(&DivergenceDetector::new(5, 2, 0.5), &losses).unwrap();
        assert_eq!(batches, 12);
        assert!((err.sigmas - 0.707_106_8).abs() < 1e-3);
    }

    #[test]
    fn converging_loss_never_fires() {
        let detector = DivergenceDetector::new(5, 2, 0.1);
        let losses: Vec<f32> = (0..100).map(|i| 10.0 / (i as f32 + 1.0)).collect();
        assert!(first_divergence(&detector, &losses).is_none());
    }

    #[test]
    fn non_finite_losses_are_ignored() {
        let detector = DivergenceDetector::new(2, 1, 1.0);
        let mut state = TrainingState::new();
        for loss in [2.0, f32::NAN, f32::INFINITY, 2.0] {
            state.remember_previous_progress();
            state.new_update(1);
            detector.observe(&mut state, loss, false).unwrap();
        }
        assert_eq!(state.loss_avg_slow, 2.0);
        assert_eq!(state.loss_avg_fast, 2.0);
        assert_eq!(state.loss_var_slow, 0.0);
    }

    #[test]
    fn diagnostic_divergence_after_threshold() {
        let detector = DivergenceDetector::default()
            .with_throw_after(SchedulingParameter::new(3, SchedulingUnit::Updates));
        let (batches, err) = first_divergence(&detector, &[1.0; 10]).unwrap();
        assert_eq!(batches, 3);
        assert_eq!(err.sigmas, 0.0);
    }
}
