use std::{fs, path::Path};

use serde::{Deserialize, Deserializer, Serialize};

use crate::{
    error::ConfigErr,
    schedule::{SchedulingParameter, SchedulingUnit},
    stopping::StallPolicy,
};

/// How the accumulated cost is shown in the training log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CostType {
    #[serde(rename = "ce-mean-words")]
    CeMeanWords,
    #[default]
    #[serde(rename = "ce-sum")]
    CeSum,
    #[serde(rename = "perplexity")]
    Perplexity,
    #[serde(rename = "ce-mean", alias = "cross-entropy")]
    CeMean,
}

/// Scheduling-relevant training options.
///
/// Deserialized from a flat kebab-case YAML mapping; every option has the default the
/// training frontend would use. Written back verbatim as `<name>.yml` on save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Legacy epoch limit, 0 disables.
    pub after_epochs: u64,
    /// Legacy update limit, 0 disables.
    pub after_batches: u64,
    /// Comma-separated stop criteria, e.g. `10e,300Ku,20Gt`.
    pub after: String,
    pub early_stopping: usize,
    pub early_stopping_on: StallPolicy,

    pub valid_freq: SchedulingParameter,
    pub valid_from: SchedulingParameter,
    pub valid_reset_stalled: bool,
    pub valid_reset_all: bool,
    pub save_freq: SchedulingParameter,
    pub save_from: SchedulingParameter,
    pub sync_freq: SchedulingParameter,
    pub exponential_smoothing: f32,
    pub exponential_smoothing_replace_freq: SchedulingParameter,

    pub disp_freq: SchedulingParameter,
    pub disp_first: u64,
    pub disp_label_counts: bool,
    pub cost_type: CostType,
    pub lr_report: bool,

    pub learn_rate: f32,
    pub lr_warmup: SchedulingParameter,
    pub lr_warmup_start_rate: f32,
    pub lr_warmup_cycle: bool,
    pub lr_warmup_at_reload: bool,
    pub lr_decay: f32,
    pub lr_decay_strategy: String,
    pub lr_decay_start: Vec<u64>,
    pub lr_decay_freq: u64,
    pub lr_decay_reset_optimizer: bool,
    pub lr_decay_repeat_warmup: bool,
    /// `[n]` or `[n, start]`, both in the same unit.
    pub lr_decay_inv_sqrt: Vec<SchedulingParameter>,
    pub mini_batch_warmup: SchedulingParameter,
    pub mini_batch_track_lr: bool,

    /// `[slowWindow, fastWindow, tolerance, throwAfter]`; absent or empty disables detection.
    #[serde(deserialize_with = "lenient_opt_list")]
    pub throw_on_divergence: Option<Vec<String>>,
    pub gradient_norm_average_window: usize,
    /// `[param]` or `[param, width]`.
    #[serde(deserialize_with = "lenient_list")]
    pub logical_epoch: Vec<String>,

    pub no_restore_corpus: bool,
    /// Training data is streamed, so the first epoch end is the end of the input.
    pub input_from_stdin: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            after_epochs: 0,
            after_batches: 0,
            after: "0e".into(),
            early_stopping: 10,
            early_stopping_on: StallPolicy::First,
            valid_freq: SchedulingParameter::new(10_000, SchedulingUnit::Updates),
            valid_from: SchedulingParameter::default(),
            valid_reset_stalled: false,
            valid_reset_all: false,
            save_freq: SchedulingParameter::new(10_000, SchedulingUnit::Updates),
            save_from: SchedulingParameter::default(),
            sync_freq: SchedulingParameter::default(),
            exponential_smoothing: 0.0,
            exponential_smoothing_replace_freq: SchedulingParameter::default(),
            disp_freq: SchedulingParameter::new(1_000, SchedulingUnit::Updates),
            disp_first: 0,
            disp_label_counts: true,
            cost_type: CostType::CeSum,
            lr_report: false,
            learn_rate: 1e-4,
            lr_warmup: SchedulingParameter::default(),
            lr_warmup_start_rate: 0.0,
            lr_warmup_cycle: false,
            lr_warmup_at_reload: false,
            lr_decay: 0.0,
            lr_decay_strategy: "epoch+stalled".into(),
            lr_decay_start: vec![10, 1],
            lr_decay_freq: 50_000,
            lr_decay_reset_optimizer: false,
            lr_decay_repeat_warmup: false,
            lr_decay_inv_sqrt: vec![SchedulingParameter::default()],
            mini_batch_warmup: SchedulingParameter::default(),
            mini_batch_track_lr: false,
            throw_on_divergence: None,
            gradient_norm_average_window: 100,
            logical_epoch: vec!["1e".into()],
            no_restore_corpus: false,
            input_from_stdin: false,
        }
    }
}

impl SchedulerConfig {
    /// Parses and validates settings from YAML text.
    ///
    /// # Errors
    /// `ConfigErr` on malformed YAML, unknown options, invalid values or frequencies given
    /// in epochs.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigErr> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigErr> {
        let path = path.as_ref();
        let yaml = fs::read_to_string(path).map_err(|e| ConfigErr::Malformed {
            setting: "config",
            detail: format!("cannot read {}: {e}", path.display()),
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        serde_yaml::to_string(self)
    }

    /// Checks constraints that the field types cannot express.
    ///
    /// Epoch counters only advance outside of updates, so frequencies must not use epochs.
    pub fn validate(&self) -> Result<(), ConfigErr> {
        let frequencies = [
            ("disp-freq", self.disp_freq),
            ("valid-freq", self.valid_freq),
            ("save-freq", self.save_freq),
            ("sync-freq", self.sync_freq),
            ("exponential-smoothing-replace-freq", self.exponential_smoothing_replace_freq),
        ];
        for (setting, freq) in frequencies {
            if freq.is_defined() && freq.unit == SchedulingUnit::Epochs {
                return Err(ConfigErr::UnitMismatch {
                    setting,
                    detail: format!("{freq}: epochs are not supported for frequencies"),
                });
            }
        }

        if self.lr_warmup_cycle
            && self.lr_warmup.is_defined()
            && self.lr_warmup.unit == SchedulingUnit::Epochs
        {
            return Err(ConfigErr::UnitMismatch {
                setting: "lr-warmup",
                detail: format!("{}: epochs are not supported with lr-warmup-cycle", self.lr_warmup),
            });
        }
        if self.mini_batch_warmup.is_defined()
            && self.mini_batch_warmup.unit == SchedulingUnit::Epochs
        {
            return Err(ConfigErr::UnitMismatch {
                setting: "mini-batch-warmup",
                detail: format!("{}: epochs are not supported", self.mini_batch_warmup),
            });
        }

        if !(0.0..=1.0).contains(&self.lr_decay) {
            return Err(ConfigErr::Malformed {
                setting: "lr-decay",
                detail: format!("decay factor {} is outside (0, 1]", self.lr_decay),
            });
        }

        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Int(u64),
    Float(f64),
    Text(String),
}

impl From<Scalar> for String {
    fn from(value: Scalar) -> Self {
        match value {
            Scalar::Int(n) => n.to_string(),
            Scalar::Float(x) => x.to_string(),
            Scalar::Text(s) => s,
        }
    }
}

/// Accepts lists mixing numbers and strings, e.g. `[1000, 10, 5.0, 2Mt]`.
fn lenient_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let items = Vec::<Scalar>::deserialize(deserializer)?;
    Ok(items.into_iter().map(String::from).collect())
}

fn lenient_opt_list<'de, D>(deserializer: D) -> Result<Option<Vec<String>>, D::Error>
where
    D: Deserializer<'de>,
{
    let items = Option::<Vec<Scalar>>::deserialize(deserializer)?;
    Ok(items.map(|items| items.into_iter().map(String::from).collect()))
}
