use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

use crate::{error::ConfigErr, state::TrainingState};

/// The unit a scheduling parameter counts in.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SchedulingUnit {
    /// Optimizer updates.
    #[default]
    Updates,
    /// Full passes over the training data.
    Epochs,
    /// Target labels consumed so far.
    TargetLabels,
}

impl SchedulingUnit {
    fn suffix(self) -> char {
        match self {
            SchedulingUnit::Updates => 'u',
            SchedulingUnit::Epochs => 'e',
            SchedulingUnit::TargetLabels => 't',
        }
    }
}

/// A value and unit pair such as `300Ku`, `10e` or `20Gt`.
///
/// A parameter with `n == 0` is undefined and never triggers.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SchedulingParameter {
    pub n: u64,
    pub unit: SchedulingUnit,
}

impl SchedulingParameter {
    /// Creates a parameter from its raw parts.
    pub fn new(n: u64, unit: SchedulingUnit) -> Self {
        Self { n, unit }
    }

    /// Parses the compact textual form.
    ///
    /// # Args
    /// * `text` - A number with an optional `K`/`M`/`G`/`T` multiplier and an optional
    ///   `u`/`e`/`t` unit suffix. Without a unit suffix the unit is `updates`.
    ///
    /// # Returns
    /// The parsed parameter.
    ///
    /// # Errors
    /// `ConfigErr::InvalidSchedulingParameter` if the number is missing, fractional or
    /// followed by an unknown suffix.
    pub fn parse(text: &str) -> Result<Self, ConfigErr> {
        let invalid = |reason: &str| ConfigErr::InvalidSchedulingParameter {
            text: text.to_string(),
            reason: reason.to_string(),
        };

        let mut rest = text.trim();
        let mut unit = SchedulingUnit::Updates;
        if let Some(last) = rest.chars().last().filter(|c| c.is_ascii_lowercase()) {
            unit = match last {
                'u' => SchedulingUnit::Updates,
                'e' => SchedulingUnit::Epochs,
                't' => SchedulingUnit::TargetLabels,
                // `k` is a multiplier, not a unit
                'k' => SchedulingUnit::Updates,
                other => return Err(invalid(&format!("unknown unit '{other}'"))),
            };
            if last != 'k' {
                rest = &rest[..rest.len() - 1];
            }
        }

        let mut multiplier = 1.0_f64;
        if let Some(last) = rest.chars().last().filter(|c| c.is_ascii_alphabetic()) {
            multiplier = match last {
                'k' | 'K' => 1e3,
                'M' => 1e6,
                'G' => 1e9,
                'T' => 1e12,
                other => return Err(invalid(&format!("unknown multiplier '{other}'"))),
            };
            rest = &rest[..rest.len() - 1];
        }

        if rest.is_empty() || !rest.starts_with(|c: char| c.is_ascii_digit() || c == '.') {
            return Err(invalid("expected a non-negative number"));
        }
        let number: f64 = rest
            .parse()
            .map_err(|_| invalid("expected a non-negative number"))?;

        let value = number * multiplier;
        if !value.is_finite() || value.fract() != 0.0 || value > u64::MAX as f64 {
            return Err(invalid("scheduling parameters must be whole numbers"));
        }

        Ok(Self::new(value as u64, unit))
    }

    /// Returns true if the parameter triggers at all.
    #[inline]
    pub fn is_defined(&self) -> bool {
        self.n != 0
    }

    /// Current progress of `state` measured in this parameter's unit.
    #[inline]
    pub fn progress_in(&self, state: &TrainingState) -> u64 {
        state.progress_in(self.unit)
    }
}

impl fmt::Display for SchedulingParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.n, self.unit.suffix())
    }
}

impl FromStr for SchedulingParameter {
    type Err = ConfigErr;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for SchedulingParameter {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SchedulingParameter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct ParamVisitor;

        impl de::Visitor<'_> for ParamVisitor {
            type Value = SchedulingParameter;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a scheduling parameter such as `10e`, `300Ku` or `20Gt`")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                Ok(SchedulingParameter::new(v, SchedulingUnit::Updates))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                u64::try_from(v)
                    .map(|n| SchedulingParameter::new(n, SchedulingUnit::Updates))
                    .map_err(|_| E::custom(format!("negative scheduling parameter {v}")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                SchedulingParameter::parse(v).map_err(E::custom)
            }
        }

        deserializer.deserialize_any(ParamVisitor)
    }
}
