use std::{error::Error, fmt, io};

/// The scheduler's result type.
pub type Result<T> = std::result::Result<T, SchedulerErr>;

/// Invalid settings, caught while building the scheduler.
#[derive(Debug)]
pub enum ConfigErr {
    InvalidSchedulingParameter {
        text: String,
        reason: String,
    },
    /// Two related parameters were given in different units.
    UnitMismatch {
        setting: &'static str,
        detail: String,
    },
    /// A setting only accepts a fixed set of values.
    UnknownValue {
        setting: &'static str,
        value: String,
    },
    /// A list-valued setting has the wrong shape or unparsable entries.
    Malformed {
        setting: &'static str,
        detail: String,
    },
    Yaml(serde_yaml::Error),
}

impl fmt::Display for ConfigErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidSchedulingParameter { text, reason } => {
                write!(f, "invalid scheduling parameter {text:?}: {reason}")
            }
            Self::UnitMismatch { setting, detail } => {
                write!(f, "conflicting units in --{setting}: {detail}")
            }
            Self::UnknownValue { setting, value } => {
                write!(f, "unknown value {value:?} for --{setting}")
            }
            Self::Malformed { setting, detail } => write!(f, "malformed --{setting}: {detail}"),
            Self::Yaml(e) => write!(f, "invalid settings: {e}"),
        }
    }
}

impl Error for ConfigErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Yaml(e) => Some(e),
            _ => None,
        }
    }
}

impl From<serde_yaml::Error> for ConfigErr {
    fn from(value: serde_yaml::Error) -> Self {
        Self::Yaml(value)
    }
}

/// Raised when the fast-moving loss average runs away from the slow-moving one.
///
/// The caller decides whether to abort or to restart with different numerics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DivergenceErr {
    pub avg_slow: f32,
    pub avg_fast: f32,
    pub sigmas: f32,
}

impl fmt::Display for DivergenceErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Detected training divergence: slow-moving average loss {:.4} exceeded by \
             fast-moving average loss {:.4} by {:.4} = {:.4} * sigmas",
            self.avg_slow,
            self.avg_fast,
            self.avg_fast - self.avg_slow,
            self.sigmas
        )
    }
}

impl Error for DivergenceErr {}

/// Failures of the collective transport. Opaque to the scheduler.
#[derive(Debug)]
pub enum CollectiveErr {
    LengthMismatch { got: usize, expected: usize },
    Other(String),
}

impl fmt::Display for CollectiveErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LengthMismatch { got, expected } => {
                write!(f, "collective buffer length mismatch: got {got}, expected {expected}")
            }
            Self::Other(msg) => write!(f, "collective error: {msg}"),
        }
    }
}

impl Error for CollectiveErr {}

/// Everything the scheduler can fail with.
#[derive(Debug)]
pub enum SchedulerErr {
    Config(ConfigErr),
    Divergence(DivergenceErr),
    Collective(CollectiveErr),
    Io(io::Error),
    /// The progress file could not be (de)serialized.
    Checkpoint(serde_yaml::Error),
}

impl fmt::Display for SchedulerErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "config error: {e}"),
            Self::Divergence(e) => e.fmt(f),
            Self::Collective(e) => e.fmt(f),
            Self::Io(e) => write!(f, "io error: {e}"),
            Self::Checkpoint(e) => write!(f, "checkpoint error: {e}"),
        }
    }
}

impl Error for SchedulerErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Divergence(e) => Some(e),
            Self::Collective(e) => Some(e),
            Self::Io(e) => Some(e),
            Self::Checkpoint(e) => Some(e),
        }
    }
}

impl From<ConfigErr> for SchedulerErr {
    fn from(value: ConfigErr) -> Self {
        Self::Config(value)
    }
}

impl From<DivergenceErr> for SchedulerErr {
    fn from(value: DivergenceErr) -> Self {
        Self::Divergence(value)
    }
}

impl From<CollectiveErr> for SchedulerErr {
    fn from(value: CollectiveErr) -> Self {
        Self::Collective(value)
    }
}

impl From<io::Error> for SchedulerErr {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<SchedulerErr> for io::Error {
    fn from(value: SchedulerErr) -> Self {
        match value {
            SchedulerErr::Io(e) => e,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}
