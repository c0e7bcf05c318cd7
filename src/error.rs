use std::{error, fmt, io};

/// Returned when a [`TrackerConfig`][crate::TrackerConfig] is rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// `sampling_rate` was NaN or outside `[0, 1]`.
    SamplingRate(f64),
    /// Both size bounds were set and `min` exceeded `max`.
    SizeRange {
        /// Lower bound.
        min: usize,
        /// Upper bound.
        max: usize,
    },
    /// `accumulator_capacity` was zero.
    ZeroCapacity,
    /// `full_merge_high_water_mark` was zero.
    ZeroHighWaterMark,
    /// `max_stack_depth` was zero while stack capture was enabled.
    ZeroStackDepth,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SamplingRate(rate) => {
                write!(f, "sampling rate must be within [0, 1], got {}", rate)
            }
            Self::SizeRange { min, max } => write!(
                f,
                "sample size range is empty: min {} exceeds max {}",
                min, max
            ),
            Self::ZeroCapacity => f.pad("accumulator capacity must be non-zero"),
            Self::ZeroHighWaterMark => f.pad("full merge high-water mark must be non-zero"),
            Self::ZeroStackDepth => f.pad("max stack depth must be non-zero"),
        }
    }
}

impl error::Error for ConfigError {}

/// Returned if an [`Engine`][crate::Engine] could not be started.
#[derive(Debug)]
pub enum EngineError {
    /// The configuration was rejected.
    Config(ConfigError),
    /// The merge worker thread could not be spawned.
    Spawn(io::Error),
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(err) => write!(f, "invalid tracker configuration: {}", err),
            Self::Spawn(err) => write!(f, "failed to spawn merge worker: {}", err),
        }
    }
}

impl error::Error for EngineError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Spawn(err) => Some(err),
        }
    }
}

impl From<ConfigError> for EngineError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

/// Errors that can occur while writing a dump.
///
/// These only ever reach the caller of [`Engine::dump`][crate::Engine::dump]; the interception path never sees them.
#[derive(Debug)]
pub enum DumpError {
    /// An output file could not be created or written.
    Io(io::Error),
    /// The structured report could not be encoded.
    Json(serde_json::Error),
    /// No process-wide engine has been set up.
    Uninitialized,
}

impl fmt::Display for DumpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(err) => write!(f, "i/o error during dump: {}", err),
            Self::Json(err) => write!(f, "failed to encode dump as json: {}", err),
            Self::Uninitialized => f.pad("tracker has not been initialized"),
        }
    }
}

impl error::Error for DumpError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Json(err) => Some(err),
            Self::Uninitialized => None,
        }
    }
}

impl From<io::Error> for DumpError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<serde_json::Error> for DumpError {
    fn from(value: serde_json::Error) -> Self {
        Self::Json(value)
    }
}

/// Returned by an [`Unwinder`][crate::Unwinder] that could not walk the stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnwindError {
    reason: &'static str,
}

impl UnwindError {
    /// Creates an error carrying a static reason.
    pub const fn new(reason: &'static str) -> Self {
        Self { reason }
    }

    /// Why the unwind failed.
    pub fn reason(&self) -> &'static str {
        self.reason
    }
}

impl fmt::Display for UnwindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stack unwind failed: {}", self.reason)
    }
}

impl error::Error for UnwindError {}
