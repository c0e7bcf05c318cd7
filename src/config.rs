use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Controls what the tracker records and how eagerly it reconciles.
///
/// Deserializes with every field optional so a binding layer can pass only the knobs it cares about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Master switch for stack capture.
    pub enable_stacktrace: bool,
    /// Smallest allocation, in bytes, eligible for stack capture. Zero disables the bound.
    pub sample_size_min: usize,
    /// Largest allocation, in bytes, eligible for stack capture. Zero disables the bound.
    pub sample_size_max: usize,
    /// Probability in `[0, 1]` that an eligible allocation has its stack captured.
    pub sampling_rate: f64,
    /// Whether mmap-family calls are tracked in addition to heap calls.
    pub enable_mmap_tracking: bool,
    /// Per-container entry count at which a thread hands its accumulator to the merge worker.
    pub accumulator_capacity: usize,
    /// Outstanding borrowed-free count that forces a full merge. Defaults to ten times `accumulator_capacity`.
    pub full_merge_high_water_mark: Option<usize>,
    /// Maximum number of frames captured per stack.
    pub max_stack_depth: usize,
    /// Frames dropped from the innermost end of every capture.
    pub skip_frames: usize,
    /// Interval between periodic full merges, in milliseconds.
    pub full_merge_interval_ms: u64,
    /// Number of callers and stacks detailed per module in a dump.
    pub top_n: usize,
    /// Number of `size x count` lines reported per module in a dump.
    pub size_histogram_top: usize,
    /// Modules whose stack total is below this many bytes are summarized without per-stack detail.
    pub stack_detail_threshold: usize,
    /// Whether [`Tracker::init`][crate::Tracker::init] turns tracking on right away.
    pub start_enabled: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            enable_stacktrace: false,
            sample_size_min: 0,
            sample_size_max: 0,
            sampling_rate: 1.0,
            enable_mmap_tracking: true,
            accumulator_capacity: 4096,
            full_merge_high_water_mark: None,
            max_stack_depth: 16,
            skip_frames: 0,
            full_merge_interval_ms: 5_000,
            top_n: 20,
            size_histogram_top: 20,
            stack_detail_threshold: 0,
            start_enabled: true,
        }
    }
}

impl TrackerConfig {
    /// Starts a builder from the default configuration.
    #[must_use]
    pub fn builder() -> TrackerConfigBuilder {
        TrackerConfigBuilder::default()
    }

    /// Outstanding borrowed-free count that forces a full merge.
    pub fn high_water_mark(&self) -> usize {
        self.full_merge_high_water_mark
            .unwrap_or_else(|| self.accumulator_capacity.saturating_mul(10))
    }

    /// Interval between periodic full merges.
    pub fn full_merge_interval(&self) -> Duration {
        Duration::from_millis(self.full_merge_interval_ms)
    }

    /// Checks the configuration for values the engine cannot honor.
    ///
    /// # Errors
    /// Returns the first [`ConfigError`] found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(ConfigError::SamplingRate(self.sampling_rate));
        }

        if self.sample_size_min != 0
            && self.sample_size_max != 0
            && self.sample_size_min > self.sample_size_max
        {
            return Err(ConfigError::SizeRange {
                min: self.sample_size_min,
                max: self.sample_size_max,
            });
        }

        if self.accumulator_capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }

        if self.full_merge_high_water_mark == Some(0) {
            return Err(ConfigError::ZeroHighWaterMark);
        }

        if self.enable_stacktrace && self.max_stack_depth == 0 {
            return Err(ConfigError::ZeroStackDepth);
        }

        Ok(())
    }
}

/// Builder-style construction of a [`TrackerConfig`].
#[derive(Debug, Default)]
pub struct TrackerConfigBuilder {
    config: TrackerConfig,
}

impl TrackerConfigBuilder {
    /// Enables or disables stack capture.
    #[must_use]
    pub fn enable_stacktrace(mut self, enable: bool) -> Self {
        self.config.enable_stacktrace = enable;
        self
    }

    /// Sets the inclusive size range eligible for stack capture. Zero disables a bound.
    #[must_use]
    pub fn sample_size_range(mut self, min: usize, max: usize) -> Self {
        self.config.sample_size_min = min;
        self.config.sample_size_max = max;
        self
    }

    /// Sets the stack capture probability.
    #[must_use]
    pub fn sampling_rate(mut self, rate: f64) -> Self {
        self.config.sampling_rate = rate;
        self
    }

    /// Enables or disables mmap-family tracking.
    #[must_use]
    pub fn enable_mmap_tracking(mut self, enable: bool) -> Self {
        self.config.enable_mmap_tracking = enable;
        self
    }

    /// Sets the per-container accumulator capacity.
    #[must_use]
    pub fn accumulator_capacity(mut self, capacity: usize) -> Self {
        self.config.accumulator_capacity = capacity;
        self
    }

    /// Sets the outstanding borrowed-free count that forces a full merge.
    #[must_use]
    pub fn full_merge_high_water_mark(mut self, mark: usize) -> Self {
        self.config.full_merge_high_water_mark = Some(mark);
        self
    }

    /// Sets the maximum captured stack depth.
    #[must_use]
    pub fn max_stack_depth(mut self, depth: usize) -> Self {
        self.config.max_stack_depth = depth;
        self
    }

    /// Sets how many innermost frames are dropped from captures.
    #[must_use]
    pub fn skip_frames(mut self, frames: usize) -> Self {
        self.config.skip_frames = frames;
        self
    }

    /// Sets the periodic full merge interval.
    #[must_use]
    pub fn full_merge_interval(mut self, interval: Duration) -> Self {
        self.config.full_merge_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets how many entries per module are detailed in a dump.
    #[must_use]
    pub fn top_n(mut self, top_n: usize) -> Self {
        self.config.top_n = top_n;
        self
    }

    /// Sets how many `size x count` lines are reported per module.
    #[must_use]
    pub fn size_histogram_top(mut self, lines: usize) -> Self {
        self.config.size_histogram_top = lines;
        self
    }

    /// Sets the module stack total below which per-stack detail is omitted.
    #[must_use]
    pub fn stack_detail_threshold(mut self, bytes: usize) -> Self {
        self.config.stack_detail_threshold = bytes;
        self
    }

    /// Sets whether tracking starts enabled.
    #[must_use]
    pub fn start_enabled(mut self, enabled: bool) -> Self {
        self.config.start_enabled = enabled;
        self
    }

    /// Finishes the builder.
    #[must_use]
    pub fn build(self) -> TrackerConfig {
        self.config
    }
}
