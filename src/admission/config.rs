//! # Admission Configuration
//!
//! This module holds the settings for the three admission components. Each
//! settings struct can be built by hand, from a constructor helper, or with
//! chained `with_*` setters, and each has a `validate()` that is run before
//! anything is constructed from it.
//!
//! ## Rate Windows
//!
//! ```text
//!     Limiter chain "1:5, 60:100":
//!
//!     ┌───────────────┐   ┌─────────────────┐
//!     │ 1s  window    │──►│ 60s window      │   narrowest first
//!     │ 5 per second  │   │ 100 per minute  │
//!     └───────────────┘   └─────────────────┘
//! ```
//!
//! ## Queue Thresholds
//!
//! ```text
//!     capacity ──────────── 10  ◄── max-size alarm (bounded policies)
//!     threshold (80%) ───── 8   ◄── threshold-exceeded alarm
//!     lower bound (70%) ─── 7   ◄── threshold-ok alarm (hysteresis)
//! ```

use super::error::ConfigError;
use std::fmt;
use std::str::FromStr;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// Default queue capacity when none is given.
pub const DEFAULT_QUEUE_CAPACITY: usize = 2000;

/// Default alarm threshold as a fraction of capacity.
pub const DEFAULT_THRESHOLD_FRACTION: f64 = 0.8;

/// Default gap between the raise and clear points of the threshold alarm.
pub const DEFAULT_HYSTERESIS_FRACTION: f64 = 0.1;

/// Default averaging window for the queue size estimator, in seconds.
pub const DEFAULT_AVERAGE_WINDOW_SECS: u64 = 5;

/// Default number of workers a pool keeps alive.
pub const DEFAULT_MIN_WORKERS: usize = 16;

/// Default reaper period while the pool is at its floor (90 seconds).
pub const DEFAULT_REAP_INTERVAL_MS: u64 = 90_000;

/// Default reaper period while surplus workers are being trimmed (20 seconds).
pub const DEFAULT_FAST_REAP_INTERVAL_MS: u64 = 20_000;

/// One leaky-bucket window: `allowance` events per `interval_secs` seconds.
///
/// Values are signed so that operator input can be carried as-is and
/// rejected by [`validate`](Self::validate) rather than silently wrapped.
///
/// ```rust
/// use admission::WindowSpec;
///
/// let spec: WindowSpec = "60:100".parse().unwrap();
/// assert_eq!(spec, WindowSpec::new(60, 100));
/// assert!(WindowSpec::new(0, 10).validate().is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WindowSpec {
    /// Window length in seconds.
    pub interval_secs: i64,

    /// Events admitted per window.
    pub allowance: i64,
}

impl WindowSpec {
    /// Creates a window of `allowance` events per `interval_secs` seconds.
    pub const fn new(interval_secs: i64, allowance: i64) -> Self {
        Self {
            interval_secs,
            allowance,
        }
    }

    /// Window admitting `allowance` events per second.
    pub const fn per_second(allowance: i64) -> Self {
        Self::new(1, allowance)
    }

    /// Window admitting `allowance` events per minute.
    pub const fn per_minute(allowance: i64) -> Self {
        Self::new(60, allowance)
    }

    /// Checks that both members are positive.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs <= 0 || self.allowance <= 0 {
            return Err(ConfigError::NonPositiveWindow {
                interval: self.interval_secs,
                allowance: self.allowance,
            });
        }
        Ok(())
    }
}

impl fmt::Display for WindowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.interval_secs, self.allowance)
    }
}

impl FromStr for WindowSpec {
    type Err = ConfigError;

    /// Parses `interval:allowance`, e.g. `"1:5"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split(':');
        let (Some(interval), Some(allowance), None) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(ConfigError::MalformedWindow(s.trim().to_string()));
        };

        let parse = |v: &str| {
            v.trim()
                .parse::<i64>()
                .map_err(|_| ConfigError::MalformedWindow(s.trim().to_string()))
        };

        let spec = WindowSpec::new(parse(interval)?, parse(allowance)?);
        spec.validate()?;
        Ok(spec)
    }
}

impl TryFrom<&[i64]> for WindowSpec {
    type Error = ConfigError;

    /// Builds a window from a two-element row `[interval, allowance]`.
    fn try_from(row: &[i64]) -> Result<Self, Self::Error> {
        match row {
            [interval, allowance] => {
                let spec = WindowSpec::new(*interval, *allowance);
                spec.validate()?;
                Ok(spec)
            }
            _ => Err(ConfigError::MalformedWindow(format!("{:?}", row))),
        }
    }
}

/// Parses a comma separated window list such as `"1:5, 60:100"`.
///
/// # Errors
///
/// Returns [`ConfigError::EmptyWindows`] for an empty list, and
/// [`ConfigError::MalformedWindow`] / [`ConfigError::NonPositiveWindow`]
/// for the first bad entry.
pub fn parse_windows(s: &str) -> Result<Vec<WindowSpec>, ConfigError> {
    let windows = s
        .split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(str::parse)
        .collect::<Result<Vec<WindowSpec>, _>>()?;

    if windows.is_empty() {
        return Err(ConfigError::EmptyWindows);
    }
    Ok(windows)
}

/// Checks a window list the way a chain would before accepting it.
pub(crate) fn validate_windows(windows: &[WindowSpec]) -> Result<(), ConfigError> {
    if windows.is_empty() {
        return Err(ConfigError::EmptyWindows);
    }
    windows.iter().try_for_each(WindowSpec::validate)
}

/// What a full queue does with the next item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum OverflowPolicy {
    /// Evict the head (oldest item) to make room for the new one.
    DropOldest,

    /// Discard the incoming item.
    #[default]
    DropNewest,

    /// Keep growing past capacity; nothing is discarded.
    Unbounded,
}

impl OverflowPolicy {
    /// Whether `size` is capped by capacity under this policy.
    #[inline]
    pub fn is_bounded(&self) -> bool {
        !matches!(self, Self::Unbounded)
    }
}

/// Settings for a [`BoundedAlarmQueue`](crate::BoundedAlarmQueue).
///
/// ```rust
/// use admission::{OverflowPolicy, QueueConfig};
///
/// let config = QueueConfig::new("REQUESTI", 500)
///     .with_policy(OverflowPolicy::DropOldest)
///     .with_threshold(0.9);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct QueueConfig {
    /// Queue name, reported to the alarm sink and used as the registry key.
    pub name: String,

    /// Maximum number of items held under a bounded policy.
    pub capacity: usize,

    /// Fraction of capacity at which the threshold alarm is raised.
    pub threshold_fraction: f64,

    /// How far below the threshold the size must fall to clear the alarm.
    pub hysteresis_fraction: f64,

    /// Age limit, in seconds, of the samples behind `average_size()`.
    pub average_window_secs: u64,

    /// Behavior when full.
    pub policy: OverflowPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            capacity: DEFAULT_QUEUE_CAPACITY,
            threshold_fraction: DEFAULT_THRESHOLD_FRACTION,
            hysteresis_fraction: DEFAULT_HYSTERESIS_FRACTION,
            average_window_secs: DEFAULT_AVERAGE_WINDOW_SECS,
            policy: OverflowPolicy::default(),
        }
    }
}

impl QueueConfig {
    /// Creates a configuration with default thresholds.
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity,
            ..Default::default()
        }
    }

    /// Sets the overflow policy.
    pub fn with_policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Sets the threshold fraction.
    pub fn with_threshold(mut self, fraction: f64) -> Self {
        self.threshold_fraction = fraction;
        self
    }

    /// Sets the hysteresis fraction.
    pub fn with_hysteresis(mut self, fraction: f64) -> Self {
        self.hysteresis_fraction = fraction;
        self
    }

    /// Sets the averaging window in seconds.
    pub fn with_average_window(mut self, secs: u64) -> Self {
        self.average_window_secs = secs;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// - capacity is 0
    /// - threshold is outside `(0, 1]`
    /// - hysteresis is outside `(0, threshold)`
    /// - averaging window is 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::InvalidCapacity);
        }
        validate_threshold(self.threshold_fraction)?;
        validate_hysteresis(self.hysteresis_fraction, self.threshold_fraction)?;
        if self.average_window_secs == 0 {
            return Err(ConfigError::InvalidAverageWindow);
        }
        Ok(())
    }
}

pub(crate) fn validate_threshold(fraction: f64) -> Result<(), ConfigError> {
    if !(fraction > 0.0 && fraction <= 1.0) {
        return Err(ConfigError::InvalidThreshold(fraction));
    }
    Ok(())
}

pub(crate) fn validate_hysteresis(hysteresis: f64, threshold: f64) -> Result<(), ConfigError> {
    if !(hysteresis > 0.0 && hysteresis < threshold) {
        return Err(ConfigError::InvalidHysteresis {
            hysteresis,
            threshold,
        });
    }
    Ok(())
}

/// Which idle worker `assign` hands new work to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ReuseOrder {
    /// Most recently idled first; keeps hot threads busy.
    #[default]
    Lifo,

    /// Longest idle first; spreads work across all threads.
    Fifo,
}

/// Which idle worker the reaper retires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ReapOrder {
    /// Most recently idled first.
    #[default]
    MostRecent,

    /// Longest idle first.
    LeastRecent,
}

/// Settings for a [`WorkerPool`](crate::WorkerPool) and its reaper.
///
/// ```rust
/// use admission::PoolConfig;
///
/// let config = PoolConfig::new("io", 4).with_reap_intervals(1_000, 100);
/// assert!(config.validate().is_ok());
/// assert!(PoolConfig::new("io", 0).validate().is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct PoolConfig {
    /// Pool name, used as the worker thread name prefix.
    pub name: String,

    /// Floor the reaper never trims below.
    pub min_workers: usize,

    /// Reaper period while idle workers are at or below the floor.
    pub reap_interval_ms: u64,

    /// Reaper period while there is surplus to trim.
    pub fast_reap_interval_ms: u64,

    /// Idle worker selection for new assignments.
    pub reuse_order: ReuseOrder,

    /// Idle worker selection for the reaper.
    pub reap_order: ReapOrder,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "admission".to_string(),
            min_workers: DEFAULT_MIN_WORKERS,
            reap_interval_ms: DEFAULT_REAP_INTERVAL_MS,
            fast_reap_interval_ms: DEFAULT_FAST_REAP_INTERVAL_MS,
            reuse_order: ReuseOrder::default(),
            reap_order: ReapOrder::default(),
        }
    }
}

impl PoolConfig {
    /// Creates a pool configuration with default reaper timing.
    pub fn new(name: impl Into<String>, min_workers: usize) -> Self {
        Self {
            name: name.into(),
            min_workers,
            ..Default::default()
        }
    }

    /// Sets the normal and fast reaper periods in milliseconds.
    pub fn with_reap_intervals(mut self, normal_ms: u64, fast_ms: u64) -> Self {
        self.reap_interval_ms = normal_ms;
        self.fast_reap_interval_ms = fast_ms;
        self
    }

    /// Sets the idle worker reuse order.
    pub fn with_reuse_order(mut self, order: ReuseOrder) -> Self {
        self.reuse_order = order;
        self
    }

    /// Sets the reaper's victim order.
    pub fn with_reap_order(mut self, order: ReapOrder) -> Self {
        self.reap_order = order;
        self
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// - `min_workers` is 0
    /// - either reaper interval is 0
    /// - the fast interval is longer than the normal one
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_workers == 0 {
            return Err(ConfigError::InvalidPool("min_workers must be at least 1"));
        }
        if self.reap_interval_ms == 0 || self.fast_reap_interval_ms == 0 {
            return Err(ConfigError::InvalidPool("reap intervals must be greater than 0"));
        }
        if self.fast_reap_interval_ms > self.reap_interval_ms {
            return Err(ConfigError::InvalidPool(
                "fast reap interval must not exceed the normal interval",
            ));
        }
        Ok(())
    }
}
