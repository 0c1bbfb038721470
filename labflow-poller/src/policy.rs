//! Interval adjustment policy
//!
//! [`AdaptiveInterval`] is the pure state machine behind every poller. Each
//! tick's change amount is classified as busy, quiet or neutral:
//!
//! - busy (`change > activity_threshold`): the interval is halved, never
//!   below `interval_min`, and the quiet streak resets
//! - quiet (`change <= quiet_threshold`): the quiet streak grows; after
//!   [`QUIET_TICKS_TO_GROW`] consecutive quiet ticks the interval grows by
//!   half, never above `interval_max`, and the streak resets
//! - neutral: nothing changes
//!
//! The policy owns no timer. The polling loop restarts its timer whenever
//! [`AdaptiveInterval::record`] reports an adjustment.

use std::time::Duration;

use crate::config::PollingSettings;

/// Consecutive quiet ticks needed before the interval grows
pub const QUIET_TICKS_TO_GROW: u32 = 5;

/// Classification of one tick's change amount
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activity {
    Busy,
    Quiet,
    Neutral,
}

/// Outcome of recording one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    /// Interval and timer stay as they are
    Unchanged,
    /// Busy tick: interval halved (clamped to the minimum)
    Shrunk { from: Duration, to: Duration },
    /// Fifth quiet tick in a row: interval grown by half (clamped to the maximum)
    Grew { from: Duration, to: Duration },
}

impl Adjustment {
    /// The interval the timer must be restarted with, if any
    pub fn restart_interval(&self) -> Option<Duration> {
        match self {
            Adjustment::Unchanged => None,
            Adjustment::Shrunk { to, .. } | Adjustment::Grew { to, .. } => Some(*to),
        }
    }
}

/// Self-tuning interval between `interval_min` and `interval_max`
#[derive(Debug, Clone)]
pub struct AdaptiveInterval {
    interval: Duration,
    min: Duration,
    max: Duration,
    activity_threshold: f64,
    quiet_threshold: f64,
    quiet_streak: u32,
}

impl AdaptiveInterval {
    /// Start at `interval_start` with an empty quiet streak
    pub fn new(settings: &PollingSettings) -> Self {
        Self {
            interval: settings.interval_start,
            min: settings.interval_min,
            max: settings.interval_max,
            activity_threshold: settings.activity_threshold,
            quiet_threshold: settings.quiet_threshold,
            quiet_streak: 0,
        }
    }

    /// Current polling period
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Consecutive quiet ticks since the last interval change
    pub fn quiet_streak(&self) -> u32 {
        self.quiet_streak
    }

    /// Classify a change amount without touching any state
    ///
    /// Busy is checked first with a strict comparison, so an amount equal to
    /// `activity_threshold` is only quiet when both thresholds are equal.
    /// NaN is neutral.
    pub fn classify(&self, change: f64) -> Activity {
        if change > self.activity_threshold {
            Activity::Busy
        } else if change <= self.quiet_threshold {
            Activity::Quiet
        } else {
            Activity::Neutral
        }
    }

    /// Record one tick's change amount and apply the resulting adjustment
    pub fn record(&mut self, change: f64) -> Adjustment {
        match self.classify(change) {
            Activity::Busy => {
                let from = self.interval;
                self.interval = (from / 2).max(self.min);
                self.quiet_streak = 0;
                Adjustment::Shrunk {
                    from,
                    to: self.interval,
                }
            }
            Activity::Quiet => {
                self.quiet_streak += 1;
                if self.quiet_streak < QUIET_TICKS_TO_GROW {
                    return Adjustment::Unchanged;
                }

                let from = self.interval;
                self.interval = (from.saturating_mul(3) / 2).min(self.max);
                self.quiet_streak = 0;
                Adjustment::Grew {
                    from,
                    to: self.interval,
                }
            }
            Activity::Neutral => Adjustment::Unchanged,
        }
    }
}
