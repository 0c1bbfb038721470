//! Configuration types for the labflow-poller crate
//!
//! `PollingSettings` holds the plain, serializable tuning knobs of a poller.
//! `PollingConfig` pairs those settings with the request that produces
//! snapshots and the optional change detector that scores them.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{BoxError, PollingError, PollingResult};
use crate::source::{FnSource, SnapshotSource};

/// Scores the amount of change between the previous snapshot and the new one.
pub type ChangeDetectorFn<T> = dyn Fn(Option<&T>, &T) -> f64 + Send + Sync;

/// Tuning knobs for a single poller
///
/// Durations are (de)serialized as whole milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingSettings {
    /// Initial polling period
    /// Default: 30 seconds
    #[serde(rename = "interval_start_ms", with = "duration_ms")]
    pub interval_start: Duration,

    /// Lower bound for the adaptive interval
    /// Default: 20 seconds
    #[serde(rename = "interval_min_ms", with = "duration_ms")]
    pub interval_min: Duration,

    /// Upper bound for the adaptive interval
    /// Default: 60 seconds
    #[serde(rename = "interval_max_ms", with = "duration_ms")]
    pub interval_max: Duration,

    /// Change amounts strictly above this mark a busy tick
    /// Default: 10
    pub activity_threshold: f64,

    /// Change amounts at or below this mark a quiet tick
    /// Default: 3
    pub quiet_threshold: f64,

    /// Snapshots buffered per subscriber before it starts lagging
    /// Default: 64
    pub buffer_size: usize,

    /// Name used in log lines and statistics
    /// Default: "poller"
    pub label: String,
}

impl Default for PollingSettings {
    fn default() -> Self {
        Self {
            interval_start: Duration::from_secs(30),
            interval_min: Duration::from_secs(20),
            interval_max: Duration::from_secs(60),
            activity_threshold: 10.0,
            quiet_threshold: 3.0,
            buffer_size: 64,
            label: "poller".to_string(),
        }
    }
}

impl PollingSettings {
    /// Create new settings with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Settings for views that must react within a few seconds
    pub fn fast_refresh() -> Self {
        Self {
            interval_start: Duration::from_secs(5),
            interval_min: Duration::from_secs(2),
            interval_max: Duration::from_secs(15),
            activity_threshold: 5.0,
            quiet_threshold: 1.0,
            ..Default::default()
        }
    }

    /// Settings for background views where freshness matters little
    pub fn resource_efficient() -> Self {
        Self {
            interval_start: Duration::from_secs(60),
            interval_min: Duration::from_secs(30),
            interval_max: Duration::from_secs(300),
            activity_threshold: 20.0,
            quiet_threshold: 5.0,
            buffer_size: 16,
            ..Default::default()
        }
    }

    /// Parse settings from JSON; missing fields take their default value
    pub fn from_json(json: &str) -> PollingResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Validate the settings and return the first issue found
    ///
    /// `PollingInstance::new` trusts its input; this check is for callers
    /// that load settings from outside the program.
    pub fn validate(&self) -> PollingResult<()> {
        if self.interval_min.is_zero() {
            return Err(PollingError::Configuration(
                "interval_min must be greater than 0".to_string(),
            ));
        }

        let intervals = [self.interval_start, self.interval_min, self.interval_max];
        if intervals.iter().any(|d| d.subsec_nanos() % 1_000_000 != 0) {
            return Err(PollingError::Configuration(
                "Intervals must be whole milliseconds".to_string(),
            ));
        }

        if self.interval_min > self.interval_max {
            return Err(PollingError::Configuration(
                "Invalid polling interval: min must not exceed max".to_string(),
            ));
        }

        if self.interval_start < self.interval_min || self.interval_start > self.interval_max {
            return Err(PollingError::Configuration(
                "interval_start must lie within [interval_min, interval_max]".to_string(),
            ));
        }

        if !self.quiet_threshold.is_finite() || !self.activity_threshold.is_finite() {
            return Err(PollingError::Configuration(
                "Thresholds must be finite numbers".to_string(),
            ));
        }

        if self.quiet_threshold < 0.0 {
            return Err(PollingError::Configuration(
                "quiet_threshold must not be negative".to_string(),
            ));
        }

        if self.quiet_threshold > self.activity_threshold {
            return Err(PollingError::Configuration(
                "quiet_threshold must not exceed activity_threshold".to_string(),
            ));
        }

        if self.buffer_size == 0 {
            return Err(PollingError::Configuration(
                "Buffer size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_intervals(mut self, start: Duration, min: Duration, max: Duration) -> Self {
        self.interval_start = start;
        self.interval_min = min;
        self.interval_max = max;
        self
    }

    pub fn with_thresholds(mut self, activity: f64, quiet: f64) -> Self {
        self.activity_threshold = activity;
        self.quiet_threshold = quiet;
        self
    }

    pub fn with_buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// Everything a poller needs: settings, the request, and the change detector
pub struct PollingConfig<T> {
    pub(crate) settings: PollingSettings,
    pub(crate) source: Arc<dyn SnapshotSource<T>>,
    pub(crate) detect_changes: Option<Arc<ChangeDetectorFn<T>>>,
}

impl<T: Send + 'static> PollingConfig<T> {
    /// Create a config whose request is an async closure
    ///
    /// ```rust,ignore
    /// let config = PollingConfig::new(PollingSettings::default(), || async {
    ///     Ok::<_, std::io::Error>(fetch_pending_count().await)
    /// });
    /// ```
    pub fn new<F, Fut, E>(settings: PollingSettings, request: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        Self::from_source(settings, Arc::new(FnSource::new(request)))
    }

    /// Create a config around an existing snapshot source
    pub fn from_source(settings: PollingSettings, source: Arc<dyn SnapshotSource<T>>) -> Self {
        Self {
            settings,
            source,
            detect_changes: None,
        }
    }

    /// Score each new snapshot against the previous one
    ///
    /// Without a detector every tick scores `0.0`.
    pub fn with_change_detector<F>(mut self, detect: F) -> Self
    where
        F: Fn(Option<&T>, &T) -> f64 + Send + Sync + 'static,
    {
        self.detect_changes = Some(Arc::new(detect));
        self
    }

    pub fn settings(&self) -> &PollingSettings {
        &self.settings
    }

    pub(crate) fn score(&self, previous: Option<&T>, next: &T) -> f64 {
        match &self.detect_changes {
            Some(detect) => detect(previous, next),
            None => 0.0,
        }
    }
}

impl<T> fmt::Debug for PollingConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingConfig")
            .field("settings", &self.settings)
            .field("detect_changes", &self.detect_changes.is_some())
            .finish_non_exhaustive()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    // Sub-millisecond precision is dropped; `validate` rejects such settings
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings() {
        let settings = PollingSettings::default();
        assert_eq!(settings.interval_start, Duration::from_secs(30));
        assert_eq!(settings.interval_min, Duration::from_secs(20));
        assert_eq!(settings.interval_max, Duration::from_secs(60));
        assert_eq!(settings.activity_threshold, 10.0);
        assert_eq!(settings.quiet_threshold, 3.0);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_validation() {
        let inverted = PollingSettings::default().with_intervals(
            Duration::from_secs(30),
            Duration::from_secs(60),
            Duration::from_secs(20),
        );
        assert!(inverted.validate().is_err());

        let start_outside = PollingSettings::default().with_intervals(
            Duration::from_secs(90),
            Duration::from_secs(20),
            Duration::from_secs(60),
        );
        assert!(start_outside.validate().is_err());

        let zero_min = PollingSettings::default().with_intervals(
            Duration::from_secs(1),
            Duration::ZERO,
            Duration::from_secs(10),
        );
        assert!(zero_min.validate().is_err());

        let crossed_thresholds = PollingSettings::default().with_thresholds(2.0, 5.0);
        assert!(crossed_thresholds.validate().is_err());

        let negative_quiet = PollingSettings::default().with_thresholds(2.0, -1.0);
        assert!(negative_quiet.validate().is_err());

        let nan_activity = PollingSettings::default().with_thresholds(f64::NAN, 1.0);
        assert!(nan_activity.validate().is_err());

        let no_buffer = PollingSettings::default().with_buffer_size(0);
        assert!(no_buffer.validate().is_err());
    }

    #[test]
    fn test_sub_millisecond_intervals_are_rejected() {
        let fractional = PollingSettings::default().with_intervals(
            Duration::from_micros(30_000_500),
            Duration::from_secs(20),
            Duration::from_secs(60),
        );
        assert!(matches!(
            fractional.validate(),
            Err(PollingError::Configuration(_))
        ));

        // Whole milliseconds survive a JSON round trip unchanged
        let settings = PollingSettings::default().with_intervals(
            Duration::from_millis(1_500),
            Duration::from_millis(250),
            Duration::from_millis(90_001),
        );
        assert!(settings.validate().is_ok());
        let json = serde_json::to_string(&settings).unwrap();
        assert_eq!(PollingSettings::from_json(&json).unwrap(), settings);
    }

    #[test]
    fn test_equal_thresholds_are_valid() {
        let settings = PollingSettings::default().with_thresholds(4.0, 4.0);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_presets() {
        let fast = PollingSettings::fast_refresh();
        assert_eq!(fast.interval_start, Duration::from_secs(5));
        assert!(fast.validate().is_ok());

        let efficient = PollingSettings::resource_efficient();
        assert_eq!(efficient.interval_max, Duration::from_secs(300));
        assert_eq!(efficient.buffer_size, 16);
        assert!(efficient.validate().is_ok());
    }

    #[test]
    fn test_builder_pattern() {
        let settings = PollingSettings::new()
            .with_intervals(
                Duration::from_secs(10),
                Duration::from_secs(5),
                Duration::from_secs(40),
            )
            .with_thresholds(8.0, 2.0)
            .with_buffer_size(8)
            .with_label("pending-samples");

        assert_eq!(settings.interval_min, Duration::from_secs(5));
        assert_eq!(settings.activity_threshold, 8.0);
        assert_eq!(settings.buffer_size, 8);
        assert_eq!(settings.label, "pending-samples");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_settings_from_json() {
        let settings = PollingSettings::from_json(
            r#"{
                "interval_start_ms": 5000,
                "interval_min_ms": 1000,
                "interval_max_ms": 20000,
                "activity_threshold": 4,
                "label": "signature-queue"
            }"#,
        )
        .unwrap();

        assert_eq!(settings.interval_start, Duration::from_secs(5));
        assert_eq!(settings.interval_min, Duration::from_secs(1));
        assert_eq!(settings.interval_max, Duration::from_secs(20));
        assert_eq!(settings.activity_threshold, 4.0);
        // Unspecified fields fall back to defaults
        assert_eq!(settings.quiet_threshold, 3.0);
        assert_eq!(settings.buffer_size, 64);
        assert_eq!(settings.label, "signature-queue");
    }

    #[test]
    fn test_settings_json_rejects_garbage() {
        let result = PollingSettings::from_json("{ \"interval_min_ms\": \"soon\" }");
        assert!(matches!(result, Err(PollingError::InvalidSettings(_))));
    }

    #[test]
    fn test_settings_serialize_in_millis() {
        let json = serde_json::to_value(PollingSettings::default()).unwrap();
        assert_eq!(json["interval_start_ms"], 30_000);
        assert_eq!(json["interval_max_ms"], 60_000);
    }

    #[test]
    fn test_missing_detector_scores_zero() {
        let config = PollingConfig::new(PollingSettings::default(), || async {
            Ok::<u32, std::io::Error>(1)
        });
        assert_eq!(config.score(None, &42), 0.0);
        assert_eq!(config.score(Some(&1), &1_000), 0.0);
    }

    #[test]
    fn test_detector_is_used() {
        let config = PollingConfig::new(PollingSettings::default(), || async {
            Ok::<u32, std::io::Error>(1)
        })
        .with_change_detector(|prev: Option<&u32>, next: &u32| {
            f64::from(*next) - f64::from(prev.copied().unwrap_or(0))
        });
        assert_eq!(config.score(None, &5), 5.0);
        assert_eq!(config.score(Some(&5), &7), 2.0);
    }
}
