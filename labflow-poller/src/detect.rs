//! Ready-made change detectors
//!
//! Pass any of these to [`PollingConfig::with_change_detector`](crate::PollingConfig::with_change_detector).

/// Signed growth of a numeric measure between snapshots
///
/// On the first tick the measure itself is the change, so a queue that
/// starts out full counts as busy. A shrinking measure yields a negative
/// amount, which reads as quiet.
pub fn count_delta<T, F>(extract: F) -> impl Fn(Option<&T>, &T) -> f64 + Send + Sync + 'static
where
    T: 'static,
    F: Fn(&T) -> f64 + Send + Sync + 'static,
{
    move |previous: Option<&T>, next: &T| match previous {
        Some(previous) => extract(next) - extract(previous),
        None => extract(next),
    }
}

/// `1.0` whenever the snapshot differs from the previous one, else `0.0`
///
/// The first snapshot always counts as a change.
pub fn value_changed<T>() -> impl Fn(Option<&T>, &T) -> f64 + Send + Sync + 'static
where
    T: PartialEq + 'static,
{
    |previous: Option<&T>, next: &T| {
        if previous == Some(next) {
            0.0
        } else {
            1.0
        }
    }
}
