//! Running pollers
//!
//! A [`PollingInstance`] owns one background tokio task that fetches a
//! snapshot per tick, scores it against the previous one, lets the
//! [`AdaptiveInterval`] policy retune the period and publishes the snapshot
//! to every subscriber.
//!
//! Ticks are serialized: the next request is only issued once the previous
//! tick, interval adjustment included, has been fully processed. A request
//! that outlasts the interval delays the schedule instead of overlapping
//! with the next tick.

use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};

use crate::config::PollingConfig;
use crate::error::{PollingError, PollingResult};
use crate::policy::{AdaptiveInterval, Adjustment};
use crate::stream::SnapshotStream;

/// Shortest period handed to the timer; tokio rejects a zero period
const MIN_TIMER_PERIOD: Duration = Duration::from_millis(1);

/// Stop flag shared between an instance and its polling task
///
/// Publishing happens while holding `stopped`, so once [`StopControl::stop`]
/// returns no snapshot can be published anymore.
struct StopControl {
    stopped: Mutex<bool>,
    signal: watch::Sender<bool>,
}

impl StopControl {
    fn new() -> Self {
        let (signal, _) = watch::channel(false);
        Self {
            stopped: Mutex::new(false),
            signal,
        }
    }

    /// Returns `true` for the call that actually stopped the poller
    fn stop(&self) -> bool {
        let mut stopped = self.stopped.lock();
        if *stopped {
            return false;
        }
        *stopped = true;
        self.signal.send_replace(true);
        true
    }

    fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }
}

/// Mutable poller state, written only by the polling task
#[derive(Debug)]
struct PollerState {
    policy: AdaptiveInterval,
    ticks: u64,
    emitted: u64,
    failed_requests: u64,
    consecutive_failures: u32,
    shrinks: u64,
    grows: u64,
    last_error: Option<String>,
    started_at: SystemTime,
}

/// Statistics for a single poller
#[derive(Debug, Clone)]
pub struct PollingStats {
    pub label: String,
    pub current_interval: Duration,
    pub quiet_streak: u32,
    /// Requests issued
    pub ticks: u64,
    /// Snapshots published
    pub emitted: u64,
    pub failed_requests: u64,
    pub consecutive_failures: u32,
    /// Busy ticks that restarted the timer
    pub shrinks: u64,
    /// Quiet streaks that restarted the timer
    pub grows: u64,
    pub last_error: Option<String>,
    pub started_at: SystemTime,
    pub is_stopped: bool,
    pub is_running: bool,
}

impl fmt::Display for PollingStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (interval: {:?}, quiet streak: {}, ticks: {}, emitted: {}, errors: {}",
            self.label,
            self.current_interval,
            self.quiet_streak,
            self.ticks,
            self.emitted,
            self.failed_requests
        )?;
        if self.is_stopped {
            write!(f, ", stopped")?;
        }
        write!(f, ")")
    }
}

/// Control surface the service keeps for every registered poller
pub(crate) trait ManagedPoller: Send + Sync {
    fn stop(&self);
    fn stats(&self) -> PollingStats;
    fn is_stopped(&self) -> bool;
}

struct Inner<T> {
    label: Arc<str>,
    control: Arc<StopControl>,
    state: Arc<RwLock<PollerState>>,

    /// Cleared on stop so late subscribers get an already-ended stream
    sender: Mutex<Option<broadcast::Sender<T>>>,

    /// Receiver created together with the channel; handed to the first `data()` call
    primary: Mutex<Option<broadcast::Receiver<T>>>,

    latest: watch::Receiver<Option<T>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T> Inner<T> {
    fn stop(&self) {
        if self.control.stop() {
            self.sender.lock().take();
            self.primary.lock().take();
            tracing::info!("Stopped polling for {}", self.label);
        }
    }

    fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn stats(&self) -> PollingStats {
        // Lock order: the stop flag is never taken while holding the state
        let is_stopped = self.control.is_stopped();
        let is_running = self.is_running();
        let state = self.state.read();
        PollingStats {
            label: self.label.to_string(),
            current_interval: state.policy.interval(),
            quiet_streak: state.policy.quiet_streak(),
            ticks: state.ticks,
            emitted: state.emitted,
            failed_requests: state.failed_requests,
            consecutive_failures: state.consecutive_failures,
            shrinks: state.shrinks,
            grows: state.grows,
            last_error: state.last_error.clone(),
            started_at: state.started_at,
            is_stopped,
            is_running,
        }
    }
}

impl<T: Send + Sync> ManagedPoller for Inner<T> {
    fn stop(&self) {
        Inner::stop(self);
    }

    fn stats(&self) -> PollingStats {
        Inner::stats(self)
    }

    fn is_stopped(&self) -> bool {
        self.control.is_stopped()
    }
}

impl<T> Drop for Inner<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// A running adaptive poller
///
/// Cloning is cheap and every clone controls the same poller. The poller
/// stops when [`stop`](Self::stop) is called or when the last clone is
/// dropped. A stopped poller cannot be restarted; create a new one instead.
pub struct PollingInstance<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for PollingInstance<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> PollingInstance<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a poller and start polling right away
    ///
    /// The first request is issued immediately; later ones follow the
    /// adaptive interval, starting at `interval_start`. The config is not
    /// validated here.
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn new(config: PollingConfig<T>) -> Self {
        let settings = config.settings();
        let label: Arc<str> = Arc::from(settings.label.as_str());
        let (sender, primary) = broadcast::channel(settings.buffer_size.max(1));
        let (latest_tx, latest) = watch::channel(None);
        let control = Arc::new(StopControl::new());
        let state = Arc::new(RwLock::new(PollerState {
            policy: AdaptiveInterval::new(settings),
            ticks: 0,
            emitted: 0,
            failed_requests: 0,
            consecutive_failures: 0,
            shrinks: 0,
            grows: 0,
            last_error: None,
            started_at: SystemTime::now(),
        }));

        let worker = PollingWorker {
            config,
            label: Arc::clone(&label),
            control: Arc::clone(&control),
            state: Arc::clone(&state),
            sender: sender.clone(),
            latest: latest_tx,
        };
        let task = tokio::spawn(worker.run());

        Self {
            inner: Arc::new(Inner {
                label,
                control,
                state,
                sender: Mutex::new(Some(sender)),
                primary: Mutex::new(Some(primary)),
                latest,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    /// Stream of published snapshots
    ///
    /// The first call returns a stream that starts with the very first
    /// snapshot (up to `buffer_size` of them are held until then). Later
    /// calls behave like [`subscribe`](Self::subscribe).
    pub fn data(&self) -> SnapshotStream<T> {
        match self.inner.primary.lock().take() {
            Some(receiver) => self.stream(receiver),
            None => self.subscribe(),
        }
    }

    /// Stream of snapshots published from now on
    pub fn subscribe(&self) -> SnapshotStream<T> {
        let receiver = match self.inner.sender.lock().as_ref() {
            Some(sender) => sender.subscribe(),
            None => {
                // Stopped: hand out a stream that has already ended
                let (_, receiver) = broadcast::channel(1);
                receiver
            }
        };
        self.stream(receiver)
    }

    /// The most recently published snapshot
    pub fn latest(&self) -> Option<T> {
        self.inner.latest.borrow().clone()
    }

    /// Stop polling
    ///
    /// Idempotent. No request is started and no snapshot is published after
    /// this returns. A request already in flight runs to completion but its
    /// result is discarded.
    pub fn stop(&self) {
        self.inner.stop();
    }

    /// Stop polling and wait for the background task to finish
    ///
    /// Waits for an in-flight request to settle.
    pub async fn shutdown(self) -> PollingResult<()> {
        self.stop();

        let task = self.inner.task.lock().take();
        match task {
            Some(handle) => handle.await.map_err(|e| {
                PollingError::TaskJoin(format!("Failed to await task completion: {}", e))
            }),
            None => Ok(()),
        }
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Current polling period
    pub fn interval(&self) -> Duration {
        self.inner.state.read().policy.interval()
    }

    /// Consecutive quiet ticks since the last interval change
    pub fn quiet_streak(&self) -> u32 {
        self.inner.state.read().policy.quiet_streak()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.control.is_stopped()
    }

    /// Whether the background task is still alive
    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }

    pub fn stats(&self) -> PollingStats {
        self.inner.stats()
    }

    pub(crate) fn downgrade(&self) -> Weak<dyn ManagedPoller> {
        let weak: Weak<Inner<T>> = Arc::downgrade(&self.inner);
        weak
    }

    fn stream(&self, receiver: broadcast::Receiver<T>) -> SnapshotStream<T> {
        SnapshotStream::new(
            receiver,
            self.inner.control.subscribe(),
            Arc::clone(&self.inner.label),
        )
    }
}

impl<T> fmt::Debug for PollingInstance<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingInstance")
            .field("label", &self.inner.label)
            .field("stopped", &self.inner.control.is_stopped())
            .finish_non_exhaustive()
    }
}

/// Marks the poller stopped when its task ends, panics included
struct StopOnExit {
    control: Arc<StopControl>,
    label: Arc<str>,
}

impl Drop for StopOnExit {
    fn drop(&mut self) {
        if self.control.stop() {
            tracing::warn!("Polling task for {} ended unexpectedly", self.label);
        }
    }
}

/// What became of one tick's fetch
enum TickOutcome {
    Published(Adjustment),
    Failed,
    Discarded,
}

/// Everything the background task owns
struct PollingWorker<T> {
    config: PollingConfig<T>,
    label: Arc<str>,
    control: Arc<StopControl>,
    state: Arc<RwLock<PollerState>>,
    sender: broadcast::Sender<T>,
    latest: watch::Sender<Option<T>>,
}

impl<T> PollingWorker<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Main polling loop
    async fn run(self) {
        let _exit = StopOnExit {
            control: Arc::clone(&self.control),
            label: Arc::clone(&self.label),
        };
        let mut stop_signal = self.control.subscribe();
        let mut previous: Option<T> = None;

        let start_interval = self.state.read().policy.interval();
        tracing::info!(
            "Starting polling task for {} (interval: {:?})",
            self.label,
            start_interval
        );

        // First tick fires immediately
        let mut ticker = schedule(Instant::now(), start_interval);

        loop {
            tokio::select! {
                biased;
                _ = stop_signal.wait_for(|stopped| *stopped) => break,
                _ = ticker.tick() => {}
            }

            self.state.write().ticks += 1;
            let fetched = self
                .config
                .source
                .fetch()
                .await
                .map_err(PollingError::Request);

            match self.process(fetched, &mut previous) {
                TickOutcome::Published(adjustment) => {
                    if let Some(next_interval) = adjustment.restart_interval() {
                        // Replace the timer: the next tick comes one full new interval from now
                        ticker = schedule(Instant::now() + next_interval, next_interval);
                    }
                }
                TickOutcome::Failed => {}
                TickOutcome::Discarded => {
                    tracing::debug!(
                        "Discarding in-flight result for stopped poller {}",
                        self.label
                    );
                    break;
                }
            }
        }

        tracing::info!("Polling task ended for {}", self.label);
    }

    /// Score, adjust and publish one fetched snapshot
    ///
    /// The detector runs before the stop flag is taken. Adjusting and
    /// publishing happen while holding it, so a concurrent `stop()` either
    /// happens before (the result is discarded) or after the publish.
    fn process(&self, fetched: PollingResult<T>, previous: &mut Option<T>) -> TickOutcome {
        let snapshot = match fetched {
            Ok(snapshot) => snapshot,
            Err(e) => {
                if self.control.is_stopped() {
                    return TickOutcome::Discarded;
                }
                self.record_failure(&e);
                return TickOutcome::Failed;
            }
        };

        let change = self.config.score(previous.as_ref(), &snapshot);

        let stopped = self.control.stopped.lock();
        if *stopped {
            return TickOutcome::Discarded;
        }

        let adjustment = self.record_success(change);

        self.latest.send_replace(Some(snapshot.clone()));
        // No subscribers is fine; the latest value is still kept
        let _ = self.sender.send(snapshot.clone());
        self.state.write().emitted += 1;
        drop(stopped);

        *previous = Some(snapshot);
        TickOutcome::Published(adjustment)
    }

    fn record_success(&self, change: f64) -> Adjustment {
        let mut state = self.state.write();
        state.consecutive_failures = 0;

        let adjustment = state.policy.record(change);
        match adjustment {
            Adjustment::Shrunk { from, to } => {
                state.shrinks += 1;
                tracing::debug!(
                    "Activity on {} (change: {}), interval {:?} -> {:?}",
                    self.label,
                    change,
                    from,
                    to
                );
            }
            Adjustment::Grew { from, to } => {
                state.grows += 1;
                tracing::debug!(
                    "{} quiet, interval {:?} -> {:?}",
                    self.label,
                    from,
                    to
                );
            }
            Adjustment::Unchanged => {}
        }
        adjustment
    }

    fn record_failure(&self, error: &PollingError) {
        let attempt = {
            let mut state = self.state.write();
            state.failed_requests += 1;
            state.consecutive_failures += 1;
            state.last_error = Some(error.to_string());
            state.consecutive_failures
        };

        tracing::warn!(
            "Polling error for {} (attempt {}): {}",
            self.label,
            attempt,
            error
        );
    }
}

/// Build a recurring timer whose first tick fires at `start`
fn schedule(start: Instant, period: Duration) -> Interval {
    let mut ticker = tokio::time::interval_at(start, period.max(MIN_TIMER_PERIOD));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}
