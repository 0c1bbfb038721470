//! # labflow-poller
//!
//! A self-tuning polling engine for the labflow queue and sample-status views.
//!
//! A poller fetches a snapshot on a timer, scores how much it changed since
//! the previous one and retunes its own interval between a minimum and a
//! maximum: busy data halves the interval, five quiet ticks in a row grow it
//! by half. Every snapshot is published to any number of subscribers.
//!
//! ```rust,ignore
//! use labflow_poller::{count_delta, PollingConfig, PollingInstance, PollingSettings};
//!
//! let config = PollingConfig::new(PollingSettings::default(), || async {
//!     client.pending_samples().await
//! })
//! .with_change_detector(count_delta(|page: &Page| page.total_records as f64));
//!
//! let poller = PollingInstance::new(config);
//! let mut data = poller.data();
//! while let Some(page) = data.next_async().await {
//!     render(page);
//! }
//! ```

pub mod config;
pub mod detect;
pub mod error;
pub mod instance;
pub mod logging;
pub mod policy;
pub mod service;
pub mod source;
pub mod stream;

pub use config::{ChangeDetectorFn, PollingConfig, PollingSettings};
pub use detect::{count_delta, value_changed};
pub use error::{BoxError, PollingError, PollingResult};
pub use instance::{PollingInstance, PollingStats};
pub use policy::{Activity, AdaptiveInterval, Adjustment, QUIET_TICKS_TO_GROW};
pub use service::{PollerId, PollingService, PollingServiceStats, ServiceConfig};
pub use source::{with_fallback, FallbackSource, SnapshotSource};
pub use stream::{BlockingSnapshots, SnapshotStream};
