//! Watches a simulated pending-samples queue with an adaptive poller.
//!
//! Run with `LABFLOW_LOG_MODE=development` to see interval changes:
//!
//! ```text
//! LABFLOW_LOG_MODE=development LABFLOW_LOG_LEVEL=labflow_poller=debug \
//!     cargo run -p labflow-poller --example queue_monitor
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use labflow_poller::logging::init_logging_from_env;
use labflow_poller::{
    count_delta, with_fallback, BoxError, PollingConfig, PollingService, PollingSettings,
    ServiceConfig, SnapshotSource,
};

#[derive(Debug, Clone)]
struct PendingSamples {
    total_records: u64,
}

/// Stand-in for the sample-intake backend: a burst of arrivals, then silence
struct SimulatedQueue {
    calls: AtomicU64,
}

#[async_trait::async_trait]
impl SnapshotSource<PendingSamples> for SimulatedQueue {
    async fn fetch(&self) -> Result<PendingSamples, BoxError> {
        let call = self.calls.fetch_add(1, Ordering::Relaxed);
        tokio::time::sleep(Duration::from_millis(50)).await;

        if call == 6 {
            return Err("intake backend timed out".into());
        }

        let total_records = match call {
            0..=3 => call * 20,
            _ => 60,
        };
        Ok(PendingSamples { total_records })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging_from_env()?;

    let service = PollingService::new(ServiceConfig::default().with_max_pollers(4))?;

    let settings = PollingSettings::default()
        .with_intervals(
            Duration::from_millis(300),
            Duration::from_millis(200),
            Duration::from_millis(600),
        )
        .with_thresholds(10.0, 3.0)
        .with_label("pending-samples");

    let queue: Arc<dyn SnapshotSource<PendingSamples>> = Arc::new(SimulatedQueue {
        calls: AtomicU64::new(0),
    });
    let source = with_fallback(queue, PendingSamples { total_records: 0 });
    let config = PollingConfig::from_source(settings, source)
        .with_change_detector(count_delta(|page: &PendingSamples| page.total_records as f64));

    let (id, poller) = service.create_polling(config)?;
    let mut data = poller.data();

    for _ in 0..16 {
        match data.next_timeout(Duration::from_secs(2)).await? {
            Some(page) => println!(
                "{} pending samples (next poll in {:?})",
                page.total_records,
                poller.interval()
            ),
            None => break,
        }
    }

    print!("{}", service.stats());
    service.stop_polling(id)?;
    poller.shutdown().await?;

    Ok(())
}
