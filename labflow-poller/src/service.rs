//! Poller factory and registry
//!
//! [`PollingService`] creates pollers on behalf of views and keeps a weak
//! handle to each one, so it can report on them and stop them without
//! extending their lifetime. Pollers share nothing with each other.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;

use dashmap::DashMap;

use crate::config::PollingConfig;
use crate::error::{PollingError, PollingResult};
use crate::instance::{ManagedPoller, PollingInstance, PollingStats};

/// Unique identifier for a poller created by a [`PollingService`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PollerId(u64);

impl PollerId {
    /// Create a new PollerId with the given value
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PollerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "poller-{}", self.0)
    }
}

/// Configuration for the [`PollingService`]
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Maximum number of live pollers
    /// Default: 50
    pub max_pollers: usize,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self { max_pollers: 50 }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> PollingResult<()> {
        if self.max_pollers == 0 {
            return Err(PollingError::Configuration(
                "Max pollers must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn with_max_pollers(mut self, max_pollers: usize) -> Self {
        self.max_pollers = max_pollers;
        self
    }
}

/// Creates and tracks pollers
pub struct PollingService {
    /// Live pollers indexed by id
    pollers: DashMap<PollerId, Weak<dyn ManagedPoller>>,

    /// Counter for generating unique poller ids
    next_id: AtomicU64,

    config: ServiceConfig,
}

impl PollingService {
    pub fn new(config: ServiceConfig) -> PollingResult<Self> {
        config.validate()?;
        Ok(Self {
            pollers: DashMap::new(),
            next_id: AtomicU64::new(1),
            config,
        })
    }

    /// Validate the config, then start a new poller
    ///
    /// # Panics
    ///
    /// Panics when called outside of a tokio runtime.
    pub fn create_polling<T>(
        &self,
        config: PollingConfig<T>,
    ) -> PollingResult<(PollerId, PollingInstance<T>)>
    where
        T: Clone + Send + Sync + 'static,
    {
        config.settings().validate()?;

        self.prune();
        if self.pollers.len() >= self.config.max_pollers {
            return Err(PollingError::TooManyPollers {
                limit: self.config.max_pollers,
            });
        }

        let id = PollerId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let instance = PollingInstance::new(config);
        self.pollers.insert(id, instance.downgrade());

        tracing::info!("Created {} for {}", id, instance.label());
        Ok((id, instance))
    }

    /// Stop a poller by id
    pub fn stop_polling(&self, id: PollerId) -> PollingResult<()> {
        let (_, poller) = self
            .pollers
            .remove(&id)
            .ok_or(PollingError::PollerNotFound(id))?;

        match poller.upgrade() {
            Some(poller) => {
                poller.stop();
                Ok(())
            }
            None => Err(PollingError::PollerNotFound(id)),
        }
    }

    /// Whether a poller is registered and still polling
    pub fn is_polling(&self, id: PollerId) -> bool {
        self.pollers
            .get(&id)
            .and_then(|poller| poller.upgrade())
            .is_some_and(|poller| !poller.is_stopped())
    }

    /// Number of live pollers
    pub fn active_count(&self) -> usize {
        self.prune();
        self.pollers.len()
    }

    /// Stop every registered poller
    pub fn stop_all(&self) {
        let ids: Vec<PollerId> = self.pollers.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Err(e) = self.stop_polling(id) {
                tracing::debug!("Skipping {}: {}", id, e);
            }
        }
    }

    pub fn stats(&self) -> PollingServiceStats {
        self.prune();
        let mut pollers: Vec<(PollerId, PollingStats)> = self
            .pollers
            .iter()
            .filter_map(|entry| {
                let poller = entry.value().upgrade()?;
                Some((*entry.key(), poller.stats()))
            })
            .collect();
        pollers.sort_by_key(|(id, _)| id.as_u64());

        PollingServiceStats {
            active_pollers: pollers.len(),
            max_pollers: self.config.max_pollers,
            pollers,
        }
    }

    /// Forget pollers that were stopped or dropped
    fn prune(&self) {
        self.pollers.retain(|_, poller| {
            poller
                .upgrade()
                .is_some_and(|poller| !poller.is_stopped())
        });
    }
}

impl Default for PollingService {
    fn default() -> Self {
        Self {
            pollers: DashMap::new(),
            next_id: AtomicU64::new(1),
            config: ServiceConfig::default(),
        }
    }
}

/// Statistics for the polling service
#[derive(Debug)]
pub struct PollingServiceStats {
    pub active_pollers: usize,
    pub max_pollers: usize,
    pub pollers: Vec<(PollerId, PollingStats)>,
}

impl fmt::Display for PollingServiceStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Polling Service Stats:")?;
        writeln!(
            f,
            "  Active pollers: {}/{}",
            self.active_pollers, self.max_pollers
        )?;

        for (id, stats) in &self.pollers {
            writeln!(f, "    {}: {}", id, stats)?;
        }

        Ok(())
    }
}
