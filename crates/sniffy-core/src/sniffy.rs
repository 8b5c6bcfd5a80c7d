use crate::aggregator::TrafficAggregator;
use crate::clock::{Clock, Sleeper, SystemClock, ThreadSleeper};
use crate::config::{ConfigError, SniffyConfig};
use crate::intercept::{
    Connector, DataSource, InstrumentedConnector, InstrumentedDataSource, InstrumentedStatement,
    SqlExecutor,
};
use crate::policy::PolicyRegistry;
use crate::spy::{Expectation, Spy};
use std::backtrace::Backtrace;
use std::sync::Arc;
use tracing::warn;

/// Entry point: owns the accounting store, the policy table and the time
/// sources, and hands out instrumented wrappers and spies bound to them.
///
/// Cloning is cheap; clones share all state. Independent instances do not
/// see each other's I/O.
#[derive(Clone)]
pub struct Sniffy {
    config: Arc<SniffyConfig>,
    aggregator: Arc<TrafficAggregator>,
    registry: Arc<PolicyRegistry>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn Sleeper>,
}

impl Sniffy {
    pub fn new(config: SniffyConfig) -> Self {
        let registry = match &config.registry_path {
            Some(path) => PolicyRegistry::open(path.clone()).unwrap_or_else(|e| {
                warn!(error = %e, path = %path.display(), "failed to load policy file, starting empty");
                let registry = PolicyRegistry::new();
                registry.set_storage_path(Some(path.clone()));
                registry
            }),
            None => PolicyRegistry::new(),
        };

        Self {
            aggregator: Arc::new(TrafficAggregator::from_config(&config)),
            registry: Arc::new(registry),
            clock: Arc::new(SystemClock::new()),
            sleeper: Arc::new(ThreadSleeper),
            config: Arc::new(config),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self::new(SniffyConfig::from_env()?))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_registry(mut self, registry: Arc<PolicyRegistry>) -> Self {
        self.registry = registry;
        self
    }

    pub fn config(&self) -> &SniffyConfig {
        &self.config
    }

    pub fn aggregator(&self) -> &Arc<TrafficAggregator> {
        &self.aggregator
    }

    pub fn registry(&self) -> &Arc<PolicyRegistry> {
        &self.registry
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn sleeper(&self) -> &dyn Sleeper {
        self.sleeper.as_ref()
    }

    /// Opens an observation window on the calling thread.
    pub fn spy(&self) -> Spy {
        Spy::new(self.clone())
    }

    pub fn expect(&self, expectation: Expectation) -> Spy {
        self.spy().expect(expectation)
    }

    pub fn connector<C: Connector>(&self, inner: C) -> InstrumentedConnector<C> {
        InstrumentedConnector::new(inner, self.clone())
    }

    pub fn statement<S: SqlExecutor>(&self, inner: S) -> InstrumentedStatement<S> {
        InstrumentedStatement::new(inner, self.clone())
    }

    pub fn data_source<D: DataSource>(&self, inner: D) -> InstrumentedDataSource<D> {
        InstrumentedDataSource::new(inner, self.clone())
    }

    pub(crate) fn now_nanos(&self) -> u64 {
        self.clock.now_nanos()
    }

    pub(crate) fn capture_stack_trace(&self) -> Option<Arc<str>> {
        if !self.config.capture_stack_traces {
            return None;
        }
        let trace = Backtrace::force_capture().to_string();
        Some(self.aggregator.interner().intern(&trace))
    }
}

impl Default for Sniffy {
    fn default() -> Self {
        Self::new(SniffyConfig::default())
    }
}

impl std::fmt::Debug for Sniffy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sniffy")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
