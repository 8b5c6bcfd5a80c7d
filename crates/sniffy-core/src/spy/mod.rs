//! Observation windows and expectations over them.
//!
//! A [`Spy`] snapshots every counter and packet list when it is opened. On
//! close it diffs the current state against that baseline and checks each
//! registered [`Expectation`] against the difference.

mod expectation;
mod verify;

pub use expectation::{ConfigurationError, CountRange, Expectation, ExpectationSpec, Target};
pub use verify::{ExpectationResult, FailureKind, ObservedEvent, VerificationError};

use crate::identity::{AddressMatcher, ConnectionIdentity, StatementIdentity, StatementKind};
use crate::query::{self, GroupingOptions, TrafficKey};
use crate::sniffy::Sniffy;
use crate::stats::StatsValues;
use crate::thread::{ThreadMeta, ThreadScope};
use crate::traffic::{NetworkPacket, TrafficPosition};
use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, warn};
use verify::Observation;

/// Error type for operations on a spy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpyError {
    /// The spy was already closed.
    Closed,
    Verification(VerificationError),
}

impl fmt::Display for SpyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpyError::Closed => write!(f, "spy is already closed"),
            SpyError::Verification(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SpyError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpyError::Closed => None,
            SpyError::Verification(e) => Some(e),
        }
    }
}

impl From<VerificationError> for SpyError {
    fn from(e: VerificationError) -> Self {
        SpyError::Verification(e)
    }
}

/// Failure of a scope run through [`Spy::execute`].
#[derive(Debug)]
pub enum ScopeError<E> {
    /// The body failed; a verification failure observed while closing the
    /// spy is kept as secondary information.
    Body {
        error: E,
        suppressed: Option<VerificationError>,
    },
    /// The body succeeded but expectations did not hold.
    Verification(VerificationError),
}

impl<E: fmt::Display> fmt::Display for ScopeError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeError::Body { error, suppressed } => {
                write!(f, "{}", error)?;
                if suppressed.is_some() {
                    write!(f, " (expectations also failed)")?;
                }
                Ok(())
            }
            ScopeError::Verification(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ScopeError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ScopeError::Body { error, .. } => Some(error),
            ScopeError::Verification(e) => Some(e),
        }
    }
}

struct Baseline {
    statements: HashMap<StatementIdentity, StatsValues>,
    sockets: HashMap<ConnectionIdentity, StatsValues>,
    traffic: HashMap<ConnectionIdentity, TrafficPosition>,
}

impl Baseline {
    fn capture(sniffy: &Sniffy) -> Self {
        let aggregator = sniffy.aggregator();
        Self {
            statements: aggregator.statements(|_| true),
            sockets: aggregator.sockets(|_| true),
            traffic: aggregator.traffic_positions(),
        }
    }
}

/// Observation window opened by [`Sniffy::spy`].
///
/// Dropping a spy that was never closed verifies it and panics on failure,
/// unless the thread is already unwinding.
pub struct Spy {
    sniffy: Sniffy,
    creator: ThreadMeta,
    baseline: Baseline,
    expectations: Vec<Expectation>,
    closed: bool,
    results: Vec<ExpectationResult>,
}

impl Spy {
    pub(crate) fn new(sniffy: Sniffy) -> Self {
        Self {
            creator: ThreadMeta::current(),
            baseline: Baseline::capture(&sniffy),
            expectations: Vec::new(),
            closed: false,
            results: Vec::new(),
            sniffy,
        }
    }

    /// Registers an expectation checked on close.
    ///
    /// Expectations added after close are ignored with a warning; use
    /// [`Spy::add_expectation`] to get an error instead.
    pub fn expect(mut self, expectation: Expectation) -> Self {
        if let Err(e) = self.add_expectation(expectation) {
            warn!(error = %e, "expectation ignored");
        }
        self
    }

    pub fn add_expectation(&mut self, expectation: Expectation) -> Result<(), SpyError> {
        self.check_open()?;
        self.expectations.push(expectation);
        Ok(())
    }

    pub fn expectations(&self) -> &[Expectation] {
        &self.expectations
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Thread that opened the window; `ThreadScope::Current` refers to it.
    pub fn creator(&self) -> &ThreadMeta {
        &self.creator
    }

    /// Moves the start of the window to now. Expectations are kept; I/O
    /// recorded before the reset no longer counts towards them.
    pub fn reset(&mut self) -> Result<(), SpyError> {
        self.check_open()?;
        self.baseline = Baseline::capture(&self.sniffy);
        debug!("spy window reset");
        Ok(())
    }

    fn check_open(&self) -> Result<(), SpyError> {
        if self.closed {
            return Err(SpyError::Closed);
        }
        Ok(())
    }

    fn statement_deltas(&self) -> HashMap<StatementIdentity, StatsValues> {
        deltas(
            self.sniffy.aggregator().statements(|_| true),
            &self.baseline.statements,
        )
    }

    fn socket_deltas(&self) -> HashMap<ConnectionIdentity, StatsValues> {
        deltas(self.sniffy.aggregator().sockets(|_| true), &self.baseline.sockets)
    }

    /// Checks one expectation against the window so far, without closing.
    pub fn verify(&self, expectation: &Expectation) -> Result<(), SpyError> {
        self.check_open()?;
        let statements = self.statement_deltas();
        let sockets = self.socket_deltas();
        let result = verify::evaluate(
            expectation,
            &Observation {
                creator: &self.creator,
                statements: &statements,
                sockets: &sockets,
            },
        );
        if result.passed() {
            Ok(())
        } else {
            Err(VerificationError::new(vec![result]).into())
        }
    }

    /// Ends the window and checks every expectation. Closing again is a no-op.
    pub fn close(&mut self) -> Result<(), VerificationError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let statements = self.statement_deltas();
        let sockets = self.socket_deltas();
        let observation = Observation {
            creator: &self.creator,
            statements: &statements,
            sockets: &sockets,
        };
        self.results = self
            .expectations
            .iter()
            .map(|e| verify::evaluate(e, &observation))
            .collect();

        let failures: Vec<ExpectationResult> =
            self.results.iter().filter(|r| !r.passed()).cloned().collect();
        if failures.is_empty() {
            return Ok(());
        }
        debug!(failed = failures.len(), total = self.results.len(), "expectations failed");
        Err(VerificationError::new(failures))
    }

    /// Outcomes of the checks done on close; empty while open.
    pub fn results(&self) -> &[ExpectationResult] {
        &self.results
    }

    /// Runs `body`, then closes the spy.
    ///
    /// If `body` panics the spy is still closed and the panic continues with
    /// its original payload. A verification failure found on the way out is
    /// only logged at `warn`; use [`Spy::execute`] to get it back as a value.
    pub fn run<T, F>(mut self, body: F) -> Result<T, VerificationError>
    where
        F: FnOnce() -> T,
    {
        match panic::catch_unwind(AssertUnwindSafe(body)) {
            Ok(value) => self.close().map(|()| value),
            Err(payload) => {
                if let Err(e) = self.close() {
                    warn!(error = %e, "expectations failed in a scope that panicked");
                }
                panic::resume_unwind(payload)
            }
        }
    }

    /// Runs a fallible `body`, then closes the spy. A body error wins over a
    /// verification failure, which is kept in [`ScopeError::Body`].
    pub fn execute<T, E, F>(mut self, body: F) -> Result<T, ScopeError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        match body() {
            Ok(value) => self.close().map(|()| value).map_err(ScopeError::Verification),
            Err(error) => {
                let suppressed = self.close().err();
                if let Some(e) = &suppressed {
                    warn!(error = %e, "expectations failed in a scope that returned an error");
                }
                Err(ScopeError::Body { error, suppressed })
            }
        }
    }

    /// Statements executed in the window.
    pub fn executed_statements(
        &self,
        scope: ThreadScope,
        remove_stack_traces: bool,
    ) -> HashMap<StatementIdentity, StatsValues> {
        query::filter_statements(
            self.statement_deltas(),
            scope,
            &self.creator,
            remove_stack_traces,
        )
    }

    /// Number of executions of `kind` in the window.
    pub fn executed_statement_count(&self, kind: StatementKind, scope: ThreadScope) -> u64 {
        self.executed_statements(scope, true)
            .iter()
            .filter(|(id, _)| kind.matches(id.kind))
            .map(|(_, v)| v.operations)
            .sum()
    }

    /// Connection activity in the window.
    pub fn socket_operations(
        &self,
        scope: ThreadScope,
        matcher: &AddressMatcher,
        remove_stack_traces: bool,
    ) -> HashMap<ConnectionIdentity, StatsValues> {
        query::filter_sockets(
            self.socket_deltas(),
            scope,
            &self.creator,
            matcher,
            remove_stack_traces,
        )
    }

    /// Packets exchanged in the window, grouped by `options`.
    pub fn network_traffic(
        &self,
        scope: ThreadScope,
        matcher: &AddressMatcher,
        options: GroupingOptions,
    ) -> Vec<(TrafficKey, Vec<NetworkPacket>)> {
        let aggregator = self.sniffy.aggregator();
        query::group_traffic(
            aggregator.traffic_since(&self.baseline.traffic),
            scope,
            &self.creator,
            matcher,
            options,
            aggregator.merge_threshold_nanos(),
        )
    }
}

impl Drop for Spy {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        if let Err(e) = self.close() {
            if std::thread::panicking() {
                warn!(error = %e, "expectations failed while unwinding");
            } else {
                panic!("{}", e);
            }
        }
    }
}

fn deltas<K>(
    current: HashMap<K, StatsValues>,
    baseline: &HashMap<K, StatsValues>,
) -> HashMap<K, StatsValues>
where
    K: Eq + Hash,
{
    current
        .into_iter()
        .filter_map(|(id, values)| {
            let delta = match baseline.get(&id) {
                Some(before) => values.since(before),
                None => values,
            };
            (!delta.is_empty()).then_some((id, delta))
        })
        .collect()
}
