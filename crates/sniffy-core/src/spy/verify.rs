//! Evaluation of expectations against the I/O observed in a window.

use super::expectation::{Expectation, Target};
use crate::identity::{ConnectionIdentity, SocketAddress, StatementIdentity};
use crate::stats::StatsValues;
use crate::thread::ThreadMeta;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// One line of failure diagnostics: a statement or a connection seen in
/// the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedEvent {
    pub description: String,
    pub count: u64,
    pub thread: ThreadMeta,
    pub stack_trace: Option<Arc<str>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Count,
    Rows,
}

/// Outcome of one expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpectationResult {
    pub expectation: Expectation,
    pub observed: u64,
    /// Rows affected; only computed for statement targets.
    pub observed_rows: Option<u64>,
    pub events: Vec<ObservedEvent>,
    pub failure: Option<FailureKind>,
}

impl ExpectationResult {
    pub fn passed(&self) -> bool {
        self.failure.is_none()
    }
}

impl fmt::Display for ExpectationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Expected {}", self.expectation)?;
        let unit = match self.expectation.target() {
            Target::Statements(_) => "queries",
            Target::Connections(_) => "connections",
        };
        match self.failure {
            Some(FailureKind::Rows) => writeln!(
                f,
                "Observed {} {} affecting {} rows instead:",
                self.observed,
                unit,
                self.observed_rows.unwrap_or(0)
            )?,
            _ => writeln!(f, "Observed {} {} instead:", self.observed, unit)?,
        }
        for event in &self.events {
            if event.count > 1 {
                writeln!(f, "  {} /*{} times*/", event.description, event.count)?;
            } else {
                writeln!(f, "  {}", event.description)?;
            }
            if let Some(trace) = &event.stack_trace {
                for line in trace.lines() {
                    writeln!(f, "      {}", line.trim_end())?;
                }
            }
        }
        Ok(())
    }
}

/// One or more expectations did not hold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationError {
    failures: Vec<ExpectationResult>,
}

impl VerificationError {
    pub(crate) fn new(failures: Vec<ExpectationResult>) -> Self {
        Self { failures }
    }

    pub fn failures(&self) -> &[ExpectationResult] {
        &self.failures
    }
}

impl fmt::Display for VerificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, failure) in self.failures.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for VerificationError {}

/// Counter deltas of a window, as seen from the thread that opened it.
pub(crate) struct Observation<'a> {
    pub creator: &'a ThreadMeta,
    pub statements: &'a HashMap<StatementIdentity, StatsValues>,
    pub sockets: &'a HashMap<ConnectionIdentity, StatsValues>,
}

pub(crate) fn evaluate(expectation: &Expectation, observation: &Observation<'_>) -> ExpectationResult {
    let (observed, observed_rows, events) = match expectation.target() {
        Target::Statements(kind) => {
            let mut observed = 0;
            let mut rows = 0;
            let mut events = Vec::new();
            for (id, delta) in observation.statements {
                if delta.operations == 0
                    || !kind.matches(id.kind)
                    || !expectation.threads().matches(&id.owner_thread, observation.creator)
                {
                    continue;
                }
                observed += delta.operations;
                rows += delta.rows_affected;
                events.push(ObservedEvent {
                    description: id.sql.to_string(),
                    count: delta.operations,
                    thread: id.owner_thread.clone(),
                    stack_trace: id.stack_trace.clone(),
                });
            }
            events.sort_by(|a, b| a.description.cmp(&b.description));
            (observed, Some(rows), events)
        }
        Target::Connections(matcher) => {
            let mut connections: BTreeMap<(SocketAddress, u32), (StatsValues, &ConnectionIdentity)> =
                BTreeMap::new();
            for (id, delta) in observation.sockets {
                if delta.operations == 0
                    || !matcher.matches(&id.address)
                    || !expectation.threads().matches(&id.owner_thread, observation.creator)
                {
                    continue;
                }
                let entry = connections
                    .entry((id.address.clone(), id.ordinal))
                    .or_insert((StatsValues::default(), id));
                entry.0 += *delta;
                if entry.1.stack_trace.is_none() && id.stack_trace.is_some() {
                    entry.1 = id;
                }
            }
            let events = connections
                .into_values()
                .map(|(total, id)| ObservedEvent {
                    description: format!(
                        "{} sent {} bytes and received {} bytes",
                        id, total.bytes_sent, total.bytes_received
                    ),
                    count: 1,
                    thread: id.owner_thread.clone(),
                    stack_trace: id.stack_trace.clone(),
                })
                .collect::<Vec<_>>();
            (events.len() as u64, None, events)
        }
    };

    let failure = if !expectation.count().contains(observed) {
        Some(FailureKind::Count)
    } else if let (Some(range), Some(rows)) = (expectation.rows(), observed_rows)
        && !range.contains(rows)
    {
        Some(FailureKind::Rows)
    } else {
        None
    };

    ExpectationResult {
        expectation: expectation.clone(),
        observed,
        observed_rows,
        events,
        failure,
    }
}
