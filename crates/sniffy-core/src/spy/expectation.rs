use crate::identity::{AddressMatcher, StatementKind};
use crate::thread::ThreadScope;
use serde::Serialize;
use std::fmt;

/// What an expectation counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Executions of statements of this kind (`Any` excludes `System`).
    Statements(StatementKind),
    /// Distinct connections to matching addresses.
    Connections(AddressMatcher),
}

impl Default for Target {
    fn default() -> Self {
        Target::Statements(StatementKind::Any)
    }
}

/// Raw expectation parameters, validated by [`Expectation::new`].
///
/// Counts are given either as `exact` or as a `min`/`max` range; a missing
/// bound is open. The same applies to the `*_rows` fields, which only make
/// sense for statement targets.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectationSpec {
    pub target: Target,
    pub exact: Option<u64>,
    pub min: Option<u64>,
    pub max: Option<u64>,
    pub exact_rows: Option<u64>,
    pub min_rows: Option<u64>,
    pub max_rows: Option<u64>,
    pub threads: ThreadScope,
}

impl ExpectationSpec {
    pub fn statements(kind: StatementKind) -> Self {
        Self {
            target: Target::Statements(kind),
            ..Default::default()
        }
    }

    pub fn connections(matcher: AddressMatcher) -> Self {
        Self {
            target: Target::Connections(matcher),
            ..Default::default()
        }
    }
}

/// Inclusive range of acceptable observed values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CountRange {
    pub min: u64,
    pub max: u64,
}

impl CountRange {
    pub fn exact(n: u64) -> Self {
        Self { min: n, max: n }
    }

    pub fn contains(&self, value: u64) -> bool {
        self.min <= value && value <= self.max
    }
}

impl fmt::Display for CountRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.max == u64::MAX {
            write!(f, "at least {}", self.min)
        } else {
            write!(f, "between {} and {}", self.min, self.max)
        }
    }
}

/// Error type for contradictory or incomplete expectation parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    /// `exact` given together with `min` or `max`.
    ExactWithRange { field: &'static str },
    /// `max` below `min`.
    InvertedRange { field: &'static str, min: u64, max: u64 },
    /// Neither `exact`, `min` nor `max` given for the count.
    Unconstrained,
    /// Row bounds on a connection target.
    RowsOnConnections,
}

impl fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigurationError::ExactWithRange { field } => {
                write!(f, "exact {} cannot be combined with min/max", field)
            }
            ConfigurationError::InvertedRange { field, min, max } => {
                write!(f, "max {} ({}) cannot be less than min ({})", field, max, min)
            }
            ConfigurationError::Unconstrained => {
                write!(f, "expectation needs an exact count, a min or a max")
            }
            ConfigurationError::RowsOnConnections => {
                write!(f, "row counts only apply to statement expectations")
            }
        }
    }
}

impl std::error::Error for ConfigurationError {}

/// A validated assertion about I/O observed inside a spy's window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expectation {
    target: Target,
    count: CountRange,
    rows: Option<CountRange>,
    threads: ThreadScope,
}

impl Expectation {
    pub fn new(spec: ExpectationSpec) -> Result<Self, ConfigurationError> {
        let count = range("count", spec.exact, spec.min, spec.max)?
            .ok_or(ConfigurationError::Unconstrained)?;
        let rows = range("rows", spec.exact_rows, spec.min_rows, spec.max_rows)?;
        if rows.is_some() && matches!(spec.target, Target::Connections(_)) {
            return Err(ConfigurationError::RowsOnConnections);
        }

        Ok(Self {
            target: spec.target,
            count,
            rows,
            threads: spec.threads,
        })
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    pub fn count(&self) -> CountRange {
        self.count
    }

    pub fn rows(&self) -> Option<CountRange> {
        self.rows
    }

    pub fn threads(&self) -> ThreadScope {
        self.threads
    }
}

fn range(
    field: &'static str,
    exact: Option<u64>,
    min: Option<u64>,
    max: Option<u64>,
) -> Result<Option<CountRange>, ConfigurationError> {
    match (exact, min, max) {
        (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
            Err(ConfigurationError::ExactWithRange { field })
        }
        (Some(n), None, None) => Ok(Some(CountRange::exact(n))),
        (None, None, None) => Ok(None),
        (None, min, max) => {
            let min = min.unwrap_or(0);
            let max = max.unwrap_or(u64::MAX);
            if max < min {
                return Err(ConfigurationError::InvertedRange { field, min, max });
            }
            Ok(Some(CountRange { min, max }))
        }
    }
}

impl fmt::Display for Expectation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            Target::Statements(kind) => {
                let kind = match kind {
                    StatementKind::Any => String::new(),
                    kind => format!("{} ", kind),
                };
                write!(f, "{} {}queries", self.count, kind)?;
                if let Some(rows) = self.rows {
                    write!(f, " affecting {} rows", rows)?;
                }
            }
            Target::Connections(matcher) => {
                write!(f, "{} connections to {}", self.count, matcher)?;
            }
        }
        write!(f, " on {}", self.threads.describe())
    }
}
