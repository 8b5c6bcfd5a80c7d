use super::traits::{DataSource, SqlExecutor};
use crate::identity::{StatementIdentity, StatementKind, normalize_sql};
use crate::policy::PolicyRefusal;
use crate::sniffy::Sniffy;
use crate::stats::StatsValues;
use crate::thread::ThreadMeta;
use std::fmt;
use tracing::debug;

/// SQL recorded for data source connection attempts.
pub const DATA_SOURCE_CONNECT: &str = "DataSource.connect";

/// Executor wrapper that accounts every statement: normalized text, kind,
/// elapsed time and rows.
pub struct InstrumentedStatement<S> {
    inner: S,
    sniffy: Sniffy,
    batch: Vec<String>,
}

impl<S: SqlExecutor> InstrumentedStatement<S> {
    pub fn new(inner: S, sniffy: Sniffy) -> Self {
        Self {
            inner,
            sniffy,
            batch: Vec::new(),
        }
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    /// Queues a statement for [`InstrumentedStatement::execute_pending_batch`].
    pub fn add_batch(&mut self, sql: impl Into<String>) {
        self.batch.push(sql.into());
    }

    pub fn clear_batch(&mut self) {
        self.batch.clear();
    }

    pub fn pending_batch(&self) -> &[String] {
        &self.batch
    }

    /// Executes and clears the queued statements as one batch.
    pub fn execute_pending_batch(&mut self) -> Result<Vec<u64>, S::Error> {
        let batch = std::mem::take(&mut self.batch);
        self.execute_batch(&batch)
    }

    /// Times a driver call that is not a SQL statement (commit, ping, ...)
    /// and records it as a `System` statement named `name`.
    pub fn system_call<T, E, F>(&mut self, name: &str, call: F) -> Result<T, E>
    where
        F: FnOnce(&mut S) -> Result<T, E>,
    {
        self.timed(name, Some(StatementKind::System), call, |_| 0)
    }

    fn timed<T, E, F, R>(
        &mut self,
        sql: &str,
        kind: Option<StatementKind>,
        call: F,
        rows: R,
    ) -> Result<T, E>
    where
        F: FnOnce(&mut S) -> Result<T, E>,
        R: FnOnce(&T) -> u64,
    {
        let start = self.sniffy.now_nanos();
        let result = call(&mut self.inner);
        let elapsed = self.sniffy.now_nanos().saturating_sub(start);

        let rows = result.as_ref().map_or(0, rows);
        record_statement(&self.sniffy, sql, kind, elapsed, rows);
        result
    }
}

impl<S: SqlExecutor> SqlExecutor for InstrumentedStatement<S> {
    type Row = S::Row;
    type Error = S::Error;

    fn query(&mut self, sql: &str) -> Result<Vec<Self::Row>, Self::Error> {
        self.timed(sql, None, |inner| inner.query(sql), |rows| rows.len() as u64)
    }

    fn execute(&mut self, sql: &str) -> Result<u64, Self::Error> {
        self.timed(sql, None, |inner| inner.execute(sql), |count| *count)
    }

    fn execute_batch(&mut self, batch: &[String]) -> Result<Vec<u64>, Self::Error> {
        let sql = describe_batch(batch);
        self.timed(
            &sql,
            None,
            |inner| inner.execute_batch(batch),
            |counts| counts.iter().sum(),
        )
    }
}

fn record_statement(
    sniffy: &Sniffy,
    sql: &str,
    kind: Option<StatementKind>,
    elapsed_nanos: u64,
    rows: u64,
) {
    if !sniffy.config().monitor_jdbc {
        return;
    }
    let aggregator = sniffy.aggregator();
    let normalized = normalize_sql(sql);
    let identity = StatementIdentity {
        kind: kind.unwrap_or_else(|| StatementKind::classify(&normalized)),
        sql: aggregator.interner().intern(&normalized),
        owner_thread: ThreadMeta::current(),
        stack_trace: sniffy.capture_stack_trace(),
    };
    aggregator.record_statement(&identity, &StatsValues::operation(elapsed_nanos).with_rows(rows));
}

/// Text under which a batch is accounted: distinct statements in first-seen
/// order, joined with `"; "`, each repeated one annotated as `/*N times*/`.
pub fn describe_batch(batch: &[String]) -> String {
    let mut distinct: Vec<(&str, usize)> = Vec::new();
    for sql in batch {
        match distinct.iter_mut().find(|(s, _)| *s == sql.as_str()) {
            Some((_, count)) => *count += 1,
            None => distinct.push((sql.as_str(), 1)),
        }
    }

    distinct
        .iter()
        .map(|(sql, count)| {
            if *count > 1 {
                format!("{} /*{} times*/", sql, count)
            } else {
                sql.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Error type for instrumented data source connections.
#[derive(Debug)]
pub enum DataSourceError<E> {
    /// Refused by the data source policy; the delegate was not called.
    Refused(PolicyRefusal),
    Delegate(E),
}

impl<E: fmt::Display> fmt::Display for DataSourceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataSourceError::Refused(refusal) => write!(f, "{}", refusal),
            DataSourceError::Delegate(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for DataSourceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DataSourceError::Refused(refusal) => Some(refusal),
            DataSourceError::Delegate(e) => Some(e),
        }
    }
}

/// Data source wrapper that enforces the data source policy and returns
/// instrumented connections.
pub struct InstrumentedDataSource<D> {
    inner: D,
    sniffy: Sniffy,
}

impl<D: DataSource> InstrumentedDataSource<D> {
    pub fn new(inner: D, sniffy: Sniffy) -> Self {
        Self { inner, sniffy }
    }

    pub fn get_ref(&self) -> &D {
        &self.inner
    }

    pub fn url(&self) -> &str {
        self.inner.url()
    }

    pub fn user(&self) -> Option<&str> {
        self.inner.user()
    }

    pub fn connect(
        &self,
    ) -> Result<InstrumentedStatement<D::Connection>, DataSourceError<D::Error>> {
        let url = self.inner.url();
        let user = self.inner.user();
        let status = self.sniffy.registry().resolve_data_source(url, user);
        if let Some(delay) = status.delay() {
            self.sniffy.sleeper().sleep(delay);
        }
        if status.is_refused() {
            debug!(url = url, user = ?user, status = %status, "data source refused by policy");
            return Err(DataSourceError::Refused(PolicyRefusal::data_source(url, user)));
        }

        let start = self.sniffy.now_nanos();
        let result = self.inner.connect();
        let elapsed = self.sniffy.now_nanos().saturating_sub(start);
        record_statement(
            &self.sniffy,
            DATA_SOURCE_CONNECT,
            Some(StatementKind::System),
            elapsed,
            0,
        );

        result
            .map(|connection| InstrumentedStatement::new(connection, self.sniffy.clone()))
            .map_err(DataSourceError::Delegate)
    }
}

impl<D: DataSource> DataSource for InstrumentedDataSource<D> {
    type Connection = InstrumentedStatement<D::Connection>;
    type Error = DataSourceError<D::Error>;

    fn url(&self) -> &str {
        self.inner.url()
    }

    fn user(&self) -> Option<&str> {
        self.inner.user()
    }

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        InstrumentedDataSource::connect(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SniffyConfig;
    use crate::intercept::{MockDataSource, MockExecutor};
    use crate::policy::PolicyStatus;
    use std::collections::HashMap;

    /// Recorded statements with call sites folded together.
    fn statements(sniffy: &Sniffy) -> Vec<(StatementIdentity, StatsValues)> {
        let mut grouped: HashMap<StatementIdentity, StatsValues> = HashMap::new();
        for (id, values) in sniffy.aggregator().statements(|_| true) {
            *grouped.entry(id.without_stack_trace()).or_default() += values;
        }
        let mut all: Vec<_> = grouped.into_iter().collect();
        all.sort_by(|a, b| a.0.sql.cmp(&b.0.sql));
        all
    }

    #[test]
    fn test_describe_batch() {
        let batch: Vec<String> = ["INSERT INTO a VALUES (?)", "UPDATE b SET x = ?", "INSERT INTO a VALUES (?)", "INSERT INTO a VALUES (?)"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(
            describe_batch(&batch),
            "INSERT INTO a VALUES (?) /*3 times*/; UPDATE b SET x = ?"
        );
        assert_eq!(describe_batch(&[]), "");
    }

    #[test]
    fn test_query_and_execute_recorded() {
        let sniffy = Sniffy::default();
        let mock = MockExecutor::new()
            .with_rows("SELECT * FROM t", 3)
            .with_update_count("DELETE FROM t", 7);
        let mut stmt = sniffy.statement(mock);

        assert_eq!(stmt.query("SELECT * FROM t").unwrap().len(), 3);
        assert_eq!(stmt.execute("DELETE FROM t").unwrap(), 7);

        let all = statements(&sniffy);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0.kind, StatementKind::Delete);
        assert_eq!(all[0].1.rows_affected, 7);
        assert_eq!(all[1].0.kind, StatementKind::Select);
        assert_eq!(all[1].1.rows_affected, 3);
        assert_eq!(all[1].1.operations, 1);
    }

    #[test]
    fn test_in_lists_share_identity() {
        let sniffy = Sniffy::default();
        let mut stmt = sniffy.statement(MockExecutor::new());
        stmt.query("select * from t where id in (?, ?)").unwrap();
        stmt.query("select * from t where id in (?, ?, ?)").unwrap();

        let all = statements(&sniffy);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0.sql.as_ref(), "select * from t where id in (?)");
        assert_eq!(all[0].1.operations, 2);
    }

    #[test]
    fn test_failed_execution_still_recorded() {
        let sniffy = Sniffy::default();
        let mut stmt = sniffy.statement(MockExecutor::new().failing_on("UPDATE t SET a = 1"));
        assert!(stmt.execute("UPDATE t SET a = 1").is_err());

        let all = statements(&sniffy);
        assert_eq!(all[0].1.operations, 1);
        assert_eq!(all[0].1.rows_affected, 0);
    }

    #[test]
    fn test_pending_batch() {
        let sniffy = Sniffy::default();
        let mut stmt = sniffy.statement(MockExecutor::new().with_update_count("INSERT INTO t VALUES (?)", 1));
        stmt.add_batch("INSERT INTO t VALUES (?)");
        stmt.add_batch("INSERT INTO t VALUES (?)");
        assert_eq!(stmt.execute_pending_batch().unwrap(), vec![1, 1]);
        assert!(stmt.pending_batch().is_empty());

        let all = statements(&sniffy);
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0.sql.as_ref(), "INSERT INTO t VALUES (?) /*2 times*/");
        assert_eq!(all[0].0.kind, StatementKind::Insert);
        assert_eq!(all[0].1.rows_affected, 2);
        assert_eq!(all[0].1.operations, 1);
        assert_eq!(stmt.get_ref().executed().len(), 2);
    }

    #[test]
    fn test_system_call() {
        let sniffy = Sniffy::default();
        let mut stmt = sniffy.statement(MockExecutor::new());
        let out: Result<u8, ()> = stmt.system_call("Connection.commit", |_| Ok(5));
        assert_eq!(out, Ok(5));

        let all = statements(&sniffy);
        assert_eq!(all[0].0.kind, StatementKind::System);
        assert_eq!(all[0].0.sql.as_ref(), "Connection.commit");
    }

    #[test]
    fn test_data_source_refused() {
        let sniffy = Sniffy::default();
        sniffy
            .registry()
            .set_data_source_status(Some("jdbc:h2:mem:"), None, PolicyStatus::Closed);
        let ds = sniffy.data_source(MockDataSource::new("jdbc:h2:mem:", Some("sa")));

        let err = ds.connect().err().unwrap();
        assert!(matches!(err, DataSourceError::Refused(_)));
        assert_eq!(ds.get_ref().connects(), 0);
        assert!(statements(&sniffy).is_empty());
    }

    #[test]
    fn test_data_source_connect_recorded() {
        let sniffy = Sniffy::default();
        let ds = sniffy.data_source(MockDataSource::new("jdbc:h2:mem:", None));
        let mut conn = ds.connect().unwrap();
        conn.execute("UPDATE t SET a = 1").unwrap();

        let all = statements(&sniffy);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].0.sql.as_ref(), DATA_SOURCE_CONNECT);
        assert_eq!(all[0].0.kind, StatementKind::System);
    }

    #[test]
    fn test_data_source_delegate_error() {
        let sniffy = Sniffy::default();
        let ds = sniffy.data_source(MockDataSource::new("jdbc:h2:mem:", None).failing());
        let err = ds.connect().err().unwrap();
        assert!(matches!(err, DataSourceError::Delegate(_)));
    }

    #[test]
    fn test_monitoring_disabled() {
        let sniffy = Sniffy::new(SniffyConfig::default().with_monitor_jdbc(false));
        let mut stmt = sniffy.statement(MockExecutor::new());
        stmt.execute("DELETE FROM t").unwrap();
        assert!(statements(&sniffy).is_empty());
    }
}
