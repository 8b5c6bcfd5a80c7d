//! End-to-end scenarios over the public API: policy enforcement on
//! connectors and data sources, spies with expectations, traffic capture and
//! policy persistence.

use sniffy_core::clock::{ManualClock, RecordingSleeper};
use sniffy_core::identity::{AddressMatcher, SocketAddress, StatementKind};
use sniffy_core::intercept::{
    Connector, DataSourceError, MockConnector, MockDataSource, MockExecutor, SqlExecutor,
};
use sniffy_core::policy::{PolicyEntry, PolicyRefusal, PolicyRegistry, PolicyStatus};
use sniffy_core::query::GroupingOptions;
use sniffy_core::spy::{Expectation, ExpectationSpec};
use sniffy_core::thread::ThreadScope;
use sniffy_core::traffic::Direction;
use sniffy_core::{Sniffy, SniffyConfig};
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn statements(kind: StatementKind, exact: u64) -> Expectation {
    Expectation::new(ExpectationSpec {
        exact: Some(exact),
        ..ExpectationSpec::statements(kind)
    })
    .unwrap()
}

#[test]
fn closed_endpoint_refuses_until_cleared() {
    let sniffy = Sniffy::default();
    let db = SocketAddress::new("db.internal", 5432);
    let mock = MockConnector::new();
    let connector = sniffy.connector(mock.clone());

    sniffy
        .registry()
        .set_socket_status(Some("db.internal"), Some(5432), PolicyStatus::Closed);
    let err = connector.connect(&db).err().unwrap();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    let refusal = PolicyRefusal::from_io(&err).unwrap();
    assert_eq!(refusal.target(), "db.internal:5432");
    assert!(mock.attempts().is_empty());

    sniffy.registry().clear();
    assert!(connector.connect(&db).is_ok());
    assert_eq!(mock.attempts(), vec![db]);

    let entries = sniffy.registry().entries();
    assert!(entries.iter().any(|e| matches!(
        e,
        PolicyEntry::Socket { pattern, status: PolicyStatus::Open, discovered: true }
            if pattern.host.as_deref() == Some("db.internal") && pattern.port == Some(5432)
    )));
}

#[test]
fn statement_counts_pass_and_fail() {
    let sniffy = Sniffy::default();
    let mut stmt = sniffy.statement(MockExecutor::new());

    let spy = sniffy
        .expect(statements(StatementKind::Insert, 2))
        .expect(statements(StatementKind::Select, 1));
    let result = spy.run(|| {
        stmt.execute("INSERT INTO users VALUES (1)").unwrap();
        stmt.execute("INSERT INTO users VALUES (2)").unwrap();
        stmt.query("SELECT * FROM users").unwrap();
    });
    assert!(result.is_ok());

    let mut spy = sniffy.expect(statements(StatementKind::Insert, 3));
    stmt.execute("INSERT INTO users VALUES (1)").unwrap();
    stmt.execute("INSERT INTO users VALUES (2)").unwrap();
    let err = spy.close().unwrap_err();
    assert_eq!(err.failures().len(), 1);
    assert_eq!(err.failures()[0].observed, 2);
    let message = err.to_string();
    assert!(message.starts_with("Expected between 3 and 3 INSERT queries on current thread\n"));
    assert!(message.contains("INSERT INTO users VALUES (1)"));
}

#[test]
fn row_expectations_and_batches() {
    let sniffy = Sniffy::default();
    let executor = MockExecutor::new()
        .with_update_count("UPDATE t SET a = 1", 4)
        .with_update_count("INSERT INTO t VALUES (?)", 1);
    let mut stmt = sniffy.statement(executor);

    let spy = sniffy.spy();
    stmt.execute("UPDATE t SET a = 1").unwrap();
    let rows_ok = Expectation::new(ExpectationSpec {
        exact: Some(1),
        min_rows: Some(3),
        ..ExpectationSpec::statements(StatementKind::Update)
    })
    .unwrap();
    assert!(spy.verify(&rows_ok).is_ok());

    for _ in 0..3 {
        stmt.add_batch("INSERT INTO t VALUES (?)");
    }
    assert_eq!(stmt.execute_pending_batch().unwrap(), vec![1, 1, 1]);
    assert!(stmt.pending_batch().is_empty());

    let executed = spy.executed_statements(ThreadScope::Current, true);
    let batch = executed
        .iter()
        .find(|(id, _)| id.kind == StatementKind::Insert)
        .unwrap();
    assert_eq!(&*batch.0.sql, "INSERT INTO t VALUES (?) /*3 times*/");
    assert_eq!(batch.1.operations, 1);
    assert_eq!(batch.1.rows_affected, 3);
}

#[test]
fn system_calls_are_not_queries() {
    let sniffy = Sniffy::default();
    let data_source = sniffy.data_source(MockDataSource::new("postgres://db/app", Some("app")));

    let spy = sniffy.expect(statements(StatementKind::Any, 0));
    let mut conn = data_source.connect().unwrap();
    conn.system_call("commit", |_| Ok::<_, io::Error>(())).unwrap();
    assert_eq!(spy.executed_statement_count(StatementKind::System, ThreadScope::Current), 2);
    assert!(spy.run(|| ()).is_ok());
}

#[test]
fn data_source_policy() {
    let sniffy = Sniffy::default();
    let inner = MockDataSource::new("postgres://db/app", Some("app"));
    let data_source = sniffy.data_source(inner.clone());

    sniffy
        .registry()
        .set_data_source_status(Some("postgres://db/app"), None, PolicyStatus::Closed);
    assert!(matches!(data_source.connect(), Err(DataSourceError::Refused(_))));
    assert_eq!(inner.connects(), 0);

    sniffy
        .registry()
        .set_data_source_status(Some("postgres://db/app"), Some("app"), PolicyStatus::Open);
    assert!(data_source.connect().is_ok());
    assert_eq!(inner.connects(), 1);
}

#[test]
fn thread_scopes() {
    let sniffy = Sniffy::default();
    let mut stmt = sniffy.statement(MockExecutor::new());

    let spy = sniffy.spy();
    stmt.query("SELECT 1").unwrap();
    let worker = sniffy.clone();
    std::thread::spawn(move || {
        let mut stmt = worker.statement(MockExecutor::new());
        stmt.query("SELECT 2").unwrap();
        stmt.query("SELECT 2").unwrap();
    })
    .join()
    .unwrap();

    let count = |threads| {
        Expectation::new(ExpectationSpec {
            exact: Some(0),
            threads,
            ..ExpectationSpec::statements(StatementKind::Select)
        })
        .unwrap()
    };
    let observed = |threads| {
        spy.executed_statements(threads, true)
            .values()
            .map(|v| v.operations)
            .sum::<u64>()
    };
    assert_eq!(observed(ThreadScope::Current), 1);
    assert_eq!(observed(ThreadScope::Others), 2);
    assert_eq!(observed(ThreadScope::Any), 3);
    assert!(spy.verify(&count(ThreadScope::Others)).is_err());

    let spy = spy.expect(
        Expectation::new(ExpectationSpec {
            exact: Some(2),
            threads: ThreadScope::Others,
            ..ExpectationSpec::statements(StatementKind::Select)
        })
        .unwrap(),
    );
    assert!(spy.run(|| ()).is_ok());
}

#[test]
fn refusal_after_establishment() {
    let sniffy = Sniffy::default();
    let db = SocketAddress::new("db", 5432);
    let connector = sniffy.connector(MockConnector::new());

    let mut stream = connector.connect(&db).unwrap();
    stream.write_all(b"hello").unwrap();

    sniffy.registry().set_socket_status(Some("db"), None, PolicyStatus::Closed);
    let err = stream.write(b"again").unwrap_err();
    assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    let mut buf = [0u8; 4];
    assert!(stream.read(&mut buf).is_err());
}

#[test]
fn throttled_connection_is_delayed() {
    let sleeper = Arc::new(RecordingSleeper::new());
    let sniffy = Sniffy::default().with_sleeper(sleeper.clone());
    let db = SocketAddress::new("db", 5432);
    let connector = sniffy.connector(MockConnector::new());

    sniffy
        .registry()
        .set_socket_status(Some("db"), Some(5432), PolicyStatus::Throttle(10));
    let mut stream = connector.connect(&db).unwrap();
    stream.write_all(&[0u8; 100]).unwrap();

    assert_eq!(
        sleeper.sleeps(),
        vec![Duration::from_millis(10), Duration::from_millis(10)]
    );
}

#[test]
fn connections_and_traffic() {
    let sniffy = Sniffy::default().with_clock(Arc::new(ManualClock::new()));
    let db = SocketAddress::new("db", 5432);
    let connector = sniffy.connector(MockConnector::new().with_response(db.clone(), b"pong".to_vec()));

    let spy = sniffy.spy();
    let mut first = connector.connect(&db).unwrap();
    first.write_all(b"ping").unwrap();
    first.write_all(b"ping").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(first.read(&mut buf).unwrap(), 4);
    let _second = connector.connect(&db).unwrap();

    let two = Expectation::new(ExpectationSpec {
        exact: Some(2),
        ..ExpectationSpec::connections(AddressMatcher::host("db"))
    })
    .unwrap();
    assert!(spy.verify(&two).is_ok());

    let sockets = spy.socket_operations(ThreadScope::Current, &AddressMatcher::port(5432), true);
    let first_stats = sockets.get(&first.identity().without_stack_trace()).unwrap();
    assert_eq!(first_stats.bytes_sent, 8);
    assert_eq!(first_stats.bytes_received, 4);

    let traffic = spy.network_traffic(
        ThreadScope::Current,
        &AddressMatcher::any(),
        GroupingOptions {
            group_by_stack_trace: false,
            ..GroupingOptions::default()
        },
    );
    assert_eq!(traffic.len(), 1);
    let (key, packets) = &traffic[0];
    assert_eq!(key.address, db);
    assert_eq!(key.ordinal, Some(first.identity().ordinal));
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[0].direction, Direction::Sent);
    assert_eq!(packets[0].payload, b"pingping");
    assert_eq!(packets[1].direction, Direction::Received);
    assert_eq!(packets[1].payload, b"pong");
}

#[test]
fn monitoring_can_be_disabled() {
    let config = SniffyConfig::default()
        .with_monitor_jdbc(false)
        .with_monitor_socket(false);
    let sniffy = Sniffy::new(config);
    let mut stmt = sniffy.statement(MockExecutor::new());
    let connector = sniffy.connector(MockConnector::new());

    let spy = sniffy.spy();
    stmt.execute("DELETE FROM t").unwrap();
    connector.connect(&SocketAddress::new("db", 1)).unwrap();
    assert!(spy.executed_statements(ThreadScope::Any, true).is_empty());
    assert!(
        spy.socket_operations(ThreadScope::Any, &AddressMatcher::any(), true)
            .is_empty()
    );
}

#[test]
fn persistent_policy_survives_reload() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("sniffy").join("policy.json");

    let registry = PolicyRegistry::open(&path).unwrap();
    assert!(!registry.is_persistent());
    registry.set_persistent(true);
    registry.set_socket_status(Some("db"), Some(5432), PolicyStatus::RefuseAfter(50));
    registry.resolve_socket("cache", 6379);

    let reloaded = PolicyRegistry::open(&path).unwrap();
    assert!(reloaded.is_persistent());
    assert_eq!(reloaded.resolve_socket("db", 5432), PolicyStatus::RefuseAfter(50));
    assert_eq!(reloaded.entries().len(), 2);

    let sniffy = Sniffy::new(SniffyConfig::default().with_registry_path(&path));
    assert_eq!(
        sniffy.registry().resolve_socket("db", 5432),
        PolicyStatus::RefuseAfter(50)
    );
}
