//! Transparent wrappers around network connectors, SQL executors and data
//! sources.
//!
//! Each capability is a trait; the `Instrumented*` decorators implement the
//! same trait over any delegate, enforce the connectivity policy and feed
//! the aggregator.

mod mock;
#[cfg(feature = "postgres")]
mod pg;
mod statement;
mod stream;
mod traits;

pub use mock::{MockConnector, MockDataSource, MockExecutor, MockRow, MockSqlError, MockStream};
#[cfg(feature = "postgres")]
pub use pg::PgDataSource;
pub use statement::{
    DATA_SOURCE_CONNECT, DataSourceError, InstrumentedDataSource, InstrumentedStatement,
    describe_batch,
};
pub use stream::{InstrumentedConnector, InstrumentedStream};
pub use traits::{Connector, DataSource, SqlExecutor, TcpConnector};
