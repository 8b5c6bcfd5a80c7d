//! PostgreSQL adapter for the executor and data source traits.

use super::traits::{DataSource, SqlExecutor};
use postgres::{Client, NoTls, Row};

impl SqlExecutor for Client {
    type Row = Row;
    type Error = postgres::Error;

    fn query(&mut self, sql: &str) -> Result<Vec<Row>, postgres::Error> {
        Client::query(self, sql, &[])
    }

    fn execute(&mut self, sql: &str) -> Result<u64, postgres::Error> {
        Client::execute(self, sql, &[])
    }
}

/// Connects with a libpq-style connection string.
///
/// `from_env` uses the standard environment variables:
/// - PGHOST (default: localhost)
/// - PGPORT (default: 5432)
/// - PGUSER (default: $USER)
/// - PGPASSWORD (default: empty)
/// - PGDATABASE (default: same as PGUSER)
#[derive(Debug, Clone)]
pub struct PgDataSource {
    connection_string: String,
    url: String,
    user: Option<String>,
}

impl PgDataSource {
    pub fn new(host: &str, port: u16, user: &str, database: &str, password: Option<&str>) -> Self {
        let connection_string = match password.filter(|p| !p.is_empty()) {
            Some(password) => format!(
                "host={} port={} user={} password={} dbname={}",
                host, port, user, password, database
            ),
            None => format!("host={} port={} user={} dbname={}", host, port, user, database),
        };
        Self {
            connection_string,
            url: format!("postgresql://{}:{}/{}", host, port, database),
            user: Some(user.to_string()),
        }
    }

    /// Returns `None` when neither PGUSER nor USER is set, or PGPORT is not a port.
    pub fn from_env() -> Option<Self> {
        let user = std::env::var("PGUSER")
            .or_else(|_| std::env::var("USER"))
            .ok()?;
        let host = std::env::var("PGHOST").unwrap_or_else(|_| "localhost".to_string());
        let port = match std::env::var("PGPORT") {
            Ok(port) => port.parse().ok()?,
            Err(_) => 5432,
        };
        let password = std::env::var("PGPASSWORD").ok();
        let database = std::env::var("PGDATABASE").unwrap_or_else(|_| user.clone());
        Some(Self::new(&host, port, &user, &database, password.as_deref()))
    }
}

impl DataSource for PgDataSource {
    type Connection = Client;
    type Error = postgres::Error;

    fn url(&self) -> &str {
        &self.url
    }

    fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    fn connect(&self) -> Result<Client, postgres::Error> {
        Client::connect(&self.connection_string, NoTls)
    }
}
