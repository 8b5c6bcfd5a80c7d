//! Keys under which accounted I/O is aggregated.

mod connection;
mod statement;

pub use connection::{AddressMatcher, ConnectionIdentity, SocketAddress};
pub use statement::{StatementIdentity, StatementKind, normalize_sql};
