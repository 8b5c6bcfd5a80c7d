//! sniffy-core — I/O instrumentation, accounting and verification.
//!
//! Provides:
//! - `intercept` — instrumented connectors, streams, SQL executors and data sources
//! - `aggregator` — per-connection and per-statement counters, packet reconstruction
//! - `spy` — observation windows with count/row expectations
//! - `policy` — connectivity policy table (open, closed, throttled) with JSON persistence
//! - `query` — filtering and grouping of accounted I/O by thread and address
//! - `config` — `IO_SNIFFY_*` environment configuration
//!
//! With `postgres` feature (default):
//! - `intercept::PgDataSource` — data source over the synchronous `postgres` client
//!
//! Everything hangs off a [`Sniffy`] instance; clones share state.

pub mod aggregator;
pub mod clock;
pub mod config;
pub mod identity;
pub mod intercept;
pub mod interner;
pub mod policy;
pub mod query;
pub mod spy;
pub mod stats;
pub mod thread;
pub mod traffic;

mod sniffy;

pub use config::SniffyConfig;
pub use sniffy::Sniffy;
