//! chainsink-storage: store backends for ChainSink.
//!
//! Backends:
//! - `MemoryStore` (in `chainsink-core`): in-memory, for tests and dry runs
//! - [`postgres`]: PostgreSQL via `sqlx` (feature `postgres`, on by default)

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresOptions, PostgresStore};
