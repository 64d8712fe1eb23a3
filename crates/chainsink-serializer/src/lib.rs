//! chainsink-serializer: serializes applied Hive blocks into PostgreSQL.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use chainsink_core::protocol::StaticChainState;
//! use chainsink_core::store::MemoryStore;
//! use chainsink_serializer::{SerializerBuilder, SqlSerializer};
//!
//! # async fn example() -> Result<(), chainsink_core::SinkError> {
//! let config = SerializerBuilder::new()
//!     .database_url("postgresql://hive@localhost/haf_block_log")
//!     .build_config();
//! let chain = Arc::new(StaticChainState::new(vec!["initminer".into()]));
//! let mut serializer = SqlSerializer::start(config, Arc::new(MemoryStore::new()), chain).await?;
//!
//! serializer.on_pre_apply_block(1).await?;
//! // ... on_pre_apply_operation / on_post_apply_block for every block ...
//! serializer.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod builder;
pub mod config;
pub mod loader;
pub mod schema;
pub mod serializer;
pub mod stats;

pub use builder::SerializerBuilder;
pub use config::SerializerConfig;
pub use loader::{load_initial_db_data, InitialDbData};
pub use serializer::{SqlSerializer, SyncMode};
pub use stats::SerializerStats;
