//! Fluent builder API for serializer configuration.
//!
//! # Example
//!
//! ```rust
//! use chainsink_serializer::SerializerBuilder;
//!
//! let config = SerializerBuilder::new()
//!     .database_url("postgresql://hive@localhost/haf_block_log")
//!     .path_to_schema("/usr/share/haf/schema.sql")
//!     .index_threshold(1_000_000)
//!     .reindex_blocks_per_commit(1_000)
//!     .build_config();
//! assert!(config.validate().is_ok());
//! ```

use std::path::PathBuf;

use crate::config::SerializerConfig;

/// Fluent builder for `SerializerConfig`.
#[derive(Default)]
pub struct SerializerBuilder {
    config: SerializerConfig,
}

impl SerializerBuilder {
    pub fn new() -> Self {
        Self {
            config: SerializerConfig::default(),
        }
    }

    /// Set the PostgreSQL connection string.
    pub fn database_url(mut self, url: impl Into<String>) -> Self {
        self.config.database_url = url.into();
        self
    }

    /// Set the schema script executed on a fresh database.
    pub fn path_to_schema(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path_to_schema = Some(path.into());
        self
    }

    /// Set the block gap required before indexes/constraints are toggled.
    pub fn index_threshold(mut self, blocks: u32) -> Self {
        self.config.index_threshold = blocks;
        self
    }

    pub fn live_blocks_per_commit(mut self, blocks: u32) -> Self {
        self.config.live_blocks_per_commit = blocks;
        self
    }

    pub fn reindex_blocks_per_commit(mut self, blocks: u32) -> Self {
        self.config.reindex_blocks_per_commit = blocks;
        self
    }

    /// Log statistics every N blocks.
    pub fn statistics_interval(mut self, blocks: u32) -> Self {
        self.config.statistics_interval = blocks;
        self
    }

    pub fn reservation_size(mut self, rows: usize) -> Self {
        self.config.reservation_size = rows;
        self
    }

    /// Build the `SerializerConfig`.
    pub fn build_config(self) -> SerializerConfig {
        self.config
    }
}
