//! Serializer configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use chainsink_core::cache::DEFAULT_RESERVATION_SIZE;
use chainsink_core::error::SinkError;

/// Configuration for a serializer instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerializerConfig {
    /// PostgreSQL connection string (required).
    pub database_url: String,
    /// Schema script run line by line when replay starts from the first block.
    pub path_to_schema: Option<PathBuf>,
    /// Indexes and constraints are only toggled when the database lags the
    /// head by at least this many blocks (or is empty).
    pub index_threshold: u32,
    /// Blocks buffered per flush while following the head.
    pub live_blocks_per_commit: u32,
    /// Blocks buffered per flush while replaying the block log.
    pub reindex_blocks_per_commit: u32,
    /// Statistics are logged and reset every N blocks.
    pub statistics_interval: u32,
    /// Capacity reserved for each pending batch vector.
    pub reservation_size: usize,
}

impl Default for SerializerConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            path_to_schema: None,
            index_threshold: 1_000_000,
            live_blocks_per_commit: 1,
            reindex_blocks_per_commit: 1_000,
            statistics_interval: 100_000,
            reservation_size: DEFAULT_RESERVATION_SIZE,
        }
    }
}

impl SerializerConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Self::default()
        }
    }

    /// Reject configurations no worker should be started with.
    pub fn validate(&self) -> Result<(), SinkError> {
        if self.database_url.trim().is_empty() {
            return Err(SinkError::Config("`database_url` is required".into()));
        }
        if self.live_blocks_per_commit == 0 {
            return Err(SinkError::Config(
                "`live_blocks_per_commit` must be at least 1".into(),
            ));
        }
        if self.reindex_blocks_per_commit == 0 {
            return Err(SinkError::Config(
                "`reindex_blocks_per_commit` must be at least 1".into(),
            ));
        }
        if self.statistics_interval == 0 {
            return Err(SinkError::Config(
                "`statistics_interval` must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = SerializerConfig::default();
        assert_eq!(cfg.index_threshold, 1_000_000);
        assert_eq!(cfg.live_blocks_per_commit, 1);
        assert_eq!(cfg.reindex_blocks_per_commit, 1_000);
        assert_eq!(cfg.reservation_size, 16_000);
        assert!(cfg.path_to_schema.is_none());
    }

    #[test]
    fn missing_url_is_rejected() {
        let err = SerializerConfig::default().validate().unwrap_err();
        assert!(matches!(err, SinkError::Config(_)));
        assert!(SerializerConfig::new("postgresql://localhost/haf").validate().is_ok());
    }

    #[test]
    fn zero_cadence_is_rejected() {
        let mut cfg = SerializerConfig::new("postgresql://localhost/haf");
        cfg.reindex_blocks_per_commit = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn deserializes_from_json() {
        let cfg: SerializerConfig = serde_json::from_str(
            r#"{"database_url":"postgresql://localhost/haf","path_to_schema":"/etc/haf/schema.sql",
                "index_threshold":500,"live_blocks_per_commit":1,"reindex_blocks_per_commit":2000,
                "statistics_interval":10,"reservation_size":128}"#,
        )
        .unwrap();
        assert_eq!(cfg.reindex_blocks_per_commit, 2000);
        assert_eq!(cfg.path_to_schema.unwrap().to_str(), Some("/etc/haf/schema.sql"));
    }
}
