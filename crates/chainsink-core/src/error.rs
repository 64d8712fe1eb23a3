//! Error types for the chainsink pipeline.

use thiserror::Error;

/// Errors that can occur while serializing chain data into the store.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The store rejected a statement or the connection was lost.
    #[error("Store error: {0}")]
    Store(String),

    #[error("Account `{account}` already exists (operation: {operation})")]
    DuplicateAccount { account: String, operation: String },

    #[error("Missing account `{account}` at processing operation `{operation}`")]
    MissingAccount { account: String, operation: String },

    #[error(
        "Block {block_number} is already persisted but no longer reversible \
         (last irreversible block: {last_irreversible})"
    )]
    IrreversibleBlockReplayed {
        block_number: u32,
        last_irreversible: u32,
    },

    #[error("Consistency violation: {0}")]
    Consistency(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// The worker behind a data processor has exited (crashed or joined).
    #[error("Data processor '{name}' is no longer running")]
    ProcessorStopped { name: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl SinkError {
    /// Returns `true` for errors indicating corrupted upstream data.
    ///
    /// These are fatal for the ingestion coordinator: nothing after them can
    /// be serialized safely.
    pub fn is_consistency_violation(&self) -> bool {
        matches!(
            self,
            Self::DuplicateAccount { .. }
                | Self::MissingAccount { .. }
                | Self::IrreversibleBlockReplayed { .. }
                | Self::Consistency(_)
        )
    }

    /// Returns `true` if the error came from the store (execution or connectivity).
    pub fn is_store_failure(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_consistency_violations() {
        let dup = SinkError::DuplicateAccount {
            account: "alice".into(),
            operation: "account_create_operation".into(),
        };
        assert!(dup.is_consistency_violation());
        assert!(!dup.is_store_failure());

        let store = SinkError::Store("connection reset".into());
        assert!(store.is_store_failure());
        assert!(!store.is_consistency_violation());
    }

    #[test]
    fn missing_account_message_names_operation() {
        let err = SinkError::MissingAccount {
            account: "bob".into(),
            operation: "vote_operation".into(),
        };
        assert_eq!(
            err.to_string(),
            "Missing account `bob` at processing operation `vote_operation`"
        );
    }

    #[test]
    fn json_failure_converts_to_serialization_error() {
        let json_err = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: SinkError = json_err.into();
        assert!(matches!(err, SinkError::Serialization(_)));
        assert!(!err.is_consistency_violation());
    }
}
