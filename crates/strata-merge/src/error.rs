//! Error types for the merge engine.

/// The result type used throughout strata-merge.
pub type Result<T> = std::result::Result<T, MergeError>;

/// Errors that can occur while merging a batch.
#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    /// An error from strata-core (storage, configuration, validation).
    #[error("core error: {0}")]
    Core(#[from] strata_core::Error),

    /// The record cannot be interpreted for its source.
    #[error("malformed record: {message}")]
    MalformedRecord {
        /// What is wrong with the record.
        message: String,
    },

    /// A write precondition failed, indicating a concurrent writer on the key.
    #[error("invariant violation on {source_name}/{natural_key}: {reason}")]
    InvariantViolation {
        /// Source of the key.
        source_name: String,
        /// The affected natural key.
        natural_key: String,
        /// The precondition that did not hold.
        reason: String,
    },

    /// Transient storage failures persisted through every attempt.
    #[error("{operation} failed after {attempts} attempts: {message}")]
    RetriesExhausted {
        /// Operation being retried.
        operation: String,
        /// Attempts made.
        attempts: u32,
        /// Message of the last failure.
        message: String,
    },

    /// The source is not configured.
    #[error("unknown source: {source_name}")]
    UnknownSource {
        /// The source that was looked up.
        source_name: String,
    },

    /// The source is configured with a different kind.
    #[error("source {source_name} is not a {expected} source")]
    SourceKindMismatch {
        /// The source that was looked up.
        source_name: String,
        /// The kind the caller needed.
        expected: &'static str,
    },

    /// The run stopped early.
    #[error("run aborted: {message}")]
    Aborted {
        /// Why the run stopped.
        message: String,
    },
}

impl MergeError {
    /// Creates a malformed-record error.
    #[must_use]
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::MalformedRecord {
            message: message.into(),
        }
    }

    /// Returns true when retrying the same operation may succeed.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Core(e) if e.is_transient())
    }

    /// Returns true when the storage layer is down and the run must stop.
    #[must_use]
    pub const fn is_outage(&self) -> bool {
        matches!(self, Self::Core(e) if e.is_outage())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_core_errors() {
        let transient = MergeError::from(strata_core::Error::storage("timeout"));
        assert!(transient.is_transient());
        assert!(!transient.is_outage());

        let outage = MergeError::from(strata_core::Error::unavailable("down"));
        assert!(outage.is_outage());
        assert!(!outage.is_transient());

        assert!(!MergeError::malformed("x").is_transient());
    }

    #[test]
    fn display_names_the_key() {
        let err = MergeError::InvariantViolation {
            source_name: "customers".into(),
            natural_key: "C001".into(),
            reason: "version sk_1 is not current".into(),
        };
        assert_eq!(
            err.to_string(),
            "invariant violation on customers/C001: version sk_1 is not current"
        );
    }
}
