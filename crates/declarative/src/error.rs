//! Error types for the reconciliation engine

use crate::provider::ProviderError;
use thiserror::Error;

/// Errors that can occur while planning or executing a reconciliation
#[derive(Error, Debug)]
pub enum Error {
    /// The declared resources contain a dependency cycle
    #[error("dependency cycle detected: {}", .cycle.join(" -> "))]
    CycleDetected {
        /// Resources forming the cycle, first entry repeated at the end
        cycle: Vec<String>,
    },

    /// Two declarations share the same identity
    #[error("duplicate resource identity: {id}")]
    DuplicateIdentity { id: String },

    /// A reference points at an undeclared resource or a missing output
    #[error("resource '{resource}' has an unresolved reference to {target}")]
    UnresolvedReference { resource: String, target: String },

    /// A provider operation failed for one resource
    #[error("provider error on '{resource}': {source}")]
    Provider {
        resource: String,
        #[source]
        source: ProviderError,
    },

    /// The state file was written by a newer version
    #[error("unsupported state version {found} (this build supports up to {supported})")]
    StateVersion { found: u32, supported: u32 },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The worker pool could not be created or a worker vanished
    #[error("executor error: {0}")]
    Executor(String),
}

impl Error {
    /// Whether this error was raised before any side effect could happen
    pub fn is_planning_error(&self) -> bool {
        matches!(
            self,
            Self::CycleDetected { .. }
                | Self::DuplicateIdentity { .. }
                | Self::UnresolvedReference { .. }
        )
    }
}

/// Render an error and every `source()` below it as `outer: inner: root`
pub fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        let text = cause.to_string();
        // thiserror messages often already embed their source
        if !out.ends_with(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        current = cause.source();
    }
    out
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_message_names_path() {
        let err = Error::CycleDetected {
            cycle: vec!["a".into(), "b".into(), "a".into()],
        };
        assert_eq!(err.to_string(), "dependency cycle detected: a -> b -> a");
        assert!(err.is_planning_error());
    }

    #[test]
    fn test_error_chain_does_not_repeat_embedded_source() {
        let err = Error::Provider {
            resource: "queue".into(),
            source: ProviderError::Rejected {
                message: "vhost missing".into(),
            },
        };
        assert_eq!(
            error_chain(&err),
            "provider error on 'queue': vhost missing"
        );
        assert!(!err.is_planning_error());
    }
}
