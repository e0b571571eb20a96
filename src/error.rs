//! Error types for the convergence controller
//!
//! Errors carry the addressing tuple of the resource they concern so that
//! log lines from a failing reconcile point straight at the offending object.
//! The runtime uses [`Error::is_retryable`] and [`Error::is_fatal`] to decide
//! between backing off, idling until the next input change, and aborting.

use thiserror::Error;

use crate::bootstrap::RenderError;
use crate::resources::{ResourceType, Version};

/// Main error type for store, runtime and controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The addressed resource does not exist
    #[error("resource {namespace}/{resource_type}/{id} not found")]
    NotFound {
        /// Namespace of the missing resource
        namespace: String,
        /// Type of the missing resource
        resource_type: ResourceType,
        /// Id of the missing resource
        id: String,
    },

    /// A resource with the same identity already exists
    #[error("resource {namespace}/{resource_type}/{id} already exists")]
    AlreadyExists {
        /// Namespace of the existing resource
        namespace: String,
        /// Type of the existing resource
        resource_type: ResourceType,
        /// Id of the existing resource
        id: String,
    },

    /// Optimistic concurrency check failed
    #[error(
        "version conflict on {namespace}/{resource_type}/{id}: expected {expected}, found {actual}"
    )]
    Conflict {
        /// Namespace of the contended resource
        namespace: String,
        /// Type of the contended resource
        resource_type: ResourceType,
        /// Id of the contended resource
        id: String,
        /// Version the caller based its write on
        expected: Version,
        /// Version currently stored
        actual: Version,
    },

    /// The store could not serve the request right now
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A resource carried a payload of a different type than requested
    #[error("type mismatch for {namespace}/{id}: expected {expected}, found {actual}")]
    TypeMismatch {
        /// Namespace of the resource
        namespace: String,
        /// Id of the resource
        id: String,
        /// Requested payload type
        expected: ResourceType,
        /// Stored payload type
        actual: ResourceType,
    },

    /// A manifest template could not be rendered from the current inputs
    #[error(transparent)]
    Render(#[from] RenderError),

    /// A controller with the same name is already registered
    #[error("controller {0} is already registered")]
    DuplicateController(String),

    /// Two controllers claim the same output
    #[error("output {namespace}/{resource_type} is owned by {owner}, cannot be claimed by {claimant}")]
    OwnershipConflict {
        /// Output namespace
        namespace: String,
        /// Output type
        resource_type: ResourceType,
        /// Controller that registered the output first
        owner: String,
        /// Controller that tried to claim it
        claimant: String,
    },

    /// A controller tried to write a type it does not own
    #[error("controller {controller} does not own {namespace}/{resource_type}")]
    OwnershipViolation {
        /// Offending controller
        controller: String,
        /// Namespace written to
        namespace: String,
        /// Type written to
        resource_type: ResourceType,
    },

    /// The operation observed a cancellation signal
    #[error("operation cancelled")]
    Cancelled,

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g. "runtime", "store")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for the given resource address
    pub fn not_found(
        namespace: impl Into<String>,
        resource_type: ResourceType,
        id: impl Into<String>,
    ) -> Self {
        Self::NotFound {
            namespace: namespace.into(),
            resource_type,
            id: id.into(),
        }
    }

    /// Create an already-exists error for the given resource address
    pub fn already_exists(
        namespace: impl Into<String>,
        resource_type: ResourceType,
        id: impl Into<String>,
    ) -> Self {
        Self::AlreadyExists {
            namespace: namespace.into(),
            resource_type,
            id: id.into(),
        }
    }

    /// Create a version conflict error
    pub fn conflict(
        namespace: impl Into<String>,
        resource_type: ResourceType,
        id: impl Into<String>,
        expected: Version,
        actual: Version,
    ) -> Self {
        Self::Conflict {
            namespace: namespace.into(),
            resource_type,
            id: id.into(),
            expected,
            actual,
        }
    }

    /// Create a store-unavailable error with the given message
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether the runtime should re-run the reconcile after a backoff
    ///
    /// Version conflicts and store unavailability are transient: a fresh
    /// read on the next attempt resolves them.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable(_))
    }

    /// Whether this is a missing-resource error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this is a template rendering error
    pub fn is_render(&self) -> bool {
        matches!(self, Self::Render(_))
    }

    /// Whether this error signals cancellation rather than failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Configuration errors that must abort startup or the runtime
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::DuplicateController(_)
                | Self::OwnershipConflict { .. }
                | Self::OwnershipViolation { .. }
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn conflict() -> Error {
        Error::conflict(
            "controlplane",
            ResourceType::Manifest,
            "10-kube-proxy",
            Version::new(1),
            Version::new(2),
        )
    }

    /// Story: a stale write names the object and both versions so the
    /// operator can see which side moved
    #[test]
    fn story_conflict_message_names_resource_and_versions() {
        let msg = conflict().to_string();
        assert!(msg.contains("controlplane/Manifest/10-kube-proxy"));
        assert!(msg.contains("expected 1"));
        assert!(msg.contains("found 2"));
    }

    #[test]
    fn story_not_found_is_distinguishable() {
        let err = Error::not_found("secrets", ResourceType::KubernetesRoot, "k8s");
        assert!(err.is_not_found());
        assert!(!err.is_retryable());
        assert_eq!(
            err.to_string(),
            "resource secrets/KubernetesRoot/k8s not found"
        );
    }

    /// Story: the runtime backs off only on transient failures
    #[rstest]
    #[case::conflict(conflict(), true)]
    #[case::unavailable(Error::unavailable("shutting down"), true)]
    #[case::not_found(Error::not_found("a", ResourceType::Manifest, "b"), false)]
    #[case::already_exists(Error::already_exists("a", ResourceType::Manifest, "b"), false)]
    #[case::cancelled(Error::Cancelled, false)]
    #[case::duplicate(Error::DuplicateController("manifests".into()), false)]
    fn test_retry_classification(#[case] error: Error, #[case] retryable: bool) {
        assert_eq!(error.is_retryable(), retryable);
    }

    #[test]
    fn story_registration_errors_are_fatal() {
        assert!(Error::DuplicateController("manifests".into()).is_fatal());
        assert!(Error::OwnershipConflict {
            namespace: "controlplane".into(),
            resource_type: ResourceType::Manifest,
            owner: "a".into(),
            claimant: "b".into(),
        }
        .is_fatal());
        assert!(!conflict().is_fatal());
    }

    #[test]
    fn story_render_errors_convert_transparently() {
        let err: Error = RenderError::invalid_input("core-dns-svc", "DNSServiceIP", "not an IP").into();
        assert!(err.is_render());
        assert!(err.to_string().contains("DNSServiceIP"));
        assert!(!err.is_retryable());
    }
}
