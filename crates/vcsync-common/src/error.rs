//! Error types for the virtual cluster syncer
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the context needed to tell a transient failure
//! (retried by the work queue) from a permanent one.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for syncer operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Invalid input that no retry can fix
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "metadata.namespace")
        field: Option<String>,
    },

    /// A dependency has not been projected yet
    #[error("{kind} {name} is not ready: {message}")]
    DependencyNotReady {
        /// Kind of the dependency (Secret, Service, ...)
        kind: String,
        /// Name of the dependency
        name: String,
        /// Description of what is missing
        message: String,
    },

    /// A tenant cluster is unknown or unreachable
    #[error("tenant cluster {cluster}: {message}")]
    Cluster {
        /// Name of the tenant cluster
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// A mutator aborted the mutation pipeline
    #[error("mutator {mutator} failed: {message}")]
    Mutation {
        /// Name of the failing mutator
        mutator: String,
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "queue", "checker")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error pointing at a field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a dependency-not-ready error
    pub fn not_ready(
        kind: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::DependencyNotReady {
            kind: kind.into(),
            name: name.into(),
            message: msg.into(),
        }
    }

    /// Create a tenant cluster error
    pub fn cluster(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cluster {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a mutation error for the named mutator
    pub fn mutation(mutator: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Mutation {
            mutator: mutator.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    fn api_status(&self) -> Option<(u16, &str)> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some((ae.code, ae.reason.as_str())),
            _ => None,
        }
    }

    /// The API server reported the object as absent
    pub fn is_not_found(&self) -> bool {
        matches!(self.api_status(), Some((404, _)))
    }

    /// A create raced with an existing object of the same name
    pub fn is_already_exists(&self) -> bool {
        matches!(self.api_status(), Some((409, "AlreadyExists")))
    }

    /// An optimistic-concurrency or UID precondition check failed
    pub fn is_conflict(&self) -> bool {
        matches!(self.api_status(), Some((409, reason)) if reason != "AlreadyExists")
    }

    /// Check if this error is retryable
    ///
    /// Validation and serialization errors need corrected input and are not
    /// retried, nor are client errors other than 404, 409 and 429. A missing
    /// host namespace may still be on its way.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => {
                    !(400..500).contains(&ae.code) || matches!(ae.code, 404 | 409 | 429)
                }
                _ => true,
            },
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
            Error::DependencyNotReady { .. } => true,
            Error::Cluster { .. } => true,
            Error::Mutation { .. } => true,
            Error::Internal { .. } => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::from(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: format!("{reason} from test"),
            reason: reason.to_string(),
            code,
        }))
    }

    /// Story: deletes treat a missing object as success
    #[test]
    fn story_not_found_is_classified() {
        let err = api_error(404, "NotFound");
        assert!(err.is_not_found());
        assert!(!err.is_already_exists());
        assert!(!err.is_conflict());
    }

    /// Story: create races report AlreadyExists, precondition failures report Conflict
    #[test]
    fn story_already_exists_and_conflict_are_distinct() {
        let exists = api_error(409, "AlreadyExists");
        assert!(exists.is_already_exists());
        assert!(!exists.is_conflict());

        let conflict = api_error(409, "Conflict");
        assert!(conflict.is_conflict());
        assert!(!conflict.is_already_exists());
        assert!(conflict.is_retryable());
    }

    #[test]
    fn test_dependency_not_ready_is_retryable() {
        let err = Error::not_ready("Secret", "default-token", "sync status is not ready");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("Secret default-token is not ready"));
    }

    #[test]
    fn test_validation_is_permanent() {
        let err = Error::validation_for_field("metadata.namespace", "too long");
        assert!(!err.is_retryable());
        match &err {
            Error::Validation { field, .. } => {
                assert_eq!(field.as_deref(), Some("metadata.namespace"))
            }
            _ => panic!("Expected Validation variant"),
        }
    }

    #[test]
    fn test_client_errors_are_permanent_except_conflicts() {
        assert!(!api_error(422, "Invalid").is_retryable());
        assert!(!api_error(403, "Forbidden").is_retryable());
        assert!(api_error(404, "NotFound").is_retryable());
        assert!(api_error(429, "TooManyRequests").is_retryable());
        assert!(api_error(500, "InternalError").is_retryable());
    }

    #[test]
    fn test_cluster_error_names_cluster() {
        let err = Error::cluster("west", "no client registered");
        assert!(err.is_retryable());
        assert!(err.to_string().contains("west"));
    }

    #[test]
    fn test_internal_error_default_context() {
        let err = Error::internal("unexpected state");
        assert!(err.to_string().contains("[unknown]"));
        let err = Error::internal_with_context("queue", "closed");
        assert!(err.to_string().contains("[queue]"));
    }

    #[test]
    fn test_mutation_error_names_mutator() {
        let err = Error::mutation("extension-metadata", "replicaset rs-1 not found");
        assert!(err.to_string().contains("extension-metadata"));
        let err = Error::serialization_for_kind("Kubeconfig", "bad yaml");
        assert!(!err.is_retryable());
    }
}
