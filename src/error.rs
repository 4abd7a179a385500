//! Error types for permbot
//!
//! Errors carry the object or source they relate to so that log lines from
//! the agent are useful without a backtrace. Compiler invariant violations
//! are not represented here: they are defects and panic instead.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for permbot operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The policy document could not be decoded
    #[error("config decode error: {message}")]
    ConfigDecode {
        /// Decoder message (includes line/column for TOML)
        message: String,
    },

    /// The policy document decoded but is not acceptable
    #[error("validation error: {message}")]
    Validation {
        /// Description of what's invalid
        message: String,
        /// The offending field (e.g. "project.namespace")
        field: Option<String>,
    },

    /// The requested namespace has no project in the config
    #[error("namespace {namespace} not found in config")]
    NamespaceNotFound {
        /// The namespace that was requested
        namespace: String,
    },

    /// The policy source could not be located or read
    #[error("policy source {source_ref} unavailable: {message}")]
    SourceUnavailable {
        /// namespace/name of the source object
        source_ref: String,
        /// Description of what failed
        message: String,
    },

    /// The policy source exists but holds no policy
    #[error("policy source {source_ref} has no data under key `{key}`")]
    SourceEmpty {
        /// namespace/name of the source object
        source_ref: String,
        /// The data key that was expected
        key: String,
    },

    /// The policy source was deleted
    #[error("policy source {source_ref} was deleted")]
    SourceDeleted {
        /// namespace/name of the source object
        source_ref: String,
    },

    /// A single RBAC object could not be written
    #[error("failed to apply {kind} {name}: {message}")]
    Apply {
        /// Resource kind (Role, ClusterRoleBinding, ...)
        kind: String,
        /// Resource name
        name: String,
        /// Namespace for namespaced kinds
        namespace: Option<String>,
        /// Description of what failed
        message: String,
    },

    /// Serialization error while rendering output
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
    },

    /// The policy source watch could not be kept open
    #[error("policy source watch closed after {attempts} reconnect attempts")]
    WatchClosed {
        /// Number of consecutive reconnect attempts made
        attempts: u32,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where the error occurred (e.g. "health", "telemetry")
        context: String,
    },
}

impl Error {
    /// Create a decode error from any displayable decoder error
    pub fn config_decode(msg: impl Into<String>) -> Self {
        Self::ConfigDecode {
            message: msg.into(),
        }
    }

    /// Create a validation error tied to a field
    pub fn validation_for_field(field: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a namespace-not-found error
    pub fn namespace_not_found(namespace: impl Into<String>) -> Self {
        Self::NamespaceNotFound {
            namespace: namespace.into(),
        }
    }

    /// Create a source-unavailable error
    pub fn source_unavailable(source_ref: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            source_ref: source_ref.into(),
            message: msg.into(),
        }
    }

    /// Create a source-empty error
    pub fn source_empty(source_ref: impl Into<String>, key: impl Into<String>) -> Self {
        Self::SourceEmpty {
            source_ref: source_ref.into(),
            key: key.into(),
        }
    }

    /// Create a source-deleted error
    pub fn source_deleted(source_ref: impl Into<String>) -> Self {
        Self::SourceDeleted {
            source_ref: source_ref.into(),
        }
    }

    /// Create an apply error for a cluster-scoped object
    pub fn apply(kind: impl Into<String>, name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Apply {
            kind: kind.into(),
            name: name.into(),
            namespace: None,
            message: msg.into(),
        }
    }

    /// Create an apply error for a namespaced object
    pub fn apply_in_namespace(
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Apply {
            kind: kind.into(),
            name: name.into(),
            namespace: Some(namespace.into()),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
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

    /// Check if this error is retryable
    ///
    /// Decode and validation errors need a policy change, so retrying the
    /// same input is pointless. Source and API errors may be transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => !matches!(
                source,
                kube::Error::Api(ae) if (400..500).contains(&ae.code)
            ),
            Error::ConfigDecode { .. } => false,
            Error::Validation { .. } => false,
            Error::NamespaceNotFound { .. } => false,
            Error::SourceUnavailable { .. } => true,
            Error::SourceEmpty { .. } => false,
            Error::SourceDeleted { .. } => false,
            Error::Apply { .. } => true,
            Error::Serialization { .. } => false,
            Error::WatchClosed { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this error came from reading the policy source
    pub fn is_source_error(&self) -> bool {
        matches!(
            self,
            Error::SourceUnavailable { .. }
                | Error::SourceEmpty { .. }
                | Error::SourceDeleted { .. }
                | Error::ConfigDecode { .. }
                | Error::Validation { .. }
        )
    }
}
