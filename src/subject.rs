//! Subject resolution
//!
//! Users are taken verbatim. Service accounts may be written as `name` or
//! `namespace:name`; the namespace falls back to a caller-supplied default.

use k8s_openapi::api::rbac::v1::Subject;

use crate::RBAC_API_GROUP;

/// Namespace used for global service accounts written without one
pub const GLOBAL_DEFAULT_NAMESPACE: &str = "default";

/// Kind of RBAC subject
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    /// A user as known to the cluster's authenticator
    User,
    /// A namespaced service account
    ServiceAccount,
}

impl SubjectKind {
    /// RBAC `kind` value
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "User",
            Self::ServiceAccount => "ServiceAccount",
        }
    }
}

/// A subject with its namespace resolved
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct QualifiedSubject {
    /// User or ServiceAccount
    pub kind: SubjectKind,
    /// Subject name
    pub name: String,
    /// Namespace, set only for service accounts
    pub namespace: Option<String>,
}

/// Build a User subject from a raw user string
pub fn user_subject(raw: &str) -> QualifiedSubject {
    QualifiedSubject {
        kind: SubjectKind::User,
        name: raw.to_string(),
        namespace: None,
    }
}

/// Resolve a raw `name` or `namespace:name` service account.
///
/// Only the first `:` splits. If either side of it is empty the non-empty
/// side is the name and `default_namespace` is used.
pub fn resolve_service_account(raw: &str, default_namespace: &str) -> QualifiedSubject {
    let (namespace, name) = match raw.split_once(':') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() => (ns, name),
        Some(("", name)) => (default_namespace, name),
        Some((ns, _)) => (default_namespace, ns),
        None => (default_namespace, raw),
    };
    QualifiedSubject {
        kind: SubjectKind::ServiceAccount,
        name: name.to_string(),
        namespace: Some(namespace.to_string()),
    }
}

impl From<QualifiedSubject> for Subject {
    fn from(subject: QualifiedSubject) -> Self {
        let api_group = match subject.kind {
            SubjectKind::User => Some(RBAC_API_GROUP.to_string()),
            SubjectKind::ServiceAccount => Some(String::new()),
        };
        Subject {
            api_group,
            kind: subject.kind.as_str().to_string(),
            name: subject.name,
            namespace: subject.namespace,
        }
    }
}
