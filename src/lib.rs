//! permbot - declarative project/role policy compiled into Kubernetes RBAC
//!
//! permbot reads a TOML policy describing projects (namespaces), roles, and
//! which users and service accounts hold each role in each project. It
//! compiles that policy into Role/RoleBinding pairs per namespace and
//! ClusterRole/ClusterRoleBinding pairs for globally granted roles, then
//! either renders them as YAML or writes them to the cluster.
//!
//! # Modules
//!
//! - [`config`] - Policy data model and TOML loading
//! - [`subject`] - Subject resolution (`namespace:name` service accounts)
//! - [`compiler`] - Pure policy → RBAC compilation
//! - [`render`] - Multi-document YAML output
//! - [`client`] - RBAC write operations against the cluster
//! - [`source`] - Live policy source (watched ConfigMap)
//! - [`agent`] - Reconciliation loop
//! - [`oneshot`] - Compile once and render or apply
//! - [`notify`] - Outcome notifications (Slack)
//! - [`metrics`] - OpenTelemetry instruments
//! - [`health`] - HTTP index and health endpoint
//! - [`telemetry`] - Logging and metrics exporter setup
//! - [`retry`] - Backoff helpers
//! - [`error`] - Error types
//!
//! # Ownership
//!
//! Every object whose name starts with [`RESOURCE_NAME_PREFIX`] belongs to
//! permbot. Apply is a full overwrite by name: manual edits to those objects
//! are replaced on the next cycle.

#![deny(missing_docs)]

pub mod agent;
pub mod client;
pub mod compiler;
pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod notify;
pub mod oneshot;
pub mod render;
pub mod retry;
pub mod source;
pub mod subject;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Naming and metadata conventions
// =============================================================================
// Read back by other tooling; keep stable across releases.

/// Prefix for every generated Role, RoleBinding, ClusterRole and ClusterRoleBinding
pub const RESOURCE_NAME_PREFIX: &str = "permbot-auto-role";

/// Default owner label value
pub const DEFAULT_OWNER: &str = "permbot";

/// Label carrying the owner passed on the command line
pub const LABEL_OWNER: &str = "dafni.ac.uk/permbot-owner";

/// Annotation carrying the permbot version that generated an object
pub const ANNOTATION_VERSION: &str = "dafni.ac.uk/permbot-version";

/// Annotation carrying the policy revision that generated an object.
///
/// The agent also reads this annotation from the source ConfigMap.
pub const ANNOTATION_RULES_REF: &str = "dafni.ac.uk/permbot-rules-ref";

/// rules_ref used by the agent when the source carries no revision
pub const UNKNOWN_RULES_REF: &str = "unknown";

/// RBAC API group
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// ConfigMap data key holding the TOML policy
pub const CONFIGMAP_KEY: &str = "permbot.toml";

/// Default `namespace/name` of the policy ConfigMap
pub const DEFAULT_CONFIGMAP: &str = "permbot/config";

/// permbot version stamped into generated objects.
///
/// Release builds set `PERMBOT_VERSION`; otherwise the crate version is used.
pub fn version() -> &'static str {
    option_env!("PERMBOT_VERSION").unwrap_or(env!("CARGO_PKG_VERSION"))
}
