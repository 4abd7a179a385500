//! Policy data model
//!
//! The policy is a TOML document with `[[project]]` and `[[role]]` tables.
//! All values are plain data; compilation lives in [`crate::compiler`].
//!
//! ```toml
//! [[project]]
//! namespace = "team-a"
//!   [[project.roles]]
//!   role = "viewer"
//!   users = ["alice"]
//!   serviceAccounts = ["bob", "ci:deployer"]
//!
//! [[role]]
//! name = "viewer"
//! globalUsers = ["admin"]
//!   [[role.rules]]
//!   apiGroups = [""]
//!   resources = ["pods"]
//!   verbs = ["get", "list"]
//! ```

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level policy document
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Tenant namespaces and their role assignments
    #[serde(rename = "project", default)]
    pub projects: Vec<Project>,
    /// Role definitions
    #[serde(rename = "role", default)]
    pub roles: Vec<Role>,
}

/// One tenant namespace
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    /// Kubernetes namespace the project maps to
    pub namespace: String,
    /// Which subjects hold which role in this namespace
    #[serde(rename = "roles", default)]
    pub role_assignments: Vec<RoleUsers>,
}

/// Binds a role name to subjects within a project
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleUsers {
    /// Name of a [`Role`]. Not checked against the role list.
    pub role: String,
    /// User names, used verbatim
    #[serde(default)]
    pub users: Vec<String>,
    /// Service accounts as `name` or `namespace:name`
    #[serde(default)]
    pub service_accounts: Vec<String>,
}

/// A named permission set, optionally granted cluster-wide
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    /// Stable key for generated object names
    pub name: String,
    /// Permission statements
    #[serde(default)]
    pub rules: Vec<Rule>,
    /// Users granted this role across the whole cluster
    #[serde(default)]
    pub global_users: Vec<String>,
    /// Service accounts granted this role across the whole cluster
    #[serde(default)]
    pub global_service_accounts: Vec<String>,
}

impl Role {
    /// Number of cluster-wide subjects
    pub fn global_subject_count(&self) -> usize {
        self.global_users.len() + self.global_service_accounts.len()
    }
}

/// One permission statement
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    /// API groups ("" is the core group)
    #[serde(default)]
    pub api_groups: Vec<String>,
    /// Resource types
    #[serde(default)]
    pub resources: Vec<String>,
    /// Allowed verbs
    #[serde(default)]
    pub verbs: Vec<String>,
}

impl PolicyConfig {
    /// Decode and validate a TOML policy
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: PolicyConfig =
            toml::from_str(input).map_err(|e| Error::config_decode(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, decode and validate a TOML policy file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| {
            Error::config_decode(format!("unable to open config {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&input)
    }

    /// Find the project for a namespace
    pub fn project(&self, namespace: &str) -> Option<&Project> {
        self.projects.iter().find(|p| p.namespace == namespace)
    }

    /// Reject configs whose generated names would collide.
    ///
    /// Generated object names are keyed by role name and placed by
    /// namespace, so both must be unique and non-empty.
    pub fn validate(&self) -> Result<()> {
        let mut namespaces = BTreeSet::new();
        for project in &self.projects {
            if project.namespace.is_empty() {
                return Err(Error::validation_for_field(
                    "project.namespace",
                    "project namespace must not be empty",
                ));
            }
            if !namespaces.insert(project.namespace.as_str()) {
                return Err(Error::validation_for_field(
                    "project.namespace",
                    format!("duplicate project namespace `{}`", project.namespace),
                ));
            }

            let mut assigned = BTreeSet::new();
            for assignment in &project.role_assignments {
                if !assigned.insert(assignment.role.as_str()) {
                    return Err(Error::validation_for_field(
                        "project.roles.role",
                        format!(
                            "role `{}` assigned more than once in namespace `{}`",
                            assignment.role, project.namespace
                        ),
                    ));
                }
            }
        }

        let mut names = BTreeSet::new();
        for role in &self.roles {
            if role.name.is_empty() {
                return Err(Error::validation_for_field(
                    "role.name",
                    "role name must not be empty",
                ));
            }
            if !names.insert(role.name.as_str()) {
                return Err(Error::validation_for_field(
                    "role.name",
                    format!("duplicate role name `{}`", role.name),
                ));
            }
        }

        Ok(())
    }
}
