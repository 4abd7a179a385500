//! Policy compiler
//!
//! Turns a [`PolicyConfig`] into Kubernetes RBAC objects. Compilation is
//! pure: the same config, rules_ref and owner always produce the same
//! objects in the same order, and nothing here touches the cluster.
//!
//! # Output
//!
//! - [`PolicyCompiler::compile_global`]: one ClusterRole/ClusterRoleBinding
//!   pair per role that names at least one global subject.
//! - [`PolicyCompiler::compile_namespace`]: one Role/RoleBinding pair per
//!   role assigned in the requested namespace.
//!
//! # Usage
//!
//! ```text
//! let compiler = PolicyCompiler::new(&config, "abc123", "permbot");
//! let global = compiler.compile_global();
//! let team_a = compiler.compile_namespace("team-a")?;
//! ```

use std::collections::BTreeMap;

use k8s_openapi::api::rbac::v1::{
    ClusterRole, ClusterRoleBinding, PolicyRule, Role as RbacRole, RoleBinding, RoleRef, Subject,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::debug;

use crate::config::{PolicyConfig, Role, RoleUsers, Rule};
use crate::subject::{resolve_service_account, user_subject, GLOBAL_DEFAULT_NAMESPACE};
use crate::{
    Error, Result, ANNOTATION_RULES_REF, ANNOTATION_VERSION, LABEL_OWNER, RBAC_API_GROUP,
    RESOURCE_NAME_PREFIX,
};

/// Cluster-scoped output of a compile
#[derive(Clone, Debug, Default, PartialEq)]
pub struct GlobalResources {
    /// ClusterRoles in role declaration order
    pub cluster_roles: Vec<ClusterRole>,
    /// ClusterRoleBindings in role declaration order
    pub cluster_role_bindings: Vec<ClusterRoleBinding>,
}

impl GlobalResources {
    /// Check if any resources were generated
    pub fn is_empty(&self) -> bool {
        self.cluster_roles.is_empty() && self.cluster_role_bindings.is_empty()
    }

    /// Total count of generated objects
    pub fn resource_count(&self) -> usize {
        self.cluster_roles.len() + self.cluster_role_bindings.len()
    }
}

/// Namespace-scoped output of a compile
#[derive(Clone, Debug, Default, PartialEq)]
pub struct NamespacedResources {
    /// Target namespace
    pub namespace: String,
    /// Roles in role declaration order
    pub roles: Vec<RbacRole>,
    /// RoleBindings in role declaration order
    pub role_bindings: Vec<RoleBinding>,
}

impl NamespacedResources {
    /// Check if any resources were generated
    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.role_bindings.is_empty()
    }

    /// Total count of generated objects
    pub fn resource_count(&self) -> usize {
        self.roles.len() + self.role_bindings.len()
    }
}

/// Name of the Role generated for `role` in any namespace
pub fn role_name(role: &str) -> String {
    format!("{}-{}", RESOURCE_NAME_PREFIX, role)
}

/// Name of the RoleBinding generated for `role` in any namespace
pub fn role_binding_name(role: &str) -> String {
    format!("{}-binding-{}", RESOURCE_NAME_PREFIX, role)
}

/// Name of the ClusterRole generated for `role`
pub fn cluster_role_name(role: &str) -> String {
    format!("{}-global-{}", RESOURCE_NAME_PREFIX, role)
}

/// Name of the ClusterRoleBinding generated for `role`
pub fn cluster_role_binding_name(role: &str) -> String {
    format!("{}-global-binding-{}", RESOURCE_NAME_PREFIX, role)
}

/// Compiles one policy snapshot into RBAC objects
pub struct PolicyCompiler<'a> {
    config: &'a PolicyConfig,
    rules_ref: String,
    owner: String,
}

impl<'a> PolicyCompiler<'a> {
    /// Create a compiler for a config snapshot
    ///
    /// # Arguments
    /// * `config` - The decoded policy
    /// * `rules_ref` - Policy revision to stamp on objects (omitted if empty)
    /// * `owner` - Value of the owner label
    pub fn new(
        config: &'a PolicyConfig,
        rules_ref: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            config,
            rules_ref: rules_ref.into(),
            owner: owner.into(),
        }
    }

    /// Compile ClusterRoles and ClusterRoleBindings for globally granted roles
    ///
    /// Roles without global users or service accounts produce nothing.
    pub fn compile_global(&self) -> GlobalResources {
        let mut out = GlobalResources::default();

        for role in &self.config.roles {
            let subject_count = role.global_subject_count();
            if subject_count == 0 {
                continue;
            }
            debug!(
                role = %role.name,
                subject_count,
                "defining as clusterrole+clusterrolebinding due to global subjects"
            );

            let cluster_role = ClusterRole {
                metadata: self.metadata(cluster_role_name(&role.name), None),
                rules: Some(translate_rules(&role.rules)),
                ..Default::default()
            };

            let subjects = global_subjects(role);
            assert_subject_count(&role.name, subject_count, subjects.len());

            let binding = ClusterRoleBinding {
                metadata: self.metadata(cluster_role_binding_name(&role.name), None),
                role_ref: role_ref("ClusterRole", cluster_role_name(&role.name)),
                subjects: Some(subjects),
            };

            out.cluster_roles.push(cluster_role);
            out.cluster_role_bindings.push(binding);
        }

        out
    }

    /// Compile Roles and RoleBindings for one namespace
    ///
    /// Fails with [`Error::NamespaceNotFound`] when no project uses
    /// `namespace`. A role produces objects only if an assignment in this
    /// namespace names it; an assignment with empty subject lists still
    /// produces a binding with no subjects.
    pub fn compile_namespace(&self, namespace: &str) -> Result<NamespacedResources> {
        if self.config.project(namespace).is_none() {
            return Err(Error::namespace_not_found(namespace));
        }

        let mut out = NamespacedResources {
            namespace: namespace.to_string(),
            ..Default::default()
        };

        for role in &self.config.roles {
            for project in &self.config.projects {
                for assignment in &project.role_assignments {
                    if assignment.role != role.name {
                        continue;
                    }
                    if project.namespace != namespace {
                        debug!(
                            project = %project.namespace,
                            namespace,
                            role = %role.name,
                            "skipping assignment outside target namespace"
                        );
                        continue;
                    }

                    let rbac_role = RbacRole {
                        metadata: self.metadata(role_name(&role.name), Some(namespace)),
                        rules: Some(translate_rules(&role.rules)),
                    };
                    let binding = RoleBinding {
                        metadata: self.metadata(role_binding_name(&role.name), Some(namespace)),
                        role_ref: role_ref("Role", role_name(&role.name)),
                        subjects: Some(namespaced_subjects(assignment, namespace)),
                    };

                    out.roles.push(rbac_role);
                    out.role_bindings.push(binding);
                }
            }
        }

        debug!(
            namespace,
            roles = out.roles.len(),
            role_bindings = out.role_bindings.len(),
            "compiled namespace"
        );
        Ok(out)
    }

    fn metadata(&self, name: String, namespace: Option<&str>) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: namespace.map(str::to_string),
            labels: Some(object_labels(&self.owner)),
            annotations: Some(object_annotations(&self.rules_ref)),
            ..Default::default()
        }
    }
}

/// Labels added to every generated object
pub fn object_labels(owner: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(LABEL_OWNER.to_string(), owner.to_string())])
}

/// Annotations added to every generated object
///
/// The rules_ref annotation is only present when `rules_ref` is non-empty.
pub fn object_annotations(rules_ref: &str) -> BTreeMap<String, String> {
    let mut annotations =
        BTreeMap::from([(ANNOTATION_VERSION.to_string(), crate::version().to_string())]);
    if !rules_ref.is_empty() {
        annotations.insert(ANNOTATION_RULES_REF.to_string(), rules_ref.to_string());
    }
    annotations
}

fn translate_rules(rules: &[Rule]) -> Vec<PolicyRule> {
    rules
        .iter()
        .map(|rule| PolicyRule {
            api_groups: Some(rule.api_groups.clone()),
            resources: Some(rule.resources.clone()),
            verbs: rule.verbs.clone(),
            ..Default::default()
        })
        .collect()
}

fn role_ref(kind: &str, name: String) -> RoleRef {
    RoleRef {
        api_group: RBAC_API_GROUP.to_string(),
        kind: kind.to_string(),
        name,
    }
}

fn global_subjects(role: &Role) -> Vec<Subject> {
    let users = role.global_users.iter().map(|u| user_subject(u));
    let accounts = role
        .global_service_accounts
        .iter()
        .map(|sa| resolve_service_account(sa, GLOBAL_DEFAULT_NAMESPACE));
    users.chain(accounts).map(Subject::from).collect()
}

fn namespaced_subjects(assignment: &RoleUsers, namespace: &str) -> Vec<Subject> {
    let users = assignment.users.iter().map(|u| user_subject(u));
    let accounts = assignment
        .service_accounts
        .iter()
        .map(|sa| resolve_service_account(sa, namespace));
    users.chain(accounts).map(Subject::from).collect()
}

/// Every declared global subject must appear in the binding.
///
/// A mismatch can only come from a bug in subject construction, never from
/// input, so it panics rather than returning an error.
fn assert_subject_count(role: &str, expected: usize, added: usize) {
    assert_eq!(
        expected, added,
        "subject count mismatch when adding subjects to global role {role}"
    );
}

// =============================================================================
// Tests
// =============================================================================
