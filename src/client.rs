//! RBAC write operations against the cluster
//!
//! Apply is an unconditional full overwrite: `replace` (PUT without a
//! resourceVersion), falling back to `create` when the object does not
//! exist yet. There is no read-before-write and no patch merge, so any
//! field set by someone else on a permbot-named object is dropped.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding};
use kube::api::{Api, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, error};

#[cfg(test)]
use mockall::automock;

use crate::compiler::{GlobalResources, NamespacedResources};
use crate::{Error, Result};

// =============================================================================
// Trait for dependency injection and testability
// =============================================================================

/// Cluster operations used by the agent and one-shot apply
///
/// Implemented by [`KubeRbacClient`] in production and mocked in tests.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RbacClient: Send + Sync {
    /// Whether a namespace exists
    async fn namespace_exists(&self, name: &str) -> Result<bool>;

    /// Create or overwrite a Role
    async fn upsert_role(&self, namespace: &str, role: &Role, dry_run: bool) -> Result<()>;

    /// Create or overwrite a RoleBinding
    async fn upsert_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
        dry_run: bool,
    ) -> Result<()>;

    /// Create or overwrite a ClusterRole
    async fn upsert_cluster_role(&self, role: &ClusterRole, dry_run: bool) -> Result<()>;

    /// Create or overwrite a ClusterRoleBinding
    async fn upsert_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
        dry_run: bool,
    ) -> Result<()>;
}

/// kube-rs implementation of [`RbacClient`]
pub struct KubeRbacClient {
    client: Client,
}

impl KubeRbacClient {
    /// Wrap a kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Replace `object`, creating it on 404.
async fn replace_or_create<K>(api: Api<K>, object: &K, dry_run: bool) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + Serialize + DeserializeOwned + std::fmt::Debug,
{
    let name = object.meta().name.clone().unwrap_or_default();
    let params = PostParams {
        dry_run,
        field_manager: Some("permbot".to_string()),
    };

    match api.replace(&name, &params, object).await {
        Ok(_) => {
            debug!(kind = %K::kind(&()), %name, dry_run, "replaced");
            Ok(())
        }
        Err(kube::Error::Api(ae)) if ae.code == 404 => {
            api.create(&params, object).await?;
            debug!(kind = %K::kind(&()), %name, dry_run, "created");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl RbacClient for KubeRbacClient {
    async fn namespace_exists(&self, name: &str) -> Result<bool> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?.is_some())
    }

    async fn upsert_role(&self, namespace: &str, role: &Role, dry_run: bool) -> Result<()> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        replace_or_create(api, role, dry_run).await
    }

    async fn upsert_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
        dry_run: bool,
    ) -> Result<()> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        replace_or_create(api, binding, dry_run).await
    }

    async fn upsert_cluster_role(&self, role: &ClusterRole, dry_run: bool) -> Result<()> {
        let api: Api<ClusterRole> = Api::all(self.client.clone());
        replace_or_create(api, role, dry_run).await
    }

    async fn upsert_cluster_role_binding(
        &self,
        binding: &ClusterRoleBinding,
        dry_run: bool,
    ) -> Result<()> {
        let api: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        replace_or_create(api, binding, dry_run).await
    }
}

/// Per-object results of applying a batch
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApplyTally {
    /// Objects written
    pub applied: usize,
    /// Objects whose write failed
    pub failed: usize,
}

impl ApplyTally {
    fn record(&mut self, result: Result<()>) {
        match result {
            Ok(()) => self.applied += 1,
            Err(e) => {
                error!(error = %e, "unable to apply rbac object");
                self.failed += 1;
            }
        }
    }

    /// Add another tally into this one
    pub fn merge(&mut self, other: ApplyTally) {
        self.applied += other.applied;
        self.failed += other.failed;
    }
}

fn object_name<K: Resource>(object: &K) -> String {
    object.meta().name.clone().unwrap_or_default()
}

/// Apply ClusterRoles, then ClusterRoleBindings
///
/// Every object is attempted; failures are logged and counted.
pub async fn apply_global(
    client: &dyn RbacClient,
    resources: &GlobalResources,
    dry_run: bool,
) -> ApplyTally {
    let mut tally = ApplyTally::default();
    for role in &resources.cluster_roles {
        let result = client
            .upsert_cluster_role(role, dry_run)
            .await
            .map_err(|e| Error::apply("ClusterRole", object_name(role), e.to_string()));
        tally.record(result);
    }
    for binding in &resources.cluster_role_bindings {
        let result = client
            .upsert_cluster_role_binding(binding, dry_run)
            .await
            .map_err(|e| Error::apply("ClusterRoleBinding", object_name(binding), e.to_string()));
        tally.record(result);
    }
    tally
}

/// Apply Roles, then RoleBindings, of one namespace
pub async fn apply_namespaced(
    client: &dyn RbacClient,
    resources: &NamespacedResources,
    dry_run: bool,
) -> ApplyTally {
    let ns = resources.namespace.as_str();
    let mut tally = ApplyTally::default();
    for role in &resources.roles {
        let result = client
            .upsert_role(ns, role, dry_run)
            .await
            .map_err(|e| Error::apply_in_namespace("Role", ns, object_name(role), e.to_string()));
        tally.record(result);
    }
    for binding in &resources.role_bindings {
        let result = client
            .upsert_role_binding(ns, binding, dry_run)
            .await
            .map_err(|e| {
                Error::apply_in_namespace("RoleBinding", ns, object_name(binding), e.to_string())
            });
        tally.record(result);
    }
    tally
}
