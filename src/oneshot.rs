//! One-shot render and apply
//!
//! Used by the `render` and `apply` commands (and CI pipelines) to produce or
//! push the objects for a policy file without running the agent.

use tracing::{error, info, warn};

use crate::client::{apply_global, apply_namespaced, ApplyTally, RbacClient};
use crate::compiler::PolicyCompiler;
use crate::config::PolicyConfig;
use crate::render::YamlStream;
use crate::{Result, DEFAULT_OWNER};

/// Options for [`render`]
#[derive(Clone, Debug)]
pub struct RenderOptions {
    /// Only this namespace; `None` means every project
    pub namespace: Option<String>,
    /// Include cluster-scoped objects
    pub global: bool,
    /// Policy revision to stamp; empty omits the annotation
    pub rules_ref: String,
    /// Owner label value
    pub owner: String,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            namespace: None,
            global: true,
            rules_ref: String::new(),
            owner: DEFAULT_OWNER.to_string(),
        }
    }
}

/// Options for [`apply`]
#[derive(Clone, Debug, Default)]
pub struct ApplyOptions {
    /// Which objects to build
    pub render: RenderOptions,
    /// Send writes with `dryRun=All`
    pub dry_run: bool,
}

/// Result of a one-shot apply
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplySummary {
    /// Namespaces that were written to
    pub namespaces_applied: Vec<String>,
    /// Namespaces skipped because they do not exist in the cluster
    pub namespaces_skipped: Vec<String>,
    /// Namespaces skipped because their existence could not be checked
    pub namespaces_failed: Vec<String>,
    /// Object writes across namespaces and cluster scope
    pub objects: ApplyTally,
}

impl ApplySummary {
    /// Whether any write or namespace lookup failed
    pub fn has_failures(&self) -> bool {
        self.objects.failed > 0 || !self.namespaces_failed.is_empty()
    }
}

fn target_namespaces<'a>(config: &'a PolicyConfig, only: Option<&'a str>) -> Vec<&'a str> {
    match only {
        Some(ns) => vec![ns],
        None => config
            .projects
            .iter()
            .map(|p| p.namespace.as_str())
            .collect(),
    }
}

/// Render the policy as a multi-document YAML stream
///
/// Namespaced Roles and RoleBindings come first (one namespace at a time),
/// then cluster-scoped objects when `global` is set. A requested namespace
/// that is not in the policy fails with `NamespaceNotFound`.
pub fn render(config: &PolicyConfig, options: &RenderOptions) -> Result<String> {
    let compiler = PolicyCompiler::new(config, options.rules_ref.as_str(), options.owner.as_str());
    let mut stream = YamlStream::new();

    for ns in target_namespaces(config, options.namespace.as_deref()) {
        stream.push_namespaced(&compiler.compile_namespace(ns)?)?;
    }
    if options.global {
        stream.push_global(&compiler.compile_global())?;
    }
    Ok(stream.finish())
}

/// Apply the policy against a cluster once
///
/// Namespaces missing from the cluster are skipped with a warning. A
/// namespace whose lookup fails is logged, recorded and skipped. Per-object
/// failures are logged and counted. None of these stop the run.
pub async fn apply(
    client: &dyn RbacClient,
    config: &PolicyConfig,
    options: &ApplyOptions,
) -> Result<ApplySummary> {
    let render = &options.render;
    let compiler = PolicyCompiler::new(config, render.rules_ref.as_str(), render.owner.as_str());
    let mut summary = ApplySummary::default();

    for ns in target_namespaces(config, render.namespace.as_deref()) {
        let resources = compiler.compile_namespace(ns)?;
        match client.namespace_exists(ns).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(namespace = %ns, "namespace does not exist, skipping");
                summary.namespaces_skipped.push(ns.to_string());
                continue;
            }
            Err(e) => {
                error!(namespace = %ns, error = %e, "problem with namespace, skipping");
                summary.namespaces_failed.push(ns.to_string());
                continue;
            }
        }
        let tally = apply_namespaced(client, &resources, options.dry_run).await;
        info!(namespace = %ns, applied = tally.applied, failed = tally.failed, "namespace applied");
        summary.objects.merge(tally);
        summary.namespaces_applied.push(ns.to_string());
    }

    if render.global {
        let tally = apply_global(client, &compiler.compile_global(), options.dry_run).await;
        info!(applied = tally.applied, failed = tally.failed, "global roles applied");
        summary.objects.merge(tally);
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockRbacClient;
    use crate::render::DOCUMENT_SEPARATOR;
    use crate::Error;

    const POLICY: &str = r#"
[[project]]
namespace = "team-a"
  [[project.roles]]
  role = "viewer"
  users = ["alice"]

[[project]]
namespace = "team-b"
  [[project.roles]]
  role = "viewer"
  serviceAccounts = ["ci"]

[[role]]
name = "viewer"
globalUsers = ["admin"]
  [[role.rules]]
  apiGroups = [""]
  resources = ["pods"]
  verbs = ["get"]
"#;

    fn policy() -> PolicyConfig {
        PolicyConfig::from_toml_str(POLICY).unwrap()
    }

    fn kinds(yaml: &str) -> Vec<String> {
        yaml.split(DOCUMENT_SEPARATOR)
            .map(|doc| {
                let kind = doc
                    .lines()
                    .find_map(|l| l.strip_prefix("kind: "))
                    .unwrap_or_default();
                let ns = doc
                    .lines()
                    .find_map(|l| l.strip_prefix("  namespace: "))
                    .unwrap_or("-");
                format!("{kind} {ns}")
            })
            .collect()
    }

    #[test]
    fn render_orders_namespaces_then_global() {
        let out = render(&policy(), &RenderOptions::default()).unwrap();
        assert_eq!(
            kinds(&out),
            vec![
                "Role team-a",
                "RoleBinding team-a",
                "Role team-b",
                "RoleBinding team-b",
                "ClusterRole -",
                "ClusterRoleBinding -",
            ]
        );
    }

    #[test]
    fn render_single_namespace_without_global() {
        let options = RenderOptions {
            namespace: Some("team-b".to_string()),
            global: false,
            ..Default::default()
        };
        let out = render(&policy(), &options).unwrap();
        assert_eq!(kinds(&out), vec!["Role team-b", "RoleBinding team-b"]);
        assert!(out.contains("name: ci"));
    }

    #[test]
    fn render_unknown_namespace_fails() {
        let options = RenderOptions {
            namespace: Some("nope".to_string()),
            ..Default::default()
        };
        let err = render(&policy(), &options).unwrap_err();
        assert!(matches!(err, Error::NamespaceNotFound { ref namespace } if namespace == "nope"));
    }

    #[test]
    fn render_stamps_rules_ref_when_given() {
        let options = RenderOptions {
            rules_ref: "v42".to_string(),
            ..Default::default()
        };
        let out = render(&policy(), &options).unwrap();
        assert!(out.contains("dafni.ac.uk/permbot-rules-ref: v42"));

        let out = render(&policy(), &RenderOptions::default()).unwrap();
        assert!(!out.contains("permbot-rules-ref"));
    }

    #[tokio::test]
    async fn apply_skips_missing_namespaces() {
        let mut client = MockRbacClient::new();
        client
            .expect_namespace_exists()
            .returning(|ns| Ok(ns == "team-b"));
        client
            .expect_upsert_role()
            .withf(|ns, _, _| ns == "team-b")
            .times(1)
            .returning(|_, _, _| Ok(()));
        client
            .expect_upsert_role_binding()
            .withf(|ns, _, _| ns == "team-b")
            .times(1)
            .returning(|_, _, _| Ok(()));
        client
            .expect_upsert_cluster_role()
            .times(1)
            .returning(|_, _| Ok(()));
        client
            .expect_upsert_cluster_role_binding()
            .times(1)
            .returning(|_, _| Err(Error::internal("forbidden")));

        let summary = apply(&client, &policy(), &ApplyOptions::default())
            .await
            .unwrap();

        assert_eq!(summary.namespaces_applied, vec!["team-b"]);
        assert_eq!(summary.namespaces_skipped, vec!["team-a"]);
        assert_eq!(summary.objects, ApplyTally { applied: 3, failed: 1 });
        assert!(summary.has_failures());
    }

    #[tokio::test]
    async fn apply_continues_past_namespace_lookup_errors() {
        let mut client = MockRbacClient::new();
        client.expect_namespace_exists().returning(|ns| {
            if ns == "team-a" {
                Err(Error::internal("namespaces \"team-a\" is forbidden"))
            } else {
                Ok(true)
            }
        });
        client
            .expect_upsert_role()
            .withf(|ns, _, _| ns == "team-b")
            .times(1)
            .returning(|_, _, _| Ok(()));
        client
            .expect_upsert_role_binding()
            .withf(|ns, _, _| ns == "team-b")
            .times(1)
            .returning(|_, _, _| Ok(()));
        client.expect_upsert_cluster_role().returning(|_, _| Ok(()));
        client
            .expect_upsert_cluster_role_binding()
            .returning(|_, _| Ok(()));

        let summary = apply(&client, &policy(), &ApplyOptions::default())
            .await
            .unwrap();

        assert_eq!(summary.namespaces_failed, vec!["team-a"]);
        assert_eq!(summary.namespaces_applied, vec!["team-b"]);
        assert!(summary.namespaces_skipped.is_empty());
        assert_eq!(summary.objects, ApplyTally { applied: 4, failed: 0 });
        assert!(summary.has_failures());
    }

    #[tokio::test]
    async fn apply_without_global_touches_no_cluster_objects() {
        let mut client = MockRbacClient::new();
        client.expect_namespace_exists().returning(|_| Ok(true));
        client.expect_upsert_role().returning(|_, _, _| Ok(()));
        client.expect_upsert_role_binding().returning(|_, _, _| Ok(()));
        client.expect_upsert_cluster_role().never();
        client.expect_upsert_cluster_role_binding().never();

        let options = ApplyOptions {
            render: RenderOptions {
                global: false,
                ..Default::default()
            },
            dry_run: true,
        };
        let summary = apply(&client, &policy(), &options).await.unwrap();
        assert!(!summary.has_failures());
        assert_eq!(summary.namespaces_applied.len(), 2);
    }
}
