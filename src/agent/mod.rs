//! Reconciliation agent
//!
//! Watches the policy source and, on every change, recompiles the whole
//! policy and overwrites every generated object. Cycles run one at a time
//! on the caller's task; a periodic resync re-applies the policy even when
//! no event arrives. Resyncs are counted in metrics but never notified.
//!
//! Outcome of a cycle:
//! - error if the fetch failed, the source was deleted, or any cluster-scoped
//!   object failed to apply
//! - success otherwise; namespace failures are logged and counted only

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::client::{apply_global, apply_namespaced, ApplyTally, RbacClient};
use crate::compiler::PolicyCompiler;
use crate::config::PolicyConfig;
use crate::metrics::{self, ApplyTimer, CycleOutcome};
use crate::notify::Notifier;
use crate::retry::{retry_with_backoff, Backoff, RetryConfig};
use crate::source::{ChangeKind, PolicySource, Provenance};
use crate::{Error, Result};

/// Default interval between full resyncs
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(600);

/// Default number of consecutive watch re-establishments before giving up
pub const DEFAULT_RECONNECT_ATTEMPTS: u32 = 10;

/// Agent behaviour knobs
#[derive(Clone, Debug)]
pub struct AgentConfig {
    /// Send every write with `dryRun=All`
    pub dry_run: bool,
    /// Interval between full resyncs
    pub resync_interval: Duration,
    /// Backoff for re-establishing the watch; also bounds the startup fetch
    pub reconnect: RetryConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            dry_run: false,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            reconnect: RetryConfig::with_max_attempts(DEFAULT_RECONNECT_ATTEMPTS),
        }
    }
}

/// What one apply cycle did
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CycleReport {
    /// Policy revision stamped on the objects
    pub rules_ref: String,
    /// Cluster-scoped objects written / failed
    pub global: ApplyTally,
    /// Namespaced objects written / failed, across all namespaces
    pub namespaced: ApplyTally,
    /// Namespaces with at least one failure
    pub namespace_failures: usize,
    /// Wall time of the apply
    pub duration_secs: f64,
}

impl CycleReport {
    /// Only cluster-scoped failures make a cycle fail
    pub fn outcome(&self) -> CycleOutcome {
        if self.global.failed > 0 {
            CycleOutcome::Error
        } else {
            CycleOutcome::Success
        }
    }
}

/// The long-running reconcile loop and its collaborators
pub struct Agent {
    client: Arc<dyn RbacClient>,
    source: Arc<dyn PolicySource>,
    notifier: Arc<dyn Notifier>,
    owner: String,
    config: AgentConfig,
}

impl Agent {
    /// Create an agent
    pub fn new(
        client: Arc<dyn RbacClient>,
        source: Arc<dyn PolicySource>,
        notifier: Arc<dyn Notifier>,
        owner: impl Into<String>,
        config: AgentConfig,
    ) -> Self {
        Self {
            client,
            source,
            notifier,
            owner: owner.into(),
            config,
        }
    }

    /// Read and decode the current policy
    pub async fn fetch_policy_source(&self) -> Result<(PolicyConfig, Provenance)> {
        self.source.fetch().await
    }

    /// Handle one change of the policy source
    ///
    /// A deletion is counted and reported as [`Error::SourceDeleted`];
    /// generated objects are left in place. Anything else triggers a full
    /// fetch and apply, followed by a notification.
    pub async fn on_change_event(&self, kind: ChangeKind) -> Result<CycleReport> {
        debug!(event = kind.as_str(), "policy source changed");

        if kind == ChangeKind::Deleted {
            metrics::record_change(CycleOutcome::Error);
            return Err(Error::source_deleted(self.source.source_ref()));
        }

        let (config, provenance) = match self.fetch_policy_source().await {
            Ok(fetched) => fetched,
            Err(e) => {
                metrics::record_change(CycleOutcome::Error);
                self.notifier.notify(false).await;
                return Err(e);
            }
        };

        let report = self
            .apply_cycle(&config, &provenance, self.config.dry_run)
            .await;
        let outcome = report.outcome();
        metrics::record_change(outcome);
        self.notifier.notify(outcome.is_success()).await;
        Ok(report)
    }

    /// Compile and apply the whole policy
    ///
    /// Cluster-scoped objects go first, then each project's namespace in
    /// config order. Nothing aborts the cycle.
    pub async fn apply_cycle(
        &self,
        config: &PolicyConfig,
        provenance: &Provenance,
        dry_run: bool,
    ) -> CycleReport {
        let rules_ref = provenance.rules_ref().to_string();
        info!(
            projects = config.projects.len(),
            roles = config.roles.len(),
            rules_ref = %rules_ref,
            dry_run,
            "applying policy"
        );

        let timer = ApplyTimer::start();
        let compiler = PolicyCompiler::new(config, rules_ref.as_str(), self.owner.as_str());

        let global = apply_global(self.client.as_ref(), &compiler.compile_global(), dry_run).await;
        if global.failed > 0 {
            error!(failed = global.failed, "unable to apply global roles");
        }

        let mut namespaced = ApplyTally::default();
        let mut namespace_failures = 0;
        for project in &config.projects {
            let ns = project.namespace.as_str();
            let tally = match compiler.compile_namespace(ns) {
                Ok(resources) => {
                    apply_namespaced(self.client.as_ref(), &resources, dry_run).await
                }
                Err(e) => {
                    error!(namespace = %ns, error = %e, "unable to compile namespaced roles");
                    ApplyTally { applied: 0, failed: 1 }
                }
            };
            if tally.failed > 0 {
                error!(namespace = %ns, failed = tally.failed, "unable to apply namespaced roles");
                namespace_failures += 1;
            }
            namespaced.merge(tally);
        }

        let duration_secs = timer.complete();
        let report = CycleReport {
            rules_ref,
            global,
            namespaced,
            namespace_failures,
            duration_secs,
        };
        info!(
            outcome = report.outcome().as_str(),
            global_applied = report.global.applied,
            namespaced_applied = report.namespaced.applied,
            namespace_failures,
            duration_secs,
            "policy applied"
        );
        report
    }

    /// Run until `shutdown` resolves or the watch cannot be kept open
    ///
    /// The startup fetch must succeed. Transient failures are retried with
    /// bounded backoff; a broken policy fails at once. After that the
    /// loop multiplexes source events, a periodic resync, and shutdown.
    /// Shutdown is only observed between cycles.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let (config, provenance) = retry_with_backoff(
            &self.config.reconnect,
            "fetch_policy_source",
            Error::is_retryable,
            || self.fetch_policy_source(),
        )
        .await?;
        info!(
            source = %provenance.source_ref,
            projects = config.projects.len(),
            roles = config.roles.len(),
            "policy source reachable"
        );

        let mut shutdown = std::pin::pin!(shutdown);

        let mut resync = tokio::time::interval(self.config.resync_interval);
        resync.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately; the watch's initial listing
        // already triggers an apply.
        resync.tick().await;

        let mut backoff = Backoff::new(&self.config.reconnect);
        let mut attempts = 0u32;

        loop {
            let mut events = self.source.watch();
            debug!("waiting for policy source events");

            loop {
                tokio::select! {
                    _ = &mut shutdown => {
                        info!("shutdown requested, stopping agent");
                        return Ok(());
                    }
                    event = events.next() => match event {
                        Some(Ok(kind)) => {
                            attempts = 0;
                            backoff.reset();
                            self.log_cycle(self.on_change_event(kind).await);
                        }
                        Some(Err(e)) => warn!(error = %e, "policy source watch error"),
                        None => break,
                    },
                    _ = resync.tick() => {
                        debug!("running periodic resync");
                        self.log_cycle(self.resync().await);
                    }
                }
            }

            attempts += 1;
            if self.config.reconnect.exhausted(attempts) {
                error!(attempts, "policy source watch closed, giving up");
                return Err(Error::WatchClosed { attempts });
            }
            let delay = backoff.next_delay();
            warn!(
                attempts,
                delay_ms = delay.as_millis() as u64,
                "policy source watch closed, re-establishing"
            );
            tokio::select! {
                _ = &mut shutdown => {
                    info!("shutdown requested, stopping agent");
                    return Ok(());
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Re-apply the current policy without a source change
    ///
    /// Same fetch and apply as a change event, counted in metrics, but the
    /// notifier is not called.
    pub async fn resync(&self) -> Result<CycleReport> {
        let (config, provenance) = match self.fetch_policy_source().await {
            Ok(fetched) => fetched,
            Err(e) => {
                metrics::record_change(CycleOutcome::Error);
                return Err(e);
            }
        };

        let report = self
            .apply_cycle(&config, &provenance, self.config.dry_run)
            .await;
        metrics::record_change(report.outcome());
        Ok(report)
    }

    fn log_cycle(&self, result: Result<CycleReport>) {
        match result {
            Ok(report) if report.outcome().is_success() => {
                debug!(rules_ref = %report.rules_ref, "cycle complete")
            }
            Ok(report) => warn!(
                rules_ref = %report.rules_ref,
                global_failed = report.global.failed,
                "cycle completed with errors"
            ),
            Err(e @ Error::SourceDeleted { .. }) => {
                warn!(error = %e, "policy source deleted, leaving generated objects in place")
            }
            Err(e) if e.is_source_error() => {
                error!(error = %e, "policy source unusable, keeping current objects")
            }
            Err(e) => error!(error = %e, "unable to process policy change"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockRbacClient;
    use crate::notify::MockNotifier;
    use crate::source::MockPolicySource;
    use crate::{ANNOTATION_RULES_REF, LABEL_OWNER};
    use futures::stream;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

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
  verbs = ["get", "list"]
"#;

    type Calls = Arc<Mutex<Vec<String>>>;

    fn policy() -> PolicyConfig {
        PolicyConfig::from_toml_str(POLICY).unwrap()
    }

    fn provenance(rules_ref: Option<&str>) -> Provenance {
        Provenance {
            source_ref: "permbot/config".to_string(),
            resource_version: Some("1".to_string()),
            annotations: rules_ref
                .map(|r| BTreeMap::from([(ANNOTATION_RULES_REF.to_string(), r.to_string())]))
                .unwrap_or_default(),
        }
    }

    fn name_of<K: kube::Resource>(k: &K) -> String {
        k.meta().name.clone().unwrap_or_default()
    }

    /// Client that records every write and fails those whose namespace (or
    /// "cluster" for cluster-scoped kinds) is in `failing`
    fn recording_client(calls: &Calls, failing: &'static [&'static str]) -> MockRbacClient {
        let mut client = MockRbacClient::new();
        let outcome = move |scope: &str| {
            if failing.iter().any(|f| *f == scope) {
                Err(Error::internal("forbidden"))
            } else {
                Ok(())
            }
        };

        let c = calls.clone();
        client.expect_upsert_cluster_role().returning(move |cr, _| {
            c.lock().unwrap().push(format!("ClusterRole {}", name_of(cr)));
            outcome("cluster")
        });
        let c = calls.clone();
        client
            .expect_upsert_cluster_role_binding()
            .returning(move |crb, _| {
                c.lock().unwrap().push(format!("ClusterRoleBinding {}", name_of(crb)));
                outcome("cluster")
            });
        let c = calls.clone();
        client.expect_upsert_role().returning(move |ns, r, _| {
            c.lock().unwrap().push(format!("Role {ns}/{}", name_of(r)));
            outcome(ns)
        });
        let c = calls.clone();
        client.expect_upsert_role_binding().returning(move |ns, rb, _| {
            c.lock().unwrap().push(format!("RoleBinding {ns}/{}", name_of(rb)));
            outcome(ns)
        });
        client
    }

    fn source_with(rules_ref: Option<&'static str>) -> MockPolicySource {
        let mut source = MockPolicySource::new();
        source
            .expect_source_ref()
            .returning(|| "permbot/config".to_string());
        source
            .expect_fetch()
            .returning(move || Ok((policy(), provenance(rules_ref))));
        source
    }

    fn notifier_expecting(success: bool, times: usize) -> MockNotifier {
        let mut notifier = MockNotifier::new();
        notifier
            .expect_notify()
            .withf(move |s| *s == success)
            .times(times)
            .returning(|_| ());
        notifier
    }

    fn agent(client: MockRbacClient, source: MockPolicySource, notifier: MockNotifier) -> Agent {
        Agent::new(
            Arc::new(client),
            Arc::new(source),
            Arc::new(notifier),
            "permbot",
            AgentConfig::default(),
        )
    }

    fn fast_reconnect(attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts: attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    // ==========================================================================
    // Story Tests: a full cycle
    // ==========================================================================

    /// Story: a policy change rewrites cluster-scoped objects first, then each
    /// project's namespace in config order, and reports success.
    #[tokio::test]
    async fn story_change_applies_everything_in_order() {
        let calls = Calls::default();
        let agent = agent(
            recording_client(&calls, &[]),
            source_with(Some("abc123")),
            notifier_expecting(true, 1),
        );

        let report = agent.on_change_event(ChangeKind::Modified).await.unwrap();

        assert_eq!(report.outcome(), CycleOutcome::Success);
        assert_eq!(report.rules_ref, "abc123");
        assert_eq!(report.global, ApplyTally { applied: 2, failed: 0 });
        assert_eq!(report.namespaced, ApplyTally { applied: 4, failed: 0 });
        assert_eq!(
            *calls.lock().unwrap(),
            vec![
                "ClusterRole permbot-auto-role-global-viewer",
                "ClusterRoleBinding permbot-auto-role-global-binding-viewer",
                "Role team-a/permbot-auto-role-viewer",
                "RoleBinding team-a/permbot-auto-role-binding-viewer",
                "Role team-b/permbot-auto-role-viewer",
                "RoleBinding team-b/permbot-auto-role-binding-viewer",
            ]
        );
    }

    /// Story: a namespace the agent is not allowed to write into is logged
    /// and counted, the other namespaces still get their objects, and the
    /// cycle still counts as a success.
    #[tokio::test]
    async fn story_namespace_failure_does_not_fail_the_cycle() {
        let calls = Calls::default();
        let agent = agent(
            recording_client(&calls, &["team-a"]),
            source_with(None),
            notifier_expecting(true, 1),
        );

        let report = agent.on_change_event(ChangeKind::Added).await.unwrap();

        assert_eq!(report.outcome(), CycleOutcome::Success);
        assert_eq!(report.namespace_failures, 1);
        assert_eq!(report.namespaced, ApplyTally { applied: 2, failed: 2 });
        assert!(calls
            .lock()
            .unwrap()
            .contains(&"RoleBinding team-b/permbot-auto-role-binding-viewer".to_string()));
    }

    /// Story: when cluster-scoped writes fail, namespaces are still applied
    /// but the cycle is an error and the notifier hears about it.
    #[tokio::test]
    async fn story_global_failure_fails_the_cycle() {
        let calls = Calls::default();
        let agent = agent(
            recording_client(&calls, &["cluster"]),
            source_with(None),
            notifier_expecting(false, 1),
        );

        let report = agent.on_change_event(ChangeKind::Modified).await.unwrap();

        assert_eq!(report.outcome(), CycleOutcome::Error);
        assert_eq!(report.global.failed, 2);
        assert_eq!(report.namespaced.applied, 4);
    }

    /// Story: deleting the ConfigMap is reported, nothing is written and
    /// nobody is notified.
    #[tokio::test]
    async fn story_source_deleted_applies_nothing() {
        let mut source = MockPolicySource::new();
        source
            .expect_source_ref()
            .returning(|| "permbot/config".to_string());
        source.expect_fetch().never();

        let mut notifier = MockNotifier::new();
        notifier.expect_notify().never();

        let agent = agent(MockRbacClient::new(), source, notifier);
        let err = agent.on_change_event(ChangeKind::Deleted).await.unwrap_err();

        assert!(matches!(err, Error::SourceDeleted { ref source_ref } if source_ref == "permbot/config"));
    }

    /// Story: a ConfigMap with broken TOML fails the cycle before any write.
    #[tokio::test]
    async fn story_fetch_failure_notifies_error() {
        let mut source = MockPolicySource::new();
        source
            .expect_fetch()
            .returning(|| Err(Error::config_decode("expected `]`")));

        let agent = agent(MockRbacClient::new(), source, notifier_expecting(false, 1));
        let err = agent.on_change_event(ChangeKind::Modified).await.unwrap_err();

        assert!(matches!(err, Error::ConfigDecode { .. }));
    }

    // ==========================================================================
    // apply_cycle details
    // ==========================================================================

    #[tokio::test]
    async fn missing_rules_ref_is_stamped_unknown() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut client = MockRbacClient::new();
        let s = seen.clone();
        client.expect_upsert_cluster_role().returning(move |cr, _| {
            s.lock().unwrap().push(cr.metadata.clone());
            Ok(())
        });
        client
            .expect_upsert_cluster_role_binding()
            .returning(|_, _| Ok(()));
        client.expect_upsert_role().returning(|_, _, _| Ok(()));
        client.expect_upsert_role_binding().returning(|_, _, _| Ok(()));

        let agent = agent(client, MockPolicySource::new(), MockNotifier::new());
        let report = agent
            .apply_cycle(&policy(), &provenance(None), false)
            .await;

        assert_eq!(report.rules_ref, "unknown");
        let meta = &seen.lock().unwrap()[0];
        assert_eq!(
            meta.annotations.as_ref().unwrap().get(ANNOTATION_RULES_REF),
            Some(&"unknown".to_string())
        );
        assert_eq!(
            meta.labels.as_ref().unwrap().get(LABEL_OWNER),
            Some(&"permbot".to_string())
        );
    }

    #[tokio::test]
    async fn dry_run_is_passed_to_every_write() {
        let mut client = MockRbacClient::new();
        client
            .expect_upsert_cluster_role()
            .withf(|_, dry_run| *dry_run)
            .returning(|_, _| Ok(()));
        client
            .expect_upsert_cluster_role_binding()
            .withf(|_, dry_run| *dry_run)
            .returning(|_, _| Ok(()));
        client
            .expect_upsert_role()
            .withf(|_, _, dry_run| *dry_run)
            .returning(|_, _, _| Ok(()));
        client
            .expect_upsert_role_binding()
            .withf(|_, _, dry_run| *dry_run)
            .returning(|_, _, _| Ok(()));

        let agent = agent(client, MockPolicySource::new(), MockNotifier::new());
        let report = agent.apply_cycle(&policy(), &provenance(None), true).await;
        assert_eq!(report.global.failed + report.namespaced.failed, 0);
    }

    #[tokio::test]
    async fn resync_applies_without_notifying() {
        let calls = Calls::default();
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().never();

        let agent = agent(recording_client(&calls, &[]), source_with(None), notifier);
        let report = agent.resync().await.unwrap();

        assert_eq!(report.outcome(), CycleOutcome::Success);
        assert_eq!(calls.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn resync_fetch_failure_is_not_notified() {
        let mut source = MockPolicySource::new();
        source
            .expect_fetch()
            .returning(|| Err(Error::source_unavailable("permbot/config", "timeout")));
        let mut notifier = MockNotifier::new();
        notifier.expect_notify().never();

        let agent = agent(MockRbacClient::new(), source, notifier);
        let err = agent.resync().await.unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
    }

    // ==========================================================================
    // run loop
    // ==========================================================================

    #[tokio::test]
    async fn run_gives_up_when_startup_fetch_keeps_failing() {
        let mut source = MockPolicySource::new();
        source
            .expect_fetch()
            .times(2)
            .returning(|| Err(Error::source_unavailable("permbot/config", "not found")));
        source.expect_watch().never();

        let agent = Agent::new(
            Arc::new(MockRbacClient::new()),
            Arc::new(source),
            Arc::new(MockNotifier::new()),
            "permbot",
            AgentConfig {
                reconnect: fast_reconnect(2),
                ..Default::default()
            },
        );

        let err = agent.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn run_fails_fast_on_broken_startup_policy() {
        let mut source = MockPolicySource::new();
        source
            .expect_fetch()
            .times(1)
            .returning(|| Err(Error::config_decode("expected `]`")));
        source.expect_watch().never();

        let agent = Agent::new(
            Arc::new(MockRbacClient::new()),
            Arc::new(source),
            Arc::new(MockNotifier::new()),
            "permbot",
            AgentConfig {
                reconnect: fast_reconnect(4),
                ..Default::default()
            },
        );

        let err = agent.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, Error::ConfigDecode { .. }));
    }

    #[tokio::test]
    async fn run_processes_events_then_gives_up_on_closed_watch() {
        let calls = Calls::default();
        let mut source = source_with(None);
        // first watch delivers the initial listing, later ones close at once
        let mut first = true;
        source.expect_watch().returning(move || {
            if std::mem::take(&mut first) {
                stream::iter(vec![Ok(ChangeKind::Added)]).boxed()
            } else {
                stream::empty().boxed()
            }
        });

        let agent = Agent::new(
            Arc::new(recording_client(&calls, &[])),
            Arc::new(source),
            Arc::new(notifier_expecting(true, 1)),
            "permbot",
            AgentConfig {
                reconnect: fast_reconnect(3),
                ..Default::default()
            },
        );

        let err = agent.run(std::future::pending()).await.unwrap_err();
        assert!(matches!(err, Error::WatchClosed { attempts: 3 }));
        assert_eq!(calls.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let mut source = source_with(None);
        source
            .expect_watch()
            .returning(|| stream::pending().boxed());

        let agent = agent(MockRbacClient::new(), source, MockNotifier::new());
        agent.run(async {}).await.unwrap();
    }

    #[tokio::test]
    async fn watch_errors_are_not_fatal() {
        let calls = Calls::default();
        let mut source = source_with(None);
        source.expect_watch().times(1).returning(|| {
            stream::iter(vec![
                Err(Error::source_unavailable("permbot/config", "connection reset")),
                Ok(ChangeKind::Modified),
            ])
            .chain(stream::pending())
            .boxed()
        });

        let agent = Arc::new(agent(
            recording_client(&calls, &[]),
            source,
            notifier_expecting(true, 1),
        ));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let runner = {
            let agent = agent.clone();
            tokio::spawn(async move {
                agent
                    .run(async {
                        let _ = rx.await;
                    })
                    .await
            })
        };

        for _ in 0..100 {
            if calls.lock().unwrap().len() == 6 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        tx.send(()).unwrap();
        runner.await.unwrap().unwrap();
        assert_eq!(calls.lock().unwrap().len(), 6);
    }
}
