//! Live policy source
//!
//! The agent reads its policy from a ConfigMap key and watches that single
//! object for changes. The ConfigMap's annotations travel with the decoded
//! config as [`Provenance`] so the policy revision can be stamped onto
//! generated objects.

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use crate::config::PolicyConfig;
use crate::{Error, Result, ANNOTATION_RULES_REF, CONFIGMAP_KEY, UNKNOWN_RULES_REF};

/// Watch timeout (seconds); must stay under the client read timeout so the
/// API server closes idle watches before the client gives up on them.
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Namespace assumed when the ConfigMap reference has no `namespace/` part
pub const DEFAULT_SOURCE_NAMESPACE: &str = "default";

/// What happened to the policy source
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    /// Seen for the first time (including after a watch re-list)
    Added,
    /// Updated
    Modified,
    /// Removed
    Deleted,
}

impl ChangeKind {
    /// Label for logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
        }
    }
}

/// Out-of-band metadata of the fetched policy
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Provenance {
    /// `namespace/name` of the source object
    pub source_ref: String,
    /// resourceVersion of the source object, if known
    pub resource_version: Option<String>,
    /// Annotations of the source object
    pub annotations: BTreeMap<String, String>,
}

impl Provenance {
    /// Policy revision to stamp on generated objects.
    ///
    /// Falls back to `"unknown"` when the source carries no non-empty
    /// rules-ref annotation.
    pub fn rules_ref(&self) -> &str {
        match self.annotations.get(ANNOTATION_RULES_REF) {
            Some(r) if !r.is_empty() => r,
            _ => UNKNOWN_RULES_REF,
        }
    }
}

/// Where the agent gets its policy from
#[cfg_attr(test, automock)]
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// `namespace/name` for logs and errors
    fn source_ref(&self) -> String;

    /// Read and decode the current policy
    async fn fetch(&self) -> Result<(PolicyConfig, Provenance)>;

    /// Open a stream of change events.
    ///
    /// The stream yields errors for transient watch failures and keeps
    /// going; it ending means the watch has to be re-established.
    fn watch(&self) -> BoxStream<'static, Result<ChangeKind>>;
}

/// Split `namespace/name`; a bare name lives in `default`
pub fn parse_configmap_ref(raw: &str) -> (String, String) {
    match raw.split_once('/') {
        Some((ns, name)) => (ns.to_string(), name.to_string()),
        None => (DEFAULT_SOURCE_NAMESPACE.to_string(), raw.to_string()),
    }
}

/// Decode the policy held by a ConfigMap
pub fn decode_configmap(cm: &ConfigMap, source_ref: &str) -> Result<(PolicyConfig, Provenance)> {
    let data = cm
        .data
        .as_ref()
        .and_then(|d| d.get(CONFIGMAP_KEY))
        .filter(|s| !s.is_empty())
        .ok_or_else(|| Error::source_empty(source_ref, CONFIGMAP_KEY))?;

    let config = PolicyConfig::from_toml_str(data)?;
    let provenance = Provenance {
        source_ref: source_ref.to_string(),
        resource_version: cm.metadata.resource_version.clone(),
        annotations: cm.metadata.annotations.clone().unwrap_or_default(),
    };
    Ok((config, provenance))
}

/// Map a watcher event onto a change kind; bookkeeping events map to `None`
pub fn change_kind(event: &Event<ConfigMap>) -> Option<ChangeKind> {
    match event {
        Event::Apply(_) => Some(ChangeKind::Modified),
        Event::InitApply(_) => Some(ChangeKind::Added),
        Event::Delete(_) => Some(ChangeKind::Deleted),
        Event::Init | Event::InitDone => None,
    }
}

/// [`PolicySource`] backed by one ConfigMap
pub struct ConfigMapSource {
    api: Api<ConfigMap>,
    namespace: String,
    name: String,
}

impl ConfigMapSource {
    /// Source for `namespace/name`
    pub fn new(client: Client, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        let namespace = namespace.into();
        Self {
            api: Api::namespaced(client, &namespace),
            namespace,
            name: name.into(),
        }
    }

    /// Source from a `namespace/name` reference
    pub fn from_ref(client: Client, raw: &str) -> Self {
        let (namespace, name) = parse_configmap_ref(raw);
        Self::new(client, namespace, name)
    }
}

#[async_trait]
impl PolicySource for ConfigMapSource {
    fn source_ref(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    async fn fetch(&self) -> Result<(PolicyConfig, Provenance)> {
        let source_ref = self.source_ref();
        let cm = match self.api.get_opt(&self.name).await {
            Ok(Some(cm)) => cm,
            Ok(None) => return Err(Error::source_unavailable(source_ref, "configmap not found")),
            Err(e) => return Err(Error::source_unavailable(source_ref, e.to_string())),
        };
        debug!(
            source = %source_ref,
            resource_version = ?cm.metadata.resource_version,
            "fetched policy configmap"
        );
        decode_configmap(&cm, &source_ref)
    }

    fn watch(&self) -> BoxStream<'static, Result<ChangeKind>> {
        let source_ref = self.source_ref();
        let config = watcher::Config::default()
            .fields(&format!("metadata.name={}", self.name))
            .timeout(WATCH_TIMEOUT_SECS);

        watcher::watcher(self.api.clone(), config)
            .default_backoff()
            .filter_map(move |event| {
                let source_ref = source_ref.clone();
                async move {
                    match event {
                        Ok(event) => change_kind(&event).map(Ok),
                        Err(e) => Some(Err(Error::source_unavailable(source_ref, e.to_string()))),
                    }
                }
            })
            .boxed()
    }
}
