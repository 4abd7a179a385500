//! Outcome notifications
//!
//! After every fetch/apply cycle the agent tells a [`Notifier`] whether it
//! succeeded. Notification failures are logged and never reach the agent.

use async_trait::async_trait;
use minijinja::{context, Environment};
use serde::Serialize;
use tracing::{debug, error};

#[cfg(test)]
use mockall::automock;

use crate::{Error, Result};

/// Slack message template loaded at compile time
const SLACK_TEMPLATE: &str = include_str!("../templates/slack.txt");

/// Username the webhook posts as
pub const SLACK_USERNAME: &str = "Permbot";

/// Receives the outcome of each agent cycle
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Report one cycle's outcome; must not fail
    async fn notify(&self, success: bool);
}

/// Body of a Slack incoming-webhook request
#[derive(Debug, Serialize)]
pub struct WebhookMessage {
    /// Display name of the poster
    pub username: String,
    /// Message text (Slack mrkdwn)
    pub text: String,
}

/// Render the notification text
pub fn render_message(success: bool, owner: &str, version: &str) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("slack", SLACK_TEMPLATE)
        .map_err(|e| Error::internal_with_context("slack_template", e.to_string()))?;
    env.get_template("slack")
        .and_then(|t| {
            t.render(context! {
                success => success,
                owner => owner,
                version => version,
            })
        })
        .map(|text| text.trim_end().to_string())
        .map_err(|e| Error::internal_with_context("slack_template", e.to_string()))
}

/// Posts outcomes to a Slack incoming webhook
///
/// Without a webhook URL every notification is skipped with a debug log.
pub struct SlackNotifier {
    http: reqwest::Client,
    webhook_url: Option<String>,
    owner: String,
}

impl SlackNotifier {
    /// Create a notifier; an empty URL counts as unset
    pub fn new(webhook_url: Option<String>, owner: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            webhook_url: webhook_url.filter(|u| !u.is_empty()),
            owner: owner.into(),
        }
    }

    /// Whether a webhook is configured
    pub fn is_enabled(&self) -> bool {
        self.webhook_url.is_some()
    }

    async fn post(&self, url: &str, success: bool) -> Result<()> {
        let message = WebhookMessage {
            username: SLACK_USERNAME.to_string(),
            text: render_message(success, &self.owner, crate::version())?,
        };
        self.http
            .post(url)
            .json(&message)
            .send()
            .await
            .and_then(|resp| resp.error_for_status())
            .map_err(|e| Error::internal_with_context("slack_webhook", e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for SlackNotifier {
    async fn notify(&self, success: bool) {
        let Some(url) = self.webhook_url.as_deref() else {
            debug!("skipping slack notification: webhook URL not set");
            return;
        };
        match self.post(url, success).await {
            Ok(()) => debug!(success, "slack notification sent"),
            Err(e) => error!(error = %e, "unable to post slack notification"),
        }
    }
}
