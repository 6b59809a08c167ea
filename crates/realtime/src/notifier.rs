//! Offline notifier bridge: hands one-to-one messages for absent recipients
//! to the push collaborator.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use shared::domain::{ChatKind, MessageKind, UserId};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
    dispatcher::Dispatcher,
    event::ChatMessage,
    ports::{ChatDirectory, PushNotifier},
};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);
const ELLIPSIS: &str = "...";

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    /// Members considered per message, before any presence check.
    pub max_recipients: usize,
    /// Upper bound on the push body, in characters.
    pub summary_max_chars: usize,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            max_recipients: 100,
            summary_max_chars: 100,
        }
    }
}

#[derive(Clone)]
pub struct OfflineNotifier {
    dispatcher: Dispatcher,
    directory: Arc<dyn ChatDirectory>,
    pusher: Arc<dyn PushNotifier>,
    config: NotifierConfig,
}

impl OfflineNotifier {
    pub fn new(
        dispatcher: Dispatcher,
        directory: Arc<dyn ChatDirectory>,
        pusher: Arc<dyn PushNotifier>,
        config: NotifierConfig,
    ) -> Self {
        Self {
            dispatcher,
            directory,
            pusher,
            config,
        }
    }

    /// Pushes `message` to every absent recipient of a private chat and
    /// returns how many pushes were accepted. Group and channel chats never
    /// push.
    pub async fn notify(&self, message: &ChatMessage) -> Result<usize> {
        let kind = self.directory.chat_kind(message.chat_id).await?;
        if kind != Some(ChatKind::Private) {
            return Ok(0);
        }

        let mut members = self.directory.member_ids(message.chat_id).await?;
        members.truncate(self.config.max_recipients);

        let title = self.sender_title(message.sender_id).await?;
        let body = summarize(message.kind, &message.content, self.config.summary_max_chars);
        let data = BTreeMap::from([
            ("chat_id".to_string(), message.chat_id.to_string()),
            ("message_id".to_string(), message.message_id.to_string()),
            ("sender_id".to_string(), message.sender_id.to_string()),
        ]);

        let mut pushed = 0;
        for recipient in members.into_iter().filter(|user| *user != message.sender_id) {
            if self.dispatcher.is_present(recipient).await {
                debug!(user_id = %recipient, "recipient online; no push");
                continue;
            }
            match self.pusher.push_notify(recipient, &title, &body, &data).await {
                Ok(()) => pushed += 1,
                Err(err) => warn!(
                    user_id = %recipient,
                    message_id = %message.message_id,
                    error = %err,
                    "offline push failed"
                ),
            }
        }
        Ok(pushed)
    }

    /// Runs [`Self::notify`] off the request path. Failures are only logged.
    pub fn spawn_notify(&self, message: ChatMessage) -> JoinHandle<()> {
        let notifier = self.clone();
        tokio::spawn(async move {
            if let Err(err) = notifier.notify(&message).await {
                error!(
                    chat_id = %message.chat_id,
                    message_id = %message.message_id,
                    error = %err,
                    "offline notification failed"
                );
            }
        })
    }

    async fn sender_title(&self, sender: UserId) -> Result<String> {
        Ok(self
            .directory
            .display_name(sender)
            .await?
            .filter(|name| !name.trim().is_empty())
            .unwrap_or_else(|| format!("User {sender}")))
    }
}

/// Push body for a message: text verbatim up to `max_chars`, media as a label.
pub(crate) fn summarize(kind: MessageKind, content: &str, max_chars: usize) -> String {
    let text = match kind {
        MessageKind::Text => content,
        MessageKind::Image => "[Image]",
        MessageKind::File => "[File]",
        MessageKind::Voice => "[Voice]",
        MessageKind::Location => "[Location]",
    };
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    if max_chars <= ELLIPSIS.len() {
        return text.chars().take(max_chars).collect();
    }
    let mut cut: String = text.chars().take(max_chars - ELLIPSIS.len()).collect();
    cut.push_str(ELLIPSIS);
    cut
}

/// Push collaborator for deployments without a push provider.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPushNotifier;

#[async_trait]
impl PushNotifier for LogPushNotifier {
    async fn push_notify(
        &self,
        user_id: UserId,
        title: &str,
        body: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<()> {
        info!(%user_id, title, body, ?data, "offline push");
        Ok(())
    }
}

#[derive(Serialize)]
struct WebhookPush<'a> {
    user_id: UserId,
    title: &'a str,
    body: &'a str,
    data: &'a BTreeMap<String, String>,
}

/// Forwards pushes as JSON to an HTTP endpoint owned by a push gateway.
#[derive(Debug, Clone)]
pub struct WebhookPushNotifier {
    http: reqwest::Client,
    endpoint: Url,
}

impl WebhookPushNotifier {
    pub fn new(endpoint: Url) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .context("failed to build push webhook client")?;
        Ok(Self { http, endpoint })
    }
}

#[async_trait]
impl PushNotifier for WebhookPushNotifier {
    async fn push_notify(
        &self,
        user_id: UserId,
        title: &str,
        body: &str,
        data: &BTreeMap<String, String>,
    ) -> Result<()> {
        self.http
            .post(self.endpoint.clone())
            .json(&WebhookPush {
                user_id,
                title,
                body,
                data,
            })
            .send()
            .await
            .with_context(|| format!("push webhook unreachable: {}", self.endpoint))?
            .error_for_status()?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/notifier_tests.rs"]
mod tests;
