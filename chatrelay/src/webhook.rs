//! Operator notifications.
//!
//! Notable events (startup, user changes, refused requests, failed writes)
//! are logged and, when a webhook URL is configured, posted to a
//! Discord-style webhook as `{"content": "..."}`.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{Level, log, warn};
use reqwest::Client;
use serde::Serialize;

#[derive(Clone)]
pub struct Notifier {
    target: Option<WebhookTarget>,
}

#[derive(Clone)]
struct WebhookTarget {
    http: Client,
    url: String,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    content: &'a str,
}

impl Notifier {
    pub fn new(hook_url: Option<&str>) -> Result<Self> {
        let Some(url) = hook_url else {
            return Ok(Self::disabled());
        };
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build webhook HTTP client")?;
        Ok(Self {
            target: Some(WebhookTarget {
                http,
                url: url.to_string(),
            }),
        })
    }

    pub fn disabled() -> Self {
        Self { target: None }
    }

    /// Logs `message` at `level` and posts it to the webhook in the background.
    /// Delivery failures are logged, never returned.
    pub fn notify(&self, level: Level, message: impl Into<String>) {
        let message = message.into();
        log!(level, "{}", message);
        let Some(target) = self.target.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(err) = target.send(&message).await {
                warn!("Webhook delivery failed: {:#}", err);
            }
        });
    }

    /// Posts `message` and waits for the webhook's answer.
    #[cfg(test)]
    async fn send(&self, message: &str) -> Result<()> {
        match &self.target {
            Some(target) => target.send(message).await,
            None => Ok(()),
        }
    }
}

impl WebhookTarget {
    async fn send(&self, message: &str) -> Result<()> {
        let resp = self
            .http
            .post(&self.url)
            .json(&WebhookPayload { content: message })
            .send()
            .await
            .context("failed sending webhook request")?;
        let status = resp.status();
        if !status.is_success() {
            return Err(anyhow!("webhook returned {}", status.as_u16()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn posts_content_payload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(serde_json::json!({"content": "[server] listening"})))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = Notifier::new(Some(&server.uri())).unwrap();
        notifier.send("[server] listening").await.unwrap();
    }

    #[tokio::test]
    async fn rejected_delivery_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let notifier = Notifier::new(Some(&server.uri())).unwrap();
        assert!(notifier.send("hello").await.is_err());
    }

    #[tokio::test]
    async fn disabled_notifier_is_a_no_op() {
        let notifier = Notifier::disabled();
        notifier.notify(Level::Info, "nobody listening");
        notifier.send("nobody listening").await.unwrap();
    }
}
