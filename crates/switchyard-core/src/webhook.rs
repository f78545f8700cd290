use std::time::Duration;

use chrono::Utc;
use reqwest::Client;

use switchyard_types::WebhookPayload;

use crate::collaborators::WebhookSink;
use crate::config::WebhookConfig;

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(5);

/// Posts task outcomes as JSON to every configured webhook whose event filter matches.
#[derive(Clone)]
pub struct HttpWebhookSink {
    client: Client,
    hooks: Vec<WebhookConfig>,
}

impl HttpWebhookSink {
    pub fn new(hooks: Vec<WebhookConfig>) -> Self {
        let client = Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client, hooks }
    }

    pub fn matching(&self, status: &str) -> impl Iterator<Item = &WebhookConfig> {
        let status = status.to_string();
        self.hooks
            .iter()
            .filter(move |hook| !hook.url.is_empty() && hook.matches(&status))
    }
}

impl WebhookSink for HttpWebhookSink {
    fn send_webhooks(&self, status: &str, mut payload: WebhookPayload) {
        payload.event = status.to_string();
        payload.timestamp = Utc::now();

        for hook in self.matching(status) {
            let mut request = self
                .client
                .post(&hook.url)
                .header("Content-Type", "application/json")
                .json(&payload);
            for (name, value) in &hook.headers {
                request = request.header(name.as_str(), value.as_str());
            }
            let url = hook.url.clone();
            tokio::spawn(async move {
                match request.send().await {
                    Ok(response) if response.status().as_u16() >= 400 => {
                        tracing::warn!(url = %url, status = %response.status(), "webhook rejected");
                    }
                    Ok(_) => tracing::debug!(url = %url, "webhook delivered"),
                    Err(err) => tracing::error!(url = %url, error = %err, "webhook send failed"),
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn hook(url: &str, events: &[&str]) -> WebhookConfig {
        WebhookConfig {
            url: url.to_string(),
            headers: HashMap::new(),
            events: events.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn filters_hooks_by_status() {
        let sink = HttpWebhookSink::new(vec![
            hook("http://a.invalid", &[]),
            hook("http://b.invalid", &["error", "timeout"]),
            hook("http://c.invalid", &["all"]),
            hook("", &[]),
        ]);
        let success: Vec<_> = sink.matching("success").map(|h| h.url.as_str()).collect();
        assert_eq!(success, vec!["http://a.invalid", "http://c.invalid"]);
        assert_eq!(sink.matching("error").count(), 3);
    }
}
