// Webhook notifier for approval fan-out

use async_trait::async_trait;

use thand_shared::{BasicConfig, Result, ServiceError};

use super::{Notification, Notifier};

pub struct WebhookNotifier {
    name: String,
    url: String,
    /// `slack` posts a `{"text": ...}` payload; anything else posts the
    /// notification as-is.
    format: String,
    http: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(name: &str, config: &BasicConfig, http: reqwest::Client) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            url: config.require("url")?.to_string(),
            format: config.get_string("format"),
            http,
        })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let payload = if self.format == "slack" {
            let mut text = format!("*{}*\n{}", notification.title, notification.message);
            if let Some(link) = &notification.link {
                text.push_str(&format!("\n{}", link));
            }
            serde_json::json!({ "text": text })
        } else {
            serde_json::to_value(notification)?
        };

        let response = self
            .http
            .post(&self.url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| ServiceError::provider("NotifierError", true, e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(ServiceError::provider(
                "NotifierError",
                status.is_server_error(),
                format!("webhook returned {}", status),
            ));
        }

        tracing::debug!(
            provider = %self.name,
            title = %notification.title,
            "Notification delivered"
        );
        Ok(())
    }
}
