//! Self-hosted bridge client (WhatsApp Web style gateways). No messaging
//! window applies: the bridge session can message any contact at any time,
//! so templates are never required.

use super::ChannelClient;
use crate::providers::sanitize_api_error;
use crate::store::{ChannelProvider, Template};
use async_trait::async_trait;

pub struct BridgeChannel {
    base_url: String,
    api_key: Option<String>,
}

impl BridgeChannel {
    pub fn new(base_url: &str, api_key: Option<&str>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.map(str::to_string),
        }
    }

    fn http_client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .unwrap_or_else(|error| {
                tracing::warn!("Failed to build timeout client: {error}");
                reqwest::Client::new()
            })
    }

    async fn post(&self, endpoint: &str, body: serde_json::Value) -> anyhow::Result<()> {
        let url = format!("{}/{endpoint}", self.base_url);
        let mut request = self.http_client().post(&url).json(&body);
        if let Some(key) = self.api_key.as_deref() {
            request = request.header("x-api-key", key);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let error_body = resp.text().await.unwrap_or_default();
            let sanitized = sanitize_api_error(&error_body);
            tracing::error!("Bridge send failed ({endpoint}): {status}: {sanitized}");
            anyhow::bail!("Bridge API error: {status}");
        }
        Ok(())
    }

    fn media_body(to: &str, url: &str, caption: Option<&str>) -> serde_json::Value {
        serde_json::json!({
            "to": to,
            "url": url,
            "caption": caption,
        })
    }
}

#[async_trait]
impl ChannelClient for BridgeChannel {
    fn provider(&self) -> ChannelProvider {
        ChannelProvider::Bridge
    }

    fn messaging_window_hours(&self) -> Option<i64> {
        None
    }

    async fn send_text(&self, to: &str, body: &str) -> anyhow::Result<()> {
        self.post("send/text", serde_json::json!({ "to": to, "body": body }))
            .await
    }

    async fn send_image(&self, to: &str, url: &str, caption: Option<&str>) -> anyhow::Result<()> {
        self.post("send/image", Self::media_body(to, url, caption))
            .await
    }

    async fn send_video(&self, to: &str, url: &str, caption: Option<&str>) -> anyhow::Result<()> {
        self.post("send/video", Self::media_body(to, url, caption))
            .await
    }

    async fn send_audio(&self, to: &str, url: &str) -> anyhow::Result<()> {
        self.post("send/audio", Self::media_body(to, url, None)).await
    }

    async fn send_document(
        &self,
        to: &str,
        url: &str,
        filename: Option<&str>,
    ) -> anyhow::Result<()> {
        self.post(
            "send/document",
            serde_json::json!({ "to": to, "url": url, "filename": filename }),
        )
        .await
    }

    async fn send_template(&self, to: &str, template: &Template) -> anyhow::Result<()> {
        // No window restriction; the rendered body goes out as plain text.
        self.send_text(to, &template.body).await
    }

    async fn mark_as_read(&self, message_id: &str) -> anyhow::Result<()> {
        self.post("messages/read", serde_json::json!({ "message_id": message_id }))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let ch = BridgeChannel::new("https://bridge.example.com/", None);
        assert_eq!(ch.base_url, "https://bridge.example.com");
    }

    #[test]
    fn bridge_never_requires_templates() {
        let ch = BridgeChannel::new("https://bridge.example.com", Some("key"));
        assert!(ch.messaging_window_hours().is_none());
    }
}
