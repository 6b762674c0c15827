//! WhatsApp Business Cloud API client. Outbound only: inbound messages
//! arrive through the gateway webhook, not by polling.

use super::{ensure_https, ChannelClient};
use crate::providers::sanitize_api_error;
use crate::store::{ChannelProvider, Template};
use async_trait::async_trait;

pub struct WhatsAppCloudChannel {
    access_token: String,
    phone_number_id: String,
}

impl WhatsAppCloudChannel {
    pub fn new(access_token: &str, phone_number_id: &str) -> Self {
        Self {
            access_token: access_token.to_string(),
            phone_number_id: phone_number_id.to_string(),
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

    fn messages_url(&self) -> String {
        format!(
            "https://graph.facebook.com/v18.0/{}/messages",
            self.phone_number_id
        )
    }

    async fn post_message(&self, body: serde_json::Value) -> anyhow::Result<()> {
        let url = self.messages_url();
        ensure_https(&url)?;

        let resp = self
            .http_client()
            .post(&url)
            .bearer_auth(&self.access_token)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let error_body = resp.text().await.unwrap_or_default();
            let sanitized = sanitize_api_error(&error_body);
            tracing::error!("WhatsApp send failed: {status}: {sanitized}");
            anyhow::bail!("WhatsApp API error: {status}");
        }

        Ok(())
    }

    /// Cloud API wants recipients without the leading +.
    fn normalize_to(to: &str) -> &str {
        to.strip_prefix('+').unwrap_or(to)
    }

    fn media_payload(
        to: &str,
        kind: &str,
        url: &str,
        caption: Option<&str>,
        filename: Option<&str>,
    ) -> serde_json::Value {
        let mut media = serde_json::json!({ "link": url });
        if let Some(caption) = caption {
            media["caption"] = serde_json::Value::String(caption.to_string());
        }
        if let Some(filename) = filename {
            media["filename"] = serde_json::Value::String(filename.to_string());
        }
        serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": Self::normalize_to(to),
            "type": kind,
            kind: media,
        })
    }
}

#[async_trait]
impl ChannelClient for WhatsAppCloudChannel {
    fn provider(&self) -> ChannelProvider {
        ChannelProvider::WhatsappCloud
    }

    fn messaging_window_hours(&self) -> Option<i64> {
        Some(24)
    }

    async fn send_text(&self, to: &str, body: &str) -> anyhow::Result<()> {
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": Self::normalize_to(to),
            "type": "text",
            "text": { "preview_url": false, "body": body }
        }))
        .await
    }

    async fn send_image(&self, to: &str, url: &str, caption: Option<&str>) -> anyhow::Result<()> {
        self.post_message(Self::media_payload(to, "image", url, caption, None))
            .await
    }

    async fn send_video(&self, to: &str, url: &str, caption: Option<&str>) -> anyhow::Result<()> {
        self.post_message(Self::media_payload(to, "video", url, caption, None))
            .await
    }

    async fn send_audio(&self, to: &str, url: &str) -> anyhow::Result<()> {
        self.post_message(Self::media_payload(to, "audio", url, None, None))
            .await
    }

    async fn send_document(
        &self,
        to: &str,
        url: &str,
        filename: Option<&str>,
    ) -> anyhow::Result<()> {
        self.post_message(Self::media_payload(to, "document", url, None, filename))
            .await
    }

    async fn send_template(&self, to: &str, template: &Template) -> anyhow::Result<()> {
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": Self::normalize_to(to),
            "type": "template",
            "template": {
                "name": template.name,
                "language": { "code": template.language }
            }
        }))
        .await
    }

    async fn mark_as_read(&self, message_id: &str) -> anyhow::Result<()> {
        self.post_message(serde_json::json!({
            "messaging_product": "whatsapp",
            "status": "read",
            "message_id": message_id,
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recipient_plus_prefix_is_stripped() {
        assert_eq!(WhatsAppCloudChannel::normalize_to("+51999000111"), "51999000111");
        assert_eq!(WhatsAppCloudChannel::normalize_to("51999000111"), "51999000111");
    }

    #[test]
    fn media_payload_carries_caption_and_filename() {
        let image = WhatsAppCloudChannel::media_payload(
            "+51999000111",
            "image",
            "https://cdn.example.com/p.jpg",
            Some("Producto X"),
            None,
        );
        assert_eq!(image["type"], "image");
        assert_eq!(image["image"]["caption"], "Producto X");
        assert_eq!(image["to"], "51999000111");

        let doc = WhatsAppCloudChannel::media_payload(
            "+51999000111",
            "document",
            "https://cdn.example.com/catalogo.pdf",
            None,
            Some("catalogo.pdf"),
        );
        assert_eq!(doc["document"]["filename"], "catalogo.pdf");
        assert!(doc["document"].get("caption").is_none());
    }

    #[test]
    fn messages_url_targets_phone_number_id() {
        let ch = WhatsAppCloudChannel::new("token", "123456789");
        assert_eq!(
            ch.messages_url(),
            "https://graph.facebook.com/v18.0/123456789/messages"
        );
    }
}
