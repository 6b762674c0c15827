//! Outbound messaging channels. Each channel instance maps to one concrete
//! client; the dispatch and reminder workers talk to the trait only.

use crate::store::{ChannelInstance, ChannelProvider, Template};
use async_trait::async_trait;

pub mod bridge;
pub mod whatsapp;

pub use bridge::BridgeChannel;
pub use whatsapp::WhatsAppCloudChannel;

#[async_trait]
pub trait ChannelClient: Send + Sync {
    fn provider(&self) -> ChannelProvider;

    /// Rolling customer-service window, in hours. `None` means the channel
    /// has no window restriction and free-form messages are always allowed.
    fn messaging_window_hours(&self) -> Option<i64>;

    async fn send_text(&self, to: &str, body: &str) -> anyhow::Result<()>;

    async fn send_image(&self, to: &str, url: &str, caption: Option<&str>) -> anyhow::Result<()>;

    async fn send_video(&self, to: &str, url: &str, caption: Option<&str>) -> anyhow::Result<()>;

    async fn send_audio(&self, to: &str, url: &str) -> anyhow::Result<()>;

    async fn send_document(&self, to: &str, url: &str, filename: Option<&str>)
        -> anyhow::Result<()>;

    /// Send an approved template outside the messaging window.
    async fn send_template(&self, to: &str, template: &Template) -> anyhow::Result<()>;

    /// Best-effort read receipt; failures are logged, never fatal.
    async fn mark_as_read(&self, message_id: &str) -> anyhow::Result<()>;
}

/// Build the concrete client for a channel instance.
pub fn client_for_instance(instance: &ChannelInstance) -> anyhow::Result<Box<dyn ChannelClient>> {
    match instance.provider {
        ChannelProvider::WhatsappCloud => {
            let token = instance
                .access_token
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("Instance {} has no access token", instance.id))?;
            let phone_number_id = instance.phone_number_id.as_deref().ok_or_else(|| {
                anyhow::anyhow!("Instance {} has no phone_number_id", instance.id)
            })?;
            Ok(Box::new(WhatsAppCloudChannel::new(token, phone_number_id)))
        }
        ChannelProvider::Bridge => {
            let base_url = instance
                .base_url
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("Instance {} has no base URL", instance.id))?;
            Ok(Box::new(BridgeChannel::new(
                base_url,
                instance.api_key.as_deref(),
            )))
        }
    }
}

pub(crate) fn ensure_https(url: &str) -> anyhow::Result<()> {
    if !url.starts_with("https://") {
        anyhow::bail!(
            "Refusing to transmit sensitive data over non-HTTPS URL: URL scheme must be https"
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ChannelInstance;

    fn instance(provider: ChannelProvider) -> ChannelInstance {
        ChannelInstance {
            id: "inst-1".into(),
            business_id: "biz-1".into(),
            provider,
            access_token: Some("token".into()),
            phone_number_id: Some("10001".into()),
            base_url: Some("https://bridge.example.com".into()),
            api_key: Some("key".into()),
            enabled: true,
        }
    }

    #[test]
    fn cloud_client_has_24h_window() {
        let client = client_for_instance(&instance(ChannelProvider::WhatsappCloud)).unwrap();
        assert_eq!(client.messaging_window_hours(), Some(24));
    }

    #[test]
    fn bridge_client_has_no_window() {
        let client = client_for_instance(&instance(ChannelProvider::Bridge)).unwrap();
        assert_eq!(client.messaging_window_hours(), None);
    }

    #[test]
    fn cloud_client_requires_credentials() {
        let mut inst = instance(ChannelProvider::WhatsappCloud);
        inst.access_token = None;
        assert!(client_for_instance(&inst).is_err());
    }

    #[test]
    fn ensure_https_rejects_plain_http() {
        assert!(ensure_https("http://bridge.example.com").is_err());
        assert!(ensure_https("https://bridge.example.com").is_ok());
    }
}
