//! Messaging-window resolver.
//!
//! WhatsApp Cloud only allows free-form messages inside a rolling window
//! after the contact's last inbound message; outside it, only approved
//! templates go through. Bridge-style channels have no such restriction.

use crate::channels::client_for_instance;
use crate::config::Config;
use crate::store::{self, ChannelProvider, Direction, Template};
use anyhow::{Context, Result};
use chrono::Utc;

#[derive(Debug, Clone)]
pub struct WindowStatus {
    pub provider: ChannelProvider,
    /// Hours since the contact's last inbound message, when any exists.
    pub hours_since_last_message: Option<i64>,
    pub requires_template: bool,
}

/// Resolve whether a free-form message may be sent to `contact_phone` right
/// now. A contact with no inbound history on a windowed provider requires a
/// template: there was never a window to be inside of.
pub fn check_window_status(
    config: &Config,
    business_id: &str,
    contact_phone: &str,
) -> Result<WindowStatus> {
    let instance = store::business::primary_instance(config, business_id)?
        .with_context(|| format!("Business {business_id} has no enabled channel instance"))?;
    let client = client_for_instance(&instance)?;

    let last_inbound =
        store::messages::last_message_at(config, business_id, contact_phone, Some(Direction::Inbound))?;
    let hours_since_last_message =
        last_inbound.map(|at| (Utc::now() - at).num_hours());

    let requires_template = match client.messaging_window_hours() {
        None => false,
        Some(window_hours) => match hours_since_last_message {
            Some(hours) => hours >= window_hours,
            None => true,
        },
    };

    Ok(WindowStatus {
        provider: instance.provider,
        hours_since_last_message,
        requires_template,
    })
}

/// Pick the best approved template for out-of-window sends: marketing beats
/// utility beats anything else, ties broken by name.
pub fn default_template(config: &Config, business_id: &str) -> Result<Option<Template>> {
    let mut templates = store::business::approved_templates(config, business_id)?;
    templates.sort_by(|a, b| {
        a.category
            .rank()
            .cmp(&b.category.rank())
            .then_with(|| a.name.cmp(&b.name))
    });
    Ok(templates.into_iter().next())
}
