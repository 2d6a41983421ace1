//! Notification collaborators.
//!
//! The agent decides *what* to show and *where* to navigate; presenting
//! notifications and focusing windows belongs to the host.

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;
use url::Url;

use crate::config::NotificationSettings;

/// Identifies the reminder notification.
pub const PRIMARY_KEY: u32 = 1;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notification host unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationData {
    #[serde(with = "time::serde::timestamp::milliseconds")]
    pub date_of_arrival: OffsetDateTime,
    pub primary_key: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub icon: Url,
    pub badge: Url,
    pub vibrate: Vec<u32>,
    pub data: NotificationData,
}

impl Notification {
    /// Build the reminder for a push message. An absent or empty payload
    /// falls back to the configured default body; any other text is shown as sent.
    pub fn for_push(
        settings: &NotificationSettings,
        payload: Option<&str>,
        arrived_at: OffsetDateTime,
    ) -> Self {
        let body = payload
            .filter(|text| !text.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| settings.default_body.clone());

        Self {
            title: settings.title.clone(),
            body,
            icon: settings.icon.clone(),
            badge: settings.badge.clone(),
            vibrate: settings.vibrate.clone(),
            data: NotificationData {
                date_of_arrival: arrived_at,
                primary_key: PRIMARY_KEY,
            },
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn show(&self, notification: &Notification) -> Result<(), NotifyError>;
    async fn close(&self, notification: &Notification) -> Result<(), NotifyError>;
}

/// Windows controlled by the agent.
#[async_trait]
pub trait WindowClients: Send + Sync {
    /// Take control of every open window without a reload.
    async fn claim(&self) -> Result<(), NotifyError>;
    async fn open_window(&self, url: &Url) -> Result<(), NotifyError>;
}

/// Host used by the proxy binary: there is no display, so every request
/// becomes a structured log line.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHost;

#[async_trait]
impl Notifier for LoggingHost {
    async fn show(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            target = "stashpoint::notify",
            title = %notification.title,
            body = %notification.body,
            icon = %notification.icon,
            primary_key = notification.data.primary_key,
            "show notification"
        );
        Ok(())
    }

    async fn close(&self, notification: &Notification) -> Result<(), NotifyError> {
        info!(
            target = "stashpoint::notify",
            primary_key = notification.data.primary_key,
            "close notification"
        );
        Ok(())
    }
}

#[async_trait]
impl WindowClients for LoggingHost {
    async fn claim(&self) -> Result<(), NotifyError> {
        info!(target = "stashpoint::notify", "claimed clients");
        Ok(())
    }

    async fn open_window(&self, url: &Url) -> Result<(), NotifyError> {
        info!(target = "stashpoint::notify", url = %url, "open window");
        Ok(())
    }
}
