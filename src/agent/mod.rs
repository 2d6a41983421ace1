//! Lifecycle dispatch: maps host events onto the cache manager and the
//! notification collaborators.

use std::sync::{Arc, RwLock};

use time::OffsetDateTime;
use tracing::{info, instrument, warn};
use url::Url;

use crate::cache::{
    CacheManager, FetchRequest, FetchResponse, ReconcileReport, RefreshReport, WarmReport,
};
use crate::config::NotificationSettings;

mod error;
mod notify;

pub use error::{AppError, ErrorReport};
pub use notify::{
    LoggingHost, Notification, NotificationData, Notifier, NotifyError, PRIMARY_KEY,
    WindowClients,
};

/// Events delivered by the host.
#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Install,
    Activate,
    Fetch(FetchRequest),
    Sync { tag: String },
    Push { payload: Option<String> },
    NotificationClick { notification: Notification },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            LifecycleEvent::Install => "install",
            LifecycleEvent::Activate => "activate",
            LifecycleEvent::Fetch(_) => "fetch",
            LifecycleEvent::Sync { .. } => "sync",
            LifecycleEvent::Push { .. } => "push",
            LifecycleEvent::NotificationClick { .. } => "notificationclick",
        }
    }
}

#[derive(Debug)]
pub enum EventOutcome {
    /// `warm` is `None` when warming failed; installation still proceeds.
    Installed { warm: Option<WarmReport> },
    Activated(ReconcileReport),
    Responded(Option<FetchResponse>),
    Synced(RefreshReport),
    Notified(Notification),
    Opened(Url),
}

/// Where the agent is in its install/activate cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Parsed,
    /// Installed and waiting to activate.
    Installed,
    Activated,
}

pub struct Agent {
    cache: Arc<CacheManager>,
    notifier: Arc<dyn Notifier>,
    clients: Arc<dyn WindowClients>,
    notifications: NotificationSettings,
    phase: RwLock<Phase>,
}

impl Agent {
    pub fn new(
        cache: Arc<CacheManager>,
        notifications: NotificationSettings,
        notifier: Arc<dyn Notifier>,
        clients: Arc<dyn WindowClients>,
    ) -> Self {
        Self {
            cache,
            notifier,
            clients,
            notifications,
            phase: RwLock::new(Phase::Parsed),
        }
    }

    /// Agent backed by [`LoggingHost`] for notifications and windows.
    pub fn headless(cache: Arc<CacheManager>, notifications: NotificationSettings) -> Self {
        let host = Arc::new(LoggingHost);
        Self::new(cache, notifications, host.clone(), host)
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    pub fn phase(&self) -> Phase {
        match self.phase.read() {
            Ok(phase) => *phase,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn set_phase(&self, next: Phase) {
        match self.phase.write() {
            Ok(mut phase) => *phase = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    #[instrument(skip_all, fields(event = event.name()))]
    pub async fn dispatch(&self, event: LifecycleEvent) -> Result<EventOutcome, AppError> {
        match event {
            LifecycleEvent::Install => Ok(EventOutcome::Installed {
                warm: self.install().await,
            }),
            LifecycleEvent::Activate => self.activate().await.map(EventOutcome::Activated),
            LifecycleEvent::Fetch(request) => Ok(EventOutcome::Responded(
                self.cache.resolve(&request).await,
            )),
            LifecycleEvent::Sync { tag } => Ok(EventOutcome::Synced(
                self.cache.refresh_all(&tag).await?,
            )),
            LifecycleEvent::Push { payload } => self
                .push(payload.as_deref(), OffsetDateTime::now_utc())
                .await
                .map(EventOutcome::Notified),
            LifecycleEvent::NotificationClick { notification } => self
                .notification_click(&notification)
                .await
                .map(EventOutcome::Opened),
        }
    }

    /// Warm the active cache, then become eligible to activate immediately.
    /// A failed warm is logged and does not block activation.
    async fn install(&self) -> Option<WarmReport> {
        let warm = match self.cache.warm().await {
            Ok(report) => Some(report),
            Err(error) => {
                warn!(
                    target = "stashpoint::agent",
                    error = %error,
                    "cache install failed"
                );
                None
            }
        };
        self.set_phase(Phase::Installed);
        warm
    }

    async fn activate(&self) -> Result<ReconcileReport, AppError> {
        let report = self.cache.reconcile().await?;
        if !report.failed.is_empty() {
            warn!(
                target = "stashpoint::agent",
                failed = ?report.failed,
                "some old caches could not be deleted"
            );
        }

        self.set_phase(Phase::Activated);
        if let Err(error) = self.clients.claim().await {
            warn!(target = "stashpoint::agent", error = %error, "failed to claim clients");
        }
        info!(
            target = "stashpoint::agent",
            version = %self.cache.config().version,
            deleted = report.deleted.len(),
            "agent activated"
        );
        Ok(report)
    }

    async fn push(
        &self,
        payload: Option<&str>,
        arrived_at: OffsetDateTime,
    ) -> Result<Notification, AppError> {
        let notification = Notification::for_push(&self.notifications, payload, arrived_at);
        self.notifier.show(&notification).await?;
        Ok(notification)
    }

    async fn notification_click(&self, notification: &Notification) -> Result<Url, AppError> {
        self.notifier.close(notification).await?;
        let url = self.notifications.open_url.clone();
        self.clients.open_window(&url).await?;
        Ok(url)
    }
}
