use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use notify_rust::{Hint, Notification};
use tokio::task::JoinHandle;
use usbgate_common::backend::{NotificationRequest, Notifier};
use usbgate_common::config::NotificationConfig;
use usbgate_common::error::NotificationError;
use uuid::Uuid;

/// Fire-and-forget front for a [`Notifier`]; delivery failures are only logged.
#[derive(Clone)]
pub struct NotificationDispatcher {
    notifier: Arc<dyn Notifier>,
    title: String,
    enabled: bool,
    pending: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl NotificationDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, cfg: &NotificationConfig) -> Self {
        Self {
            notifier,
            title: cfg.title.clone(),
            enabled: cfg.enabled,
            pending: Arc::default(),
        }
    }

    /// Must be called from within a tokio runtime.
    pub fn notify(&self, message: &str) {
        if !self.enabled {
            return;
        }
        let request = NotificationRequest {
            title: self.title.clone(),
            body: message.to_string(),
            request_id: Uuid::new_v4(),
        };
        let notifier = self.notifier.clone();
        let handle = tokio::spawn(async move {
            let request_id = request.request_id;
            match notifier.enqueue(request).await {
                Ok(()) => tracing::debug!(%request_id, "notification delivered"),
                Err(e) => tracing::warn!(%request_id, error = %e, "notification failed"),
            }
        });
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending.retain(|h| !h.is_finished());
        pending.push(handle);
    }

    /// Waits for every delivery started so far.
    pub async fn drain(&self) {
        let handles: Vec<_> = std::mem::take(
            &mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner),
        );
        for h in handles {
            if let Err(e) = h.await {
                tracing::warn!(error = %e, "notification task aborted");
            }
        }
    }
}

/// Desktop notifications over the freedesktop notification service.
#[derive(Clone, Default)]
pub struct DesktopNotifier;

#[async_trait]
impl Notifier for DesktopNotifier {
    async fn enqueue(&self, request: NotificationRequest) -> Result<(), NotificationError> {
        tokio::task::spawn_blocking(move || {
            Notification::new()
                .appname(usbgate_common::APP_ID)
                .summary(&request.title)
                .body(&request.body)
                .icon("security-high")
                .hint(Hint::Custom(
                    "x-usbgate-request-id".into(),
                    request.request_id.to_string(),
                ))
                .show()
                .map(|_| ())
                .map_err(|e| NotificationError::Delivery(e.to_string()))
        })
        .await
        .map_err(|e| NotificationError::Delivery(e.to_string()))?
    }
}
