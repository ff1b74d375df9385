use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{MitigationError, NotificationError, RegistrationError};
use crate::identifier::DeviceHandle;
use crate::types::{DeviceIdentifier, MountCommand, MountTarget};

/// Runs the external mount/unmount step. Completion means the command has exited.
#[async_trait]
pub trait MountBackend: Send + Sync {
    async fn invoke(&self, command: MountCommand, target: &MountTarget)
        -> Result<(), MitigationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorizationOutcome {
    Granted,
    Denied,
    Unavailable,
}

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn request_interactive_authorization(
        &self,
        identifier: &DeviceIdentifier,
    ) -> AuthorizationOutcome;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationRequest {
    pub title: String,
    pub body: String,
    pub request_id: Uuid,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn enqueue(&self, request: NotificationRequest) -> Result<(), NotificationError>;
}

/// Devices present at subscription time plus a channel of later attach batches.
pub struct Subscription {
    pub initial: Vec<DeviceHandle>,
    pub live: mpsc::Receiver<Vec<DeviceHandle>>,
}

#[async_trait]
pub trait DeviceEventSource: Send {
    async fn subscribe(self) -> Result<Subscription, RegistrationError>;
}
