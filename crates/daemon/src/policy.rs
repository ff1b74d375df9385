//! Unmount-first, fail-closed interception of newly attached devices.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use usbgate_common::backend::{AuthorizationOutcome, Authorizer, MountBackend};
use usbgate_common::config::{AuthorizationConfig, MitigationConfig};
use usbgate_common::error::MitigationError;
use usbgate_common::types::{DeviceIdentifier, InterceptionDecision, MountCommand, MountTarget};

use crate::ledger::DecisionLedger;
use crate::notify::NotificationDispatcher;

pub struct InterceptionEngine {
    mount: Arc<dyn MountBackend>,
    authorizer: Option<Arc<dyn Authorizer>>,
    dispatcher: NotificationDispatcher,
    ledger: DecisionLedger,
    command_timeout: Duration,
    authorization_timeout: Duration,
}

impl InterceptionEngine {
    pub fn new(mount: Arc<dyn MountBackend>, dispatcher: NotificationDispatcher) -> Self {
        Self {
            mount,
            authorizer: None,
            dispatcher,
            ledger: DecisionLedger::default(),
            command_timeout: MitigationConfig::default().command_timeout(),
            authorization_timeout: AuthorizationConfig::default().timeout(),
        }
    }

    pub fn with_authorizer(mut self, authorizer: Arc<dyn Authorizer>) -> Self {
        self.authorizer = Some(authorizer);
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    pub fn with_authorization_timeout(mut self, timeout: Duration) -> Self {
        self.authorization_timeout = timeout;
        self
    }

    pub fn ledger(&self) -> &DecisionLedger {
        &self.ledger
    }

    pub fn dispatcher(&self) -> &NotificationDispatcher {
        &self.dispatcher
    }

    pub async fn on_device_detected(
        &self,
        instance: u64,
        identifier: &DeviceIdentifier,
        target: Option<&MountTarget>,
    ) -> InterceptionDecision {
        self.dispatcher.notify(&identifier.to_string());

        let Some(target) = target else {
            warn!(target: "usbgate", event = "no_mount_target", instance, %identifier, "device has no mount target");
            let decision = InterceptionDecision::Error {
                command: MountCommand::Unmount,
                reason: "device has no mount target".into(),
            };
            self.ledger.record(instance, identifier, None, decision.clone());
            return decision;
        };

        if let Err(decision) = self.mitigate(MountCommand::Unmount, target).await {
            return self.finish(instance, identifier, target, decision);
        }
        self.ledger
            .record(instance, identifier, Some(target), InterceptionDecision::Blocked);
        info!(target: "usbgate", event = "device_blocked", instance, %identifier, mount_target = %target, "device unmounted");

        let decision = match self.authorize(identifier).await {
            AuthorizationOutcome::Granted => match self.mitigate(MountCommand::Mount, target).await {
                Ok(()) => InterceptionDecision::Authorized,
                Err(decision) => decision,
            },
            AuthorizationOutcome::Denied | AuthorizationOutcome::Unavailable => {
                InterceptionDecision::DeniedNotRemounted
            }
        };
        self.finish(instance, identifier, target, decision)
    }

    fn finish(
        &self,
        instance: u64,
        identifier: &DeviceIdentifier,
        target: &MountTarget,
        decision: InterceptionDecision,
    ) -> InterceptionDecision {
        info!(target: "usbgate", event = "device_decided", instance, %identifier, mount_target = %target, ?decision);
        self.ledger
            .record(instance, identifier, Some(target), decision.clone());
        decision
    }

    async fn authorize(&self, identifier: &DeviceIdentifier) -> AuthorizationOutcome {
        let Some(authorizer) = &self.authorizer else {
            return AuthorizationOutcome::Unavailable;
        };
        match tokio::time::timeout(
            self.authorization_timeout,
            authorizer.request_interactive_authorization(identifier),
        )
        .await
        {
            Ok(outcome) => {
                info!(target: "usbgate", event = "authorization", %identifier, ?outcome);
                outcome
            }
            Err(_) => {
                warn!(target: "usbgate", event = "authorization_timeout", %identifier, "authorization timed out");
                AuthorizationOutcome::Unavailable
            }
        }
    }

    async fn mitigate(
        &self,
        command: MountCommand,
        target: &MountTarget,
    ) -> Result<(), InterceptionDecision> {
        match tokio::time::timeout(self.command_timeout, self.mount.invoke(command, target)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(MitigationError::NotMounted(_))) if command == MountCommand::Unmount => {
                info!(target: "usbgate", event = "already_unmounted", mount_target = %target, "target was not mounted");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(target: "usbgate", event = "mitigation_failed", %command, mount_target = %target, error = %e, "mitigation command failed");
                Err(decision_for(command, &e))
            }
            Err(_) => {
                warn!(target: "usbgate", event = "mitigation_timeout", %command, mount_target = %target, timeout = ?self.command_timeout);
                Err(InterceptionDecision::TimedOut { command })
            }
        }
    }
}

fn decision_for(command: MountCommand, err: &MitigationError) -> InterceptionDecision {
    let mut reason = err.to_string();
    let mut cause = std::error::Error::source(err);
    while let Some(c) = cause {
        reason.push_str(": ");
        reason.push_str(&c.to_string());
        cause = c.source();
    }
    InterceptionDecision::Error { command, reason }
}
