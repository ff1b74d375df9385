use tracing::{info, warn};
use usbgate_common::backend::{DeviceEventSource, Subscription};
use usbgate_common::error::RegistrationError;
use usbgate_common::identifier::{resolve, DeviceHandle};
use usbgate_common::types::DeviceOutcome;

use crate::policy::InterceptionEngine;

/// Single consumer of attach events. Devices are handled one at a time, in arrival order.
pub struct DeviceEventLoop {
    engine: InterceptionEngine,
    next_instance: u64,
}

impl DeviceEventLoop {
    pub fn new(engine: InterceptionEngine) -> Self {
        Self {
            engine,
            next_instance: 1,
        }
    }

    pub fn engine(&self) -> &InterceptionEngine {
        &self.engine
    }

    /// Subscribes and processes devices until the source closes its live channel.
    ///
    /// Registration failure is returned as-is and nothing is processed.
    pub async fn run<S: DeviceEventSource>(&mut self, source: S) -> Result<(), RegistrationError> {
        let Subscription { initial, mut live } = source.subscribe().await?;
        info!(target: "usbgate", event = "subscribed", attached = initial.len(), "listening for device attach events");

        self.drain(initial).await;
        while let Some(batch) = live.recv().await {
            self.drain(batch).await;
        }
        info!(target: "usbgate", event = "source_closed", "device event source closed");
        Ok(())
    }

    async fn drain(&mut self, cursor: impl IntoIterator<Item = DeviceHandle>) {
        for handle in cursor {
            self.process(handle).await;
        }
    }

    pub async fn process(&mut self, handle: DeviceHandle) -> DeviceOutcome {
        let instance = self.next_instance;
        self.next_instance += 1;

        let Some(identifier) = resolve(&handle) else {
            warn!(target: "usbgate", event = "device_skipped", instance, device = %handle.describe(), "no identifier resolvable");
            return DeviceOutcome::Skipped;
        };
        let mount_target = handle.mount_target();
        info!(target: "usbgate", event = "device_attached", instance, %identifier, device = %handle.describe());

        let decision = self
            .engine
            .on_device_detected(instance, &identifier, mount_target.as_ref())
            .await;
        drop(handle);
        DeviceOutcome::Decided(decision)
    }
}
