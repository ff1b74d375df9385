use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use usbgate_common::backend::{
    AuthorizationOutcome, Authorizer, DeviceEventSource, MountBackend, NotificationRequest,
    Notifier, Subscription,
};
use usbgate_common::error::{MitigationError, NotificationError, RegistrationError};
use usbgate_common::identifier::{
    DeviceHandle, PropertyKey, PropertySource, PropertyValue, SearchScope,
};
use usbgate_common::types::{DeviceIdentifier, MountCommand, MountTarget};

/// Scripted device. Ancestors are searched nearest-first.
#[derive(Clone, Default)]
pub struct FakeDevice {
    name: String,
    own: HashMap<PropertyKey, PropertyValue>,
    ancestors: Vec<HashMap<PropertyKey, PropertyValue>>,
    target: Option<MountTarget>,
    releases: Arc<AtomicUsize>,
}

impl FakeDevice {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_product_name(mut self, product: &str) -> Self {
        self.own
            .insert(PropertyKey::ProductName, PropertyValue::Text(product.into()));
        self
    }

    /// Adds a parent node carrying the product string.
    pub fn with_parent_product_name(mut self, product: &str) -> Self {
        let mut parent = HashMap::new();
        parent.insert(PropertyKey::ProductName, PropertyValue::Text(product.into()));
        self.ancestors.push(parent);
        self
    }

    pub fn with_ids(mut self, vendor_id: i64, product_id: i64) -> Self {
        self.own
            .insert(PropertyKey::VendorId, PropertyValue::Integer(vendor_id));
        self.own
            .insert(PropertyKey::ProductId, PropertyValue::Integer(product_id));
        self
    }

    pub fn with_target(mut self, target: &str) -> Self {
        self.target = Some(MountTarget::new(target));
        self
    }

    /// Shared release counter; survives the handle.
    pub fn releases(&self) -> Arc<AtomicUsize> {
        self.releases.clone()
    }

    pub fn into_handle(self) -> DeviceHandle {
        DeviceHandle::new(self)
    }
}

impl PropertySource for FakeDevice {
    fn property(&self, key: PropertyKey, scope: SearchScope) -> Option<PropertyValue> {
        if let Some(v) = self.own.get(&key) {
            return Some(v.clone());
        }
        match scope {
            SearchScope::Device => None,
            SearchScope::DeviceAndAncestors => {
                self.ancestors.iter().find_map(|a| a.get(&key).cloned())
            }
        }
    }

    fn mount_target(&self) -> Option<MountTarget> {
        self.target.clone()
    }

    fn describe(&self) -> String {
        self.name.clone()
    }

    fn release(&mut self) {
        self.releases.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub enum MountBehavior {
    #[default]
    Succeed,
    Fail,
    /// Reports the target as already unmounted.
    NotMounted,
    Hang,
}

#[derive(Clone, Default)]
pub struct MockMountBackend {
    calls: Arc<Mutex<Vec<(MountCommand, MountTarget)>>>,
    unmount: MountBehavior,
    mount: MountBehavior,
}

impl MockMountBackend {
    pub fn with_unmount(mut self, behavior: MountBehavior) -> Self {
        self.unmount = behavior;
        self
    }

    pub fn with_mount(mut self, behavior: MountBehavior) -> Self {
        self.mount = behavior;
        self
    }

    pub fn calls(&self) -> Vec<(MountCommand, MountTarget)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, command: MountCommand) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == command)
            .count()
    }
}

#[async_trait]
impl MountBackend for MockMountBackend {
    async fn invoke(
        &self,
        command: MountCommand,
        target: &MountTarget,
    ) -> Result<(), MitigationError> {
        self.calls.lock().unwrap().push((command, target.clone()));
        let behavior = match command {
            MountCommand::Unmount => self.unmount,
            MountCommand::Mount => self.mount,
        };
        match behavior {
            MountBehavior::Succeed => Ok(()),
            MountBehavior::Fail => Err(MitigationError::Exit {
                command,
                code: Some(1),
                stderr: "mock failure".into(),
            }),
            MountBehavior::NotMounted => Err(MitigationError::NotMounted(target.to_string())),
            MountBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }
}

/// Answers every request with a fixed outcome, or never answers when `hang` is set.
#[derive(Clone)]
pub struct MockAuthorizer {
    outcome: AuthorizationOutcome,
    hang: bool,
    requests: Arc<Mutex<Vec<DeviceIdentifier>>>,
}

impl MockAuthorizer {
    pub fn new(outcome: AuthorizationOutcome) -> Self {
        Self {
            outcome,
            hang: false,
            requests: Arc::default(),
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::new(AuthorizationOutcome::Granted)
        }
    }

    pub fn requests(&self) -> Vec<DeviceIdentifier> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Authorizer for MockAuthorizer {
    async fn request_interactive_authorization(
        &self,
        identifier: &DeviceIdentifier,
    ) -> AuthorizationOutcome {
        self.requests.lock().unwrap().push(identifier.clone());
        if self.hang {
            std::future::pending::<()>().await;
        }
        self.outcome
    }
}

#[derive(Clone, Default)]
pub struct MockNotifier {
    requests: Arc<Mutex<Vec<NotificationRequest>>>,
    fail: bool,
}

impl MockNotifier {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn requests(&self) -> Vec<NotificationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for MockNotifier {
    async fn enqueue(&self, request: NotificationRequest) -> Result<(), NotificationError> {
        self.requests.lock().unwrap().push(request);
        if self.fail {
            return Err(NotificationError::Delivery("mock failure".into()));
        }
        Ok(())
    }
}

/// Event source fed from the test: initial devices plus a sender for live batches.
pub struct ScriptedEventSource {
    initial: Vec<DeviceHandle>,
    live: mpsc::Receiver<Vec<DeviceHandle>>,
    fail: bool,
}

impl ScriptedEventSource {
    pub fn new(initial: Vec<DeviceHandle>) -> (Self, mpsc::Sender<Vec<DeviceHandle>>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Self {
                initial,
                live: rx,
                fail: false,
            },
            tx,
        )
    }

    /// A source whose registration always fails.
    pub fn failing() -> Self {
        let (mut source, _) = Self::new(Vec::new());
        source.fail = true;
        source
    }
}

#[async_trait]
impl DeviceEventSource for ScriptedEventSource {
    async fn subscribe(self) -> Result<Subscription, RegistrationError> {
        if self.fail {
            return Err(RegistrationError::Monitor(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "mock registration failure",
            )));
        }
        Ok(Subscription {
            initial: self.initial,
            live: self.live,
        })
    }
}
