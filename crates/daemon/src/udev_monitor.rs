//! udev-backed [`DeviceEventSource`].
//!
//! A dedicated thread owns the monitor socket and the enumerator and drives the socket
//! with its own current-thread runtime. Every udev device is copied into an owned
//! [`UdevSnapshot`] on that thread, so nothing libudev-owned crosses into the daemon's
//! runtime; batches travel over a tokio channel.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::io;
use std::thread;

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;
use tokio::sync::{mpsc, oneshot};
use udev::{Device, EventType, MonitorSocket};
use usbgate_common::backend::{DeviceEventSource, Subscription};
use usbgate_common::error::RegistrationError;
use usbgate_common::identifier::{
    DeviceHandle, PropertyKey, PropertySource, PropertyValue, SearchScope,
};
use usbgate_common::types::MountTarget;

const SUBSYSTEM: &str = "block";
const SYSATTRS: [&str; 3] = ["product", "idVendor", "idProduct"];
const PROPERTIES: [&str; 2] = ["ID_VENDOR_ID", "ID_MODEL_ID"];
const USB_DEVICE_DEVTYPE: &str = "usb_device";

type Ready = oneshot::Sender<Result<Vec<DeviceHandle>, RegistrationError>>;

pub struct UdevEventSource {
    capacity: usize,
}

impl Default for UdevEventSource {
    fn default() -> Self {
        Self { capacity: 64 }
    }
}

#[async_trait]
impl DeviceEventSource for UdevEventSource {
    async fn subscribe(self) -> Result<Subscription, RegistrationError> {
        let (ready_tx, ready_rx) = oneshot::channel();
        let (live_tx, live_rx) = mpsc::channel(self.capacity);
        thread::Builder::new()
            .name("usbgate-udev".into())
            .spawn(move || monitor_thread(ready_tx, live_tx))
            .map_err(RegistrationError::Monitor)?;
        let initial = ready_rx.await.map_err(|_| RegistrationError::SourceGone)??;
        Ok(Subscription {
            initial,
            live: live_rx,
        })
    }
}

fn monitor_thread(ready: Ready, live: mpsc::Sender<Vec<DeviceHandle>>) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_io()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            let _ = ready.send(Err(RegistrationError::Monitor(e)));
            return;
        }
    };
    runtime.block_on(async move {
        // Listen before enumerating so nothing attached in between is missed.
        let socket = match open_monitor() {
            Ok(s) => s,
            Err(e) => {
                let _ = ready.send(Err(RegistrationError::Monitor(e)));
                return;
            }
        };
        let initial = match enumerate_attached() {
            Ok(devices) => devices,
            Err(e) => {
                let _ = ready.send(Err(RegistrationError::Enumerate(e)));
                return;
            }
        };
        if ready.send(Ok(initial)).is_err() {
            return;
        }
        if let Err(e) = forward_events(&socket, &live).await {
            tracing::error!(error = %e, "waiting on udev monitor failed");
        }
        tracing::debug!("udev monitor thread exiting");
    });
}

fn open_monitor() -> io::Result<AsyncFd<MonitorSocket>> {
    let socket = udev::MonitorBuilder::new()?
        .match_subsystem(SUBSYSTEM)?
        .listen()?;
    AsyncFd::new(socket)
}

/// Sends one batch per readiness wakeup until the receiver goes away.
async fn forward_events(
    socket: &AsyncFd<MonitorSocket>,
    live: &mpsc::Sender<Vec<DeviceHandle>>,
) -> io::Result<()> {
    loop {
        let mut guard = tokio::select! {
            guard = socket.readable() => guard?,
            _ = live.closed() => return Ok(()),
        };
        // iter() drains the socket until it would block
        let batch: Vec<DeviceHandle> = guard
            .get_inner()
            .iter()
            .filter(|event| event.event_type() == EventType::Add && is_candidate(event))
            .map(|event| DeviceHandle::new(UdevSnapshot::capture(&event)))
            .collect();
        guard.clear_ready();
        if batch.is_empty() {
            continue;
        }
        if live.send(batch).await.is_err() {
            return Ok(());
        }
    }
}

fn enumerate_attached() -> io::Result<Vec<DeviceHandle>> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem(SUBSYSTEM)?;
    enumerator.match_property("ID_BUS", "usb")?;
    Ok(enumerator
        .scan_devices()?
        .filter(|d| is_candidate(d))
        .map(|d| DeviceHandle::new(UdevSnapshot::capture(&d)))
        .collect())
}

fn is_candidate(device: &Device) -> bool {
    is_removable_filesystem(
        device.property_value("ID_BUS"),
        device.property_value("ID_FS_USAGE"),
    )
}

/// USB-attached block device carrying a mountable filesystem.
fn is_removable_filesystem(bus: Option<&OsStr>, fs_usage: Option<&OsStr>) -> bool {
    bus == Some(OsStr::new("usb")) && fs_usage == Some(OsStr::new("filesystem"))
}

#[derive(Debug, Clone, Default)]
struct NodeProperties(HashMap<&'static str, String>);

impl NodeProperties {
    fn capture(device: &Device) -> Self {
        let mut map = HashMap::new();
        for key in SYSATTRS {
            if let Some(v) = device.attribute_value(key).and_then(OsStr::to_str) {
                map.insert(key, v.to_string());
            }
        }
        for key in PROPERTIES {
            if let Some(v) = device.property_value(key).and_then(OsStr::to_str) {
                map.insert(key, v.to_string());
            }
        }
        Self(map)
    }

    fn hex(&self, key: &str) -> Option<PropertyValue> {
        let raw = self.0.get(key)?;
        i64::from_str_radix(raw.trim(), 16)
            .ok()
            .map(PropertyValue::Integer)
    }

    fn lookup(&self, key: PropertyKey) -> Option<PropertyValue> {
        match key {
            PropertyKey::ProductName => self
                .0
                .get("product")
                .map(|s| PropertyValue::Text(s.clone())),
            PropertyKey::VendorId => self.hex("ID_VENDOR_ID").or_else(|| self.hex("idVendor")),
            PropertyKey::ProductId => self.hex("ID_MODEL_ID").or_else(|| self.hex("idProduct")),
        }
    }
}

/// Parents up to and including the physical `usb_device` node. Hubs and the host
/// controller above it carry their own `product` strings and must not name the device.
fn up_to_usb_device(parents: impl Iterator<Item = (bool, NodeProperties)>) -> Vec<NodeProperties> {
    let mut chain = Vec::new();
    for (is_usb_device, props) in parents {
        chain.push(props);
        if is_usb_device {
            break;
        }
    }
    chain
}

/// Owned copy of the properties of a udev device and its parent chain.
#[derive(Debug, Clone)]
pub struct UdevSnapshot {
    syspath: String,
    devnode: Option<String>,
    own: NodeProperties,
    ancestors: Vec<NodeProperties>,
}

impl UdevSnapshot {
    pub fn capture(device: &Device) -> Self {
        let parents = std::iter::successors(device.parent(), |p| p.parent()).map(|p| {
            let is_usb_device = p.devtype() == Some(OsStr::new(USB_DEVICE_DEVTYPE));
            (is_usb_device, NodeProperties::capture(&p))
        });
        let ancestors = up_to_usb_device(parents);
        Self {
            syspath: device.syspath().display().to_string(),
            devnode: device
                .devnode()
                .and_then(|p| p.to_str())
                .map(str::to_string),
            own: NodeProperties::capture(device),
            ancestors,
        }
    }
}

impl PropertySource for UdevSnapshot {
    fn property(&self, key: PropertyKey, scope: SearchScope) -> Option<PropertyValue> {
        let own = self.own.lookup(key);
        match scope {
            SearchScope::Device => own,
            SearchScope::DeviceAndAncestors => {
                own.or_else(|| self.ancestors.iter().find_map(|a| a.lookup(key)))
            }
        }
    }

    fn mount_target(&self) -> Option<MountTarget> {
        self.devnode.as_deref().map(MountTarget::new)
    }

    fn describe(&self) -> String {
        self.syspath.clone()
    }
}
