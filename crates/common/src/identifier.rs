//! Device handles and identifier resolution.
//!
//! A [`DeviceHandle`] owns whatever the OS layer handed over for one device and releases
//! it on drop. [`resolve`] turns a handle into a [`DeviceIdentifier`] using the product
//! string first and the vendor/product id pair as fallback.

use crate::types::{DeviceIdentifier, MountTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyKey {
    ProductName,
    VendorId,
    ProductId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    /// Only the node itself.
    Device,
    /// The node, then its parents up to the root.
    DeviceAndAncestors,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    Text(String),
    Integer(i64),
}

/// Read-only view of OS-owned device properties.
pub trait PropertySource: Send {
    fn property(&self, key: PropertyKey, scope: SearchScope) -> Option<PropertyValue>;

    fn mount_target(&self) -> Option<MountTarget>;

    /// Short description for logs (sysfs path or similar).
    fn describe(&self) -> String;

    /// Called exactly once when the owning handle is dropped.
    fn release(&mut self) {}
}

/// Exclusive, single-turn ownership of one attached device.
pub struct DeviceHandle {
    source: Box<dyn PropertySource>,
}

impl DeviceHandle {
    pub fn new(source: impl PropertySource + 'static) -> Self {
        Self {
            source: Box::new(source),
        }
    }

    pub fn property(&self, key: PropertyKey, scope: SearchScope) -> Option<PropertyValue> {
        self.source.property(key, scope)
    }

    pub fn mount_target(&self) -> Option<MountTarget> {
        self.source.mount_target()
    }

    pub fn describe(&self) -> String {
        self.source.describe()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        self.source.release();
        tracing::trace!(device = %self.source.describe(), "device handle released");
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("DeviceHandle").field(&self.describe()).finish()
    }
}

pub fn resolve(handle: &DeviceHandle) -> Option<DeviceIdentifier> {
    if let Some(PropertyValue::Text(name)) =
        handle.property(PropertyKey::ProductName, SearchScope::DeviceAndAncestors)
    {
        if !name.trim().is_empty() {
            return Some(DeviceIdentifier::ProductName(name));
        }
    }

    let vendor_id = id_property(handle, PropertyKey::VendorId)?;
    let product_id = id_property(handle, PropertyKey::ProductId)?;
    Some(DeviceIdentifier::VendorProductFallback {
        vendor_id,
        product_id,
    })
}

fn id_property(handle: &DeviceHandle, key: PropertyKey) -> Option<u16> {
    match handle.property(key, SearchScope::Device)? {
        PropertyValue::Integer(v) => u16::try_from(v).ok(),
        PropertyValue::Text(_) => None,
    }
}
