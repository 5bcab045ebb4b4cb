//! Core Events
//!
//! Events used for communication between the components of the daemon.
//! Bus signals, periodic ticks and retry timers all funnel into a single
//! coordinator channel, which serialises all shared-state access.

use uuid::Uuid;

/// Opaque object path assigned by BlueZ; primary key for everything
/// device-scoped.
pub type ObjectPath = String;

/// Properties of a `Device1` interface, as far as this daemon cares.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceProps {
    pub name: Option<String>,
    pub connected: bool,
    pub services_resolved: bool,
}

/// Properties of a `GattService1` interface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ServiceProps {
    pub uuid: Option<Uuid>,
    pub device: Option<ObjectPath>,
}

/// Properties of a `GattCharacteristic1` interface.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CharacteristicProps {
    pub uuid: Option<Uuid>,
}

/// The interfaces present on one bus object, already narrowed to the
/// three kinds the daemon consumes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ObjectSummary {
    pub device: Option<DeviceProps>,
    pub service: Option<ServiceProps>,
    pub characteristic: Option<CharacteristicProps>,
}

/// A `PropertiesChanged` signal, narrowed to the properties the daemon
/// reacts to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyUpdate {
    pub connected: Option<bool>,
    pub services_resolved: Option<bool>,
    pub value: Option<Vec<u8>>,
}

impl PropertyUpdate {
    pub fn is_empty(&self) -> bool {
        self.connected.is_none() && self.services_resolved.is_none() && self.value.is_none()
    }
}

/// Typed rendition of the BlueZ object-manager and property signals.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    InterfacesAdded {
        path: ObjectPath,
        summary: ObjectSummary,
    },
    /// `device` is true when the removed interface set includes `Device1`.
    InterfacesRemoved {
        path: ObjectPath,
        device: bool,
    },
    PropertiesChanged {
        path: ObjectPath,
        update: PropertyUpdate,
    },
}

/// Everything the coordinator loop reacts to.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    Bus(BusEvent),
    /// Single-shot backoff timer for one device. `seq` must match the
    /// record's current retry generation or the tick is stale.
    Retry { path: ObjectPath, seq: u64 },
    /// Periodic reconciliation sweep.
    Sweep,
    /// Periodic logger tick.
    LogTick,
    /// Graceful termination requested.
    Shutdown,
}

/// Parent of a bus object, by path. BlueZ nests characteristics under
/// services and services under devices.
pub fn parent_path(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}
