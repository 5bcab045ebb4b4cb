//! Device Record
//!
//! Per-thermometer bookkeeping: the supervisor state, the characteristic
//! paths discovered under the device, the binding queue flushed during
//! pseudo-pairing, and the retry timer state. The coordinator is the sole
//! owner of records; dropping a record releases every handle it holds.

use std::time::Duration;

use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::core::constants::{
    self, BATTERY_LEVEL_UUID, COMMAND_WRITE_UUID, IGNORED_AUX_UUID, INITIAL_BACKOFF,
    TEMPERATURE_NOTIFY_UUID,
};
use crate::core::events::ObjectPath;

/// Where a device is in its lifecycle. Created as `Disconnected`; the
/// record is removed once `Teardown` completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceState {
    Disconnected,
    Connecting,
    /// Link up, services not yet resolved.
    Connected,
    ServicesResolved,
    PseudoPairing,
    /// Streaming. The slot offset attaches on the first temperature
    /// notification, not on entry.
    Active { offset: Option<usize> },
    Teardown,
}

/// What a characteristic is for, by UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CharClass {
    Temperature,
    Command,
    Battery,
    Auxiliary,
}

impl CharClass {
    /// Classifies a characteristic UUID; `None` for characteristics this
    /// daemon leaves alone (including the `ff05` vendor characteristic).
    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        if *uuid == TEMPERATURE_NOTIFY_UUID {
            return Some(Self::Temperature);
        }
        if *uuid == COMMAND_WRITE_UUID {
            return Some(Self::Command);
        }
        if *uuid == BATTERY_LEVEL_UUID {
            return Some(Self::Battery);
        }
        if *uuid == IGNORED_AUX_UUID {
            return None;
        }
        match constants::uuid_to_u16(uuid) {
            Some(short) if (0xff00..=0xff0f).contains(&short) => Some(Self::Auxiliary),
            _ => None,
        }
    }
}

/// A characteristic queued for subscription, flushed on the transition
/// into pseudo-pairing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub characteristic: ObjectPath,
    pub class: CharClass,
}

#[derive(Debug)]
pub struct DeviceRecord {
    pub path: ObjectPath,
    pub state: DeviceState,
    /// Mirror of the bus `Connected` property.
    pub connected: bool,
    /// The temperature GATT service under this device, once seen.
    pub service: Option<ObjectPath>,
    /// True once the service's characteristics are bound; a service seen
    /// but not yet ready is treated as a partial enumeration.
    pub service_ready: bool,
    pub temperature: Option<ObjectPath>,
    pub command: Option<ObjectPath>,
    pub battery: Option<ObjectPath>,
    pub auxiliary: Vec<ObjectPath>,
    pub bindings: Vec<Binding>,
    /// Characteristics with an outstanding `StartNotify`, stopped on
    /// teardown.
    pub subscribed: Vec<ObjectPath>,
    pub backoff: Duration,
    /// Generation counter matching retry ticks to the timer that armed
    /// them; a stale tick is discarded.
    pub retry_seq: u64,
    pub retry: Option<JoinHandle<()>>,
}

impl DeviceRecord {
    pub fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            state: DeviceState::Disconnected,
            connected: false,
            service: None,
            service_ready: false,
            temperature: None,
            command: None,
            battery: None,
            auxiliary: Vec::new(),
            bindings: Vec::new(),
            subscribed: Vec::new(),
            backoff: INITIAL_BACKOFF,
            retry_seq: 0,
            retry: None,
        }
    }

    /// Stores a classified characteristic handle and queues its binding.
    pub fn add_characteristic(&mut self, path: &str, class: CharClass) {
        if self.bindings.iter().any(|b| b.characteristic == path) {
            return;
        }
        match class {
            CharClass::Temperature => self.temperature = Some(path.to_string()),
            CharClass::Command => self.command = Some(path.to_string()),
            CharClass::Battery => self.battery = Some(path.to_string()),
            CharClass::Auxiliary => self.auxiliary.push(path.to_string()),
        }
        self.bindings.push(Binding {
            characteristic: path.to_string(),
            class,
        });
    }

    /// Every characteristic path this record holds a handle to.
    pub fn characteristic_paths(&self) -> Vec<ObjectPath> {
        self.bindings
            .iter()
            .map(|b| b.characteristic.clone())
            .collect()
    }

    /// Cancels a pending retry timer, if any, and invalidates its tick.
    pub fn cancel_retry(&mut self) {
        if let Some(handle) = self.retry.take() {
            handle.abort();
        }
        self.retry_seq += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::constants::uuid_from_u16;

    #[test]
    fn classifies_known_characteristics() {
        assert_eq!(
            CharClass::from_uuid(&uuid_from_u16(0xff01)),
            Some(CharClass::Temperature)
        );
        assert_eq!(
            CharClass::from_uuid(&uuid_from_u16(0xff02)),
            Some(CharClass::Command)
        );
        assert_eq!(
            CharClass::from_uuid(&uuid_from_u16(0x2a19)),
            Some(CharClass::Battery)
        );
        assert_eq!(
            CharClass::from_uuid(&uuid_from_u16(0xff03)),
            Some(CharClass::Auxiliary)
        );
        assert_eq!(
            CharClass::from_uuid(&uuid_from_u16(0xff07)),
            Some(CharClass::Auxiliary)
        );
    }

    #[test]
    fn ignores_ff05_and_foreign_uuids() {
        assert_eq!(CharClass::from_uuid(&uuid_from_u16(0xff05)), None);
        assert_eq!(CharClass::from_uuid(&uuid_from_u16(0x2a00)), None);
    }

    #[test]
    fn duplicate_characteristics_are_queued_once() {
        let mut record = DeviceRecord::new("/d1");
        record.add_characteristic("/d1/s/c1", CharClass::Temperature);
        record.add_characteristic("/d1/s/c1", CharClass::Temperature);
        assert_eq!(record.bindings.len(), 1);
        assert_eq!(record.temperature.as_deref(), Some("/d1/s/c1"));
    }
}
