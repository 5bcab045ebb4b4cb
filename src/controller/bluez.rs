//! BlueZ Bus Adapter
//!
//! Production implementation of [`BusApi`] over the BlueZ D-Bus surface.
//! Everything D-Bus — proxies, property maps, match rules — stays inside
//! this module; signals are parsed here into typed [`BusEvent`]s and
//! forwarded onto the coordinator channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dbus::arg::{prop_cast, PropMap};
use dbus::message::MatchRule;
use dbus::nonblock::stdintf::org_freedesktop_dbus::{ObjectManager, Properties};
use dbus::nonblock::{MsgMatch, Proxy, SyncConnection};
use dbus::Path;
use log::{error, warn};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::api::bus::{BusApi, BusError, WriteOptions};
use crate::core::events::{
    AppEvent, BusEvent, CharacteristicProps, DeviceProps, ObjectPath, ObjectSummary,
    PropertyUpdate, ServiceProps,
};

const SERVICE_NAME: &str = "org.bluez";
const ADAPTER_PATH: &str = "/org/bluez/hci0";
const DEVICE_IFACE: &str = "org.bluez.Device1";
const ADAPTER_IFACE: &str = "org.bluez.Adapter1";
const GATT_SERVICE_IFACE: &str = "org.bluez.GattService1";
const GATT_CHAR_IFACE: &str = "org.bluez.GattCharacteristic1";
const OBJECT_MANAGER_IFACE: &str = "org.freedesktop.DBus.ObjectManager";
const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";

/// Every proxy call is bounded; a hung BlueZ must not wedge the
/// coordinator forever.
const METHOD_CALL_TIMEOUT: Duration = Duration::from_secs(30);

pub struct BluezBus {
    connection: Arc<SyncConnection>,
}

impl BluezBus {
    /// Connects to the system bus. The returned task owns the D-Bus IO
    /// resource; it only completes when the connection is lost, which is
    /// fatal for the process.
    pub async fn connect() -> Result<(Self, JoinHandle<()>), BusError> {
        let (resource, connection) = dbus_tokio::connection::new_system_sync()
            .map_err(|e| BusError::ConnectionLost(e.to_string()))?;
        let io_task = tokio::spawn(async move {
            let err = resource.await;
            error!("lost connection to D-Bus: {}", err);
        });
        Ok((Self { connection }, io_task))
    }

    /// Subscribes the three BlueZ signal families and forwards them,
    /// already typed, onto the coordinator channel. The caller keeps the
    /// returned match tokens alive for as long as it wants the signals.
    pub async fn subscribe_signals(
        &self,
        tx: UnboundedSender<AppEvent>,
    ) -> Result<Vec<MsgMatch>, BusError> {
        let mut matches = Vec::new();
        let added_rule = MatchRule::new_signal(OBJECT_MANAGER_IFACE, "InterfacesAdded")
            .with_sender(SERVICE_NAME);
        let added_tx = tx.clone();
        let added = self
            .connection
            .add_match(added_rule)
            .await
            .map_err(transport)?
            .cb(
                move |_, (path, interfaces): (Path<'static>, HashMap<String, PropMap>)| {
                    let event = BusEvent::InterfacesAdded {
                        path: path.to_string(),
                        summary: summarize(&interfaces),
                    };
                    let _ = added_tx.send(AppEvent::Bus(event));
                    true
                },
            );
        matches.push(added);

        let removed_rule = MatchRule::new_signal(OBJECT_MANAGER_IFACE, "InterfacesRemoved")
            .with_sender(SERVICE_NAME);
        let removed_tx = tx.clone();
        let removed = self
            .connection
            .add_match(removed_rule)
            .await
            .map_err(transport)?
            .cb(
                move |_, (path, interfaces): (Path<'static>, Vec<String>)| {
                    let event = BusEvent::InterfacesRemoved {
                        path: path.to_string(),
                        device: interfaces.iter().any(|name| name == DEVICE_IFACE),
                    };
                    let _ = removed_tx.send(AppEvent::Bus(event));
                    true
                },
            );
        matches.push(removed);

        let changed_rule =
            MatchRule::new_signal(PROPERTIES_IFACE, "PropertiesChanged").with_sender(SERVICE_NAME);
        let changed = self
            .connection
            .add_match(changed_rule)
            .await
            .map_err(transport)?
            .cb(
                move |message, (iface, changed, _invalidated): (String, PropMap, Vec<String>)| {
                    let Some(path) = message.path() else {
                        return true;
                    };
                    let update = narrow_update(&iface, &changed);
                    if !update.is_empty() {
                        let event = BusEvent::PropertiesChanged {
                            path: path.to_string(),
                            update,
                        };
                        let _ = tx.send(AppEvent::Bus(event));
                    }
                    true
                },
            );
        matches.push(changed);
        Ok(matches)
    }

    fn proxy<'a>(&'a self, path: &'a str) -> Proxy<'a, &'a SyncConnection> {
        Proxy::new(SERVICE_NAME, path, METHOD_CALL_TIMEOUT, &*self.connection)
    }
}

fn transport(e: dbus::Error) -> BusError {
    BusError::Transport(e.to_string())
}

/// Narrows one BlueZ interface bundle to the parts the daemon consumes.
fn summarize(interfaces: &HashMap<String, PropMap>) -> ObjectSummary {
    let mut summary = ObjectSummary::default();
    if let Some(props) = interfaces.get(DEVICE_IFACE) {
        summary.device = Some(DeviceProps {
            name: prop_cast::<String>(props, "Name").cloned(),
            connected: prop_cast::<bool>(props, "Connected").copied().unwrap_or(false),
            services_resolved: prop_cast::<bool>(props, "ServicesResolved")
                .copied()
                .unwrap_or(false),
        });
    }
    if let Some(props) = interfaces.get(GATT_SERVICE_IFACE) {
        summary.service = Some(ServiceProps {
            uuid: parse_uuid(props),
            device: prop_cast::<Path<'static>>(props, "Device").map(|p| p.to_string()),
        });
    }
    if let Some(props) = interfaces.get(GATT_CHAR_IFACE) {
        summary.characteristic = Some(CharacteristicProps {
            uuid: parse_uuid(props),
        });
    }
    summary
}

fn parse_uuid(props: &PropMap) -> Option<Uuid> {
    let raw = prop_cast::<String>(props, "UUID")?;
    match Uuid::parse_str(raw) {
        Ok(uuid) => Some(uuid),
        Err(e) => {
            warn!("unparsable UUID {:?} on the bus: {}", raw, e);
            None
        }
    }
}

/// The property subset the supervisor reacts to, per interface.
fn narrow_update(iface: &str, changed: &PropMap) -> PropertyUpdate {
    let mut update = PropertyUpdate::default();
    if iface == DEVICE_IFACE {
        update.connected = prop_cast::<bool>(changed, "Connected").copied();
        update.services_resolved = prop_cast::<bool>(changed, "ServicesResolved").copied();
    }
    if iface == GATT_CHAR_IFACE {
        update.value = prop_cast::<Vec<u8>>(changed, "Value").cloned();
    }
    update
}

#[async_trait]
impl BusApi for BluezBus {
    async fn enumerate_objects(&self) -> Result<HashMap<ObjectPath, ObjectSummary>, BusError> {
        let objects = self
            .proxy("/")
            .get_managed_objects()
            .await
            .map_err(transport)?;
        Ok(objects
            .into_iter()
            .map(|(path, interfaces)| (path.to_string(), summarize(&interfaces)))
            .collect())
    }

    async fn connect_device(&self, path: &str) -> Result<(), BusError> {
        self.proxy(path)
            .method_call(DEVICE_IFACE, "Connect", ())
            .await
            .map_err(transport)
    }

    async fn disconnect_device(&self, path: &str) -> Result<(), BusError> {
        self.proxy(path)
            .method_call(DEVICE_IFACE, "Disconnect", ())
            .await
            .map_err(transport)
    }

    async fn set_trusted(&self, path: &str, trusted: bool) -> Result<(), BusError> {
        self.proxy(path)
            .set(DEVICE_IFACE, "Trusted", trusted)
            .await
            .map_err(transport)
    }

    async fn remove_device(&self, path: &str) -> Result<(), BusError> {
        let device = Path::new(path.to_owned())
            .map_err(|_| BusError::Transport(format!("invalid object path {:?}", path)))?;
        self.proxy(ADAPTER_PATH)
            .method_call(ADAPTER_IFACE, "RemoveDevice", (device,))
            .await
            .map_err(transport)
    }

    async fn start_notify(&self, path: &str) -> Result<(), BusError> {
        self.proxy(path)
            .method_call(GATT_CHAR_IFACE, "StartNotify", ())
            .await
            .map_err(transport)
    }

    async fn stop_notify(&self, path: &str) -> Result<(), BusError> {
        self.proxy(path)
            .method_call(GATT_CHAR_IFACE, "StopNotify", ())
            .await
            .map_err(transport)
    }

    async fn write_value(
        &self,
        path: &str,
        value: &[u8],
        options: WriteOptions,
    ) -> Result<(), BusError> {
        self.proxy(path)
            .method_call(
                GATT_CHAR_IFACE,
                "WriteValue",
                (value.to_vec(), write_options_map(options)),
            )
            .await
            .map_err(transport)
    }

    async fn read_value(&self, path: &str) -> Result<Vec<u8>, BusError> {
        let (value,): (Vec<u8>,) = self
            .proxy(path)
            .method_call(GATT_CHAR_IFACE, "ReadValue", (PropMap::new(),))
            .await
            .map_err(transport)?;
        Ok(value)
    }
}

fn write_options_map(options: WriteOptions) -> PropMap {
    let mut map = PropMap::new();
    if let Some(write_type) = options.write_type {
        map.insert(
            "type".to_string(),
            dbus::arg::Variant(Box::new(write_type.as_str().to_string())),
        );
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use dbus::arg::{RefArg, Variant};

    fn prop(value: impl RefArg + 'static) -> Variant<Box<dyn RefArg>> {
        Variant(Box::new(value))
    }

    #[test]
    fn summarizes_a_device_bundle() {
        let mut props = PropMap::new();
        props.insert("Name".to_string(), prop("IDT-34c-B".to_string()));
        props.insert("Connected".to_string(), prop(true));
        let mut interfaces = HashMap::new();
        interfaces.insert(DEVICE_IFACE.to_string(), props);

        let summary = summarize(&interfaces);
        let device = summary.device.unwrap();
        assert_eq!(device.name.as_deref(), Some("IDT-34c-B"));
        assert!(device.connected);
        assert!(!device.services_resolved);
        assert!(summary.service.is_none());
        assert!(summary.characteristic.is_none());
    }

    #[test]
    fn summarizes_gatt_interfaces() {
        let mut service_props = PropMap::new();
        service_props.insert(
            "UUID".to_string(),
            prop("0000ff00-0000-1000-8000-00805f9b34fb".to_string()),
        );
        service_props.insert(
            "Device".to_string(),
            prop(Path::new("/org/bluez/hci0/dev_D1").unwrap()),
        );
        let mut char_props = PropMap::new();
        char_props.insert(
            "UUID".to_string(),
            prop("0000ff01-0000-1000-8000-00805f9b34fb".to_string()),
        );
        let mut interfaces = HashMap::new();
        interfaces.insert(GATT_SERVICE_IFACE.to_string(), service_props);
        interfaces.insert(GATT_CHAR_IFACE.to_string(), char_props);

        let summary = summarize(&interfaces);
        let service = summary.service.unwrap();
        assert_eq!(
            service.uuid,
            Some(crate::core::constants::TEMPERATURE_SERVICE_UUID)
        );
        assert_eq!(service.device.as_deref(), Some("/org/bluez/hci0/dev_D1"));
        assert_eq!(
            summary.characteristic.unwrap().uuid,
            Some(crate::core::constants::TEMPERATURE_NOTIFY_UUID)
        );
    }

    #[test]
    fn narrows_device_property_changes() {
        let mut changed = PropMap::new();
        changed.insert("ServicesResolved".to_string(), prop(true));
        changed.insert("RSSI".to_string(), prop(-67i16));
        let update = narrow_update(DEVICE_IFACE, &changed);
        assert_eq!(update.services_resolved, Some(true));
        assert_eq!(update.connected, None);
        assert_eq!(update.value, None);
    }

    #[test]
    fn narrows_characteristic_value_changes() {
        let mut changed = PropMap::new();
        changed.insert("Value".to_string(), prop(vec![0xfeu8, 0x7f]));
        let update = narrow_update(GATT_CHAR_IFACE, &changed);
        assert_eq!(update.value, Some(vec![0xfe, 0x7f]));
        // The same payload on an unknown interface is ignored.
        assert!(narrow_update("org.bluez.Battery1", &changed).is_empty());
    }

    #[test]
    fn write_options_carry_the_request_type() {
        let map = write_options_map(WriteOptions::request());
        let written = prop_cast::<String>(&map, "type").unwrap();
        assert_eq!(written, "request");
        assert!(write_options_map(WriteOptions::default()).is_empty());
    }
}
