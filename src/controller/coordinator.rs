//! Coordinator
//!
//! Owns the set of device records and everything they feed: the slot
//! allocator, the sample register and the logger. All bus signals and
//! periodic ticks arrive as [`AppEvent`]s on one channel; consuming them
//! from a single task is what serialises access to the shared state.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, error, info, warn};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::api::bus::BusApi;
use crate::core::constants::{SLOT_WIDTH, TARGET_DEVICE_NAMES, TEMPERATURE_SERVICE_UUID};
use crate::core::events::{
    parent_path, AppEvent, BusEvent, CharacteristicProps, ObjectPath, ObjectSummary,
    PropertyUpdate, ServiceProps,
};
use crate::controller::logger::ThermalLog;
use crate::model::device::{CharClass, DeviceRecord, DeviceState};
use crate::model::packet::TemperaturePacket;
use crate::model::register::SampleRegister;
use crate::model::slots::SlotAllocator;

pub struct Coordinator<B: BusApi> {
    pub(crate) bus: Arc<B>,
    pub(crate) tx: UnboundedSender<AppEvent>,
    rx: UnboundedReceiver<AppEvent>,
    pub(crate) devices: HashMap<ObjectPath, DeviceRecord>,
    /// Dispatch routes for subscribed characteristics: characteristic
    /// path to owning device and class.
    pub(crate) routes: HashMap<ObjectPath, (ObjectPath, CharClass)>,
    pub(crate) slots: SlotAllocator,
    pub(crate) register: SampleRegister,
    log: ThermalLog,
}

impl<B: BusApi> Coordinator<B> {
    pub fn new(
        bus: Arc<B>,
        tx: UnboundedSender<AppEvent>,
        rx: UnboundedReceiver<AppEvent>,
        log: ThermalLog,
    ) -> Self {
        Self {
            bus,
            tx,
            rx,
            devices: HashMap::new(),
            routes: HashMap::new(),
            slots: SlotAllocator::new(),
            register: SampleRegister::new(),
            log,
        }
    }

    /// Consumes events until shutdown. The first sweep arrives right away
    /// from the sweep ticker, so discovery needs no special-casing here.
    pub async fn run(mut self) -> Result<()> {
        while let Some(event) = self.rx.recv().await {
            if self.handle_event(event).await {
                break;
            }
        }
        Ok(())
    }

    /// Returns true when the loop should stop.
    pub(crate) async fn handle_event(&mut self, event: AppEvent) -> bool {
        match event {
            AppEvent::Bus(BusEvent::InterfacesAdded { path, summary }) => {
                self.handle_object(&path, &summary).await;
            }
            AppEvent::Bus(BusEvent::InterfacesRemoved { path, device }) => {
                if device && self.devices.contains_key(&path) {
                    info!("bus removed device object {}", path);
                    self.teardown(&path).await;
                }
            }
            AppEvent::Bus(BusEvent::PropertiesChanged { path, update }) => {
                self.handle_properties(&path, &update).await;
            }
            AppEvent::Retry { path, seq } => self.handle_retry(&path, seq).await,
            AppEvent::Sweep => self.sweep().await,
            AppEvent::LogTick => {
                if let Err(e) = self
                    .log
                    .tick(&mut self.register, &self.devices, &*self.bus)
                    .await
                {
                    error!("logger cycle failed: {}", e);
                }
            }
            AppEvent::Shutdown => {
                self.shutdown().await;
                return true;
            }
        }
        false
    }

    /// Classifies one bus object and routes it to the supervisor or the
    /// GATT bookkeeping. Used for both live `InterfacesAdded` signals and
    /// sweep enumerations; every branch is idempotent.
    pub(crate) async fn handle_object(&mut self, path: &str, summary: &ObjectSummary) {
        if let Some(props) = &summary.device {
            let name = props.name.as_deref().unwrap_or_default();
            if TARGET_DEVICE_NAMES.contains(&name) {
                self.admit_device(path, props).await;
            }
        }
        if let Some(props) = &summary.service {
            self.handle_service(path, props);
        }
        if let Some(props) = &summary.characteristic {
            self.handle_characteristic(path, props);
        }
    }

    /// A GATT service appeared. Only the thermometer's temperature
    /// service on a known device is interesting; seeing it prepares a
    /// fresh binding queue on the record.
    pub(crate) fn handle_service(&mut self, path: &str, props: &ServiceProps) {
        if props.uuid != Some(TEMPERATURE_SERVICE_UUID) {
            return;
        }
        let device_path = props
            .device
            .clone()
            .unwrap_or_else(|| parent_path(path).to_string());
        let Some(record) = self.devices.get_mut(&device_path) else {
            return;
        };
        if record.service.as_deref() == Some(path) {
            return;
        }
        debug!("temperature service for {}: {}", device_path, path);
        record.service = Some(path.to_string());
        record.service_ready = false;
        record.temperature = None;
        record.command = None;
        record.battery = None;
        record.auxiliary.clear();
        record.bindings.clear();
    }

    /// A GATT characteristic appeared under a known, not yet fully bound
    /// service: classify it and queue its binding.
    pub(crate) fn handle_characteristic(&mut self, path: &str, props: &CharacteristicProps) {
        let service_path = parent_path(path);
        let Some(record) = self
            .devices
            .values_mut()
            .find(|r| r.service.as_deref() == Some(service_path))
        else {
            return;
        };
        if record.service_ready {
            return;
        }
        let Some(class) = props.uuid.as_ref().and_then(CharClass::from_uuid) else {
            return;
        };
        record.add_characteristic(path, class);
    }

    pub(crate) async fn handle_properties(&mut self, path: &str, update: &PropertyUpdate) {
        if self.devices.contains_key(path) {
            self.on_device_properties(path, update).await;
        } else if let Some(value) = &update.value {
            self.handle_value(path, value);
        }
    }

    /// A notification landed on a subscribed characteristic.
    pub(crate) fn handle_value(&mut self, characteristic: &str, value: &[u8]) {
        let Some((device_path, class)) = self.routes.get(characteristic).cloned() else {
            return;
        };
        match class {
            CharClass::Temperature => self.handle_temperature(&device_path, value),
            CharClass::Command => {
                debug!("command notification from {}: {:02x?}", device_path, value);
            }
            CharClass::Battery => {
                if let Some(&level) = value.first() {
                    info!("battery on {}: {}%", device_path, level);
                }
            }
            CharClass::Auxiliary => {
                debug!("auxiliary notification from {}: {:02x?}", device_path, value);
            }
        }
    }

    /// The slot attaches on the first temperature notification of a
    /// connected device; until then the device holds no channels.
    fn handle_temperature(&mut self, device_path: &str, value: &[u8]) {
        let offset = match self.slots.offset_of(device_path) {
            Some(offset) => offset,
            None => {
                let Some(record) = self.devices.get_mut(device_path) else {
                    return;
                };
                if !record.connected {
                    debug!("temperature notify for disconnected {}", device_path);
                    return;
                }
                let Some(offset) = self.slots.allocate(device_path) else {
                    warn!("no free slot for {}, dropping sample", device_path);
                    return;
                };
                info!(
                    "{} owns channels {}..={}",
                    device_path,
                    offset,
                    offset + SLOT_WIDTH - 1
                );
                if let DeviceState::Active { offset: attached } = &mut record.state {
                    *attached = Some(offset);
                }
                offset
            }
        };
        if let Some(packet) = TemperaturePacket::parse(value) {
            self.register.record(offset, packet.channels());
        }
    }

    /// Reconciliation sweep: drive everything the bus knows about as if
    /// freshly added, then tear down records whose object has vanished
    /// without an `InterfacesRemoved` signal.
    pub(crate) async fn sweep(&mut self) {
        let objects = match self.bus.enumerate_objects().await {
            Ok(objects) => objects,
            Err(e) => {
                warn!("sweep enumeration failed: {}", e);
                return;
            }
        };
        for (path, summary) in &objects {
            self.handle_object(path, summary).await;
        }
        let vanished: Vec<ObjectPath> = self
            .devices
            .keys()
            .filter(|path| !objects.contains_key(*path))
            .cloned()
            .collect();
        for path in vanished {
            info!("sweep: {} missing from managed objects", path);
            self.teardown(&path).await;
        }
    }

    pub(crate) async fn shutdown(&mut self) {
        info!("shutting down, tearing down {} device(s)", self.devices.len());
        let paths: Vec<ObjectPath> = self.devices.keys().cloned().collect();
        for path in paths {
            self.teardown(&path).await;
        }
    }
}
