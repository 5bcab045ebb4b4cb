//! Device Supervisor
//!
//! The per-device state machine: discovery → connect → service resolution
//! → pseudo-pairing → active, with exponential-backoff retries for every
//! transport step and an idempotent teardown that all failure triggers
//! funnel into. Implemented on the coordinator, which owns the records
//! and serialises every transition.

use log::{debug, info, warn};

use crate::api::bus::{BusApi, BusError, WriteOptions};
use crate::controller::coordinator::Coordinator;
use crate::core::constants::{
    INITIAL_BACKOFF, INIT_SEQUENCE, MAX_BACKOFF, MIN_BINDINGS, PSEUDO_PAIR_COMMAND,
};
use crate::core::events::{AppEvent, DeviceProps, PropertyUpdate};
use crate::model::device::{Binding, CharClass, DeviceRecord, DeviceState};

impl<B: BusApi> Coordinator<B> {
    /// A device with a matching name showed up on the bus.
    ///
    /// Known records are only re-driven when they sit in `Disconnected`
    /// (the sweep path retries failed devices this way). A brand-new
    /// device that already claims to be connected is in a corrupted
    /// half-state left over from a previous run; it gets a disconnect and
    /// another chance on the next sweep.
    pub(crate) async fn admit_device(&mut self, path: &str, props: &DeviceProps) {
        if let Some(record) = self.devices.get(path) {
            if record.state == DeviceState::Disconnected {
                self.start_connect(path).await;
            }
            return;
        }
        if self.slots.free_count() == 0 {
            warn!("no slot capacity left, not admitting {}", path);
            return;
        }
        if props.connected {
            warn!("{} already connected at discovery, resetting it", path);
            self.slots.deallocate(path);
            if let Err(e) = self.bus.disconnect_device(path).await {
                debug!("reset disconnect on {} failed: {}", path, e);
            }
            return;
        }
        info!("admitting thermometer {}", path);
        self.devices.insert(path.to_string(), DeviceRecord::new(path));
        self.start_connect(path).await;
    }

    /// Drives `Disconnected → Connecting`. A synchronous connect failure
    /// falls back to `Disconnected` and arms the backoff timer.
    pub(crate) async fn start_connect(&mut self, path: &str) {
        let Some(record) = self.devices.get_mut(path) else {
            return;
        };
        record.state = DeviceState::Connecting;
        match self.bus.connect_device(path).await {
            Ok(()) => {
                if let Err(e) = self.bus.set_trusted(path, true).await {
                    warn!("setting Trusted on {} failed: {}", path, e);
                }
            }
            Err(e) => {
                warn!("Connect on {} failed: {}", path, e);
                if let Some(record) = self.devices.get_mut(path) {
                    record.state = DeviceState::Disconnected;
                }
                self.schedule_retry(path);
            }
        }
    }

    /// `PropertiesChanged` on a supervised device path.
    pub(crate) async fn on_device_properties(&mut self, path: &str, update: &PropertyUpdate) {
        if let Some(connected) = update.connected {
            let Some(record) = self.devices.get_mut(path) else {
                return;
            };
            record.connected = connected;
            if connected && record.state == DeviceState::Connecting {
                debug!("{} link up", path);
                record.state = DeviceState::Connected;
            }
        }
        match update.services_resolved {
            Some(true) => {
                let resolved_from_connected = self
                    .devices
                    .get(path)
                    .map(|record| record.state == DeviceState::Connected)
                    .unwrap_or(false);
                if resolved_from_connected {
                    self.resolve_services(path).await;
                }
            }
            Some(false) => {
                if self.devices.contains_key(path) {
                    info!("{} lost service resolution", path);
                    self.teardown(path).await;
                }
            }
            None => {}
        }
    }

    /// `Connected → ServicesResolved`: gather the characteristics under
    /// this device, bail out for a partial enumeration, then pseudo-pair.
    pub(crate) async fn resolve_services(&mut self, path: &str) {
        {
            let Some(record) = self.devices.get_mut(path) else {
                return;
            };
            record.state = DeviceState::ServicesResolved;
        }
        // Characteristics whose InterfacesAdded signals fired before this
        // record existed only show up in a fresh enumeration.
        match self.bus.enumerate_objects().await {
            Ok(objects) => {
                for (object_path, summary) in &objects {
                    if let Some(props) = &summary.service {
                        self.handle_service(object_path, props);
                    }
                }
                for (object_path, summary) in &objects {
                    if let Some(props) = &summary.characteristic {
                        self.handle_characteristic(object_path, props);
                    }
                }
            }
            Err(e) => {
                warn!("enumerating services of {} failed: {}", path, e);
                self.schedule_retry(path);
                return;
            }
        }
        let Some(record) = self.devices.get(path) else {
            return;
        };
        if !record.service_ready && record.bindings.len() < MIN_BINDINGS {
            warn!(
                "{} resolved a partial service ({} of {} characteristics), reconnecting",
                path,
                record.bindings.len(),
                MIN_BINDINGS
            );
            if let Err(e) = self.bus.disconnect_device(path).await {
                warn!("re-enumeration disconnect on {} failed: {}", path, e);
            }
            if let Some(record) = self.devices.get_mut(path) {
                record.state = DeviceState::Disconnected;
            }
            return;
        }
        if let Some(record) = self.devices.get_mut(path) {
            record.service_ready = true;
        }
        self.pseudo_pair(path).await;
    }

    /// `ServicesResolved → PseudoPairing → Active`. Completing the write
    /// burst counts as activation; the device sends no acknowledgement
    /// worth parsing, it simply starts streaming.
    pub(crate) async fn pseudo_pair(&mut self, path: &str) {
        let (temperature, command, bindings) = {
            let Some(record) = self.devices.get_mut(path) else {
                return;
            };
            record.state = DeviceState::PseudoPairing;
            (
                record.temperature.clone(),
                record.command.clone(),
                record.bindings.clone(),
            )
        };
        let (Some(temperature), Some(command)) = (temperature, command) else {
            warn!("{} lacks its temperature or command characteristic", path);
            self.schedule_retry(path);
            return;
        };
        if let Err(e) = self
            .activate(path, &temperature, &command, &bindings)
            .await
        {
            warn!("pseudo-pairing {} failed: {}", path, e);
            self.schedule_retry(path);
            return;
        }
        let Some(record) = self.devices.get_mut(path) else {
            return;
        };
        record.state = DeviceState::Active { offset: None };
        record.backoff = INITIAL_BACKOFF;
        record.cancel_retry();
        info!("{} active", path);
    }

    async fn activate(
        &mut self,
        path: &str,
        temperature: &str,
        command: &str,
        bindings: &[Binding],
    ) -> Result<(), BusError> {
        self.subscribe(path, temperature, CharClass::Temperature)
            .await?;
        self.bus
            .write_value(command, &PSEUDO_PAIR_COMMAND, WriteOptions::request())
            .await?;
        for chunk in INIT_SEQUENCE {
            self.bus
                .write_value(command, chunk, WriteOptions::request())
                .await?;
        }
        for binding in bindings {
            self.subscribe(path, &binding.characteristic, binding.class)
                .await?;
        }
        Ok(())
    }

    /// Routes a characteristic's notifications to its device and starts
    /// delivery. Skips characteristics that already notify, so a retried
    /// pseudo-pairing pass does not double-subscribe.
    async fn subscribe(
        &mut self,
        device: &str,
        characteristic: &str,
        class: CharClass,
    ) -> Result<(), BusError> {
        self.routes
            .insert(characteristic.to_string(), (device.to_string(), class));
        let already = self
            .devices
            .get(device)
            .map(|record| record.subscribed.iter().any(|s| s == characteristic))
            .unwrap_or(true);
        if already {
            return Ok(());
        }
        self.bus.start_notify(characteristic).await?;
        if let Some(record) = self.devices.get_mut(device) {
            record.subscribed.push(characteristic.to_string());
        }
        Ok(())
    }

    /// Arms the single-shot backoff timer for this device, replacing any
    /// pending one. The delay is the current backoff capped at
    /// [`MAX_BACKOFF`]; the backoff itself doubles per armed retry.
    pub(crate) fn schedule_retry(&mut self, path: &str) {
        let Some(record) = self.devices.get_mut(path) else {
            return;
        };
        record.cancel_retry();
        let delay = record.backoff.min(MAX_BACKOFF);
        record.backoff = (record.backoff * 2).min(MAX_BACKOFF);
        let seq = record.retry_seq;
        let tx = self.tx.clone();
        let target = path.to_string();
        debug!("retrying {} in {:?}", path, delay);
        record.retry = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(AppEvent::Retry { path: target, seq });
        }));
    }

    /// A backoff timer fired: re-drive the action of the device's current
    /// phase. Ticks from cancelled timers carry a stale generation and
    /// are dropped.
    pub(crate) async fn handle_retry(&mut self, path: &str, seq: u64) {
        let state = {
            let Some(record) = self.devices.get_mut(path) else {
                return;
            };
            if record.retry_seq != seq {
                debug!("stale retry tick for {}", path);
                return;
            }
            record.retry = None;
            record.state.clone()
        };
        match state {
            DeviceState::Disconnected | DeviceState::Connecting => self.start_connect(path).await,
            DeviceState::ServicesResolved | DeviceState::PseudoPairing => {
                self.pseudo_pair(path).await
            }
            DeviceState::Connected | DeviceState::Active { .. } | DeviceState::Teardown => {}
        }
    }

    /// Forced clean disconnect, reference drop and stack cache flush.
    /// Every failure trigger lands here; repeated calls are no-ops, and
    /// every bus error on the way out is logged and swallowed so the
    /// teardown always completes.
    pub(crate) async fn teardown(&mut self, path: &str) {
        let Some(mut record) = self.devices.remove(path) else {
            return;
        };
        info!("tearing down {}", path);
        record.state = DeviceState::Teardown;
        record.cancel_retry();
        for characteristic in &record.subscribed {
            if let Err(e) = self.bus.stop_notify(characteristic).await {
                warn!("StopNotify on {} failed: {}", characteristic, e);
            }
        }
        if let Err(e) = self.bus.disconnect_device(path).await {
            warn!("Disconnect on {} failed: {}", path, e);
        }
        for characteristic in record.characteristic_paths() {
            self.routes.remove(&characteristic);
        }
        self.slots.deallocate(path);
        if let Err(e) = self.bus.remove_device(path).await {
            debug!("RemoveDevice({}) failed, object likely gone: {}", path, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::bus::MockBusApi;
    use crate::controller::logger::ThermalLog;
    use crate::core::constants::{uuid_from_u16, TEMPERATURE_SERVICE_UUID};
    use crate::core::events::{CharacteristicProps, ObjectPath, ObjectSummary, ServiceProps};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    const DEV: &str = "/org/bluez/hci0/dev_D1";
    const SERVICE: &str = "/org/bluez/hci0/dev_D1/service0028";

    fn coordinator(bus: MockBusApi) -> Coordinator<MockBusApi> {
        let (tx, rx) = mpsc::unbounded_channel();
        let log = ThermalLog::with_sink(Box::new(std::io::sink()), Duration::from_secs(120));
        Coordinator::new(Arc::new(bus), tx, rx, log)
    }

    fn admitted(coordinator: &mut Coordinator<MockBusApi>) {
        coordinator
            .devices
            .insert(DEV.to_string(), DeviceRecord::new(DEV));
    }

    fn props(name: &str, connected: bool) -> DeviceProps {
        DeviceProps {
            name: Some(name.to_string()),
            connected,
            services_resolved: false,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn connect_failures_back_off_exponentially() {
        let mut bus = MockBusApi::new();
        bus.expect_connect_device()
            .times(4)
            .returning(|_| Err(BusError::Transport("le-connection-abort".into())));
        let mut coordinator = coordinator(bus);

        coordinator.admit_device(DEV, &props("IDT-34c-B", false)).await;
        let delays = |c: &Coordinator<MockBusApi>| c.devices.get(DEV).unwrap().backoff;
        // The armed delay is the value before doubling: 2, 4, 8, then 16.
        assert_eq!(delays(&coordinator), Duration::from_secs(4));

        for expected in [8u64, 16, 16] {
            let seq = coordinator.devices.get(DEV).unwrap().retry_seq;
            coordinator.handle_retry(DEV, seq).await;
            assert_eq!(delays(&coordinator), Duration::from_secs(expected));
            assert_eq!(
                coordinator.devices.get(DEV).unwrap().state,
                DeviceState::Disconnected
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn reaching_active_resets_the_backoff() {
        let mut bus = MockBusApi::new();
        bus.expect_write_value().returning(|_, _, _| Ok(()));
        bus.expect_start_notify().returning(|_| Ok(()));
        let mut coordinator = coordinator(bus);
        admitted(&mut coordinator);
        {
            let record = coordinator.devices.get_mut(DEV).unwrap();
            record.state = DeviceState::ServicesResolved;
            record.backoff = Duration::from_secs(16);
            record.add_characteristic(&format!("{}/char0029", SERVICE), CharClass::Temperature);
            record.add_characteristic(&format!("{}/char002b", SERVICE), CharClass::Command);
        }

        coordinator.pseudo_pair(DEV).await;

        let record = coordinator.devices.get(DEV).unwrap();
        assert_eq!(record.state, DeviceState::Active { offset: None });
        assert_eq!(record.backoff, INITIAL_BACKOFF);
        assert!(record.retry.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_retry_ticks_are_dropped() {
        let mut bus = MockBusApi::new();
        bus.expect_connect_device().times(0);
        let mut coordinator = coordinator(bus);
        admitted(&mut coordinator);
        {
            let record = coordinator.devices.get_mut(DEV).unwrap();
            record.retry_seq = 3;
        }
        coordinator.handle_retry(DEV, 2).await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_pseudo_pairing_schedules_a_retry() {
        let mut bus = MockBusApi::new();
        bus.expect_start_notify()
            .returning(|_| Err(BusError::Transport("notify refused".into())));
        let mut coordinator = coordinator(bus);
        admitted(&mut coordinator);
        {
            let record = coordinator.devices.get_mut(DEV).unwrap();
            record.state = DeviceState::ServicesResolved;
            record.add_characteristic(&format!("{}/char0029", SERVICE), CharClass::Temperature);
            record.add_characteristic(&format!("{}/char002b", SERVICE), CharClass::Command);
        }

        coordinator.pseudo_pair(DEV).await;

        let record = coordinator.devices.get(DEV).unwrap();
        assert_eq!(record.state, DeviceState::PseudoPairing);
        assert!(record.retry.is_some());
        assert_eq!(record.backoff, Duration::from_secs(4));
    }

    #[tokio::test]
    async fn partial_service_forces_a_reconnect() {
        let mut bus = MockBusApi::new();
        bus.expect_enumerate_objects().returning(|| {
            let mut objects: HashMap<ObjectPath, ObjectSummary> = HashMap::new();
            objects.insert(
                SERVICE.to_string(),
                ObjectSummary {
                    service: Some(ServiceProps {
                        uuid: Some(TEMPERATURE_SERVICE_UUID),
                        device: Some(DEV.to_string()),
                    }),
                    ..Default::default()
                },
            );
            objects.insert(
                format!("{}/char0029", SERVICE),
                ObjectSummary {
                    characteristic: Some(CharacteristicProps {
                        uuid: Some(uuid_from_u16(0xff01)),
                    }),
                    ..Default::default()
                },
            );
            Ok(objects)
        });
        bus.expect_disconnect_device()
            .times(1)
            .returning(|_| Ok(()));
        let mut coordinator = coordinator(bus);
        admitted(&mut coordinator);
        coordinator.devices.get_mut(DEV).unwrap().state = DeviceState::Connected;
        coordinator.devices.get_mut(DEV).unwrap().connected = true;

        coordinator
            .on_device_properties(
                DEV,
                &PropertyUpdate {
                    services_resolved: Some(true),
                    ..Default::default()
                },
            )
            .await;

        let record = coordinator.devices.get(DEV).unwrap();
        assert_eq!(record.state, DeviceState::Disconnected);
        assert!(!record.service_ready);
    }

    #[tokio::test]
    async fn services_resolved_false_tears_down() {
        let mut bus = MockBusApi::new();
        bus.expect_disconnect_device().times(1).returning(|_| Ok(()));
        bus.expect_remove_device().times(1).returning(|_| Ok(()));
        let mut coordinator = coordinator(bus);
        admitted(&mut coordinator);
        coordinator.devices.get_mut(DEV).unwrap().state = DeviceState::Active { offset: None };

        coordinator
            .on_device_properties(
                DEV,
                &PropertyUpdate {
                    services_resolved: Some(false),
                    ..Default::default()
                },
            )
            .await;
        assert!(coordinator.devices.is_empty());
    }

    #[tokio::test]
    async fn teardown_is_idempotent() {
        let mut bus = MockBusApi::new();
        bus.expect_stop_notify()
            .times(1)
            .returning(|_| Err(BusError::Transport("no session".into())));
        bus.expect_disconnect_device().times(1).returning(|_| Ok(()));
        bus.expect_remove_device().times(1).returning(|_| Ok(()));
        let mut coordinator = coordinator(bus);
        admitted(&mut coordinator);
        {
            let record = coordinator.devices.get_mut(DEV).unwrap();
            record.add_characteristic(&format!("{}/char0029", SERVICE), CharClass::Temperature);
            record.subscribed = vec![format!("{}/char0029", SERVICE)];
        }
        coordinator.slots.allocate(DEV);

        coordinator.teardown(DEV).await;
        coordinator.teardown(DEV).await;

        assert!(coordinator.devices.is_empty());
        assert_eq!(coordinator.slots.offset_of(DEV), None);
        assert_eq!(coordinator.slots.free_count(), 6);
    }

    #[tokio::test]
    async fn corrupted_connection_state_is_reset_not_admitted() {
        let mut bus = MockBusApi::new();
        bus.expect_disconnect_device().times(1).returning(|_| Ok(()));
        bus.expect_connect_device().times(0);
        let mut coordinator = coordinator(bus);

        coordinator.admit_device(DEV, &props("IDT-34c-B", true)).await;
        assert!(coordinator.devices.is_empty());
    }
}
