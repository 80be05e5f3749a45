use btleplug::{
    api::{
        Central as _, CentralEvent, CentralState, CharPropFlags, Characteristic, Manager as _,
        Peripheral as _, ScanFilter, Service,
    },
    platform::{Adapter, Manager, Peripheral},
};
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::{runtime::Handle, task::JoinHandle};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::{PointoError, Result},
    event::{AdapterEvent, Discovery, EventSender},
    transport::Transport,
    types::{CharacteristicRef, DeviceKind, Generation, ServiceRecord},
};

/// Scan failure code: the adapter refused for lack of access
pub const SCAN_FAILED_NOT_PERMITTED: i32 = 2;
/// Scan failure code: internal adapter error
pub const SCAN_FAILED_INTERNAL_ERROR: i32 = 3;
/// Scan failure code: scanning is not supported on this adapter
pub const SCAN_FAILED_FEATURE_UNSUPPORTED: i32 = 4;

/// [`Transport`] over the platform Bluetooth stack
pub struct BtleplugTransport {
    central: Adapter,
    events: EventSender<Peripheral>,
    powered: Arc<AtomicBool>,
    power_watch: JoinHandle<()>,
    scan_task: Option<JoinHandle<()>>,
    runtime: Handle,
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter
    ///
    /// Completions are sent on `events`; feed the receiving end to
    /// [`crate::Engine::spawn`]. The radio's power state is tracked from
    /// here on, so scans and connects fail fast while it is switched off.
    ///
    /// # Errors
    ///
    /// Returns [`PointoError::AdapterUnavailable`] if no adapter is present,
    /// or [`PointoError::Ble`] if the platform manager cannot be created.
    pub async fn new(events: EventSender<Peripheral>) -> Result<Self> {
        let manager = Manager::new().await?;
        let central = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(PointoError::AdapterUnavailable)?;

        match central.adapter_info().await {
            Ok(info) => info!("Using adapter {}", info),
            Err(e) => debug!("Adapter info unavailable: {}", e),
        }

        let initial = match central.adapter_state().await {
            Ok(state) => is_powered(&state),
            Err(e) => {
                debug!("Adapter state unavailable, assuming powered: {}", e);
                true
            }
        };
        if !initial {
            warn!("Bluetooth is turned off");
        }
        let powered = Arc::new(AtomicBool::new(initial));
        let power_watch = tokio::spawn(watch_power(central.clone(), Arc::clone(&powered)));

        Ok(Self {
            central,
            events,
            powered,
            power_watch,
            scan_task: None,
            runtime: Handle::current(),
        })
    }
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.power_watch.abort();
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
    }
}

impl Transport for BtleplugTransport {
    type Handle = Peripheral;
    type Link = BtleLink;

    fn is_enabled(&self) -> bool {
        self.powered.load(Ordering::SeqCst)
    }

    fn start_scan(&mut self, generation: Generation) -> Result<()> {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        let central = self.central.clone();
        let events = self.events.clone();
        self.scan_task = Some(self.runtime.spawn(scan(central, generation, events)));
        Ok(())
    }

    fn stop_scan(&mut self) -> Result<()> {
        if let Some(task) = self.scan_task.take() {
            task.abort();
        }
        let central = self.central.clone();
        self.runtime.spawn(async move {
            if let Err(e) = central.stop_scan().await {
                warn!("Failed to stop scan: {}", e);
            }
        });
        Ok(())
    }

    fn connect(&mut self, peripheral: &Peripheral, generation: Generation) -> Result<BtleLink> {
        let driver = self.runtime.spawn(drive(
            self.central.clone(),
            peripheral.clone(),
            generation,
            self.events.clone(),
        ));

        Ok(BtleLink {
            peripheral: peripheral.clone(),
            driver,
            runtime: self.runtime.clone(),
        })
    }

    /// Discover services, subscribe to pushes and report the layout
    ///
    /// btleplug keeps services and characteristics in sorted sets, so the
    /// reported order is by UUID rather than the order the peripheral
    /// announced them in. Positions in [`CharacteristicRef`] refer to this
    /// sorted order.
    fn discover_services(&mut self, link: &BtleLink, generation: Generation) -> Result<()> {
        let peripheral = link.peripheral.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let services = match peripheral.discover_services().await {
                Ok(()) => {
                    subscribe_all(&peripheral).await;
                    Ok(records(&peripheral.services()))
                }
                Err(e) => Err(e.to_string()),
            };
            deliver(
                &events,
                AdapterEvent::ServicesDiscovered {
                    generation,
                    services,
                },
            );
        });
        Ok(())
    }

    fn read_characteristic(
        &mut self,
        link: &BtleLink,
        target: CharacteristicRef,
        generation: Generation,
    ) -> Result<()> {
        let characteristic = characteristic_at(&link.peripheral.services(), target)
            .ok_or_else(|| PointoError::CharacteristicReadFailure {
                characteristic: target,
                reason: "not present on peripheral".to_string(),
            })?;
        if !characteristic.properties.contains(CharPropFlags::READ) {
            return Err(PointoError::CharacteristicReadFailure {
                characteristic: target,
                reason: "not readable".to_string(),
            });
        }

        let peripheral = link.peripheral.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let value = peripheral
                .read(&characteristic)
                .await
                .map(Bytes::from)
                .map_err(|e| e.to_string());
            deliver(
                &events,
                AdapterEvent::CharacteristicRead {
                    generation,
                    target,
                    value,
                },
            );
        });
        Ok(())
    }

    fn disconnect(&mut self, link: &BtleLink, _generation: Generation) -> Result<()> {
        let peripheral = link.peripheral.clone();
        self.runtime.spawn(async move {
            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect {}: {}", peripheral.address(), e);
            }
        });
        Ok(())
    }
}

/// Connection to one peripheral
///
/// Dropping the link stops delivery of its events and disconnects.
pub struct BtleLink {
    peripheral: Peripheral,
    driver: JoinHandle<()>,
    runtime: Handle,
}

impl BtleLink {
    /// The connected peripheral
    #[must_use]
    pub const fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }
}

impl Drop for BtleLink {
    fn drop(&mut self) {
        self.driver.abort();
        let peripheral = self.peripheral.clone();
        self.runtime.spawn(async move {
            if let Ok(true) = peripheral.is_connected().await {
                if let Err(e) = peripheral.disconnect().await {
                    debug!("Disconnect on release of {} failed: {}", peripheral.address(), e);
                }
            }
        });
    }
}

fn deliver(events: &EventSender<Peripheral>, event: AdapterEvent<Peripheral>) -> bool {
    match events.send(event) {
        Ok(()) => true,
        Err(e) => {
            debug!("Engine gone, dropping adapter event from {}", e.0.generation());
            false
        }
    }
}

fn is_powered(state: &CentralState) -> bool {
    !matches!(state, CentralState::PoweredOff)
}

async fn watch_power(central: Adapter, powered: Arc<AtomicBool>) {
    let mut adapter_events = match central.events().await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("Power state updates unavailable: {}", e);
            return;
        }
    };

    while let Some(event) = adapter_events.next().await {
        if let CentralEvent::StateUpdate(state) = event {
            let on = is_powered(&state);
            if powered.swap(on, Ordering::SeqCst) != on {
                info!("Bluetooth turned {}", if on { "on" } else { "off" });
            }
        }
    }
}

async fn scan(central: Adapter, generation: Generation, events: EventSender<Peripheral>) {
    let mut adapter_events = match central.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Adapter event stream unavailable: {}", e);
            deliver(
                &events,
                AdapterEvent::ScanFailed {
                    generation,
                    code: scan_error_code(&e),
                },
            );
            return;
        }
    };

    if let Err(e) = central.start_scan(ScanFilter::default()).await {
        warn!("Adapter refused to scan: {}", e);
        deliver(
            &events,
            AdapterEvent::ScanFailed {
                generation,
                code: scan_error_code(&e),
            },
        );
        return;
    }

    while let Some(event) = adapter_events.next().await {
        let id = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
            _ => continue,
        };
        let Ok(peripheral) = central.peripheral(&id).await else {
            continue;
        };
        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.local_name);

        let discovery = Discovery {
            address: peripheral.address(),
            name,
            kind: DeviceKind::LowEnergy,
            handle: peripheral,
        };
        let delivered = deliver(
            &events,
            AdapterEvent::ScanResult {
                generation,
                discoveries: vec![discovery],
            },
        );
        if !delivered {
            break;
        }
    }
}

async fn drive(
    central: Adapter,
    peripheral: Peripheral,
    generation: Generation,
    events: EventSender<Peripheral>,
) {
    let report = |connected| {
        deliver(
            &events,
            AdapterEvent::ConnectionStateChanged {
                generation,
                connected,
            },
        )
    };

    let mut adapter_events = match central.events().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!("Adapter event stream unavailable: {}", e);
            report(false);
            return;
        }
    };

    if let Err(e) = peripheral.connect().await {
        warn!("Failed to connect to {}: {}", peripheral.address(), e);
        report(false);
        return;
    }
    if !report(true) {
        return;
    }

    let mut notifications = match peripheral.notifications().await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("Notifications unavailable: {}", e);
            stream::empty().boxed()
        }
    };

    loop {
        tokio::select! {
            event = adapter_events.next() => match event {
                Some(CentralEvent::DeviceDisconnected(id)) if id == peripheral.id() => {
                    info!("{} disconnected", peripheral.address());
                    report(false);
                    break;
                }
                Some(_) => {}
                None => {
                    report(false);
                    break;
                }
            },
            Some(notification) = notifications.next() => {
                let Some(target) = position_of(&peripheral.services(), notification.uuid) else {
                    debug!("Notification from unknown characteristic {}", notification.uuid);
                    continue;
                };
                let delivered = deliver(
                    &events,
                    AdapterEvent::CharacteristicChanged {
                        generation,
                        target,
                        value: Bytes::from(notification.value),
                    },
                );
                if !delivered {
                    break;
                }
            }
        }
    }
}

async fn subscribe_all(peripheral: &Peripheral) {
    for characteristic in peripheral.characteristics() {
        if characteristic
            .properties
            .intersects(CharPropFlags::NOTIFY | CharPropFlags::INDICATE)
        {
            if let Err(e) = peripheral.subscribe(&characteristic).await {
                debug!("Could not subscribe to {}: {}", characteristic.uuid, e);
            }
        }
    }
}

fn records(services: &BTreeSet<Service>) -> Vec<ServiceRecord> {
    services
        .iter()
        .map(|s| ServiceRecord::new(s.uuid, s.characteristics.iter().map(|c| c.uuid)))
        .collect()
}

fn characteristic_at(
    services: &BTreeSet<Service>,
    target: CharacteristicRef,
) -> Option<Characteristic> {
    let service = services
        .iter()
        .nth(target.service_index)
        .filter(|s| s.uuid == target.service)?;
    service
        .characteristics
        .iter()
        .nth(target.index)
        .filter(|c| c.uuid == target.characteristic)
        .cloned()
}

/// Position of the first characteristic with `uuid`
///
/// Notifications carry only the characteristic UUID, so a push from one of
/// several same-UUID characteristics is attributed to the first of them.
fn position_of(services: &BTreeSet<Service>, uuid: Uuid) -> Option<CharacteristicRef> {
    services.iter().enumerate().find_map(|(service_index, s)| {
        s.characteristics
            .iter()
            .position(|c| c.uuid == uuid)
            .map(|index| CharacteristicRef::new(service_index, s.uuid, index, uuid))
    })
}

fn scan_error_code(error: &btleplug::Error) -> i32 {
    match error {
        btleplug::Error::PermissionDenied => SCAN_FAILED_NOT_PERMITTED,
        btleplug::Error::NotSupported(_) => SCAN_FAILED_FEATURE_UNSUPPORTED,
        _ => SCAN_FAILED_INTERNAL_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GAP: Uuid = Uuid::from_u128(0x1800);
    const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x180F);
    const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x2A19);
    const DEVICE_NAME: Uuid = Uuid::from_u128(0x2A00);

    fn characteristic(service_uuid: Uuid, uuid: Uuid) -> Characteristic {
        Characteristic {
            uuid,
            service_uuid,
            properties: CharPropFlags::READ | CharPropFlags::NOTIFY,
            descriptors: BTreeSet::new(),
        }
    }

    fn service(uuid: Uuid, characteristics: &[Uuid]) -> Service {
        Service {
            uuid,
            primary: true,
            characteristics: characteristics
                .iter()
                .map(|&c| characteristic(uuid, c))
                .collect(),
        }
    }

    fn layout() -> BTreeSet<Service> {
        [
            service(BATTERY_SERVICE, &[BATTERY_LEVEL]),
            service(GAP, &[DEVICE_NAME]),
        ]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_records_follow_set_order() {
        let records = records(&layout());

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].uuid, GAP);
        assert_eq!(records[1].uuid, BATTERY_SERVICE);
        assert_eq!(records[1].characteristics[0].uuid, BATTERY_LEVEL);
    }

    #[test]
    fn test_characteristic_lookup_is_positional() {
        let services = layout();
        let battery = |service_index, index| {
            CharacteristicRef::new(service_index, BATTERY_SERVICE, index, BATTERY_LEVEL)
        };

        let found = characteristic_at(&services, battery(1, 0)).unwrap();
        assert_eq!(found.service_uuid, BATTERY_SERVICE);
        assert!(characteristic_at(&services, battery(0, 0)).is_none());
        assert!(characteristic_at(&services, battery(1, 1)).is_none());
    }

    #[test]
    fn test_notification_position() {
        let services = layout();

        assert_eq!(
            position_of(&services, BATTERY_LEVEL),
            Some(CharacteristicRef::new(1, BATTERY_SERVICE, 0, BATTERY_LEVEL))
        );
        assert_eq!(position_of(&services, Uuid::from_u128(0xFFFF)), None);
    }

    #[test]
    fn test_deliver_reports_closed_engine() {
        let (events, rx) = tokio::sync::mpsc::unbounded_channel();
        let event = || AdapterEvent::<Peripheral>::ScanFailed {
            generation: Generation::new(1),
            code: SCAN_FAILED_INTERNAL_ERROR,
        };

        assert!(deliver(&events, event()));
        drop(rx);
        assert!(!deliver(&events, event()));
    }

    #[test]
    fn test_power_state() {
        assert!(is_powered(&CentralState::PoweredOn));
        assert!(is_powered(&CentralState::Unknown));
        assert!(!is_powered(&CentralState::PoweredOff));
    }

    #[test]
    fn test_scan_error_codes() {
        assert_eq!(
            scan_error_code(&btleplug::Error::PermissionDenied),
            SCAN_FAILED_NOT_PERMITTED
        );
        assert_eq!(
            scan_error_code(&btleplug::Error::NotSupported("le scan".into())),
            SCAN_FAILED_FEATURE_UNSUPPORTED
        );
        assert_eq!(
            scan_error_code(&btleplug::Error::DeviceNotFound),
            SCAN_FAILED_INTERNAL_ERROR
        );
    }
}
