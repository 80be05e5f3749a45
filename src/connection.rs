use btleplug::api::BDAddr;
use bytes::Bytes;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    error::{PointoError, Result},
    event::{Notification, Notifier},
    presenter::{present, DisplaySnapshot},
    reader::{CharacteristicReader, ReadProgress},
    transport::{ensure_enabled, ensure_granted, PermissionProvider, Transport},
    types::{
        CharacteristicRef, ConnectionState, DeviceRecord, Generation, Permission, ServiceRecord,
        TimeoutConfig,
    },
};

/// The single connection resource and everything discovered through it
struct ActiveConnection<L> {
    device: DeviceRecord<()>,
    link: L,
    services: Vec<ServiceRecord>,
    reader: Option<CharacteristicReader>,
}

/// Owns the active connection and runs connect → discover → read → ready
///
/// At most one connection exists. The link is dropped, and therefore
/// released, on every transition to [`ConnectionState::Disconnected`] as well
/// as when the manager itself is dropped.
pub struct ConnectionManager<L> {
    state: ConnectionState,
    generation: Generation,
    active: Option<ActiveConnection<L>>,
    timeouts: TimeoutConfig,
    deadline: Option<Instant>,
}

impl<L> ConnectionManager<L> {
    /// Create a disconnected manager
    #[must_use]
    pub fn new(timeouts: TimeoutConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            generation: Generation::default(),
            active: None,
            timeouts,
            deadline: None,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// Generation that current events must carry
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Address of the connected (or connecting) peripheral
    #[must_use]
    pub fn target_address(&self) -> Option<BDAddr> {
        self.active.as_ref().map(|a| a.device.address())
    }

    /// Services discovered on the active connection
    #[must_use]
    pub fn services(&self) -> &[ServiceRecord] {
        match &self.active {
            Some(active) => &active.services,
            None => &[],
        }
    }

    /// Snapshot of the connected device and everything read so far
    ///
    /// Built from the record captured at connect time, so it stays available
    /// for the whole connection even if the registry is cleared.
    #[must_use]
    pub fn snapshot(&self) -> Option<DisplaySnapshot> {
        self.active
            .as_ref()
            .map(|active| present(&active.device, &active.services))
    }

    /// When the current phase expires, if a deadline is armed
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Deadline configuration
    #[must_use]
    pub const fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    /// Open a connection to `device`
    ///
    /// # Errors
    ///
    /// Returns [`PointoError::AlreadyConnected`] unless disconnected,
    /// [`PointoError::PermissionDenied`] without connect access,
    /// [`PointoError::AdapterDisabled`] while the radio is off, or
    /// [`PointoError::ConnectFailure`] if the request cannot be issued. No
    /// resource is held after an error.
    pub fn connect<T>(
        &mut self,
        transport: &mut T,
        device: &DeviceRecord<T::Handle>,
        permissions: &dyn PermissionProvider,
    ) -> Result<()>
    where
        T: Transport<Link = L>,
    {
        if self.state != ConnectionState::Disconnected {
            return Err(PointoError::AlreadyConnected);
        }
        ensure_granted(permissions, Permission::Connect)?;
        ensure_enabled(transport)?;

        info!("Connecting to device: {} ({})", device.name(), device.address());
        let link = transport
            .connect(device.handle(), self.generation)
            .map_err(|e| match e {
                PointoError::ConnectFailure(_) => e,
                other => PointoError::ConnectFailure(other.to_string()),
            })?;

        self.active = Some(ActiveConnection {
            device: DeviceRecord::new(
                device.address(),
                device.name().to_string(),
                device.kind(),
                (),
            ),
            link,
            services: Vec::new(),
            reader: None,
        });
        self.state = ConnectionState::Connecting;
        self.arm(self.timeouts.connect_timeout());
        Ok(())
    }

    /// Request teardown; a no-op when already disconnected
    ///
    /// The connection is released immediately, so completions still in
    /// flight arrive with a stale generation and are discarded.
    pub fn disconnect<T>(&mut self, transport: &mut T, notifier: &Notifier)
    where
        T: Transport<Link = L>,
    {
        let Some(active) = &self.active else {
            return;
        };

        if let Err(e) = transport.disconnect(&active.link, self.generation) {
            warn!("Adapter failed to disconnect {}: {}", active.device.address(), e);
        }
        self.teardown(notifier);
    }

    /// The link came up
    pub fn on_established<T>(
        &mut self,
        transport: &mut T,
        generation: Generation,
        notifier: &Notifier,
    ) where
        T: Transport<Link = L>,
    {
        if !self.accepts(generation, "link established") {
            return;
        }
        if self.state != ConnectionState::Connecting {
            debug!("Ignoring link-up while {}", self.state);
            return;
        }
        let Some(active) = &self.active else {
            return;
        };

        info!("Connected to {}", active.device.address());
        self.state = ConnectionState::Connected;
        notifier.send(Notification::Connected {
            address: active.device.address(),
        });

        if let Err(e) = transport.discover_services(&active.link, self.generation) {
            self.fail(
                transport,
                PointoError::ServiceDiscoveryFailure(e.to_string()),
                notifier,
            );
            return;
        }
        self.arm(self.timeouts.discovery_timeout());
    }

    /// The link went down, or never came up
    pub fn on_disconnected(&mut self, generation: Generation, notifier: &Notifier) {
        if !self.accepts(generation, "link lost") {
            return;
        }

        if self.state == ConnectionState::Connecting {
            let reason = self
                .active
                .as_ref()
                .map_or_else(String::new, |a| {
                    format!("{} did not respond", a.device.address())
                });
            notifier.send(Notification::Error(PointoError::ConnectFailure(reason)));
        }
        self.teardown(notifier);
    }

    /// Service discovery finished
    pub fn on_services_discovered<T>(
        &mut self,
        transport: &mut T,
        generation: Generation,
        services: std::result::Result<Vec<ServiceRecord>, String>,
        notifier: &Notifier,
    ) where
        T: Transport<Link = L>,
    {
        if !self.accepts(generation, "services discovered") {
            return;
        }
        if self.state != ConnectionState::Connected {
            debug!("Ignoring service discovery result while {}", self.state);
            return;
        }

        let services = match services {
            Ok(services) => services,
            Err(reason) => {
                self.fail(transport, PointoError::ServiceDiscoveryFailure(reason), notifier);
                return;
            }
        };
        let Some(active) = &mut self.active else {
            return;
        };

        self.state = ConnectionState::DiscoveringServices;
        info!("Discovered {} service(s) on {}", services.len(), active.device.address());
        active.reader = Some(CharacteristicReader::new(&services));
        active.services = services;

        self.state = ConnectionState::ReadingCharacteristics;
        self.pump(transport, notifier);
    }

    /// A queued read finished
    pub fn on_characteristic_read<T>(
        &mut self,
        transport: &mut T,
        generation: Generation,
        target: CharacteristicRef,
        value: std::result::Result<Bytes, String>,
        notifier: &Notifier,
    ) where
        T: Transport<Link = L>,
    {
        if !self.accepts(generation, "characteristic read") {
            return;
        }
        let Some(active) = &mut self.active else {
            return;
        };
        let Some(reader) = &mut active.reader else {
            debug!("Ignoring read completion for {} with no queue", target);
            return;
        };

        if reader.on_read(target, value, &mut active.services, notifier) {
            self.pump(transport, notifier);
        }
    }

    /// The peripheral pushed a new value
    pub fn on_characteristic_changed(
        &mut self,
        generation: Generation,
        target: CharacteristicRef,
        value: Bytes,
        notifier: &Notifier,
    ) {
        if !self.accepts(generation, "characteristic changed") {
            return;
        }
        if let Some(active) = &mut self.active {
            CharacteristicReader::on_changed(target, value, &mut active.services, notifier);
        }
    }

    /// Handle expiry of the armed deadline
    ///
    /// A connect or discovery timeout tears the connection down; a read
    /// timeout fails the outstanding read and the queue continues.
    pub fn on_deadline<T>(&mut self, transport: &mut T, now: Instant, notifier: &Notifier)
    where
        T: Transport<Link = L>,
    {
        match self.deadline {
            Some(deadline) if deadline <= now => {}
            _ => return,
        }
        self.deadline = None;

        match self.state {
            ConnectionState::Connecting => {
                let timeout_ms = self.timeouts.connect_timeout_ms;
                self.fail(transport, timeout("connect", timeout_ms), notifier);
            }
            ConnectionState::Connected => {
                let timeout_ms = self.timeouts.discovery_timeout_ms;
                self.fail(transport, timeout("service discovery", timeout_ms), notifier);
            }
            ConnectionState::ReadingCharacteristics => {
                let timeout_ms = self.timeouts.read_timeout_ms;
                let Some(active) = &mut self.active else {
                    return;
                };
                let Some(reader) = &mut active.reader else {
                    return;
                };
                let error = timeout("characteristic read", timeout_ms);
                reader.abandon_in_flight(error.to_string(), &mut active.services, notifier);
                self.pump(transport, notifier);
            }
            ConnectionState::Disconnected
            | ConnectionState::DiscoveringServices
            | ConnectionState::Ready => {}
        }
    }

    fn pump<T>(&mut self, transport: &mut T, notifier: &Notifier)
    where
        T: Transport<Link = L>,
    {
        let generation = self.generation;
        let Some(active) = &mut self.active else {
            return;
        };
        let Some(reader) = &mut active.reader else {
            return;
        };

        match reader.advance(transport, &active.link, generation, &mut active.services, notifier) {
            ReadProgress::Issued(_) => self.arm(self.timeouts.read_timeout()),
            ReadProgress::Completed => {
                active.reader = None;
                self.state = ConnectionState::Ready;
                self.deadline = None;
                info!("All characteristics of {} attempted", active.device.address());
                notifier.send(Notification::Ready {
                    address: active.device.address(),
                });
            }
        }
    }

    fn fail<T>(&mut self, transport: &mut T, error: PointoError, notifier: &Notifier)
    where
        T: Transport<Link = L>,
    {
        error!("{}", error);
        notifier.send(Notification::Error(error));
        self.disconnect(transport, notifier);
    }

    fn teardown(&mut self, notifier: &Notifier) {
        let Some(active) = self.active.take() else {
            return;
        };

        self.generation = self.generation.next();
        self.state = ConnectionState::Disconnected;
        self.deadline = None;
        info!("Disconnected from {}", active.device.address());
        notifier.send(Notification::Disconnected {
            address: active.device.address(),
        });
        drop(active);
    }

    fn arm(&mut self, timeout: Option<Duration>) {
        self.deadline = timeout.map(|t| Instant::now() + t);
    }

    fn accepts(&self, generation: Generation, what: &str) -> bool {
        let current = self.active.is_some() && generation == self.generation;
        if !current {
            debug!("Discarding stale {} event from {}", what, generation);
        }
        current
    }
}

fn timeout(operation: &str, timeout_ms: u64) -> PointoError {
    PointoError::Timeout {
        operation: operation.to_string(),
        timeout_ms,
    }
}
