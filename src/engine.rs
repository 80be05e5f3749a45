use btleplug::api::BDAddr;
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
    time::{sleep_until, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    connection::ConnectionManager,
    error::{PointoError, Result},
    event::{AdapterEvent, EventReceiver, Notifier},
    presenter::DisplaySnapshot,
    registry::DeviceRegistry,
    scan::ScanController,
    transport::{PermissionProvider, Transport},
    types::{ConnectionState, Permission, ScanState, TimeoutConfig},
};

/// Single-writer core tying the registry, scan and connection together
///
/// Every mutation goes through `&mut self`, either a command method or
/// [`Engine::dispatch`]. Run it directly in a single-threaded host, or move it
/// into its own task with [`Engine::spawn`].
pub struct Engine<T: Transport> {
    transport: T,
    permissions: Box<dyn PermissionProvider>,
    notifier: Notifier,
    registry: DeviceRegistry<T::Handle>,
    scan: ScanController,
    connection: ConnectionManager<T::Link>,
}

impl<T: Transport> Engine<T> {
    /// Create an engine around a transport
    pub fn new(
        transport: T,
        permissions: impl PermissionProvider + 'static,
        notifier: Notifier,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            transport,
            permissions: Box::new(permissions),
            notifier,
            registry: DeviceRegistry::new(),
            scan: ScanController::new(),
            connection: ConnectionManager::new(timeouts),
        }
    }

    /// Discovered devices
    #[must_use]
    pub const fn registry(&self) -> &DeviceRegistry<T::Handle> {
        &self.registry
    }

    /// Scan lifecycle state
    #[must_use]
    pub const fn scan_state(&self) -> ScanState {
        self.scan.state()
    }

    /// Connection lifecycle state
    #[must_use]
    pub const fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Connection manager, for inspection
    #[must_use]
    pub const fn connection(&self) -> &ConnectionManager<T::Link> {
        &self.connection
    }

    /// Start scanning
    ///
    /// # Errors
    ///
    /// See [`ScanController::start`].
    pub fn start_scan(&mut self) -> Result<()> {
        self.scan
            .start(&mut self.transport, self.permissions.as_ref(), &self.notifier)
            .map(|_| ())
    }

    /// Stop scanning
    ///
    /// # Errors
    ///
    /// See [`ScanController::stop`].
    pub fn stop_scan(&mut self) -> Result<()> {
        self.scan.stop(&mut self.transport, &self.notifier)
    }

    /// Forget every discovered device
    pub fn clear_devices(&mut self) {
        self.registry.clear();
    }

    /// Connect to the first registered device named `name`
    ///
    /// # Errors
    ///
    /// Returns [`PointoError::DeviceNotFound`] if no device has that name, or
    /// any error from [`ConnectionManager::connect`].
    pub fn connect_by_name(&mut self, name: &str) -> Result<()> {
        let device = self
            .registry
            .resolve_record(name)
            .ok_or_else(|| PointoError::DeviceNotFound(name.to_string()))?;
        self.connection
            .connect(&mut self.transport, device, self.permissions.as_ref())
    }

    /// Connect to the device registered under `address`
    ///
    /// # Errors
    ///
    /// Returns [`PointoError::DeviceNotFound`] if the address is unknown, or
    /// any error from [`ConnectionManager::connect`].
    pub fn connect_by_address(&mut self, address: BDAddr) -> Result<()> {
        let device = self
            .registry
            .get(address)
            .ok_or_else(|| PointoError::DeviceNotFound(address.to_string()))?;
        self.connection
            .connect(&mut self.transport, device, self.permissions.as_ref())
    }

    /// Tear down the active connection
    ///
    /// # Errors
    ///
    /// Returns [`PointoError::NoActiveConnection`] if nothing is connected;
    /// the call changes nothing in that case.
    pub fn disconnect(&mut self) -> Result<()> {
        if !self.connection.state().is_active() {
            return Err(PointoError::NoActiveConnection);
        }
        self.connection.disconnect(&mut self.transport, &self.notifier);
        Ok(())
    }

    /// Host went to the background: stop scanning and drop the connection
    pub fn suspend(&mut self) {
        info!("Suspending");
        if let Err(e) = self.stop_scan() {
            warn!("Stopping scan on suspend failed: {}", e);
        }
        self.connection.disconnect(&mut self.transport, &self.notifier);
    }

    /// Host came back: resume scanning if scan access is granted
    ///
    /// # Errors
    ///
    /// Returns [`PointoError::AdapterDisabled`] while the radio is off, so the
    /// host can ask the user to switch it on, or the adapter's error if
    /// scanning cannot start.
    pub fn resume(&mut self) -> Result<()> {
        if !self.permissions.is_granted(Permission::Scan) {
            info!("Scan access not granted, not resuming scan");
            return Ok(());
        }
        match self.start_scan() {
            Ok(()) | Err(PointoError::AlreadyScanning) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Snapshot of the connected device, if any
    ///
    /// Available for the whole connection, independent of the registry.
    #[must_use]
    pub fn snapshot(&self) -> Option<DisplaySnapshot> {
        self.connection.snapshot()
    }

    /// Apply one adapter event
    pub fn dispatch(&mut self, event: AdapterEvent<T::Handle>) {
        match event {
            AdapterEvent::ScanResult {
                generation,
                discoveries,
            } => {
                self.scan
                    .on_discoveries(generation, discoveries, &mut self.registry, &self.notifier);
            }
            AdapterEvent::ScanFailed { generation, code } => {
                self.scan.on_failure(generation, code, &self.notifier);
            }
            AdapterEvent::ConnectionStateChanged {
                generation,
                connected: true,
            } => {
                self.connection
                    .on_established(&mut self.transport, generation, &self.notifier);
            }
            AdapterEvent::ConnectionStateChanged {
                generation,
                connected: false,
            } => {
                self.connection.on_disconnected(generation, &self.notifier);
            }
            AdapterEvent::ServicesDiscovered {
                generation,
                services,
            } => {
                self.connection.on_services_discovered(
                    &mut self.transport,
                    generation,
                    services,
                    &self.notifier,
                );
            }
            AdapterEvent::CharacteristicRead {
                generation,
                target,
                value,
            } => {
                self.connection.on_characteristic_read(
                    &mut self.transport,
                    generation,
                    target,
                    value,
                    &self.notifier,
                );
            }
            AdapterEvent::CharacteristicChanged {
                generation,
                target,
                value,
            } => {
                self.connection
                    .on_characteristic_changed(generation, target, value, &self.notifier);
            }
        }
    }

    /// Fire the connection deadline if it has passed at `now`
    pub fn on_deadline(&mut self, now: Instant) {
        self.connection
            .on_deadline(&mut self.transport, now, &self.notifier);
    }

    /// Move the engine into its own task
    ///
    /// `events` is the receiving end of the channel the transport was built
    /// with. Dropping every [`EngineHandle`] shuts the engine down.
    pub fn spawn(self, events: EventReceiver<T::Handle>) -> EngineHandle {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(self.run(requests_rx, events));
        EngineHandle {
            requests: requests_tx,
            task,
        }
    }

    async fn run(
        mut self,
        mut requests: mpsc::UnboundedReceiver<Request>,
        mut events: EventReceiver<T::Handle>,
    ) {
        let mut events_open = true;
        info!("Engine started");

        loop {
            let deadline = self.connection.deadline();
            tokio::select! {
                biased;

                event = events.recv(), if events_open => match event {
                    Some(event) => self.dispatch(event),
                    None => {
                        warn!("Adapter event stream closed");
                        events_open = false;
                    }
                },
                () = wait_for(deadline) => self.on_deadline(Instant::now()),
                request = requests.recv() => match request {
                    Some(request) => {
                        if !self.handle(request) {
                            break;
                        }
                    }
                    None => {
                        self.suspend();
                        break;
                    }
                },
            }
        }

        info!("Engine stopped");
    }

    /// Serve one request; returns `false` once the engine should stop
    fn handle(&mut self, request: Request) -> bool {
        match request {
            Request::StartScan(reply) => reply_with(reply, self.start_scan()),
            Request::StopScan(reply) => reply_with(reply, self.stop_scan()),
            Request::ClearDevices(reply) => {
                self.clear_devices();
                reply_with(reply, Ok(()));
            }
            Request::ConnectByName(name, reply) => reply_with(reply, self.connect_by_name(&name)),
            Request::ConnectByAddress(address, reply) => {
                reply_with(reply, self.connect_by_address(address));
            }
            Request::Disconnect(reply) => reply_with(reply, self.disconnect()),
            Request::Suspend(reply) => {
                self.suspend();
                reply_with(reply, Ok(()));
            }
            Request::Resume(reply) => reply_with(reply, self.resume()),
            Request::Devices(reply) => reply_with(reply, self.registry.snapshot()),
            Request::Snapshot(reply) => reply_with(reply, self.snapshot()),
            Request::State(reply) => {
                reply_with(reply, (self.scan.state(), self.connection.state()));
            }
            Request::Shutdown(done) => {
                self.suspend();
                reply_with(done, ());
                return false;
            }
        }
        true
    }
}

async fn wait_for(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn reply_with<R: std::fmt::Debug>(reply: oneshot::Sender<R>, value: R) {
    if let Err(unsent) = reply.send(value) {
        debug!("Requester went away before reply {:?}", unsent);
    }
}

type Reply<R> = oneshot::Sender<R>;

enum Request {
    StartScan(Reply<Result<()>>),
    StopScan(Reply<Result<()>>),
    ClearDevices(Reply<Result<()>>),
    ConnectByName(String, Reply<Result<()>>),
    ConnectByAddress(BDAddr, Reply<Result<()>>),
    Disconnect(Reply<Result<()>>),
    Suspend(Reply<Result<()>>),
    Resume(Reply<Result<()>>),
    Devices(Reply<Vec<(String, BDAddr)>>),
    Snapshot(Reply<Option<DisplaySnapshot>>),
    State(Reply<(ScanState, ConnectionState)>),
    Shutdown(Reply<()>),
}

/// Async front end to an [`Engine`] running in its own task
///
/// Commands return as soon as the engine has issued the request; progress is
/// reported through the engine's [`Notifier`].
#[derive(Debug)]
pub struct EngineHandle {
    requests: mpsc::UnboundedSender<Request>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::StartScan(_) => "StartScan",
            Self::StopScan(_) => "StopScan",
            Self::ClearDevices(_) => "ClearDevices",
            Self::ConnectByName(..) => "ConnectByName",
            Self::ConnectByAddress(..) => "ConnectByAddress",
            Self::Disconnect(_) => "Disconnect",
            Self::Suspend(_) => "Suspend",
            Self::Resume(_) => "Resume",
            Self::Devices(_) => "Devices",
            Self::Snapshot(_) => "Snapshot",
            Self::State(_) => "State",
            Self::Shutdown(_) => "Shutdown",
        };
        f.write_str(name)
    }
}

impl EngineHandle {
    async fn ask<R>(&self, request: impl FnOnce(Reply<R>) -> Request) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(request(tx))
            .map_err(|_| PointoError::EngineStopped)?;
        rx.await.map_err(|_| PointoError::EngineStopped)
    }

    /// Start scanning
    ///
    /// # Errors
    ///
    /// See [`Engine::start_scan`]; [`PointoError::EngineStopped`] if the
    /// engine is gone.
    pub async fn start_scan(&self) -> Result<()> {
        self.ask(Request::StartScan).await?
    }

    /// Stop scanning
    ///
    /// # Errors
    ///
    /// See [`Engine::stop_scan`].
    pub async fn stop_scan(&self) -> Result<()> {
        self.ask(Request::StopScan).await?
    }

    /// Forget every discovered device
    ///
    /// # Errors
    ///
    /// Returns [`PointoError::EngineStopped`] if the engine is gone.
    pub async fn clear_devices(&self) -> Result<()> {
        self.ask(Request::ClearDevices).await?
    }

    /// Connect to the first registered device named `name`
    ///
    /// # Errors
    ///
    /// See [`Engine::connect_by_name`].
    pub async fn connect_by_name(&self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        self.ask(|reply| Request::ConnectByName(name, reply)).await?
    }

    /// Connect to the device registered under `address`
    ///
    /// # Errors
    ///
    /// See [`Engine::connect_by_address`].
    pub async fn connect_by_address(&self, address: BDAddr) -> Result<()> {
        self.ask(|reply| Request::ConnectByAddress(address, reply))
            .await?
    }

    /// Tear down the active connection
    ///
    /// # Errors
    ///
    /// See [`Engine::disconnect`].
    pub async fn disconnect(&self) -> Result<()> {
        self.ask(Request::Disconnect).await?
    }

    /// Stop scanning and disconnect
    ///
    /// # Errors
    ///
    /// Returns [`PointoError::EngineStopped`] if the engine is gone.
    pub async fn suspend(&self) -> Result<()> {
        self.ask(Request::Suspend).await?
    }

    /// Resume scanning if permitted
    ///
    /// # Errors
    ///
    /// See [`Engine::resume`].
    pub async fn resume(&self) -> Result<()> {
        self.ask(Request::Resume).await?
    }

    /// Registered devices as `(name, address)` in first-seen order
    ///
    /// # Errors
    ///
    /// Returns [`PointoError::EngineStopped`] if the engine is gone.
    pub async fn devices(&self) -> Result<Vec<(String, BDAddr)>> {
        self.ask(Request::Devices).await
    }

    /// Snapshot of the connected device, if any
    ///
    /// # Errors
    ///
    /// Returns [`PointoError::EngineStopped`] if the engine is gone.
    pub async fn snapshot(&self) -> Result<Option<DisplaySnapshot>> {
        self.ask(Request::Snapshot).await
    }

    /// Current scan and connection states
    ///
    /// # Errors
    ///
    /// Returns [`PointoError::EngineStopped`] if the engine is gone.
    pub async fn state(&self) -> Result<(ScanState, ConnectionState)> {
        self.ask(Request::State).await
    }

    /// Stop scanning, release the connection and end the engine task
    ///
    /// # Errors
    ///
    /// Returns [`PointoError::EngineStopped`] if the engine was already gone.
    pub async fn shutdown(self) -> Result<()> {
        let result = self.ask(Request::Shutdown).await;
        if let Err(e) = self.task.await {
            warn!("Engine task ended abnormally: {}", e);
        }
        result
    }
}
