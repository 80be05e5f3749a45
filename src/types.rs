use btleplug::api::BDAddr;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};
use uuid::Uuid;

/// Monotonically increasing tag distinguishing current events from stale ones
///
/// Every scan session and every connection is stamped with the generation that
/// was current when it was requested. Events carrying any other generation are
/// discarded by the engine.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Generation(u64);

impl Generation {
    /// Create a generation with an explicit value
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Raw counter value
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }

    /// The generation following this one
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

/// Radio technology reported for a discovered peripheral
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Basic rate / EDR only
    Classic,
    /// Low energy only
    LowEnergy,
    /// Dual mode (classic and low energy)
    Dual,
    /// Not reported by the adapter
    Unknown,
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Classic => write!(f, "Classic"),
            Self::LowEnergy => write!(f, "Low Energy"),
            Self::Dual => write!(f, "Dual Mode"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A discovered peripheral
///
/// The address is fixed at construction. The handle is the platform's
/// peripheral object; the registry keeps it so a connection can be opened
/// later, but never owns the underlying connection.
#[derive(Debug, Clone)]
pub struct DeviceRecord<H> {
    address: BDAddr,
    name: String,
    kind: DeviceKind,
    handle: H,
}

impl<H> DeviceRecord<H> {
    /// Create a new device record
    #[must_use]
    pub const fn new(address: BDAddr, name: String, kind: DeviceKind, handle: H) -> Self {
        Self {
            address,
            name,
            kind,
            handle,
        }
    }

    /// Peripheral address
    #[must_use]
    pub const fn address(&self) -> BDAddr {
        self.address
    }

    /// Advertised display name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Reported radio technology
    #[must_use]
    pub const fn kind(&self) -> DeviceKind {
        self.kind
    }

    /// Platform peripheral handle
    #[must_use]
    pub const fn handle(&self) -> &H {
        &self.handle
    }
}

/// Outcome of the queued read for a single characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadStatus {
    /// Not read yet
    Pending,
    /// Read completed and the value was stored
    Read,
    /// Read was attempted and failed
    Failed,
}

impl fmt::Display for ReadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Read => write!(f, "Read"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Last known state of one characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CharacteristicRecord {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Last value read or pushed by the peripheral
    pub value: Option<Bytes>,
    /// Status of the queued read
    pub status: ReadStatus,
}

impl CharacteristicRecord {
    /// Create a pending record with no value
    #[must_use]
    pub const fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            value: None,
            status: ReadStatus::Pending,
        }
    }
}

/// A discovered service and its characteristics in discovery order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    /// Service UUID
    pub uuid: Uuid,
    /// Characteristics in discovery order
    pub characteristics: Vec<CharacteristicRecord>,
}

impl ServiceRecord {
    /// Create a service record with pending characteristics
    pub fn new(uuid: Uuid, characteristics: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            uuid,
            characteristics: characteristics
                .into_iter()
                .map(CharacteristicRecord::new)
                .collect(),
        }
    }
}

/// Reference to one characteristic of a discovered peripheral
///
/// Identity is positional: the service's index in discovery order and the
/// characteristic's index within that service. UUIDs are not unique on a
/// peripheral, so they are carried for lookup and display only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicRef {
    /// Position of the owning service
    pub service_index: usize,
    /// Owning service UUID
    pub service: Uuid,
    /// Position within the owning service
    pub index: usize,
    /// Characteristic UUID
    pub characteristic: Uuid,
}

impl CharacteristicRef {
    /// Create a new characteristic reference
    #[must_use]
    pub const fn new(
        service_index: usize,
        service: Uuid,
        index: usize,
        characteristic: Uuid,
    ) -> Self {
        Self {
            service_index,
            service,
            index,
            characteristic,
        }
    }

    /// Look up the referenced record in a service list
    ///
    /// Returns `None` if the position is out of range or holds a different
    /// UUID than the reference carries.
    pub fn locate_mut<'a>(
        &self,
        services: &'a mut [ServiceRecord],
    ) -> Option<&'a mut CharacteristicRecord> {
        let service = services
            .get_mut(self.service_index)
            .filter(|s| s.uuid == self.service)?;
        service
            .characteristics
            .get_mut(self.index)
            .filter(|c| c.uuid == self.characteristic)
    }
}

impl fmt::Display for CharacteristicRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.characteristic)
    }
}

/// Scan lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    /// No scan running
    #[default]
    Idle,
    /// Adapter is scanning
    Scanning,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Scanning => write!(f, "Scanning"),
        }
    }
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No connection resource exists
    #[default]
    Disconnected,
    /// Connect requested, waiting for the link
    Connecting,
    /// Link established, service discovery requested
    Connected,
    /// Discovered services are being recorded
    DiscoveringServices,
    /// Characteristic read queue is draining
    ReadingCharacteristics,
    /// Every queued read has been attempted
    Ready,
}

impl ConnectionState {
    /// Whether a connection resource is held in this state
    #[must_use]
    pub const fn is_active(self) -> bool {
        !matches!(self, Self::Disconnected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Connected => write!(f, "Connected"),
            Self::DiscoveringServices => write!(f, "Discovering Services"),
            Self::ReadingCharacteristics => write!(f, "Reading Characteristics"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// Access grants the host platform must hold before adapter calls
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Permission {
    /// Scanning for advertisements
    Scan,
    /// Connecting to a peripheral
    Connect,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scan => write!(f, "scan"),
            Self::Connect => write!(f, "connect"),
        }
    }
}

/// Deadline configuration for asynchronous connection phases
///
/// A value of `0` disables the corresponding deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Maximum time spent in `Connecting`
    pub connect_timeout_ms: u64,
    /// Maximum time to wait for service discovery after the link is up
    pub discovery_timeout_ms: u64,
    /// Maximum time a single characteristic read may stay outstanding
    pub read_timeout_ms: u64,
}

impl TimeoutConfig {
    /// Connect deadline, if enabled
    #[must_use]
    pub const fn connect_timeout(&self) -> Option<Duration> {
        as_deadline(self.connect_timeout_ms)
    }

    /// Service discovery deadline, if enabled
    #[must_use]
    pub const fn discovery_timeout(&self) -> Option<Duration> {
        as_deadline(self.discovery_timeout_ms)
    }

    /// Per-read deadline, if enabled
    #[must_use]
    pub const fn read_timeout(&self) -> Option<Duration> {
        as_deadline(self.read_timeout_ms)
    }
}

const fn as_deadline(ms: u64) -> Option<Duration> {
    if ms == 0 {
        None
    } else {
        Some(Duration::from_millis(ms))
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 10_000,
            discovery_timeout_ms: 10_000,
            read_timeout_ms: 5_000,
        }
    }
}
