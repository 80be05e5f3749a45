use btleplug::api::BDAddr;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    error::PointoError,
    types::{CharacteristicRef, DeviceKind, Generation, ServiceRecord},
};

/// Sender half used by a transport to deliver [`AdapterEvent`]s to the engine
pub type EventSender<H> = mpsc::UnboundedSender<AdapterEvent<H>>;

/// Receiver half consumed by [`crate::Engine::spawn`]
pub type EventReceiver<H> = mpsc::UnboundedReceiver<AdapterEvent<H>>;

/// A single advertisement seen during a scan
#[derive(Debug, Clone)]
pub struct Discovery<H> {
    /// Peripheral address
    pub address: BDAddr,
    /// Advertised local name, if any
    pub name: Option<String>,
    /// Reported radio technology
    pub kind: DeviceKind,
    /// Platform peripheral handle
    pub handle: H,
}

/// Completion or push reported by the wireless adapter
///
/// Every variant carries the generation of the scan session or connection
/// the originating request was issued under.
#[derive(Debug, Clone)]
pub enum AdapterEvent<H> {
    /// One or more advertisements (single result or batch)
    ScanResult {
        /// Scan session generation
        generation: Generation,
        /// Advertisements in delivery order
        discoveries: Vec<Discovery<H>>,
    },
    /// The adapter reported a scan failure
    ScanFailed {
        /// Scan session generation
        generation: Generation,
        /// Platform error code
        code: i32,
    },
    /// The link came up or went down
    ConnectionStateChanged {
        /// Connection generation
        generation: Generation,
        /// `true` when the link is established
        connected: bool,
    },
    /// Service discovery finished
    ServicesDiscovered {
        /// Connection generation
        generation: Generation,
        /// Services in discovery order, or the failure reason
        services: std::result::Result<Vec<ServiceRecord>, String>,
    },
    /// A queued read finished
    CharacteristicRead {
        /// Connection generation
        generation: Generation,
        /// Characteristic that was read
        target: CharacteristicRef,
        /// Value, or the failure reason
        value: std::result::Result<Bytes, String>,
    },
    /// The peripheral pushed a new value
    CharacteristicChanged {
        /// Connection generation
        generation: Generation,
        /// Characteristic that changed
        target: CharacteristicRef,
        /// New value
        value: Bytes,
    },
}

impl<H> AdapterEvent<H> {
    /// Generation the event is tagged with
    #[must_use]
    pub const fn generation(&self) -> Generation {
        match self {
            Self::ScanResult { generation, .. }
            | Self::ScanFailed { generation, .. }
            | Self::ConnectionStateChanged { generation, .. }
            | Self::ServicesDiscovered { generation, .. }
            | Self::CharacteristicRead { generation, .. }
            | Self::CharacteristicChanged { generation, .. } => *generation,
        }
    }
}

/// Outbound message from the engine to the presentation layer
#[derive(Debug)]
pub enum Notification {
    /// A new device was added to the registry
    DeviceDiscovered {
        /// Display name
        name: String,
        /// Peripheral address
        address: BDAddr,
    },
    /// Scanning started
    ScanStarted,
    /// Scanning stopped
    ScanStopped,
    /// Link to the peripheral is up
    Connected {
        /// Peripheral address
        address: BDAddr,
    },
    /// Connection torn down
    Disconnected {
        /// Peripheral address
        address: BDAddr,
    },
    /// A queued read stored a value
    CharacteristicRead {
        /// Characteristic that was read
        target: CharacteristicRef,
        /// Stored value
        value: Bytes,
    },
    /// A server push replaced a stored value
    CharacteristicRefreshed {
        /// Characteristic that changed
        target: CharacteristicRef,
        /// Stored value
        value: Bytes,
    },
    /// Every queued read has been attempted
    Ready {
        /// Peripheral address
        address: BDAddr,
    },
    /// A non-fatal failure to surface to the user
    Error(PointoError),
}

/// Outbound notification channel
///
/// Crossing into the presentation layer is always a message send. A notifier
/// whose receiver was dropped silently discards messages.
#[derive(Debug, Clone, Default)]
pub struct Notifier {
    sender: Option<mpsc::UnboundedSender<Notification>>,
}

impl Notifier {
    /// Wrap an existing sender
    #[must_use]
    pub const fn new(sender: mpsc::UnboundedSender<Notification>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    /// Create a notifier together with its receiving end
    #[must_use]
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// A notifier that drops everything
    #[must_use]
    pub const fn detached() -> Self {
        Self { sender: None }
    }

    /// Deliver a notification
    pub fn send(&self, notification: Notification) {
        if let Some(sender) = &self.sender {
            if let Err(e) = sender.send(notification) {
                debug!("Presentation receiver gone, dropping {:?}", e.0);
            }
        }
    }
}
