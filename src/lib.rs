#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(rust_2018_idioms)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

//! # Pointo
//!
//! Asynchronous Bluetooth Low Energy discovery and peripheral inspection.
//!
//! Pointo scans for nearby peripherals, keeps a de-duplicated registry of the
//! named ones, connects to one selected by name and reads every characteristic
//! of every discovered service, one request at a time. The result is a
//! [`DisplaySnapshot`] of the device and its characteristic values.
//!
//! All state lives in a single [`Engine`]. Adapter completions arrive as
//! [`AdapterEvent`]s tagged with a [`Generation`]; completions that belong to
//! a scan session or connection which has since been replaced are discarded.
//!
//! ## Quick Start
//!
//! ```no_run
//! use pointo::{AllowAll, BtleplugTransport, Engine, Notifier, TimeoutConfig};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let (events_tx, events_rx) = mpsc::unbounded_channel();
//!     let transport = BtleplugTransport::new(events_tx).await?;
//!     let (notifier, _notifications) = Notifier::channel();
//!
//!     let engine = Engine::new(transport, AllowAll, notifier, TimeoutConfig::default())
//!         .spawn(events_rx);
//!
//!     engine.start_scan().await?;
//!     tokio::time::sleep(std::time::Duration::from_secs(5)).await;
//!     engine.connect_by_name("SensorX").await?;
//!
//!     tokio::time::sleep(std::time::Duration::from_secs(10)).await;
//!     if let Some(snapshot) = engine.snapshot().await? {
//!         println!("{snapshot}");
//!     }
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

/// Bluetooth adapter access through btleplug
pub mod ble;
/// Connection lifecycle and characteristic reads
pub mod connection;
/// Single-writer engine and its async handle
pub mod engine;
/// Error types and handling
pub mod error;
/// Adapter completions and host notifications
pub mod event;
/// Display snapshot of a connected device
pub mod presenter;
/// Sequential characteristic read queue
pub mod reader;
/// Discovered device registry
pub mod registry;
/// Scan session lifecycle
pub mod scan;
/// Adapter and permission contracts
pub mod transport;
/// Type definitions and data structures
pub mod types;

/// Recording transport for tests
#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use ble::{BtleLink, BtleplugTransport};
pub use connection::ConnectionManager;
pub use engine::{Engine, EngineHandle};
pub use error::{PointoError, Result};
pub use event::{AdapterEvent, Discovery, EventReceiver, EventSender, Notification, Notifier};
pub use presenter::{format_value, present, CharacteristicView, DisplaySnapshot};
pub use reader::{CharacteristicReader, ReadProgress};
pub use registry::DeviceRegistry;
pub use scan::ScanController;
pub use transport::{AllowAll, PermissionProvider, Transport};
pub use types::{
    CharacteristicRecord, CharacteristicRef, ConnectionState, DeviceKind, DeviceRecord,
    Generation, Permission, ReadStatus, ScanState, ServiceRecord, TimeoutConfig,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
