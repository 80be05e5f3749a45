use thiserror::Error;

use crate::types::{CharacteristicRef, Permission};

/// Errors produced by the discovery and connection engine
#[derive(Error, Debug)]
pub enum PointoError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// No Bluetooth adapter is present
    #[error("No Bluetooth adapter available")]
    AdapterUnavailable,

    /// The adapter is present but its radio is switched off
    #[error("Bluetooth is turned off")]
    AdapterDisabled,

    /// The adapter refused or aborted a scan
    #[error("Scan failed with error: {0}")]
    ScanStartFailure(i32),

    /// A scan session is already running
    #[error("Scan already in progress")]
    AlreadyScanning,

    /// The link to the peripheral could not be established
    #[error("Failed to connect to device: {0}")]
    ConnectFailure(String),

    /// A connection already exists
    #[error("Already connected - disconnect first")]
    AlreadyConnected,

    /// Service discovery did not complete
    #[error("Service discovery failed: {0}")]
    ServiceDiscoveryFailure(String),

    /// A single characteristic read failed
    #[error("Failed to read characteristic {characteristic}: {reason}")]
    CharacteristicReadFailure {
        /// Characteristic that could not be read
        characteristic: CharacteristicRef,
        /// Adapter supplied reason
        reason: String,
    },

    /// A required access grant is missing
    #[error("Permission denied: {0} access is not granted")]
    PermissionDenied(Permission),

    /// The operation needs a connection and none exists
    #[error("No active connection")]
    NoActiveConnection,

    /// No registered device matches the selector
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// An asynchronous phase exceeded its deadline
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        /// Phase that expired
        operation: String,
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The engine task is no longer running
    #[error("Engine stopped")]
    EngineStopped,
}

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, PointoError>;

impl PointoError {
    /// Check if this error indicates a connection issue
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::ConnectFailure(_)
                | Self::ServiceDiscoveryFailure(_)
                | Self::NoActiveConnection
                | Self::DeviceNotFound(_)
        )
    }

    /// Check if retrying the same operation later can succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. }
                | Self::AdapterDisabled
                | Self::ScanStartFailure(_)
                | Self::ConnectFailure(_)
                | Self::CharacteristicReadFailure { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_error_classification() {
        let connection_error = PointoError::ConnectFailure("refused".to_string());
        assert!(connection_error.is_connection_error());
        assert!(connection_error.is_recoverable());

        let timeout_error = PointoError::Timeout {
            operation: "connect".to_string(),
            timeout_ms: 5000,
        };
        assert!(!timeout_error.is_connection_error());
        assert!(timeout_error.is_recoverable());

        assert!(PointoError::AdapterDisabled.is_recoverable());

        let denied = PointoError::PermissionDenied(Permission::Scan);
        assert!(!denied.is_connection_error());
        assert!(!denied.is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let error = PointoError::ScanStartFailure(2);
        assert_eq!(format!("{error}"), "Scan failed with error: 2");

        let target = CharacteristicRef::new(0, Uuid::from_u128(1), 0, Uuid::from_u128(2));
        let error = PointoError::CharacteristicReadFailure {
            characteristic: target,
            reason: "read not permitted".to_string(),
        };
        let error_string = format!("{error}");
        assert!(error_string.contains("Failed to read characteristic"));
        assert!(error_string.contains("read not permitted"));
    }
}
