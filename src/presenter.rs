use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use uuid::Uuid;

use crate::types::{DeviceKind, DeviceRecord, ReadStatus, ServiceRecord};

/// Read-only view of one characteristic
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacteristicView {
    /// Characteristic UUID
    pub uuid: Uuid,
    /// Last known value
    pub value: Option<Bytes>,
    /// Status of the queued read
    pub status: ReadStatus,
}

/// Display snapshot of the connected device and everything read from it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplaySnapshot {
    /// Advertised name
    pub device_name: String,
    /// Peripheral address
    pub address: String,
    /// Radio technology
    pub device_type: DeviceKind,
    /// Service UUIDs in discovery order
    pub service_uuids: Vec<Uuid>,
    /// Characteristics in read-queue order
    pub characteristics: Vec<CharacteristicView>,
}

/// Build a snapshot from a device record and its discovered services
#[must_use]
pub fn present<H>(device: &DeviceRecord<H>, services: &[ServiceRecord]) -> DisplaySnapshot {
    DisplaySnapshot {
        device_name: device.name().to_string(),
        address: device.address().to_string(),
        device_type: device.kind(),
        service_uuids: services.iter().map(|s| s.uuid).collect(),
        characteristics: services
            .iter()
            .flat_map(|s| &s.characteristics)
            .map(|c| CharacteristicView {
                uuid: c.uuid,
                value: c.value.clone(),
                status: c.status,
            })
            .collect(),
    }
}

/// Format bytes as upper-case hex pairs separated by `", "`
#[must_use]
pub fn format_value(value: Option<&[u8]>) -> String {
    value.map_or_else(
        || "No data".to_string(),
        |data| {
            data.iter()
                .map(|b| format!("{b:02X}"))
                .collect::<Vec<_>>()
                .join(", ")
        },
    )
}

impl fmt::Display for DisplaySnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Connected Device Name: {}", self.device_name)?;
        writeln!(f, "Address: {}", self.address)?;
        writeln!(f, "Type: {}", self.device_type)?;
        if self.service_uuids.is_empty() {
            writeln!(f, "UUIDs: No UUIDs available")?;
        } else {
            let uuids: Vec<String> = self.service_uuids.iter().map(Uuid::to_string).collect();
            writeln!(f, "UUIDs: {}", uuids.join(", "))?;
        }
        write!(f, "Characteristic Data:")?;
        for c in &self.characteristics {
            write!(
                f,
                "\n  {} [{}]: {}",
                c.uuid,
                c.status,
                format_value(c.value.as_deref())
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btleplug::api::BDAddr;

    fn device() -> DeviceRecord<()> {
        DeviceRecord::new(
            BDAddr::from([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]),
            "SensorX".to_string(),
            DeviceKind::LowEnergy,
            (),
        )
    }

    #[test]
    fn test_snapshot_aggregates_every_characteristic() {
        let mut services = vec![
            ServiceRecord::new(Uuid::from_u128(1), [Uuid::from_u128(11), Uuid::from_u128(12)]),
            ServiceRecord::new(Uuid::from_u128(2), [Uuid::from_u128(21)]),
        ];
        services[0].characteristics[0].value = Some(Bytes::from_static(&[0x01, 0xAB]));
        services[0].characteristics[0].status = ReadStatus::Read;
        services[0].characteristics[1].status = ReadStatus::Failed;

        let snapshot = present(&device(), &services);

        assert_eq!(snapshot.device_name, "SensorX");
        assert_eq!(snapshot.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(snapshot.device_type, DeviceKind::LowEnergy);
        assert_eq!(snapshot.service_uuids, vec![Uuid::from_u128(1), Uuid::from_u128(2)]);
        assert_eq!(snapshot.characteristics.len(), 3);
        assert_eq!(snapshot.characteristics[1].status, ReadStatus::Failed);
        assert_eq!(snapshot.characteristics[2].status, ReadStatus::Pending);
    }

    #[test]
    fn test_format_value() {
        assert_eq!(format_value(Some(&[0x0A, 0xFF, 0x00][..])), "0A, FF, 00");
        assert_eq!(format_value(Some(&[][..])), "");
        assert_eq!(format_value(None), "No data");
    }

    #[test]
    fn test_display_rendering() {
        let mut services = vec![ServiceRecord::new(Uuid::from_u128(1), [Uuid::from_u128(11)])];
        services[0].characteristics[0].value = Some(Bytes::from_static(&[0x64]));
        services[0].characteristics[0].status = ReadStatus::Read;

        let text = present(&device(), &services).to_string();

        assert!(text.starts_with("Connected Device Name: SensorX\nAddress: AA:BB:CC:DD:EE:FF"));
        assert!(text.contains("Type: Low Energy"));
        assert!(text.contains("[Read]: 64"));

        let empty = present(&device(), &[]).to_string();
        assert!(empty.contains("UUIDs: No UUIDs available"));
    }
}
