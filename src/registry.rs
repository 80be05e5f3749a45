use btleplug::api::BDAddr;
use std::collections::HashMap;
use tracing::debug;

use crate::types::{DeviceKind, DeviceRecord};

/// Discovered peripherals, one per address, in first-seen order
#[derive(Debug)]
pub struct DeviceRegistry<H> {
    records: Vec<DeviceRecord<H>>,
    by_address: HashMap<BDAddr, usize>,
}

impl<H> Default for DeviceRegistry<H> {
    fn default() -> Self {
        Self {
            records: Vec::new(),
            by_address: HashMap::new(),
        }
    }
}

impl<H> DeviceRegistry<H> {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a peripheral if its address is unseen
    ///
    /// Devices without an advertised name are never registered. Returns
    /// whether a new record was added.
    pub fn register(
        &mut self,
        address: BDAddr,
        name: Option<String>,
        kind: DeviceKind,
        handle: H,
    ) -> bool {
        let Some(name) = name else {
            return false;
        };
        if self.by_address.contains_key(&address) {
            return false;
        }

        debug!("Registered device {} ({})", name, address);
        self.by_address.insert(address, self.records.len());
        self.records.push(DeviceRecord::new(address, name, kind, handle));
        true
    }

    /// `(name, address)` pairs in first-seen order
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, BDAddr)> {
        self.records
            .iter()
            .map(|r| (r.name().to_string(), r.address()))
            .collect()
    }

    /// Handle of the first-registered device named `name`
    ///
    /// Names are not unique, so this is a best-effort lookup; use
    /// [`DeviceRegistry::get`] for exact selection.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<&H> {
        self.resolve_record(name).map(DeviceRecord::handle)
    }

    /// First-registered record named `name`
    #[must_use]
    pub fn resolve_record(&self, name: &str) -> Option<&DeviceRecord<H>> {
        self.records.iter().find(|r| r.name() == name)
    }

    /// Record registered under `address`
    #[must_use]
    pub fn get(&self, address: BDAddr) -> Option<&DeviceRecord<H>> {
        self.by_address.get(&address).map(|&i| &self.records[i])
    }

    /// Number of registered devices
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether no device is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Forget every device
    pub fn clear(&mut self) {
        self.records.clear();
        self.by_address.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> BDAddr {
        BDAddr::from([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last])
    }

    #[test]
    fn test_duplicate_address_is_rejected() {
        let mut registry = DeviceRegistry::new();

        assert!(registry.register(addr(1), Some("SensorX".into()), DeviceKind::LowEnergy, 1));
        assert!(!registry.register(addr(1), Some("Renamed".into()), DeviceKind::LowEnergy, 2));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(addr(1)).map(DeviceRecord::name), Some("SensorX"));
    }

    #[test]
    fn test_nameless_device_is_skipped() {
        let mut registry = DeviceRegistry::new();

        assert!(!registry.register(addr(1), None, DeviceKind::Unknown, ()));
        assert!(registry.is_empty());
        assert!(registry.register(addr(1), Some("Late".into()), DeviceKind::Unknown, ()));
    }

    #[test]
    fn test_snapshot_preserves_first_seen_order() {
        let mut registry = DeviceRegistry::new();
        let names = ["Zeta", "Alpha", "Mid", "Beta", "Omega"];

        for (i, name) in names.iter().enumerate() {
            let last = u8::try_from(i).unwrap();
            registry.register(addr(last), Some((*name).to_string()), DeviceKind::LowEnergy, ());
            registry.register(addr(0), Some("dup".into()), DeviceKind::LowEnergy, ());
        }

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), names.len());
        assert_eq!(snapshot[0], ("Zeta".to_string(), addr(0)));
        let ordered: Vec<&str> = snapshot.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(ordered, names);
    }

    #[test]
    fn test_resolve_first_match_wins() {
        let mut registry = DeviceRegistry::new();
        registry.register(addr(1), Some("Sensor".into()), DeviceKind::LowEnergy, "first");
        registry.register(addr(2), Some("Sensor".into()), DeviceKind::LowEnergy, "second");

        assert_eq!(registry.resolve("Sensor"), Some(&"first"));
        assert_eq!(registry.resolve("Missing"), None);
        assert_eq!(registry.get(addr(2)).map(|r| *r.handle()), Some("second"));
    }

    #[test]
    fn test_clear_resets_registry() {
        let mut registry = DeviceRegistry::new();
        registry.register(addr(1), Some("A".into()), DeviceKind::LowEnergy, ());
        registry.clear();

        assert!(registry.is_empty());
        assert!(registry.get(addr(1)).is_none());
        assert!(registry.register(addr(1), Some("A".into()), DeviceKind::LowEnergy, ()));
    }
}
