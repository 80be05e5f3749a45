use tracing::{debug, info, warn};

use crate::{
    error::{PointoError, Result},
    event::{Discovery, Notification, Notifier},
    registry::DeviceRegistry,
    transport::{ensure_enabled, ensure_granted, PermissionProvider, Transport},
    types::{Generation, Permission, ScanState},
};

/// Owns the scan lifecycle and feeds advertisements into the registry
#[derive(Debug, Default)]
pub struct ScanController {
    state: ScanState,
    generation: Generation,
}

impl ScanController {
    /// Create an idle controller
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ScanState {
        self.state
    }

    /// Generation of the current (or last) scan session
    #[must_use]
    pub const fn generation(&self) -> Generation {
        self.generation
    }

    /// Start a new scan session
    ///
    /// # Errors
    ///
    /// Returns [`PointoError::AlreadyScanning`] if a session is running,
    /// [`PointoError::PermissionDenied`] without scan access,
    /// [`PointoError::AdapterDisabled`] while the radio is off, or the
    /// transport's error if the adapter refuses to start.
    pub fn start<T: Transport>(
        &mut self,
        transport: &mut T,
        permissions: &dyn PermissionProvider,
        notifier: &Notifier,
    ) -> Result<Generation> {
        if self.state == ScanState::Scanning {
            return Err(PointoError::AlreadyScanning);
        }
        ensure_granted(permissions, Permission::Scan)?;
        ensure_enabled(transport)?;

        self.generation = self.generation.next();
        transport.start_scan(self.generation)?;
        self.state = ScanState::Scanning;

        info!("Scan started ({})", self.generation);
        notifier.send(Notification::ScanStarted);
        Ok(self.generation)
    }

    /// Stop the running session; a no-op when idle
    ///
    /// The controller is idle afterwards even if the adapter reports an error,
    /// and late events from the stopped session are discarded.
    ///
    /// # Errors
    ///
    /// Returns the transport's error if the adapter fails to stop.
    pub fn stop<T: Transport>(&mut self, transport: &mut T, notifier: &Notifier) -> Result<()> {
        if self.state == ScanState::Idle {
            return Ok(());
        }

        self.state = ScanState::Idle;
        info!("Scan stopped ({})", self.generation);
        notifier.send(Notification::ScanStopped);
        transport.stop_scan().inspect_err(|e| {
            warn!("Adapter failed to stop scanning: {}", e);
        })
    }

    /// Handle one advertisement or a batch of them
    ///
    /// Returns the number of devices newly added to the registry.
    pub fn on_discoveries<H>(
        &self,
        generation: Generation,
        discoveries: Vec<Discovery<H>>,
        registry: &mut DeviceRegistry<H>,
        notifier: &Notifier,
    ) -> usize {
        if !self.accepts(generation) {
            debug!("Discarding {} stale scan result(s) from {}", discoveries.len(), generation);
            return 0;
        }

        let mut added = 0;
        for discovery in discoveries {
            let name = discovery.name.clone();
            if registry.register(discovery.address, discovery.name, discovery.kind, discovery.handle)
            {
                added += 1;
                if let Some(name) = name {
                    info!("Found device: {} ({})", name, discovery.address);
                    notifier.send(Notification::DeviceDiscovered {
                        name,
                        address: discovery.address,
                    });
                }
            }
        }
        added
    }

    /// Surface an adapter scan failure; the session keeps running
    pub fn on_failure(&self, generation: Generation, code: i32, notifier: &Notifier) {
        if !self.accepts(generation) {
            debug!("Discarding stale scan failure {} from {}", code, generation);
            return;
        }

        warn!("Scan failed with error: {}", code);
        notifier.send(Notification::Error(PointoError::ScanStartFailure(code)));
    }

    fn accepts(&self, generation: Generation) -> bool {
        self.state == ScanState::Scanning && generation == self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{Call, MockTransport},
        transport::AllowAll,
        types::DeviceKind,
    };
    use btleplug::api::BDAddr;

    fn discovery(last: u8, name: Option<&str>) -> Discovery<BDAddr> {
        let address = BDAddr::from([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, last]);
        Discovery {
            address,
            name: name.map(str::to_string),
            kind: DeviceKind::LowEnergy,
            handle: address,
        }
    }

    #[test]
    fn test_start_and_stop() {
        let mut transport = MockTransport::new();
        let mut scan = ScanController::new();
        let notifier = Notifier::detached();

        let generation = scan.start(&mut transport, &AllowAll, &notifier).unwrap();
        assert_eq!(scan.state(), ScanState::Scanning);
        assert_eq!(generation, Generation::new(1));

        scan.stop(&mut transport, &notifier).unwrap();
        assert_eq!(scan.state(), ScanState::Idle);
        assert_eq!(
            transport.calls(),
            vec![Call::StartScan(Generation::new(1)), Call::StopScan]
        );
    }

    #[test]
    fn test_second_start_is_rejected() {
        let mut transport = MockTransport::new();
        let mut scan = ScanController::new();
        let notifier = Notifier::detached();

        scan.start(&mut transport, &AllowAll, &notifier).unwrap();
        let second = scan.start(&mut transport, &AllowAll, &notifier);

        assert!(matches!(second, Err(PointoError::AlreadyScanning)));
        assert_eq!(scan.generation(), Generation::new(1));
        assert_eq!(transport.calls().len(), 1);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut transport = MockTransport::new();
        let mut scan = ScanController::new();
        let notifier = Notifier::detached();

        assert!(scan.stop(&mut transport, &notifier).is_ok());
        assert!(transport.calls().is_empty());
    }

    #[test]
    fn test_permission_denied_fails_fast() {
        let mut transport = MockTransport::new();
        let mut scan = ScanController::new();
        let deny = |_: crate::types::Permission| false;

        let result = scan.start(&mut transport, &deny, &Notifier::detached());
        assert!(matches!(result, Err(PointoError::PermissionDenied(Permission::Scan))));
        assert!(transport.calls().is_empty());
        assert_eq!(scan.state(), ScanState::Idle);
    }

    #[test]
    fn test_disabled_radio_fails_fast() {
        let mut transport = MockTransport::new();
        transport.set_enabled(false);
        let mut scan = ScanController::new();

        let result = scan.start(&mut transport, &AllowAll, &Notifier::detached());
        assert!(matches!(result, Err(PointoError::AdapterDisabled)));
        assert!(transport.calls().is_empty());
        assert_eq!(scan.generation(), Generation::default());

        transport.set_enabled(true);
        assert!(scan.start(&mut transport, &AllowAll, &Notifier::detached()).is_ok());
    }

    #[test]
    fn test_adapter_refusal_keeps_idle() {
        let mut transport = MockTransport::new();
        transport.refuse_scan(2);
        let mut scan = ScanController::new();

        let result = scan.start(&mut transport, &AllowAll, &Notifier::detached());
        assert!(matches!(result, Err(PointoError::ScanStartFailure(2))));
        assert_eq!(scan.state(), ScanState::Idle);
    }

    #[test]
    fn test_batched_results_are_deduplicated() {
        let mut transport = MockTransport::new();
        let mut scan = ScanController::new();
        let mut registry = DeviceRegistry::new();
        let (notifier, mut rx) = Notifier::channel();
        let generation = scan.start(&mut transport, &AllowAll, &notifier).unwrap();
        let _ = rx.try_recv();

        let batch = vec![
            discovery(1, Some("SensorX")),
            discovery(2, None),
            discovery(1, Some("SensorX")),
            discovery(3, Some("Band")),
        ];
        let added = scan.on_discoveries(generation, batch, &mut registry, &notifier);

        assert_eq!(added, 2);
        assert_eq!(registry.len(), 2);
        assert!(matches!(
            rx.try_recv(),
            Ok(Notification::DeviceDiscovered { ref name, .. }) if name == "SensorX"
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(Notification::DeviceDiscovered { ref name, .. }) if name == "Band"
        ));
    }

    #[test]
    fn test_late_results_after_stop_are_discarded() {
        let mut transport = MockTransport::new();
        let mut scan = ScanController::new();
        let mut registry = DeviceRegistry::new();
        let notifier = Notifier::detached();

        let old = scan.start(&mut transport, &AllowAll, &notifier).unwrap();
        scan.stop(&mut transport, &notifier).unwrap();
        assert_eq!(
            scan.on_discoveries(old, vec![discovery(1, Some("A"))], &mut registry, &notifier),
            0
        );

        let current = scan.start(&mut transport, &AllowAll, &notifier).unwrap();
        assert_eq!(
            scan.on_discoveries(old, vec![discovery(1, Some("A"))], &mut registry, &notifier),
            0
        );
        assert_eq!(
            scan.on_discoveries(current, vec![discovery(1, Some("A"))], &mut registry, &notifier),
            1
        );
    }

    #[test]
    fn test_failure_is_reported_without_stopping() {
        let mut transport = MockTransport::new();
        let mut scan = ScanController::new();
        let (notifier, mut rx) = Notifier::channel();
        let generation = scan.start(&mut transport, &AllowAll, &notifier).unwrap();
        let _ = rx.try_recv();

        scan.on_failure(generation, 3, &notifier);

        assert_eq!(scan.state(), ScanState::Scanning);
        assert!(matches!(
            rx.try_recv(),
            Ok(Notification::Error(PointoError::ScanStartFailure(3)))
        ));
    }
}
