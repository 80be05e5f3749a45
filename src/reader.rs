use bytes::Bytes;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

use crate::{
    error::PointoError,
    event::{Notification, Notifier},
    transport::Transport,
    types::{CharacteristicRef, Generation, ReadStatus, ServiceRecord},
};

/// Where the read queue stands after advancing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadProgress {
    /// A read for this characteristic is now outstanding
    Issued(CharacteristicRef),
    /// Every queued characteristic has been attempted
    Completed,
}

/// Sequential read driver over a peripheral's discovered characteristics
///
/// Reads are issued one at a time in service order, then characteristic order
/// within each service. A failed read is recorded and the queue moves on.
#[derive(Debug, Default)]
pub struct CharacteristicReader {
    queue: VecDeque<CharacteristicRef>,
    in_flight: Option<CharacteristicRef>,
}

impl CharacteristicReader {
    /// Build the flat read queue from discovered services
    #[must_use]
    pub fn new(services: &[ServiceRecord]) -> Self {
        let queue = services
            .iter()
            .enumerate()
            .flat_map(|(service_index, s)| {
                s.characteristics.iter().enumerate().map(move |(index, c)| {
                    CharacteristicRef::new(service_index, s.uuid, index, c.uuid)
                })
            })
            .collect();

        Self {
            queue,
            in_flight: None,
        }
    }

    /// The read currently outstanding
    #[must_use]
    pub const fn in_flight(&self) -> Option<CharacteristicRef> {
        self.in_flight
    }

    /// Number of characteristics not yet requested
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.queue.len()
    }

    /// Issue the next read unless one is already outstanding
    ///
    /// Requests the transport refuses outright are recorded as failed and
    /// skipped.
    pub fn advance<T: Transport>(
        &mut self,
        transport: &mut T,
        link: &T::Link,
        generation: Generation,
        services: &mut [ServiceRecord],
        notifier: &Notifier,
    ) -> ReadProgress {
        if let Some(target) = self.in_flight {
            return ReadProgress::Issued(target);
        }

        while let Some(target) = self.queue.pop_front() {
            match transport.read_characteristic(link, target, generation) {
                Ok(()) => {
                    debug!("Reading characteristic {}", target);
                    self.in_flight = Some(target);
                    return ReadProgress::Issued(target);
                }
                Err(PointoError::CharacteristicReadFailure { reason, .. }) => {
                    Self::record_failure(target, reason, services, notifier);
                }
                Err(e) => Self::record_failure(target, e.to_string(), services, notifier),
            }
        }

        ReadProgress::Completed
    }

    /// Apply the completion of the outstanding read
    ///
    /// Returns `false` if `target` is not the outstanding read, in which case
    /// nothing changes.
    pub fn on_read(
        &mut self,
        target: CharacteristicRef,
        result: std::result::Result<Bytes, String>,
        services: &mut [ServiceRecord],
        notifier: &Notifier,
    ) -> bool {
        if self.in_flight != Some(target) {
            warn!("Ignoring read completion for {} which is not outstanding", target);
            return false;
        }
        self.in_flight = None;

        match result {
            Ok(value) => {
                if let Some(record) = target.locate_mut(services) {
                    record.value = Some(value.clone());
                    record.status = ReadStatus::Read;
                }
                info!("Read {} byte(s) from {}", value.len(), target);
                notifier.send(Notification::CharacteristicRead { target, value });
            }
            Err(reason) => Self::record_failure(target, reason, services, notifier),
        }
        true
    }

    /// Record the outstanding read as failed without a completion
    ///
    /// Used when the per-read deadline expires. Returns the abandoned target.
    pub fn abandon_in_flight(
        &mut self,
        reason: String,
        services: &mut [ServiceRecord],
        notifier: &Notifier,
    ) -> Option<CharacteristicRef> {
        let target = self.in_flight.take()?;
        Self::record_failure(target, reason, services, notifier);
        Some(target)
    }

    /// Apply a server-initiated value push, independent of queue progress
    pub fn on_changed(
        target: CharacteristicRef,
        value: Bytes,
        services: &mut [ServiceRecord],
        notifier: &Notifier,
    ) {
        let Some(record) = target.locate_mut(services) else {
            debug!("Push for unknown characteristic {}", target);
            return;
        };

        record.value = Some(value.clone());
        debug!("Characteristic {} refreshed", target);
        notifier.send(Notification::CharacteristicRefreshed { target, value });
    }

    fn record_failure(
        target: CharacteristicRef,
        reason: String,
        services: &mut [ServiceRecord],
        notifier: &Notifier,
    ) {
        if let Some(record) = target.locate_mut(services) {
            record.status = ReadStatus::Failed;
        }
        warn!("Failed to read characteristic {}: {}", target, reason);
        notifier.send(Notification::Error(PointoError::CharacteristicReadFailure {
            characteristic: target,
            reason,
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{Call, MockLink, MockTransport};
    use btleplug::api::BDAddr;
    use uuid::Uuid;

    const S1: Uuid = Uuid::from_u128(0x1000);
    const S2: Uuid = Uuid::from_u128(0x2000);
    const C1: Uuid = Uuid::from_u128(0x1001);
    const C2: Uuid = Uuid::from_u128(0x1002);
    const C3: Uuid = Uuid::from_u128(0x2001);

    fn services() -> Vec<ServiceRecord> {
        vec![ServiceRecord::new(S1, [C1, C2]), ServiceRecord::new(S2, [C3])]
    }

    fn first() -> CharacteristicRef {
        CharacteristicRef::new(0, S1, 0, C1)
    }

    fn second() -> CharacteristicRef {
        CharacteristicRef::new(0, S1, 1, C2)
    }

    fn third() -> CharacteristicRef {
        CharacteristicRef::new(1, S2, 0, C3)
    }

    fn link(transport: &mut MockTransport) -> MockLink {
        transport
            .connect(&BDAddr::default(), Generation::default())
            .unwrap()
    }

    fn reads(transport: &MockTransport) -> Vec<CharacteristicRef> {
        transport
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Read(target, _) => Some(target),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_queue_follows_discovery_order() {
        let reader = CharacteristicReader::new(&services());
        assert_eq!(reader.remaining(), 3);
        assert_eq!(
            reader.queue.iter().copied().collect::<Vec<_>>(),
            vec![first(), second(), third()]
        );
    }

    #[test]
    fn test_one_read_outstanding_and_continue_on_error() {
        let mut transport = MockTransport::new();
        let link = link(&mut transport);
        let mut services = services();
        let notifier = Notifier::detached();
        let generation = Generation::default();
        let mut reader = CharacteristicReader::new(&services);

        let first_progress = reader.advance(&mut transport, &link, generation, &mut services, &notifier);
        assert_eq!(first_progress, ReadProgress::Issued(first()));
        // advancing again must not issue a second request
        reader.advance(&mut transport, &link, generation, &mut services, &notifier);
        assert_eq!(reads(&transport).len(), 1);

        assert!(reader.on_read(
            first(),
            Ok(Bytes::from_static(&[0x01])),
            &mut services,
            &notifier
        ));
        reader.advance(&mut transport, &link, generation, &mut services, &notifier);
        assert!(reader.on_read(
            second(),
            Err("read not permitted".into()),
            &mut services,
            &notifier
        ));
        let third_progress = reader.advance(&mut transport, &link, generation, &mut services, &notifier);
        assert_eq!(third_progress, ReadProgress::Issued(third()));
        reader.on_read(
            third(),
            Ok(Bytes::from_static(&[0x03, 0x04])),
            &mut services,
            &notifier,
        );
        let done = reader.advance(&mut transport, &link, generation, &mut services, &notifier);

        assert_eq!(done, ReadProgress::Completed);
        assert_eq!(
            reads(&transport),
            vec![first(), second(), third()]
        );
        assert_eq!(services[0].characteristics[0].status, ReadStatus::Read);
        assert_eq!(services[0].characteristics[1].status, ReadStatus::Failed);
        assert_eq!(services[0].characteristics[1].value, None);
        assert_eq!(
            services[1].characteristics[0].value.as_deref(),
            Some(&[0x03, 0x04][..])
        );
    }

    #[test]
    fn test_refused_request_is_skipped() {
        let mut transport = MockTransport::new();
        transport.refuse_read(C1);
        let link = link(&mut transport);
        let mut services = services();
        let (notifier, mut rx) = Notifier::channel();
        let mut reader = CharacteristicReader::new(&services);

        let progress = reader.advance(
            &mut transport,
            &link,
            Generation::default(),
            &mut services,
            &notifier,
        );

        assert_eq!(progress, ReadProgress::Issued(second()));
        assert_eq!(services[0].characteristics[0].status, ReadStatus::Failed);
        let Ok(Notification::Error(error)) = rx.try_recv() else {
            panic!("expected a read failure notification");
        };
        assert!(matches!(
            &error,
            PointoError::CharacteristicReadFailure { characteristic, reason }
                if *characteristic == first() && reason == "not readable"
        ));
        assert_eq!(error.to_string().matches("Failed to read").count(), 1);
    }

    #[test]
    fn test_repeated_uuids_are_read_separately() {
        let mut transport = MockTransport::new();
        let link = link(&mut transport);
        let mut services = vec![ServiceRecord::new(S1, [C1, C1])];
        let notifier = Notifier::detached();
        let generation = Generation::default();
        let mut reader = CharacteristicReader::new(&services);
        let twin = CharacteristicRef::new(0, S1, 1, C1);

        reader.advance(&mut transport, &link, generation, &mut services, &notifier);
        assert!(reader.on_read(first(), Ok(Bytes::from_static(b"a")), &mut services, &notifier));
        assert_eq!(
            reader.advance(&mut transport, &link, generation, &mut services, &notifier),
            ReadProgress::Issued(twin)
        );
        assert!(reader.on_read(twin, Ok(Bytes::from_static(b"b")), &mut services, &notifier));
        let done = reader.advance(&mut transport, &link, generation, &mut services, &notifier);

        assert_eq!(done, ReadProgress::Completed);
        let records = &services[0].characteristics;
        assert_eq!(records[0].status, ReadStatus::Read);
        assert_eq!(records[0].value, Some(Bytes::from_static(b"a")));
        assert_eq!(records[1].status, ReadStatus::Read);
        assert_eq!(records[1].value, Some(Bytes::from_static(b"b")));
    }

    #[test]
    fn test_unexpected_completion_is_ignored() {
        let mut transport = MockTransport::new();
        let link = link(&mut transport);
        let mut services = services();
        let notifier = Notifier::detached();
        let mut reader = CharacteristicReader::new(&services);
        reader.advance(
            &mut transport,
            &link,
            Generation::default(),
            &mut services,
            &notifier,
        );

        let accepted = reader.on_read(
            third(),
            Ok(Bytes::from_static(b"x")),
            &mut services,
            &notifier,
        );

        assert!(!accepted);
        assert_eq!(services[1].characteristics[0].status, ReadStatus::Pending);
        assert_eq!(reader.in_flight(), Some(first()));
    }

    #[test]
    fn test_push_updates_only_target() {
        let mut services = services();
        let (notifier, mut rx) = Notifier::channel();

        CharacteristicReader::on_changed(
            second(),
            Bytes::from_static(&[0xFF]),
            &mut services,
            &notifier,
        );

        assert_eq!(
            services[0].characteristics[1].value,
            Some(Bytes::from_static(&[0xFF]))
        );
        assert_eq!(services[0].characteristics[0].value, None);
        assert!(matches!(
            rx.try_recv(),
            Ok(Notification::CharacteristicRefreshed { .. })
        ));
    }

    #[test]
    fn test_abandon_marks_failure() {
        let mut transport = MockTransport::new();
        let link = link(&mut transport);
        let mut services = services();
        let notifier = Notifier::detached();
        let mut reader = CharacteristicReader::new(&services);
        reader.advance(
            &mut transport,
            &link,
            Generation::default(),
            &mut services,
            &notifier,
        );

        let abandoned = reader.abandon_in_flight("timed out".into(), &mut services, &notifier);

        assert_eq!(abandoned, Some(first()));
        assert_eq!(reader.in_flight(), None);
        assert_eq!(services[0].characteristics[0].status, ReadStatus::Failed);
    }
}
