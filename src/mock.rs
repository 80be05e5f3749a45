//! In-memory [`Transport`] that records requests instead of talking to a radio.
//!
//! Completions are not generated automatically; tests feed them back through
//! [`crate::Engine::dispatch`] or the individual component handlers.

use btleplug::api::BDAddr;
use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use uuid::Uuid;

use crate::{
    error::{PointoError, Result},
    transport::Transport,
    types::{CharacteristicRef, Generation},
};

/// A request the engine issued to the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// `start_scan`
    StartScan(Generation),
    /// `stop_scan`
    StopScan,
    /// `connect`
    Connect(BDAddr, Generation),
    /// `discover_services`
    DiscoverServices(Generation),
    /// `read_characteristic`
    Read(CharacteristicRef, Generation),
    /// `disconnect`
    Disconnect(Generation),
}

#[derive(Debug, Default)]
struct Journal {
    calls: Vec<Call>,
    disabled: bool,
    refused_scan: Option<i32>,
    refuse_connect: bool,
    refused_reads: HashSet<Uuid>,
}

/// Recording transport; clones share the same journal
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    journal: Arc<Mutex<Journal>>,
    live_links: Arc<AtomicUsize>,
}

/// Connection resource handed out by [`MockTransport`]
#[derive(Debug)]
pub struct MockLink {
    address: BDAddr,
    live: Arc<AtomicUsize>,
}

impl MockLink {
    /// Address the link was opened to
    #[must_use]
    pub const fn address(&self) -> BDAddr {
        self.address
    }
}

impl Drop for MockLink {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    /// Create a transport that accepts every request
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch the simulated radio on or off
    pub fn set_enabled(&self, enabled: bool) {
        self.with(|j| j.disabled = !enabled);
    }

    /// Make `start_scan` fail with `code`
    pub fn refuse_scan(&self, code: i32) {
        self.with(|j| j.refused_scan = Some(code));
    }

    /// Make `connect` fail
    pub fn refuse_connect(&self) {
        self.with(|j| j.refuse_connect = true);
    }

    /// Make read requests for `characteristic` fail
    pub fn refuse_read(&self, characteristic: Uuid) {
        self.with(|j| {
            j.refused_reads.insert(characteristic);
        });
    }

    /// Every request issued so far, in order
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.with(|j| j.calls.clone())
    }

    /// Number of links not yet released
    #[must_use]
    pub fn live_links(&self) -> usize {
        self.live_links.load(Ordering::SeqCst)
    }

    fn with<R>(&self, f: impl FnOnce(&mut Journal) -> R) -> R {
        let mut journal = self.journal.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut journal)
    }
}

impl Transport for MockTransport {
    type Handle = BDAddr;
    type Link = MockLink;

    fn is_enabled(&self) -> bool {
        self.with(|j| !j.disabled)
    }

    fn start_scan(&mut self, generation: Generation) -> Result<()> {
        self.with(|j| {
            j.calls.push(Call::StartScan(generation));
            j.refused_scan.map_or(Ok(()), |code| Err(PointoError::ScanStartFailure(code)))
        })
    }

    fn stop_scan(&mut self) -> Result<()> {
        self.with(|j| j.calls.push(Call::StopScan));
        Ok(())
    }

    fn connect(&mut self, peripheral: &BDAddr, generation: Generation) -> Result<MockLink> {
        let refused = self.with(|j| {
            j.calls.push(Call::Connect(*peripheral, generation));
            j.refuse_connect
        });
        if refused {
            return Err(PointoError::ConnectFailure(format!("{peripheral} unreachable")));
        }

        self.live_links.fetch_add(1, Ordering::SeqCst);
        Ok(MockLink {
            address: *peripheral,
            live: Arc::clone(&self.live_links),
        })
    }

    fn discover_services(&mut self, _link: &MockLink, generation: Generation) -> Result<()> {
        self.with(|j| j.calls.push(Call::DiscoverServices(generation)));
        Ok(())
    }

    fn read_characteristic(
        &mut self,
        _link: &MockLink,
        target: CharacteristicRef,
        generation: Generation,
    ) -> Result<()> {
        self.with(|j| {
            if j.refused_reads.contains(&target.characteristic) {
                return Err(PointoError::CharacteristicReadFailure {
                    characteristic: target,
                    reason: "not readable".to_string(),
                });
            }
            j.calls.push(Call::Read(target, generation));
            Ok(())
        })
    }

    fn disconnect(&mut self, _link: &MockLink, generation: Generation) -> Result<()> {
        self.with(|j| j.calls.push(Call::Disconnect(generation)));
        Ok(())
    }
}
