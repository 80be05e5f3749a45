use crate::{
    error::{PointoError, Result},
    types::{CharacteristicRef, Generation, Permission},
};

/// Contract the engine consumes from the wireless adapter
///
/// Every method issues a request and returns immediately. Completions are
/// delivered later as [`crate::AdapterEvent`]s carrying the generation passed
/// in here. An `Err` return means the request was never issued.
///
/// `Link` is the connection resource. The engine holds exactly one at a time
/// and drops it on every transition to `Disconnected`, so implementations
/// release the platform connection in `Drop`.
pub trait Transport: Send + 'static {
    /// Platform peripheral object kept by the registry
    type Handle: Clone + Send + 'static;
    /// Exclusively owned connection resource
    type Link: Send + 'static;

    /// Whether the radio is currently switched on
    ///
    /// Scans and connects are refused with
    /// [`PointoError::AdapterDisabled`] while this returns `false`.
    fn is_enabled(&self) -> bool {
        true
    }

    /// Begin scanning; results are tagged with `generation`
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter refuses to start scanning.
    fn start_scan(&mut self, generation: Generation) -> Result<()>;

    /// Stop scanning
    ///
    /// # Errors
    ///
    /// Returns an error if the adapter reports a failure while stopping.
    fn stop_scan(&mut self) -> Result<()>;

    /// Open a connection to `peripheral`
    ///
    /// # Errors
    ///
    /// Returns an error if the connection request cannot be issued.
    fn connect(&mut self, peripheral: &Self::Handle, generation: Generation) -> Result<Self::Link>;

    /// Request service discovery on an established link
    ///
    /// # Errors
    ///
    /// Returns an error if the discovery request cannot be issued.
    fn discover_services(&mut self, link: &Self::Link, generation: Generation) -> Result<()>;

    /// Request a single characteristic read
    ///
    /// # Errors
    ///
    /// Returns an error if the read request cannot be issued.
    fn read_characteristic(
        &mut self,
        link: &Self::Link,
        target: CharacteristicRef,
        generation: Generation,
    ) -> Result<()>;

    /// Request link teardown
    ///
    /// # Errors
    ///
    /// Returns an error if the teardown request cannot be issued.
    fn disconnect(&mut self, link: &Self::Link, generation: Generation) -> Result<()>;
}

/// Host permission layer
///
/// The engine checks grants before touching the adapter and fails fast with
/// [`PointoError::PermissionDenied`].
pub trait PermissionProvider: Send + Sync {
    /// Whether `permission` is currently granted
    fn is_granted(&self, permission: Permission) -> bool;
}

impl<F> PermissionProvider for F
where
    F: Fn(Permission) -> bool + Send + Sync,
{
    fn is_granted(&self, permission: Permission) -> bool {
        self(permission)
    }
}

/// Grants every permission
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionProvider for AllowAll {
    fn is_granted(&self, _permission: Permission) -> bool {
        true
    }
}

pub(crate) fn ensure_enabled<T: Transport>(transport: &T) -> Result<()> {
    if transport.is_enabled() {
        Ok(())
    } else {
        Err(PointoError::AdapterDisabled)
    }
}

pub(crate) fn ensure_granted(
    permissions: &dyn PermissionProvider,
    permission: Permission,
) -> Result<()> {
    if permissions.is_granted(permission) {
        Ok(())
    } else {
        Err(PointoError::PermissionDenied(permission))
    }
}
