//! Opaque blob persistence.
//!
//! Subsystems that survive a reboot (group membership, the name directory) serialize themselves
//! into a byte blob and hand it to the host through this interface. The stack never interprets
//! the storage medium; a host may back this with internal flash, a filesystem, or nothing at all.

use core::fmt;

/// Error returned when a blob could not be persisted.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub struct StoreError;

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("persistence unavailable or write failed")
    }
}

/// Trait for persistence providers.
///
/// Keys are namespaced per subsystem so providers can map them to separate files or flash pages.
/// Writes replace the previous blob under the same `(namespace, key)` pair atomically as far as
/// the provider can manage.
pub trait Store {
    /// Persists `bytes` under `(namespace, key)`.
    fn save(&mut self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    /// Loads the blob stored under `(namespace, key)` into `buf`.
    ///
    /// Returns the blob length on success, `None` when nothing is stored or `buf` is too small.
    fn load(&self, namespace: &str, key: &str, buf: &mut [u8]) -> Option<usize>;
}

/// A persistence provider for boards without usable storage.
///
/// All saves fail and all loads come back empty; subsystems fall back to their boot defaults.
pub struct NoStore;

impl Store for NoStore {
    fn save(&mut self, _namespace: &str, _key: &str, _bytes: &[u8]) -> Result<(), StoreError> {
        Err(StoreError)
    }

    fn load(&self, _namespace: &str, _key: &str, _buf: &mut [u8]) -> Option<usize> {
        None
    }
}
