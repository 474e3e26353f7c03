//! The name directory: human names for node addresses.
//!
//! A bounded map of up to 64 `name ⇄ address` pairs, learned from beacons or set by the host.
//! Lookups that miss fall back to the `0xXXXXXXXX` hex spelling of the address. The directory
//! serializes itself into a single blob for the persistence provider.

use crate::bytes::{ByteReader, ByteWriter};
use crate::packet::NodeAddress;
use crate::store::Store;
use crate::time::Instant;
use crate::Error;
use core::fmt;
use heapless::{String, Vec};

/// Maximum directory entries.
pub const MAX_NAMES: usize = 64;

/// Maximum name length in bytes.
pub const MAX_NAME_LEN: usize = 16;

const STORE_NAMESPACE: &str = "naming";
const STORE_KEY: &str = "table";

/// One directory entry.
#[derive(Debug, Clone)]
pub struct NameEntry {
    pub address: NodeAddress,
    pub name: String<MAX_NAME_LEN>,
    pub last_seen: Instant,
}

/// Either a known name or the hex spelling of an address. Implements `Display`.
pub enum NameOrAddress<'a> {
    Name(&'a str),
    Address(NodeAddress),
}

impl fmt::Display for NameOrAddress<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NameOrAddress::Name(name) => f.write_str(name),
            NameOrAddress::Address(addr) => write!(f, "{}", addr),
        }
    }
}

/// Validates a candidate name: 1-16 bytes of printable ASCII, no leading/trailing spaces.
pub fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return false;
    }
    if name.starts_with(' ') || name.ends_with(' ') {
        return false;
    }
    name.bytes().all(|b| (0x20..0x7F).contains(&b))
}

/// The bounded name directory.
pub struct NameDirectory {
    local_address: NodeAddress,
    local_name: String<MAX_NAME_LEN>,
    entries: Vec<NameEntry, MAX_NAMES>,
}

impl NameDirectory {
    pub fn new(local_address: NodeAddress) -> Self {
        NameDirectory {
            local_address,
            local_name: String::new(),
            entries: Vec::new(),
        }
    }

    /// Sets this node's own name, included in beacons.
    pub fn set_local_name(&mut self, name: &str) -> Result<(), Error> {
        if !is_valid_name(name) {
            return Err(Error::InvalidValue);
        }
        self.local_name.clear();
        self.local_name
            .push_str(name)
            .map_err(|_| Error::InvalidValue)
    }

    /// This node's own name (may be empty).
    pub fn local_name(&self) -> &str {
        self.local_name.as_str()
    }

    /// Records or updates the name of a remote node.
    pub fn set(&mut self, address: NodeAddress, name: &str, now: Instant) -> Result<(), Error> {
        if !is_valid_name(name) || address == self.local_address {
            return Err(Error::InvalidValue);
        }

        if let Some(entry) = self.entries.iter_mut().find(|e| e.address == address) {
            entry.name.clear();
            entry.name.push_str(name).map_err(|_| Error::InvalidValue)?;
            entry.last_seen = now;
            return Ok(());
        }

        if self.entries.is_full() {
            // Longest-unseen entry makes room.
            let victim = self
                .entries
                .iter()
                .enumerate()
                .max_by_key(|(_, e)| now.duration_since(e.last_seen).as_millis())
                .map(|(i, _)| i);
            if let Some(i) = victim {
                self.entries.swap_remove(i);
            }
        }

        let mut stored = String::new();
        stored.push_str(name).map_err(|_| Error::InvalidValue)?;
        let _ = self.entries.push(NameEntry {
            address,
            name: stored,
            last_seen: now,
        });
        Ok(())
    }

    /// Removes a node's name. Returns whether one existed.
    pub fn remove(&mut self, address: NodeAddress) -> bool {
        if let Some(i) = self.entries.iter().position(|e| e.address == address) {
            self.entries.swap_remove(i);
            true
        } else {
            false
        }
    }

    /// The display name for `address`: the stored name, or its hex spelling.
    pub fn get(&self, address: NodeAddress) -> NameOrAddress<'_> {
        if address == self.local_address && !self.local_name.is_empty() {
            return NameOrAddress::Name(self.local_name.as_str());
        }
        match self.entries.iter().find(|e| e.address == address) {
            Some(entry) => NameOrAddress::Name(entry.name.as_str()),
            None => NameOrAddress::Address(address),
        }
    }

    /// Resolves a name (case-insensitive) back to an address.
    pub fn resolve(&self, name: &str) -> Option<NodeAddress> {
        if !self.local_name.is_empty() && self.local_name.as_str().eq_ignore_ascii_case(name) {
            return Some(self.local_address);
        }
        self.entries
            .iter()
            .find(|e| e.name.as_str().eq_ignore_ascii_case(name))
            .map(|e| e.address)
    }

    /// Refreshes the last-seen stamp of an entry.
    pub fn touch(&mut self, address: NodeAddress, now: Instant) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.address == address) {
            entry.last_seen = now;
        }
    }

    /// Number of remote entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over all remote entries.
    pub fn iter(&self) -> impl Iterator<Item = &NameEntry> {
        self.entries.iter()
    }

    /// Serializes the directory into the persistence provider.
    pub fn save<S: Store>(&self, store: &mut S) -> bool {
        let mut blob = [0; 2 + MAX_NAME_LEN + MAX_NAMES * (4 + 1 + MAX_NAME_LEN)];
        let blob_len = blob.len();
        let mut w = ByteWriter::new(&mut blob);

        let ok = w.write_u8(self.local_name.len() as u8).is_ok()
            && w.write_slice(self.local_name.as_bytes()).is_ok()
            && w.write_u8(self.entries.len() as u8).is_ok();
        if !ok {
            return false;
        }
        for e in &self.entries {
            if w.write_u32_le(e.address.raw()).is_err()
                || w.write_u8(e.name.len() as u8).is_err()
                || w.write_slice(e.name.as_bytes()).is_err()
            {
                return false;
            }
        }
        let used = blob_len - w.space_left();
        store.save(STORE_NAMESPACE, STORE_KEY, &blob[..used]).is_ok()
    }

    /// Restores the directory from the persistence provider.
    pub fn load<S: Store>(&mut self, store: &S, now: Instant) -> bool {
        let mut blob = [0; 2 + MAX_NAME_LEN + MAX_NAMES * (4 + 1 + MAX_NAME_LEN)];
        let len = match store.load(STORE_NAMESPACE, STORE_KEY, &mut blob) {
            Some(len) => len,
            None => return false,
        };

        let mut r = ByteReader::new(&blob[..len]);
        let local_len = match r.read_u8() {
            Ok(n) => usize::from(n).min(MAX_NAME_LEN),
            Err(_) => return false,
        };
        if let Ok(bytes) = r.read_slice(local_len) {
            if let Ok(s) = core::str::from_utf8(bytes) {
                let _ = self.set_local_name(s);
            }
        }

        let count = match r.read_u8() {
            Ok(c) => usize::from(c).min(MAX_NAMES),
            Err(_) => return false,
        };
        for _ in 0..count {
            let address = match r.read_u32_le() {
                Ok(a) => NodeAddress::new(a),
                Err(_) => return false,
            };
            let name_len = match r.read_u8() {
                Ok(n) => usize::from(n).min(MAX_NAME_LEN),
                Err(_) => return false,
            };
            let bytes = match r.read_slice(name_len) {
                Ok(b) => b,
                Err(_) => return false,
            };
            if let Ok(name) = core::str::from_utf8(bytes) {
                let _ = self.set(address, name, now);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u32) -> Instant {
        Instant::from_raw_millis(ms)
    }

    #[test]
    fn lookup_falls_back_to_hex() {
        let dir = NameDirectory::new(NodeAddress::new(0xA1));
        let shown = format!("{}", dir.get(NodeAddress::new(0xDEADBEEF)));
        assert_eq!(shown, "0xDEADBEEF");
    }

    #[test]
    fn set_and_resolve_case_insensitive() {
        let mut dir = NameDirectory::new(NodeAddress::new(0xA1));
        dir.set(NodeAddress::new(0xB2), "basecamp", at(0)).unwrap();

        assert_eq!(format!("{}", dir.get(NodeAddress::new(0xB2))), "basecamp");
        assert_eq!(dir.resolve("BaseCamp"), Some(NodeAddress::new(0xB2)));
        assert_eq!(dir.resolve("nothere"), None);

        assert!(dir.remove(NodeAddress::new(0xB2)));
        assert_eq!(dir.resolve("basecamp"), None);
    }

    #[test]
    fn rejects_invalid_names() {
        let mut dir = NameDirectory::new(NodeAddress::new(0xA1));
        assert!(dir.set(NodeAddress::new(0xB2), "", at(0)).is_err());
        assert!(dir
            .set(NodeAddress::new(0xB2), "name too long here", at(0))
            .is_err());
        assert!(dir.set(NodeAddress::new(0xB2), " padded", at(0)).is_err());
        assert!(dir.set(NodeAddress::new(0xB2), "tab\tbad", at(0)).is_err());
    }

    #[test]
    fn full_directory_evicts_longest_unseen() {
        let mut dir = NameDirectory::new(NodeAddress::new(0xA1));
        for i in 0..MAX_NAMES as u32 {
            let mut name = std::string::String::from("n");
            name.push_str(&i.to_string());
            dir.set(NodeAddress::new(0x1000 + i), &name, at(i)).unwrap();
        }
        dir.touch(NodeAddress::new(0x1000), at(1_000_000));

        dir.set(NodeAddress::new(0x9999), "newest", at(1_000_001))
            .unwrap();
        assert_eq!(dir.len(), MAX_NAMES);
        assert_eq!(dir.resolve("n0"), Some(NodeAddress::new(0x1000)));
        assert_eq!(dir.resolve("n1"), None);
        assert_eq!(dir.resolve("newest"), Some(NodeAddress::new(0x9999)));
    }

    #[test]
    fn persistence_round_trip() {
        use crate::store::{Store, StoreError};
        use std::collections::HashMap;

        struct MemStore(HashMap<(std::string::String, std::string::String), std::vec::Vec<u8>>);
        impl Store for MemStore {
            fn save(&mut self, ns: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
                self.0.insert((ns.into(), key.into()), bytes.to_vec());
                Ok(())
            }
            fn load(&self, ns: &str, key: &str, buf: &mut [u8]) -> Option<usize> {
                let blob = self.0.get(&(ns.into(), key.into()))?;
                if blob.len() > buf.len() {
                    return None;
                }
                buf[..blob.len()].copy_from_slice(blob);
                Some(blob.len())
            }
        }

        let mut store = MemStore(HashMap::new());
        let mut dir = NameDirectory::new(NodeAddress::new(0xA1));
        dir.set_local_name("ridge-7").unwrap();
        dir.set(NodeAddress::new(0xB2), "basecamp", at(0)).unwrap();
        assert!(dir.save(&mut store));

        let mut restored = NameDirectory::new(NodeAddress::new(0xA1));
        assert!(restored.load(&store, at(10)));
        assert_eq!(restored.local_name(), "ridge-7");
        assert_eq!(restored.resolve("basecamp"), Some(NodeAddress::new(0xB2)));
    }
}
