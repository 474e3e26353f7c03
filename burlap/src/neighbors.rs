//! The neighbor table: directly-heard peers and their signal history.
//!
//! Every successful reception refreshes the sender's entry and records RSSI/SNR in a small ring
//! buffer. Entries expire after `route_timeout` of silence; when the table is full the entry
//! that has been silent longest is evicted.

use crate::packet::NodeAddress;
use crate::time::{Duration, Instant};
use heapless::Vec;

/// Maximum number of tracked neighbors.
pub const MAX_NEIGHBORS: usize = 16;

/// Number of RSSI/SNR samples kept per neighbor.
pub const SIGNAL_WINDOW: usize = 8;

/// A directly-heard peer.
#[derive(Clone)]
pub struct Neighbor {
    /// The peer's address.
    pub address: NodeAddress,
    rssi: [i16; SIGNAL_WINDOW],
    snr: [i8; SIGNAL_WINDOW],
    samples: u8,
    cursor: u8,
    /// Total frames heard from this peer.
    pub packets_heard: u32,
    /// Time of the most recent reception.
    pub last_seen: Instant,
}

impl Neighbor {
    fn new(address: NodeAddress, now: Instant) -> Self {
        Neighbor {
            address,
            rssi: [0; SIGNAL_WINDOW],
            snr: [0; SIGNAL_WINDOW],
            samples: 0,
            cursor: 0,
            packets_heard: 0,
            last_seen: now,
        }
    }

    fn record(&mut self, rssi: i16, snr: i8, now: Instant) {
        let idx = usize::from(self.cursor);
        self.rssi[idx] = rssi;
        self.snr[idx] = snr;
        self.cursor = (self.cursor + 1) % SIGNAL_WINDOW as u8;
        if usize::from(self.samples) < SIGNAL_WINDOW {
            self.samples += 1;
        }
        self.packets_heard = self.packets_heard.wrapping_add(1);
        self.last_seen = now;
    }

    /// The most recently recorded RSSI in dBm.
    pub fn last_rssi(&self) -> i16 {
        if self.samples == 0 {
            return 0;
        }
        let idx = (usize::from(self.cursor) + SIGNAL_WINDOW - 1) % SIGNAL_WINDOW;
        self.rssi[idx]
    }

    /// The most recently recorded SNR in dB.
    pub fn last_snr(&self) -> i8 {
        if self.samples == 0 {
            return 0;
        }
        let idx = (usize::from(self.cursor) + SIGNAL_WINDOW - 1) % SIGNAL_WINDOW;
        self.snr[idx]
    }

    /// Windowed average RSSI in dBm.
    pub fn avg_rssi(&self) -> i16 {
        if self.samples == 0 {
            return i16::MIN;
        }
        let n = usize::from(self.samples);
        let sum: i32 = self.rssi[..n].iter().map(|&r| i32::from(r)).sum();
        (sum / n as i32) as i16
    }

    /// Windowed average SNR in dB.
    pub fn avg_snr(&self) -> i8 {
        if self.samples == 0 {
            return i8::MIN;
        }
        let n = usize::from(self.samples);
        let sum: i32 = self.snr[..n].iter().map(|&s| i32::from(s)).sum();
        (sum / n as i32) as i8
    }

    /// Link quality estimate in percent, combining windowed RSSI and SNR.
    pub fn quality(&self) -> u8 {
        if self.samples == 0 {
            return 0;
        }

        // RSSI contributes up to 70 points over the usable -120..-40 dBm span,
        // SNR up to 30 points over -20..+10 dB.
        let rssi = i32::from(self.avg_rssi()).clamp(-120, -40);
        let snr = i32::from(self.avg_snr()).clamp(-20, 10);
        let rssi_pts = (rssi + 120) * 70 / 80;
        let snr_pts = (snr + 20) * 30 / 30;
        (rssi_pts + snr_pts) as u8
    }
}

/// Fixed-capacity table of directly-heard peers.
pub struct NeighborTable {
    entries: Vec<Neighbor, MAX_NEIGHBORS>,
}

impl NeighborTable {
    pub fn new() -> Self {
        NeighborTable {
            entries: Vec::new(),
        }
    }

    /// Records a reception from `address`, creating the entry on first contact.
    ///
    /// Returns `true` when this was the first time the peer was heard (or re-heard after an
    /// expiry), which the DTN layer uses as its contact-opportunity trigger.
    pub fn record(&mut self, address: NodeAddress, rssi: i16, snr: i8, now: Instant) -> bool {
        if let Some(entry) = self.entries.iter_mut().find(|n| n.address == address) {
            entry.record(rssi, snr, now);
            return false;
        }

        if self.entries.is_full() {
            // Evict the peer that has been silent longest.
            let victim = self
                .entries
                .iter()
                .enumerate()
                .max_by_key(|(_, n)| now.duration_since(n.last_seen).as_millis())
                .map(|(i, _)| i);
            if let Some(i) = victim {
                self.entries.swap_remove(i);
            }
        }

        let mut entry = Neighbor::new(address, now);
        entry.record(rssi, snr, now);
        let _ = self.entries.push(entry);
        true
    }

    /// Looks up a neighbor by address.
    pub fn get(&self, address: NodeAddress) -> Option<&Neighbor> {
        self.entries.iter().find(|n| n.address == address)
    }

    /// Returns whether `address` is a currently-tracked direct neighbor.
    pub fn contains(&self, address: NodeAddress) -> bool {
        self.get(address).is_some()
    }

    /// Drops entries that have been silent for longer than `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) {
        let mut i = 0;
        while i < self.entries.len() {
            if now.duration_since(self.entries[i].last_seen) > timeout {
                self.entries.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Iterates over all tracked neighbors.
    pub fn iter(&self) -> impl Iterator<Item = &Neighbor> {
        self.entries.iter()
    }

    /// Number of tracked neighbors.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u32) -> Instant {
        Instant::from_raw_millis(ms)
    }

    #[test]
    fn ring_buffer_averages() {
        let mut table = NeighborTable::new();
        let peer = NodeAddress::new(0xA1);

        assert!(table.record(peer, -80, 5, at(0)));
        for i in 1..=9u32 {
            assert!(!table.record(peer, -80 - i as i16, 5, at(i * 100)));
        }

        let n = table.get(peer).unwrap();
        // Only the last 8 samples (-82..=-89) remain in the window; their mean truncates to -85.
        assert_eq!(n.avg_rssi(), -85);
        assert_eq!(n.last_rssi(), -89);
        assert_eq!(n.packets_heard, 10);
    }

    #[test]
    fn expiry_removes_silent_peers() {
        let mut table = NeighborTable::new();
        table.record(NodeAddress::new(1), -70, 8, at(0));
        table.record(NodeAddress::new(2), -70, 8, at(200_000));

        table.expire(at(320_000), Duration::from_secs(300));
        assert!(!table.contains(NodeAddress::new(1)));
        assert!(table.contains(NodeAddress::new(2)));
    }

    #[test]
    fn full_table_evicts_most_silent() {
        let mut table = NeighborTable::new();
        for i in 0..MAX_NEIGHBORS as u32 {
            table.record(NodeAddress::new(i + 1), -70, 8, at(i * 1000));
        }
        assert_eq!(table.len(), MAX_NEIGHBORS);

        table.record(NodeAddress::new(0x99), -70, 8, at(1_000_000));
        assert_eq!(table.len(), MAX_NEIGHBORS);
        assert!(table.contains(NodeAddress::new(0x99)));
        // The peer last heard at t=0 was the victim.
        assert!(!table.contains(NodeAddress::new(1)));
    }

    #[test]
    fn quality_tracks_signal() {
        let mut strong = NeighborTable::new();
        strong.record(NodeAddress::new(1), -50, 10, at(0));
        let mut weak = NeighborTable::new();
        weak.record(NodeAddress::new(1), -118, -18, at(0));

        assert!(strong.get(NodeAddress::new(1)).unwrap().quality() > 80);
        assert!(weak.get(NodeAddress::new(1)).unwrap().quality() < 15);
    }
}
