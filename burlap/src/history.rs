//! The message history: a bounded circular log of recent traffic.
//!
//! Keeps the 32 most recent user messages (sent and received, unicast and broadcast) so a node
//! joining late can show recent activity and the host UI can scroll back. Entries are seekable
//! by index-from-newest and filterable by peer or substring.

use crate::packet::NodeAddress;
use crate::time::Instant;
use heapless::Vec;

/// Messages retained in the log.
pub const HISTORY_CAPACITY: usize = 32;

/// Bytes of text retained per message.
pub const HISTORY_TEXT_LEN: usize = 128;

/// Direction of a logged message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    Received,
    Sent,
    BroadcastReceived,
    BroadcastSent,
}

/// One logged message.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    /// Monotonic per-node entry id.
    pub id: u32,
    pub timestamp: Instant,
    pub source: NodeAddress,
    pub destination: NodeAddress,
    pub direction: Direction,
    pub hop_count: u8,
    pub rssi: i16,
    pub snr: i8,
    text: Vec<u8, HISTORY_TEXT_LEN>,
}

impl HistoryEntry {
    /// The stored message bytes (truncated to [`HISTORY_TEXT_LEN`]).
    pub fn text(&self) -> &[u8] {
        &self.text
    }
}

/// Totals per direction.
#[derive(Debug, Copy, Clone, Default)]
pub struct HistoryStats {
    pub received: u32,
    pub sent: u32,
    pub broadcast_received: u32,
    pub broadcast_sent: u32,
}

/// The circular message log.
pub struct MessageLog {
    entries: Vec<HistoryEntry, HISTORY_CAPACITY>,
    /// Index of the slot the next entry overwrites once the log is full.
    cursor: usize,
    next_id: u32,
    stats: HistoryStats,
}

impl MessageLog {
    pub fn new() -> Self {
        MessageLog {
            entries: Vec::new(),
            cursor: 0,
            next_id: 1,
            stats: HistoryStats::default(),
        }
    }

    /// Appends a message, overwriting the oldest entry when full.
    #[allow(clippy::too_many_arguments)]
    pub fn push(
        &mut self,
        direction: Direction,
        source: NodeAddress,
        destination: NodeAddress,
        text: &[u8],
        hop_count: u8,
        rssi: i16,
        snr: i8,
        now: Instant,
    ) {
        match direction {
            Direction::Received => self.stats.received += 1,
            Direction::Sent => self.stats.sent += 1,
            Direction::BroadcastReceived => self.stats.broadcast_received += 1,
            Direction::BroadcastSent => self.stats.broadcast_sent += 1,
        }

        let stored = &text[..text.len().min(HISTORY_TEXT_LEN)];
        let entry = HistoryEntry {
            id: self.next_id,
            timestamp: now,
            source,
            destination,
            direction,
            hop_count,
            rssi,
            snr,
            text: Vec::from_slice(stored).unwrap_or_default(),
        };
        self.next_id = self.next_id.wrapping_add(1);

        if self.entries.is_full() {
            self.entries[self.cursor] = entry;
            self.cursor = (self.cursor + 1) % HISTORY_CAPACITY;
        } else {
            let _ = self.entries.push(entry);
        }
    }

    /// The `n`th most recent entry (0 = newest).
    pub fn get(&self, index_from_newest: usize) -> Option<&HistoryEntry> {
        if index_from_newest >= self.entries.len() {
            return None;
        }
        let idx = if self.entries.is_full() {
            let newest = (self.cursor + HISTORY_CAPACITY - 1) % HISTORY_CAPACITY;
            (newest + HISTORY_CAPACITY - index_from_newest) % HISTORY_CAPACITY
        } else {
            self.entries.len() - 1 - index_from_newest
        };
        self.entries.get(idx)
    }

    /// Looks an entry up by id.
    pub fn get_by_id(&self, id: u32) -> Option<&HistoryEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    /// Iterates newest-first.
    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        (0..self.entries.len()).filter_map(move |i| self.get(i))
    }

    /// Entries exchanged with `peer` (as source or destination), newest first.
    pub fn from_peer<'a>(
        &'a self,
        peer: NodeAddress,
    ) -> impl Iterator<Item = &'a HistoryEntry> + 'a {
        self.iter()
            .filter(move |e| e.source == peer || e.destination == peer)
    }

    /// Entries whose text contains `needle`, newest first.
    pub fn containing<'a>(&'a self, needle: &'a [u8]) -> impl Iterator<Item = &'a HistoryEntry> + 'a {
        self.iter().filter(move |e| {
            !needle.is_empty()
                && e.text
                    .windows(needle.len())
                    .any(|window| window == needle)
        })
    }

    /// Number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> HistoryStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u32) -> Instant {
        Instant::from_raw_millis(ms)
    }

    fn push_text(log: &mut MessageLog, n: u32, text: &[u8]) {
        log.push(
            Direction::Received,
            NodeAddress::new(0xB2),
            NodeAddress::new(0xA1),
            text,
            1,
            -80,
            5,
            at(n),
        );
    }

    #[test]
    fn newest_first_seek() {
        let mut log = MessageLog::new();
        push_text(&mut log, 1, b"first");
        push_text(&mut log, 2, b"second");
        push_text(&mut log, 3, b"third");

        assert_eq!(log.get(0).unwrap().text(), b"third");
        assert_eq!(log.get(1).unwrap().text(), b"second");
        assert_eq!(log.get(2).unwrap().text(), b"first");
        assert!(log.get(3).is_none());
    }

    #[test]
    fn wraps_at_capacity() {
        let mut log = MessageLog::new();
        for i in 0..(HISTORY_CAPACITY as u32 + 5) {
            let mut text = std::vec::Vec::from(&b"msg "[..]);
            text.extend_from_slice(i.to_string().as_bytes());
            push_text(&mut log, i, &text);
        }

        assert_eq!(log.len(), HISTORY_CAPACITY);
        // Newest is the last pushed, oldest five fell off.
        assert_eq!(log.get(0).unwrap().text(), b"msg 36");
        let oldest = log.get(HISTORY_CAPACITY - 1).unwrap();
        assert_eq!(oldest.text(), b"msg 5");
    }

    #[test]
    fn filter_by_peer() {
        let mut log = MessageLog::new();
        push_text(&mut log, 1, b"from b2");
        log.push(
            Direction::Sent,
            NodeAddress::new(0xA1),
            NodeAddress::new(0xC3),
            b"to c3",
            0,
            0,
            0,
            at(2),
        );

        let with_b2: std::vec::Vec<_> = log.from_peer(NodeAddress::new(0xB2)).collect();
        assert_eq!(with_b2.len(), 1);
        assert_eq!(with_b2[0].text(), b"from b2");

        let with_c3: std::vec::Vec<_> = log.from_peer(NodeAddress::new(0xC3)).collect();
        assert_eq!(with_c3.len(), 1);
    }

    #[test]
    fn filter_by_substring() {
        let mut log = MessageLog::new();
        push_text(&mut log, 1, b"meet at ridge");
        push_text(&mut log, 2, b"weather update");
        push_text(&mut log, 3, b"ridge trail closed");

        let hits: std::vec::Vec<_> = log.containing(b"ridge").collect();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].text(), b"ridge trail closed");
        assert_eq!(hits[1].text(), b"meet at ridge");

        assert_eq!(log.containing(b"").count(), 0);
    }

    #[test]
    fn long_text_is_truncated() {
        let mut log = MessageLog::new();
        let long = [b'x'; HISTORY_TEXT_LEN + 50];
        push_text(&mut log, 1, &long);
        assert_eq!(log.get(0).unwrap().text().len(), HISTORY_TEXT_LEN);
    }
}
