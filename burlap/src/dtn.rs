//! Delay-tolerant store-and-forward: the bundle queue.
//!
//! A bundle is a payload plus routing, custody and lifetime metadata. Bundles are carried inside
//! mesh frames hop by hop, but their lifetime is independent of any single contact: a node keeps
//! custody of a bundle until it can hand it to the destination, to a closer custodian, or until
//! the bundle's TTL runs out. Payloads above [`FRAGMENT_SIZE`] travel as sequenced fragments and
//! are reassembled at the destination from a received-fragment mask.
//!
//! The queue is strictly priority-ordered (EMERGENCY > EXPEDITED > NORMAL > BULK, oldest first
//! within a class); when it overflows, the lowest-priority-oldest bundle makes room, and only for
//! a higher-priority newcomer. TTLs travel as *remaining* milliseconds, so nodes never need a
//! shared clock.

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::neighbors::NeighborTable;
use crate::packet::{NodeAddress, PacketType, MAX_PAYLOAD_LEN};
use crate::stack::{Event, EventQueue, Outbox, PRIO_BULK, PRIO_DATA, PRIO_EMERGENCY};
use crate::time::{Duration, Instant};
use crate::Error;
use bitflags::bitflags;
use heapless::Vec;
use rand_core::{CryptoRng, RngCore};

/// Maximum bundles held at once.
pub const MAX_BUNDLES: usize = 16;

/// Maximum payload of one bundle.
pub const MAX_BUNDLE_PAYLOAD: usize = 512;

/// Payloads above this size travel as fragments of this size.
pub const FRAGMENT_SIZE: usize = 200;

/// Maximum fragments per bundle (limited by the 8-bit received mask).
pub const MAX_FRAGMENTS: usize = 8;

/// Default bundle lifetime when the caller passes none.
pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 3600);

/// How long to wait for a custody acceptance before reclaiming the bundle.
pub const CUSTODY_TIMEOUT: Duration = Duration::from_secs(60);

/// Minimum spacing between delivery attempts of one bundle.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Delivery attempts before a bundle is abandoned.
pub const MAX_FORWARD_ATTEMPTS: u8 = 10;

/// Copies handed out per bundle in epidemic mode.
pub const MAX_EPIDEMIC_COPIES: u8 = 3;

const BUNDLE_HEADER_LEN: usize = 28;

enum_with_unknown! {
    /// Sub-type byte leading every DTN frame.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum DtnPacketType(u8) {
        /// A bundle or bundle fragment.
        Bundle = 0x40,
        /// Custody transfer signal.
        Custody = 0x41,
    }
}

bitflags! {
    /// Bundle processing flags.
    pub struct BundleFlags: u8 {
        /// This frame carries a fragment of a larger payload.
        const FRAGMENT = 0x01;
        /// The sender requests custody transfer along the way.
        const CUSTODY = 0x02;
        /// The destination reports delivery back to the source.
        const REPORT_DELIVERY = 0x08;
        /// Replicate to every contact instead of only toward the destination.
        const EPIDEMIC = 0x10;
    }
}

/// Bundle class of service. Higher outranks lower.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum BundlePriority {
    Bulk = 0,
    Normal = 1,
    Expedited = 2,
    Emergency = 3,
}

impl BundlePriority {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => BundlePriority::Bulk,
            2 => BundlePriority::Expedited,
            3 => BundlePriority::Emergency,
            _ => BundlePriority::Normal,
        }
    }
}

/// Lifecycle of a queued bundle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BundleStatus {
    /// Waiting for a forwarding opportunity.
    Pending,
    /// Handed to the mesh toward its destination.
    InTransit,
    /// Waiting for the next custodian's acceptance.
    CustodyWait,
    /// Delivered (or custody passed on); slot about to be freed.
    Delivered,
    /// TTL ran out.
    Expired,
    /// Gave up after too many attempts or an eviction.
    Failed,
}

/// On-air bundle header.
struct BundleHeader {
    bundle_id: u32,
    source: NodeAddress,
    destination: NodeAddress,
    custodian: NodeAddress,
    /// Remaining lifetime at transmission time.
    ttl_ms: u32,
    /// Total payload length of the (possibly fragmented) bundle.
    payload_len: u16,
    flags: BundleFlags,
    priority: u8,
    fragment_offset: u8,
    fragment_count: u8,
    hop_count: u8,
    max_hops: u8,
}

impl ToBytes for BundleHeader {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u32_le(self.bundle_id)?;
        writer.write_u32_le(self.source.raw())?;
        writer.write_u32_le(self.destination.raw())?;
        writer.write_u32_le(self.custodian.raw())?;
        writer.write_u32_le(self.ttl_ms)?;
        writer.write_u16_le(self.payload_len)?;
        writer.write_u8(self.flags.bits())?;
        writer.write_u8(self.priority)?;
        writer.write_u8(self.fragment_offset)?;
        writer.write_u8(self.fragment_count)?;
        writer.write_u8(self.hop_count)?;
        writer.write_u8(self.max_hops)
    }
}

impl<'a> FromBytes<'a> for BundleHeader {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(BundleHeader {
            bundle_id: bytes.read_u32_le()?,
            source: NodeAddress::new(bytes.read_u32_le()?),
            destination: NodeAddress::new(bytes.read_u32_le()?),
            custodian: NodeAddress::new(bytes.read_u32_le()?),
            ttl_ms: bytes.read_u32_le()?,
            payload_len: bytes.read_u16_le()?,
            flags: BundleFlags::from_bits_truncate(bytes.read_u8()?),
            priority: bytes.read_u8()?,
            fragment_offset: bytes.read_u8()?,
            fragment_count: bytes.read_u8()?,
            hop_count: bytes.read_u8()?,
            max_hops: bytes.read_u8()?,
        })
    }
}

/// Custody transfer signal.
struct CustodySignal {
    bundle_id: u32,
    custodian: NodeAddress,
    accepted: bool,
    reason: u8,
}

impl ToBytes for CustodySignal {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u32_le(self.bundle_id)?;
        writer.write_u32_le(self.custodian.raw())?;
        writer.write_u8(self.accepted as u8)?;
        writer.write_u8(self.reason)
    }
}

impl<'a> FromBytes<'a> for CustodySignal {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(CustodySignal {
            bundle_id: bytes.read_u32_le()?,
            custodian: NodeAddress::new(bytes.read_u32_le()?),
            accepted: bytes.read_u8()? != 0,
            reason: bytes.read_u8()?,
        })
    }
}

const CUSTODY_REFUSED_NO_SPACE: u8 = 1;

struct Bundle {
    id: u32,
    source: NodeAddress,
    destination: NodeAddress,
    custodian: NodeAddress,
    priority: BundlePriority,
    flags: BundleFlags,
    payload: [u8; MAX_BUNDLE_PAYLOAD],
    payload_len: u16,
    fragment_mask: u8,
    fragment_count: u8,
    hop_count: u8,
    max_hops: u8,
    created_at: Instant,
    expires_at: Instant,
    last_attempt: Option<Instant>,
    attempts: u8,
    copies_sent: u8,
    custody_deadline: Option<Instant>,
    status: BundleStatus,
}

impl Bundle {
    fn complete_mask(fragment_count: u8) -> u8 {
        if fragment_count >= 8 {
            0xFF
        } else {
            (1u8 << fragment_count) - 1
        }
    }

    fn is_complete(&self) -> bool {
        self.fragment_mask == Self::complete_mask(self.fragment_count)
    }
}

/// DTN statistics.
#[derive(Debug, Copy, Clone, Default)]
pub struct DtnStats {
    pub created: u32,
    pub received: u32,
    pub forwarded: u32,
    pub delivered: u32,
    pub expired: u32,
    pub custody_transfers: u32,
    pub fragments_sent: u32,
    pub fragments_received: u32,
}

/// The bundle queue.
pub struct DtnManager {
    bundles: Vec<Bundle, MAX_BUNDLES>,
    node: NodeAddress,
    stats: DtnStats,
}

impl DtnManager {
    pub fn new(node: NodeAddress) -> Self {
        DtnManager {
            bundles: Vec::new(),
            node,
            stats: DtnStats::default(),
        }
    }

    /// Queues a locally-originated bundle. Returns its id.
    ///
    /// When the queue is full, the lowest-priority-oldest bundle is evicted, but only for a
    /// strictly higher-priority newcomer.
    #[allow(clippy::too_many_arguments)]
    pub fn queue<R: RngCore + CryptoRng>(
        &mut self,
        destination: NodeAddress,
        payload: &[u8],
        priority: BundlePriority,
        ttl: Option<Duration>,
        flags: BundleFlags,
        now: Instant,
        rng: &mut R,
        events: &mut EventQueue,
    ) -> Result<u32, Error> {
        if payload.is_empty() || payload.len() > MAX_BUNDLE_PAYLOAD {
            return Err(Error::InvalidValue);
        }
        if payload.len() > FRAGMENT_SIZE * MAX_FRAGMENTS {
            return Err(Error::InvalidValue);
        }

        if self.bundles.is_full() && !self.evict_for(priority, events) {
            return Err(Error::CapacityExceeded);
        }

        let id = rng.next_u32();
        let ttl = ttl.unwrap_or(DEFAULT_TTL);
        let fragment_count = payload.len().div_ceil(FRAGMENT_SIZE).max(1) as u8;

        let mut stored = [0; MAX_BUNDLE_PAYLOAD];
        stored[..payload.len()].copy_from_slice(payload);

        let bundle = Bundle {
            id,
            source: self.node,
            destination,
            custodian: self.node,
            priority,
            flags,
            payload: stored,
            payload_len: payload.len() as u16,
            fragment_mask: Bundle::complete_mask(fragment_count),
            fragment_count,
            hop_count: 0,
            max_hops: 8,
            created_at: now,
            expires_at: now + ttl,
            last_attempt: None,
            attempts: 0,
            copies_sent: 0,
            custody_deadline: None,
            status: BundleStatus::Pending,
        };
        self.insert_sorted(bundle);
        self.stats.created += 1;
        Ok(id)
    }

    /// Priority-ordered insert: higher class first, older first within a class.
    fn insert_sorted(&mut self, bundle: Bundle) {
        let pos = self
            .bundles
            .iter()
            .position(|b| b.priority < bundle.priority)
            .unwrap_or(self.bundles.len());
        if self.bundles.insert(pos, bundle).is_err() {
            // Caller guarantees a free slot.
            debug_assert!(false, "insert into full bundle queue");
        }
    }

    /// Evicts the lowest-priority-oldest bundle if it ranks below `incoming`.
    fn evict_for(&mut self, incoming: BundlePriority, events: &mut EventQueue) -> bool {
        let lowest = match self
            .bundles
            .iter()
            .filter(|b| b.priority < incoming)
            .map(|b| b.priority)
            .min()
        {
            Some(p) => p,
            None => return false,
        };
        let victim = self
            .bundles
            .iter()
            .enumerate()
            .filter(|(_, b)| b.priority == lowest)
            .min_by_key(|(_, b)| b.created_at.raw_millis())
            .map(|(i, _)| i);

        match victim {
            Some(i) => {
                let b = self.bundles.swap_remove(i);
                debug!("dtn: evicted bundle {:08x} for higher-priority traffic", b.id);
                events.push(Event::BundleStatus {
                    id: b.id,
                    status: BundleStatus::Failed,
                });
                true
            }
            None => false,
        }
    }

    /// Marks a bundle delivered (end-to-end report or custody signal from the destination).
    pub fn on_ack(&mut self, bundle_id: u32, events: &mut EventQueue) {
        if let Some(i) = self.bundles.iter().position(|b| b.id == bundle_id) {
            self.bundles.swap_remove(i);
            self.stats.delivered += 1;
            events.push(Event::BundleStatus {
                id: bundle_id,
                status: BundleStatus::Delivered,
            });
        }
    }

    /// A peer just became reachable: try flushing bundles it can take.
    pub fn on_peer_reachable(
        &mut self,
        peer: NodeAddress,
        epidemic: bool,
        now: Instant,
        out: &mut Outbox,
        events: &mut EventQueue,
    ) {
        let mut i = 0;
        while i < self.bundles.len() {
            if self.bundles[i].status != BundleStatus::Pending || !self.bundles[i].is_complete() {
                i += 1;
                continue;
            }
            let direct = self.bundles[i].destination == peer;
            let opportunistic = epidemic
                || (self.bundles[i].flags.contains(BundleFlags::CUSTODY)
                    && self.bundles[i].source != peer);
            if direct || opportunistic {
                self.forward_to(i, peer, now, out);
                if self.release_if_in_transit(i, events) {
                    continue;
                }
            }
            i += 1;
        }
    }

    /// Frees a fire-and-forget bundle that was just handed to the mesh.
    fn release_if_in_transit(&mut self, i: usize, events: &mut EventQueue) -> bool {
        if self.bundles[i].status == BundleStatus::InTransit {
            let b = self.bundles.swap_remove(i);
            events.push(Event::BundleStatus {
                id: b.id,
                status: BundleStatus::InTransit,
            });
            true
        } else {
            false
        }
    }

    /// The periodic DTN update loop.
    pub fn tick(
        &mut self,
        now: Instant,
        epidemic: bool,
        neighbors: &NeighborTable,
        mut reachable: impl FnMut(NodeAddress) -> bool,
        out: &mut Outbox,
        events: &mut EventQueue,
    ) {
        // 1. Expire bundles past their TTL.
        let mut i = 0;
        while i < self.bundles.len() {
            if now.is_at_or_after(self.bundles[i].expires_at) {
                let b = self.bundles.swap_remove(i);
                debug!("dtn: bundle {:08x} expired", b.id);
                self.stats.expired += 1;
                events.push(Event::BundleStatus {
                    id: b.id,
                    status: BundleStatus::Expired,
                });
                continue;
            }
            i += 1;
        }

        // 2. Custody timers: reclaim bundles whose next custodian never answered.
        for b in self.bundles.iter_mut() {
            if b.status == BundleStatus::CustodyWait {
                if let Some(deadline) = b.custody_deadline {
                    if now.is_at_or_after(deadline) {
                        debug!("dtn: custody timeout for {:08x}, reclaiming", b.id);
                        b.status = BundleStatus::Pending;
                        b.custody_deadline = None;
                    }
                }
            }
        }

        // 3. Forwarding pass, in queue (priority) order. Partially reassembled bundles wait.
        let mut i = 0;
        while i < self.bundles.len() {
            if self.bundles[i].status != BundleStatus::Pending || !self.bundles[i].is_complete() {
                i += 1;
                continue;
            }
            let due = match self.bundles[i].last_attempt {
                None => true,
                Some(at) => now.duration_since(at) >= RETRY_INTERVAL,
            };
            if !due {
                i += 1;
                continue;
            }

            if self.bundles[i].attempts >= MAX_FORWARD_ATTEMPTS {
                let b = self.bundles.swap_remove(i);
                events.push(Event::BundleStatus {
                    id: b.id,
                    status: BundleStatus::Failed,
                });
                continue;
            }

            let dest = self.bundles[i].destination;
            if reachable(dest) {
                self.forward_to(i, dest, now, out);
                if self.release_if_in_transit(i, events) {
                    continue;
                }
            } else if epidemic || self.bundles[i].flags.contains(BundleFlags::EPIDEMIC) {
                let source = self.bundles[i].source;
                let mut copies = self.bundles[i].copies_sent;
                for n in neighbors.iter() {
                    if copies >= MAX_EPIDEMIC_COPIES {
                        break;
                    }
                    if n.address == source {
                        continue;
                    }
                    self.forward_to(i, n.address, now, out);
                    copies += 1;
                }
                self.bundles[i].copies_sent = copies;
            } else if self.bundles[i].flags.contains(BundleFlags::CUSTODY) {
                // Store-carry-forward: hand custody to the best-heard contact.
                let source = self.bundles[i].source;
                let next = neighbors
                    .iter()
                    .filter(|n| n.address != source)
                    .max_by_key(|n| n.quality())
                    .map(|n| n.address);
                if let Some(next) = next {
                    self.forward_to(i, next, now, out);
                }
            }
            i += 1;
        }
    }

    /// Emits the bundle (fragmented as needed) toward `to` and advances its state.
    fn forward_to(&mut self, i: usize, to: NodeAddress, now: Instant, out: &mut Outbox) {
        let remaining = {
            let b = &self.bundles[i];
            b.expires_at.duration_since(now).as_millis()
        };

        let len = usize::from(self.bundles[i].payload_len);
        let fragment_count = self.bundles[i].fragment_count;
        let fragmented = fragment_count > 1;
        let prio = match self.bundles[i].priority {
            BundlePriority::Emergency => PRIO_EMERGENCY,
            BundlePriority::Bulk => PRIO_BULK,
            _ => PRIO_DATA,
        };

        for frag in 0..fragment_count {
            let start = usize::from(frag) * FRAGMENT_SIZE;
            let end = (start + FRAGMENT_SIZE).min(len);

            let b = &self.bundles[i];
            let mut flags = b.flags;
            if fragmented {
                flags |= BundleFlags::FRAGMENT;
            }
            let header = BundleHeader {
                bundle_id: b.id,
                source: b.source,
                destination: b.destination,
                custodian: b.custodian,
                ttl_ms: remaining,
                payload_len: b.payload_len,
                flags,
                priority: b.priority as u8,
                fragment_offset: frag,
                fragment_count,
                hop_count: b.hop_count,
                max_hops: b.max_hops,
            };

            let mut buf = [0; MAX_PAYLOAD_LEN];
            buf[0] = DtnPacketType::Bundle.into();
            if header
                .to_bytes(&mut ByteWriter::new(&mut buf[1..1 + BUNDLE_HEADER_LEN]))
                .is_err()
            {
                return;
            }
            let chunk = &b.payload[start..end];
            buf[1 + BUNDLE_HEADER_LEN..1 + BUNDLE_HEADER_LEN + chunk.len()].copy_from_slice(chunk);

            let total = 1 + BUNDLE_HEADER_LEN + chunk.len();
            if out.unicast(to, PacketType::Bundle, &buf[..total], prio).is_err() {
                // Outbox congested; the retry interval covers us.
                return;
            }
            if fragmented {
                self.stats.fragments_sent += 1;
            }
        }

        let b = &mut self.bundles[i];
        b.attempts += 1;
        b.last_attempt = Some(now);
        self.stats.forwarded += 1;

        if b
            .flags
            .intersects(BundleFlags::CUSTODY | BundleFlags::REPORT_DELIVERY)
        {
            // Keep the bundle until the next custodian (or the destination) confirms.
            b.status = BundleStatus::CustodyWait;
            b.custody_deadline = Some(now + CUSTODY_TIMEOUT);
        } else if to == b.destination {
            // Handed to the mesh toward a reachable destination; the caller frees the slot.
            b.status = BundleStatus::InTransit;
        }
        // Epidemic copies stay PENDING and keep spreading.
    }

    /// Handles an incoming DTN frame (payload including the sub-type byte).
    pub fn handle_frame(
        &mut self,
        from: NodeAddress,
        payload: &[u8],
        now: Instant,
        out: &mut Outbox,
        events: &mut EventQueue,
    ) {
        let mut reader = ByteReader::new(payload);
        match reader.read_u8().map(DtnPacketType::from) {
            Ok(DtnPacketType::Bundle) => self.on_bundle(from, reader, now, out, events),
            Ok(DtnPacketType::Custody) => self.on_custody(reader, events),
            _ => {}
        }
    }

    fn on_bundle(
        &mut self,
        from: NodeAddress,
        mut reader: ByteReader<'_>,
        now: Instant,
        out: &mut Outbox,
        events: &mut EventQueue,
    ) {
        let header = match BundleHeader::from_bytes(&mut reader) {
            Ok(h) => h,
            Err(_) => return,
        };
        let chunk = reader.into_rest();
        let total_len = usize::from(header.payload_len);
        if total_len == 0 || total_len > MAX_BUNDLE_PAYLOAD {
            return;
        }
        if usize::from(header.fragment_count) > MAX_FRAGMENTS {
            return;
        }
        self.stats.received += 1;

        let existing = self.bundles.iter().position(|b| b.id == header.bundle_id);

        let slot = match existing {
            Some(i) => i,
            None => {
                if self.bundles.is_full()
                    && !self.evict_for(BundlePriority::from_raw(header.priority), events)
                {
                    if header.flags.contains(BundleFlags::CUSTODY) {
                        self.send_custody_signal(
                            header.bundle_id,
                            from,
                            false,
                            CUSTODY_REFUSED_NO_SPACE,
                            out,
                        );
                    }
                    return;
                }

                let for_us = header.destination == self.node;
                let bundle = Bundle {
                    id: header.bundle_id,
                    source: header.source,
                    destination: header.destination,
                    custodian: header.custodian,
                    priority: BundlePriority::from_raw(header.priority),
                    flags: header.flags & !BundleFlags::FRAGMENT,
                    payload: [0; MAX_BUNDLE_PAYLOAD],
                    payload_len: header.payload_len,
                    fragment_mask: 0,
                    fragment_count: header.fragment_count.max(1),
                    hop_count: header.hop_count.saturating_add(1),
                    max_hops: header.max_hops,
                    created_at: now,
                    expires_at: now + Duration::from_millis(header.ttl_ms),
                    last_attempt: None,
                    attempts: 0,
                    copies_sent: 0,
                    custody_deadline: None,
                    status: BundleStatus::Pending,
                };

                if !for_us && bundle.hop_count >= bundle.max_hops {
                    debug!("dtn: bundle {:08x} exceeded hop budget", header.bundle_id);
                    return;
                }

                self.insert_sorted(bundle);
                self.bundles
                    .iter()
                    .position(|b| b.id == header.bundle_id)
                    .unwrap()
            }
        };

        // Merge this fragment (an unfragmented bundle is fragment 0 of 1).
        {
            let b = &mut self.bundles[slot];
            let frag = header.fragment_offset;
            if usize::from(frag) >= usize::from(b.fragment_count) {
                return;
            }
            let start = usize::from(frag) * FRAGMENT_SIZE;
            let expected = if frag + 1 == b.fragment_count {
                total_len - start
            } else {
                FRAGMENT_SIZE
            };
            if chunk.len() != expected || start + chunk.len() > MAX_BUNDLE_PAYLOAD {
                return;
            }
            let bit = 1u8 << frag;
            if b.fragment_mask & bit == 0 {
                b.payload[start..start + chunk.len()].copy_from_slice(chunk);
                b.fragment_mask |= bit;
                if header.flags.contains(BundleFlags::FRAGMENT) {
                    self.stats.fragments_received += 1;
                }
            }
        }

        if !self.bundles[slot].is_complete() {
            return;
        }

        if self.bundles[slot].destination == self.node {
            // Final delivery.
            let b = self.bundles.swap_remove(slot);
            self.stats.delivered += 1;
            if b.flags.intersects(BundleFlags::CUSTODY | BundleFlags::REPORT_DELIVERY) {
                self.send_custody_signal(b.id, b.custodian, true, 0, out);
            }
            events.push(Event::BundleDelivered {
                id: b.id,
                source: b.source,
                data: Vec::from_slice(&b.payload[..usize::from(b.payload_len)])
                    .unwrap_or_default(),
            });
            return;
        }

        // Relay: take custody if asked, then wait for a forwarding opportunity.
        if existing.is_none() && self.bundles[slot].flags.contains(BundleFlags::CUSTODY) {
            let previous = self.bundles[slot].custodian;
            self.bundles[slot].custodian = self.node;
            self.stats.custody_transfers += 1;
            self.send_custody_signal(self.bundles[slot].id, previous, true, 0, out);
        }
    }

    fn on_custody(&mut self, mut reader: ByteReader<'_>, events: &mut EventQueue) {
        let signal = match CustodySignal::from_bytes(&mut reader) {
            Ok(s) => s,
            Err(_) => return,
        };

        let i = match self.bundles.iter().position(|b| b.id == signal.bundle_id) {
            Some(i) => i,
            None => return,
        };

        if signal.accepted {
            // Someone downstream holds it now (or the destination has it). Our copy is done.
            let b = self.bundles.swap_remove(i);
            self.stats.custody_transfers += 1;
            events.push(Event::BundleStatus {
                id: b.id,
                status: BundleStatus::Delivered,
            });
        } else {
            debug!(
                "dtn: custody refused for {:08x} (reason {})",
                signal.bundle_id, signal.reason
            );
            let b = &mut self.bundles[i];
            b.status = BundleStatus::Pending;
            b.custody_deadline = None;
        }
    }

    fn send_custody_signal(
        &self,
        bundle_id: u32,
        to: NodeAddress,
        accepted: bool,
        reason: u8,
        out: &mut Outbox,
    ) {
        if to == self.node || to.is_unspecified() {
            return;
        }
        let signal = CustodySignal {
            bundle_id,
            custodian: self.node,
            accepted,
            reason,
        };
        let mut buf = [0; 1 + 10];
        buf[0] = DtnPacketType::Custody.into();
        if signal
            .to_bytes(&mut ByteWriter::new(&mut buf[1..]))
            .is_err()
        {
            return;
        }
        let _ = out.unicast(to, PacketType::Bundle, &buf, PRIO_DATA);
    }

    /// Number of queued bundles.
    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }

    /// Number of bundles still awaiting a forwarding opportunity.
    pub fn pending_count(&self) -> usize {
        self.bundles
            .iter()
            .filter(|b| b.status == BundleStatus::Pending)
            .count()
    }

    /// Current status of a bundle, if it is still queued.
    pub fn status(&self, bundle_id: u32) -> Option<BundleStatus> {
        self.bundles
            .iter()
            .find(|b| b.id == bundle_id)
            .map(|b| b.status)
    }

    /// DTN statistics.
    pub fn stats(&self) -> DtnStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_rng::TestRng;

    fn at(ms: u32) -> Instant {
        Instant::from_raw_millis(ms)
    }

    fn no_events() -> EventQueue {
        EventQueue::new()
    }

    #[test]
    fn ttl_expiry_on_next_tick() {
        let mut rng = TestRng::new(1);
        let mut dtn = DtnManager::new(NodeAddress::new(0xA));
        let mut events = no_events();
        let id = dtn
            .queue(
                NodeAddress::new(0xD),
                b"payload",
                BundlePriority::Normal,
                Some(Duration::from_secs(10)),
                BundleFlags::empty(),
                at(0),
                &mut rng,
                &mut events,
            )
            .unwrap();

        let neighbors = NeighborTable::new();
        let mut out = Outbox::new();
        dtn.tick(at(9_999), false, &neighbors, |_| false, &mut out, &mut events);
        assert_eq!(dtn.len(), 1);

        dtn.tick(at(10_000), false, &neighbors, |_| false, &mut out, &mut events);
        assert!(dtn.is_empty());
        match events.pop() {
            Some(Event::BundleStatus { id: eid, status }) => {
                assert_eq!(eid, id);
                assert_eq!(status, BundleStatus::Expired);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn priority_eviction_picks_lowest_oldest() {
        let mut rng = TestRng::new(2);
        let mut dtn = DtnManager::new(NodeAddress::new(0xA));
        let mut events = no_events();

        let mut bulk_ids = std::vec::Vec::new();
        for i in 0..MAX_BUNDLES as u32 {
            let id = dtn
                .queue(
                    NodeAddress::new(0xD),
                    b"bulk",
                    BundlePriority::Bulk,
                    None,
                    BundleFlags::empty(),
                    at(i),
                    &mut rng,
                    &mut events,
                )
                .unwrap();
            bulk_ids.push(id);
        }

        // A same-priority newcomer is refused...
        assert_eq!(
            dtn.queue(
                NodeAddress::new(0xD),
                b"more bulk",
                BundlePriority::Bulk,
                None,
                BundleFlags::empty(),
                at(100),
                &mut rng,
                &mut events,
            ),
            Err(Error::CapacityExceeded)
        );

        // ...but an emergency bundle evicts the oldest bulk one.
        let sos = dtn
            .queue(
                NodeAddress::new(0xD),
                b"emergency",
                BundlePriority::Emergency,
                None,
                BundleFlags::empty(),
                at(101),
                &mut rng,
                &mut events,
            )
            .unwrap();
        assert_eq!(dtn.len(), MAX_BUNDLES);
        assert!(dtn.status(sos).is_some());
        assert!(dtn.status(bulk_ids[0]).is_none());
        assert!(dtn.status(bulk_ids[1]).is_some());
    }

    #[test]
    fn forwards_when_destination_reachable() {
        let mut rng = TestRng::new(3);
        let mut dtn = DtnManager::new(NodeAddress::new(0xA));
        let mut events = no_events();
        dtn.queue(
            NodeAddress::new(0xD),
            b"hello dtn",
            BundlePriority::Normal,
            None,
            BundleFlags::empty(),
            at(0),
            &mut rng,
            &mut events,
        )
        .unwrap();

        let neighbors = NeighborTable::new();
        let mut out = Outbox::new();
        dtn.tick(at(1), false, &neighbors, |d| d == NodeAddress::new(0xD), &mut out, &mut events);

        let frame = out.pop().expect("bundle frame queued");
        assert_eq!(frame.dest, NodeAddress::new(0xD));
        assert_eq!(frame.ty, PacketType::Bundle);
        assert_eq!(frame.payload[0], u8::from(DtnPacketType::Bundle));
    }

    #[test]
    fn fragment_reassembly_in_any_order() {
        let mut rng = TestRng::new(4);
        let src = NodeAddress::new(0xA);
        let dst = NodeAddress::new(0xD);

        // Sender fragments a 450-byte payload into 3 pieces.
        let mut payload = [0u8; 450];
        for (i, b) in payload.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut sender = DtnManager::new(src);
        let mut events = no_events();
        sender
            .queue(
                dst,
                &payload,
                BundlePriority::Normal,
                None,
                BundleFlags::empty(),
                at(0),
                &mut rng,
                &mut events,
            )
            .unwrap();

        let neighbors = NeighborTable::new();
        let mut out = Outbox::new();
        sender.tick(at(1), false, &neighbors, |_| true, &mut out, &mut events);

        let mut frames = std::vec::Vec::new();
        while let Some(f) = out.pop() {
            frames.push(f);
        }
        assert_eq!(frames.len(), 3);

        // Deliver them out of order.
        frames.swap(0, 2);
        let mut receiver = DtnManager::new(dst);
        let mut rx_out = Outbox::new();
        let mut rx_events = no_events();
        for f in &frames {
            receiver.handle_frame(src, &f.payload, at(10), &mut rx_out, &mut rx_events);
        }

        let mut delivered = None;
        while let Some(e) = rx_events.pop() {
            if let Event::BundleDelivered { data, .. } = e {
                delivered = Some(data);
            }
        }
        let data = delivered.expect("bundle delivered");
        assert_eq!(data.as_slice(), &payload[..]);
        assert_eq!(receiver.stats().fragments_received, 3);
    }

    #[test]
    fn custody_handoff_releases_the_sender() {
        let mut rng = TestRng::new(5);
        let a = NodeAddress::new(0xA);
        let b = NodeAddress::new(0xB);
        let d = NodeAddress::new(0xD);

        let mut dtn_a = DtnManager::new(a);
        let mut events_a = no_events();
        let id = dtn_a
            .queue(
                d,
                b"carried by custody",
                BundlePriority::Normal,
                None,
                BundleFlags::CUSTODY,
                at(0),
                &mut rng,
                &mut events_a,
            )
            .unwrap();

        // B comes into range (as a neighbor, not a route to D).
        let mut neighbors = NeighborTable::new();
        neighbors.record(b, -70, 8, at(1));
        let mut out_a = Outbox::new();
        dtn_a.tick(at(2), false, &neighbors, |_| false, &mut out_a, &mut events_a);
        assert_eq!(dtn_a.status(id), Some(BundleStatus::CustodyWait));

        let frame = out_a.pop().expect("custody forward");
        assert_eq!(frame.dest, b);

        // B stores the bundle, takes custody and answers with a custody signal.
        let mut dtn_b = DtnManager::new(b);
        let mut out_b = Outbox::new();
        let mut events_b = no_events();
        dtn_b.handle_frame(a, &frame.payload, at(3), &mut out_b, &mut events_b);
        assert_eq!(dtn_b.status(id), Some(BundleStatus::Pending));

        let signal = out_b.pop().expect("custody signal");
        assert_eq!(signal.dest, a);

        // A processes the acceptance: its copy is done, the slot is free.
        dtn_a.handle_frame(b, &signal.payload, at(4), &mut out_a, &mut events_a);
        assert_eq!(dtn_a.status(id), None);
        assert!(dtn_a.is_empty());
    }

    #[test]
    fn custody_timeout_restores_pending() {
        let mut rng = TestRng::new(6);
        let a = NodeAddress::new(0xA);
        let b = NodeAddress::new(0xB);

        let mut dtn = DtnManager::new(a);
        let mut events = no_events();
        let id = dtn
            .queue(
                NodeAddress::new(0xD),
                b"unanswered",
                BundlePriority::Normal,
                None,
                BundleFlags::CUSTODY,
                at(0),
                &mut rng,
                &mut events,
            )
            .unwrap();

        let mut neighbors = NeighborTable::new();
        neighbors.record(b, -70, 8, at(1));
        let mut out = Outbox::new();
        dtn.tick(at(2), false, &neighbors, |_| false, &mut out, &mut events);
        assert_eq!(dtn.status(id), Some(BundleStatus::CustodyWait));

        dtn.tick(
            at(2 + CUSTODY_TIMEOUT.as_millis()),
            false,
            &neighbors,
            |_| false,
            &mut out,
            &mut events,
        );
        assert_eq!(dtn.status(id), Some(BundleStatus::Pending));
    }

    #[test]
    fn epidemic_mode_copies_to_neighbors() {
        let mut rng = TestRng::new(7);
        let mut dtn = DtnManager::new(NodeAddress::new(0xA));
        let mut events = no_events();
        dtn.queue(
            NodeAddress::new(0xD),
            b"spread me",
            BundlePriority::Normal,
            None,
            BundleFlags::empty(),
            at(0),
            &mut rng,
            &mut events,
        )
        .unwrap();

        let mut neighbors = NeighborTable::new();
        for i in 1..=5u32 {
            neighbors.record(NodeAddress::new(0xB0 + i), -70, 8, at(1));
        }

        let mut out = Outbox::new();
        dtn.tick(at(2), true, &neighbors, |_| false, &mut out, &mut events);

        let mut copies = 0;
        while out.pop().is_some() {
            copies += 1;
        }
        assert_eq!(copies, MAX_EPIDEMIC_COPIES as usize);
    }
}
