//! The routing core: per-destination next-hop table and AODV-style discovery.
//!
//! Routes are learned three ways:
//! * **Reactively**: a missing route triggers a broadcast `ROUTE_REQ`; the target (or nothing)
//!   answers with a unicast `ROUTE_REP` that installs the forward route at every node it passes.
//! * **Passively**: the reverse route to a request's originator is installed while the request
//!   floods outward, and any directly-received frame (hop count 0) installs a one-hop route.
//! * **Negatively**: `ROUTE_ERR` invalidates a broken route at every node that carries it.
//!
//! Entries expire after the route timeout and are evicted least-recently-used when the table is
//! full. All discovery frames carry a `relayed_by` field naming the node that last put them on
//! air, since the outer header only names the original source.

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::neighbors::NeighborTable;
use crate::packet::{Header, NodeAddress};
use crate::time::{Duration, Instant};
use crate::Error;
use heapless::Vec;

/// Maximum routing table entries.
pub const MAX_ROUTES: usize = 32;

/// Size of the recent-request dedup window.
pub const SEEN_REQUESTS: usize = 16;

/// Size of the broadcast dedup window.
pub const SEEN_BROADCASTS: usize = 16;

/// One next-hop entry.
#[derive(Debug, Copy, Clone)]
pub struct RouteEntry {
    /// Final destination this entry routes towards.
    pub destination: NodeAddress,
    /// Neighbor to hand frames for `destination` to.
    pub next_hop: NodeAddress,
    /// Number of hops to the destination, as learned from discovery.
    pub hop_count: u8,
    /// Link quality metric of the first hop at learn time.
    pub quality: u8,
    /// Last time this entry was installed, refreshed or used.
    pub last_used: Instant,
}

/// Route discovery request payload, broadcast-flooded.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    /// Originator-assigned id; `(source, request_id)` dedups the flood.
    pub request_id: u32,
    /// The node a route is wanted for.
    pub target: NodeAddress,
    /// The node that last rebroadcast this request.
    pub relayed_by: NodeAddress,
    /// Hops travelled so far.
    pub hop_count: u8,
}

impl ToBytes for RouteRequest {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u32_le(self.request_id)?;
        writer.write_u32_le(self.target.raw())?;
        writer.write_u32_le(self.relayed_by.raw())?;
        writer.write_u8(self.hop_count)
    }
}

impl<'a> FromBytes<'a> for RouteRequest {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(RouteRequest {
            request_id: bytes.read_u32_le()?,
            target: NodeAddress::new(bytes.read_u32_le()?),
            relayed_by: NodeAddress::new(bytes.read_u32_le()?),
            hop_count: bytes.read_u8()?,
        })
    }
}

/// Route discovery reply payload, unicast back along the reverse path.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RouteReply {
    /// Id of the request being answered.
    pub request_id: u32,
    /// The destination the installed route leads to (the reply's originator).
    pub target: NodeAddress,
    /// The node that last forwarded this reply.
    pub relayed_by: NodeAddress,
    /// Hops between `relayed_by` and `target`.
    pub hop_count: u8,
    /// First-hop link quality at the target.
    pub quality: u8,
}

impl ToBytes for RouteReply {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u32_le(self.request_id)?;
        writer.write_u32_le(self.target.raw())?;
        writer.write_u32_le(self.relayed_by.raw())?;
        writer.write_u8(self.hop_count)?;
        writer.write_u8(self.quality)
    }
}

impl<'a> FromBytes<'a> for RouteReply {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(RouteReply {
            request_id: bytes.read_u32_le()?,
            target: NodeAddress::new(bytes.read_u32_le()?),
            relayed_by: NodeAddress::new(bytes.read_u32_le()?),
            hop_count: bytes.read_u8()?,
            quality: bytes.read_u8()?,
        })
    }
}

/// Route invalidation payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RouteErrorNotice {
    /// The destination that became unreachable.
    pub unreachable: NodeAddress,
    /// The next hop that failed, for diagnostics.
    pub failed_next_hop: NodeAddress,
}

impl ToBytes for RouteErrorNotice {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u32_le(self.unreachable.raw())?;
        writer.write_u32_le(self.failed_next_hop.raw())
    }
}

impl<'a> FromBytes<'a> for RouteErrorNotice {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(RouteErrorNotice {
            unreachable: NodeAddress::new(bytes.read_u32_le()?),
            failed_next_hop: NodeAddress::new(bytes.read_u32_le()?),
        })
    }
}

/// What to do with a received route request.
#[derive(Debug, PartialEq, Eq)]
pub enum RequestAction {
    /// We are the target: unicast this reply to the originator via `next_hop`.
    Reply {
        reply: RouteReply,
        next_hop: NodeAddress,
    },
    /// Rebroadcast the updated request.
    Rebroadcast(RouteRequest),
    /// Duplicate or dead-end request; do nothing.
    Ignore,
}

/// What to do with a received route reply.
#[derive(Debug, PartialEq, Eq)]
pub enum ReplyAction {
    /// Forward the updated reply towards the originator via `next_hop`.
    Forward {
        reply: RouteReply,
        next_hop: NodeAddress,
    },
    /// The reply reached its originator (us); the route is installed.
    Arrived,
    /// No reverse route; the reply dies here.
    Ignore,
}

struct SeenRequest {
    originator: NodeAddress,
    request_id: u32,
}

struct SeenBroadcast {
    source: NodeAddress,
    packet_id: u16,
}

/// The routing table plus discovery state.
pub struct Router {
    routes: Vec<RouteEntry, MAX_ROUTES>,
    seen_requests: Vec<SeenRequest, SEEN_REQUESTS>,
    seen_requests_cursor: usize,
    seen_broadcasts: Vec<SeenBroadcast, SEEN_BROADCASTS>,
    seen_broadcasts_cursor: usize,
    next_request_id: u32,
}

impl Router {
    pub fn new() -> Self {
        Router {
            routes: Vec::new(),
            seen_requests: Vec::new(),
            seen_requests_cursor: 0,
            seen_broadcasts: Vec::new(),
            seen_broadcasts_cursor: 0,
            next_request_id: 1,
        }
    }

    /// Looks up the next hop towards `dest`, refreshing the entry's use time.
    ///
    /// Direct neighbors are always reached directly, without consuming a table entry.
    pub fn next_hop(
        &mut self,
        dest: NodeAddress,
        neighbors: &NeighborTable,
        now: Instant,
    ) -> Option<NodeAddress> {
        if neighbors.contains(dest) {
            return Some(dest);
        }
        let entry = self.routes.iter_mut().find(|r| r.destination == dest)?;
        entry.last_used = now;
        Some(entry.next_hop)
    }

    /// Like [`next_hop`](Self::next_hop) but without refreshing use times.
    pub fn has_route(&self, dest: NodeAddress, neighbors: &NeighborTable) -> bool {
        neighbors.contains(dest) || self.routes.iter().any(|r| r.destination == dest)
    }

    /// Installs or refreshes a route. Keeps an existing entry when it is strictly shorter.
    pub fn install(
        &mut self,
        destination: NodeAddress,
        next_hop: NodeAddress,
        hop_count: u8,
        quality: u8,
        now: Instant,
    ) {
        if destination.is_broadcast() || destination.is_unspecified() {
            return;
        }

        if let Some(entry) = self.routes.iter_mut().find(|r| r.destination == destination) {
            if hop_count <= entry.hop_count || entry.next_hop == next_hop {
                entry.next_hop = next_hop;
                entry.hop_count = hop_count;
                entry.quality = quality;
            }
            entry.last_used = now;
            return;
        }

        if self.routes.is_full() {
            // LRU eviction.
            let victim = self
                .routes
                .iter()
                .enumerate()
                .max_by_key(|(_, r)| now.duration_since(r.last_used).as_millis())
                .map(|(i, _)| i);
            if let Some(i) = victim {
                self.routes.swap_remove(i);
            }
        }

        let _ = self.routes.push(RouteEntry {
            destination,
            next_hop,
            hop_count,
            quality,
            last_used: now,
        });
    }

    /// Installs the one-hop route for a frame received directly from its source.
    pub fn install_direct(&mut self, source: NodeAddress, quality: u8, now: Instant) {
        self.install(source, source, 1, quality, now);
    }

    /// Removes the route to `dest`. Returns whether one existed.
    pub fn invalidate(&mut self, dest: NodeAddress) -> bool {
        if let Some(i) = self.routes.iter().position(|r| r.destination == dest) {
            self.routes.swap_remove(i);
            true
        } else {
            false
        }
    }

    /// Drops entries unused for longer than `timeout`.
    pub fn expire(&mut self, now: Instant, timeout: Duration) {
        let mut i = 0;
        while i < self.routes.len() {
            if now.duration_since(self.routes[i].last_used) > timeout {
                self.routes.swap_remove(i);
            } else {
                i += 1;
            }
        }
    }

    /// Starts a discovery for `target`, returning the request to broadcast.
    pub fn make_discovery(&mut self, target: NodeAddress, our: NodeAddress) -> RouteRequest {
        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);
        // Record our own request so the flood coming back at us is ignored.
        self.note_request(our, request_id);
        RouteRequest {
            request_id,
            target,
            relayed_by: our,
            hop_count: 0,
        }
    }

    /// Processes a received route request.
    ///
    /// `quality` is the link quality towards the neighbor the request arrived from, stored with
    /// the reverse route.
    pub fn handle_request(
        &mut self,
        header: &Header,
        req: &RouteRequest,
        our: NodeAddress,
        quality: u8,
        now: Instant,
    ) -> RequestAction {
        if header.source == our || !self.note_request(header.source, req.request_id) {
            return RequestAction::Ignore;
        }

        // Reverse route to the originator, through whoever relayed the request to us.
        self.install(
            header.source,
            req.relayed_by,
            req.hop_count.saturating_add(1),
            quality,
            now,
        );

        if req.target == our {
            RequestAction::Reply {
                reply: RouteReply {
                    request_id: req.request_id,
                    target: our,
                    relayed_by: our,
                    hop_count: 0,
                    quality,
                },
                next_hop: req.relayed_by,
            }
        } else if header.ttl > 1 {
            RequestAction::Rebroadcast(RouteRequest {
                request_id: req.request_id,
                target: req.target,
                relayed_by: our,
                hop_count: req.hop_count.saturating_add(1),
            })
        } else {
            RequestAction::Ignore
        }
    }

    /// Processes a received route reply addressed to `header.destination`.
    pub fn handle_reply(
        &mut self,
        header: &Header,
        rep: &RouteReply,
        our: NodeAddress,
        now: Instant,
    ) -> ReplyAction {
        // Forward route to the target, through whoever relayed the reply to us.
        self.install(
            rep.target,
            rep.relayed_by,
            rep.hop_count.saturating_add(1),
            rep.quality,
            now,
        );

        if header.destination == our {
            return ReplyAction::Arrived;
        }

        // Continue along the reverse route installed by the request flood.
        match self.routes.iter().find(|r| r.destination == header.destination) {
            Some(entry) => ReplyAction::Forward {
                reply: RouteReply {
                    request_id: rep.request_id,
                    target: rep.target,
                    relayed_by: our,
                    hop_count: rep.hop_count.saturating_add(1),
                    quality: rep.quality,
                },
                next_hop: entry.next_hop,
            },
            None => ReplyAction::Ignore,
        }
    }

    /// Processes a route error, invalidating the named route.
    pub fn handle_error(&mut self, err: &RouteErrorNotice) -> bool {
        self.invalidate(err.unreachable)
    }

    /// Records `(source, packet_id)` of a broadcast; returns `false` for re-seen broadcasts.
    pub fn note_broadcast(&mut self, source: NodeAddress, packet_id: u16) -> bool {
        if self
            .seen_broadcasts
            .iter()
            .any(|s| s.source == source && s.packet_id == packet_id)
        {
            return false;
        }

        let entry = SeenBroadcast { source, packet_id };
        if self.seen_broadcasts.is_full() {
            self.seen_broadcasts[self.seen_broadcasts_cursor] = entry;
            self.seen_broadcasts_cursor = (self.seen_broadcasts_cursor + 1) % SEEN_BROADCASTS;
        } else {
            let _ = self.seen_broadcasts.push(entry);
        }
        true
    }

    /// Records `(originator, request_id)`; returns `false` for re-seen requests.
    fn note_request(&mut self, originator: NodeAddress, request_id: u32) -> bool {
        if self
            .seen_requests
            .iter()
            .any(|s| s.originator == originator && s.request_id == request_id)
        {
            return false;
        }

        let entry = SeenRequest {
            originator,
            request_id,
        };
        if self.seen_requests.is_full() {
            self.seen_requests[self.seen_requests_cursor] = entry;
            self.seen_requests_cursor = (self.seen_requests_cursor + 1) % SEEN_REQUESTS;
        } else {
            let _ = self.seen_requests.push(entry);
        }
        true
    }

    /// Iterates over the current routing table.
    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.routes.iter()
    }

    /// Number of installed routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
