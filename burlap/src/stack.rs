//! The mesh stack: wires every component together behind two entry points.
//!
//! The host drives a [`MeshStack`] from a single logical execution context:
//!
//! * [`MeshStack::tick`] is called from the main loop at 100 Hz or more. Every deadline in the
//!   system (ACK timeouts, handshake retries, bundle TTLs, keepalives, beacons, SOS repeats) is
//!   a stored [`Instant`] checked here; nothing ever blocks.
//! * [`MeshStack::on_frame`] is called for every received frame, after the radio driver has
//!   copied it out of hardware buffers, with the measured RSSI/SNR.
//!
//! Inbound frames are decoded once and dispatched by type into the MAC (time sync), routing
//! (discovery), the secure link, the group channel, the DTN queue, the emergency tracker or the
//! geographic helper. Outbound traffic flows the other way: components never touch the radio,
//! they append sub-frames to an [`Outbox`] and events to an [`EventQueue`]; the stack resolves
//! next hops, assembles full frames into the MAC's priority queue, and replays events into the
//! host's [`Host`] implementation.
//!
//! [`Instant`]: ../time/struct.Instant.html

use crate::adr::{Adr, AdrAdvertisement};
use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::config::{Config, ProtocolConfig};
use crate::dtn::{BundleFlags, BundlePriority, BundleStatus, DtnManager, MAX_BUNDLE_PAYLOAD};
use crate::emergency::{Emergency, EmergencyKind, SosMessage};
use crate::geo::{GeoRouting, GeocastRegion, Position};
use crate::group::{GroupManager, GROUP_KEY_LEN};
use crate::history::{Direction, MessageLog};
use crate::link::{LinkId, LinkManager, LinkState};
use crate::mac::{Mac, QueuedFrame, TimeSync, TIME_SYNC_INTERVAL};
use crate::naming::{NameDirectory, NameOrAddress};
use crate::neighbors::{Neighbor, NeighborTable};
use crate::packet::{
    self, Flags, Header, NodeAddress, PacketBuf, PacketType, MAX_PAYLOAD_LEN,
};
use crate::phy::{Radio, SpreadingFactor, TxResult};
use crate::relay::{AckShim, RelayAction};
use crate::route::{
    ReplyAction, RequestAction, RouteEntry, RouteErrorNotice, RouteReply, RouteRequest, Router,
};
use crate::time::{Instant, Timer};
use crate::Error;
use heapless::{Deque, Vec};

/// Background traffic (bulk bundles).
pub(crate) const PRIO_BULK: u8 = 0;
/// Ordinary data.
pub(crate) const PRIO_DATA: u8 = 1;
/// Protocol control traffic (handshakes, discovery, sync).
pub(crate) const PRIO_CONTROL: u8 = 2;
/// Emergency traffic overrides everything.
pub(crate) const PRIO_EMERGENCY: u8 = 3;

/// TX power assumed/restored outside SOS overrides.
const DEFAULT_TX_POWER: i8 = 20;

/// Pending sub-frames and events between component calls and the end of the entry point.
const OUTBOX_LEN: usize = 8;
const EVENT_QUEUE_LEN: usize = 8;

/// A component-produced sub-frame waiting to be wrapped into a mesh frame.
pub struct OutFrame {
    pub dest: NodeAddress,
    pub ty: PacketType,
    pub flags: Flags,
    /// Hop budget override; `None` uses the configured maximum.
    pub ttl: Option<u8>,
    pub priority: u8,
    /// Per-frame spreading factor override (SOS uses SF12).
    pub sf: Option<SpreadingFactor>,
    /// Per-frame TX power override.
    pub tx_power: Option<i8>,
    pub payload: Vec<u8, MAX_PAYLOAD_LEN>,
}

impl OutFrame {
    pub(crate) fn unicast(
        dest: NodeAddress,
        ty: PacketType,
        payload: &[u8],
        priority: u8,
    ) -> OutFrame {
        debug_assert!(payload.len() <= MAX_PAYLOAD_LEN);
        OutFrame {
            dest,
            ty,
            flags: Flags::empty(),
            ttl: None,
            priority,
            sf: None,
            tx_power: None,
            payload: Vec::from_slice(payload).unwrap_or_default(),
        }
    }

    pub(crate) fn broadcast(ty: PacketType, payload: &[u8], priority: u8) -> OutFrame {
        let mut frame = Self::unicast(NodeAddress::BROADCAST, ty, payload, priority);
        frame.flags = Flags::BROADCAST;
        frame
    }
}

/// FIFO of sub-frames emitted by components during one entry point.
pub struct Outbox {
    frames: Deque<OutFrame, OUTBOX_LEN>,
}

impl Outbox {
    pub(crate) fn new() -> Self {
        Outbox {
            frames: Deque::new(),
        }
    }

    pub(crate) fn push(&mut self, frame: OutFrame) -> Result<(), Error> {
        self.frames
            .push_back(frame)
            .map_err(|_| Error::CapacityExceeded)
    }

    pub(crate) fn unicast(
        &mut self,
        dest: NodeAddress,
        ty: PacketType,
        payload: &[u8],
        priority: u8,
    ) -> Result<(), Error> {
        self.push(OutFrame::unicast(dest, ty, payload, priority))
    }

    pub(crate) fn broadcast(
        &mut self,
        ty: PacketType,
        payload: &[u8],
        priority: u8,
    ) -> Result<(), Error> {
        self.push(OutFrame::broadcast(ty, payload, priority))
    }

    pub(crate) fn pop(&mut self) -> Option<OutFrame> {
        self.frames.pop_front()
    }
}

/// Something a component wants the host to know.
#[derive(Debug)]
pub enum Event {
    MessageReceived {
        from: NodeAddress,
        data: Vec<u8, MAX_PAYLOAD_LEN>,
    },
    DeliveryFailed {
        packet_id: u16,
        dest: NodeAddress,
    },
    LinkEstablished {
        peer: NodeAddress,
    },
    LinkClosed {
        peer: NodeAddress,
    },
    LinkData {
        peer: NodeAddress,
        data: Vec<u8, MAX_PAYLOAD_LEN>,
    },
    GroupMessage {
        group_id: u32,
        sender: NodeAddress,
        data: Vec<u8, MAX_PAYLOAD_LEN>,
    },
    BundleDelivered {
        id: u32,
        source: NodeAddress,
        data: Vec<u8, MAX_BUNDLE_PAYLOAD>,
    },
    BundleStatus {
        id: u32,
        status: BundleStatus,
    },
    SosReceived {
        from: NodeAddress,
        message: SosMessage,
    },
    SosCleared {
        from: NodeAddress,
    },
    GeocastReceived {
        source: NodeAddress,
        data: Vec<u8, MAX_PAYLOAD_LEN>,
    },
    TelemetryReceived {
        from: NodeAddress,
        telemetry: Telemetry,
    },
}

/// FIFO of pending host notifications.
pub struct EventQueue {
    events: Deque<Event, EVENT_QUEUE_LEN>,
}

impl EventQueue {
    pub(crate) fn new() -> Self {
        EventQueue {
            events: Deque::new(),
        }
    }

    /// Appends an event; when the host lags behind, the oldest notification is lost.
    pub(crate) fn push(&mut self, event: Event) {
        if let Err(event) = self.events.push_back(event) {
            let _ = self.events.pop_front();
            let _ = self.events.push_back(event);
        }
    }

    pub(crate) fn pop(&mut self) -> Option<Event> {
        self.events.pop_front()
    }
}

/// Callbacks into the application. All methods default to doing nothing.
///
/// Invoked synchronously at the end of `tick`/`on_frame`, from the same execution context.
pub trait Host {
    /// A user data frame addressed to this node (or broadcast) arrived.
    fn on_message(&mut self, _from: NodeAddress, _data: &[u8]) {}

    /// An ACK-requested send exhausted its retries.
    fn on_delivery_failed(&mut self, _packet_id: u16, _dest: NodeAddress) {}

    /// A secure link reached the ACTIVE state.
    fn on_link_established(&mut self, _peer: NodeAddress) {}

    /// A secure link was torn down (reject, proof mismatch, idle reap or explicit close).
    fn on_link_closed(&mut self, _peer: NodeAddress) {}

    /// Decrypted application data arrived over a secure link.
    fn on_link_data(&mut self, _peer: NodeAddress, _data: &[u8]) {}

    /// A group message was decrypted and accepted.
    fn on_group_message(&mut self, _group_id: u32, _sender: NodeAddress, _data: &[u8]) {}

    /// A bundle addressed to this node was fully reassembled.
    fn on_bundle_delivered(&mut self, _id: u32, _source: NodeAddress, _data: &[u8]) {}

    /// A queued bundle changed state (in transit, delivered, expired, failed).
    fn on_bundle_status(&mut self, _id: u32, _status: BundleStatus) {}

    /// A new SOS alert from another node.
    fn on_sos(&mut self, _from: NodeAddress, _message: &SosMessage) {}

    /// A previously tracked SOS was cancelled.
    fn on_sos_cleared(&mut self, _from: NodeAddress) {}

    /// A geocast was delivered to this node's region.
    fn on_geocast(&mut self, _source: NodeAddress, _data: &[u8]) {}

    /// A telemetry report arrived.
    fn on_telemetry(&mut self, _from: NodeAddress, _telemetry: &Telemetry) {}
}

/// Node status report payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Telemetry {
    /// Battery percentage.
    pub battery: u8,
    /// Temperature in tenths of a degree Celsius.
    pub temperature: i16,
    /// Uptime in seconds.
    pub uptime_s: u32,
    pub packets_sent: u16,
    pub packets_received: u16,
}

impl ToBytes for Telemetry {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.battery)?;
        writer.write_i16_le(self.temperature)?;
        writer.write_u32_le(self.uptime_s)?;
        writer.write_u16_le(self.packets_sent)?;
        writer.write_u16_le(self.packets_received)
    }
}

impl<'a> FromBytes<'a> for Telemetry {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(Telemetry {
            battery: bytes.read_u8()?,
            temperature: bytes.read_i16_le()?,
            uptime_s: bytes.read_u32_le()?,
            packets_sent: bytes.read_u16_le()?,
            packets_received: bytes.read_u16_le()?,
        })
    }
}

/// Neighbor probe payload.
struct Hello {
    neighbor_count: u8,
    last_rssi: i16,
    last_snr: i8,
}

impl ToBytes for Hello {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.neighbor_count)?;
        writer.write_i16_le(self.last_rssi)?;
        writer.write_i8(self.last_snr)
    }
}

/// Periodic announcement payload: name, slot claim and ADR advertisement.
struct Beacon {
    capabilities: u8,
    stamp: u32,
    claimed_slot: u8,
    adr: AdrAdvertisement,
    name_len: u8,
}

impl Beacon {
    fn encode(&self, name: &str, buf: &mut [u8]) -> Result<usize, Error> {
        let buf_len = buf.len();
        let mut w = ByteWriter::new(buf);
        w.write_u8(self.capabilities)?;
        w.write_u32_le(self.stamp)?;
        w.write_u8(self.claimed_slot)?;
        self.adr.to_bytes(&mut w)?;
        w.write_u8(self.name_len)?;
        w.write_slice(&name.as_bytes()[..usize::from(self.name_len)])?;
        Ok(buf_len - w.space_left())
    }
}

/// Error counters, exposed to the host for diagnostics.
///
/// Transient and input errors never reach the application; they end up here.
#[derive(Debug, Copy, Clone, Default)]
pub struct Counters {
    pub rx_frames: u32,
    pub tx_frames: u32,
    pub dropped_too_short: u32,
    pub dropped_bad_version: u32,
    pub dropped_unknown_type: u32,
    pub dropped_bad_length: u32,
    pub dropped_duplicate: u32,
    pub dropped_ttl_exhausted: u32,
    pub forwarded: u32,
    pub rebroadcast: u32,
    pub no_route: u32,
    pub delivery_failures: u32,
    pub outbox_overflow: u32,
}

/// Failures surfaced directly to the caller of a send operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SendError {
    /// No route to the destination; a discovery has been started.
    NoRoute,
    /// A queue or table had no room.
    QueueFull,
    /// The payload exceeds the configured maximum.
    TooLong,
}

/// The assembled mesh node.
///
/// See the module docs for the execution model.
pub struct MeshStack<C: Config> {
    node: NodeAddress,
    cfg: ProtocolConfig,

    timer: C::Timer,
    radio: C::Radio,
    rng: C::Rng,
    store: C::Store,

    mac: Mac,
    neighbors: NeighborTable,
    adr: Adr,
    router: Router,
    relay: AckShim,
    links: LinkManager,
    groups: GroupManager,
    dtn: DtnManager,
    emergency: Emergency,
    geo: GeoRouting,
    naming: NameDirectory,
    history: MessageLog,

    outbox: Outbox,
    events: EventQueue,
    counters: Counters,

    next_packet_id: u16,
    next_seq: u8,
    current_sf: SpreadingFactor,
    battery: u8,
    temperature: i16,
    boot_time: Instant,
    last_beacon: Option<Instant>,
    last_time_sync: Option<Instant>,
}

impl<C: Config> MeshStack<C> {
    /// Builds the stack. `node` is the stable address derived from the long-term identity key.
    pub fn new(
        node: NodeAddress,
        cfg: ProtocolConfig,
        timer: C::Timer,
        mut radio: C::Radio,
        rng: C::Rng,
        store: C::Store,
    ) -> Self {
        let now = timer.now();
        radio.set_spreading_factor(cfg.default_sf);

        let mut groups = GroupManager::new(node);
        groups.load(&store, now);
        let mut naming = NameDirectory::new(node);
        naming.load(&store, now);

        info!("stack: node {} up", node);
        MeshStack {
            node,
            cfg,
            timer,
            radio,
            rng,
            store,
            mac: Mac::new(node, now),
            neighbors: NeighborTable::new(),
            adr: Adr::new(cfg.default_sf, now),
            router: Router::new(),
            relay: AckShim::new(),
            links: LinkManager::new(node, cfg.forward_secrecy),
            groups,
            dtn: DtnManager::new(node),
            emergency: Emergency::new(),
            geo: GeoRouting::new(),
            naming,
            history: MessageLog::new(),
            outbox: Outbox::new(),
            events: EventQueue::new(),
            counters: Counters::default(),
            next_packet_id: 0,
            next_seq: 0,
            current_sf: cfg.default_sf,
            battery: 100,
            temperature: 0,
            boot_time: now,
            last_beacon: None,
            last_time_sync: None,
        }
    }

    /// This node's address.
    pub fn node(&self) -> NodeAddress {
        self.node
    }

    /// Error counters.
    pub fn counters(&self) -> Counters {
        self.counters
    }

    // ------------------------------------------------------------------
    // Entry points
    // ------------------------------------------------------------------

    /// Drives every deadline in the stack. Call at 100 Hz or more.
    pub fn tick(&mut self, host: &mut dyn Host) {
        let now = self.timer.now();

        self.pump_radio(now);
        self.run_relay(now);

        self.neighbors.expire(now, self.cfg.route_timeout);
        self.router.expire(now, self.cfg.route_timeout);
        self.adr.evaluate(now);

        self.links.tick(now, &mut self.outbox, &mut self.events);
        self.run_dtn(now);
        self.emergency.tick(now, &mut self.outbox);
        self.geo.tick(now, &mut self.outbox);

        self.periodic_beacons(now);

        self.flush_outbox(now);
        self.drain_events(host);
    }

    /// Feeds one received frame into the stack.
    ///
    /// Must be called from the same execution context as `tick`, after the driver has copied the
    /// frame out of hardware buffers.
    pub fn on_frame(&mut self, bytes: &[u8], rssi: i16, snr: i8, host: &mut dyn Host) {
        let now = self.timer.now();
        self.counters.rx_frames += 1;

        let (header, payload) = match packet::decode(bytes) {
            Ok(parts) => parts,
            Err(e) => {
                match e {
                    Error::TooShort => self.counters.dropped_too_short += 1,
                    Error::UnsupportedVersion => self.counters.dropped_bad_version += 1,
                    Error::UnknownType => self.counters.dropped_unknown_type += 1,
                    _ => self.counters.dropped_bad_length += 1,
                }
                trace!("rx: dropped undecodable frame ({})", e);
                return;
            }
        };

        if header.source == self.node {
            // Our own transmission echoed back through the mesh.
            return;
        }

        self.mac.note_activity(now);
        self.mac.observe_transmitter(header.source, now);

        let first_contact = self.neighbors.record(header.source, rssi, snr, now);
        self.adr.record_rx(header.source, rssi, snr, now);

        // Passive learning: a direct transmission is a one-hop route to its source.
        if header.hop_count == 0 {
            let quality = self
                .neighbors
                .get(header.source)
                .map(|n| n.quality())
                .unwrap_or(0);
            self.router.install_direct(header.source, quality, now);
        }

        if first_contact {
            // A new contact is a forwarding opportunity for stored bundles.
            let epidemic = self.cfg.epidemic_mode;
            self.dtn.on_peer_reachable(
                header.source,
                epidemic,
                now,
                &mut self.outbox,
                &mut self.events,
            );
        }

        if header.is_broadcast() {
            if !self.router.note_broadcast(header.source, header.packet_id) {
                self.counters.dropped_duplicate += 1;
                return;
            }
            self.dispatch_local(&header, payload, rssi, snr, now);
            self.maybe_rebroadcast(&header, payload);
        } else if header.destination == self.node {
            self.dispatch_local(&header, payload, rssi, snr, now);
        } else if header.next_hop == self.node {
            self.relay_unicast(&header, payload, now);
        }
        // Anything else was merely overheard; passive learning already took its cut.

        self.flush_outbox(now);
        self.drain_events(host);
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Sends a user data frame to `dest`, optionally with end-to-end acknowledgment.
    ///
    /// Returns the assigned packet id. With `want_ack`, final delivery failure is reported via
    /// [`Host::on_delivery_failed`] after the retry budget is spent.
    pub fn send_message(
        &mut self,
        dest: NodeAddress,
        data: &[u8],
        want_ack: bool,
    ) -> Result<u16, SendError> {
        if data.len() > usize::from(self.cfg.max_payload) || data.len() > MAX_PAYLOAD_LEN {
            return Err(SendError::TooLong);
        }
        if dest.is_broadcast() {
            return self.send_broadcast(data);
        }
        let now = self.timer.now();

        let next_hop = match self.router.next_hop(dest, &self.neighbors, now) {
            Some(nh) => nh,
            None => {
                self.start_discovery(dest, now);
                self.counters.no_route += 1;
                return Err(SendError::NoRoute);
            }
        };

        let flags = if want_ack {
            Flags::ACK_REQ
        } else {
            Flags::empty()
        };
        let (buf, packet_id) = self
            .assemble(PacketType::Data, flags, self.cfg.max_ttl, dest, next_hop, data)
            .map_err(|_| SendError::TooLong)?;

        if want_ack {
            self.relay
                .track(packet_id, dest, buf.clone(), now, self.cfg.ack_timeout)
                .map_err(|_| SendError::QueueFull)?;
        }

        let sf = Some(self.adr.negotiated(next_hop));
        self.enqueue_mac(buf, PRIO_DATA, sf, None)
            .map_err(|_| SendError::QueueFull)?;

        self.history.push(
            Direction::Sent,
            self.node,
            dest,
            data,
            0,
            0,
            0,
            now,
        );
        Ok(packet_id)
    }

    /// Broadcasts a user data frame to everyone in range (flooded up to the TTL).
    pub fn send_broadcast(&mut self, data: &[u8]) -> Result<u16, SendError> {
        if data.len() > usize::from(self.cfg.max_payload) || data.len() > MAX_PAYLOAD_LEN {
            return Err(SendError::TooLong);
        }
        let now = self.timer.now();
        let (buf, packet_id) = self
            .assemble(
                PacketType::Data,
                Flags::BROADCAST,
                self.cfg.max_ttl,
                NodeAddress::BROADCAST,
                NodeAddress::UNSPECIFIED,
                data,
            )
            .map_err(|_| SendError::TooLong)?;
        self.enqueue_mac(buf, PRIO_DATA, None, None)
            .map_err(|_| SendError::QueueFull)?;

        self.history.push(
            Direction::BroadcastSent,
            self.node,
            NodeAddress::BROADCAST,
            data,
            0,
            0,
            0,
            now,
        );
        Ok(packet_id)
    }

    /// Broadcasts a neighbor probe.
    pub fn send_hello(&mut self) -> Result<(), SendError> {
        let hello = Hello {
            neighbor_count: self.neighbors.len() as u8,
            last_rssi: self.neighbors.iter().map(|n| n.last_rssi()).next().unwrap_or(0),
            last_snr: self.neighbors.iter().map(|n| n.last_snr()).next().unwrap_or(0),
        };
        let mut buf = [0; 4];
        hello
            .to_bytes(&mut ByteWriter::new(&mut buf))
            .map_err(|_| SendError::TooLong)?;
        let (frame, _) = self
            .assemble(
                PacketType::Hello,
                Flags::BROADCAST,
                1,
                NodeAddress::BROADCAST,
                NodeAddress::UNSPECIFIED,
                &buf,
            )
            .map_err(|_| SendError::TooLong)?;
        self.enqueue_mac(frame, PRIO_CONTROL, None, None)
            .map_err(|_| SendError::QueueFull)
    }

    /// Sends a node status report to `dest`.
    pub fn send_telemetry(&mut self, dest: NodeAddress) -> Result<(), SendError> {
        let now = self.timer.now();
        let telemetry = Telemetry {
            battery: self.battery,
            temperature: self.temperature,
            uptime_s: now.duration_since(self.boot_time).whole_secs(),
            packets_sent: self.counters.tx_frames as u16,
            packets_received: self.counters.rx_frames as u16,
        };
        let mut buf = [0; 11];
        telemetry
            .to_bytes(&mut ByteWriter::new(&mut buf))
            .map_err(|_| SendError::TooLong)?;

        let next_hop = match self.router.next_hop(dest, &self.neighbors, now) {
            Some(nh) => nh,
            None => {
                self.start_discovery(dest, now);
                return Err(SendError::NoRoute);
            }
        };
        let (frame, _) = self
            .assemble(PacketType::Telemetry, Flags::empty(), self.cfg.max_ttl, dest, next_hop, &buf)
            .map_err(|_| SendError::TooLong)?;
        self.enqueue_mac(frame, PRIO_DATA, None, None)
            .map_err(|_| SendError::QueueFull)
    }

    // ------------------------------------------------------------------
    // Secure links
    // ------------------------------------------------------------------

    /// Initiates a secure link to `peer`.
    pub fn request_link(&mut self, peer: NodeAddress) -> Result<LinkId, SendError> {
        let now = self.timer.now();
        let id = self
            .links
            .request(peer, now, &mut self.rng, &mut self.outbox)
            .map_err(|_| SendError::QueueFull)?;
        self.flush_outbox(now);
        Ok(id)
    }

    /// Closes the link to `peer`, wiping its keys.
    pub fn close_link(&mut self, peer: NodeAddress) {
        let now = self.timer.now();
        self.links.close(peer, &mut self.outbox, &mut self.events);
        self.flush_outbox(now);
    }

    /// Sends encrypted data over the active link to `peer`.
    pub fn send_link_data(&mut self, peer: NodeAddress, data: &[u8]) -> Result<(), SendError> {
        let now = self.timer.now();
        self.links
            .send(peer, data, now, &mut self.outbox)
            .map_err(|e| match e {
                Error::InvalidValue => SendError::TooLong,
                _ => SendError::QueueFull,
            })?;
        self.flush_outbox(now);
        Ok(())
    }

    /// State of the link to `peer`.
    pub fn link_state(&self, peer: NodeAddress) -> LinkState {
        self.links.state(peer)
    }

    // ------------------------------------------------------------------
    // Groups
    // ------------------------------------------------------------------

    /// Creates a group, generating a key when none is given. Returns the group id.
    pub fn create_group(
        &mut self,
        name: &str,
        key: Option<&[u8; GROUP_KEY_LEN]>,
    ) -> Result<u32, Error> {
        let now = self.timer.now();
        let id = self.groups.create(name, key, now, &mut self.rng)?;
        self.groups.save(&mut self.store);
        Ok(id)
    }

    /// Joins a group with a known pre-shared key. Returns the group id.
    pub fn join_group(&mut self, name: &str, key: &[u8; GROUP_KEY_LEN]) -> Result<u32, Error> {
        let now = self.timer.now();
        let id = self.groups.join(name, key, now)?;
        self.groups.save(&mut self.store);
        Ok(id)
    }

    /// Leaves a group and wipes its key.
    pub fn leave_group(&mut self, id: u32) {
        self.groups.leave(id);
        self.groups.save(&mut self.store);
    }

    /// Encrypts and broadcasts a message into a group.
    pub fn send_group_message(&mut self, id: u32, data: &[u8]) -> Result<(), SendError> {
        let now = self.timer.now();
        self.groups
            .send(id, data, now, &mut self.outbox)
            .map_err(|e| match e {
                Error::InvalidValue => SendError::TooLong,
                _ => SendError::QueueFull,
            })?;
        self.flush_outbox(now);
        Ok(())
    }

    /// Looks up a joined group's id by name.
    pub fn group_by_name(&self, name: &str) -> Option<u32> {
        self.groups.find_by_name(name)
    }

    // ------------------------------------------------------------------
    // DTN
    // ------------------------------------------------------------------

    /// Queues a delay-tolerant bundle for `dest`.
    pub fn queue_bundle(
        &mut self,
        dest: NodeAddress,
        payload: &[u8],
        priority: BundlePriority,
        ttl: Option<crate::time::Duration>,
        flags: BundleFlags,
    ) -> Result<u32, SendError> {
        let now = self.timer.now();
        self.dtn
            .queue(
                dest,
                payload,
                priority,
                ttl,
                flags,
                now,
                &mut self.rng,
                &mut self.events,
            )
            .map_err(|e| match e {
                Error::InvalidValue => SendError::TooLong,
                _ => SendError::QueueFull,
            })
    }

    /// Status of a queued bundle, if still held.
    pub fn bundle_status(&self, id: u32) -> Option<BundleStatus> {
        self.dtn.status(id)
    }

    // ------------------------------------------------------------------
    // Emergency
    // ------------------------------------------------------------------

    /// Activates the SOS broadcaster.
    pub fn activate_sos(&mut self, kind: EmergencyKind, message: &[u8]) -> Result<(), SendError> {
        let now = self.timer.now();
        self.emergency
            .activate(kind, message, now)
            .map_err(|_| SendError::TooLong)
    }

    /// Cancels the active SOS.
    pub fn cancel_sos(&mut self) {
        let now = self.timer.now();
        self.emergency.cancel(&mut self.outbox);
        self.flush_outbox(now);
    }

    /// Whether this node is currently broadcasting an SOS.
    pub fn sos_active(&self) -> bool {
        self.emergency.is_active()
    }

    /// Acknowledges another node's SOS with a unicast.
    pub fn acknowledge_sos(&mut self, node: NodeAddress) -> Result<(), SendError> {
        let now = self.timer.now();
        self.emergency
            .acknowledge(node, &mut self.outbox)
            .map_err(|_| SendError::QueueFull)?;
        self.flush_outbox(now);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Geographic
    // ------------------------------------------------------------------

    /// Updates this node's GPS fix, feeding both the geographic helper and SOS broadcasts.
    pub fn set_position(&mut self, latitude: i32, longitude: i32, altitude_m: i16) {
        self.geo.set_position(
            Position {
                latitude,
                longitude,
            },
            altitude_m,
        );
        self.emergency
            .set_position(latitude, longitude, i32::from(altitude_m) * 100);
    }

    /// Broadcasts `data` into a circular geographic region.
    pub fn send_geocast(&mut self, region: GeocastRegion, data: &[u8]) -> Result<(), SendError> {
        let now = self.timer.now();
        self.geo
            .send_geocast(region, data, self.node, &mut self.outbox)
            .map_err(|e| match e {
                Error::InvalidValue => SendError::TooLong,
                _ => SendError::QueueFull,
            })?;
        self.flush_outbox(now);
        Ok(())
    }

    /// Greedy-geographic next hop towards a position, if one is known.
    pub fn geo_next_hop(&mut self, target: Position) -> Option<NodeAddress> {
        let now = self.timer.now();
        self.geo.next_hop_towards(target, now)
    }

    // ------------------------------------------------------------------
    // Naming, history, telemetry inputs
    // ------------------------------------------------------------------

    /// Sets this node's human-readable name (announced in beacons).
    pub fn set_name(&mut self, name: &str) -> Result<(), Error> {
        self.naming.set_local_name(name)?;
        self.naming.save(&mut self.store);
        Ok(())
    }

    /// Names a remote node locally.
    pub fn set_peer_name(&mut self, peer: NodeAddress, name: &str) -> Result<(), Error> {
        let now = self.timer.now();
        self.naming.set(peer, name, now)?;
        self.naming.save(&mut self.store);
        Ok(())
    }

    /// The display name of a node: its known name or `0xXXXXXXXX`.
    pub fn name_of(&self, node: NodeAddress) -> NameOrAddress<'_> {
        self.naming.get(node)
    }

    /// Resolves a name back to an address.
    pub fn resolve_name(&self, name: &str) -> Option<NodeAddress> {
        self.naming.resolve(name)
    }

    /// The bounded log of recent messages.
    pub fn history(&self) -> &MessageLog {
        &self.history
    }

    /// Iterates over current direct neighbors.
    pub fn neighbors(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors.iter()
    }

    /// Iterates over the routing table.
    pub fn routes(&self) -> impl Iterator<Item = &RouteEntry> {
        self.router.iter()
    }

    /// Updates the battery level stamped into telemetry and SOS frames.
    pub fn set_battery_level(&mut self, percent: u8) {
        self.battery = percent.min(100);
        self.emergency.set_battery(percent);
    }

    /// Updates the temperature reading included in telemetry (tenths of °C).
    pub fn set_temperature(&mut self, decidegrees: i16) {
        self.temperature = decidegrees;
    }

    /// Declares this node's clock externally disciplined (eg. GPS: stratum 0).
    pub fn set_time_authority(&mut self, stratum: u8) {
        let now = self.timer.now();
        self.mac.set_time_authority(stratum, now);
    }

    /// Channel access statistics.
    pub fn mac_stats(&self) -> crate::mac::MacStats {
        self.mac.stats()
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn alloc_ids(&mut self) -> (u16, u8) {
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        self.next_seq = self.next_seq.wrapping_add(1);
        (self.next_packet_id, self.next_seq)
    }

    /// Builds a locally-originated frame.
    fn assemble(
        &mut self,
        ty: PacketType,
        flags: Flags,
        ttl: u8,
        dest: NodeAddress,
        next_hop: NodeAddress,
        payload: &[u8],
    ) -> Result<(PacketBuf, u16), Error> {
        let (packet_id, seq_number) = self.alloc_ids();
        let header = Header {
            ty,
            ttl,
            flags,
            packet_id,
            source: self.node,
            destination: dest,
            next_hop,
            hop_count: 0,
            seq_number,
            payload_length: payload.len() as u16,
        };
        Ok((PacketBuf::from_parts(&header, payload)?, packet_id))
    }

    fn enqueue_mac(
        &mut self,
        frame: PacketBuf,
        priority: u8,
        sf: Option<SpreadingFactor>,
        tx_power: Option<i8>,
    ) -> Result<(), Error> {
        self.mac.enqueue(QueuedFrame {
            frame,
            priority,
            sf,
            tx_power,
        })
    }

    /// Gives the MAC a transmit opportunity.
    fn pump_radio(&mut self, now: Instant) {
        let qf = match self.mac.poll(now, &mut self.rng) {
            Some(qf) => qf,
            None => return,
        };

        let sf = qf.sf.unwrap_or(self.cfg.default_sf);
        if sf != self.current_sf {
            self.radio.set_spreading_factor(sf);
            self.current_sf = sf;
        }
        if let Some(power) = qf.tx_power {
            self.radio.set_tx_power(power);
        }

        match self.radio.transmit(qf.frame.as_slice()) {
            TxResult::Sent => {
                self.counters.tx_frames += 1;
                if qf.tx_power.is_some() {
                    self.radio.set_tx_power(DEFAULT_TX_POWER);
                }
            }
            TxResult::Busy => {
                // Modem occupied; put the frame back for the next tick.
                if self.mac.enqueue(qf).is_err() {
                    error!("radio busy and tx queue full, frame lost");
                }
            }
        }
    }

    fn run_relay(&mut self, now: Instant) {
        let Self {
            ref mut relay,
            ref mut mac,
            ref mut events,
            ref mut counters,
            ref cfg,
            ..
        } = *self;

        relay.tick(now, cfg.ack_timeout, cfg.max_retries, |action| match action {
            RelayAction::Retransmit(frame) => {
                let _ = mac.enqueue(QueuedFrame {
                    frame,
                    priority: PRIO_DATA,
                    sf: None,
                    tx_power: None,
                });
            }
            RelayAction::Failed {
                packet_id,
                destination,
            } => {
                counters.delivery_failures += 1;
                events.push(Event::DeliveryFailed {
                    packet_id,
                    dest: destination,
                });
            }
        });
    }

    fn run_dtn(&mut self, now: Instant) {
        let Self {
            ref router,
            ref neighbors,
            ref mut dtn,
            ref mut outbox,
            ref mut events,
            ref cfg,
            ..
        } = *self;

        dtn.tick(
            now,
            cfg.epidemic_mode,
            neighbors,
            |dest| router.has_route(dest, neighbors),
            outbox,
            events,
        );
    }

    fn periodic_beacons(&mut self, now: Instant) {
        let sync_due = match self.last_time_sync {
            None => true,
            Some(at) => now.duration_since(at) >= TIME_SYNC_INTERVAL,
        };
        if sync_due {
            self.last_time_sync = Some(now);
            let sync = self.mac.make_time_sync(now);
            let mut buf = [0; 5];
            if sync.to_bytes(&mut ByteWriter::new(&mut buf)).is_ok() {
                if let Ok((frame, _)) = self.assemble(
                    PacketType::TimeSync,
                    Flags::BROADCAST,
                    1,
                    NodeAddress::BROADCAST,
                    NodeAddress::UNSPECIFIED,
                    &buf,
                ) {
                    let _ = self.enqueue_mac(frame, PRIO_CONTROL, None, None);
                }
            }
        }

        let beacon_due = match self.last_beacon {
            None => true,
            Some(at) => now.duration_since(at) >= self.cfg.beacon_interval,
        };
        if beacon_due {
            self.last_beacon = Some(now);
            let name = self.naming.local_name();
            let beacon = Beacon {
                capabilities: 0,
                stamp: self.mac.network_now(now).raw_millis(),
                claimed_slot: self.mac.our_slot() as u8,
                adr: self.adr.advertisement(DEFAULT_TX_POWER),
                name_len: name.len() as u8,
            };
            let mut buf = [0; 11 + crate::naming::MAX_NAME_LEN];
            if let Ok(used) = beacon.encode(name, &mut buf) {
                if let Ok((frame, _)) = self.assemble(
                    PacketType::Beacon,
                    Flags::BROADCAST,
                    1,
                    NodeAddress::BROADCAST,
                    NodeAddress::UNSPECIFIED,
                    &buf[..used],
                ) {
                    let _ = self.enqueue_mac(frame, PRIO_CONTROL, None, None);
                }
            }
        }
    }

    /// Broadcasts a route discovery for `target`.
    fn start_discovery(&mut self, target: NodeAddress, _now: Instant) {
        let request = self.router.make_discovery(target, self.node);
        let mut buf = [0; 13];
        if request.to_bytes(&mut ByteWriter::new(&mut buf)).is_err() {
            return;
        }
        debug!("route: discovering {}", target);
        if let Ok((frame, _)) = self.assemble(
            PacketType::RouteRequest,
            Flags::BROADCAST,
            self.cfg.max_ttl,
            NodeAddress::BROADCAST,
            NodeAddress::UNSPECIFIED,
            &buf,
        ) {
            let _ = self.enqueue_mac(frame, PRIO_CONTROL, None, None);
        }
    }

    /// Wraps component sub-frames into mesh frames and queues them on the MAC.
    fn flush_outbox(&mut self, now: Instant) {
        while let Some(f) = self.outbox.pop() {
            let (dest, next_hop) = if f.dest.is_broadcast() {
                (NodeAddress::BROADCAST, NodeAddress::UNSPECIFIED)
            } else {
                match self.router.next_hop(f.dest, &self.neighbors, now) {
                    Some(nh) => (f.dest, nh),
                    None => {
                        // The component's own retry logic gets another chance once
                        // discovery has done its job.
                        self.start_discovery(f.dest, now);
                        self.counters.no_route += 1;
                        continue;
                    }
                }
            };

            let mut flags = f.flags;
            if dest.is_broadcast() {
                flags |= Flags::BROADCAST;
            }
            let ttl = f.ttl.unwrap_or(self.cfg.max_ttl);

            let frame = match self.assemble(f.ty, flags, ttl, dest, next_hop, &f.payload) {
                Ok((frame, _)) => frame,
                Err(_) => continue,
            };

            let sf = f
                .sf
                .or_else(|| (!dest.is_broadcast()).then(|| self.adr.negotiated(next_hop)));
            if self.enqueue_mac(frame, f.priority, sf, f.tx_power).is_err() {
                self.counters.outbox_overflow += 1;
            }
        }
    }

    fn drain_events(&mut self, host: &mut dyn Host) {
        while let Some(event) = self.events.pop() {
            match event {
                Event::MessageReceived { from, data } => host.on_message(from, &data),
                Event::DeliveryFailed { packet_id, dest } => {
                    host.on_delivery_failed(packet_id, dest)
                }
                Event::LinkEstablished { peer } => host.on_link_established(peer),
                Event::LinkClosed { peer } => host.on_link_closed(peer),
                Event::LinkData { peer, data } => host.on_link_data(peer, &data),
                Event::GroupMessage {
                    group_id,
                    sender,
                    data,
                } => host.on_group_message(group_id, sender, &data),
                Event::BundleDelivered { id, source, data } => {
                    host.on_bundle_delivered(id, source, &data)
                }
                Event::BundleStatus { id, status } => host.on_bundle_status(id, status),
                Event::SosReceived { from, message } => host.on_sos(from, &message),
                Event::SosCleared { from } => host.on_sos_cleared(from),
                Event::GeocastReceived { source, data } => host.on_geocast(source, &data),
                Event::TelemetryReceived { from, telemetry } => {
                    host.on_telemetry(from, &telemetry)
                }
            }
        }
    }

    /// Handles a frame addressed to this node (or broadcast).
    fn dispatch_local(
        &mut self,
        header: &Header,
        payload: &[u8],
        rssi: i16,
        snr: i8,
        now: Instant,
    ) {
        match header.ty {
            PacketType::Data => {
                if header.needs_ack() && !header.is_broadcast() {
                    self.send_ack(header, now);
                }
                let direction = if header.is_broadcast() {
                    Direction::BroadcastReceived
                } else {
                    Direction::Received
                };
                // `hop_count` counts forwards; the delivering transmission is one more hop.
                self.history.push(
                    direction,
                    header.source,
                    header.destination,
                    payload,
                    header.hop_count.saturating_add(1),
                    rssi,
                    snr,
                    now,
                );
                self.naming.touch(header.source, now);
                self.events.push(Event::MessageReceived {
                    from: header.source,
                    data: Vec::from_slice(payload).unwrap_or_default(),
                });
            }
            PacketType::Ack => {
                if self.relay.acknowledge(header.packet_id).is_some() {
                    trace!("relay: ack for {} from {}", header.packet_id, header.source);
                }
            }
            PacketType::RouteRequest => self.on_route_request(header, payload, now),
            PacketType::RouteReply => self.on_route_reply(header, payload, now),
            PacketType::RouteError => {
                if let Ok(err) =
                    RouteErrorNotice::from_bytes(&mut ByteReader::new(payload))
                {
                    self.router.handle_error(&err);
                }
            }
            PacketType::Hello => {
                // The neighbor table was already refreshed above; nothing else to do.
            }
            PacketType::Telemetry => {
                if let Ok(telemetry) = Telemetry::from_bytes(&mut ByteReader::new(payload)) {
                    self.events.push(Event::TelemetryReceived {
                        from: header.source,
                        telemetry,
                    });
                }
            }
            PacketType::Beacon => self.on_beacon(header, payload, now),
            PacketType::TimeSync => {
                if let Ok(sync) = TimeSync::from_bytes(&mut ByteReader::new(payload)) {
                    self.mac.handle_time_sync(header.source, &sync, now);
                }
            }
            PacketType::Link => self.links.handle_frame(
                header.source,
                payload,
                rssi,
                snr,
                now,
                &mut self.rng,
                &mut self.outbox,
                &mut self.events,
            ),
            PacketType::Group => self.groups.handle_frame(payload, now, &mut self.events),
            PacketType::Bundle => self.dtn.handle_frame(
                header.source,
                payload,
                now,
                &mut self.outbox,
                &mut self.events,
            ),
            PacketType::Sos => self.emergency.handle_frame(
                header.source,
                payload,
                rssi,
                snr,
                now,
                &mut self.events,
            ),
            PacketType::Geo => self.geo.handle_frame(
                header.source,
                payload,
                rssi,
                now,
                &mut self.outbox,
                &mut self.events,
            ),
            PacketType::Unknown(_) => {
                // decode() already rejects these; unreachable in practice.
                self.counters.dropped_unknown_type += 1;
            }
        }
    }

    /// Acknowledges a received ACK-requested data frame.
    ///
    /// The ACK reuses the original packet id so the sender can match it; it carries no payload.
    fn send_ack(&mut self, header: &Header, now: Instant) {
        let next_hop = match self.router.next_hop(header.source, &self.neighbors, now) {
            Some(nh) => nh,
            None => {
                // The data frame just proved a path exists; fall back to its last relay.
                header.source
            }
        };
        self.next_seq = self.next_seq.wrapping_add(1);
        let ack = Header {
            ty: PacketType::Ack,
            ttl: self.cfg.max_ttl,
            flags: Flags::empty(),
            packet_id: header.packet_id,
            source: self.node,
            destination: header.source,
            next_hop,
            hop_count: 0,
            seq_number: self.next_seq,
            payload_length: 0,
        };
        if let Ok(frame) = PacketBuf::from_parts(&ack, &[]) {
            let _ = self.enqueue_mac(frame, PRIO_CONTROL, None, None);
        }
    }

    fn on_route_request(&mut self, header: &Header, payload: &[u8], now: Instant) {
        let request = match RouteRequest::from_bytes(&mut ByteReader::new(payload)) {
            Ok(r) => r,
            Err(_) => return,
        };
        let quality = self
            .neighbors
            .get(request.relayed_by)
            .map(|n| n.quality())
            .unwrap_or(0);

        match self
            .router
            .handle_request(header, &request, self.node, quality, now)
        {
            RequestAction::Reply { reply, next_hop } => {
                let mut buf = [0; 14];
                if reply.to_bytes(&mut ByteWriter::new(&mut buf)).is_ok() {
                    if let Ok((frame, _)) = self.assemble(
                        PacketType::RouteReply,
                        Flags::empty(),
                        self.cfg.max_ttl,
                        header.source,
                        next_hop,
                        &buf,
                    ) {
                        let _ = self.enqueue_mac(frame, PRIO_CONTROL, None, None);
                    }
                }
            }
            RequestAction::Rebroadcast(fwd) => {
                // The flood keeps the originator's source and packet id so the broadcast
                // dedup window can do its job network-wide.
                let mut buf = [0; 13];
                if fwd.to_bytes(&mut ByteWriter::new(&mut buf)).is_err() {
                    return;
                }
                let rebroadcast = Header {
                    ttl: header.ttl - 1,
                    hop_count: header.hop_count.saturating_add(1),
                    payload_length: buf.len() as u16,
                    ..*header
                };
                if let Ok(frame) = PacketBuf::from_parts(&rebroadcast, &buf) {
                    let _ = self.enqueue_mac(frame, PRIO_CONTROL, None, None);
                }
            }
            RequestAction::Ignore => {}
        }
    }

    fn on_route_reply(&mut self, header: &Header, payload: &[u8], now: Instant) {
        let reply = match RouteReply::from_bytes(&mut ByteReader::new(payload)) {
            Ok(r) => r,
            Err(_) => return,
        };

        match self.router.handle_reply(header, &reply, self.node, now) {
            ReplyAction::Forward {
                reply: fwd,
                next_hop,
            } => {
                if header.ttl <= 1 {
                    self.counters.dropped_ttl_exhausted += 1;
                    return;
                }
                let mut buf = [0; 14];
                if fwd.to_bytes(&mut ByteWriter::new(&mut buf)).is_err() {
                    return;
                }
                let forwarded = Header {
                    ttl: header.ttl - 1,
                    hop_count: header.hop_count.saturating_add(1),
                    next_hop,
                    payload_length: buf.len() as u16,
                    ..*header
                };
                if let Ok(frame) = PacketBuf::from_parts(&forwarded, &buf) {
                    self.counters.forwarded += 1;
                    let _ = self.enqueue_mac(frame, PRIO_CONTROL, None, None);
                }
            }
            ReplyAction::Arrived => {
                debug!("route: reply arrived, {} reachable", reply.target);
            }
            ReplyAction::Ignore => {}
        }
    }

    fn on_beacon(&mut self, header: &Header, payload: &[u8], now: Instant) {
        let mut r = ByteReader::new(payload);
        let _capabilities = match r.read_u8() {
            Ok(c) => c,
            Err(_) => return,
        };
        let _stamp = match r.read_u32_le() {
            Ok(s) => s,
            Err(_) => return,
        };
        let claimed_slot = match r.read_u8() {
            Ok(s) => s,
            Err(_) => return,
        };
        let adr = match AdrAdvertisement::from_bytes(&mut r) {
            Ok(a) => a,
            Err(_) => return,
        };
        let name_len = match r.read_u8() {
            Ok(n) => usize::from(n),
            Err(_) => return,
        };

        self.mac.note_claimed_slot(header.source, claimed_slot, now);
        self.adr
            .record_peer_preference(header.source, adr.preferred, now);

        if name_len > 0 {
            if let Ok(bytes) = r.read_slice(name_len.min(crate::naming::MAX_NAME_LEN)) {
                if let Ok(name) = core::str::from_utf8(bytes) {
                    let _ = self.naming.set(header.source, name, now);
                }
            }
        }
    }

    /// Forwards a unicast frame we are the designated relay for.
    fn relay_unicast(&mut self, header: &Header, payload: &[u8], now: Instant) {
        // Route replies and errors are rewritten by their handlers while travelling.
        match header.ty {
            PacketType::RouteReply => {
                self.on_route_reply(header, payload, now);
                return;
            }
            PacketType::RouteError => {
                if let Ok(err) = RouteErrorNotice::from_bytes(&mut ByteReader::new(payload)) {
                    // Invalidate locally, then keep propagating toward the original sender.
                    self.router.handle_error(&err);
                }
            }
            _ => {}
        }

        if header.ttl <= 1 {
            self.counters.dropped_ttl_exhausted += 1;
            return;
        }

        let next_hop = match self.router.next_hop(header.destination, &self.neighbors, now) {
            Some(nh) => nh,
            None => {
                self.counters.no_route += 1;
                self.router.invalidate(header.destination);
                self.report_route_error(header, now);
                return;
            }
        };

        let forwarded = Header {
            ttl: header.ttl - 1,
            hop_count: header.hop_count.saturating_add(1),
            next_hop,
            ..*header
        };
        if let Ok(frame) = PacketBuf::from_parts(&forwarded, payload) {
            self.counters.forwarded += 1;
            let sf = Some(self.adr.negotiated(next_hop));
            let _ = self.enqueue_mac(frame, PRIO_DATA, sf, None);
        }
    }

    /// Tells a frame's source that its destination became unreachable here.
    fn report_route_error(&mut self, failed: &Header, now: Instant) {
        let notice = RouteErrorNotice {
            unreachable: failed.destination,
            failed_next_hop: self.node,
        };
        let mut buf = [0; 8];
        if notice.to_bytes(&mut ByteWriter::new(&mut buf)).is_err() {
            return;
        }
        let next_hop = match self.router.next_hop(failed.source, &self.neighbors, now) {
            Some(nh) => nh,
            None => return,
        };
        if let Ok((frame, _)) = self.assemble(
            PacketType::RouteError,
            Flags::empty(),
            self.cfg.max_ttl,
            failed.source,
            next_hop,
            &buf,
        ) {
            let _ = self.enqueue_mac(frame, PRIO_CONTROL, None, None);
        }
    }

    /// Re-floods eligible broadcast frames once per `(source, packet_id)`.
    fn maybe_rebroadcast(&mut self, header: &Header, payload: &[u8]) {
        match header.ty {
            // These either manage their own flooding or are single-hop by design.
            PacketType::RouteRequest
            | PacketType::Geo
            | PacketType::TimeSync
            | PacketType::Hello
            | PacketType::Beacon => return,
            _ => {}
        }
        if header.ttl <= 1 {
            return;
        }

        let rebroadcast = Header {
            ttl: header.ttl - 1,
            hop_count: header.hop_count.saturating_add(1),
            ..*header
        };
        if let Ok(frame) = PacketBuf::from_parts(&rebroadcast, payload) {
            self.counters.rebroadcast += 1;
            let priority = if header.ty == PacketType::Sos {
                PRIO_EMERGENCY
            } else {
                PRIO_DATA
            };
            let _ = self.enqueue_mac(frame, priority, None, None);
        }
    }
}
