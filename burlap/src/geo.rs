//! Geographic helper: location beacons, greedy forwarding and geocast.
//!
//! Positions are 32-bit signed latitude/longitude scaled by 1e7 (about 1 cm of resolution).
//! Nodes with a fix broadcast a location beacon once a minute; everyone keeps a bounded table of
//! last-known peer positions with an expiry.
//!
//! * **Greedy next hop**: among peers with a fresh position, pick the one whose great-circle
//!   distance to the target is smallest and strictly less than our own. If none exists and GPSR
//!   mode is enabled, fall back to the strongest-signal peer (perimeter-mode placeholder).
//! * **Geocast**: a bounded flood. A receiver delivers locally iff it lies inside the target
//!   circle, and re-broadcasts iff its own distance to the center is below twice the radius, so
//!   copies die out quickly beyond the region's envelope.

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::packet::{NodeAddress, PacketType, MAX_PAYLOAD_LEN};
use crate::stack::{Event, EventQueue, Outbox, PRIO_CONTROL, PRIO_DATA};
use crate::time::{Duration, Instant};
use crate::Error;
use heapless::Vec;

/// Maximum peers with tracked locations.
pub const MAX_TRACKED_LOCATIONS: usize = 32;

/// A tracked location goes stale after this long.
pub const LOCATION_TIMEOUT: Duration = Duration::from_secs(600);

/// Period of our own location beacon.
pub const LOCATION_BEACON_INTERVAL: Duration = Duration::from_secs(60);

/// Default geocast radius in meters.
pub const DEFAULT_GEOCAST_RADIUS: u32 = 1000;

/// Mean earth radius in meters, for Haversine.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

const GEOCAST_HEADER_LEN: usize = 22;

/// Recently-seen geocasts remembered for duplicate suppression.
const SEEN_GEOCASTS: usize = 8;

enum_with_unknown! {
    /// Sub-type byte leading every geographic frame.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum GeoPacketType(u8) {
        /// Periodic position announcement.
        Location = 0x60,
        /// Flood-within-radius payload.
        Geocast = 0x61,
    }
}

/// A geographic position, degrees scaled by 1e7.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Position {
    pub latitude: i32,
    pub longitude: i32,
}

/// A circular geocast target region.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct GeocastRegion {
    pub center: Position,
    pub radius_m: u32,
}

/// Position beacon payload.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct LocationBeacon {
    pub position: Position,
    /// Altitude in meters.
    pub altitude: i16,
    /// Heading in degrees, 0-359.
    pub heading: u16,
    /// Speed in cm/s.
    pub speed: u16,
    /// Satellites used for the fix.
    pub satellites: u8,
}

impl ToBytes for LocationBeacon {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_i32_le(self.position.latitude)?;
        writer.write_i32_le(self.position.longitude)?;
        writer.write_i16_le(self.altitude)?;
        writer.write_u16_le(self.heading)?;
        writer.write_u16_le(self.speed)?;
        writer.write_u8(self.satellites)?;
        writer.write_u8(0) // fix type, reserved
    }
}

impl<'a> FromBytes<'a> for LocationBeacon {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let beacon = LocationBeacon {
            position: Position {
                latitude: bytes.read_i32_le()?,
                longitude: bytes.read_i32_le()?,
            },
            altitude: bytes.read_i16_le()?,
            heading: bytes.read_u16_le()?,
            speed: bytes.read_u16_le()?,
            satellites: bytes.read_u8()?,
        };
        bytes.skip(1)?;
        Ok(beacon)
    }
}

/// Clear header of a geocast frame.
struct GeocastHeader {
    region: GeocastRegion,
    source: NodeAddress,
    /// Source-assigned id; `(source, cast_id)` suppresses duplicate deliveries in the flood.
    cast_id: u16,
    hop_count: u8,
    max_hops: u8,
    payload_len: u16,
}

impl ToBytes for GeocastHeader {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_i32_le(self.region.center.latitude)?;
        writer.write_i32_le(self.region.center.longitude)?;
        writer.write_u32_le(self.region.radius_m)?;
        writer.write_u32_le(self.source.raw())?;
        writer.write_u16_le(self.cast_id)?;
        writer.write_u8(self.hop_count)?;
        writer.write_u8(self.max_hops)?;
        writer.write_u16_le(self.payload_len)
    }
}

impl<'a> FromBytes<'a> for GeocastHeader {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(GeocastHeader {
            region: GeocastRegion {
                center: Position {
                    latitude: bytes.read_i32_le()?,
                    longitude: bytes.read_i32_le()?,
                },
                radius_m: bytes.read_u32_le()?,
            },
            source: NodeAddress::new(bytes.read_u32_le()?),
            cast_id: bytes.read_u16_le()?,
            hop_count: bytes.read_u8()?,
            max_hops: bytes.read_u8()?,
            payload_len: bytes.read_u16_le()?,
        })
    }
}

/// Last-known location of a peer.
#[derive(Debug, Copy, Clone)]
pub struct NodeLocation {
    pub node: NodeAddress,
    pub position: Position,
    pub altitude: i16,
    pub heard_at: Instant,
    pub rssi: i16,
}

/// Geographic routing statistics.
#[derive(Debug, Copy, Clone, Default)]
pub struct GeoStats {
    pub location_updates: u32,
    pub greedy_forwards: u32,
    pub perimeter_forwards: u32,
    pub geocast_sent: u32,
    pub geocast_delivered: u32,
    pub geocast_relayed: u32,
}

/// Great-circle distance in meters between two scaled positions (Haversine).
pub fn distance_m(a: Position, b: Position) -> u32 {
    let lat1 = to_radians(a.latitude);
    let lat2 = to_radians(b.latitude);
    let dlat = to_radians(b.latitude - a.latitude);
    let dlon = to_radians(b.longitude - a.longitude);

    let sin_dlat = libm::sin(dlat / 2.0);
    let sin_dlon = libm::sin(dlon / 2.0);
    let h = sin_dlat * sin_dlat + libm::cos(lat1) * libm::cos(lat2) * sin_dlon * sin_dlon;
    let c = 2.0 * libm::atan2(libm::sqrt(h), libm::sqrt(1.0 - h));
    (EARTH_RADIUS_M * c) as u32
}

fn to_radians(scaled_degrees: i32) -> f64 {
    f64::from(scaled_degrees) / 1e7 * core::f64::consts::PI / 180.0
}

/// The geographic helper.
pub struct GeoRouting {
    locations: Vec<NodeLocation, MAX_TRACKED_LOCATIONS>,
    our_position: Option<Position>,
    our_altitude: i16,
    /// Fall back to strongest-signal forwarding when greedy fails.
    pub gpsr_enabled: bool,
    /// Broadcast our own position beacons.
    pub beacon_enabled: bool,
    last_beacon: Option<Instant>,
    next_cast_id: u16,
    seen_casts: Vec<(NodeAddress, u16), SEEN_GEOCASTS>,
    seen_cursor: usize,
    stats: GeoStats,
}

impl GeoRouting {
    pub fn new() -> Self {
        GeoRouting {
            locations: Vec::new(),
            our_position: None,
            our_altitude: 0,
            gpsr_enabled: true,
            beacon_enabled: true,
            last_beacon: None,
            next_cast_id: 1,
            seen_casts: Vec::new(),
            seen_cursor: 0,
            stats: GeoStats::default(),
        }
    }

    /// Records `(source, cast_id)`; returns `false` for re-seen geocasts.
    fn note_cast(&mut self, source: NodeAddress, cast_id: u16) -> bool {
        if self
            .seen_casts
            .iter()
            .any(|&(s, id)| s == source && id == cast_id)
        {
            return false;
        }
        if self.seen_casts.is_full() {
            self.seen_casts[self.seen_cursor] = (source, cast_id);
            self.seen_cursor = (self.seen_cursor + 1) % SEEN_GEOCASTS;
        } else {
            let _ = self.seen_casts.push((source, cast_id));
        }
        true
    }

    /// Updates our own GPS fix.
    pub fn set_position(&mut self, position: Position, altitude: i16) {
        self.our_position = Some(position);
        self.our_altitude = altitude;
    }

    /// Our current position, if we have a fix.
    pub fn position(&self) -> Option<Position> {
        self.our_position
    }

    /// Last-known location of `node`, if fresh.
    pub fn location_of(&self, node: NodeAddress, now: Instant) -> Option<Position> {
        self.locations
            .iter()
            .find(|l| l.node == node && now.duration_since(l.heard_at) <= LOCATION_TIMEOUT)
            .map(|l| l.position)
    }

    /// Periodic update: emits our location beacon.
    pub fn tick(&mut self, now: Instant, out: &mut Outbox) {
        let position = match self.our_position {
            Some(p) if self.beacon_enabled => p,
            _ => return,
        };
        let due = match self.last_beacon {
            None => true,
            Some(at) => now.duration_since(at) >= LOCATION_BEACON_INTERVAL,
        };
        if !due {
            return;
        }

        let beacon = LocationBeacon {
            position,
            altitude: self.our_altitude,
            heading: 0,
            speed: 0,
            satellites: 0,
        };
        let mut buf = [0; 1 + 16];
        buf[0] = GeoPacketType::Location.into();
        if beacon
            .to_bytes(&mut ByteWriter::new(&mut buf[1..]))
            .is_err()
        {
            return;
        }
        // Positions only matter to direct neighbors; no multi-hop flooding.
        let mut frame = crate::stack::OutFrame::broadcast(PacketType::Geo, &buf, PRIO_CONTROL);
        frame.ttl = Some(1);
        if out.push(frame).is_ok() {
            self.last_beacon = Some(now);
        }
    }

    /// Greedy-geographic next hop towards `target`.
    ///
    /// Returns a peer strictly closer to the target than we are, or (in GPSR mode) the
    /// strongest-heard positioned peer as a perimeter-mode stand-in.
    pub fn next_hop_towards(&mut self, target: Position, now: Instant) -> Option<NodeAddress> {
        let our = self.our_position?;
        let our_distance = distance_m(our, target);

        let mut best: Option<(NodeAddress, u32)> = None;
        for l in self
            .locations
            .iter()
            .filter(|l| now.duration_since(l.heard_at) <= LOCATION_TIMEOUT)
        {
            let d = distance_m(l.position, target);
            if d < our_distance && best.map_or(true, |(_, bd)| d < bd) {
                best = Some((l.node, d));
            }
        }

        if let Some((node, _)) = best {
            self.stats.greedy_forwards += 1;
            return Some(node);
        }

        if self.gpsr_enabled {
            // Perimeter-mode placeholder: strongest signal among positioned peers.
            let fallback = self
                .locations
                .iter()
                .filter(|l| now.duration_since(l.heard_at) <= LOCATION_TIMEOUT)
                .max_by_key(|l| l.rssi)
                .map(|l| l.node);
            if fallback.is_some() {
                self.stats.perimeter_forwards += 1;
            }
            return fallback;
        }
        None
    }

    /// Broadcasts `data` into a circular region.
    pub fn send_geocast(
        &mut self,
        region: GeocastRegion,
        data: &[u8],
        our: NodeAddress,
        out: &mut Outbox,
    ) -> Result<(), Error> {
        if data.len() > MAX_PAYLOAD_LEN - 1 - GEOCAST_HEADER_LEN {
            return Err(Error::InvalidValue);
        }

        let cast_id = self.next_cast_id;
        self.next_cast_id = self.next_cast_id.wrapping_add(1);
        // Remember our own cast so relayed copies are not delivered back to us.
        self.note_cast(our, cast_id);

        let header = GeocastHeader {
            region,
            source: our,
            cast_id,
            hop_count: 0,
            max_hops: 8,
            payload_len: data.len() as u16,
        };
        let mut buf = [0; MAX_PAYLOAD_LEN];
        buf[0] = GeoPacketType::Geocast.into();
        header.to_bytes(&mut ByteWriter::new(&mut buf[1..1 + GEOCAST_HEADER_LEN]))?;
        buf[1 + GEOCAST_HEADER_LEN..1 + GEOCAST_HEADER_LEN + data.len()].copy_from_slice(data);

        self.stats.geocast_sent += 1;
        out.broadcast(
            PacketType::Geo,
            &buf[..1 + GEOCAST_HEADER_LEN + data.len()],
            PRIO_DATA,
        )
    }

    /// Handles an incoming geographic frame (payload including the sub-type byte).
    pub fn handle_frame(
        &mut self,
        from: NodeAddress,
        payload: &[u8],
        rssi: i16,
        now: Instant,
        out: &mut Outbox,
        events: &mut EventQueue,
    ) {
        let mut reader = ByteReader::new(payload);
        let sub = match reader.read_u8() {
            Ok(b) => GeoPacketType::from(b),
            Err(_) => return,
        };

        match sub {
            GeoPacketType::Location => {
                if let Ok(beacon) = LocationBeacon::from_bytes(&mut reader) {
                    self.record_location(from, beacon, rssi, now);
                }
            }
            GeoPacketType::Geocast => self.on_geocast(reader, now, out, events),
            GeoPacketType::Unknown(_) => {}
        }
    }

    fn record_location(
        &mut self,
        node: NodeAddress,
        beacon: LocationBeacon,
        rssi: i16,
        now: Instant,
    ) {
        self.stats.location_updates += 1;
        if let Some(entry) = self.locations.iter_mut().find(|l| l.node == node) {
            entry.position = beacon.position;
            entry.altitude = beacon.altitude;
            entry.heard_at = now;
            entry.rssi = rssi;
            return;
        }

        if self.locations.is_full() {
            let victim = self
                .locations
                .iter()
                .enumerate()
                .max_by_key(|(_, l)| now.duration_since(l.heard_at).as_millis())
                .map(|(i, _)| i);
            if let Some(i) = victim {
                self.locations.swap_remove(i);
            }
        }
        let _ = self.locations.push(NodeLocation {
            node,
            position: beacon.position,
            altitude: beacon.altitude,
            heard_at: now,
            rssi,
        });
    }

    fn on_geocast(
        &mut self,
        reader: ByteReader<'_>,
        _now: Instant,
        out: &mut Outbox,
        events: &mut EventQueue,
    ) {
        let body = reader.into_rest();
        if body.len() < GEOCAST_HEADER_LEN {
            return;
        }
        let header =
            match GeocastHeader::from_bytes(&mut ByteReader::new(&body[..GEOCAST_HEADER_LEN])) {
                Ok(h) => h,
                Err(_) => return,
            };
        let data = &body[GEOCAST_HEADER_LEN..];
        if data.len() != usize::from(header.payload_len) {
            return;
        }

        let our = match self.our_position {
            Some(p) => p,
            // Without a fix we can neither deliver nor judge the 2r envelope.
            None => return,
        };
        if !self.note_cast(header.source, header.cast_id) {
            return;
        }
        let center_distance = distance_m(our, header.region.center);

        if center_distance <= header.region.radius_m {
            self.stats.geocast_delivered += 1;
            events.push(Event::GeocastReceived {
                source: header.source,
                data: Vec::from_slice(data).unwrap_or_default(),
            });
        }

        // Re-flood only within the 2r envelope; the outer broadcast dedup stops loops.
        if center_distance < header.region.radius_m.saturating_mul(2)
            && header.hop_count < header.max_hops
        {
            let fwd = GeocastHeader {
                region: header.region,
                source: header.source,
                cast_id: header.cast_id,
                hop_count: header.hop_count + 1,
                max_hops: header.max_hops,
                payload_len: header.payload_len,
            };
            let mut buf = [0; MAX_PAYLOAD_LEN];
            buf[0] = GeoPacketType::Geocast.into();
            if fwd
                .to_bytes(&mut ByteWriter::new(&mut buf[1..1 + GEOCAST_HEADER_LEN]))
                .is_err()
            {
                return;
            }
            buf[1 + GEOCAST_HEADER_LEN..1 + GEOCAST_HEADER_LEN + data.len()].copy_from_slice(data);
            if out
                .broadcast(
                    PacketType::Geo,
                    &buf[..1 + GEOCAST_HEADER_LEN + data.len()],
                    PRIO_DATA,
                )
                .is_ok()
            {
                self.stats.geocast_relayed += 1;
            }
        }
    }

    /// Number of peers with a known location.
    pub fn tracked(&self) -> usize {
        self.locations.len()
    }

    pub fn stats(&self) -> GeoStats {
        self.stats
    }
}
