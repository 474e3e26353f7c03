//! Emergency SOS broadcasting.
//!
//! An activated SOS overrides normal operation: every 10 seconds the node broadcasts its distress
//! message at maximum transmit power and the slowest spreading factor, for at most one hour
//! before auto-cancelling. Received SOS alerts from other nodes are tracked in a small list so
//! the host can display them and acknowledge with a unicast.

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::packet::{NodeAddress, PacketType, MAX_PAYLOAD_LEN};
use crate::phy::SpreadingFactor;
use crate::stack::{Event, EventQueue, OutFrame, Outbox, PRIO_EMERGENCY};
use crate::time::{Duration, Instant};
use crate::Error;
use bitflags::bitflags;
use heapless::Vec;

/// Period of the SOS broadcast while active.
pub const SOS_INTERVAL: Duration = Duration::from_secs(10);

/// Active SOS auto-cancels after this long.
pub const SOS_MAX_DURATION: Duration = Duration::from_secs(3600);

/// TX power used for SOS broadcasts.
pub const SOS_TX_POWER: i8 = 22;

/// Maximum length of the distress text.
pub const SOS_MESSAGE_LEN: usize = 64;

/// Remote SOS alerts tracked at once.
pub const MAX_ACTIVE_SOS: usize = 4;

enum_with_unknown! {
    /// Sub-type byte leading every emergency frame.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum SosPacketType(u8) {
        /// Periodic distress broadcast.
        Alert = 0x50,
        /// Unicast acknowledgment to the distressed node.
        Ack = 0x51,
        /// The emergency is over.
        Cancel = 0x52,
    }
}

enum_with_unknown! {
    /// Kind of emergency being signalled.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum EmergencyKind(u8) {
        General = 1,
        Medical = 2,
        Fire = 3,
        Rescue = 4,
        Security = 5,
        /// Drill or equipment test, not a real emergency.
        Test = 0xFF,
    }
}

bitflags! {
    /// SOS status flags.
    pub struct SosFlags: u8 {
        /// The position fields hold a valid GPS fix.
        const GPS_VALID = 0x01;
        /// Battery critically low.
        const BATTERY_LOW = 0x02;
        /// Another node has acknowledged this SOS.
        const ACKNOWLEDGED = 0x80;
    }
}

/// The distress message broadcast while an SOS is active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SosMessage {
    pub kind: EmergencyKind,
    pub flags: SosFlags,
    /// Latitude, degrees scaled by 1e7. Valid only with `GPS_VALID`.
    pub latitude: i32,
    /// Longitude, degrees scaled by 1e7. Valid only with `GPS_VALID`.
    pub longitude: i32,
    /// Altitude in centimeters.
    pub altitude: i32,
    /// Battery percentage.
    pub battery: u8,
    /// Sender-local time the SOS was initiated.
    pub stamp: u32,
    /// Free-form distress text.
    pub message: Vec<u8, SOS_MESSAGE_LEN>,
}

impl ToBytes for SosMessage {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.kind.into())?;
        writer.write_u8(self.flags.bits())?;
        writer.write_i32_le(self.latitude)?;
        writer.write_i32_le(self.longitude)?;
        writer.write_i32_le(self.altitude)?;
        writer.write_u8(self.battery)?;
        writer.write_u32_le(self.stamp)?;
        writer.write_u8(self.message.len() as u8)?;
        writer.write_slice(&self.message)
    }
}

impl<'a> FromBytes<'a> for SosMessage {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let kind = EmergencyKind::from(bytes.read_u8()?);
        let flags = SosFlags::from_bits_truncate(bytes.read_u8()?);
        let latitude = bytes.read_i32_le()?;
        let longitude = bytes.read_i32_le()?;
        let altitude = bytes.read_i32_le()?;
        let battery = bytes.read_u8()?;
        let stamp = bytes.read_u32_le()?;
        let len = usize::from(bytes.read_u8()?);
        if len > SOS_MESSAGE_LEN {
            return Err(Error::InvalidValue);
        }
        let message = Vec::from_slice(bytes.read_slice(len)?).map_err(|_| Error::InvalidValue)?;
        Ok(SosMessage {
            kind,
            flags,
            latitude,
            longitude,
            altitude,
            battery,
            stamp,
            message,
        })
    }
}

/// A distress call heard from another node.
#[derive(Debug, Clone)]
pub struct ReceivedSos {
    pub node: NodeAddress,
    pub message: SosMessage,
    pub rssi: i16,
    pub snr: i8,
    pub received_at: Instant,
    pub acknowledged: bool,
}

struct ActiveSos {
    kind: EmergencyKind,
    message: Vec<u8, SOS_MESSAGE_LEN>,
    started: Instant,
    last_broadcast: Option<Instant>,
}

/// Emergency statistics.
#[derive(Debug, Copy, Clone, Default)]
pub struct EmergencyStats {
    pub activations: u32,
    pub broadcasts: u32,
    pub received: u32,
    pub acknowledged: u32,
}

/// The emergency broadcaster.
pub struct Emergency {
    active: Option<ActiveSos>,
    received: Vec<ReceivedSos, MAX_ACTIVE_SOS>,
    latitude: i32,
    longitude: i32,
    altitude: i32,
    gps_valid: bool,
    battery: u8,
    stats: EmergencyStats,
}

impl Emergency {
    pub fn new() -> Self {
        Emergency {
            active: None,
            received: Vec::new(),
            latitude: 0,
            longitude: 0,
            altitude: 0,
            gps_valid: false,
            battery: 100,
            stats: EmergencyStats::default(),
        }
    }

    /// Activates SOS mode. Broadcasting starts on the next tick.
    pub fn activate(&mut self, kind: EmergencyKind, message: &[u8], now: Instant) -> Result<(), Error> {
        if message.len() > SOS_MESSAGE_LEN {
            return Err(Error::InvalidValue);
        }
        warn!("emergency: SOS activated ({:?})", kind);
        self.active = Some(ActiveSos {
            kind,
            message: Vec::from_slice(message).map_err(|_| Error::InvalidValue)?,
            started: now,
            last_broadcast: None,
        });
        self.stats.activations += 1;
        Ok(())
    }

    /// Cancels the active SOS and tells the network.
    pub fn cancel(&mut self, out: &mut Outbox) {
        if self.active.take().is_some() {
            info!("emergency: SOS cancelled");
            let _ = out.push(OutFrame::broadcast(
                PacketType::Sos,
                &[SosPacketType::Cancel.into()],
                PRIO_EMERGENCY,
            ));
        }
    }

    /// Whether an SOS is currently being broadcast.
    pub fn is_active(&self) -> bool {
        self.active.is_some()
    }

    /// Updates the position stamped into SOS broadcasts.
    pub fn set_position(&mut self, latitude: i32, longitude: i32, altitude: i32) {
        self.latitude = latitude;
        self.longitude = longitude;
        self.altitude = altitude;
        self.gps_valid = true;
    }

    /// Updates the battery level stamped into SOS broadcasts.
    pub fn set_battery(&mut self, percent: u8) {
        self.battery = percent.min(100);
    }

    /// Periodic update: broadcast and auto-cancel.
    pub fn tick(&mut self, now: Instant, out: &mut Outbox) {
        let sos = match self.active.as_mut() {
            Some(s) => s,
            None => return,
        };

        if now.duration_since(sos.started) >= SOS_MAX_DURATION {
            info!("emergency: SOS auto-cancelled after max duration");
            self.cancel(out);
            return;
        }

        let due = match sos.last_broadcast {
            None => true,
            Some(at) => now.duration_since(at) >= SOS_INTERVAL,
        };
        if !due {
            return;
        }

        let mut flags = SosFlags::empty();
        if self.gps_valid {
            flags |= SosFlags::GPS_VALID;
        }
        if self.battery < 20 {
            flags |= SosFlags::BATTERY_LOW;
        }

        let msg = SosMessage {
            kind: sos.kind,
            flags,
            latitude: self.latitude,
            longitude: self.longitude,
            altitude: self.altitude,
            battery: self.battery,
            stamp: sos.started.raw_millis(),
            message: sos.message.clone(),
        };

        let mut buf = [0; MAX_PAYLOAD_LEN];
        buf[0] = SosPacketType::Alert.into();
        let mut w = ByteWriter::new(&mut buf[1..]);
        if msg.to_bytes(&mut w).is_err() {
            return;
        }
        let used = 1 + (MAX_PAYLOAD_LEN - 1 - w.space_left());

        // Maximum reach: slowest SF, maximum power, top priority.
        let mut frame = OutFrame::broadcast(PacketType::Sos, &buf[..used], PRIO_EMERGENCY);
        frame.sf = Some(SpreadingFactor::SF12);
        frame.tx_power = Some(SOS_TX_POWER);
        if out.push(frame).is_ok() {
            sos.last_broadcast = Some(now);
            self.stats.broadcasts += 1;
        }
    }

    /// Handles an incoming emergency frame (payload including the sub-type byte).
    pub fn handle_frame(
        &mut self,
        from: NodeAddress,
        payload: &[u8],
        rssi: i16,
        snr: i8,
        now: Instant,
        events: &mut EventQueue,
    ) {
        let mut reader = ByteReader::new(payload);
        let sub = match reader.read_u8() {
            Ok(b) => SosPacketType::from(b),
            Err(_) => return,
        };

        match sub {
            SosPacketType::Alert => {
                let msg = match SosMessage::from_bytes(&mut reader) {
                    Ok(m) => m,
                    Err(_) => return,
                };
                self.stats.received += 1;

                if let Some(existing) = self.received.iter_mut().find(|r| r.node == from) {
                    existing.message = msg.clone();
                    existing.rssi = rssi;
                    existing.snr = snr;
                    existing.received_at = now;
                } else {
                    if self.received.is_full() {
                        // Oldest alert makes room.
                        let victim = self
                            .received
                            .iter()
                            .enumerate()
                            .max_by_key(|(_, r)| now.duration_since(r.received_at).as_millis())
                            .map(|(i, _)| i);
                        if let Some(i) = victim {
                            self.received.swap_remove(i);
                        }
                    }
                    let _ = self.received.push(ReceivedSos {
                        node: from,
                        message: msg.clone(),
                        rssi,
                        snr,
                        received_at: now,
                        acknowledged: false,
                    });
                    // Only first sighting of a node's SOS is surfaced.
                    events.push(Event::SosReceived { from, message: msg });
                }
            }
            SosPacketType::Ack => {
                if self.active.is_some() {
                    info!("emergency: SOS acknowledged by {:?}", from);
                    self.stats.acknowledged += 1;
                }
            }
            SosPacketType::Cancel => {
                if let Some(i) = self.received.iter().position(|r| r.node == from) {
                    self.received.swap_remove(i);
                    events.push(Event::SosCleared { from });
                }
            }
            SosPacketType::Unknown(_) => {}
        }
    }

    /// Acknowledges a received SOS with a unicast to the distressed node.
    pub fn acknowledge(&mut self, node: NodeAddress, out: &mut Outbox) -> Result<(), Error> {
        let entry = self
            .received
            .iter_mut()
            .find(|r| r.node == node)
            .ok_or(Error::InvalidValue)?;
        entry.acknowledged = true;
        out.unicast(
            node,
            PacketType::Sos,
            &[SosPacketType::Ack.into()],
            PRIO_EMERGENCY,
        )
    }

    /// Iterates over currently tracked remote alerts.
    pub fn received(&self) -> impl Iterator<Item = &ReceivedSos> {
        self.received.iter()
    }

    /// Number of tracked remote alerts.
    pub fn active_alerts(&self) -> usize {
        self.received.len()
    }

    pub fn stats(&self) -> EmergencyStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u32) -> Instant {
        Instant::from_raw_millis(ms)
    }

    #[test]
    fn broadcasts_every_interval_with_overrides() {
        let mut em = Emergency::new();
        em.set_position(407_128_000, -740_060_000, 1500);
        em.set_battery(15);
        em.activate(EmergencyKind::Rescue, b"need water", at(0)).unwrap();

        let mut out = Outbox::new();
        em.tick(at(1), &mut out);
        let frame = out.pop().expect("sos broadcast");
        assert!(frame.dest.is_broadcast());
        assert_eq!(frame.sf, Some(SpreadingFactor::SF12));
        assert_eq!(frame.tx_power, Some(SOS_TX_POWER));

        let msg = SosMessage::from_bytes(&mut ByteReader::new(&frame.payload[1..])).unwrap();
        assert_eq!(msg.kind, EmergencyKind::Rescue);
        assert!(msg.flags.contains(SosFlags::GPS_VALID | SosFlags::BATTERY_LOW));
        assert_eq!(msg.message.as_slice(), &b"need water"[..]);

        // Not again until the interval elapses.
        em.tick(at(5_000), &mut out);
        assert!(out.pop().is_none());
        em.tick(at(10_001), &mut out);
        assert!(out.pop().is_some());
    }

    #[test]
    fn auto_cancel_after_max_duration() {
        let mut em = Emergency::new();
        em.activate(EmergencyKind::General, b"", at(0)).unwrap();
        let mut out = Outbox::new();

        em.tick(at(SOS_MAX_DURATION.as_millis()), &mut out);
        assert!(!em.is_active());
        // The cancel notice went out.
        let frame = out.pop().unwrap();
        assert_eq!(frame.payload[0], u8::from(SosPacketType::Cancel));
    }

    #[test]
    fn tracks_and_acknowledges_remote_sos() {
        let mut sender = Emergency::new();
        sender.activate(EmergencyKind::Medical, b"help", at(0)).unwrap();
        let mut out = Outbox::new();
        sender.tick(at(1), &mut out);
        let frame = out.pop().unwrap();

        let mut receiver = Emergency::new();
        let mut events = EventQueue::new();
        receiver.handle_frame(NodeAddress::new(0xA1), &frame.payload, -90, 3, at(2), &mut events);
        assert_eq!(receiver.active_alerts(), 1);
        assert!(matches!(events.pop(), Some(Event::SosReceived { .. })));

        // A repeat broadcast refreshes the entry without a second event.
        receiver.handle_frame(NodeAddress::new(0xA1), &frame.payload, -88, 4, at(3), &mut events);
        assert_eq!(receiver.active_alerts(), 1);
        assert!(events.pop().is_none());

        let mut ack_out = Outbox::new();
        receiver.acknowledge(NodeAddress::new(0xA1), &mut ack_out).unwrap();
        let ack = ack_out.pop().unwrap();
        assert_eq!(ack.dest, NodeAddress::new(0xA1));
        assert_eq!(ack.payload[0], u8::from(SosPacketType::Ack));
    }
}
