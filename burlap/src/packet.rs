//! The mesh packet codec.
//!
//! Every frame on air starts with a fixed header followed by up to 255 payload bytes. All fields
//! are transmitted in little-endian byte order, packed without padding:
//!
//! ```notrust
//! LSB                                                                                  MSB
//! +---------+---------+-----+-------+-----------+--------+------+----------+-----------+
//! | version |  type   | ttl | flags | packet_id | source | dest | next_hop | hop_count |
//! | (4 bit) | (4 bit) | (8) |  (8)  |   (16)    |  (32)  | (32) |   (32)   |    (8)    |
//! +---------+---------+-----+-------+-----------+--------+------+----------+-----------+
//!       +------------+----------------+
//!       | seq_number | payload_length |
//!       |    (8)     |      (16)      |
//!       +------------+----------------+
//! ```
//!
//! The `version` nibble occupies the low half of the first byte, `type` the high half. A receiver
//! drops any frame whose version it does not implement and any frame whose `payload_length` field
//! disagrees with the number of bytes that actually arrived.
//!
//! Higher layers (link, group, DTN, emergency, geographic) put a one-byte sub-type in front of
//! their own sub-headers inside the payload; this module is only concerned with the outer header.

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::{Error, PROTOCOL_VERSION};
use bitflags::bitflags;
use core::fmt;

/// Length of the fixed packet header in bytes.
pub const HEADER_LEN: usize = 21;

/// Maximum payload carried by a single frame.
pub const MAX_PAYLOAD_LEN: usize = 255;

/// Size a frame buffer must have to hold any valid frame.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + MAX_PAYLOAD_LEN;

/// A 32-bit node address.
///
/// Addresses are derived from the node's long-term public key at first boot (see
/// [`derive_address`]) and treated as stable. `0` is reserved, `0xFFFFFFFF` is broadcast.
///
/// [`derive_address`]: ../fn.derive_address.html
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeAddress(u32);

impl NodeAddress {
    /// The reserved all-zero address. Never assigned to a node.
    pub const UNSPECIFIED: Self = NodeAddress(0);

    /// The broadcast address, addressing every node in range.
    pub const BROADCAST: Self = NodeAddress(0xFFFF_FFFF);

    /// Creates an address from its raw 32-bit value.
    pub const fn new(raw: u32) -> Self {
        NodeAddress(raw)
    }

    /// Returns the raw 32-bit value of this address.
    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Returns whether this is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Returns whether this is the reserved zero address.
    pub fn is_unspecified(&self) -> bool {
        *self == Self::UNSPECIFIED
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08X}", self.0)
    }
}

impl fmt::Debug for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

enum_with_unknown! {
    /// Value of the packet `type` nibble.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum PacketType(u8) {
        /// User data addressed to a node (or broadcast).
        Data = 0x1,
        /// Acknowledgment of an ACK-requested data frame.
        Ack = 0x2,
        /// AODV-style route discovery request.
        RouteRequest = 0x3,
        /// Route discovery reply, unicast along the reverse path.
        RouteReply = 0x4,
        /// Route invalidation notice.
        RouteError = 0x5,
        /// Neighbor probe carrying a signal-quality snapshot.
        Hello = 0x6,
        /// Node status report.
        Telemetry = 0x7,
        /// Periodic announcement: node name, ADR advertisement, claimed slot.
        Beacon = 0x8,
        /// MAC time source election frame.
        TimeSync = 0x9,
        /// Secure link sub-protocol (handshake, data, keepalive, close).
        Link = 0xA,
        /// Encrypted group channel sub-protocol.
        Group = 0xB,
        /// DTN bundle sub-protocol (bundles, fragments, custody signals).
        Bundle = 0xC,
        /// Emergency SOS sub-protocol.
        Sos = 0xD,
        /// Geographic sub-protocol (location beacons, geocast).
        Geo = 0xE,
    }
}

bitflags! {
    /// Per-frame control flags.
    pub struct Flags: u8 {
        /// Sender requests an acknowledgment from the final recipient.
        const ACK_REQ = 0x01;
        /// Payload is encrypted.
        const ENCRYPTED = 0x02;
        /// Frame is a broadcast (redundant with the destination address, kept for on-air parity).
        const BROADCAST = 0x04;
        /// Frame is a retransmission of an earlier frame with the same `packet_id`.
        const RETRANS = 0x08;
    }
}

/// The fixed per-frame header described in the module docs.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Header {
    /// Frame type.
    pub ty: PacketType,
    /// Remaining hop budget; a frame is dropped instead of forwarded when this would reach 0.
    pub ttl: u8,
    /// Control flags.
    pub flags: Flags,
    /// Sender-assigned, monotonically increasing frame id.
    pub packet_id: u16,
    /// Original sender.
    pub source: NodeAddress,
    /// Final recipient, or [`NodeAddress::BROADCAST`].
    pub destination: NodeAddress,
    /// Intended relay for unicast frames. Ignored on broadcasts.
    pub next_hop: NodeAddress,
    /// Number of times this frame has been forwarded.
    pub hop_count: u8,
    /// Per-sender wrapping sequence number, used for deduplication.
    pub seq_number: u8,
    /// Length of the payload following the header.
    pub payload_length: u16,
}

impl Header {
    /// Returns whether this frame is addressed to every node in range.
    pub fn is_broadcast(&self) -> bool {
        self.destination.is_broadcast()
    }

    /// Returns whether the sender requested an acknowledgment.
    pub fn needs_ack(&self) -> bool {
        self.flags.contains(Flags::ACK_REQ)
    }
}

impl ToBytes for Header {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        let ty = u8::from(self.ty);
        debug_assert!(ty < 0x10, "packet type exceeds nibble");
        writer.write_u8((PROTOCOL_VERSION & 0x0F) | (ty << 4))?;
        writer.write_u8(self.ttl)?;
        writer.write_u8(self.flags.bits())?;
        writer.write_u16_le(self.packet_id)?;
        writer.write_u32_le(self.source.raw())?;
        writer.write_u32_le(self.destination.raw())?;
        writer.write_u32_le(self.next_hop.raw())?;
        writer.write_u8(self.hop_count)?;
        writer.write_u8(self.seq_number)?;
        writer.write_u16_le(self.payload_length)
    }
}

impl<'a> FromBytes<'a> for Header {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        if bytes.bytes_left() < HEADER_LEN {
            return Err(Error::TooShort);
        }

        let vt = bytes.read_u8()?;
        if vt & 0x0F != PROTOCOL_VERSION {
            return Err(Error::UnsupportedVersion);
        }
        let ty = PacketType::from(vt >> 4);
        if let PacketType::Unknown(_) = ty {
            return Err(Error::UnknownType);
        }

        Ok(Header {
            ty,
            ttl: bytes.read_u8()?,
            flags: Flags::from_bits_truncate(bytes.read_u8()?),
            packet_id: bytes.read_u16_le()?,
            source: NodeAddress::new(bytes.read_u32_le()?),
            destination: NodeAddress::new(bytes.read_u32_le()?),
            next_hop: NodeAddress::new(bytes.read_u32_le()?),
            hop_count: bytes.read_u8()?,
            seq_number: bytes.read_u8()?,
            payload_length: bytes.read_u16_le()?,
        })
    }
}

/// Encodes a header and payload into `buf`, returning the number of bytes written.
///
/// # Panics
///
/// Panics when `header.payload_length` disagrees with `payload.len()`. A locally-assembled frame
/// with mismatched lengths is a programmer error, not a runtime condition.
pub fn encode(header: &Header, payload: &[u8], buf: &mut [u8]) -> Result<usize, Error> {
    assert_eq!(
        usize::from(header.payload_length),
        payload.len(),
        "header payload_length disagrees with payload"
    );
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(Error::InvalidValue);
    }

    let total = HEADER_LEN + payload.len();
    let mut writer = ByteWriter::new(buf);
    header.to_bytes(&mut writer)?;
    writer.write_slice(payload)?;
    Ok(total)
}

/// Decodes a received frame into its header and payload.
///
/// # Errors
///
/// * `TooShort` when fewer than [`HEADER_LEN`] bytes arrived.
/// * `UnsupportedVersion` when the version nibble is not ours.
/// * `UnknownType` when the type nibble names no known frame type.
/// * `PayloadLengthMismatch` when `payload_length` disagrees with the received byte count.
pub fn decode(frame: &[u8]) -> Result<(Header, &[u8]), Error> {
    let mut reader = ByteReader::new(frame);
    let header = Header::from_bytes(&mut reader)?;
    let payload = reader.read_rest();
    if payload.len() != usize::from(header.payload_length) {
        return Err(Error::PayloadLengthMismatch);
    }
    Ok((header, payload))
}

/// An owned, fixed-size buffer holding one encoded frame.
///
/// Used wherever a frame outlives the buffer it was decoded from: the MAC transmit queue and the
/// pending-ACK retransmission cache.
#[derive(Clone)]
pub struct PacketBuf {
    bytes: [u8; MAX_FRAME_LEN],
    len: u16,
}

impl PacketBuf {
    /// Encodes `header` and `payload` into a fresh buffer.
    pub fn from_parts(header: &Header, payload: &[u8]) -> Result<Self, Error> {
        let mut bytes = [0; MAX_FRAME_LEN];
        let len = encode(header, payload, &mut bytes)?;
        Ok(PacketBuf {
            bytes,
            len: len as u16,
        })
    }

    /// Returns the encoded frame.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..usize::from(self.len)]
    }

    /// Decodes the stored frame back into header and payload.
    pub fn decode(&self) -> Result<(Header, &[u8]), Error> {
        decode(self.as_slice())
    }

    /// Sets the `RETRANS` flag in the stored frame, in place.
    pub fn mark_retransmission(&mut self) {
        // Flags live in the third header byte.
        self.bytes[2] |= Flags::RETRANS.bits();
    }
}

impl fmt::Debug for PacketBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.decode() {
            Ok((header, _)) => write!(f, "PacketBuf({:?})", header),
            Err(e) => write!(f, "PacketBuf(<{}>)", e),
        }
    }
}
