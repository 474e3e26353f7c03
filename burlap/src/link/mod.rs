//! The secure link: an authenticated, encrypted, sequenced association between two nodes.
//!
//! A link is established with an ephemeral X25519 handshake:
//!
//! ```notrust
//! CLOSED -- request() ------> PENDING
//! PENDING -- ACCEPT in -----> ACTIVE      (initiator, after proof check)
//! CLOSED -- REQUEST in ------> ACTIVE     (responder, auto-accept)
//! ACTIVE -- idle timeout ----> STALE -> CLOSED (keys wiped)
//! ```
//!
//! The initiator sends `REQUEST{link_id, public_key, identity, stamp}`; the responder derives
//! `shared = X25519(secret, their_public)` and answers `ACCEPT{link_id, public_key, proof}` where
//! `proof = BLAKE2b-128(shared)`. Directional keys come from
//! `BLAKE2b-256(shared ‖ link_id ‖ role)` with the role byte flipped between the two sides, so
//! each node's TX key is the peer's RX key.
//!
//! Data frames carry `{link_id, sequence, length, flags}` in the clear (authenticated as
//! associated data) followed by the XChaCha20-Poly1305 ciphertext and tag. The 24-byte nonce is
//! the sequence number followed by a direction byte, zero-padded; it contains no entropy. A
//! receiver rejects any sequence at or below its high watermark — unless the link runs the
//! double ratchet, where the skipped-key map takes over replay suppression and out-of-order
//! delivery.
//!
//! Every teardown path (reject, proof mismatch, idle reap, explicit close) wipes all key
//! material before the slot is reused.

pub mod ratchet;

use self::ratchet::{Ratchet, RatchetError, RATCHET_OVERHEAD};
use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::crypto::{self, TAG_LEN};
use crate::packet::{NodeAddress, PacketType, MAX_PAYLOAD_LEN};
use crate::stack::{Event, EventQueue, Outbox, PRIO_CONTROL, PRIO_DATA};
use crate::time::{Duration, Instant};
use crate::utils::HexSlice;
use crate::Error;
use heapless::Vec;
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

/// Maximum concurrent links.
pub const MAX_LINKS: usize = 8;

/// Length of a link identifier.
pub const LINK_ID_LEN: usize = 16;

/// A link identifier, chosen randomly by the initiator.
pub type LinkId = [u8; LINK_ID_LEN];

/// Handshake must complete within this window before it is retried.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Handshake attempts before the link is abandoned.
pub const MAX_HANDSHAKE_RETRIES: u8 = 3;

/// An idle ACTIVE link emits a keepalive this often.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

/// An ACTIVE link with no traffic for this long goes stale.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// A STALE link is reaped (keys wiped) after this additional grace period.
const STALE_GRACE: Duration = Duration::from_secs(60);

/// Largest plaintext a single link data frame can carry.
///
/// Bounded by the mesh payload minus sub-type byte, data header and ratchet overhead.
pub const MAX_LINK_PLAINTEXT: usize =
    MAX_PAYLOAD_LEN - 1 - DATA_HEADER_LEN - RATCHET_OVERHEAD;

const DATA_HEADER_LEN: usize = LINK_ID_LEN + 4 + 2 + 1;

/// Data-header flag marking a ratchet-encrypted frame.
const DATA_FLAG_RATCHET: u8 = 0x80;

enum_with_unknown! {
    /// Sub-type byte leading every link frame.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum LinkPacketType(u8) {
        /// Request to establish a link.
        Request = 0x10,
        /// Accept a link request.
        Accept = 0x11,
        /// Reject a link request.
        Reject = 0x12,
        /// Encrypted data over an active link.
        Data = 0x13,
        /// Idle-timer refresh, no payload beyond the link id.
        Keepalive = 0x15,
        /// Graceful shutdown notice.
        Close = 0x16,
    }
}

/// Lifecycle states of a link slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkState {
    /// No link (or slot not in use).
    Closed,
    /// Initiator waiting for the responder's ACCEPT.
    Pending,
    /// Handshake frames exchanged, proof not yet verified.
    Handshake,
    /// Established; data may flow.
    Active,
    /// Idle beyond the timeout; will be reaped unless traffic resumes.
    Stale,
}

/// Handshake request, initiator to responder.
struct LinkRequest {
    link_id: LinkId,
    public_key: [u8; 32],
    identity: [u8; 32],
    stamp: u32,
    flags: u8,
}

impl ToBytes for LinkRequest {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&self.link_id)?;
        writer.write_slice(&self.public_key)?;
        writer.write_slice(&self.identity)?;
        writer.write_u32_le(self.stamp)?;
        writer.write_u8(self.flags)
    }
}

impl<'a> FromBytes<'a> for LinkRequest {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(LinkRequest {
            link_id: bytes.read_array()?,
            public_key: bytes.read_array()?,
            identity: bytes.read_array()?,
            stamp: bytes.read_u32_le()?,
            flags: bytes.read_u8()?,
        })
    }
}

/// Handshake acceptance, responder to initiator.
struct LinkAccept {
    link_id: LinkId,
    public_key: [u8; 32],
    proof: [u8; 16],
}

impl ToBytes for LinkAccept {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&self.link_id)?;
        writer.write_slice(&self.public_key)?;
        writer.write_slice(&self.proof)
    }
}

impl<'a> FromBytes<'a> for LinkAccept {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(LinkAccept {
            link_id: bytes.read_array()?,
            public_key: bytes.read_array()?,
            proof: bytes.read_array()?,
        })
    }
}

/// Clear header of a link data frame, authenticated as associated data.
struct DataHeader {
    link_id: LinkId,
    sequence: u32,
    length: u16,
    flags: u8,
}

impl ToBytes for DataHeader {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&self.link_id)?;
        writer.write_u32_le(self.sequence)?;
        writer.write_u16_le(self.length)?;
        writer.write_u8(self.flags)
    }
}

impl<'a> FromBytes<'a> for DataHeader {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(DataHeader {
            link_id: bytes.read_array()?,
            sequence: bytes.read_u32_le()?,
            length: bytes.read_u16_le()?,
            flags: bytes.read_u8()?,
        })
    }
}

/// Traffic counters of one link.
#[derive(Debug, Copy, Clone, Default)]
pub struct LinkStats {
    pub packets_in: u32,
    pub packets_out: u32,
    pub bytes_in: u32,
    pub bytes_out: u32,
    pub last_rssi: i16,
    pub last_snr: i8,
}

struct Link {
    id: LinkId,
    peer: NodeAddress,
    state: LinkState,
    initiator: bool,

    local_secret: [u8; 32],
    local_public: [u8; 32],
    peer_public: [u8; 32],
    shared_secret: [u8; 32],
    tx_key: [u8; 32],
    rx_key: [u8; 32],

    ratchet: Option<Ratchet>,

    tx_seq: u32,
    rx_seq: u32,

    created_at: Instant,
    last_activity: Instant,
    last_keepalive: Instant,
    handshake_retries: u8,

    stats: LinkStats,
}

impl Link {
    /// Derives directional keys from the shared secret.
    ///
    /// The role byte differs between the two sides so that each node's TX key is the peer's RX
    /// key.
    fn derive_keys(&mut self) {
        self.shared_secret = crypto::x25519_shared(&self.local_secret, &self.peer_public);
        let (tx_role, rx_role) = if self.initiator {
            (0x01, 0x02)
        } else {
            (0x02, 0x01)
        };
        self.tx_key = crypto::hash256(&[&self.shared_secret, &self.id, &[tx_role]]);
        self.rx_key = crypto::hash256(&[&self.shared_secret, &self.id, &[rx_role]]);
    }

    /// Overwrites all key material. Called on every path that leaves the slot.
    fn wipe(&mut self) {
        self.local_secret.zeroize();
        self.shared_secret.zeroize();
        self.tx_key.zeroize();
        self.rx_key.zeroize();
        self.ratchet = None; // the ratchet wipes itself on drop
        self.state = LinkState::Closed;
    }
}

/// Fixed-capacity manager of all links on this node.
pub struct LinkManager {
    links: Vec<Link, MAX_LINKS>,
    node: NodeAddress,
    forward_secrecy: bool,
    auto_accept: bool,
}

impl LinkManager {
    pub fn new(node: NodeAddress, forward_secrecy: bool) -> Self {
        LinkManager {
            links: Vec::new(),
            node,
            forward_secrecy,
            auto_accept: true,
        }
    }

    /// Controls whether incoming link requests are accepted (default) or rejected.
    pub fn set_auto_accept(&mut self, accept: bool) {
        self.auto_accept = accept;
    }

    /// Initiates a link to `peer`. Returns the chosen link id.
    ///
    /// If an active link to the peer already exists its id is returned unchanged.
    pub fn request<R: RngCore + CryptoRng>(
        &mut self,
        peer: NodeAddress,
        now: Instant,
        rng: &mut R,
        out: &mut Outbox,
    ) -> Result<LinkId, Error> {
        if let Some(i) = self.links.iter().position(|l| l.peer == peer) {
            match self.links[i].state {
                LinkState::Active | LinkState::Pending => return Ok(self.links[i].id),
                _ => {
                    // A stale carcass for this peer; wipe it and start over.
                    self.links[i].wipe();
                    self.links.swap_remove(i);
                }
            }
        }
        if self.links.is_full() {
            return Err(Error::CapacityExceeded);
        }

        let local_secret = crypto::generate_secret(rng);
        let local_public = crypto::x25519_public(&local_secret);
        let mut id = [0; LINK_ID_LEN];
        rng.fill_bytes(&mut id);

        let link = Link {
            id,
            peer,
            state: LinkState::Pending,
            initiator: true,
            local_secret,
            local_public,
            peer_public: [0; 32],
            shared_secret: [0; 32],
            tx_key: [0; 32],
            rx_key: [0; 32],
            ratchet: None,
            tx_seq: 0,
            rx_seq: 0,
            created_at: now,
            last_activity: now,
            last_keepalive: now,
            handshake_retries: 0,
            stats: LinkStats::default(),
        };
        debug!("link: requesting {:?} id={:?}", peer, HexSlice(&id));
        Self::send_request(&link, self.node, now, out)?;
        let _ = self.links.push(link);
        Ok(id)
    }

    fn send_request(
        link: &Link,
        node: NodeAddress,
        now: Instant,
        out: &mut Outbox,
    ) -> Result<(), Error> {
        let request = LinkRequest {
            link_id: link.id,
            public_key: link.local_public,
            identity: crypto::hash256(&[&node.raw().to_le_bytes()]),
            stamp: now.raw_millis(),
            flags: 0,
        };

        let mut buf = [0; 1 + 85];
        let mut w = ByteWriter::new(&mut buf);
        w.write_u8(LinkPacketType::Request.into())?;
        request.to_bytes(&mut w)?;
        out.unicast(link.peer, PacketType::Link, &buf, PRIO_CONTROL)
    }

    /// Sends `data` over the active link to `peer`.
    pub fn send(
        &mut self,
        peer: NodeAddress,
        data: &[u8],
        now: Instant,
        out: &mut Outbox,
    ) -> Result<(), Error> {
        if data.len() > MAX_LINK_PLAINTEXT {
            return Err(Error::InvalidValue);
        }
        let link = self
            .links
            .iter_mut()
            .find(|l| l.peer == peer && l.state == LinkState::Active)
            .ok_or(Error::InvalidValue)?;

        link.tx_seq += 1;
        let sequence = link.tx_seq;

        let mut buf = [0; MAX_PAYLOAD_LEN];
        buf[0] = LinkPacketType::Data.into();

        let total = if let Some(ratchet) = link.ratchet.as_mut() {
            // Ratchet frame: the ratchet's own header and tag wrap the payload.
            let mut blob = [0; MAX_PAYLOAD_LEN];
            let blob_len = ratchet.encrypt(data, &mut blob)?;

            let header = DataHeader {
                link_id: link.id,
                sequence,
                length: blob_len as u16,
                flags: DATA_FLAG_RATCHET,
            };
            header.to_bytes(&mut ByteWriter::new(&mut buf[1..1 + DATA_HEADER_LEN]))?;
            buf[1 + DATA_HEADER_LEN..1 + DATA_HEADER_LEN + blob_len]
                .copy_from_slice(&blob[..blob_len]);
            1 + DATA_HEADER_LEN + blob_len
        } else {
            let header = DataHeader {
                link_id: link.id,
                sequence,
                length: data.len() as u16,
                flags: 0,
            };
            header.to_bytes(&mut ByteWriter::new(&mut buf[1..1 + DATA_HEADER_LEN]))?;

            let mut nonce = [0; crypto::LINK_NONCE_LEN];
            nonce[..4].copy_from_slice(&sequence.to_le_bytes());
            nonce[4] = 0x01; // direction marker, sender's perspective

            let (ad, body) = buf[1..].split_at_mut(DATA_HEADER_LEN);
            body[..data.len()].copy_from_slice(data);
            let tag = crypto::seal_link(&link.tx_key, &nonce, ad, &mut body[..data.len()])?;
            body[data.len()..data.len() + TAG_LEN].copy_from_slice(&tag);
            1 + DATA_HEADER_LEN + data.len() + TAG_LEN
        };

        link.stats.packets_out += 1;
        link.stats.bytes_out += data.len() as u32;
        link.last_activity = now;
        out.unicast(peer, PacketType::Link, &buf[..total], PRIO_DATA)
    }

    /// Gracefully closes the link to `peer`, wiping its keys.
    pub fn close(&mut self, peer: NodeAddress, out: &mut Outbox, events: &mut EventQueue) {
        if let Some(i) = self.links.iter().position(|l| l.peer == peer) {
            if self.links[i].state == LinkState::Active {
                let mut buf = [0; 1 + LINK_ID_LEN];
                buf[0] = LinkPacketType::Close.into();
                buf[1..].copy_from_slice(&self.links[i].id);
                let _ = out.unicast(peer, PacketType::Link, &buf, PRIO_CONTROL);
            }
            self.reap(i, events);
        }
    }

    /// Dispatches an incoming link frame (payload including the sub-type byte).
    pub fn handle_frame<R: RngCore + CryptoRng>(
        &mut self,
        from: NodeAddress,
        payload: &[u8],
        rssi: i16,
        snr: i8,
        now: Instant,
        rng: &mut R,
        out: &mut Outbox,
        events: &mut EventQueue,
    ) {
        let mut reader = ByteReader::new(payload);
        let sub = match reader.read_u8() {
            Ok(b) => LinkPacketType::from(b),
            Err(_) => return,
        };

        match sub {
            LinkPacketType::Request => self.on_request(from, reader, rssi, snr, now, rng, out, events),
            LinkPacketType::Accept => self.on_accept(from, reader, rssi, snr, now, rng, events),
            LinkPacketType::Reject => self.on_reject(reader, events),
            LinkPacketType::Data => self.on_data(from, reader, rssi, snr, now, rng, events),
            LinkPacketType::Keepalive => self.on_keepalive(reader, now),
            LinkPacketType::Close => self.on_close(reader, events),
            LinkPacketType::Unknown(code) => {
                debug!("link: unknown sub-type 0x{:02x} from {:?}", code, from);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn on_request<R: RngCore + CryptoRng>(
        &mut self,
        from: NodeAddress,
        mut reader: ByteReader<'_>,
        rssi: i16,
        snr: i8,
        now: Instant,
        rng: &mut R,
        out: &mut Outbox,
        events: &mut EventQueue,
    ) {
        let request = match LinkRequest::from_bytes(&mut reader) {
            Ok(r) => r,
            Err(_) => return,
        };

        if !self.auto_accept {
            Self::send_id_frame(LinkPacketType::Reject, &request.link_id, from, out);
            return;
        }

        // Reuse an existing slot for this peer, or claim a free one.
        let slot = match self.links.iter().position(|l| l.peer == from) {
            Some(i) => {
                self.links[i].wipe();
                i
            }
            None => {
                if self.links.is_full() {
                    debug!("link: no free slots, rejecting {:?}", from);
                    Self::send_id_frame(LinkPacketType::Reject, &request.link_id, from, out);
                    return;
                }
                let _ = self.links.push(Link {
                    id: [0; LINK_ID_LEN],
                    peer: from,
                    state: LinkState::Closed,
                    initiator: false,
                    local_secret: [0; 32],
                    local_public: [0; 32],
                    peer_public: [0; 32],
                    shared_secret: [0; 32],
                    tx_key: [0; 32],
                    rx_key: [0; 32],
                    ratchet: None,
                    tx_seq: 0,
                    rx_seq: 0,
                    created_at: now,
                    last_activity: now,
                    last_keepalive: now,
                    handshake_retries: 0,
                    stats: LinkStats::default(),
                });
                self.links.len() - 1
            }
        };

        let fs = self.forward_secrecy;
        let link = &mut self.links[slot];
        link.id = request.link_id;
        link.peer = from;
        link.initiator = false;
        link.peer_public = request.public_key;
        link.local_secret = crypto::generate_secret(rng);
        link.local_public = crypto::x25519_public(&link.local_secret);
        link.created_at = now;
        link.last_activity = now;
        link.last_keepalive = now;
        link.tx_seq = 0;
        link.rx_seq = 0;
        link.stats = LinkStats {
            last_rssi: rssi,
            last_snr: snr,
            ..LinkStats::default()
        };
        link.derive_keys();

        let accept = LinkAccept {
            link_id: link.id,
            public_key: link.local_public,
            proof: crypto::hash128(&[&link.shared_secret]),
        };
        let mut buf = [0; 1 + 64];
        let mut w = ByteWriter::new(&mut buf);
        let _ = w.write_u8(LinkPacketType::Accept.into());
        let _ = accept.to_bytes(&mut w);
        let _ = out.unicast(from, PacketType::Link, &buf, PRIO_CONTROL);

        if fs {
            // Responder (Bob) keeps the handshake key pair as its first DH side.
            link.ratchet = Some(Ratchet::init_bob(
                &link.shared_secret,
                &link.local_secret,
                &link.local_public,
            ));
        }
        link.state = LinkState::Active;

        debug!("link: accepted {:?} id={:?}", from, HexSlice(&link.id));
        events.push(Event::LinkEstablished { peer: from });
    }

    fn on_accept<R: RngCore + CryptoRng>(
        &mut self,
        from: NodeAddress,
        mut reader: ByteReader<'_>,
        rssi: i16,
        snr: i8,
        now: Instant,
        rng: &mut R,
        events: &mut EventQueue,
    ) {
        let accept = match LinkAccept::from_bytes(&mut reader) {
            Ok(a) => a,
            Err(_) => return,
        };

        let i = match self.links.iter().position(|l| l.id == accept.link_id) {
            Some(i) => i,
            None => {
                debug!("link: accept for unknown link from {:?}", from);
                return;
            }
        };
        if self.links[i].state != LinkState::Pending {
            return;
        }

        let fs = self.forward_secrecy;
        let link = &mut self.links[i];
        link.peer_public = accept.public_key;
        link.derive_keys();

        if crypto::hash128(&[&link.shared_secret]) != accept.proof {
            warn!("link: proof mismatch from {:?}, aborting", from);
            self.reap(i, events);
            return;
        }

        if fs {
            // Initiator (Alice) ratchets immediately against the responder's handshake key.
            link.ratchet = Some(Ratchet::init_alice(
                &link.shared_secret,
                &link.peer_public,
                rng,
            ));
        }

        link.state = LinkState::Active;
        link.last_activity = now;
        link.stats.last_rssi = rssi;
        link.stats.last_snr = snr;

        debug!("link: established to {:?}", from);
        events.push(Event::LinkEstablished { peer: from });
    }

    fn on_reject(&mut self, mut reader: ByteReader<'_>, events: &mut EventQueue) {
        let id: LinkId = match reader.read_array() {
            Ok(id) => id,
            Err(_) => return,
        };
        if let Some(i) = self.links.iter().position(|l| l.id == id) {
            debug!("link: rejected by {:?}", self.links[i].peer);
            self.reap(i, events);
        }
    }

    fn on_data<R: RngCore + CryptoRng>(
        &mut self,
        from: NodeAddress,
        reader: ByteReader<'_>,
        rssi: i16,
        snr: i8,
        now: Instant,
        rng: &mut R,
        events: &mut EventQueue,
    ) {
        let body = reader.into_rest();
        if body.len() < DATA_HEADER_LEN + TAG_LEN {
            return;
        }
        let header = match DataHeader::from_bytes(&mut ByteReader::new(&body[..DATA_HEADER_LEN])) {
            Ok(h) => h,
            Err(_) => return,
        };

        let i = match self.links.iter().position(|l| l.id == header.link_id) {
            Some(i) => i,
            None => {
                debug!("link: data for unknown link from {:?}", from);
                return;
            }
        };
        if self.links[i].state != LinkState::Active && self.links[i].state != LinkState::Stale {
            return;
        }

        let link = &mut self.links[i];
        let body = &body[DATA_HEADER_LEN..];
        if body.len() != usize::from(header.length) + if header.flags & DATA_FLAG_RATCHET != 0 { 0 } else { TAG_LEN } {
            return;
        }

        let mut plaintext = [0; MAX_PAYLOAD_LEN];
        let pt_len;

        if header.flags & DATA_FLAG_RATCHET != 0 {
            let ratchet = match link.ratchet.as_mut() {
                Some(r) => r,
                None => return,
            };
            match ratchet.decrypt(body, &mut plaintext, rng) {
                Ok(n) => pt_len = n,
                Err(RatchetError::TooFarAhead) => {
                    warn!("link: ratchet skip too far ahead, tearing down {:?}", from);
                    self.reap(i, events);
                    return;
                }
                Err(_) => {
                    debug!("link: ratchet decrypt failed from {:?}", from);
                    return;
                }
            }
        } else {
            // Strictly increasing sequence numbers double as replay protection.
            if header.sequence <= link.rx_seq {
                debug!("link: stale sequence {} from {:?}", header.sequence, from);
                return;
            }

            let mut nonce = [0; crypto::LINK_NONCE_LEN];
            nonce[..4].copy_from_slice(&header.sequence.to_le_bytes());
            nonce[4] = 0x01;

            let ct_len = usize::from(header.length);
            plaintext[..ct_len].copy_from_slice(&body[..ct_len]);
            let tag = &body[ct_len..ct_len + TAG_LEN];

            let mut header_bytes = [0; DATA_HEADER_LEN];
            let _ = header.to_bytes(&mut ByteWriter::new(&mut header_bytes));
            if crypto::open_link(&link.rx_key, &nonce, &header_bytes, &mut plaintext[..ct_len], tag)
                .is_err()
            {
                debug!("link: decrypt failed from {:?}", from);
                return;
            }
            pt_len = ct_len;
        }

        link.rx_seq = header.sequence;
        link.last_activity = now;
        link.state = LinkState::Active;
        link.stats.packets_in += 1;
        link.stats.bytes_in += pt_len as u32;
        link.stats.last_rssi = rssi;
        link.stats.last_snr = snr;

        events.push(Event::LinkData {
            peer: from,
            data: Vec::from_slice(&plaintext[..pt_len]).unwrap_or_default(),
        });
    }

    fn on_keepalive(&mut self, mut reader: ByteReader<'_>, now: Instant) {
        if let Ok(id) = reader.read_array::<LinkId>() {
            if let Some(link) = self.links.iter_mut().find(|l| l.id == id) {
                link.last_activity = now;
                link.state = LinkState::Active;
            }
        }
    }

    fn on_close(&mut self, mut reader: ByteReader<'_>, events: &mut EventQueue) {
        if let Ok(id) = reader.read_array::<LinkId>() {
            if let Some(i) = self.links.iter().position(|l| l.id == id) {
                debug!("link: remote closed {:?}", self.links[i].peer);
                self.reap(i, events);
            }
        }
    }

    /// Drives timeouts: handshake retries, keepalives, idle staleness and reaping.
    pub fn tick(&mut self, now: Instant, out: &mut Outbox, events: &mut EventQueue) {
        let mut i = 0;
        while i < self.links.len() {
            let state = self.links[i].state;
            match state {
                LinkState::Pending => {
                    if now.duration_since(self.links[i].created_at) > HANDSHAKE_TIMEOUT {
                        self.links[i].handshake_retries += 1;
                        if self.links[i].handshake_retries >= MAX_HANDSHAKE_RETRIES {
                            warn!("link: handshake timeout to {:?}", self.links[i].peer);
                            self.reap(i, events);
                            continue;
                        }
                        self.links[i].created_at = now;
                        let _ = Self::send_request(&self.links[i], self.node, now, out);
                    }
                }
                LinkState::Active => {
                    let idle = now.duration_since(self.links[i].last_activity);
                    if idle > IDLE_TIMEOUT {
                        debug!("link: {:?} went stale", self.links[i].peer);
                        self.links[i].state = LinkState::Stale;
                    } else if now.duration_since(self.links[i].last_keepalive)
                        > KEEPALIVE_INTERVAL
                    {
                        let mut buf = [0; 1 + LINK_ID_LEN];
                        buf[0] = LinkPacketType::Keepalive.into();
                        buf[1..].copy_from_slice(&self.links[i].id);
                        let _ = out.unicast(
                            self.links[i].peer,
                            PacketType::Link,
                            &buf,
                            PRIO_CONTROL,
                        );
                        self.links[i].last_keepalive = now;
                    }
                }
                LinkState::Stale => {
                    if now.duration_since(self.links[i].last_activity) > IDLE_TIMEOUT + STALE_GRACE
                    {
                        warn!("link: reaping idle link to {:?}", self.links[i].peer);
                        self.reap(i, events);
                        continue;
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }

    /// Current state of the link to `peer`.
    pub fn state(&self, peer: NodeAddress) -> LinkState {
        self.links
            .iter()
            .find(|l| l.peer == peer)
            .map(|l| l.state)
            .unwrap_or(LinkState::Closed)
    }

    /// Returns whether an established link to `peer` exists.
    pub fn is_active(&self, peer: NodeAddress) -> bool {
        self.state(peer) == LinkState::Active
    }

    /// Returns whether the link to `peer` runs the double ratchet.
    pub fn has_forward_secrecy(&self, peer: NodeAddress) -> bool {
        self.links
            .iter()
            .any(|l| l.peer == peer && l.ratchet.is_some())
    }

    /// Traffic counters for the link to `peer`.
    pub fn stats(&self, peer: NodeAddress) -> Option<LinkStats> {
        self.links.iter().find(|l| l.peer == peer).map(|l| l.stats)
    }

    /// Number of links in ACTIVE state.
    pub fn active_count(&self) -> usize {
        self.links
            .iter()
            .filter(|l| l.state == LinkState::Active)
            .count()
    }

    fn send_id_frame(
        sub: LinkPacketType,
        id: &LinkId,
        dest: NodeAddress,
        out: &mut Outbox,
    ) {
        let mut buf = [0; 1 + LINK_ID_LEN];
        buf[0] = sub.into();
        buf[1..].copy_from_slice(id);
        let _ = out.unicast(dest, PacketType::Link, &buf, PRIO_CONTROL);
    }

    /// Wipes and removes slot `i`, notifying the host.
    fn reap(&mut self, i: usize, events: &mut EventQueue) {
        let peer = self.links[i].peer;
        self.links[i].wipe();
        self.links.swap_remove(i);
        events.push(Event::LinkClosed { peer });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_rng::TestRng;

    const A: NodeAddress = NodeAddress::new(0xA1);
    const B: NodeAddress = NodeAddress::new(0xB2);

    fn at(ms: u32) -> Instant {
        Instant::from_raw_millis(ms)
    }

    /// Carries every queued link frame from `from_out` into `to`'s handler.
    fn deliver(
        from: NodeAddress,
        from_out: &mut Outbox,
        to: &mut LinkManager,
        rng: &mut TestRng,
        now: Instant,
        to_out: &mut Outbox,
        events: &mut EventQueue,
    ) {
        while let Some(frame) = from_out.pop() {
            assert_eq!(frame.ty, PacketType::Link);
            to.handle_frame(from, &frame.payload, -70, 8, now, rng, to_out, events);
        }
    }

    fn establish(
        forward_secrecy: bool,
        rng: &mut TestRng,
    ) -> (LinkManager, LinkManager, EventQueue) {
        let mut alice = LinkManager::new(A, forward_secrecy);
        let mut bob = LinkManager::new(B, forward_secrecy);
        let mut out_a = Outbox::new();
        let mut out_b = Outbox::new();
        let mut events = EventQueue::new();

        alice.request(B, at(0), rng, &mut out_a).unwrap();
        assert_eq!(alice.state(B), LinkState::Pending);

        deliver(A, &mut out_a, &mut bob, rng, at(10), &mut out_b, &mut events);
        assert_eq!(bob.state(A), LinkState::Active);

        deliver(B, &mut out_b, &mut alice, rng, at(20), &mut out_a, &mut events);
        assert_eq!(alice.state(B), LinkState::Active);
        (alice, bob, events)
    }

    fn data_frames(out: &mut Outbox) -> std::vec::Vec<std::vec::Vec<u8>> {
        let mut frames = std::vec::Vec::new();
        while let Some(f) = out.pop() {
            frames.push(f.payload.to_vec());
        }
        frames
    }

    fn expect_link_data(events: &mut EventQueue) -> (NodeAddress, std::vec::Vec<u8>) {
        loop {
            match events.pop() {
                Some(Event::LinkData { peer, data }) => return (peer, data.to_vec()),
                Some(_) => continue,
                None => panic!("no link data event"),
            }
        }
    }

    #[test]
    fn handshake_derives_matching_keys() {
        let mut rng = TestRng::new(1);
        let (mut alice, mut bob, _) = establish(false, &mut rng);

        // Each direction decrypts with the key the other side encrypts under.
        let mut out_a = Outbox::new();
        let mut out_b = Outbox::new();
        let mut events = EventQueue::new();

        alice.send(B, b"hi", at(100), &mut out_a).unwrap();
        deliver(A, &mut out_a, &mut bob, &mut rng, at(110), &mut out_b, &mut events);
        let (peer, data) = expect_link_data(&mut events);
        assert_eq!(peer, A);
        assert_eq!(data, b"hi");

        bob.send(A, b"hello back", at(120), &mut out_b).unwrap();
        deliver(B, &mut out_b, &mut alice, &mut rng, at(130), &mut out_a, &mut events);
        let (peer, data) = expect_link_data(&mut events);
        assert_eq!(peer, B);
        assert_eq!(data, b"hello back");

        // One frame each way.
        assert_eq!(bob.stats(A).unwrap().packets_in, 1);
        assert_eq!(alice.stats(B).unwrap().packets_in, 1);
    }

    #[test]
    fn replayed_sequence_is_dropped() {
        let mut rng = TestRng::new(2);
        let (mut alice, mut bob, _) = establish(false, &mut rng);

        let mut out_a = Outbox::new();
        let mut out_b = Outbox::new();
        let mut events = EventQueue::new();

        alice.send(B, b"one", at(100), &mut out_a).unwrap();
        let frames = data_frames(&mut out_a);
        assert_eq!(frames.len(), 1);

        bob.handle_frame(A, &frames[0], -70, 8, at(110), &mut rng, &mut out_b, &mut events);
        assert_eq!(bob.stats(A).unwrap().packets_in, 1);

        // Replaying the same frame must not deliver a second time.
        bob.handle_frame(A, &frames[0], -70, 8, at(120), &mut rng, &mut out_b, &mut events);
        assert_eq!(bob.stats(A).unwrap().packets_in, 1);
    }

    #[test]
    fn ratchet_link_round_trip() {
        let mut rng = TestRng::new(3);
        let (mut alice, mut bob, _) = establish(true, &mut rng);
        assert!(alice.has_forward_secrecy(B));
        assert!(bob.has_forward_secrecy(A));

        let mut out_a = Outbox::new();
        let mut out_b = Outbox::new();
        let mut events = EventQueue::new();

        alice.send(B, b"fs data", at(100), &mut out_a).unwrap();
        deliver(A, &mut out_a, &mut bob, &mut rng, at(110), &mut out_b, &mut events);
        let (_, data) = expect_link_data(&mut events);
        assert_eq!(data, b"fs data");

        bob.send(A, b"fs reply", at(120), &mut out_b).unwrap();
        deliver(B, &mut out_b, &mut alice, &mut rng, at(130), &mut out_a, &mut events);
        let (_, data) = expect_link_data(&mut events);
        assert_eq!(data, b"fs reply");
    }

    #[test]
    fn tampered_accept_proof_aborts() {
        let mut rng = TestRng::new(4);
        let mut alice = LinkManager::new(A, false);
        let mut bob = LinkManager::new(B, false);
        let mut out_a = Outbox::new();
        let mut out_b = Outbox::new();
        let mut events = EventQueue::new();

        alice.request(B, at(0), &mut rng, &mut out_a).unwrap();
        deliver(A, &mut out_a, &mut bob, &mut rng, at(10), &mut out_b, &mut events);

        // Corrupt the proof in the ACCEPT before it reaches Alice.
        let mut accept = out_b.pop().unwrap();
        let last = accept.payload.len() - 1;
        accept.payload[last] ^= 0xFF;
        alice.handle_frame(B, &accept.payload, -70, 8, at(20), &mut rng, &mut out_a, &mut events);

        assert_eq!(alice.state(B), LinkState::Closed);
    }

    #[test]
    fn handshake_times_out_after_retries() {
        let mut rng = TestRng::new(5);
        let mut alice = LinkManager::new(A, false);
        let mut out = Outbox::new();
        let mut events = EventQueue::new();

        alice.request(B, at(0), &mut rng, &mut out).unwrap();
        while out.pop().is_some() {}

        // Two timeouts re-send the request, the third gives up.
        let step = HANDSHAKE_TIMEOUT.as_millis() + 1;
        alice.tick(at(step), &mut out, &mut events);
        assert_eq!(alice.state(B), LinkState::Pending);
        assert!(out.pop().is_some(), "request resent after first timeout");

        alice.tick(at(2 * step), &mut out, &mut events);
        assert_eq!(alice.state(B), LinkState::Pending);

        alice.tick(at(3 * step), &mut out, &mut events);
        assert_eq!(alice.state(B), LinkState::Closed);
    }

    #[test]
    fn idle_link_goes_stale_then_closes() {
        let mut rng = TestRng::new(6);
        let (mut alice, _bob, _) = establish(false, &mut rng);

        let mut out = Outbox::new();
        let mut events = EventQueue::new();

        let idle = IDLE_TIMEOUT.as_millis() + 1000;
        alice.tick(at(idle), &mut out, &mut events);
        assert_eq!(alice.state(B), LinkState::Stale);

        alice.tick(at(idle + STALE_GRACE.as_millis() + 1000), &mut out, &mut events);
        assert_eq!(alice.state(B), LinkState::Closed);
    }

    #[test]
    fn keepalive_refreshes_idle_timer() {
        let mut rng = TestRng::new(7);
        let (mut alice, mut bob, _) = establish(false, &mut rng);

        let mut out_a = Outbox::new();
        let mut out_b = Outbox::new();
        let mut events = EventQueue::new();

        // Alice's keepalive fires well before the idle timeout.
        let t = KEEPALIVE_INTERVAL.as_millis() + 1000;
        alice.tick(at(t), &mut out_a, &mut events);
        deliver(A, &mut out_a, &mut bob, &mut rng, at(t + 10), &mut out_b, &mut events);

        // Bob's idle timer was reset; he is still ACTIVE past his original deadline.
        bob.tick(at(t + IDLE_TIMEOUT.as_millis() - 1000), &mut out_b, &mut events);
        assert_eq!(bob.state(A), LinkState::Active);
    }
}
