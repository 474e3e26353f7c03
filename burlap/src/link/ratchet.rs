//! Signal-style double ratchet for per-message forward secrecy.
//!
//! The responder of a link handshake (Bob) keeps his handshake key pair as his first DH ratchet
//! side; the initiator (Alice) immediately performs one DH ratchet against it. From then on,
//! every message carries the sender's current DH public key in a clear header. A receiver that
//! sees a new DH public key saves the remaining keys of its receive chain for out-of-order
//! arrivals, mixes the DH output into the root key, and derives fresh chains.
//!
//! Key schedule (all BLAKE2b):
//!
//! ```notrust
//! (root', chain)  = BLAKE2b-512(root ‖ DH output)        -- DH ratchet step
//! message_key     = BLAKE2b-256(chain ‖ 0x01)            -- symmetric step
//! chain'          = BLAKE2b-256(chain ‖ 0x02)
//! ```
//!
//! Message keys are used once and wiped. The skipped-key map holds at most
//! [`MAX_SKIPPED_KEYS`] entries, keyed by `(dh_public, message_number)`; the oldest entry is
//! evicted when it overflows. A frame that would require skipping further ahead than the map can
//! hold is treated as an attack on the association and reported as [`RatchetError::TooFarAhead`].

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::crypto::{self, TAG_LEN};
use crate::Error;
use core::fmt;
use heapless::Vec;
use rand_core::{CryptoRng, RngCore};
use zeroize::Zeroize;

/// Maximum number of skipped message keys retained per link.
pub const MAX_SKIPPED_KEYS: usize = 100;

/// Length of the clear ratchet header preceding every ciphertext.
pub const RATCHET_HEADER_LEN: usize = 40;

/// Bytes a ratchet message adds on top of the plaintext.
pub const RATCHET_OVERHEAD: usize = RATCHET_HEADER_LEN + TAG_LEN;

/// Errors produced while advancing the ratchet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RatchetError {
    /// The message number is further ahead than the skipped-key map could ever bridge.
    ///
    /// This is fatal to the association; the caller must tear the link down.
    TooFarAhead,

    /// The frame is structurally invalid (too short for header and tag).
    BadFrame,

    /// Authentication failed, or the message key for a replayed number is already consumed.
    AuthFailed,
}

impl fmt::Display for RatchetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RatchetError::TooFarAhead => "message skips beyond the key window",
            RatchetError::BadFrame => "malformed ratchet frame",
            RatchetError::AuthFailed => "authentication failed or key consumed",
        })
    }
}

/// Clear header carried by every ratchet message.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
struct RatchetHeader {
    /// Sender's current DH ratchet public key.
    dh_public: [u8; 32],
    /// Number of messages in the sender's previous sending chain.
    prev_chain_len: u32,
    /// Message number within the current sending chain.
    message_num: u32,
}

impl ToBytes for RatchetHeader {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(&self.dh_public)?;
        writer.write_u32_le(self.prev_chain_len)?;
        writer.write_u32_le(self.message_num)
    }
}

impl<'a> FromBytes<'a> for RatchetHeader {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        Ok(RatchetHeader {
            dh_public: bytes.read_array()?,
            prev_chain_len: bytes.read_u32_le()?,
            message_num: bytes.read_u32_le()?,
        })
    }
}

struct SkippedKey {
    dh_public: [u8; 32],
    message_num: u32,
    key: [u8; 32],
}

impl Drop for SkippedKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Double ratchet state for one link.
pub struct Ratchet {
    dh_secret: [u8; 32],
    dh_public: [u8; 32],
    dh_remote: [u8; 32],
    root_key: [u8; 32],
    send_chain: [u8; 32],
    send_counter: u32,
    recv_chain: [u8; 32],
    recv_counter: u32,
    prev_send_len: u32,
    skipped: Vec<SkippedKey, MAX_SKIPPED_KEYS>,
}

/// Derives the next (chain, message key) pair from a chain key, wiping the old chain value.
fn advance_chain(chain: &mut [u8; 32]) -> [u8; 32] {
    let message_key = crypto::hash256(&[chain.as_slice(), &[0x01]]);
    let mut next = crypto::hash256(&[chain.as_slice(), &[0x02]]);
    chain.zeroize();
    chain.copy_from_slice(&next);
    next.zeroize();
    message_key
}

impl Ratchet {
    /// Initializes the initiator (Alice) side after a completed handshake.
    ///
    /// Alice performs her first DH ratchet immediately, so her first message already carries a
    /// fresh DH public key.
    pub fn init_alice<R: RngCore + CryptoRng>(
        shared_secret: &[u8; 32],
        remote_public: &[u8; 32],
        rng: &mut R,
    ) -> Self {
        let dh_secret = crypto::generate_secret(rng);
        let dh_public = crypto::x25519_public(&dh_secret);

        let mut dh_out = crypto::x25519_shared(&dh_secret, remote_public);
        let (root_key, send_chain) = crypto::kdf_split(shared_secret, &dh_out);
        dh_out.zeroize();

        Ratchet {
            dh_secret,
            dh_public,
            dh_remote: *remote_public,
            root_key,
            send_chain,
            send_counter: 0,
            recv_chain: [0; 32],
            recv_counter: 0,
            prev_send_len: 0,
            skipped: Vec::new(),
        }
    }

    /// Initializes the responder (Bob) side after a completed handshake.
    ///
    /// Bob keeps his handshake key pair as his first DH side; his chains are derived when the
    /// first message from Alice arrives.
    pub fn init_bob(
        shared_secret: &[u8; 32],
        our_secret: &[u8; 32],
        our_public: &[u8; 32],
    ) -> Self {
        Ratchet {
            dh_secret: *our_secret,
            dh_public: *our_public,
            dh_remote: [0; 32],
            root_key: *shared_secret,
            send_chain: [0; 32],
            send_counter: 0,
            recv_chain: [0; 32],
            recv_counter: 0,
            prev_send_len: 0,
            skipped: Vec::new(),
        }
    }

    /// Encrypts `plaintext` into `out`, returning the message length.
    ///
    /// `out` must have room for `plaintext.len() + RATCHET_OVERHEAD` bytes.
    pub fn encrypt(&mut self, plaintext: &[u8], out: &mut [u8]) -> Result<usize, Error> {
        let total = RATCHET_HEADER_LEN + plaintext.len() + TAG_LEN;
        if out.len() < total {
            return Err(Error::Eof);
        }

        let header = RatchetHeader {
            dh_public: self.dh_public,
            prev_chain_len: self.prev_send_len,
            message_num: self.send_counter,
        };
        header.to_bytes(&mut ByteWriter::new(&mut out[..RATCHET_HEADER_LEN]))?;

        let mut message_key = advance_chain(&mut self.send_chain);

        let mut nonce = [0; crypto::LINK_NONCE_LEN];
        nonce[..4].copy_from_slice(&self.send_counter.to_le_bytes());

        let (ad, body) = out.split_at_mut(RATCHET_HEADER_LEN);
        let ct_len = plaintext.len();
        body[..ct_len].copy_from_slice(plaintext);
        let tag = crypto::seal_link(&message_key, &nonce, ad, &mut body[..ct_len])?;
        body[ct_len..ct_len + TAG_LEN].copy_from_slice(&tag);
        message_key.zeroize();

        self.send_counter += 1;
        Ok(total)
    }

    /// Decrypts a ratchet message into `out`, returning the plaintext length.
    ///
    /// Out-of-order messages consume their stored skipped key and leave the chain untouched; a
    /// message carrying a new remote DH public key triggers a DH ratchet step first.
    pub fn decrypt<R: RngCore + CryptoRng>(
        &mut self,
        frame: &[u8],
        out: &mut [u8],
        rng: &mut R,
    ) -> Result<usize, RatchetError> {
        if frame.len() < RATCHET_OVERHEAD {
            return Err(RatchetError::BadFrame);
        }

        let header = RatchetHeader::from_bytes(&mut ByteReader::new(&frame[..RATCHET_HEADER_LEN]))
            .map_err(|_| RatchetError::BadFrame)?;

        if header.dh_public != self.dh_remote {
            // The remote moved to a new DH key: bank the rest of the old receive chain, then step.
            self.skip_to(header.prev_chain_len)?;
            self.dh_ratchet(&header.dh_public, rng);
        }
        if header.message_num > self.recv_counter {
            self.skip_to(header.message_num)?;
        }

        let mut message_key = match self.take_skipped(&header.dh_public, header.message_num) {
            Some(key) => key,
            None => {
                if header.message_num != self.recv_counter {
                    // Already consumed: a replayed or duplicated message.
                    return Err(RatchetError::AuthFailed);
                }
                let key = advance_chain(&mut self.recv_chain);
                self.recv_counter += 1;
                key
            }
        };

        let mut nonce = [0; crypto::LINK_NONCE_LEN];
        nonce[..4].copy_from_slice(&header.message_num.to_le_bytes());

        let ad = &frame[..RATCHET_HEADER_LEN];
        let ct = &frame[RATCHET_HEADER_LEN..frame.len() - TAG_LEN];
        let tag = &frame[frame.len() - TAG_LEN..];
        let pt_len = ct.len();
        if out.len() < pt_len {
            message_key.zeroize();
            return Err(RatchetError::BadFrame);
        }
        out[..pt_len].copy_from_slice(ct);
        let result = crypto::open_link(&message_key, &nonce, ad, &mut out[..pt_len], tag);
        message_key.zeroize();

        match result {
            Ok(()) => Ok(pt_len),
            Err(_) => {
                out[..pt_len].zeroize();
                Err(RatchetError::AuthFailed)
            }
        }
    }

    /// Number of keys currently held for out-of-order messages.
    pub fn skipped_len(&self) -> usize {
        self.skipped.len()
    }

    /// Advances the receive chain up to (not including) `until`, banking each skipped key.
    fn skip_to(&mut self, until: u32) -> Result<(), RatchetError> {
        if until > self.recv_counter + MAX_SKIPPED_KEYS as u32 {
            return Err(RatchetError::TooFarAhead);
        }

        while self.recv_counter < until {
            let key = advance_chain(&mut self.recv_chain);
            if self.skipped.is_full() {
                // Oldest entry goes; its Drop impl wipes the key.
                self.skipped.remove(0);
            }
            let _ = self.skipped.push(SkippedKey {
                dh_public: self.dh_remote,
                message_num: self.recv_counter,
                key,
            });
            self.recv_counter += 1;
        }
        Ok(())
    }

    /// Removes and returns the skipped key for `(dh_public, message_num)`.
    fn take_skipped(&mut self, dh_public: &[u8; 32], message_num: u32) -> Option<[u8; 32]> {
        let i = self
            .skipped
            .iter()
            .position(|s| s.message_num == message_num && &s.dh_public == dh_public)?;
        let key = self.skipped[i].key;
        self.skipped.remove(i);
        Some(key)
    }

    /// Performs a DH ratchet step against the remote's new public key.
    fn dh_ratchet<R: RngCore + CryptoRng>(&mut self, remote_public: &[u8; 32], rng: &mut R) {
        self.prev_send_len = self.send_counter;
        self.dh_remote = *remote_public;

        // New receive chain from the current key pair.
        let mut dh_out = crypto::x25519_shared(&self.dh_secret, &self.dh_remote);
        let (root, recv_chain) = crypto::kdf_split(&self.root_key, &dh_out);
        self.root_key.zeroize();
        self.root_key = root;
        self.recv_chain.zeroize();
        self.recv_chain = recv_chain;
        self.recv_counter = 0;

        // Fresh key pair, then a new sending chain from its DH output.
        self.dh_secret.zeroize();
        self.dh_secret = crypto::generate_secret(rng);
        self.dh_public = crypto::x25519_public(&self.dh_secret);

        dh_out.zeroize();
        dh_out = crypto::x25519_shared(&self.dh_secret, &self.dh_remote);
        let (root, send_chain) = crypto::kdf_split(&self.root_key, &dh_out);
        self.root_key.zeroize();
        self.root_key = root;
        self.send_chain.zeroize();
        self.send_chain = send_chain;
        self.send_counter = 0;
        dh_out.zeroize();
    }
}

impl Drop for Ratchet {
    fn drop(&mut self) {
        self.dh_secret.zeroize();
        self.root_key.zeroize();
        self.send_chain.zeroize();
        self.recv_chain.zeroize();
        // Skipped keys wipe themselves on drop.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_rng::TestRng;

    fn pair(rng: &mut TestRng) -> (Ratchet, Ratchet) {
        // Simulate the handshake: Bob's key pair is the responder ephemeral.
        let bob_secret = crypto::generate_secret(rng);
        let bob_public = crypto::x25519_public(&bob_secret);
        let shared = [0x55; 32];

        let alice = Ratchet::init_alice(&shared, &bob_public, rng);
        let bob = Ratchet::init_bob(&shared, &bob_secret, &bob_public);
        (alice, bob)
    }

    fn send(from: &mut Ratchet, msg: &[u8]) -> Vec<u8, 512> {
        let mut buf = [0; 512];
        let n = from.encrypt(msg, &mut buf).unwrap();
        Vec::from_slice(&buf[..n]).unwrap()
    }

    fn recv(to: &mut Ratchet, frame: &[u8], rng: &mut TestRng) -> Result<Vec<u8, 512>, RatchetError> {
        let mut buf = [0; 512];
        let n = to.decrypt(frame, &mut buf, rng)?;
        Ok(Vec::from_slice(&buf[..n]).unwrap())
    }

    #[test]
    fn ping_pong_round_trip() {
        let mut rng = TestRng::new(1);
        let (mut alice, mut bob) = pair(&mut rng);

        let frame = send(&mut alice, b"hello bob");
        assert_eq!(
            recv(&mut bob, &frame, &mut rng).unwrap().as_slice(),
            &b"hello bob"[..]
        );

        let frame = send(&mut bob, b"hello alice");
        assert_eq!(
            recv(&mut alice, &frame, &mut rng).unwrap().as_slice(),
            &b"hello alice"[..]
        );

        // A few more turns to exercise repeated DH ratchet steps.
        for turn in 0..4u8 {
            let frame = send(&mut alice, &[turn; 16]);
            assert_eq!(
                recv(&mut bob, &frame, &mut rng).unwrap().as_slice(),
                &[turn; 16][..]
            );
            let frame = send(&mut bob, &[turn ^ 0xFF; 16]);
            assert_eq!(
                recv(&mut alice, &frame, &mut rng).unwrap().as_slice(),
                &[turn ^ 0xFF; 16][..]
            );
        }
    }

    #[test]
    fn out_of_order_uses_skipped_keys() {
        let mut rng = TestRng::new(2);
        let (mut alice, mut bob) = pair(&mut rng);

        let m1 = send(&mut alice, b"one");
        let m2 = send(&mut alice, b"two");
        let m3 = send(&mut alice, b"three");

        assert_eq!(recv(&mut bob, &m1, &mut rng).unwrap().as_slice(), &b"one"[..]);
        assert_eq!(
            recv(&mut bob, &m3, &mut rng).unwrap().as_slice(),
            &b"three"[..]
        );
        assert_eq!(bob.skipped_len(), 1);
        assert_eq!(recv(&mut bob, &m2, &mut rng).unwrap().as_slice(), &b"two"[..]);
        assert_eq!(bob.skipped_len(), 0);
    }

    #[test]
    fn replay_of_consumed_message_fails() {
        let mut rng = TestRng::new(3);
        let (mut alice, mut bob) = pair(&mut rng);

        let m1 = send(&mut alice, b"once");
        assert!(recv(&mut bob, &m1, &mut rng).is_ok());
        assert_eq!(recv(&mut bob, &m1, &mut rng), Err(RatchetError::AuthFailed));
    }

    #[test]
    fn old_keys_cannot_decrypt_after_ratchet_step() {
        let mut rng = TestRng::new(4);
        let (mut alice, mut bob) = pair(&mut rng);

        let m1 = send(&mut alice, b"first chain");
        assert!(recv(&mut bob, &m1, &mut rng).is_ok());

        // Bob's reply forces Alice to ratchet; Alice's next message forces Bob to.
        let reply = send(&mut bob, b"ack");
        assert!(recv(&mut alice, &reply, &mut rng).is_ok());
        let m2 = send(&mut alice, b"second chain");
        assert!(recv(&mut bob, &m2, &mut rng).is_ok());

        // The first frame's keys are gone from both sides.
        assert_eq!(recv(&mut bob, &m1, &mut rng), Err(RatchetError::AuthFailed));
    }

    #[test]
    fn too_far_ahead_is_fatal() {
        let mut rng = TestRng::new(5);
        let (mut alice, mut bob) = pair(&mut rng);

        // Fabricate a huge jump by consuming sender state silently.
        let mut sink = [0; 512];
        for _ in 0..(MAX_SKIPPED_KEYS as u32 + 2) {
            alice.encrypt(b"skipped", &mut sink).unwrap();
        }
        let frame = send(&mut alice, b"way ahead");
        assert_eq!(
            recv(&mut bob, &frame, &mut rng),
            Err(RatchetError::TooFarAhead)
        );
    }

    #[test]
    fn tampered_frame_fails_auth() {
        let mut rng = TestRng::new(6);
        let (mut alice, mut bob) = pair(&mut rng);

        let mut frame = send(&mut alice, b"integrity");
        let last = frame.len() - 1;
        frame[last] ^= 0x01;
        assert_eq!(
            recv(&mut bob, &frame, &mut rng),
            Err(RatchetError::AuthFailed)
        );
    }
}
