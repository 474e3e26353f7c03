//! Cryptographic primitives shared by the secure link, the group channel and the ratchet.
//!
//! Everything in here is a thin wrapper over the BLAKE2b, X25519 and ChaCha20-Poly1305
//! implementations from the RustCrypto/dalek crates. Two AEAD constructions exist side by side
//! and MUST stay distinct for on-air compatibility:
//!
//! * the per-link path uses XChaCha20-Poly1305 with a 24-byte nonce built from the frame
//!   sequence number and a direction byte,
//! * the group PSK path uses ChaCha20-Poly1305 with a 12-byte nonce built from the group
//!   sequence number and the group id.
//!
//! Nonces are derived purely from protocol state; no entropy is mixed in.

use crate::packet::NodeAddress;
use crate::Error;
use blake2::digest::consts::{U16, U32};
use blake2::{Blake2b, Blake2b512, Digest};
use chacha20poly1305::{
    AeadInPlace, ChaCha20Poly1305, Key, KeyInit, Nonce, Tag, XChaCha20Poly1305, XNonce,
};
use rand_core::{CryptoRng, RngCore};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

type Blake2b256 = Blake2b<U32>;
type Blake2b128 = Blake2b<U16>;

/// Symmetric key length (256-bit).
pub(crate) const KEY_LEN: usize = 32;

/// Authentication tag length appended to every ciphertext.
pub(crate) const TAG_LEN: usize = 16;

/// Nonce length of the per-link AEAD (XChaCha20-Poly1305).
pub(crate) const LINK_NONCE_LEN: usize = 24;

/// Nonce length of the group AEAD (ChaCha20-Poly1305).
pub(crate) const GROUP_NONCE_LEN: usize = 12;

/// BLAKE2b-256 over the concatenation of `parts`.
pub(crate) fn hash256(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// BLAKE2b-128 over the concatenation of `parts`. Used for handshake proofs.
pub(crate) fn hash128(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Blake2b128::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// BLAKE2b-512 over `a ‖ b`, split into two 256-bit keys.
///
/// This is the KDF used by the ratchet: mixing a root key with a DH output yields the next root
/// key and a chain key in one hash invocation.
pub(crate) fn kdf_split(a: &[u8; 32], b: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let mut hasher = Blake2b512::new();
    hasher.update(a);
    hasher.update(b);
    let mut wide = hasher.finalize();

    let mut first = [0; 32];
    let mut second = [0; 32];
    first.copy_from_slice(&wide[..32]);
    second.copy_from_slice(&wide[32..]);
    wide.as_mut_slice().zeroize();
    (first, second)
}

/// Generates a fresh X25519 secret key (clamped).
pub(crate) fn generate_secret<R: RngCore + CryptoRng>(rng: &mut R) -> [u8; 32] {
    let mut raw = [0; 32];
    rng.fill_bytes(&mut raw);
    let secret = StaticSecret::from(raw);
    raw.zeroize();
    secret.to_bytes()
}

/// Derives the X25519 public key for a secret key.
pub(crate) fn x25519_public(secret: &[u8; 32]) -> [u8; 32] {
    PublicKey::from(&StaticSecret::from(*secret)).to_bytes()
}

/// X25519 Diffie-Hellman between our secret key and a peer's public key.
pub(crate) fn x25519_shared(secret: &[u8; 32], peer_public: &[u8; 32]) -> [u8; 32] {
    StaticSecret::from(*secret)
        .diffie_hellman(&PublicKey::from(*peer_public))
        .to_bytes()
}

/// Encrypts `buf` in place with the per-link AEAD, returning the detached tag.
pub(crate) fn seal_link(
    key: &[u8; KEY_LEN],
    nonce: &[u8; LINK_NONCE_LEN],
    ad: &[u8],
    buf: &mut [u8],
) -> Result<[u8; TAG_LEN], Error> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let tag = cipher
        .encrypt_in_place_detached(XNonce::from_slice(nonce), ad, buf)
        .map_err(|_| Error::InvalidValue)?;
    Ok(tag.into())
}

/// Decrypts `buf` in place with the per-link AEAD, verifying the detached tag.
pub(crate) fn open_link(
    key: &[u8; KEY_LEN],
    nonce: &[u8; LINK_NONCE_LEN],
    ad: &[u8],
    buf: &mut [u8],
    tag: &[u8],
) -> Result<(), Error> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt_in_place_detached(XNonce::from_slice(nonce), ad, buf, Tag::from_slice(tag))
        .map_err(|_| Error::InvalidValue)
}

/// Encrypts `buf` in place with the group AEAD, returning the detached tag.
pub(crate) fn seal_group(
    key: &[u8; KEY_LEN],
    nonce: &[u8; GROUP_NONCE_LEN],
    ad: &[u8],
    buf: &mut [u8],
) -> Result<[u8; TAG_LEN], Error> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(nonce), ad, buf)
        .map_err(|_| Error::InvalidValue)?;
    Ok(tag.into())
}

/// Decrypts `buf` in place with the group AEAD, verifying the detached tag.
pub(crate) fn open_group(
    key: &[u8; KEY_LEN],
    nonce: &[u8; GROUP_NONCE_LEN],
    ad: &[u8],
    buf: &mut [u8],
    tag: &[u8],
) -> Result<(), Error> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt_in_place_detached(Nonce::from_slice(nonce), ad, buf, Tag::from_slice(tag))
        .map_err(|_| Error::InvalidValue)
}

/// Derives a stable node address from a long-term public key.
///
/// The first 32-bit window of `BLAKE2b-256(public_key)` that is neither the reserved zero address
/// nor broadcast becomes the address. Collisions are possible in a 32-bit space but vanishingly
/// unlikely within one deployment.
pub fn derive_address(public_key: &[u8; 32]) -> NodeAddress {
    let hash = hash256(&[public_key]);
    for window in hash.chunks_exact(4) {
        let raw = u32::from_le_bytes([window[0], window[1], window[2], window[3]]);
        let addr = NodeAddress::new(raw);
        if !addr.is_unspecified() && !addr.is_broadcast() {
            return addr;
        }
    }
    NodeAddress::new(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_rng::TestRng;

    #[test]
    fn dh_agreement_is_symmetric() {
        let mut rng = TestRng::new(7);
        let a = generate_secret(&mut rng);
        let b = generate_secret(&mut rng);
        assert_ne!(a, b);

        let a_pub = x25519_public(&a);
        let b_pub = x25519_public(&b);
        assert_eq!(x25519_shared(&a, &b_pub), x25519_shared(&b, &a_pub));
    }

    #[test]
    fn link_seal_open_round_trip() {
        let key = [0x42; KEY_LEN];
        let nonce = [0x01; LINK_NONCE_LEN];
        let ad = b"header";

        let mut buf = *b"confidential payload";
        let tag = seal_link(&key, &nonce, ad, &mut buf).unwrap();
        assert_ne!(&buf, b"confidential payload");

        open_link(&key, &nonce, ad, &mut buf, &tag).unwrap();
        assert_eq!(&buf, b"confidential payload");
    }

    #[test]
    fn tampered_ad_fails_open() {
        let key = [0x42; KEY_LEN];
        let nonce = [0; GROUP_NONCE_LEN];

        let mut buf = *b"group says hi";
        let tag = seal_group(&key, &nonce, b"ad", &mut buf).unwrap();
        assert!(open_group(&key, &nonce, b"da", &mut buf, &tag).is_err());
    }

    #[test]
    fn derived_address_is_stable_and_valid() {
        let pk = [0xAB; 32];
        let addr = derive_address(&pk);
        assert_eq!(addr, derive_address(&pk));
        assert!(!addr.is_unspecified());
        assert!(!addr.is_broadcast());
    }
}
