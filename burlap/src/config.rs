//! Stack configuration: capability types and protocol tunables.

use crate::phy::{Radio, SpreadingFactor};
use crate::store::Store;
use crate::time::{Duration, Timer};
use rand_core::{CryptoRng, RngCore};

/// Trait for mesh stack configurations.
///
/// This trait bundles the capability types a host has to provide: every `extern` collaborator of
/// the stack (clock, radio, entropy, persistence) appears here as an associated type and nowhere
/// else. An application defines one type implementing this trait and supplies it to
/// [`MeshStack`].
///
/// [`MeshStack`]: ../stack/struct.MeshStack.html
pub trait Config {
    /// A monotonic time source with millisecond resolution.
    type Timer: Timer;

    /// The frame transmitter (radio chip driver).
    type Radio: Radio;

    /// A cryptographically strong random number generator.
    ///
    /// Used for link handshakes, ratchet key generation, bundle ids, group keys and CSMA jitter.
    type Rng: RngCore + CryptoRng;

    /// Opaque blob persistence, or [`NoStore`] when the board has none.
    ///
    /// [`NoStore`]: ../store/struct.NoStore.html
    type Store: Store;
}

/// Runtime protocol parameters.
///
/// The defaults match the reference deployment; hosts may override individual fields at boot.
/// Changing them after boot is not supported.
#[derive(Debug, Copy, Clone)]
pub struct ProtocolConfig {
    /// Period of the node announcement beacon.
    pub beacon_interval: Duration,

    /// Route and neighbor entries expire after this much silence.
    pub route_timeout: Duration,

    /// Retransmission deadline for ACK-requested frames.
    pub ack_timeout: Duration,

    /// Retransmission cap for ACK-requested frames.
    pub max_retries: u8,

    /// Initial hop budget of locally-originated frames.
    pub max_ttl: u8,

    /// Clamp for user data payloads.
    pub max_payload: u16,

    /// Spreading factor used when ADR has not yet resolved one for a peer.
    pub default_sf: SpreadingFactor,

    /// Engage the double ratchet on newly established links.
    pub forward_secrecy: bool,

    /// DTN hands bundles to every neighbor instead of only toward the destination.
    pub epidemic_mode: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        ProtocolConfig {
            beacon_interval: Duration::from_secs(30),
            route_timeout: Duration::from_secs(300),
            ack_timeout: Duration::from_secs(5),
            max_retries: 3,
            max_ttl: 15,
            max_payload: 255,
            default_sf: SpreadingFactor::SF7,
            forward_secrecy: true,
            epidemic_mode: false,
        }
    }
}
