//! Adaptive data rate: per-peer spreading factor selection.
//!
//! Each peer gets a windowed RSSI/SNR history. The recommended SF for a peer is the lowest
//! (fastest) one whose thresholds the windowed averages meet. Moving to a *faster* SF happens one
//! step at a time and only when the average RSSI clears the faster threshold by
//! [`ADR_HYSTERESIS_DB`]; moving to a *slower* (more robust) SF happens immediately and without
//! hysteresis, since staying too fast means losing frames.
//!
//! Because both sides must be able to hear each other, the SF actually used towards a peer is the
//! maximum of our recommendation and the peer's advertised preference.

use crate::bytes::{ByteReader, ByteWriter, FromBytes, ToBytes};
use crate::packet::NodeAddress;
use crate::phy::SpreadingFactor;
use crate::time::{Duration, Instant};
use crate::Error;
use heapless::Vec;

/// Number of signal samples averaged per peer.
pub const ADR_WINDOW: usize = 8;

/// Extra signal margin required before stepping to a faster SF.
pub const ADR_HYSTERESIS_DB: i16 = 5;

/// Peers tracked by the ADR component.
pub const ADR_TABLE_LEN: usize = 16;

/// How often the per-peer recommendations are re-evaluated.
pub const ADR_UPDATE_INTERVAL: Duration = Duration::from_secs(60);

struct Threshold {
    rssi: i16,
    snr: i8,
    sf: SpreadingFactor,
}

/// Signal thresholds for each SF, fastest first. Each step adds roughly 10 dB of link margin.
static THRESHOLDS: [Threshold; 6] = [
    Threshold {
        rssi: -70,
        snr: 8,
        sf: SpreadingFactor::SF7,
    },
    Threshold {
        rssi: -85,
        snr: 5,
        sf: SpreadingFactor::SF8,
    },
    Threshold {
        rssi: -100,
        snr: 0,
        sf: SpreadingFactor::SF9,
    },
    Threshold {
        rssi: -110,
        snr: -5,
        sf: SpreadingFactor::SF10,
    },
    Threshold {
        rssi: -120,
        snr: -10,
        sf: SpreadingFactor::SF11,
    },
    Threshold {
        rssi: -140,
        snr: -15,
        sf: SpreadingFactor::SF12,
    },
];

fn threshold_for(sf: SpreadingFactor) -> &'static Threshold {
    THRESHOLDS
        .iter()
        .find(|t| t.sf == sf)
        .unwrap_or(&THRESHOLDS[5])
}

/// Selects the fastest SF whose thresholds `(rssi, snr)` meet, SF12 as the fallback.
fn select_sf(rssi: i16, snr: i8) -> SpreadingFactor {
    for t in &THRESHOLDS {
        if rssi >= t.rssi && snr >= t.snr {
            return t.sf;
        }
    }
    SpreadingFactor::SF12
}

/// The SF preference a node includes in its beacons.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AdrAdvertisement {
    /// The SF the sender would like to receive at.
    pub preferred: SpreadingFactor,
    /// Slowest SF the sender supports.
    pub min: SpreadingFactor,
    /// Fastest SF the sender supports.
    pub max: SpreadingFactor,
    /// The sender's current transmit power in dBm.
    pub tx_power: i8,
}

impl ToBytes for AdrAdvertisement {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_u8(self.preferred.raw())?;
        writer.write_u8(self.min.raw())?;
        writer.write_u8(self.max.raw())?;
        writer.write_i8(self.tx_power)
    }
}

impl<'a> FromBytes<'a> for AdrAdvertisement {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let preferred = SpreadingFactor::new(bytes.read_u8()?).ok_or(Error::InvalidValue)?;
        let min = SpreadingFactor::new(bytes.read_u8()?).ok_or(Error::InvalidValue)?;
        let max = SpreadingFactor::new(bytes.read_u8()?).ok_or(Error::InvalidValue)?;
        let tx_power = bytes.read_i8()?;
        Ok(AdrAdvertisement {
            preferred,
            min,
            max,
            tx_power,
        })
    }
}

struct PeerState {
    peer: NodeAddress,
    rssi: [i16; ADR_WINDOW],
    snr: [i8; ADR_WINDOW],
    samples: u8,
    cursor: u8,
    recommended: SpreadingFactor,
    peer_preferred: Option<SpreadingFactor>,
    last_heard: Instant,
}

impl PeerState {
    fn avg(&self) -> (i16, i8) {
        let n = usize::from(self.samples).max(1);
        let rssi: i32 = self.rssi[..n].iter().map(|&r| i32::from(r)).sum();
        let snr: i32 = self.snr[..n].iter().map(|&s| i32::from(s)).sum();
        ((rssi / n as i32) as i16, (snr / n as i32) as i8)
    }
}

/// Per-peer spreading factor controller.
pub struct Adr {
    peers: Vec<PeerState, ADR_TABLE_LEN>,
    default_sf: SpreadingFactor,
    last_eval: Instant,
}

impl Adr {
    pub fn new(default_sf: SpreadingFactor, now: Instant) -> Self {
        Adr {
            peers: Vec::new(),
            default_sf,
            last_eval: now,
        }
    }

    /// Feeds one received frame's signal readings into the peer's window.
    pub fn record_rx(&mut self, peer: NodeAddress, rssi: i16, snr: i8, now: Instant) {
        let state = match self.peers.iter_mut().find(|p| p.peer == peer) {
            Some(state) => state,
            None => {
                if self.peers.is_full() {
                    let victim = self
                        .peers
                        .iter()
                        .enumerate()
                        .max_by_key(|(_, p)| now.duration_since(p.last_heard).as_millis())
                        .map(|(i, _)| i);
                    if let Some(i) = victim {
                        self.peers.swap_remove(i);
                    }
                }
                let _ = self.peers.push(PeerState {
                    peer,
                    rssi: [0; ADR_WINDOW],
                    snr: [0; ADR_WINDOW],
                    samples: 0,
                    cursor: 0,
                    recommended: self.default_sf,
                    peer_preferred: None,
                    last_heard: now,
                });
                self.peers.last_mut().unwrap()
            }
        };

        let idx = usize::from(state.cursor);
        state.rssi[idx] = rssi;
        state.snr[idx] = snr;
        state.cursor = (state.cursor + 1) % ADR_WINDOW as u8;
        if usize::from(state.samples) < ADR_WINDOW {
            state.samples += 1;
        }
        state.last_heard = now;

        // A link that degraded below its current SF's thresholds must slow down right away.
        let (avg_rssi, avg_snr) = state.avg();
        let target = select_sf(avg_rssi, avg_snr);
        if target > state.recommended {
            state.recommended = target;
        }
    }

    /// Records a peer's advertised SF preference from its beacon.
    pub fn record_peer_preference(&mut self, peer: NodeAddress, sf: SpreadingFactor, now: Instant) {
        if let Some(state) = self.peers.iter_mut().find(|p| p.peer == peer) {
            state.peer_preferred = Some(sf);
            state.last_heard = now;
        }
    }

    /// Re-evaluates all peers, applying upward (faster) steps with hysteresis.
    ///
    /// Call this from the main tick; it rate-limits itself to [`ADR_UPDATE_INTERVAL`].
    pub fn evaluate(&mut self, now: Instant) {
        if now.duration_since(self.last_eval) < ADR_UPDATE_INTERVAL {
            return;
        }
        self.last_eval = now;

        for state in self.peers.iter_mut() {
            if state.samples == 0 {
                continue;
            }
            let (avg_rssi, avg_snr) = state.avg();
            let target = select_sf(avg_rssi, avg_snr);

            if target > state.recommended {
                // Degrading link: slow down immediately, no hysteresis.
                state.recommended = target;
            } else if target < state.recommended {
                // Improving link: step one SF at a time, and only with margin to spare.
                let candidate = state.recommended.faster();
                let t = threshold_for(candidate);
                if avg_rssi >= t.rssi + ADR_HYSTERESIS_DB && avg_snr >= t.snr {
                    state.recommended = candidate;
                }
            }
        }
    }

    /// Our own recommendation for receiving from `peer`.
    pub fn recommended(&self, peer: NodeAddress) -> SpreadingFactor {
        self.peers
            .iter()
            .find(|p| p.peer == peer)
            .map(|p| p.recommended)
            .unwrap_or(self.default_sf)
    }

    /// The SF to actually transmit at towards `peer`: the slower of our recommendation and the
    /// peer's advertised preference, so both sides remain audible.
    pub fn negotiated(&self, peer: NodeAddress) -> SpreadingFactor {
        let state = match self.peers.iter().find(|p| p.peer == peer) {
            Some(state) => state,
            None => return self.default_sf,
        };
        match state.peer_preferred {
            Some(theirs) => state.recommended.max(theirs),
            None => state.recommended,
        }
    }

    /// The advertisement to include in our beacons.
    pub fn advertisement(&self, tx_power: i8) -> AdrAdvertisement {
        // Advertise the slowest SF any active peer needs from us, so the weakest link keeps
        // working; SF range is fixed by the modem.
        let preferred = self
            .peers
            .iter()
            .map(|p| p.recommended)
            .max()
            .unwrap_or(self.default_sf);
        AdrAdvertisement {
            preferred,
            min: SpreadingFactor::SF7,
            max: SpreadingFactor::SF12,
            tx_power,
        }
    }

    /// The configured fallback SF.
    pub fn default_sf(&self) -> SpreadingFactor {
        self.default_sf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u32) -> Instant {
        Instant::from_raw_millis(ms)
    }

    fn feed(adr: &mut Adr, peer: NodeAddress, rssi: i16, snr: i8, base_ms: u32) {
        for i in 0..ADR_WINDOW as u32 {
            adr.record_rx(peer, rssi, snr, at(base_ms + i));
        }
    }

    #[test]
    fn selects_sf_from_thresholds() {
        assert_eq!(select_sf(-60, 10), SpreadingFactor::SF7);
        assert_eq!(select_sf(-90, 2), SpreadingFactor::SF9);
        assert_eq!(select_sf(-115, -8), SpreadingFactor::SF11);
        assert_eq!(select_sf(-150, -20), SpreadingFactor::SF12);
    }

    #[test]
    fn degradation_slows_down_without_hysteresis() {
        let peer = NodeAddress::new(0xA1);
        let mut adr = Adr::new(SpreadingFactor::SF9, at(0));

        // At exactly the SF10 threshold the link must leave SF9 right away.
        feed(&mut adr, peer, -105, -2, 0);
        assert_eq!(adr.recommended(peer), SpreadingFactor::SF10);
    }

    #[test]
    fn improvement_needs_margin_and_steps_once() {
        let peer = NodeAddress::new(0xA1);
        let mut adr = Adr::new(SpreadingFactor::SF10, at(0));

        // Averages meet SF7 thresholds outright, but the first evaluation may only step to SF9,
        // and only because the margin exceeds the hysteresis.
        feed(&mut adr, peer, -60, 10, 0);
        adr.evaluate(at(ADR_UPDATE_INTERVAL.as_millis() + 1));
        assert_eq!(adr.recommended(peer), SpreadingFactor::SF9);

        adr.evaluate(at(2 * (ADR_UPDATE_INTERVAL.as_millis() + 1)));
        assert_eq!(adr.recommended(peer), SpreadingFactor::SF8);
    }

    #[test]
    fn improvement_without_margin_is_ignored() {
        let peer = NodeAddress::new(0xA1);
        let mut adr = Adr::new(SpreadingFactor::SF10, at(0));

        // -98 dBm meets the SF9 threshold (-100) but not by the 5 dB hysteresis.
        feed(&mut adr, peer, -98, 4, 0);
        adr.evaluate(at(ADR_UPDATE_INTERVAL.as_millis() + 1));
        assert_eq!(adr.recommended(peer), SpreadingFactor::SF10);

        // -94 dBm clears it.
        feed(&mut adr, peer, -94, 4, 100_000);
        adr.evaluate(at(2 * (ADR_UPDATE_INTERVAL.as_millis() + 1)));
        assert_eq!(adr.recommended(peer), SpreadingFactor::SF9);
    }

    #[test]
    fn negotiation_takes_the_slower_side() {
        let peer = NodeAddress::new(0xA1);
        let mut adr = Adr::new(SpreadingFactor::SF7, at(0));
        feed(&mut adr, peer, -60, 10, 0);
        assert_eq!(adr.negotiated(peer), SpreadingFactor::SF7);

        adr.record_peer_preference(peer, SpreadingFactor::SF10, at(10));
        assert_eq!(adr.negotiated(peer), SpreadingFactor::SF10);
    }

    #[test]
    fn advertisement_round_trip() {
        let ad = AdrAdvertisement {
            preferred: SpreadingFactor::SF9,
            min: SpreadingFactor::SF7,
            max: SpreadingFactor::SF12,
            tx_power: 20,
        };
        let mut buf = [0; 4];
        ad.to_bytes(&mut ByteWriter::new(&mut buf)).unwrap();
        let decoded = AdrAdvertisement::from_bytes(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(decoded, ad);
    }
}
