//! Physical layer interactions.
//!
//! Don't expect to see much code here: Most of this layer is hardware. The stack only needs a
//! very small contract from the radio chip driver, captured by the [`Radio`] trait:
//!
//! * `transmit` either accepts a whole frame for transmission or reports that the modem is busy.
//!   There is at most one outstanding transmission at any time, and the latency from `Sent` to
//!   the frame actually being on air must be bounded (ACK timing depends on it).
//! * Reception is a push model: the driver copies each received frame out of its hardware buffers
//!   and hands it to [`MeshStack::on_frame`] together with the measured RSSI and SNR.
//! * A requested spreading factor change takes effect on the next transmission and the next
//!   reception, not on any that are already in flight.
//!
//! [`Radio`]: trait.Radio.html
//! [`MeshStack::on_frame`]: ../stack/struct.MeshStack.html#method.on_frame

use core::fmt;

/// Result of handing a frame to the radio.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TxResult {
    /// The frame was accepted and will be put on air within the driver's bounded latency.
    Sent,

    /// The modem is occupied (transmitting or mid-receive); the caller should retry later.
    Busy,
}

/// A LoRa spreading factor, SF7 (fastest) through SF12 (longest range).
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct SpreadingFactor(u8);

impl SpreadingFactor {
    /// The fastest, shortest-range spreading factor.
    pub const SF7: Self = SpreadingFactor(7);
    pub const SF8: Self = SpreadingFactor(8);
    pub const SF9: Self = SpreadingFactor(9);
    pub const SF10: Self = SpreadingFactor(10);
    pub const SF11: Self = SpreadingFactor(11);
    /// The slowest, maximum-range spreading factor.
    pub const SF12: Self = SpreadingFactor(12);

    /// Creates a `SpreadingFactor` from its raw value, if it lies in the valid `7..=12` range.
    pub fn new(raw: u8) -> Option<Self> {
        if (7..=12).contains(&raw) {
            Some(SpreadingFactor(raw))
        } else {
            None
        }
    }

    /// Returns the raw spreading factor value (7 to 12).
    pub fn raw(&self) -> u8 {
        self.0
    }

    /// Returns the next slower (more robust) spreading factor, saturating at SF12.
    pub fn slower(&self) -> Self {
        SpreadingFactor(if self.0 >= 12 { 12 } else { self.0 + 1 })
    }

    /// Returns the next faster (less robust) spreading factor, saturating at SF7.
    pub fn faster(&self) -> Self {
        SpreadingFactor(if self.0 <= 7 { 7 } else { self.0 - 1 })
    }
}

impl fmt::Display for SpreadingFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SF{}", self.0)
    }
}

impl fmt::Debug for SpreadingFactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        <Self as fmt::Display>::fmt(self, f)
    }
}

/// Trait for radio chip drivers.
///
/// The specifics of putting a frame on air depend on the underlying hardware; the stack only
/// relies on the contract documented in the module-level docs. Implementations for real chips
/// will typically wrap a SX126x/SX127x driver; tests use an in-memory implementation.
pub trait Radio {
    /// Hands a complete frame (header and payload, as produced by the packet codec) to the radio.
    ///
    /// Returns [`TxResult::Busy`] without side effects when the modem cannot take the frame right
    /// now. The caller retries on the next tick; frames are never split or queued by the driver.
    fn transmit(&mut self, frame: &[u8]) -> TxResult;

    /// Requests a spreading factor change, taking effect on the next transmit and receive.
    fn set_spreading_factor(&mut self, sf: SpreadingFactor);

    /// Requests a transmit power change in dBm.
    ///
    /// Drivers for radios with a fixed PA configuration may ignore this; the default does.
    fn set_tx_power(&mut self, _dbm: i8) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sf_stepping_saturates() {
        assert_eq!(SpreadingFactor::SF7.faster(), SpreadingFactor::SF7);
        assert_eq!(SpreadingFactor::SF12.slower(), SpreadingFactor::SF12);
        assert_eq!(SpreadingFactor::SF9.slower(), SpreadingFactor::SF10);
        assert_eq!(SpreadingFactor::SF9.faster(), SpreadingFactor::SF8);
        assert!(SpreadingFactor::new(6).is_none());
        assert!(SpreadingFactor::new(13).is_none());
        assert_eq!(SpreadingFactor::new(11), Some(SpreadingFactor::SF11));
    }
}
