//! An embedded LoRa mesh networking stack.
//!
//! Burlap moves authenticated, confidential, occasionally-acknowledged datagrams between
//! arbitrary pairs of battery-powered radio nodes across an unreliable multi-hop topology,
//! without a central coordinator.
//!
//! # Using the stack
//!
//! Burlap is runtime and hardware-agnostic: It does not need an RTOS (although you can certainly
//! use one if you want) and defines the hardware interfaces it consumes as traits that need to be
//! implemented once for every supported board. The host provides, via [`Config`]:
//! * A millisecond-resolution monotonic [`Timer`].
//! * A [`Radio`] that can put one frame on air and change its spreading factor.
//! * A cryptographically strong random number generator (`rand_core`).
//! * A [`Store`] for opaque per-subsystem persistence blobs (or [`NoStore`]).
//!
//! The host then drives a [`MeshStack`]: `tick` is called from the main loop at 100 Hz or more,
//! and `on_frame` is called for every received frame after the radio ISR has copied it out of
//! hardware buffers. Both entry points must be called from the same logical execution context.
//! Everything the stack wants to tell the application arrives through the [`Host`] trait.
//!
//! [`Config`]: config/trait.Config.html
//! [`Timer`]: time/trait.Timer.html
//! [`Radio`]: phy/trait.Radio.html
//! [`Store`]: store/trait.Store.html
//! [`NoStore`]: store/struct.NoStore.html
//! [`MeshStack`]: stack/struct.MeshStack.html
//! [`Host`]: stack/trait.Host.html

#![cfg_attr(not(test), no_std)]

#[macro_use]
mod log;
#[macro_use]
mod utils;
pub mod adr;
pub mod bytes;
pub mod config;
mod crypto;
pub mod dtn;
pub mod emergency;
mod error;
pub mod geo;
pub mod group;
pub mod history;
pub mod link;
pub mod mac;
pub mod naming;
pub mod neighbors;
pub mod packet;
pub mod phy;
pub mod relay;
pub mod route;
pub mod stack;
pub mod store;
#[cfg(test)]
mod test_rng;
pub mod time;

pub use self::crypto::derive_address;
pub use self::error::Error;

/// Version of the mesh protocol implemented by this crate.
pub const PROTOCOL_VERSION: u8 = 1;
