//! Time-slotted scheduling core for DW1000 UWB sensornets.
//!
//! This crate owns the slot/minislot grid and the protocol engines built on
//! top of it -- it does not own the DW1000's SPI/register layer (a separate,
//! out-of-scope driver crate is expected to implement [`radio::Dw1000Radio`]
//! against real hardware). Layout, bottom to top:
//!
//! - [`time`] -- device-time arithmetic (32-bit wraparound counter).
//! - [`error`] -- crate-wide error types.
//! - [`radio`] -- the `Dw1000Radio` trait and its configuration/diagnostics types.
//! - [`sd`] -- the slot driver: one radio operation in flight at a time.
//! - [`statetime`] -- passive energy/dwell-time accounting.
//! - [`tsm`] -- the Time-Slot Manager: the minislot grid and sync protocol.
//! - [`ctf`] -- Concurrent-Transmission Flood (Glossy), standalone and TSM-cooperative.
//! - [`crystal`] -- sink-coordinated (S/T/A) epoch data collection.
//! - [`weaver`] -- many-to-one collection via round-robin pool and ACK bitmap.
//! - [`util`] -- shared deployment-table, packet-pool and log-ring utilities.
//!
//! `mock` provides a scriptable [`radio::Dw1000Radio`] test double and is
//! available whenever tests run (`cfg(test)` or the `std` feature, used by
//! the host-side test harness).

#![no_std]

pub mod crystal;
pub mod ctf;
pub mod error;
pub mod radio;
pub mod sd;
pub mod statetime;
pub mod time;
pub mod tsm;
pub mod util;
pub mod weaver;

#[cfg(any(test, feature = "std"))]
pub mod mock;

pub use error::{Error, Result};
pub use time::DeviceTime32;
