//! Crate-wide error types.

use defmt::Format;

/// Errors surfaced by the SPI/register layer underneath the radio abstraction.
///
/// Named and shaped after the hardware driver's own error enum; the radio
/// abstraction (`crate::radio`) wraps these into the higher-level [`Error`].
#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
pub enum RadioError {
    /// The busy pin never went low within the iteration budget.
    BusyTimeout,
    /// The underlying SPI transaction itself failed.
    Spi,
    /// A configuration value was out of range, or set while the radio state
    /// didn't allow it (e.g. channel change mid-transmission).
    Config,
    /// Unexpected value in the device's status/ID register.
    UnexpectedStatus(u8),
    /// Caller tried to use a payload larger than the radio buffer.
    PayloadTooLarge(usize),
    /// CRC/tag check on a received frame's framing failed.
    Crc,
}

/// Top-level error type for the scheduling core.
///
/// Variants map onto the error taxonomy: most of these never cross a public
/// API boundary as an `Err` — they're represented as `SlotStatus`/log events
/// instead (see module docs on `sd` and `tsm`). Only the three genuinely
/// fallible setup/scheduling operations return these directly.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
pub enum Error {
    /// Radio configuration request was invalid.
    ConfigurationInvalid,
    /// A scheduled TX/RX deadline had already passed by the time it reached
    /// the radio.
    ScheduleLate,
    /// A received frame was longer than the caller-supplied buffer.
    BufferTooLarge,
    /// TSM header tag didn't match the expected constant.
    MalformedHeader,
    /// Underlying radio/SPI fault.
    Radio(RadioError),
}

impl From<RadioError> for Error {
    fn from(e: RadioError) -> Self {
        Error::Radio(e)
    }
}

pub type Result<T> = core::result::Result<T, Error>;
