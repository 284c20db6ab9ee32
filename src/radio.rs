//! Radio abstraction (Component A).
//!
//! Everything below `configure`/`schedule_*` is out of scope for this
//! crate (the SPI transaction framing, antenna-delay calibration, CIR
//! reading and two-way-ranging all live in a separate driver); what's
//! modeled here is the *contract* the slot driver needs: one operation in
//! flight, absolute-device-time scheduling, and a handful of completion
//! callbacks delivered from interrupt context.

use crate::error::RadioError;
use crate::time::DeviceTime32;
use defmt::Format;

/// Channel, 1..=7 excluding 6 per DS Table 9.2.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
#[repr(u8)]
pub enum Channel {
    Ch1 = 1,
    Ch2 = 2,
    Ch3 = 3,
    Ch4 = 4,
    Ch5 = 5,
    Ch7 = 7,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
#[repr(u8)]
pub enum Prf {
    Mhz16 = 0,
    Mhz64 = 1,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
#[repr(u16)]
pub enum PreambleLength {
    Len64 = 64,
    Len128 = 128,
    Len256 = 256,
    Len512 = 512,
    Len1024 = 1024,
    Len1536 = 1536,
    Len2048 = 2048,
    Len4096 = 4096,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
#[repr(u8)]
pub enum Pac {
    Pac8 = 8,
    Pac16 = 16,
    Pac32 = 32,
    Pac64 = 64,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
#[repr(u8)]
pub enum DataRate {
    Kbps110 = 0,
    Kbps850 = 1,
    Mbps6_8 = 2,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
#[repr(u8)]
pub enum SfdMode {
    Standard,
    NonStandard,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
#[repr(u8)]
pub enum PhrMode {
    Standard,
    Extended,
}

/// Radio configuration surface (§6). Mirrors the teacher's
/// `RadioConfigNx`/`Default` pattern: every knob has a sane default and
/// configuration happens through one value rather than a pile of setters.
#[derive(Clone, Copy, Debug, Format)]
pub struct RadioConfig {
    pub channel: Channel,
    pub prf: Prf,
    pub preamble_length: PreambleLength,
    pub pac: Pac,
    pub data_rate: DataRate,
    pub sfd_mode: SfdMode,
    pub sfd_timeout: u16,
    pub preamble_code: u8,
    pub phr_mode: PhrMode,
    pub tx_power: u32,
    pub pg_delay: u8,
    pub rx_antenna_delay: u16,
    pub tx_antenna_delay: u16,
    pub smart_tx_power: bool,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            channel: Channel::Ch5,
            prf: Prf::Mhz64,
            preamble_length: PreambleLength::Len128,
            pac: Pac::Pac8,
            data_rate: DataRate::Mbps6_8,
            sfd_mode: SfdMode::NonStandard,
            sfd_timeout: (128 + 1 + 8 - 8) as u16,
            preamble_code: 9,
            phr_mode: PhrMode::Standard,
            tx_power: 0x0E08_0222,
            pg_delay: 0xC0,
            rx_antenna_delay: 32946,
            tx_antenna_delay: 32946,
            smart_tx_power: true,
        }
    }
}

impl RadioConfig {
    pub fn validate(&self) -> Result<(), RadioError> {
        if self.sfd_timeout == 0 {
            return Err(RadioError::Config);
        }
        Ok(())
    }
}

/// Raw radio diagnostics captured alongside a completed RX, used by
/// Weaver's bootstrap RX-power acceptance test and by the statetime
/// monitor's ratio estimator.
#[derive(Clone, Copy, Default, Debug, Format)]
pub struct RxDiagnostics {
    pub max_growth_cir: u32,
    pub rxpacc_adjusted: u16,
    pub first_path_power: i32,
    pub std_noise: u16,
}

/// Threshold from `HOPCOUNT_SET_RX_THRESH` in the original source: a
/// packet's receive power must clear this to be treated as
/// bootstrap-worthy by Weaver.
pub const HOPCOUNT_SET_RX_THRESH: u32 = 297;

impl RxDiagnostics {
    /// `(max_growth_cir << 16) / rxpacc_adjusted^2 >= HOPCOUNT_SET_RX_THRESH`
    pub fn valid_rx_pwr(&self) -> bool {
        if self.rxpacc_adjusted == 0 {
            return false;
        }
        let denom = (self.rxpacc_adjusted as u64) * (self.rxpacc_adjusted as u64);
        let metric = ((self.max_growth_cir as u64) << 16) / denom.max(1);
        metric >= HOPCOUNT_SET_RX_THRESH as u64
    }
}

/// What actually happened, as reported by the radio's ISR bridge. The
/// slot driver combines this with its own notion of which operation was
/// in flight to produce a `SlotStatus`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
pub enum RadioOutcome {
    TxDone,
    RxOk,
    /// Frame-check / reed-solomon / PHY header error — "something landed
    /// but the frame itself is bad" as distinct from a clean timeout.
    RxError,
    RxTimeout,
    TimerFired,
    /// Bare preamble pulse detected and (if armed for it) re-emitted.
    FpPulseSeen,
    FpError,
    FpTimeout,
}

/// A single completed radio operation, as delivered to the slot driver.
#[derive(Clone, Copy, Debug, Format)]
pub struct RadioEvent {
    pub outcome: RadioOutcome,
    pub sfd_time: DeviceTime32,
    pub status_bits: u32,
    pub rx_len: usize,
    pub diagnostics: RxDiagnostics,
}

/// The operations the slot driver needs from a concrete radio. Kept
/// intentionally narrow: register-level detail (channel PLL lock,
/// LDE load, OTP calibration reads) is a driver concern that sits behind
/// `configure`, not something SD/TSM ever touch directly.
pub trait Dw1000Radio {
    /// Apply a full configuration. May only be called while idle.
    fn configure(&mut self, config: &RadioConfig) -> Result<(), RadioError>;

    fn config(&self) -> &RadioConfig;

    /// Abort whatever operation is in flight and return the radio to idle.
    fn force_idle(&mut self);

    /// Write `payload` into the TX buffer at offset 0.
    fn write_tx_buffer(&mut self, payload: &[u8]) -> Result<(), RadioError>;

    /// Schedule a TX so that its SFD leaves the antenna at `sfd_time`.
    /// `payload_len` must already have been written via `write_tx_buffer`.
    fn schedule_tx(&mut self, sfd_time: DeviceTime32, payload_len: usize) -> Result<(), RadioError>;

    /// Schedule preamble-only "FS/Flick" transmission.
    fn schedule_tx_fp(&mut self, sfd_time: DeviceTime32) -> Result<(), RadioError>;

    /// Turn RX on at `rx_on_time`, with an absolute RX timeout at `deadline`
    /// (if `Some`) and a preamble-detection timeout of `preamble_to_pacs`
    /// PACs (0 disables it).
    fn schedule_rx(
        &mut self,
        rx_on_time: Option<DeviceTime32>,
        deadline: Option<DeviceTime32>,
        preamble_to_pacs: u16,
    ) -> Result<(), RadioError>;

    /// RX armed to detect a bare preamble pulse and hand control back to
    /// the ISR for immediate re-transmission.
    fn schedule_rx_fp(
        &mut self,
        rx_on_time: Option<DeviceTime32>,
        deadline: DeviceTime32,
    ) -> Result<(), RadioError>;

    /// Arm a timer-only completion (no radio activity) at `deadline`.
    fn schedule_timer(&mut self, deadline: DeviceTime32) -> Result<(), RadioError>;

    fn now(&self) -> DeviceTime32;

    /// Read back the most recent RX payload into `buf`, returning the
    /// number of bytes written.
    fn read_rx_buffer(&mut self, buf: &mut [u8]) -> Result<usize, RadioError>;

    /// Block until the operation armed by the most recent `schedule_*`
    /// call completes, and report what happened. On real hardware this
    /// polls (or WFIs on) a flag set by the radio's interrupt handler;
    /// that handler itself is out of scope for this crate.
    fn wait_event(&mut self) -> RadioEvent;
}
