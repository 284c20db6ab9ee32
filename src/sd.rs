//! Slot driver (Component B, "SD" / `trex` in the original source).
//!
//! Owns exactly one in-flight radio operation and turns its completion
//! into a single [`SlotStatus`]. Every operation below is a blocking call:
//! it arms the radio, waits for the one completion event the hardware
//! contract guarantees, and returns — there is no queue, because at most
//! one operation is ever in flight.

use crate::error::{Error, RadioError, Result};
use crate::radio::{Dw1000Radio, RadioOutcome};
use crate::time::DeviceTime32;
use defmt::Format;

/// Outcome of a single slot operation. Ordering mirrors `enum trex_status`
/// in the original driver: `RxSuccess..=RxMalformed` are exactly the
/// "received something" outcomes (see [`SlotStatus::is_rx_status`]).
#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
pub enum SlotStatus {
    None,
    RxSuccess,
    RxTimeout,
    RxError,
    RxMalformed,
    TimerEvent,
    TxDone,
    FsEmpty,
    FsDetected,
    FsDetectedAndPropagated,
    FsError,
}

impl SlotStatus {
    pub fn is_rx_status(self) -> bool {
        matches!(
            self,
            SlotStatus::RxSuccess
                | SlotStatus::RxTimeout
                | SlotStatus::RxError
                | SlotStatus::RxMalformed
        )
    }
}

/// One completed slot operation, as handed from SD up to TSM/engines.
#[derive(Clone, Copy, Debug, Format)]
pub struct SlotRecord {
    pub status: SlotStatus,
    pub sfd_time: DeviceTime32,
    pub radio_status_bits: u32,
    pub rx_len: usize,
    pub diagnostics: crate::radio::RxDiagnostics,
}

/// Running counters, mirroring `TREX_STATS_PRINT()` in the original.
#[derive(Clone, Copy, Default, Debug, Format)]
pub struct SlotDriverStats {
    pub rxok: u32,
    pub txok: u32,
    pub phe: u32,
    pub sfdto: u32,
    pub rse: u32,
    pub fcse: u32,
    pub rej: u32,
    pub fto: u32,
    pub pto: u32,
    pub unknown: u32,
}

impl SlotDriverStats {
    fn record(&mut self, status: SlotStatus) {
        match status {
            SlotStatus::RxSuccess => self.rxok += 1,
            SlotStatus::TxDone => self.txok += 1,
            SlotStatus::RxMalformed => self.phe += 1,
            SlotStatus::RxTimeout => self.sfdto += 1,
            SlotStatus::RxError => self.rse += 1,
            SlotStatus::FsError => self.fcse += 1,
            SlotStatus::None => self.rej += 1,
            SlotStatus::TimerEvent => self.fto += 1,
            SlotStatus::FsEmpty => self.pto += 1,
            SlotStatus::FsDetected | SlotStatus::FsDetectedAndPropagated => {}
        }
    }
}

/// Drives a single [`Dw1000Radio`] through one operation at a time.
pub struct SlotDriver<R: Dw1000Radio> {
    radio: R,
    pub stats: SlotDriverStats,
}

impl<R: Dw1000Radio> SlotDriver<R> {
    pub fn new(radio: R) -> Self {
        Self {
            radio,
            stats: SlotDriverStats::default(),
        }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    fn finish(&mut self, ev: crate::radio::RadioEvent, status: SlotStatus) -> SlotRecord {
        self.radio.force_idle();
        self.stats.record(status);
        SlotRecord {
            status,
            sfd_time: ev.sfd_time,
            radio_status_bits: ev.status_bits,
            rx_len: ev.rx_len,
            diagnostics: ev.diagnostics,
        }
    }

    fn map_err(e: RadioError) -> Error {
        match e {
            RadioError::Config => Error::ScheduleLate,
            other => Error::Radio(other),
        }
    }

    /// Schedule a TX so its SFD leaves the antenna at `sfd_time`.
    pub fn tx_at(&mut self, payload: &[u8], sfd_time: DeviceTime32) -> Result<SlotRecord> {
        self.radio.write_tx_buffer(payload)?;
        self.radio
            .schedule_tx(sfd_time, payload.len())
            .map_err(Self::map_err)?;
        let ev = self.radio.wait_event();
        Ok(self.finish(ev, SlotStatus::TxDone))
    }

    pub fn tx_at_fp(&mut self, sfd_time: DeviceTime32) -> Result<SlotRecord> {
        self.radio.schedule_tx_fp(sfd_time).map_err(Self::map_err)?;
        let ev = self.radio.wait_event();
        Ok(self.finish(ev, SlotStatus::FsDetected))
    }

    fn rx_outcome_to_status(outcome: RadioOutcome) -> SlotStatus {
        match outcome {
            RadioOutcome::RxOk => SlotStatus::RxSuccess,
            RadioOutcome::RxError => SlotStatus::RxError,
            RadioOutcome::RxTimeout => SlotStatus::RxTimeout,
            _ => SlotStatus::None,
        }
    }

    fn run_rx(
        &mut self,
        rx_on_time: Option<DeviceTime32>,
        deadline: Option<DeviceTime32>,
        preamble_to_pacs: u16,
    ) -> Result<SlotRecord> {
        self.radio
            .schedule_rx(rx_on_time, deadline, preamble_to_pacs)
            .map_err(Self::map_err)?;
        let ev = self.radio.wait_event();
        let status = Self::rx_outcome_to_status(ev.outcome);
        Ok(self.finish(ev, status))
    }

    pub fn rx_slot(&mut self, expected_sfd: DeviceTime32, deadline: DeviceTime32, preamble_to_pacs: u16) -> Result<SlotRecord> {
        self.run_rx(Some(expected_sfd), Some(deadline), preamble_to_pacs)
    }

    pub fn rx_until(&mut self, deadline: DeviceTime32) -> Result<SlotRecord> {
        self.run_rx(None, Some(deadline), 0)
    }

    pub fn rx(&mut self) -> Result<SlotRecord> {
        self.run_rx(None, None, 0)
    }

    pub fn rx_from(&mut self, rx_on_time: DeviceTime32) -> Result<SlotRecord> {
        self.run_rx(Some(rx_on_time), None, 0)
    }

    pub fn rx_slot_fp(&mut self, expected_sfd: DeviceTime32, deadline: DeviceTime32) -> Result<SlotRecord> {
        self.radio
            .schedule_rx_fp(Some(expected_sfd), deadline)
            .map_err(Self::map_err)?;
        let ev = self.radio.wait_event();
        let status = match ev.outcome {
            RadioOutcome::FpPulseSeen => SlotStatus::FsDetectedAndPropagated,
            RadioOutcome::FpError => SlotStatus::FsError,
            RadioOutcome::FpTimeout => SlotStatus::FsEmpty,
            _ => SlotStatus::FsEmpty,
        };
        Ok(self.finish(ev, status))
    }

    pub fn set_timer(&mut self, deadline: DeviceTime32) -> Result<SlotRecord> {
        self.radio.schedule_timer(deadline).map_err(Self::map_err)?;
        let ev = self.radio.wait_event();
        Ok(self.finish(ev, SlotStatus::TimerEvent))
    }

    pub fn read_rx_buffer(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.radio.read_rx_buffer(buf)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRadio;
    use crate::radio::{RadioEvent, RxDiagnostics};

    #[test]
    fn tx_then_rx_roundtrip() {
        let mut radio = MockRadio::new();
        radio.queue_event(RadioEvent {
            outcome: RadioOutcome::TxDone,
            sfd_time: DeviceTime32::new(1000),
            status_bits: 0,
            rx_len: 0,
            diagnostics: RxDiagnostics::default(),
        });
        let mut sd = SlotDriver::new(radio);
        let rec = sd.tx_at(&[1, 2, 3], DeviceTime32::new(1000)).unwrap();
        assert_eq!(rec.status, SlotStatus::TxDone);
        assert_eq!(sd.stats.txok, 1);
    }

    #[test]
    fn rx_error_is_counted() {
        let mut radio = MockRadio::new();
        radio.queue_event(RadioEvent {
            outcome: RadioOutcome::RxError,
            sfd_time: DeviceTime32::new(11),
            status_bits: 0,
            rx_len: 7,
            diagnostics: RxDiagnostics::default(),
        });
        let mut sd = SlotDriver::new(radio);
        let rec = sd.rx_slot(DeviceTime32::new(10), DeviceTime32::new(20), 0).unwrap();
        assert_eq!(rec.status, SlotStatus::RxError);
        assert_eq!(sd.stats.rse, 1);
    }

    #[test]
    fn late_schedule_is_recoverable_error() {
        let mut sd = SlotDriver::new(MockRadio::new_failing());
        let err = sd.tx_at(&[1], DeviceTime32::new(0)).unwrap_err();
        assert_eq!(err, Error::ScheduleLate);
    }
}
