//! A scriptable [`Dw1000Radio`] double used by the test suite.
//!
//! Real register-level radio behavior (PLL lock times, OTP calibration,
//! antenna delay) is out of scope for this crate; tests only need to
//! assert the scheduling/translation logic in `sd`/`tsm`/engines, so the
//! mock just tracks what was asked of it and lets the test script the
//! answer via a FIFO queue of [`RadioEvent`]s.

use crate::error::RadioError;
use crate::radio::{Dw1000Radio, RadioConfig, RadioEvent, RadioOutcome, RxDiagnostics};
use crate::time::DeviceTime32;
use heapless::Deque;

pub struct MockRadio {
    config: RadioConfig,
    pub now: DeviceTime32,
    pub tx_buffer: [u8; 256],
    pub tx_len: usize,
    pub last_rx_buffer: [u8; 256],
    pub last_rx_len: usize,
    fail_schedule: bool,
    events: Deque<RadioEvent, 32>,
}

impl MockRadio {
    pub fn new() -> Self {
        Self {
            config: RadioConfig::default(),
            now: DeviceTime32::new(0),
            tx_buffer: [0; 256],
            tx_len: 0,
            last_rx_buffer: [0; 256],
            last_rx_len: 0,
            fail_schedule: false,
            events: Deque::new(),
        }
    }

    pub fn new_failing() -> Self {
        let mut r = Self::new();
        r.fail_schedule = true;
        r
    }

    /// Queue a `RadioEvent` to be returned by the next `wait_event` call.
    /// If a queued event carries RX data this also primes the readback
    /// buffer via `set_rx_payload`.
    pub fn queue_event(&mut self, ev: RadioEvent) {
        let _ = self.events.push_back(ev);
    }

    /// Convenience: queue an `RxOk` completion carrying `payload` as the
    /// frame contents available afterwards via `read_rx_buffer`.
    pub fn queue_rx_ok(&mut self, sfd_time: DeviceTime32, payload: &[u8]) {
        self.set_rx_payload(payload);
        self.queue_event(RadioEvent {
            outcome: RadioOutcome::RxOk,
            sfd_time,
            status_bits: 0,
            rx_len: payload.len(),
            diagnostics: RxDiagnostics::default(),
        });
    }

    pub fn set_rx_payload(&mut self, payload: &[u8]) {
        self.last_rx_buffer[..payload.len()].copy_from_slice(payload);
        self.last_rx_len = payload.len();
    }
}

impl Default for MockRadio {
    fn default() -> Self {
        Self::new()
    }
}

impl Dw1000Radio for MockRadio {
    fn configure(&mut self, config: &RadioConfig) -> Result<(), RadioError> {
        config.validate()?;
        self.config = *config;
        Ok(())
    }

    fn config(&self) -> &RadioConfig {
        &self.config
    }

    fn force_idle(&mut self) {}

    fn write_tx_buffer(&mut self, payload: &[u8]) -> Result<(), RadioError> {
        if payload.len() > self.tx_buffer.len() {
            return Err(RadioError::PayloadTooLarge(payload.len()));
        }
        self.tx_buffer[..payload.len()].copy_from_slice(payload);
        self.tx_len = payload.len();
        Ok(())
    }

    fn schedule_tx(&mut self, _sfd_time: DeviceTime32, _payload_len: usize) -> Result<(), RadioError> {
        if self.fail_schedule {
            return Err(RadioError::Config);
        }
        Ok(())
    }

    fn schedule_tx_fp(&mut self, _sfd_time: DeviceTime32) -> Result<(), RadioError> {
        if self.fail_schedule {
            return Err(RadioError::Config);
        }
        Ok(())
    }

    fn schedule_rx(
        &mut self,
        _rx_on_time: Option<DeviceTime32>,
        _deadline: Option<DeviceTime32>,
        _preamble_to_pacs: u16,
    ) -> Result<(), RadioError> {
        if self.fail_schedule {
            return Err(RadioError::Config);
        }
        Ok(())
    }

    fn schedule_rx_fp(
        &mut self,
        _rx_on_time: Option<DeviceTime32>,
        _deadline: DeviceTime32,
    ) -> Result<(), RadioError> {
        if self.fail_schedule {
            return Err(RadioError::Config);
        }
        Ok(())
    }

    fn schedule_timer(&mut self, _deadline: DeviceTime32) -> Result<(), RadioError> {
        if self.fail_schedule {
            return Err(RadioError::Config);
        }
        Ok(())
    }

    fn now(&self) -> DeviceTime32 {
        self.now
    }

    fn read_rx_buffer(&mut self, buf: &mut [u8]) -> Result<usize, RadioError> {
        let n = self.last_rx_len.min(buf.len());
        buf[..n].copy_from_slice(&self.last_rx_buffer[..n]);
        Ok(n)
    }

    fn wait_event(&mut self) -> RadioEvent {
        self.events.pop_front().unwrap_or(RadioEvent {
            outcome: RadioOutcome::RxTimeout,
            sfd_time: self.now,
            status_bits: 0,
            rx_len: 0,
            diagnostics: RxDiagnostics::default(),
        })
    }
}
