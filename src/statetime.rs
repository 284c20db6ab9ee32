//! Statetime monitor (Component C).
//!
//! A passive observer of SD/TSM scheduling calls and completions. Accounts
//! elapsed device-time into one of six buckets and estimates the
//! radio↔MCU tick ratio with a small median filter so MCU-only timestamps
//! (e.g. an RX timeout with no valid SFD) can still be converted to
//! device-time.

use crate::time::DeviceTime32;
use defmt::Format;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
pub enum RadioState {
    Idle,
    ScheduledTx,
    ScheduledRx,
    /// RX armed immediately after a TX completed, as distinct from a
    /// freshly-scheduled RX: the dwell-time split needs to know whether
    /// the "idle since schedule" clock started at the TX's own deadline
    /// or at an explicit delay after it.
    RxAfterTx,
}

/// The six energy-accounting buckets, summed at epoch end.
#[derive(Clone, Copy, Default, Debug, Format)]
pub struct StatetimeLog {
    pub idle_time_us: u64,
    pub rx_preamble_hunting_time_us: u64,
    pub rx_preamble_time_us: u64,
    pub rx_data_time_us: u64,
    pub tx_preamble_time_us: u64,
    pub tx_data_time_us: u64,
}

impl StatetimeLog {
    pub fn total_us(&self) -> u64 {
        self.idle_time_us
            + self.rx_preamble_hunting_time_us
            + self.rx_preamble_time_us
            + self.rx_data_time_us
            + self.tx_preamble_time_us
            + self.tx_data_time_us
    }
}

const RATIO_SAMPLES: usize = 9;

/// Fixed 9-sample median filter over radio-tick-per-MCU-tick ratios,
/// expressed as a Q16 fixed-point value to stay integer-only.
struct RatioEstimator {
    samples: [u32; RATIO_SAMPLES],
    len: usize,
    next: usize,
}

impl RatioEstimator {
    fn new() -> Self {
        Self {
            samples: [1 << 16; RATIO_SAMPLES],
            len: 0,
            next: 0,
        }
    }

    fn push(&mut self, ratio_q16: u32) {
        self.samples[self.next] = ratio_q16;
        self.next = (self.next + 1) % RATIO_SAMPLES;
        if self.len < RATIO_SAMPLES {
            self.len += 1;
        }
    }

    fn median(&self) -> u32 {
        let mut buf = self.samples;
        let n = self.len.max(1);
        // insertion sort: n <= 9, cheap and allocation-free.
        for i in 1..n {
            let key = buf[i];
            let mut j = i;
            while j > 0 && buf[j - 1] > key {
                buf[j] = buf[j - 1];
                j -= 1;
            }
            buf[j] = key;
        }
        buf[n / 2]
    }

    fn reset(&mut self) {
        *self = Self::new();
    }
}

pub struct StatetimeMonitor {
    state: RadioState,
    log: StatetimeLog,
    ratio: RatioEstimator,
    tracing: bool,
    schedule_time: DeviceTime32,
    last_idle_time: DeviceTime32,
    is_rx_after_tx: bool,
    rx_delay: u32,
}

impl StatetimeMonitor {
    pub fn new() -> Self {
        Self {
            state: RadioState::Idle,
            log: StatetimeLog::default(),
            ratio: RatioEstimator::new(),
            tracing: false,
            schedule_time: DeviceTime32::new(0),
            last_idle_time: DeviceTime32::new(0),
            is_rx_after_tx: false,
            rx_delay: 0,
        }
    }

    pub fn start(&mut self) {
        self.tracing = true;
    }

    pub fn stop(&mut self) {
        self.tracing = false;
    }

    pub fn log(&self) -> &StatetimeLog {
        &self.log
    }

    pub fn set_last_idle(&mut self, t: DeviceTime32) {
        self.last_idle_time = t;
        self.state = RadioState::Idle;
    }

    fn ticks_to_us(&self, ticks: u32) -> u64 {
        // device-time ticks -> us, scaled by the estimated ratio correction.
        let raw_us = (ticks as u64) * 40_064 / 10_000_000;
        let ratio = self.ratio.median() as u64;
        (raw_us * ratio) >> 16
    }

    pub fn schedule_tx(&mut self, at: DeviceTime32, preamble_duration_us: u32, payload_duration_us: u32) {
        if !self.tracing {
            return;
        }
        let idle_ticks = at.diff(self.last_idle_time).max(0) as u32;
        self.log.idle_time_us += self.ticks_to_us(idle_ticks);
        self.log.tx_preamble_time_us += preamble_duration_us as u64;
        self.log.tx_data_time_us += payload_duration_us as u64;
        self.schedule_time = at;
        self.state = RadioState::ScheduledTx;
        self.is_rx_after_tx = false;
    }

    pub fn schedule_rx(&mut self, at: DeviceTime32, hunting_budget_us: u32, preamble_us: u32, payload_us: u32) {
        if !self.tracing {
            return;
        }
        let idle_ticks = at.diff(self.last_idle_time).max(0) as u32;
        self.log.idle_time_us += self.ticks_to_us(idle_ticks);
        self.log.rx_preamble_hunting_time_us += hunting_budget_us as u64;
        self.log.rx_preamble_time_us += preamble_us as u64;
        self.log.rx_data_time_us += payload_us as u64;
        self.schedule_time = at;
        self.state = RadioState::ScheduledRx;
        self.is_rx_after_tx = false;
    }

    pub fn schedule_txrx(&mut self, tx_at: DeviceTime32, rx_delay_ticks: u32, hunting_us: u32, preamble_us: u32, payload_us: u32) {
        self.schedule_rx(tx_at, hunting_us, preamble_us, payload_us);
        self.is_rx_after_tx = true;
        self.rx_delay = rx_delay_ticks;
    }

    pub fn after_tx(&mut self, actual_sfd: DeviceTime32) {
        self.push_ratio_sample_from_schedule(actual_sfd);
        self.last_idle_time = actual_sfd;
        self.state = RadioState::Idle;
    }

    pub fn after_rx(&mut self, actual_sfd: DeviceTime32) {
        self.push_ratio_sample_from_schedule(actual_sfd);
        self.last_idle_time = actual_sfd;
        self.state = RadioState::Idle;
    }

    fn push_ratio_sample_from_schedule(&mut self, actual: DeviceTime32) {
        // A sample is only meaningful when we scheduled something and the
        // radio reports back how far off the mcu's own clock was.
        let scheduled = self.schedule_time.raw();
        let observed = actual.raw();
        if scheduled == 0 {
            return;
        }
        let delta = observed.wrapping_sub(scheduled);
        if delta == 0 {
            return;
        }
        // ratio_q16 = observed_ticks / mcu_ticks, here approximated as 1:1
        // plus the delta's own contribution; the concrete conversion
        // constants live in the underlying hal timer driver which this
        // crate does not own.
        let ratio_q16 = (1u32 << 16).saturating_add(delta.min(1 << 10));
        self.ratio.push(ratio_q16);
    }

    /// Reset per-epoch accounting, including the ratio estimator: its
    /// samples do not carry over between epochs.
    pub fn reset_epoch(&mut self) {
        self.log = StatetimeLog::default();
        self.ratio.reset();
    }

    /// Alias for `reset_epoch`, kept for call sites that reset on radio
    /// reconfiguration (channel/PRF change) rather than epoch boundary.
    pub fn reset_all(&mut self) {
        self.reset_epoch();
    }
}

impl Default for StatetimeMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_then_tx_attributes_idle_time() {
        let mut m = StatetimeMonitor::new();
        m.start();
        m.set_last_idle(DeviceTime32::new(0));
        m.schedule_tx(DeviceTime32::new(250_000), 10, 20);
        assert!(m.log().idle_time_us > 0);
        assert_eq!(m.log().tx_preamble_time_us, 10);
        assert_eq!(m.log().tx_data_time_us, 20);
    }

    #[test]
    fn reset_epoch_clears_buckets_and_ratio_estimator() {
        let mut m = StatetimeMonitor::new();
        m.start();
        m.schedule_tx(DeviceTime32::new(1000), 5, 5);
        m.after_tx(DeviceTime32::new(1005));
        assert_ne!(m.ratio.median(), 1 << 16);
        m.reset_epoch();
        assert_eq!(m.log().total_us(), 0);
        assert_eq!(m.ratio.median(), 1 << 16);
    }
}
