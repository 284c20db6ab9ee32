//! Concurrent-Transmission Flood (Component E): Glossy-style synchronized
//! flooding, in two flavors (§4.5).
//!
//! `GlossyFlood` is the standalone, rtimer-driven protocol: it owns its own
//! schedule directly on top of the slot driver (A→B in the control-flow
//! diagram), since it doesn't participate in TSM's minislot grid.
//!
//! `GlossyTsm` is the cooperative variant used as a sub-protothread inside
//! Crystal/Weaver: it drives an already-running `Tsm` through a bounded
//! window of RX-then-TX slots and hands back the same reception outcome.

use crate::error::Result;
use crate::radio::Dw1000Radio;
use crate::sd::{SlotDriver, SlotStatus as SdStatus};
use crate::time::DeviceTime32;
use crate::tsm::{NextAction, PrevAction, Tsm};
use defmt::Format;

/// `config` byte bit layout (§6): bits 6-7 version, bits 4-5 sync flag.
const VERSION_MASK: u8 = 0b1100_0000;
const VERSION_TXONLY: u8 = 0b1000_0000;
const VERSION_STANDARD: u8 = 0b0100_0000;
const SYNC_MASK: u8 = 0b0011_0000;
const SYNC_FLAG: u8 = 0b0001_0000;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
pub enum GlossyVersion {
    TxOnly,
    Standard,
}

impl GlossyVersion {
    fn to_bits(self) -> u8 {
        match self {
            Self::TxOnly => VERSION_TXONLY,
            Self::Standard => VERSION_STANDARD,
        }
    }

    fn from_bits(bits: u8) -> Self {
        if bits & VERSION_MASK == VERSION_TXONLY {
            Self::TxOnly
        } else {
            Self::Standard
        }
    }
}

#[derive(Clone, Copy, Debug, Format)]
pub struct GlossyConfig {
    pub version: GlossyVersion,
    pub dynamic_slot_estimate: bool,
    pub rx_opt: bool,
    pub max_n_tx: u8,
}

impl Default for GlossyConfig {
    fn default() -> Self {
        Self {
            version: GlossyVersion::Standard,
            dynamic_slot_estimate: false,
            rx_opt: false,
            max_n_tx: 3,
        }
    }
}

/// Wire header (§6): `{ initiator_id, config, relay_cnt, max_n_tx, payload }`.
pub const GLOSSY_HEADER_LEN: usize = 5;
const MAX_GLOSSY_PAYLOAD: usize = 64;

#[derive(Clone, Copy, Debug, Format)]
pub struct GlossyHeader {
    pub initiator_id: u16,
    pub version: GlossyVersion,
    pub sync: bool,
    pub relay_cnt: u8,
    pub max_n_tx: u8,
}

impl GlossyHeader {
    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.initiator_id.to_le_bytes());
        let mut config = self.version.to_bits();
        if self.sync {
            config |= SYNC_FLAG;
        }
        out[2] = config;
        out[3] = self.relay_cnt;
        out[4] = self.max_n_tx;
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < GLOSSY_HEADER_LEN {
            return None;
        }
        let config = buf[2];
        Some(Self {
            initiator_id: u16::from_le_bytes([buf[0], buf[1]]),
            version: GlossyVersion::from_bits(config),
            sync: config & SYNC_MASK == SYNC_FLAG,
            relay_cnt: buf[3],
            max_n_tx: buf[4],
        })
    }

    /// Whether this header is consistent with one already accepted for the
    /// same flood (§4.5 validation rules): initiator, version, sync and
    /// max_n_tx must all agree.
    fn agrees_with(&self, other: &GlossyHeader) -> bool {
        self.initiator_id == other.initiator_id
            && self.version == other.version
            && self.sync == other.sync
            && self.max_n_tx == other.max_n_tx
    }
}

/// Running average of RX→TX / TX→RX round-trip deltas, used only when
/// `dynamic_slot_estimate` is set (`glossy.c`).
#[derive(Clone, Copy, Default)]
pub struct SlotDurationEstimator {
    sum: i64,
    count: u32,
}

impl SlotDurationEstimator {
    pub const fn new() -> Self {
        Self { sum: 0, count: 0 }
    }

    pub fn add_sample(&mut self, delta_ticks: u32) {
        self.sum += delta_ticks as i64;
        self.count += 1;
    }

    pub fn estimate(&self) -> Option<u32> {
        if self.count == 0 {
            None
        } else {
            Some((self.sum / self.count as i64) as u32)
        }
    }

    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// `FloodContext` (§3): state accumulated over the course of one flood.
#[derive(Clone, Copy, Debug, Format)]
pub struct FloodContext {
    pub tref: DeviceTime32,
    pub relay_cnt_first_rx: u8,
    pub n_tx: u8,
    pub n_rx: u8,
}

impl FloodContext {
    const fn new() -> Self {
        Self {
            tref: DeviceTime32::new(0),
            relay_cnt_first_rx: 0,
            n_tx: 0,
            n_rx: 0,
        }
    }
}

/// Outcome of running a flood to completion, as reported to the caller.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
pub enum FloodResult {
    /// We were the initiator; `n_tx` transmissions went out.
    Initiated,
    /// We received and forwarded the flood; carries `relay_cnt` of our
    /// first reception.
    Relayed,
    /// Nothing was heard before the flood window closed.
    Missed,
    /// A packet was heard but failed the header/payload agreement check.
    Disagreement,
}

/// Standalone, rtimer-driven Glossy flood (§4.5), run directly on top of
/// the slot driver.
pub struct GlossyFlood<R: Dw1000Radio> {
    sd: SlotDriver<R>,
    config: GlossyConfig,
    slot_duration_ticks: u32,
    estimator: SlotDurationEstimator,
    ctx: FloodContext,
    stored_header: Option<GlossyHeader>,
    disagreements: u32,
    tx_buf: [u8; GLOSSY_HEADER_LEN + MAX_GLOSSY_PAYLOAD],
}

impl<R: Dw1000Radio> GlossyFlood<R> {
    pub fn new(sd: SlotDriver<R>, config: GlossyConfig, slot_duration_ticks: u32) -> Self {
        Self {
            sd,
            config,
            slot_duration_ticks,
            estimator: SlotDurationEstimator::new(),
            ctx: FloodContext::new(),
            stored_header: None,
            disagreements: 0,
            tx_buf: [0; GLOSSY_HEADER_LEN + MAX_GLOSSY_PAYLOAD],
        }
    }

    pub fn sd_mut(&mut self) -> &mut SlotDriver<R> {
        &mut self.sd
    }

    pub fn disagreement_count(&self) -> u32 {
        self.disagreements
    }

    fn effective_slot_duration(&self) -> u32 {
        if self.config.dynamic_slot_estimate {
            self.estimator.estimate().unwrap_or(self.slot_duration_ticks)
        } else {
            self.slot_duration_ticks
        }
    }

    /// Run as the flood's initiator: transmit at `sfd_time`, then (Standard
    /// version) optionally re-enable RX to resume the flood if a later
    /// retransmission comes back around.
    pub fn initiate(
        &mut self,
        initiator_id: u16,
        sfd_time: DeviceTime32,
        sync: bool,
        payload: &[u8],
    ) -> Result<FloodResult> {
        let hdr = GlossyHeader {
            initiator_id,
            version: self.config.version,
            sync,
            relay_cnt: 0,
            max_n_tx: self.config.max_n_tx,
        };
        self.ctx = FloodContext::new();
        self.ctx.tref = sfd_time;
        self.write_packet(&hdr, payload);
        let total = GLOSSY_HEADER_LEN + payload.len();
        self.sd.tx_at(&self.tx_buf[..total], sfd_time)?;
        self.ctx.n_tx = 1;
        Ok(FloodResult::Initiated)
    }

    /// Run as a forwarder: scan for the flood, then retransmit on each
    /// successful reception up to `max_n_tx` total, one slot later every
    /// time, exactly per §4.5.
    pub fn forward(&mut self, own_id: u16, scan_deadline: DeviceTime32, out_payload: &mut [u8]) -> Result<FloodResult> {
        let _ = own_id;
        self.ctx = FloodContext::new();
        self.stored_header = None;

        let first = self.sd.rx_until(scan_deadline)?;
        if first.status != SdStatus::RxSuccess {
            return Ok(FloodResult::Missed);
        }

        let mut scratch = [0u8; GLOSSY_HEADER_LEN + MAX_GLOSSY_PAYLOAD];
        let n = self.sd.read_rx_buffer(&mut scratch[..first.rx_len.min(scratch.len())])?;
        let Some(hdr) = GlossyHeader::decode(&scratch[..n]) else {
            return Ok(FloodResult::Missed);
        };

        self.stored_header = Some(hdr);
        self.ctx.relay_cnt_first_rx = hdr.relay_cnt;
        let slot_dur = self.effective_slot_duration();
        self.ctx.tref = first
            .sfd_time
            .wrapping_sub((hdr.relay_cnt as u32).wrapping_mul(slot_dur));
        self.ctx.n_rx = 1;

        let payload_len = n.saturating_sub(GLOSSY_HEADER_LEN).min(out_payload.len());
        out_payload[..payload_len].copy_from_slice(&scratch[GLOSSY_HEADER_LEN..GLOSSY_HEADER_LEN + payload_len]);

        let mut relay_cnt = hdr.relay_cnt;
        let mut last_rx_sfd = first.sfd_time;
        while self.ctx.n_tx < self.config.max_n_tx && relay_cnt < hdr.max_n_tx {
            relay_cnt += 1;
            let fwd_hdr = GlossyHeader {
                relay_cnt,
                ..hdr
            };
            let tx_sfd = last_rx_sfd.wrapping_add(slot_dur);
            fwd_hdr.encode(&mut self.tx_buf[..GLOSSY_HEADER_LEN]);
            self.tx_buf[GLOSSY_HEADER_LEN..GLOSSY_HEADER_LEN + payload_len]
                .copy_from_slice(&out_payload[..payload_len]);
            if self
                .sd
                .tx_at(&self.tx_buf[..GLOSSY_HEADER_LEN + payload_len], tx_sfd)
                .is_err()
            {
                break;
            }
            self.ctx.n_tx += 1;

            if self.config.version == GlossyVersion::Standard
                && self.ctx.n_tx < self.config.max_n_tx
            {
                let to = tx_sfd.wrapping_add(slot_dur.wrapping_add(slot_dur / 2));
                match self.sd.rx_until(to) {
                    Ok(rec) if rec.status == SdStatus::RxSuccess => {
                        let n2 = self.sd.read_rx_buffer(&mut scratch[..rec.rx_len.min(scratch.len())])?;
                        match GlossyHeader::decode(&scratch[..n2]) {
                            Some(next_hdr) if next_hdr.agrees_with(&hdr) => {
                                relay_cnt = next_hdr.relay_cnt;
                                last_rx_sfd = rec.sfd_time;
                                self.ctx.n_rx += 1;
                                if self.config.dynamic_slot_estimate {
                                    self.estimator.add_sample(rec.sfd_time.diff(tx_sfd).max(0) as u32);
                                }
                            }
                            Some(_) => {
                                self.disagreements += 1;
                                break;
                            }
                            None => break,
                        }
                    }
                    _ => break,
                }
            } else {
                last_rx_sfd = tx_sfd;
            }
        }

        Ok(FloodResult::Relayed)
    }

    fn write_packet(&mut self, hdr: &GlossyHeader, payload: &[u8]) {
        hdr.encode(&mut self.tx_buf[..GLOSSY_HEADER_LEN]);
        let len = payload.len().min(MAX_GLOSSY_PAYLOAD);
        self.tx_buf[GLOSSY_HEADER_LEN..GLOSSY_HEADER_LEN + len].copy_from_slice(&payload[..len]);
    }

    pub fn ctx(&self) -> FloodContext {
        self.ctx
    }
}

/// Cooperative Glossy-TSM sub-state-machine (§4.5), invoked from inside an
/// already-running `Tsm` (from Crystal's S/A phases or a CTF-only caller).
/// Within a caller-bounded window of `max_len` logic slots it repeatedly RXs
/// until one succeeds, then TXs up to `n_tx` times in consecutive slots.
pub struct GlossyTsm {
    config: GlossyConfig,
    ctx: FloodContext,
}

/// Outcome reported back to the caller after `run` completes.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
pub enum GlossyTsmOutcome {
    Initiated,
    Received,
    TimedOut,
}

impl GlossyTsm {
    pub fn new(config: GlossyConfig) -> Self {
        Self {
            config,
            ctx: FloodContext::new(),
        }
    }

    pub fn ctx(&self) -> FloodContext {
        self.ctx
    }

    /// Run as the initiator of a flood carrying `payload`: one TX slot, plus
    /// (`n_tx`-1) further TX slots to let other nodes already in the chain
    /// keep retransmitting, consistent with "N retransmissions in contiguous
    /// slots" (§4.5/CTF overview).
    pub fn run_initiate<R: Dw1000Radio>(
        &mut self,
        tsm: &mut Tsm<R>,
        initiator_id: u16,
        sync: bool,
        payload: &[u8],
    ) -> GlossyTsmOutcome {
        let hdr = GlossyHeader {
            initiator_id,
            version: self.config.version,
            sync,
            relay_cnt: 0,
            max_n_tx: self.config.max_n_tx,
        };
        let mut buf = [0u8; GLOSSY_HEADER_LEN + MAX_GLOSSY_PAYLOAD];
        hdr.encode(&mut buf[..GLOSSY_HEADER_LEN]);
        let plen = payload.len().min(MAX_GLOSSY_PAYLOAD);
        buf[GLOSSY_HEADER_LEN..GLOSSY_HEADER_LEN + plen].copy_from_slice(&payload[..plen]);

        let na = NextAction::default_for(1);
        if tsm.tx_slot(&na, &buf[..GLOSSY_HEADER_LEN + plen]).is_ok() {
            self.ctx.n_tx = 1;
            for _ in 1..self.config.max_n_tx {
                let na = NextAction::default_for(1);
                if tsm.tx_slot(&na, &buf[..GLOSSY_HEADER_LEN + plen]).is_err() {
                    break;
                }
                self.ctx.n_tx += 1;
            }
            GlossyTsmOutcome::Initiated
        } else {
            GlossyTsmOutcome::TimedOut
        }
    }

    /// Run as a forwarder within a window of at most `max_len` logic slots:
    /// RX until a success, then relay via TX for the remaining retransmit
    /// budget. `out_payload` receives the application payload on success.
    /// Returns the final `PrevAction` of the last slot run, for the caller
    /// to inspect (e.g. Crystal reading a DATA source field).
    pub fn run_receive<R: Dw1000Radio>(
        &mut self,
        tsm: &mut Tsm<R>,
        max_len: u32,
        accept_sync: bool,
        out_payload: &mut [u8],
    ) -> (GlossyTsmOutcome, PrevAction, usize) {
        let mut remaining = max_len;
        let mut last_pa = None;
        let mut hdr_opt = None;
        let mut payload_len = 0usize;

        while remaining > 0 {
            let mut na = NextAction::default_for(1);
            na.accept_sync = accept_sync && hdr_opt.is_none();
            let pa = tsm.rx_slot(&na);
            remaining -= 1;
            if pa.status == SdStatus::RxSuccess {
                if let Some(hdr) = GlossyHeader::decode(tsm.rx_payload()) {
                    self.ctx.relay_cnt_first_rx = hdr.relay_cnt;
                    payload_len = pa.payload_len.saturating_sub(GLOSSY_HEADER_LEN);
                    let n = payload_len.min(out_payload.len());
                    out_payload[..n].copy_from_slice(
                        &tsm.rx_payload()[GLOSSY_HEADER_LEN..GLOSSY_HEADER_LEN + n],
                    );
                    hdr_opt = Some(hdr);
                    last_pa = Some(pa);
                    break;
                }
            }
            last_pa = Some(pa);
        }

        let Some(mut pa) = last_pa else {
            return (
                GlossyTsmOutcome::TimedOut,
                PrevAction {
                    action: crate::tsm::TsmAction::Rx,
                    status: SdStatus::RxTimeout,
                    radio_status: 0,
                    payload_len: 0,
                    minislot_idx: tsm.minislot_idx(),
                    logic_slot_idx: tsm.logic_slot_idx(),
                    remote_minislot_idx: None,
                    remote_logic_slot_idx: None,
                    diagnostics: crate::radio::RxDiagnostics::default(),
                },
                0,
            );
        };

        let Some(hdr) = hdr_opt else {
            return (GlossyTsmOutcome::TimedOut, pa, 0);
        };

        self.ctx.n_rx = 1;
        let mut relay_cnt = hdr.relay_cnt;
        let mut buf = [0u8; GLOSSY_HEADER_LEN + MAX_GLOSSY_PAYLOAD];
        while self.ctx.n_tx < self.config.max_n_tx && relay_cnt < hdr.max_n_tx && remaining > 0 {
            relay_cnt += 1;
            let fwd_hdr = GlossyHeader { relay_cnt, ..hdr };
            fwd_hdr.encode(&mut buf[..GLOSSY_HEADER_LEN]);
            let n = payload_len.min(out_payload.len());
            buf[GLOSSY_HEADER_LEN..GLOSSY_HEADER_LEN + n].copy_from_slice(&out_payload[..n]);
            let na = NextAction::default_for(1);
            match tsm.tx_slot(&na, &buf[..GLOSSY_HEADER_LEN + n]) {
                Ok(tx_pa) => {
                    pa = tx_pa;
                    self.ctx.n_tx += 1;
                    remaining -= 1;
                }
                Err(_) => break,
            }
        }

        (GlossyTsmOutcome::Received, pa, payload_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRadio;
    use crate::radio::{RadioEvent, RadioOutcome, RxDiagnostics};
    use crate::tsm::TsmConfig;

    #[test]
    fn header_round_trips() {
        let hdr = GlossyHeader {
            initiator_id: 7,
            version: GlossyVersion::Standard,
            sync: true,
            relay_cnt: 2,
            max_n_tx: 3,
        };
        let mut buf = [0u8; GLOSSY_HEADER_LEN];
        hdr.encode(&mut buf);
        let decoded = GlossyHeader::decode(&buf).unwrap();
        assert_eq!(decoded.initiator_id, 7);
        assert_eq!(decoded.version, GlossyVersion::Standard);
        assert!(decoded.sync);
        assert_eq!(decoded.relay_cnt, 2);
    }

    #[test]
    fn estimator_averages_samples() {
        let mut est = SlotDurationEstimator::new();
        assert_eq!(est.estimate(), None);
        est.add_sample(100);
        est.add_sample(200);
        assert_eq!(est.estimate(), Some(150));
    }

    #[test]
    fn forward_propagates_and_bumps_relay_cnt() {
        let mut radio = MockRadio::new();
        let hdr = GlossyHeader {
            initiator_id: 1,
            version: GlossyVersion::TxOnly,
            sync: false,
            relay_cnt: 1,
            max_n_tx: 3,
        };
        let mut pkt = [0u8; GLOSSY_HEADER_LEN + 2];
        hdr.encode(&mut pkt[..GLOSSY_HEADER_LEN]);
        pkt[GLOSSY_HEADER_LEN..].copy_from_slice(&[5, 6]);
        radio.queue_rx_ok(DeviceTime32::new(1000), &pkt);
        radio.queue_event(RadioEvent {
            outcome: RadioOutcome::TxDone,
            sfd_time: DeviceTime32::new(0),
            status_bits: 0,
            rx_len: 0,
            diagnostics: RxDiagnostics::default(),
        });

        let config = GlossyConfig {
            version: GlossyVersion::TxOnly,
            max_n_tx: 3,
            ..Default::default()
        };
        let mut flood = GlossyFlood::new(SlotDriver::new(radio), config, 1000);
        let mut out = [0u8; 2];
        let result = flood.forward(2, DeviceTime32::new(5000), &mut out).unwrap();
        assert_eq!(result, FloodResult::Relayed);
        assert_eq!(out, [5, 6]);
        assert_eq!(flood.ctx().n_tx, 1);
    }

    #[test]
    fn glossy_tsm_initiate_sends_n_tx_times() {
        let mut radio = MockRadio::new();
        for _ in 0..3 {
            radio.queue_event(RadioEvent {
                outcome: RadioOutcome::TxDone,
                sfd_time: DeviceTime32::new(0),
                status_bits: 0,
                rx_len: 0,
                diagnostics: RxDiagnostics::default(),
            });
        }
        let mut tsm = Tsm::new(SlotDriver::new(radio), TsmConfig::default());
        tsm.start(0);
        let mut glossy = GlossyTsm::new(GlossyConfig {
            max_n_tx: 3,
            ..Default::default()
        });
        let outcome = glossy.run_initiate(&mut tsm, 1, true, &[1, 2, 3]);
        assert_eq!(outcome, GlossyTsmOutcome::Initiated);
        assert_eq!(glossy.ctx().n_tx, 3);
    }
}
