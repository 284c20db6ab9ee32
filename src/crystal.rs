//! Crystal engine (Component F): periodic sink-coordinated (S, T, A)
//! collection with bounded termination heuristics.
//!
//! One epoch is a Sync flood, up to `CRYSTAL_MAX_TAS` TA rounds (each a
//! Data flood followed by an Ack flood), and -- for the FS variant -- a
//! Flick slot tacked onto the end of S and every A. Sink and peer share the
//! same `Phase` progression and termination-counter bookkeeping; only the
//! direction of the Data/Ack floods differs.

use crate::ctf::{GlossyConfig, GlossyTsm, GlossyTsmOutcome};
use crate::radio::Dw1000Radio;
use crate::sd::SlotStatus;
use crate::tsm::Tsm;
use crate::util::{DeploymentTable, SlotLogEntry, SlotLogKind, SlotLogRing};
use defmt::Format;

/// Epoch numbers further than this ahead of the last accepted one are
/// clamped to `last_epoch + 1` rather than adopted outright (§4.6 peer-loop
/// point 1), guarding against a corrupted/forged SYNC jumping the epoch
/// counter far into the future.
const MAX_EPOCH_JUMP: u16 = 50;

pub const CRYSTAL_MAX_TAS: usize = 32;
const CRYSTAL_MAX_PAYLOAD: usize = 32;

#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
#[repr(u8)]
pub enum PacketType {
    Sync = 0x01,
    Data = 0x02,
    Ack = 0x03,
}

impl PacketType {
    fn from_u8(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Sync),
            0x02 => Some(Self::Data),
            0x03 => Some(Self::Ack),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Format)]
pub struct SyncPacket {
    pub epoch: u16,
}

impl SyncPacket {
    pub const HEADER_LEN: usize = 3;

    pub fn encode(&self, out: &mut [u8]) {
        out[0] = PacketType::Sync as u8;
        out[1..3].copy_from_slice(&self.epoch.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::HEADER_LEN || PacketType::from_u8(buf[0])? != PacketType::Sync {
            return None;
        }
        Some(Self {
            epoch: u16::from_le_bytes([buf[1], buf[2]]),
        })
    }
}

#[derive(Clone, Copy, Debug, Format)]
pub struct DataPacket {
    pub src: u16,
}

impl DataPacket {
    pub const HEADER_LEN: usize = 3;

    pub fn encode(&self, out: &mut [u8]) {
        out[0] = PacketType::Data as u8;
        out[1..3].copy_from_slice(&self.src.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::HEADER_LEN || PacketType::from_u8(buf[0])? != PacketType::Data {
            return None;
        }
        Some(Self {
            src: u16::from_le_bytes([buf[1], buf[2]]),
        })
    }
}

const ACK_FLAG_NACK: u8 = 0b01;
const ACK_FLAG_ACK: u8 = 0b10;

#[derive(Clone, Copy, Debug, Format)]
pub struct AckPacket {
    pub epoch: u16,
    pub flags: u8,
    pub ack_bitmap: u64,
}

impl AckPacket {
    pub const HEADER_LEN: usize = 12;

    pub fn encode(&self, out: &mut [u8]) {
        out[0] = PacketType::Ack as u8;
        out[1..3].copy_from_slice(&self.epoch.to_le_bytes());
        out[3] = self.flags;
        out[4..12].copy_from_slice(&self.ack_bitmap.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::HEADER_LEN || PacketType::from_u8(buf[0])? != PacketType::Ack {
            return None;
        }
        Some(Self {
            epoch: u16::from_le_bytes([buf[1], buf[2]]),
            flags: buf[3],
            ack_bitmap: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
        })
    }

    pub fn is_sleep(&self) -> bool {
        crate::util::is_sleep_order(self.ack_bitmap)
    }

    pub fn is_nack(&self) -> bool {
        self.flags & ACK_FLAG_NACK != 0
    }

    pub fn is_ack(&self) -> bool {
        self.flags & ACK_FLAG_ACK != 0
    }
}

#[derive(Clone, Copy, Debug, Format)]
pub struct CrystalConfig {
    pub period_ticks: u32,
    pub is_sink: bool,
    pub ntx_s: u8,
    pub ntx_t: u8,
    pub ntx_a: u8,
    pub plds_s: usize,
    pub plds_t: usize,
    pub plds_a: usize,
    /// `r`: sink's max consecutive empty T slots before terminating.
    pub sink_max_empty_ts: u32,
    /// `y`: peer's max consecutive silent TAs (receiver side) before terminating.
    pub max_silent_tas: u32,
    /// `z`: peer's max consecutive missed acks (transmitter side) before terminating.
    pub max_missing_acks: u32,
    /// `x`: sink's max consecutive reception errors before terminating.
    pub sink_max_rcp_errors_ts: u32,
    pub fs_enable: bool,
    pub scan_duration_epochs: u32,
}

impl Default for CrystalConfig {
    fn default() -> Self {
        Self {
            period_ticks: crate::time::DeviceTime32::us_to_ticks(1_000_000),
            is_sink: false,
            ntx_s: 3,
            ntx_t: 3,
            ntx_a: 3,
            plds_s: 0,
            plds_t: 4,
            plds_a: 0,
            sink_max_empty_ts: 3,
            max_silent_tas: 3,
            max_missing_acks: 3,
            sink_max_rcp_errors_ts: 3,
            fs_enable: false,
            scan_duration_epochs: 4,
        }
    }
}

/// Per-epoch state, zeroed at the top of every epoch by the engine.
#[derive(Clone, Copy, Debug, Format)]
pub struct EpochContext {
    pub epoch: u16,
    pub received_bitmap: u64,
    pub ack_bitmap: u64,
    pub last_ack_flags: u8,
    pub cumulative_failed_synchronizations: u32,
    pub n_noack_epochs: u32,
    /// Result of the most recent FS slot, `None` when FS is disabled.
    pub last_fs: Option<SlotStatus>,
}

impl EpochContext {
    fn new(epoch: u16) -> Self {
        Self {
            epoch,
            received_bitmap: 0,
            ack_bitmap: 0,
            last_ack_flags: 0,
            cumulative_failed_synchronizations: 0,
            n_noack_epochs: 0,
            last_fs: None,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
pub enum Phase {
    S,
    Ta(u16),
    A,
    Done,
}

/// Why an epoch ended, surfaced in the per-epoch log line.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
pub enum EndReason {
    MaxTas,
    NegativeFlick,
    MaxReceptionErrors,
    TerminationCap,
    SleepOrder,
    MaxSlot,
    NoBootstrap,
}

/// Outcome of running one full epoch, for the app/log layer.
#[derive(Clone, Copy, Debug, Format)]
pub struct EpochResult {
    pub epoch: u16,
    pub n_tas_run: u16,
    pub end_reason: EndReason,
    pub received_bitmap: u64,
    pub ack_bitmap: u64,
}

pub struct CrystalEngine<'a, R: Dw1000Radio> {
    tsm: Tsm<R>,
    config: CrystalConfig,
    glossy: GlossyTsm,
    deployment: DeploymentTable<'a>,
    own_id: u16,
    is_originator: bool,
    silent_epochs: u32,
    last_epoch: u16,
    log: SlotLogRing<64>,
}

const N_SILENT_EPOCHS_TO_STOP_SENDING: u32 = 4;

impl<'a, R: Dw1000Radio> CrystalEngine<'a, R> {
    pub fn new(tsm: Tsm<R>, config: CrystalConfig, deployment: DeploymentTable<'a>, own_id: u16) -> Self {
        Self {
            tsm,
            config,
            glossy: GlossyTsm::new(GlossyConfig {
                dynamic_slot_estimate: false,
                ..Default::default()
            }),
            deployment,
            own_id,
            is_originator: false,
            silent_epochs: 0,
            last_epoch: 0,
            log: SlotLogRing::new(),
        }
    }

    /// Accept `candidate` as the new epoch number if it is same-or-increasing
    /// relative to the last accepted epoch; a jump of more than
    /// `MAX_EPOCH_JUMP` ahead is clamped to `last_epoch + 1` and a regression
    /// is rejected outright (§4.6 peer-loop point 1).
    fn accept_epoch(&mut self, candidate: u16) -> Option<u16> {
        if candidate < self.last_epoch {
            return None;
        }
        let accepted = if candidate.wrapping_sub(self.last_epoch) > MAX_EPOCH_JUMP {
            self.last_epoch.wrapping_add(1)
        } else {
            candidate
        };
        self.last_epoch = accepted;
        Some(accepted)
    }

    pub fn tsm_mut(&mut self) -> &mut Tsm<R> {
        &mut self.tsm
    }

    pub fn set_is_originator(&mut self, flag: bool) {
        self.is_originator = flag;
    }

    pub fn log(&self) -> &SlotLogRing<64> {
        &self.log
    }

    fn push_log(&mut self, kind: SlotLogKind, pa_slot_diff: i32) {
        self.log.push(SlotLogEntry {
            kind,
            hop_distance: 0,
            slot_diff: pa_slot_diff,
            ack_bitmap: 0,
            pool_bitmap: 0,
        });
    }

    fn dynamic_ta_cap(&self, n_ta: u16) -> u32 {
        self.config
            .sink_max_empty_ts
            .max(1)
            .saturating_add(n_ta as u32 / 4)
    }

    /// Run one epoch as the sink. `sync_payload`/`ta_payload_source` let the
    /// caller supply application data for S and react to each TA's incoming
    /// data (`app_pre_s`, `app_between_ta`).
    pub fn run_sink_epoch(&mut self, epoch: u16, sync_payload: &[u8]) -> EpochResult {
        self.log.clear();
        let mut ctx = EpochContext::new(epoch);

        let mut sync_buf = [0u8; SyncPacket::HEADER_LEN + CRYSTAL_MAX_PAYLOAD];
        SyncPacket { epoch }.encode(&mut sync_buf[..SyncPacket::HEADER_LEN]);
        let plen = sync_payload.len().min(CRYSTAL_MAX_PAYLOAD);
        sync_buf[SyncPacket::HEADER_LEN..SyncPacket::HEADER_LEN + plen]
            .copy_from_slice(&sync_payload[..plen]);
        self.glossy.run_initiate(
            &mut self.tsm,
            self.own_id,
            true,
            &sync_buf[..SyncPacket::HEADER_LEN + plen],
        );
        self.push_log(SlotLogKind::Tx, 0);

        if self.config.fs_enable {
            let deadline = self.tsm.tref();
            let pa = self.tsm.rx_fs_slot(&crate::tsm::NextAction::default_for(1), deadline);
            ctx.last_fs = Some(pa.status);
            if pa.status == SlotStatus::FsEmpty || pa.status == SlotStatus::FsError {
                return self.finish_epoch(ctx, 0, EndReason::NegativeFlick);
            }
        }

        let mut n_empty_ts = 0u32;
        let mut n_reception_errors = 0u32;
        let mut n_ta: u16 = 0;

        while (n_ta as usize) < CRYSTAL_MAX_TAS {
            let mut out = [0u8; CRYSTAL_MAX_PAYLOAD];
            let (outcome, _pa, plen) =
                self.glossy
                    .run_receive(&mut self.tsm, 1, false, &mut out);

            let mut flags = 0u8;
            if outcome == GlossyTsmOutcome::Received {
                if let Some(data) = DataPacket::decode(&out[..plen.min(CRYSTAL_MAX_PAYLOAD)]) {
                    ctx.received_bitmap = self.deployment.flag_node(ctx.received_bitmap, data.src);
                    flags |= ACK_FLAG_ACK;
                    n_empty_ts = 0;
                    n_reception_errors = 0;
                    self.push_log(SlotLogKind::Rx, 0);
                } else {
                    flags |= ACK_FLAG_NACK;
                    n_reception_errors += 1;
                    self.push_log(SlotLogKind::Malformed, 0);
                }
            } else {
                flags |= ACK_FLAG_NACK;
                n_empty_ts += 1;
                self.push_log(SlotLogKind::Timeout, 0);
            }
            ctx.last_ack_flags = flags;

            let terminate = n_empty_ts >= self.dynamic_ta_cap(n_ta)
                || n_reception_errors >= self.config.sink_max_rcp_errors_ts
                || n_ta as usize + 1 >= CRYSTAL_MAX_TAS;
            if terminate {
                ctx.ack_bitmap = crate::util::SLEEP_BITMAP;
            } else {
                ctx.ack_bitmap |= ctx.received_bitmap;
            }

            let mut ack_buf = [0u8; AckPacket::HEADER_LEN];
            AckPacket {
                epoch,
                flags: ctx.last_ack_flags,
                ack_bitmap: ctx.ack_bitmap,
            }
            .encode(&mut ack_buf);
            self.glossy
                .run_initiate(&mut self.tsm, self.own_id, false, &ack_buf);
            self.push_log(SlotLogKind::Tx, 0);

            n_ta += 1;
            if terminate {
                let reason = self.end_reason_for(n_ta, true);
                return self.finish_epoch(ctx, n_ta, reason);
            }
        }

        self.finish_epoch(ctx, n_ta, EndReason::MaxTas)
    }

    fn end_reason_for(&self, n_ta: u16, sink: bool) -> EndReason {
        if n_ta as usize + 1 >= CRYSTAL_MAX_TAS {
            EndReason::MaxTas
        } else if sink {
            EndReason::TerminationCap
        } else {
            EndReason::SleepOrder
        }
    }

    fn finish_epoch(&mut self, ctx: EpochContext, n_ta: u16, reason: EndReason) -> EpochResult {
        crate::util::log_epoch(ctx.epoch, n_ta as u32, ctx.ack_bitmap, 0, &self.log);
        defmt::warn!("Exit epoch due {}", reason);
        EpochResult {
            epoch: ctx.epoch,
            n_tas_run: n_ta,
            end_reason: reason,
            received_bitmap: ctx.received_bitmap,
            ack_bitmap: ctx.ack_bitmap,
        }
    }

    /// Run one epoch as a peer. `own_data` is `Some(payload)` when this node
    /// has data to send in this epoch (the app's `app_pre_t`).
    pub fn run_peer_epoch(&mut self, own_data: Option<&[u8]>) -> EpochResult {
        self.log.clear();

        let mut scan_buf = [0u8; SyncPacket::HEADER_LEN + CRYSTAL_MAX_PAYLOAD];
        let (outcome, _pa, plen) =
            self.glossy
                .run_receive(&mut self.tsm, 4, true, &mut scan_buf);

        let epoch = match outcome {
            GlossyTsmOutcome::Received => match SyncPacket::decode(&scan_buf[..plen.min(scan_buf.len())]) {
                Some(sync) => match self.accept_epoch(sync.epoch) {
                    Some(accepted) => {
                        self.silent_epochs = 0;
                        self.push_log(SlotLogKind::SyncAccepted, 0);
                        accepted
                    }
                    None => {
                        self.silent_epochs += 1;
                        self.push_log(SlotLogKind::Malformed, 0);
                        return self.finish_epoch(EpochContext::new(0), 0, EndReason::NoBootstrap);
                    }
                },
                None => {
                    self.silent_epochs += 1;
                    self.push_log(SlotLogKind::Malformed, 0);
                    return self.finish_epoch(EpochContext::new(0), 0, EndReason::NoBootstrap);
                }
            },
            _ => {
                self.silent_epochs += 1;
                self.push_log(SlotLogKind::Bootstrap, 0);
                return self.finish_epoch(EpochContext::new(0), 0, EndReason::NoBootstrap);
            }
        };

        let mut ctx = EpochContext::new(epoch);
        let can_transmit = self.silent_epochs < N_SILENT_EPOCHS_TO_STOP_SENDING;

        if self.config.fs_enable {
            let deadline = self.tsm.tref();
            let pa = if self.is_originator && can_transmit {
                self.tsm.tx_fs_slot(&crate::tsm::NextAction::default_for(1))
            } else {
                self.tsm
                    .rx_fs_slot(&crate::tsm::NextAction::default_for(1), deadline)
            };
            ctx.last_fs = Some(pa.status);
            if pa.status == SlotStatus::FsEmpty || pa.status == SlotStatus::FsError {
                return self.finish_epoch(ctx, 0, EndReason::NegativeFlick);
            }
        }

        let mut n_noacks = 0u32;
        let mut n_empty_ts = 0u32;
        let mut n_ta: u16 = 0;

        while (n_ta as usize) < CRYSTAL_MAX_TAS {
            let i_tx = can_transmit && own_data.is_some();

            if i_tx {
                let payload = own_data.unwrap();
                let mut buf = [0u8; DataPacket::HEADER_LEN + CRYSTAL_MAX_PAYLOAD];
                DataPacket { src: self.own_id }.encode(&mut buf[..DataPacket::HEADER_LEN]);
                let plen = payload.len().min(CRYSTAL_MAX_PAYLOAD);
                buf[DataPacket::HEADER_LEN..DataPacket::HEADER_LEN + plen]
                    .copy_from_slice(&payload[..plen]);
                self.glossy.run_initiate(
                    &mut self.tsm,
                    self.own_id,
                    false,
                    &buf[..DataPacket::HEADER_LEN + plen],
                );
                self.push_log(SlotLogKind::Tx, 0);
            } else {
                let mut out = [0u8; CRYSTAL_MAX_PAYLOAD];
                let (outcome, _pa, plen) =
                    self.glossy.run_receive(&mut self.tsm, 1, false, &mut out);
                if outcome == GlossyTsmOutcome::Received {
                    if let Some(data) = DataPacket::decode(&out[..plen.min(CRYSTAL_MAX_PAYLOAD)]) {
                        ctx.received_bitmap = self.deployment.flag_node(ctx.received_bitmap, data.src);
                        self.push_log(SlotLogKind::Rx, 0);
                    }
                } else {
                    n_empty_ts += 1;
                    self.push_log(SlotLogKind::Timeout, 0);
                }
            }

            let mut ack_buf = [0u8; AckPacket::HEADER_LEN + CRYSTAL_MAX_PAYLOAD];
            let (ack_outcome, _pa, ack_len) =
                self.glossy
                    .run_receive(&mut self.tsm, 1, false, &mut ack_buf);

            let mut sleep = false;
            if ack_outcome == GlossyTsmOutcome::Received {
                if let Some(ack) = AckPacket::decode(&ack_buf[..ack_len.min(ack_buf.len())]) {
                    n_noacks = 0;
                    ctx.ack_bitmap |= ack.ack_bitmap;
                    ctx.last_ack_flags = ack.flags;
                    sleep = ack.is_sleep();
                    self.push_log(SlotLogKind::Rx, 0);
                } else {
                    n_noacks += 1;
                    self.push_log(SlotLogKind::Malformed, 0);
                }
            } else {
                n_noacks += 1;
                self.push_log(SlotLogKind::Timeout, 0);
            }

            n_ta += 1;

            if sleep {
                return self.finish_epoch(ctx, n_ta, EndReason::SleepOrder);
            }
            if n_ta as usize >= CRYSTAL_MAX_TAS {
                return self.finish_epoch(ctx, n_ta, EndReason::MaxTas);
            }
            let terminate = if i_tx {
                n_noacks >= self.config.max_missing_acks
            } else {
                n_noacks >= self.config.max_silent_tas && n_empty_ts >= self.config.max_silent_tas
            };
            if terminate {
                return self.finish_epoch(ctx, n_ta, EndReason::TerminationCap);
            }

            if self.config.fs_enable {
                let deadline = self.tsm.tref();
                let pa = if self.is_originator && can_transmit {
                    self.tsm.tx_fs_slot(&crate::tsm::NextAction::default_for(1))
                } else {
                    self.tsm
                        .rx_fs_slot(&crate::tsm::NextAction::default_for(1), deadline)
                };
                if pa.status == SlotStatus::FsEmpty || pa.status == SlotStatus::FsError {
                    return self.finish_epoch(ctx, n_ta, EndReason::NegativeFlick);
                }
            }
        }

        self.finish_epoch(ctx, n_ta, EndReason::MaxTas)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_packet_round_trips() {
        let pkt = SyncPacket { epoch: 42 };
        let mut buf = [0u8; SyncPacket::HEADER_LEN];
        pkt.encode(&mut buf);
        let decoded = SyncPacket::decode(&buf).unwrap();
        assert_eq!(decoded.epoch, 42);
    }

    #[test]
    fn data_packet_round_trips() {
        let pkt = DataPacket { src: 7 };
        let mut buf = [0u8; DataPacket::HEADER_LEN];
        pkt.encode(&mut buf);
        assert_eq!(DataPacket::decode(&buf).unwrap().src, 7);
    }

    #[test]
    fn ack_packet_sleep_detected() {
        let pkt = AckPacket {
            epoch: 1,
            flags: ACK_FLAG_ACK,
            ack_bitmap: u64::MAX,
        };
        let mut buf = [0u8; AckPacket::HEADER_LEN];
        pkt.encode(&mut buf);
        let decoded = AckPacket::decode(&buf).unwrap();
        assert!(decoded.is_sleep());
        assert!(decoded.is_ack());
    }

    #[test]
    fn wrong_type_byte_rejected() {
        let mut buf = [0u8; AckPacket::HEADER_LEN];
        buf[0] = 0x99;
        assert!(AckPacket::decode(&buf).is_none());
    }
}
