//! Weaver engine (Component G): many-to-one collection via a round-robin
//! packet pool and a global ACK bitmap, multi-hop, without a flooding
//! primitive underneath it -- every node speaks directly to its TDMA
//! neighbors through plain TSM TX/RX slots.
//!
//! Every slot, a node either transmits the packet at the head of its pool
//! (or a header-only beacon if it still has reason to speak) or listens.
//! Acknowledged originators are dropped from the pool; a global ACK cycle
//! periodically forces a beacon even with an empty pool so laggard nodes
//! still learn about newly-acknowledged originators.

use crate::radio::Dw1000Radio;
use crate::sd::SlotStatus;
use crate::tsm::{NextAction, Tsm};
use crate::util::{DeploymentTable, Lcg, PacketPool, SlotLogEntry, SlotLogKind, SlotLogRing};
use defmt::Format;

/// `MAX_JITTER_MULT`/`JITTER_STEP` from `weaver.c`'s `project-conf.h`: the TX
/// sub-slot jitters `tx_delay` uniformly over `[0, MAX_JITTER_MULT] ×
/// JITTER_STEP` device-time ticks to desynchronize simultaneous senders.
const WEAVER_MAX_JITTER_MULT: u32 = 125;
const WEAVER_JITTER_STEP: u32 = 2;

pub const EXTRA_PAYLOAD_LEN: usize = 8;
const HEADER_LEN: usize = 2 + 2 + 1 + 8 + 2 + 2;
pub const WEAVER_PACKET_LEN: usize = HEADER_LEN + EXTRA_PAYLOAD_LEN;

pub const SINK_BEACON_ID: u16 = 0xFFFF;
pub const UNBOOTSTRAPPED_HOP: u8 = 0xFF;
const INFINITE_HOP: u8 = u8::MAX;

pub const WEAVER_POOL_CAPACITY: usize = 65;

/// Packed, little-endian over-the-air packet, immediately after the TSM
/// header (§6).
#[derive(Clone, Copy, Debug, Format)]
pub struct WeaverPacket {
    pub originator_id: u16,
    pub last_heard_originator_id: u16,
    pub hop_counter: u8,
    pub sink_acked: u64,
    pub epoch: u16,
    pub seqno: u16,
    pub extra_payload: [u8; EXTRA_PAYLOAD_LEN],
}

impl WeaverPacket {
    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.originator_id.to_le_bytes());
        out[2..4].copy_from_slice(&self.last_heard_originator_id.to_le_bytes());
        out[4] = self.hop_counter;
        out[5..13].copy_from_slice(&self.sink_acked.to_le_bytes());
        out[13..15].copy_from_slice(&self.epoch.to_le_bytes());
        out[15..17].copy_from_slice(&self.seqno.to_le_bytes());
        out[HEADER_LEN..HEADER_LEN + EXTRA_PAYLOAD_LEN].copy_from_slice(&self.extra_payload);
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < WEAVER_PACKET_LEN {
            return None;
        }
        let mut extra = [0u8; EXTRA_PAYLOAD_LEN];
        extra.copy_from_slice(&buf[HEADER_LEN..HEADER_LEN + EXTRA_PAYLOAD_LEN]);
        Some(Self {
            originator_id: u16::from_le_bytes([buf[0], buf[1]]),
            last_heard_originator_id: u16::from_le_bytes([buf[2], buf[3]]),
            hop_counter: buf[4],
            sink_acked: u64::from_le_bytes(buf[5..13].try_into().unwrap()),
            epoch: u16::from_le_bytes([buf[13], buf[14]]),
            seqno: u16::from_le_bytes([buf[15], buf[16]]),
            extra_payload: extra,
        })
    }

    pub fn is_beacon(&self) -> bool {
        self.originator_id == SINK_BEACON_ID
    }

    pub fn is_from_bootstrapped_sender(&self) -> bool {
        self.hop_counter != UNBOOTSTRAPPED_HOP
    }
}

#[derive(Clone, Copy, Debug, Format)]
pub struct WeaverConfig {
    pub sink_id: u16,
    pub sink_radius: u8,
    pub boot_redundancy: u32,
    pub global_ack_period: u32,
    pub n_originators: usize,
    pub fs_enable: bool,
    pub max_fs_latency: u32,
    pub ntx: u8,
    pub nrx: u8,
    pub sleep_ntx: u8,
    pub termination_wait: u32,
    pub rx_pwr_threshold: u32,
    pub max_rx_consecutive_errors: u32,
    pub missed_bootstrap_before_scan: u32,
}

impl Default for WeaverConfig {
    fn default() -> Self {
        Self {
            sink_id: 1,
            sink_radius: 1,
            boot_redundancy: 2,
            global_ack_period: 8,
            n_originators: 1,
            fs_enable: false,
            max_fs_latency: 0,
            ntx: 1,
            nrx: 1,
            sleep_ntx: 2,
            termination_wait: 4,
            rx_pwr_threshold: crate::radio::HOPCOUNT_SET_RX_THRESH,
            max_rx_consecutive_errors: 20,
            missed_bootstrap_before_scan: 4,
        }
    }
}

/// Per-epoch state, zeroed at the top of every epoch by the engine.
pub struct EpochContext {
    pub epoch: u16,
    pub node_acked: u64,
    pub node_dist: u8,
    pub last_heard_originator_id: u16,
    pub global_ack_counter: u32,
    pub termination_counter: u32,
    pub pkt_pool: PacketPool<WEAVER_POOL_CAPACITY, WEAVER_PACKET_LEN>,
}

impl EpochContext {
    fn new(epoch: u16, node_dist: u8) -> Self {
        Self {
            epoch,
            node_acked: 0,
            node_dist,
            last_heard_originator_id: SINK_BEACON_ID,
            global_ack_counter: 0,
            termination_counter: 0,
            pkt_pool: PacketPool::new(),
        }
    }
}

/// `peer_rx_ok()`'s return, modeled per the original's
/// `struct peer_rx_ok_return`.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
pub struct RxUpdate {
    pub new_gack: bool,
    pub gacked_data: bool,
    pub sleep_rcvd: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
pub enum EndReason {
    MaxRxErrors,
    SleepOrder,
    MaxSlot,
    TerminationCap,
    NegativeFlick,
}

#[derive(Clone, Copy, Debug, Format)]
pub struct EpochResult {
    pub epoch: u16,
    pub n_slots_run: u32,
    pub end_reason: EndReason,
    pub node_acked: u64,
    pub node_dist: u8,
}

pub struct WeaverEngine<'a, R: Dw1000Radio> {
    tsm: Tsm<R>,
    config: WeaverConfig,
    deployment: DeploymentTable<'a>,
    own_id: u16,
    bootstrapped: bool,
    missed_bootstraps: u32,
    consecutive_rx_errors: u32,
    seqno: u16,
    rng: Lcg,
    log: SlotLogRing<64>,
}

fn weaver_local_ack_suppression_interval(hop: u8, gack: u32, gack_period: u32) -> i64 {
    let base = (hop as i64 + 1) * 2;
    base + (gack_period.saturating_sub(gack % gack_period.max(1)) as i64)
}

impl<'a, R: Dw1000Radio> WeaverEngine<'a, R> {
    pub fn new(tsm: Tsm<R>, config: WeaverConfig, deployment: DeploymentTable<'a>, own_id: u16) -> Self {
        Self {
            tsm,
            config,
            deployment,
            own_id,
            bootstrapped: own_id == config.sink_id,
            missed_bootstraps: 0,
            consecutive_rx_errors: 0,
            seqno: 0,
            rng: Lcg::new(own_id as u32 + 1),
            log: SlotLogRing::new(),
        }
    }

    /// Jittered `tx_delay` for the TX sub-slot (§4.7 point 2), uniform over
    /// `[0, WEAVER_MAX_JITTER_MULT] × WEAVER_JITTER_STEP`.
    fn jitter_tx_delay(&mut self) -> u16 {
        ((self.rng.next_u32() % (WEAVER_MAX_JITTER_MULT + 1)) * WEAVER_JITTER_STEP) as u16
    }

    pub fn tsm_mut(&mut self) -> &mut Tsm<R> {
        &mut self.tsm
    }

    pub fn is_sink(&self) -> bool {
        self.own_id == self.config.sink_id
    }

    pub fn log(&self) -> &SlotLogRing<64> {
        &self.log
    }

    fn push_log(&mut self, kind: SlotLogKind, hop_distance: u8, slot_diff: i32, ack_bitmap: u64, pool_bitmap: u64) {
        self.log.push(SlotLogEntry {
            kind,
            hop_distance,
            slot_diff,
            ack_bitmap,
            pool_bitmap,
        });
    }

    fn pool_bitmap(&self, ctx: &EpochContext) -> u64 {
        let mut bm = 0u64;
        for id in self.deployment.unmap(u64::MAX) {
            if ctx.pkt_pool.get(id).is_some() {
                bm = self.deployment.flag_node(bm, id);
            }
        }
        bm
    }

    /// Accept an incoming Weaver packet during an active phase, applying the
    /// hop-distance/pool/ack-bitmap update rules common to bootstrap and
    /// active reception (§4.7 point 1 and the `peer_rx_ok` grounding note).
    pub fn on_peer_rx(&mut self, ctx: &mut EpochContext, pkt: &WeaverPacket, rx_pwr_ok: bool) -> RxUpdate {
        let mut update = RxUpdate {
            new_gack: false,
            gacked_data: false,
            sleep_rcvd: false,
        };

        if pkt.is_from_bootstrapped_sender() && rx_pwr_ok {
            let candidate = pkt.hop_counter.saturating_add(1);
            if candidate < ctx.node_dist {
                ctx.node_dist = candidate;
            }
        }

        let prev_acked = ctx.node_acked;
        ctx.node_acked |= pkt.sink_acked;
        if ctx.node_acked != prev_acked {
            update.new_gack = true;
        }
        if crate::util::is_sleep_order(pkt.sink_acked) {
            update.sleep_rcvd = true;
        }

        ctx.pkt_pool.remove_acked(&self.deployment, ctx.node_acked);

        if !pkt.is_beacon() && !self.deployment.is_node_acked(ctx.node_acked, pkt.originator_id) {
            let mut buf = [0u8; WEAVER_PACKET_LEN];
            pkt.encode(&mut buf);
            if ctx.pkt_pool.insert(pkt.originator_id, &buf, self.tsm.logic_slot_idx()) {
                update.gacked_data = true;
            }
        }

        ctx.last_heard_originator_id = pkt.last_heard_originator_id;

        if pkt.last_heard_originator_id != SINK_BEACON_ID {
            let deadline = self.tsm.logic_slot_idx()
                + weaver_local_ack_suppression_interval(ctx.node_dist, ctx.global_ack_counter, self.config.global_ack_period);
            ctx.pkt_pool.set_deadline(pkt.last_heard_originator_id, deadline);
            ctx.pkt_pool.set_deadline(pkt.originator_id, deadline);
        }

        update
    }

    fn build_packet(&mut self, ctx: &EpochContext, originator_id: u16, extra: &[u8]) -> [u8; WEAVER_PACKET_LEN] {
        let mut extra_payload = [0u8; EXTRA_PAYLOAD_LEN];
        let n = extra.len().min(EXTRA_PAYLOAD_LEN);
        extra_payload[..n].copy_from_slice(&extra[..n]);
        let pkt = WeaverPacket {
            originator_id,
            last_heard_originator_id: ctx.last_heard_originator_id,
            hop_counter: ctx.node_dist,
            sink_acked: ctx.node_acked,
            epoch: ctx.epoch,
            seqno: self.seqno,
            extra_payload,
        };
        self.seqno = self.seqno.wrapping_add(1);
        let mut buf = [0u8; WEAVER_PACKET_LEN];
        pkt.encode(&mut buf);
        buf
    }

    /// Bootstrap phase (§4.7 point 1): listen until a valid packet is
    /// received, or fall back to a plain scan after too many misses.
    pub fn bootstrap(&mut self) -> bool {
        if self.bootstrapped {
            return true;
        }
        let na = NextAction::default_for(1);
        let pa = if self.missed_bootstraps >= self.config.missed_bootstrap_before_scan {
            self.tsm.scan(&na, self.tsm.tref())
        } else {
            self.tsm.rx_slot(&na)
        };

        if pa.status == SlotStatus::RxSuccess {
            if let Some(pkt) = WeaverPacket::decode(self.tsm.rx_payload()) {
                let rx_pwr_ok = pa.diagnostics.valid_rx_pwr();
                if rx_pwr_ok {
                    let mut ctx = EpochContext::new(pkt.epoch, INFINITE_HOP);
                    self.on_peer_rx(&mut ctx, &pkt, true);
                    self.missed_bootstraps = 0;
                    self.bootstrapped = true;
                    self.push_log(SlotLogKind::Bootstrap, ctx.node_dist, 0, ctx.node_acked, 0);
                    return true;
                }
            }
        }
        self.missed_bootstraps += 1;
        self.push_log(SlotLogKind::Bootstrap, INFINITE_HOP, 0, 0, 0);
        false
    }

    /// Run one active-phase epoch. `own_extra` is `Some(bytes)` when this
    /// node is an originator with fresh data to inject this epoch.
    pub fn run_epoch(&mut self, epoch: u16, max_slots: u32, own_extra: Option<&[u8]>) -> EpochResult {
        self.log.clear();
        let node_dist = if self.is_sink() { 0 } else { INFINITE_HOP };
        let mut ctx = EpochContext::new(epoch, node_dist);

        if !self.is_sink() {
            if let Some(extra) = own_extra {
                let buf = self.build_packet(&ctx, self.own_id, extra);
                ctx.pkt_pool.insert(self.own_id, &buf, self.tsm.logic_slot_idx());
            }
        }

        let mut slots_run = 0u32;
        let mut silent_tx = false;

        while slots_run < max_slots {
            // Offset the slot parity by hop distance so neighbors one hop
            // apart land on opposite TX/RX phases (§4.7 point 2).
            let tx_turn = (slots_run + ctx.node_dist as u32) % 2 == 0;
            if tx_turn && !silent_tx {
                let head = ctx.pkt_pool.head(self.tsm.logic_slot_idx());
                let due_gack = ctx.global_ack_counter % (3 * self.config.global_ack_period.max(1)) == 0;
                let must_speak = head.is_some() || due_gack || (!self.is_sink() && own_extra.is_some());

                if must_speak {
                    let originator_id = head.unwrap_or(SINK_BEACON_ID);
                    let payload = if let Some(entry) = ctx.pkt_pool.get(originator_id) {
                        let mut buf = [0u8; WEAVER_PACKET_LEN];
                        buf[..entry.payload_len].copy_from_slice(&entry.payload[..entry.payload_len]);
                        buf
                    } else {
                        self.build_packet(&ctx, SINK_BEACON_ID, &[])
                    };
                    let mut na = NextAction::default_for(1);
                    na.tx_delay = self.jitter_tx_delay();
                    match self.tsm.tx_slot(&na, &payload) {
                        Ok(_) => {
                            self.push_log(SlotLogKind::Tx, ctx.node_dist, 0, ctx.node_acked, self.pool_bitmap(&ctx));
                        }
                        Err(_) => {
                            self.push_log(SlotLogKind::RxError, ctx.node_dist, 0, ctx.node_acked, 0);
                        }
                    }
                    ctx.pkt_pool.advance();
                } else {
                    self.push_log(SlotLogKind::LocalSuppress, ctx.node_dist, 0, ctx.node_acked, 0);
                }
            } else {
                let na = NextAction::default_for(1);
                let pa = self.tsm.rx_slot(&na);
                if pa.status == SlotStatus::RxSuccess {
                    self.consecutive_rx_errors = 0;
                    if let Some(pkt) = WeaverPacket::decode(self.tsm.rx_payload()) {
                        let rx_pwr_ok = pa.diagnostics.valid_rx_pwr();
                        let update = self.on_peer_rx(&mut ctx, &pkt, rx_pwr_ok);
                        if update.sleep_rcvd {
                            return self.finish_epoch(ctx, slots_run + 1, EndReason::SleepOrder);
                        }
                        if update.new_gack {
                            ctx.termination_counter = self.termination_cap(&ctx);
                        }
                        silent_tx = pkt.hop_counter < ctx.node_dist;
                        self.push_log(SlotLogKind::Rx, ctx.node_dist, 0, ctx.node_acked, self.pool_bitmap(&ctx));
                    } else {
                        self.push_log(SlotLogKind::Malformed, ctx.node_dist, 0, ctx.node_acked, 0);
                    }
                } else {
                    self.consecutive_rx_errors += 1;
                    self.push_log(SlotLogKind::Timeout, ctx.node_dist, 0, ctx.node_acked, 0);
                }

                if self.consecutive_rx_errors >= self.config.max_rx_consecutive_errors {
                    return self.finish_epoch(ctx, slots_run + 1, EndReason::MaxRxErrors);
                }
            }

            ctx.global_ack_counter = (ctx.global_ack_counter + 1) % (3 * self.config.global_ack_period.max(1));
            slots_run += 1;

            if ctx.pkt_pool.is_empty() && ctx.termination_counter == 0 {
                ctx.termination_counter = self.termination_cap(&ctx) / 2;
            }
            if ctx.termination_counter > 0 {
                ctx.termination_counter -= 1;
            } else if slots_run > self.config.termination_wait {
                return self.finish_epoch(ctx, slots_run, EndReason::TerminationCap);
            }
        }

        self.finish_epoch(ctx, slots_run, EndReason::MaxSlot)
    }

    fn termination_cap(&self, ctx: &EpochContext) -> u32 {
        let gack = self.config.global_ack_period;
        let h = ctx.node_dist.min(32) as u32;
        2 * 3 * gack - ctx.global_ack_counter % gack.max(1) + 3 * h + 3 * self.config.boot_redundancy
            + self.config.termination_wait
    }

    fn finish_epoch(&mut self, ctx: EpochContext, n_slots_run: u32, reason: EndReason) -> EpochResult {
        let pool_bitmap = self.pool_bitmap(&ctx);
        crate::util::log_epoch(ctx.epoch, n_slots_run, ctx.node_acked, pool_bitmap, &self.log);
        defmt::warn!("Exit epoch due {}", reason);
        EpochResult {
            epoch: ctx.epoch,
            n_slots_run,
            end_reason: reason,
            node_acked: ctx.node_acked,
            node_dist: ctx.node_dist,
        }
    }

    /// Run as the sink: same grid, `node_dist` pinned at 0, every heard
    /// originator reported via the returned bitmap.
    pub fn run_sink_epoch(&mut self, epoch: u16, max_slots: u32) -> EpochResult {
        self.run_epoch(epoch, max_slots, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRadio;
    use crate::sd::SlotDriver;
    use crate::tsm::TsmConfig;

    const TABLE: [u16; 3] = [1, 2, 3];

    fn make_engine(own_id: u16) -> WeaverEngine<'static, MockRadio> {
        let tsm = Tsm::new(SlotDriver::new(MockRadio::new()), TsmConfig::default());
        WeaverEngine::new(tsm, WeaverConfig::default(), DeploymentTable::new(&TABLE), own_id)
    }

    #[test]
    fn packet_round_trips() {
        let pkt = WeaverPacket {
            originator_id: 2,
            last_heard_originator_id: 3,
            hop_counter: 1,
            sink_acked: 0b10,
            epoch: 5,
            seqno: 9,
            extra_payload: [1, 2, 3, 4, 5, 6, 7, 8],
        };
        let mut buf = [0u8; WEAVER_PACKET_LEN];
        pkt.encode(&mut buf);
        let decoded = WeaverPacket::decode(&buf).unwrap();
        assert_eq!(decoded.originator_id, 2);
        assert_eq!(decoded.seqno, 9);
        assert_eq!(decoded.extra_payload, pkt.extra_payload);
    }

    #[test]
    fn sink_beacon_is_recognized() {
        let pkt = WeaverPacket {
            originator_id: SINK_BEACON_ID,
            last_heard_originator_id: SINK_BEACON_ID,
            hop_counter: 0,
            sink_acked: 0,
            epoch: 0,
            seqno: 0,
            extra_payload: [0; EXTRA_PAYLOAD_LEN],
        };
        assert!(pkt.is_beacon());
    }

    #[test]
    fn on_peer_rx_updates_hop_distance_and_acks() {
        let mut engine = make_engine(2);
        let mut ctx = EpochContext::new(0, INFINITE_HOP);
        let pkt = WeaverPacket {
            originator_id: 3,
            last_heard_originator_id: SINK_BEACON_ID,
            hop_counter: 0,
            sink_acked: 0,
            epoch: 0,
            seqno: 0,
            extra_payload: [0; EXTRA_PAYLOAD_LEN],
        };
        let update = engine.on_peer_rx(&mut ctx, &pkt, true);
        assert_eq!(ctx.node_dist, 1);
        assert!(update.gacked_data);
        assert!(ctx.pkt_pool.get(3).is_some());
    }

    #[test]
    fn sleep_order_is_detected_on_rx() {
        let mut engine = make_engine(2);
        let mut ctx = EpochContext::new(0, 1);
        let pkt = WeaverPacket {
            originator_id: SINK_BEACON_ID,
            last_heard_originator_id: SINK_BEACON_ID,
            hop_counter: 0,
            sink_acked: u64::MAX,
            epoch: 0,
            seqno: 0,
            extra_payload: [0; EXTRA_PAYLOAD_LEN],
        };
        let update = engine.on_peer_rx(&mut ctx, &pkt, true);
        assert!(update.sleep_rcvd);
        assert_eq!(ctx.node_acked, u64::MAX);
    }
}
