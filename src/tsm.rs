//! Time-Slot Manager (Component D).
//!
//! Runs the cooperative, single-threaded slot/minislot schedule on top of
//! the slot driver. Engines drive it by calling one of the blocking
//! `*_slot` methods and inspecting the returned [`PrevAction`] to build
//! their next [`NextAction`] — the call itself is the protothread's yield
//! point (see the crate-level translation note on protothreads).

use crate::error::{Error, Result};
use crate::radio::{Dw1000Radio, RxDiagnostics};
use crate::sd::{SlotDriver, SlotRecord, SlotStatus};
use crate::time::DeviceTime32;
use defmt::Format;

/// Constant trailer tag every TSM packet must carry (arbitrary, chosen to
/// be unlikely to arise from noise on a malformed frame).
pub const TSM_CRC_TAG: u8 = 0xAE;
pub const TSM_HEADER_LEN: usize = 7;

/// Default RX guard time, in device-time ticks, ahead of an expected SFD.
pub const TSM_DEFAULT_RXGUARD: u32 = DeviceTime32::us_to_ticks(2);

#[derive(Clone, Copy, Debug, Format)]
pub struct TsmHeader {
    pub tx_delay: u16,
    pub minislot_idx: u32,
    pub crc_tag: u8,
}

impl TsmHeader {
    pub fn encode(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.tx_delay.to_le_bytes());
        out[2..6].copy_from_slice(&self.minislot_idx.to_le_bytes());
        out[6] = self.crc_tag;
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < TSM_HEADER_LEN {
            return None;
        }
        Some(Self {
            tx_delay: u16::from_le_bytes([buf[0], buf[1]]),
            minislot_idx: u32::from_le_bytes([buf[2], buf[3], buf[4], buf[5]]),
            crc_tag: buf[6],
        })
    }

    pub fn is_valid(&self) -> bool {
        self.crc_tag == TSM_CRC_TAG
    }
}

/// What the engine asked TSM to do in the slot that just completed.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Format)]
pub enum TsmAction {
    None,
    Tx,
    Rx,
    Scan,
    Restart,
    Stop,
    EventFs,
    EventFsRx,
}

/// Report handed to the engine after a slot completes.
#[derive(Clone, Copy, Debug, Format)]
pub struct PrevAction {
    pub action: TsmAction,
    pub status: SlotStatus,
    pub radio_status: u32,
    pub payload_len: usize,
    pub minislot_idx: u32,
    pub logic_slot_idx: i64,
    pub remote_minislot_idx: Option<u32>,
    pub remote_logic_slot_idx: Option<i64>,
    pub diagnostics: RxDiagnostics,
}

impl PrevAction {
    fn initial() -> Self {
        Self {
            action: TsmAction::None,
            status: SlotStatus::None,
            radio_status: 0,
            payload_len: 0,
            minislot_idx: 0,
            logic_slot_idx: -1,
            remote_minislot_idx: None,
            remote_logic_slot_idx: None,
            diagnostics: RxDiagnostics::default(),
        }
    }
}

/// What the engine wants TSM to do next.
#[derive(Clone, Copy, Debug, Format)]
pub struct NextAction {
    pub action: TsmAction,
    pub progress_logic_slots: u32,
    pub progress_minislots: u32,
    pub accept_sync: bool,
    pub tx_delay: u16,
    pub rx_guard_time: u32,
    pub restart_interval: u32,
    pub minislots_to_use: u32,
    pub payload_len: usize,
}

impl NextAction {
    pub fn default_for(grouping: u32) -> Self {
        Self {
            action: TsmAction::None,
            progress_logic_slots: 1,
            progress_minislots: grouping,
            accept_sync: false,
            tx_delay: 0,
            rx_guard_time: TSM_DEFAULT_RXGUARD,
            restart_interval: 0,
            minislots_to_use: 1,
            payload_len: 0,
        }
    }
}

#[derive(Clone, Copy, Debug, Format)]
pub struct TsmConfig {
    pub slot_duration_ticks: u32,
    pub rx_timeout_ticks: u32,
    pub default_rx_guard_ticks: u32,
    pub default_minislots_grouping: u32,
}

impl Default for TsmConfig {
    fn default() -> Self {
        Self {
            slot_duration_ticks: DeviceTime32::us_to_ticks(2000),
            rx_timeout_ticks: DeviceTime32::us_to_ticks(2500),
            default_rx_guard_ticks: TSM_DEFAULT_RXGUARD,
            default_minislots_grouping: 1,
        }
    }
}

/// One byte, 256 is the largest payload this crate's radios carry.
const MAX_PAYLOAD: usize = 256;

/// The sender's slot reference, reconstructed from a successful RX's TSM
/// header (§4.4 point 3). Cached until the engine's next `NextAction`
/// decides whether to adopt it via `accept_sync`.
#[derive(Clone, Copy, Debug, Format)]
struct RemoteSync {
    tref: DeviceTime32,
    minislot_idx: u32,
    logic_slot_idx: i64,
}

pub struct Tsm<R: Dw1000Radio> {
    sd: SlotDriver<R>,
    config: TsmConfig,
    tref: DeviceTime32,
    logic_slot_idx: i64,
    minislot_idx: u32,
    tx_buf: [u8; MAX_PAYLOAD],
    rx_buf: [u8; MAX_PAYLOAD],
    pending_remote: Option<RemoteSync>,
}

impl<R: Dw1000Radio> Tsm<R> {
    pub fn new(sd: SlotDriver<R>, config: TsmConfig) -> Self {
        Self {
            sd,
            config,
            tref: DeviceTime32::new(0),
            logic_slot_idx: -1,
            minislot_idx: 0,
            tx_buf: [0; MAX_PAYLOAD],
            rx_buf: [0; MAX_PAYLOAD],
            pending_remote: None,
        }
    }

    pub fn sd(&self) -> &SlotDriver<R> {
        &self.sd
    }

    pub fn sd_mut(&mut self) -> &mut SlotDriver<R> {
        &mut self.sd
    }

    pub fn tref(&self) -> DeviceTime32 {
        self.tref
    }

    /// Start a fresh epoch, `init_delay` device-time ticks from now. Returns
    /// the initial `PrevAction` (`logic_slot_idx == -1`, `status == None`)
    /// the engine should build its first `NextAction` from.
    pub fn start(&mut self, init_delay: u32) -> PrevAction {
        self.tref = self.sd.radio().now().wrapping_add(init_delay);
        self.logic_slot_idx = -1;
        self.minislot_idx = 0;
        PrevAction::initial()
    }

    fn slot_sfd_time(&self, minislot_idx: u32) -> DeviceTime32 {
        self.tref
            .wrapping_add(minislot_idx.wrapping_mul(self.config.slot_duration_ticks))
    }

    /// Sync acceptance happens before index progression for the next slot
    /// (§5 ordering guarantee): if the engine's `NextAction` asks for it and
    /// the previous slot produced a valid remote reference, adopt it as our
    /// own `tref`/indices before applying this slot's progression.
    fn apply_sync_if_requested(&mut self, na: &NextAction) {
        if na.accept_sync {
            if let Some(remote) = self.pending_remote.take() {
                self.tref = remote.tref;
                self.minislot_idx = remote.minislot_idx;
                self.logic_slot_idx = remote.logic_slot_idx;
            }
        }
    }

    fn advance(&mut self, na: &NextAction) {
        self.logic_slot_idx += na.progress_logic_slots as i64;
        self.minislot_idx = self.minislot_idx.wrapping_add(na.progress_minislots);
    }

    /// Decode the TSM header out of a just-completed RX's payload. Returns
    /// `Err(())` when the bytes are present but the CRC tag doesn't match
    /// (`RxMalformed`); `Ok(None)` when there weren't enough bytes to even
    /// attempt a decode.
    fn parse_remote(&mut self, rec: &SlotRecord, payload: &[u8]) -> Result<(u32, i64, usize)> {
        match TsmHeader::decode(payload) {
            Some(hdr) if hdr.is_valid() => {
                let remote_slot_tref = rec.sfd_time.wrapping_sub(hdr.tx_delay as u32);
                let remote_tref = remote_slot_tref
                    .wrapping_sub(hdr.minislot_idx.wrapping_mul(self.config.slot_duration_ticks));
                let grouping = self.config.default_minislots_grouping.max(1);
                let remote_logic = (hdr.minislot_idx / grouping) as i64;
                self.pending_remote = Some(RemoteSync {
                    tref: remote_tref,
                    minislot_idx: hdr.minislot_idx,
                    logic_slot_idx: remote_logic,
                });
                Ok((hdr.minislot_idx, remote_logic, payload.len() - TSM_HEADER_LEN))
            }
            _ => {
                self.pending_remote = None;
                Err(Error::MalformedHeader)
            }
        }
    }

    /// Run one TX slot: write the TSM header + `payload`, transmit at the
    /// slot SFD time (offset by `na.tx_delay`), and return the result.
    pub fn tx_slot(&mut self, na: &NextAction, payload: &[u8]) -> Result<PrevAction> {
        self.apply_sync_if_requested(na);
        self.advance(na);
        let sfd_time = self
            .slot_sfd_time(self.minislot_idx)
            .wrapping_add(na.tx_delay as u32);

        let hdr = TsmHeader {
            tx_delay: na.tx_delay,
            minislot_idx: self.minislot_idx,
            crc_tag: TSM_CRC_TAG,
        };
        if TSM_HEADER_LEN + payload.len() > self.tx_buf.len() {
            return Err(Error::BufferTooLarge);
        }
        hdr.encode(&mut self.tx_buf[..TSM_HEADER_LEN]);
        self.tx_buf[TSM_HEADER_LEN..TSM_HEADER_LEN + payload.len()].copy_from_slice(payload);

        let total_len = TSM_HEADER_LEN + payload.len();
        self.sd.tx_at(&self.tx_buf[..total_len], sfd_time)?;

        Ok(PrevAction {
            action: TsmAction::Tx,
            status: SlotStatus::TxDone,
            radio_status: 0,
            payload_len: payload.len(),
            minislot_idx: self.minislot_idx,
            logic_slot_idx: self.logic_slot_idx,
            remote_minislot_idx: None,
            remote_logic_slot_idx: None,
            diagnostics: RxDiagnostics::default(),
        })
    }

    /// Run one RX slot expecting the peer's SFD at the current slot
    /// boundary, with `na.rx_guard_time` of early guard and an absolute
    /// timeout of one slot duration past the expected SFD. On a schedule
    /// failure the slot is skipped (§7 `ScheduleLate` policy): the engine
    /// still gets a `PrevAction`, just with `status == RxError`.
    pub fn rx_slot(&mut self, na: &NextAction) -> PrevAction {
        self.apply_sync_if_requested(na);
        self.advance(na);
        let expected_sfd = self.slot_sfd_time(self.minislot_idx);
        let guard = na.rx_guard_time;
        let rx_on = expected_sfd.wrapping_sub(guard);
        let deadline = expected_sfd.wrapping_add(self.config.rx_timeout_ticks);
        let preamble_to_pacs = if guard == self.config.default_rx_guard_ticks {
            8
        } else {
            0
        };

        match self.sd.rx_slot(rx_on, deadline, preamble_to_pacs) {
            Ok(rec) => self.finish_rx(TsmAction::Rx, rec),
            Err(_) => self.empty_prev_action(TsmAction::Rx, SlotStatus::RxError),
        }
    }

    /// Start RX immediately with an absolute timeout; used for the initial
    /// network scan (no expected-SFD reference exists yet).
    pub fn scan(&mut self, na: &NextAction, deadline: DeviceTime32) -> PrevAction {
        self.apply_sync_if_requested(na);
        self.advance(na);
        match self.sd.rx_until(deadline) {
            Ok(rec) => self.finish_rx(TsmAction::Scan, rec),
            Err(_) => self.empty_prev_action(TsmAction::Scan, SlotStatus::RxError),
        }
    }

    /// FS/Flick TX: transmit a bare preamble pulse at this slot's SFD.
    pub fn tx_fs_slot(&mut self, na: &NextAction) -> PrevAction {
        self.apply_sync_if_requested(na);
        self.advance(na);
        let sfd_time = self.slot_sfd_time(self.minislot_idx);
        match self.sd.tx_at_fp(sfd_time) {
            Ok(rec) => self.empty_prev_action(TsmAction::EventFs, rec.status),
            Err(_) => self.empty_prev_action(TsmAction::EventFs, SlotStatus::FsError),
        }
    }

    /// FS/Flick RX-and-propagate: listen for a bare preamble pulse and, in
    /// the ISR, immediately re-emit it. The engine only sees the aggregated
    /// outcome (§4.2 edge-case policy).
    pub fn rx_fs_slot(&mut self, na: &NextAction, deadline: DeviceTime32) -> PrevAction {
        self.apply_sync_if_requested(na);
        self.advance(na);
        let expected_sfd = self.slot_sfd_time(self.minislot_idx);
        match self.sd.rx_slot_fp(expected_sfd, deadline) {
            Ok(rec) => self.empty_prev_action(TsmAction::EventFsRx, rec.status),
            Err(_) => self.empty_prev_action(TsmAction::EventFsRx, SlotStatus::FsError),
        }
    }

    /// Arm a pure timer completion (no radio activity) at `deadline`.
    pub fn timer_slot(&mut self, na: &NextAction, deadline: DeviceTime32) -> PrevAction {
        self.apply_sync_if_requested(na);
        self.advance(na);
        match self.sd.set_timer(deadline) {
            Ok(rec) => self.empty_prev_action(TsmAction::None, rec.status),
            Err(_) => self.empty_prev_action(TsmAction::None, SlotStatus::TimerEvent),
        }
    }

    fn finish_rx(&mut self, action: TsmAction, rec: SlotRecord) -> PrevAction {
        // Read through a scratch buffer to avoid borrowing `self.rx_buf`
        // and `self.sd` mutably at the same time.
        let mut scratch = [0u8; MAX_PAYLOAD];
        let read_len = if rec.status.is_rx_status() {
            let n = rec.rx_len.min(scratch.len());
            self.sd.read_rx_buffer(&mut scratch[..n]).unwrap_or(0)
        } else {
            0
        };
        self.rx_buf[..read_len].copy_from_slice(&scratch[..read_len]);

        let (remote_minislot, remote_logic, malformed, payload_len) = if rec.status == SlotStatus::RxSuccess {
            match self.parse_remote(&rec, &self.rx_buf[..read_len]) {
                Ok((ms, ls, plen)) => (Some(ms), Some(ls), false, plen),
                Err(_) => (None, None, true, 0),
            }
        } else {
            (None, None, false, 0)
        };
        let effective_status = if malformed { SlotStatus::RxMalformed } else { rec.status };
        PrevAction {
            action,
            status: effective_status,
            radio_status: rec.radio_status_bits,
            payload_len,
            minislot_idx: self.minislot_idx,
            logic_slot_idx: self.logic_slot_idx,
            remote_minislot_idx: remote_minislot,
            remote_logic_slot_idx: remote_logic,
            diagnostics: rec.diagnostics,
        }
    }

    fn empty_prev_action(&self, action: TsmAction, status: SlotStatus) -> PrevAction {
        PrevAction {
            action,
            status,
            radio_status: 0,
            payload_len: 0,
            minislot_idx: self.minislot_idx,
            logic_slot_idx: self.logic_slot_idx,
            remote_minislot_idx: None,
            remote_logic_slot_idx: None,
            diagnostics: RxDiagnostics::default(),
        }
    }

    /// Restart the epoch: advance `tref` by `restart_interval`, reset
    /// indices, and hand back the initial `PrevAction` for slot -1. TSM
    /// guarantees the engine is re-entered once more for the new epoch's
    /// slot 0 without returning to the dispatcher in between (§5
    /// cancellation note) -- in this synchronous-call model that just means
    /// the caller's loop sees `logic_slot_idx == -1` again and builds a
    /// fresh `NextAction` from it, same as the very first call.
    pub fn restart(&mut self, restart_interval: u32) -> PrevAction {
        self.tref = self.tref.wrapping_add(restart_interval);
        self.logic_slot_idx = -1;
        self.minislot_idx = 0;
        self.pending_remote = None;
        PrevAction::initial()
    }

    pub fn rx_payload(&self) -> &[u8] {
        &self.rx_buf[TSM_HEADER_LEN..]
    }

    pub fn logic_slot_idx(&self) -> i64 {
        self.logic_slot_idx
    }

    pub fn minislot_idx(&self) -> u32 {
        self.minislot_idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockRadio;

    fn make_tsm() -> Tsm<MockRadio> {
        Tsm::new(SlotDriver::new(MockRadio::new()), TsmConfig::default())
    }

    #[test]
    fn header_round_trips() {
        let hdr = TsmHeader {
            tx_delay: 42,
            minislot_idx: 7,
            crc_tag: TSM_CRC_TAG,
        };
        let mut buf = [0u8; TSM_HEADER_LEN];
        hdr.encode(&mut buf);
        let decoded = TsmHeader::decode(&buf).unwrap();
        assert_eq!(decoded.tx_delay, 42);
        assert_eq!(decoded.minislot_idx, 7);
        assert!(decoded.is_valid());
    }

    #[test]
    fn malformed_tag_is_rejected() {
        let hdr = TsmHeader {
            tx_delay: 0,
            minislot_idx: 0,
            crc_tag: 0x00,
        };
        let mut buf = [0u8; TSM_HEADER_LEN];
        hdr.encode(&mut buf);
        let decoded = TsmHeader::decode(&buf).unwrap();
        assert!(!decoded.is_valid());
    }

    #[test]
    fn start_sets_initial_prev_action() {
        let mut tsm = make_tsm();
        let pa = tsm.start(0);
        assert_eq!(pa.logic_slot_idx, -1);
        assert_eq!(pa.status, SlotStatus::None);
    }

    #[test]
    fn tx_slot_advances_indices() {
        let mut tsm = make_tsm();
        tsm.start(0);
        let na = NextAction::default_for(1);
        let pa = tsm.tx_slot(&na, &[1, 2, 3]).unwrap();
        assert_eq!(pa.logic_slot_idx, 0);
        assert_eq!(pa.action, TsmAction::Tx);
    }

    #[test]
    fn rx_slot_decodes_header_and_reports_remote_indices() {
        let mut tsm = make_tsm();
        tsm.start(0);
        let na = NextAction::default_for(1);

        let expected_sfd = tsm.slot_sfd_time(1);
        let mut payload = [0u8; TSM_HEADER_LEN + 3];
        TsmHeader {
            tx_delay: 0,
            minislot_idx: 5,
            crc_tag: TSM_CRC_TAG,
        }
        .encode(&mut payload[..TSM_HEADER_LEN]);
        payload[TSM_HEADER_LEN..].copy_from_slice(&[9, 9, 9]);

        tsm.sd_mut().radio_mut().queue_rx_ok(expected_sfd, &payload);
        let pa = tsm.rx_slot(&na);

        assert_eq!(pa.status, SlotStatus::RxSuccess);
        assert_eq!(pa.payload_len, 3);
        assert_eq!(pa.remote_minislot_idx, Some(5));
        assert_eq!(tsm.rx_payload()[..3], [9, 9, 9]);
    }

    #[test]
    fn rx_slot_flags_malformed_tag() {
        let mut tsm = make_tsm();
        tsm.start(0);
        let na = NextAction::default_for(1);

        let expected_sfd = tsm.slot_sfd_time(1);
        let mut payload = [0u8; TSM_HEADER_LEN];
        TsmHeader {
            tx_delay: 0,
            minislot_idx: 0,
            crc_tag: 0x00,
        }
        .encode(&mut payload);

        tsm.sd_mut().radio_mut().queue_rx_ok(expected_sfd, &payload);
        let pa = tsm.rx_slot(&na);
        assert_eq!(pa.status, SlotStatus::RxMalformed);
    }

    #[test]
    fn accept_sync_adopts_remote_reference_before_next_progression() {
        let mut tsm = make_tsm();
        tsm.start(0);
        let na = NextAction::default_for(1);

        let expected_sfd = tsm.slot_sfd_time(1);
        let mut payload = [0u8; TSM_HEADER_LEN];
        TsmHeader {
            tx_delay: 0,
            minislot_idx: 20,
            crc_tag: TSM_CRC_TAG,
        }
        .encode(&mut payload);
        tsm.sd_mut().radio_mut().queue_rx_ok(expected_sfd, &payload);
        tsm.rx_slot(&na);

        let mut sync_na = NextAction::default_for(1);
        sync_na.accept_sync = true;
        tsm.sd_mut().radio_mut().queue_event(crate::radio::RadioEvent {
            outcome: crate::radio::RadioOutcome::TxDone,
            sfd_time: DeviceTime32::new(0),
            status_bits: 0,
            rx_len: 0,
            diagnostics: crate::radio::RxDiagnostics::default(),
        });
        let pa = tsm.tx_slot(&sync_na, &[1]).unwrap();
        // minislot 20 (adopted) + progression of 1 == 21.
        assert_eq!(pa.minislot_idx, 21);
    }
}
