//! MAC layer: the per-timeslot orchestrator.
//!
//! One radio event drives exactly one pass through the machine. Outcome
//! signals (frame received, missed, acknowledged, not sent) run the
//! post-processing chain for the main frame and, when the slot carries an
//! auto-reply, a second chain for it. The schedule signal advances the
//! superframe cursor and the hop sequence, budgets the sleep through the
//! sync module and stages the next slot's frames.
//!
//! The state sequences are keyed on the input signal; each `match` arm
//! lists its states in execution order.

use heapless::spsc::Queue;

use crate::connection::Connection;
use crate::error::Event;
use crate::header::{HeaderField, PhaseData, PhaseSink, TimeslotIdSaw};
use crate::link::channel::ChannelHopping;
use crate::link::rdo::Rdo;
use crate::link::scheduler::{Scheduler, Timeslot};
use crate::link::tdma_sync::TdmaSync;
use crate::xlayer::Xlayer;
use crate::{ConnectionId, FrameOutcome, Role};

/// Queue depth between the MAC and the callback context.
pub const CALLBACK_QUEUE_SIZE: usize = 33;

pub type CallbackQueue = Queue<CallbackRequest, CALLBACK_QUEUE_SIZE>;

/// What the radio reported for one slot, per frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputSignal {
    RxFrame,
    RxFrameMiss,
    TxSentAck,
    TxSentNack,
    TxNotSent,
    /// TX finished on a connection that does not expect acknowledgements.
    Tx,
    PrepareFrame,
    SetupLink,
    Schedule,
    Empty,
}

/// What the MAC decided for one slot, per frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSignal {
    Empty,
    FrameRxSuccess,
    FrameRxFail,
    FrameRxOverrun,
    TxSuccess,
    TxFail,
    TxDrop,
    PrepareDone,
    /// Slave is hunting for the coordinator; the slot is armed wide open.
    Syncing,
}

/// Main and auto-reply halves of one slot.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalPair<T> {
    pub main: T,
    pub auto_reply: T,
}

impl SignalPair<OutputSignal> {
    pub fn empty() -> Self {
        SignalPair {
            main: OutputSignal::Empty,
            auto_reply: OutputSignal::Empty,
        }
    }
}

/// Deferred user notification, drained from the callback context.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackRequest {
    pub conn: ConnectionId,
    pub kind: CallbackKind,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    TxSuccess,
    TxFail,
    TxDropped,
    RxSuccess,
    Event(Event),
}

/// Where the frame currently worked on lives. The MAC never stores
/// references into the connection table; it re-resolves this token any
/// time it touches the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum XlayerRef {
    None,
    /// Oldest published frame of the connection queue (TX side).
    Front(ConnectionId),
    /// Unpublished tail slot of the connection queue (RX side).
    FreeSlot(ConnectionId),
    /// Per-connection reserved sentinel frame.
    Beacon(ConnectionId),
    /// Per-connection overrun scratch.
    Overrun(ConnectionId),
}

impl XlayerRef {
    pub(crate) fn conn(self) -> Option<ConnectionId> {
        match self {
            XlayerRef::None => None,
            XlayerRef::Front(id)
            | XlayerRef::FreeSlot(id)
            | XlayerRef::Beacon(id)
            | XlayerRef::Overrun(id) => Some(id),
        }
    }
}

pub(crate) fn xlayer_ref<'s, 'a>(
    conns: &'s [&'a mut Connection<'a>],
    r: XlayerRef,
) -> Option<&'s Xlayer<'a>> {
    match r {
        XlayerRef::None => None,
        XlayerRef::Front(id) => conns[id.index()].queue.front_ref(),
        XlayerRef::FreeSlot(id) => conns[id.index()].queue.free_slot_ref(),
        XlayerRef::Beacon(id) => Some(&conns[id.index()].beacon),
        XlayerRef::Overrun(id) => Some(&conns[id.index()].overrun),
    }
}

pub(crate) fn xlayer_mut<'s, 'a>(
    conns: &'s mut [&'a mut Connection<'a>],
    r: XlayerRef,
) -> Option<&'s mut Xlayer<'a>> {
    match r {
        XlayerRef::None => None,
        XlayerRef::Front(id) => conns[id.index()].queue.front(),
        XlayerRef::FreeSlot(id) => conns[id.index()].queue.get_free_slot(),
        XlayerRef::Beacon(id) => Some(&mut conns[id.index()].beacon),
        XlayerRef::Overrun(id) => Some(&mut conns[id.index()].overrun),
    }
}

pub struct WpsMac<'a> {
    pub(crate) scheduler: Scheduler<'a>,
    pub(crate) channel_hopping: ChannelHopping<'a>,
    pub(crate) tdma_sync: TdmaSync,
    pub(crate) rdo: Rdo,
    pub(crate) local_address: u16,
    pub(crate) syncing_address: u16,
    pub(crate) role: Role,
    pub(crate) fast_sync_enabled: bool,

    current_timeslot: Timeslot,
    current_ts_prime: bool,
    current_ts_prime_tx: bool,
    pub(crate) current_channel_index: u8,

    current_input: InputSignal,
    current_output: OutputSignal,
    pub(crate) output: SignalPair<OutputSignal>,
    pub(crate) main_xlayer: XlayerRef,
    pub(crate) auto_xlayer: XlayerRef,
    current_xlayer: XlayerRef,

    pub(crate) phase_data: PhaseData,
    pub(crate) phase_sink: Option<&'a dyn PhaseSink>,
}

impl<'a> WpsMac<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scheduler: Scheduler<'a>,
        channel_hopping: ChannelHopping<'a>,
        tdma_sync: TdmaSync,
        rdo: Rdo,
        local_address: u16,
        syncing_address: u16,
        role: Role,
        fast_sync_enabled: bool,
    ) -> Self {
        WpsMac {
            scheduler,
            channel_hopping,
            tdma_sync,
            rdo,
            local_address,
            syncing_address,
            role,
            fast_sync_enabled,
            current_timeslot: Timeslot::default(),
            current_ts_prime: false,
            current_ts_prime_tx: false,
            current_channel_index: 0,
            current_input: InputSignal::Empty,
            current_output: OutputSignal::Empty,
            output: SignalPair::empty(),
            main_xlayer: XlayerRef::None,
            auto_xlayer: XlayerRef::None,
            current_xlayer: XlayerRef::None,
            phase_data: PhaseData::default(),
            phase_sink: None,
        }
    }

    /// Drop back to the unsynchronized state, as after `connect()`.
    pub fn reset(&mut self) {
        self.tdma_sync.reset();
        self.current_input = InputSignal::Empty;
        self.current_output = OutputSignal::Empty;
        self.output = SignalPair::empty();
        self.main_xlayer = XlayerRef::None;
        self.auto_xlayer = XlayerRef::None;
        self.current_xlayer = XlayerRef::None;
    }

    pub fn current_timeslot(&self) -> Timeslot {
        self.current_timeslot
    }

    pub(crate) fn is_prime_rx(&self) -> bool {
        self.current_ts_prime && !self.current_ts_prime_tx
    }

    /// Advance to the next occupied slot and stage its frames. Outputs are
    /// left in `self.output` (`PrepareDone`, or `Syncing` while hunting).
    pub fn process_schedule(
        &mut self,
        conns: &mut [&'a mut Connection<'a>],
        now_quarter_ms: u64,
        callbacks: &mut CallbackQueue,
    ) {
        self.state_scheduler(conns);
        self.state_setup_primary_link(conns, now_quarter_ms, callbacks);
        self.state_setup_prime_link(conns, now_quarter_ms, callbacks);
        self.state_mac_prepare_frame(conns);
    }

    /// Post-process the outcome of the slot that just completed.
    pub fn process_outcome(
        &mut self,
        conns: &mut [&'a mut Connection<'a>],
        input: SignalPair<InputSignal>,
    ) -> SignalPair<OutputSignal> {
        self.current_input = input.main;
        self.current_output = OutputSignal::Empty;
        self.current_xlayer = self.main_xlayer;
        self.run_chain(conns);

        self.output.main = self.current_output;
        self.current_output = OutputSignal::Empty;

        if self.auto_xlayer != XlayerRef::None {
            self.current_input = input.auto_reply;
            self.current_xlayer = self.auto_xlayer;
            self.run_chain(conns);
        }
        self.output.auto_reply = self.current_output;

        self.update_stats(conns);
        self.output
    }

    fn run_chain(&mut self, conns: &mut [&'a mut Connection<'a>]) {
        match self.current_input {
            InputSignal::RxFrame => {
                self.state_link_quality(conns);
                self.state_post_rx(conns);
                self.state_sync(conns);
            }
            InputSignal::RxFrameMiss => {
                self.state_link_quality(conns);
                self.state_sync(conns);
                self.state_post_rx(conns);
            }
            InputSignal::TxSentAck
            | InputSignal::TxSentNack
            | InputSignal::TxNotSent
            | InputSignal::Tx => {
                self.state_stop_wait_arq();
                self.state_post_tx(conns);
            }
            InputSignal::PrepareFrame
            | InputSignal::SetupLink
            | InputSignal::Schedule
            | InputSignal::Empty => {}
        }
    }

    // ---- schedule path ---------------------------------------------------

    fn state_scheduler(&mut self, conns: &mut [&'a mut Connection<'a>]) {
        self.scheduler.reset_sleep_cycles();
        let mut inc_count = {
            let conns_ro: &[&'a mut Connection<'a>] = conns;
            self.scheduler
                .increment_timeslot(|id| conns_ro[id.index()].source_address)
        };
        self.handle_link_throttle(conns, &mut inc_count);
        self.channel_hopping.increment_sequence(inc_count);
        self.current_channel_index = self.channel_hopping.channel();
        self.current_timeslot = self.scheduler.current_timeslot();
        self.setup_prime_timeslot_status(conns);
    }

    /// Keep skipping forward while the candidate slot's connection sits on
    /// an inactive position of its duty-cycle pattern.
    fn handle_link_throttle(&mut self, conns: &mut [&'a mut Connection<'a>], inc_count: &mut u8) {
        let mut guard: u16 = 0;
        let guard_limit = (self.scheduler.total_timeslot_count() as u16)
            .saturating_mul(crate::THROTTLE_GRANULARITY as u16);
        loop {
            let Some(main) = self.scheduler.current_timeslot().connection_main else {
                return;
            };
            let active = {
                let throttle = &mut conns[main.index()].throttle;
                if throttle.pattern.is_empty() {
                    return;
                }
                let total = throttle.pattern.len() as u8;
                let next = (throttle.pattern_count + 1) % total;
                throttle.pattern_count = next;
                throttle.pattern[next as usize]
            };
            if active {
                return;
            }
            guard += 1;
            if guard > guard_limit {
                return;
            }
            let conns_ro: &[&'a mut Connection<'a>] = conns;
            *inc_count = inc_count.wrapping_add(
                self.scheduler
                    .increment_timeslot(|id| conns_ro[id.index()].source_address),
            );
        }
    }

    fn setup_prime_timeslot_status(&mut self, conns: &[&'a mut Connection<'a>]) {
        match self.current_timeslot.connection_auto_reply {
            Some(auto_id) => {
                self.current_ts_prime = true;
                self.current_ts_prime_tx =
                    conns[auto_id.index()].source_address == self.local_address;
            }
            None => {
                self.current_ts_prime = false;
                self.current_ts_prime_tx = false;
            }
        }
    }

    fn state_setup_primary_link(
        &mut self,
        conns: &mut [&'a mut Connection<'a>],
        now_quarter_ms: u64,
        callbacks: &mut CallbackQueue,
    ) {
        let Some(main_id) = self.current_timeslot.connection_main else {
            self.output = SignalPair::empty();
            self.main_xlayer = XlayerRef::None;
            self.auto_xlayer = XlayerRef::None;
            return;
        };

        let sleep = self.scheduler.sleep_cycles() + self.rdo.offset() as u32;
        let cca = conns[main_id.index()].cca;

        if self.is_main_timeslot_tx(conns) {
            self.tdma_sync.update_tx(sleep, &cca);
            self.main_xlayer = self.get_xlayer_for_tx(conns, main_id, now_quarter_ms, callbacks);
            self.auto_xlayer = XlayerRef::None;
            self.current_xlayer = self.main_xlayer;
            self.output.main = OutputSignal::PrepareDone;
            self.output.auto_reply = OutputSignal::Empty;
        } else {
            self.tdma_sync.update_rx(sleep, &cca);
            self.main_xlayer = self.get_xlayer_for_rx(conns, main_id);
            self.auto_xlayer = XlayerRef::None;
            self.current_xlayer = self.main_xlayer;
            self.output.main = OutputSignal::PrepareDone;
            self.output.auto_reply = OutputSignal::Empty;

            if !self.tdma_sync.is_slave_synced()
                && self.role == Role::Node
                && conns[main_id.index()].source_address == self.syncing_address
                && self.fast_sync_enabled
            {
                // Hunting: open the receiver wide and flag the slot.
                let channel = self.current_channel_index;
                let conn = &mut *conns[main_id.index()];
                for radio in 0..conn.radio_count {
                    conn.gain_loop_mut(channel, radio).reset();
                }
                self.output.main = OutputSignal::Syncing;
            }
        }

        let payload_len = xlayer_ref(conns, self.main_xlayer)
            .map(|x| x.frame.payload_len())
            .unwrap_or(0) as u8;
        let fallback_index = conns[main_id.index()].fallback.channel_index(payload_len);

        let channel_index = self.current_channel_index;
        let sleep_level = self.tdma_sync.sleep_level();
        let rx_timeout = self.tdma_sync.timeout();
        let sleep_cycles = self.tdma_sync.sleep_cycles();
        let power_up_delay = self.tdma_sync.pwr_up();

        let (modulation, fec, src, dst, expect_ack, fixed_payload, conn_cca) = {
            let conn = &*conns[main_id.index()];
            (
                conn.modulation,
                conn.fec,
                conn.source_address,
                conn.destination_address,
                conn.ack_enabled,
                conn.fixed_payload,
                conn.cca,
            )
        };

        if let Some(xl) = xlayer_mut(conns, self.main_xlayer) {
            xl.config.channel_index = channel_index;
            xl.config.fallback_index = fallback_index;
            xl.config.cca = conn_cca;
            xl.config.sleep_level = sleep_level;
            xl.config.modulation = modulation;
            xl.config.fec = fec;
            xl.config.source_address = src;
            xl.config.destination_address = dst;
            xl.config.expect_ack = expect_ack;
            xl.config.fixed_payload = fixed_payload;
            xl.config.rx_timeout = rx_timeout;
            xl.config.sleep_cycles = sleep_cycles;
            xl.config.power_up_delay = power_up_delay;
            xl.config.cca_try_count = 0;
        }
    }

    fn state_setup_prime_link(
        &mut self,
        conns: &mut [&'a mut Connection<'a>],
        now_quarter_ms: u64,
        callbacks: &mut CallbackQueue,
    ) {
        if !self.current_ts_prime {
            return;
        }
        let (Some(auto_id), Some(main_id)) = (
            self.current_timeslot.connection_auto_reply,
            self.current_timeslot.connection_main,
        ) else {
            return;
        };

        if self.current_ts_prime_tx {
            self.auto_xlayer = self.get_xlayer_for_tx(conns, auto_id, now_quarter_ms, callbacks);
            self.current_xlayer = self.auto_xlayer;
        } else {
            self.auto_xlayer = self.get_xlayer_for_rx(conns, auto_id);
        }
        self.output.auto_reply = OutputSignal::PrepareDone;

        // The reply reuses the main link's channel selection.
        let payload_len = xlayer_ref(conns, self.main_xlayer)
            .map(|x| x.frame.payload_len())
            .unwrap_or(0) as u8;
        let fallback_index = conns[main_id.index()].fallback.channel_index(payload_len);
        let channel_index = self.current_channel_index;

        let (modulation, fec, fixed_payload) = {
            let main_conn = &*conns[main_id.index()];
            (main_conn.modulation, main_conn.fec, main_conn.fixed_payload)
        };
        let (src, dst, expect_ack) = {
            let auto_conn = &*conns[auto_id.index()];
            (
                auto_conn.source_address,
                auto_conn.destination_address,
                auto_conn.ack_enabled,
            )
        };

        if let Some(xl) = xlayer_mut(conns, self.auto_xlayer) {
            xl.config.channel_index = channel_index;
            xl.config.fallback_index = fallback_index;
            xl.config.modulation = modulation;
            xl.config.fec = fec;
            xl.config.fixed_payload = fixed_payload;
            xl.config.source_address = src;
            xl.config.destination_address = dst;
            xl.config.expect_ack = expect_ack;
        }
    }

    fn state_mac_prepare_frame(&mut self, conns: &mut [&'a mut Connection<'a>]) {
        if !(self.is_main_timeslot_tx(conns) || self.current_ts_prime) {
            return;
        }
        let space = xlayer_ref(conns, self.current_xlayer)
            .map(|x| x.frame.header_space_available())
            .unwrap_or(false);
        if space {
            self.fill_header(conns);
        }
    }

    /// Serialize the enabled header fields right in front of the payload.
    fn fill_header(&mut self, conns: &mut [&'a mut Connection<'a>]) {
        let conn_id = if self.current_ts_prime_tx {
            match self.current_timeslot.connection_auto_reply {
                Some(id) => id,
                None => return,
            }
        } else {
            match self.current_timeslot.connection_main {
                Some(id) => id,
                None => return,
            }
        };

        let main_saw_seq = self
            .current_timeslot
            .connection_main
            .map(|id| conns[id.index()].arq.seq_num())
            .unwrap_or(false);

        let mut bytes = [0u8; crate::header::MAX_HEADER_SIZE];
        let mut at = 0usize;
        for field in conns[conn_id.index()].protocol.fields() {
            match field {
                HeaderField::TimeslotIdSaw => {
                    bytes[at] = TimeslotIdSaw::new()
                        .with_timeslot_id(self.scheduler.current_timeslot_index() & 0x7f)
                        .with_saw_seq(main_saw_seq)
                        .into_bytes()[0];
                }
                HeaderField::ChannelIndex => {
                    bytes[at] = self.channel_hopping.sequence_index();
                }
                HeaderField::Rdo => {
                    bytes[at..at + 2].copy_from_slice(&self.rdo.offset().to_le_bytes());
                }
                HeaderField::RangingPhaseCount => {
                    bytes[at] = self.phase_data.local_phases_count;
                }
                HeaderField::RangingPhases => {
                    let local = self.phase_data.local_phases_info;
                    bytes[at] = self.phase_data.local_phases_count;
                    bytes[at + 1] = local.phase1;
                    bytes[at + 2] = local.phase2;
                    bytes[at + 3] = local.phase3;
                    bytes[at + 4] = local.phase4;
                }
            }
            at += field.size() as usize;
        }
        let wrote_rdo = conns[conn_id.index()]
            .protocol
            .fields()
            .contains(&HeaderField::Rdo);
        if wrote_rdo {
            self.rdo.advance();
        }

        let header_size = conns[conn_id.index()].header_size;
        if let Some(xl) = xlayer_mut(conns, self.current_xlayer) {
            if let Some(dst) = xl.frame.prepend_header(header_size) {
                dst.copy_from_slice(&bytes[..header_size as usize]);
            }
        }
    }

    // ---- outcome path ----------------------------------------------------

    fn state_link_quality(&mut self, conns: &mut [&'a mut Connection<'a>]) {
        let conn_id = if self.is_prime_rx() {
            self.current_timeslot.connection_auto_reply
        } else {
            self.current_timeslot.connection_main
        };
        let Some(conn_id) = conn_id else { return };

        let (outcome, rssi, rnsi) = match xlayer_ref(conns, self.current_xlayer) {
            Some(xl) => (xl.frame.outcome, xl.config.rssi_raw, xl.config.rnsi_raw),
            None => return,
        };

        let channel = self.current_channel_index;
        let conn = &mut *conns[conn_id.index()];
        let gain_index = conn.gain_loop(channel, 0).gain_index();
        conn.lqi.update(gain_index, outcome, rssi, rnsi);
        if let Some(channel_lqi) = conn.channel_lqi.get_mut(channel as usize) {
            channel_lqi.update(gain_index, outcome, rssi, rnsi);
        }
    }

    fn state_sync(&mut self, conns: &mut [&'a mut Connection<'a>]) {
        if self.output.main == OutputSignal::Syncing {
            // The receiver listened wide open; the measured wait carries no
            // schedule information.
            if let Some(xl) = xlayer_mut(conns, self.current_xlayer) {
                xl.config.rx_wait_time = 0;
            }
        }

        if self.role != Role::Node {
            return;
        }
        if self.is_prime_rx() {
            return;
        }
        let Some(main_id) = self.current_timeslot.connection_main else {
            return;
        };

        let (outcome, rx_wait) = match xlayer_ref(conns, self.current_xlayer) {
            Some(xl) => (xl.frame.outcome, xl.config.rx_wait_time),
            None => return,
        };
        let cca = conns[main_id.index()].cca;

        if !self.tdma_sync.is_slave_synced() {
            self.tdma_sync.slave_find(outcome, rx_wait, &cca);
        } else if conns[main_id.index()].source_address == self.syncing_address {
            self.tdma_sync.slave_adjust(outcome, rx_wait, &cca);
        }
    }

    fn state_post_rx(&mut self, conns: &mut [&'a mut Connection<'a>]) {
        if self.current_input == InputSignal::RxFrame {
            let no_payload = xlayer_ref(conns, self.current_xlayer)
                .map(|x| x.frame.received_bytes().is_empty())
                .unwrap_or(true);
            if no_payload {
                self.current_output = OutputSignal::Empty;
            } else {
                self.current_output = OutputSignal::FrameRxSuccess;
                self.extract_header(conns);

                let header_only = xlayer_ref(conns, self.current_xlayer)
                    .map(|x| x.frame.is_header_only())
                    .unwrap_or(true);
                if header_only {
                    // Auto-sync beacon: internal to the MAC.
                    self.current_output = OutputSignal::Empty;
                } else {
                    let conn_id = if self.is_prime_rx() {
                        self.current_timeslot.connection_auto_reply
                    } else {
                        self.current_timeslot.connection_main
                    };
                    if let Some(conn_id) = conn_id {
                        let (outcome, rssi, rnsi) = match xlayer_ref(conns, self.current_xlayer) {
                            Some(xl) => (xl.frame.outcome, xl.config.rssi_raw, xl.config.rnsi_raw),
                            None => (FrameOutcome::Received, 0, 0),
                        };
                        let channel = self.current_channel_index;
                        let conn = &mut *conns[conn_id.index()];
                        let gain_index = conn.gain_loop(channel, 0).gain_index();
                        conn.used_frame_lqi.update(gain_index, outcome, rssi, rnsi);
                    }
                }
            }
            if matches!(self.current_xlayer, XlayerRef::Overrun(_)) {
                self.current_output = OutputSignal::FrameRxOverrun;
            }
        } else {
            self.current_output = OutputSignal::FrameRxFail;
        }

        if self.scheduler.mismatch() {
            // The peer disagrees on the slot id; suppress this slot's
            // output while the cursor resynchronizes.
            self.current_output = OutputSignal::Empty;
        }
    }

    /// Parse the header fields in front of the payload, applying their
    /// side effects: cursor resync, ARQ duplicate detection, RDO and hop
    /// index adoption, ranging phases.
    fn extract_header(&mut self, conns: &mut [&'a mut Connection<'a>]) {
        let conn_id = if self.is_prime_rx() {
            match self.current_timeslot.connection_auto_reply {
                Some(id) => id,
                None => return,
            }
        } else {
            match self.current_timeslot.connection_main {
                Some(id) => id,
                None => return,
            }
        };

        let header_size = conns[conn_id.index()].header_size;
        let mut bytes = [0u8; crate::header::MAX_HEADER_SIZE];
        let (received_len, rx_wait_time) = match xlayer_ref(conns, self.current_xlayer) {
            Some(xl) => {
                let received = xl.frame.received_bytes();
                if received.len() < header_size as usize {
                    return;
                }
                bytes[..header_size as usize].copy_from_slice(&received[..header_size as usize]);
                (received.len(), xl.config.rx_wait_time)
            }
            None => return,
        };
        let header_only_frame = received_len == header_size as usize;

        let field_list: heapless::Vec<HeaderField, { crate::header::MAX_HEADER_FIELDS }> =
            heapless::Vec::from_slice(conns[conn_id.index()].protocol.fields())
                .unwrap_or_default();

        let mut at = 0usize;
        for field in &field_list {
            match field {
                HeaderField::TimeslotIdSaw => {
                    let parsed = TimeslotIdSaw::from_bytes([bytes[at]]);
                    if self.role == Role::Node {
                        let timeslot_id = parsed.timeslot_id();
                        if (timeslot_id as usize) < self.scheduler.total_timeslot_count() {
                            if self.scheduler.current_timeslot_index() != timeslot_id {
                                self.scheduler.set_mismatch();
                            }
                            self.scheduler.set_timeslot_index(timeslot_id);
                        }
                    }
                    if !header_only_frame {
                        if let Some(main_id) = self.current_timeslot.connection_main {
                            let arq = &mut conns[main_id.index()].arq;
                            arq.update_rx_seq_num(parsed.saw_seq());
                            if arq.is_rx_frame_duplicate() {
                                self.current_output = OutputSignal::Empty;
                            }
                        }
                    }
                }
                HeaderField::ChannelIndex => {
                    if self.role == Role::Node {
                        self.channel_hopping.set_sequence_index(bytes[at]);
                    }
                }
                HeaderField::Rdo => {
                    let offset = u16::from_le_bytes([bytes[at], bytes[at + 1]]);
                    self.rdo.set_received(offset);
                }
                HeaderField::RangingPhaseCount => {
                    self.phase_data.local_phases_count = bytes[at];
                }
                HeaderField::RangingPhases => {
                    self.phase_data.remote_phases_count = bytes[at];
                    self.phase_data.remote_phases_info.phase1 = bytes[at + 1];
                    self.phase_data.remote_phases_info.phase2 = bytes[at + 2];
                    self.phase_data.remote_phases_info.phase3 = bytes[at + 3];
                    self.phase_data.remote_phases_info.phase4 = bytes[at + 4];
                    if self.is_phase_accumulation_enabled(conns) {
                        if self.phase_data.is_valid() {
                            if let Some(sink) = self.phase_sink {
                                if !sink.is_busy() {
                                    sink.supply(
                                        &self.phase_data.last_local_phases_info,
                                        &self.phase_data.remote_phases_info,
                                    );
                                }
                            }
                        }
                        self.phase_data.update(rx_wait_time);
                    }
                }
            }
            at += field.size() as usize;
        }

        if let Some(xl) = xlayer_mut(conns, self.current_xlayer) {
            xl.frame.consume_header(header_size);
        }
    }

    fn state_stop_wait_arq(&mut self) {
        // Retransmission bookkeeping runs when the next TX frame is
        // acquired; nothing to do at outcome time.
    }

    fn state_post_tx(&mut self, conns: &mut [&'a mut Connection<'a>]) {
        let Some(main_id) = self.current_timeslot.connection_main else {
            self.current_output = OutputSignal::Empty;
            return;
        };
        let is_sentinel = matches!(self.current_xlayer, XlayerRef::Beacon(_));

        let (mut outcome, rssi, rnsi) = match xlayer_ref(conns, self.current_xlayer) {
            Some(xl) => (xl.frame.outcome, xl.config.rssi_raw, xl.config.rnsi_raw),
            None => (FrameOutcome::Lost, 0, 0),
        };

        let channel = self.current_channel_index;
        let mut lqi_conn = main_id;

        if !is_sentinel {
            let used_conn;
            if self.current_input == InputSignal::TxSentAck {
                self.current_output = OutputSignal::TxSuccess;
                used_conn = main_id;
                if self.is_main_timeslot_tx(conns) {
                    conns[main_id.index()].arq.increment_seq_num();
                }
            } else if self.is_main_timeslot_tx(conns) {
                if conns[main_id.index()].ack_enabled {
                    self.current_output = OutputSignal::TxFail;
                } else {
                    self.current_output = OutputSignal::TxSuccess;
                }
                used_conn = main_id;
            } else {
                // Auto-reply transmission; stop-and-wait only runs on the
                // main connection.
                let auto_id = self
                    .current_timeslot
                    .connection_auto_reply
                    .unwrap_or(main_id);
                outcome = if self.current_input == InputSignal::TxNotSent {
                    FrameOutcome::Wait
                } else {
                    FrameOutcome::SentAckLost
                };
                self.current_output = if self.current_input == InputSignal::TxNotSent {
                    OutputSignal::TxFail
                } else {
                    OutputSignal::TxSuccess
                };
                used_conn = auto_id;
                lqi_conn = auto_id;
            }

            let conn = &mut *conns[used_conn.index()];
            let gain_index = conn.gain_loop(channel, 0).gain_index();
            conn.used_frame_lqi.update(gain_index, outcome, rssi, rnsi);
        } else {
            self.current_output = OutputSignal::Empty;
            if self.current_ts_prime_tx {
                outcome = FrameOutcome::SentAckLost;
                lqi_conn = self
                    .current_timeslot
                    .connection_auto_reply
                    .unwrap_or(main_id);
            }
        }

        let conn = &mut *conns[lqi_conn.index()];
        let gain_index = conn.gain_loop(channel, 0).gain_index();
        conn.lqi.update(gain_index, outcome, rssi, rnsi);
        if let Some(channel_lqi) = conn.channel_lqi.get_mut(channel as usize) {
            channel_lqi.update(gain_index, outcome, rssi, rnsi);
        }
    }

    // ---- frame acquisition ----------------------------------------------

    /// Pick the frame the next TX slot will carry. Deadline-expired frames
    /// are flushed first; an empty queue (or an unsynchronized slave)
    /// falls back to the per-connection sentinel, which carries a bare
    /// header when auto-sync keeps the peer locked.
    fn get_xlayer_for_tx(
        &mut self,
        conns: &mut [&'a mut Connection<'a>],
        id: ConnectionId,
        now_quarter_ms: u64,
        callbacks: &mut CallbackQueue,
    ) -> XlayerRef {
        let unsync = self.role == Role::Node && !self.tdma_sync.is_slave_synced();
        let conn = &mut *conns[id.index()];

        if conn.arq.is_enabled() {
            Self::flush_timeout_frames(conn, id, now_quarter_ms, callbacks);
        }

        if conn.queue.front_ref().is_none() || unsync {
            if conn.auto_sync_enabled && !unsync {
                conn.beacon.frame.arm_beacon();
            } else {
                conn.beacon.frame.clear();
            }
            conn.beacon.frame.time_stamp_quarter_ms = now_quarter_ms;
            conn.beacon.frame.outcome = FrameOutcome::Lost;
            XlayerRef::Beacon(id)
        } else {
            if let Some(front) = conn.queue.front() {
                front.frame.rewind_header();
            }
            XlayerRef::Front(id)
        }
    }

    fn flush_timeout_frames(
        conn: &mut Connection<'a>,
        id: ConnectionId,
        now_quarter_ms: u64,
        callbacks: &mut CallbackQueue,
    ) {
        loop {
            let (time_stamp, retry_count) = {
                let Some(front) = conn.queue.front() else { return };
                let retry = front.frame.retry_count;
                front.frame.retry_count = retry.saturating_add(1);
                (front.frame.time_stamp_quarter_ms, retry)
            };
            if !conn
                .arq
                .is_frame_timeout(time_stamp, retry_count, now_quarter_ms)
            {
                return;
            }
            conn.stats.tx_drop += 1;
            conn.queue.dequeue();
            let _ = callbacks.enqueue(CallbackRequest {
                conn: id,
                kind: CallbackKind::TxDropped,
            });
        }
    }

    /// Pick the landing frame for the next RX slot: the first free queue
    /// slot, or the overrun scratch when the application stopped reading.
    fn get_xlayer_for_rx(
        &mut self,
        conns: &mut [&'a mut Connection<'a>],
        id: ConnectionId,
    ) -> XlayerRef {
        let conn = &mut *conns[id.index()];
        match conn.queue.get_free_slot() {
            Some(slot) => {
                slot.frame.mark_received(0);
                slot.frame.outcome = FrameOutcome::Lost;
                XlayerRef::FreeSlot(id)
            }
            None => {
                conn.overrun.frame.mark_received(0);
                conn.overrun.frame.outcome = FrameOutcome::Lost;
                XlayerRef::Overrun(id)
            }
        }
    }

    // ---- predicates and bookkeeping --------------------------------------

    fn is_main_timeslot_tx(&self, conns: &[&'a mut Connection<'a>]) -> bool {
        self.current_timeslot
            .connection_main
            .map(|id| conns[id.index()].source_address == self.local_address)
            .unwrap_or(false)
    }

    fn is_phase_accumulation_enabled(&self, conns: &[&'a mut Connection<'a>]) -> bool {
        if !self.is_prime_rx() {
            return false;
        }
        self.current_timeslot
            .connection_main
            .map(|id| conns[id.index()].phases_exchange)
            .unwrap_or(false)
    }

    fn update_stats(&mut self, conns: &mut [&'a mut Connection<'a>]) {
        if let Some(main_id) = self.current_timeslot.connection_main {
            let (payload_len, cca_try_count, outcome) = match xlayer_ref(conns, self.main_xlayer) {
                Some(xl) => (
                    xl.frame.payload_len() as u32,
                    xl.config.cca_try_count,
                    xl.frame.outcome,
                ),
                None => (0, 0, FrameOutcome::Lost),
            };
            let conn = &mut *conns[main_id.index()];
            let cca = conn.cca;
            let mut count_cca = false;
            match self.output.main {
                OutputSignal::FrameRxSuccess => {
                    conn.stats.rx_received += 1;
                    conn.stats.rx_byte_received += payload_len;
                }
                OutputSignal::FrameRxOverrun => conn.stats.rx_overrun += 1,
                OutputSignal::TxSuccess => {
                    conn.stats.tx_success += 1;
                    conn.stats.tx_byte_sent += payload_len;
                    count_cca = true;
                }
                OutputSignal::TxFail => {
                    conn.stats.tx_fail += 1;
                    count_cca = true;
                }
                OutputSignal::TxDrop => conn.stats.tx_drop += 1,
                OutputSignal::Empty => count_cca = true,
                _ => {}
            }
            if count_cca && cca.enabled {
                if cca_try_count >= cca.max_try_count {
                    conn.stats.cca_fail += 1;
                } else if outcome != FrameOutcome::Wait {
                    conn.stats.cca_pass += 1;
                }
            }
        }

        if let Some(auto_id) = self.current_timeslot.connection_auto_reply {
            let payload_len = xlayer_ref(conns, self.auto_xlayer)
                .map(|x| x.frame.payload_len())
                .unwrap_or(0) as u32;
            let conn = &mut *conns[auto_id.index()];
            match self.output.auto_reply {
                OutputSignal::FrameRxSuccess => {
                    conn.stats.rx_received += 1;
                    conn.stats.rx_byte_received += payload_len;
                }
                OutputSignal::FrameRxOverrun => conn.stats.rx_overrun += 1,
                OutputSignal::TxSuccess => {
                    conn.stats.tx_success += 1;
                    conn.stats.tx_byte_sent += payload_len;
                }
                OutputSignal::TxFail => conn.stats.tx_fail += 1,
                OutputSignal::TxDrop => conn.stats.tx_drop += 1,
                _ => {}
            }
        }
    }
}
