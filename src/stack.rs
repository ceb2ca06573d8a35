//! The stack instance: one node, one or two radios, the MAC and the
//! queues binding the three execution contexts together.
//!
//! The radio interrupt drives [`Wps::radio_irq`]; each invocation runs the
//! MAC once for the completed slot, stages the next one and re-arms the
//! radios. User notifications are deferred through the callback queue and
//! drained from the lower-priority context via
//! [`Wps::process_callbacks`]. Application requests that must touch MAC
//! state (throttle patterns, register access) travel through the request
//! queue and are consumed between slots.

use heapless::spsc::Queue;
use heapless::Vec;

use crate::connection::Connection;
use crate::error::{Error, Event};
use crate::hal::{SyncTimer, WpsHal};
use crate::link::gain::normalized_gain_tenth_db;
use crate::link::multi::MultiRadio;
use crate::mac::{
    xlayer_mut, xlayer_ref, CallbackKind, CallbackQueue, CallbackRequest, InputSignal,
    OutputSignal, SignalPair, WpsMac, XlayerRef,
};
use crate::phy::{
    aggregate_auto_signal, aggregate_main_signal, Phy, PhyOutputSignal, SlotDir, SlotIntent,
    Transceiver,
};
use crate::trace;
use crate::{ConnectionId, Role, SleepLevel, THROTTLE_GRANULARITY};

/// Connections one stack instance can carry.
pub const MAX_CONNECTIONS: usize = 16;

/// Radios one node can drive.
pub const MAX_RADIO_COUNT: usize = 2;

/// Request queue depth (one slot is reserved by the queue itself).
pub const REQUEST_QUEUE_SIZE: usize = 5;

/// Application-to-MAC request.
#[derive(Debug)]
pub(crate) enum Request {
    ScheduleRatio {
        conn: ConnectionId,
        active_ratio: u8,
        pattern: Vec<bool, THROTTLE_GRANULARITY>,
    },
    WriteRegister {
        register: u8,
        data: u8,
    },
    ReadRegister {
        register: u8,
    },
}

/// Node identity and radio parameters shared by every connection.
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeParams {
    pub role: Role,
    pub pan_id: u16,
    pub local_address: u16,
    pub coordinator_address: u16,
    pub sleep_level: SleepLevel,
    pub preamble_bits: u16,
    pub syncword_bits: u16,
    pub crc_polynomial: u16,
    pub rx_gain: u8,
}

impl Default for NodeParams {
    fn default() -> Self {
        NodeParams {
            role: Role::Coordinator,
            pan_id: 0,
            local_address: 0,
            coordinator_address: 0,
            sleep_level: SleepLevel::Idle,
            preamble_bits: crate::DEFAULT_PREAMBLE_BITS,
            syncword_bits: crate::DEFAULT_SYNCWORD_BITS,
            crc_polynomial: crate::DEFAULT_CRC_POLYNOMIAL,
            rx_gain: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StackSignal {
    None,
    RadioIrq,
    TransferComplete,
}

pub struct Wps<'a, T: Transceiver, H: WpsHal> {
    pub(crate) hal: H,
    pub(crate) node: NodeParams,
    pub(crate) mac: WpsMac<'a>,
    pub(crate) conns: Vec<&'a mut Connection<'a>, MAX_CONNECTIONS>,
    pub(crate) phys: Vec<Phy<T>, MAX_RADIO_COUNT>,
    pub(crate) multi: MultiRadio,
    pub(crate) sync_timer: Option<&'a mut dyn SyncTimer>,
    pub(crate) callback_queue: CallbackQueue,
    pub(crate) request_queue: Queue<Request, REQUEST_QUEUE_SIZE>,
    pub(crate) channel_seq: &'a [u8],
    pub(crate) random_channel_sequence_enabled: bool,
    pub(crate) rdo_rollover: Option<u16>,
    pub(crate) connected: bool,
    pub(crate) signal: StackSignal,
    pub(crate) current_irq_radio: usize,
    pub(crate) read_register_result: Option<(u8, u8)>,
}

impl<'a, T: Transceiver, H: WpsHal> Wps<'a, T, H> {
    // ---- interrupt entry points -----------------------------------------

    /// Radio interrupt, single-radio wiring.
    pub fn radio_irq(&mut self) {
        self.radio_irq_indexed(0);
    }

    /// Radio interrupt of radio `radio` (dual-radio wiring).
    pub fn radio_irq_indexed(&mut self, radio: usize) {
        if !self.connected {
            return;
        }
        self.signal = StackSignal::RadioIrq;
        self.current_irq_radio = radio;
        self.process();
    }

    /// SPI/DMA transfer completion, single-radio wiring.
    pub fn transfer_complete(&mut self) {
        self.transfer_complete_indexed(0);
    }

    pub fn transfer_complete_indexed(&mut self, radio: usize) {
        if !self.connected {
            return;
        }
        self.signal = StackSignal::TransferComplete;
        self.current_irq_radio = radio;
        self.process();
    }

    /// Periodic tick realigning the follower radio's wake-up timer
    /// (dual-radio only).
    pub fn radio_sync_timer_tick(&mut self) {
        for phy in self.phys.iter_mut() {
            let _ = phy.transceiver.resync_timer();
        }
    }

    /// Drains the callback queue; wire this to the lower-priority software
    /// interrupt triggered through the HAL context switch.
    pub fn process_callbacks(&mut self) {
        while let Some(req) = self.callback_queue.dequeue() {
            let Some(conn) = self.conns.get(req.conn.index()) else {
                continue;
            };
            match req.kind {
                CallbackKind::TxSuccess => {
                    if let Some(cb) = conn.callbacks.tx_success {
                        cb();
                    }
                }
                CallbackKind::TxFail => {
                    if let Some(cb) = conn.callbacks.tx_fail {
                        cb();
                    }
                }
                CallbackKind::TxDropped => {
                    if let Some(cb) = conn.callbacks.tx_dropped {
                        cb();
                    }
                }
                CallbackKind::RxSuccess => {
                    if let Some(cb) = conn.callbacks.rx_success {
                        cb();
                    }
                }
                CallbackKind::Event(event) => {
                    if let Some(cb) = conn.callbacks.event {
                        cb(event);
                    }
                }
            }
        }
    }

    // ---- connect / disconnect -------------------------------------------

    pub fn connect(&mut self) -> Result<(), Error> {
        if self.connected {
            return Err(Error::AlreadyConnected);
        }
        if self.phys.is_empty() {
            return Err(Error::RadioNotInitialized);
        }

        self.mac.reset();
        for phy in self.phys.iter_mut() {
            phy.connect().map_err(|_| Error::RadioNotInitialized)?;
        }
        if let Some(timer) = self.sync_timer.as_mut() {
            timer.start();
        }
        self.connected = true;
        self.hal.enable_radio_irq();
        self.hal.enable_radio_dma_irq();

        trace!("stack connected");

        // Stage and arm the first slot; from here the radio IRQ drives.
        self.schedule_and_arm();
        self.hal.context_switch();
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<(), Error> {
        if !self.connected {
            return Err(Error::AlreadyDisconnected);
        }
        self.hal.disable_radio_irq();
        self.hal.disable_radio_dma_irq();
        for phy in self.phys.iter_mut() {
            let _ = phy.disconnect();
        }
        if let Some(timer) = self.sync_timer.as_mut() {
            timer.stop();
        }
        // The in-flight frame tokens are dropped; a queued TX frame stays
        // queued and goes out after the next connect.
        self.mac.reset();
        self.connected = false;
        trace!("stack disconnected");
        Ok(())
    }

    /// Register read results are reported back asynchronously; the caller
    /// polls them out.
    pub fn take_read_register_result(&mut self) -> Option<(u8, u8)> {
        self.read_register_result.take()
    }

    // ---- core processing -------------------------------------------------

    fn process(&mut self) {
        let radio = self.current_irq_radio;
        if radio >= self.phys.len() {
            return;
        }
        match self.signal {
            StackSignal::RadioIrq => {
                let _ = self.phys[radio].service_irq();
            }
            StackSignal::TransferComplete => {
                let _ = self.phys[radio].service_transfer();
            }
            StackSignal::None => return,
        }
        self.signal = StackSignal::None;

        let leader = self.leader_index();
        let main_signal = aggregate_main_signal(&self.phys, leader);
        match main_signal {
            PhyOutputSignal::Yield
            | PhyOutputSignal::Processing
            | PhyOutputSignal::PrepareDone => return,
            _ => {}
        }
        let auto_signal = aggregate_auto_signal(&self.phys, leader);

        self.end_slot(main_signal, auto_signal, leader);
    }

    fn leader_index(&self) -> usize {
        if self.phys.len() < 2 {
            0
        } else {
            self.multi.replying_radio().min(self.phys.len() - 1)
        }
    }

    /// Harvest the completed slot, run the MAC, dispatch its outputs and
    /// arm the next slot.
    fn end_slot(
        &mut self,
        main_signal: PhyOutputSignal,
        auto_signal: PhyOutputSignal,
        leader: usize,
    ) {
        self.harvest_outcomes(leader);

        let input = SignalPair {
            main: to_input_signal(main_signal),
            auto_reply: to_input_signal(auto_signal),
        };
        let outputs = {
            let Wps { mac, conns, .. } = self;
            mac.process_outcome(conns, input)
        };

        self.dispatch_output(outputs.main, self.mac.main_xlayer);
        self.dispatch_output(outputs.auto_reply, self.mac.auto_xlayer);
        if !self.callback_queue.is_empty() {
            self.hal.context_switch();
        }

        for phy in self.phys.iter_mut() {
            phy.acknowledge_slot();
        }

        self.schedule_and_arm();
    }

    /// Copy the leading radio's measurements (and received bytes) into the
    /// staged frames; feed every radio's measurements to its gain loop and
    /// to the diversity comparator.
    fn harvest_outcomes(&mut self, leader: usize) {
        let Wps {
            mac,
            conns,
            phys,
            multi,
            node,
            callback_queue,
            ..
        } = self;

        let main_ref = mac.main_xlayer;
        let auto_ref = mac.auto_xlayer;

        // Per-radio gain tracking and leader election on the main frame.
        if let Some(conn_id) = main_ref.conn() {
            let channel = mac.current_channel_index;
            for (radio, phy) in phys.iter_mut().enumerate() {
                let outcome = phy.transceiver.main_outcome();
                let conn = &mut *conns[conn_id.index()];
                let gain_loop = conn.gain_loop_mut(channel, radio as u8);
                gain_loop.update(outcome.outcome, outcome.rssi_raw);
                let gain_index = conn.gain_loop(channel, radio as u8).gain_index();
                multi.record_sample(
                    radio,
                    normalized_gain_tenth_db(gain_index, outcome.rssi_raw),
                );
            }
            multi.update();
        }

        let main_outcome = phys[leader].transceiver.main_outcome();
        if main_outcome.header_corrupted {
            if let Some(conn_id) = main_ref.conn() {
                let _ = callback_queue.enqueue(CallbackRequest {
                    conn: conn_id,
                    kind: CallbackKind::Event(Event::ProducerPacketCorrupted),
                });
            }
        }
        let main_is_rx = main_ref
            .conn()
            .map(|id| conns[id.index()].source_address != node.local_address)
            .unwrap_or(false);
        if let Some(xl) = xlayer_mut(conns, main_ref) {
            xl.frame.outcome = main_outcome.outcome;
            xl.config.rssi_raw = main_outcome.rssi_raw;
            xl.config.rnsi_raw = main_outcome.rnsi_raw;
            xl.config.rx_wait_time = main_outcome.rx_wait_time;
            xl.config.cca_try_count = main_outcome.cca_try_count;
            xl.config.rx_cca_retry_count = main_outcome.rx_cca_retry_count;
            if main_is_rx && main_outcome.outcome == crate::FrameOutcome::Received {
                let len = phys[leader].transceiver.read_frame(xl.frame.receive_area_mut());
                xl.frame.mark_received(len);
                xl.frame.outcome = main_outcome.outcome;
            }
        }

        if auto_ref != XlayerRef::None {
            let auto_outcome = phys[leader].transceiver.auto_outcome().unwrap_or_default();
            let auto_is_rx = auto_ref
                .conn()
                .map(|id| conns[id.index()].source_address != node.local_address)
                .unwrap_or(false);
            if let Some(xl) = xlayer_mut(conns, auto_ref) {
                xl.frame.outcome = auto_outcome.outcome;
                xl.config.rssi_raw = auto_outcome.rssi_raw;
                xl.config.rnsi_raw = auto_outcome.rnsi_raw;
                xl.config.rx_wait_time = auto_outcome.rx_wait_time;
                if auto_is_rx && auto_outcome.outcome == crate::FrameOutcome::Received {
                    let len = phys[leader]
                        .transceiver
                        .read_auto_frame(xl.frame.receive_area_mut());
                    xl.frame.mark_received(len);
                    xl.frame.outcome = auto_outcome.outcome;
                }
            }
        }
    }

    /// Turn one MAC output into queue movement and a deferred callback.
    fn dispatch_output(&mut self, output: OutputSignal, frame: XlayerRef) {
        let Some(conn_id) = frame.conn() else { return };
        match output {
            OutputSignal::FrameRxSuccess => {
                if matches!(frame, XlayerRef::FreeSlot(_)) {
                    self.conns[conn_id.index()].queue.enqueue();
                }
                let _ = self.callback_queue.enqueue(CallbackRequest {
                    conn: conn_id,
                    kind: CallbackKind::RxSuccess,
                });
            }
            OutputSignal::FrameRxOverrun => {
                let _ = self.callback_queue.enqueue(CallbackRequest {
                    conn: conn_id,
                    kind: CallbackKind::Event(Event::RxOverrun),
                });
                trace!("rx overrun");
            }
            OutputSignal::TxSuccess => {
                if matches!(frame, XlayerRef::Front(_)) {
                    self.conns[conn_id.index()].queue.dequeue();
                }
                let _ = self.callback_queue.enqueue(CallbackRequest {
                    conn: conn_id,
                    kind: CallbackKind::TxSuccess,
                });
            }
            OutputSignal::TxFail => {
                // With ARQ the frame stays queued for the next slot; the
                // deadline flush decides when to give up. Without ARQ a
                // failed frame is spent.
                if matches!(frame, XlayerRef::Front(_))
                    && !self.conns[conn_id.index()].arq.is_enabled()
                {
                    self.conns[conn_id.index()].queue.dequeue();
                }
                let _ = self.callback_queue.enqueue(CallbackRequest {
                    conn: conn_id,
                    kind: CallbackKind::TxFail,
                });
            }
            OutputSignal::Empty
            | OutputSignal::FrameRxFail
            | OutputSignal::TxDrop
            | OutputSignal::PrepareDone
            | OutputSignal::Syncing => {}
        }
    }

    /// Consume pending requests, advance the schedule and arm every radio
    /// for the next slot.
    fn schedule_and_arm(&mut self) {
        self.process_requests();

        let now = self.hal.tick_quarter_ms();
        {
            let Wps {
                mac,
                conns,
                callback_queue,
                ..
            } = self;
            mac.process_schedule(conns, now, callback_queue);
        }
        if !self.callback_queue.is_empty() {
            self.hal.context_switch();
        }
        self.arm_radios();
    }

    fn process_requests(&mut self) {
        while let Some(request) = self.request_queue.dequeue() {
            match request {
                Request::ScheduleRatio {
                    conn,
                    active_ratio,
                    pattern,
                } => {
                    if let Some(c) = self.conns.get_mut(conn.index()) {
                        c.throttle.pattern = pattern;
                        c.throttle.pattern_count = 0;
                        c.throttle.active_ratio = active_ratio;
                    }
                }
                Request::WriteRegister { register, data } => {
                    for phy in self.phys.iter_mut() {
                        let _ = phy.transceiver.write_register(register, data);
                    }
                }
                Request::ReadRegister { register } => {
                    let value = self
                        .phys
                        .first_mut()
                        .and_then(|phy| phy.transceiver.read_register(register).ok());
                    if let Some(value) = value {
                        self.read_register_result = Some((register, value));
                    }
                }
            }
        }
    }

    fn arm_radios(&mut self) {
        let Wps {
            mac,
            conns,
            phys,
            multi,
            node,
            ..
        } = self;

        let main_ref = mac.main_xlayer;
        let auto_ref = mac.auto_xlayer;
        let leader = if phys.len() < 2 {
            0
        } else {
            multi.replying_radio().min(phys.len() - 1)
        };

        for radio in 0..phys.len() {
            let follower = radio != leader;
            let Some(main_intent) =
                build_intent(conns, main_ref, node.local_address, radio as u8, follower)
            else {
                continue;
            };
            // The follower never sources the auto-reply.
            let auto_intent = if follower
                && auto_ref
                    .conn()
                    .map(|id| conns[id.index()].source_address == node.local_address)
                    .unwrap_or(false)
            {
                None
            } else {
                build_intent(conns, auto_ref, node.local_address, radio as u8, follower)
            };
            let _ = phys[radio].arm(&main_intent, auto_intent.as_ref());
        }
    }
}

/// Build the per-radio slot intent for one staged frame. The follower gets
/// a stripped view: no bytes on TX slots it does not source and never an
/// ACK expectation.
fn build_intent<'s, 'a>(
    conns: &'s [&'a mut Connection<'a>],
    frame: XlayerRef,
    local_address: u16,
    radio: u8,
    follower: bool,
) -> Option<SlotIntent<'s>> {
    let conn_id = frame.conn()?;
    let xl = xlayer_ref(conns, frame)?;
    let conn = &*conns[conn_id.index()];

    let dir = if conn.source_address == local_address {
        SlotDir::Tx
    } else {
        SlotDir::Rx
    };
    let channel = conn
        .channels
        .get(xl.config.fallback_index, xl.config.channel_index, radio);
    let rx_constgain = conn.gain_loop(xl.config.channel_index, radio).gain_value();
    let frame_bytes: &'s [u8] = if dir == SlotDir::Tx && !follower {
        xl.frame.wire_bytes()
    } else {
        &[]
    };

    Some(SlotIntent {
        dir,
        frame: frame_bytes,
        channel,
        sleep_level: xl.config.sleep_level,
        sleep_cycles: xl.config.sleep_cycles,
        power_up_delay: xl.config.power_up_delay,
        rx_timeout: xl.config.rx_timeout,
        cca: xl.config.cca,
        rx_constgain,
        expect_ack: xl.config.expect_ack && !follower,
        modulation: xl.config.modulation,
        fec: xl.config.fec,
        source_address: xl.config.source_address,
        destination_address: xl.config.destination_address,
        fixed_payload: xl.config.fixed_payload,
    })
}

fn to_input_signal(signal: PhyOutputSignal) -> InputSignal {
    match signal {
        PhyOutputSignal::FrameSentAck => InputSignal::TxSentAck,
        PhyOutputSignal::FrameSentNack => InputSignal::TxSentNack,
        PhyOutputSignal::FrameNotSent => InputSignal::TxNotSent,
        PhyOutputSignal::FrameTx => InputSignal::Tx,
        PhyOutputSignal::FrameReceived => InputSignal::RxFrame,
        PhyOutputSignal::FrameMissed => InputSignal::RxFrameMiss,
        PhyOutputSignal::Yield
        | PhyOutputSignal::Processing
        | PhyOutputSignal::PrepareDone => InputSignal::Empty,
    }
}
