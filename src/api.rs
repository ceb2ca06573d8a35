//! Application-facing API: stack construction, the connection factory and
//! the runtime calls.
//!
//! Setup runs in a fixed order — `init`, `node_init`, `node_add_radio`,
//! any number of `connection_init`/`connection_add_channel`, then `setup`
//! — and every long-lived object is allocated from the caller-supplied
//! memory pool. Configuration errors leave the partially built graph in
//! place; the caller treats them as terminal and resets the pool.

use heapless::Vec;

use crate::connection::{Callbacks, ChannelTable, ConnStats, Connection, RfChannel, Throttle};
use crate::error::Error;
use crate::hal::WpsHal;
use crate::header::{HeaderCfg, LinkProtocol, PhaseSink};
use crate::link::cca::{CcaFailAction, CcaSettings};
use crate::link::channel::{ChannelHopping, ChannelSequence};
use crate::link::fallback::Fallback;
use crate::link::gain::GainLoop;
use crate::link::lqi::Lqi;
use crate::link::multi::MultiRadio;
use crate::link::rdo::Rdo;
use crate::link::saw_arq::SawArq;
use crate::link::scheduler::{Schedule, Scheduler, Timeslot};
use crate::link::tdma_sync::TdmaSync;
use crate::mac::WpsMac;
use crate::phy::{Phy, Transceiver};
use crate::pool::MemPool;
use crate::stack::{NodeParams, Request, Wps};
use crate::xlayer::{Frame, Xlayer, XlayerQueue};
use crate::{
    ConnectionId, FecLevel, Modulation, Role, SleepLevel, DEFAULT_RDO_ROLLOVER, PLL_FREQ_KHZ,
    SYNC_FRAME_LOST_MAX_COUNT, SYNC_PLL_STARTUP_CYCLES, SYNC_RX_SETUP_PLL_CYCLES,
    THROTTLE_GRANULARITY,
};

/// Marks a timeslot id as the auto-reply half of the slot.
pub const AUTO_TIMESLOT_FLAG: i32 = 1 << 7;

/// Timeslot id for data sent in the auto-reply of slot `id`.
pub const fn auto_timeslot(id: u8) -> i32 {
    id as i32 | AUTO_TIMESLOT_FLAG
}

/// Network-level configuration handed to [`Wps::init`].
#[derive(Debug, Clone, Copy)]
pub struct StackCfg<'d> {
    /// Per-slot durations in microseconds, one entry per superframe slot.
    pub timeslot_duration_us: &'d [u32],
    /// Channel id visited on each hop, walked in lockstep with the slots.
    pub channel_sequence: &'d [u8],
    pub random_channel_sequence_enabled: bool,
    pub fast_sync_enabled: bool,
    /// Random data-rate offset rollover; `None` disables RDO globally.
    pub rdo_rollover: Option<u16>,
}

impl Default for StackCfg<'_> {
    fn default() -> Self {
        StackCfg {
            timeslot_duration_us: &[],
            channel_sequence: &[],
            random_channel_sequence_enabled: false,
            fast_sync_enabled: false,
            rdo_rollover: Some(DEFAULT_RDO_ROLLOVER),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NodeCfg {
    pub role: Role,
    pub pan_id: u16,
    pub coordinator_address: u8,
    pub local_address: u8,
    pub sleep_level: SleepLevel,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ArqSettings {
    /// Attempts before a frame is dropped; 0 means unbounded.
    pub retry_count: u16,
    /// Queue residency deadline in quarter milliseconds; 0 means none.
    pub time_deadline_quarter_ms: u16,
}

#[derive(Debug, Clone, Copy)]
pub struct CcaCfg {
    /// Energy code considered busy, 0..=47.
    pub threshold: u8,
    pub try_count: u8,
    pub retry_time_pll_cycles: u16,
    pub fail_action: CcaFailAction,
}

#[derive(Debug, Clone, Copy)]
pub struct FallbackCfg {
    /// Payload size that switches to the fallback power profile.
    pub threshold: u8,
    pub tx_pulse_count_offset: i8,
    pub tx_pulse_width_offset: i8,
    pub tx_pulse_gain_offset: i8,
}

#[derive(Debug, Clone, Copy)]
pub struct ChannelCfg {
    pub frequency: u16,
    pub tx_pulse_count: u8,
    pub tx_pulse_width: u8,
    pub tx_pulse_gain: u8,
    pub rx_pulse_count: u8,
}

pub struct ConnectionCfg<'a> {
    pub source_address: u8,
    pub destination_address: u8,
    pub max_payload_size: u8,
    /// Frames the cross-layer queue can hold.
    pub queue_size: usize,
    pub modulation: Modulation,
    pub fec: FecLevel,
    /// Slot ids this connection occupies; wrap with [`auto_timeslot`] for
    /// the auto-reply half.
    pub timeslot_ids: &'a [i32],
    /// When `false`, the caller supplies `payload_region` and the frames
    /// are laid out inside it instead of the pool.
    pub allocate_payload_memory: bool,
    pub payload_region: Option<&'a mut [u8]>,
    pub ack_enabled: bool,
    pub arq_enabled: bool,
    pub arq_settings: ArqSettings,
    pub auto_sync_enabled: bool,
    pub cca: Option<CcaCfg>,
    pub throttling_enabled: bool,
    pub rdo_enabled: bool,
    pub fallback: Option<FallbackCfg>,
    pub fixed_payload_size: Option<u8>,
    pub ranging_phase_provider: bool,
    pub ranging_phase_accumulator: bool,
}

impl Default for ConnectionCfg<'_> {
    fn default() -> Self {
        ConnectionCfg {
            source_address: 0,
            destination_address: 0,
            max_payload_size: 32,
            queue_size: 2,
            modulation: Modulation::default(),
            fec: FecLevel::default(),
            timeslot_ids: &[],
            allocate_payload_memory: true,
            payload_region: None,
            ack_enabled: true,
            arq_enabled: false,
            arq_settings: ArqSettings::default(),
            auto_sync_enabled: true,
            cca: None,
            throttling_enabled: false,
            rdo_enabled: false,
            fallback: None,
            fixed_payload_size: None,
            ranging_phase_provider: false,
            ranging_phase_accumulator: false,
        }
    }
}

/// Snapshot returned by [`Wps::fallback_info`].
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct FallbackInfo {
    /// Margin above the noise floor for the last frame, in tenths of dB.
    pub link_margin_tenth_db: u16,
}

const fn hw_addr(network_id: u8, node_address: u8) -> u16 {
    ((network_id as u16) << 8) | node_address as u16
}

const fn network_id_from_pan(pan_id: u16) -> u8 {
    (pan_id & 0x00ff) as u8
}

/// Microseconds to PLL cycles at the 20.48 MHz chip rate.
pub fn us_to_pll_cycles(time_us: u32) -> u32 {
    let cycles = time_us as u64 * PLL_FREQ_KHZ as u64 / 1000;
    cycles.saturating_sub(1) as u32
}

fn gcd(mut a: u8, mut b: u8) -> u8 {
    while b != 0 {
        let t = b;
        b = a % b;
        a = t;
    }
    a.max(1)
}

/// Spread `active_ratio` percent of active slots quasi-uniformly over the
/// reduced pattern. Ratios are snapped to the 5 % granularity the pattern
/// storage allows.
pub(crate) fn generate_active_pattern(active_ratio: u8) -> Vec<bool, THROTTLE_GRANULARITY> {
    let ratio = (active_ratio.min(100) + 2) / 5 * 5;
    let g = gcd(ratio, 100);
    let active = (ratio / g) as usize;
    let total = (100 / g) as usize;

    let mut pattern: Vec<bool, THROTTLE_GRANULARITY> = Vec::new();
    for _ in 0..total.min(THROTTLE_GRANULARITY) {
        let _ = pattern.push(false);
    }
    for i in 0..active {
        let pos = (i * total) / active;
        if pos < pattern.len() {
            pattern[pos] = true;
        }
    }
    pattern
}

fn has_main_timeslot(timeslot_ids: &[i32]) -> bool {
    timeslot_ids.iter().any(|id| id & AUTO_TIMESLOT_FLAG == 0)
}

impl<'a, T: Transceiver, H: WpsHal> Wps<'a, T, H> {
    /// Build the stack core: schedule, channel sequence and the queues.
    /// Node identity, radios and connections are added afterwards.
    pub fn init(cfg: StackCfg<'_>, hal: H, pool: &mut MemPool<'a>) -> Result<Self, Error> {
        if cfg.channel_sequence.is_empty() {
            return Err(Error::InvalidChannelSequence);
        }

        let durations = cfg.timeslot_duration_us;
        let timeslots = pool.alloc_slice_with(durations.len(), |i| Timeslot {
            duration_pll_cycles: us_to_pll_cycles(durations[i]),
            connection_main: None,
            connection_auto_reply: None,
        })?;
        let channel_seq: &'a [u8] =
            pool.alloc_slice_with(cfg.channel_sequence.len(), |i| cfg.channel_sequence[i])?;

        let scheduler = Scheduler::new(Schedule { timeslots }, 0);
        let channel_hopping = ChannelHopping::new(
            ChannelSequence {
                channels: channel_seq,
            },
            cfg.random_channel_sequence_enabled,
            0,
        )?;
        let tdma_sync = TdmaSync::new(
            SleepLevel::Idle,
            SYNC_RX_SETUP_PLL_CYCLES,
            SYNC_FRAME_LOST_MAX_COUNT,
            crate::DEFAULT_SYNCWORD_BITS,
            crate::DEFAULT_PREAMBLE_BITS,
            SYNC_PLL_STARTUP_CYCLES,
        );
        let rdo = match cfg.rdo_rollover {
            Some(rollover) => Rdo::new(rollover, 0),
            None => Rdo::disabled(),
        };
        let mac = WpsMac::new(
            scheduler,
            channel_hopping,
            tdma_sync,
            rdo,
            0,
            0,
            Role::Coordinator,
            cfg.fast_sync_enabled,
        );

        Ok(Wps {
            hal,
            node: NodeParams::default(),
            mac,
            conns: Vec::new(),
            phys: Vec::new(),
            multi: MultiRadio::new(1),
            sync_timer: None,
            callback_queue: crate::mac::CallbackQueue::new(),
            request_queue: heapless::spsc::Queue::new(),
            channel_seq,
            random_channel_sequence_enabled: cfg.random_channel_sequence_enabled,
            rdo_rollover: cfg.rdo_rollover,
            connected: false,
            signal: crate::stack::StackSignal::None,
            current_irq_radio: 0,
            read_register_result: None,
        })
    }

    /// Node identity: role, PAN membership and addressing. Must run before
    /// any connection is created, since on-air addresses derive from it.
    pub fn node_init(&mut self, cfg: NodeCfg) -> Result<(), Error> {
        let network_id = network_id_from_pan(cfg.pan_id);
        self.node.role = cfg.role;
        self.node.pan_id = cfg.pan_id;
        self.node.local_address = hw_addr(network_id, cfg.local_address);
        self.node.coordinator_address = hw_addr(network_id, cfg.coordinator_address);
        self.node.sleep_level = cfg.sleep_level;

        self.mac.role = cfg.role;
        self.mac.local_address = self.node.local_address;
        self.mac.syncing_address = self.node.coordinator_address;
        self.mac.scheduler.set_local_address(self.node.local_address);
        Ok(())
    }

    /// Attach one radio. Call once for single-radio nodes, twice for
    /// diversity.
    pub fn node_add_radio(&mut self, transceiver: T) -> Result<(), Error> {
        self.phys
            .push(Phy::new(transceiver))
            .map_err(|_| Error::RadioNotInitialized)?;
        self.multi = MultiRadio::new(self.phys.len() as u8);
        Ok(())
    }

    /// Wire the follower-radio resynchronization timer (dual radio only).
    pub fn set_sync_timer(&mut self, timer: &'a mut dyn crate::hal::SyncTimer) {
        self.sync_timer = Some(timer);
    }

    /// Build one connection and register it on its timeslots.
    pub fn connection_init(
        &mut self,
        cfg: ConnectionCfg<'a>,
        pool: &mut MemPool<'a>,
    ) -> Result<ConnectionId, Error> {
        if cfg.arq_enabled && !cfg.ack_enabled {
            return Err(Error::AckDisabled);
        }

        let network_id = network_id_from_pan(self.node.pan_id);
        let source_address = hw_addr(network_id, cfg.source_address);
        let destination_address = hw_addr(network_id, cfg.destination_address);
        let is_tx = source_address == self.node.local_address;

        let header_cfg = HeaderCfg {
            main_connection: has_main_timeslot(cfg.timeslot_ids),
            rdo_enabled: cfg.rdo_enabled,
            ranging_phase_accumulator: cfg.ranging_phase_accumulator,
            ranging_phase_provider: cfg.ranging_phase_provider,
        };
        let protocol = LinkProtocol::new(header_cfg);
        let header_size = protocol.header_size();

        let frame_len = header_size as usize
            + cfg.max_payload_size as usize
            + crate::PAYLOAD_SIZE_BYTE_SIZE as usize;
        let queue_size = cfg.queue_size.max(1);

        // Frame storage: the pool, or a caller-supplied region sliced the
        // same way.
        let mut region: &'a mut [u8] = match cfg.payload_region {
            Some(region) if !cfg.allocate_payload_memory => {
                if region.len() < queue_size * frame_len {
                    return Err(Error::NotEnoughMemory);
                }
                region
            }
            _ => pool.alloc_bytes(queue_size * frame_len)?,
        };

        let slots = pool.alloc_slice_with(queue_size, |_| {
            let (chunk, rest) = core::mem::take(&mut region).split_at_mut(frame_len);
            region = rest;
            let frame = if is_tx {
                Frame::new_tx(chunk, header_size)
            } else {
                Frame::new_rx(chunk, header_size)
            };
            Xlayer::new(frame)
        })?;

        let beacon_buffer = pool.alloc_bytes(frame_len)?;
        let overrun_buffer = pool.alloc_bytes(frame_len)?;

        let channel_count = self
            .channel_seq
            .iter()
            .copied()
            .max()
            .map(|m| m as usize + 1)
            .unwrap_or(1);
        let radio_count = self.phys.len().max(1) as u8;
        let profile_count: u8 = if cfg.fallback.is_some() { 2 } else { 1 };

        let channel_lqi = pool.alloc_slice_with(channel_count, |_| Lqi::new())?;
        let gain_loops =
            pool.alloc_slice_with(channel_count * radio_count as usize, |_| GainLoop::new())?;
        let channel_entries = pool.alloc_slice_with(
            profile_count as usize * channel_count * radio_count as usize,
            |_| RfChannel::default(),
        )?;

        let fallback = match cfg.fallback {
            Some(fb) => {
                let thresholds = pool.alloc_slice_with(1, |_| fb.threshold)?;
                Fallback::new(thresholds)
            }
            None => Fallback::disabled(),
        };

        let arq = if cfg.arq_enabled {
            SawArq::new(
                cfg.arq_settings.time_deadline_quarter_ms,
                cfg.arq_settings.retry_count,
                self.node.local_address == destination_address,
                true,
            )
        } else {
            SawArq::disabled()
        };

        let cca = match cfg.cca {
            Some(c) => CcaSettings::new(
                c.threshold,
                c.retry_time_pll_cycles,
                crate::CCA_ON_TIME_PLL_CYCLES,
                c.try_count,
                c.fail_action,
            ),
            None => CcaSettings::disabled(),
        };

        let mut throttle = Throttle::default();
        if cfg.throttling_enabled {
            for _ in 0..THROTTLE_GRANULARITY {
                let _ = throttle.pattern.push(true);
            }
            throttle.active_ratio = 100;
        }

        let connection = pool.alloc(Connection {
            source_address,
            destination_address,
            max_payload_size: cfg.max_payload_size,
            fixed_payload: cfg.fixed_payload_size,
            ack_enabled: cfg.ack_enabled,
            auto_sync_enabled: cfg.auto_sync_enabled,
            phases_exchange: cfg.ranging_phase_provider || cfg.ranging_phase_accumulator,
            header_size,
            protocol,
            arq,
            cca,
            fallback,
            lqi: Lqi::new(),
            used_frame_lqi: Lqi::new(),
            channel_lqi,
            gain_loops,
            radio_count,
            stats: ConnStats::default(),
            throttle,
            queue: XlayerQueue::new(slots),
            beacon: Xlayer::new(Frame::new_tx(beacon_buffer, header_size)),
            overrun: Xlayer::new(Frame::new_rx(overrun_buffer, header_size)),
            channels: ChannelTable::new(channel_entries, channel_count as u8, radio_count),
            channel_count: 0,
            fallback_offsets: cfg.fallback,
            modulation: cfg.modulation,
            fec: cfg.fec,
            callbacks: Callbacks::default(),
        })?;

        let conn_id = ConnectionId(self.conns.len() as u8);
        for &slot_id in cfg.timeslot_ids {
            if slot_id & AUTO_TIMESLOT_FLAG == 0 {
                self.mac
                    .scheduler
                    .set_timeslot_main(slot_id as usize, conn_id);
            } else {
                let index = (slot_id & !AUTO_TIMESLOT_FLAG) as usize;
                self.mac.scheduler.set_timeslot_auto_reply(index, conn_id);
            }
        }

        self.conns
            .push(connection)
            .map_err(|_| Error::NotEnoughMemory)?;
        Ok(conn_id)
    }

    /// Configure the next RF channel of a connection; repeat once per
    /// channel in the hop sequence.
    pub fn connection_add_channel(
        &mut self,
        conn: ConnectionId,
        cfg: ChannelCfg,
    ) -> Result<(), Error> {
        let radio_count = self.phys.len().max(1) as u8;
        let c = &mut *self.conns[conn.index()];
        let channel_x = c.channel_count;

        let base = RfChannel {
            frequency: cfg.frequency,
            tx_pulse_count: cfg.tx_pulse_count,
            tx_pulse_width: cfg.tx_pulse_width,
            tx_gain: cfg.tx_pulse_gain,
            pulse_spacing: crate::DEFAULT_PULSE_SPACING,
            pulse_start_position: crate::DEFAULT_PULSE_START_POS,
            random_phase_enabled: true,
            integration_gain: if cfg.rx_pulse_count == 1 { 1 } else { 0 },
        };
        for radio in 0..radio_count {
            c.channels.set(0, channel_x, radio, base);
        }

        if let Some(fb) = c.fallback_offsets {
            let mut fallback_channel = base;
            fallback_channel.tx_pulse_count =
                (base.tx_pulse_count as i16 + fb.tx_pulse_count_offset as i16).clamp(0, 255) as u8;
            fallback_channel.tx_pulse_width =
                (base.tx_pulse_width as i16 + fb.tx_pulse_width_offset as i16).clamp(0, 255) as u8;
            fallback_channel.tx_gain =
                (base.tx_gain as i16 + fb.tx_pulse_gain_offset as i16).clamp(0, 255) as u8;
            for radio in 0..radio_count {
                c.channels.set(1, channel_x, radio, fallback_channel);
            }
        }

        c.channel_count = c.channel_count.saturating_add(1);
        Ok(())
    }

    pub fn set_tx_success_callback(&mut self, conn: ConnectionId, cb: &'a dyn Fn()) {
        self.conns[conn.index()].callbacks.tx_success = Some(cb);
    }

    pub fn set_tx_fail_callback(&mut self, conn: ConnectionId, cb: &'a dyn Fn()) {
        self.conns[conn.index()].callbacks.tx_fail = Some(cb);
    }

    pub fn set_tx_dropped_callback(&mut self, conn: ConnectionId, cb: &'a dyn Fn()) {
        self.conns[conn.index()].callbacks.tx_dropped = Some(cb);
    }

    pub fn set_rx_success_callback(&mut self, conn: ConnectionId, cb: &'a dyn Fn()) {
        self.conns[conn.index()].callbacks.rx_success = Some(cb);
    }

    pub fn set_event_callback(
        &mut self,
        conn: ConnectionId,
        cb: &'a dyn Fn(crate::error::Event),
    ) {
        self.conns[conn.index()].callbacks.event = Some(cb);
    }

    /// Ranging phase consumer, polled between slots.
    pub fn set_phase_interface(&mut self, sink: &'a dyn PhaseSink) {
        self.mac.phase_sink = Some(sink);
    }

    /// Finalize the configuration. Must be the last setup call.
    pub fn setup(&mut self) -> Result<(), Error> {
        if self.phys.is_empty() {
            return Err(Error::RadioNotInitialized);
        }

        let network_id = network_id_from_pan(self.node.pan_id);
        self.mac.channel_hopping = ChannelHopping::new(
            ChannelSequence {
                channels: self.channel_seq,
            },
            self.random_channel_sequence_enabled,
            network_id,
        )?;
        self.mac.tdma_sync = TdmaSync::new(
            self.node.sleep_level,
            SYNC_RX_SETUP_PLL_CYCLES,
            SYNC_FRAME_LOST_MAX_COUNT,
            self.node.syncword_bits,
            self.node.preamble_bits,
            SYNC_PLL_STARTUP_CYCLES,
        );
        self.mac.rdo = match self.rdo_rollover {
            Some(rollover) => Rdo::new(rollover, self.node.local_address as u64),
            None => Rdo::disabled(),
        };
        // Park the cursor so the first increment lands on slot 0.
        self.mac.scheduler.set_first_timeslot();
        self.mac.scheduler.enable_tx();
        Ok(())
    }

    pub fn enable_fast_sync(&mut self) {
        self.mac.fast_sync_enabled = true;
    }

    pub fn disable_fast_sync(&mut self) {
        self.mac.fast_sync_enabled = false;
    }

    // ---- runtime --------------------------------------------------------

    /// Queue one payload for transmission. The bytes are copied into the
    /// connection's frame storage.
    pub fn send(&mut self, conn: ConnectionId, payload: &[u8]) -> Result<(), Error> {
        let now = self.hal.tick_quarter_ms();
        let c = &mut *self.conns[conn.index()];
        if let Some(fixed) = c.fixed_payload {
            if payload.len() != fixed as usize {
                return Err(Error::WrongTxSize);
            }
        }
        if payload.len() > c.max_payload_size as usize {
            return Err(Error::WrongTxSize);
        }

        let Some(slot) = c.queue.get_free_slot() else {
            return Err(Error::QueueFull);
        };
        let area = slot.frame.payload_area_mut();
        if area.len() < payload.len() {
            return Err(Error::WrongTxSize);
        }
        area[..payload.len()].copy_from_slice(payload);
        slot.frame.commit_payload(payload.len());
        slot.frame.time_stamp_quarter_ms = now;
        slot.frame.retry_count = 0;
        c.queue.enqueue();
        Ok(())
    }

    /// Zero-copy variant of [`send`](Self::send): expose the next frame's
    /// payload area for in-place filling, committed with
    /// [`send_buffered`](Self::send_buffered).
    pub fn get_payload_buffer(&mut self, conn: ConnectionId) -> Result<&mut [u8], Error> {
        let c = &mut *self.conns[conn.index()];
        let max = c.max_payload_size as usize;
        let Some(slot) = c.queue.get_free_slot() else {
            return Err(Error::QueueFull);
        };
        let area = slot.frame.payload_area_mut();
        let len = area.len().min(max);
        Ok(&mut area[..len])
    }

    /// Commit `size` bytes previously written through
    /// [`get_payload_buffer`](Self::get_payload_buffer).
    pub fn send_buffered(&mut self, conn: ConnectionId, size: u8) -> Result<(), Error> {
        let now = self.hal.tick_quarter_ms();
        let c = &mut *self.conns[conn.index()];
        if let Some(fixed) = c.fixed_payload {
            if size != fixed {
                return Err(Error::WrongTxSize);
            }
        }
        if size > c.max_payload_size {
            return Err(Error::WrongTxSize);
        }
        let Some(slot) = c.queue.get_free_slot() else {
            return Err(Error::QueueFull);
        };
        slot.frame.commit_payload(size as usize);
        slot.frame.time_stamp_quarter_ms = now;
        slot.frame.retry_count = 0;
        c.queue.enqueue();
        Ok(())
    }

    /// Oldest received payload, if any. Call
    /// [`receive_complete`](Self::receive_complete) to release it.
    pub fn receive(&self, conn: ConnectionId) -> Result<&[u8], Error> {
        let c = &*self.conns[conn.index()];
        match c.queue.front_ref() {
            Some(front) => Ok(front.frame.payload()),
            None => Err(Error::QueueEmpty),
        }
    }

    pub fn receive_complete(&mut self, conn: ConnectionId) -> Result<(), Error> {
        if self.conns[conn.index()].queue.dequeue() {
            Ok(())
        } else {
            Err(Error::QueueEmpty)
        }
    }

    /// Change the duty-cycle ratio of a throttled connection. The pattern
    /// is generated here and handed to the MAC at a safe point between
    /// slots.
    pub fn set_throttling_active_ratio(
        &mut self,
        conn: ConnectionId,
        ratio_percent: u8,
    ) -> Result<(), Error> {
        if self.conns[conn.index()].throttle.pattern.is_empty() {
            return Err(Error::ThrottleNotInitialized);
        }
        let pattern = generate_active_pattern(ratio_percent);
        self.request_queue
            .enqueue(Request::ScheduleRatio {
                conn,
                active_ratio: ratio_percent,
                pattern,
            })
            .map_err(|_| Error::RequestQueueFull)
    }

    pub fn request_write_register(&mut self, register: u8, data: u8) -> Result<(), Error> {
        self.request_queue
            .enqueue(Request::WriteRegister { register, data })
            .map_err(|_| Error::WriteRequestQueueFull)
    }

    pub fn request_read_register(&mut self, register: u8) -> Result<(), Error> {
        self.request_queue
            .enqueue(Request::ReadRegister { register })
            .map_err(|_| Error::ReadRequestQueueFull)
    }

    pub fn fallback_info(&self, conn: ConnectionId) -> FallbackInfo {
        FallbackInfo {
            link_margin_tenth_db: self.conns[conn.index()].lqi().inst_margin_tenth_db(),
        }
    }

    /// Read access to a connection's statistics and link state.
    pub fn connection(&self, conn: ConnectionId) -> &Connection<'a> {
        &*self.conns[conn.index()]
    }

    pub fn reset_connection_stats(&mut self, conn: ConnectionId) {
        self.conns[conn.index()].reset_stats();
    }

    pub fn is_slave_synced(&self) -> bool {
        self.mac.tdma_sync.is_slave_synced()
    }

    pub fn slave_sync_state(&self) -> crate::link::tdma_sync::SlaveSyncState {
        self.mac.tdma_sync.slave_state()
    }

    pub fn frame_lost_count(&self) -> u16 {
        self.mac.tdma_sync.frame_lost_count()
    }
}
