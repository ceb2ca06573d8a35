//! Connection: a unidirectional byte pipe between two node addresses.
//!
//! All topology (addresses, timeslots, queue and buffer sizes, enabled
//! features) is frozen when the connection is built; only statistics and
//! link-tracking state evolve at runtime. Everything a connection owns is
//! carved from the memory pool, so the whole graph lives exactly as long as
//! the pool region.

use heapless::Vec;

use crate::error::Event;
use crate::header::LinkProtocol;
use crate::link::cca::CcaSettings;
use crate::link::fallback::Fallback;
use crate::link::gain::GainLoop;
use crate::link::lqi::Lqi;
use crate::link::saw_arq::SawArq;
use crate::xlayer::{Xlayer, XlayerQueue};
use crate::{FecLevel, Modulation, THROTTLE_GRANULARITY};

/// RF profile of one channel: frequency plus the pulse shape driving the
/// transmit power.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default)]
pub struct RfChannel {
    pub frequency: u16,
    pub tx_pulse_count: u8,
    pub tx_pulse_width: u8,
    pub tx_gain: u8,
    pub pulse_spacing: u8,
    pub pulse_start_position: u8,
    pub random_phase_enabled: bool,
    pub integration_gain: u8,
}

/// Channel configurations indexed by power profile, channel id and radio.
#[derive(Debug)]
pub struct ChannelTable<'a> {
    entries: &'a mut [RfChannel],
    channels: u8,
    radios: u8,
}

impl<'a> ChannelTable<'a> {
    /// `entries` must hold `profiles * channels * radios` elements.
    pub fn new(entries: &'a mut [RfChannel], channels: u8, radios: u8) -> Self {
        ChannelTable {
            entries,
            channels,
            radios,
        }
    }

    fn index(&self, profile: u8, channel: u8, radio: u8) -> usize {
        (profile as usize * self.channels as usize + channel as usize) * self.radios as usize
            + radio as usize
    }

    pub fn get(&self, profile: u8, channel: u8, radio: u8) -> RfChannel {
        let idx = self.index(profile, channel, radio);
        if idx < self.entries.len() {
            self.entries[idx]
        } else {
            RfChannel::default()
        }
    }

    pub fn set(&mut self, profile: u8, channel: u8, radio: u8, value: RfChannel) {
        let idx = self.index(profile, channel, radio);
        if idx < self.entries.len() {
            self.entries[idx] = value;
        }
    }
}

/// Per-connection transfer counters, written by the MAC and read by the
/// application.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default)]
pub struct ConnStats {
    pub tx_success: u32,
    pub tx_byte_sent: u32,
    pub tx_drop: u32,
    pub tx_fail: u32,
    pub rx_received: u32,
    pub rx_byte_received: u32,
    pub rx_overrun: u32,
    pub cca_pass: u32,
    pub cca_fail: u32,
}

/// Duty-cycle pattern; an empty pattern means the connection never
/// throttles.
#[derive(Debug, Default)]
pub struct Throttle {
    pub pattern: Vec<bool, THROTTLE_GRANULARITY>,
    pub pattern_count: u8,
    pub active_ratio: u8,
}

/// User callbacks, dispatched from the callback context.
#[derive(Default)]
pub struct Callbacks<'a> {
    pub tx_success: Option<&'a dyn Fn()>,
    pub tx_fail: Option<&'a dyn Fn()>,
    pub tx_dropped: Option<&'a dyn Fn()>,
    pub rx_success: Option<&'a dyn Fn()>,
    pub event: Option<&'a dyn Fn(Event)>,
}

pub struct Connection<'a> {
    pub(crate) source_address: u16,
    pub(crate) destination_address: u16,
    pub(crate) max_payload_size: u8,
    pub(crate) fixed_payload: Option<u8>,
    pub(crate) ack_enabled: bool,
    pub(crate) auto_sync_enabled: bool,
    pub(crate) phases_exchange: bool,
    pub(crate) header_size: u8,
    pub(crate) protocol: LinkProtocol,
    pub(crate) arq: SawArq,
    pub(crate) cca: CcaSettings,
    pub(crate) fallback: Fallback<'a>,
    pub(crate) lqi: Lqi,
    pub(crate) used_frame_lqi: Lqi,
    pub(crate) channel_lqi: &'a mut [Lqi],
    pub(crate) gain_loops: &'a mut [GainLoop],
    pub(crate) radio_count: u8,
    pub(crate) stats: ConnStats,
    pub(crate) throttle: Throttle,
    pub(crate) queue: XlayerQueue<'a>,
    /// Reserved frame transmitted when the application queue is empty;
    /// carries a bare header when auto-sync keeps the peer locked.
    pub(crate) beacon: Xlayer<'a>,
    /// Scratch frame receiving into when the application queue is full.
    pub(crate) overrun: Xlayer<'a>,
    pub(crate) channels: ChannelTable<'a>,
    /// Channels configured so far through `connection_add_channel`.
    pub(crate) channel_count: u8,
    /// Signed power deltas applied to the fallback profile.
    pub(crate) fallback_offsets: Option<crate::api::FallbackCfg>,
    pub(crate) modulation: Modulation,
    pub(crate) fec: FecLevel,
    pub(crate) callbacks: Callbacks<'a>,
}

impl<'a> Connection<'a> {
    pub fn source_address(&self) -> u16 {
        self.source_address
    }

    pub fn destination_address(&self) -> u16 {
        self.destination_address
    }

    pub fn stats(&self) -> &ConnStats {
        &self.stats
    }

    pub fn lqi(&self) -> &Lqi {
        &self.lqi
    }

    pub fn used_frame_lqi(&self) -> &Lqi {
        &self.used_frame_lqi
    }

    pub fn channel_lqi(&self, channel: u8) -> Option<&Lqi> {
        self.channel_lqi.get(channel as usize)
    }

    pub fn arq(&self) -> &SawArq {
        &self.arq
    }

    pub(crate) fn gain_loop_mut(&mut self, channel: u8, radio: u8) -> &mut GainLoop {
        let idx = channel as usize * self.radio_count as usize + radio as usize;
        let last = self.gain_loops.len() - 1;
        &mut self.gain_loops[idx.min(last)]
    }

    pub(crate) fn gain_loop(&self, channel: u8, radio: u8) -> &GainLoop {
        let idx = channel as usize * self.radio_count as usize + radio as usize;
        let last = self.gain_loops.len() - 1;
        &self.gain_loops[idx.min(last)]
    }

    pub fn reset_stats(&mut self) {
        self.stats = ConnStats::default();
        self.lqi.reset();
        self.used_frame_lqi.reset();
        for lqi in self.channel_lqi.iter_mut() {
            lqi.reset();
        }
        self.arq.reset_stats();
    }
}
