//! UWB TDMA link layer.
//!
//! Drives a short-range ultra-wideband transceiver as a superframe of
//! microsecond-scale timeslots with synchronous frequency hopping. On top
//! of the timeslot layer sit independent logical connections, each a
//! one-way byte pipe carrying frames up to 255 bytes with optional
//! stop-and-wait ARQ, clear channel assessment and payload-size power
//! fallback.
//!
//! Supports `no_std`.
//!
//! Three execution contexts share the stack on a single core:
//!  - the radio IRQ context runs the MAC, one pass per radio event;
//!  - a lower-priority software interrupt drains the user callback queue;
//!  - the application context sends, receives and issues configuration
//!    requests through bounded single-producer queues.
#![no_std]

#[cfg(not(feature = "defmt"))]
macro_rules! trace {
    ($s:literal $(, $x:expr)* $(,)?) => {
        {
            let _ = ($( & $x ),*);
        }
    };
}
#[cfg(not(feature = "defmt"))]
pub(crate) use trace;
#[cfg(feature = "defmt")]
pub(crate) use defmt::trace;

pub mod api;
pub mod connection;
pub mod error;
pub mod hal;
pub mod header;
pub mod link;
pub mod mac;
pub mod phy;
pub mod pool;
pub mod stack;
pub mod xlayer;

pub use api::{
    auto_timeslot, us_to_pll_cycles, ArqSettings, CcaCfg, ChannelCfg, ConnectionCfg, FallbackCfg,
    FallbackInfo, NodeCfg, StackCfg,
};
pub use connection::{ConnStats, Connection, RfChannel};
pub use error::{Error, Event};
pub use hal::{SyncTimer, WpsHal};
pub use link::cca::CcaFailAction;
pub use link::tdma_sync::SlaveSyncState;
pub use phy::{PhyStep, SlotDir, SlotIntent, SlotOutcome, Transceiver};
pub use pool::MemPool;
pub use stack::Wps;

/// Largest frame the radio FIFO can carry.
pub const RADIO_MAX_PACKET_SIZE: usize = 255;

/// Size of the length byte the radio loads in front of a variable-size
/// payload.
pub const PAYLOAD_SIZE_BYTE_SIZE: u8 = 1;

/// Throttle pattern storage; ratios resolve at 100 / this granularity.
pub const THROTTLE_GRANULARITY: usize = 20;

/// PLL frequency at the 20.48 MHz chip rate.
pub const PLL_FREQ_KHZ: u32 = 20_480;

/// One CCA sensing window, in PLL cycles.
pub const CCA_ON_TIME_PLL_CYCLES: u16 = 16;

/// Receiver chain setup time, in PLL cycles.
pub const SYNC_RX_SETUP_PLL_CYCLES: u16 = 147;

/// Crystal cycles the PLL needs out of deep sleep.
pub const SYNC_PLL_STARTUP_CYCLES: u8 = 0x60;

/// Consecutive misses before a slave drops back to syncing.
pub const SYNC_FRAME_LOST_MAX_COUNT: u16 = 100;

pub const DEFAULT_PREAMBLE_BITS: u16 = 94;
pub const DEFAULT_SYNCWORD_BITS: u16 = 32;
pub const DEFAULT_CRC_POLYNOMIAL: u16 = 0xBAAD;
pub const DEFAULT_RDO_ROLLOVER: u16 = 15;
pub const DEFAULT_PULSE_SPACING: u8 = 1;
pub const DEFAULT_PULSE_START_POS: u8 = 2;

/// Who owns the network clock.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Dictates the schedule; never adjusts its own timer.
    Coordinator,
    /// Continuously nudges its sleep timer toward the coordinator's.
    Node,
}

/// How deep the radio sleeps between slots. Deeper levels trade wake-up
/// accuracy for power.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepLevel {
    Idle,
    Shallow,
    Deep,
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Modulation {
    #[default]
    Ook,
    Ppm,
}

/// Forward error correction strength.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FecLevel {
    #[default]
    Lvl0,
    Lvl1,
    Lvl2,
    Lvl3,
}

/// Radio-level result of one frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Transmitted and acknowledged.
    SentAck,
    /// Transmitted, acknowledgement missing.
    SentAckLost,
    /// Not transmitted (CCA abort).
    Wait,
    Received,
    /// Address or integrity rejection.
    Rejected,
    Lost,
}

/// Handle to a connection created by the factory.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionId(pub(crate) u8);

impl ConnectionId {
    /// Build a handle from its raw index. Only ids previously returned by
    /// `connection_init` resolve to a live connection.
    pub const fn from_raw(raw: u8) -> Self {
        ConnectionId(raw)
    }

    pub const fn raw(self) -> u8 {
        self.0
    }

    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}
