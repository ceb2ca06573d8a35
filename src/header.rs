//! Per-slot control header layout.
//!
//! The header is the concatenation of the sub-protocols enabled on a
//! connection, in a fixed order. Encoding prepends the fields in front of
//! the payload window; decoding walks the same list forward. The field
//! values live in the MAC (scheduler cursor, ARQ bit, hop index, RDO
//! offset, ranging phases), so the byte-level read/write is driven from
//! there; this module owns the layout and the wire bitfields.
//!
//! On-air image of a main slot:
//!
//! ```norust
//!  1            | 1        | 2    | 1           | 5
//!  id+SAW       | hop idx  | RDO  | phase count | phases
//!  (always)     | (always) | (opt)| (opt)       | (opt)
//! ```
//!
//! An auto-reply slot omits the two main-slot fields and starts with its
//! own optional set.

use heapless::Vec;
use modular_bitfield::prelude::*;

/// Most sub-protocols a single connection can stack.
pub const MAX_HEADER_FIELDS: usize = 5;

/// Wire size of a header with every sub-protocol enabled.
pub const MAX_HEADER_SIZE: usize = 10;

/// First header byte of a main slot: low 7 bits carry the next timeslot
/// index, the top bit is the stop-and-wait sequence number.
#[bitfield]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeslotIdSaw {
    pub timeslot_id: B7,
    pub saw_seq: bool,
}

/// One enabled sub-protocol.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderField {
    /// Timeslot id and SAW bit, main slots only.
    TimeslotIdSaw,
    /// Current channel-hop sequence index, main slots only.
    ChannelIndex,
    /// Random data-rate offset, little endian.
    Rdo,
    /// Ranging phase counter.
    RangingPhaseCount,
    /// Ranging phase counter plus four phase bytes.
    RangingPhases,
}

impl HeaderField {
    pub const fn size(self) -> u8 {
        match self {
            HeaderField::TimeslotIdSaw => 1,
            HeaderField::ChannelIndex => 1,
            HeaderField::Rdo => 2,
            HeaderField::RangingPhaseCount => 1,
            HeaderField::RangingPhases => 5,
        }
    }
}

/// Which optional fields a connection carries.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderCfg {
    /// The connection owns at least one main timeslot.
    pub main_connection: bool,
    pub rdo_enabled: bool,
    /// Accumulates remote phase counts (1 byte on air).
    pub ranging_phase_accumulator: bool,
    /// Provides local phases to the peer (5 bytes on air).
    pub ranging_phase_provider: bool,
}

/// Ordered sub-protocol list of one connection.
#[derive(Debug, Default)]
pub struct LinkProtocol {
    fields: Vec<HeaderField, MAX_HEADER_FIELDS>,
}

impl LinkProtocol {
    pub fn new(cfg: HeaderCfg) -> Self {
        let mut fields: Vec<HeaderField, MAX_HEADER_FIELDS> = Vec::new();
        if cfg.main_connection {
            let _ = fields.push(HeaderField::TimeslotIdSaw);
            let _ = fields.push(HeaderField::ChannelIndex);
        }
        if cfg.rdo_enabled {
            let _ = fields.push(HeaderField::Rdo);
        }
        if cfg.ranging_phase_accumulator {
            let _ = fields.push(HeaderField::RangingPhaseCount);
        }
        if cfg.ranging_phase_provider {
            let _ = fields.push(HeaderField::RangingPhases);
        }
        LinkProtocol { fields }
    }

    pub fn header_size(&self) -> u8 {
        self.fields.iter().map(|f| f.size()).sum()
    }

    pub fn fields(&self) -> &[HeaderField] {
        &self.fields
    }
}

/// Ranging phase snapshot exchanged in the header.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhaseInfo {
    pub phase1: u8,
    pub phase2: u8,
    pub phase3: u8,
    pub phase4: u8,
    pub rx_waited0: u8,
    pub rx_waited1: u8,
}

/// Sink for accumulated phase pairs, polled between slots.
pub trait PhaseSink {
    fn is_busy(&self) -> bool;
    fn supply(&self, local: &PhaseInfo, remote: &PhaseInfo);
}

/// Local/remote phase bookkeeping. The counters pair a local snapshot with
/// the remote one produced one slot later; a pair is only forwarded when
/// the counts line up.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseData {
    pub last_local_phases_info: PhaseInfo,
    pub local_phases_info: PhaseInfo,
    pub remote_phases_info: PhaseInfo,
    pub local_phases_count: u8,
    pub remote_phases_count: u8,
}

impl PhaseData {
    /// Remote count must trail the local one by exactly one slot.
    pub fn is_valid(&self) -> bool {
        self.remote_phases_count.wrapping_add(1) == self.local_phases_count
    }

    /// Snapshot the local phases together with the observed RX wait and
    /// advance the local counter.
    pub fn update(&mut self, rx_wait_time: u16) {
        self.last_local_phases_info = self.local_phases_info;
        self.last_local_phases_info.rx_waited0 = (rx_wait_time & 0x00ff) as u8;
        self.last_local_phases_info.rx_waited1 = ((rx_wait_time & 0x7f00) >> 8) as u8;
        self.local_phases_count = self.local_phases_count.wrapping_add(1);
    }
}
