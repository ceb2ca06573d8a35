//! Random data-rate offset.
//!
//! A small per-slot jitter added to the sleep budget so two networks on the
//! same schedule do not collide in lockstep forever. The transmitter drives
//! the sequence and publishes the value it used in each frame header; the
//! receiver adopts the successor of whatever it last heard, keeping both
//! ends on the same jitter for the slot that follows.

use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

#[derive(Debug)]
pub struct Rdo {
    enabled: bool,
    offset: u16,
    rollover: u16,
}

impl Rdo {
    /// `seed` randomizes the transmitter's starting point; the receiver
    /// resynchronizes from the first header it decodes.
    pub fn new(rollover: u16, seed: u64) -> Self {
        let rollover = rollover.max(1);
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        Rdo {
            enabled: true,
            offset: (rng.next_u32() % rollover as u32) as u16,
            rollover,
        }
    }

    pub fn disabled() -> Self {
        Rdo {
            enabled: false,
            offset: 0,
            rollover: 1,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Offset applied to the upcoming sleep period, in PLL cycles.
    pub fn offset(&self) -> u16 {
        if self.enabled {
            self.offset
        } else {
            0
        }
    }

    /// Step to the next offset once the current one went on air.
    pub fn advance(&mut self) {
        if self.enabled {
            self.offset = (self.offset + 1) % self.rollover;
        }
    }

    /// Receiver side: the header carried the transmitter's offset for this
    /// slot; line up on its successor.
    pub fn set_received(&mut self, offset: u16) {
        if self.enabled {
            self.offset = offset.wrapping_add(1) % self.rollover;
        }
    }
}
