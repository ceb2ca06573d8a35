//! Rolling link-quality counters.
//!
//! One block per connection plus one per channel, updated after every slot
//! from the frame outcome and the raw signal/noise codes the radio
//! reported. Averages are running sums; the instantaneous margin uses the
//! last sample only.

use crate::link::gain::normalized_gain_tenth_db;
use crate::FrameOutcome;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, Default)]
pub struct Lqi {
    sent_count: u32,
    ack_count: u32,
    nack_count: u32,
    received_count: u32,
    rejected_count: u32,
    lost_count: u32,
    rssi_total_tenth_db: u64,
    rnsi_total_tenth_db: u64,
    sample_count: u32,
    last_rssi_tenth_db: u16,
    last_rnsi_tenth_db: u16,
}

impl Lqi {
    pub fn new() -> Self {
        Lqi::default()
    }

    pub fn update(&mut self, gain_index: u8, outcome: FrameOutcome, rssi_raw: u8, rnsi_raw: u8) {
        match outcome {
            FrameOutcome::SentAck => {
                self.sent_count += 1;
                self.ack_count += 1;
            }
            FrameOutcome::SentAckLost => {
                self.sent_count += 1;
                self.nack_count += 1;
            }
            FrameOutcome::Wait => {}
            FrameOutcome::Received => self.received_count += 1,
            FrameOutcome::Rejected => self.rejected_count += 1,
            FrameOutcome::Lost => self.lost_count += 1,
        }

        // Signal measurements are only meaningful when something was heard.
        if matches!(outcome, FrameOutcome::Received | FrameOutcome::SentAck) {
            self.last_rssi_tenth_db = normalized_gain_tenth_db(gain_index, rssi_raw);
            self.last_rnsi_tenth_db = normalized_gain_tenth_db(gain_index, rnsi_raw);
            self.rssi_total_tenth_db += self.last_rssi_tenth_db as u64;
            self.rnsi_total_tenth_db += self.last_rnsi_tenth_db as u64;
            self.sample_count += 1;
        }
    }

    pub fn sent_count(&self) -> u32 {
        self.sent_count
    }

    pub fn ack_count(&self) -> u32 {
        self.ack_count
    }

    pub fn nack_count(&self) -> u32 {
        self.nack_count
    }

    pub fn received_count(&self) -> u32 {
        self.received_count
    }

    pub fn rejected_count(&self) -> u32 {
        self.rejected_count
    }

    pub fn lost_count(&self) -> u32 {
        self.lost_count
    }

    pub fn avg_rssi_tenth_db(&self) -> u16 {
        if self.sample_count == 0 {
            return 0;
        }
        (self.rssi_total_tenth_db / self.sample_count as u64) as u16
    }

    pub fn avg_rnsi_tenth_db(&self) -> u16 {
        if self.sample_count == 0 {
            return 0;
        }
        (self.rnsi_total_tenth_db / self.sample_count as u64) as u16
    }

    pub fn last_rssi_tenth_db(&self) -> u16 {
        self.last_rssi_tenth_db
    }

    /// Instantaneous link margin: how far the last frame sat above the
    /// noise floor, in tenths of dB.
    pub fn inst_margin_tenth_db(&self) -> u16 {
        self.last_rssi_tenth_db.saturating_sub(self.last_rnsi_tenth_db)
    }

    pub fn reset(&mut self) {
        *self = Lqi::default();
    }
}
