//! Channel hopping sequencer.
//!
//! The hop index walks the configured channel sequence in lockstep with the
//! superframe. When concurrent networks share the band, the set of unique
//! channels is permuted with a shuffle keyed on the network id, so two
//! co-located networks visit the same channels in different orders while
//! both ends of one link derive the identical permutation.

use heapless::Vec;
use rand_chacha::rand_core::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::error::Error;

/// Highest channel id usable in a sequence.
pub const MAX_CHANNEL_COUNT: usize = 16;

/// Ordered channel id sequence, possibly with repetition.
#[derive(Debug)]
pub struct ChannelSequence<'a> {
    pub channels: &'a [u8],
}

#[derive(Debug)]
pub struct ChannelHopping<'a> {
    sequence: ChannelSequence<'a>,
    hop_seq_index: u8,
    /// Maps a sequence channel id to its permuted replacement.
    lookup: [u8; MAX_CHANNEL_COUNT],
}

impl<'a> ChannelHopping<'a> {
    pub fn new(
        sequence: ChannelSequence<'a>,
        random_sequence_enabled: bool,
        network_id: u8,
    ) -> Result<Self, Error> {
        if sequence.channels.is_empty() {
            return Err(Error::InvalidChannelSequence);
        }

        let mut unique: Vec<u8, MAX_CHANNEL_COUNT> = Vec::new();
        for &ch in sequence.channels {
            if ch as usize >= MAX_CHANNEL_COUNT {
                return Err(Error::InvalidChannelSequence);
            }
            if !unique.contains(&ch) && unique.push(ch).is_err() {
                return Err(Error::InvalidChannelSequence);
            }
        }

        let mut shuffled: Vec<u8, MAX_CHANNEL_COUNT> = unique.clone();
        if random_sequence_enabled {
            // Fisher-Yates keyed on the network id; both ends of the link
            // seed the same stream and land on the same permutation.
            let mut rng = ChaCha8Rng::seed_from_u64(network_id as u64);
            for i in (1..shuffled.len()).rev() {
                let j = (rng.next_u32() as usize) % (i + 1);
                shuffled.swap(i, j);
            }
        }

        let mut lookup = [0u8; MAX_CHANNEL_COUNT];
        for (i, slot) in lookup.iter_mut().enumerate() {
            *slot = i as u8;
        }
        for (from, to) in unique.iter().zip(shuffled.iter()) {
            lookup[*from as usize] = *to;
        }

        Ok(ChannelHopping {
            sequence,
            hop_seq_index: 0,
            lookup,
        })
    }

    pub fn increment_sequence(&mut self, increment: u8) {
        let size = self.sequence.channels.len();
        self.hop_seq_index = ((self.hop_seq_index as usize + increment as usize) % size) as u8;
    }

    pub fn set_sequence_index(&mut self, index: u8) {
        if (index as usize) < self.sequence.channels.len() {
            self.hop_seq_index = index;
        }
    }

    pub fn sequence_index(&self) -> u8 {
        self.hop_seq_index
    }

    /// Channel id for the current hop, after permutation.
    pub fn channel(&self) -> u8 {
        self.lookup[self.sequence.channels[self.hop_seq_index as usize] as usize]
    }

    pub fn sequence_size(&self) -> usize {
        self.sequence.channels.len()
    }

    /// The permuted image of the unique channel set, for inspection.
    pub fn lookup_table(&self) -> &[u8; MAX_CHANNEL_COUNT] {
        &self.lookup
    }
}
