//! Stop-and-wait ARQ.
//!
//! One bit of sequence number per connection. The sender flips its bit on
//! every acknowledged transmission; the receiver compares the received bit
//! against the last one it accepted, an equal bit marks a retransmission of
//! a frame it already delivered.

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug)]
pub struct SawArq {
    ttl_quarter_ms: u16,
    ttl_retries: u16,
    seq_num: bool,
    duplicate: bool,
    duplicate_count: u32,
    retry_count: u32,
    enabled: bool,
}

impl SawArq {
    /// `init_board_seq` seeds the sequence bit from which side of the link
    /// this node is on, so the very first frame is never mistaken for a
    /// duplicate.
    pub fn new(ttl_quarter_ms: u16, ttl_retries: u16, init_board_seq: bool, enabled: bool) -> Self {
        SawArq {
            ttl_quarter_ms,
            ttl_retries,
            seq_num: init_board_seq,
            duplicate: false,
            duplicate_count: 0,
            retry_count: 0,
            enabled,
        }
    }

    pub fn disabled() -> Self {
        SawArq::new(0, 0, false, false)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Whether a queued frame has outlived its time or retry budget.
    ///
    /// A zero budget disables the corresponding deadline. Retries that do
    /// not time out are counted as link retransmissions.
    pub fn is_frame_timeout(
        &mut self,
        time_stamp_quarter_ms: u64,
        retry_count: u16,
        now_quarter_ms: u64,
    ) -> bool {
        if !self.enabled {
            return true;
        }

        let delta = now_quarter_ms.wrapping_sub(time_stamp_quarter_ms);
        let time_timeout = self.ttl_quarter_ms != 0 && delta >= self.ttl_quarter_ms as u64;
        let retries_timeout = self.ttl_retries != 0 && retry_count >= self.ttl_retries;
        let timeout = time_timeout || retries_timeout;

        if retry_count > 0 && !timeout {
            self.retry_count += 1;
        }

        timeout
    }

    pub fn seq_num(&self) -> bool {
        self.seq_num
    }

    /// Sender side: a positive acknowledgement moves the window.
    pub fn increment_seq_num(&mut self) {
        self.seq_num = !self.seq_num;
    }

    /// Receiver side: record the received bit and remember whether it
    /// repeats the previous one.
    pub fn update_rx_seq_num(&mut self, seq_num: bool) {
        self.duplicate = seq_num == self.seq_num;
        self.seq_num = seq_num;
    }

    /// Receiver side: is the frame just recorded a duplicate? Counts it.
    pub fn is_rx_frame_duplicate(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        if self.duplicate {
            self.duplicate_count += 1;
        }
        self.duplicate
    }

    pub fn duplicate_count(&self) -> u32 {
        self.duplicate_count
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn reset_stats(&mut self) {
        self.retry_count = 0;
        self.duplicate_count = 0;
    }
}
