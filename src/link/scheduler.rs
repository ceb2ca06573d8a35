//! Superframe walker.
//!
//! The schedule is a circular array of timeslots. Advancing the cursor
//! accumulates the departed slot's duration into the sleep budget and keeps
//! walking while the next slot is empty, so one increment can swallow any
//! number of pure sleep periods.

use crate::ConnectionId;

/// One superframe entry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Timeslot {
    pub duration_pll_cycles: u32,
    pub connection_main: Option<ConnectionId>,
    pub connection_auto_reply: Option<ConnectionId>,
}

/// Circular timeslot sequence, fixed at setup.
#[derive(Debug)]
pub struct Schedule<'a> {
    pub timeslots: &'a mut [Timeslot],
}

impl Schedule<'_> {
    pub fn size(&self) -> usize {
        self.timeslots.len()
    }
}

#[derive(Debug)]
pub struct Scheduler<'a> {
    schedule: Schedule<'a>,
    current_timeslot_index: u8,
    sleep_cycles: u32,
    local_address: u16,
    tx_disabled: bool,
    timeslot_mismatch: bool,
}

/// Decides whether a slot is skipped as a pure sleep period: nothing is
/// scheduled on it, or it is our own TX slot while TX is disabled.
fn timeslot_is_empty(slot: &Timeslot, local_address: u16, tx_disabled: bool, source_of: impl Fn(ConnectionId) -> u16) -> bool {
    match slot.connection_main {
        None => true,
        Some(conn) => tx_disabled && source_of(conn) == local_address,
    }
}

impl<'a> Scheduler<'a> {
    pub fn new(schedule: Schedule<'a>, local_address: u16) -> Self {
        Scheduler {
            schedule,
            current_timeslot_index: 0,
            sleep_cycles: 0,
            local_address,
            tx_disabled: false,
            timeslot_mismatch: false,
        }
    }

    /// Advance the cursor, accumulating the departed slot and every skipped
    /// empty slot into the sleep budget. Returns the number of increments,
    /// which the channel hop sequence must mirror.
    ///
    /// `source_of` resolves a connection id to its source address so the
    /// "own TX slot while TX disabled" rule can be applied without the
    /// scheduler borrowing the connection table.
    pub fn increment_timeslot(&mut self, source_of: impl Fn(ConnectionId) -> u16) -> u8 {
        let size = self.schedule.size();
        self.timeslot_mismatch = false;
        if size == 0 {
            return 0;
        }

        let mut i = self.current_timeslot_index as usize;
        let mut inc_count = 0u8;
        loop {
            self.sleep_cycles = self
                .sleep_cycles
                .wrapping_add(self.schedule.timeslots[i].duration_pll_cycles);
            i = (i + 1) % size;
            inc_count = inc_count.wrapping_add(1);
            let slot = &self.schedule.timeslots[i];
            if !timeslot_is_empty(slot, self.local_address, self.tx_disabled, &source_of) {
                break;
            }
            // A fully empty schedule would never land anywhere; give up
            // after one whole wrap.
            if inc_count as usize > size {
                break;
            }
        }
        self.current_timeslot_index = i as u8;
        inc_count
    }

    /// Park the cursor on the last slot so the first forward increment
    /// lands on slot 0.
    pub fn set_first_timeslot(&mut self) {
        if self.schedule.size() > 1 {
            self.current_timeslot_index = (self.schedule.size() - 1) as u8;
        } else {
            self.current_timeslot_index = 0;
        }
    }

    pub fn set_timeslot_index(&mut self, index: u8) {
        if (index as usize) < self.schedule.size() {
            self.current_timeslot_index = index;
        }
    }

    pub fn current_timeslot_index(&self) -> u8 {
        self.current_timeslot_index
    }

    pub fn current_timeslot(&self) -> Timeslot {
        self.schedule.timeslots[self.current_timeslot_index as usize]
    }

    pub fn total_timeslot_count(&self) -> usize {
        self.schedule.size()
    }

    pub fn sleep_cycles(&self) -> u32 {
        self.sleep_cycles
    }

    pub fn reset_sleep_cycles(&mut self) {
        self.sleep_cycles = 0;
    }

    pub fn enable_tx(&mut self) {
        self.tx_disabled = false;
    }

    pub fn disable_tx(&mut self) {
        self.tx_disabled = true;
    }

    /// Wire a connection as the main user of a slot (setup time only).
    pub fn set_timeslot_main(&mut self, index: usize, conn: ConnectionId) {
        if index < self.schedule.size() {
            self.schedule.timeslots[index].connection_main = Some(conn);
        }
    }

    /// Wire a connection as the auto-reply of a slot (setup time only).
    pub fn set_timeslot_auto_reply(&mut self, index: usize, conn: ConnectionId) {
        if index < self.schedule.size() {
            self.schedule.timeslots[index].connection_auto_reply = Some(conn);
        }
    }

    pub fn set_local_address(&mut self, local_address: u16) {
        self.local_address = local_address;
    }

    pub fn set_mismatch(&mut self) {
        self.timeslot_mismatch = true;
    }

    pub fn mismatch(&self) -> bool {
        self.timeslot_mismatch
    }
}
