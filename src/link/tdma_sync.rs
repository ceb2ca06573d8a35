//! TDMA synchronization.
//!
//! The coordinator's clock is the network clock. A node measures how long
//! its receiver waited before each syncword and turns the deviation from
//! the expected wait into a signed correction applied to the next sleep
//! period. CCA retries on the transmitter delay the frame by whole retry
//! periods, so the observed wait is first bracketed to the nearest retry
//! multiple before the fine correction is derived.

use crate::link::cca::CcaSettings;
use crate::{FrameOutcome, SleepLevel};

/// PLL cycles per sleep-clock cycle (20.48 MHz PLL over the 32.768 kHz
/// sleep oscillator).
pub const PLL_RATIO: u32 = 625;

/// Consecutive CCA-delayed frames tolerated before falling back to a coarse
/// resync.
const CCA_THRESHOLD_WATCHDOG_COUNT: u32 = 3000;

/// Backward sweep step applied per missed frame while hunting for the
/// coordinator.
const UNSYNC_SWEEP_PLL_CYCLES: i32 = 96;

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlaveSyncState {
    Syncing,
    Synced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameDir {
    Tx,
    Rx,
}

#[derive(Debug)]
pub struct TdmaSync {
    sleep_level: SleepLevel,
    setup_time_pll_cycles: u16,
    timeout_pll_cycles: u32,
    base_target_rx_waited_pll_cycles: u16,
    sleep_offset_pll_cycles: u32,
    frame_lost_max_count: u16,
    frame_lost_count: u16,
    slave_state: SlaveSyncState,
    cca_unsync_watchdog_count: u32,
    previous_frame_dir: FrameDir,
    sync_slave_offset: i32,
    sleep_cycles_value: u32,
    timeout_value: u32,
    pwr_up_value: u16,
}

impl TdmaSync {
    pub fn new(
        sleep_level: SleepLevel,
        setup_time_pll_cycles: u16,
        frame_lost_max_count: u16,
        syncword_bits: u16,
        preamble_bits: u16,
        pll_startup_xtal_cycles: u8,
    ) -> Self {
        let air_prefix = preamble_bits as u32 + syncword_bits as u32;
        let sleep_offset_pll_cycles = match sleep_level {
            SleepLevel::Idle => 1,
            SleepLevel::Shallow => PLL_RATIO,
            SleepLevel::Deep => PLL_RATIO + (pll_startup_xtal_cycles as u32 + 2) * PLL_RATIO,
        };
        TdmaSync {
            sleep_level,
            setup_time_pll_cycles,
            timeout_pll_cycles: 2 * setup_time_pll_cycles as u32 + air_prefix,
            base_target_rx_waited_pll_cycles: setup_time_pll_cycles
                + preamble_bits
                + syncword_bits,
            sleep_offset_pll_cycles,
            frame_lost_max_count,
            frame_lost_count: 0,
            slave_state: SlaveSyncState::Syncing,
            cca_unsync_watchdog_count: 0,
            previous_frame_dir: FrameDir::Rx,
            sync_slave_offset: 0,
            sleep_cycles_value: 0,
            timeout_value: 0,
            pwr_up_value: 0,
        }
    }

    /// Back to the unsynchronized state, as after `connect()`.
    pub fn reset(&mut self) {
        self.frame_lost_count = 0;
        self.sync_slave_offset = 0;
        self.slave_state = SlaveSyncState::Syncing;
    }

    /// Budget the upcoming TX slot. A TX immediately after an RX slot keeps
    /// the receiver's earlier wake-up, so the slot stretches by one setup
    /// time.
    pub fn update_tx(&mut self, duration_pll_cycles: u32, cca: &CcaSettings) {
        let mut duration = apply_offset(duration_pll_cycles, self.sync_slave_offset);
        if self.previous_frame_dir == FrameDir::Rx {
            duration += self.setup_time_pll_cycles as u32;
        }
        self.previous_frame_dir = FrameDir::Tx;
        self.sync_update(duration, cca);
        self.sync_slave_offset = 0;
    }

    /// Budget the upcoming RX slot; the receiver wakes one setup time early
    /// when the previous slot transmitted.
    pub fn update_rx(&mut self, duration_pll_cycles: u32, cca: &CcaSettings) {
        let mut duration = apply_offset(duration_pll_cycles, self.sync_slave_offset);
        if self.previous_frame_dir == FrameDir::Tx {
            duration = duration.saturating_sub(self.setup_time_pll_cycles as u32);
        }
        self.previous_frame_dir = FrameDir::Rx;
        self.sync_update(duration, cca);
        self.sync_slave_offset = 0;
    }

    /// Track the coordinator from a sync-bearing slot outcome while synced.
    pub fn slave_adjust(
        &mut self,
        outcome: FrameOutcome,
        rx_waited_pll_cycles: u16,
        cca: &CcaSettings,
    ) {
        if outcome == FrameOutcome::Received {
            self.slave_adjust_frame_rx(rx_waited_pll_cycles, cca);
        } else {
            self.slave_adjust_frame_lost();
        }
    }

    /// Hunt for the coordinator while unsynchronized: every miss sweeps the
    /// wake-up earlier so the listen window slides over the coordinator's
    /// schedule.
    pub fn slave_find(
        &mut self,
        outcome: FrameOutcome,
        rx_waited_pll_cycles: u16,
        cca: &CcaSettings,
    ) {
        if outcome == FrameOutcome::Received {
            self.slave_adjust_frame_rx(rx_waited_pll_cycles, cca);
        } else {
            self.sync_slave_offset = -UNSYNC_SWEEP_PLL_CYCLES;
        }
    }

    pub fn sleep_cycles(&self) -> u32 {
        self.sleep_cycles_value
    }

    pub fn timeout(&self) -> u32 {
        self.timeout_value
    }

    pub fn pwr_up(&self) -> u16 {
        self.pwr_up_value
    }

    pub fn is_slave_synced(&self) -> bool {
        self.slave_state == SlaveSyncState::Synced
    }

    pub fn slave_state(&self) -> SlaveSyncState {
        self.slave_state
    }

    pub fn frame_lost_count(&self) -> u16 {
        self.frame_lost_count
    }

    pub fn sleep_level(&self) -> SleepLevel {
        self.sleep_level
    }

    fn sync_update(&mut self, duration_pll_cycles: u32, cca: &CcaSettings) {
        let timeout_pll_cycles = self.timeout_pll_cycles + cca.timeout_extension_pll_cycles();

        match self.sleep_level {
            SleepLevel::Shallow | SleepLevel::Deep => {
                let duration = duration_pll_cycles.saturating_sub(self.sleep_offset_pll_cycles);
                self.sleep_cycles_value = duration / PLL_RATIO;
                self.pwr_up_value += (duration % PLL_RATIO) as u16;
                if self.pwr_up_value as u32 > PLL_RATIO {
                    self.sleep_cycles_value += 1;
                    self.pwr_up_value = (self.pwr_up_value as u32 % PLL_RATIO) as u16;
                }
                self.timeout_value = timeout_pll_cycles + self.pwr_up_value as u32;
            }
            SleepLevel::Idle => {
                self.sleep_cycles_value =
                    duration_pll_cycles.saturating_sub(self.sleep_offset_pll_cycles);
                self.pwr_up_value = 0;
                self.timeout_value = timeout_pll_cycles;
            }
        }
    }

    fn slave_adjust_frame_rx(&mut self, rx_waited_pll_cycles: u16, cca: &CcaSettings) {
        let base = self.base_target_rx_waited_pll_cycles as i32;
        let retry = cca.retry_time_pll_cycles as i32;
        let mut rx_waited = rx_waited_pll_cycles as i32;
        if self.sleep_level != SleepLevel::Idle {
            rx_waited -= self.pwr_up_value as i32;
        }

        self.frame_lost_count = 0;

        // A transmitter that lost CCA rounds is late by whole retry
        // periods; find the multiple that brackets the observed wait.
        let mut target = base;
        if cca.enabled && rx_waited > base + retry - retry / 2 {
            self.cca_unsync_watchdog_count += 1;
            for i in (0..=cca.max_try_count as i32).rev() {
                let lower = base + retry * i - retry / 2;
                let upper = base + retry * (i + 1) - retry / 2;
                if rx_waited > lower && rx_waited < upper {
                    target = base + retry * i;
                    break;
                }
            }
        }

        if target == base {
            self.slave_state = SlaveSyncState::Synced;
            self.cca_unsync_watchdog_count = 0;
        }

        // Positive means we woke too early and must lengthen the next
        // sleep; negative means too late.
        self.sync_slave_offset = rx_waited - target;

        if self.cca_unsync_watchdog_count > CCA_THRESHOLD_WATCHDOG_COUNT
            || self.slave_state == SlaveSyncState::Syncing
        {
            self.sync_slave_offset = rx_waited - base;
        }
    }

    fn slave_adjust_frame_lost(&mut self) {
        self.frame_lost_count = self.frame_lost_count.saturating_add(1);
        self.sync_slave_offset = 0;
        if self.frame_lost_count >= self.frame_lost_max_count {
            self.slave_state = SlaveSyncState::Syncing;
            self.frame_lost_count = self.frame_lost_max_count;
        }
    }
}

fn apply_offset(duration: u32, offset: i32) -> u32 {
    let adjusted = duration as i64 + offset as i64;
    if adjusted < 0 {
        0
    } else {
        adjusted as u32
    }
}
