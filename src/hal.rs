//! Board support capabilities consumed by the stack.
//!
//! The stack itself never touches registers or pins directly; everything
//! platform-specific comes in through these traits. [`WpsHal`] carries the
//! node-level capabilities (interrupt masking, the callback-context software
//! interrupt, the quarter-millisecond tick). [`RadioPins`] bundles the
//! reset/shutdown lines and a delay provider for the power-up choreography
//! performed on `connect()`. Dual-radio builds additionally wire a
//! [`SyncTimer`] used to realign the follower radio's wake-up timer.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::OutputPin;
use embedded_time::duration::Milliseconds;
use embedded_time::Clock;

/// Node-level board capabilities.
///
/// `tick_quarter_ms` must be monotonic and rollover-safe; every ARQ deadline
/// in the stack is expressed in this unit.
pub trait WpsHal {
    fn enable_radio_irq(&mut self);
    fn disable_radio_irq(&mut self);
    fn enable_radio_dma_irq(&mut self);
    fn disable_radio_dma_irq(&mut self);
    /// Trigger the lower-priority software interrupt that drains the
    /// callback queue.
    fn context_switch(&mut self);
    /// Free-running tick in quarter milliseconds.
    fn tick_quarter_ms(&self) -> u64;
}

/// Follower-radio resynchronization timer (dual-radio only).
pub trait SyncTimer {
    fn start(&mut self);
    fn stop(&mut self);
    fn set_period_ns(&mut self, period_ns: u32);
}

#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    Pin,
}

/// Reset/shutdown pin pair of one radio plus a delay provider.
pub struct RadioPins<R, S, D> {
    pub reset: R,
    pub shutdown: S,
    pub delay: D,
}

impl<R: OutputPin, S: OutputPin, D: DelayNs> RadioPins<R, S, D> {
    /// Power-cycle the radio: both lines low, settle, then release reset.
    /// The radio needs 100 ms after release before it accepts commands.
    pub fn power_cycle(&mut self) -> Result<(), HalError> {
        self.reset.set_low().map_err(|_| HalError::Pin)?;
        self.shutdown.set_low().map_err(|_| HalError::Pin)?;
        self.delay.delay_ms(25);
        self.reset.set_high().map_err(|_| HalError::Pin)?;
        self.delay.delay_ms(100);
        Ok(())
    }

    /// Hold the radio in shutdown.
    pub fn power_down(&mut self) -> Result<(), HalError> {
        self.shutdown.set_high().map_err(|_| HalError::Pin)
    }
}

/// Derives the quarter-millisecond tick from any [`embedded_time::Clock`]
/// with 64-bit ticks.
pub struct ClockTick<C: Clock<T = u64>> {
    clock: C,
}

impl<C: Clock<T = u64>> ClockTick<C> {
    pub fn new(clock: C) -> Self {
        ClockTick { clock }
    }

    pub fn tick_quarter_ms(&self) -> u64 {
        let Ok(now) = self.clock.try_now() else {
            return 0;
        };
        match Milliseconds::<u64>::try_from(now.duration_since_epoch()) {
            Ok(ms) => ms.0.saturating_mul(4),
            Err(_) => 0,
        }
    }
}
