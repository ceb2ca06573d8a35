//! PHY adapter: translates staged frames into radio commands and grades
//! radio completions into MAC input signals.
//!
//! The transceiver itself is opaque behind [`Transceiver`]: it arms one
//! timeslot (sleep so many cycles, wake, transmit or listen) and reports
//! the outcome with its signal measurements. Everything register-level
//! lives behind that trait.

use crate::connection::RfChannel;
use crate::link::cca::CcaSettings;
use crate::{FecLevel, FrameOutcome, Modulation, SleepLevel};

/// Direction of one armed frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDir {
    Tx,
    Rx,
}

/// Everything the radio needs to run one frame of a timeslot.
#[derive(Debug, Clone)]
pub struct SlotIntent<'f> {
    pub dir: SlotDir,
    /// On-air bytes for TX (header plus payload); empty for RX and for an
    /// idle TX slot that radiates nothing.
    pub frame: &'f [u8],
    pub channel: RfChannel,
    pub sleep_level: SleepLevel,
    pub sleep_cycles: u32,
    pub power_up_delay: u16,
    pub rx_timeout: u32,
    pub cca: CcaSettings,
    pub rx_constgain: u8,
    pub expect_ack: bool,
    pub modulation: Modulation,
    pub fec: FecLevel,
    pub source_address: u16,
    pub destination_address: u16,
    pub fixed_payload: Option<u8>,
}

/// What the radio measured for one completed frame.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy)]
pub struct SlotOutcome {
    pub outcome: FrameOutcome,
    pub rssi_raw: u8,
    pub rnsi_raw: u8,
    /// PLL cycles the receiver waited before the syncword.
    pub rx_wait_time: u16,
    pub cca_try_count: u8,
    pub rx_cca_retry_count: u8,
    /// Control header failed its integrity check.
    pub header_corrupted: bool,
    /// Received frame length, retrievable through `read_frame`.
    pub frame_len: u8,
}

impl Default for SlotOutcome {
    fn default() -> Self {
        SlotOutcome {
            outcome: FrameOutcome::Lost,
            rssi_raw: 0,
            rnsi_raw: 0,
            rx_wait_time: 0,
            cca_try_count: 0,
            rx_cca_retry_count: 0,
            header_corrupted: false,
            frame_len: 0,
        }
    }
}

/// Progress of the in-flight slot after servicing an interrupt.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyStep {
    /// Still waiting on the radio or on a transfer.
    Pending,
    /// Both frames of the slot have resolved; outcomes are readable.
    SlotDone,
}

/// Opaque radio driver: the small command set the stack relies on.
pub trait Transceiver {
    type Error: core::fmt::Debug;

    /// Bring the radio out of shutdown into its parked state.
    fn power_up(&mut self) -> Result<(), Self::Error>;

    /// Park the radio; no further slots fire until re-armed.
    fn park(&mut self) -> Result<(), Self::Error>;

    /// Reload the wake-up timer (dual-radio follower alignment).
    fn resync_timer(&mut self) -> Result<(), Self::Error>;

    /// Arm the next timeslot: sleep, wake, then run the main frame and the
    /// optional same-slot auto-reply.
    fn arm(
        &mut self,
        main: &SlotIntent<'_>,
        auto_reply: Option<&SlotIntent<'_>>,
    ) -> Result<(), Self::Error>;

    /// Service the radio interrupt.
    fn service_irq(&mut self) -> Result<PhyStep, Self::Error>;

    /// Service the SPI/DMA transfer-complete interrupt.
    fn service_transfer(&mut self) -> Result<PhyStep, Self::Error>;

    fn main_outcome(&mut self) -> SlotOutcome;
    fn auto_outcome(&mut self) -> Option<SlotOutcome>;

    /// Copy the received main frame into `buf`; returns the byte count.
    fn read_frame(&mut self, buf: &mut [u8]) -> usize;

    /// Copy the received auto-reply frame into `buf`.
    fn read_auto_frame(&mut self, buf: &mut [u8]) -> usize;

    fn write_register(&mut self, reg: u8, data: u8) -> Result<(), Self::Error>;
    fn read_register(&mut self, reg: u8) -> Result<u8, Self::Error>;
}

/// Adapter-level signal, graded from the slot outcome. The variants are
/// ordered: everything before `PrepareDone` means the frame is still being
/// processed, everything after means it is done.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PhyOutputSignal {
    Yield,
    Processing,
    PrepareDone,
    FrameSentAck,
    FrameSentNack,
    FrameNotSent,
    /// TX completed on a link that does not expect acknowledgements.
    FrameTx,
    FrameReceived,
    FrameMissed,
}

pub(crate) fn is_frame_processing(signal: PhyOutputSignal) -> bool {
    signal < PhyOutputSignal::PrepareDone
}

/// Per-radio adapter state.
pub struct Phy<T: Transceiver> {
    pub(crate) transceiver: T,
    main_signal: PhyOutputSignal,
    auto_signal: PhyOutputSignal,
    main_dir: Option<SlotDir>,
    auto_dir: Option<SlotDir>,
    main_expect_ack: bool,
    /// Frames whose control header arrived corrupted.
    pub(crate) producer_packets_corrupted: u32,
}

impl<T: Transceiver> Phy<T> {
    pub fn new(transceiver: T) -> Self {
        Phy {
            transceiver,
            main_signal: PhyOutputSignal::Yield,
            auto_signal: PhyOutputSignal::Yield,
            main_dir: None,
            auto_dir: None,
            main_expect_ack: false,
            producer_packets_corrupted: 0,
        }
    }

    pub fn connect(&mut self) -> Result<(), T::Error> {
        self.main_signal = PhyOutputSignal::Yield;
        self.auto_signal = PhyOutputSignal::Yield;
        self.transceiver.power_up()
    }

    pub fn disconnect(&mut self) -> Result<(), T::Error> {
        self.main_signal = PhyOutputSignal::Yield;
        self.auto_signal = PhyOutputSignal::Yield;
        self.transceiver.park()
    }

    pub fn arm(
        &mut self,
        main: &SlotIntent<'_>,
        auto_reply: Option<&SlotIntent<'_>>,
    ) -> Result<(), T::Error> {
        self.main_dir = Some(main.dir);
        self.auto_dir = auto_reply.map(|a| a.dir);
        self.main_expect_ack = main.expect_ack;
        self.main_signal = PhyOutputSignal::Processing;
        self.auto_signal = if auto_reply.is_some() {
            PhyOutputSignal::Processing
        } else {
            PhyOutputSignal::Yield
        };
        self.transceiver.arm(main, auto_reply)
    }

    pub fn service_irq(&mut self) -> Result<(), T::Error> {
        let step = self.transceiver.service_irq()?;
        self.apply_step(step);
        Ok(())
    }

    pub fn service_transfer(&mut self) -> Result<(), T::Error> {
        let step = self.transceiver.service_transfer()?;
        self.apply_step(step);
        Ok(())
    }

    fn apply_step(&mut self, step: PhyStep) {
        if step != PhyStep::SlotDone {
            return;
        }
        let main_outcome = self.transceiver.main_outcome();
        if main_outcome.header_corrupted {
            self.producer_packets_corrupted += 1;
        }
        self.main_signal = grade(self.main_dir, &main_outcome, self.main_expect_ack);
        if let Some(dir) = self.auto_dir {
            // An auto-reply never chains its own acknowledgement.
            match self.transceiver.auto_outcome() {
                Some(outcome) => self.auto_signal = grade(Some(dir), &outcome, false),
                None => self.auto_signal = PhyOutputSignal::FrameMissed,
            }
        }
    }

    pub fn main_signal(&self) -> PhyOutputSignal {
        self.main_signal
    }

    pub fn auto_signal(&self) -> PhyOutputSignal {
        self.auto_signal
    }

    /// Park the adapter signals after the MAC consumed the slot.
    pub fn acknowledge_slot(&mut self) {
        self.main_signal = PhyOutputSignal::Yield;
        self.auto_signal = PhyOutputSignal::Yield;
        self.main_dir = None;
        self.auto_dir = None;
    }
}

/// Grade a completed frame into an adapter signal.
fn grade(dir: Option<SlotDir>, outcome: &SlotOutcome, expect_ack: bool) -> PhyOutputSignal {
    match dir {
        None => PhyOutputSignal::Yield,
        Some(SlotDir::Rx) => {
            if outcome.outcome == FrameOutcome::Received && !outcome.header_corrupted {
                PhyOutputSignal::FrameReceived
            } else {
                PhyOutputSignal::FrameMissed
            }
        }
        Some(SlotDir::Tx) => match outcome.outcome {
            FrameOutcome::Wait => PhyOutputSignal::FrameNotSent,
            FrameOutcome::SentAck => PhyOutputSignal::FrameSentAck,
            _ if !expect_ack => PhyOutputSignal::FrameTx,
            _ => PhyOutputSignal::FrameSentNack,
        },
    }
}

/// Dual-radio aggregation: the leader's signal is elevated, but only once
/// neither radio is still processing; a `PrepareDone` from the leader
/// passes through immediately so header preparation is not held back.
pub(crate) fn aggregate_main_signal<T: Transceiver>(
    phys: &[Phy<T>],
    leader: usize,
) -> PhyOutputSignal {
    if phys.len() < 2 {
        return phys[leader].main_signal();
    }
    let leading = phys[leader].main_signal();
    let following = phys[1 - leader].main_signal();
    if leading == PhyOutputSignal::PrepareDone {
        return leading;
    }
    if is_frame_processing(leading) || is_frame_processing(following) {
        return PhyOutputSignal::Yield;
    }
    leading
}

pub(crate) fn aggregate_auto_signal<T: Transceiver>(
    phys: &[Phy<T>],
    leader: usize,
) -> PhyOutputSignal {
    phys[leader].auto_signal()
}
