//! Cross-layer frame descriptors and the bounded frame queue shared between
//! the application side and the MAC.
//!
//! A frame buffer is a single allocation holding the header region at the
//! front and the payload behind it. Four cursors delimit the two windows;
//! the header grows leftward when the MAC prepends its fields and the parse
//! path walks rightward over them. The windows always satisfy
//! `header_begin <= header_end == payload_begin <= payload_end <= capacity`.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::link::cca::CcaSettings;
use crate::{FecLevel, FrameOutcome, Modulation, SleepLevel};

/// Per-slot radio configuration carried alongside a frame, plus the
/// measurements the PHY reports back once the slot completed.
#[derive(Debug, Clone, Copy)]
pub struct SlotConfig {
    /// Permuted channel id; indexes the connection channel table.
    pub channel_index: u8,
    /// Power profile selected by the payload-size fallback.
    pub fallback_index: u8,
    pub cca: CcaSettings,
    pub sleep_level: SleepLevel,
    pub modulation: Modulation,
    pub fec: FecLevel,
    pub source_address: u16,
    pub destination_address: u16,
    pub expect_ack: bool,
    pub fixed_payload: Option<u8>,
    /// Listen timeout handed to the radio, in PLL cycles.
    pub rx_timeout: u32,
    /// Sleep budget until the slot fires, in sleep-clock or PLL cycles
    /// depending on the sleep level.
    pub sleep_cycles: u32,
    /// Residual PLL cycles to burn after wake-up.
    pub power_up_delay: u16,
    /// Reported by the PHY after the slot.
    pub rssi_raw: u8,
    pub rnsi_raw: u8,
    /// How long the receiver waited before the syncword hit, in PLL cycles.
    pub rx_wait_time: u16,
    pub cca_try_count: u8,
    pub rx_cca_retry_count: u8,
}

impl Default for SlotConfig {
    fn default() -> Self {
        SlotConfig {
            channel_index: 0,
            fallback_index: 0,
            cca: CcaSettings::disabled(),
            sleep_level: SleepLevel::Idle,
            modulation: Modulation::default(),
            fec: FecLevel::default(),
            source_address: 0,
            destination_address: 0,
            expect_ack: false,
            fixed_payload: None,
            rx_timeout: 0,
            sleep_cycles: 0,
            power_up_delay: 0,
            rssi_raw: 0,
            rnsi_raw: 0,
            rx_wait_time: 0,
            cca_try_count: 0,
            rx_cca_retry_count: 0,
        }
    }
}

/// One frame buffer with its header/payload windows.
#[derive(Debug)]
pub struct Frame<'a> {
    buffer: &'a mut [u8],
    header_capacity: u8,
    header_begin: u16,
    header_end: u16,
    payload_begin: u16,
    payload_end: u16,
    pub time_stamp_quarter_ms: u64,
    pub retry_count: u16,
    pub outcome: FrameOutcome,
}

impl<'a> Frame<'a> {
    /// Lay out a TX frame: header region reserved at the front, both
    /// windows empty and joined at the header/payload boundary.
    pub fn new_tx(buffer: &'a mut [u8], header_capacity: u8) -> Self {
        let boundary = header_capacity as u16;
        Frame {
            buffer,
            header_capacity,
            header_begin: boundary,
            header_end: boundary,
            payload_begin: boundary,
            payload_end: boundary,
            time_stamp_quarter_ms: 0,
            retry_count: 0,
            outcome: FrameOutcome::Lost,
        }
    }

    /// Lay out an RX frame as one contiguous receive buffer.
    pub fn new_rx(buffer: &'a mut [u8], header_capacity: u8) -> Self {
        Frame {
            buffer,
            header_capacity,
            header_begin: 0,
            header_end: 0,
            payload_begin: 0,
            payload_end: 0,
            time_stamp_quarter_ms: 0,
            retry_count: 0,
            outcome: FrameOutcome::Lost,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    pub fn header_capacity(&self) -> u8 {
        self.header_capacity
    }

    pub fn payload_len(&self) -> usize {
        (self.payload_end - self.payload_begin) as usize
    }

    pub fn payload(&self) -> &[u8] {
        &self.buffer[self.payload_begin as usize..self.payload_end as usize]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buffer[self.payload_begin as usize..self.payload_end as usize]
    }

    /// Writable payload area behind the header region, up to capacity.
    pub fn payload_area_mut(&mut self) -> &mut [u8] {
        let begin = self.header_capacity as usize;
        &mut self.buffer[begin..]
    }

    /// Bytes that go on air: prepended header plus payload.
    pub fn wire_bytes(&self) -> &[u8] {
        &self.buffer[self.header_begin as usize..self.payload_end as usize]
    }

    /// True when the parsed header consumed the whole frame, i.e. the frame
    /// carries no payload (auto-sync beacon or empty sentinel).
    pub fn is_header_only(&self) -> bool {
        self.header_begin == self.payload_end
    }

    /// Reset a TX frame so a new header can be prepended.
    pub fn rewind_header(&mut self) {
        self.header_begin = self.header_end;
        self.check_windows();
    }

    /// Commit `len` payload bytes previously written through
    /// [`payload_area_mut`](Self::payload_area_mut).
    pub fn commit_payload(&mut self, len: usize) {
        let begin = self.header_capacity as u16;
        self.payload_begin = begin;
        self.payload_end = begin + len as u16;
        self.header_begin = begin;
        self.header_end = begin;
        self.check_windows();
    }

    /// Grow the header window leftward and hand out the new bytes.
    /// Returns `None` when the region cannot hold `size` more bytes.
    pub fn prepend_header(&mut self, size: u8) -> Option<&mut [u8]> {
        if self.header_begin < size as u16 {
            return None;
        }
        self.header_begin -= size as u16;
        let begin = self.header_begin as usize;
        self.check_windows();
        Some(&mut self.buffer[begin..begin + size as usize])
    }

    /// Room left in front of the header window.
    pub fn header_space_available(&self) -> bool {
        self.header_begin >= self.header_capacity as u16 && self.header_capacity > 0
    }

    /// Record `len` received bytes starting at the buffer base.
    pub fn mark_received(&mut self, len: usize) {
        self.header_begin = 0;
        self.header_end = 0;
        self.payload_begin = 0;
        self.payload_end = len.min(self.buffer.len()) as u16;
        self.check_windows();
    }

    /// Whole buffer, for the PHY to land a received frame in.
    pub fn receive_area_mut(&mut self) -> &mut [u8] {
        self.buffer
    }

    /// Received bytes still to be parsed.
    pub fn received_bytes(&self) -> &[u8] {
        &self.buffer[self.header_begin as usize..self.payload_end as usize]
    }

    /// Advance past `size` parsed header bytes; the payload window starts
    /// right behind them.
    pub fn consume_header(&mut self, size: u8) {
        let boundary = (self.header_begin + size as u16).min(self.payload_end);
        self.header_begin = boundary;
        self.header_end = boundary;
        self.payload_begin = boundary;
        self.check_windows();
    }

    /// Collapse every window to an empty frame (idle TX sentinel).
    pub fn clear(&mut self) {
        self.header_begin = 0;
        self.header_end = 0;
        self.payload_begin = 0;
        self.payload_end = 0;
        self.check_windows();
    }

    /// Arm a header-only beacon: the header window sits at the boundary,
    /// ready for the prepend pass, with no payload behind it.
    pub fn arm_beacon(&mut self) {
        let boundary = self.header_capacity as u16;
        self.header_begin = boundary;
        self.header_end = boundary;
        self.payload_begin = boundary;
        self.payload_end = boundary;
        self.check_windows();
    }

    #[inline]
    fn check_windows(&self) {
        debug_assert!(self.header_begin <= self.header_end);
        debug_assert_eq!(self.header_end, self.payload_begin);
        debug_assert!(self.payload_begin <= self.payload_end);
        debug_assert!((self.payload_end as usize) <= self.buffer.len());
    }
}

/// Frame descriptor exchanged between the application and the MAC.
#[derive(Debug)]
pub struct Xlayer<'a> {
    pub frame: Frame<'a>,
    pub config: SlotConfig,
}

impl<'a> Xlayer<'a> {
    pub fn new(frame: Frame<'a>) -> Self {
        Xlayer {
            frame,
            config: SlotConfig::default(),
        }
    }
}

/// Bounded FIFO of frame descriptors.
///
/// Single producer, single consumer: the producer acquires the tail slot
/// with [`get_free_slot`](Self::get_free_slot), fills it in place and
/// publishes it with [`enqueue`](Self::enqueue); the consumer reads through
/// [`front`](Self::front) and releases with [`dequeue`](Self::dequeue).
/// The indices are free-running counters with release/acquire ordering so a
/// published slot is fully visible before the consumer can observe the new
/// tail.
pub struct XlayerQueue<'a> {
    slots: &'a mut [Xlayer<'a>],
    head: AtomicUsize,
    tail: AtomicUsize,
}

impl<'a> XlayerQueue<'a> {
    pub fn new(slots: &'a mut [Xlayer<'a>]) -> Self {
        XlayerQueue {
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.head.load(Ordering::Acquire))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn free_space(&self) -> usize {
        self.capacity() - self.len()
    }

    /// Writable slot at the tail, not yet visible to the consumer.
    pub fn get_free_slot(&mut self) -> Option<&mut Xlayer<'a>> {
        if self.len() == self.capacity() {
            return None;
        }
        let idx = self.tail.load(Ordering::Relaxed) % self.slots.len();
        Some(&mut self.slots[idx])
    }

    /// Read-only peek at the unpublished tail slot.
    pub fn free_slot_ref(&self) -> Option<&Xlayer<'a>> {
        if self.len() == self.capacity() {
            return None;
        }
        let idx = self.tail.load(Ordering::Relaxed) % self.slots.len();
        Some(&self.slots[idx])
    }

    /// Publish the slot previously acquired with `get_free_slot`.
    pub fn enqueue(&mut self) -> bool {
        if self.len() == self.capacity() {
            return false;
        }
        let tail = self.tail.load(Ordering::Relaxed);
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    pub fn front(&mut self) -> Option<&mut Xlayer<'a>> {
        if self.is_empty() {
            return None;
        }
        let idx = self.head.load(Ordering::Relaxed) % self.slots.len();
        Some(&mut self.slots[idx])
    }

    pub fn front_ref(&self) -> Option<&Xlayer<'a>> {
        if self.is_empty() {
            return None;
        }
        let idx = self.head.load(Ordering::Relaxed) % self.slots.len();
        Some(&self.slots[idx])
    }

    pub fn dequeue(&mut self) -> bool {
        if self.is_empty() {
            return false;
        }
        let head = self.head.load(Ordering::Relaxed);
        self.head.store(head.wrapping_add(1), Ordering::Release);
        true
    }
}
