//! Error taxonomy for the whole stack.
//!
//! Configuration errors surface at the call site and leave the partially
//! built object graph in place; the caller must treat them as terminal and
//! release the memory pool. Flow-control errors are expected at runtime and
//! the caller simply retries later. Runtime conditions that are not tied to
//! a specific call (overruns, corrupted producer packets) are reported as
//! [`Event`]s through the connection event callback instead.

/// Everything that can go wrong through the public API.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The caller-supplied memory region is exhausted.
    NotEnoughMemory,
    /// The channel sequence is missing or empty.
    InvalidChannelSequence,
    /// ARQ was requested on a connection that does not use acknowledgements.
    AckDisabled,
    /// Payload size does not match the connection's fixed payload size.
    WrongTxSize,
    /// `connect()` was called while the stack is already connected.
    AlreadyConnected,
    /// `disconnect()` was called while the stack is already disconnected.
    AlreadyDisconnected,
    /// No radio was attached to the node before setup.
    RadioNotInitialized,
    /// Throttling was not enabled on this connection at creation time.
    ThrottleNotInitialized,
    /// The connection TX queue is full; retry after a frame drains.
    QueueFull,
    /// The connection RX queue is empty; nothing to read.
    QueueEmpty,
    /// The MAC request queue is full; retry after the MAC services it.
    RequestQueueFull,
    /// The register write request queue is full.
    WriteRequestQueueFull,
    /// The register read request queue is full.
    ReadRequestQueueFull,
}

/// Runtime conditions dispatched to the connection event callback.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// An incoming frame found the RX queue full and was diverted to the
    /// overrun scratch buffer; its payload is lost.
    RxOverrun,
    /// The radio flagged the received control header as corrupted; the slot
    /// is treated as lost.
    ProducerPacketCorrupted,
}
