//! Link-layer primitives: everything below the MAC that tracks one aspect
//! of a running link.

pub mod cca;
pub mod channel;
pub mod fallback;
pub mod gain;
pub mod lqi;
pub mod multi;
pub mod rdo;
pub mod saw_arq;
pub mod scheduler;
pub mod tdma_sync;
