//! Bounded, non-blocking log shipping.
//!
//! Producers hand formatted lines to an [`EvictingQueue`] that never blocks
//! and sheds its oldest records when full. A single background
//! [`BatchFlusher`] drains it when a batch fills up or when records have
//! waited too long, and hands each batch to a [`Sender`] that POSTs it to
//! the ingestion endpoint.

pub mod config;
pub mod flusher;
pub mod queue;
pub mod sender;
pub mod shipper;

#[cfg(test)]
mod testing;

pub use config::{Compression, Config, ConfigError, ProxyAuth, ProxySettings};
pub use flusher::{BatchFlusher, FlushPolicy, FlushReason};
pub use queue::{Admission, ByteLength, CostAssigner, EvictingQueue, QueueStats, WeakQueue};
pub use sender::{HttpSender, SendError, Sender, batch_payload};
pub use shipper::{InitError, LogHandle, Shipper};
