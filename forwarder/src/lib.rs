//! SIIRTO - Reliable Batched Event Forwarder
//!
//! Moves provenance records from a local source to a remote endpoint in
//! batches, one transaction per batch, and keeps a durable resume position so
//! nothing is lost across restarts.
//!
//! # Architecture
//!
//! ```text
//! EventSource ──► Forwarder (tick) ──► WireEncoder ──► Transport transaction
//!  (journal |                                             send → confirm → complete
//!   queue ◄── IntakeQueue ◄── LongPollSubscriber)                 │
//!                                                                  ▼
//!                                                            OffsetStore
//! ```
//!
//! Delivery is at-least-once: a batch is re-sent until its transaction
//! completes and the new offset is saved.

#![deny(unsafe_code)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::panic)]

pub mod component;
pub mod config;
pub mod error;
pub mod forwarder;
pub mod intake;
pub mod metrics;
pub mod metrics_server;
pub mod offset;
pub mod record;
pub mod source;
pub mod subscribe;
pub mod transport;
pub mod wire;

pub use config::Config;
pub use error::{Result, SiirtoError};
pub use forwarder::{CycleOutcome, CyclePhase, Forwarder, ForwarderStats};
pub use intake::{IntakeQueue, OverflowPolicy};
pub use offset::{FileOffsetStore, OffsetStore};
pub use record::{EventType, Record};
pub use source::{EventSource, JournalSource, PushMessage, QueueSource};
pub use subscribe::LongPollSubscriber;
pub use transport::{HttpTransport, Transaction, TransactionState, Transport};
pub use wire::{WireEncoder, WireSettings};
