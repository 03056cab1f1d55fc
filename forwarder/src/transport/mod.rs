//! Transactional delivery to a downstream endpoint
//!
//! A transport hands out transactions. Each transaction carries one batch
//! through `send` → `confirm` → `complete`; only a completed transaction
//! counts as delivered.
//!
//! # Example
//!
//! ```ignore
//! let transport = HttpTransport::connect(config)?;
//!
//! let Some(mut txn) = transport.create_transaction(TransferDirection::Send).await? else {
//!     return Ok(()); // remote penalized, try next tick
//! };
//!
//! let delivered = async {
//!     txn.send(payload, attributes).await?;
//!     txn.confirm().await?;
//!     txn.complete().await
//! }
//! .await;
//!
//! if delivered.is_err() {
//!     // Release the remote side; the batch goes again next tick
//!     let _ = txn.cancel().await;
//! }
//! ```

pub mod http;

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;

pub use http::{HttpTransport, HttpTransportConfig, TlsConfig};

/// Direction of a transfer relative to this process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Send,
    Receive,
}

/// Lifecycle of a transaction
///
/// ```text
/// Created ──► Sent ──► Confirmed ──► Completed
///    │          │          │
///    └──────────┴──────────┴──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Created,
    Sent,
    Confirmed,
    Completed,
    Failed,
}

impl TransactionState {
    /// Check that moving to `to` respects the handshake order
    ///
    /// Several sends may go into one transaction before it is confirmed.
    pub fn advance(self, to: TransactionState) -> Result<TransactionState, TransportError> {
        use TransactionState::*;

        let allowed = matches!(
            (self, to),
            (Created, Sent) | (Sent, Sent) | (Sent, Confirmed) | (Confirmed, Completed)
        ) || (to == Failed && self != Completed);

        if allowed {
            Ok(to)
        } else {
            Err(TransportError::OutOfOrder { from: self, to })
        }
    }

    /// Whether the transaction can make no further progress
    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionState::Completed | TransactionState::Failed)
    }
}

/// One in-flight delivery
#[async_trait]
pub trait Transaction: Send {
    /// Correlation id assigned by the remote side
    fn id(&self) -> &str;

    /// Current lifecycle state
    fn state(&self) -> TransactionState;

    /// Add a payload to the transaction
    async fn send(
        &mut self,
        data: Bytes,
        attributes: HashMap<String, String>,
    ) -> Result<(), TransportError>;

    /// Commit the sent data at the protocol level
    async fn confirm(&mut self) -> Result<(), TransportError>;

    /// Finalize; after this returns Ok the data is durably delivered
    async fn complete(&mut self) -> Result<(), TransportError>;

    /// Abandon the transaction and release it on the remote side
    ///
    /// Leaves the transaction `Failed`. Best effort: the remote may already
    /// have dropped it.
    async fn cancel(&mut self) -> Result<(), TransportError>;
}

/// Session with a downstream endpoint, reused across cycles
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logging
    fn name(&self) -> &'static str;

    /// Open a transaction
    ///
    /// `Ok(None)` means the remote is temporarily unavailable or penalized.
    /// That is backpressure, not a failure: skip this cycle and try later.
    async fn create_transaction(
        &self,
        direction: TransferDirection,
    ) -> Result<Option<Box<dyn Transaction>>, TransportError>;

    /// Release connections and other resources
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }
}
