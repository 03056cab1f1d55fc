//! Record sources for the forwarder
//!
//! A source hands out records in `sequence_id` order, starting at a
//! requested position. Two kinds exist:
//!
//! - [`JournalSource`] reads a newline-delimited JSON journal (pull)
//! - [`QueueSource`] drains an [`IntakeQueue`](crate::intake::IntakeQueue)
//!   filled by a push subscription
//!
//! # Example
//!
//! ```ignore
//! struct TableSource { rows: Vec<Record> }
//!
//! #[async_trait]
//! impl EventSource for TableSource {
//!     fn name(&self) -> &'static str { "table" }
//!
//!     async fn fetch(&self, after: u64, limit: usize) -> Result<Vec<Record>, FetchError> {
//!         Ok(self.rows.iter()
//!             .filter(|r| r.sequence_id >= after)
//!             .take(limit)
//!             .cloned()
//!             .collect())
//!     }
//! }
//! ```

pub mod journal;
pub mod queue;

use crate::error::FetchError;
use crate::record::Record;
use async_trait::async_trait;

pub use journal::JournalSource;
pub use queue::{PushMessage, QueueSource};

/// Supplier of the next batch of records
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Source name for logging
    fn name(&self) -> &'static str;

    /// Return up to `limit` records with `sequence_id >= after`, ordered by id
    ///
    /// An empty vector means nothing new is available yet.
    async fn fetch(&self, after: u64, limit: usize) -> Result<Vec<Record>, FetchError>;
}

/// Check that a batch holds at most `limit` records, is strictly increasing
/// and starts at or after `after`
pub fn validate_batch(after: u64, limit: usize, records: &[Record]) -> Result<(), FetchError> {
    if records.len() > limit {
        return Err(FetchError::BatchTooLarge {
            limit,
            found: records.len(),
        });
    }

    let mut previous: Option<u64> = None;
    for record in records {
        let found = record.sequence_id;
        if found < after {
            return Err(FetchError::BeforeOffset { after, found });
        }
        if let Some(previous) = previous.filter(|p| found <= *p) {
            return Err(FetchError::OutOfOrder { previous, found });
        }
        previous = Some(found);
    }
    Ok(())
}
