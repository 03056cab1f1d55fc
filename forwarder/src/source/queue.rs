//! Push source backed by the intake queue
//!
//! A subscription pushes [`PushMessage`]s into an [`IntakeQueue`]; each fetch
//! drains what is needed, numbers the messages and keeps them until a later
//! fetch asks for a higher position. A batch whose transaction failed is
//! therefore served again with the same ids.

use super::EventSource;
use crate::error::FetchError;
use crate::intake::IntakeQueue;
use crate::record::{EventType, Record};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// One message received from a push subscription
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushMessage {
    /// Arrival time, epoch millis
    pub received_at_millis: i64,
    /// Channel the message was published on
    pub channel: String,
    /// Message body as received
    pub payload: serde_json::Value,
}

impl PushMessage {
    /// Message stamped with the current time
    pub fn now(channel: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            received_at_millis: chrono::Utc::now().timestamp_millis(),
            channel: channel.into(),
            payload,
        }
    }

    /// Turn the message into a `RECEIVE` record with the given sequence id
    pub fn into_record(self, sequence_id: u64) -> Record {
        let details = self.payload.to_string();
        Record::new(
            sequence_id,
            EventType::Receive,
            self.received_at_millis,
            ulid::Ulid::new().to_string(),
        )
        .with_transit_uri(self.channel)
        .with_entity_size(details.len() as u64)
        .with_details(details)
    }
}

struct Pending {
    retained: VecDeque<Record>,
    next_id: u64,
}

/// Event source draining an intake queue
pub struct QueueSource {
    queue: Arc<IntakeQueue<PushMessage>>,
    pending: Mutex<Pending>,
}

impl QueueSource {
    pub fn new(queue: Arc<IntakeQueue<PushMessage>>) -> Self {
        Self {
            queue,
            pending: Mutex::new(Pending {
                retained: VecDeque::new(),
                next_id: 0,
            }),
        }
    }

    /// The queue this source drains
    pub fn queue(&self) -> &Arc<IntakeQueue<PushMessage>> {
        &self.queue
    }

    /// Records numbered but not yet acknowledged by a higher fetch position
    pub fn retained(&self) -> usize {
        self.pending.lock().retained.len()
    }
}

#[async_trait]
impl EventSource for QueueSource {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn fetch(&self, after: u64, limit: usize) -> Result<Vec<Record>, FetchError> {
        let mut pending = self.pending.lock();

        // Everything below `after` has been committed downstream
        while pending
            .retained
            .front()
            .is_some_and(|record| record.sequence_id < after)
        {
            pending.retained.pop_front();
        }
        pending.next_id = pending.next_id.max(after);

        let wanted = limit.saturating_sub(pending.retained.len());
        if wanted > 0 {
            for message in self.queue.drain(wanted) {
                let id = pending.next_id;
                pending.next_id += 1;
                pending.retained.push_back(message.into_record(id));
            }
        }
        crate::metrics::try_set_intake_queue_size(self.queue.len());

        let batch: Vec<Record> = pending.retained.iter().take(limit).cloned().collect();
        debug!(after, count = batch.len(), retained = pending.retained.len(), "Queue drained");
        Ok(batch)
    }
}
