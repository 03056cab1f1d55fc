//! HTTP long-poll subscription feeding the intake queue
//!
//! The subscriber keeps one request outstanding against
//! `GET {url}?channel=<channel>`. The server holds the request open until
//! messages arrive or the poll times out, then answers with a JSON array:
//!
//! ```text
//! [{"channel": "/topic/events", "data": {...}}, ...]
//! ```
//!
//! Each message is pushed into the [`IntakeQueue`] from a blocking thread, so
//! a full queue under the `Block` policy stalls the subscription rather than
//! the runtime. Connection failures are logged and retried after a fixed delay.

use crate::error::{FetchError, IntakeError};
use crate::intake::IntakeQueue;
use crate::source::PushMessage;
use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default pause between failed polls
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Slack on top of the poll duration before the client gives up on a request
const REQUEST_GRACE: Duration = Duration::from_secs(5);

/// Subscription settings
#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub url: Url,
    pub channel: String,
    /// Bearer token sent with every poll
    pub token: Option<String>,
    /// How long the server may hold a poll open
    pub poll_timeout: Duration,
    pub reconnect_delay: Duration,
}

#[derive(Debug, Deserialize)]
struct ChannelMessage {
    channel: String,
    #[serde(default)]
    data: serde_json::Value,
}

/// What happened to one poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollOutcome {
    /// Messages were queued (possibly zero)
    Received(usize),
    /// The queue was closed; stop polling
    Closed,
}

/// Long-poll client
pub struct LongPollSubscriber {
    client: Client,
    config: SubscriberConfig,
    queue: Arc<IntakeQueue<PushMessage>>,
}

impl LongPollSubscriber {
    /// Create a subscriber pushing into `queue`
    ///
    /// # Errors
    /// Returns `FetchError::Unavailable` if the HTTP client cannot be built.
    pub fn new(
        config: SubscriberConfig,
        queue: Arc<IntakeQueue<PushMessage>>,
    ) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(config.poll_timeout + REQUEST_GRACE)
            .build()
            .map_err(|e| FetchError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            queue,
        })
    }

    /// Run the poll loop on the runtime until the queue is closed
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Poll until the queue is closed
    pub async fn run(self) {
        info!(
            url = %self.config.url,
            channel = %self.config.channel,
            "Subscription started"
        );

        loop {
            match self.poll_once().await {
                Ok(PollOutcome::Received(count)) => {
                    if count > 0 {
                        debug!(count, "Subscription messages queued");
                    }
                }
                Ok(PollOutcome::Closed) => break,
                Err(e) => {
                    warn!(
                        error = %e,
                        delay_ms = self.config.reconnect_delay.as_millis() as u64,
                        "Subscription poll failed, reconnecting"
                    );
                    tokio::time::sleep(self.config.reconnect_delay).await;
                }
            }

            if self.queue.is_closed() {
                break;
            }
        }

        info!("Subscription stopped");
    }

    async fn poll_once(&self) -> Result<PollOutcome, FetchError> {
        let mut request = self
            .client
            .get(self.config.url.clone())
            .query(&[("channel", self.config.channel.as_str())]);
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::Unavailable(e.to_string()))?;

        // Poll expired with nothing to deliver
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(PollOutcome::Received(0));
        }
        if !response.status().is_success() {
            return Err(FetchError::Unavailable(format!(
                "subscription endpoint answered {}",
                response.status()
            )));
        }

        let messages: Vec<ChannelMessage> = response
            .json()
            .await
            .map_err(|e| FetchError::Unavailable(format!("invalid subscription response: {e}")))?;
        if messages.is_empty() {
            return Ok(PollOutcome::Received(0));
        }

        let pushes: Vec<PushMessage> = messages
            .into_iter()
            .map(|m| PushMessage::now(m.channel, m.data))
            .collect();

        let queue = Arc::clone(&self.queue);
        tokio::task::spawn_blocking(move || enqueue_all(&queue, pushes))
            .await
            .map_err(|e| FetchError::Unavailable(format!("enqueue task failed: {e}")))
    }
}

fn enqueue_all(queue: &IntakeQueue<PushMessage>, messages: Vec<PushMessage>) -> PollOutcome {
    let mut queued = 0;
    for message in messages {
        match queue.push(message) {
            Ok(()) => queued += 1,
            Err(IntakeError::Full { capacity }) => {
                warn!(capacity, "Intake queue full, message rejected");
            }
            Err(IntakeError::Closed) => return PollOutcome::Closed,
        }
    }
    crate::metrics::try_set_intake_queue_size(queue.len());
    PollOutcome::Received(queued)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::intake::OverflowPolicy;
    use axum::extract::{Query, State};
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::{Value, json};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::net::TcpListener;

    #[derive(Clone, Default)]
    struct Endpoint {
        polls: Arc<AtomicUsize>,
        seen_channel: Arc<parking_lot::Mutex<Option<String>>>,
        seen_auth: Arc<parking_lot::Mutex<Option<String>>>,
    }

    async fn handle_poll(
        State(endpoint): State<Endpoint>,
        Query(params): Query<HashMap<String, String>>,
        headers: HeaderMap,
    ) -> Json<Value> {
        let poll = endpoint.polls.fetch_add(1, Ordering::SeqCst);
        *endpoint.seen_channel.lock() = params.get("channel").cloned();
        *endpoint.seen_auth.lock() = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        if poll == 0 {
            Json(json!([
                { "channel": "/topic/events", "data": { "n": 1 } },
                { "channel": "/topic/events", "data": { "n": 2 } }
            ]))
        } else {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Json(json!([]))
        }
    }

    async fn start_endpoint(endpoint: Endpoint) -> Url {
        let app = Router::new()
            .route("/subscribe", get(handle_poll))
            .with_state(endpoint);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Url::parse(&format!("http://{addr}/subscribe")).unwrap()
    }

    fn config(url: Url) -> SubscriberConfig {
        SubscriberConfig {
            url,
            channel: "/topic/events".to_string(),
            token: Some("secret".to_string()),
            poll_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn test_messages_pushed_in_order() {
        let endpoint = Endpoint::default();
        let url = start_endpoint(endpoint.clone()).await;
        let queue = Arc::new(IntakeQueue::new(10, OverflowPolicy::Block));

        let handle = LongPollSubscriber::new(config(url), Arc::clone(&queue))
            .unwrap()
            .spawn();

        let mut drained = Vec::new();
        for _ in 0..100 {
            drained.extend(queue.drain(10));
            if drained.len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].payload, json!({ "n": 1 }));
        assert_eq!(drained[1].payload, json!({ "n": 2 }));
        assert_eq!(drained[0].channel, "/topic/events");
        assert_eq!(endpoint.seen_channel.lock().as_deref(), Some("/topic/events"));
        assert_eq!(endpoint.seen_auth.lock().as_deref(), Some("Bearer secret"));

        queue.close();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_retries_until_closed() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let queue = Arc::new(IntakeQueue::new(10, OverflowPolicy::Block));
        let url = Url::parse(&format!("http://{addr}/subscribe")).unwrap();
        let handle = LongPollSubscriber::new(config(url), Arc::clone(&queue))
            .unwrap()
            .spawn();

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!handle.is_finished());

        queue.close();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_enqueue_stops_on_closed_queue() {
        let queue = IntakeQueue::new(10, OverflowPolicy::Block);
        queue.close();

        let outcome = enqueue_all(&queue, vec![PushMessage::now("/c", json!(1))]);
        assert_eq!(outcome, PollOutcome::Closed);
    }

    #[test]
    fn test_enqueue_counts_rejections() {
        let queue = IntakeQueue::new(1, OverflowPolicy::Reject);
        let messages = vec![
            PushMessage::now("/c", json!(1)),
            PushMessage::now("/c", json!(2)),
        ];

        assert_eq!(enqueue_all(&queue, messages), PollOutcome::Received(1));
        assert_eq!(queue.len(), 1);
    }
}
