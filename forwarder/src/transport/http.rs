//! Site-to-site style transport over HTTP
//!
//! Delivers batches to a named input port:
//!
//! ```text
//! POST   {base}/site-to-site/ports/{port}/transactions              create (503/429 = penalized)
//! POST   {base}/site-to-site/ports/{port}/transactions/{id}/flow-files   send
//! PUT    {base}/site-to-site/ports/{port}/transactions/{id}         confirm {"checksum": sha256}
//! DELETE {base}/site-to-site/ports/{port}/transactions/{id}         complete
//! DELETE {base}/site-to-site/ports/{port}/transactions/{id}?outcome=cancel   cancel
//! ```
//!
//! The confirm step carries a SHA-256 over every uncompressed payload sent in
//! the transaction; the remote rejects the confirmation if its own digest
//! differs.

use super::{TransactionState, TransferDirection, Transaction, Transport};
use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{CONTENT_ENCODING, CONTENT_TYPE, HeaderValue};
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the transaction attributes as a JSON object
pub const ATTRIBUTES_HEADER: &str = "x-siirto-attributes";

/// Query marking a `DELETE` as a cancellation rather than a completion
pub const CANCEL_QUERY: (&str, &str) = ("outcome", "cancel");

/// Content encoding used when compression is on
pub const LZ4_ENCODING: &str = "lz4";

/// Upper bound for establishing a TCP connection
const MAX_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Optional TLS material, PEM encoded
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// CA bundle trusted for the destination
    pub ca_cert: Option<PathBuf>,
    /// Client certificate and private key for mutual TLS
    pub identity: Option<PathBuf>,
}

/// Connection settings for [`HttpTransport`]
#[derive(Debug, Clone)]
pub struct HttpTransportConfig {
    pub url: Url,
    pub port_name: String,
    pub timeout: Duration,
    pub compress: bool,
    pub tls: Option<TlsConfig>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreatedTransaction {
    transaction_id: String,
}

#[derive(Serialize)]
struct Confirmation {
    checksum: String,
}

/// HTTP transport - one reusable client for all transactions
pub struct HttpTransport {
    client: Client,
    transactions_url: Url,
    compress: bool,
}

impl HttpTransport {
    /// Build the client and session state
    ///
    /// No request is made here; the remote is contacted when the first
    /// transaction is created.
    ///
    /// # Errors
    /// Returns `TransportError::Connection` if the URL cannot carry a path or the
    /// TLS material cannot be read.
    pub fn connect(config: HttpTransportConfig) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.timeout.min(MAX_CONNECT_TIMEOUT));

        if let Some(tls) = &config.tls {
            if let Some(path) = &tls.ca_cert {
                let pem = read_pem(path)?;
                let cert = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                    TransportError::Connection(format!("invalid CA cert {}: {e}", path.display()))
                })?;
                builder = builder.add_root_certificate(cert);
            }
            if let Some(path) = &tls.identity {
                let pem = read_pem(path)?;
                let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                    TransportError::Connection(format!("invalid identity {}: {e}", path.display()))
                })?;
                builder = builder.identity(identity);
            }
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Connection(format!("failed to build HTTP client: {e}")))?;

        let mut transactions_url = config.url.clone();
        transactions_url
            .path_segments_mut()
            .map_err(|_| {
                TransportError::Connection(format!("URL cannot be a base: {}", config.url))
            })?
            .pop_if_empty()
            .extend(["site-to-site", "ports", config.port_name.as_str(), "transactions"]);

        debug!(url = %transactions_url, compress = config.compress, "HTTP transport ready");

        Ok(Self {
            client,
            transactions_url,
            compress: config.compress,
        })
    }
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TransportError> {
    std::fs::read(path)
        .map_err(|e| TransportError::Connection(format!("cannot read {}: {e}", path.display())))
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn create_transaction(
        &self,
        direction: TransferDirection,
    ) -> Result<Option<Box<dyn Transaction>>, TransportError> {
        if direction != TransferDirection::Send {
            return Err(TransportError::Unsupported(format!("{direction:?}")));
        }

        let response = self
            .client
            .post(self.transactions_url.clone())
            .send()
            .await?;

        match response.status() {
            StatusCode::SERVICE_UNAVAILABLE | StatusCode::TOO_MANY_REQUESTS => {
                debug!(status = %response.status(), "Remote penalized, no transaction granted");
                Ok(None)
            }
            status if status.is_success() => {
                let created: CreatedTransaction = response.json().await?;
                let mut url = self.transactions_url.clone();
                if let Ok(mut segments) = url.path_segments_mut() {
                    segments.push(&created.transaction_id);
                }

                debug!(transaction_id = %created.transaction_id, "Transaction created");
                Ok(Some(Box::new(HttpTransaction {
                    client: self.client.clone(),
                    url,
                    id: created.transaction_id,
                    state: TransactionState::Created,
                    compress: self.compress,
                    digest: Sha256::new(),
                })))
            }
            _ => Err(rejected("create transaction", response).await),
        }
    }
}

/// Transaction against one remote transaction resource
pub struct HttpTransaction {
    client: Client,
    url: Url,
    id: String,
    state: TransactionState,
    compress: bool,
    digest: Sha256,
}

impl HttpTransaction {
    fn flow_files_url(&self) -> Url {
        let mut url = self.url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push("flow-files");
        }
        url
    }

    /// Record the outcome of a step; any error fails the transaction
    fn settle(
        &mut self,
        result: Result<(), TransportError>,
        next: TransactionState,
    ) -> Result<(), TransportError> {
        match result {
            Ok(()) => {
                self.state = next;
                Ok(())
            }
            Err(e) => {
                warn!(transaction_id = %self.id, state = ?self.state, error = %e, "Transaction failed");
                self.state = TransactionState::Failed;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Transaction for HttpTransaction {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> TransactionState {
        self.state
    }

    async fn send(
        &mut self,
        data: Bytes,
        attributes: HashMap<String, String>,
    ) -> Result<(), TransportError> {
        let next = self.state.advance(TransactionState::Sent)?;

        let result = async {
            let encoded = serde_json::to_string(&attributes)
                .map_err(|e| TransportError::InvalidAttributes(e.to_string()))?;
            let header = HeaderValue::from_str(&encoded)
                .map_err(|e| TransportError::InvalidAttributes(e.to_string()))?;

            let mut request = self
                .client
                .post(self.flow_files_url())
                .header(CONTENT_TYPE, "application/octet-stream")
                .header(ATTRIBUTES_HEADER, header);

            request = if self.compress {
                request
                    .header(CONTENT_ENCODING, LZ4_ENCODING)
                    .body(compress(&data)?)
            } else {
                request.body(data.clone())
            };

            expect_success("send", request.send().await?).await
        }
        .await;

        if result.is_ok() {
            self.digest.update(&data);
        }
        self.settle(result, next)
    }

    async fn confirm(&mut self) -> Result<(), TransportError> {
        let next = self.state.advance(TransactionState::Confirmed)?;
        let confirmation = Confirmation {
            checksum: hex::encode(self.digest.clone().finalize()),
        };

        let result = async {
            let response = self
                .client
                .put(self.url.clone())
                .json(&confirmation)
                .send()
                .await?;
            expect_success("confirm", response).await
        }
        .await;

        self.settle(result, next)
    }

    async fn complete(&mut self) -> Result<(), TransportError> {
        let next = self.state.advance(TransactionState::Completed)?;

        let result = async {
            let response = self.client.delete(self.url.clone()).send().await?;
            expect_success("complete", response).await
        }
        .await;

        self.settle(result, next)
    }

    async fn cancel(&mut self) -> Result<(), TransportError> {
        self.state = self.state.advance(TransactionState::Failed)?;

        let mut url = self.url.clone();
        url.query_pairs_mut().append_pair(CANCEL_QUERY.0, CANCEL_QUERY.1);
        let response = self.client.delete(url).send().await?;
        expect_success("cancel", response).await?;

        debug!(transaction_id = %self.id, "Transaction cancelled");
        Ok(())
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>, TransportError> {
    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::with_capacity(data.len() / 2));
    encoder.write_all(data)?;
    encoder.finish().map_err(|e| std::io::Error::other(e).into())
}

async fn expect_success(operation: &'static str, response: Response) -> Result<(), TransportError> {
    if response.status().is_success() {
        Ok(())
    } else {
        Err(rejected(operation, response).await)
    }
}

async fn rejected(operation: &'static str, response: Response) -> TransportError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    TransportError::Rejected {
        operation,
        status,
        message,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        body::Bytes as BodyBytes,
        extract::{Path, Query, State},
        http::{HeaderMap, StatusCode as AxumStatus},
        routing::{post, put},
    };
    use parking_lot::Mutex;
    use std::io::Read;
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    /// Shared state for the mock remote
    #[derive(Default)]
    struct MockRemote {
        penalized: AtomicBool,
        reject_confirm: AtomicBool,
        created: AtomicUsize,
        payloads: Mutex<Vec<(Vec<u8>, HashMap<String, String>, bool)>>,
        completed: Mutex<Vec<String>>,
        cancelled: Mutex<Vec<String>>,
    }

    #[derive(Deserialize)]
    struct ConfirmBody {
        checksum: String,
    }

    async fn start_mock_remote() -> (SocketAddr, Arc<MockRemote>) {
        let state = Arc::new(MockRemote::default());

        let app = Router::new()
            .route(
                "/site-to-site/ports/{port}/transactions",
                post(handle_create),
            )
            .route(
                "/site-to-site/ports/{port}/transactions/{id}",
                put(handle_confirm).delete(handle_complete),
            )
            .route(
                "/site-to-site/ports/{port}/transactions/{id}/flow-files",
                post(handle_flow_files),
            )
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (addr, state)
    }

    async fn handle_create(
        State(state): State<Arc<MockRemote>>,
        Path(port): Path<String>,
    ) -> (AxumStatus, Json<serde_json::Value>) {
        assert_eq!(port, "Provenance Input");
        if state.penalized.load(Ordering::SeqCst) {
            return (AxumStatus::SERVICE_UNAVAILABLE, Json(serde_json::json!({})));
        }
        let n = state.created.fetch_add(1, Ordering::SeqCst);
        (
            AxumStatus::CREATED,
            Json(serde_json::json!({ "transactionId": format!("txn-{n}") })),
        )
    }

    async fn handle_flow_files(
        State(state): State<Arc<MockRemote>>,
        headers: HeaderMap,
        body: BodyBytes,
    ) -> AxumStatus {
        let compressed = headers
            .get("content-encoding")
            .is_some_and(|v| v == LZ4_ENCODING);
        let data = if compressed {
            let mut out = Vec::new();
            lz4_flex::frame::FrameDecoder::new(&body[..])
                .read_to_end(&mut out)
                .unwrap();
            out
        } else {
            body.to_vec()
        };
        let attributes: HashMap<String, String> = headers
            .get(ATTRIBUTES_HEADER)
            .map(|v| serde_json::from_str(v.to_str().unwrap()).unwrap())
            .unwrap_or_default();
        state.payloads.lock().push((data, attributes, compressed));
        AxumStatus::ACCEPTED
    }

    async fn handle_confirm(
        State(state): State<Arc<MockRemote>>,
        Json(body): Json<ConfirmBody>,
    ) -> AxumStatus {
        if state.reject_confirm.load(Ordering::SeqCst) {
            return AxumStatus::CONFLICT;
        }
        let mut digest = Sha256::new();
        for (data, _, _) in state.payloads.lock().iter() {
            digest.update(data);
        }
        if hex::encode(digest.finalize()) == body.checksum {
            AxumStatus::OK
        } else {
            AxumStatus::CONFLICT
        }
    }

    async fn handle_complete(
        State(state): State<Arc<MockRemote>>,
        Path((_port, id)): Path<(String, String)>,
        Query(query): Query<HashMap<String, String>>,
    ) -> AxumStatus {
        if query.get(CANCEL_QUERY.0).map(String::as_str) == Some(CANCEL_QUERY.1) {
            state.cancelled.lock().push(id);
        } else {
            state.completed.lock().push(id);
        }
        AxumStatus::OK
    }

    fn transport(addr: SocketAddr, compress: bool) -> HttpTransport {
        HttpTransport::connect(HttpTransportConfig {
            url: Url::parse(&format!("http://{addr}/")).unwrap(),
            port_name: "Provenance Input".to_string(),
            timeout: Duration::from_secs(5),
            compress,
            tls: None,
        })
        .unwrap()
    }

    fn attributes() -> HashMap<String, String> {
        HashMap::from([("siirto.transaction.id".to_string(), "abc".to_string())])
    }

    #[tokio::test]
    async fn test_full_handshake() {
        let (addr, remote) = start_mock_remote().await;
        let transport = transport(addr, false);

        let mut txn = transport
            .create_transaction(TransferDirection::Send)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(txn.id(), "txn-0");
        assert_eq!(txn.state(), TransactionState::Created);

        txn.send(Bytes::from_static(b"[1,2,3]"), attributes())
            .await
            .unwrap();
        txn.confirm().await.unwrap();
        txn.complete().await.unwrap();
        assert_eq!(txn.state(), TransactionState::Completed);

        let payloads = remote.payloads.lock();
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].0, b"[1,2,3]");
        assert_eq!(payloads[0].1["siirto.transaction.id"], "abc");
        assert!(!payloads[0].2);
        assert_eq!(*remote.completed.lock(), vec!["txn-0".to_string()]);
    }

    #[tokio::test]
    async fn test_compressed_payload_round_trips() {
        let (addr, remote) = start_mock_remote().await;
        let transport = transport(addr, true);
        let data = Bytes::from(vec![b'x'; 4096]);

        let mut txn = transport
            .create_transaction(TransferDirection::Send)
            .await
            .unwrap()
            .unwrap();
        txn.send(data.clone(), attributes()).await.unwrap();
        // Checksum is over uncompressed bytes, so confirm succeeds
        txn.confirm().await.unwrap();
        txn.complete().await.unwrap();

        let payloads = remote.payloads.lock();
        assert!(payloads[0].2);
        assert_eq!(payloads[0].0, data.to_vec());
    }

    #[tokio::test]
    async fn test_penalized_remote_grants_nothing() {
        let (addr, remote) = start_mock_remote().await;
        remote.penalized.store(true, Ordering::SeqCst);

        let txn = transport(addr, false)
            .create_transaction(TransferDirection::Send)
            .await
            .unwrap();
        assert!(txn.is_none());
    }

    #[tokio::test]
    async fn test_rejected_confirm_fails_transaction() {
        let (addr, remote) = start_mock_remote().await;
        remote.reject_confirm.store(true, Ordering::SeqCst);

        let mut txn = transport(addr, false)
            .create_transaction(TransferDirection::Send)
            .await
            .unwrap()
            .unwrap();
        txn.send(Bytes::from_static(b"[]"), attributes())
            .await
            .unwrap();

        let err = txn.confirm().await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Rejected {
                operation: "confirm",
                status: 409,
                ..
            }
        ));
        assert_eq!(txn.state(), TransactionState::Failed);
        assert!(remote.completed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_releases_remote_transaction() {
        let (addr, remote) = start_mock_remote().await;
        remote.reject_confirm.store(true, Ordering::SeqCst);

        let mut txn = transport(addr, false)
            .create_transaction(TransferDirection::Send)
            .await
            .unwrap()
            .unwrap();
        txn.send(Bytes::from_static(b"[]"), attributes())
            .await
            .unwrap();
        txn.confirm().await.unwrap_err();

        txn.cancel().await.unwrap();
        assert_eq!(txn.state(), TransactionState::Failed);
        assert_eq!(*remote.cancelled.lock(), vec!["txn-0".to_string()]);
        assert!(remote.completed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_after_complete_is_rejected() {
        let (addr, remote) = start_mock_remote().await;

        let mut txn = transport(addr, false)
            .create_transaction(TransferDirection::Send)
            .await
            .unwrap()
            .unwrap();
        txn.send(Bytes::from_static(b"[]"), attributes())
            .await
            .unwrap();
        txn.confirm().await.unwrap();
        txn.complete().await.unwrap();

        assert!(matches!(
            txn.cancel().await,
            Err(TransportError::OutOfOrder { .. })
        ));
        assert_eq!(txn.state(), TransactionState::Completed);
        assert!(remote.cancelled.lock().is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_step_is_rejected_locally() {
        let (addr, remote) = start_mock_remote().await;

        let mut txn = transport(addr, false)
            .create_transaction(TransferDirection::Send)
            .await
            .unwrap()
            .unwrap();

        let err = txn.complete().await.unwrap_err();
        assert!(matches!(err, TransportError::OutOfOrder { .. }));
        // State untouched and nothing reached the remote
        assert_eq!(txn.state(), TransactionState::Created);
        assert!(remote.completed.lock().is_empty());
    }

    #[tokio::test]
    async fn test_receive_direction_unsupported() {
        let (addr, _remote) = start_mock_remote().await;

        let result = transport(addr, false)
            .create_transaction(TransferDirection::Receive)
            .await;
        assert!(matches!(result, Err(TransportError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_connection_failure() {
        let transport = HttpTransport::connect(HttpTransportConfig {
            url: Url::parse("http://127.0.0.1:1/").unwrap(),
            port_name: "p".to_string(),
            timeout: Duration::from_secs(2),
            compress: false,
            tls: None,
        })
        .unwrap();

        let result = transport.create_transaction(TransferDirection::Send).await;
        assert!(matches!(result, Err(TransportError::Http(_))));
    }

    #[test]
    fn test_missing_ca_cert() {
        let result = HttpTransport::connect(HttpTransportConfig {
            url: Url::parse("https://remote.example.com/").unwrap(),
            port_name: "p".to_string(),
            timeout: Duration::from_secs(2),
            compress: false,
            tls: Some(TlsConfig {
                ca_cert: Some(PathBuf::from("/nonexistent/ca.pem")),
                identity: None,
            }),
        });
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }
}
