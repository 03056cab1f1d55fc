//! SIIRTO - Reliable Batched Event Forwarder
//!
//! ## Usage
//!
//! ```bash
//! # Forward a local journal to a downstream instance
//! SIIRTO_DESTINATION_URL=https://sink:8443/nifi-api/ cargo run
//!
//! # Forward a push subscription, with debug output
//! SIIRTO_SOURCE=subscription SIIRTO_SUBSCRIBE_URL=http://bus/poll \
//!     SIIRTO_LOG_LEVEL=debug cargo run
//! ```
//!
//! ## Environment Variables
//!
//! - `SIIRTO_DESTINATION_URL`: downstream base URL (default: "http://localhost:8080/")
//! - `SIIRTO_PORT_NAME`: input port name (default: "Provenance Input")
//! - `SIIRTO_BATCH_SIZE`: max records per transaction (default: 1000)
//! - `SIIRTO_STATE_FILE`: offset file (default: "./conf/siirto.state")
//! - `SIIRTO_SOURCE`: "journal" or "subscription" (default: "journal")
//! - `SIIRTO_METRICS_ADDR`: metrics server address (default: "0.0.0.0:9090")
//! - `SIIRTO_LOG_LEVEL`: log level (default: "info")
//!
//! The full list lives in `siirto_forwarder::config`.

use siirto_forwarder::component::GroupStatus;
use siirto_forwarder::config::{Config, LogFormat, SourceKind};
use siirto_forwarder::metrics::Metrics;
use siirto_forwarder::metrics_server::{Liveness, MetricsServer};
use siirto_forwarder::{
    EventSource, FileOffsetStore, Forwarder, HttpTransport, IntakeQueue, JournalSource,
    LongPollSubscriber, OffsetStore, QueueSource, WireEncoder,
};
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing; RUST_LOG wins over SIIRTO_LOG_LEVEL
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    info!(
        destination = %config.destination_url,
        port = %config.port_name,
        batch_size = config.batch_size,
        state_file = %config.state_file.display(),
        "Starting SIIRTO forwarder"
    );

    Metrics::init()?;
    // A cycle may spend one timeout delivering and another cancelling
    let liveness = Arc::new(Liveness::new(config.tick_interval + config.timeout * 3));
    let metrics_handle = MetricsServer::start(config.metrics_addr, Arc::clone(&liveness));

    let components = match &config.component_tree {
        Some(path) => Some(Arc::new(GroupStatus::load(path)?)),
        None => None,
    };
    let encoder = WireEncoder::new(config.wire_settings(components));

    let transport = Arc::new(HttpTransport::connect(config.transport_config())?);

    let offsets: Arc<dyn OffsetStore> = if config.state_atomic {
        Arc::new(FileOffsetStore::atomic(&config.state_file))
    } else {
        Arc::new(FileOffsetStore::new(&config.state_file))
    };

    let mut intake = None;
    let source: Arc<dyn EventSource> = match config.source {
        SourceKind::Journal => {
            info!(path = %config.journal_path.display(), "Reading journal");
            Arc::new(JournalSource::new(&config.journal_path))
        }
        SourceKind::Subscription => {
            let queue = Arc::new(IntakeQueue::new(
                config.intake_capacity,
                config.intake_overflow,
            ));
            let subscriber_config = config
                .subscriber_config()
                .ok_or_else(|| anyhow::anyhow!("SIIRTO_SUBSCRIBE_URL is not set"))?;
            let subscriber = LongPollSubscriber::new(subscriber_config, Arc::clone(&queue))?;
            intake = Some((Arc::clone(&queue), subscriber.spawn()));
            Arc::new(QueueSource::new(queue))
        }
    };

    let forwarder = Forwarder::new(source, transport, offsets, encoder)
        .batch_size(config.batch_size)
        .timeout(config.timeout)
        .tick_interval(config.tick_interval)
        .liveness(liveness);

    let result = forwarder.run(shutdown_signal()).await;

    if let Some((queue, subscription)) = intake {
        // Unblocks a producer waiting on a full queue
        queue.close();
        subscription.abort();
        if !queue.is_empty() {
            info!(
                pending = queue.len(),
                "Undelivered push messages discarded"
            );
        }
    }
    metrics_handle.abort();

    let stats = result?;
    info!(
        records = stats.records_forwarded,
        batches = stats.batches_delivered,
        "SIIRTO shutdown complete"
    );
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = ?e, "Failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = ?e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
