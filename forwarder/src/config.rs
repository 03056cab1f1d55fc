//! Configuration for SIIRTO
//!
//! Everything comes from `SIIRTO_*` environment variables layered over
//! [`Config::default`]. [`Config::from_lookup`] takes any key lookup so tests
//! don't have to touch the process environment.

use crate::component::GroupStatus;
use crate::error::{Result, SiirtoError};
use crate::intake::{DEFAULT_CAPACITY, OverflowPolicy};
use crate::subscribe::{DEFAULT_RECONNECT_DELAY, SubscriberConfig};
use crate::transport::{HttpTransportConfig, TlsConfig};
use crate::wire::WireSettings;
use reqwest::Url;
use std::env;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_URL: &str = "http://localhost:8080/";

/// Main configuration for SIIRTO
#[derive(Debug, Clone)]
pub struct Config {
    /// Downstream base URL
    pub destination_url: Url,

    /// Named input port on the downstream side
    pub port_name: String,

    /// Communications timeout
    pub timeout: Duration,

    /// Compress transaction payloads
    pub compress: bool,

    /// Max records per batch
    pub batch_size: usize,

    /// Time between cycles
    pub tick_interval: Duration,

    /// Offset file
    pub state_file: PathBuf,

    /// Write the offset file through a temp file and rename
    pub state_atomic: bool,

    pub tls_ca_cert: Option<PathBuf>,
    pub tls_identity: Option<PathBuf>,

    /// URL of this instance, used for actor hostname and content URIs
    pub actor_url: Url,

    pub application: Option<String>,
    pub platform: String,

    /// JSON file with the component status tree
    pub component_tree: Option<PathBuf>,

    pub source: SourceKind,
    pub journal_path: PathBuf,
    pub subscribe_url: Option<Url>,
    pub subscribe_channel: String,
    pub subscribe_token: Option<String>,
    pub poll_timeout: Duration,

    /// Intake queue capacity (push source only)
    pub intake_capacity: usize,
    pub intake_overflow: OverflowPolicy,

    /// Metrics server address
    pub metrics_addr: SocketAddr,

    /// Log level
    pub log_level: String,

    /// Log format (json or pretty)
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
}

/// Where records come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Newline-delimited JSON journal on disk
    Journal,
    /// HTTP long-poll subscription through the intake queue
    Subscription,
}

impl Default for Config {
    fn default() -> Self {
        let url = default_url();
        Self {
            destination_url: url.clone(),
            port_name: "Provenance Input".to_string(),
            timeout: Duration::from_secs(30),
            compress: true,
            batch_size: 1000,
            tick_interval: Duration::from_secs(1),
            state_file: PathBuf::from("./conf/siirto.state"),
            state_atomic: false,
            tls_ca_cert: None,
            tls_identity: None,
            actor_url: url,
            application: None,
            platform: "siirto".to_string(),
            component_tree: None,
            source: SourceKind::Journal,
            journal_path: PathBuf::from("./events.ndjson"),
            subscribe_url: None,
            subscribe_channel: "/topic/events".to_string(),
            subscribe_token: None,
            poll_timeout: Duration::from_secs(30),
            intake_capacity: DEFAULT_CAPACITY,
            intake_overflow: OverflowPolicy::Block,
            metrics_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
        }
    }
}

fn default_url() -> Url {
    // Constant input; parse cannot fail
    Url::parse(DEFAULT_URL).unwrap_or_else(|_| unreachable!("default URL is valid"))
}

fn invalid(key: &str, e: impl Display) -> SiirtoError {
    SiirtoError::Config(format!("invalid {key}: {e}"))
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    lookup(key)
        .map(|value| value.trim().parse::<T>().map_err(|e| invalid(key, e)))
        .transpose()
}

fn parse_millis(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    Ok(parse::<u64>(lookup, key)?.map(Duration::from_millis))
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<bool>> {
    lookup(key)
        .map(|value| match value.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(invalid(key, format!("{other} (expected 'true' or 'false')"))),
        })
        .transpose()
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();
        let lookup = &lookup;

        if let Some(url) = parse(lookup, "SIIRTO_DESTINATION_URL")? {
            config.destination_url = url;
        }
        if let Some(name) = lookup("SIIRTO_PORT_NAME") {
            config.port_name = name;
        }
        if let Some(timeout) = parse_millis(lookup, "SIIRTO_TIMEOUT_MS")? {
            config.timeout = timeout;
        }
        if let Some(compress) = parse_bool(lookup, "SIIRTO_COMPRESS")? {
            config.compress = compress;
        }
        if let Some(size) = parse(lookup, "SIIRTO_BATCH_SIZE")? {
            config.batch_size = size;
        }
        if let Some(interval) = parse_millis(lookup, "SIIRTO_TICK_INTERVAL_MS")? {
            config.tick_interval = interval;
        }
        if let Some(path) = lookup("SIIRTO_STATE_FILE") {
            config.state_file = PathBuf::from(path);
        }
        if let Some(atomic) = parse_bool(lookup, "SIIRTO_STATE_ATOMIC")? {
            config.state_atomic = atomic;
        }
        config.tls_ca_cert = lookup("SIIRTO_TLS_CA_CERT").map(PathBuf::from);
        config.tls_identity = lookup("SIIRTO_TLS_IDENTITY").map(PathBuf::from);

        if let Some(url) = parse(lookup, "SIIRTO_ACTOR_URL")? {
            config.actor_url = url;
        }
        config.application = lookup("SIIRTO_APPLICATION");
        if let Some(platform) = lookup("SIIRTO_PLATFORM") {
            config.platform = platform;
        }
        config.component_tree = lookup("SIIRTO_COMPONENT_TREE").map(PathBuf::from);

        if let Some(source) = lookup("SIIRTO_SOURCE") {
            config.source = match source.to_lowercase().as_str() {
                "journal" => SourceKind::Journal,
                "subscription" => SourceKind::Subscription,
                other => {
                    return Err(invalid(
                        "SIIRTO_SOURCE",
                        format!("{other} (expected 'journal' or 'subscription')"),
                    ));
                }
            };
        }
        if let Some(path) = lookup("SIIRTO_JOURNAL_PATH") {
            config.journal_path = PathBuf::from(path);
        }
        config.subscribe_url = parse(lookup, "SIIRTO_SUBSCRIBE_URL")?;
        if let Some(channel) = lookup("SIIRTO_SUBSCRIBE_CHANNEL") {
            config.subscribe_channel = channel;
        }
        config.subscribe_token = lookup("SIIRTO_SUBSCRIBE_TOKEN");
        if let Some(timeout) = parse_millis(lookup, "SIIRTO_POLL_TIMEOUT_MS")? {
            config.poll_timeout = timeout;
        }
        if let Some(capacity) = parse(lookup, "SIIRTO_INTAKE_CAPACITY")? {
            config.intake_capacity = capacity;
        }
        if let Some(policy) = parse(lookup, "SIIRTO_INTAKE_OVERFLOW")? {
            config.intake_overflow = policy;
        }

        if let Some(addr) = parse(lookup, "SIIRTO_METRICS_ADDR")? {
            config.metrics_addr = addr;
        }
        if let Some(level) = lookup("SIIRTO_LOG_LEVEL") {
            config.log_level = level;
        }
        if let Some(format) = lookup("SIIRTO_LOG_FORMAT") {
            config.log_format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "pretty" => LogFormat::Pretty,
                other => {
                    return Err(invalid(
                        "SIIRTO_LOG_FORMAT",
                        format!("{other} (expected 'json' or 'pretty')"),
                    ));
                }
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Check values that parse but cannot work
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(invalid("SIIRTO_BATCH_SIZE", "must be positive"));
        }
        if self.timeout.is_zero() {
            return Err(invalid("SIIRTO_TIMEOUT_MS", "must be positive"));
        }
        if self.tick_interval.is_zero() {
            return Err(invalid("SIIRTO_TICK_INTERVAL_MS", "must be positive"));
        }
        if self.intake_capacity == 0 {
            return Err(invalid("SIIRTO_INTAKE_CAPACITY", "must be positive"));
        }
        if self.source == SourceKind::Subscription && self.subscribe_url.is_none() {
            return Err(SiirtoError::Config(
                "SIIRTO_SUBSCRIBE_URL is required when SIIRTO_SOURCE=subscription".to_string(),
            ));
        }
        Ok(())
    }

    /// Settings for the downstream HTTP transport
    pub fn transport_config(&self) -> HttpTransportConfig {
        let tls = (self.tls_ca_cert.is_some() || self.tls_identity.is_some()).then(|| TlsConfig {
            ca_cert: self.tls_ca_cert.clone(),
            identity: self.tls_identity.clone(),
        });

        HttpTransportConfig {
            url: self.destination_url.clone(),
            port_name: self.port_name.clone(),
            timeout: self.timeout,
            compress: self.compress,
            tls,
        }
    }

    /// Settings for the wire encoder, with an already loaded component tree
    pub fn wire_settings(&self, components: Option<Arc<GroupStatus>>) -> WireSettings {
        WireSettings {
            actor_url: Some(self.actor_url.clone()),
            application: self.application.clone(),
            platform: self.platform.clone(),
            components,
            ..WireSettings::default()
        }
    }

    /// Settings for the push subscription, if one is configured
    pub fn subscriber_config(&self) -> Option<SubscriberConfig> {
        self.subscribe_url.as_ref().map(|url| SubscriberConfig {
            url: url.clone(),
            channel: self.subscribe_channel.clone(),
            token: self.subscribe_token.clone(),
            poll_timeout: self.poll_timeout,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        })
    }
}
