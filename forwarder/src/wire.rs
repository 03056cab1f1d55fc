//! Wire encoding of record batches
//!
//! A batch travels as a single JSON array with one object per record. Fields
//! the record does not carry are left out of the object; they are never
//! written as `null`. A field that is present but empty (`""`, `{}`, `[]`) is
//! written as-is.

use crate::component::GroupStatus;
use crate::record::{Attributes, Record};
use bytes::Bytes;
use chrono::DateTime;
use reqwest::Url;
use serde::ser::{Serialize, Serializer};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Path under the actor URL where event content can be retrieved
pub const CONTENT_PATH: &str = "/api/provenance/events";

/// `yyyy-MM-ddTHH:mm:ss.SSSZ`
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Values the encoder adds to every record
#[derive(Debug, Clone)]
pub struct WireSettings {
    /// URL of the instance the records originate from
    pub actor_url: Option<Url>,
    /// Application name; falls back to the component tree's root name
    pub application: Option<String>,
    pub platform: String,
    pub entity_type: String,
    pub components: Option<Arc<GroupStatus>>,
}

impl Default for WireSettings {
    fn default() -> Self {
        Self {
            actor_url: None,
            application: None,
            platform: "siirto".to_string(),
            entity_type: "flowfile".to_string(),
            components: None,
        }
    }
}

/// One record as written on the wire
#[derive(Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEvent<'a> {
    pub event_id: String,
    pub event_ordinal: u64,
    pub event_type: &'static str,
    pub timestamp_millis: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_millis: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lineage_start: Option<i64>,
    pub lineage_identifiers: BTreeSet<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_name: Option<&'a str>,
    pub entity_id: &'a str,
    pub entity_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_entity_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_attributes: Option<PresentValues<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_attributes: Option<PresentValues<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor_hostname: Option<&'a str>,
    #[serde(rename = "contentURI", skip_serializing_if = "Option::is_none")]
    pub content_uri: Option<String>,
    #[serde(
        rename = "previousContentURI",
        skip_serializing_if = "Option::is_none"
    )]
    pub previous_content_uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_ids: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub child_ids: Option<&'a [String]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transit_uri: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_identifier: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternate_identifier: Option<&'a str>,
    pub platform: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub application: Option<&'a str>,
}

/// Attribute map view that skips entries without a value
#[derive(Debug)]
pub struct PresentValues<'a>(&'a Attributes);

impl Serialize for PresentValues<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(
            self.0
                .iter()
                .filter_map(|(key, value)| value.as_ref().map(|v| (key, v))),
        )
    }
}

/// Turns records into the downstream JSON payload
#[derive(Debug, Clone)]
pub struct WireEncoder {
    settings: WireSettings,
    hostname: Option<String>,
    content_base: Option<String>,
}

impl WireEncoder {
    pub fn new(settings: WireSettings) -> Self {
        let hostname = settings
            .actor_url
            .as_ref()
            .and_then(|url| url.host_str())
            .map(str::to_string);
        let content_base = settings
            .actor_url
            .as_ref()
            .map(|url| format!("{}{CONTENT_PATH}", url.origin().ascii_serialization()));

        Self {
            settings,
            hostname,
            content_base,
        }
    }

    /// Application name written to every record
    pub fn application(&self) -> Option<&str> {
        self.settings.application.as_deref().or_else(|| {
            self.settings
                .components
                .as_deref()
                .map(|root| root.name.as_str())
        })
    }

    /// Build the wire view of one record
    pub fn event<'a>(&'a self, record: &'a Record) -> WireEvent<'a> {
        let mut lineage: BTreeSet<&str> = record
            .lineage_identifiers
            .iter()
            .flatten()
            .map(String::as_str)
            .collect();
        lineage.insert(&record.entity_id);

        let component_name = match (&record.component_id, &self.settings.components) {
            (Some(id), Some(tree)) => tree.component_name(id),
            _ => None,
        };

        let (content_uri, previous_content_uri) = match &self.content_base {
            Some(base) => (
                Some(format!("{base}/{}/content/output", record.sequence_id)),
                Some(format!("{base}/{}/content/input", record.sequence_id)),
            ),
            None => (None, None),
        };

        WireEvent {
            event_id: ulid::Ulid::new().to_string(),
            event_ordinal: record.sequence_id,
            event_type: record.event_type.as_str(),
            timestamp_millis: record.timestamp_millis,
            timestamp: format_timestamp(record.timestamp_millis),
            duration_millis: record.duration_millis,
            lineage_start: record.lineage_start,
            lineage_identifiers: lineage,
            details: record.details.as_deref(),
            component_id: record.component_id.as_deref(),
            component_type: record.component_type.as_deref(),
            component_name,
            entity_id: &record.entity_id,
            entity_type: &self.settings.entity_type,
            entity_size: record.entity_size,
            previous_entity_size: record.previous_entity_size,
            updated_attributes: record.updated_attributes.as_ref().map(PresentValues),
            previous_attributes: record.previous_attributes.as_ref().map(PresentValues),
            actor_hostname: self.hostname.as_deref(),
            content_uri,
            previous_content_uri,
            parent_ids: record.parent_ids.as_deref(),
            child_ids: record.child_ids.as_deref(),
            transit_uri: record.transit_uri.as_deref(),
            remote_identifier: record.remote_identifier.as_deref(),
            alternate_identifier: record.alternate_identifier.as_deref(),
            platform: &self.settings.platform,
            application: self.application(),
        }
    }

    /// Encode a batch as one JSON array
    pub fn encode_batch(&self, records: &[Record]) -> Result<Bytes, serde_json::Error> {
        let events: Vec<WireEvent<'_>> = records.iter().map(|r| self.event(r)).collect();
        serde_json::to_vec(&events).map(Bytes::from)
    }
}

fn format_timestamp(millis: i64) -> Option<String> {
    DateTime::from_timestamp_millis(millis).map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
}
