//! Record type for SIIRTO
//!
//! A Record is one provenance event as produced by the source. Records are
//! immutable once fetched and are consumed strictly in `sequence_id` order.
//!
//! Optional fields model values the source may not know. `None` is "absent",
//! which is different from an empty string or an empty map: absent fields are
//! left out of the wire payload entirely.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;

/// Kind of provenance event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    Create,
    Receive,
    Fetch,
    Send,
    Download,
    Drop,
    Expire,
    Fork,
    Join,
    Clone,
    ContentModified,
    AttributesModified,
    Route,
    Addinfo,
    Replay,
    Unknown,
}

impl EventType {
    /// Upper-case name as written on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::Create => "CREATE",
            EventType::Receive => "RECEIVE",
            EventType::Fetch => "FETCH",
            EventType::Send => "SEND",
            EventType::Download => "DOWNLOAD",
            EventType::Drop => "DROP",
            EventType::Expire => "EXPIRE",
            EventType::Fork => "FORK",
            EventType::Join => "JOIN",
            EventType::Clone => "CLONE",
            EventType::ContentModified => "CONTENT_MODIFIED",
            EventType::AttributesModified => "ATTRIBUTES_MODIFIED",
            EventType::Route => "ROUTE",
            EventType::Addinfo => "ADDINFO",
            EventType::Replay => "REPLAY",
            EventType::Unknown => "UNKNOWN",
        }
    }

    /// Parse a wire name; anything unrecognised maps to `Unknown`
    pub fn parse(name: &str) -> Self {
        match name {
            "CREATE" => EventType::Create,
            "RECEIVE" => EventType::Receive,
            "FETCH" => EventType::Fetch,
            "SEND" => EventType::Send,
            "DOWNLOAD" => EventType::Download,
            "DROP" => EventType::Drop,
            "EXPIRE" => EventType::Expire,
            "FORK" => EventType::Fork,
            "JOIN" => EventType::Join,
            "CLONE" => EventType::Clone,
            "CONTENT_MODIFIED" => EventType::ContentModified,
            "ATTRIBUTES_MODIFIED" => EventType::AttributesModified,
            "ROUTE" => EventType::Route,
            "ADDINFO" => EventType::Addinfo,
            "REPLAY" => EventType::Replay,
            _ => EventType::Unknown,
        }
    }
}

impl Serialize for EventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(EventType::parse(&name))
    }
}

/// Attribute map as reported by the source. A `None` value marks an attribute
/// the source knows about but has no value for.
pub type Attributes = BTreeMap<String, Option<String>>;

/// One provenance event
///
/// # Example
///
/// ```
/// use siirto_forwarder::record::{EventType, Record};
///
/// let record = Record::new(10, EventType::Create, 1_700_000_000_000, "ff-1")
///     .with_component("proc-1", "GenerateFlowFile")
///     .with_details("created");
/// assert_eq!(record.sequence_id, 10);
/// assert_eq!(record.details.as_deref(), Some("created"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Monotonically increasing id assigned by the source
    pub sequence_id: u64,

    pub event_type: EventType,

    /// Event time, epoch millis
    pub timestamp_millis: i64,

    #[serde(default)]
    pub duration_millis: Option<i64>,

    /// Start of the lineage this entity belongs to, epoch millis
    #[serde(default)]
    pub lineage_start: Option<i64>,

    #[serde(default)]
    pub lineage_identifiers: Option<Vec<String>>,

    /// Identifier of the entity (flow file) the event is about
    pub entity_id: String,

    #[serde(default)]
    pub entity_size: Option<u64>,

    #[serde(default)]
    pub previous_entity_size: Option<u64>,

    #[serde(default)]
    pub details: Option<String>,

    #[serde(default)]
    pub component_id: Option<String>,

    #[serde(default)]
    pub component_type: Option<String>,

    #[serde(default)]
    pub updated_attributes: Option<Attributes>,

    #[serde(default)]
    pub previous_attributes: Option<Attributes>,

    #[serde(default)]
    pub parent_ids: Option<Vec<String>>,

    #[serde(default)]
    pub child_ids: Option<Vec<String>>,

    #[serde(default)]
    pub transit_uri: Option<String>,

    /// Identifier the remote system used for the entity
    #[serde(default)]
    pub remote_identifier: Option<String>,

    #[serde(default)]
    pub alternate_identifier: Option<String>,
}

impl Record {
    /// Create a record with only the mandatory fields set
    pub fn new(
        sequence_id: u64,
        event_type: EventType,
        timestamp_millis: i64,
        entity_id: impl Into<String>,
    ) -> Self {
        Self {
            sequence_id,
            event_type,
            timestamp_millis,
            duration_millis: None,
            lineage_start: None,
            lineage_identifiers: None,
            entity_id: entity_id.into(),
            entity_size: None,
            previous_entity_size: None,
            details: None,
            component_id: None,
            component_type: None,
            updated_attributes: None,
            previous_attributes: None,
            parent_ids: None,
            child_ids: None,
            transit_uri: None,
            remote_identifier: None,
            alternate_identifier: None,
        }
    }

    /// Set the details string
    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Set the reporting component
    pub fn with_component(
        mut self,
        component_id: impl Into<String>,
        component_type: impl Into<String>,
    ) -> Self {
        self.component_id = Some(component_id.into());
        self.component_type = Some(component_type.into());
        self
    }

    /// Set the transit URI
    pub fn with_transit_uri(mut self, uri: impl Into<String>) -> Self {
        self.transit_uri = Some(uri.into());
        self
    }

    /// Set the entity size in bytes
    pub fn with_entity_size(mut self, size: u64) -> Self {
        self.entity_size = Some(size);
        self
    }

    /// Add an updated attribute
    pub fn with_updated_attribute(mut self, key: impl Into<String>, value: Option<String>) -> Self {
        self.updated_attributes
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }
}
