//! Core data models used throughout Context Feeder.
//!
//! These types represent the entities read from the context broker, the
//! measurement kinds they are classified into, and the documents written
//! to the search store.

use std::collections::HashSet;
use std::time::Duration;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};

/// Entity keys that identify or describe the entity itself and are never
/// treated as measurements.
pub const RESERVED_KEYS: &[&str] = &[
    "id",
    "type",
    "owner",
    "domain",
    "name",
    "servicePath",
    "dateModified",
    "gateway_id",
];

/// The closed set of measurement kinds an attribute can be classified into.
///
/// Each kind owns exactly one value field name in [`MeasurementDoc`] and one
/// mapping type in the destination index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MeasurementKind {
    Number,
    Geo,
    Keyword,
    Text,
    Date,
    Object,
}

impl MeasurementKind {
    /// Every kind, in mapping order.
    pub const ALL: [MeasurementKind; 6] = [
        MeasurementKind::Number,
        MeasurementKind::Geo,
        MeasurementKind::Keyword,
        MeasurementKind::Text,
        MeasurementKind::Date,
        MeasurementKind::Object,
    ];

    /// Name of the document field carrying the measured value.
    pub fn value_field(self) -> &'static str {
        match self {
            MeasurementKind::Number => "value",
            MeasurementKind::Geo => "geo",
            MeasurementKind::Keyword => "keyword",
            MeasurementKind::Text => "text",
            MeasurementKind::Date => "date",
            MeasurementKind::Object => "object",
        }
    }

    /// Mapping type name used in index mappings and bulk action lines.
    pub fn mapping_type(self) -> &'static str {
        match self {
            MeasurementKind::Number => "sensingNumber",
            MeasurementKind::Geo => "sensingGeo",
            MeasurementKind::Keyword => "sensingKeyword",
            MeasurementKind::Text => "sensingText",
            MeasurementKind::Date => "sensingDate",
            MeasurementKind::Object => "sensingObject",
        }
    }

    /// Store field type of the value field.
    pub fn value_mapping(self) -> &'static str {
        match self {
            MeasurementKind::Number => "double",
            MeasurementKind::Geo => "geo_point",
            MeasurementKind::Keyword => "keyword",
            MeasurementKind::Text => "text",
            MeasurementKind::Date => "date",
            MeasurementKind::Object => "object",
        }
    }
}

/// A context entity as returned by the broker or delivered in a notification.
///
/// `id` and `type` are typed; every other key is kept in `properties` and
/// interpreted through the accessors below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type", default)]
    pub entity_type: String,
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl Entity {
    /// Build an entity with no properties.
    pub fn new(id: impl Into<String>, entity_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entity_type: entity_type.into(),
            properties: Map::new(),
        }
    }

    /// Builder-style property insertion, mostly useful in tests.
    pub fn with_property(mut self, key: impl Into<String>, value: Value) -> Self {
        self.properties.insert(key.into(), value);
        self
    }

    /// The entity's domain, if it carries one.
    pub fn domain(&self) -> Option<String> {
        text_field(self.properties.get("domain"))
    }

    /// The entity's human-readable name, if it carries one.
    pub fn name(&self) -> Option<String> {
        text_field(self.properties.get("name"))
    }

    /// The service path attribute some brokers add to query results.
    pub fn service_path(&self) -> Option<String> {
        text_field(self.properties.get("servicePath"))
    }

    /// Attributes of interest: every non-reserved property shaped like a
    /// typed attribute, in key order.
    pub fn attributes(&self) -> Vec<(&str, RawAttribute)> {
        self.properties
            .iter()
            .filter(|(key, _)| !RESERVED_KEYS.contains(&key.as_str()))
            .filter_map(|(key, value)| RawAttribute::from_value(value).map(|a| (key.as_str(), a)))
            .collect()
    }
}

/// A typed attribute of an entity, before classification.
#[derive(Debug, Clone, PartialEq)]
pub struct RawAttribute {
    /// Declared type string, as sent by the broker (any case).
    pub attr_type: String,
    pub value: Value,
    pub metadata: Map<String, Value>,
}

impl RawAttribute {
    pub fn new(attr_type: impl Into<String>, value: Value) -> Self {
        Self {
            attr_type: attr_type.into(),
            value,
            metadata: Map::new(),
        }
    }

    /// Interpret a property value as an attribute. Returns `None` unless the
    /// value is an object with a string `type`.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let attr_type = obj.get("type")?.as_str()?.to_string();
        Some(Self {
            attr_type,
            value: obj.get("value").cloned().unwrap_or(Value::Null),
            metadata: obj
                .get("metadata")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        })
    }

    /// Metadata entry by key, unwrapped from its `{ "value": … }` envelope.
    /// JSON `null` counts as absent.
    pub fn metadata_value(&self, key: &str) -> Option<Value> {
        let entry = self.metadata.get(key)?;
        let inner = match entry {
            Value::Object(obj) => obj.get("value")?,
            other => other,
        };
        if inner.is_null() {
            None
        } else {
            Some(inner.clone())
        }
    }
}

/// Read an entity-level field that may be an attribute envelope or a plain
/// scalar.
fn text_field(value: Option<&Value>) -> Option<String> {
    let inner = match value? {
        Value::Object(obj) => obj.get("value")?,
        other => other,
    };
    match inner {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Per-task selection of entities and attributes. An absent set accepts
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EntityFilter {
    #[serde(default)]
    pub ids: Option<HashSet<String>>,
    #[serde(default)]
    pub types: Option<HashSet<String>>,
    #[serde(default)]
    pub attributes: Option<HashSet<String>>,
}

impl EntityFilter {
    pub fn matches(&self, entity: &Entity) -> bool {
        self.ids.as_ref().map_or(true, |ids| ids.contains(&entity.id))
            && self
                .types
                .as_ref()
                .map_or(true, |types| types.contains(&entity.entity_type))
    }

    pub fn accepts_attribute(&self, attribute_id: &str) -> bool {
        self.attributes
            .as_ref()
            .map_or(true, |attrs| attrs.contains(attribute_id))
    }
}

/// How a task obtains entity state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    /// Poll the broker and write documents every cycle.
    Time,
    /// Keep a standing subscription; documents arrive via notifications.
    Subscription,
}

/// Where a task reads entities from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub uri: String,
    pub tenant: String,
    pub scope: String,
    pub page_size: usize,
    pub timeout: Duration,
}

/// Where a task writes documents to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreSettings {
    pub uri: String,
    pub ping_timeout: Duration,
    pub request_timeout: Duration,
}

/// Fully resolved configuration of one task. Immutable once the task is
/// created.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskConfig {
    pub name: String,
    pub broker: BrokerSettings,
    pub store: StoreSettings,
    pub filter: EntityFilter,
    pub trigger: Trigger,
    pub period: Option<Duration>,
    pub throttling: Option<Duration>,
}

/// One measurement document, ready to be written to the store.
///
/// Optional fields are serialized only when present, so a document built
/// from an attribute without metadata carries exactly the required keys.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementDoc {
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub domain: Option<String>,
    pub measurement_id: String,
    pub measurement_dimension: Option<Value>,
    pub measurement_name: Option<Value>,
    pub sensor_kind: Option<Value>,
    pub measurement_unit: Option<Value>,
    pub measurement_timestamp: Option<Value>,
    /// Ingestion wall-clock time, RFC 3339.
    pub received_time: String,
    pub kind: MeasurementKind,
    pub value: Value,
}

impl Serialize for MeasurementDoc {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("entity_id", &self.entity_id)?;
        if let Some(name) = &self.entity_name {
            map.serialize_entry("entity_name", name)?;
        }
        if let Some(domain) = &self.domain {
            map.serialize_entry("domain", domain)?;
        }
        map.serialize_entry("measurement_id", &self.measurement_id)?;
        let optional = [
            ("measurement_dimension", &self.measurement_dimension),
            ("measurement_name", &self.measurement_name),
            ("sensor_kind", &self.sensor_kind),
            ("measurement_unit", &self.measurement_unit),
            ("measurement_timestamp", &self.measurement_timestamp),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                map.serialize_entry(key, value)?;
            }
        }
        map.serialize_entry("received_time", &self.received_time)?;
        map.serialize_entry(self.kind.value_field(), &self.value)?;
        map.end()
    }
}
