//! Attribute classification.
//!
//! Maps an attribute's declared type string onto a [`MeasurementKind`] and
//! extracts the value to store under that kind's value field. Matching is
//! case-insensitive and follows a fixed priority:
//!
//! | Declared type | Kind | Value |
//! |---------------|------|-------|
//! | `number`, `measurement` | Number | `value` |
//! | `geo:point` | Geo | `value.coordinates`, or the raw `"lat, lon"` value |
//! | `geo:json` with `value.type == "Point"` | Geo | `value.coordinates` |
//! | `string` | Keyword | `value` |
//! | `text` | Text | `value` |
//! | `datetime` | Date | `value` |
//! | `object` | Object | `value` |
//!
//! Anything else is unclassifiable; callers drop the attribute and report an
//! [`UnsupportedAttribute`].

use std::fmt;

use serde_json::Value;

use crate::models::{MeasurementKind, RawAttribute};

/// Outcome of a successful classification.
#[derive(Debug, Clone, PartialEq)]
pub struct Classified {
    pub kind: MeasurementKind,
    pub value: Value,
}

impl Classified {
    /// Name of the document field the value is written to.
    pub fn value_field(&self) -> &'static str {
        self.kind.value_field()
    }
}

/// An attribute that could not be classified and was left out of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsupportedAttribute {
    pub entity_id: String,
    pub attribute_id: String,
    pub raw_type: String,
}

impl fmt::Display for UnsupportedAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unsupported attribute type '{}' in {}.{}",
            self.raw_type, self.entity_id, self.attribute_id
        )
    }
}

/// Classify a declared type and its value.
pub fn classify(attr_type: &str, value: &Value) -> Option<Classified> {
    let (kind, value) = match attr_type.to_ascii_lowercase().as_str() {
        "number" | "measurement" => (MeasurementKind::Number, value.clone()),
        "geo:point" => {
            let point = value
                .get("coordinates")
                .cloned()
                .unwrap_or_else(|| value.clone());
            (MeasurementKind::Geo, point)
        }
        "geo:json" if is_point(value) => (
            MeasurementKind::Geo,
            value.get("coordinates").cloned().unwrap_or(Value::Null),
        ),
        "string" => (MeasurementKind::Keyword, value.clone()),
        "text" => (MeasurementKind::Text, value.clone()),
        "datetime" => (MeasurementKind::Date, value.clone()),
        "object" => (MeasurementKind::Object, value.clone()),
        _ => return None,
    };
    Some(Classified { kind, value })
}

/// Classify a raw attribute.
pub fn classify_attribute(attribute: &RawAttribute) -> Option<Classified> {
    classify(&attribute.attr_type, &attribute.value)
}

fn is_point(value: &Value) -> bool {
    value.get("type").and_then(Value::as_str) == Some("Point")
}
