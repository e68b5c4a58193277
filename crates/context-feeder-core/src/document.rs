//! Measurement document assembly.
//!
//! One [`MeasurementDoc`] is built per classified attribute. Optional fields
//! are copied if and only if the source entity or attribute carries them;
//! nothing is defaulted, because the index mappings have no defaults for
//! those fields either.

use chrono::{DateTime, SecondsFormat, Utc};

use crate::classify::Classified;
use crate::models::{Entity, MeasurementDoc, RawAttribute};

/// Render an ingestion instant the way documents carry it
/// (`2024-05-01T10:00:00.000Z`).
pub fn format_received_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Build the document for one classified attribute of `entity`.
pub fn build_document(
    entity: &Entity,
    attribute_id: &str,
    attribute: &RawAttribute,
    classified: Classified,
    received_time: &str,
) -> MeasurementDoc {
    let sensor_kind = attribute
        .metadata_value("kind")
        .or_else(|| attribute.metadata_value("sensor_kind"));

    MeasurementDoc {
        entity_id: entity.id.clone(),
        entity_name: entity.name(),
        domain: entity.domain(),
        measurement_id: attribute_id.to_string(),
        measurement_dimension: attribute.metadata_value("dimension"),
        measurement_name: attribute.metadata_value("name"),
        sensor_kind,
        measurement_unit: attribute.metadata_value("unit"),
        measurement_timestamp: attribute.metadata_value("timestamp"),
        received_time: received_time.to_string(),
        kind: classified.kind,
        value: classified.value,
    }
}
