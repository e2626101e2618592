//! Wire envelope for telemetry payloads.
//!
//! Payloads are JSON objects with a `header.timestamp` and a `data` object of
//! scalar fields. Null-valued fields are omitted before serialization, never
//! transmitted as null. Topics are hierarchical:
//! `Carrier/TailNumber/FlightNumber/Source`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use skyrelay_common::{FieldValue, Point, RelayError, Result, TelemetryRecord};
use std::collections::BTreeMap;

pub const TAIL_NUMBER_FIELD: &str = "tailNumber";
pub const FLIGHT_NUMBER_FIELD: &str = "flightNumber";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub timestamp: DateTime<Utc>,
}

/// Decoded broker payload: capture header plus the non-null scalar fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryEnvelope {
    pub header: EnvelopeHeader,
    pub data: BTreeMap<String, FieldValue>,
}

impl TelemetryEnvelope {
    /// Build an envelope from a record, dropping null-valued fields.
    pub fn from_record(record: &TelemetryRecord) -> Self {
        let data = record
            .iter()
            .filter(|(_, v)| !v.is_null())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        Self {
            header: EnvelopeHeader {
                timestamp: record.captured_at(),
            },
            data,
        }
    }

    pub fn into_record(self) -> TelemetryRecord {
        TelemetryRecord::from_fields(self.header.timestamp, self.data)
    }
}

/// Serialize a record into the broker payload form.
pub fn encode(record: &TelemetryRecord) -> Result<Vec<u8>> {
    let envelope = TelemetryEnvelope::from_record(record);
    Ok(serde_json::to_vec(&envelope)?)
}

/// Parse a broker payload. Failures are reported as `MalformedPayload` so the
/// caller can drop the message and keep ingesting.
pub fn decode(payload: &[u8]) -> Result<TelemetryEnvelope> {
    serde_json::from_slice(payload).map_err(|e| RelayError::MalformedPayload(e.to_string()))
}

/// Topic for a record: `{carrier}/{tailNumber}/{flightNumber}/{source}`. The
/// identity fields come from the record itself.
pub fn record_topic(carrier: &str, source: &str, record: &TelemetryRecord) -> Result<String> {
    let tail = record.text(TAIL_NUMBER_FIELD).ok_or_else(|| {
        RelayError::MalformedPayload(format!("record missing {}", TAIL_NUMBER_FIELD))
    })?;
    let flight = record.text(FLIGHT_NUMBER_FIELD).ok_or_else(|| {
        RelayError::MalformedPayload(format!("record missing {}", FLIGHT_NUMBER_FIELD))
    })?;

    Ok(format!("{}/{}/{}/{}", carrier, tail, flight, source))
}

/// Convert a received envelope into a time-series point. The measurement is
/// the tail number segment of the topic; flight number and source become tags.
pub fn point_from_envelope(topic: &str, envelope: &TelemetryEnvelope) -> Result<Point> {
    let segments: Vec<&str> = topic.split('/').collect();
    let measurement = segments
        .get(1)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RelayError::MalformedPayload(format!("topic too short: {}", topic)))?;

    let mut point = Point::new(*measurement, envelope.header.timestamp);
    if let Some(flight) = segments.get(2) {
        point = point.tag(FLIGHT_NUMBER_FIELD, *flight);
    }
    if let Some(source) = segments.get(3) {
        point = point.tag("source", *source);
    }

    for (key, value) in &envelope.data {
        if !value.is_null() {
            point = point.field(key.clone(), value.clone());
        }
    }

    Ok(point)
}
