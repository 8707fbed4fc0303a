//! Core data models flowing through the ingestion pipeline.
//!
//! Broker messages arrive as [`InboundMessage`]s and are validated into
//! [`TelemetryMessage`]s at the decode boundary, so downstream code never
//! deals with untyped payloads.

use std::collections::BTreeMap;

use serde_json::Value;
use thiserror::Error;

/// Key carrying the device unit name in every telemetry payload.
pub const UNIT_NAME_KEY: &str = "UNIT_NAME";

/// Key the configured location is written under before persistence.
pub const LOCATION_KEY: &str = "LOCATION";

/// Attribute name → value map of a single row.
pub type Attributes = BTreeMap<String, Value>;

/// Raw message as delivered by the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,

    #[error("payload has no UNIT_NAME attribute")]
    MissingUnitName,
}

impl DecodeError {
    /// Messages that simply don't identify a unit are dropped quietly; only
    /// malformed payloads are worth reporting.
    pub fn is_malformed(&self) -> bool {
        !matches!(self, DecodeError::MissingUnitName)
    }
}

/// A validated telemetry record from one device.
#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryMessage {
    pub unit_name: String,
    pub location: Option<String>,
    pub attributes: Attributes,
}

impl TelemetryMessage {
    /// Decode a wire payload: UTF-8 text holding a flat JSON object with a
    /// string `UNIT_NAME`.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let text = std::str::from_utf8(payload)?;
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(map) = value else {
            return Err(DecodeError::NotAnObject);
        };

        let mut attributes: Attributes = map.into_iter().collect();
        let unit_name = match attributes.remove(UNIT_NAME_KEY) {
            Some(Value::String(name)) if !name.is_empty() => name,
            _ => return Err(DecodeError::MissingUnitName),
        };
        let location = match attributes.get(LOCATION_KEY) {
            Some(Value::String(loc)) => Some(loc.clone()),
            _ => None,
        };

        Ok(Self {
            unit_name,
            location,
            attributes,
        })
    }

    /// Set the location, overriding anything the device sent.
    pub fn inject_location(&mut self, location: &str) {
        self.location = Some(location.to_string());
        self.attributes
            .insert(LOCATION_KEY.to_string(), Value::String(location.to_string()));
    }

    /// The full row to persist: all attributes plus the unit name.
    pub fn to_row(&self) -> Attributes {
        let mut row = self.attributes.clone();
        row.insert(
            UNIT_NAME_KEY.to_string(),
            Value::String(self.unit_name.clone()),
        );
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_meter_message() {
        let msg = TelemetryMessage::decode(br#"{"UNIT_NAME":"meter1","VOLTS":"230.1"}"#).unwrap();
        assert_eq!(msg.unit_name, "meter1");
        assert_eq!(msg.location, None);
        assert_eq!(msg.attributes.get("VOLTS"), Some(&Value::from("230.1")));
        assert!(!msg.attributes.contains_key(UNIT_NAME_KEY));
    }

    #[test]
    fn test_inject_location_lands_in_row() {
        let mut msg = TelemetryMessage::decode(
            br#"{"UNIT_NAME":"meter1","VOLTS":"230.1","LOCATION":"elsewhere"}"#,
        )
        .unwrap();
        assert_eq!(msg.location.as_deref(), Some("elsewhere"));
        msg.inject_location("lab");

        let row = msg.to_row();
        assert_eq!(row.len(), 3);
        assert_eq!(row["UNIT_NAME"], Value::from("meter1"));
        assert_eq!(row["VOLTS"], Value::from("230.1"));
        assert_eq!(row["LOCATION"], Value::from("lab"));
    }

    #[test]
    fn test_missing_unit_name_is_not_malformed() {
        let err = TelemetryMessage::decode(br#"{"VOLTS":1.0}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingUnitName));
        assert!(!err.is_malformed());

        let err = TelemetryMessage::decode(br#"{"UNIT_NAME":7}"#).unwrap_err();
        assert!(matches!(err, DecodeError::MissingUnitName));
    }

    #[test]
    fn test_malformed_payloads() {
        assert!(matches!(
            TelemetryMessage::decode(b"not json").unwrap_err(),
            DecodeError::Json(_)
        ));
        assert!(matches!(
            TelemetryMessage::decode(b"[1,2]").unwrap_err(),
            DecodeError::NotAnObject
        ));
        let err = TelemetryMessage::decode(&[0xff, 0xfe]).unwrap_err();
        assert!(matches!(err, DecodeError::Utf8(_)));
        assert!(err.is_malformed());
    }
}
