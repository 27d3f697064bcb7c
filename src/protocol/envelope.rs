//! Device-to-cloud message envelope
//!
//! Every publish carries the same JSON wrapper:
//!
//! ```json
//! {"deviceId": "gateway-01", "source": "gateway", "content": {"telemetry": [...]}}
//! ```
//!
//! `source` distinguishes data produced by the gateway itself from data relayed
//! on behalf of a sub-device the gateway represents.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced the data carried by an envelope
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// The gateway's own device identity
    Gateway,
    /// A sub-device represented by the gateway
    Device,
}

/// Payload section of an envelope, serialized as `{"telemetry": ..}` or `{"attribute": ..}`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Content {
    Telemetry(Value),
    Attribute(Value),
}

/// Outgoing message wrapper published to the device-to-cloud topic
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    #[serde(rename = "deviceId")]
    pub device_id: String,
    pub source: Source,
    pub content: Content,
}

impl Envelope {
    /// Telemetry from the gateway itself; readings are normalized first
    pub fn gateway_telemetry(device_id: &str, telemetry: Value) -> Self {
        Self {
            device_id: device_id.to_string(),
            source: Source::Gateway,
            content: Content::Telemetry(normalize_telemetry(telemetry)),
        }
    }

    /// Attributes of the gateway itself
    pub fn gateway_attributes(device_id: &str, attributes: Value) -> Self {
        Self {
            device_id: device_id.to_string(),
            source: Source::Gateway,
            content: Content::Attribute(attributes),
        }
    }

    /// Telemetry relayed for a sub-device, passed through as given
    pub fn device_telemetry(device: &str, telemetry: Value) -> Self {
        Self {
            device_id: device.to_string(),
            source: Source::Device,
            content: Content::Telemetry(telemetry),
        }
    }

    /// Attributes relayed for a sub-device
    pub fn device_attributes(device: &str, attributes: Value) -> Self {
        Self {
            device_id: device.to_string(),
            source: Source::Device,
            content: Content::Attribute(attributes),
        }
    }
}

/// Normalize gateway telemetry into a sequence of readings.
///
/// Lists and single objects with a non-null `ts` field pass through unchanged;
/// anything else becomes a one-element list.
pub fn normalize_telemetry(telemetry: Value) -> Value {
    if is_reading_batch(&telemetry) {
        telemetry
    } else {
        Value::Array(vec![telemetry])
    }
}

fn is_reading_batch(telemetry: &Value) -> bool {
    match telemetry {
        Value::Array(_) => true,
        Value::Object(map) => map.get("ts").is_some_and(|ts| !ts.is_null()),
        _ => false,
    }
}
