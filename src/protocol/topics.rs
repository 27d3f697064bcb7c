//! Topic names and device identifier validation for Azure IoT Hub
//!
//! IoT Hub exposes a fixed set of MQTT topics to devices. Device-to-cloud
//! messages go to a per-device events topic; device twin traffic uses the
//! reserved `$iothub/` namespace.

use thiserror::Error;

/// Twin operation results, subscribed to after every successful connect
pub const TWIN_RESULT_TOPIC: &str = "$iothub/twin/res/#";

/// Prefix for reported-properties twin updates, completed by a request id
pub const TWIN_REPORTED_PREFIX: &str = "$iothub/twin/PATCH/properties/reported/?$rid=";

/// Build the device-to-cloud events topic: `devices/{device_id}/messages/events/`
pub fn device_to_cloud_topic(device_id: &str) -> String {
    format!("devices/{device_id}/messages/events/")
}

/// Build a reported-properties update topic for the given request id
pub fn twin_reported_topic(request_id: &str) -> String {
    format!("{TWIN_REPORTED_PREFIX}{request_id}")
}

/// Validate a device identifier before it is embedded in topics and credentials.
///
/// IoT Hub accepts ASCII alphanumerics plus a handful of punctuation characters;
/// MQTT wildcards and separators (`#`, `+`, `/`) are always rejected.
pub fn validate_device_id(device_id: &str) -> Result<(), ValidationError> {
    if device_id.is_empty() {
        return Err(ValidationError::EmptyDeviceId);
    }

    for ch in device_id.chars() {
        if !ch.is_ascii_alphanumeric() && !matches!(ch, '.' | '_' | '-' | ':') {
            return Err(ValidationError::InvalidDeviceIdChar(ch));
        }
    }

    Ok(())
}

/// Validation errors for device identifiers
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("Device ID cannot be empty")]
    EmptyDeviceId,
    #[error("Device ID contains invalid character: '{0}'")]
    InvalidDeviceIdChar(char),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn device_topic_embeds_id_verbatim(id in "[a-zA-Z0-9._:-]{1,64}") {
            let topic = device_to_cloud_topic(&id);
            prop_assert!(topic.starts_with("devices/"));
            prop_assert!(topic.ends_with("/messages/events/"));
            prop_assert_eq!(&topic["devices/".len()..topic.len() - "/messages/events/".len()], id.as_str());
        }

        #[test]
        fn wildcards_are_never_valid(prefix in "[a-z]{0,8}", wildcard in "[#+/]", suffix in "[a-z]{0,8}") {
            let id = format!("{prefix}{wildcard}{suffix}");
            prop_assert!(validate_device_id(&id).is_err());
        }
    }

    #[test]
    fn test_device_to_cloud_topic() {
        assert_eq!(
            device_to_cloud_topic("gateway-01"),
            "devices/gateway-01/messages/events/"
        );
    }

    #[test]
    fn test_twin_reported_topic() {
        assert_eq!(
            twin_reported_topic("42"),
            "$iothub/twin/PATCH/properties/reported/?$rid=42"
        );
    }

    #[test]
    fn test_validate_device_id() {
        assert!(validate_device_id("gateway-01").is_ok());
        assert!(validate_device_id("plant:line.3_sensor").is_ok());
        assert_eq!(validate_device_id(""), Err(ValidationError::EmptyDeviceId));
        assert_eq!(
            validate_device_id("bad device"),
            Err(ValidationError::InvalidDeviceIdChar(' '))
        );
    }
}
