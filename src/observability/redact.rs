//! Secret redaction for log output and displayed configuration
//!
//! SAS tokens end up in MQTT credentials and occasionally in library error
//! text. Anything that looks like a signature, key or token value is masked
//! before it reaches a log line.

use once_cell::sync::Lazy;
use regex::Regex;

static SECRET_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(sig|signature|password|token|key|secret|sharedaccesskey)(\s*[=:]\s*)[^&\s,;]+")
        .unwrap()
});

/// Mask secret values in free-form text
pub fn redact_secrets(message: &str) -> String {
    SECRET_PATTERN
        .replace_all(message, "${1}${2}***")
        .to_string()
}

/// Mask a whole SAS token, keeping only the resource it grants access to
pub fn redact_token(token: &str) -> String {
    let resource = token
        .split(['&', ' '])
        .find_map(|part| part.strip_prefix("sr="));

    match resource {
        Some(resource) => format!("SharedAccessSignature sr={resource}&sig=***"),
        None => "***".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signature_is_masked() {
        let message = "SharedAccessSignature sr=hub.azure-devices.net%2Fdevices%2Fgw&sig=AbC%2Bdef&se=1700000000";
        let redacted = redact_secrets(message);

        assert!(!redacted.contains("AbC%2Bdef"));
        assert!(redacted.contains("sig=***"));
        assert!(redacted.contains("se=1700000000"));
    }

    #[test]
    fn test_multiple_secrets() {
        let message = "password=pass1 token: tok456 SharedAccessKey=key123";
        let redacted = redact_secrets(message);

        assert!(!redacted.contains("pass1"));
        assert!(!redacted.contains("tok456"));
        assert!(!redacted.contains("key123"));
    }

    #[test]
    fn test_plain_text_untouched() {
        let message = "connection refused by hub.azure-devices.net:8883";
        assert_eq!(redact_secrets(message), message);
    }

    #[test]
    fn test_redact_token_keeps_resource() {
        let token = "SharedAccessSignature sr=hub.azure-devices.net%2Fdevices%2Fgw&sig=secret&se=1";
        assert_eq!(
            redact_token(token),
            "SharedAccessSignature sr=hub.azure-devices.net%2Fdevices%2Fgw&sig=***"
        );
        assert_eq!(redact_token("opaque"), "***");
    }
}
