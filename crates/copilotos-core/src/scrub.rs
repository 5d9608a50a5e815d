use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

/// PII scrubbing for log output and error details.
///
/// Redacts emails, US phone numbers, SSNs, 16-digit card numbers, IPv4
/// addresses and — only when the surrounding text mentions a key or token —
/// long opaque token-like strings. Applied before any value reaches a log
/// sink that may forward events off-host.

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b").expect("email regex")
});
static SSN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").expect("ssn regex"));
static CREDIT_CARD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b").expect("card regex")
});
static PHONE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:\d{3}[-.\s]?)?\d{3}[-.\s]?\d{4}\b").expect("phone regex")
});
static IPV4: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?:\d{1,3}\.){3}\d{1,3}\b").expect("ip regex"));
static API_KEY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b[A-Za-z0-9_-]{32,}\b").expect("key regex"));

/// Scrub PII from a text fragment.
pub fn scrub(text: &str) -> String {
    let mut out = EMAIL.replace_all(text, "[EMAIL_REDACTED]").into_owned();
    out = SSN.replace_all(&out, "[SSN_REDACTED]").into_owned();
    out = CREDIT_CARD.replace_all(&out, "[CC_REDACTED]").into_owned();
    out = PHONE.replace_all(&out, "[PHONE_REDACTED]").into_owned();
    out = IPV4.replace_all(&out, "[IP_REDACTED]").into_owned();

    // Long opaque strings are only treated as secrets when the text itself
    // talks about keys or tokens, to avoid eating ordinary identifiers.
    let lowered = out.to_ascii_lowercase();
    if lowered.contains("key") || lowered.contains("token") {
        out = API_KEY.replace_all(&out, "[KEY_REDACTED]").into_owned();
    }
    out
}

/// Recursively scrub every string inside a JSON value. Keys whose name
/// mentions a key/token force redaction of long opaque values too.
pub fn scrub_value(value: &Value) -> Value {
    scrub_value_inner(value, false)
}

fn scrub_value_inner(value: &Value, secret_context: bool) -> Value {
    match value {
        Value::String(s) => {
            let mut scrubbed = scrub(s);
            if secret_context {
                scrubbed = API_KEY.replace_all(&scrubbed, "[KEY_REDACTED]").into_owned();
            }
            Value::String(scrubbed)
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| {
                    let lowered = k.to_ascii_lowercase();
                    let secret = secret_context
                        || lowered.contains("key")
                        || lowered.contains("token");
                    (k.clone(), scrub_value_inner(v, secret))
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| scrub_value_inner(v, secret_context))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scrubs_email() {
        assert_eq!(
            scrub("contact ana.lopez@example.mx please"),
            "contact [EMAIL_REDACTED] please"
        );
    }

    #[test]
    fn scrubs_ssn_and_card() {
        let out = scrub("ssn 123-45-6789 card 4111 1111 1111 1111");
        assert!(out.contains("[SSN_REDACTED]"));
        assert!(out.contains("[CC_REDACTED]"));
    }

    #[test]
    fn scrubs_ip() {
        assert_eq!(scrub("from 10.0.0.12"), "from [IP_REDACTED]");
    }

    #[test]
    fn long_tokens_only_scrubbed_in_key_context() {
        let token = "abcdefghijklmnopqrstuvwxyz0123456789ABCD";
        let plain = format!("id {token}");
        assert!(scrub(&plain).contains(token));

        let keyed = format!("api key {token}");
        assert!(scrub(&keyed).contains("[KEY_REDACTED]"));
    }

    #[test]
    fn scrub_value_recurses_and_honors_key_names() {
        let value = json!({
            "email": "a@b.example",
            "api_key": "abcdefghijklmnopqrstuvwxyz0123456789ABCD",
            "nested": { "phones": ["555-123-4567"] }
        });
        let scrubbed = scrub_value(&value);
        assert_eq!(scrubbed["email"], "[EMAIL_REDACTED]");
        assert_eq!(scrubbed["api_key"], "[KEY_REDACTED]");
        assert_eq!(scrubbed["nested"]["phones"][0], "[PHONE_REDACTED]");
    }
}
