//! Redaction of passwords and tokens before values reach a log line.

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

/// Placeholder written in place of a secret value
pub const REDACTED: &str = "[REDACTED]";

static SECRET_KEY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(password|passwd|secret|token|credential|private[_.-]?key)")
        .expect("secret key regex must compile")
});

static BEARER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Bearer\s+[a-zA-Z0-9\-_\.=]+").expect("bearer regex must compile")
});

static INLINE_SECRET: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(["']?[a-z0-9_.\-]*(?:password|passwd|secret|token)[a-z0-9_.\-]*["']?\s*[:=]\s*)["']?[^"'\s,}]+["']?"#,
    )
    .expect("inline secret regex must compile")
});

/// Redacts secrets from command descriptors and free text before logging
#[derive(Debug, Clone, Copy, Default)]
pub struct SecretScrubber;

impl SecretScrubber {
    /// Create a scrubber
    pub const fn new() -> Self {
        Self
    }

    /// Whether a configuration key names a secret value
    pub fn is_secret_key(key: &str) -> bool {
        SECRET_KEY.is_match(key)
    }

    /// Copy of `value` with every string under a secret-looking key redacted
    pub fn scrub_json(&self, value: &Value) -> Value {
        match value {
            Value::Object(map) => Value::Object(
                map.iter()
                    .map(|(key, v)| {
                        let scrubbed = if Self::is_secret_key(key) && !v.is_object() && !v.is_array()
                        {
                            Value::String(REDACTED.to_string())
                        } else {
                            self.scrub_json(v)
                        };
                        (key.clone(), scrubbed)
                    })
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(|v| self.scrub_json(v)).collect()),
            other => other.clone(),
        }
    }

    /// Scrub a message of sensitive data
    pub fn scrub_message(&self, message: &str) -> String {
        let scrubbed = BEARER.replace_all(message, "Bearer [TOKEN_REDACTED]");
        INLINE_SECRET
            .replace_all(&scrubbed, format!("${{1}}{REDACTED}").as_str())
            .into_owned()
    }
}
