//! Payload scrubbing for provider requests, responses and logs.

use serde_json::Value;

/// Token-limit fields stripped from payloads before they cross the provider
/// boundary in either direction. Deployments pin limits centrally; clients
/// must not smuggle their own.
const MAX_TOKEN_FIELD_NAMES: &[&str] = &[
    "max_tokens",
    "maxTokens",
    "max_output_tokens",
    "maxOutputTokens",
    "max_completion_tokens",
    "maxCompletionTokens",
    "max_input_tokens",
    "maxInputTokens",
];

/// Fields redacted from payloads destined for logs.
const SECRET_FIELD_NAMES: &[&str] = &[
    "client_secret",
    "api_key",
    "apiKey",
    "authorization",
    "Authorization",
    "value",
];

/// Recursively remove token-limit fields. Returns the sanitized value and
/// whether anything was removed.
pub fn strip_max_token_fields(value: &Value) -> (Value, bool) {
    match value {
        Value::Object(map) => {
            let mut sanitized = serde_json::Map::with_capacity(map.len());
            let mut removed_any = false;
            for (key, item) in map {
                if MAX_TOKEN_FIELD_NAMES.contains(&key.as_str()) {
                    removed_any = true;
                    continue;
                }
                let (sanitized_item, removed) = strip_max_token_fields(item);
                sanitized.insert(key.clone(), sanitized_item);
                removed_any |= removed;
            }
            (Value::Object(sanitized), removed_any)
        }
        Value::Array(items) => {
            let mut sanitized = Vec::with_capacity(items.len());
            let mut removed_any = false;
            for item in items {
                let (sanitized_item, removed) = strip_max_token_fields(item);
                sanitized.push(sanitized_item);
                removed_any |= removed;
            }
            (Value::Array(sanitized), removed_any)
        }
        other => (other.clone(), false),
    }
}

/// Replace secret-bearing fields with `"<redacted>"` for logging. The
/// original value is left untouched.
pub fn redact_secrets(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut redacted = serde_json::Map::with_capacity(map.len());
            for (key, item) in map {
                if SECRET_FIELD_NAMES.contains(&key.as_str()) {
                    redacted.insert(key.clone(), Value::String("<redacted>".to_string()));
                } else {
                    redacted.insert(key.clone(), redact_secrets(item));
                }
            }
            Value::Object(redacted)
        }
        Value::Array(items) => Value::Array(items.iter().map(redact_secrets).collect()),
        other => other.clone(),
    }
}
