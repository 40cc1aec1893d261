//! Defensive parsing of model output.
//!
//! Models wrap JSON in prose or code fences. We try the whole text first,
//! then the outermost `{...}` block. Callers decide what a miss means.

use lazy_static::lazy_static;
use regex::Regex;
use serde::de::DeserializeOwned;

lazy_static! {
    // Greedy: from the first '{' to the last '}'.
    static ref JSON_OBJECT: Regex = Regex::new(r"(?s)\{.*\}").unwrap();
}

/// Extract and decode the first JSON object embedded in `text`.
pub fn extract_json<T: DeserializeOwned>(text: &str) -> Option<T> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str(trimmed) {
        return Some(value);
    }
    let block = JSON_OBJECT.find(trimmed)?;
    serde_json::from_str(block.as_str()).ok()
}

/// Extract the first JSON object as a map, if any.
pub fn extract_object(text: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    match extract_json::<serde_json::Value>(text)? {
        serde_json::Value::Object(map) => Some(map),
        _ => None,
    }
}

/// Read a string array field, ignoring non-string members.
pub fn string_list(map: &serde_json::Map<String, serde_json::Value>, key: &str) -> Vec<String> {
    map.get(key)
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}
