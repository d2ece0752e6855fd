//! Metadata whitelisting.
//!
//! Caller metadata is arbitrary JSON. Before it reaches the processor or the
//! audit log it is reduced to a bounded map of `[A-Za-z0-9_]+` keys to plain
//! strings without control characters.

use serde_json::Value;

use crate::model::Metadata;

/// Arbitrary metadata as received from upstream handlers.
pub type RawMetadata = serde_json::Map<String, Value>;

/// Default bound on a value, in chars.
pub const DEFAULT_VALUE_LIMIT: usize = 500;

/// Longest key the processor accepts.
pub const MAX_KEY_LEN: usize = 40;

/// Most entries the processor accepts on one object.
pub const MAX_ENTRIES: usize = 50;

#[derive(Debug, Clone, Copy)]
pub struct MetadataSanitizer {
    value_limit: usize,
}

impl MetadataSanitizer {
    pub fn new(value_limit: usize) -> Self {
        Self { value_limit }
    }

    /// Never fails; malformed entries are dropped.
    pub fn sanitize<'a, I>(&self, raw: I) -> Metadata
    where
        I: IntoIterator<Item = (&'a String, &'a Value)>,
    {
        let mut clean: Metadata = raw
            .into_iter()
            .filter(|(key, _)| is_valid_key(key))
            .filter_map(|(key, value)| Some((key.clone(), self.coerce(value)?)))
            .collect();

        if clean.len() > MAX_ENTRIES {
            clean = clean.into_iter().take(MAX_ENTRIES).collect();
        }
        clean
    }

    fn coerce(&self, value: &Value) -> Option<String> {
        let text = match value {
            Value::Null => return None,
            Value::String(s) => s.clone(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Array(_) | Value::Object(_) => value.to_string(),
        };
        Some(
            text.chars()
                .filter(|c| !c.is_control())
                .take(self.value_limit)
                .collect(),
        )
    }
}

impl Default for MetadataSanitizer {
    fn default() -> Self {
        Self::new(DEFAULT_VALUE_LIMIT)
    }
}

fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_')
}
