//! [`StreamEntry`]: one immutable record read from a stream log.

use std::collections::BTreeMap;

/// A stream entry as delivered by the upstream consumer-group read.
///
/// `id` is the store's opaque, millisecond-lexicographic identifier; it is
/// unique within `stream` and monotonically non-decreasing. `fields` is the
/// raw field map exactly as stored — re-serialization into the downstream
/// [`crate::Envelope`] happens in the bridge's envelope builder, not here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub stream: String,
    pub fields: BTreeMap<String, String>,
}

impl StreamEntry {
    pub fn new(id: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            stream: stream.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Entries with no fields are rejected before publishing.
    pub fn has_empty_body(&self) -> bool {
        self.fields.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_has_empty_body() {
        let entry = StreamEntry::new("1-0", "S");
        assert!(entry.has_empty_body());

        let entry = entry.with_field("raw", "r");
        assert!(!entry.has_empty_body());
    }
}
