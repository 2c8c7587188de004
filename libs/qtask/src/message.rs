//! Surfaced message type.
//!
//! Wraps a reconstructed stream entry with its metadata: the
//! server-assigned entry id, the ordered field pairs, and the partition
//! it came from. The entry id embeds the append timestamp, which gives
//! handlers a free age signal for staleness decisions.

use chrono::{DateTime, Utc};

/// A message delivered to a partition handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Redis stream entry id (e.g. `"1234567890123-0"`).
    pub id: String,

    /// Reconstructed field pairs, in server field order.
    pub fields: Vec<(String, String)>,

    /// Index of the partition stream this entry was read from.
    pub partition: u32,
}

impl Message {
    pub fn new(id: String, fields: Vec<(String, String)>, partition: u32) -> Self {
        Self {
            id,
            fields,
            partition,
        }
    }

    /// Value of the first field with the given name.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }

    /// Iterate the field pairs in server order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.fields.iter().map(|(f, v)| (f.as_str(), v.as_str()))
    }

    /// When the entry was appended, parsed from the entry id.
    ///
    /// Stream ids are `"timestamp_ms-sequence"`; an unparseable id
    /// falls back to now.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.id
            .split('-')
            .next()
            .and_then(|ts| ts.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis)
            .unwrap_or_else(Utc::now)
    }

    /// Time since the entry was appended.
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.timestamp()
    }
}
