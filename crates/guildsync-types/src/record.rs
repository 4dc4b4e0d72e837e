//! Stream records and the id-keyed ledger map.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::key::StreamClass;

/// Unique identifier of a record within one stream (e.g. a message id).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for RecordId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// One application-level item in a stream: an id plus an opaque JSON body.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: RecordId,
    pub body: Value,
}

impl Record {
    pub fn new(id: impl Into<RecordId>, body: Value) -> Self {
        Self {
            id: id.into(),
            body,
        }
    }

    /// Classify the record by its author flags (`isBot`, or the scraper's
    /// `meta_data.isBot`). Unknown shapes default to [`StreamClass::Member`].
    pub fn stream_class(&self) -> StreamClass {
        let flag = self
            .body
            .get("isBot")
            .or_else(|| self.body.get("meta_data").and_then(|m| m.get("isBot")))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if flag {
            StreamClass::Bot
        } else {
            StreamClass::Member
        }
    }
}

/// The persisted shape of a ledger blob: a mapping from record id to body.
///
/// A mapping rather than an array, so id-based dedup and CAS re-merge are
/// O(log n) per record.
pub type LedgerMap = BTreeMap<RecordId, Value>;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_by_bot_flag() {
        let member = Record::new("1", json!({"content": "hi"}));
        assert_eq!(member.stream_class(), StreamClass::Member);

        let bot = Record::new("2", json!({"isBot": true}));
        assert_eq!(bot.stream_class(), StreamClass::Bot);

        let nested = Record::new("3", json!({"meta_data": {"isBot": true}}));
        assert_eq!(nested.stream_class(), StreamClass::Bot);
    }

    #[test]
    fn record_id_serializes_transparently() {
        let mut map = LedgerMap::new();
        map.insert(RecordId::new("42"), json!({"content": "x"}));
        let encoded = serde_json::to_string(&map).unwrap();
        assert_eq!(encoded, r#"{"42":{"content":"x"}}"#);
    }
}
