use serde::{Deserialize, Serialize};

/// Collections the client subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Collection {
    Matches,
    Messages,
}

/// A record as delivered by the document database, before normalization.
///
/// `data` keeps the database's loose shape; typed access happens in
/// [`crate::normalize`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    pub collection: Collection,
    pub id: String,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RawDocument {
    /// String field lookup on `data`; `None` when missing or not a string.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.data.get(name).and_then(|v| v.as_str())
    }
}
