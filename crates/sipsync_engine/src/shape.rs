//! Known response layouts of collection endpoints.
//!
//! The service wraps collections in a handful of envelopes. Each is a named
//! variant here; anything else is rejected instead of searched for arrays.

use crate::error::{SyncError, SyncResult};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tracing::warn;

/// Payload of `{ "data": { "items": [...] } }`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct NestedItems {
    /// Collection elements.
    pub items: Vec<Value>,
}

/// A collection response.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum CollectionEnvelope {
    /// `[...]`
    Bare(Vec<Value>),
    /// `{ "data": [...] }`
    Data {
        /// Collection elements.
        data: Vec<Value>,
    },
    /// `{ "items": [...] }`
    Items {
        /// Collection elements.
        items: Vec<Value>,
    },
    /// `{ "results": [...] }`
    Results {
        /// Collection elements.
        results: Vec<Value>,
    },
    /// `{ "data": { "items": [...] } }`
    NestedData {
        /// Wrapper holding the elements.
        data: NestedItems,
    },
}

impl CollectionEnvelope {
    /// Matches `value` against the known layouts.
    ///
    /// # Errors
    ///
    /// [`SyncError::UnexpectedShape`] when no layout matches.
    pub fn from_value(value: Value) -> SyncResult<Self> {
        let kind = describe(&value);
        serde_json::from_value(value).map_err(|_| SyncError::UnexpectedShape(kind))
    }

    /// Returns the name of the matched layout.
    pub fn layout(&self) -> &'static str {
        match self {
            Self::Bare(_) => "array",
            Self::Data { .. } => "data",
            Self::Items { .. } => "items",
            Self::Results { .. } => "results",
            Self::NestedData { .. } => "data.items",
        }
    }

    /// Returns the collection elements.
    pub fn into_elements(self) -> Vec<Value> {
        match self {
            Self::Bare(elements)
            | Self::Data { data: elements }
            | Self::Items { items: elements }
            | Self::Results { results: elements }
            | Self::NestedData {
                data: NestedItems { items: elements },
            } => elements,
        }
    }
}

/// Records decoded from a collection response.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded<R> {
    /// Elements that decoded into records.
    pub records: Vec<R>,
    /// Elements that did not.
    pub undecodable: usize,
}

/// Decodes every element of a collection response into `R`.
///
/// Elements that fail to decode are logged and counted, not fatal.
pub fn decode_records<R: DeserializeOwned>(value: Value) -> SyncResult<Decoded<R>> {
    let envelope = CollectionEnvelope::from_value(value)?;
    let layout = envelope.layout();
    let mut decoded = Decoded {
        records: Vec::new(),
        undecodable: 0,
    };
    for (index, element) in envelope.into_elements().into_iter().enumerate() {
        match serde_json::from_value(element) {
            Ok(record) => decoded.records.push(record),
            Err(e) => {
                warn!(layout, index, error = %e, "skipping undecodable element");
                decoded.undecodable += 1;
            }
        }
    }
    Ok(decoded)
}

fn describe(value: &Value) -> String {
    match value {
        Value::Object(map) => {
            let keys: Vec<&str> = map.keys().map(String::as_str).collect();
            format!("object with keys [{}]", keys.join(", "))
        }
        Value::Array(_) => "array".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Null => "null".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sipsync_core::CatalogItem;

    #[test]
    fn recognises_every_layout() {
        let element = json!({"id": 1, "name": "Stout"});
        let cases = [
            (json!([element]), "array"),
            (json!({"data": [element], "page": 1}), "data"),
            (json!({"items": [element]}), "items"),
            (json!({"results": [element], "count": 1}), "results"),
            (json!({"data": {"items": [element]}}), "data.items"),
        ];
        for (value, layout) in cases {
            let envelope = CollectionEnvelope::from_value(value).unwrap();
            assert_eq!(envelope.layout(), layout);
            assert_eq!(envelope.into_elements(), vec![element.clone()]);
        }
    }

    #[test]
    fn rejects_unknown_layouts() {
        let err = CollectionEnvelope::from_value(json!({"beers": []})).unwrap_err();
        assert!(matches!(&err, SyncError::UnexpectedShape(kind) if kind.contains("beers")));

        assert!(CollectionEnvelope::from_value(json!("nope")).is_err());
        assert!(CollectionEnvelope::from_value(json!({"data": 3})).is_err());
    }

    #[test]
    fn undecodable_elements_are_counted() {
        let decoded: Decoded<CatalogItem> = decode_records(json!({"items": [
            {"id": "1", "name": "Pils"},
            "not an object",
            {"id": 2, "name": "Bock", "abv": "strong"},
            {"id": 3}
        ]}))
        .unwrap();

        assert_eq!(decoded.records.len(), 2);
        assert_eq!(decoded.undecodable, 2);
        assert_eq!(decoded.records[1].id.as_deref(), Some("3"));
    }
}
