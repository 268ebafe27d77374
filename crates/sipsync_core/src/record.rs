//! Cached record types.
//!
//! Every cached collection row implements [`CachedRecord`], which ties the
//! Rust type to its table and column list and defines how the row is
//! validated before it may be persisted.
//!
//! Remote payloads are loosely typed: identifiers arrive as strings or
//! numbers and optional fields may be missing or `null`. Records therefore
//! keep their key as `Option<String>` and validation, not deserialization,
//! decides whether a record is usable.

use crate::engine::{Row, SqlValue};
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Deserializer, Serialize};

/// A row of a fully-replaced cached collection.
pub trait CachedRecord: Clone + Send + Sync + 'static {
    /// Table holding the collection.
    const TABLE: &'static str;

    /// Column names in the order returned by [`values`](Self::values).
    ///
    /// The first column is the primary key.
    const COLUMNS: &'static [&'static str];

    /// Returns the primary key, if the record has one.
    fn key(&self) -> Option<&str>;

    /// Checks that the record may be persisted.
    ///
    /// The default only requires a valid key.
    fn validate(&self) -> Result<(), String> {
        validate_key(self.key())
    }

    /// Returns the column values in [`COLUMNS`](Self::COLUMNS) order.
    fn values(&self) -> Vec<SqlValue>;

    /// Rebuilds a record from a stored row.
    fn from_row(row: &Row) -> CoreResult<Self>;
}

/// Rejects a missing, empty or whitespace-only key.
pub fn validate_key(key: Option<&str>) -> Result<(), String> {
    validate_required("id", key)
}

/// Rejects a missing, empty or whitespace-only required field.
pub fn validate_required(field: &str, value: Option<&str>) -> Result<(), String> {
    match value {
        None => Err(format!("{field} is missing")),
        Some(v) if v.trim().is_empty() => Err(format!("{field} is empty")),
        Some(_) => Ok(()),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LooseId {
    Text(String),
    Integer(i64),
    Float(f64),
}

/// Accepts a JSON string, number or `null` and normalises it to a string.
pub(crate) fn string_or_number<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<LooseId>::deserialize(deserializer)?.map(|id| match id {
        LooseId::Text(s) => s,
        LooseId::Integer(i) => i.to_string(),
        LooseId::Float(f) => f.to_string(),
    }))
}

fn stored_key(row: &Row, table: &str) -> CoreResult<Option<String>> {
    match row.get("id") {
        Some(SqlValue::Text(s)) => Ok(Some(s.clone())),
        Some(SqlValue::Integer(i)) => Ok(Some(i.to_string())),
        _ => Err(CoreError::invalid_row(table, "row has no id")),
    }
}

/// A beer in the remote catalog.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogItem {
    /// Catalog identifier.
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    /// Display name. Required.
    #[serde(default)]
    pub name: Option<String>,
    /// Brewery name.
    #[serde(default)]
    pub brewery: Option<String>,
    /// Beer style.
    #[serde(default)]
    pub style: Option<String>,
    /// Alcohol by volume, in percent.
    #[serde(default)]
    pub abv: Option<f64>,
    /// Free-form description.
    #[serde(default)]
    pub description: Option<String>,
    /// Label image location.
    #[serde(default, alias = "image_url")]
    pub image_url: Option<String>,
    /// Last remote modification time.
    #[serde(default, alias = "updated_at")]
    pub updated_at: Option<String>,
}

impl CachedRecord for CatalogItem {
    const TABLE: &'static str = "catalog_items";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "name",
        "brewery",
        "style",
        "abv",
        "description",
        "image_url",
        "updated_at",
    ];

    fn key(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn validate(&self) -> Result<(), String> {
        validate_key(self.key())?;
        validate_required("name", self.name.as_deref())
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.id.clone().into(),
            self.name.clone().into(),
            self.brewery.clone().into(),
            self.style.clone().into(),
            self.abv.into(),
            self.description.clone().into(),
            self.image_url.clone().into(),
            self.updated_at.clone().into(),
        ]
    }

    fn from_row(row: &Row) -> CoreResult<Self> {
        Ok(Self {
            id: stored_key(row, Self::TABLE)?,
            name: row.text("name"),
            brewery: row.text("brewery"),
            style: row.text("style"),
            abv: row.real("abv"),
            description: row.text("description"),
            image_url: row.text("image_url"),
            updated_at: row.text("updated_at"),
        })
    }
}

/// An entry in the user's tasting history.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TastedItem {
    /// History entry identifier.
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    /// Catalog item that was tasted. Required.
    #[serde(
        default,
        alias = "catalog_item_id",
        alias = "beerId",
        deserialize_with = "string_or_number"
    )]
    pub catalog_item_id: Option<String>,
    /// Name shown in the history list.
    #[serde(default)]
    pub name: Option<String>,
    /// When the tasting happened.
    #[serde(default, alias = "tasted_at")]
    pub tasted_at: Option<String>,
    /// User rating.
    #[serde(default)]
    pub rating: Option<f64>,
    /// Tasting notes.
    #[serde(default)]
    pub notes: Option<String>,
}

impl CachedRecord for TastedItem {
    const TABLE: &'static str = "tasted_items";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "catalog_item_id",
        "name",
        "tasted_at",
        "rating",
        "notes",
    ];

    fn key(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn validate(&self) -> Result<(), String> {
        validate_key(self.key())?;
        validate_required("catalog_item_id", self.catalog_item_id.as_deref())
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.id.clone().into(),
            self.catalog_item_id.clone().into(),
            self.name.clone().into(),
            self.tasted_at.clone().into(),
            self.rating.into(),
            self.notes.clone().into(),
        ]
    }

    fn from_row(row: &Row) -> CoreResult<Self> {
        Ok(Self {
            id: stored_key(row, Self::TABLE)?,
            catalog_item_id: row.text("catalog_item_id"),
            name: row.text("name"),
            tasted_at: row.text("tasted_at"),
            rating: row.real("rating"),
            notes: row.text("notes"),
        })
    }
}

/// A reward or badge earned by the user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reward {
    /// Reward identifier.
    #[serde(default, deserialize_with = "string_or_number")]
    pub id: Option<String>,
    /// Reward title. Required.
    #[serde(default)]
    pub name: Option<String>,
    /// What the reward is for.
    #[serde(default)]
    pub description: Option<String>,
    /// When it was earned; `None` while in progress.
    #[serde(default, alias = "earned_at")]
    pub earned_at: Option<String>,
    /// Completion ratio between 0 and 1.
    #[serde(default)]
    pub progress: Option<f64>,
}

impl CachedRecord for Reward {
    const TABLE: &'static str = "rewards";
    const COLUMNS: &'static [&'static str] =
        &["id", "name", "description", "earned_at", "progress"];

    fn key(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn validate(&self) -> Result<(), String> {
        validate_key(self.key())?;
        validate_required("name", self.name.as_deref())
    }

    fn values(&self) -> Vec<SqlValue> {
        vec![
            self.id.clone().into(),
            self.name.clone().into(),
            self.description.clone().into(),
            self.earned_at.clone().into(),
            self.progress.into(),
        ]
    }

    fn from_row(row: &Row) -> CoreResult<Self> {
        Ok(Self {
            id: stored_key(row, Self::TABLE)?,
            name: row.text("name"),
            description: row.text("description"),
            earned_at: row.text("earned_at"),
            progress: row.real("progress"),
        })
    }
}
