//! Core data types shared by the loader, builder, backends and tool surface.

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Semantic role of a column; selects the kind of scoring space it feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    TextSimilarity,
    Recency,
    Number,
    Category,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::TextSimilarity => "text_similarity",
            Role::Recency => "recency",
            Role::Number => "number",
            Role::Category => "category",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "text_similarity" => Ok(Role::TextSimilarity),
            "recency" => Ok(Role::Recency),
            "number" => Ok(Role::Number),
            "category" => Ok(Role::Category),
            other => Err(format!(
                "invalid role '{}': expected one of text_similarity, recency, number, category, auto",
                other
            )),
        }
    }
}

/// A role as requested by a caller: fixed, or left to the detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleSpec {
    Auto,
    Fixed(Role),
}

impl FromStr for RoleSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim() == "auto" {
            Ok(RoleSpec::Auto)
        } else {
            s.parse().map(RoleSpec::Fixed)
        }
    }
}

/// Ordered column → role mapping.
///
/// Iteration order is insertion order, which decides the anchor text space
/// (the first `text_similarity` column). Serialized as a JSON object whose
/// key order is preserved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnMapping {
    entries: Vec<(String, Role)>,
}

impl ColumnMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace; a replaced column keeps its original position.
    pub fn insert(&mut self, column: impl Into<String>, role: Role) {
        let column = column.into();
        match self.entries.iter_mut().find(|(c, _)| *c == column) {
            Some(entry) => entry.1 = role,
            None => self.entries.push((column, role)),
        }
    }

    pub fn get(&self, column: &str) -> Option<Role> {
        self.entries
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, r)| *r)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Role)> {
        self.entries.iter().map(|(c, r)| (c.as_str(), *r))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(c, _)| c.as_str())
    }

    pub fn columns_with_role(&self, role: Role) -> impl Iterator<Item = &str> {
        self.entries
            .iter()
            .filter(move |(_, r)| *r == role)
            .map(|(c, _)| c.as_str())
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.entries.iter().any(|(_, r)| *r == role)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, Role)> for ColumnMapping {
    fn from_iter<I: IntoIterator<Item = (S, Role)>>(iter: I) -> Self {
        let mut mapping = ColumnMapping::new();
        for (column, role) in iter {
            mapping.insert(column, role);
        }
        mapping
    }
}

impl Serialize for ColumnMapping {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (column, role) in &self.entries {
            map.serialize_entry(column, role)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ColumnMapping {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct MappingVisitor;

        impl<'de> Visitor<'de> for MappingVisitor {
            type Value = ColumnMapping;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object mapping column names to roles")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut mapping = ColumnMapping::new();
                while let Some((column, role)) = access.next_entry::<String, Role>()? {
                    mapping.insert(column, role);
                }
                Ok(mapping)
            }
        }

        deserializer.deserialize_map(MappingVisitor)
    }
}

/// Column name → query-time weight multiplier.
pub type SpaceWeights = BTreeMap<String, f64>;

/// Distinct observed values of one category column.
pub type CategorySet = Vec<String>;

/// Category column name → its [`CategorySet`].
pub type Categories = BTreeMap<String, CategorySet>;

/// One row of a loaded table, keyed by column name in column order.
pub type Row = Map<String, Value>;

/// A row encoded for ingestion: the string id plus one value per mapped
/// column (recency as epoch seconds, numbers as floats, the rest as strings).
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: String,
    pub fields: Map<String, Value>,
}

impl Record {
    /// The ingest request body: `{ "id": ..., <column>: ... }`.
    pub fn to_body(&self) -> Value {
        let mut body = Map::new();
        body.insert("id".to_string(), Value::String(self.id.clone()));
        for (k, v) in &self.fields {
            body.insert(k.clone(), v.clone());
        }
        Value::Object(body)
    }
}

/// Persisted description of one index, enough to rebuild it without the
/// original creation request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetadataRecord {
    #[serde(default = "default_true")]
    pub is_metadata: bool,
    pub index_name: String,
    pub source_filename: String,
    /// Resolved location of the source file at creation time.
    #[serde(default)]
    pub source_path: String,
    pub column_mapping: ColumnMapping,
    pub total_rows: usize,
    #[serde(default)]
    pub weights: SpaceWeights,
    #[serde(default)]
    pub categories: Categories,
    #[serde(default)]
    pub created_at: i64,
}

fn default_true() -> bool {
    true
}

/// Per-batch ingestion tally. Row failures are counted, never fatal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestSummary {
    pub ingested: usize,
    pub errors: usize,
}

/// Parameters of one query against an index.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRequest {
    pub search_query: String,
    pub limit: usize,
    /// Overrides for the stored default weights, by column.
    pub weights: SpaceWeights,
    /// Category values to match, by category column.
    pub categories: BTreeMap<String, String>,
}

/// One ranked result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueryHit {
    pub id: String,
    pub score: f64,
    pub fields: Map<String, Value>,
}
