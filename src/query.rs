//! Index and query assembly.
//!
//! An [`IndexPlan`] is the composition of every built space for one dataset,
//! plus (when an anchor text space exists) a parameterized [`QueryDef`]:
//! free-text search term, one weight per space and a result limit. Backends
//! consume plans; nothing here talks to the network.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::collections::BTreeMap;

use crate::config::Config;
use crate::error::{RagError, RagResult};
use crate::models::{
    Categories, ColumnMapping, MetadataRecord, QueryRequest, Record, Role, Row, SpaceWeights,
};
use crate::schema::{build_spaces, SchemaDef, Space, SpaceKind, SpaceSet};
use crate::table::{parse_datetime, value_to_string, ID_COLUMN};

/// One per-space weight parameter of a query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightParam {
    pub column: String,
    pub space: String,
    pub default: f64,
}

/// A parameterized query bound to one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryDef {
    /// `{index}_query`
    pub name: String,
    /// Column of the anchor text space the search term is compared against.
    pub anchor_column: String,
    pub weights: Vec<WeightParam>,
}

/// Everything a backend needs to serve one index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexPlan {
    pub name: String,
    pub mapping: ColumnMapping,
    pub schema: SchemaDef,
    pub spaces: Vec<Space>,
    pub query: Option<QueryDef>,
    /// Source file the rows come from, for loaders that read it themselves.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
}

/// The query for a space set, or `None` when it has no anchor text space.
pub fn create_query(index_name: &str, set: &SpaceSet) -> Option<QueryDef> {
    let anchor = set.anchor_space()?;
    Some(QueryDef {
        name: format!("{}_query", index_name),
        anchor_column: anchor.column.clone(),
        weights: set
            .spaces
            .iter()
            .map(|s| WeightParam {
                column: s.column.clone(),
                space: s.name.clone(),
                default: s.default_weight,
            })
            .collect(),
    })
}

/// Compose built spaces into an index plan.
pub fn assemble(index_name: &str, mapping: &ColumnMapping, set: SpaceSet) -> IndexPlan {
    let query = create_query(index_name, &set);
    if query.is_none() {
        tracing::warn!(index = index_name, "no text_similarity space; index has no query");
    }
    IndexPlan {
        name: index_name.to_string(),
        mapping: mapping.clone(),
        schema: set.schema,
        spaces: set.spaces,
        query,
        source_path: None,
    }
}

/// Build spaces and assemble them in one step.
pub fn build_plan(
    index_name: &str,
    mapping: &ColumnMapping,
    categories: &Categories,
    weights: &SpaceWeights,
    config: &Config,
) -> RagResult<IndexPlan> {
    let set = build_spaces(
        index_name,
        mapping,
        categories,
        weights,
        &config.spaces,
        &config.embedding.model,
    )?;
    Ok(assemble(index_name, mapping, set))
}

/// Weights are finite and not negative; zero switches a space off.
pub fn check_weight(column: &str, weight: f64) -> RagResult<()> {
    if weight.is_finite() && weight >= 0.0 {
        Ok(())
    } else {
        Err(RagError::InvalidInput(format!(
            "weight for '{}' must be a finite number >= 0, got {}",
            column, weight
        )))
    }
}

/// Rebuild a plan from its persisted metadata.
pub fn plan_from_record(record: &MetadataRecord, config: &Config) -> RagResult<IndexPlan> {
    let mut plan = build_plan(
        &record.index_name,
        &record.column_mapping,
        &record.categories,
        &record.weights,
        config,
    )?;
    if !record.source_path.is_empty() {
        plan.source_path = Some(record.source_path.clone());
    }
    Ok(plan)
}

impl IndexPlan {
    pub fn schema_name(&self) -> &str {
        &self.schema.name
    }

    pub fn space_for(&self, column: &str) -> Option<&Space> {
        self.spaces.iter().find(|s| s.column == column)
    }

    /// Every category filter must name a category space of this index.
    pub fn check_category_filters(&self, filters: &BTreeMap<String, String>) -> RagResult<()> {
        for column in filters.keys() {
            match self.space_for(column).map(|s| s.kind.role()) {
                Some(Role::Category) => {}
                Some(role) => {
                    return Err(RagError::InvalidInput(format!(
                        "category filter on '{}', which is a {} column",
                        column, role
                    )))
                }
                None => {
                    return Err(RagError::InvalidInput(format!(
                        "category filter on '{}', which has no space in index '{}'",
                        column, self.name
                    )))
                }
            }
        }
        Ok(())
    }

    /// The query definition, or an error naming the index when it has none.
    pub fn require_query(&self) -> RagResult<&QueryDef> {
        self.query.as_ref().ok_or_else(|| {
            RagError::InvalidInput(format!(
                "index '{}' has no text_similarity column and cannot be queried",
                self.name
            ))
        })
    }

    /// Stored default weights overlaid with per-call overrides.
    ///
    /// Overrides must name a column that has a space; see [`check_weight`].
    pub fn resolve_weights(&self, overrides: &SpaceWeights) -> RagResult<SpaceWeights> {
        let mut weights: SpaceWeights = self
            .spaces
            .iter()
            .map(|s| (s.column.clone(), s.default_weight))
            .collect();
        for (column, weight) in overrides {
            check_weight(column, *weight)?;
            match weights.get_mut(column) {
                Some(w) => *w = *weight,
                None => {
                    return Err(RagError::InvalidInput(format!(
                        "no space for column '{}' in index '{}' (spaces: {})",
                        column,
                        self.name,
                        self.spaces
                            .iter()
                            .map(|s| s.column.as_str())
                            .collect::<Vec<_>>()
                            .join(", ")
                    )))
                }
            }
        }
        Ok(weights)
    }

    /// Search request body: `search_query`, `limit` and `<column>_weight`
    /// for every space.
    pub fn search_body(&self, request: &QueryRequest) -> RagResult<Value> {
        self.require_query()?;
        let weights = self.resolve_weights(&request.weights)?;
        let mut body = Map::new();
        body.insert(
            "search_query".to_string(),
            Value::String(request.search_query.clone()),
        );
        body.insert("limit".to_string(), Value::from(request.limit));
        for (column, weight) in weights {
            if let Some(n) = Number::from_f64(weight) {
                body.insert(format!("{}_weight", column), Value::Number(n));
            }
        }
        Ok(Value::Object(body))
    }

    /// Encode one table row for ingestion.
    ///
    /// Missing values are left out. Recency values become integer epoch
    /// seconds and number values floats; a value that cannot be converted
    /// fails the row.
    pub fn encode_row(&self, row: &Row) -> RagResult<Record> {
        let id = match row.get(ID_COLUMN) {
            Some(v) if !v.is_null() => value_to_string(v),
            _ => return Err(RagError::InvalidInput("row has no id".to_string())),
        };

        let mut fields = Map::new();
        for (column, role) in self.mapping.iter() {
            let value = match row.get(column) {
                None | Some(Value::Null) => continue,
                Some(v) => v,
            };
            let encoded = match role {
                Role::TextSimilarity | Role::Category => Value::String(value_to_string(value)),
                Role::Recency => Value::from(encode_timestamp(column, value)?),
                Role::Number => {
                    let n = encode_number(column, value)?;
                    Number::from_f64(n).map(Value::Number).ok_or_else(|| {
                        RagError::InvalidInput(format!("column '{}': non-finite number", column))
                    })?
                }
            };
            fields.insert(column.to_string(), encoded);
        }

        Ok(Record { id, fields })
    }

    /// Category values a category space was built with.
    pub fn categories(&self) -> Categories {
        self.spaces
            .iter()
            .filter_map(|s| match &s.kind {
                SpaceKind::Category { categories, .. } => {
                    Some((s.column.clone(), categories.clone()))
                }
                _ => None,
            })
            .collect()
    }
}

fn encode_timestamp(column: &str, value: &Value) -> RagResult<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f as i64))
            .ok_or_else(|| RagError::InvalidInput(format!("column '{}': bad timestamp {}", column, n))),
        Value::String(s) => s
            .trim()
            .parse::<i64>()
            .ok()
            .or_else(|| parse_datetime(s))
            .ok_or_else(|| {
                RagError::InvalidInput(format!("column '{}': malformed timestamp '{}'", column, s))
            }),
        other => Err(RagError::InvalidInput(format!(
            "column '{}': malformed timestamp {}",
            column, other
        ))),
    }
}

fn encode_number(column: &str, value: &Value) -> RagResult<f64> {
    match value {
        Value::Number(n) => n.as_f64().ok_or_else(|| {
            RagError::InvalidInput(format!("column '{}': bad number {}", column, n))
        }),
        Value::String(s) => s.trim().parse::<f64>().map_err(|_| {
            RagError::InvalidInput(format!("column '{}': not a number '{}'", column, s))
        }),
        other => Err(RagError::InvalidInput(format!(
            "column '{}': not a number {}",
            column, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn plan(entries: &[(&str, Role)]) -> IndexPlan {
        let mapping: ColumnMapping = entries.iter().map(|(c, r)| (*c, *r)).collect();
        let mut cats = Categories::new();
        cats.insert("dept".into(), vec!["hr".into()]);
        build_plan("docs", &mapping, &cats, &SpaceWeights::new(), &Config::minimal()).unwrap()
    }

    #[test]
    fn test_query_for_text_mapping() {
        let p = plan(&[("score", Role::Number), ("body", Role::TextSimilarity)]);
        let q = p.query.as_ref().unwrap();
        assert_eq!(q.name, "docs_query");
        assert_eq!(q.anchor_column, "body");
        assert_eq!(q.weights.len(), 2);
        assert_eq!(p.schema_name(), "docs_schema");
    }

    #[test]
    fn test_no_query_without_text() {
        for entries in [
            vec![("score", Role::Number)],
            vec![("at", Role::Recency), ("dept", Role::Category)],
        ] {
            let p = plan(&entries);
            assert!(p.query.is_none());
            assert_eq!(p.require_query().unwrap_err().code(), "invalid_input");
        }
    }

    #[test]
    fn test_weight_resolution() {
        let p = plan(&[("body", Role::TextSimilarity), ("score", Role::Number)]);
        let mut overrides = SpaceWeights::new();
        overrides.insert("score".into(), 0.9);
        let w = p.resolve_weights(&overrides).unwrap();
        assert_eq!(w["body"], 1.0);
        assert_eq!(w["score"], 0.9);

        overrides.insert("missing".into(), 1.0);
        assert!(p.resolve_weights(&overrides).is_err());
    }

    #[test]
    fn test_negative_or_nan_weight_rejected() {
        let p = plan(&[("body", Role::TextSimilarity), ("score", Role::Number)]);
        for bad in [-0.5, f64::NAN, f64::INFINITY] {
            let mut overrides = SpaceWeights::new();
            overrides.insert("score".into(), bad);
            assert_eq!(p.resolve_weights(&overrides).unwrap_err().code(), "invalid_input");
        }
        let mut off = SpaceWeights::new();
        off.insert("score".into(), 0.0);
        assert_eq!(p.resolve_weights(&off).unwrap()["score"], 0.0);
    }

    #[test]
    fn test_category_filters_must_target_category_spaces() {
        let p = plan(&[("body", Role::TextSimilarity), ("dept", Role::Category)]);
        let mut filters = BTreeMap::new();
        filters.insert("dept".to_string(), "hr".to_string());
        assert!(p.check_category_filters(&filters).is_ok());

        filters.insert("body".to_string(), "hr".to_string());
        let err = p.check_category_filters(&filters).unwrap_err();
        assert!(err.to_string().contains("text_similarity"));

        let mut unknown = BTreeMap::new();
        unknown.insert("team".to_string(), "ops".to_string());
        assert_eq!(p.check_category_filters(&unknown).unwrap_err().code(), "invalid_input");
    }

    #[test]
    fn test_search_body() {
        let p = plan(&[("body", Role::TextSimilarity), ("score", Role::Number)]);
        let mut weights = SpaceWeights::new();
        weights.insert("body".into(), 2.0);
        let body = p
            .search_body(&QueryRequest {
                search_query: "hello".into(),
                limit: 3,
                weights,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(body["search_query"], "hello");
        assert_eq!(body["limit"], 3);
        assert_eq!(body["body_weight"], 2.0);
        assert_eq!(body["score_weight"], 0.3);
    }

    #[test]
    fn test_encode_row() {
        let p = plan(&[
            ("body", Role::TextSimilarity),
            ("at", Role::Recency),
            ("score", Role::Number),
            ("dept", Role::Category),
        ]);
        let row = json!({"id": "7", "body": "hi", "at": "1970-01-02", "score": "0.5", "dept": null, "extra": 1});
        let record = p.encode_row(row.as_object().unwrap()).unwrap();
        assert_eq!(record.id, "7");
        assert_eq!(record.fields["at"], 86400);
        assert_eq!(record.fields["score"], 0.5);
        assert!(!record.fields.contains_key("dept"));
        assert!(!record.fields.contains_key("extra"));
    }

    #[test]
    fn test_encode_row_bad_timestamp() {
        let p = plan(&[("body", Role::TextSimilarity), ("at", Role::Recency)]);
        let row = json!({"id": "1", "body": "x", "at": "yesterday-ish"});
        let err = p.encode_row(row.as_object().unwrap()).unwrap_err();
        assert!(err.to_string().contains("malformed timestamp"));
    }

    #[test]
    fn test_plan_from_record_matches_original() {
        let p = plan(&[("body", Role::TextSimilarity), ("dept", Role::Category)]);
        let record = MetadataRecord {
            is_metadata: true,
            index_name: "docs".into(),
            source_filename: "docs.csv".into(),
            source_path: "/tmp/docs.csv".into(),
            column_mapping: p.mapping.clone(),
            total_rows: 1,
            weights: SpaceWeights::new(),
            categories: p.categories(),
            created_at: 0,
        };
        let rebuilt = plan_from_record(&record, &Config::minimal()).unwrap();
        assert_eq!(rebuilt.source_path.as_deref(), Some("/tmp/docs.csv"));
        assert_eq!(
            IndexPlan {
                source_path: None,
                ..rebuilt
            },
            p
        );
    }
}
