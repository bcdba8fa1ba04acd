//! Column role detection.
//!
//! A heuristic default only: explicit roles in a caller's mapping are never
//! replaced, and `auto` entries (or an empty mapping) are the only inputs the
//! detector fills in.

use std::collections::HashSet;

use crate::error::{RagError, RagResult};
use crate::models::{ColumnMapping, Role, RoleSpec};
use crate::table::{value_to_string, ColumnKind, Table, ID_COLUMN};

/// Below this distinct/non-missing ratio a string column is a category.
pub const CATEGORY_RATIO: f64 = 0.1;

/// Infer the role of one column.
///
/// Datetime columns are `recency`, numeric columns are `number`, boolean
/// columns are `category`. String columns are `category` when the distinct
/// ratio is below [`CATEGORY_RATIO`], otherwise `text_similarity` (which is
/// also the answer for unknown or empty columns).
pub fn detect_role(table: &Table, column: &str) -> Role {
    match table.kind(column) {
        Some(ColumnKind::Datetime) => Role::Recency,
        Some(kind) if kind.is_numeric() => Role::Number,
        Some(ColumnKind::Boolean) => Role::Category,
        Some(ColumnKind::String) => {
            let mut total = 0usize;
            let mut distinct = HashSet::new();
            for value in table.column_values(column).filter(|v| !v.is_null()) {
                total += 1;
                distinct.insert(value_to_string(value));
            }
            if total > 0 && (distinct.len() as f64 / total as f64) < CATEGORY_RATIO {
                Role::Category
            } else {
                Role::TextSimilarity
            }
        }
        _ => Role::TextSimilarity,
    }
}

/// Detected role for every column except `id`, in column order.
pub fn detect_all(table: &Table) -> ColumnMapping {
    table
        .columns()
        .iter()
        .filter(|c| c.as_str() != ID_COLUMN)
        .map(|c| (c.clone(), detect_role(table, c)))
        .collect()
}

/// Turn a requested mapping into a concrete one.
///
/// An empty request means "detect every column". Every requested column must
/// exist in the table; `auto` entries are resolved by [`detect_role`].
pub fn resolve_mapping(table: &Table, requested: &[(String, RoleSpec)]) -> RagResult<ColumnMapping> {
    if requested.is_empty() {
        let mapping = detect_all(table);
        tracing::info!(columns = mapping.len(), "no column mapping given; detected roles for all columns");
        return Ok(mapping);
    }

    let missing: Vec<&str> = requested
        .iter()
        .map(|(c, _)| c.as_str())
        .filter(|c| !table.has_column(c))
        .collect();
    if !missing.is_empty() {
        return Err(RagError::InvalidInput(format!(
            "column(s) not found in file: {} (available: {})",
            missing.join(", "),
            table.columns().join(", ")
        )));
    }

    let mut mapping = ColumnMapping::new();
    for (column, spec) in requested {
        let role = match spec {
            RoleSpec::Fixed(role) => *role,
            RoleSpec::Auto => {
                let role = detect_role(table, column);
                tracing::debug!(column = %column, role = %role, "detected role");
                role
            }
        };
        mapping.insert(column.clone(), role);
    }
    Ok(mapping)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::table_from_json;
    use serde_json::json;

    fn sample() -> Table {
        let rows: Vec<_> = (0..20)
            .map(|i| {
                json!({
                    "title": format!("document number {}", i),
                    "dept": if i % 2 == 0 { "sales" } else { "support" },
                    "score": i as f64 / 20.0,
                    "created": format!("2024-01-{:02}", i + 1),
                    "flag": i % 3 == 0,
                })
            })
            .collect();
        table_from_json(json!(rows)).unwrap()
    }

    #[test]
    fn test_detects_each_role() {
        let table = sample();
        assert_eq!(detect_role(&table, "title"), Role::TextSimilarity);
        assert_eq!(detect_role(&table, "dept"), Role::Category);
        assert_eq!(detect_role(&table, "score"), Role::Number);
        assert_eq!(detect_role(&table, "created"), Role::Recency);
        assert_eq!(detect_role(&table, "flag"), Role::Category);
    }

    #[test]
    fn test_small_table_strings_are_text() {
        // 2 distinct of 2 values: ratio 1.0
        let table = table_from_json(json!([{"tag": "a"}, {"tag": "b"}])).unwrap();
        assert_eq!(detect_role(&table, "tag"), Role::TextSimilarity);
    }

    #[test]
    fn test_detect_all_skips_id() {
        let mapping = detect_all(&sample());
        assert!(!mapping.contains("id"));
        assert_eq!(mapping.len(), 5);
        assert_eq!(mapping.columns().next(), Some("title"));
    }

    #[test]
    fn test_explicit_role_wins() {
        let table = sample();
        let requested = vec![
            ("dept".to_string(), RoleSpec::Fixed(Role::TextSimilarity)),
            ("score".to_string(), RoleSpec::Auto),
        ];
        let mapping = resolve_mapping(&table, &requested).unwrap();
        assert_eq!(mapping.get("dept"), Some(Role::TextSimilarity));
        assert_eq!(mapping.get("score"), Some(Role::Number));
    }

    #[test]
    fn test_missing_column_rejected() {
        let table = sample();
        let requested = vec![("nope".to_string(), RoleSpec::Auto)];
        let err = resolve_mapping(&table, &requested).unwrap_err();
        assert_eq!(err.code(), "invalid_input");
        assert!(err.to_string().contains("nope"));
    }
}
