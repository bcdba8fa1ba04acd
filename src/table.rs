//! File loading and normalization.
//!
//! Loads CSV or JSON into a row-oriented [`Table`]:
//!
//! - CSV cells are typed per cell (integer, float, boolean, string, missing)
//!   and then per column.
//! - JSON may be row-oriented (`[{...}, ...]`), column-oriented
//!   (`{"col": {"row": value}}`, pivoted to rows keyed by the row identifier)
//!   or a dict of equal-length column arrays.
//! - String columns whose every value parses as a date/time are stored as
//!   integer epoch seconds and typed [`ColumnKind::Datetime`].
//! - An `id` column is always present and always a string; when the source
//!   has none, it is synthesized from row position.

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{Map, Number, Value};
use std::collections::HashSet;
use std::path::Path;

use crate::error::{RagError, RagResult};
use crate::models::{Categories, ColumnMapping, Role, Row};

/// Identifier column name.
pub const ID_COLUMN: &str = "id";

/// Stored type of a column after loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Float,
    Boolean,
    Datetime,
    String,
    /// Every value is missing.
    Empty,
}

impl ColumnKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ColumnKind::Integer => "integer",
            ColumnKind::Float => "float",
            ColumnKind::Boolean => "boolean",
            ColumnKind::Datetime => "datetime",
            ColumnKind::String => "string",
            ColumnKind::Empty => "empty",
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, ColumnKind::Integer | ColumnKind::Float)
    }
}

/// A loaded, normalized dataset.
#[derive(Debug, Clone)]
pub struct Table {
    columns: Vec<String>,
    kinds: Vec<ColumnKind>,
    rows: Vec<Row>,
}

impl Table {
    /// Build a table from raw rows, inferring column kinds, normalizing
    /// datetime columns and ensuring a string `id` column.
    pub fn from_rows(columns: Vec<String>, rows: Vec<Row>) -> Self {
        let mut table = Table {
            kinds: vec![ColumnKind::Empty; columns.len()],
            columns,
            rows,
        };
        table.ensure_id();
        for idx in 0..table.columns.len() {
            let kind = table.normalize_column(idx);
            table.kinds[idx] = kind;
        }
        table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn kind(&self, column: &str) -> Option<ColumnKind> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| self.kinds[idx])
    }

    /// Column name → kind label, in column order.
    pub fn dtypes(&self) -> Map<String, Value> {
        self.columns
            .iter()
            .zip(self.kinds.iter())
            .map(|(c, k)| (c.clone(), Value::String(k.as_str().to_string())))
            .collect()
    }

    /// Values of one column, `Null` where the row lacks it.
    pub fn column_values<'a>(&'a self, column: &'a str) -> impl Iterator<Item = &'a Value> + 'a {
        self.rows
            .iter()
            .map(move |row| row.get(column).unwrap_or(&Value::Null))
    }

    pub fn head(&self, n: usize) -> Vec<Row> {
        self.rows.iter().take(n).cloned().collect()
    }

    fn ensure_id(&mut self) {
        if !self.has_column(ID_COLUMN) {
            self.columns.insert(0, ID_COLUMN.to_string());
            self.kinds.insert(0, ColumnKind::String);
            for (pos, row) in self.rows.iter_mut().enumerate() {
                let mut with_id = Map::new();
                with_id.insert(ID_COLUMN.to_string(), Value::String(pos.to_string()));
                with_id.extend(std::mem::take(row));
                *row = with_id;
            }
            return;
        }

        let mut seen = HashSet::new();
        for (pos, row) in self.rows.iter_mut().enumerate() {
            let id = match row.get(ID_COLUMN) {
                None | Some(Value::Null) => pos.to_string(),
                Some(v) => value_to_string(v),
            };
            if !seen.insert(id.clone()) {
                tracing::warn!(id = %id, "duplicate id in source; later rows replace earlier ones");
            }
            row.insert(ID_COLUMN.to_string(), Value::String(id));
        }
    }

    /// Infer one column's kind and rewrite its values to match.
    fn normalize_column(&mut self, idx: usize) -> ColumnKind {
        let column = self.columns[idx].clone();
        if column == ID_COLUMN {
            return ColumnKind::String;
        }

        let mut saw_value = false;
        let mut all_bool = true;
        let mut all_int = true;
        let mut all_number = true;
        let mut all_datetime = true;

        for value in self.column_values(&column) {
            match value {
                Value::Null => continue,
                Value::Bool(_) => {
                    all_int = false;
                    all_number = false;
                    all_datetime = false;
                }
                Value::Number(n) => {
                    all_bool = false;
                    all_datetime = false;
                    if !(n.is_i64() || n.is_u64()) {
                        all_int = false;
                    }
                }
                Value::String(s) => {
                    all_bool = false;
                    all_int = false;
                    all_number = false;
                    if all_datetime && parse_datetime(s).is_none() {
                        all_datetime = false;
                    }
                }
                _ => {
                    all_bool = false;
                    all_int = false;
                    all_number = false;
                    all_datetime = false;
                }
            }
            saw_value = true;
        }

        if !saw_value {
            return ColumnKind::Empty;
        }
        if all_bool {
            return ColumnKind::Boolean;
        }
        if all_number {
            return if all_int {
                ColumnKind::Integer
            } else {
                ColumnKind::Float
            };
        }
        if all_datetime {
            for row in &mut self.rows {
                if let Some(Value::String(s)) = row.get(&column) {
                    if let Some(ts) = parse_datetime(s) {
                        row.insert(column.clone(), Value::Number(Number::from(ts)));
                    }
                }
            }
            return ColumnKind::Datetime;
        }

        // Mixed or plain text: store every present value as a string.
        for row in &mut self.rows {
            if let Some(v) = row.get_mut(&column) {
                if !v.is_null() && !v.is_string() {
                    *v = Value::String(value_to_string(v));
                }
            }
        }
        ColumnKind::String
    }
}

/// Load a CSV or JSON file. Failures are logged and returned as
/// [`RagError::FileLoad`].
pub fn load_file(path: &Path) -> RagResult<Table> {
    let shown = path.display().to_string();
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let result = match ext.as_str() {
        "csv" => load_csv(path),
        "json" => load_json(path),
        other => {
            let reason = if other.is_empty() {
                "missing file extension (expected .csv or .json)".to_string()
            } else {
                format!("unsupported file type '.{}' (expected .csv or .json)", other)
            };
            Err(reason)
        }
    };

    match result {
        Ok(table) => {
            tracing::debug!(path = %shown, rows = table.len(), columns = table.columns().len(), "loaded file");
            Ok(table)
        }
        Err(reason) => {
            tracing::error!(path = %shown, %reason, "could not load file");
            Err(RagError::file_load(shown, reason))
        }
    }
}

fn load_csv(path: &Path) -> Result<Table, String> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_path(path)
        .map_err(|e| e.to_string())?;

    let columns: Vec<String> = reader
        .headers()
        .map_err(|e| e.to_string())?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| format!("row {}: {}", line + 1, e))?;
        let row: Row = columns
            .iter()
            .zip(record.iter())
            .map(|(c, cell)| (c.clone(), parse_cell(cell)))
            .collect();
        rows.push(row);
    }

    Ok(Table::from_rows(columns, rows))
}

fn load_json(path: &Path) -> Result<Table, String> {
    let content = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let data: Value = serde_json::from_str(&content).map_err(|e| format!("malformed JSON: {}", e))?;
    table_from_json(data)
}

/// Build a table from an already parsed JSON document.
pub fn table_from_json(data: Value) -> Result<Table, String> {
    if let Value::Object(map) = &data {
        if is_column_oriented(&data) {
            let (columns, rows) = pivot_column_oriented(map);
            tracing::info!(records = rows.len(), "transformed column-oriented JSON");
            return Ok(Table::from_rows(columns, rows));
        }
    }

    match data {
        Value::Array(items) => {
            let mut columns: Vec<String> = Vec::new();
            let mut rows = Vec::with_capacity(items.len());
            for (pos, item) in items.into_iter().enumerate() {
                match item {
                    Value::Object(row) => {
                        for key in row.keys() {
                            if !columns.contains(key) {
                                columns.push(key.clone());
                            }
                        }
                        rows.push(row);
                    }
                    _ => return Err(format!("record {} is not a JSON object", pos)),
                }
            }
            Ok(Table::from_rows(columns, rows))
        }
        Value::Object(map) if !map.is_empty() && map.values().all(|v| v.is_array()) => {
            let len = map.values().next().and_then(|v| v.as_array()).map_or(0, |a| a.len());
            if map.values().any(|v| v.as_array().map_or(0, |a| a.len()) != len) {
                return Err("column arrays have different lengths".to_string());
            }
            let columns: Vec<String> = map.keys().cloned().collect();
            let rows = (0..len)
                .map(|i| {
                    map.iter()
                        .map(|(c, v)| (c.clone(), v[i].clone()))
                        .collect::<Row>()
                })
                .collect();
            Ok(Table::from_rows(columns, rows))
        }
        Value::Object(map) if map.is_empty() => Err("empty JSON document".to_string()),
        _ => Err("unrecognized JSON layout (expected records or columns)".to_string()),
    }
}

/// `{"col": {"row_id": value, ...}, ...}` — every top-level value is an object.
pub fn is_column_oriented(data: &Value) -> bool {
    match data {
        Value::Object(map) => !map.is_empty() && map.values().all(|v| v.is_object()),
        _ => false,
    }
}

/// Pivot column-oriented JSON to rows. Row identifiers come from the first
/// column's keys and become the `id` field.
pub fn pivot_column_oriented(data: &Map<String, Value>) -> (Vec<String>, Vec<Row>) {
    let row_ids: Vec<String> = data
        .values()
        .next()
        .and_then(|v| v.as_object())
        .map(|first| first.keys().cloned().collect())
        .unwrap_or_default();

    let mut columns = vec![ID_COLUMN.to_string()];
    columns.extend(data.keys().filter(|k| k.as_str() != ID_COLUMN).cloned());

    let rows = row_ids
        .iter()
        .map(|row_id| {
            let mut row = Map::new();
            row.insert(ID_COLUMN.to_string(), Value::String(row_id.clone()));
            for (column, cells) in data {
                let value = cells.get(row_id).cloned().unwrap_or(Value::Null);
                row.insert(column.clone(), value);
            }
            row
        })
        .collect();

    (columns, rows)
}

/// Distinct non-missing values of every category-role column, as strings, in
/// first-seen order. Columns missing from the table or without any value are
/// left out.
pub fn extract_categories(table: &Table, mapping: &ColumnMapping) -> Categories {
    let mut categories = Categories::new();
    for column in mapping.columns_with_role(Role::Category) {
        if !table.has_column(column) {
            tracing::warn!(column, "category column not found in file");
            continue;
        }
        let mut seen = HashSet::new();
        let values: Vec<String> = table
            .column_values(column)
            .filter(|v| !v.is_null())
            .map(value_to_string)
            .filter(|s| seen.insert(s.clone()))
            .collect();
        if values.is_empty() {
            tracing::warn!(column, "category column has no values");
            continue;
        }
        categories.insert(column.to_string(), values);
    }
    categories
}

fn parse_cell(cell: &str) -> Value {
    if cell.is_empty() {
        return Value::Null;
    }
    let trimmed = cell.trim();
    match trimmed {
        "NaN" | "nan" | "NA" | "N/A" | "null" | "NULL" => return Value::Null,
        "true" | "True" | "TRUE" => return Value::Bool(true),
        "false" | "False" | "FALSE" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(i));
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if let Some(n) = Number::from_f64(f) {
            return Value::Number(n);
        }
    }
    Value::String(cell.to_string())
}

/// Parse common date/time spellings to epoch seconds (naive values are UTC).
pub fn parse_datetime(s: &str) -> Option<i64> {
    let s = s.trim();
    if s.len() < 8 || !s.contains('-') {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.timestamp());
    }
    for fmt in [
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.and_utc().timestamp());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return date.and_hms_opt(0, 0, 0).map(|dt| dt.and_utc().timestamp());
    }
    None
}

/// String form of a cell, as used for ids and category values.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}
