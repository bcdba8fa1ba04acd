//! In-process execution backend.
//!
//! Rows are held in memory behind a `std::sync::RwLock`. Text columns are
//! chunked and embedded at ingest time; queries are scored brute force over
//! every stored row. Nothing is persisted: a new process starts empty and
//! the caller re-ingests from the recorded source file.
//!
//! Score of a row is `Σ w·s / Σ |w|` over spaces with non-zero weight, where
//! `s` is the per-space score described on [`space_score`].

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::RwLock;

use crate::chunk::chunk_text;
use crate::config::EmbeddingConfig;
use crate::embedding::{cosine_similarity, embed_query, embed_texts};
use crate::error::{RagError, RagResult};
use crate::models::{IngestSummary, QueryHit, QueryRequest, Record, Row};
use crate::query::IndexPlan;
use crate::schema::{Space, SpaceKind};

use super::{Backend, PROGRESS_EVERY};

/// Category a value outside the category set is filed under.
pub const UNCATEGORIZED: &str = "uncategorized";

const SECONDS_PER_DAY: f64 = 86_400.0;

struct StoredRow {
    record: Record,
    /// Chunk embeddings per text column.
    vectors: HashMap<String, Vec<Vec<f32>>>,
}

struct MemoryIndex {
    plan: IndexPlan,
    rows: Vec<StoredRow>,
    positions: HashMap<String, usize>,
}

impl MemoryIndex {
    fn new(plan: IndexPlan) -> Self {
        Self {
            plan,
            rows: Vec::new(),
            positions: HashMap::new(),
        }
    }

    /// Insert, or replace in place when the id exists.
    fn upsert(&mut self, row: StoredRow) {
        match self.positions.get(&row.record.id) {
            Some(&pos) => self.rows[pos] = row,
            None => {
                self.positions.insert(row.record.id.clone(), self.rows.len());
                self.rows.push(row);
            }
        }
    }
}

/// In-process backend.
pub struct InProcessBackend {
    embedding: EmbeddingConfig,
    indexes: RwLock<HashMap<String, MemoryIndex>>,
    reference_time: Option<i64>,
}

impl InProcessBackend {
    pub fn new(embedding: EmbeddingConfig) -> Self {
        Self {
            embedding,
            indexes: RwLock::new(HashMap::new()),
            reference_time: None,
        }
    }

    /// Score recency against a fixed clock instead of the current time.
    pub fn with_reference_time(mut self, epoch_secs: i64) -> Self {
        self.reference_time = Some(epoch_secs);
        self
    }

    /// Number of rows currently held for an index.
    pub fn row_count(&self, index_name: &str) -> RagResult<usize> {
        let indexes = self.indexes.read().map_err(poisoned)?;
        Ok(indexes.get(index_name).map_or(0, |i| i.rows.len()))
    }

    fn now(&self) -> i64 {
        self.reference_time
            .unwrap_or_else(|| chrono::Utc::now().timestamp())
    }

    async fn embed_row(&self, plan: &IndexPlan, record: &Record) -> RagResult<HashMap<String, Vec<Vec<f32>>>> {
        let (texts, owners) = row_chunks(plan, record);
        let mut vectors: HashMap<String, Vec<Vec<f32>>> = HashMap::new();
        if texts.is_empty() {
            return Ok(vectors);
        }
        let embedded = embed_texts(&self.embedding, &texts)
            .await
            .map_err(|e| RagError::resource("embed", e))?;
        for (column, slot) in owners {
            if let Some(vector) = embedded.get(slot) {
                vectors.entry(column).or_default().push(vector.clone());
            }
        }
        Ok(vectors)
    }
}

/// Distinct chunk texts of a row's text columns, plus `(column, position
/// in texts)` for every chunk. Chunks with equal hashes share one position.
fn row_chunks(plan: &IndexPlan, record: &Record) -> (Vec<String>, Vec<(String, usize)>) {
    let mut texts = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut owners = Vec::new();
    for space in &plan.spaces {
        if let SpaceKind::TextSimilarity {
            chunk_size,
            chunk_overlap,
            ..
        } = &space.kind
        {
            if let Some(Value::String(text)) = record.fields.get(&space.column) {
                for chunk in chunk_text(text, *chunk_size, *chunk_overlap) {
                    let slot = *seen.entry(chunk.hash).or_insert_with(|| {
                        texts.push(chunk.text);
                        texts.len() - 1
                    });
                    owners.push((space.column.clone(), slot));
                }
            }
        }
    }
    (texts, owners)
}

fn poisoned<T>(_: T) -> RagError {
    RagError::Internal("in-process index lock poisoned".to_string())
}

#[async_trait]
impl Backend for InProcessBackend {
    fn name(&self) -> &'static str {
        "in_process"
    }

    async fn deploy(&self, plans: &[IndexPlan], _restart: bool) -> RagResult<Vec<String>> {
        let mut indexes = self.indexes.write().map_err(poisoned)?;
        let mut fresh = Vec::new();
        for plan in plans {
            let current = indexes.get(&plan.name).map(|i| &i.plan == plan);
            if current != Some(true) {
                indexes.insert(plan.name.clone(), MemoryIndex::new(plan.clone()));
                fresh.push(plan.name.clone());
            }
        }
        Ok(fresh)
    }

    async fn ingest(&self, plan: &IndexPlan, rows: &[Row]) -> RagResult<IngestSummary> {
        let mut summary = IngestSummary::default();
        let total = rows.len();

        for (pos, row) in rows.iter().enumerate() {
            let stored = match plan.encode_row(row) {
                Ok(record) => match self.embed_row(plan, &record).await {
                    Ok(vectors) => Some(StoredRow { record, vectors }),
                    Err(e) => {
                        tracing::warn!(index = %plan.name, row = pos, error = %e, "row embedding failed");
                        None
                    }
                },
                Err(e) => {
                    tracing::warn!(index = %plan.name, row = pos, error = %e, "row rejected");
                    None
                }
            };

            match stored {
                Some(stored) => {
                    let mut indexes = self.indexes.write().map_err(poisoned)?;
                    let index = indexes
                        .entry(plan.name.clone())
                        .or_insert_with(|| MemoryIndex::new(plan.clone()));
                    index.upsert(stored);
                    summary.ingested += 1;
                }
                None => summary.errors += 1,
            }

            if (pos + 1) % PROGRESS_EVERY == 0 {
                tracing::info!(index = %plan.name, progress = pos + 1, total, "ingesting");
            }
        }

        tracing::info!(
            index = %plan.name,
            ingested = summary.ingested,
            errors = summary.errors,
            "ingest complete"
        );
        Ok(summary)
    }

    async fn query(&self, plan: &IndexPlan, request: &QueryRequest) -> RagResult<Vec<QueryHit>> {
        plan.require_query()?;
        let weights = plan.resolve_weights(&request.weights)?;
        let query_vector = embed_query(&self.embedding, &request.search_query)
            .await
            .map_err(|e| RagError::resource("embed", e))?;
        let now = self.now();

        let indexes = self.indexes.read().map_err(poisoned)?;
        let index = match indexes.get(&plan.name) {
            Some(index) => index,
            None => return Ok(Vec::new()),
        };

        let active: Vec<(&Space, f64)> = plan
            .spaces
            .iter()
            .filter_map(|s| weights.get(&s.column).map(|w| (s, *w)))
            .filter(|(_, w)| *w != 0.0)
            .collect();
        let denominator: f64 = active.iter().map(|(_, w)| w.abs()).sum();

        let mut scored: Vec<(f64, usize)> = index
            .rows
            .iter()
            .enumerate()
            .map(|(order, row)| {
                let total: f64 = active
                    .iter()
                    .map(|(space, w)| w * space_score(space, row, &query_vector, request, now))
                    .sum();
                let score = if denominator > 0.0 {
                    total / denominator
                } else {
                    0.0
                };
                (score, order)
            })
            .collect();

        // Stable on ingestion order for equal scores
        scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));

        Ok(scored
            .into_iter()
            .take(request.limit)
            .map(|(score, order)| {
                let row = &index.rows[order];
                QueryHit {
                    id: row.record.id.clone(),
                    score,
                    fields: row.record.fields.clone(),
                }
            })
            .collect())
    }

    async fn remove(&self, index_name: &str) -> RagResult<()> {
        let mut indexes = self.indexes.write().map_err(poisoned)?;
        if indexes.remove(index_name).is_some() {
            tracing::info!(index = index_name, "dropped in-process index");
        }
        Ok(())
    }
}

/// Score of one row in one space.
///
/// - text: best cosine similarity between the query and the row's chunks
/// - recency: `1 - age/period` inside the period (future rows score 1),
///   the negative filter beyond it
/// - number: position of the value in `[min, max]`, clamped
/// - category: 1 on a match with the requested value, the negative filter
///   otherwise, 0 when no value was requested
///
/// A row without a value for the column scores 0.
fn space_score(space: &Space, row: &StoredRow, query: &[f32], request: &QueryRequest, now: i64) -> f64 {
    let value = row.record.fields.get(&space.column);
    match &space.kind {
        SpaceKind::TextSimilarity { .. } => row
            .vectors
            .get(&space.column)
            .and_then(|chunks| {
                chunks
                    .iter()
                    .map(|v| cosine_similarity(query, v))
                    .reduce(f32::max)
            })
            .map_or(0.0, f64::from),
        SpaceKind::Recency {
            period_days,
            negative_filter,
        } => match value.and_then(Value::as_i64) {
            Some(ts) => {
                let age = (now - ts) as f64;
                let period = f64::from(*period_days) * SECONDS_PER_DAY;
                if age <= 0.0 {
                    1.0
                } else if age <= period {
                    1.0 - age / period
                } else {
                    *negative_filter
                }
            }
            None => 0.0,
        },
        SpaceKind::Number { min, max, .. } => match value.and_then(Value::as_f64) {
            Some(v) if max > min => ((v - min) / (max - min)).clamp(0.0, 1.0),
            _ => 0.0,
        },
        SpaceKind::Category {
            categories,
            negative_filter,
            ..
        } => match request.categories.get(&space.column) {
            None => 0.0,
            Some(wanted) => {
                let actual = value
                    .and_then(Value::as_str)
                    .filter(|v| categories.iter().any(|c| c == v))
                    .unwrap_or(UNCATEGORIZED);
                let wanted = if categories.iter().any(|c| c == wanted) {
                    wanted.as_str()
                } else {
                    UNCATEGORIZED
                };
                if actual == wanted {
                    1.0
                } else {
                    *negative_filter
                }
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::models::{Categories, ColumnMapping, Role, SpaceWeights};
    use crate::query::build_plan;
    use serde_json::json;

    const DAY: i64 = 86_400;
    const NOW: i64 = 1_000 * DAY;

    fn plan(entries: &[(&str, Role)], categories: Categories) -> IndexPlan {
        let mapping: ColumnMapping = entries.iter().map(|(c, r)| (*c, *r)).collect();
        build_plan("t", &mapping, &categories, &SpaceWeights::new(), &Config::minimal()).unwrap()
    }

    fn rows(values: serde_json::Value) -> Vec<Row> {
        values
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_object().unwrap().clone())
            .collect()
    }

    fn request(text: &str, limit: usize) -> QueryRequest {
        QueryRequest {
            search_query: text.into(),
            limit,
            ..Default::default()
        }
    }

    async fn backend_with(plan: &IndexPlan, data: Vec<Row>) -> InProcessBackend {
        let backend = InProcessBackend::new(EmbeddingConfig::default()).with_reference_time(NOW);
        backend.deploy(std::slice::from_ref(plan), false).await.unwrap();
        let summary = backend.ingest(plan, &data).await.unwrap();
        assert_eq!(summary.errors, 0);
        backend
    }

    #[tokio::test]
    async fn test_text_and_number_ranking() {
        let p = plan(
            &[("body", Role::TextSimilarity), ("score", Role::Number)],
            Categories::new(),
        );
        let backend = backend_with(
            &p,
            rows(json!([
                {"id": "1", "body": "hello world", "score": 0.9},
                {"id": "2", "body": "goodbye", "score": 0.1}
            ])),
        )
        .await;
        let hits = backend.query(&p, &request("hello", 1)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "1");
    }

    #[tokio::test]
    async fn test_weight_override_changes_order() {
        let p = plan(
            &[("body", Role::TextSimilarity), ("score", Role::Number)],
            Categories::new(),
        );
        let backend = backend_with(
            &p,
            rows(json!([
                {"id": "1", "body": "hello world", "score": 0.0},
                {"id": "2", "body": "goodbye", "score": 1.0}
            ])),
        )
        .await;
        let mut req = request("hello", 2);
        req.weights.insert("body".into(), 0.0);
        let hits = backend.query(&p, &req).await.unwrap();
        assert_eq!(hits[0].id, "2");
    }

    #[tokio::test]
    async fn test_recency_prefers_recent() {
        let p = plan(
            &[("body", Role::TextSimilarity), ("at", Role::Recency)],
            Categories::new(),
        );
        let backend = backend_with(
            &p,
            rows(json!([
                {"id": "old", "body": "same", "at": NOW - 400 * DAY},
                {"id": "new", "body": "same", "at": NOW - DAY},
                {"id": "mid", "body": "same", "at": NOW - 150 * DAY}
            ])),
        )
        .await;
        let hits = backend.query(&p, &request("same", 3)).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
        assert!(hits[0].score > hits[2].score);
    }

    #[tokio::test]
    async fn test_category_match() {
        let mut cats = Categories::new();
        cats.insert("dept".into(), vec!["hr".into(), "it".into()]);
        let p = plan(
            &[("body", Role::TextSimilarity), ("dept", Role::Category)],
            cats,
        );
        let backend = backend_with(
            &p,
            rows(json!([
                {"id": "1", "body": "policy", "dept": "hr"},
                {"id": "2", "body": "policy", "dept": "it"}
            ])),
        )
        .await;
        let mut req = request("policy", 2);
        req.categories.insert("dept".into(), "it".into());
        let hits = backend.query(&p, &req).await.unwrap();
        assert_eq!(hits[0].id, "2");
    }

    #[tokio::test]
    async fn test_ties_keep_ingestion_order_and_upsert_replaces() {
        let p = plan(&[("body", Role::TextSimilarity)], Categories::new());
        let backend = backend_with(
            &p,
            rows(json!([
                {"id": "a", "body": "x"},
                {"id": "b", "body": "x"},
                {"id": "a", "body": "x"}
            ])),
        )
        .await;
        assert_eq!(backend.row_count("t").unwrap(), 2);
        let hits = backend.query(&p, &request("x", 5)).await.unwrap();
        let ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_failed_rows_counted() {
        let p = plan(
            &[("body", Role::TextSimilarity), ("at", Role::Recency)],
            Categories::new(),
        );
        let backend = InProcessBackend::new(EmbeddingConfig::default());
        backend.deploy(std::slice::from_ref(&p), false).await.unwrap();
        let summary = backend
            .ingest(
                &p,
                &rows(json!([
                    {"id": "1", "body": "a", "at": "2024-01-01"},
                    {"id": "2", "body": "b", "at": "someday-soon"},
                    {"id": "3", "body": "c", "at": 1700000000}
                ])),
            )
            .await
            .unwrap();
        assert_eq!(summary, IngestSummary { ingested: 2, errors: 1 });
    }

    #[test]
    fn test_identical_chunks_embedded_once() {
        let p = plan(
            &[("title", Role::TextSimilarity), ("body", Role::TextSimilarity)],
            Categories::new(),
        );
        let record = p
            .encode_row(&rows(json!([{"id": "1", "title": "vpn down", "body": "vpn down"}]))[0])
            .unwrap();
        let (texts, owners) = row_chunks(&p, &record);
        assert_eq!(texts, vec!["vpn down"]);
        assert_eq!(owners, vec![("title".to_string(), 0), ("body".to_string(), 0)]);
    }

    #[tokio::test]
    async fn test_deploy_reports_fresh_indexes_once() {
        let p = plan(&[("body", Role::TextSimilarity)], Categories::new());
        let backend = InProcessBackend::new(EmbeddingConfig::default());
        assert_eq!(backend.deploy(std::slice::from_ref(&p), false).await.unwrap(), vec!["t"]);
        assert!(backend.deploy(std::slice::from_ref(&p), true).await.unwrap().is_empty());
        backend.remove("t").await.unwrap();
        assert_eq!(backend.deploy(std::slice::from_ref(&p), false).await.unwrap(), vec!["t"]);
    }
}
