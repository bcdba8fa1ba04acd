//! Index lifecycle orchestration.
//!
//! [`IndexService`] is the single entry point the tools, the HTTP API and
//! the CLI share:
//!
//! ```text
//! create_index: load file → resolve mapping → build spaces → assemble plan
//!               → write metadata → deploy every plan → ingest rows
//! query_index:  read metadata → rebuild plan → deploy (start if needed,
//!               re-ingest missing rows) → query
//! ```
//!
//! Creation and deployment are serialized by one lock; queries only hold
//! it while deploying.

use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::backend::{create_backend, Backend};
use crate::config::Config;
use crate::detect::{detect_all, resolve_mapping};
use crate::error::{RagError, RagResult};
use crate::metadata::{create_store, validate_index_name, MetadataStore};
use crate::models::{
    ColumnMapping, IngestSummary, MetadataRecord, QueryHit, QueryRequest, Role, RoleSpec, Row,
    SpaceWeights,
};
use crate::query::{build_plan, check_weight, plan_from_record, IndexPlan};
use crate::table::{extract_categories, load_file};

/// Rows shown by `preview_file` when the caller gives no count.
pub const DEFAULT_PREVIEW_ROWS: usize = 5;
/// Results returned by `query_index` when the caller gives no limit.
pub const DEFAULT_LIMIT: usize = 5;

#[derive(Debug, Clone, Serialize)]
pub struct PreviewResult {
    pub path: String,
    pub row_count: usize,
    pub columns: Vec<String>,
    pub dtypes: Map<String, Value>,
    pub sample_rows: Vec<Row>,
    pub detected_roles: ColumnMapping,
}

#[derive(Debug, Clone, Default)]
pub struct CreateIndexRequest {
    pub path: String,
    /// Empty means "detect every column".
    pub column_mapping: Vec<(String, RoleSpec)>,
    pub weights: SpaceWeights,
    pub recreate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CreateStatus {
    Created,
    Recreated,
    Exists,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateIndexResult {
    pub status: CreateStatus,
    pub index_name: String,
    pub message: String,
    pub columns: Vec<String>,
    pub column_mapping: ColumnMapping,
    pub row_count: usize,
    pub ingested: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub index_name: String,
    pub source_filename: String,
    pub total_rows: usize,
    pub column_mapping: ColumnMapping,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListIndexesResult {
    pub indexes: Vec<String>,
    pub details: Vec<IndexSummary>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryIndexRequest {
    pub index_name: String,
    pub query_text: String,
    pub limit: usize,
    pub weights: SpaceWeights,
    /// Category value to match, per category column.
    pub categories: BTreeMap<String, String>,
}

pub struct IndexService {
    config: Config,
    backend: Arc<dyn Backend>,
    store: Arc<dyn MetadataStore>,
    lifecycle: Mutex<()>,
}

impl IndexService {
    /// Service with the configured backend and metadata store.
    pub fn new(config: Config) -> Self {
        let backend = create_backend(&config);
        let store = create_store(&config);
        Self::with_parts(config, backend, store)
    }

    pub fn with_parts(config: Config, backend: Arc<dyn Backend>, store: Arc<dyn MetadataStore>) -> Self {
        tracing::debug!(backend = backend.name(), store = store.kind(), "index service ready");
        Self {
            config,
            backend,
            store,
            lifecycle: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Load a file and describe it without indexing anything.
    pub async fn preview_file(&self, path: &str, rows: usize) -> RagResult<PreviewResult> {
        let resolved = self.resolve_source(path)?;
        let table = load_file(&resolved)?;
        Ok(PreviewResult {
            path: resolved.display().to_string(),
            row_count: table.len(),
            columns: table.columns().to_vec(),
            dtypes: table.dtypes(),
            sample_rows: table.head(rows),
            detected_roles: detect_all(&table),
        })
    }

    /// Build and ingest an index from a file.
    ///
    /// An existing index is left untouched (status `exists`) unless
    /// `recreate` is set, in which case its metadata and data are removed
    /// once the new plan has been validated.
    pub async fn create_index(&self, request: CreateIndexRequest) -> RagResult<CreateIndexResult> {
        let _guard = self.lifecycle.lock().await;

        let resolved = self.resolve_source(&request.path)?;
        let index_name = index_name_for(&resolved)?;

        let existing = self.store.get(&index_name).await?;
        if let Some(record) = &existing {
            if !request.recreate {
                tracing::info!(index = %index_name, "index exists; not recreated");
                return Ok(CreateIndexResult {
                    status: CreateStatus::Exists,
                    message: format!(
                        "Index '{}' already exists. Use recreate=true to overwrite.",
                        index_name
                    ),
                    index_name,
                    columns: record.column_mapping.columns().map(String::from).collect(),
                    column_mapping: record.column_mapping.clone(),
                    row_count: record.total_rows,
                    ingested: 0,
                    errors: 0,
                });
            }
        }

        let table = load_file(&resolved)?;
        let mapping = resolve_mapping(&table, &request.column_mapping)?;
        if !mapping.has_role(Role::TextSimilarity) {
            return Err(RagError::NoTextColumn);
        }
        validate_weights(&mapping, &request.weights)?;

        let categories = extract_categories(&table, &mapping);
        let mut plan = build_plan(&index_name, &mapping, &categories, &request.weights, &self.config)?;
        plan.source_path = Some(resolved.display().to_string());

        let recreated = existing.is_some();
        if recreated {
            self.store.delete(&index_name).await?;
            self.backend.remove(&index_name).await?;
            tracing::info!(index = %index_name, "deleted existing index");
        }

        let record = MetadataRecord {
            is_metadata: true,
            index_name: index_name.clone(),
            source_filename: resolved
                .file_name()
                .map(|f| f.to_string_lossy().into_owned())
                .unwrap_or_default(),
            source_path: resolved.display().to_string(),
            column_mapping: mapping.clone(),
            total_rows: table.len(),
            weights: request.weights.clone(),
            categories: plan.categories(),
            created_at: chrono::Utc::now().timestamp(),
        };
        self.store.put(&record).await?;

        let deployed = async {
            let plans = self.all_plans(Some(&plan)).await?;
            let stale = self.backend.deploy(&plans, true).await?;
            tracing::info!(index = %index_name, rows = table.len(), backend = self.backend.name(), "ingesting");
            let summary = self.backend.ingest(&plan, table.rows()).await?;
            Ok::<_, RagError>((plans, stale, summary))
        }
        .await;
        let (plans, stale, summary) = match deployed {
            Ok(done) => done,
            Err(e) => {
                // Leave no record of an index that was never served
                if let Err(cleanup) = self.store.delete(&index_name).await {
                    tracing::warn!(index = %index_name, error = %cleanup, "could not roll back metadata");
                }
                return Err(e);
            }
        };
        self.reingest(&plans, &stale, Some(&index_name)).await;

        Ok(CreateIndexResult {
            status: if recreated {
                CreateStatus::Recreated
            } else {
                CreateStatus::Created
            },
            message: format!(
                "Index '{}' {} with {} of {} rows",
                index_name,
                if recreated { "recreated" } else { "created" },
                summary.ingested,
                table.len()
            ),
            index_name,
            columns: mapping.columns().map(String::from).collect(),
            column_mapping: mapping,
            row_count: table.len(),
            ingested: summary.ingested,
            errors: summary.errors,
        })
    }

    pub async fn list_indexes(&self) -> RagResult<ListIndexesResult> {
        let records = self.store.list().await?;
        Ok(ListIndexesResult {
            indexes: records.iter().map(|r| r.index_name.clone()).collect(),
            details: records
                .into_iter()
                .map(|r| IndexSummary {
                    index_name: r.index_name,
                    source_filename: r.source_filename,
                    total_rows: r.total_rows,
                    column_mapping: r.column_mapping,
                })
                .collect(),
        })
    }

    /// Ranked rows of one index for a free-text query.
    pub async fn query_index(&self, request: QueryIndexRequest) -> RagResult<Vec<QueryHit>> {
        if request.query_text.trim().is_empty() {
            return Err(RagError::InvalidInput("query_text must not be empty".to_string()));
        }
        if request.limit == 0 {
            return Err(RagError::InvalidInput("limit must be at least 1".to_string()));
        }
        validate_index_name(&request.index_name)?;

        let record = match self.store.get(&request.index_name).await? {
            Some(record) => record,
            None => {
                let available = self
                    .store
                    .list()
                    .await?
                    .into_iter()
                    .map(|r| r.index_name)
                    .collect();
                return Err(RagError::NotFound {
                    name: request.index_name,
                    available,
                });
            }
        };
        let plan = plan_from_record(&record, &self.config)?;
        plan.require_query()?;
        plan.resolve_weights(&request.weights)?;
        plan.check_category_filters(&request.categories)?;

        {
            let _guard = self.lifecycle.lock().await;
            let plans = self.all_plans(Some(&plan)).await?;
            let stale = self.backend.deploy(&plans, false).await?;
            self.reingest(&plans, &stale, None).await;
        }

        let query = QueryRequest {
            search_query: request.query_text,
            limit: request.limit,
            weights: request.weights,
            categories: request.categories,
        };
        let hits = self.backend.query(&plan, &query).await?;
        tracing::debug!(index = %plan.name, hits = hits.len(), "query answered");
        Ok(hits)
    }

    /// Deploy every recorded index, restarting the backend when `restart`
    /// is set, and rebuild the indexes the backend reports as empty.
    /// Returns the deployed index names.
    pub async fn deploy_all(&self, restart: bool) -> RagResult<Vec<String>> {
        let _guard = self.lifecycle.lock().await;
        let plans = self.all_plans(None).await?;
        let stale = self.backend.deploy(&plans, restart).await?;
        self.reingest(&plans, &stale, None).await;
        Ok(plans.into_iter().map(|p| p.name).collect())
    }

    /// Relative paths resolve against the workspace dir.
    fn resolve_source(&self, path: &str) -> RagResult<std::path::PathBuf> {
        if path.trim().is_empty() {
            return Err(RagError::InvalidInput("path must not be empty".to_string()));
        }
        Ok(self.config.resolve_path(path.trim()))
    }

    /// A plan for every recorded index; `current` replaces its namesake.
    async fn all_plans(&self, current: Option<&IndexPlan>) -> RagResult<Vec<IndexPlan>> {
        let mut plans = Vec::new();
        for record in self.store.list().await? {
            if let Some(plan) = current.filter(|p| p.name == record.index_name) {
                plans.push(plan.clone());
                continue;
            }
            match plan_from_record(&record, &self.config) {
                Ok(plan) => plans.push(plan),
                Err(e) => tracing::warn!(index = %record.index_name, error = %e, "cannot rebuild index"),
            }
        }
        if let Some(plan) = current {
            if !plans.iter().any(|p| p.name == plan.name) {
                plans.push(plan.clone());
            }
        }
        Ok(plans)
    }

    /// Ingest `stale` indexes again from their recorded source files.
    async fn reingest(&self, plans: &[IndexPlan], stale: &[String], skip: Option<&str>) {
        for name in stale.iter().filter(|n| Some(n.as_str()) != skip) {
            let Some(plan) = plans.iter().find(|p| &p.name == name) else {
                continue;
            };
            match self.rebuild_rows(plan).await {
                Ok(summary) => tracing::info!(
                    index = %name,
                    ingested = summary.ingested,
                    errors = summary.errors,
                    "rebuilt index from source file"
                ),
                Err(e) => tracing::warn!(index = %name, error = %e, "could not rebuild index"),
            }
        }
    }

    async fn rebuild_rows(&self, plan: &IndexPlan) -> RagResult<IngestSummary> {
        let record = self
            .store
            .get(&plan.name)
            .await?
            .ok_or_else(|| RagError::Internal(format!("metadata for '{}' vanished", plan.name)))?;
        let path = if record.source_path.is_empty() {
            self.config.resolve_path(&record.source_filename)
        } else {
            Path::new(&record.source_path).to_path_buf()
        };
        let table = load_file(&path)?;
        self.backend.ingest(plan, table.rows()).await
    }
}

/// Index name from the file stem; characters outside `[A-Za-z0-9_-]`
/// become `_`.
pub fn index_name_for(path: &Path) -> RagResult<String> {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    if stem.is_empty() {
        return Err(RagError::InvalidInput(format!(
            "cannot derive an index name from '{}'",
            path.display()
        )));
    }
    Ok(stem
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect())
}

fn validate_weights(mapping: &ColumnMapping, weights: &SpaceWeights) -> RagResult<()> {
    for (column, weight) in weights {
        if !mapping.contains(column) {
            return Err(RagError::InvalidInput(format!(
                "weight given for '{}', which is not in the column mapping",
                column
            )));
        }
        check_weight(column, *weight)?;
    }
    Ok(())
}

// ============ Loose argument parsing ============
//
// Agents send nested objects either as JSON or as JSON-encoded strings.

fn decode_object(name: &str, value: &Value) -> RagResult<Option<Map<String, Value>>> {
    match value {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map.clone())),
        Value::String(s) if s.trim().is_empty() => Ok(None),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Ok(Some(map)),
            Ok(_) => Err(RagError::InvalidInput(format!("{} must be a JSON object", name))),
            Err(e) => Err(RagError::InvalidInput(format!("{} is not valid JSON: {}", name, e))),
        },
        _ => Err(RagError::InvalidInput(format!("{} must be a JSON object", name))),
    }
}

/// `{column: role}` where role is one of the four roles or `auto`.
pub fn parse_mapping_arg(value: &Value) -> RagResult<Vec<(String, RoleSpec)>> {
    let Some(map) = decode_object("column_mapping", value)? else {
        return Ok(Vec::new());
    };
    map.into_iter()
        .map(|(column, role)| {
            let role_str = role.as_str().ok_or_else(|| {
                RagError::InvalidInput(format!("role for '{}' must be a string", column))
            })?;
            let spec = role_str
                .parse::<RoleSpec>()
                .map_err(|e| RagError::InvalidInput(format!("column '{}': {}", column, e)))?;
            Ok((column, spec))
        })
        .collect()
}

/// `{column: weight}`; numeric strings are accepted.
pub fn parse_weights_arg(value: &Value) -> RagResult<SpaceWeights> {
    let Some(map) = decode_object("weights", value)? else {
        return Ok(SpaceWeights::new());
    };
    map.into_iter()
        .map(|(column, weight)| {
            let w = match &weight {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse::<f64>().ok(),
                _ => None,
            }
            .filter(|w| w.is_finite())
            .ok_or_else(|| {
                RagError::InvalidInput(format!("weight for '{}' must be a number", column))
            })?;
            Ok((column, w))
        })
        .collect()
}

/// `{column: value}` category filters; values are stringified.
pub fn parse_categories_arg(value: &Value) -> RagResult<BTreeMap<String, String>> {
    let Some(map) = decode_object("categories", value)? else {
        return Ok(BTreeMap::new());
    };
    Ok(map
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(column, v)| (column, crate::table::value_to_string(&v)))
        .collect())
}
