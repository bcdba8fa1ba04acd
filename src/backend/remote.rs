//! Out-of-process execution backend.
//!
//! Index configuration is handed to the framework server at start: every
//! plan is serialized into a manifest that is both written to
//! `{work_dir}/framework_manifest.json` and passed in the environment
//! variable named by `framework.metadata_env`. Rows and queries then travel
//! over HTTP:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | ingest (per row) | `POST /api/v1/ingest/{index}_schema` |
//! | ingest (bulk) | `POST /data-loader/{index}_schema/run` |
//! | search | `POST /api/v1/search/{index}_query` |
//! | health | `GET /health` |
//! | remove | `DELETE {vector_db_url}/collections/{prefix}{index}` |
//!
//! Bulk loads are acknowledged by polling search until the index returns
//! as many entries as rows were expected.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::{Config, FrameworkConfig, IngestMode};
use crate::error::{RagError, RagResult};
use crate::models::{IngestSummary, QueryHit, QueryRequest, Row};
use crate::process::ServerHandle;
use crate::query::IndexPlan;

use super::{Backend, PROGRESS_EVERY};

pub const MANIFEST_FILE: &str = "framework_manifest.json";

pub struct OutOfProcessBackend {
    config: FrameworkConfig,
    work_dir: PathBuf,
    client: reqwest::Client,
    server: ServerHandle,
}

impl OutOfProcessBackend {
    pub fn new(config: &Config) -> Self {
        let work_dir = config.workspace.dir.clone();
        Self {
            config: config.framework.clone(),
            server: ServerHandle::new(&config.framework, work_dir.clone()),
            work_dir,
            client: reqwest::Client::new(),
        }
    }

    pub fn server(&self) -> &ServerHandle {
        &self.server
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.server.url(), path)
    }

    /// Vector collection the server keeps an index's rows in.
    pub fn collection_for(&self, index_name: &str) -> String {
        format!("{}{}", self.config.collection_prefix, index_name)
    }

    /// Write the manifest artifact and return the server environment.
    fn prepare_env(&self, plans: &[IndexPlan]) -> RagResult<Vec<(String, String)>> {
        let manifest = manifest(plans, &self.config.collection_prefix);
        let text = serde_json::to_string(&manifest)?;
        std::fs::create_dir_all(&self.work_dir)?;
        let path = self.work_dir.join(MANIFEST_FILE);
        std::fs::write(&path, serde_json::to_string_pretty(&manifest)?)?;
        tracing::debug!(path = %path.display(), indexes = plans.len(), "wrote framework manifest");
        Ok(vec![(self.config.metadata_env.clone(), text)])
    }

    async fn ingest_per_row(&self, plan: &IndexPlan, rows: &[Row]) -> IngestSummary {
        let url = self.url(&format!("/api/v1/ingest/{}", plan.schema_name()));
        let timeout = Duration::from_secs(self.config.ingest_timeout_secs);
        let mut summary = IngestSummary::default();
        let total = rows.len();

        for (pos, row) in rows.iter().enumerate() {
            let outcome = match plan.encode_row(row) {
                Ok(record) => {
                    let resp = self
                        .client
                        .post(&url)
                        .timeout(timeout)
                        .json(&record.to_body())
                        .send()
                        .await;
                    match resp {
                        Ok(r) if matches!(r.status().as_u16(), 200 | 202) => Ok(()),
                        Ok(r) => Err(format!("id {}: HTTP {}", record.id, r.status())),
                        Err(e) => Err(format!("id {}: {}", record.id, e)),
                    }
                }
                Err(e) => Err(e.to_string()),
            };

            match outcome {
                Ok(()) => summary.ingested += 1,
                Err(reason) => {
                    tracing::warn!(index = %plan.name, row = pos, %reason, "row ingest failed");
                    summary.errors += 1;
                }
            }

            if (pos + 1) % PROGRESS_EVERY == 0 {
                tracing::info!(index = %plan.name, progress = pos + 1, total, "ingesting");
            }
        }
        summary
    }

    async fn ingest_bulk(&self, plan: &IndexPlan, rows: &[Row]) -> RagResult<IngestSummary> {
        let expected = rows.iter().filter(|r| plan.encode_row(r).is_ok()).count();
        let invalid = rows.len() - expected;

        let url = self.url(&format!("/data-loader/{}/run", plan.schema_name()));
        let resp = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
            .send()
            .await
            .map_err(|e| RagError::resource("ingest", e))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(RagError::resource(
                "ingest",
                format!("data loader trigger returned {}: {}", status, body),
            ));
        }
        tracing::info!(index = %plan.name, expected, "bulk load triggered; waiting for acknowledgment");

        let observed = self.await_row_count(plan, expected).await?;
        let ingested = observed.min(expected);
        Ok(IngestSummary {
            ingested,
            errors: invalid + (expected - ingested),
        })
    }

    /// Poll search until `expected` entries come back or the ack deadline
    /// passes; returns the last observed count.
    async fn await_row_count(&self, plan: &IndexPlan, expected: usize) -> RagResult<usize> {
        if expected == 0 {
            return Ok(0);
        }
        if plan.query.is_none() {
            tracing::warn!(index = %plan.name, "index has no query; bulk load cannot be acknowledged");
            return Ok(0);
        }

        let ack = QueryRequest {
            search_query: String::new(),
            limit: expected,
            ..Default::default()
        };
        let deadline = Instant::now() + Duration::from_secs(self.config.ingest_ack_timeout_secs);
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        let mut observed = 0;

        loop {
            match self.search(plan, &ack).await {
                Ok(hits) => observed = hits.len(),
                Err(e) => tracing::debug!(error = %e, "ack search failed"),
            }
            if observed >= expected {
                tracing::info!(index = %plan.name, observed, "bulk load acknowledged");
                return Ok(observed);
            }
            if Instant::now() + interval > deadline {
                tracing::warn!(index = %plan.name, observed, expected, "bulk load not fully acknowledged before deadline");
                return Ok(observed);
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn search(&self, plan: &IndexPlan, request: &QueryRequest) -> RagResult<Vec<QueryHit>> {
        let query = plan.require_query()?;
        let body = plan.search_body(request)?;
        let resp = self
            .client
            .post(self.url(&format!("/api/v1/search/{}", query.name)))
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
            .json(&body)
            .send()
            .await
            .map_err(|e| RagError::resource("query", e))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(RagError::resource(
                "query",
                format!("search returned {}: {}", status, text),
            ));
        }
        let json: Value = resp
            .json()
            .await
            .map_err(|e| RagError::resource("query", e))?;
        parse_search_response(&json)
    }
}

/// `{ index_name: { collection, source_path, column_mapping, schema, spaces, query } }`
pub fn manifest(plans: &[IndexPlan], collection_prefix: &str) -> Value {
    let mut root = Map::new();
    for plan in plans {
        let entry = serde_json::json!({
            "collection": format!("{}{}", collection_prefix, plan.name),
            "source_path": plan.source_path,
            "column_mapping": plan.mapping,
            "schema": plan.schema,
            "spaces": plan.spaces,
            "query": plan.query,
        });
        root.insert(plan.name.clone(), entry);
    }
    Value::Object(root)
}

/// Parse `{ "entries": [ { "id", "fields", "metadata": { "score" } } ] }`.
pub fn parse_search_response(json: &Value) -> RagResult<Vec<QueryHit>> {
    let entries = json
        .get("entries")
        .and_then(Value::as_array)
        .ok_or_else(|| RagError::resource("query", "search response has no entries array"))?;

    Ok(entries
        .iter()
        .map(|entry| QueryHit {
            id: match entry.get("id") {
                Some(Value::String(s)) => s.clone(),
                Some(other) if !other.is_null() => other.to_string(),
                _ => String::new(),
            },
            score: entry
                .pointer("/metadata/score")
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            fields: entry
                .get("fields")
                .and_then(Value::as_object)
                .cloned()
                .unwrap_or_default(),
        })
        .collect())
}

#[async_trait]
impl Backend for OutOfProcessBackend {
    fn name(&self) -> &'static str {
        "out_of_process"
    }

    async fn deploy(&self, plans: &[IndexPlan], restart: bool) -> RagResult<Vec<String>> {
        let env = self.prepare_env(plans)?;
        let started = if restart {
            self.server.start(&env).await?;
            true
        } else {
            self.server.ensure_running(&env).await?
        };

        if started && self.config.reingest_on_start {
            Ok(plans.iter().map(|p| p.name.clone()).collect())
        } else {
            Ok(Vec::new())
        }
    }

    async fn ingest(&self, plan: &IndexPlan, rows: &[Row]) -> RagResult<IngestSummary> {
        let summary = match self.config.ingest_mode {
            IngestMode::PerRow => self.ingest_per_row(plan, rows).await,
            IngestMode::BulkLoader => self.ingest_bulk(plan, rows).await?,
        };
        tracing::info!(
            index = %plan.name,
            ingested = summary.ingested,
            errors = summary.errors,
            "ingest complete"
        );
        Ok(summary)
    }

    async fn query(&self, plan: &IndexPlan, request: &QueryRequest) -> RagResult<Vec<QueryHit>> {
        let mut hits = self.search(plan, request).await?;
        hits.truncate(request.limit);
        Ok(hits)
    }

    /// Drop the index's vector collection. A collection that does not
    /// exist counts as removed.
    async fn remove(&self, index_name: &str) -> RagResult<()> {
        let collection = self.collection_for(index_name);
        let url = format!(
            "{}/collections/{}",
            self.config.vector_db_url.trim_end_matches('/'),
            collection
        );
        let resp = self
            .client
            .delete(&url)
            .timeout(Duration::from_secs(self.config.request_timeout_secs))
            .send()
            .await
            .map_err(|e| RagError::resource("remove", e))?;

        let status = resp.status();
        if status.is_success() || status == reqwest::StatusCode::NOT_FOUND {
            tracing::info!(index = index_name, %collection, "removed vector collection");
            Ok(())
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(RagError::resource(
                "remove",
                format!("deleting collection '{}' returned {}: {}", collection, status, body),
            ))
        }
    }
}
