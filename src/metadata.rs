//! Persisted per-index metadata.
//!
//! A [`MetadataRecord`] is enough to rebuild an index's schema and spaces
//! without the original creation request. Two strategies:
//!
//! - [`FileMetadataStore`]: one JSON artifact per index at
//!   `{work_dir}/indexes/{name}.json`; the file's existence is the
//!   "index exists" signal.
//! - [`QdrantMetadataStore`]: one point per index in a reserved Qdrant
//!   collection, keyed by a UUIDv5 of the index name, with a dummy
//!   one-dimensional vector and the record as payload.
//!
//! Records are never updated in place: recreation deletes, then writes.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::config::{Config, MetadataConfig, MetadataStoreKind};
use crate::error::{RagError, RagResult};
use crate::models::MetadataRecord;

#[async_trait]
pub trait MetadataStore: Send + Sync {
    fn kind(&self) -> &'static str;

    async fn get(&self, index_name: &str) -> RagResult<Option<MetadataRecord>>;

    async fn put(&self, record: &MetadataRecord) -> RagResult<()>;

    /// Remove the record. Vector data is dropped separately by the
    /// backend. Returns whether a record existed.
    async fn delete(&self, index_name: &str) -> RagResult<bool>;

    /// Every record, ordered by index name.
    async fn list(&self) -> RagResult<Vec<MetadataRecord>>;

    async fn exists(&self, index_name: &str) -> RagResult<bool> {
        Ok(self.get(index_name).await?.is_some())
    }
}

/// Construct the configured store.
pub fn create_store(config: &Config) -> Arc<dyn MetadataStore> {
    match config.metadata.store {
        MetadataStoreKind::File => Arc::new(FileMetadataStore::new(
            config.workspace.dir.join(FileMetadataStore::DIR),
        )),
        MetadataStoreKind::Qdrant => Arc::new(QdrantMetadataStore::new(&config.metadata)),
    }
}

/// Index names are non-empty and limited to `[A-Za-z0-9_-]`.
pub fn validate_index_name(index_name: &str) -> RagResult<()> {
    let valid = !index_name.is_empty()
        && index_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(RagError::InvalidInput(format!(
            "invalid index name '{}': use letters, digits, '_' or '-'",
            index_name
        )))
    }
}

/// Stable point id of an index's metadata record.
pub fn metadata_point_id(index_name: &str) -> Uuid {
    Uuid::new_v5(&Uuid::NAMESPACE_DNS, index_name.as_bytes())
}

// ============ File artifacts ============

pub struct FileMetadataStore {
    dir: PathBuf,
}

impl FileMetadataStore {
    pub const DIR: &'static str = "indexes";

    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    fn path_for(&self, index_name: &str) -> RagResult<PathBuf> {
        validate_index_name(index_name)?;
        Ok(self.dir.join(format!("{}.json", index_name)))
    }

    fn read_record(path: &Path) -> RagResult<MetadataRecord> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| RagError::resource("metadata.get", format!("{}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| RagError::resource("metadata.get", format!("{}: {}", path.display(), e)))
    }
}

#[async_trait]
impl MetadataStore for FileMetadataStore {
    fn kind(&self) -> &'static str {
        "file"
    }

    async fn get(&self, index_name: &str) -> RagResult<Option<MetadataRecord>> {
        let path = self.path_for(index_name)?;
        if !path.exists() {
            return Ok(None);
        }
        Self::read_record(&path).map(Some)
    }

    async fn put(&self, record: &MetadataRecord) -> RagResult<()> {
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| RagError::resource("metadata.put", e))?;
        let path = self.path_for(&record.index_name)?;
        let text = serde_json::to_string_pretty(record)?;
        std::fs::write(&path, text).map_err(|e| RagError::resource("metadata.put", e))?;
        tracing::debug!(path = %path.display(), "wrote metadata artifact");
        Ok(())
    }

    async fn delete(&self, index_name: &str) -> RagResult<bool> {
        let path = self.path_for(index_name)?;
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path).map_err(|e| RagError::resource("metadata.delete", e))?;
        Ok(true)
    }

    async fn list(&self) -> RagResult<Vec<MetadataRecord>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = std::fs::read_dir(&self.dir).map_err(|e| RagError::resource("metadata.list", e))?;

        let mut records = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| RagError::resource("metadata.list", e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_record(&path) {
                Ok(record) if record.is_metadata => records.push(record),
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "skipping unreadable metadata artifact"),
            }
        }
        records.sort_by(|a, b| a.index_name.cmp(&b.index_name));
        Ok(records)
    }
}

// ============ Qdrant collection ============

/// Metadata kept in a reserved Qdrant collection over its REST API.
pub struct QdrantMetadataStore {
    base: String,
    collection: String,
    client: reqwest::Client,
    timeout: Duration,
    ready: OnceCell<()>,
}

impl QdrantMetadataStore {
    /// Points fetched per scroll page.
    const PAGE: usize = 100;

    pub fn new(config: &MetadataConfig) -> Self {
        Self {
            base: config.qdrant_url.trim_end_matches('/').to_string(),
            collection: config.collection.clone(),
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(config.timeout_secs),
            ready: OnceCell::new(),
        }
    }

    fn collection_url(&self, name: &str) -> String {
        format!("{}/collections/{}", self.base, name)
    }

    async fn send(&self, operation: &str, request: reqwest::RequestBuilder) -> RagResult<reqwest::Response> {
        request
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| RagError::resource(operation, format!("Qdrant unreachable at {}: {}", self.base, e)))
    }

    async fn expect_success(operation: &str, resp: reqwest::Response) -> RagResult<Value> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RagError::resource(operation, format!("Qdrant returned {}: {}", status, body)));
        }
        resp.json()
            .await
            .map_err(|e| RagError::resource(operation, format!("invalid Qdrant response: {}", e)))
    }

    /// Create the metadata collection (1-dim cosine) on first use.
    async fn ensure_collection(&self) -> RagResult<()> {
        self.ready
            .get_or_try_init(|| async {
                let url = self.collection_url(&self.collection);
                let resp = self.send("metadata.init", self.client.get(&url)).await?;
                if resp.status().is_success() {
                    return Ok(());
                }
                if resp.status().as_u16() != 404 {
                    Self::expect_success("metadata.init", resp).await?;
                    return Ok(());
                }
                let body = json!({"vectors": {"size": 1, "distance": "Cosine"}});
                let resp = self.send("metadata.init", self.client.put(&url).json(&body)).await?;
                Self::expect_success("metadata.init", resp).await?;
                tracing::info!(collection = %self.collection, "created metadata collection");
                Ok::<(), RagError>(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl MetadataStore for QdrantMetadataStore {
    fn kind(&self) -> &'static str {
        "qdrant"
    }

    async fn get(&self, index_name: &str) -> RagResult<Option<MetadataRecord>> {
        self.ensure_collection().await?;
        let url = format!(
            "{}/points/{}",
            self.collection_url(&self.collection),
            metadata_point_id(index_name)
        );
        let resp = self.send("metadata.get", self.client.get(&url)).await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let json = Self::expect_success("metadata.get", resp).await?;
        match json.pointer("/result/payload") {
            Some(payload) if !payload.is_null() => serde_json::from_value(payload.clone())
                .map(Some)
                .map_err(|e| RagError::resource("metadata.get", format!("bad payload: {}", e))),
            _ => Ok(None),
        }
    }

    async fn put(&self, record: &MetadataRecord) -> RagResult<()> {
        self.ensure_collection().await?;
        let url = format!("{}/points?wait=true", self.collection_url(&self.collection));
        let body = json!({
            "points": [{
                "id": metadata_point_id(&record.index_name).to_string(),
                "vector": [0.0],
                "payload": record,
            }]
        });
        let resp = self.send("metadata.put", self.client.put(&url).json(&body)).await?;
        Self::expect_success("metadata.put", resp).await?;
        Ok(())
    }

    async fn delete(&self, index_name: &str) -> RagResult<bool> {
        let existed = self.get(index_name).await?.is_some();

        let url = format!("{}/points/delete?wait=true", self.collection_url(&self.collection));
        let body = json!({"points": [metadata_point_id(index_name).to_string()]});
        let resp = self.send("metadata.delete", self.client.post(&url).json(&body)).await?;
        Self::expect_success("metadata.delete", resp).await?;
        Ok(existed)
    }

    async fn list(&self) -> RagResult<Vec<MetadataRecord>> {
        self.ensure_collection().await?;
        let url = format!("{}/points/scroll", self.collection_url(&self.collection));
        let mut records = Vec::new();
        let mut offset = Value::Null;

        loop {
            let mut body = json!({
                "limit": Self::PAGE,
                "with_payload": true,
                "with_vector": false,
            });
            if !offset.is_null() {
                body["offset"] = offset.clone();
            }
            let resp = self.send("metadata.list", self.client.post(&url).json(&body)).await?;
            let json = Self::expect_success("metadata.list", resp).await?;

            let points = json
                .pointer("/result/points")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            for point in points {
                let Some(payload) = point.get("payload") else {
                    continue;
                };
                match serde_json::from_value::<MetadataRecord>(payload.clone()) {
                    Ok(record) if record.is_metadata => records.push(record),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(error = %e, "skipping malformed metadata point"),
                }
            }

            offset = json
                .pointer("/result/next_page_offset")
                .cloned()
                .unwrap_or(Value::Null);
            if offset.is_null() {
                break;
            }
        }

        records.sort_by(|a, b| a.index_name.cmp(&b.index_name));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ColumnMapping, Role};
    use tempfile::TempDir;

    fn record(name: &str) -> MetadataRecord {
        MetadataRecord {
            is_metadata: true,
            index_name: name.into(),
            source_filename: format!("{}.csv", name),
            source_path: format!("/data/{}.csv", name),
            column_mapping: [("body", Role::TextSimilarity)].into_iter().collect::<ColumnMapping>(),
            total_rows: 3,
            weights: Default::default(),
            categories: Default::default(),
            created_at: 1,
        }
    }

    #[tokio::test]
    async fn test_file_store_lifecycle() {
        let tmp = TempDir::new().unwrap();
        let store = FileMetadataStore::new(tmp.path().join("indexes"));

        assert!(store.list().await.unwrap().is_empty());
        assert!(!store.exists("docs").await.unwrap());

        store.put(&record("docs")).await.unwrap();
        store.put(&record("alpha")).await.unwrap();
        assert!(store.exists("docs").await.unwrap());
        assert_eq!(store.get("docs").await.unwrap().unwrap(), record("docs"));

        let names: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.index_name)
            .collect();
        assert_eq!(names, vec!["alpha", "docs"]);

        assert!(store.delete("docs").await.unwrap());
        assert!(!store.delete("docs").await.unwrap());
        assert!(store.get("docs").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_skips_corrupt_artifacts() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("indexes");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("broken.json"), "{not json").unwrap();
        let store = FileMetadataStore::new(dir);
        store.put(&record("ok")).await.unwrap();
        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].index_name, "ok");
    }

    #[tokio::test]
    async fn test_file_store_rejects_names_outside_dir() {
        let tmp = TempDir::new().unwrap();
        let store = FileMetadataStore::new(tmp.path().join("indexes"));
        std::fs::write(tmp.path().join("x.json"), serde_json::to_string(&record("x")).unwrap()).unwrap();

        let err = store.get("../x").await.unwrap_err();
        assert_eq!(err.code(), "invalid_input");
        assert_eq!(store.delete("../x").await.unwrap_err().code(), "invalid_input");
        assert!(tmp.path().join("x.json").exists());
        assert!(validate_index_name("support-tickets_2024").is_ok());
        assert!(validate_index_name("").is_err());
    }

    #[test]
    fn test_point_id_is_stable() {
        assert_eq!(metadata_point_id("docs"), metadata_point_id("docs"));
        assert_ne!(metadata_point_id("docs"), metadata_point_id("other"));
        assert_eq!(metadata_point_id("docs").get_version_num(), 5);
    }
}
