use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

use space_harness::backend::InProcessBackend;
use space_harness::config::Config;
use space_harness::metadata::{FileMetadataStore, MetadataStore};
use space_harness::models::{Role, RoleSpec, SpaceWeights};
use space_harness::service::{CreateIndexRequest, CreateStatus, IndexService, QueryIndexRequest};
use space_harness::traits::{ToolContext, ToolRegistry};

fn test_config(root: &Path) -> Config {
    let mut cfg = Config::minimal();
    cfg.workspace.dir = root.to_path_buf();
    cfg
}

fn write_docs(root: &Path) {
    fs::write(
        root.join("docs.csv"),
        "id,body,score\n1,hello world,0.9\n2,goodbye,0.1\n",
    )
    .unwrap();
}

fn create(path: &str, mapping: &[(&str, Role)]) -> CreateIndexRequest {
    CreateIndexRequest {
        path: path.to_string(),
        column_mapping: mapping
            .iter()
            .map(|(c, r)| (c.to_string(), RoleSpec::Fixed(*r)))
            .collect(),
        ..Default::default()
    }
}

fn query(index: &str, text: &str, limit: usize) -> QueryIndexRequest {
    QueryIndexRequest {
        index_name: index.to_string(),
        query_text: text.to_string(),
        limit,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_list_query_end_to_end() {
    let tmp = TempDir::new().unwrap();
    write_docs(tmp.path());
    let service = IndexService::new(test_config(tmp.path()));

    let created = service
        .create_index(create(
            "docs.csv",
            &[("body", Role::TextSimilarity), ("score", Role::Number)],
        ))
        .await
        .unwrap();
    assert_eq!(created.status, CreateStatus::Created);
    assert_eq!(created.index_name, "docs");
    assert_eq!(created.row_count, 2);
    assert_eq!(created.ingested, 2);
    assert_eq!(created.errors, 0);
    assert_eq!(created.columns, vec!["body", "score"]);

    let listed = service.list_indexes().await.unwrap();
    assert_eq!(listed.indexes, vec!["docs"]);
    assert_eq!(listed.details[0].source_filename, "docs.csv");
    assert_eq!(listed.details[0].total_rows, 2);

    let hits = service.query_index(query("docs", "hello", 1)).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "1");
    assert_eq!(hits[0].fields["body"], "hello world");
}

#[tokio::test]
async fn test_existing_index_needs_recreate() {
    let tmp = TempDir::new().unwrap();
    write_docs(tmp.path());
    let service = IndexService::new(test_config(tmp.path()));
    let request = create("docs.csv", &[("body", Role::TextSimilarity)]);

    service.create_index(request.clone()).await.unwrap();
    let again = service.create_index(request.clone()).await.unwrap();
    assert_eq!(again.status, CreateStatus::Exists);
    assert!(again.message.contains("recreate"));
    assert_eq!(again.ingested, 0);

    // The recreated index picks up the new file contents and mapping
    fs::write(
        tmp.path().join("docs.csv"),
        "id,body,score\n1,hello world,0.9\n2,goodbye,0.1\n3,hello again,0.5\n",
    )
    .unwrap();
    let recreated = service
        .create_index(CreateIndexRequest {
            recreate: true,
            ..create(
                "docs.csv",
                &[("body", Role::TextSimilarity), ("score", Role::Number)],
            )
        })
        .await
        .unwrap();
    assert_eq!(recreated.status, CreateStatus::Recreated);
    assert_eq!(recreated.row_count, 3);

    let listed = service.list_indexes().await.unwrap();
    assert_eq!(listed.indexes, vec!["docs"]);
    assert!(listed.details[0].column_mapping.contains("score"));

    let hits = service.query_index(query("docs", "hello", 10)).await.unwrap();
    assert_eq!(hits.len(), 3);
}

#[tokio::test]
async fn test_recreate_drops_rows_missing_from_new_file() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("docs.csv"),
        "id,body\n1,hello world\n2,hello there\n3,hello stale\n",
    )
    .unwrap();
    let service = IndexService::new(test_config(tmp.path()));
    let request = create("docs.csv", &[("body", Role::TextSimilarity)]);
    service.create_index(request.clone()).await.unwrap();

    fs::write(
        tmp.path().join("docs.csv"),
        "id,body\n1,hello world\n2,hello there\n",
    )
    .unwrap();
    let recreated = service
        .create_index(CreateIndexRequest {
            recreate: true,
            ..request
        })
        .await
        .unwrap();
    assert_eq!(recreated.status, CreateStatus::Recreated);

    let hits = service.query_index(query("docs", "hello stale", 10)).await.unwrap();
    let mut ids: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["1", "2"]);
}

#[tokio::test]
async fn test_unknown_index_lists_available() {
    let tmp = TempDir::new().unwrap();
    write_docs(tmp.path());
    let service = IndexService::new(test_config(tmp.path()));
    service
        .create_index(create("docs.csv", &[("body", Role::TextSimilarity)]))
        .await
        .unwrap();

    let err = service.query_index(query("nope", "hello", 3)).await.unwrap_err();
    assert_eq!(err.code(), "not_found");
    assert_eq!(err.to_json()["error"]["available_indexes"], json!(["docs"]));
}

#[tokio::test]
async fn test_invalid_requests() {
    let tmp = TempDir::new().unwrap();
    write_docs(tmp.path());
    let service = IndexService::new(test_config(tmp.path()));

    let err = service
        .create_index(create("docs.csv", &[("score", Role::Number)]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "no_text_column");

    let err = service
        .create_index(create("docs.csv", &[("missing", Role::TextSimilarity)]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_input");
    assert!(err.to_string().contains("missing"));

    let err = service
        .create_index(create("absent.csv", &[("body", Role::TextSimilarity)]))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "file_load");

    let mut weights = SpaceWeights::new();
    weights.insert("title".into(), 1.0);
    let err = service
        .create_index(CreateIndexRequest {
            weights,
            ..create("docs.csv", &[("body", Role::TextSimilarity)])
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_input");

    // Nothing was recorded by the failed attempts
    assert!(service.list_indexes().await.unwrap().indexes.is_empty());

    service
        .create_index(create("docs.csv", &[("body", Role::TextSimilarity)]))
        .await
        .unwrap();
    let err = service.query_index(query("docs", "  ", 3)).await.unwrap_err();
    assert_eq!(err.code(), "invalid_input");
    let err = service.query_index(query("docs", "hello", 0)).await.unwrap_err();
    assert_eq!(err.code(), "invalid_input");
    let err = service.query_index(query("../docs", "hello", 3)).await.unwrap_err();
    assert_eq!(err.code(), "invalid_input");

    let mut negative = query("docs", "hello", 3);
    negative.weights.insert("body".into(), -1.0);
    let err = service.query_index(negative).await.unwrap_err();
    assert!(err.to_string().contains(">= 0"));

    let mut filtered = query("docs", "hello", 3);
    filtered.categories.insert("body".into(), "x".into());
    let err = service.query_index(filtered).await.unwrap_err();
    assert_eq!(err.code(), "invalid_input");
    assert!(err.to_string().contains("category filter"));
}

#[tokio::test]
async fn test_malformed_timestamp_counts_as_row_error() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("events.csv"),
        "id,body,at\n1,alpha,2024-01-01\n2,beta,someday-soon\n3,gamma,2024-02-01\n",
    )
    .unwrap();
    let service = IndexService::new(test_config(tmp.path()));

    let created = service
        .create_index(create(
            "events.csv",
            &[("body", Role::TextSimilarity), ("at", Role::Recency)],
        ))
        .await
        .unwrap();
    assert_eq!(created.ingested, 2);
    assert_eq!(created.errors, 1);
}

#[tokio::test]
async fn test_detected_mapping_when_none_given() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("notes.json"),
        json!({
            "id": {"0": "a", "1": "b"},
            "text": {"0": "first note", "1": "second note"},
            "priority": {"0": 1, "1": 5},
            "written": {"0": "2024-03-01", "1": "2024-03-05"}
        })
        .to_string(),
    )
    .unwrap();
    let service = IndexService::new(test_config(tmp.path()));

    let preview = service.preview_file("notes.json", 1).await.unwrap();
    assert_eq!(preview.row_count, 2);
    assert_eq!(preview.sample_rows.len(), 1);
    assert_eq!(preview.detected_roles.get("priority"), Some(Role::Number));
    assert_eq!(preview.detected_roles.get("written"), Some(Role::Recency));

    let created = service
        .create_index(CreateIndexRequest {
            path: "notes.json".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(created.column_mapping.get("text"), Some(Role::TextSimilarity));
    assert_eq!(created.column_mapping.get("priority"), Some(Role::Number));
    assert_eq!(created.ingested, 2);
}

#[tokio::test]
async fn test_fresh_process_rebuilds_from_source_file() {
    let tmp = TempDir::new().unwrap();
    write_docs(tmp.path());
    let cfg = test_config(tmp.path());

    IndexService::new(cfg.clone())
        .create_index(create("docs.csv", &[("body", Role::TextSimilarity)]))
        .await
        .unwrap();

    // A new service shares only the metadata directory
    let store: Arc<dyn MetadataStore> =
        Arc::new(FileMetadataStore::new(tmp.path().join(FileMetadataStore::DIR)));
    let backend = Arc::new(InProcessBackend::new(cfg.embedding.clone()));
    let service = IndexService::with_parts(cfg, backend.clone(), store);

    let hits = service.query_index(query("docs", "goodbye", 1)).await.unwrap();
    assert_eq!(hits[0].id, "2");
    assert_eq!(backend.row_count("docs").unwrap(), 2);
}

#[tokio::test]
async fn test_tools_return_structured_errors() {
    let tmp = TempDir::new().unwrap();
    write_docs(tmp.path());
    let ctx = ToolContext::new(Arc::new(IndexService::new(test_config(tmp.path()))));
    let tools = ToolRegistry::with_builtins();

    let created = tools
        .call(
            "create_index",
            json!({
                "path": "docs.csv",
                "column_mapping": "{\"body\": \"text_similarity\", \"score\": \"number\"}",
                "weights": {"score": 0.5}
            }),
            &ctx,
        )
        .await
        .unwrap();
    assert_eq!(created["status"], "created");
    assert_eq!(created["column_mapping"]["score"], "number");

    let listed = tools.call("list_indexes", json!({}), &ctx).await.unwrap();
    assert_eq!(listed["indexes"], json!(["docs"]));

    let hits = tools
        .call(
            "query_index",
            json!({"index_name": "docs", "query_text": "hello", "limit": 2, "weights": {"body": 2}}),
            &ctx,
        )
        .await
        .unwrap();
    assert_eq!(hits.as_array().unwrap().len(), 2);
    assert_eq!(hits[0]["id"], "1");

    let err = tools
        .call("query_index", json!({"index_name": "docs"}), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_input");

    let err = tools
        .call("query_index", json!({"index_name": "docs", "query_text": "x", "weights": {"nope": 1}}), &ctx)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "invalid_input");
}
