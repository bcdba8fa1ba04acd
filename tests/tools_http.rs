//! HTTP tool API served on an ephemeral port.

use serde_json::{json, Value};
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

use space_harness::config::Config;
use space_harness::server::build_router;
use space_harness::service::IndexService;
use space_harness::traits::{ToolContext, ToolRegistry};

async fn start_server(tmp: &TempDir) -> String {
    let mut cfg = Config::minimal();
    cfg.workspace.dir = tmp.path().to_path_buf();
    let ctx = ToolContext::new(Arc::new(IndexService::new(cfg)));
    let app = build_router(Arc::new(ToolRegistry::with_builtins()), ctx);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    wait_for_server(&format!("http://{}", addr)).await;
    format!("http://{}", addr)
}

async fn wait_for_server(base: &str) {
    let client = reqwest::Client::new();
    for _ in 0..50 {
        if let Ok(resp) = client.get(format!("{}/health", base)).send().await {
            if resp.status().is_success() {
                return;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    }
    panic!("Server did not become ready within 5 seconds");
}

async fn call(base: &str, tool: &str, params: Value) -> (u16, Value) {
    let resp = reqwest::Client::new()
        .post(format!("{}/tools/{}", base, tool))
        .json(&params)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

#[tokio::test]
async fn test_health_and_tool_list() {
    let tmp = TempDir::new().unwrap();
    let base = start_server(&tmp).await;

    let health: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let list: Value = reqwest::get(format!("{}/tools/list", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let names: Vec<&str> = list["tools"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["preview_file", "create_index", "list_indexes", "query_index"]);
    assert_eq!(list["tools"][1]["parameters"]["required"], json!(["path"]));
}

#[tokio::test]
async fn test_create_then_query_over_http() {
    let tmp = TempDir::new().unwrap();
    fs::write(
        tmp.path().join("faq.csv"),
        "question,answer\nhow do I reset my password,use the reset link\nwhere is the office,second floor\n",
    )
    .unwrap();
    let base = start_server(&tmp).await;

    let (status, preview) = call(&base, "preview_file", json!({"path": "faq.csv", "rows": 1})).await;
    assert_eq!(status, 200);
    assert_eq!(preview["result"]["row_count"], 2);
    assert_eq!(preview["result"]["columns"], json!(["id", "question", "answer"]));

    let (status, created) = call(
        &base,
        "create_index",
        json!({"path": "faq.csv", "column_mapping": {"question": "text_similarity", "answer": "text_similarity"}}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(created["result"]["status"], "created");
    assert_eq!(created["result"]["ingested"], 2);

    let (status, hits) = call(
        &base,
        "query_index",
        json!({"index_name": "faq", "query_text": "reset password", "limit": 1}),
    )
    .await;
    assert_eq!(status, 200);
    assert_eq!(hits["result"][0]["fields"]["question"], "how do I reset my password");
}

#[tokio::test]
async fn test_errors_map_to_status_codes() {
    let tmp = TempDir::new().unwrap();
    let base = start_server(&tmp).await;

    let (status, body) = call(&base, "query_index", json!({"index_name": "ghost", "query_text": "x"})).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");
    assert_eq!(body["error"]["available_indexes"], json!([]));

    let (status, body) = call(&base, "create_index", json!({"path": "missing.csv"})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "file_load");

    let (status, body) = call(&base, "create_index", json!({"column_mapping": {}})).await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "invalid_input");

    let (status, body) = call(&base, "drop_everything", json!({})).await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");
}
