use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use space_harness::config::FrameworkConfig;
use space_harness::process::ServerHandle;

fn spx_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("spx");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();

    fs::write(
        root.join("tickets.csv"),
        "id,title,opened,team\n\
         t1,printer jammed on floor two,2024-05-01,ops\n\
         t2,vpn disconnects every hour,2024-05-03,net\n\
         t3,printer out of toner,2024-05-04,ops\n",
    )
    .unwrap();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    let config_path = config_dir.join("spx.toml");
    fs::write(
        &config_path,
        format!(
            r#"[workspace]
dir = "{}"

[backend]
kind = "in_process"

[embedding]
provider = "hashing"
dims = 256
"#,
            root.display()
        ),
    )
    .unwrap();

    (tmp, config_path)
}

fn run_spx(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = spx_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path)
        .arg("--no-color")
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run spx binary at {:?}: {}", binary, e));

    (
        String::from_utf8_lossy(&output.stdout).to_string(),
        String::from_utf8_lossy(&output.stderr).to_string(),
        output.status.success(),
    )
}

fn json_out(stdout: &str) -> Value {
    serde_json::from_str(stdout).unwrap_or_else(|e| panic!("stdout is not JSON ({}): {}", e, stdout))
}

#[test]
fn test_preview_create_query() {
    let (_tmp, config) = setup_test_env();

    let (stdout, stderr, ok) = run_spx(&config, &["preview", "tickets.csv", "--rows", "2"]);
    assert!(ok, "preview failed: {}", stderr);
    let preview = json_out(&stdout);
    assert_eq!(preview["row_count"], 3);
    assert_eq!(preview["sample_rows"].as_array().unwrap().len(), 2);
    assert_eq!(preview["detected_roles"]["opened"], "recency");

    let (stdout, stderr, ok) = run_spx(
        &config,
        &[
            "create",
            "tickets.csv",
            "--map",
            "title=text_similarity",
            "--map",
            "opened=recency",
            "--map",
            "team=category",
            "--weight",
            "opened=0.1",
        ],
    );
    assert!(ok, "create failed: {}", stderr);
    let created = json_out(&stdout);
    assert_eq!(created["status"], "created");
    assert_eq!(created["index_name"], "tickets");
    assert_eq!(created["ingested"], 3);

    let (stdout, _, ok) = run_spx(&config, &["list"]);
    assert!(ok);
    assert_eq!(json_out(&stdout)["indexes"][0], "tickets");

    // A fresh process rebuilds the in-process index from the source file
    let (stdout, stderr, ok) = run_spx(
        &config,
        &["query", "tickets", "vpn disconnects", "--limit", "1"],
    );
    assert!(ok, "query failed: {}", stderr);
    let hits = json_out(&stdout);
    assert_eq!(hits[0]["id"], "t2");
}

#[test]
fn test_errors_are_json_with_failure_exit() {
    let (_tmp, config) = setup_test_env();

    let (stdout, _, ok) = run_spx(&config, &["query", "nothing", "anything"]);
    assert!(!ok);
    let err = json_out(&stdout);
    assert_eq!(err["error"]["code"], "not_found");

    let (stdout, _, ok) = run_spx(&config, &["create", "tickets.csv", "--map", "opened=recency"]);
    assert!(!ok);
    assert_eq!(json_out(&stdout)["error"]["code"], "no_text_column");
}

#[test]
fn test_bad_role_rejected_by_argument_parser() {
    let (_tmp, config) = setup_test_env();
    let (_, stderr, ok) = run_spx(&config, &["create", "tickets.csv", "--map", "title=vector"]);
    assert!(!ok);
    assert!(stderr.contains("title=vector") || stderr.contains("vector"));
}

#[tokio::test]
async fn test_managed_restart_replaces_server_started_by_earlier_process() {
    let (tmp, config) = setup_test_env();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    // `spx serve http` answers /health, so it stands in for the framework server
    let framework = FrameworkConfig {
        url: format!("http://127.0.0.1:{}", port),
        command: Some(vec![
            spx_binary().display().to_string(),
            "--config".to_string(),
            config.display().to_string(),
            "serve".to_string(),
            "http".to_string(),
            "--bind".to_string(),
            format!("127.0.0.1:{}", port),
        ]),
        startup_timeout_secs: 15,
        poll_interval_ms: 100,
        ..FrameworkConfig::default()
    };

    let first = ServerHandle::new(&framework, tmp.path().to_path_buf());
    first.start(&[]).await.unwrap();
    let old_pid = first.status().await.pid.unwrap();

    // A later process knows the old server only through the pid file
    let second = ServerHandle::new(&framework, tmp.path().to_path_buf());
    second.start(&[]).await.unwrap();
    let status = second.status().await;
    assert!(status.healthy);
    let new_pid = status.pid.unwrap();
    assert_ne!(new_pid, old_pid);
    assert_eq!(
        fs::read_to_string(second.pid_path()).unwrap().trim(),
        new_pid.to_string()
    );

    assert!(second.stop().await.unwrap());
    assert!(!second.is_healthy().await);
}
