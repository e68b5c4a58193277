use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use axum::{routing::get, Json, Router};
use serde_json::json;
use tempfile::TempDir;

fn feeder_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("feeder");
    path
}

/// An address nothing listens on.
fn dead_url() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    url
}

fn write_config(broker: &str, store: &str, tasks: &str) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let config_dir = tmp.path().join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let content = format!(
        r#"[endpoint]
bind = "127.0.0.1:0"
id = "feeder-test"
url = "http://127.0.0.1:9000"

[broker]
uri = "{}"
tenant = "acme"
timeout_secs = 2

[store]
uri = "{}"
ping_timeout_secs = 2

{}
"#,
        broker, store, tasks
    );

    let config_path = config_dir.join("feeder.toml");
    fs::write(&config_path, content).unwrap();
    (tmp, config_path)
}

const ONE_TASK: &str = "[[tasks]]\nname = \"sensors\"\ntrigger = \"time\"\nperiod_secs = 60\n";

fn run_feeder(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = feeder_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run feeder binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_help_lists_commands() {
    let output = Command::new(feeder_binary()).arg("--help").output().unwrap();
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success());
    assert!(stdout.contains("run"));
    assert!(stdout.contains("check"));
    assert!(stdout.contains("--config"));
}

#[test]
fn test_missing_config_file() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_feeder(&tmp.path().join("nope.toml"), &["check"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"), "stderr={}", stderr);
}

#[test]
fn test_config_without_tasks_is_rejected() {
    let (_tmp, config_path) = write_config("http://orion:1026", "http://es:9200", "");
    let (_, stderr, success) = run_feeder(&config_path, &["check"]);
    assert!(!success);
    assert!(stderr.contains("[[tasks]]"), "stderr={}", stderr);
}

#[test]
fn test_invalid_scope_is_rejected() {
    let tasks = "[[tasks]]\ntrigger = \"time\"\n[tasks.broker]\nscope = \"farm\"\n";
    let (_tmp, config_path) = write_config("http://orion:1026", "http://es:9200", tasks);
    let (_, stderr, success) = run_feeder(&config_path, &["check"]);
    assert!(!success);
    assert!(stderr.contains("scope"), "stderr={}", stderr);
}

#[test]
fn test_check_reports_unreachable_endpoints() {
    let (_tmp, config_path) = write_config(&dead_url(), &dead_url(), ONE_TASK);
    let (stdout, stderr, success) = run_feeder(&config_path, &["check"]);
    assert!(!success, "check should fail: stdout={}", stdout);
    assert!(stdout.contains("sensors"));
    assert!(stdout.contains("UNREACHABLE"));
    assert!(stderr.contains("unreachable endpoints"), "stderr={}", stderr);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_check_passes_against_live_endpoints() {
    let app = Router::new()
        .route("/", get(|| async { Json(json!({ "tagline": "You Know, for Search" })) }))
        .route("/v2/subscriptions", get(|| async { Json(json!([])) }));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let (_tmp, config_path) = write_config(&url, &url, ONE_TASK);
    let (stdout, stderr, success) =
        tokio::task::spawn_blocking(move || run_feeder(&config_path, &["check"]))
            .await
            .unwrap();
    assert!(success, "check failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("All 1 tasks reachable."));
}
