use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn pagewise_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("pagewise");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/pagewise.sqlite"

[embedding]
provider = "local"
dims = 64

[retrieval]
min_similarity = -1.0
"#,
        root.display()
    );

    let config_path = config_dir.join("pagewise.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_pagewise(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = pagewise_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run pagewise binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_pagewise(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_pagewise(&config_path, &["init"]);
    assert!(success, "Second init failed (not idempotent)");
}

#[test]
fn test_init_writes_default_config() {
    let tmp = TempDir::new().unwrap();
    let config_path = tmp.path().join("config").join("pagewise.toml");

    let output = Command::new(pagewise_binary())
        .current_dir(tmp.path())
        .arg("--config")
        .arg(&config_path)
        .arg("init")
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "init failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(config_path.exists());
    assert!(tmp.path().join("data").join("pagewise.sqlite").exists());
}

#[test]
fn test_keys_list_never_prints_secret() {
    let (_tmp, config_path) = setup_test_env();
    run_pagewise(&config_path, &["init"]);

    let (stdout, stderr, success) = run_pagewise(
        &config_path,
        &[
            "keys", "set", "--user", "alice", "--provider", "anthropic", "--secret", "sk-ant-secret-123",
        ],
    );
    assert!(success, "keys set failed: {} {}", stdout, stderr);
    assert!(!stdout.contains("sk-ant-secret-123"));

    let (stdout, stderr, success) = run_pagewise(&config_path, &["keys", "list", "--user", "alice"]);
    assert!(success, "keys list failed: {}", stderr);
    assert!(stdout.contains("anthropic"));
    assert!(stdout.contains("unchecked"));
    assert!(!stdout.contains("sk-ant-secret-123"));
    assert!(!stderr.contains("sk-ant-secret-123"));
}

#[test]
fn test_keys_set_rejects_unknown_provider() {
    let (_tmp, config_path) = setup_test_env();
    run_pagewise(&config_path, &["init"]);

    let (_, stderr, success) = run_pagewise(
        &config_path,
        &["keys", "set", "--user", "alice", "--provider", "mistral", "--secret", "x"],
    );
    assert!(!success);
    assert!(stderr.contains("unknown AI provider"));
}

#[test]
fn test_keys_prefer_shows_effective_order() {
    let (_tmp, config_path) = setup_test_env();
    run_pagewise(&config_path, &["init"]);

    let (stdout, stderr, success) =
        run_pagewise(&config_path, &["keys", "prefer", "--user", "alice", "google"]);
    assert!(success, "keys prefer failed: {}", stderr);
    assert!(stdout.contains("google, openai, anthropic"));
}

#[test]
fn test_ask_without_keys_reports_no_provider() {
    let (tmp, config_path) = setup_test_env();
    run_pagewise(&config_path, &["init"]);

    let page = tmp.path().join("refunds.txt");
    fs::write(&page, "Refunds are accepted within 30 days.").unwrap();
    let (stdout, stderr, success) = run_pagewise(
        &config_path,
        &[
            "pages", "add", "--user", "alice", "--title", "Refund policy", "--file",
            page.to_str().unwrap(),
        ],
    );
    assert!(success, "pages add failed: {} {}", stdout, stderr);
    assert!(stdout.contains("Added page"));

    let (_, stderr, success) = run_pagewise(
        &config_path,
        &["ask", "What is our refund policy?", "--user", "alice"],
    );
    assert!(!success);
    assert!(stderr.contains("No AI provider configured"));
}

#[test]
fn test_embed_pending_after_add_is_noop() {
    let (tmp, config_path) = setup_test_env();
    run_pagewise(&config_path, &["init"]);

    let page = tmp.path().join("notes.txt");
    fs::write(&page, "Deploys happen on Tuesdays.").unwrap();
    run_pagewise(
        &config_path,
        &[
            "pages", "add", "--user", "alice", "--title", "Deploys", "--file",
            page.to_str().unwrap(),
        ],
    );

    let (stdout, stderr, success) = run_pagewise(&config_path, &["embed", "pending"]);
    assert!(success, "embed pending failed: {}", stderr);
    assert!(stdout.contains("0 pending"));

    let (stdout, _, success) = run_pagewise(&config_path, &["embed", "rebuild"]);
    assert!(success);
    assert!(stdout.contains("1 embedded"));
}

#[test]
fn test_reconcile_runs_on_empty_database() {
    let (_tmp, config_path) = setup_test_env();
    run_pagewise(&config_path, &["init"]);

    let (stdout, stderr, success) = run_pagewise(&config_path, &["reconcile"]);
    assert!(success, "reconcile failed: {}", stderr);
    assert!(stdout.contains("Reconciled 0"));
}
