mod common;

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn repodoc_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("repodoc");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();
    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{}/data/repodoc.sqlite"

[chunking]
max_tokens = 400

[review]
min_score = 0.75
max_revisions = 2
"#,
        root.display()
    );
    let config_path = config_dir.join("repodoc.toml");
    fs::write(&config_path, config_content).unwrap();
    (tmp, config_path)
}

fn run_repodoc(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = repodoc_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("Failed to run repodoc binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_repodoc(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/repodoc.sqlite").exists());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, first) = run_repodoc(&config_path, &["init"]);
    assert!(first, "First init failed");
    let (_, _, second) = run_repodoc(&config_path, &["init"]);
    assert!(second, "Second init failed (not idempotent)");
}

#[test]
fn test_chunk_json_lists_exact_spans() {
    let (_tmp, config_path) = setup_test_env();
    let repo = common::fixture_repo();

    let (stdout, stderr, success) = run_repodoc(
        &config_path,
        &["chunk", repo.path().to_str().unwrap(), "--json"],
    );
    assert!(success, "chunk failed: {}", stderr);

    let chunks: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    let chunks = chunks.as_array().unwrap();
    assert!(!chunks.is_empty());
    assert!(chunks
        .iter()
        .any(|c| c["source_path"] == "app/main.py" && c["kind"] == "code"));
    assert!(chunks
        .iter()
        .all(|c| c["start_line"].as_u64() <= c["end_line"].as_u64()));
}

#[test]
fn test_chunk_is_deterministic() {
    let (_tmp, config_path) = setup_test_env();
    let repo = common::fixture_repo();
    let args = ["chunk", repo.path().to_str().unwrap()];

    let (first, _, ok1) = run_repodoc(&config_path, &args);
    let (second, _, ok2) = run_repodoc(&config_path, &args);
    assert!(ok1 && ok2);
    assert_eq!(first, second);
}

#[test]
fn test_verdicts_empty_database() {
    let (_tmp, config_path) = setup_test_env();
    run_repodoc(&config_path, &["init"]);

    let (stdout, stderr, success) = run_repodoc(&config_path, &["verdicts"]);
    assert!(success, "verdicts failed: {}", stderr);
    assert!(stdout.contains("No verdicts recorded."));
}

#[test]
fn test_generate_without_embeddings_is_fatal() {
    let (_tmp, config_path) = setup_test_env();
    let repo = common::fixture_repo();
    let out = TempDir::new().unwrap();

    let (_, stderr, success) = run_repodoc(
        &config_path,
        &[
            "generate",
            repo.path().to_str().unwrap(),
            "--out",
            out.path().to_str().unwrap(),
        ],
    );
    assert!(!success);
    assert!(stderr.contains("index are empty"), "stderr={}", stderr);
    assert!(!out.path().join("manifest.json").exists());
}

#[test]
fn test_unknown_section_is_rejected() {
    let (_tmp, config_path) = setup_test_env();
    let repo = common::fixture_repo();

    let (_, stderr, success) = run_repodoc(
        &config_path,
        &["generate", repo.path().to_str().unwrap(), "--section", "nope"],
    );
    assert!(!success);
    assert!(stderr.contains("unknown section"), "stderr={}", stderr);
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_repodoc(&tmp.path().join("absent.toml"), &["init"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}

#[test]
fn test_completions_need_no_config() {
    let tmp = TempDir::new().unwrap();
    let (stdout, _, success) =
        run_repodoc(&tmp.path().join("absent.toml"), &["completions", "bash"]);
    assert!(success);
    assert!(stdout.contains("repodoc"));
}
