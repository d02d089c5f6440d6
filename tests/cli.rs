use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn cix_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cix");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let files_dir = root.join("files");
    fs::create_dir_all(&files_dir).unwrap();
    fs::write(
        files_dir.join("faq.json"),
        r#"{"refunds": "Refunds take five business days", "shipping": "Orders ship within two days"}"#,
    )
    .unwrap();
    fs::write(
        files_dir.join("staff.csv"),
        "name,team\nAda,Platform\nGrace,Compilers\n",
    )
    .unwrap();
    fs::write(files_dir.join("notes.docx"), b"PK\x03\x04").unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/cix.sqlite"

[pipeline]
batch_count = 2

[retrieval]
final_limit = 4

[storage]
upload_dir = "{root}/data/uploads"

[connectors.files]
include_globs = ["**/*"]
"#,
        root = root.display()
    );

    let config_path = config_dir.join("cix.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_cix(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = cix_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env_remove("NOTION_INTEGRATION_TOKEN")
        .env("RUST_LOG", "off")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cix binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn files_dir(config_path: &Path) -> String {
    config_path
        .parent()
        .and_then(Path::parent)
        .unwrap()
        .join("files")
        .display()
        .to_string()
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_cix(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));

    let (_, _, success) = run_cix(&config_path, &["init"]);
    assert!(success, "Second init failed (not idempotent)");
}

#[test]
fn test_sources_lists_every_kind() {
    let (_tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_cix(&config_path, &["sources"]);
    assert!(success);
    for kind in ["file", "azure", "s3", "notion", "nosql"] {
        assert!(stdout.contains(kind), "missing {} in: {}", kind, stdout);
    }
    assert!(stdout.contains("UNAVAILABLE"));
}

#[test]
fn test_sync_files_then_resync_skips() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);

    run_cix(&config_path, &["init"]);
    let (stdout, stderr, success) =
        run_cix(&config_path, &["sync", "file", "--path", &files, "--progress", "off"]);
    assert!(success, "sync failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("added: 4"), "got: {}", stdout);
    assert!(stdout.contains("ok"));

    let (stdout, _, success) =
        run_cix(&config_path, &["sync", "file", "--path", &files, "--progress", "off"]);
    assert!(success);
    assert!(stdout.contains("added: 0"), "got: {}", stdout);
    assert!(stdout.contains("skipped: 4"), "got: {}", stdout);
}

#[test]
fn test_full_sync_recreates() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);

    run_cix(&config_path, &["init"]);
    run_cix(&config_path, &["sync", "file", "--path", &files]);
    let (stdout, _, success) = run_cix(&config_path, &["sync", "file", "--path", &files, "--full"]);
    assert!(success);
    assert!(stdout.contains("added: 4"), "got: {}", stdout);
    assert!(stdout.contains("deleted: 4"), "got: {}", stdout);
}

#[test]
fn test_sync_unavailable_source_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_cix(&config_path, &["init"]);
    let (_, stderr, success) = run_cix(&config_path, &["sync", "notion", "--page-ids", "abc"]);
    assert!(!success);
    assert!(stderr.contains("400"), "got: {}", stderr);
}

#[test]
fn test_sync_without_origin_fails() {
    let (_tmp, config_path) = setup_test_env();

    run_cix(&config_path, &["init"]);
    let (_, stderr, success) = run_cix(&config_path, &["sync", "s3"]);
    assert!(!success);
    assert!(stderr.contains("bucket"), "got: {}", stderr);
}

#[test]
fn test_search_keyword() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);

    run_cix(&config_path, &["init"]);
    run_cix(&config_path, &["sync", "file", "--path", &files]);

    let (stdout, _, success) = run_cix(&config_path, &["search", "refunds"]);
    assert!(success, "search failed");
    assert!(stdout.contains("faq.json-0"), "got: {}", stdout);

    let (stdout, _, success) = run_cix(&config_path, &["search", "zeppelin"]);
    assert!(success);
    assert!(stdout.contains("No results."));
}

#[test]
fn test_upload_and_delete() {
    let (tmp, config_path) = setup_test_env();
    let upload = tmp.path().join("files").join("staff.csv");

    run_cix(&config_path, &["init"]);
    let (stdout, stderr, success) = run_cix(
        &config_path,
        &["upload", upload.to_str().unwrap(), "--description", "team list"],
    );
    assert!(success, "upload failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("added: 2"), "got: {}", stdout);

    // "upload staff.csv (<internal id>)"
    let internal_id = stdout
        .lines()
        .find_map(|l| l.strip_prefix("upload staff.csv ("))
        .and_then(|rest| rest.strip_suffix(')'))
        .expect("internal id in upload summary")
        .to_string();

    let (stdout, _, success) = run_cix(&config_path, &["uploads"]);
    assert!(success);
    assert!(stdout.contains(&internal_id), "got: {}", stdout);
    assert!(stdout.contains("staff.csv"));
    assert!(stdout.contains("team list"));

    let (stdout, _, success) = run_cix(&config_path, &["delete", &internal_id]);
    assert!(success);
    assert!(stdout.contains("records removed: 2"), "got: {}", stdout);

    let (stdout, _, _) = run_cix(&config_path, &["search", "Ada"]);
    assert!(stdout.contains("No results."), "got: {}", stdout);

    let (stdout, _, success) = run_cix(&config_path, &["uploads"]);
    assert!(success);
    assert!(stdout.contains("No uploads stored."), "got: {}", stdout);
}

#[test]
fn test_runs_lists_history() {
    let (_tmp, config_path) = setup_test_env();
    let files = files_dir(&config_path);

    run_cix(&config_path, &["init"]);
    let (stdout, _, _) = run_cix(&config_path, &["runs"]);
    assert!(stdout.contains("No runs recorded."));

    run_cix(&config_path, &["sync", "file", "--path", &files]);
    let (stdout, _, success) = run_cix(&config_path, &["runs"]);
    assert!(success);
    assert!(stdout.contains("done"));
    assert!(stdout.contains("content:file:"));
}

#[test]
fn test_missing_config_fails() {
    let tmp = TempDir::new().unwrap();
    let (_, stderr, success) = run_cix(&tmp.path().join("nope.toml"), &["sources"]);
    assert!(!success);
    assert!(stderr.contains("Failed to read config file"));
}
