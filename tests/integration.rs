use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

fn cap_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    path.pop(); // remove test binary name
    path.pop(); // remove deps/
    path.push("cap");
    path
}

fn setup_test_env() -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();

    let config_content = format!(
        r#"[db]
path = "{root}/data/cap.sqlite"

[paths]
capture_dir = "{root}/data/captured-images"
cleaned_dir = "{root}/data/cleaneddata"
prompt_store = "{root}/data/prompt-store"

[server]
bind = "127.0.0.1:7341"

[analysis]
provider = "disabled"

[upload]
default_user = "tester"
"#,
        root = root.display()
    );

    let config_path = config_dir.join("cap.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_cap(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = cap_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run cap binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let success = output.status.success();
    (stdout, stderr, success)
}

fn write_artifact(root: &Path, folder: &str) {
    let dir = root.join("data/prompt-store").join(folder);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("screenshot.jpg"), [0xff, 0xd8, 0xff, 0xe0]).unwrap();
    fs::write(
        dir.join("processed.json"),
        r#"{"metadata":{"url":"https://example.com","title":"Example"},"structure":[]}"#,
    )
    .unwrap();
    fs::write(dir.join("analysis.txt"), "Website Analysis: https://example.com").unwrap();
}

#[test]
fn test_init_creates_database() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, stderr, success) = run_cap(&config_path, &["init"]);
    assert!(success, "init failed: stdout={}, stderr={}", stdout, stderr);
    assert!(stdout.contains("initialized"));
    assert!(tmp.path().join("data/cap.sqlite").exists());
    assert!(tmp.path().join("data/prompt-store").is_dir());
    assert!(tmp.path().join("data/cleaneddata").is_dir());
}

#[test]
fn test_init_idempotent() {
    let (_tmp, config_path) = setup_test_env();

    let (_, _, success1) = run_cap(&config_path, &["init"]);
    assert!(success1, "First init failed");

    let (_, _, success2) = run_cap(&config_path, &["init"]);
    assert!(success2, "Second init failed (not idempotent)");
}

#[test]
fn test_invalid_config_rejected() {
    let (tmp, _) = setup_test_env();
    let bad = tmp.path().join("config/bad.toml");
    fs::write(
        &bad,
        format!(
            "[db]\npath = \"{0}/x.sqlite\"\n[paths]\ncapture_dir = \"{0}/a\"\ncleaned_dir = \"{0}/b\"\nprompt_store = \"{0}/c\"\n[analysis]\nprovider = \"bogus\"\n",
            tmp.path().display()
        ),
    )
    .unwrap();

    let (_, stderr, success) = run_cap(&bad, &["init"]);
    assert!(!success);
    assert!(stderr.contains("Unknown analysis provider"), "{}", stderr);
}

#[test]
fn test_clean_prints_structure() {
    let (tmp, config_path) = setup_test_env();
    let page = tmp.path().join("page.html");
    fs::write(
        &page,
        r#"<html><head><script>evil()</script></head><body><div id="x" class="c">Hello World</div></body></html>"#,
    )
    .unwrap();

    let (stdout, stderr, success) = run_cap(
        &config_path,
        &["clean", page.to_str().unwrap(), "--url", "https://example.com"],
    );
    assert!(success, "clean failed: {}", stderr);
    let doc: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(doc["metadata"]["url"], "https://example.com");
    assert_eq!(doc["structure"][0]["tag"], "div");
    assert_eq!(doc["structure"][0]["text"], "Hello World");
    assert!(!stdout.contains("evil"));
}

#[test]
fn test_clean_rejects_empty_document() {
    let (tmp, config_path) = setup_test_env();
    let page = tmp.path().join("empty.html");
    fs::write(&page, "").unwrap();

    let (_, _, success) = run_cap(&config_path, &["clean", page.to_str().unwrap()]);
    assert!(!success);
}

#[test]
fn test_upload_dry_run_leaves_files() {
    let (tmp, config_path) = setup_test_env();
    run_cap(&config_path, &["init"]);
    write_artifact(tmp.path(), "session-1_100");

    let (stdout, _, success) = run_cap(&config_path, &["upload", "--dry-run"]);
    assert!(success);
    assert!(stdout.contains("3 file(s) in 1 project(s)"), "{}", stdout);
    assert!(tmp
        .path()
        .join("data/prompt-store/session-1_100/analysis.txt")
        .exists());
}

#[test]
fn test_upload_moves_and_links() {
    let (tmp, config_path) = setup_test_env();
    run_cap(&config_path, &["init"]);
    write_artifact(tmp.path(), "session-1_100");
    write_artifact(tmp.path(), "session-1_200");

    let (stdout, stderr, success) = run_cap(&config_path, &["upload"]);
    assert!(success, "upload failed: {}", stderr);
    assert!(stdout.contains("Uploaded 6 file(s)"), "{}", stdout);

    let store = tmp.path().join("data/prompt-store");
    assert!(!store.join("session-1_100/screenshot.jpg").exists());
    assert!(store.join("done/session-1_100/screenshot.jpg").exists());
    assert!(store.join("done/session-1_200/analysis.txt").exists());

    let (stdout, _, success) = run_cap(&config_path, &["history", "--user", "tester"]);
    assert!(success);
    assert!(stdout.contains("session-1_100"));
    assert!(stdout.contains("session-1_200"));
    assert!(stdout.contains("3 file(s)"));

    // Nothing left to upload
    let (stdout, _, _) = run_cap(&config_path, &["upload"]);
    assert!(stdout.contains("Uploaded 0 file(s)"), "{}", stdout);
}

#[test]
fn test_sessions_listing() {
    let (tmp, config_path) = setup_test_env();

    let (stdout, _, success) = run_cap(&config_path, &["sessions"]);
    assert!(success);
    assert!(stdout.contains("No sessions."));

    let session = tmp.path().join("data/captured-images/session-2");
    fs::create_dir_all(&session).unwrap();
    fs::write(session.join("1700000000000.jpg"), [0xff]).unwrap();
    fs::write(session.join("1700000000000.html"), "<p>x</p>").unwrap();
    fs::write(session.join("1700000060000.jpg"), [0xff]).unwrap();

    let (stdout, _, success) = run_cap(&config_path, &["sessions"]);
    assert!(success);
    assert!(stdout.contains("session-2"));
    assert!(stdout.contains("images: 2"));
    assert!(stdout.contains("html: 1"));
}

#[test]
fn test_events_poll_empty() {
    let (_tmp, config_path) = setup_test_env();
    run_cap(&config_path, &["init"]);

    let (stdout, stderr, success) = run_cap(&config_path, &["events", "poll"]);
    assert!(success, "poll failed: {}", stderr);
    assert!(stdout.contains("No events."));
}

#[test]
fn test_history_empty() {
    let (_tmp, config_path) = setup_test_env();
    run_cap(&config_path, &["init"]);

    let (stdout, _, success) = run_cap(&config_path, &["history", "--user", "nobody"]);
    assert!(success);
    assert!(stdout.contains("No projects for nobody."));
}
