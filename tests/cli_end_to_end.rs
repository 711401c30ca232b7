use std::fs;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::TempDir;

fn memory_config(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("tagcache.toml");
    fs::write(
        &path,
        r#"
[cache]
required_bins = ["page"]

[cache.bins.page]
capacity = 10

[cache.bins.render]
capacity = 10
"#,
    )
    .expect("write config");
    path
}

fn tagcache(dir: &TempDir) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("tagcache"));
    cmd.current_dir(dir.path())
        .env_remove("TAGCACHE_CONFIG_FILE")
        .env("RUST_LOG", "error");
    cmd
}

#[test]
fn bins_lists_configured_backends() {
    let dir = TempDir::new().expect("temp dir");
    let config = memory_config(&dir);

    let assert = tagcache(&dir)
        .arg("--config-file")
        .arg(&config)
        .arg("bins")
        .assert()
        .success();

    let output: serde_json::Value =
        serde_json::from_slice(&assert.get_output().stdout).expect("json output");
    assert_eq!(
        output,
        serde_json::json!([
            { "bin": "page", "backend": "memory" },
            { "bin": "render", "backend": "memory" },
        ])
    );
}

#[test]
fn invalidate_reports_every_bin() {
    let dir = TempDir::new().expect("temp dir");
    let config = memory_config(&dir);

    tagcache(&dir)
        .arg("--config-file")
        .arg(&config)
        .args(["invalidate", "node:5", "node_list"])
        .assert()
        .success()
        .stdout(contains("\"operation\": \"invalidate\""))
        .stdout(contains("\"render\""));
}

#[test]
fn fingerprint_is_stable_across_runs() {
    let dir = TempDir::new().expect("temp dir");
    let run = || {
        let assert = tagcache(&dir)
            .args(["fingerprint", "--sql", "SELECT 1 WHERE x = $1", "5"])
            .assert()
            .success();
        serde_json::from_slice::<serde_json::Value>(&assert.get_output().stdout)
            .expect("json output")
    };

    let first = run();
    let second = run();
    assert_eq!(first["fingerprint"], second["fingerprint"]);
    assert_eq!(first["params"], serde_json::json!([5]));
}

#[test]
fn invalid_configuration_fails_fast() {
    let dir = TempDir::new().expect("temp dir");

    tagcache(&dir)
        .args(["--log-level", "loud", "bins"])
        .assert()
        .failure()
        .stderr(contains("logging.level"));
}
