//! Integration tests for the pagecast-pages CLI

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

/// Isolated config, database and token cache
struct TestEnv {
    _temp_dir: TempDir,
    config_path: PathBuf,
    tokens_path: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let db_path = temp_dir.path().join("posts.db");
        let tokens_path = temp_dir.path().join("tokens.json");

        let config_content = format!(
            r#"
[database]
path = "{}"

[tokens]
path = "{}"
"#,
            db_path.to_string_lossy().replace('\\', "/"),
            tokens_path.to_string_lossy().replace('\\', "/")
        );
        fs::write(&config_path, config_content).unwrap();

        Self {
            _temp_dir: temp_dir,
            config_path,
            tokens_path,
        }
    }

    fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("pagecast-pages").unwrap();
        cmd.env("PAGECAST_CONFIG", &self.config_path);
        cmd.env_remove("RUST_LOG")
            .env_remove("PAGECAST_LOG_FORMAT")
            .env_remove("PAGECAST_LOG_LEVEL");
        cmd
    }

    fn token_cache(&self) -> String {
        fs::read_to_string(&self.tokens_path).unwrap_or_default()
    }
}

#[test]
fn test_link_with_stdin() {
    let env = TestEnv::new();

    env.cmd()
        .args(["link", "page-a", "--name", "Page A", "--stdin"])
        .write_stdin("secret-token-a\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Linked page 'page-a' (Page A)"));

    assert!(env.token_cache().contains("secret-token-a"));
}

#[test]
fn test_link_with_token_flag_and_ttl() {
    let env = TestEnv::new();

    env.cmd()
        .args(["link", "page-a", "--token", "secret-token-a", "--ttl", "2h"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Linked page 'page-a' (page-a), token valid until"));
}

#[test]
fn test_link_requires_token_source() {
    let env = TestEnv::new();

    env.cmd().args(["link", "page-a"]).assert().failure();
}

#[test]
fn test_link_rejects_token_and_stdin_together() {
    let env = TestEnv::new();

    env.cmd()
        .args(["link", "page-a", "--token", "t", "--stdin"])
        .assert()
        .failure();
}

#[test]
fn test_link_rejects_empty_token() {
    let env = TestEnv::new();

    env.cmd()
        .args(["link", "page-a", "--stdin"])
        .write_stdin("   \n")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Access token cannot be empty"));
}

#[test]
fn test_link_rejects_bad_ttl() {
    let env = TestEnv::new();

    env.cmd()
        .args(["link", "page-a", "--token", "t", "--ttl", "soon"])
        .assert()
        .failure();
}

#[test]
fn test_list_never_shows_tokens() {
    let env = TestEnv::new();

    env.cmd()
        .args(["link", "page-a", "--name", "Page A", "--stdin"])
        .write_stdin("secret-token-a")
        .assert()
        .success();

    env.cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("page-a (Page A): token valid until"))
        .stdout(predicate::str::contains("secret-token-a").not());
}

#[test]
fn test_list_empty() {
    let env = TestEnv::new();

    env.cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No pages linked."));
}

#[test]
fn test_unlink_keeps_page_row() {
    let env = TestEnv::new();

    env.cmd()
        .args(["link", "page-a", "--name", "Page A", "--stdin"])
        .write_stdin("secret-token-a")
        .assert()
        .success();

    env.cmd()
        .args(["unlink", "page-a"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed cached token for page 'page-a'"));

    assert!(!env.token_cache().contains("secret-token-a"));

    env.cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("page-a (Page A): no valid token"));
}

#[test]
fn test_unlink_remove_page() {
    let env = TestEnv::new();

    env.cmd()
        .args(["link", "page-a", "--stdin"])
        .write_stdin("secret-token-a")
        .assert()
        .success();

    env.cmd()
        .args(["unlink", "page-a", "--remove-page"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed page 'page-a'"));

    env.cmd()
        .arg("list")
        .assert()
        .success()
        .stdout(predicate::str::contains("No pages linked."));
}

#[test]
fn test_unlink_unknown_page() {
    let env = TestEnv::new();

    env.cmd()
        .args(["unlink", "nope"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Page 'nope' is not linked"));
}

#[test]
fn test_clear_with_force() {
    let env = TestEnv::new();

    for page in ["page-a", "page-b"] {
        env.cmd()
            .args(["link", page, "--stdin"])
            .write_stdin(format!("token-for-{}", page))
            .assert()
            .success();
    }

    env.cmd()
        .args(["clear", "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Cleared all cached access tokens"));

    let cache = env.token_cache();
    assert!(!cache.contains("token-for-page-a"));
    assert!(!cache.contains("token-for-page-b"));
}

#[test]
fn test_missing_config_fails() {
    let temp_dir = TempDir::new().unwrap();

    Command::cargo_bin("pagecast-pages")
        .unwrap()
        .env("PAGECAST_CONFIG", temp_dir.path().join("absent.toml"))
        .arg("list")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to read config file"));
}
