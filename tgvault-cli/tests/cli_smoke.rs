use std::path::Path;
use std::process::{Command, Output};

use serde_json::json;
use tempfile::tempdir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn run_cli(root: &Path, api_url: Option<&str>, args: &[&str]) -> Output {
    let exe = env!("CARGO_BIN_EXE_tgvault");
    let mut command = Command::new(exe);
    command
        .args(args)
        .current_dir(root)
        .env("TGVAULT_CONFIG_DIR", root.join("config"))
        .env("TGVAULT_DATA_DIR", root.join("data"))
        .env("TGVAULT_PASSWORD", "correct horse")
        .env("RUST_LOG", "off")
        .env_remove("TGVAULT_API_URL");
    if let Some(url) = api_url {
        command.env("TGVAULT_API_URL", url);
    }
    command.output().expect("tgvault should execute")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn help_lists_primary_commands() {
    let dir = tempdir().unwrap();
    let output = run_cli(dir.path(), None, &["--help"]);
    assert!(output.status.success());
    let text = stdout(&output);
    for command in ["init", "push", "pull", "resume", "mount", "sync", "verify"] {
        assert!(text.contains(command), "help is missing {command}");
    }
}

#[test]
fn unknown_commands_fail() {
    let dir = tempdir().unwrap();
    let output = run_cli(dir.path(), None, &["frobnicate"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown command"));
}

#[test]
fn commands_before_init_report_missing_config() {
    let dir = tempdir().unwrap();
    let output = run_cli(dir.path(), None, &["list"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("not initialised"));
}

#[tokio::test(flavor = "multi_thread")]
async fn init_push_list_and_tag_against_a_mock_bot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bot123:abc/getMe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {"id": 7, "is_bot": true, "first_name": "vault"}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/bot123:abc/sendDocument"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {
                "message_id": 11,
                "document": {"file_id": "BQAC-1", "file_unique_id": "u1", "file_size": 10}
            }
        })))
        .mount(&server)
        .await;

    let dir = tempdir().unwrap();
    let root = dir.path();
    let url = server.uri();

    let init = run_cli(root, Some(&url), &["init", "123:abc", "-1001"]);
    assert!(init.status.success(), "{}", String::from_utf8_lossy(&init.stderr));
    assert!(stdout(&init).contains("linked chat -1001"));

    std::fs::write(root.join("report.txt"), b"quarterly numbers").unwrap();
    let push = run_cli(root, Some(&url), &["push", "report.txt"]);
    assert!(push.status.success(), "{}", String::from_utf8_lossy(&push.stderr));
    assert!(stdout(&push).contains("stored report.txt"));

    let again = run_cli(root, Some(&url), &["push", "report.txt", "--name", "copy.txt"]);
    assert!(again.status.success());
    assert!(stdout(&again).contains("already stored as report.txt"));

    let list = run_cli(root, Some(&url), &["list"]);
    assert!(stdout(&list).contains("report.txt"));

    let tagged = run_cli(root, Some(&url), &["tag", "add", "report.txt", "Work", "finance"]);
    assert!(tagged.status.success());
    let untagged = run_cli(root, Some(&url), &["tag", "remove", "report.txt", "finance"]);
    assert!(stdout(&untagged).contains("report.txt: work"));

    let search = run_cli(root, Some(&url), &["search", "work"]);
    assert!(stdout(&search).contains("report.txt"));

    let status = run_cli(root, Some(&url), &["status"]);
    assert!(stdout(&status).contains("files:         1"));

    let pending = run_cli(root, Some(&url), &["resume", "--list"]);
    assert!(stdout(&pending).contains("no interrupted uploads"));
}
