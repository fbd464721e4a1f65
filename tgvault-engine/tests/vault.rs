use std::sync::Arc;

use serde_json::json;
use tempfile::tempdir;
use tgvault_engine::pipeline::NamePolicy;
use tgvault_engine::transport::MemoryTransport;
use tgvault_engine::{Vault, VaultConfig, VaultError};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn bot_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bot123:abc/getMe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {
                "id": 7,
                "is_bot": true,
                "first_name": "vault",
                "username": "my_vault_bot"
            }
        })))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn init_then_open_with_the_same_password() {
    let dir = tempdir().unwrap();
    let server = bot_server().await;
    let mut config = VaultConfig::at(dir.path());
    config.api_url = Some(server.uri());

    let local = Vault::init(&config, "123:abc", "-1001", "hunter2")
        .await
        .unwrap();
    assert_eq!(local.chat_id, "-1001");
    assert!(config.config_path().exists());

    let err = Vault::init(&config, "123:abc", "-1001", "hunter2")
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::AlreadyInitialized(_)));

    let wrong = Vault::open(&config, "hunter3").await;
    assert!(matches!(wrong, Err(VaultError::WrongPassword)));

    let vault = Vault::open(&config, "hunter2").await.unwrap();
    assert_eq!(vault.local().bot_token, "123:abc");
    assert!(config.index_path().exists());
    vault.close().await;
}

#[tokio::test]
async fn rejected_token_writes_no_config() {
    let dir = tempdir().unwrap();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "ok": false,
            "error_code": 401,
            "description": "Unauthorized"
        })))
        .mount(&server)
        .await;
    let mut config = VaultConfig::at(dir.path());
    config.api_url = Some(server.uri());

    let err = Vault::init(&config, "bad", "-1", "pw").await.unwrap_err();
    assert!(matches!(err, VaultError::Bot(_)));
    assert!(!config.config_path().exists());
}

#[tokio::test]
async fn opening_without_init_reports_missing_config() {
    let dir = tempdir().unwrap();
    let config = VaultConfig::at(dir.path());
    let err = Vault::open(&config, "pw").await.err().unwrap();
    assert!(matches!(err, VaultError::NotInitialized(path) if path == config.config_path()));
}

#[tokio::test]
async fn opened_vault_stores_and_restores_files() {
    let dir = tempdir().unwrap();
    let server = bot_server().await;
    let mut config = VaultConfig::at(dir.path());
    config.api_url = Some(server.uri());
    Vault::init(&config, "123:abc", "-1001", "pw").await.unwrap();

    let transport = MemoryTransport::new(1024);
    let vault = Vault::open_with_transport(&config, "pw", Arc::new(transport.clone()))
        .await
        .unwrap();
    let body = b"a vault entry that spans more than one chunk ".repeat(40);
    let file = vault
        .pipeline()
        .upload_bytes("notes/entry.txt", body.clone(), NamePolicy::Reject)
        .await
        .unwrap();
    assert!(file.chunk_count >= 1);
    assert_eq!(vault.index().list_files().await.unwrap().len(), 1);
    vault.close().await;

    let reopened = Vault::open_with_transport(&config, "pw", Arc::new(transport))
        .await
        .unwrap();
    let file = reopened.pipeline().resolve("notes/entry.txt").await.unwrap();
    assert_eq!(reopened.pipeline().download_bytes(&file).await.unwrap(), body);
}
