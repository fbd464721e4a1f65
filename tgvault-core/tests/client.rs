use serde_json::json;
use tgvault_core::{ApiErrorClass, BotClient, BotError};
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn get_me_uses_token_in_path() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/bottest-token/getMe"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {
                "id": 42,
                "is_bot": true,
                "first_name": "vault",
                "username": "vault_bot"
            }
        })))
        .mount(&server)
        .await;

    let client = BotClient::with_base_url(&server.uri(), "test-token").unwrap();
    let me = client.get_me().await.unwrap();

    assert_eq!(me.id, 42);
    assert!(me.is_bot);
    assert_eq!(me.username.as_deref(), Some("vault_bot"));
}

#[tokio::test]
async fn send_document_returns_file_id() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/bottest-token/sendDocument"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {
                "message_id": 17,
                "document": {
                    "file_id": "BQACAgIAAx",
                    "file_unique_id": "AgAD",
                    "file_name": "report.pdf.000",
                    "file_size": 5
                }
            }
        })))
        .mount(&server)
        .await;

    let client = BotClient::with_base_url(&server.uri(), "test-token").unwrap();
    let message = client
        .send_document("-100123", "report.pdf.000", b"hello".to_vec(), "report.pdf [1/1]")
        .await
        .unwrap();
    let (message_id, document) = message.into_document().unwrap();

    assert_eq!(message_id, 17);
    assert_eq!(document.file_id, "BQACAgIAAx");
    assert_eq!(document.file_size, Some(5));
}

#[tokio::test]
async fn fetch_document_resolves_file_path() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/bottest-token/getFile"))
        .and(query_param("file_id", "BQACAgIAAx"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "ok": true,
            "result": {
                "file_id": "BQACAgIAAx",
                "file_unique_id": "AgAD",
                "file_size": 5,
                "file_path": "documents/file_1.bin"
            }
        })))
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/file/bottest-token/documents/file_1.bin"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello"))
        .mount(&server)
        .await;

    let client = BotClient::with_base_url(&server.uri(), "test-token").unwrap();
    let bytes = client.fetch_document("BQACAgIAAx").await.unwrap();

    assert_eq!(bytes, b"hello");
}

#[tokio::test]
async fn delete_message_reports_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/bottest-token/deleteMessage"))
        .and(query_param("chat_id", "-100123"))
        .and(query_param("message_id", "17"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "ok": false,
            "error_code": 400,
            "description": "Bad Request: message to delete not found"
        })))
        .mount(&server)
        .await;

    let client = BotClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client
        .delete_message("-100123", 17)
        .await
        .expect_err("expected api error");

    assert!(err.is_not_found());
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn rate_limit_carries_retry_after() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/bottest-token/getMe"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "ok": false,
            "error_code": 429,
            "description": "Too Many Requests: retry after 3",
            "parameters": { "retry_after": 3 }
        })))
        .mount(&server)
        .await;

    let client = BotClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.get_me().await.expect_err("expected rate limit");

    assert_eq!(err.classification(), Some(ApiErrorClass::RateLimit));
    assert!(matches!(
        err,
        BotError::Api {
            code: 429,
            retry_after: Some(3),
            ..
        }
    ));
}

#[tokio::test]
async fn non_json_error_body_is_preserved() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/bottest-token/getMe"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let client = BotClient::with_base_url(&server.uri(), "test-token").unwrap();
    let err = client.get_me().await.expect_err("expected gateway error");

    assert!(err.is_retryable());
    assert!(err.to_string().contains("bad gateway"));
}

#[tokio::test]
async fn connection_errors_do_not_leak_the_token() {
    let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = closed.local_addr().unwrap();
    drop(closed);

    let client = BotClient::with_base_url(&format!("http://{addr}"), "123456:SECRET-TOKEN").unwrap();
    let err = client.get_me().await.expect_err("nothing listens on the port");

    assert!(matches!(err, BotError::Request(_)));
    assert!(err.is_retryable());
    assert!(!err.to_string().contains("SECRET-TOKEN"), "{err}");
    assert!(!format!("{err:?}").contains("SECRET-TOKEN"), "{err:?}");
}
