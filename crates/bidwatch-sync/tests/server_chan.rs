use bidwatch_storage::{build_http_client, HttpClientConfig};
use bidwatch_sync::{DeliveryError, PushChannel, ServerChanChannel};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn channel(server: &MockServer) -> ServerChanChannel {
    let client = build_http_client(&HttpClientConfig::default()).expect("client");
    ServerChanChannel::new(client, format!("{}/SCT123.send", server.uri()))
}

#[tokio::test]
async fn code_zero_is_delivered() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/SCT123.send"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .and(body_string_contains("title="))
        .and(body_string_contains("desp="))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 0, "message": ""})))
        .expect(1)
        .mount(&server)
        .await;

    channel(&server)
        .push("北京 change report", "## 变更\n> - **Title:** x")
        .await
        .expect("delivered");
}

#[tokio::test]
async fn nonzero_code_is_rejected() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"code": 40001, "message": "bad pushkey"})),
        )
        .mount(&server)
        .await;

    let err = channel(&server).push("t", "b").await.expect_err("rejected");
    match err {
        DeliveryError::Rejected { code, message } => {
            assert_eq!(code, 40001);
            assert_eq!(message, "bad pushkey");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn http_error_is_reported_with_status() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = channel(&server).push("t", "b").await.expect_err("http error");
    assert!(matches!(err, DeliveryError::HttpStatus(500)));
}

#[tokio::test]
async fn non_json_reply_is_malformed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
        .mount(&server)
        .await;

    let err = channel(&server).push("t", "b").await.expect_err("malformed");
    assert!(matches!(err, DeliveryError::Malformed(_)));
}
