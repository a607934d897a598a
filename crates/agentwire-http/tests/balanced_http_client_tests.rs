//! Integration tests for BalancedHttpClient against wiremock servers.

use std::time::Duration;

use agentwire_http::{BalancedHttpClient, CallOptions, HttpClientConfig};
use agentwire_protocol::AgentError;
use pretty_assertions::assert_eq;
use serde_json::json;
use wiremock::matchers::{body_json, header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config() -> HttpClientConfig {
    HttpClientConfig::fast()
        .with_server_name("Router")
        .with_api_version("2.0")
}

async fn mount_health(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/health-check"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!("ok")))
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_get_sends_params_in_query() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/agents"))
        .and(query_param("account", "123"))
        .and(query_param("tags[]", "a:b=c"))
        .and(header("X-API-Version", "2.0"))
        .and(header("Accept", "application/json"))
        .and(header_exists("X-Request-Lineage-Uuid"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"agents": ["a"]})))
        .expect(1)
        .mount(&server)
        .await;

    let client = BalancedHttpClient::from_urls([server.uri()], config()).unwrap();
    let result = client
        .get(
            "/agents",
            &json!({"account": 123, "tags": ["a:b=c"]}),
            &CallOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(result, Some(json!({"agents": ["a"]})));
}

#[tokio::test]
async fn test_post_sends_json_body_and_request_uuid() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/push"))
        .and(header("X-Request-Lineage-Uuid", "my-uuid"))
        .and(header("X-Expires-At", "1000"))
        .and(body_json(json!({"type": "/foo/bar", "payload": {"k": "v"}})))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let client = BalancedHttpClient::from_urls([server.uri()], config()).unwrap();
    let options = CallOptions::default()
        .with_request_uuid("my-uuid")
        .with_header("X-Expires-At", "1000");
    let result = client
        .post("/push", &json!({"type": "/foo/bar", "payload": {"k": "v"}}), &options)
        .await
        .unwrap();
    assert_eq!(result, None);
}

#[tokio::test]
async fn test_created_returns_location() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/things"))
        .respond_with(ResponseTemplate::new(201).insert_header("Location", "/things/42"))
        .mount(&server)
        .await;

    let client = BalancedHttpClient::from_urls([server.uri()], config()).unwrap();
    let result = client
        .put("/things", &json!({}), &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(result, Some(json!("/things/42")));
}

#[tokio::test]
async fn test_empty_json_collapses_to_none() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/things/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let client = BalancedHttpClient::from_urls([server.uri()], config()).unwrap();
    let result = client
        .delete("/things/42", &json!({}), &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(result, None);
}

#[tokio::test]
async fn test_non_retryable_status_is_raised() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/request"))
        .respond_with(ResponseTemplate::new(400).set_body_string("bad data"))
        .expect(1)
        .mount(&server)
        .await;

    let client = BalancedHttpClient::from_urls([server.uri()], config()).unwrap();
    let err = client
        .post("/request", &json!({}), &CallOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.http_status(), Some(400));
    assert_eq!(err.to_string(), "400 Bad Request: bad data");
}

#[tokio::test]
async fn test_fails_over_to_next_endpoint() {
    let down = MockServer::start().await;
    let up = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&down)
        .await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"r": 1})))
        .expect(1)
        .mount(&up)
        .await;

    let client = BalancedHttpClient::from_urls([down.uri(), up.uri()], config()).unwrap();
    let result = client
        .get("/ping", &json!({}), &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(result, Some(json!({"r": 1})));
    assert!(client.balancer().is_dead(0));
    assert!(!client.balancer().is_dead(1));
}

#[tokio::test]
async fn test_connection_refused_counts_as_miss() {
    let up = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!(1)))
        .mount(&up)
        .await;

    let client =
        BalancedHttpClient::from_urls(["http://127.0.0.1:1", up.uri().as_str()], config()).unwrap();
    let result = client
        .get("/ping", &json!({}), &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(result, Some(json!(1)));
    assert_eq!(client.balancer().misses(0), 1);
}

#[tokio::test]
async fn test_exhaustion_raises_not_responding() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&server)
        .await;

    let client = BalancedHttpClient::from_urls([server.uri()], config()).unwrap();
    let err = client
        .get("/ping", &json!({}), &CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::NotResponding(_)));
    assert_eq!(err.to_string(), "Router not responding");
}

#[tokio::test]
async fn test_gateway_timeout_body_becomes_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/request"))
        .respond_with(ResponseTemplate::new(504).set_body_string("target not reachable"))
        .mount(&server)
        .await;

    let client = BalancedHttpClient::from_urls([server.uri()], config()).unwrap();
    let err = client
        .post("/request", &json!({}), &CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::NotResponding(ref m) if m == "target not reachable"));
}

#[tokio::test]
async fn test_dead_endpoint_revived_by_health_check() {
    let server = MockServer::start().await;
    mount_health(&server).await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!("pong")))
        .mount(&server)
        .await;

    let client = BalancedHttpClient::from_urls([server.uri()], config()).unwrap();
    assert!(client.get("/ping", &json!({}), &CallOptions::default()).await.is_err());
    assert!(client.balancer().is_dead(0));

    let result = client
        .get("/ping", &json!({}), &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(result, Some(json!("pong")));
    assert!(!client.balancer().is_dead(0));
}

#[tokio::test]
async fn test_poll_timeout_yields_no_result() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/listen"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!(["late"]))
                .set_delay(Duration::from_millis(1500)),
        )
        .mount(&server)
        .await;

    let client = BalancedHttpClient::from_urls([server.uri()], config()).unwrap();
    let options = CallOptions {
        poll_timeout: Some(Duration::from_millis(200)),
        ..CallOptions::default()
    };
    let result = client
        .poll("/listen", &json!({"wait_time": 55}), &options)
        .await
        .unwrap();
    assert_eq!(result, None);
    assert!(!client.balancer().is_dead(0));
}

#[tokio::test]
async fn test_check_health() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health-check"))
        .and(header("X-API-Version", "2.0"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!("ok")))
        .expect(1)
        .mount(&server)
        .await;

    let client = BalancedHttpClient::from_urls([server.uri()], config()).unwrap();
    assert_eq!(client.check_health(None).await.unwrap(), Some(json!("ok")));
}

#[tokio::test]
async fn test_check_health_retry_status_is_not_responding() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/health-check"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let client = BalancedHttpClient::from_urls([server.uri()], config()).unwrap();
    let err = client.check_health(None).await.unwrap_err();
    assert!(matches!(err, AgentError::NotResponding(_)));
    assert!(client.balancer().is_dead(0));
}
