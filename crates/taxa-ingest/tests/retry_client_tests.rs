//! Retry client behaviour against a mock HTTP server
//!
//! Covers:
//! - retryable statuses are retried and eventually succeed
//! - `Retry-After` is honoured
//! - permanent statuses fail after a single attempt
//! - transport failures stop at the attempt ceiling
//! - cancellation and the concurrency bound

use std::time::{Duration, Instant};

use taxa_ingest::client::{FetchRequest, RetryClient, MAX_ATTEMPTS};
use taxa_ingest::{FetchError, Provider, ProviderConfig};
use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn fast_config(base_url: &str) -> ProviderConfig {
    ProviderConfig::for_provider(Provider::Wikidata)
        .with_base_url(base_url)
        .with_timeout(Duration::from_secs(5))
        .with_backoff(Duration::from_millis(10), Duration::from_millis(40))
}

fn client(config: &ProviderConfig) -> RetryClient {
    RetryClient::new(config, "taxa-ingest-tests").unwrap()
}

// ============================================================================
// Retry Tests
// ============================================================================

#[tokio::test]
async fn test_retryable_status_then_success() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/entity"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/entity"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{\"ok\":true}"))
        .mount(&server)
        .await;

    let client = client(&fast_config(&server.uri()));
    let request = FetchRequest::get(format!("{}/entity", server.uri()));

    let response = client.send(&request, &CancellationToken::new()).await.unwrap();

    assert_eq!(response.status, 200);
    assert!(response.attempts >= 2);
    assert_eq!(response.body, "{\"ok\":true}");
}

#[tokio::test]
async fn test_retry_after_header_is_honoured() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/entity"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "3"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/entity"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .mount(&server)
        .await;

    let client = client(&fast_config(&server.uri()));
    let request = FetchRequest::get(format!("{}/entity", server.uri()));

    let started = Instant::now();
    let response = client.send(&request, &CancellationToken::new()).await.unwrap();

    assert_eq!(response.attempts, 2);
    assert!(started.elapsed() >= Duration::from_secs(3));
}

#[tokio::test]
async fn test_permanent_status_is_single_attempt() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/entity"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such entity"))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&fast_config(&server.uri()));
    let request = FetchRequest::get(format!("{}/entity", server.uri()));

    let err = client.send(&request, &CancellationToken::new()).await.unwrap_err();

    match err {
        FetchError::Api(api) => {
            assert_eq!(api.status, Some(404));
            assert_eq!(api.attempts, 1);
            assert!(api.is_not_found());
        },
        other => panic!("expected API error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_retryable_status_exhausts_attempts() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/entity"))
        .respond_with(ResponseTemplate::new(502))
        .expect(u64::from(MAX_ATTEMPTS))
        .mount(&server)
        .await;

    let client = client(&fast_config(&server.uri()));
    let request = FetchRequest::get(format!("{}/entity", server.uri()));

    let err = client.send(&request, &CancellationToken::new()).await.unwrap_err();

    assert_eq!(err.http_status(), Some(502));
    assert!(err.is_timeout_class());
}

#[tokio::test]
async fn test_transport_failure_stops_at_ceiling() {
    // Nothing listens on port 1
    let config = fast_config("http://127.0.0.1:1");
    let client = client(&config);
    let request = FetchRequest::get("http://127.0.0.1:1/entity");

    let err = client.send(&request, &CancellationToken::new()).await.unwrap_err();

    match err {
        FetchError::Api(api) => {
            assert_eq!(api.status, None);
            assert_eq!(api.attempts, MAX_ATTEMPTS);
        },
        other => panic!("expected transport error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_bearer_token_and_accept_header() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/taxa/sis/1"))
        .and(header("authorization", "Bearer secret"))
        .and(header("accept", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
        .expect(1)
        .mount(&server)
        .await;

    let config = fast_config(&server.uri()).with_auth_token("secret");
    let client = client(&config);
    let request = FetchRequest::get(format!("{}/taxa/sis/1", server.uri())).accept("application/json");

    let response = client.send(&request, &CancellationToken::new()).await.unwrap();
    assert_eq!(response.status, 200);
}

// ============================================================================
// Cancellation and Concurrency Tests
// ============================================================================

#[tokio::test]
async fn test_cancellation_interrupts_in_flight_request() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let client = client(&fast_config(&server.uri()));
    let request = FetchRequest::get(format!("{}/slow", server.uri()));
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = client.send(&request, &cancel).await.unwrap_err();

    assert!(err.is_cancelled());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn test_concurrency_is_bounded() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("{}")
                .set_delay(Duration::from_millis(300)),
        )
        .mount(&server)
        .await;

    let config = fast_config(&server.uri()).with_max_concurrency(2);
    let client = client(&config);
    let cancel = CancellationToken::new();
    let requests: Vec<FetchRequest> = (0..4)
        .map(|i| FetchRequest::get(format!("{}/entity/{}", server.uri(), i)))
        .collect();

    let started = Instant::now();
    let results = futures::future::join_all(requests.iter().map(|r| client.send(r, &cancel))).await;

    assert!(results.iter().all(|r| r.is_ok()));
    // Four requests through two permits take at least two rounds
    assert!(started.elapsed() >= Duration::from_millis(600));
    assert_eq!(client.available_permits(), 2);
}
