//! Integration tests for the request pipeline
//!
//! **Coverage:**
//! - Auth: missing session, proactive single-flight refresh, 401 replay,
//!   terminal 401
//! - Retry: transient 5xx, `Retry-After`, exhaustion, cancellation, deadline
//! - Circuit breaker: opening per endpoint group, per-group thresholds,
//!   fatal errors not counted
//! - Cache: TTL freshness, ETag revalidation, force refresh, invalidation on
//!   mutation, undecodable entries
//! - Lifecycle: dispose
//!
//! **Infrastructure:**
//! - WireMock HTTP server standing in for the Fleetbook API
//! - In-memory token store; refreshes go through the HTTP refresher

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleetbook_common::auth::TokenSet;
use fleetbook_common::resilience::{CircuitBreakerConfig, CircuitStatus};
use fleetbook_common::testing::MemoryTokenStore;
use fleetbook_infra::api::{
    ApiClient, ApiError, CacheOptions, Method, RequestOptions, REQUEST_ID_HEADER,
};
use fleetbook_infra::config::ClientConfig;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// ============================================================================
// Helpers
// ============================================================================

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

/// Fast, deterministic retries against the mock server.
fn test_config(server: &MockServer) -> ClientConfig {
    let mut config = ClientConfig::default();
    config.api.base_url = server.uri();
    config.api.request_timeout = Duration::from_secs(5);
    config.retry.max_attempts = 3;
    config.retry.base_delay = ms(10);
    config.retry.max_delay = ms(50);
    config.retry.jitter_max = Duration::ZERO;
    config
}

fn client_with(config: ClientConfig, store: Arc<MemoryTokenStore>) -> ApiClient {
    ApiClient::builder().config(config).token_store(store).build().expect("client should build")
}

async fn logged_in_client(server: &MockServer) -> (ApiClient, Arc<MemoryTokenStore>) {
    let store = Arc::new(MemoryTokenStore::new());
    let client = client_with(test_config(server), Arc::clone(&store));
    client
        .login(TokenSet::new("access-1", Some("refresh-1".to_string()), Some(3600)))
        .await
        .expect("login should succeed");
    (client, store)
}

fn public_client(server: &MockServer) -> ApiClient {
    client_with(test_config(server), Arc::new(MemoryTokenStore::new()))
}

async fn requests_to(server: &MockServer, route: &str) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|request| request.url.path() == route)
        .count()
}

// ============================================================================
// Authentication
// ============================================================================

#[tokio::test]
async fn test_missing_session_fails_before_network() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;

    let client = public_client(&server);
    let result = client.request(Method::GET, "/vehicles", None, RequestOptions::new()).await;

    assert!(matches!(result, Err(ApiError::AuthenticationRequired)));
}

/// Validates that concurrent callers holding an expiring token share one refresh.
///
/// # Test Steps
/// 1. Log in with a token inside the refresh margin
/// 2. Fire ten authenticated requests at once
/// 3. Verify the refresh endpoint was called once and every request carried
///    the new token
#[tokio::test]
async fn test_concurrent_requests_share_one_refresh() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .and(body_json(json!({ "refresh_token": "refresh-1" })))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "access_token": "access-2", "expires_in": 3600 }))
                .set_delay(ms(100)),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/vehicles"))
        .and(header("authorization", "Bearer access-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(10)
        .mount(&server)
        .await;

    let store = Arc::new(MemoryTokenStore::new());
    let client = client_with(test_config(&server), Arc::clone(&store));
    client
        .login(TokenSet::new("access-1", Some("refresh-1".to_string()), Some(5)))
        .await
        .unwrap();

    let calls = (0..10).map(|_| client.request(Method::GET, "/vehicles", None, RequestOptions::new()));
    let results = futures::future::join_all(calls).await;

    assert!(results.iter().all(Result::is_ok));
    assert_eq!(client.tokens().access_token().as_deref(), Some("access-2"));
    assert_eq!(store.stored().map(|t| t.access_token), Some("access-2".to_string()));
}

#[tokio::test]
async fn test_unauthorized_refreshes_and_replays_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bookings"))
        .and(header("authorization", "Bearer access-1"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bookings"))
        .and(header("authorization", "Bearer access-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": 7 }])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "access_token": "access-2", "expires_in": 3600 })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (client, _store) = logged_in_client(&server).await;
    let bookings: Vec<Value> = client.get_json("/bookings", RequestOptions::new()).await.unwrap();

    assert_eq!(bookings, vec![json!({ "id": 7 })]);
}

/// Validates that a replayed request rejected again ends the session.
///
/// # Test Steps
/// 1. Server answers 401 to every token
/// 2. Pipeline refreshes and replays once
/// 3. Verify `AuthenticationExpired`, no third attempt, tokens cleared
#[tokio::test]
async fn test_second_unauthorized_expires_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bookings"))
        .respond_with(ResponseTemplate::new(401))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "access_token": "access-2", "expires_in": 3600 })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (client, store) = logged_in_client(&server).await;
    let result = client.request(Method::GET, "/bookings", None, RequestOptions::new()).await;

    assert!(matches!(result, Err(ApiError::AuthenticationExpired)));
    assert!(!client.tokens().is_authenticated());
    assert!(store.stored().is_none());
}

#[tokio::test]
async fn test_rejected_refresh_token_expires_session() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/bookings"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _store) = logged_in_client(&server).await;
    let result = client.request(Method::GET, "/bookings", None, RequestOptions::new()).await;

    assert!(matches!(result, Err(ApiError::AuthenticationExpired)));
    assert!(!client.tokens().is_authenticated());
}

// ============================================================================
// Retry
// ============================================================================

/// Validates that transient server errors are retried up to the per-call limit.
///
/// # Test Steps
/// 1. Server fails three times with 500, then succeeds
/// 2. POST with `max_attempts = 4`
/// 3. Verify exactly four calls and a successful result
#[tokio::test]
async fn test_transient_failures_are_retried() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    Mock::given(method("POST"))
        .and(path("/bookings"))
        .respond_with(move |_req: &wiremock::Request| -> ResponseTemplate {
            if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                ResponseTemplate::new(500)
            } else {
                ResponseTemplate::new(201).set_body_json(json!({ "id": 99 }))
            }
        })
        .expect(4)
        .mount(&server)
        .await;

    let (client, _store) = logged_in_client(&server).await;
    let created: Value = client
        .post_json("/bookings", &json!({ "vehicle": 42 }), RequestOptions::new().max_attempts(4))
        .await
        .unwrap();

    assert_eq!(created["id"], 99);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_attempts_share_request_id() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(move |_req: &wiremock::Request| -> ResponseTemplate {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(502)
            } else {
                ResponseTemplate::new(200)
            }
        })
        .mount(&server)
        .await;

    let client = public_client(&server);
    client.request(Method::GET, "/status", None, RequestOptions::new().public()).await.unwrap();

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let ids: Vec<_> = requests.iter().map(|r| r.headers.get(REQUEST_ID_HEADER).cloned()).collect();
    assert!(ids[0].is_some());
    assert_eq!(ids[0], ids[1]);
}

#[tokio::test]
async fn test_exhausted_retries_wrap_last_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fleet"))
        .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
        .expect(3)
        .mount(&server)
        .await;

    let (client, _store) = logged_in_client(&server).await;
    let result = client.request(Method::GET, "/fleet", None, RequestOptions::new()).await;

    match result {
        Err(ApiError::RetriesExhausted { attempts, source }) => {
            assert_eq!(attempts, 3);
            assert!(matches!(*source, ApiError::Http { status: 503, ref body, .. } if body == "maintenance"));
        }
        other => panic!("expected exhausted retries, got {other:?}"),
    }
}

/// Validates that the default deadline leaves room for backoff.
///
/// # Test Steps
/// 1. 300ms per-attempt timeout, backoff of 400ms then 800ms
/// 2. Every attempt returns 503
/// 3. Verify all three attempts run and the call ends in `RetriesExhausted`
#[tokio::test]
async fn test_default_deadline_covers_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/fleet"))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .mount(&server)
        .await;

    let mut config = test_config(&server);
    config.api.request_timeout = ms(300);
    config.retry.base_delay = ms(400);
    config.retry.backoff_multiplier = 2.0;
    config.retry.max_delay = Duration::from_secs(1);
    let client = client_with(config, Arc::new(MemoryTokenStore::new()));

    let result = client.request(Method::GET, "/fleet", None, RequestOptions::new().public()).await;

    match result {
        Err(ApiError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
        other => panic!("expected exhausted retries, got {other:?}"),
    }
    assert_eq!(requests_to(&server, "/fleet").await, 3);
}

#[tokio::test]
async fn test_rate_limit_honours_retry_after() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    Mock::given(method("GET"))
        .and(path("/vehicles"))
        .respond_with(move |_req: &wiremock::Request| -> ResponseTemplate {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(429).insert_header("Retry-After", "0")
            } else {
                ResponseTemplate::new(200).set_body_json(json!([]))
            }
        })
        .expect(2)
        .mount(&server)
        .await;

    let (client, _store) = logged_in_client(&server).await;
    let response = client.request(Method::GET, "/vehicles", None, RequestOptions::new()).await.unwrap();

    assert_eq!(response.status.as_u16(), 200);
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vehicles/404"))
        .respond_with(ResponseTemplate::new(404).set_body_string("no such vehicle"))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _store) = logged_in_client(&server).await;
    let result = client.request(Method::GET, "/vehicles/404", None, RequestOptions::new()).await;

    assert!(matches!(result, Err(ApiError::Http { status: 404, .. })));
}

#[tokio::test]
async fn test_cancellation_during_backoff() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/reports"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut config = test_config(&server);
    config.retry.max_delay = Duration::from_secs(5);
    let client = client_with(config, Arc::new(MemoryTokenStore::new()));
    client.login(TokenSet::new("access-1", None, Some(3600))).await.unwrap();
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(ms(100)).await;
        trigger.cancel();
    });

    let options = RequestOptions::new().base_delay(Duration::from_secs(2)).cancel_on(cancel);
    let result = client.request(Method::GET, "/reports", None, options).await;

    assert!(matches!(result, Err(ApiError::Cancelled)));
    assert_eq!(requests_to(&server, "/reports").await, 1);
}

#[tokio::test]
async fn test_overall_deadline() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/reports"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(2)))
        .mount(&server)
        .await;

    let (client, _store) = logged_in_client(&server).await;
    let result = client
        .request(Method::GET, "/reports", None, RequestOptions::new().timeout(ms(150)))
        .await;

    assert!(matches!(result, Err(ApiError::Timeout(deadline)) if deadline == ms(150)));
}

// ============================================================================
// Circuit breaker
// ============================================================================

/// Validates that a failing endpoint group is short-circuited without
/// affecting other groups.
///
/// # Test Steps
/// 1. Threshold 2, one attempt per call
/// 2. Two failing `/vehicles` calls open the `vehicles` breaker
/// 3. Third call fails fast with `CircuitOpen` and no network request
/// 4. `/drivers` still succeeds
#[tokio::test]
async fn test_circuit_opens_per_endpoint_group() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vehicles/42"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drivers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let mut config = test_config(&server);
    config.retry.max_attempts = 1;
    config.circuit_breaker.config.failure_threshold = 2;
    config.circuit_breaker.config.cooldown = Duration::from_secs(60);
    let client = client_with(config, Arc::new(MemoryTokenStore::new()));
    client.login(TokenSet::new("access-1", None, Some(3600))).await.unwrap();

    for _ in 0..2 {
        let result = client.request(Method::GET, "/vehicles/42", None, RequestOptions::new()).await;
        assert!(matches!(result, Err(ApiError::RetriesExhausted { attempts: 1, .. })));
    }

    let rejected = client.request(Method::GET, "/vehicles/42", None, RequestOptions::new()).await;
    assert!(matches!(rejected, Err(ApiError::CircuitOpen { ref group }) if group == "vehicles"));

    client.request(Method::GET, "/drivers", None, RequestOptions::new()).await.unwrap();

    let states = client.breaker_states();
    let vehicles = states.iter().find(|(group, _)| group == "vehicles").unwrap();
    assert_eq!(vehicles.1.status, CircuitStatus::Open);

    client.reset();
    assert!(client
        .breaker_states()
        .iter()
        .all(|(_, state)| state.status == CircuitStatus::Closed));
}

/// Validates configured per-group breaker thresholds.
///
/// # Test Steps
/// 1. Default threshold 5, `payments` group threshold 1
/// 2. One failing `/payments` call opens its breaker
/// 3. `/vehicles` stays closed after the same single failure
#[tokio::test]
async fn test_group_override_sets_own_threshold() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/payments/7"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/vehicles/7"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;

    let mut config = test_config(&server);
    config.retry.max_attempts = 1;
    config.circuit_breaker.config.failure_threshold = 5;
    config.circuit_breaker.groups.insert(
        "payments".to_string(),
        CircuitBreakerConfig { failure_threshold: 1, cooldown: Duration::from_secs(60) },
    );
    let client = client_with(config, Arc::new(MemoryTokenStore::new()));
    let public = || RequestOptions::new().public();

    let first = client.request(Method::GET, "/payments/7", None, public()).await;
    assert!(matches!(first, Err(ApiError::RetriesExhausted { attempts: 1, .. })));
    let rejected = client.request(Method::GET, "/payments/7", None, public()).await;
    assert!(matches!(rejected, Err(ApiError::CircuitOpen { ref group }) if group == "payments"));

    for _ in 0..2 {
        let result = client.request(Method::GET, "/vehicles/7", None, public()).await;
        assert!(matches!(result, Err(ApiError::RetriesExhausted { attempts: 1, .. })));
    }
}

#[tokio::test]
async fn test_client_errors_do_not_trip_breaker() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vehicles/0"))
        .respond_with(ResponseTemplate::new(404))
        .expect(4)
        .mount(&server)
        .await;

    let mut config = test_config(&server);
    config.circuit_breaker.config.failure_threshold = 2;
    let client = client_with(config, Arc::new(MemoryTokenStore::new()));
    client.login(TokenSet::new("access-1", None, Some(3600))).await.unwrap();

    for _ in 0..4 {
        let result = client.request(Method::GET, "/vehicles/0", None, RequestOptions::new()).await;
        assert!(matches!(result, Err(ApiError::Http { status: 404, .. })));
    }
}

// ============================================================================
// Cache
// ============================================================================

#[tokio::test]
async fn test_fresh_entries_served_until_ttl() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vehicles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{ "id": 1 }])))
        .expect(2)
        .mount(&server)
        .await;

    let (client, _store) = logged_in_client(&server).await;
    let options = RequestOptions::new().cached(ms(300));

    let first = client.request(Method::GET, "/vehicles", None, options.clone()).await.unwrap();
    let second = client.request(Method::GET, "/vehicles", None, options.clone()).await.unwrap();
    assert!(!first.from_cache);
    assert!(second.from_cache);
    assert_eq!(first.body, second.body);

    tokio::time::sleep(ms(400)).await;
    let third = client.request(Method::GET, "/vehicles", None, options).await.unwrap();
    assert!(!third.from_cache);
}

/// Validates ETag revalidation of a stale entry.
///
/// # Test Steps
/// 1. First GET returns a body with an ETag
/// 2. After the TTL, the pipeline sends `If-None-Match` and gets 304
/// 3. Verify the cached body is returned and the entry is fresh again
#[tokio::test]
async fn test_stale_entry_revalidated_with_etag() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vehicles/42"))
        .and(header("if-none-match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/vehicles/42"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .set_body_json(json!({ "id": 42, "plate": "FB-042" })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (client, _store) = logged_in_client(&server).await;
    let options = RequestOptions::new().cached(ms(100));

    let first = client.request(Method::GET, "/vehicles/42", None, options.clone()).await.unwrap();
    assert_eq!(first.etag.as_deref(), Some("\"v1\""));

    tokio::time::sleep(ms(200)).await;
    let revalidated = client.request(Method::GET, "/vehicles/42", None, options.clone()).await.unwrap();
    assert!(revalidated.from_cache);
    assert!(revalidated.revalidated);
    assert_eq!(revalidated.body, first.body);

    let fresh = client.request(Method::GET, "/vehicles/42", None, options).await.unwrap();
    assert!(fresh.from_cache);
    assert!(!fresh.revalidated);
}

#[tokio::test]
async fn test_force_refresh_bypasses_and_updates_cache() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    Mock::given(method("GET"))
        .and(path("/vehicles/42"))
        .respond_with(move |_req: &wiremock::Request| -> ResponseTemplate {
            let version = counter.fetch_add(1, Ordering::SeqCst) + 1;
            ResponseTemplate::new(200).set_body_json(json!({ "id": 42, "version": version }))
        })
        .expect(2)
        .mount(&server)
        .await;

    let (client, _store) = logged_in_client(&server).await;
    let cached = CacheOptions::ttl(Duration::from_secs(60));

    let first: Value = client
        .get_json("/vehicles/42", RequestOptions::new().cache_with(cached.clone()))
        .await
        .unwrap();
    let forced: Value = client
        .get_json("/vehicles/42", RequestOptions::new().cache_with(cached.clone().force_refresh()))
        .await
        .unwrap();
    let after: Value =
        client.get_json("/vehicles/42", RequestOptions::new().cache_with(cached)).await.unwrap();

    assert_eq!(first["version"], 1);
    assert_eq!(forced["version"], 2);
    assert_eq!(after["version"], 2);
}

#[tokio::test]
async fn test_mutation_invalidates_resource_reads() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vehicles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/drivers"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/vehicles"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({ "id": 43 })))
        .expect(1)
        .mount(&server)
        .await;

    let (client, _store) = logged_in_client(&server).await;
    let cached = RequestOptions::new().cached(Duration::from_secs(60));

    client.request(Method::GET, "/vehicles", None, cached.clone()).await.unwrap();
    client.request(Method::GET, "/drivers", None, cached.clone()).await.unwrap();

    let _: Value =
        client.post_json("/vehicles", &json!({ "plate": "FB-043" }), RequestOptions::new()).await.unwrap();

    let vehicles = client.request(Method::GET, "/vehicles", None, cached.clone()).await.unwrap();
    let drivers = client.request(Method::GET, "/drivers", None, cached).await.unwrap();
    assert!(!vehicles.from_cache);
    assert!(drivers.from_cache);
}

#[tokio::test]
async fn test_undecodable_cache_entry_is_refetched() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    Mock::given(method("GET"))
        .and(path("/settings"))
        .respond_with(move |_req: &wiremock::Request| -> ResponseTemplate {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                ResponseTemplate::new(200).set_body_string("<html>oops</html>")
            } else {
                ResponseTemplate::new(200).set_body_json(json!({ "theme": "dark" }))
            }
        })
        .expect(2)
        .mount(&server)
        .await;

    let (client, _store) = logged_in_client(&server).await;
    let options = RequestOptions::new().cached(Duration::from_secs(60));

    client.request(Method::GET, "/settings", None, options.clone()).await.unwrap();
    let settings: Value = client.get_json("/settings", options).await.unwrap();

    assert_eq!(settings["theme"], "dark");
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_disposed_client_rejects_requests() {
    let server = MockServer::start().await;
    Mock::given(method("GET")).respond_with(ResponseTemplate::new(200)).expect(0).mount(&server).await;

    let (client, _store) = logged_in_client(&server).await;
    client.dispose();

    assert!(client.is_disposed());
    let result = client.request(Method::GET, "/vehicles", None, RequestOptions::new()).await;
    assert!(matches!(result, Err(ApiError::Cancelled)));
}

#[tokio::test]
async fn test_logout_clears_session_and_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/vehicles"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(1)
        .mount(&server)
        .await;

    let (client, store) = logged_in_client(&server).await;
    client
        .request(Method::GET, "/vehicles", None, RequestOptions::new().cached(Duration::from_secs(60)))
        .await
        .unwrap();
    assert_eq!(client.cache_stats().size, 1);

    client.logout().await.unwrap();

    assert_eq!(client.cache_stats().size, 0);
    assert!(store.stored().is_none());
    let result = client.request(Method::GET, "/vehicles", None, RequestOptions::new()).await;
    assert!(matches!(result, Err(ApiError::AuthenticationRequired)));
}
