//! Resilient HTTP client for outbound API calls
//!
//! Every call runs through an explicit state machine:
//!
//! ```text
//! Attempting{n} --2xx--------------------------------> Succeeded
//! Attempting{n} --transport/429/5xx, budget left-----> (sleep) Attempting{n+1}
//! Attempting{n} --transport/429/5xx, budget spent----> Failed(*Exhausted)
//! Attempting{n} --other 4xx--------------------------> Failed(ClientError)
//! ```
//!
//! Transitions are computed by [`next_transition`], which is pure given the
//! random source, so the retry rules can be tested without a network.

use bytes::Bytes;
use chrono::Utc;
use rand::Rng;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::backoff::{parse_retry_after, BackoffDecision, BackoffPolicy};
use crate::cancel::CancelToken;
use crate::config::{HttpClientConfig, RetryConfig};
use crate::error::{AttemptError, HttpError, RetryableError};
use crate::telemetry::SyncMetrics;

/// Request body variants
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Json(serde_json::Value),
    Form(Vec<(String, String)>),
}

/// Request authentication
#[derive(Debug, Clone, PartialEq)]
pub enum RequestAuth {
    Bearer(String),
    Basic { username: String, password: String },
}

/// A request that can be sent any number of times
#[derive(Debug, Clone, PartialEq)]
pub struct RetryableRequest {
    pub method: Method,
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub auth: Option<RequestAuth>,
    pub body: RequestBody,
}

impl RetryableRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            query: Vec::new(),
            headers: Vec::new(),
            auth: None,
            body: RequestBody::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn bearer_auth(mut self, token: impl Into<String>) -> Self {
        self.auth = Some(RequestAuth::Bearer(token.into()));
        self
    }

    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Some(RequestAuth::Basic {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn json(mut self, body: serde_json::Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn form(mut self, pairs: Vec<(String, String)>) -> Self {
        self.body = RequestBody::Form(pairs);
        self
    }

    fn to_builder(&self, client: &Client) -> reqwest::RequestBuilder {
        let mut builder = client.request(self.method.clone(), &self.url);
        if !self.query.is_empty() {
            builder = builder.query(&self.query);
        }
        for (name, value) in &self.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder = match &self.auth {
            Some(RequestAuth::Bearer(token)) => builder.bearer_auth(token),
            Some(RequestAuth::Basic { username, password }) => {
                builder.basic_auth(username, Some(password))
            }
            None => builder,
        };
        match &self.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => builder.json(value),
            RequestBody::Form(pairs) => builder.form(pairs),
        }
    }
}

/// Successful (2xx) response with its body read
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub url: String,
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    /// Decode the body as JSON
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|e| HttpError::Decode {
            url: self.url.clone(),
            message: e.to_string(),
        })
    }

    /// Body as text, replacing invalid UTF-8
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// State of one call
#[derive(Debug)]
pub enum CallState {
    Attempting { attempt: u32 },
    Succeeded(HttpResponse),
    Failed(HttpError),
}

/// What to do after an attempt
#[derive(Debug)]
pub enum Transition {
    Succeed(HttpResponse),
    Retry {
        next_attempt: u32,
        decision: BackoffDecision,
    },
    Fail(HttpError),
}

/// Compute the transition following attempt `attempt` (0-based)
pub fn next_transition<R: Rng + ?Sized>(
    policy: &BackoffPolicy,
    url: &str,
    attempt: u32,
    max_retries: u32,
    outcome: Result<HttpResponse, AttemptError>,
    rng: &mut R,
) -> Transition {
    let err = match outcome {
        Ok(response) => return Transition::Succeed(response),
        Err(err) => err,
    };

    if !err.is_retryable() {
        return Transition::Fail(terminal_error(err, url, attempt + 1));
    }

    let decision = policy.decide(attempt, err.retry_after(), max_retries, rng);
    if decision.retry_permitted {
        Transition::Retry {
            next_attempt: attempt + 1,
            decision,
        }
    } else {
        Transition::Fail(terminal_error(err, url, attempt + 1))
    }
}

fn terminal_error(err: AttemptError, url: &str, attempts: u32) -> HttpError {
    let url = url.to_string();
    match err {
        AttemptError::Timeout => HttpError::NetworkExhausted {
            url,
            attempts,
            message: "request timed out".to_string(),
        },
        AttemptError::Connect(message) | AttemptError::Network(message) => {
            HttpError::NetworkExhausted {
                url,
                attempts,
                message,
            }
        }
        AttemptError::RateLimited { .. } => HttpError::RateLimitExhausted { url, attempts },
        AttemptError::ServerError(status) => HttpError::ServerErrorExhausted {
            url,
            status,
            attempts,
        },
        AttemptError::ClientError { status, body } => HttpError::ClientError { url, status, body },
        AttemptError::InvalidRequest(message) => HttpError::InvalidRequest(message),
    }
}

/// Truncate to at most `max_chars` characters on a char boundary
pub fn truncate_body(body: &str, max_chars: usize) -> String {
    match body.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_string(),
    }
}

/// HTTP client with retry, backoff, and Retry-After support
///
/// Features:
/// - Exponential backoff with jitter between attempts
/// - HTTP 429 handling with Retry-After (seconds or HTTP-date)
/// - Terminal client errors with a truncated body excerpt
/// - Optional cancellation at every backoff sleep
#[derive(Debug, Clone)]
pub struct ResilientClient {
    client: Client,
    policy: BackoffPolicy,
    config: HttpClientConfig,
    cancel: Option<CancelToken>,
    metrics: Option<Arc<SyncMetrics>>,
}

impl ResilientClient {
    /// Create a client with its own connection pool
    pub fn new(config: HttpClientConfig, retry: RetryConfig) -> Result<Self, HttpError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| HttpError::InvalidRequest(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self::with_client(client, config, retry))
    }

    /// Create a client around an existing reqwest Client
    pub fn with_client(client: Client, config: HttpClientConfig, retry: RetryConfig) -> Self {
        Self {
            client,
            policy: BackoffPolicy::new(retry),
            config,
            cancel: None,
            metrics: None,
        }
    }

    /// Abandon calls at the next backoff sleep once `token` is cancelled
    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Count retries in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<SyncMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Configured retry budget
    pub fn max_retries(&self) -> u32 {
        self.policy.config().max_retries
    }

    /// Send with the configured retry budget
    pub async fn send(&self, request: &RetryableRequest) -> Result<HttpResponse, HttpError> {
        self.execute(request, self.max_retries()).await
    }

    /// Send, retrying transient failures up to `max_retries` times
    pub async fn execute(
        &self,
        request: &RetryableRequest,
        max_retries: u32,
    ) -> Result<HttpResponse, HttpError> {
        let url = request.url.as_str();
        let mut state = CallState::Attempting { attempt: 0 };

        loop {
            state = match state {
                CallState::Attempting { attempt } => {
                    let outcome = self.attempt_once(request).await;
                    let transition = next_transition(
                        &self.policy,
                        url,
                        attempt,
                        max_retries,
                        outcome,
                        &mut rand::thread_rng(),
                    );
                    self.apply(url, attempt, transition).await
                }
                CallState::Succeeded(response) => return Ok(response),
                CallState::Failed(err) => return Err(err),
            };
        }
    }

    async fn apply(&self, url: &str, attempt: u32, transition: Transition) -> CallState {
        match transition {
            Transition::Succeed(response) => {
                if attempt > 0 {
                    info!(url = url, attempts = attempt + 1, "Request recovered after retry");
                }
                CallState::Succeeded(response)
            }
            Transition::Fail(err) => {
                error!(url = url, attempts = attempt + 1, error = %err, "Request failed");
                CallState::Failed(err)
            }
            Transition::Retry {
                next_attempt,
                decision,
            } => {
                debug!(
                    url = url,
                    attempt = next_attempt,
                    delay_ms = decision.delay.as_millis() as u64,
                    source = ?decision.source,
                    "Backing off before retry"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_http_retry();
                }

                let completed = match &self.cancel {
                    Some(token) if token.is_cancelled() => false,
                    Some(token) => token.sleep(decision.delay).await,
                    None => {
                        tokio::time::sleep(decision.delay).await;
                        true
                    }
                };

                if completed {
                    CallState::Attempting {
                        attempt: next_attempt,
                    }
                } else {
                    info!(url = url, "Request cancelled during backoff");
                    CallState::Failed(HttpError::Cancelled {
                        url: url.to_string(),
                    })
                }
            }
        }
    }

    async fn attempt_once(&self, request: &RetryableRequest) -> Result<HttpResponse, AttemptError> {
        debug!(url = %request.url, method = %request.method, "Sending HTTP request");

        let response = request
            .to_builder(&self.client)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;

        let status = response.status();
        let headers = response.headers().clone();

        if status.as_u16() == 429 {
            let retry_after = headers
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| parse_retry_after(v, Utc::now()));
            warn!(
                url = %request.url,
                retry_after_secs = retry_after.map(|d| d.as_secs()),
                "Rate limited by upstream"
            );
            return Err(AttemptError::RateLimited { retry_after });
        }

        if status.is_server_error() {
            warn!(url = %request.url, status = status.as_u16(), "Server error");
            return Err(AttemptError::ServerError(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AttemptError::Network(e.to_string()))?;

        if status.is_success() {
            debug!(url = %request.url, status = status.as_u16(), body_size = body.len(), "Received response");
            return Ok(HttpResponse {
                url: request.url.clone(),
                status: status.as_u16(),
                headers,
                body,
            });
        }

        let excerpt = truncate_body(&String::from_utf8_lossy(&body), self.config.body_excerpt_len);
        warn!(url = %request.url, status = status.as_u16(), body = %excerpt, "Client error");
        Err(AttemptError::ClientError {
            status: status.as_u16(),
            body: excerpt,
        })
    }
}

fn classify_transport(err: &reqwest::Error) -> AttemptError {
    if err.is_builder() {
        AttemptError::InvalidRequest(err.to_string())
    } else if err.is_timeout() {
        AttemptError::Timeout
    } else if err.is_connect() {
        AttemptError::Connect(err.to_string())
    } else {
        AttemptError::Network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_delay_ms: 1,
            max_delay_ms: 10,
            jitter_fraction: 0.25,
            retry_after_buffer_ms: 0,
        }
    }

    fn test_client(max_retries: u32) -> ResilientClient {
        ResilientClient::new(HttpClientConfig::default(), fast_retry(max_retries)).unwrap()
    }

    fn ok_response(url: &str) -> HttpResponse {
        HttpResponse {
            url: url.to_string(),
            status: 200,
            headers: HeaderMap::new(),
            body: Bytes::from_static(b"{}"),
        }
    }

    // Test 1: Basic GET request returns body
    #[tokio::test]
    async fn test_basic_get_request() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/test"))
            .respond_with(ResponseTemplate::new(200).set_body_string("Hello, World!"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = test_client(3);
        let response = client
            .send(&RetryableRequest::get(format!("{}/test", mock_server.uri())))
            .await
            .unwrap();

        assert_eq!(response.status, 200);
        assert_eq!(response.text(), "Hello, World!");
    }

    // Test 2: Query, headers, auth, and JSON body reach the server
    #[tokio::test]
    async fn test_request_parts_sent() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/submit"))
            .and(query_param("since", "2024-01-01T00:00:00Z"))
            .and(header("authorization", "Bearer tok-1"))
            .and(header("x-trace", "abc"))
            .and(body_string_contains("\"api_key\":\"k\""))
            .respond_with(ResponseTemplate::new(201).set_body_string(r#"{"ok":true}"#))
            .expect(1)
            .mount(&mock_server)
            .await;

        let request = RetryableRequest::post(format!("{}/submit", mock_server.uri()))
            .query("since", "2024-01-01T00:00:00Z")
            .header("x-trace", "abc")
            .bearer_auth("tok-1")
            .json(serde_json::json!({"api_key": "k"}));

        let response = test_client(0).send(&request).await.unwrap();
        let value: serde_json::Value = response.json().unwrap();
        assert_eq!(value["ok"], true);
    }

    // Test 3: User-Agent header is sent
    #[tokio::test]
    async fn test_user_agent_sent() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("user-agent", "sportswire-test/1.0"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let config = HttpClientConfig {
            user_agent: "sportswire-test/1.0".to_string(),
            ..HttpClientConfig::default()
        };
        let client = ResilientClient::new(config, fast_retry(0)).unwrap();
        assert!(client
            .send(&RetryableRequest::get(mock_server.uri()))
            .await
            .is_ok());
    }

    // Test 4: 4xx other than 429 is never retried
    #[tokio::test]
    async fn test_client_error_not_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404).set_body_string("no such thing"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = format!("{}/missing", mock_server.uri());
        let err = test_client(3)
            .send(&RetryableRequest::get(url.clone()))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            HttpError::ClientError {
                url,
                status: 404,
                body: "no such thing".to_string()
            }
        );
    }

    // Test 5: 401 is terminal as well
    #[tokio::test]
    async fn test_unauthorized_not_retried() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&mock_server)
            .await;

        let err = test_client(3)
            .send(&RetryableRequest::get(mock_server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err.status(), Some(401));
    }

    // Test 6: Always-503 makes exactly max_retries + 1 requests
    #[tokio::test]
    async fn test_server_error_budget() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(4)
            .mount(&mock_server)
            .await;

        let url = format!("{}/flaky", mock_server.uri());
        let err = test_client(3)
            .send(&RetryableRequest::get(url.clone()))
            .await
            .unwrap_err();

        assert_eq!(
            err,
            HttpError::ServerErrorExhausted {
                url,
                status: 503,
                attempts: 4
            }
        );
    }

    // Test 7: 429 then 200 recovers
    #[tokio::test]
    async fn test_rate_limit_then_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/limited"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let response = test_client(2)
            .send(&RetryableRequest::get(format!("{}/limited", mock_server.uri())))
            .await
            .unwrap();
        assert_eq!(response.text(), "ok");
    }

    // Test 8: Rate limit exhaustion is terminal even with a hint
    #[tokio::test]
    async fn test_rate_limit_exhausted() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "1"))
            .expect(3)
            .mount(&mock_server)
            .await;

        let err = test_client(2)
            .send(&RetryableRequest::get(mock_server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::RateLimitExhausted { attempts: 3, .. }));
    }

    // Test 9: Transport failures exhaust into NetworkExhausted
    #[tokio::test]
    async fn test_transport_failure_exhausted() {
        // Bind then drop a listener to get a port nobody listens on
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = test_client(1)
            .send(&RetryableRequest::get(format!("http://{}/", addr)))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::NetworkExhausted { attempts: 2, .. }));
    }

    // Test 10: Client error body is truncated
    #[tokio::test]
    async fn test_client_error_body_truncated() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400).set_body_string("x".repeat(2000)))
            .mount(&mock_server)
            .await;

        let config = HttpClientConfig {
            body_excerpt_len: 20,
            ..HttpClientConfig::default()
        };
        let client = ResilientClient::new(config, fast_retry(0)).unwrap();
        let err = client
            .send(&RetryableRequest::get(mock_server.uri()))
            .await
            .unwrap_err();
        assert_eq!(err.body(), Some(format!("{}...", "x".repeat(20)).as_str()));
    }

    // Test 11: Undecodable 2xx body yields Decode
    #[tokio::test]
    async fn test_decode_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not json"))
            .mount(&mock_server)
            .await;

        let response = test_client(0)
            .send(&RetryableRequest::get(mock_server.uri()))
            .await
            .unwrap();
        let err = response.json::<serde_json::Value>().unwrap_err();
        assert!(matches!(err, HttpError::Decode { .. }));
    }

    // Test 12: Cancelled token stops at the first backoff
    #[tokio::test]
    async fn test_cancelled_at_backoff() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&mock_server)
            .await;

        let token = CancelToken::new();
        token.cancel();
        let client = test_client(5).with_cancel_token(token);

        let err = client
            .send(&RetryableRequest::get(mock_server.uri()))
            .await
            .unwrap_err();
        assert!(matches!(err, HttpError::Cancelled { .. }));
    }

    // Test 13: Form body is url-encoded
    #[tokio::test]
    async fn test_form_body() {
        let mock_server = MockServer::start().await;
        let seen = std::sync::Arc::new(AtomicU32::new(0));
        let seen_clone = seen.clone();
        Mock::given(method("POST"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .respond_with(move |req: &Request| {
                if String::from_utf8_lossy(&req.body).contains("grant_type=refresh_token") {
                    seen_clone.fetch_add(1, Ordering::SeqCst);
                }
                ResponseTemplate::new(200)
            })
            .mount(&mock_server)
            .await;

        let request = RetryableRequest::post(mock_server.uri()).form(vec![(
            "grant_type".to_string(),
            "refresh_token".to_string(),
        )]);
        test_client(0).send(&request).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    // Test 14: Transition table
    #[test]
    fn test_next_transition_rules() {
        let policy = BackoffPolicy::new(fast_retry(2));
        let mut rng = StepRng::new(0, 0);

        let t = next_transition(&policy, "u", 0, 2, Ok(ok_response("u")), &mut rng);
        assert!(matches!(t, Transition::Succeed(_)));

        let t = next_transition(&policy, "u", 1, 2, Err(AttemptError::ServerError(502)), &mut rng);
        assert!(matches!(t, Transition::Retry { next_attempt: 2, .. }));

        let t = next_transition(&policy, "u", 2, 2, Err(AttemptError::ServerError(502)), &mut rng);
        assert!(matches!(
            t,
            Transition::Fail(HttpError::ServerErrorExhausted {
                status: 502,
                attempts: 3,
                ..
            })
        ));

        let t = next_transition(
            &policy,
            "u",
            0,
            2,
            Err(AttemptError::ClientError {
                status: 403,
                body: String::new(),
            }),
            &mut rng,
        );
        assert!(matches!(
            t,
            Transition::Fail(HttpError::ClientError { status: 403, .. })
        ));

        let t = next_transition(
            &policy,
            "u",
            2,
            2,
            Err(AttemptError::RateLimited {
                retry_after: Some(Duration::from_secs(1)),
            }),
            &mut rng,
        );
        assert!(matches!(
            t,
            Transition::Fail(HttpError::RateLimitExhausted { attempts: 3, .. })
        ));
    }

    // Test 15: Truncation respects char boundaries
    #[test]
    fn test_truncate_body() {
        assert_eq!(truncate_body("short", 10), "short");
        assert_eq!(truncate_body("héllo wörld", 4), "héll...");
        assert_eq!(truncate_body("", 0), "");
    }
}
