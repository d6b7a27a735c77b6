//! Admission middleware and application routes.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{Principal, StaticCredentialVerifier};
use crate::config::{BulwarkConfig, LOGOUT_PATH};
use crate::error::Result;
use crate::pipeline::{Pipeline, PipelineOutcome, Rejection, RequestContext, Route};
use crate::ratelimit::{CounterStore, Quota, RateLimiter};
use crate::session::{InMemorySessionStore, Session, SessionStore, SESSION_COOKIE};

/// Shared state for the admission middleware and handlers.
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub sessions: Arc<dyn SessionStore>,
    /// Use the first `X-Forwarded-For` hop as the client address
    pub trust_proxy: bool,
    /// Largest request body buffered for the pipeline
    pub max_body_bytes: usize,
}

impl AppState {
    /// Wire limiters, sessions and credentials from configuration.
    ///
    /// Both limiters share `store`; their key prefixes keep the counters apart.
    /// Starts the session sweeper on the current runtime.
    pub async fn from_config(config: &BulwarkConfig, store: Arc<dyn CounterStore>) -> Result<Self> {
        config.validate()?;

        let global = RateLimiter::new("global", &config.limiters.global, store.clone())?;
        let login = RateLimiter::new("login", &config.limiters.login, store)?;
        let session_store = Arc::new(InMemorySessionStore::with_ttl(Duration::from_millis(
            config.auth.session_ttl_ms,
        )));
        session_store.spawn_sweeper(Duration::from_millis(config.store.sweep_interval_ms.max(1)));
        let sessions: Arc<dyn SessionStore> = session_store;
        let verifier = StaticCredentialVerifier::new(&config.auth.users);
        if config.auth.users.is_empty() {
            warn!("No users configured; every login attempt will be refused");
        }

        let pipeline = Pipeline::standard(
            Arc::new(global),
            Arc::new(login),
            sessions.clone(),
            Arc::new(verifier),
            Route::new(Method::POST, config.auth.login_path.as_str()),
        );

        Ok(Self {
            pipeline: Arc::new(pipeline),
            sessions,
            trust_proxy: config.server.trust_proxy,
            max_body_bytes: config.server.max_body_bytes,
        })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("stages", &self.pipeline.stage_names())
            .field("trust_proxy", &self.trust_proxy)
            .field("max_body_bytes", &self.max_body_bytes)
            .finish()
    }
}

/// JSON body of every error response.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub request_id: Uuid,
    pub timestamp: DateTime<Utc>,
}

/// Build the application router with the admission pipeline in front of every route.
pub fn router(state: AppState, login_path: &str) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route(login_path, post(login))
        .route(LOGOUT_PATH, post(logout))
        .route("/me", get(me))
        .layer(middleware::from_fn_with_state(state.clone(), admission_middleware))
        .with_state(state)
}

/// Whole seconds to wait, rounded up so clients never retry early.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

/// Add the `RateLimit-*` headers describing the limiter that admitted the request.
fn add_rate_limit_headers(headers: &mut HeaderMap, quota: &Quota) {
    headers.insert("ratelimit-limit", HeaderValue::from(quota.limit));
    headers.insert("ratelimit-remaining", HeaderValue::from(quota.remaining));
    headers.insert(
        "ratelimit-reset",
        HeaderValue::from(retry_after_secs(quota.reset_after)),
    );
}

fn rejection_response(rejection: Rejection) -> Response {
    let retry_after = rejection.retry_after.map(retry_after_secs);
    let body = ErrorResponse {
        code: rejection.code.to_string(),
        message: rejection.message,
        retry_after,
        details: rejection.details,
        request_id: Uuid::new_v4(),
        timestamp: Utc::now(),
    };

    let mut response = (rejection.status, Json(body)).into_response();
    if let Some(quota) = &rejection.quota {
        add_rate_limit_headers(response.headers_mut(), quota);
    }
    if let Some(secs) = retry_after {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(secs));
    }
    response
}

/// Client address: the first `X-Forwarded-For` hop when the proxy is trusted,
/// otherwise the TCP peer.
pub fn client_address(headers: &HeaderMap, peer: Option<IpAddr>, trust_proxy: bool) -> Option<IpAddr> {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|hop| hop.trim().parse::<IpAddr>().ok());
        if forwarded.is_some() {
            return forwarded;
        }
    }
    peer
}

/// Run the admission pipeline, then hand the request to its route.
///
/// The body is buffered so stages can read it and then restored for the
/// handler. Session and principal found by the pipeline travel on as request
/// extensions.
pub async fn admission_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    let (parts, body) = request.into_parts();

    let bytes = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(bytes) => bytes,
        Err(err) => {
            warn!(error = %err, "Rejecting unreadable or oversized request body");
            return rejection_response(Rejection::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                "PAYLOAD_TOO_LARGE",
                "The request body is too large.",
            ));
        }
    };

    let client_addr = client_address(&parts.headers, peer, state.trust_proxy);
    let mut ctx = RequestContext::new(
        parts.method.clone(),
        parts.uri.path(),
        parts.headers.clone(),
        client_addr,
    )
    .with_body(bytes.clone());

    if let PipelineOutcome::Respond { rejection, .. } = state.pipeline.run(&mut ctx).await {
        return rejection_response(rejection);
    }

    let mut request = Request::from_parts(parts, Body::from(bytes));
    if let Some(session) = ctx.session {
        request.extensions_mut().insert(session);
    }
    if let Some(principal) = ctx.principal {
        request.extensions_mut().insert(principal);
    }

    let mut response = next.run(request).await;
    if let Some(quota) = &ctx.quota {
        add_rate_limit_headers(response.headers_mut(), quota);
    }
    response
}

fn session_cookie(value: &str, max_age: Option<u64>) -> Option<HeaderValue> {
    let mut cookie = format!("{SESSION_COOKIE}={value}; Path=/; HttpOnly; SameSite=Lax");
    if let Some(max_age) = max_age {
        cookie.push_str(&format!("; Max-Age={max_age}"));
    }
    HeaderValue::from_str(&cookie).ok()
}

fn internal_error() -> Response {
    rejection_response(Rejection::new(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "Something went wrong.",
    ))
}

async fn liveness() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

/// Reached only after the pipeline authenticated the submission.
async fn login(State(state): State<AppState>, request: Request) -> Response {
    let Some(principal) = request.extensions().get::<Principal>().cloned() else {
        return rejection_response(Rejection::new(
            StatusCode::UNAUTHORIZED,
            "INVALID_CREDENTIALS",
            "Invalid email or password.",
        ));
    };

    // A login replaces whatever session the client already had.
    if let Some(previous) = request.extensions().get::<Session>() {
        if let Err(err) = state.sessions.destroy(&previous.id).await {
            warn!(error = %err, "Failed to destroy previous session");
        }
    }

    let session = match state.sessions.create(&principal.user_id, &principal.email).await {
        Ok(session) => session,
        Err(err) => {
            warn!(error = %err, "Failed to create session");
            return internal_error();
        }
    };
    info!(user_id = %principal.user_id, "login");

    let mut response = Json(json!({ "data": principal })).into_response();
    if let Some(cookie) = session_cookie(&session.id, None) {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    response
}

async fn logout(State(state): State<AppState>, request: Request) -> Response {
    if let Some(session) = request.extensions().get::<Session>() {
        if let Err(err) = state.sessions.destroy(&session.id).await {
            warn!(error = %err, "Failed to destroy session");
            return internal_error();
        }
        info!(user_id = %session.user_id, "logout");
    }

    let mut response = Json(json!({})).into_response();
    if let Some(cookie) = session_cookie("", Some(0)) {
        response.headers_mut().insert(header::SET_COOKIE, cookie);
    }
    response
}

async fn me(request: Request) -> Response {
    match request.extensions().get::<Session>() {
        Some(session) => Json(json!({
            "data": {
                "user_id": session.user_id,
                "email": session.email,
                "since": session.created_at,
            }
        }))
        .into_response(),
        None => rejection_response(Rejection::new(
            StatusCode::UNAUTHORIZED,
            "NOT_LOGGED_IN",
            "Not logged in.",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticCredentialVerifier;
    use crate::config::{LimiterConfig, UserCredentials};
    use crate::pipeline::Route;
    use crate::ratelimit::{FailurePolicy, InMemoryCounterStore, ManualClock, RateLimiter};
    use crate::session::InMemorySessionStore;
    use axum::http::Method;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn app(global_max: u64, login_max: u64) -> Router {
        app_with_sessions(global_max, login_max).0
    }

    fn app_with_sessions(global_max: u64, login_max: u64) -> (Router, Arc<InMemorySessionStore>) {
        let store = Arc::new(InMemoryCounterStore::new(Arc::new(ManualClock::new())));
        let global = LimiterConfig {
            max: global_max,
            failure_policy: Some(FailurePolicy::Open),
            ..LimiterConfig::global()
        };
        let login = LimiterConfig {
            max: login_max,
            failure_policy: Some(FailurePolicy::Open),
            ..LimiterConfig::login()
        };
        let session_store = Arc::new(InMemorySessionStore::new());
        let sessions: Arc<dyn SessionStore> = session_store.clone();
        let verifier = StaticCredentialVerifier::new(&[UserCredentials {
            email: "dev@example.com".to_string(),
            password: "hunter22".to_string(),
            display_name: None,
        }]);

        let pipeline = Pipeline::standard(
            Arc::new(RateLimiter::new("global", &global, store.clone()).unwrap()),
            Arc::new(RateLimiter::new("login", &login, store).unwrap()),
            sessions.clone(),
            Arc::new(verifier),
            Route::new(Method::POST, "/login"),
        );

        let app = router(
            AppState {
                pipeline: Arc::new(pipeline),
                sessions,
                trust_proxy: true,
                max_body_bytes: 1024,
            },
            "/login",
        );
        (app, session_store)
    }

    fn get(path: &str) -> Request {
        Request::builder()
            .uri(path)
            .header("x-forwarded-for", "203.0.113.9")
            .body(Body::empty())
            .unwrap()
    }

    fn login_request(password: &str) -> Request {
        Request::builder()
            .method(Method::POST)
            .uri("/login")
            .header("x-forwarded-for", "203.0.113.9")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(
                json!({ "email": "dev@example.com", "password": password }).to_string(),
            ))
            .unwrap()
    }

    async fn json_body(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_admitted_response_carries_rate_limit_headers() {
        let response = app(3, 5).oneshot(get("/")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["ratelimit-limit"], "3");
        assert_eq!(response.headers()["ratelimit-remaining"], "2");
    }

    #[tokio::test]
    async fn test_global_limit_rejects_with_retry_after() {
        let app = app(3, 5);

        for _ in 0..3 {
            let response = app.clone().oneshot(get("/")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }

        let response = app.clone().oneshot(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "900");

        let body = json_body(response).await;
        assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["retry_after"], 900);
    }

    #[tokio::test]
    async fn test_sixth_login_attempt_is_rejected_but_global_still_admits() {
        let app = app(200, 5);

        for _ in 0..5 {
            let response = app.clone().oneshot(login_request("wrong-password")).await.unwrap();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        let response = app.clone().oneshot(login_request("hunter22")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(response.headers().contains_key(header::RETRY_AFTER));

        for _ in 0..6 {
            let response = app.clone().oneshot(get("/")).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn test_login_session_round_trip() {
        let app = app(200, 5);

        let response = app.clone().oneshot(login_request("hunter22")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let cookie = response.headers()[header::SET_COOKIE]
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();
        let body = json_body(response).await;
        assert_eq!(body["data"]["email"], "dev@example.com");

        let me = Request::builder()
            .uri("/me")
            .header(header::COOKIE, &cookie)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(me).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let logout = Request::builder()
            .method(Method::POST)
            .uri("/logout")
            .header(header::COOKIE, &cookie)
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(logout).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let me = Request::builder()
            .uri("/me")
            .header(header::COOKIE, &cookie)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(me).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_relogin_replaces_previous_session() {
        let (app, sessions) = app_with_sessions(200, 5);

        let response = app.clone().oneshot(login_request("hunter22")).await.unwrap();
        let first = response.headers()[header::SET_COOKIE]
            .to_str()
            .unwrap()
            .split(';')
            .next()
            .unwrap()
            .to_string();
        assert_eq!(sessions.len(), 1);

        let mut relogin = login_request("hunter22");
        relogin
            .headers_mut()
            .insert(header::COOKIE, HeaderValue::from_str(&first).unwrap());
        let response = app.clone().oneshot(relogin).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(sessions.len(), 1);

        let me = Request::builder()
            .uri("/me")
            .header(header::COOKIE, &first)
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(me).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_invalid_login_gets_validation_errors() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/login")
            .body(Body::from(r#"{"email":"nope","password":"x"}"#))
            .unwrap();

        let response = app(200, 5).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);

        let body = json_body(response).await;
        assert_eq!(body["details"]["errors"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/login")
            .body(Body::from(vec![b'x'; 4096]))
            .unwrap();

        let response = app(200, 5).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_state_from_config() {
        let config = BulwarkConfig::from_yaml(
            r#"
auth:
  login_path: /session
  users:
    - email: dev@example.com
      password: hunter22
"#,
        )
        .unwrap();
        let counters: Arc<dyn CounterStore> =
            Arc::new(InMemoryCounterStore::new(Arc::new(ManualClock::new())));

        let state = AppState::from_config(&config, counters).await.unwrap();
        assert_eq!(
            state.pipeline.stage_names(),
            vec!["GlobalLimit", "SessionLoad", "ValidateLogin", "LoginLimit", "Authenticate"]
        );

        let request = Request::builder()
            .method(Method::POST)
            .uri("/session")
            .body(Body::from(
                json!({ "email": "dev@example.com", "password": "hunter22" }).to_string(),
            ))
            .unwrap();
        let response = router(state, "/session").oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(header::SET_COOKIE));
    }

    #[test]
    fn test_client_address() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("198.51.100.1, 10.0.0.1"));
        let peer = Some(IpAddr::from([10, 0, 0, 1]));

        assert_eq!(client_address(&headers, peer, false), peer);
        assert_eq!(
            client_address(&headers, peer, true),
            Some(IpAddr::from([198, 51, 100, 1]))
        );
        assert_eq!(client_address(&HeaderMap::new(), peer, true), peer);
    }

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(700)), 1);
        assert_eq!(retry_after_secs(Duration::from_secs(2)), 2);
        assert_eq!(retry_after_secs(Duration::from_millis(2001)), 3);
    }
}
