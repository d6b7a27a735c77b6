//! The per-request value shared by every pipeline stage.

use axum::body::Bytes;
use axum::http::{HeaderMap, Method, StatusCode};
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

use crate::auth::Principal;
use crate::ratelimit::Quota;
use crate::session::Session;

/// Login submission body.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoginForm {
    pub email: String,
    pub password: String,
}

/// Mutable request state passed through the pipeline.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    /// Network identity of the client, when known
    pub client_addr: Option<IpAddr>,
    /// Buffered request body
    pub body: Bytes,
    /// Set by the session stage
    pub session: Option<Session>,
    /// Set by the login validation stage
    pub login: Option<LoginForm>,
    /// Set by the authentication stage
    pub principal: Option<Principal>,
    /// Quota from the most recent limiter that admitted the request
    pub quota: Option<Quota>,
}

impl RequestContext {
    pub fn new(
        method: Method,
        path: impl Into<String>,
        headers: HeaderMap,
        client_addr: Option<IpAddr>,
    ) -> Self {
        Self {
            method,
            path: path.into(),
            headers,
            client_addr,
            body: Bytes::new(),
            session: None,
            login: None,
            principal: None,
            quota: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// A response written by a stage that stops the request.
///
/// Rendered to HTTP by the server layer; the body never carries internal
/// error details.
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub status: StatusCode,
    /// Machine-readable error code
    pub code: &'static str,
    pub message: String,
    pub retry_after: Option<Duration>,
    pub quota: Option<Quota>,
    pub details: Option<serde_json::Value>,
}

impl Rejection {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after: None,
            quota: None,
            details: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_quota(mut self, quota: Option<Quota>) -> Self {
        self.quota = quota;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }
}
