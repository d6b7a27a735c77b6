//! Built-in pipeline stages.

use async_trait::async_trait;
use axum::http::{header, StatusCode};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use super::context::{LoginForm, Rejection, RequestContext};
use super::{Stage, StageOutcome};
use crate::auth::CredentialVerifier;
use crate::ratelimit::{Decision, RateLimiter, RejectReason};
use crate::session::{cookie_value, SessionStore, SESSION_COOKIE};

/// Minimum password length accepted at the login endpoint.
const MIN_PASSWORD_LEN: usize = 5;

/// Runs a [`RateLimiter`] and turns its decision into a stage outcome.
pub struct RateLimitStage {
    name: String,
    limiter: Arc<RateLimiter>,
}

impl RateLimitStage {
    pub fn new(name: impl Into<String>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            name: name.into(),
            limiter,
        }
    }
}

#[async_trait]
impl Stage for RateLimitStage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &mut RequestContext) -> StageOutcome {
        match self.limiter.check(ctx).await {
            Decision::Admit { quota } => {
                if quota.is_some() {
                    ctx.quota = quota;
                }
                StageOutcome::Continue
            }
            Decision::Reject {
                reason: RejectReason::LimitExceeded,
                retry_after,
                quota,
            } => StageOutcome::Respond(
                Rejection::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMIT_EXCEEDED",
                    "Too many requests, please try again later.",
                )
                .with_retry_after(retry_after)
                .with_quota(quota)
                .with_details(json!({ "limiter": self.limiter.name() })),
            ),
            Decision::Reject {
                reason: RejectReason::StoreUnavailable,
                retry_after,
                ..
            } => StageOutcome::Respond(
                Rejection::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "SERVICE_UNAVAILABLE",
                    "The service is temporarily unavailable, please try again later.",
                )
                .with_retry_after(retry_after),
            ),
        }
    }
}

/// Attaches the session named by the session cookie. Never stops a request.
pub struct SessionLoadStage {
    store: Arc<dyn SessionStore>,
}

impl SessionLoadStage {
    pub fn new(store: Arc<dyn SessionStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Stage for SessionLoadStage {
    fn name(&self) -> &str {
        "SessionLoad"
    }

    async fn run(&self, ctx: &mut RequestContext) -> StageOutcome {
        let session_id = ctx
            .headers
            .get_all(header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .find_map(|cookies| cookie_value(cookies, SESSION_COOKIE))
            .map(str::to_string);

        let Some(session_id) = session_id else {
            return StageOutcome::Continue;
        };

        match self.store.load(&session_id).await {
            Ok(session) => {
                if session.is_none() {
                    debug!("Unknown session cookie, continuing anonymously");
                }
                ctx.session = session;
            }
            Err(err) => warn!(error = %err, "Failed to load session, continuing anonymously"),
        }
        StageOutcome::Continue
    }
}

#[derive(Debug, Default, Deserialize)]
struct LoginSubmission {
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

fn looks_like_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !email.chars().any(char::is_whitespace)
}

fn field_error(param: &str, msg: &str) -> serde_json::Value {
    json!({ "param": param, "msg": msg })
}

/// Checks the shape of a login submission before it is counted or verified.
pub struct ValidateLoginStage;

impl ValidateLoginStage {
    fn validate(body: &[u8]) -> Result<LoginForm, Vec<serde_json::Value>> {
        let submission: LoginSubmission = serde_json::from_slice(body)
            .map_err(|_| vec![field_error("body", "Body must be a JSON object")])?;

        let mut errors = Vec::new();
        let email = submission.email.unwrap_or_default();
        if !looks_like_email(&email) {
            errors.push(field_error("email", "Invalid email address"));
        }
        let password = submission.password.unwrap_or_default();
        if password.chars().count() < MIN_PASSWORD_LEN {
            errors.push(field_error(
                "password",
                &format!("Password must be at least {MIN_PASSWORD_LEN} characters"),
            ));
        }

        if errors.is_empty() {
            Ok(LoginForm { email, password })
        } else {
            Err(errors)
        }
    }
}

#[async_trait]
impl Stage for ValidateLoginStage {
    fn name(&self) -> &str {
        "ValidateLogin"
    }

    async fn run(&self, ctx: &mut RequestContext) -> StageOutcome {
        match Self::validate(&ctx.body) {
            Ok(form) => {
                ctx.login = Some(form);
                StageOutcome::Continue
            }
            Err(errors) => StageOutcome::Respond(
                Rejection::new(
                    StatusCode::UNPROCESSABLE_ENTITY,
                    "VALIDATION_FAILED",
                    "The login submission is invalid.",
                )
                .with_details(json!({ "errors": errors })),
            ),
        }
    }
}

/// Verifies the validated login submission.
pub struct AuthenticateStage {
    verifier: Arc<dyn CredentialVerifier>,
}

impl AuthenticateStage {
    pub fn new(verifier: Arc<dyn CredentialVerifier>) -> Self {
        Self { verifier }
    }
}

#[async_trait]
impl Stage for AuthenticateStage {
    fn name(&self) -> &str {
        "Authenticate"
    }

    async fn run(&self, ctx: &mut RequestContext) -> StageOutcome {
        let Some(form) = ctx.login.as_ref() else {
            return StageOutcome::Respond(Rejection::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                "VALIDATION_FAILED",
                "Missing login submission.",
            ));
        };

        let verified = self.verifier.verify(&form.email, &form.password).await;
        match verified {
            Some(principal) => {
                debug!(user_id = %principal.user_id, "Login succeeded");
                ctx.principal = Some(principal);
                StageOutcome::Continue
            }
            None => {
                debug!("Login failed");
                StageOutcome::Respond(Rejection::new(
                    StatusCode::UNAUTHORIZED,
                    "INVALID_CREDENTIALS",
                    "Invalid email or password.",
                ))
            }
        }
    }
}
