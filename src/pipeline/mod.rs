//! Explicit request pipeline.
//!
//! A pipeline is an ordered list of named stages that share one
//! [`RequestContext`]. Each stage either lets the request continue or stops
//! it with a [`Rejection`]. Stages can be scoped to a single route, which is
//! how the login-only stages sit between the global ones.

mod context;
mod stages;

pub use context::{LoginForm, Rejection, RequestContext};
pub use stages::{AuthenticateStage, RateLimitStage, SessionLoadStage, ValidateLoginStage};

use async_trait::async_trait;
use axum::http::Method;
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::auth::CredentialVerifier;
use crate::ratelimit::RateLimiter;
use crate::session::SessionStore;

/// Result of running one stage.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutcome {
    Continue,
    Respond(Rejection),
}

/// One step of request admission.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    async fn run(&self, ctx: &mut RequestContext) -> StageOutcome;
}

/// Restricts a stage to one method and path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub method: Method,
    pub path: String,
}

impl Route {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
        }
    }

    pub fn matches(&self, ctx: &RequestContext) -> bool {
        self.method == ctx.method && self.path == ctx.path
    }
}

struct PipelineEntry {
    route: Option<Route>,
    stage: Arc<dyn Stage>,
}

/// Result of running a whole pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineOutcome {
    Continue,
    /// Stopped by the named stage
    Respond { stage: String, rejection: Rejection },
}

/// Ordered stages run for every request.
#[derive(Default)]
pub struct Pipeline {
    entries: Vec<PipelineEntry>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a stage that runs for every request.
    pub fn stage(mut self, stage: Arc<dyn Stage>) -> Self {
        self.entries.push(PipelineEntry { route: None, stage });
        self
    }

    /// Append a stage that runs only for requests matching `route`.
    pub fn stage_on(mut self, route: Route, stage: Arc<dyn Stage>) -> Self {
        self.entries.push(PipelineEntry {
            route: Some(route),
            stage,
        });
        self
    }

    /// The standard admission order:
    /// `GlobalLimit -> SessionLoad -> ValidateLogin -> LoginLimit -> Authenticate`.
    ///
    /// The global limiter runs before anything touches sessions or
    /// credentials. The login limiter runs after the submission is known to
    /// be well formed and before any password comparison.
    pub fn standard(
        global: Arc<RateLimiter>,
        login: Arc<RateLimiter>,
        sessions: Arc<dyn SessionStore>,
        verifier: Arc<dyn CredentialVerifier>,
        login_route: Route,
    ) -> Self {
        Self::new()
            .stage(Arc::new(RateLimitStage::new("GlobalLimit", global)))
            .stage(Arc::new(SessionLoadStage::new(sessions)))
            .stage_on(login_route.clone(), Arc::new(ValidateLoginStage))
            .stage_on(login_route.clone(), Arc::new(RateLimitStage::new("LoginLimit", login)))
            .stage_on(login_route, Arc::new(AuthenticateStage::new(verifier)))
    }

    /// Names of the stages in order.
    pub fn stage_names(&self) -> Vec<&str> {
        self.entries.iter().map(|e| e.stage.name()).collect()
    }

    /// Run every applicable stage in order, stopping at the first rejection.
    #[instrument(skip_all, fields(method = %ctx.method, path = %ctx.path))]
    pub async fn run(&self, ctx: &mut RequestContext) -> PipelineOutcome {
        for entry in &self.entries {
            if let Some(route) = &entry.route {
                if !route.matches(ctx) {
                    continue;
                }
            }

            if let StageOutcome::Respond(rejection) = entry.stage.run(ctx).await {
                debug!(
                    stage = entry.stage.name(),
                    status = rejection.status.as_u16(),
                    code = rejection.code,
                    "Request stopped by pipeline"
                );
                return PipelineOutcome::Respond {
                    stage: entry.stage.name().to_string(),
                    rejection,
                };
            }
        }
        PipelineOutcome::Continue
    }
}
