//! Counter key derivation.

use axum::http::HeaderName;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::error::{BulwarkError, Result};
use crate::pipeline::RequestContext;

/// Derives the identity a request is counted under.
///
/// Returning `None` means the strategy has no identity for this request; the
/// limiter then counts it under the client address.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, ctx: &RequestContext) -> Option<String>;
}

impl<F> KeyExtractor for F
where
    F: Fn(&RequestContext) -> Option<String> + Send + Sync,
{
    fn extract(&self, ctx: &RequestContext) -> Option<String> {
        self(ctx)
    }
}

/// Count by network source address.
#[derive(Debug, Default, Clone, Copy)]
pub struct ClientAddrKey;

impl KeyExtractor for ClientAddrKey {
    fn extract(&self, ctx: &RequestContext) -> Option<String> {
        ctx.client_addr.map(|addr| addr.to_string())
    }
}

/// Count by the value of a request header, such as an API key.
#[derive(Debug, Clone)]
pub struct HeaderKey {
    header: HeaderName,
}

impl HeaderKey {
    pub fn new(header: HeaderName) -> Self {
        Self { header }
    }
}

impl KeyExtractor for HeaderKey {
    fn extract(&self, ctx: &RequestContext) -> Option<String> {
        ctx.headers
            .get(&self.header)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(|value| format!("{}={}", self.header, value))
    }
}

/// Count by the user of the loaded session.
#[derive(Debug, Default, Clone, Copy)]
pub struct UserKey;

impl KeyExtractor for UserKey {
    fn extract(&self, ctx: &RequestContext) -> Option<String> {
        ctx.session
            .as_ref()
            .map(|session| format!("user={}", session.user_id))
    }
}

/// Configurable choice of [`KeyExtractor`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// Client network address
    #[default]
    ClientAddr,
    /// Value of the named request header
    Header(String),
    /// Authenticated user id from the session
    User,
}

impl KeyStrategy {
    pub fn extractor(&self) -> Result<Arc<dyn KeyExtractor>> {
        Ok(match self {
            KeyStrategy::ClientAddr => Arc::new(ClientAddrKey),
            KeyStrategy::Header(name) => {
                let header = HeaderName::from_bytes(name.as_bytes()).map_err(|e| {
                    BulwarkError::Config(format!("invalid key header '{name}': {e}"))
                })?;
                Arc::new(HeaderKey::new(header))
            }
            KeyStrategy::User => Arc::new(UserKey),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RequestContext;
    use crate::session::Session;
    use axum::http::{HeaderValue, Method};
    use std::net::{IpAddr, Ipv4Addr};

    fn context() -> RequestContext {
        RequestContext::new(
            Method::GET,
            "/",
            Default::default(),
            Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 7))),
        )
    }

    #[test]
    fn test_client_addr_key() {
        assert_eq!(ClientAddrKey.extract(&context()), Some("10.0.0.7".to_string()));

        let mut ctx = context();
        ctx.client_addr = None;
        assert_eq!(ClientAddrKey.extract(&ctx), None);
    }

    #[test]
    fn test_header_key() {
        let extractor = KeyStrategy::Header("x-api-key".to_string()).extractor().unwrap();

        let mut ctx = context();
        assert_eq!(extractor.extract(&ctx), None);

        ctx.headers.insert("x-api-key", HeaderValue::from_static(" abc123 "));
        assert_eq!(extractor.extract(&ctx), Some("x-api-key=abc123".to_string()));
    }

    #[test]
    fn test_user_key() {
        let mut ctx = context();
        assert_eq!(UserKey.extract(&ctx), None);

        ctx.session = Some(Session::new(
            "u-42",
            "someone@example.com",
            std::time::Duration::from_secs(60),
        ));
        assert_eq!(UserKey.extract(&ctx), Some("user=u-42".to_string()));
    }

    #[test]
    fn test_closure_extractor() {
        let extractor = |ctx: &RequestContext| Some(ctx.path.clone());
        assert_eq!(extractor.extract(&context()), Some("/".to_string()));
    }

    #[test]
    fn test_strategy_deserialization() {
        let strategy: KeyStrategy = serde_yaml::from_str("client_addr").unwrap();
        assert_eq!(strategy, KeyStrategy::ClientAddr);

        let strategy: KeyStrategy = serde_yaml::from_str("header: x-api-key").unwrap();
        assert_eq!(strategy, KeyStrategy::Header("x-api-key".to_string()));
    }
}
