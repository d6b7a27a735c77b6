//! Credential verification behind the login endpoint.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::UserCredentials;

/// An authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Principal {
    pub user_id: String,
    pub email: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// Checks a submitted email and password.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// Returns the principal when the credentials are valid.
    async fn verify(&self, email: &str, password: &str) -> Option<Principal>;
}

/// Verifier over a fixed list of accounts from configuration. Development only:
/// passwords are held in plain text.
#[derive(Debug, Default)]
pub struct StaticCredentialVerifier {
    accounts: HashMap<String, (String, Principal)>,
}

impl StaticCredentialVerifier {
    pub fn new(users: &[UserCredentials]) -> Self {
        let accounts = users
            .iter()
            .map(|user| {
                let email = user.email.to_lowercase();
                let principal = Principal {
                    user_id: Uuid::new_v4().to_string(),
                    email: email.clone(),
                    display_name: user.display_name.clone(),
                };
                (email, (user.password.clone(), principal))
            })
            .collect();
        Self { accounts }
    }
}

#[async_trait]
impl CredentialVerifier for StaticCredentialVerifier {
    async fn verify(&self, email: &str, password: &str) -> Option<Principal> {
        let (expected, principal) = self.accounts.get(&email.to_lowercase())?;
        (expected == password).then(|| principal.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> StaticCredentialVerifier {
        StaticCredentialVerifier::new(&[UserCredentials {
            email: "Dev@Example.com".to_string(),
            password: "hunter22".to_string(),
            display_name: Some("Dev".to_string()),
        }])
    }

    #[tokio::test]
    async fn test_valid_credentials() {
        let principal = verifier().verify("dev@example.com", "hunter22").await.unwrap();
        assert_eq!(principal.email, "dev@example.com");
        assert_eq!(principal.display_name.as_deref(), Some("Dev"));
    }

    #[tokio::test]
    async fn test_invalid_credentials() {
        let verifier = verifier();
        assert!(verifier.verify("dev@example.com", "wrong").await.is_none());
        assert!(verifier.verify("nobody@example.com", "hunter22").await.is_none());
    }
}
