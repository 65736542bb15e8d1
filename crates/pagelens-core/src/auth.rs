//! Request authorization gate.
//!
//! The orchestrator asks an [`AuthCheck`] once per request, before any
//! integration is matched or executed. Token issuance happens elsewhere; this
//! module only decides whether a presented credential is acceptable.

use std::sync::Arc;

use pagelens_config::AuthConfig;
use pagelens_macros::Redact;
use sha2::{Digest, Sha256};

use crate::BoxFuture;
use crate::secrets::SecretProvider;

/// Credential presented with a request.
#[derive(Clone, Default, Redact)]
pub struct Credential {
    #[redact]
    pub bearer: Option<String>,
}

impl Credential {
    /// No credential at all.
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn bearer(token: impl Into<String>) -> Self {
        Self {
            bearer: Some(token.into()),
        }
    }
}

/// Result of an authorization check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny(String),
}

impl AuthDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AuthDecision::Allow)
    }
}

/// Decides whether a request may proceed.
pub trait AuthCheck: Send + Sync {
    fn check<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, AuthDecision>;
}

/// Accepts every request (`[auth] mode = "none"`).
pub struct AllowAll;

impl AuthCheck for AllowAll {
    fn check<'a>(&'a self, _credential: &'a Credential) -> BoxFuture<'a, AuthDecision> {
        Box::pin(async { AuthDecision::Allow })
    }
}

/// Rejects every request. Used when `[auth] mode` is not recognised.
pub struct DenyAll {
    reason: String,
}

impl DenyAll {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl AuthCheck for DenyAll {
    fn check<'a>(&'a self, _credential: &'a Credential) -> BoxFuture<'a, AuthDecision> {
        Box::pin(async move { AuthDecision::Deny(self.reason.clone()) })
    }
}

/// Accepts bearer tokens equal to one of the configured token secrets.
///
/// Tokens are read from the secret provider on every check, so a rotated
/// token takes effect without a restart.
pub struct TokenAuth {
    secrets: Arc<dyn SecretProvider>,
    token_secrets: Vec<String>,
}

impl TokenAuth {
    pub fn new(secrets: Arc<dyn SecretProvider>, token_secrets: Vec<String>) -> Self {
        Self {
            secrets,
            token_secrets,
        }
    }
}

impl AuthCheck for TokenAuth {
    fn check<'a>(&'a self, credential: &'a Credential) -> BoxFuture<'a, AuthDecision> {
        Box::pin(async move {
            let Some(presented) = credential.bearer.as_deref() else {
                return AuthDecision::Deny("missing bearer token".to_string());
            };
            // Every configured token is compared so timing does not reveal which matched.
            let mut accepted = false;
            for name in &self.token_secrets {
                if let Some(expected) = self.secrets.get(name) {
                    accepted |= tokens_equal(presented, expected.expose());
                }
            }
            if accepted {
                AuthDecision::Allow
            } else {
                tracing::debug!("Bearer token rejected");
                AuthDecision::Deny("invalid bearer token".to_string())
            }
        })
    }
}

/// Compare fixed-length digests without early exit.
fn tokens_equal(a: &str, b: &str) -> bool {
    let da = Sha256::digest(a.as_bytes());
    let db = Sha256::digest(b.as_bytes());
    da.iter().zip(db.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Build the auth gate named by `[auth] mode`.
pub fn from_config(config: &AuthConfig, secrets: Arc<dyn SecretProvider>) -> Arc<dyn AuthCheck> {
    match config.mode.as_str() {
        "none" => Arc::new(AllowAll),
        "token" => Arc::new(TokenAuth::new(secrets, config.token_secrets.clone())),
        other => {
            tracing::error!(mode = %other, "Unknown auth mode, denying all requests");
            Arc::new(DenyAll::new(format!("unknown auth mode '{other}'")))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::secrets::{SecretError, SecretValue};

    struct Fixed(HashMap<String, String>);

    impl SecretProvider for Fixed {
        fn get(&self, name: &str) -> Option<SecretValue> {
            self.0.get(name).map(SecretValue::new)
        }

        fn load(&self) -> BoxFuture<'_, Result<(), SecretError>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn token_auth() -> TokenAuth {
        let secrets = Fixed(HashMap::from([
            ("CLIENT_A".to_string(), "token-a".to_string()),
            ("CLIENT_B".to_string(), "token-b".to_string()),
        ]));
        TokenAuth::new(
            Arc::new(secrets),
            vec!["CLIENT_A".to_string(), "CLIENT_B".to_string(), "UNSET".to_string()],
        )
    }

    #[tokio::test]
    async fn test_allow_all() {
        assert!(AllowAll.check(&Credential::anonymous()).await.is_allowed());
    }

    #[tokio::test]
    async fn test_token_auth() {
        let auth = token_auth();
        assert_eq!(auth.check(&Credential::bearer("token-a")).await, AuthDecision::Allow);
        assert_eq!(auth.check(&Credential::bearer("token-b")).await, AuthDecision::Allow);
        assert!(!auth.check(&Credential::bearer("token-c")).await.is_allowed());
        assert!(!auth.check(&Credential::bearer("")).await.is_allowed());
        assert!(matches!(
            auth.check(&Credential::anonymous()).await,
            AuthDecision::Deny(reason) if reason.contains("missing")
        ));
    }

    #[test]
    fn test_credential_debug_redacted() {
        let debug = format!("{:?}", Credential::bearer("hunter2"));
        assert!(debug.contains("Some([REDACTED])"));
        assert!(!debug.contains("hunter2"));
        assert!(format!("{:?}", Credential::anonymous()).contains("None"));
    }

    #[test]
    fn test_tokens_equal() {
        assert!(tokens_equal("abc", "abc"));
        assert!(!tokens_equal("abc", "abd"));
        assert!(!tokens_equal("abc", "abcd"));
    }

    #[tokio::test]
    async fn test_from_config() {
        let secrets: Arc<dyn SecretProvider> = Arc::new(Fixed(HashMap::new()));
        let none = from_config(&AuthConfig::default(), Arc::clone(&secrets));
        assert!(none.check(&Credential::anonymous()).await.is_allowed());

        let token = from_config(
            &AuthConfig {
                mode: "token".to_string(),
                token_secrets: vec!["CLIENT".to_string()],
            },
            secrets,
        );
        assert!(!token.check(&Credential::anonymous()).await.is_allowed());
    }

    #[tokio::test]
    async fn test_unknown_mode_fails_closed() {
        let secrets: Arc<dyn SecretProvider> = Arc::new(Fixed(HashMap::new()));
        let typo = from_config(
            &AuthConfig {
                mode: "tokn".to_string(),
                token_secrets: Vec::new(),
            },
            secrets,
        );
        assert!(matches!(
            typo.check(&Credential::bearer("anything")).await,
            AuthDecision::Deny(reason) if reason.contains("tokn")
        ));
    }
}
