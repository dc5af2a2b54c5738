//! Auth provider contract consumed by the sync engine.

use async_trait::async_trait;
use lectern_core::UserId;
use parking_lot::RwLock;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

/// Short-lived credential for the remote store.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No usable credential; the user has to sign in again.
    #[error("authentication required")]
    AuthRequired,

    /// The user has to grant a scope interactively.
    #[error("user consent required: {intent}")]
    PermissionRequired { intent: String },

    #[error("authentication failed: {0}")]
    Fatal(String),
}

impl From<AuthError> for lectern_core::Error {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::AuthRequired => lectern_core::Error::AuthRequired,
            AuthError::PermissionRequired { intent } => {
                lectern_core::Error::PermissionRequired { intent }
            }
            AuthError::Fatal(reason) => lectern_core::Error::AuthFatal(reason),
        }
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Signed-in user, or None when signed out.
    async fn current_user(&self) -> Option<UserId>;

    async fn get_token(&self) -> Result<AuthToken, AuthError>;

    /// Drop a cached token the remote rejected so the next call refreshes it.
    async fn clear_token(&self, token: &AuthToken);
}

/// Fixed user and token, for the CLI and tests.
pub struct StaticAuthProvider {
    user: RwLock<Option<UserId>>,
    token: RwLock<AuthToken>,
    token_error: RwLock<Option<AuthError>>,
    cleared: AtomicUsize,
}

impl StaticAuthProvider {
    pub fn new(user: UserId, token: impl Into<String>) -> Self {
        Self {
            user: RwLock::new(Some(user)),
            token: RwLock::new(AuthToken::new(token)),
            token_error: RwLock::new(None),
            cleared: AtomicUsize::new(0),
        }
    }

    pub fn signed_out() -> Self {
        let provider = Self::new(UserId::new(""), "");
        *provider.user.write() = None;
        provider
    }

    pub fn sign_in(&self, user: UserId, token: impl Into<String>) {
        *self.user.write() = Some(user);
        *self.token.write() = AuthToken::new(token);
    }

    pub fn sign_out(&self) {
        *self.user.write() = None;
    }

    /// Make `get_token` fail with `error` until reset with `None`.
    pub fn set_token_error(&self, error: Option<AuthError>) {
        *self.token_error.write() = error;
    }

    /// Number of `clear_token` calls so far.
    pub fn clear_count(&self) -> usize {
        self.cleared.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthProvider for StaticAuthProvider {
    async fn current_user(&self) -> Option<UserId> {
        self.user.read().clone()
    }

    async fn get_token(&self) -> Result<AuthToken, AuthError> {
        if let Some(err) = self.token_error.read().clone() {
            return Err(err);
        }
        Ok(self.token.read().clone())
    }

    async fn clear_token(&self, _token: &AuthToken) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_provider() {
        let auth = StaticAuthProvider::new(UserId::new("alice"), "t1");
        assert_eq!(auth.current_user().await, Some(UserId::new("alice")));
        assert_eq!(auth.get_token().await.unwrap().as_str(), "t1");

        auth.set_token_error(Some(AuthError::PermissionRequired {
            intent: "drive.readonly".into(),
        }));
        assert!(matches!(
            auth.get_token().await,
            Err(AuthError::PermissionRequired { .. })
        ));

        auth.clear_token(&AuthToken::new("t1")).await;
        assert_eq!(auth.clear_count(), 1);

        auth.sign_out();
        assert!(auth.current_user().await.is_none());
    }

    #[test]
    fn test_token_debug_is_redacted() {
        assert_eq!(format!("{:?}", AuthToken::new("secret")), "AuthToken(***)");
    }

    #[test]
    fn test_auth_error_maps_to_core_error() {
        let err: lectern_core::Error = AuthError::AuthRequired.into();
        assert_eq!(err.code(), "AUTH_REQUIRED");
        let err: lectern_core::Error = AuthError::Fatal("revoked".into()).into();
        assert!(!err.is_retryable());
    }
}
