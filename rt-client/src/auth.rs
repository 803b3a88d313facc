//! Auth seam.
//!
//! The connection manager never mints or stores credentials. It asks an
//! [`AuthProvider`] for the query parameters of each connection attempt,
//! tells it about token errors, and asks it for a fresh token when the
//! server requests reauthorisation.

use async_trait::async_trait;
use parking_lot::RwLock;
use rtwire_types::ErrorInfo;

/// Token errors reported when no credentials are available.
const NO_TOKEN: u32 = 40171;

/// Supplies credentials for connection attempts.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Query parameters for the next connection attempt.
    ///
    /// An error aborts the attempt with that reason.
    fn auth_params(&self) -> Result<Vec<(String, String)>, ErrorInfo>;

    /// The server rejected the current credentials.
    fn on_auth_error(&self, error: &ErrorInfo);

    /// Obtain a fresh access token.
    async fn renew(&self) -> Result<String, ErrorInfo>;
}

/// Provider for endpoints that need no credentials.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

#[async_trait]
impl AuthProvider for NoAuth {
    fn auth_params(&self) -> Result<Vec<(String, String)>, ErrorInfo> {
        Ok(Vec::new())
    }

    fn on_auth_error(&self, error: &ErrorInfo) {
        tracing::warn!(%error, "token error without an auth provider");
    }

    async fn renew(&self) -> Result<String, ErrorInfo> {
        Err(no_token())
    }
}

/// Provider holding a token set by the application.
///
/// A token error discards the token; the application installs a new one
/// with [`set_token`](Self::set_token) and then calls
/// [`ConnectionManager::on_auth_updated`](crate::ConnectionManager::on_auth_updated).
#[derive(Default)]
pub struct TokenAuth {
    token: RwLock<Option<String>>,
}

impl TokenAuth {
    /// Create a provider holding `token`.
    pub fn new(token: &str) -> Self {
        Self {
            token: RwLock::new(Some(token.to_string())),
        }
    }

    /// Replace the token.
    pub fn set_token(&self, token: &str) {
        *self.token.write() = Some(token.to_string());
    }

    /// Whether a token is held.
    pub fn has_token(&self) -> bool {
        self.token.read().is_some()
    }
}

impl std::fmt::Debug for TokenAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenAuth")
            .field("token", &"[REDACTED]")
            .finish()
    }
}

#[async_trait]
impl AuthProvider for TokenAuth {
    fn auth_params(&self) -> Result<Vec<(String, String)>, ErrorInfo> {
        match self.token.read().as_ref() {
            Some(token) => Ok(vec![("access_token".to_string(), token.clone())]),
            None => Err(no_token()),
        }
    }

    fn on_auth_error(&self, error: &ErrorInfo) {
        tracing::info!(%error, "discarding rejected token");
        *self.token.write() = None;
    }

    async fn renew(&self) -> Result<String, ErrorInfo> {
        let token = self.token.read().clone();
        token.ok_or_else(no_token)
    }
}

fn no_token() -> ErrorInfo {
    ErrorInfo::new("No means provided to renew auth token", NO_TOKEN, 401)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_auth_has_no_params_and_cannot_renew() {
        assert!(NoAuth.auth_params().unwrap().is_empty());
        assert_eq!(NoAuth.renew().await.unwrap_err().code, NO_TOKEN);
    }

    #[tokio::test]
    async fn token_auth_supplies_and_discards_token() {
        let auth = TokenAuth::new("t1");
        assert_eq!(
            auth.auth_params().unwrap(),
            vec![("access_token".to_string(), "t1".to_string())]
        );

        auth.on_auth_error(&ErrorInfo::new("Token expired", 40142, 401));
        assert!(!auth.has_token());
        assert!(auth.auth_params().is_err());
        assert!(auth.renew().await.is_err());

        auth.set_token("t2");
        assert_eq!(auth.renew().await.unwrap(), "t2");
    }

    #[test]
    fn token_auth_debug_redacts_token() {
        let debug = format!("{:?}", TokenAuth::new("secret"));
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }
}
