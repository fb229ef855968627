use async_trait::async_trait;
use thiserror::Error;

/// Failure fetching a connection token from the host backend.
#[derive(Debug, Clone, Error)]
#[error("{reason}")]
pub struct TokenError {
    pub reason: String,
}

impl TokenError {
    pub fn new(reason: impl Into<String>) -> Self {
        TokenError {
            reason: reason.into(),
        }
    }
}

/// Host-supplied source of driver connection tokens.
///
/// The driver requests a fresh token whenever it needs one; the terminal
/// fetches it through this trait and answers the driver. An empty token
/// counts as a failed fetch.
#[async_trait]
pub trait ConnectionTokenProvider: Send + Sync {
    async fn fetch_connection_token(&self) -> Result<String, TokenError>;
}

/// Provider returning a fixed token, for demos and tests.
pub struct StaticTokenProvider {
    token: String,
}

impl StaticTokenProvider {
    pub fn new(token: impl Into<String>) -> Self {
        StaticTokenProvider {
            token: token.into(),
        }
    }
}

#[async_trait]
impl ConnectionTokenProvider for StaticTokenProvider {
    async fn fetch_connection_token(&self) -> Result<String, TokenError> {
        Ok(self.token.clone())
    }
}
