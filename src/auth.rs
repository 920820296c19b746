//! Bearer-token authentication for the upgrade endpoint.
//!
//! The gateway only needs an [`Identity`] for a token. [`HttpAuthenticator`]
//! asks an auth service:
//!
//! ```text
//! GET <auth.url>
//! Authorization: Bearer <token>
//!
//! 200 + X-User-ID (+ X-Username)  → identity
//! 401 / 403                       → rejected
//! anything else, or no response   → unavailable
//! ```

use crate::config::AuthConfig;
use crate::envelope::Identity;
use crate::error::{FanoutError, Result};
use crate::metrics;
use reqwest::{Client, StatusCode};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;
use tracing::{debug, warn};

pub const USER_ID_HEADER: &str = "X-User-ID";
pub const USERNAME_HEADER: &str = "X-Username";

/// Why a token did not yield an identity.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("credential rejected")]
    Rejected,

    #[error("auth service unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    fn as_str(&self) -> &'static str {
        match self {
            AuthError::Rejected => "rejected",
            AuthError::Unavailable(_) => "unavailable",
        }
    }
}

impl From<AuthError> for FanoutError {
    fn from(e: AuthError) -> Self {
        FanoutError::Auth(e.to_string())
    }
}

/// Boxed future returned by [`Authenticator::authenticate`].
pub type AuthFuture<'a> = Pin<Box<dyn Future<Output = std::result::Result<Identity, AuthError>> + Send + 'a>>;

/// Resolves a bearer token to an identity.
pub trait Authenticator: Send + Sync + 'static {
    fn authenticate<'a>(&'a self, token: &'a str) -> AuthFuture<'a>;
}

/// [`Authenticator`] backed by an HTTP auth service.
#[derive(Debug, Clone)]
pub struct HttpAuthenticator {
    client: Client,
    url: String,
}

impl HttpAuthenticator {
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout_duration())
            .build()
            .map_err(|e| FanoutError::Config(format!("Cannot build auth client: {}", e)))?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn verify(&self, token: &str) -> std::result::Result<Identity, AuthError> {
        let response = self
            .client
            .get(&self.url)
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .map_err(|e| AuthError::Unavailable(format!("Network error: {}", e)))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(AuthError::Rejected);
        }
        if status != StatusCode::OK {
            return Err(AuthError::Unavailable(format!("unexpected status {}", status)));
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let user_id = header(USER_ID_HEADER).ok_or_else(|| {
            AuthError::Unavailable(format!("200 response without {}", USER_ID_HEADER))
        })?;
        let username = header(USERNAME_HEADER).unwrap_or_default();

        Ok(Identity::new(user_id, username))
    }
}

impl Authenticator for HttpAuthenticator {
    fn authenticate<'a>(&'a self, token: &'a str) -> AuthFuture<'a> {
        Box::pin(async move {
            let result = self.verify(token).await;
            match &result {
                Ok(identity) => {
                    metrics::record_auth("accepted");
                    debug!(user_id = %identity.user_id, "Token accepted");
                }
                Err(AuthError::Rejected) => {
                    metrics::record_auth("rejected");
                    debug!("Token rejected");
                }
                Err(e) => {
                    metrics::record_auth(e.as_str());
                    warn!(url = %self.url, error = %e, "Auth service unavailable");
                }
            }
            result
        })
    }
}
