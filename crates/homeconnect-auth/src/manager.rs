//! Token lifecycle: load, expiry check, single-flight refresh
//!
//! One `TokenManager` exists per process. Every path that may replace the
//! credential (`get_valid_token`, `exchange_code`) runs behind the same
//! async mutex, so when many forwarded requests observe an expired
//! token at once exactly one refresh reaches the token endpoint. The others
//! wait on the lock, reload the store and find the fresh token.
//!
//! The lock is held across the refresh request itself; token endpoint calls
//! carry a fixed timeout so waiters are never blocked longer than that.
//! `status` only reads the store and never waits on the lock; stores replace
//! the record atomically, so it sees either the old or the new token.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::credentials::CredentialStore;
use crate::error::{Error, Result};
use crate::secret::ClientCredentials;
use crate::token::{self, Token, epoch_seconds};

/// Snapshot of the credential state, without triggering a refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenStatus {
    /// Nothing stored yet.
    Unauthorized,
    Valid { expires_at: i64 },
    /// Expired; `refreshable` tells whether the next request can recover
    /// without operator action.
    Expired { refreshable: bool },
}

impl TokenStatus {
    pub fn label(&self) -> &'static str {
        match self {
            TokenStatus::Unauthorized => "unauthorized",
            TokenStatus::Valid { .. } => "valid",
            TokenStatus::Expired { refreshable: true } => "expired",
            TokenStatus::Expired { refreshable: false } => "reauthorization_required",
        }
    }
}

/// Owns the single OAuth credential of this process.
pub struct TokenManager {
    store: Arc<dyn CredentialStore>,
    client: reqwest::Client,
    credentials: ClientCredentials,
    token_url: String,
    lock: Mutex<()>,
}

impl TokenManager {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        client: reqwest::Client,
        credentials: ClientCredentials,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            client,
            credentials,
            token_url: token_url.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn credentials(&self) -> &ClientCredentials {
        &self.credentials
    }

    /// Return a token that is valid right now, refreshing it first if the
    /// stored one expired.
    ///
    /// Fails with `NeedsAuthorization` when nothing is stored and with
    /// `ReauthorizationRequired` when the token expired without a refresh
    /// token. A rejected refresh leaves the stored token untouched.
    pub async fn get_valid_token(&self) -> Result<Token> {
        let _guard = self.lock.lock().await;

        let current = self.load_current().await?;
        let now = epoch_seconds();
        if !current.is_expired_at(now) {
            return Ok(current);
        }

        if !current.can_refresh() {
            warn!("access token expired and no refresh token is stored");
            metrics::counter!("token_refresh_total", "outcome" => "reauthorization_required")
                .increment(1);
            return Err(Error::ReauthorizationRequired);
        }

        info!(expired_at = current.expires_at, "access token expired, refreshing");
        let response = match token::refresh_token(
            &self.client,
            &self.token_url,
            &self.credentials,
            &current.refresh_token,
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "token refresh failed, keeping stored token");
                metrics::counter!("token_refresh_total", "outcome" => "failed").increment(1);
                return Err(e);
            }
        };

        let mut refreshed = Token::from_response(response, epoch_seconds())?;
        if refreshed.refresh_token.is_empty() {
            // Upstream did not rotate the refresh token; the old one stays valid
            refreshed.refresh_token = current.refresh_token;
        }

        self.store.save(&refreshed).await?;
        metrics::counter!("token_refresh_total", "outcome" => "refreshed").increment(1);
        info!(expires_at = refreshed.expires_at, "token refreshed");
        Ok(refreshed)
    }

    /// Complete the authorization-code flow: exchange `code`, persist the
    /// resulting token and return it.
    pub async fn exchange_code(&self, code: &str) -> Result<Token> {
        let _guard = self.lock.lock().await;

        info!("exchanging authorization code");
        let response =
            token::exchange_code(&self.client, &self.token_url, &self.credentials, code).await?;
        let token = Token::from_response(response, epoch_seconds())?;
        self.store.save(&token).await?;

        info!(
            expires_at = token.expires_at,
            has_refresh_token = token.can_refresh(),
            "authorization completed, token stored"
        );
        Ok(token)
    }

    /// Inspect the stored credential without refreshing it.
    pub async fn status(&self) -> Result<TokenStatus> {
        match self.store.load().await {
            Ok(token) if token.is_expired_at(epoch_seconds()) => Ok(TokenStatus::Expired {
                refreshable: token.can_refresh(),
            }),
            Ok(token) => Ok(TokenStatus::Valid {
                expires_at: token.expires_at,
            }),
            Err(Error::NotFound(_)) => Ok(TokenStatus::Unauthorized),
            Err(e) => Err(e),
        }
    }

    async fn load_current(&self) -> Result<Token> {
        match self.store.load().await {
            Ok(token) => Ok(token),
            Err(Error::NotFound(detail)) => {
                debug!(%detail, "no stored credential");
                Err(Error::NeedsAuthorization)
            }
            Err(e) => {
                warn!(error = %e, "failed to load stored credential");
                Err(e)
            }
        }
    }
}
