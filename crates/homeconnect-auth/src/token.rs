//! OAuth token record and token endpoint calls
//!
//! Handles the two token endpoint interactions:
//! 1. Authorization code exchange (operator completed the browser flow)
//! 2. Token refresh (access token expired)
//!
//! Both POST a form to the configured token URL. The client secret is sent
//! with every request; `client_id` only accompanies the code exchange, which
//! is what the Home Connect token endpoint expects.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::constants::{DEFAULT_EXPIRES_IN_SECS, EXPIRY_MARGIN_SECS, TOKEN_REQUEST_TIMEOUT_SECS};
use crate::error::{Error, Result};
use crate::secret::ClientCredentials;

/// The persisted credential.
///
/// `expires_at` is absolute (unix seconds), computed at storage time from
/// the response's `expires_in` minus a small transport margin.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: String,
    pub expires_at: i64,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub token_type: String,
    #[serde(default)]
    pub id_token: String,
}

impl Token {
    /// Build a token from an endpoint response received at `now`.
    ///
    /// A response without `expires_in` (or with zero) is treated as a
    /// one-year token.
    pub fn from_response(response: TokenResponse, now: i64) -> Result<Self> {
        if response.access_token.is_empty() {
            return Err(Error::InvalidTokenResponse(
                "response is missing access_token".into(),
            ));
        }
        let expires_in = match response.expires_in {
            Some(secs) if secs > 0 => secs,
            _ => DEFAULT_EXPIRES_IN_SECS,
        };
        let expires_in = i64::try_from(expires_in).unwrap_or(i64::MAX);
        Ok(Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token.unwrap_or_default(),
            expires_at: now
                .saturating_add(expires_in)
                .saturating_sub(EXPIRY_MARGIN_SECS),
            scope: response.scope.unwrap_or_default(),
            token_type: response.token_type.unwrap_or_default(),
            id_token: response.id_token.unwrap_or_default(),
        })
    }

    /// Whether the access token can no longer be presented at `now`.
    pub fn is_expired_at(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    pub fn can_refresh(&self) -> bool {
        !self.refresh_token.is_empty()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("token_type", &self.token_type)
            .field("id_token", &"[REDACTED]")
            .finish()
    }
}

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
}

/// Current unix time in seconds.
pub fn epoch_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Exchange an authorization code for tokens (`grant_type=authorization_code`).
pub async fn exchange_code(
    client: &reqwest::Client,
    token_url: &str,
    credentials: &ClientCredentials,
    code: &str,
) -> Result<TokenResponse> {
    let mut form = vec![
        ("client_secret", credentials.client_secret.expose()),
        ("client_id", credentials.client_id.as_str()),
        ("grant_type", "authorization_code"),
        ("code", code),
    ];
    if let Some(redirect_uri) = credentials.redirect_uri.as_deref() {
        form.push(("redirect_uri", redirect_uri));
    }
    post_token_form(client, token_url, &form, "authorization_code").await
}

/// Mint a new access token from a refresh token (`grant_type=refresh_token`).
pub async fn refresh_token(
    client: &reqwest::Client,
    token_url: &str,
    credentials: &ClientCredentials,
    refresh: &str,
) -> Result<TokenResponse> {
    let form = [
        ("client_secret", credentials.client_secret.expose()),
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh),
    ];
    post_token_form(client, token_url, &form, "refresh_token").await
}

async fn post_token_form(
    client: &reqwest::Client,
    token_url: &str,
    form: &[(&str, &str)],
    grant_type: &str,
) -> Result<TokenResponse> {
    debug!(grant_type, "requesting token");
    let response = client
        .post(token_url)
        .form(form)
        .timeout(Duration::from_secs(TOKEN_REQUEST_TIMEOUT_SECS))
        .send()
        .await
        .map_err(|e| Error::Http(format!("{grant_type} request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        warn!(grant_type, status = status.as_u16(), "token endpoint rejected request");
        return Err(Error::UpstreamAuth {
            status: status.as_u16(),
            body,
        });
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::InvalidTokenResponse(e.to_string()))
}
