//! Operator-facing authorization pages
//!
//! - GET /proxy/auth: redirect to the vendor authorization page
//! - GET /proxy/auth/redirect: vendor callback, checks state and exchanges the code
//! - GET /proxy/success: confirmation page
//!
//! Each redirect carries a random `state` kept in memory for
//! `STATE_EXPIRY`; the callback is only accepted with a state this process
//! issued and has not yet consumed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{FromRef, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use homeconnect_auth::{Error as AuthError, TokenManager};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::AppState;

/// Maximum age of an issued `state` before the callback is refused.
pub const STATE_EXPIRY: Duration = Duration::from_secs(600);

/// Upper bound on outstanding states; the oldest is evicted beyond it.
pub const MAX_PENDING_STATES: usize = 256;

/// `state` values handed out by `/proxy/auth` and not yet consumed.
#[derive(Clone, Default)]
pub struct PendingAuthorizations {
    states: Arc<Mutex<HashMap<String, Instant>>>,
}

impl PendingAuthorizations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate and remember a new state.
    pub async fn issue(&self) -> String {
        let state = homeconnect_auth::generate_state();
        let mut states = self.states.lock().await;
        // Lazy cleanup: remove expired entries while holding the lock
        states.retain(|_, issued| issued.elapsed() < STATE_EXPIRY);
        if states.len() >= MAX_PENDING_STATES {
            let oldest = states
                .iter()
                .min_by_key(|(_, issued)| **issued)
                .map(|(s, _)| s.clone());
            if let Some(oldest) = oldest {
                warn!(limit = MAX_PENDING_STATES, "too many pending authorizations, evicting oldest");
                states.remove(&oldest);
            }
        }
        states.insert(state.clone(), Instant::now());
        state
    }

    /// Remove `state` and report whether it was issued within the expiry
    /// window.
    pub async fn consume(&self, state: &str) -> bool {
        let issued = self.states.lock().await.remove(state);
        matches!(issued, Some(at) if at.elapsed() < STATE_EXPIRY)
    }

    #[cfg(test)]
    pub async fn insert_at(&self, state: &str, issued: Instant) {
        self.states.lock().await.insert(state.to_string(), issued);
    }
}

/// State for the authorization handlers, extracted from `AppState`.
#[derive(Clone)]
pub struct AuthFlowState {
    pub tokens: Arc<TokenManager>,
    pub authorize_url: String,
    pub pending: PendingAuthorizations,
}

impl FromRef<AppState> for AuthFlowState {
    fn from_ref(app: &AppState) -> Self {
        app.auth.clone()
    }
}

fn text(status: StatusCode, body: impl Into<String>) -> Response {
    (status, body.into()).into_response()
}

/// GET /proxy/auth: start the authorization-code flow.
pub async fn start_handler(State(state): State<AuthFlowState>) -> Response {
    let oauth_state = state.pending.issue().await;
    match homeconnect_auth::build_authorization_url(
        &state.authorize_url,
        state.tokens.credentials(),
        &oauth_state,
    ) {
        Ok(url) => {
            info!("redirecting operator to authorization page");
            Redirect::to(&url).into_response()
        }
        Err(e) => {
            warn!(error = %e, "cannot build authorization URL");
            text(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Query parameters of the vendor callback.
#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// GET /proxy/auth/redirect: exchange the authorization code.
pub async fn redirect_handler(
    State(state): State<AuthFlowState>,
    Query(params): Query<CallbackParams>,
) -> Response {
    if let Some(error) = params.error {
        let description = params.error_description.unwrap_or_default();
        warn!(%error, %description, "authorization denied by vendor");
        return text(
            StatusCode::BAD_REQUEST,
            format!("authorization failed: {error} {description}"),
        );
    }

    let Some(oauth_state) = params.state else {
        return text(StatusCode::BAD_REQUEST, "missing state parameter");
    };
    if !state.pending.consume(&oauth_state).await {
        warn!("authorization callback with unknown or expired state");
        return text(
            StatusCode::BAD_REQUEST,
            "unknown or expired state, restart the flow at /proxy/auth",
        );
    }

    let Some(code) = params.code.filter(|c| !c.is_empty()) else {
        return text(StatusCode::BAD_REQUEST, "missing code parameter");
    };

    match state.tokens.exchange_code(&code).await {
        Ok(_) => Redirect::to("/proxy/success").into_response(),
        Err(e @ AuthError::Persistence(_)) => {
            warn!(error = %e, "token obtained but could not be stored");
            text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("error storing token: {e}"),
            )
        }
        Err(e) => {
            warn!(error = %e, "authorization code exchange failed");
            text(StatusCode::BAD_GATEWAY, format!("error getting token: {e}"))
        }
    }
}

/// GET /proxy/success
pub async fn success_handler() -> &'static str {
    "authorization completed"
}
