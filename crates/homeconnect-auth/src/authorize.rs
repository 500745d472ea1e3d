//! Authorization URL for the operator-initiated code flow
//!
//! The operator opens `/proxy/auth`, is redirected to the vendor's
//! authorization page, and comes back to the redirect endpoint with a
//! `code` and the `state` generated here.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;

use crate::error::{Error, Result};
use crate::secret::ClientCredentials;

/// Generate an opaque, URL-safe `state` value for CSRF protection.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build the authorization URL with properly encoded query parameters.
pub fn build_authorization_url(
    authorize_url: &str,
    credentials: &ClientCredentials,
    state: &str,
) -> Result<String> {
    let mut url = reqwest::Url::parse(authorize_url)
        .map_err(|e| Error::Config(format!("invalid authorize URL: {e}")))?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("client_id", &credentials.client_id)
            .append_pair("response_type", "code")
            .append_pair("scope", &credentials.scopes)
            .append_pair("state", state);
        if let Some(redirect_uri) = credentials.redirect_uri.as_deref() {
            query.append_pair("redirect_uri", redirect_uri);
        }
    }
    Ok(url.into())
}
