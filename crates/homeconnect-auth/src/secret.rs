//! OAuth client secret wrapper

use std::fmt;
use zeroize::Zeroize;

/// The application's client secret. Redacted in Debug/Display and wiped
/// from memory on drop.
#[derive(Clone)]
pub struct ClientSecret(String);

impl ClientSecret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Raw value, only for building token endpoint requests.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for ClientSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ClientSecret([REDACTED])")
    }
}

impl fmt::Display for ClientSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Drop for ClientSecret {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

/// Identity of the single registered application. Loaded once at startup
/// and shared read-only by the token manager and the authorization flow.
#[derive(Debug, Clone)]
pub struct ClientCredentials {
    pub client_id: String,
    pub client_secret: ClientSecret,
    /// Space separated scope list, e.g. `IdentifyAppliance Monitor`
    pub scopes: String,
    /// Only sent when the application registered more than one redirect URI.
    pub redirect_uri: Option<String>,
}
