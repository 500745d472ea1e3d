//! Error types for the credential lifecycle

/// Errors from token acquisition, refresh and persistence.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No credential has ever been stored; the operator must complete the
    /// authorization-code flow.
    #[error("no credential stored, authorize the application via /proxy/auth")]
    NeedsAuthorization,

    /// The stored access token expired and there is no refresh token to
    /// mint a new one.
    #[error("refresh token not found, please re-authorize the application")]
    ReauthorizationRequired,

    /// The token endpoint rejected the request.
    #[error("token endpoint returned {status}: {body}")]
    UpstreamAuth { status: u16, body: String },

    /// The token endpoint could not be reached.
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("invalid token response: {0}")]
    InvalidTokenResponse(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("credential persistence failed: {0}")]
    Persistence(String),

    /// A configured endpoint or client setting is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether the operator has to run the authorization flow again before
    /// any upstream call can succeed.
    pub fn requires_authorization(&self) -> bool {
        matches!(self, Error::NeedsAuthorization | Error::ReauthorizationRequired)
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_auth_display_carries_body() {
        let err = Error::UpstreamAuth {
            status: 400,
            body: r#"{"error":"invalid_grant"}"#.into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("400"), "got: {msg}");
        assert!(msg.contains("invalid_grant"), "got: {msg}");
    }

    #[test]
    fn authorization_errors_are_flagged() {
        assert!(Error::NeedsAuthorization.requires_authorization());
        assert!(Error::ReauthorizationRequired.requires_authorization());
        assert!(!Error::Http("refused".into()).requires_authorization());
        assert!(!Error::Persistence("disk full".into()).requires_authorization());
        assert!(!Error::Config("bad url".into()).requires_authorization());
    }
}
