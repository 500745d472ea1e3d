//! Home Connect OAuth and API constants
//!
//! Defaults for the vendor endpoints. Every value here can be overridden in
//! the service configuration (the simulator and the production API differ
//! only in host).

/// Authorization endpoint the operator's browser is redirected to
pub const AUTHORIZE_ENDPOINT: &str = "https://api.home-connect.com/security/oauth/authorize";

/// Token endpoint for code exchange and token refresh
pub const TOKEN_ENDPOINT: &str = "https://api.home-connect.com/security/oauth/token";

/// Base URL all forwarded REST paths are appended to
pub const API_BASE_URL: &str = "https://api.home-connect.com/api";

/// Upstream SSE stream carrying events for every paired appliance
pub const EVENTS_PATH: &str = "/homeappliances/events";

/// Seconds subtracted from `expires_in` so a token is never presented
/// to upstream in an already-expired state.
pub const EXPIRY_MARGIN_SECS: i64 = 5;

/// Lifetime assumed when the token endpoint omits `expires_in` (one year).
pub const DEFAULT_EXPIRES_IN_SECS: u64 = 31_536_000;

/// Upper bound for a single token endpoint round trip. The token manager
/// lock is held for at most this long.
pub const TOKEN_REQUEST_TIMEOUT_SECS: u64 = 10;
