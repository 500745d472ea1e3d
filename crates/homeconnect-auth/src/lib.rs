//! Home Connect OAuth credential lifecycle
//!
//! Provides the persisted token record, the token endpoint calls, and the
//! `TokenManager` that hands out valid bearer tokens to the forwarding proxy
//! and the event bridge. This crate has no dependency on the proxy binary.
//!
//! Credential flow:
//! 1. Operator opens the URL from `authorize::build_authorization_url()`
//! 2. The redirect handler calls `TokenManager::exchange_code()`
//! 3. The token is persisted through a `CredentialStore`
//! 4. `TokenManager::get_valid_token()` refreshes it when it expires,
//!    single-flight across all concurrent callers

pub mod authorize;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod manager;
pub mod secret;
pub mod token;

pub use authorize::{build_authorization_url, generate_state};
pub use constants::*;
pub use credentials::{CredentialStore, FileCredentialStore, MemoryCredentialStore};
pub use error::{Error, Result};
pub use manager::{TokenManager, TokenStatus};
pub use secret::{ClientCredentials, ClientSecret};
pub use token::{Token, TokenResponse, epoch_seconds};
