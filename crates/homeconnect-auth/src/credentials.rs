//! Credential storage for the single OAuth token
//!
//! The store holds exactly one `Token` record and has no business logic.
//! Writes go through a temp file + rename so a failed save never leaves a
//! partially written record behind. There is no locking here: every caller
//! is serialized by the `TokenManager`.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;

use tracing::debug;

use crate::error::{Error, Result};
use crate::token::Token;

/// Load/save interface for the persisted token.
///
/// Uses `Pin<Box<dyn Future>>` return types so the manager can hold an
/// `Arc<dyn CredentialStore>`.
pub trait CredentialStore: Send + Sync {
    /// Read the stored token. Returns `Error::NotFound` when nothing has
    /// been stored yet.
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Token>> + Send + '_>>;

    /// Replace the stored token in full.
    fn save<'a>(&'a self, token: &'a Token) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;
}

/// JSON file holding the serialized token (`data/token.cache` by default).
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CredentialStore for FileCredentialStore {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Token>> + Send + '_>> {
        Box::pin(async move {
            let contents = match tokio::fs::read_to_string(&self.path).await {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(Error::NotFound(format!(
                        "no token cache at {}",
                        self.path.display()
                    )));
                }
                Err(e) => {
                    return Err(Error::Persistence(format!("reading token cache: {e}")));
                }
            };
            serde_json::from_str(&contents)
                .map_err(|e| Error::Persistence(format!("parsing token cache: {e}")))
        })
    }

    fn save<'a>(&'a self, token: &'a Token) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(write_atomic(&self.path, token))
    }
}

/// Write the token to a file atomically.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. File permissions are 0600 since the file holds OAuth tokens.
async fn write_atomic(path: &Path, token: &Token) -> Result<()> {
    let json = serde_json::to_string_pretty(token)
        .map_err(|e| Error::Persistence(format!("serializing token: {e}")))?;

    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d.to_path_buf(),
        _ => PathBuf::from("."),
    };
    tokio::fs::create_dir_all(&dir)
        .await
        .map_err(|e| Error::Persistence(format!("creating token directory: {e}")))?;

    let tmp_path = dir.join(format!(".token.tmp.{}", std::process::id()));

    if let Err(e) = tokio::fs::write(&tmp_path, json.as_bytes()).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(Error::Persistence(format!("writing temp token file: {e}")));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Persistence(format!("setting token file permissions: {e}")))?;
    }

    if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(Error::Persistence(format!("renaming temp token file: {e}")));
    }

    debug!(path = %path.display(), "persisted token");
    Ok(())
}

/// In-process store. Starts empty unless seeded.
#[derive(Default)]
pub struct MemoryCredentialStore {
    token: Mutex<Option<Token>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: Token) -> Self {
        Self {
            token: Mutex::new(Some(token)),
        }
    }

    /// Snapshot of the stored token.
    pub fn current(&self) -> Option<Token> {
        self.token.lock().map(|t| t.clone()).unwrap_or_default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load(&self) -> Pin<Box<dyn Future<Output = Result<Token>> + Send + '_>> {
        let current = self.current();
        Box::pin(async move { current.ok_or_else(|| Error::NotFound("no token stored".into())) })
    }

    fn save<'a>(&'a self, token: &'a Token) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        let result = self
            .token
            .lock()
            .map(|mut slot| *slot = Some(token.clone()))
            .map_err(|_| Error::Persistence("memory store poisoned".into()));
        Box::pin(async move { result })
    }
}
