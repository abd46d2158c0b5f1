//! Auth credential handling
//!
//! The credential is resolved once when a conversation is selected and then
//! passed explicitly to every backend and transport call.

use crate::config::{Config, TOKEN_ENV_VAR};
use crate::error::{Error, Result};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::warn;

/// Bearer token issued by the backend
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    /// Returns `None` for blank tokens
    pub fn new(token: impl Into<String>) -> Option<Self> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            None
        } else {
            Some(Self(token))
        }
    }

    pub fn token(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential(<{} chars>)", self.0.len())
    }
}

/// Anything that can hand out the current credential
pub trait CredentialSource: Send + Sync {
    fn resolve(&self) -> Option<Credential>;
}

/// Fixed credential (or none), for embedding and tests
#[derive(Debug, Clone, Default)]
pub struct StaticCredential(pub Option<Credential>);

impl CredentialSource for StaticCredential {
    fn resolve(&self) -> Option<Credential> {
        self.0.clone()
    }
}

/// Token persisted in the config directory, with an environment override
pub struct TokenStore {
    path: PathBuf,
    env_token: Option<String>,
}

impl TokenStore {
    pub fn new(config: &Config) -> Self {
        Self {
            path: config.token_file.clone(),
            env_token: std::env::var(TOKEN_ENV_VAR).ok(),
        }
    }

    /// Store that only reads the file (ignores the environment)
    pub fn at(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            env_token: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the stored token; the environment override wins
    pub fn load(&self) -> Result<Option<Credential>> {
        if let Some(cred) = self.env_token.as_deref().and_then(Credential::new) {
            return Ok(Some(cred));
        }

        if !self.path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path)?;
        Ok(Credential::new(content))
    }

    /// Save token to disk atomically
    pub fn save(&self, credential: &Credential) -> Result<()> {
        let parent = self.path.parent().unwrap_or(Path::new("."));
        fs::create_dir_all(parent)?;

        // Write to temp file in same directory (for atomic rename)
        let mut temp = NamedTempFile::new_in(parent)?;
        temp.write_all(credential.token().as_bytes())?;
        temp.as_file().sync_all()?;

        temp.persist(&self.path).map_err(|e| Error::Io(e.error))?;

        Ok(())
    }

    /// Forget the stored token. Returns whether one existed.
    pub fn clear(&self) -> Result<bool> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl CredentialSource for TokenStore {
    fn resolve(&self) -> Option<Credential> {
        match self.load() {
            Ok(cred) => cred,
            Err(e) => {
                warn!("Could not read token from {}: {}", self.path.display(), e);
                None
            }
        }
    }
}
