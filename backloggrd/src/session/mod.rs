mod preferences;
mod token_storage;

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

pub use preferences::{Preferences, PreferencesFile};
pub use token_storage::{TokenBackend, TokenStorage};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("keyring error: {0}")]
    Keyring(#[from] keyring::Error),
    #[error("token not found")]
    TokenNotFound,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("preferences are corrupt: {0}")]
    Json(#[from] serde_json::Error),
    #[error("XDG config directory is unavailable")]
    MissingConfigDir,
}

/// Signed-in state shared by everything that talks to the server: the
/// bearer token and the persisted preferences.
pub struct Session {
    file: PreferencesFile,
    preferences: Mutex<Preferences>,
    tokens: TokenStorage,
    token_override: Option<String>,
}

impl Session {
    pub fn open(config_dir: &Path, backend: TokenBackend) -> Result<Self, SessionError> {
        let file = PreferencesFile::new(config_dir);
        let tokens = TokenStorage::new(backend, file.clone());
        Self::with_storage(file, tokens)
    }

    pub fn with_storage(file: PreferencesFile, tokens: TokenStorage) -> Result<Self, SessionError> {
        let preferences = match file.load() {
            Ok(preferences) => preferences,
            Err(SessionError::Json(err)) => {
                tracing::warn!(path = %file.path().display(), "resetting corrupt preferences: {err}");
                Preferences::default()
            }
            Err(err) => return Err(err),
        };
        Ok(Self {
            file,
            preferences: Mutex::new(preferences),
            tokens,
            token_override: None,
        })
    }

    /// Use this token instead of the stored one.
    pub fn with_token_override(mut self, token: Option<String>) -> Self {
        self.token_override = token.filter(|token| !token.trim().is_empty());
        self
    }

    pub fn token(&self) -> Result<Option<String>, SessionError> {
        if let Some(token) = &self.token_override {
            return Ok(Some(token.clone()));
        }
        match self.tokens.get_token() {
            Ok(token) => Ok(Some(token)),
            Err(SessionError::TokenNotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self.token(), Ok(Some(_)))
    }

    pub fn save_token(&self, token: &str) -> Result<(), SessionError> {
        self.tokens.save_token(token)?;
        // The file backend rewrote the document underneath us.
        if self.tokens.backend() == TokenBackend::File {
            *self.lock() = self.file.load()?;
        }
        Ok(())
    }

    pub fn preferences(&self) -> Preferences {
        self.lock().clone()
    }

    /// Applies `change` and persists the result.
    pub fn update_preferences<F>(&self, change: F) -> Result<Preferences, SessionError>
    where
        F: FnOnce(&mut Preferences),
    {
        let mut preferences = self.lock();
        let mut next = preferences.clone();
        change(&mut next);
        if next != *preferences {
            self.file.save(&next)?;
            *preferences = next;
        }
        Ok(preferences.clone())
    }

    pub fn cache_profile_image(&self, bytes: &[u8]) -> Result<(), SessionError> {
        let encoded = STANDARD.encode(bytes);
        self.update_preferences(|prefs| prefs.profile_image_cache = Some(encoded))?;
        Ok(())
    }

    /// The cached avatar, or `None` when absent or undecodable.
    pub fn profile_image(&self) -> Option<Vec<u8>> {
        let encoded = self.lock().profile_image_cache.clone()?;
        match STANDARD.decode(encoded.trim()) {
            Ok(bytes) => Some(bytes),
            Err(err) => {
                tracing::debug!("cached profile image is not valid base64: {err}");
                None
            }
        }
    }

    /// Forgets the token and account caches. The caller wipes the store.
    pub fn logout(&self) -> Result<(), SessionError> {
        self.tokens.delete_token()?;
        self.update_preferences(Preferences::clear_account_caches)?;
        tracing::info!("session cleared");
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Preferences> {
        self.preferences
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn default_config_dir() -> Result<PathBuf, SessionError> {
    let base = dirs::config_dir().ok_or(SessionError::MissingConfigDir)?;
    Ok(base.join("backloggr"))
}
