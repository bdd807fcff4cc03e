use keyring::Entry;

use super::SessionError;
use super::preferences::PreferencesFile;

const SERVICE_NAME: &str = "app.backloggr";
const TOKEN_KEY: &str = "backloggr_token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TokenBackend {
    #[default]
    Keyring,
    File,
}

impl TokenBackend {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "keyring" => Some(TokenBackend::Keyring),
            "file" => Some(TokenBackend::File),
            _ => None,
        }
    }
}

pub struct TokenStorage {
    backend: Backend,
}

enum Backend {
    Keyring(Entry),
    File(PreferencesFile),
}

impl TokenStorage {
    /// Falls back to the preferences file when no keyring is reachable.
    pub fn new(preference: TokenBackend, file: PreferencesFile) -> Self {
        match preference {
            TokenBackend::File => Self::file(file),
            TokenBackend::Keyring => match Entry::new(SERVICE_NAME, TOKEN_KEY) {
                Ok(entry) => Self::with_entry(entry, file),
                Err(err) => {
                    tracing::warn!("keyring unavailable, storing token in preferences: {err}");
                    Self::file(file)
                }
            },
        }
    }

    /// Entry creation succeeds even without a secret service, so one read
    /// decides whether the keyring is actually usable.
    fn with_entry(entry: Entry, file: PreferencesFile) -> Self {
        let backend = match entry.get_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => Backend::Keyring(entry),
            Err(err) => {
                tracing::warn!("keyring not answering, storing token in preferences: {err}");
                Backend::File(file)
            }
        };
        Self { backend }
    }

    pub fn file(file: PreferencesFile) -> Self {
        Self {
            backend: Backend::File(file),
        }
    }

    pub fn backend(&self) -> TokenBackend {
        match self.backend {
            Backend::Keyring(_) => TokenBackend::Keyring,
            Backend::File(_) => TokenBackend::File,
        }
    }

    pub fn save_token(&self, token: &str) -> Result<(), SessionError> {
        match &self.backend {
            Backend::Keyring(entry) => {
                entry.set_password(token)?;
                Ok(())
            }
            Backend::File(file) => {
                let mut prefs = file.load()?;
                prefs.auth_token = Some(token.to_string());
                file.save(&prefs)
            }
        }
    }

    pub fn get_token(&self) -> Result<String, SessionError> {
        match &self.backend {
            Backend::Keyring(entry) => match entry.get_password() {
                Ok(token) => Ok(token),
                Err(keyring::Error::NoEntry) => Err(SessionError::TokenNotFound),
                Err(err) => Err(SessionError::Keyring(err)),
            },
            Backend::File(file) => file
                .load()?
                .auth_token
                .filter(|token| !token.is_empty())
                .ok_or(SessionError::TokenNotFound),
        }
    }

    pub fn delete_token(&self) -> Result<(), SessionError> {
        match &self.backend {
            Backend::Keyring(entry) => match entry.delete_credential() {
                Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
                Err(err) => Err(SessionError::Keyring(err)),
            },
            Backend::File(file) => {
                let mut prefs = file.load()?;
                if prefs.auth_token.take().is_some() {
                    file.save(&prefs)?;
                }
                Ok(())
            }
        }
    }

    pub fn has_token(&self) -> bool {
        self.get_token().is_ok()
    }
}
