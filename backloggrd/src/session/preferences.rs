use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use backloggr_core::PrivacySettings;
use serde::{Deserialize, Serialize};

use super::SessionError;

const PREFERENCES_FILENAME: &str = "preferences.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Preferences {
    /// Base64 of the last downloaded avatar.
    pub profile_image_cache: Option<String>,
    pub dark_mode: bool,
    pub analytics_enabled: bool,
    pub notifications_enabled: bool,
    pub push_token: Option<String>,
    pub push_token_sent: bool,
    /// Last privacy settings seen on the server.
    pub privacy: PrivacySettings,
    /// Only used by the file token backend.
    pub auth_token: Option<String>,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            profile_image_cache: None,
            dark_mode: true,
            analytics_enabled: false,
            notifications_enabled: true,
            push_token: None,
            push_token_sent: false,
            privacy: PrivacySettings::default(),
            auth_token: None,
        }
    }
}

impl Preferences {
    /// Drops everything tied to the signed-in account.
    pub fn clear_account_caches(&mut self) {
        self.profile_image_cache = None;
        self.push_token_sent = false;
        self.privacy = PrivacySettings::default();
        self.auth_token = None;
    }
}

#[derive(Debug, Clone)]
pub struct PreferencesFile {
    path: PathBuf,
}

impl PreferencesFile {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            path: config_dir.join(PREFERENCES_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing file means defaults; a corrupt one is reported.
    pub fn load(&self) -> Result<Preferences, SessionError> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Preferences::default()),
            Err(err) => Err(err.into()),
        }
    }

    /// Writes to a sibling temp file and renames it over the old one.
    pub fn save(&self, preferences: &Preferences) -> Result<(), SessionError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let payload = serde_json::to_vec_pretty(preferences)?;
        let tmp_path = self.path.with_extension("json.tmp");

        // A leftover temp file would keep its old mode, so start fresh.
        match fs::remove_file(&tmp_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(&tmp_path)?;
        file.write_all(&payload)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&tmp_path, &self.path)?;
        Ok(())
    }
}
