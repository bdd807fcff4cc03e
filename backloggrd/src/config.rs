use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;

use crate::session::{TokenBackend, default_config_dir};
use crate::store::default_db_path;
use crate::sync::{Backoff, DEFAULT_MAX_ATTEMPTS};

const DEFAULT_BASE_URL: &str = "http://localhost:3000/";
const DEFAULT_SYNC_SECS: u64 = 30;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;
const DEFAULT_BACKOFF_BASE_MS: u64 = 2_000;
const DEFAULT_BACKOFF_MAX_SECS: u64 = 300;
const DEFAULT_LIBRARY_PAGE_SIZE: u64 = 1_000;

#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub base_url: String,
    pub db_path: PathBuf,
    pub config_dir: PathBuf,
    pub sync_interval: Duration,
    pub http_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub library_page_size: u32,
    pub force_offline: bool,
    pub token_override: Option<String>,
    pub token_backend: TokenBackend,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let home = dirs::home_dir();
        let expand = |value: String| match &home {
            Some(home) => expand_with_home(&value, home),
            None => PathBuf::from(value),
        };

        let db_path = match lookup("BACKLOGGR_DB_PATH").filter(|value| !value.trim().is_empty()) {
            Some(value) => expand(value),
            None => default_db_path().context("cannot resolve the database location")?,
        };
        let config_dir =
            match lookup("BACKLOGGR_CONFIG_DIR").filter(|value| !value.trim().is_empty()) {
                Some(value) => expand(value),
                None => default_config_dir().context("cannot resolve the config directory")?,
            };

        let token_backend = match lookup("BACKLOGGR_TOKEN_BACKEND") {
            Some(value) => TokenBackend::parse(&value).unwrap_or_else(|| {
                tracing::warn!(value = %value, "unknown token backend, using keyring");
                TokenBackend::Keyring
            }),
            None => TokenBackend::Keyring,
        };

        Ok(Self {
            base_url: lookup("BACKLOGGR_BASE_URL")
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            db_path,
            config_dir,
            sync_interval: Duration::from_secs(read_u64(
                &lookup,
                "BACKLOGGR_SYNC_SECS",
                DEFAULT_SYNC_SECS,
            )),
            http_timeout: Duration::from_secs(read_u64(
                &lookup,
                "BACKLOGGR_HTTP_TIMEOUT_SECS",
                DEFAULT_HTTP_TIMEOUT_SECS,
            )),
            max_attempts: read_u64(
                &lookup,
                "BACKLOGGR_MAX_ATTEMPTS",
                u64::from(DEFAULT_MAX_ATTEMPTS),
            )
            .min(u64::from(u32::MAX)) as u32,
            backoff_base: Duration::from_millis(read_u64(
                &lookup,
                "BACKLOGGR_BACKOFF_BASE_MS",
                DEFAULT_BACKOFF_BASE_MS,
            )),
            backoff_max: Duration::from_secs(read_u64(
                &lookup,
                "BACKLOGGR_BACKOFF_MAX_SECS",
                DEFAULT_BACKOFF_MAX_SECS,
            )),
            library_page_size: read_u64(
                &lookup,
                "BACKLOGGR_LIBRARY_PAGE_SIZE",
                DEFAULT_LIBRARY_PAGE_SIZE,
            )
            .min(u64::from(u32::MAX)) as u32,
            force_offline: read_bool(&lookup, "BACKLOGGR_OFFLINE", false),
            token_override: lookup("BACKLOGGR_TOKEN").filter(|value| !value.trim().is_empty()),
            token_backend,
        })
    }

    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.backoff_base, self.backoff_max, true)
    }
}

fn expand_with_home(value: &str, home: &Path) -> PathBuf {
    if value == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = value.strip_prefix("~/") {
        return home.join(rest);
    }
    PathBuf::from(value)
}

fn read_u64<F>(lookup: &F, name: &str, default: u64) -> u64
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(default)
}

fn read_bool<F>(lookup: &F, name: &str, default: bool) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(default)
}
