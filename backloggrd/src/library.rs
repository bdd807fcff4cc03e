use std::path::Path;
use std::sync::Arc;

use backloggr_core::{
    ApiError, CatalogGame, GameStatus, PrivacySettings, PrivacyUpdate, ProfileUpdate,
    SettingField, UserProfile,
};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::connectivity::Connectivity;
use crate::session::{Session, SessionError};
use crate::store::{
    EntryField, LibraryEntry, LocalStore, OperationKind, Removal, Statistics, StoreError,
    format_hours, now_rfc3339,
};
use crate::sync::{EngineError, SyncEngine, SyncReport};

pub const MIN_SEARCH_LEN: usize = 2;

#[derive(Debug, Error)]
pub enum LibraryError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sync error: {0}")]
    Engine(#[from] EngineError),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("api error: {0}")]
    Api(ApiError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not signed in")]
    NotAuthenticated,
    #[error("no network connection")]
    Offline,
    #[error("library entry {0} does not exist")]
    UnknownEntry(i64),
    #[error("library entry {0} has not reached the server yet")]
    NotSynced(i64),
    #[error("game {igdb_game_id} is already in the library as entry {library_id}")]
    AlreadyInLibrary { igdb_game_id: i64, library_id: i64 },
    #[error("hours played must be a non-negative number, got {0}")]
    InvalidHours(f64),
    #[error("rating must be a non-negative number, got {0}")]
    InvalidRating(f64),
}

impl From<ApiError> for LibraryError {
    fn from(err: ApiError) -> Self {
        if err.is_auth() {
            LibraryError::NotAuthenticated
        } else {
            LibraryError::Api(err)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum CatalogSearch {
    Remote(Vec<CatalogGame>),
    /// Offline fallback over the cached library.
    Local(Vec<LibraryEntry>),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub stored: usize,
    /// Rows with queued local edits that were left alone.
    pub skipped: usize,
}

/// Optimistic library mutations and cached reads.
///
/// Every mutation lands in the local store and the operation queue first;
/// when the device is online the affected entry's queue is flushed right away.
pub struct LibraryService<C> {
    store: Arc<LocalStore>,
    engine: Arc<SyncEngine<C>>,
    session: Arc<Session>,
    page_size: u32,
}

impl<C: Connectivity> LibraryService<C> {
    pub fn new(store: Arc<LocalStore>, engine: Arc<SyncEngine<C>>, session: Arc<Session>) -> Self {
        Self {
            store,
            engine,
            session,
            page_size: 1_000,
        }
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn library(&self, status: Option<GameStatus>) -> Result<Vec<LibraryEntry>, LibraryError> {
        let entries = match status {
            Some(status) => self.store.list_entries_by_status(status).await?,
            None => self.store.list_entries().await?,
        };
        Ok(entries)
    }

    /// Looks an entry up, following a temporary id to its server id.
    pub async fn entry(&self, id: i64) -> Result<LibraryEntry, LibraryError> {
        if let Some(entry) = self.store.get_entry(id).await? {
            return Ok(entry);
        }
        if id < 0
            && let Some(server_id) = self.store.remapped_id(id).await?
            && let Some(entry) = self.store.get_entry(server_id).await?
        {
            return Ok(entry);
        }
        Err(LibraryError::UnknownEntry(id))
    }

    pub async fn add_game(
        &self,
        igdb_game_id: i64,
        status: GameStatus,
    ) -> Result<LibraryEntry, LibraryError> {
        if let Some(existing) = self.find_by_game(igdb_game_id).await? {
            return Err(LibraryError::AlreadyInLibrary {
                igdb_game_id,
                library_id: existing.id,
            });
        }

        let details = self.cached_details(igdb_game_id).await.unwrap_or_default();
        let temp_id = self.store.next_temporary_id().await?;
        let entry = LibraryEntry::new_local(temp_id, igdb_game_id, status, details, &now_rfc3339());
        self.store.upsert_entry(&entry).await?;
        self.store
            .enqueue_operation(
                temp_id,
                OperationKind::Add,
                &json!({
                    "igdb_game_id": igdb_game_id,
                    "status": status.as_str(),
                    "local_library_id": temp_id,
                }),
            )
            .await?;
        tracing::info!(library_id = temp_id, igdb_game_id, "game added locally");

        self.flush(temp_id).await;
        // The flush may have moved the row to its server id.
        let current = self.store.remapped_id(temp_id).await?.unwrap_or(temp_id);
        Ok(self.store.get_entry(current).await?.unwrap_or(entry))
    }

    pub async fn update_status(&self, id: i64, status: GameStatus) -> Result<i64, LibraryError> {
        self.apply_edit(id, EntryField::Status(status)).await
    }

    pub async fn update_hours(&self, id: i64, hours: f64) -> Result<i64, LibraryError> {
        if !hours.is_finite() || hours < 0.0 {
            return Err(LibraryError::InvalidHours(hours));
        }
        self.apply_edit(id, EntryField::HoursPlayed(format_hours(hours)))
            .await
    }

    pub async fn update_notes(&self, id: i64, notes: &str) -> Result<i64, LibraryError> {
        self.apply_edit(id, EntryField::Notes(notes.to_string()))
            .await
    }

    pub async fn update_rating(&self, id: i64, rating: Option<f64>) -> Result<i64, LibraryError> {
        if let Some(value) = rating
            && (!value.is_finite() || value < 0.0)
        {
            return Err(LibraryError::InvalidRating(value));
        }
        self.apply_edit(id, EntryField::Rating(rating)).await
    }

    /// Returns the id the edit landed on, which differs from `id` when a
    /// temporary id was replaced by its server id meanwhile.
    async fn apply_edit(&self, id: i64, field: EntryField) -> Result<i64, LibraryError> {
        let target = self
            .store
            .edit_entry(id, &field)
            .await?
            .ok_or(LibraryError::UnknownEntry(id))?;
        self.flush(target).await;
        Ok(target)
    }

    pub async fn remove_game(&self, id: i64) -> Result<(), LibraryError> {
        match self.store.remove_entry(id).await? {
            None => Err(LibraryError::UnknownEntry(id)),
            Some(Removal::LocalOnly { id, dropped }) => {
                tracing::info!(library_id = id, dropped, "unsynced game removed");
                Ok(())
            }
            Some(Removal::Queued { id, op_id }) => {
                tracing::info!(library_id = id, op_id, "game removed locally");
                self.flush(id).await;
                Ok(())
            }
        }
    }

    /// Re-reads one synced entry from the server unless local edits for it
    /// are still queued. Falls back to the cached row.
    pub async fn refresh_entry(&self, id: i64) -> Result<LibraryEntry, LibraryError> {
        let cached = self.store.get_entry(id).await?;
        if id < 0 || !self.engine.is_online().await {
            return cached.ok_or(LibraryError::UnknownEntry(id));
        }
        if !self.store.list_pending_for_entry(id).await?.is_empty() {
            return cached.ok_or(LibraryError::UnknownEntry(id));
        }
        match self.engine.client().get_library_entry(id).await {
            Ok(remote) => {
                let mut entry = LibraryEntry::from_remote(remote);
                if entry.game_details.is_empty()
                    && let Some(cached) = cached
                {
                    entry.game_details = cached.game_details;
                }
                self.store.upsert_entry(&entry).await?;
                Ok(entry)
            }
            Err(err) if err.is_auth() => Err(LibraryError::NotAuthenticated),
            Err(err) if err.status().is_some_and(|status| status.as_u16() == 404) => {
                self.store.delete_entry(id).await?;
                tracing::info!(library_id = id, "entry gone on server, dropped locally");
                Err(LibraryError::UnknownEntry(id))
            }
            Err(err) => {
                tracing::warn!(library_id = id, "entry fetch failed, using cache: {err}");
                cached.ok_or(LibraryError::Api(err))
            }
        }
    }

    /// Catalog details, fetched when online and cached for offline use.
    pub async fn game_details(
        &self,
        igdb_game_id: i64,
    ) -> Result<Option<Map<String, Value>>, LibraryError> {
        if self.engine.is_online().await {
            match self.engine.client().get_game(igdb_game_id).await {
                Ok(details) => {
                    self.store.put_catalog(igdb_game_id, &details).await?;
                    return Ok(Some(details));
                }
                Err(err) if err.is_auth() => return Err(LibraryError::NotAuthenticated),
                Err(err) => {
                    tracing::warn!(igdb_game_id, "game details fetch failed, using cache: {err}");
                }
            }
        }
        Ok(self.cached_details(igdb_game_id).await)
    }

    pub async fn search_catalog(&self, query: &str) -> Result<CatalogSearch, LibraryError> {
        let query = query.trim();
        if !self.engine.is_online().await {
            return Ok(CatalogSearch::Local(self.store.search_entries(query, None).await?));
        }
        if query.chars().count() < MIN_SEARCH_LEN {
            return Ok(CatalogSearch::Remote(Vec::new()));
        }
        match self.engine.client().search_games(query).await {
            Ok(games) => Ok(CatalogSearch::Remote(games)),
            Err(err) if err.is_auth() => Err(LibraryError::NotAuthenticated),
            Err(err) => {
                tracing::warn!("catalog search failed, searching library instead: {err}");
                Ok(CatalogSearch::Local(self.store.search_entries(query, None).await?))
            }
        }
    }

    /// Pulls the whole server library into the store.
    pub async fn refresh_library(&self) -> Result<RefreshSummary, LibraryError> {
        if !self.engine.is_online().await {
            return Err(LibraryError::Offline);
        }
        let remote = self.engine.client().list_library_all(self.page_size).await?;
        let pending = self.store.entries_with_pending_operations().await?;

        let mut summary = RefreshSummary::default();
        for row in remote {
            if pending.contains(&row.id) {
                summary.skipped += 1;
                continue;
            }
            self.store.upsert_entry(&LibraryEntry::from_remote(row)).await?;
            summary.stored += 1;
        }
        tracing::info!(stored = summary.stored, skipped = summary.skipped, "library refreshed");
        Ok(summary)
    }

    /// Server statistics when reachable, otherwise the cached or locally
    /// computed figures.
    pub async fn refresh_statistics(&self) -> Result<Statistics, LibraryError> {
        let cached = self.store.get_statistics().await?;
        if self.engine.is_online().await {
            match self.engine.client().get_statistics().await {
                Ok(remote) => {
                    let fallback_user = cached.as_ref().map(|stats| stats.user_id).unwrap_or(0);
                    let stats = Statistics::from_remote(remote, fallback_user, &now_rfc3339());
                    self.store.put_statistics(&stats).await?;
                    return Ok(stats);
                }
                Err(err) if err.is_auth() => return Err(LibraryError::NotAuthenticated),
                Err(err) => tracing::warn!("statistics fetch failed, using local data: {err}"),
            }
        }
        match cached {
            Some(stats) => Ok(stats),
            None => Ok(self.store.compute_local_statistics().await?),
        }
    }

    /// Full sync pass, run whenever the app comes to the foreground.
    pub async fn on_resume(&self) -> Result<SyncReport, LibraryError> {
        Ok(self.engine.sync_pending().await?)
    }

    pub async fn upload_screenshot(&self, id: i64, file: &Path) -> Result<Value, LibraryError> {
        if id < 0 {
            return Err(LibraryError::NotSynced(id));
        }
        self.entry(id).await?;
        if !self.engine.is_online().await {
            return Err(LibraryError::Offline);
        }
        let bytes = tokio::fs::read(file).await?;
        let file_name = file
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("screenshot")
            .to_string();
        let response = self
            .engine
            .client()
            .upload_screenshot(id, &file_name, image_mime(file), bytes)
            .await?;
        Ok(response)
    }

    /// Refreshes the signed-in profile and mirrors its switches locally.
    pub async fn refresh_profile(&self) -> Result<UserProfile, LibraryError> {
        if !self.engine.is_online().await {
            return Err(LibraryError::Offline);
        }
        let profile = self.engine.client().get_profile().await?;
        self.mirror_profile(&profile, false)?;
        Ok(profile)
    }

    /// Needs the network. A new avatar drops the cached image.
    pub async fn update_profile(
        &self,
        update: &ProfileUpdate,
    ) -> Result<UserProfile, LibraryError> {
        if !self.engine.is_online().await {
            return Err(LibraryError::Offline);
        }
        let profile = self.engine.client().update_profile(update).await?;
        self.mirror_profile(&profile, update.profile_image.is_some())?;
        tracing::info!(user_id = profile.id, "profile updated");
        Ok(profile)
    }

    fn mirror_profile(&self, profile: &UserProfile, drop_avatar: bool) -> Result<(), LibraryError> {
        self.session.update_preferences(|prefs| {
            if let Some(dark_mode) = profile.dark_mode {
                prefs.dark_mode = dark_mode;
            }
            if let Some(analytics) = profile.analytics_enabled {
                prefs.analytics_enabled = analytics;
            }
            if let Some(notifications) = profile.notifications_enabled {
                prefs.notifications_enabled = notifications;
            }
            if drop_avatar {
                prefs.profile_image_cache = None;
            }
        })?;
        Ok(())
    }

    /// Server privacy settings when reachable, else the last cached copy.
    pub async fn privacy_settings(&self) -> Result<PrivacySettings, LibraryError> {
        if self.engine.is_online().await {
            match self.engine.client().get_privacy_settings().await {
                Ok(settings) => {
                    self.session.update_preferences(|prefs| prefs.privacy = settings)?;
                    return Ok(settings);
                }
                Err(err) if err.is_auth() => return Err(LibraryError::NotAuthenticated),
                Err(err) => tracing::warn!("privacy settings fetch failed, using cache: {err}"),
            }
        }
        Ok(self.session.preferences().privacy)
    }

    /// Privacy changes are only cached once the server accepted them.
    pub async fn update_privacy(
        &self,
        update: PrivacyUpdate,
    ) -> Result<PrivacySettings, LibraryError> {
        if !self.engine.is_online().await {
            return Err(LibraryError::Offline);
        }
        self.engine.client().update_privacy_setting(update).await?;
        let prefs = self
            .session
            .update_preferences(|prefs| update.apply_to(&mut prefs.privacy))?;
        tracing::info!(field = update.field(), "privacy setting updated");
        Ok(prefs.privacy)
    }

    /// Stores the switch locally and pushes it to the account when online.
    pub async fn update_setting(&self, field: SettingField, value: bool) -> Result<(), LibraryError> {
        self.session.update_preferences(|prefs| match field {
            SettingField::DarkMode => prefs.dark_mode = value,
            SettingField::AnalyticsEnabled => prefs.analytics_enabled = value,
            SettingField::NotificationsEnabled => prefs.notifications_enabled = value,
        })?;
        if !self.engine.is_online().await {
            return Ok(());
        }
        match self.engine.client().update_setting(field, value).await {
            Ok(()) => Ok(()),
            Err(err) if err.is_auth() => Err(LibraryError::NotAuthenticated),
            Err(err) => {
                tracing::warn!(field = field.as_str(), "setting kept locally only: {err}");
                Ok(())
            }
        }
    }

    /// Registers or withdraws the push token so the server matches the
    /// notification switch. Returns whether the server now holds the token.
    pub async fn sync_push_token(&self, token: Option<&str>) -> Result<bool, LibraryError> {
        let prefs = self.session.update_preferences(|prefs| {
            if let Some(token) = token
                && prefs.push_token.as_deref() != Some(token)
            {
                prefs.push_token = Some(token.to_string());
                prefs.push_token_sent = false;
            }
        })?;
        if !self.engine.is_online().await {
            return Ok(prefs.push_token_sent);
        }

        let client = self.engine.client();
        match (prefs.notifications_enabled, prefs.push_token.as_deref()) {
            (true, Some(token)) if !prefs.push_token_sent => {
                client.register_push_token(token).await?;
                self.session
                    .update_preferences(|prefs| prefs.push_token_sent = true)?;
                tracing::info!("push token registered");
                Ok(true)
            }
            (false, _) if prefs.push_token_sent => {
                client.remove_push_token().await?;
                self.session
                    .update_preferences(|prefs| prefs.push_token_sent = false)?;
                tracing::info!("push token withdrawn");
                Ok(false)
            }
            _ => Ok(prefs.push_token_sent),
        }
    }

    async fn flush(&self, library_id: i64) {
        match self.engine.flush_entry(library_id).await {
            Ok(report) if report.auth_required => {
                tracing::warn!(library_id, "change queued, server requires a new sign-in");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(library_id, "change queued, immediate sync failed: {err}"),
        }
    }

    async fn cached_details(&self, igdb_game_id: i64) -> Option<Map<String, Value>> {
        match self.store.get_catalog(igdb_game_id).await {
            Ok(cached) => cached.map(|entry| entry.data),
            Err(err) => {
                tracing::warn!(igdb_game_id, "ignoring unreadable catalog cache: {err}");
                None
            }
        }
    }

    async fn find_by_game(&self, igdb_game_id: i64) -> Result<Option<LibraryEntry>, LibraryError> {
        Ok(self
            .store
            .list_entries()
            .await?
            .into_iter()
            .find(|entry| entry.igdb_game_id == igdb_game_id))
    }
}

fn image_mime(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "image/jpeg",
    }
}

#[cfg(test)]
#[path = "library_tests.rs"]
mod tests;
