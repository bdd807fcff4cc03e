use std::time::Duration;

use reqwest::{Client, StatusCode, multipart};
use serde::de::{self, DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use url::Url;

pub(crate) const DEFAULT_BASE_URL: &str = "http://localhost:3000/";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("api returned {status}: {body}")]
    Api {
        status: StatusCode,
        body: String,
        retry_after: Option<u64>,
    },
    #[error("api response missing `{0}`")]
    MissingData(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorClass {
    Auth,
    RateLimit,
    Transient,
    Permanent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Playing,
    Completed,
    Backlogged,
    OnHold,
    Dropped,
}

impl GameStatus {
    pub const ALL: [GameStatus; 5] = [
        GameStatus::Playing,
        GameStatus::Completed,
        GameStatus::Backlogged,
        GameStatus::OnHold,
        GameStatus::Dropped,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::Playing => "playing",
            GameStatus::Completed => "completed",
            GameStatus::Backlogged => "backlogged",
            GameStatus::OnHold => "on_hold",
            GameStatus::Dropped => "dropped",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == value)
    }
}

impl std::fmt::Display for GameStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingField {
    DarkMode,
    AnalyticsEnabled,
    NotificationsEnabled,
}

impl SettingField {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettingField::DarkMode => "dark_mode",
            SettingField::AnalyticsEnabled => "analytics_enabled",
            SettingField::NotificationsEnabled => "notifications_enabled",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileVisibility {
    Public,
    #[default]
    FriendsOnly,
    Private,
}

impl ProfileVisibility {
    pub const ALL: [ProfileVisibility; 3] = [
        ProfileVisibility::Public,
        ProfileVisibility::FriendsOnly,
        ProfileVisibility::Private,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProfileVisibility::Public => "public",
            ProfileVisibility::FriendsOnly => "friends_only",
            ProfileVisibility::Private => "private",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|visibility| visibility.as_str() == value)
    }
}

/// Account privacy as served by `api/auth/privacy-settings`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivacySettings {
    #[serde(default)]
    pub profile_visibility: ProfileVisibility,
    #[serde(default = "visible_by_default", deserialize_with = "de_visible_flag")]
    pub game_activity_visible: bool,
}

impl Default for PrivacySettings {
    fn default() -> Self {
        Self {
            profile_visibility: ProfileVisibility::default(),
            game_activity_visible: true,
        }
    }
}

/// One privacy switch, sent on its own like the account settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivacyUpdate {
    ProfileVisibility(ProfileVisibility),
    GameActivityVisible(bool),
}

impl PrivacyUpdate {
    pub fn field(&self) -> &'static str {
        match self {
            PrivacyUpdate::ProfileVisibility(_) => "profile_visibility",
            PrivacyUpdate::GameActivityVisible(_) => "game_activity_visible",
        }
    }

    fn value(&self) -> Value {
        match self {
            PrivacyUpdate::ProfileVisibility(visibility) => Value::from(visibility.as_str()),
            PrivacyUpdate::GameActivityVisible(visible) => Value::Bool(*visible),
        }
    }

    pub fn apply_to(&self, settings: &mut PrivacySettings) {
        match *self {
            PrivacyUpdate::ProfileVisibility(visibility) => {
                settings.profile_visibility = visibility;
            }
            PrivacyUpdate::GameActivityVisible(visible) => {
                settings.game_activity_visible = visible;
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryQuery {
    pub status: Option<GameStatus>,
    pub search: Option<String>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

#[derive(Clone)]
pub struct BackloggrClient {
    http: Client,
    base_url: Url,
    token: String,
}

impl BackloggrClient {
    pub fn new(token: impl Into<String>) -> Result<Self, ApiError> {
        Self::with_base_url(DEFAULT_BASE_URL, token)
    }

    pub fn with_base_url(base_url: &str, token: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            http: Client::new(),
            base_url: normalize_base_url(base_url)?,
            token: token.into(),
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Result<Self, ApiError> {
        self.http = Client::builder().timeout(timeout).build()?;
        Ok(self)
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub async fn get_profile(&self) -> Result<UserProfile, ApiError> {
        let url = self.endpoint("api/auth/profile")?;
        let response = self.authorized(self.http.get(url)).send().await?;
        let data: UserData = handle_data(response, "user").await?;
        Ok(data.user)
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile, ApiError> {
        let url = self.endpoint("api/auth/profile")?;
        let response = self
            .authorized(self.http.put(url))
            .json(update)
            .send()
            .await?;
        let data: UserData = handle_data(response, "user").await?;
        Ok(data.user)
    }

    pub async fn update_setting(&self, field: SettingField, value: bool) -> Result<(), ApiError> {
        let url = self.endpoint("api/auth/settings")?;
        let mut body = Map::new();
        body.insert(field.as_str().to_string(), Value::Bool(value));
        let response = self
            .authorized(self.http.put(url))
            .json(&body)
            .send()
            .await?;
        handle_empty(response).await
    }

    pub async fn get_privacy_settings(&self) -> Result<PrivacySettings, ApiError> {
        let url = self.endpoint("api/auth/privacy-settings")?;
        let response = self.authorized(self.http.get(url)).send().await?;
        let data: PrivacyData = handle_data(response, "settings").await?;
        Ok(data.settings)
    }

    pub async fn update_privacy_setting(&self, update: PrivacyUpdate) -> Result<(), ApiError> {
        let url = self.endpoint("api/auth/privacy-settings")?;
        let mut body = Map::new();
        body.insert(update.field().to_string(), update.value());
        let response = self
            .authorized(self.http.put(url))
            .json(&body)
            .send()
            .await?;
        handle_empty(response).await
    }

    pub async fn search_games(&self, query: &str) -> Result<Vec<CatalogGame>, ApiError> {
        let mut url = self.endpoint("api/games/search")?;
        url.query_pairs_mut().append_pair("q", query);
        let response = self.authorized(self.http.get(url)).send().await?;
        handle_data(response, "data").await
    }

    /// Full catalog record as returned by the metadata proxy; kept untyped
    /// so it can be cached verbatim.
    pub async fn get_game(&self, igdb_game_id: i64) -> Result<Map<String, Value>, ApiError> {
        let url = self.endpoint(&format!("api/games/{igdb_game_id}"))?;
        let response = self.authorized(self.http.get(url)).send().await?;
        let data: GameData<Map<String, Value>> = handle_data(response, "game").await?;
        Ok(data.game)
    }

    pub async fn list_library(&self, query: &LibraryQuery) -> Result<LibraryPage, ApiError> {
        let mut url = self.endpoint("api/library")?;
        {
            let mut pairs = url.query_pairs_mut();
            if let Some(status) = query.status {
                pairs.append_pair("status", status.as_str());
            }
            if let Some(search) = query.search.as_deref().filter(|s| !s.is_empty()) {
                pairs.append_pair("search", search);
            }
            if let Some(limit) = query.limit {
                pairs.append_pair("limit", &limit.to_string());
            }
            if let Some(offset) = query.offset {
                pairs.append_pair("offset", &offset.to_string());
            }
        }
        let response = self.authorized(self.http.get(url)).send().await?;
        handle_data(response, "games").await
    }

    pub async fn list_library_all(&self, page_size: u32) -> Result<Vec<RemoteEntry>, ApiError> {
        let page_size = page_size.max(1);
        let mut offset = 0u32;
        let mut games = Vec::new();
        loop {
            let page = self
                .list_library(&LibraryQuery {
                    limit: Some(page_size),
                    offset: Some(offset),
                    ..LibraryQuery::default()
                })
                .await?;
            let received = page.games.len() as u32;
            offset = offset.saturating_add(received);
            games.extend(page.games);
            let done = match page.total {
                Some(total) => offset >= total,
                None => received < page_size,
            };
            if done || received == 0 {
                break;
            }
        }
        Ok(games)
    }

    pub async fn get_library_entry(&self, library_id: i64) -> Result<RemoteEntry, ApiError> {
        let url = self.endpoint(&format!("api/library/{library_id}"))?;
        let response = self.authorized(self.http.get(url)).send().await?;
        let data: GameData<RemoteEntry> = handle_data(response, "game").await?;
        Ok(data.game)
    }

    pub async fn add_library_entry(&self, entry: &NewLibraryEntry) -> Result<RemoteEntry, ApiError> {
        let url = self.endpoint("api/library")?;
        let response = self
            .authorized(self.http.post(url))
            .json(entry)
            .send()
            .await?;
        let data: GameData<RemoteEntry> = handle_data(response, "game").await?;
        Ok(data.game)
    }

    pub async fn patch_library_entry(&self, library_id: i64, patch: &Value) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("api/library/{library_id}"))?;
        let response = self
            .authorized(self.http.patch(url))
            .json(patch)
            .send()
            .await?;
        handle_empty(response).await
    }

    pub async fn delete_library_entry(&self, library_id: i64) -> Result<(), ApiError> {
        let url = self.endpoint(&format!("api/library/{library_id}"))?;
        let response = self.authorized(self.http.delete(url)).send().await?;
        handle_empty(response).await
    }

    pub async fn get_statistics(&self) -> Result<RemoteStatistics, ApiError> {
        let url = self.endpoint("api/statistics")?;
        let response = self.authorized(self.http.get(url)).send().await?;
        let data: StatisticsData = handle_data(response, "statistics").await?;
        Ok(data.statistics)
    }

    pub async fn upload_screenshot(
        &self,
        library_id: i64,
        file_name: &str,
        mime: &str,
        bytes: Vec<u8>,
    ) -> Result<Value, ApiError> {
        let url = self.endpoint(&format!("api/library/{library_id}/screenshots"))?;
        let part = multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str(mime)?;
        let form = multipart::Form::new().part("screenshot", part);
        let response = self
            .authorized(self.http.post(url))
            .multipart(form)
            .send()
            .await?;
        handle_data(response, "data").await
    }

    pub async fn register_push_token(&self, push_token: &str) -> Result<(), ApiError> {
        let url = self.endpoint("api/notifications/fcm-token")?;
        let response = self
            .authorized(self.http.post(url))
            .json(&serde_json::json!({ "fcm_token": push_token }))
            .send()
            .await?;
        handle_empty(response).await
    }

    pub async fn remove_push_token(&self) -> Result<(), ApiError> {
        let url = self.endpoint("api/notifications/fcm-token")?;
        let response = self.authorized(self.http.delete(url)).send().await?;
        handle_empty(response).await
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        request.header("Authorization", format!("Bearer {}", self.token))
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        Ok(self.base_url.join(path)?)
    }
}

pub(crate) fn normalize_base_url(base_url: &str) -> Result<Url, ApiError> {
    let mut url = Url::parse(base_url)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

pub(crate) async fn handle_data<T: DeserializeOwned>(
    response: reqwest::Response,
    field: &'static str,
) -> Result<T, ApiError> {
    let response = check_status(response).await?;
    let envelope: Envelope<T> = response.json().await?;
    envelope.data.ok_or(ApiError::MissingData(field))
}

pub(crate) async fn handle_empty(response: reqwest::Response) -> Result<(), ApiError> {
    check_status(response).await.map(|_| ())
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();
    Err(ApiError::Api {
        status,
        body,
        retry_after,
    })
}

impl ApiError {
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            ApiError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn classification(&self) -> Option<ApiErrorClass> {
        match self {
            ApiError::Api { status, .. } => Some(classify_api_status(*status)),
            _ => None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Request(err) => !err.is_decode() && !err.is_builder(),
            _ => matches!(
                self.classification(),
                Some(ApiErrorClass::RateLimit | ApiErrorClass::Transient)
            ),
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.classification(), Some(ApiErrorClass::Auth))
    }

    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            ApiError::Api { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

fn classify_api_status(status: StatusCode) -> ApiErrorClass {
    if matches!(status, StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) {
        ApiErrorClass::Auth
    } else if status == StatusCode::TOO_MANY_REQUESTS {
        ApiErrorClass::RateLimit
    } else if status.is_server_error()
        || matches!(
            status,
            StatusCode::REQUEST_TIMEOUT | StatusCode::CONFLICT | StatusCode::TOO_EARLY
        )
    {
        ApiErrorClass::Transient
    } else {
        ApiErrorClass::Permanent
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct GameData<T> {
    game: T,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UserData {
    pub(crate) user: UserProfile,
}

#[derive(Debug, Deserialize)]
struct PrivacyData {
    settings: PrivacySettings,
}

#[derive(Debug, Deserialize)]
struct StatisticsData {
    statistics: RemoteStatistics,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct UserProfile {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub bio: Option<String>,
    #[serde(default)]
    pub profile_image: Option<String>,
    #[serde(default, deserialize_with = "de_opt_flag")]
    pub dark_mode: Option<bool>,
    #[serde(default, deserialize_with = "de_opt_flag")]
    pub analytics_enabled: Option<bool>,
    #[serde(default, deserialize_with = "de_opt_flag")]
    pub notifications_enabled: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile_image: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CoverImage {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CatalogGame {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub cover: Option<CoverImage>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct NewLibraryEntry {
    pub igdb_game_id: i64,
    pub status: GameStatus,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RemoteEntry {
    pub id: i64,
    #[serde(default)]
    pub user_id: Option<i64>,
    pub igdb_game_id: i64,
    pub status: GameStatus,
    #[serde(default, deserialize_with = "de_opt_f64")]
    pub rating: Option<f64>,
    #[serde(default, deserialize_with = "de_decimal_string")]
    pub hours_played: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub completion_date: Option<String>,
    #[serde(default)]
    pub added_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub game_details: Option<Map<String, Value>>,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LibraryPage {
    pub games: Vec<RemoteEntry>,
    #[serde(default)]
    pub total: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct RemoteStatistics {
    #[serde(default)]
    pub user_id: Option<i64>,
    #[serde(default)]
    pub total_games: i64,
    #[serde(default)]
    pub completed_games: i64,
    #[serde(default)]
    pub playing_games: i64,
    #[serde(default)]
    pub backlogged_games: i64,
    #[serde(default)]
    pub dropped_games: i64,
    #[serde(default)]
    pub on_hold_games: i64,
    #[serde(default, deserialize_with = "de_f64")]
    pub total_hours: f64,
}

// Numeric columns arrive either as JSON numbers or as decimal strings.
fn de_opt_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s.trim().parse().map(Some).map_err(de::Error::custom),
        Some(other) => Err(de::Error::custom(format!("expected number, got {other}"))),
    }
}

fn de_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(de_opt_f64(deserializer)?.unwrap_or(0.0))
}

fn de_decimal_string<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<String>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(de::Error::custom(format!("expected decimal, got {other}"))),
    }
}

// The backend reports switches as 0/1 or true/false.
fn de_opt_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<bool>, D::Error> {
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(b)),
        Some(Value::Number(n)) => Ok(Some(n.as_i64().unwrap_or(0) != 0)),
        Some(other) => Err(de::Error::custom(format!("expected flag, got {other}"))),
    }
}

fn visible_by_default() -> bool {
    true
}

fn de_visible_flag<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
    Ok(de_opt_flag(deserializer)?.unwrap_or(true))
}
