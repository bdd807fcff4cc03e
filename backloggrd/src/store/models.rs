use backloggr_core::{GameStatus, RemoteEntry, RemoteStatistics};
use serde_json::{Map, Value};

use super::StoreError;

/// A game in the user's personal library, as cached locally.
///
/// A negative `id` marks an entry created offline that the server has not
/// acknowledged yet.
#[derive(Debug, Clone, PartialEq)]
pub struct LibraryEntry {
    pub id: i64,
    pub user_id: Option<i64>,
    pub igdb_game_id: i64,
    pub status: GameStatus,
    pub rating: Option<f64>,
    pub hours_played: String,
    pub notes: String,
    pub start_date: Option<String>,
    pub completion_date: Option<String>,
    pub added_at: Option<String>,
    pub updated_at: Option<String>,
    pub game_details: Map<String, Value>,
}

impl LibraryEntry {
    pub fn new_local(
        id: i64,
        igdb_game_id: i64,
        status: GameStatus,
        game_details: Map<String, Value>,
        now: &str,
    ) -> Self {
        Self {
            id,
            user_id: None,
            igdb_game_id,
            status,
            rating: None,
            hours_played: format_hours(0.0),
            notes: String::new(),
            start_date: None,
            completion_date: None,
            added_at: Some(now.to_string()),
            updated_at: Some(now.to_string()),
            game_details,
        }
    }

    pub fn from_remote(remote: RemoteEntry) -> Self {
        Self {
            id: remote.id,
            user_id: remote.user_id,
            igdb_game_id: remote.igdb_game_id,
            status: remote.status,
            rating: remote.rating,
            hours_played: remote.hours_played.unwrap_or_else(|| format_hours(0.0)),
            notes: remote.notes.unwrap_or_default(),
            start_date: remote.start_date,
            completion_date: remote.completion_date,
            added_at: remote.added_at,
            updated_at: remote.updated_at,
            game_details: remote.game_details.unwrap_or_default(),
        }
    }

    /// The row to keep once the server created `self`. While local edits
    /// are still queued the local fields stay and only server-only fields
    /// are taken over.
    pub(crate) fn merge_created(self, local: Option<LibraryEntry>, edits_queued: bool) -> Self {
        match local {
            Some(mut local) if edits_queued => {
                local.id = self.id;
                local.user_id = self.user_id.or(local.user_id);
                local.added_at = self.added_at.or(local.added_at);
                if local.game_details.is_empty() {
                    local.game_details = self.game_details;
                }
                local
            }
            Some(local) if self.game_details.is_empty() => Self {
                game_details: local.game_details,
                ..self
            },
            _ => self,
        }
    }

    pub fn is_local_only(&self) -> bool {
        self.id < 0
    }

    pub fn title(&self) -> String {
        self.game_details
            .get("name")
            .and_then(Value::as_str)
            .filter(|name| !name.trim().is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Game #{}", self.igdb_game_id))
    }

    /// Cover URL upgraded to the large IGDB size, or `None` for the placeholder.
    pub fn cover_url(&self) -> Option<String> {
        let raw = self
            .game_details
            .get("cover")
            .and_then(|cover| cover.get("url"))
            .and_then(Value::as_str)?;
        let sized = raw.replace("t_thumb", "t_cover_big");
        if sized.starts_with("//") {
            Some(format!("https:{sized}"))
        } else {
            Some(sized)
        }
    }

    pub fn hours(&self) -> f64 {
        self.hours_played.trim().parse().unwrap_or(0.0)
    }
}

pub fn format_hours(hours: f64) -> String {
    format!("{hours:.2}")
}

/// Column-safe single-field edits of a library entry.
#[derive(Debug, Clone, PartialEq)]
pub enum EntryField {
    Status(GameStatus),
    HoursPlayed(String),
    Notes(String),
    Rating(Option<f64>),
    StartDate(Option<String>),
    CompletionDate(Option<String>),
    GameDetails(Map<String, Value>),
}

impl EntryField {
    pub(crate) fn column(&self) -> &'static str {
        match self {
            EntryField::Status(_) => "status",
            EntryField::HoursPlayed(_) => "hours_played",
            EntryField::Notes(_) => "notes",
            EntryField::Rating(_) => "rating",
            EntryField::StartDate(_) => "start_date",
            EntryField::CompletionDate(_) => "completion_date",
            EntryField::GameDetails(_) => "game_details_json",
        }
    }

    /// Partial body for `PATCH api/library/{id}` carrying just this field.
    pub fn to_patch(&self) -> Value {
        let value = match self {
            EntryField::Status(status) => Value::from(status.as_str()),
            EntryField::HoursPlayed(hours) => Value::from(hours.as_str()),
            EntryField::Notes(notes) => Value::from(notes.as_str()),
            EntryField::Rating(rating) => rating.map(Value::from).unwrap_or(Value::Null),
            EntryField::StartDate(date) | EntryField::CompletionDate(date) => {
                date.clone().map(Value::from).unwrap_or(Value::Null)
            }
            EntryField::GameDetails(details) => Value::Object(details.clone()),
        };
        let mut patch = Map::new();
        patch.insert(self.column().trim_end_matches("_json").to_string(), value);
        Value::Object(patch)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogCacheEntry {
    pub igdb_game_id: i64,
    pub data: Map<String, Value>,
    pub cached_at: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Statistics {
    pub user_id: i64,
    pub total_games: i64,
    pub completed_games: i64,
    pub playing_games: i64,
    pub backlogged_games: i64,
    pub dropped_games: i64,
    pub on_hold_games: i64,
    pub total_hours: f64,
    pub updated_at: Option<String>,
}

impl Statistics {
    pub fn from_remote(remote: RemoteStatistics, fallback_user_id: i64, now: &str) -> Self {
        Self {
            user_id: remote.user_id.unwrap_or(fallback_user_id),
            total_games: remote.total_games,
            completed_games: remote.completed_games,
            playing_games: remote.playing_games,
            backlogged_games: remote.backlogged_games,
            dropped_games: remote.dropped_games,
            on_hold_games: remote.on_hold_games,
            total_hours: remote.total_hours,
            updated_at: Some(now.to_string()),
        }
    }

    pub(crate) fn count(&mut self, status: GameStatus) {
        self.total_games += 1;
        match status {
            GameStatus::Playing => self.playing_games += 1,
            GameStatus::Completed => self.completed_games += 1,
            GameStatus::Backlogged => self.backlogged_games += 1,
            GameStatus::OnHold => self.on_hold_games += 1,
            GameStatus::Dropped => self.dropped_games += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Add,
    Update,
    Delete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Add => "ADD",
            OperationKind::Update => "UPDATE",
            OperationKind::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> Result<Self, StoreError> {
        match value {
            "ADD" => Ok(OperationKind::Add),
            "UPDATE" => Ok(OperationKind::Update),
            "DELETE" => Ok(OperationKind::Delete),
            other => Err(StoreError::InvalidOperationKind(other.to_string())),
        }
    }
}

/// A durable record of a library mutation awaiting delivery to the server.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub id: i64,
    pub library_id: i64,
    pub kind: OperationKind,
    pub payload: Value,
    pub created_at: String,
    pub synced: bool,
    pub attempt: u32,
    pub retry_at: Option<i64>,
    pub last_error: Option<String>,
    pub dead: bool,
}
