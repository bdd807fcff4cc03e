mod models;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use backloggr_core::GameStatus;
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteRow};
use sqlx::{Row, SqliteConnection, SqlitePool, migrate::Migrator};
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

pub use models::{
    CatalogCacheEntry, EntryField, LibraryEntry, OperationKind, PendingOperation, Statistics,
    format_hours,
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

const ENTRY_COLUMNS: &str = "id, user_id, igdb_game_id, status, rating, hours_played, notes, \
     start_date, completion_date, added_at, updated_at, game_details_json";

const OPERATION_COLUMNS: &str =
    "id, library_id, action_type, data_json, timestamp, synced, attempt, retry_at, last_error, dead";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed cached JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("XDG data directory is unavailable")]
    MissingDataDir,
    #[error("invalid game status: {0}")]
    InvalidStatus(String),
    #[error("invalid operation kind: {0}")]
    InvalidOperationKind(String),
    #[error("cached JSON is not an object")]
    NotAnObject,
}

/// What `remap_entry_id` did with the temporary row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapOutcome {
    Moved,
    /// The server id already had a local row; the temporary row was dropped.
    Merged,
    /// No row carried the temporary id (it was deleted meanwhile).
    Missing,
}

/// What `remove_entry` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The entry never reached the server; its queued work was dropped.
    LocalOnly { id: i64, dropped: u64 },
    Queued { id: i64, op_id: i64 },
}

pub struct LocalStore {
    pool: SqlitePool,
}

impl LocalStore {
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn new(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePool::connect(database_url).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    pub async fn new_default() -> Result<Self, StoreError> {
        Self::open(&default_db_path()?).await
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    /// Writes the entry, replacing any row with the same id. An id of `0`
    /// gets a fresh temporary id. Returns the id the row was stored under.
    pub async fn upsert_entry(&self, entry: &LibraryEntry) -> Result<i64, StoreError> {
        let id = if entry.id == 0 {
            self.next_temporary_id().await?
        } else {
            entry.id
        };
        let mut conn = self.pool.acquire().await?;
        write_entry(&mut conn, id, entry).await?;
        Ok(id)
    }

    pub async fn get_entry(&self, id: i64) -> Result<Option<LibraryEntry>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        fetch_entry(&mut conn, id).await
    }

    pub async fn list_entries(&self) -> Result<Vec<LibraryEntry>, StoreError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM user_games ORDER BY updated_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn list_entries_by_status(
        &self,
        status: GameStatus,
    ) -> Result<Vec<LibraryEntry>, StoreError> {
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM user_games WHERE status = ?1
             ORDER BY updated_at DESC, id DESC"
        );
        let rows = sqlx::query(&sql)
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(entry_from_row).collect()
    }

    /// Case-insensitive substring match on the cached game name.
    pub async fn search_entries(
        &self,
        query: &str,
        status: Option<GameStatus>,
    ) -> Result<Vec<LibraryEntry>, StoreError> {
        let entries = match status {
            Some(status) => self.list_entries_by_status(status).await?,
            None => self.list_entries().await?,
        };
        let needle = query.trim().to_lowercase();
        if needle.is_empty() {
            return Ok(entries);
        }
        Ok(entries
            .into_iter()
            .filter(|entry| {
                entry
                    .game_details
                    .get("name")
                    .and_then(Value::as_str)
                    .is_some_and(|name| name.to_lowercase().contains(&needle))
            })
            .collect())
    }

    /// Applies a local edit and queues its UPDATE in one transaction.
    ///
    /// A temporary id that was remapped meanwhile is followed to its server
    /// id. Returns the id the edit landed on, or `None` for an unknown entry.
    pub async fn edit_entry(&self, id: i64, field: &EntryField) -> Result<Option<i64>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut target = id;
        let mut updated = write_field(&mut tx, target, field).await?;
        if updated == 0
            && id < 0
            && let Some(server_id) = lookup_remap(&mut tx, id).await?
        {
            target = server_id;
            updated = write_field(&mut tx, target, field).await?;
        }
        if updated == 0 {
            return Ok(None);
        }
        let patch = field.to_patch();
        let op_id = insert_operation(&mut tx, target, OperationKind::Update, &patch).await?;
        tx.commit().await?;
        tracing::debug!(op_id, library_id = target, field = field.column(), "entry edited");
        Ok(Some(target))
    }

    /// Deletes an entry locally and settles its queue in one transaction:
    /// never-synced entries lose all queued work, synced ones get a DELETE.
    pub async fn remove_entry(&self, id: i64) -> Result<Option<Removal>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut target = id;
        let mut deleted = delete_row(&mut tx, target).await?;
        if deleted == 0
            && id < 0
            && let Some(server_id) = lookup_remap(&mut tx, id).await?
        {
            target = server_id;
            deleted = delete_row(&mut tx, target).await?;
        }
        if deleted == 0 {
            return Ok(None);
        }
        let removal = if target < 0 {
            let dropped = sqlx::query("DELETE FROM pending_sync WHERE library_id = ?1")
                .bind(target)
                .execute(&mut *tx)
                .await?
                .rows_affected();
            Removal::LocalOnly { id: target, dropped }
        } else {
            let op_id = insert_operation(
                &mut tx,
                target,
                OperationKind::Delete,
                &Value::Object(Map::new()),
            )
            .await?;
            Removal::Queued { id: target, op_id }
        };
        tx.commit().await?;
        Ok(Some(removal))
    }

    pub async fn delete_entry(&self, id: i64) -> Result<u64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        delete_row(&mut conn, id).await
    }

    /// Moves a temporary row to its server-assigned id and points every
    /// pending operation at the new id, atomically.
    pub async fn remap_entry_id(
        &self,
        temp_id: i64,
        server_id: i64,
    ) -> Result<RemapOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;
        let outcome = remap_in(&mut tx, temp_id, server_id).await?;
        tx.commit().await?;
        tracing::debug!(temp_id, server_id, ?outcome, "remapped library entry");
        Ok(outcome)
    }

    /// Settles an ADD the server accepted: drops the operation, remaps the
    /// temporary id and stores the server row, all in one transaction.
    /// Local fields win while edits for the entry are still queued.
    pub async fn complete_add(
        &self,
        op_id: i64,
        temp_id: i64,
        server: LibraryEntry,
    ) -> Result<RemapOutcome, StoreError> {
        let server_id = server.id;
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM pending_sync WHERE id = ?1")
            .bind(op_id)
            .execute(&mut *tx)
            .await?;
        let outcome = remap_in(&mut tx, temp_id, server_id).await?;
        if outcome != RemapOutcome::Missing {
            let queued = sqlx::query(
                "SELECT 1 FROM pending_sync WHERE library_id = ?1 AND synced = 0 LIMIT 1",
            )
            .bind(server_id)
            .fetch_optional(&mut *tx)
            .await?
            .is_some();
            let local = fetch_entry(&mut tx, server_id).await?;
            let merged = server.merge_created(local, queued);
            write_entry(&mut tx, server_id, &merged).await?;
        }
        tx.commit().await?;
        tracing::debug!(op_id, temp_id, server_id, ?outcome, "add settled");
        Ok(outcome)
    }

    /// Server id a temporary id was remapped to, if any.
    pub async fn remapped_id(&self, temp_id: i64) -> Result<Option<i64>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        lookup_remap(&mut conn, temp_id).await
    }

    /// Negative millisecond timestamp, stepped down until nothing uses it.
    pub async fn next_temporary_id(&self) -> Result<i64, StoreError> {
        let mut candidate = -now_millis().max(1);
        loop {
            let taken = sqlx::query(
                "SELECT 1 FROM user_games WHERE id = ?1
                 UNION ALL
                 SELECT 1 FROM pending_sync WHERE library_id = ?1
                 UNION ALL
                 SELECT 1 FROM id_remaps WHERE temp_id = ?1
                 LIMIT 1",
            )
            .bind(candidate)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
            if !taken {
                return Ok(candidate);
            }
            candidate -= 1;
        }
    }

    pub async fn put_catalog(
        &self,
        igdb_game_id: i64,
        data: &Map<String, Value>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO game_cache (igdb_game_id, game_data_json, cached_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(igdb_game_id) DO UPDATE SET
                game_data_json = excluded.game_data_json,
                cached_at = excluded.cached_at",
        )
        .bind(igdb_game_id)
        .bind(serde_json::to_string(data)?)
        .bind(now_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_catalog(
        &self,
        igdb_game_id: i64,
    ) -> Result<Option<CatalogCacheEntry>, StoreError> {
        let row = sqlx::query(
            "SELECT igdb_game_id, game_data_json, cached_at FROM game_cache WHERE igdb_game_id = ?1",
        )
        .bind(igdb_game_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let raw: String = row.try_get("game_data_json")?;
        Ok(Some(CatalogCacheEntry {
            igdb_game_id: row.try_get("igdb_game_id")?,
            data: parse_object(&raw)?,
            cached_at: row.try_get("cached_at")?,
        }))
    }

    pub async fn enqueue_operation(
        &self,
        library_id: i64,
        kind: OperationKind,
        payload: &Value,
    ) -> Result<i64, StoreError> {
        let mut conn = self.pool.acquire().await?;
        insert_operation(&mut conn, library_id, kind, payload).await
    }

    pub async fn get_operation(&self, id: i64) -> Result<Option<PendingOperation>, StoreError> {
        let sql = format!("SELECT {OPERATION_COLUMNS} FROM pending_sync WHERE id = ?1");
        let row = sqlx::query(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(operation_from_row).transpose()
    }

    /// Unsynced, live operations, oldest first.
    pub async fn list_pending_operations(&self) -> Result<Vec<PendingOperation>, StoreError> {
        let sql = format!(
            "SELECT {OPERATION_COLUMNS} FROM pending_sync
             WHERE synced = 0 AND dead = 0
             ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(operation_from_row).collect()
    }

    /// Pending operations whose backoff window has elapsed at `now` (unix seconds).
    pub async fn list_ready_operations(
        &self,
        now: i64,
    ) -> Result<Vec<PendingOperation>, StoreError> {
        let sql = format!(
            "SELECT {OPERATION_COLUMNS} FROM pending_sync
             WHERE synced = 0 AND dead = 0 AND (retry_at IS NULL OR retry_at <= ?1)
             ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql).bind(now).fetch_all(&self.pool).await?;
        rows.iter().map(operation_from_row).collect()
    }

    pub async fn list_pending_for_entry(
        &self,
        library_id: i64,
    ) -> Result<Vec<PendingOperation>, StoreError> {
        let sql = format!(
            "SELECT {OPERATION_COLUMNS} FROM pending_sync
             WHERE synced = 0 AND dead = 0 AND library_id = ?1
             ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(library_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(operation_from_row).collect()
    }

    /// Library ids with unsynced work, dead letters included.
    pub async fn entries_with_pending_operations(&self) -> Result<HashSet<i64>, StoreError> {
        let rows = sqlx::query("SELECT DISTINCT library_id FROM pending_sync WHERE synced = 0")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("library_id").map_err(StoreError::from))
            .collect()
    }

    pub async fn mark_operation_synced(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("UPDATE pending_sync SET synced = 1 WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_operation(&self, id: i64) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM pending_sync WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// The newest unsynced ADD for an entry, dead letters included.
    pub async fn find_add_operation(
        &self,
        library_id: i64,
    ) -> Result<Option<PendingOperation>, StoreError> {
        let sql = format!(
            "SELECT {OPERATION_COLUMNS} FROM pending_sync
             WHERE synced = 0 AND action_type = 'ADD' AND library_id = ?1
             ORDER BY id DESC LIMIT 1"
        );
        let row = sqlx::query(&sql)
            .bind(library_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(operation_from_row).transpose()
    }

    pub async fn retarget_operations(&self, from: i64, to: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("UPDATE pending_sync SET library_id = ?1 WHERE library_id = ?2")
            .bind(to)
            .bind(from)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn delete_operations_for_entry(&self, library_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM pending_sync WHERE library_id = ?1")
            .bind(library_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Bumps the attempt counter and schedules the next try.
    pub async fn record_operation_failure(
        &self,
        id: i64,
        retry_at: i64,
        error: &str,
    ) -> Result<u32, StoreError> {
        let row = sqlx::query(
            "UPDATE pending_sync
             SET attempt = attempt + 1, retry_at = ?1, last_error = ?2
             WHERE id = ?3
             RETURNING attempt",
        )
        .bind(retry_at)
        .bind(error)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(row.try_get::<i64, _>("attempt")?.max(0) as u32),
            None => Ok(0),
        }
    }

    pub async fn dead_letter_operation(&self, id: i64, error: &str) -> Result<(), StoreError> {
        sqlx::query("UPDATE pending_sync SET dead = 1, retry_at = NULL, last_error = ?1 WHERE id = ?2")
            .bind(error)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn list_dead_letters(&self) -> Result<Vec<PendingOperation>, StoreError> {
        let sql = format!(
            "SELECT {OPERATION_COLUMNS} FROM pending_sync
             WHERE synced = 0 AND dead = 1
             ORDER BY id ASC"
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(operation_from_row).collect()
    }

    /// Puts every dead letter back in the queue with a fresh attempt budget.
    pub async fn retry_dead_letters(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE pending_sync SET dead = 0, attempt = 0, retry_at = NULL
             WHERE dead = 1 AND synced = 0",
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    pub async fn pending_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM pending_sync WHERE synced = 0 AND dead = 0",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("count")?)
    }

    pub async fn dead_letter_count(&self) -> Result<i64, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM pending_sync WHERE synced = 0 AND dead = 1",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("count")?)
    }

    /// Replaces the singleton statistics row.
    pub async fn put_statistics(&self, stats: &Statistics) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM user_statistics")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO user_statistics (
                user_id, total_games, completed_games, playing_games, backlogged_games,
                dropped_games, on_hold_games, total_hours, updated_at
             )
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(stats.user_id)
        .bind(stats.total_games)
        .bind(stats.completed_games)
        .bind(stats.playing_games)
        .bind(stats.backlogged_games)
        .bind(stats.dropped_games)
        .bind(stats.on_hold_games)
        .bind(stats.total_hours)
        .bind(&stats.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn get_statistics(&self) -> Result<Option<Statistics>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, total_games, completed_games, playing_games, backlogged_games,
                    dropped_games, on_hold_games, total_hours, updated_at
             FROM user_statistics LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(Statistics {
            user_id: row.try_get("user_id")?,
            total_games: row.try_get("total_games")?,
            completed_games: row.try_get("completed_games")?,
            playing_games: row.try_get("playing_games")?,
            backlogged_games: row.try_get("backlogged_games")?,
            dropped_games: row.try_get("dropped_games")?,
            on_hold_games: row.try_get("on_hold_games")?,
            total_hours: row.try_get("total_hours")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }

    /// Statistics derived from the cached library alone.
    pub async fn compute_local_statistics(&self) -> Result<Statistics, StoreError> {
        let entries = self.list_entries().await?;
        let mut stats = Statistics {
            user_id: entries.iter().find_map(|entry| entry.user_id).unwrap_or(0),
            updated_at: Some(now_rfc3339()),
            ..Statistics::default()
        };
        for entry in &entries {
            stats.count(entry.status);
            stats.total_hours += entry.hours();
        }
        Ok(stats)
    }

    /// Wipes every table, used on logout.
    pub async fn clear_all(&self) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for table in [
            "user_games",
            "game_cache",
            "user_statistics",
            "pending_sync",
            "id_remaps",
        ] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        tracing::info!("local store cleared");
        Ok(())
    }
}

async fn fetch_entry(
    conn: &mut SqliteConnection,
    id: i64,
) -> Result<Option<LibraryEntry>, StoreError> {
    let sql = format!("SELECT {ENTRY_COLUMNS} FROM user_games WHERE id = ?1");
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    row.as_ref().map(entry_from_row).transpose()
}

async fn write_entry(
    conn: &mut SqliteConnection,
    id: i64,
    entry: &LibraryEntry,
) -> Result<(), StoreError> {
    let details = serde_json::to_string(&entry.game_details)?;
    sqlx::query(
        "INSERT INTO user_games (
            id, user_id, igdb_game_id, status, rating, hours_played, notes,
            start_date, completion_date, added_at, updated_at, game_details_json
         )
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(id) DO UPDATE SET
            user_id = excluded.user_id,
            igdb_game_id = excluded.igdb_game_id,
            status = excluded.status,
            rating = excluded.rating,
            hours_played = excluded.hours_played,
            notes = excluded.notes,
            start_date = excluded.start_date,
            completion_date = excluded.completion_date,
            added_at = excluded.added_at,
            updated_at = excluded.updated_at,
            game_details_json = excluded.game_details_json",
    )
    .bind(id)
    .bind(entry.user_id)
    .bind(entry.igdb_game_id)
    .bind(entry.status.as_str())
    .bind(entry.rating)
    .bind(&entry.hours_played)
    .bind(&entry.notes)
    .bind(&entry.start_date)
    .bind(&entry.completion_date)
    .bind(&entry.added_at)
    .bind(&entry.updated_at)
    .bind(details)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_field(
    conn: &mut SqliteConnection,
    id: i64,
    field: &EntryField,
) -> Result<u64, StoreError> {
    let sql = format!(
        "UPDATE user_games SET {} = ?1, updated_at = ?2 WHERE id = ?3",
        field.column()
    );
    let query = sqlx::query(&sql);
    let query = match field {
        EntryField::Status(status) => query.bind(status.as_str().to_string()),
        EntryField::HoursPlayed(hours) => query.bind(hours.clone()),
        EntryField::Notes(notes) => query.bind(notes.clone()),
        EntryField::Rating(rating) => query.bind(*rating),
        EntryField::StartDate(date) | EntryField::CompletionDate(date) => query.bind(date.clone()),
        EntryField::GameDetails(details) => query.bind(serde_json::to_string(details)?),
    };
    let result = query
        .bind(now_rfc3339())
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

async fn delete_row(conn: &mut SqliteConnection, id: i64) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM user_games WHERE id = ?1")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

async fn insert_operation(
    conn: &mut SqliteConnection,
    library_id: i64,
    kind: OperationKind,
    payload: &Value,
) -> Result<i64, StoreError> {
    let result = sqlx::query(
        "INSERT INTO pending_sync (library_id, action_type, data_json, timestamp, synced)
         VALUES (?1, ?2, ?3, ?4, 0)",
    )
    .bind(library_id)
    .bind(kind.as_str())
    .bind(serde_json::to_string(payload)?)
    .bind(now_rfc3339())
    .execute(&mut *conn)
    .await?;
    let op_id = result.last_insert_rowid();
    tracing::debug!(op_id, library_id, kind = kind.as_str(), "queued operation");
    Ok(op_id)
}

async fn lookup_remap(conn: &mut SqliteConnection, temp_id: i64) -> Result<Option<i64>, StoreError> {
    let row = sqlx::query("SELECT server_id FROM id_remaps WHERE temp_id = ?1")
        .bind(temp_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row
        .map(|row| row.try_get::<i64, _>("server_id"))
        .transpose()?)
}

// Starts with writes so the transaction holds the write lock before it reads.
async fn remap_in(
    conn: &mut SqliteConnection,
    temp_id: i64,
    server_id: i64,
) -> Result<RemapOutcome, StoreError> {
    sqlx::query("UPDATE pending_sync SET library_id = ?1 WHERE library_id = ?2")
        .bind(server_id)
        .bind(temp_id)
        .execute(&mut *conn)
        .await?;
    sqlx::query(
        "INSERT INTO id_remaps (temp_id, server_id, remapped_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(temp_id) DO UPDATE SET
            server_id = excluded.server_id,
            remapped_at = excluded.remapped_at",
    )
    .bind(temp_id)
    .bind(server_id)
    .bind(now_rfc3339())
    .execute(&mut *conn)
    .await?;

    let temp_exists = sqlx::query("SELECT 1 FROM user_games WHERE id = ?1")
        .bind(temp_id)
        .fetch_optional(&mut *conn)
        .await?
        .is_some();
    let server_exists = sqlx::query("SELECT 1 FROM user_games WHERE id = ?1")
        .bind(server_id)
        .fetch_optional(&mut *conn)
        .await?
        .is_some();

    Ok(match (temp_exists, server_exists) {
        (false, _) => RemapOutcome::Missing,
        (true, false) => {
            sqlx::query("UPDATE user_games SET id = ?1 WHERE id = ?2")
                .bind(server_id)
                .bind(temp_id)
                .execute(&mut *conn)
                .await?;
            RemapOutcome::Moved
        }
        (true, true) => {
            delete_row(conn, temp_id).await?;
            RemapOutcome::Merged
        }
    })
}

fn entry_from_row(row: &SqliteRow) -> Result<LibraryEntry, StoreError> {
    let status: String = row.try_get("status")?;
    let details: String = row.try_get("game_details_json")?;
    Ok(LibraryEntry {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        igdb_game_id: row.try_get("igdb_game_id")?,
        status: GameStatus::parse(&status).ok_or(StoreError::InvalidStatus(status))?,
        rating: row.try_get("rating")?,
        hours_played: row.try_get("hours_played")?,
        notes: row.try_get("notes")?,
        start_date: row.try_get("start_date")?,
        completion_date: row.try_get("completion_date")?,
        added_at: row.try_get("added_at")?,
        updated_at: row.try_get("updated_at")?,
        game_details: parse_object(&details)?,
    })
}

fn operation_from_row(row: &SqliteRow) -> Result<PendingOperation, StoreError> {
    let kind: String = row.try_get("action_type")?;
    let payload: String = row.try_get("data_json")?;
    let attempt: i64 = row.try_get("attempt")?;
    Ok(PendingOperation {
        id: row.try_get("id")?,
        library_id: row.try_get("library_id")?,
        kind: OperationKind::parse(&kind)?,
        payload: serde_json::from_str(&payload)?,
        created_at: row.try_get("timestamp")?,
        synced: row.try_get::<i64, _>("synced")? != 0,
        attempt: attempt.max(0) as u32,
        retry_at: row.try_get("retry_at")?,
        last_error: row.try_get("last_error")?,
        dead: row.try_get::<i64, _>("dead")? != 0,
    })
}

fn parse_object(raw: &str) -> Result<Map<String, Value>, StoreError> {
    match serde_json::from_str(raw)? {
        Value::Object(map) => Ok(map),
        _ => Err(StoreError::NotAnObject),
    }
}

pub fn default_db_path() -> Result<PathBuf, StoreError> {
    let base = dirs::data_dir().ok_or(StoreError::MissingDataDir)?;
    Ok(base.join("backloggr").join("backloggr.db"))
}

pub fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339)
        .unwrap_or_else(|_| now.unix_timestamp().to_string())
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs() as i64)
        .unwrap_or(0)
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
