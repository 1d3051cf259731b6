//! Document storage: every table is a set of JSON rows keyed by `id`, kept in
//! one Postgres `documents` table, or in process memory when no database is
//! reachable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde_json::{Map, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use tabletop::protocol::{merge_patch, row_created_at, row_id, stamp_row, Filter, Table};

use crate::config::ServerConfig;

const LOG_TARGET: &str = "tabletop_server::store";

const UNIQUE_ENCOUNTER_INDEX: &str = "encounters_one_per_session";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("malformed row: {0}")]
    Malformed(String),
    #[error("{0}")]
    Conflict(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Default)]
struct MemoryDocs {
    rows: HashMap<Table, Vec<Value>>,
}

#[derive(Clone)]
enum Backing {
    Memory(Arc<Mutex<MemoryDocs>>),
    Postgres(PgPool),
}

/// Cheap to clone; every connection holds one.
#[derive(Clone)]
pub struct Store {
    backing: Backing,
    unique_encounters: bool,
    min_client_version: u32,
    clock: Arc<AtomicI64>,
}

impl Store {
    pub fn memory(unique_encounters: bool, min_client_version: u32) -> Store {
        Store {
            backing: Backing::Memory(Arc::default()),
            unique_encounters,
            min_client_version,
            clock: Arc::default(),
        }
    }

    /// Postgres when `database_url` is set and reachable, memory otherwise.
    pub async fn open(config: &ServerConfig) -> Store {
        let Some(url) = config.database_url.as_deref() else {
            warn!(target: LOG_TARGET, "DATABASE_URL not set, rows are kept in memory only");
            return Store::memory(config.unique_encounters, config.min_client_version);
        };
        match Store::postgres(url, config.unique_encounters, config.min_client_version).await {
            Ok(store) => store,
            Err(err) => {
                warn!(target: LOG_TARGET, error = %err, "failed to open database, rows are kept in memory only");
                Store::memory(config.unique_encounters, config.min_client_version)
            }
        }
    }

    pub async fn postgres(url: &str, unique_encounters: bool, min_client_version: u32) -> StoreResult<Store> {
        let pool = connect(url, min_client_version).await?;
        apply_uniqueness(&pool, unique_encounters).await;
        info!(target: LOG_TARGET, unique_encounters, "database connected and initialized");
        Ok(Store::with_pool(pool, unique_encounters, min_client_version))
    }

    /// Opens the database without touching the encounter uniqueness index.
    pub async fn attach(url: &str, min_client_version: u32) -> StoreResult<Store> {
        let pool = connect(url, min_client_version).await?;
        Ok(Store::with_pool(pool, false, min_client_version))
    }

    fn with_pool(pool: PgPool, unique_encounters: bool, min_client_version: u32) -> Store {
        Store {
            backing: Backing::Postgres(pool),
            unique_encounters,
            min_client_version,
            clock: Arc::default(),
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.backing, Backing::Postgres(_))
    }

    /// Millisecond timestamp, strictly increasing across this process so
    /// creation order survives inserts landing in the same millisecond.
    fn stamp(&self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let prev = self
            .clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        now.max(prev + 1)
    }

    /// The server_config row wins over the configured default.
    pub async fn min_client_version(&self) -> u32 {
        let Backing::Postgres(pool) = &self.backing else {
            return self.min_client_version;
        };
        let row = sqlx::query("SELECT value FROM server_config WHERE key = 'min_client_version'")
            .fetch_optional(pool)
            .await;
        match row {
            Ok(Some(r)) => r
                .try_get::<String, _>("value")
                .ok()
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(self.min_client_version),
            Ok(None) => self.min_client_version,
            Err(err) => {
                warn!(target: LOG_TARGET, error = %err, "could not read min_client_version");
                self.min_client_version
            }
        }
    }

    pub async fn set_min_client_version(&self, version: u32) -> StoreResult<()> {
        match &self.backing {
            Backing::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO server_config (key, value) VALUES ('min_client_version', $1) \
                     ON CONFLICT (key) DO UPDATE SET value = $1",
                )
                .bind(version.to_string())
                .execute(pool)
                .await?;
                Ok(())
            }
            Backing::Memory(_) => Err(StoreError::Conflict("the memory store has no server_config".into())),
        }
    }

    /// Rows in creation order.
    pub async fn select(&self, table: Table, filter: &Filter) -> StoreResult<Vec<Value>> {
        match &self.backing {
            Backing::Memory(docs) => {
                let docs = lock(docs);
                let rows = docs.rows.get(&table).map(Vec::as_slice).unwrap_or(&[]);
                Ok(rows.iter().filter(|row| filter.matches(row)).cloned().collect())
            }
            Backing::Postgres(pool) => {
                let rows = sqlx::query(
                    "SELECT doc FROM documents WHERE kind = $1 AND doc -> $2 = $3 ORDER BY created_at, id",
                )
                .bind(table.as_str())
                .bind(&filter.column)
                .bind(Json(&filter.value))
                .fetch_all(pool)
                .await?;
                rows.into_iter()
                    .map(|r| r.try_get::<Json<Value>, _>("doc").map(|doc| doc.0).map_err(StoreError::from))
                    .collect()
            }
        }
    }

    /// Stamps `id` and `created_at` where missing and returns the stored row.
    pub async fn insert(&self, table: Table, row: Value) -> StoreResult<Value> {
        let row = stamp_row(row, self.stamp()).map_err(StoreError::Malformed)?;
        let id = row_id(&row).ok_or_else(|| StoreError::Malformed("id is not a uuid".into()))?;
        match &self.backing {
            Backing::Memory(docs) => {
                let mut docs = lock(docs);
                if table == Table::Encounters && self.unique_encounters {
                    let session = row.get("session_id");
                    let taken = docs
                        .rows
                        .get(&table)
                        .is_some_and(|rows| rows.iter().any(|r| r.get("session_id") == session));
                    if taken {
                        return Err(StoreError::Conflict("an encounter already exists for this session".into()));
                    }
                }
                let rows = docs.rows.entry(table).or_default();
                if rows.iter().any(|r| row_id(r) == Some(id)) {
                    return Err(StoreError::Conflict(format!("duplicate id in {}", table.as_str())));
                }
                rows.push(row.clone());
            }
            Backing::Postgres(pool) => {
                sqlx::query("INSERT INTO documents (id, kind, doc, created_at) VALUES ($1, $2, $3, $4)")
                    .bind(id)
                    .bind(table.as_str())
                    .bind(Json(&row))
                    .bind(row_created_at(&row))
                    .execute(pool)
                    .await
                    .map_err(|err| match err {
                        sqlx::Error::Database(db) if db.is_unique_violation() => {
                            StoreError::Conflict(format!("{} row conflicts with an existing one", table.as_str()))
                        }
                        other => StoreError::Database(other),
                    })?;
            }
        }
        Ok(row)
    }

    /// Shallow-merges `patch`. `None` when no such row exists.
    pub async fn update(&self, table: Table, id: Uuid, patch: Value) -> StoreResult<Option<Value>> {
        let patch = writable_fields(patch)?;
        match &self.backing {
            Backing::Memory(docs) => {
                let mut docs = lock(docs);
                let Some(row) = docs.rows.get_mut(&table).and_then(|rows| rows.iter_mut().find(|r| row_id(r) == Some(id))) else {
                    return Ok(None);
                };
                merge_patch(row, &patch);
                Ok(Some(row.clone()))
            }
            Backing::Postgres(pool) => {
                let row = sqlx::query("UPDATE documents SET doc = doc || $3 WHERE kind = $1 AND id = $2 RETURNING doc")
                    .bind(table.as_str())
                    .bind(id)
                    .bind(Json(&patch))
                    .fetch_optional(pool)
                    .await?;
                Ok(row.map(|r| r.try_get::<Json<Value>, _>("doc")).transpose()?.map(|doc| doc.0))
            }
        }
    }

    /// Returns the removed row, `None` when there was nothing to delete.
    pub async fn delete(&self, table: Table, id: Uuid) -> StoreResult<Option<Value>> {
        match &self.backing {
            Backing::Memory(docs) => {
                let mut docs = lock(docs);
                Ok(docs.rows.get_mut(&table).and_then(|rows| {
                    let idx = rows.iter().position(|r| row_id(r) == Some(id))?;
                    Some(rows.remove(idx))
                }))
            }
            Backing::Postgres(pool) => {
                let row = sqlx::query("DELETE FROM documents WHERE kind = $1 AND id = $2 RETURNING doc")
                    .bind(table.as_str())
                    .bind(id)
                    .fetch_optional(pool)
                    .await?;
                Ok(row.map(|r| r.try_get::<Json<Value>, _>("doc")).transpose()?.map(|doc| doc.0))
            }
        }
    }

    /// Keeps the earliest encounter of every session (ties by id) and deletes
    /// the rest. Returns how many rows went.
    pub async fn dedupe_encounters(&self) -> StoreResult<u64> {
        match &self.backing {
            Backing::Memory(docs) => {
                let mut docs = lock(docs);
                let Some(rows) = docs.rows.get_mut(&Table::Encounters) else {
                    return Ok(0);
                };
                let mut earliest: HashMap<String, (i64, Uuid)> = HashMap::new();
                for row in rows.iter() {
                    let (Some(session), Some(id)) = (session_of(row), row_id(row)) else { continue };
                    let key = (row_created_at(row), id);
                    earliest
                        .entry(session)
                        .and_modify(|best| *best = (*best).min(key))
                        .or_insert(key);
                }
                let before = rows.len();
                rows.retain(|row| match (session_of(row), row_id(row)) {
                    (Some(session), Some(id)) => earliest.get(&session).map(|best| best.1) == Some(id),
                    _ => true,
                });
                Ok((before - rows.len()) as u64)
            }
            Backing::Postgres(pool) => {
                let done = sqlx::query(
                    "DELETE FROM documents d USING documents keep \
                     WHERE d.kind = 'encounters' AND keep.kind = 'encounters' \
                     AND d.doc ->> 'session_id' = keep.doc ->> 'session_id' \
                     AND (keep.created_at, keep.id) < (d.created_at, d.id)",
                )
                .execute(pool)
                .await?;
                Ok(done.rows_affected())
            }
        }
    }

    /// Drops every row of every table.
    pub async fn reset(&self) -> StoreResult<()> {
        match &self.backing {
            Backing::Memory(docs) => {
                lock(docs).rows.clear();
                Ok(())
            }
            Backing::Postgres(pool) => {
                sqlx::query("TRUNCATE TABLE documents").execute(pool).await?;
                Ok(())
            }
        }
    }
}

fn lock(docs: &Mutex<MemoryDocs>) -> std::sync::MutexGuard<'_, MemoryDocs> {
    // a panicked writer leaves whole rows behind, never half of one
    docs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn session_of(row: &Value) -> Option<String> {
    row.get("session_id")?.as_str().map(str::to_string)
}

/// The patch minus the store-owned columns.
fn writable_fields(patch: Value) -> StoreResult<Value> {
    let Value::Object(fields) = patch else {
        return Err(StoreError::Malformed(format!("expected an object patch, got {}", patch)));
    };
    let fields: Map<String, Value> = fields
        .into_iter()
        .filter(|(key, _)| key != "id" && key != "created_at")
        .collect();
    Ok(Value::Object(fields))
}

async fn connect(url: &str, min_client_version: u32) -> StoreResult<PgPool> {
    info!(target: LOG_TARGET, "connecting to database");
    let pool = PgPoolOptions::new().max_connections(5).connect(url).await?;
    migrate(&pool, min_client_version).await?;
    Ok(pool)
}

async fn migrate(pool: &PgPool, min_client_version: u32) -> StoreResult<()> {
    // executed one by one, prepared statements can't batch DDL
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS documents (
            id UUID PRIMARY KEY,
            kind TEXT NOT NULL,
            doc JSONB NOT NULL,
            created_at BIGINT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS documents_kind_created ON documents (kind, created_at)")
        .execute(pool)
        .await?;

    sqlx::query(
        "CREATE TABLE IF NOT EXISTS server_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query("INSERT INTO server_config (key, value) VALUES ('min_client_version', $1) ON CONFLICT DO NOTHING")
        .bind(min_client_version.to_string())
        .execute(pool)
        .await?;
    Ok(())
}

async fn apply_uniqueness(pool: &PgPool, unique_encounters: bool) {
    let index = if unique_encounters {
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS {} ON documents ((doc ->> 'session_id')) WHERE kind = 'encounters'",
            UNIQUE_ENCOUNTER_INDEX
        )
    } else {
        format!("DROP INDEX IF EXISTS {}", UNIQUE_ENCOUNTER_INDEX)
    };
    if let Err(err) = sqlx::query(&index).execute(pool).await {
        // existing duplicates block the index until `admin dedupe-encounters` runs
        warn!(target: LOG_TARGET, error = %err, "could not apply the encounter uniqueness index");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn stamps_are_strictly_increasing() {
        let store = Store::memory(false, 1);
        let a = store.insert(Table::DiceRolls, json!({"session_id": "s"})).await.unwrap();
        let b = store.insert(Table::DiceRolls, json!({"session_id": "s"})).await.unwrap();
        assert!(row_created_at(&a) < row_created_at(&b));
    }

    #[tokio::test]
    async fn patch_cannot_rewrite_identity() {
        let store = Store::memory(false, 1);
        let row = store.insert(Table::Tokens, json!({"x": 0})).await.unwrap();
        let id = row_id(&row).unwrap();
        let updated = store
            .update(Table::Tokens, id, json!({"id": Uuid::new_v4(), "created_at": 0, "x": 50}))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row_id(&updated), Some(id));
        assert_eq!(row_created_at(&updated), row_created_at(&row));
        assert_eq!(updated["x"], 50);
    }

    #[tokio::test]
    async fn missing_rows_update_and_delete_to_none() {
        let store = Store::memory(false, 1);
        assert!(store.update(Table::Tokens, Uuid::new_v4(), json!({"x": 1})).await.unwrap().is_none());
        assert!(store.delete(Table::Tokens, Uuid::new_v4()).await.unwrap().is_none());
        assert!(matches!(
            store.update(Table::Tokens, Uuid::new_v4(), json!(3)).await,
            Err(StoreError::Malformed(_))
        ));
    }
}
