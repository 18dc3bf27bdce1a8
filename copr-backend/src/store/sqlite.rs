//! SQLite-backed store shared between the manager and its worker processes.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::future::Future;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use rand::random;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::pool::PoolConnection;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

use super::{Record, Script, ScriptView, SharedStore, StoreMessage, compile_pattern};
use crate::{Error, Result};

/// Default busy timeout in milliseconds.
const DEFAULT_BUSY_TIMEOUT_MS: u64 = 30_000;

/// Default connection pool size.
const DEFAULT_POOL_SIZE: u32 = 8;

const SQLITE_BUSY_MAX_RETRIES: usize = 8;
const SQLITE_BUSY_BASE_DELAY_MS: u64 = 10;
const SQLITE_BUSY_MAX_DELAY_MS: u64 = 2000;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS store_hash (
        key TEXT NOT NULL,
        field TEXT NOT NULL,
        value TEXT NOT NULL,
        PRIMARY KEY (key, field)
    ) WITHOUT ROWID
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS store_messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        channel TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_store_messages_channel ON store_messages (channel, id)",
];

/// A `BEGIN IMMEDIATE` transaction on a pooled connection.
///
/// Takes the write lock up front so concurrent scripts serialize. A
/// transaction dropped before commit or rollback, or whose commit failed,
/// closes its connection instead of returning it to the pool mid-transaction.
struct ImmediateTransaction {
    conn: PoolConnection<Sqlite>,
    finished: bool,
}

impl ImmediateTransaction {
    async fn begin(pool: &SqlitePool) -> Result<Self> {
        let conn = pool.acquire().await.map_err(map_sqlx)?;
        // Guard first: a cancelled BEGIN must not leak the connection either.
        let mut tx = Self {
            conn,
            finished: false,
        };
        sqlx::query("BEGIN IMMEDIATE")
            .execute(&mut *tx.conn)
            .await
            .map_err(map_sqlx)?;
        Ok(tx)
    }

    async fn commit(mut self) -> Result<()> {
        sqlx::query("COMMIT")
            .execute(&mut *self.conn)
            .await
            .map_err(map_sqlx)?;
        self.finished = true;
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        sqlx::query("ROLLBACK")
            .execute(&mut *self.conn)
            .await
            .map_err(map_sqlx)?;
        self.finished = true;
        Ok(())
    }
}

impl std::ops::Deref for ImmediateTransaction {
    type Target = SqliteConnection;

    fn deref(&self) -> &Self::Target {
        &self.conn
    }
}

impl std::ops::DerefMut for ImmediateTransaction {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.conn
    }
}

impl Drop for ImmediateTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.conn.close_on_drop();
        }
    }
}

fn is_sqlite_busy(err: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = err else {
        let msg = err.to_string().to_ascii_lowercase();
        return msg.contains("database is locked") || msg.contains("database is busy");
    };

    let code = db_err.code().map(Cow::into_owned);
    if matches!(code.as_deref(), Some("5") | Some("6")) {
        return true;
    }

    let msg = db_err.message().to_ascii_lowercase();
    msg.contains("database is locked") || msg.contains("database is busy")
}

/// Connectivity and lock contention surface as `StoreUnavailable`.
fn map_sqlx(err: sqlx::Error) -> Error {
    let unavailable = matches!(
        err,
        sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::WorkerCrashed
    ) || is_sqlite_busy(&err);

    if unavailable {
        Error::store(err.to_string())
    } else {
        Error::Database(err)
    }
}

async fn retry_on_busy<T, F, Fut>(op_name: &'static str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempt = 0usize;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if !is_sqlite_busy(&err) || attempt >= SQLITE_BUSY_MAX_RETRIES {
                    return Err(map_sqlx(err));
                }

                let exp_backoff_ms = SQLITE_BUSY_BASE_DELAY_MS.saturating_mul(1u64 << attempt);
                let capped_ms = exp_backoff_ms.min(SQLITE_BUSY_MAX_DELAY_MS);
                let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
                let delay =
                    Duration::from_millis((capped_ms + jitter_ms).min(SQLITE_BUSY_MAX_DELAY_MS));

                debug!(
                    "SQLite busy during {}, retrying in {:?} (attempt {}/{})",
                    op_name,
                    delay,
                    attempt + 1,
                    SQLITE_BUSY_MAX_RETRIES
                );

                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// A [`SharedStore`] persisted in a SQLite database file.
///
/// Every process that opens the same file sees the same records, which is how
/// spawned workers report back to their manager.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `database_url` and ensure the schema.
    ///
    /// # Arguments
    /// * `database_url` - SQLite URL, e.g. `sqlite:/var/lib/copr/backend-state.db?mode=rwc`
    pub async fn connect(database_url: &str) -> Result<Self> {
        let connect_options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| Error::config(format!("invalid store url '{}': {}", database_url, e)))?
            // Enable WAL mode for concurrent reads during writes
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(DEFAULT_POOL_SIZE)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(connect_options)
            .await
            .map_err(map_sqlx)?;

        let store = Self::from_pool(pool).await?;
        info!("Shared state store opened at {}", database_url);
        Ok(store)
    }

    /// Wrap an existing pool, creating the tables if they are missing.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(map_sqlx)?;
        }
        Ok(Self { pool })
    }

    /// Delete control messages older than `max_age`. Returns the number removed.
    pub async fn prune_messages(&self, max_age: Duration) -> Result<u64> {
        let cutoff = chrono::Utc::now()
            - chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::zero());
        let cutoff = cutoff.to_rfc3339();
        let done = retry_on_busy("prune_messages", || {
            sqlx::query("DELETE FROM store_messages WHERE created_at < ?")
                .bind(&cutoff)
                .execute(&self.pool)
        })
        .await?;
        Ok(done.rows_affected())
    }

    async fn script_in_transaction(
        conn: &mut SqliteConnection,
        pattern: &str,
        script: &mut Script<'_>,
    ) -> Result<()> {
        let compiled = compile_pattern(pattern)?;
        let rows = sqlx::query("SELECT key, field, value FROM store_hash WHERE key GLOB ? ORDER BY key")
            .bind(pattern)
            .fetch_all(&mut *conn)
            .await
            .map_err(map_sqlx)?;

        let mut records: BTreeMap<String, Record> = BTreeMap::new();
        for row in rows {
            let key: String = row.try_get("key")?;
            let field: String = row.try_get("field")?;
            let value: String = row.try_get("value")?;
            records.entry(key).or_default().insert(field, value);
        }

        let mut view = ScriptView::new(compiled, records);
        script(&mut view)?;

        for (key, record) in view.into_changes() {
            sqlx::query("DELETE FROM store_hash WHERE key = ?")
                .bind(&key)
                .execute(&mut *conn)
                .await
                .map_err(map_sqlx)?;
            for (field, value) in record.unwrap_or_default() {
                sqlx::query("INSERT INTO store_hash (key, field, value) VALUES (?, ?, ?)")
                    .bind(&key)
                    .bind(&field)
                    .bind(&value)
                    .execute(&mut *conn)
                    .await
                    .map_err(map_sqlx)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl SharedStore for SqliteStore {
    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        compile_pattern(pattern)?;
        let rows = sqlx::query("SELECT DISTINCT key FROM store_hash WHERE key GLOB ? ORDER BY key")
            .bind(pattern)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("key").map_err(Error::from))
            .collect()
    }

    async fn hset(&self, key: &str, field: &str, value: &str) -> Result<()> {
        retry_on_busy("hset", || {
            sqlx::query(
                r#"
                INSERT INTO store_hash (key, field, value) VALUES (?, ?, ?)
                ON CONFLICT (key, field) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(key)
            .bind(field)
            .bind(value)
            .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    async fn hset_many(&self, key: &str, fields: &[(&str, &str)]) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;
        for (field, value) in fields {
            sqlx::query(
                r#"
                INSERT INTO store_hash (key, field, value) VALUES (?, ?, ?)
                ON CONFLICT (key, field) DO UPDATE SET value = excluded.value
                "#,
            )
            .bind(key)
            .bind(*field)
            .bind(*value)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        }
        tx.commit().await.map_err(map_sqlx)?;
        Ok(())
    }

    async fn hget(&self, key: &str, field: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM store_hash WHERE key = ? AND field = ?")
            .bind(key)
            .bind(field)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?;
        match row {
            Some(row) => Ok(Some(row.try_get("value")?)),
            None => Ok(None),
        }
    }

    async fn hgetall(&self, key: &str) -> Result<Record> {
        let rows = sqlx::query("SELECT field, value FROM store_hash WHERE key = ?")
            .bind(key)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx)?;
        let mut record = Record::new();
        for row in rows {
            record.insert(row.try_get("field")?, row.try_get("value")?);
        }
        Ok(record)
    }

    async fn hdel(&self, key: &str, field: &str) -> Result<()> {
        retry_on_busy("hdel", || {
            sqlx::query("DELETE FROM store_hash WHERE key = ? AND field = ?")
                .bind(key)
                .bind(field)
                .execute(&self.pool)
        })
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let done = retry_on_busy("delete", || {
            sqlx::query("DELETE FROM store_hash WHERE key = ?")
                .bind(key)
                .execute(&self.pool)
        })
        .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn run_script(&self, pattern: &str, script: &mut Script<'_>) -> Result<()> {
        let mut tx = ImmediateTransaction::begin(&self.pool).await?;
        match Self::script_in_transaction(&mut tx, pattern, script).await {
            Ok(()) => tx.commit().await,
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "Failed to roll back store script");
                }
                Err(err)
            }
        }
    }

    async fn publish(&self, channel: &str, payload: &str) -> Result<i64> {
        let now = chrono::Utc::now().to_rfc3339();
        let done = retry_on_busy("publish", || {
            sqlx::query("INSERT INTO store_messages (channel, payload, created_at) VALUES (?, ?, ?)")
                .bind(channel)
                .bind(payload)
                .bind(&now)
                .execute(&self.pool)
        })
        .await?;
        Ok(done.last_insert_rowid())
    }

    async fn poll_messages(
        &self,
        channel: &str,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<StoreMessage>> {
        let rows = sqlx::query(
            "SELECT id, channel, payload FROM store_messages WHERE channel = ? AND id > ? ORDER BY id LIMIT ?",
        )
        .bind(channel)
        .bind(after_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| {
                Ok(StoreMessage {
                    id: row.try_get("id")?,
                    channel: row.try_get("channel")?,
                    payload: row.try_get("payload")?,
                })
            })
            .collect()
    }

    async fn last_message_id(&self, channel: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(id), 0) AS last_id FROM store_messages WHERE channel = ?")
            .bind(channel)
            .fetch_one(&self.pool)
            .await
            .map_err(map_sqlx)?;
        Ok(row.try_get("last_id")?)
    }
}
