//! PostgreSQL store.
//!
//! The keyspace is spread over four tables: `deferwork_keys` records each
//! key's kind and expiry, and the hash fields, set members and list items
//! hang off it with `ON DELETE CASCADE`. Expired keys are filtered out of every
//! read and purged before every write to the same key.
//!
//! Transactions take a transaction-scoped advisory lock per key, in sorted
//! key order, before evaluating their checks. Two commits touching a common
//! key therefore run one after the other.

use super::{Check, KeyKind, KeyTtl, Op, Store, Transaction};
use crate::{DeferworkError, Result, config::StoreConfig};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool, Row, postgres::PgPoolOptions};
use std::{collections::HashMap, time::Duration};
use tracing::{debug, info};

const LIVE: &str = "(k.expires_at IS NULL OR k.expires_at > NOW())";

/// A [`Store`] backed by PostgreSQL tables.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self> {
        let pool = PgPool::connect(url).await?;
        info!("Connected to PostgreSQL store");
        Ok(Self::new(pool))
    }

    /// Connect using the `[store]` section of the configuration.
    pub async fn from_config(config: &StoreConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_secs(config.connection_timeout_secs))
            .connect(&config.url)
            .await?;
        info!("Connected to PostgreSQL store");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the tables and indexes if they do not exist yet.
    pub async fn create_tables(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS deferwork_keys (
                key TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                expires_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS deferwork_hash_fields (
                key TEXT NOT NULL REFERENCES deferwork_keys(key) ON DELETE CASCADE,
                field TEXT NOT NULL,
                value BYTEA NOT NULL,
                PRIMARY KEY (key, field)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS deferwork_set_members (
                key TEXT NOT NULL REFERENCES deferwork_keys(key) ON DELETE CASCADE,
                member TEXT NOT NULL,
                PRIMARY KEY (key, member)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS deferwork_list_items (
                id BIGSERIAL PRIMARY KEY,
                key TEXT NOT NULL REFERENCES deferwork_keys(key) ON DELETE CASCADE,
                value TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_deferwork_list_items_key ON deferwork_list_items (key, id)",
            "CREATE INDEX IF NOT EXISTS idx_deferwork_keys_expires_at ON deferwork_keys (expires_at) WHERE expires_at IS NOT NULL",
        ];

        for statement in statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        info!("Created deferwork tables");
        Ok(())
    }

    /// Delete every expired key. Reads already ignore them; this reclaims
    /// the space.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM deferwork_keys WHERE expires_at IS NOT NULL AND expires_at <= NOW()",
        )
        .execute(&self.pool)
        .await?;
        debug!(purged = result.rows_affected(), "Purged expired keys");
        Ok(result.rows_affected())
    }
}

async fn purge(conn: &mut PgConnection, key: &str) -> Result<()> {
    sqlx::query(
        "DELETE FROM deferwork_keys WHERE key = $1 AND expires_at IS NOT NULL AND expires_at <= NOW()",
    )
    .bind(key)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn live_kind(conn: &mut PgConnection, key: &str) -> Result<Option<KeyKind>> {
    let row = sqlx::query(&format!(
        "SELECT k.kind FROM deferwork_keys k WHERE k.key = $1 AND {}",
        LIVE
    ))
    .bind(key)
    .fetch_optional(&mut *conn)
    .await?;

    match row {
        None => Ok(None),
        Some(row) => {
            let kind: String = row.get("kind");
            KeyKind::parse(&kind)
                .map(Some)
                .ok_or_else(|| DeferworkError::Store {
                    message: format!("key '{}' has unknown kind '{}'", key, kind),
                })
        }
    }
}

/// Purge `key` if expired and make sure it exists as `kind`.
async fn ensure_key(conn: &mut PgConnection, key: &str, kind: KeyKind) -> Result<()> {
    purge(conn, key).await?;
    sqlx::query("INSERT INTO deferwork_keys (key, kind) VALUES ($1, $2) ON CONFLICT (key) DO NOTHING")
        .bind(key)
        .bind(kind.as_str())
        .execute(&mut *conn)
        .await?;
    check_kind(conn, key, kind).await
}

async fn check_kind(conn: &mut PgConnection, key: &str, expected: KeyKind) -> Result<()> {
    match live_kind(conn, key).await? {
        Some(actual) if actual != expected => Err(DeferworkError::Store {
            message: format!(
                "key '{}' holds a {}, not a {}",
                key,
                actual.as_str(),
                expected.as_str()
            ),
        }),
        _ => Ok(()),
    }
}

/// Collections disappear with their last element.
async fn drop_if_empty(conn: &mut PgConnection, key: &str) -> Result<()> {
    sqlx::query(
        r#"
        DELETE FROM deferwork_keys
        WHERE key = $1
          AND NOT EXISTS (SELECT 1 FROM deferwork_hash_fields WHERE key = $1)
          AND NOT EXISTS (SELECT 1 FROM deferwork_set_members WHERE key = $1)
          AND NOT EXISTS (SELECT 1 FROM deferwork_list_items WHERE key = $1)
        "#,
    )
    .bind(key)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn hash_set_fields(conn: &mut PgConnection, key: &str, fields: &[(String, Vec<u8>)]) -> Result<()> {
    ensure_key(conn, key, KeyKind::Hash).await?;
    for (field, value) in fields {
        sqlx::query(
            r#"
            INSERT INTO deferwork_hash_fields (key, field, value) VALUES ($1, $2, $3)
            ON CONFLICT (key, field) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(key)
        .bind(field)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

async fn add_member(conn: &mut PgConnection, key: &str, member: &str) -> Result<bool> {
    ensure_key(conn, key, KeyKind::Set).await?;
    let result = sqlx::query(
        "INSERT INTO deferwork_set_members (key, member) VALUES ($1, $2) ON CONFLICT DO NOTHING",
    )
    .bind(key)
    .bind(member)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() > 0)
}

async fn remove_member(conn: &mut PgConnection, key: &str, member: &str) -> Result<bool> {
    purge(conn, key).await?;
    check_kind(conn, key, KeyKind::Set).await?;
    let result = sqlx::query("DELETE FROM deferwork_set_members WHERE key = $1 AND member = $2")
        .bind(key)
        .bind(member)
        .execute(&mut *conn)
        .await?;
    drop_if_empty(conn, key).await?;
    Ok(result.rows_affected() > 0)
}

async fn push_item(conn: &mut PgConnection, key: &str, value: &str) -> Result<u64> {
    ensure_key(conn, key, KeyKind::List).await?;
    sqlx::query("INSERT INTO deferwork_list_items (key, value) VALUES ($1, $2)")
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    let length: i64 = sqlx::query("SELECT COUNT(*) AS length FROM deferwork_list_items WHERE key = $1")
        .bind(key)
        .fetch_one(&mut *conn)
        .await?
        .get("length");
    Ok(length as u64)
}

async fn remove_items(conn: &mut PgConnection, key: &str, value: &str) -> Result<u64> {
    purge(conn, key).await?;
    check_kind(conn, key, KeyKind::List).await?;
    let result = sqlx::query("DELETE FROM deferwork_list_items WHERE key = $1 AND value = $2")
        .bind(key)
        .bind(value)
        .execute(&mut *conn)
        .await?;
    drop_if_empty(conn, key).await?;
    Ok(result.rows_affected())
}

async fn check_holds(conn: &mut PgConnection, check: &Check) -> Result<bool> {
    match check {
        Check::FieldEquals { key, field, value } => {
            check_kind(conn, key, KeyKind::Hash).await?;
            let row = sqlx::query(&format!(
                r#"
                SELECT h.value FROM deferwork_hash_fields h
                JOIN deferwork_keys k ON k.key = h.key
                WHERE h.key = $1 AND h.field = $2 AND {}
                "#,
                LIVE
            ))
            .bind(key)
            .bind(field)
            .fetch_optional(&mut *conn)
            .await?;
            Ok(row.is_some_and(|row| row.get::<Vec<u8>, _>("value") == value.as_bytes()))
        }
        Check::IsMember { key, member } => {
            check_kind(conn, key, KeyKind::Set).await?;
            let row = sqlx::query(&format!(
                r#"
                SELECT 1 AS present FROM deferwork_set_members s
                JOIN deferwork_keys k ON k.key = s.key
                WHERE s.key = $1 AND s.member = $2 AND {}
                "#,
                LIVE
            ))
            .bind(key)
            .bind(member)
            .fetch_optional(&mut *conn)
            .await?;
            Ok(row.is_some())
        }
    }
}

async fn apply_op(conn: &mut PgConnection, op: &Op) -> Result<()> {
    match op {
        Op::HashSet { key, field, value } => {
            hash_set_fields(conn, key, &[(field.clone(), value.as_bytes().to_vec())]).await
        }
        Op::SetAdd { key, member } => add_member(conn, key, member).await.map(|_| ()),
        Op::SetRemove { key, member } => remove_member(conn, key, member).await.map(|_| ()),
        Op::ListPush { key, value } => push_item(conn, key, value).await.map(|_| ()),
        Op::ListRemove { key, value } => remove_items(conn, key, value).await.map(|_| ()),
    }
}

/// Serialization failures and deadlocks are worth retrying.
fn conflict_or(error: sqlx::Error, key: &str) -> DeferworkError {
    if let sqlx::Error::Database(db) = &error {
        if matches!(db.code().as_deref(), Some("40001" | "40P01")) {
            return DeferworkError::TransactionConflict {
                key: key.to_string(),
                attempts: 1,
            };
        }
    }
    DeferworkError::Database(error)
}

#[async_trait]
impl Store for PostgresStore {
    async fn hash_set(&self, key: &str, fields: &[(String, Vec<u8>)]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        hash_set_fields(&mut tx, key, fields).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let mut conn = self.pool.acquire().await?;
        check_kind(&mut conn, key, KeyKind::Hash).await?;
        let row = sqlx::query(&format!(
            r#"
            SELECT h.value FROM deferwork_hash_fields h
            JOIN deferwork_keys k ON k.key = h.key
            WHERE h.key = $1 AND h.field = $2 AND {}
            "#,
            LIVE
        ))
        .bind(key)
        .bind(field)
        .fetch_optional(&mut *conn)
        .await?;
        Ok(row.map(|row| row.get("value")))
    }

    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, Vec<u8>>> {
        let mut conn = self.pool.acquire().await?;
        check_kind(&mut conn, key, KeyKind::Hash).await?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT h.field, h.value FROM deferwork_hash_fields h
            JOIN deferwork_keys k ON k.key = h.key
            WHERE h.key = $1 AND {}
            "#,
            LIVE
        ))
        .bind(key)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get("field"), row.get("value")))
            .collect())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(live_kind(&mut conn, key).await?.is_some())
    }

    async fn key_kind(&self, key: &str) -> Result<Option<KeyKind>> {
        let mut conn = self.pool.acquire().await?;
        live_kind(&mut conn, key).await
    }

    async fn delete(&self, keys: &[String]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut tx = self.pool.begin().await?;
        for key in keys {
            purge(&mut tx, key).await?;
        }
        let result = sqlx::query("DELETE FROM deferwork_keys WHERE key = ANY($1)")
            .bind(keys.to_vec())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    async fn expire_at(&self, key: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(&format!(
            "UPDATE deferwork_keys k SET expires_at = $2 WHERE k.key = $1 AND {}",
            LIVE
        ))
        .bind(key)
        .bind(at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn persist(&self, key: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE deferwork_keys SET expires_at = NULL WHERE key = $1 AND expires_at > NOW()",
        )
        .bind(key)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl> {
        let row = sqlx::query(&format!(
            r#"
            SELECT (EXTRACT(EPOCH FROM (k.expires_at - NOW())) * 1000)::BIGINT AS millis
            FROM deferwork_keys k
            WHERE k.key = $1 AND {}
            "#,
            LIVE
        ))
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match row {
            None => KeyTtl::Missing,
            Some(row) => match row.get::<Option<i64>, _>("millis") {
                None => KeyTtl::Persistent,
                Some(millis) => KeyTtl::from_millis(millis),
            },
        })
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let added = add_member(&mut tx, key, member).await?;
        tx.commit().await?;
        Ok(added)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        let removed = remove_member(&mut tx, key, member).await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        check_kind(&mut conn, key, KeyKind::Set).await?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT s.member FROM deferwork_set_members s
            JOIN deferwork_keys k ON k.key = s.key
            WHERE s.key = $1 AND {}
            ORDER BY s.member
            "#,
            LIVE
        ))
        .bind(key)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.into_iter().map(|row| row.get("member")).collect())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        check_holds(
            &mut conn,
            &Check::IsMember {
                key: key.to_string(),
                member: member.to_string(),
            },
        )
        .await
    }

    async fn list_push(&self, key: &str, value: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let length = push_item(&mut tx, key, value).await?;
        tx.commit().await?;
        Ok(length)
    }

    async fn list_pop_front(&self, key: &str) -> Result<Option<String>> {
        let mut tx = self.pool.begin().await?;
        purge(&mut tx, key).await?;
        check_kind(&mut tx, key, KeyKind::List).await?;
        let row = sqlx::query(
            r#"
            DELETE FROM deferwork_list_items
            WHERE id = (
                SELECT id FROM deferwork_list_items
                WHERE key = $1
                ORDER BY id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING value
            "#,
        )
        .bind(key)
        .fetch_optional(&mut *tx)
        .await?;
        drop_if_empty(&mut tx, key).await?;
        tx.commit().await?;
        Ok(row.map(|row| row.get("value")))
    }

    async fn list_range(&self, key: &str) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        check_kind(&mut conn, key, KeyKind::List).await?;
        let rows = sqlx::query(&format!(
            r#"
            SELECT l.value FROM deferwork_list_items l
            JOIN deferwork_keys k ON k.key = l.key
            WHERE l.key = $1 AND {}
            ORDER BY l.id
            "#,
            LIVE
        ))
        .bind(key)
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows.into_iter().map(|row| row.get("value")).collect())
    }

    async fn list_remove(&self, key: &str, value: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        let removed = remove_items(&mut tx, key, value).await?;
        tx.commit().await?;
        Ok(removed)
    }

    async fn commit(&self, transaction: &Transaction) -> Result<bool> {
        let keys = transaction.keys();
        let first_key = keys.first().copied().unwrap_or_default();

        let mut tx = self.pool.begin().await?;
        for key in &keys {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(*key)
                .execute(&mut *tx)
                .await
                .map_err(|e| conflict_or(e, key))?;
            purge(&mut tx, key).await?;
        }

        for check in transaction.checks() {
            if !check_holds(&mut tx, check).await? {
                tx.rollback().await?;
                return Ok(false);
            }
        }

        for op in transaction.ops() {
            apply_op(&mut tx, op).await?;
        }
        tx.commit().await.map_err(|e| conflict_or(e, first_key))?;
        debug!(keys = keys.len(), "Committed transaction");
        Ok(true)
    }
}
