//! Hierarchical key-value store over SQLite.
//!
//! The store exposes a JSON tree addressed by `/`-separated paths with the
//! four operations the dashboard needs: `get`, `push`, `update`, `remove`
//! (plus `set`, and `batch` for several writes in one transaction).  Each JSON leaf is one row `(path, value)`; objects exist
//! only implicitly through their leaves, so an empty object or `null`
//! stores nothing.

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, Transaction};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use time::OffsetDateTime;

/// Logical paths used by the dashboard.
pub mod paths {
    pub fn device(device_id: &str) -> String {
        format!("devices/{device_id}")
    }

    pub fn history(device_id: &str, metric: &str) -> String {
        format!("history/{device_id}/{metric}")
    }

    pub fn history_root(device_id: &str) -> String {
        format!("history/{device_id}")
    }
}

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// db_url examples:
    /// - "sqlite:/var/lib/irrigation/dashboard.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // Every connection to ":memory:" is a separate database, so pin the
        // pool to one connection that never expires.
        let pool_options = if db_url.contains(":memory:") {
            SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(5)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Reads
    // ----------------------------

    /// Read the subtree at `path`, or `None` when nothing is stored there.
    pub async fn get(&self, path: &str) -> Result<Option<Value>> {
        let path = normalize(path);

        let rows: Vec<(String, String)> = if path.is_empty() {
            sqlx::query_as::<_, (String, String)>("SELECT path, value FROM nodes ORDER BY path")
                .fetch_all(&self.pool)
                .await
        } else {
            let (lo, hi) = descendant_range(&path);
            sqlx::query_as::<_, (String, String)>(
                r#"
                SELECT path, value FROM nodes
                WHERE path = ? OR (path >= ? AND path < ?)
                ORDER BY path
                "#,
            )
            .bind(&path)
            .bind(lo)
            .bind(hi)
            .fetch_all(&self.pool)
            .await
        }
        .with_context(|| format!("get failed: {path}"))?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut root = Value::Null;
        for (row_path, raw) in rows {
            let leaf: Value = serde_json::from_str(&raw)
                .with_context(|| format!("corrupt value at {row_path}"))?;
            let rel = relative(&path, &row_path);
            insert_at(&mut root, rel, leaf);
        }
        Ok(Some(root))
    }

    // ----------------------------
    // Writes
    // ----------------------------

    /// Replace the subtree at `path` with `value`.
    pub async fn set(&self, path: &str, value: &Value) -> Result<()> {
        self.batch(vec![Op::Set(path.to_string(), value.clone())])
            .await?;
        Ok(())
    }

    /// Append `value` under a new time-ordered child key of `path` and
    /// return the key.
    pub async fn push(&self, path: &str, value: &Value) -> Result<String> {
        let keys = self
            .batch(vec![Op::Push(path.to_string(), value.clone())])
            .await
            .with_context(|| format!("push failed: {path}"))?;
        keys.into_iter()
            .next()
            .with_context(|| format!("push produced no key: {path}"))
    }

    /// Merge-patch: each field of `fields` replaces the subtree at
    /// `path/field`; siblings not named are untouched.  Field names may
    /// themselves contain `/`.
    pub async fn update(&self, path: &str, fields: &Map<String, Value>) -> Result<()> {
        self.batch(vec![Op::Update(path.to_string(), fields.clone())])
            .await
            .with_context(|| format!("update failed: {path}"))?;
        Ok(())
    }

    /// Delete the subtree at `path`.
    pub async fn remove(&self, path: &str) -> Result<()> {
        self.batch(vec![Op::Remove(path.to_string())])
            .await
            .with_context(|| format!("remove failed: {path}"))?;
        Ok(())
    }

    /// Apply `ops` in order inside one transaction: either every write lands
    /// or none does.  Returns the keys generated by `Push` ops, in order.
    pub async fn batch(&self, ops: Vec<Op>) -> Result<Vec<String>> {
        let mut tx = self.pool.begin().await.context("begin failed")?;
        let mut keys = Vec::new();

        for op in &ops {
            match op {
                Op::Set(path, value) => {
                    write_subtree(&mut tx, &normalize(path), value).await?;
                }
                Op::Push(path, value) => {
                    let key = next_push_key();
                    let child = format!("{}/{key}", normalize(path));
                    write_subtree(&mut tx, &child, value).await?;
                    keys.push(key);
                }
                Op::Update(path, fields) => {
                    let base = normalize(path);
                    for (k, v) in fields {
                        let child = normalize(&format!("{base}/{k}"));
                        write_subtree(&mut tx, &child, v).await?;
                    }
                }
                Op::Remove(path) => {
                    delete_subtree(&mut tx, &normalize(path)).await?;
                }
            }
        }

        tx.commit().await.context("commit failed")?;
        Ok(keys)
    }
}

/// One write inside [`Store::batch`].
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Set(String, Value),
    Push(String, Value),
    Update(String, Map<String, Value>),
    Remove(String),
}

/// An object key that cannot be stored as one path segment.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid key {key:?} under '{parent}': keys must be non-empty and must not contain '/'")]
pub struct InvalidKey {
    pub parent: String,
    pub key: String,
}

// ---------------------------------------------------------------------------
// Transaction helpers
// ---------------------------------------------------------------------------

async fn write_subtree(tx: &mut Transaction<'_, Sqlite>, path: &str, value: &Value) -> Result<()> {
    // Check keys before touching anything so a bad document never replaces
    // a good one.
    let mut leaves = Vec::new();
    flatten(path, value, &mut leaves)?;

    delete_subtree(tx, path).await?;

    // A leaf stored at an ancestor would shadow the new subtree.
    for ancestor in ancestors(path) {
        sqlx::query("DELETE FROM nodes WHERE path = ?")
            .bind(ancestor)
            .execute(&mut **tx)
            .await
            .context("delete ancestor failed")?;
    }

    for (leaf_path, raw) in leaves {
        sqlx::query("INSERT INTO nodes (path, value) VALUES (?, ?)")
            .bind(&leaf_path)
            .bind(raw)
            .execute(&mut **tx)
            .await
            .with_context(|| format!("insert failed: {leaf_path}"))?;
    }
    Ok(())
}

async fn delete_subtree(tx: &mut Transaction<'_, Sqlite>, path: &str) -> Result<()> {
    if path.is_empty() {
        sqlx::query("DELETE FROM nodes")
            .execute(&mut **tx)
            .await
            .context("delete all failed")?;
        return Ok(());
    }
    let (lo, hi) = descendant_range(path);
    sqlx::query("DELETE FROM nodes WHERE path = ? OR (path >= ? AND path < ?)")
        .bind(path)
        .bind(lo)
        .bind(hi)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("delete failed: {path}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Path / tree helpers
// ---------------------------------------------------------------------------

/// Collapse repeated, leading and trailing slashes.
fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Half-open byte range `[path/, path0)` holding every descendant of
/// `path` (`0` is the byte after `/`).
fn descendant_range(path: &str) -> (String, String) {
    (format!("{path}/"), format!("{path}0"))
}

fn ancestors(path: &str) -> Vec<&str> {
    path.match_indices('/').map(|(i, _)| &path[..i]).collect()
}

fn relative<'a>(base: &str, full: &'a str) -> &'a str {
    if base.is_empty() {
        full
    } else if full.len() == base.len() {
        ""
    } else {
        &full[base.len() + 1..]
    }
}

fn join(base: &str, key: &str) -> String {
    if base.is_empty() {
        key.to_string()
    } else {
        format!("{base}/{key}")
    }
}

/// Collect `(path, json)` leaves.  Object keys become path segments, so an
/// empty key or one containing `/` is an [`InvalidKey`].
fn flatten(path: &str, value: &Value, out: &mut Vec<(String, String)>) -> Result<(), InvalidKey> {
    match value {
        Value::Null => {}
        Value::Object(map) => {
            for (k, v) in map {
                if k.is_empty() || k.contains('/') {
                    return Err(InvalidKey {
                        parent: path.to_string(),
                        key: k.clone(),
                    });
                }
                flatten(&join(path, k), v, out)?;
            }
        }
        leaf => out.push((path.to_string(), leaf.to_string())),
    }
    Ok(())
}

fn insert_at(node: &mut Value, rel: &str, leaf: Value) {
    if rel.is_empty() {
        if !node.is_object() {
            *node = leaf;
        }
        return;
    }
    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    let (head, rest) = rel.split_once('/').unwrap_or((rel, ""));
    if let Value::Object(map) = node {
        let child = map.entry(head.to_string()).or_insert(Value::Null);
        insert_at(child, rest, leaf);
    }
}

/// Strictly increasing, zero-padded so lexical order is push order.
fn next_push_key() -> String {
    static LAST: AtomicU64 = AtomicU64::new(0);

    let now_us = (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000).max(0) as u64;
    let prev = LAST
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(now_us.max(last + 1))
        })
        .unwrap_or(now_us);
    let key = now_us.max(prev + 1);

    let suffix: String = std::iter::repeat_with(fastrand::alphanumeric)
        .take(4)
        .collect();
    format!("{key:020}-{suffix}")
}

// ===========================================================================
// Tests
// ===========================================================================
