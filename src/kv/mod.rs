//! Durable KV store backed by SQLite
//!
//! Holds the state that must survive restarts: packed browser storage
//! states (`api_sessions_store2`), passive download registrations
//! (`api_passive_url`), flag markers with TTL, and the disabled/blocklist
//! sets. Exposes the hash/string/set shapes the rest of the gateway keys
//! against.
//!
//! Expiry is lazy: expired rows are invisible to reads and deleted the next
//! time they are touched.

use anyhow::{Context, Result};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::time::Duration;

const SCHEMA: &str = r#"
create table if not exists kv_hash (
    ns         text not null,
    field      text not null,
    value      blob not null,
    expires_at integer,
    primary key (ns, field)
);
create table if not exists kv_string (
    key        text primary key,
    value      blob not null,
    expires_at integer
);
create table if not exists kv_set (
    ns     text not null,
    member text not null,
    primary key (ns, member)
);
"#;

/// SQLite-backed durable key/value store
#[derive(Debug, Clone)]
pub struct KvStore {
    pool: SqlitePool,
}

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn deadline(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|t| now_secs() + t.as_secs() as i64)
}

impl KvStore {
    /// Connect and apply the schema
    pub async fn connect(url: &str) -> Result<Self> {
        // An in-memory database exists per connection; pool it down to one
        // so every caller sees the same tables.
        let max_connections = if url.contains(":memory:") || url.contains("mode=memory") {
            1
        } else {
            8
        };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .with_context(|| format!("connecting kv store at {url}"))?;
        sqlx::raw_sql(SCHEMA)
            .execute(&pool)
            .await
            .context("applying kv schema")?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ---- hash maps ---------------------------------------------------

    pub async fn hset(
        &self,
        ns: &str,
        field: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<()> {
        sqlx::query(
            "insert into kv_hash (ns, field, value, expires_at) values (?, ?, ?, ?)
             on conflict (ns, field) do update set value = excluded.value,
             expires_at = excluded.expires_at",
        )
        .bind(ns)
        .bind(field)
        .bind(value)
        .bind(deadline(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn hget(&self, ns: &str, field: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query(
            "select value, expires_at from kv_hash where ns = ? and field = ?",
        )
        .bind(ns)
        .bind(field)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else { return Ok(None) };
        let expires_at: Option<i64> = row.get("expires_at");
        if matches!(expires_at, Some(dl) if dl <= now_secs()) {
            sqlx::query("delete from kv_hash where ns = ? and field = ?")
                .bind(ns)
                .bind(field)
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }
        Ok(Some(row.get("value")))
    }

    pub async fn hgetall(&self, ns: &str) -> Result<Vec<(String, Vec<u8>)>> {
        let rows = sqlx::query(
            "select field, value from kv_hash
             where ns = ? and (expires_at is null or expires_at > ?)",
        )
        .bind(ns)
        .bind(now_secs())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("field"), r.get("value")))
            .collect())
    }

    pub async fn hdel(&self, ns: &str, field: &str) -> Result<()> {
        sqlx::query("delete from kv_hash where ns = ? and field = ?")
            .bind(ns)
            .bind(field)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // ---- strings with TTL --------------------------------------------

    pub async fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        sqlx::query(
            "insert into kv_string (key, value, expires_at) values (?, ?, null)
             on conflict (key) do update set value = excluded.value,
             expires_at = null",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn set_ex(&self, key: &str, value: &[u8], ttl: Duration) -> Result<()> {
        sqlx::query(
            "insert into kv_string (key, value, expires_at) values (?, ?, ?)
             on conflict (key) do update set value = excluded.value,
             expires_at = excluded.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(deadline(Some(ttl)))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_string(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let row = sqlx::query("select value, expires_at from kv_string where key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        let Some(row) = row else { return Ok(None) };
        let expires_at: Option<i64> = row.get("expires_at");
        if matches!(expires_at, Some(dl) if dl <= now_secs()) {
            sqlx::query("delete from kv_string where key = ?")
                .bind(key)
                .execute(&self.pool)
                .await?;
            return Ok(None);
        }
        Ok(Some(row.get("value")))
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get_string(key).await?.is_some())
    }

    // ---- sets ---------------------------------------------------------

    pub async fn sadd(&self, ns: &str, member: &str) -> Result<()> {
        sqlx::query("insert or ignore into kv_set (ns, member) values (?, ?)")
            .bind(ns)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn srem(&self, ns: &str, member: &str) -> Result<()> {
        sqlx::query("delete from kv_set where ns = ? and member = ?")
            .bind(ns)
            .bind(member)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn sismember(&self, ns: &str, member: &str) -> Result<bool> {
        let row = sqlx::query("select 1 as hit from kv_set where ns = ? and member = ?")
            .bind(ns)
            .bind(member)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> KvStore {
        KvStore::connect("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn hash_roundtrip() {
        let kv = store().await;
        kv.hset("api_sessions_store2", "alice", b"state", None)
            .await
            .unwrap();
        assert_eq!(
            kv.hget("api_sessions_store2", "alice").await.unwrap(),
            Some(b"state".to_vec())
        );
        assert_eq!(kv.hget("api_sessions_store2", "bob").await.unwrap(), None);

        kv.hdel("api_sessions_store2", "alice").await.unwrap();
        assert_eq!(kv.hget("api_sessions_store2", "alice").await.unwrap(), None);
    }

    #[tokio::test]
    async fn plain_set_never_expires() {
        let kv = store().await;
        kv.set("proxy_state", b"packed").await.unwrap();
        assert_eq!(
            kv.get_string("proxy_state").await.unwrap(),
            Some(b"packed".to_vec())
        );
        // overwrite clears any earlier deadline
        kv.set_ex("proxy_state", b"old", Duration::from_secs(0))
            .await
            .unwrap();
        kv.set("proxy_state", b"fresh").await.unwrap();
        assert!(kv.exists("proxy_state").await.unwrap());
    }

    #[tokio::test]
    async fn string_ttl_expires() {
        let kv = store().await;
        kv.set_ex("api_flagged_context:alice", b"1", Duration::from_secs(0))
            .await
            .unwrap();
        // TTL of zero is already past
        assert!(!kv.exists("api_flagged_context:alice").await.unwrap());
    }

    #[tokio::test]
    async fn set_membership() {
        let kv = store().await;
        kv.sadd("global_blacklist", "999").await.unwrap();
        assert!(kv.sismember("global_blacklist", "999").await.unwrap());
        kv.srem("global_blacklist", "999").await.unwrap();
        assert!(!kv.sismember("global_blacklist", "999").await.unwrap());
    }
}
