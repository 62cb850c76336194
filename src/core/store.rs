use anyhow::Context;
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::path::Path;

/// Key/value settings persisted in SQLite.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(db_path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await
                .with_context(|| format!("create_dir_all {}", parent.display()))?;
        }

        let abs = if db_path.is_absolute() {
            db_path.to_path_buf()
        } else {
            std::env::current_dir()
                .with_context(|| "current_dir")?
                .join(db_path)
        };

        let mut p = abs.to_string_lossy().to_string();
        if cfg!(windows) {
            p = p.replace('\\', "/");
        }

        // mode=rwc creates the file on first use
        let url = if p.starts_with('/') {
            format!("sqlite://{}?mode=rwc", p)
        } else {
            format!("sqlite:///{}?mode=rwc", p)
        };

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&url)
            .await
            .with_context(|| format!("connect sqlite url={} (file={})", url, abs.display()))?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
              key TEXT PRIMARY KEY NOT NULL,
              value TEXT NOT NULL,
              updated_at INTEGER NOT NULL
            );
            "#,
        )
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn now_epoch() -> i64 {
        chrono::Utc::now().timestamp()
    }

    pub async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        let row = sqlx::query(r#"SELECT value FROM settings WHERE key = ?"#)
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("read setting {key}"))?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    pub async fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at;
            "#,
        )
            .bind(key)
            .bind(value)
            .bind(Self::now_epoch())
            .execute(&self.pool)
            .await
            .with_context(|| format!("write setting {key}"))?;
        Ok(())
    }

    /// Returns whether a value was present.
    pub async fn remove(&self, key: &str) -> anyhow::Result<bool> {
        let done = sqlx::query(r#"DELETE FROM settings WHERE key = ?"#)
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(done.rows_affected() > 0)
    }

    pub async fn all(&self) -> anyhow::Result<HashMap<String, String>> {
        let rows = sqlx::query(r#"SELECT key, value FROM settings"#)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get::<String, _>("key"), r.get::<String, _>("value")))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn settings_round_trip_and_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("nested/settings.sqlite")).await.unwrap();

        assert_eq!(store.get("api_url").await.unwrap(), None);
        store.set("api_url", "https://a.example").await.unwrap();
        store.set("api_url", "https://b.example").await.unwrap();
        store.set("output_path", "./out").await.unwrap();
        assert_eq!(store.get("api_url").await.unwrap().as_deref(), Some("https://b.example"));

        let all = store.all().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(store.remove("api_url").await.unwrap());
        assert!(!store.remove("api_url").await.unwrap());
        assert_eq!(store.get("api_url").await.unwrap(), None);
    }

    #[tokio::test]
    async fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.sqlite");
        SqliteStore::open(&path).await.unwrap().set("k", "v").await.unwrap();
        let reopened = SqliteStore::open(&path).await.unwrap();
        assert_eq!(reopened.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
