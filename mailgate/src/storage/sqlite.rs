use crate::storage::sql::{ParamStyle, Statements};
use crate::storage::{Backend, StoreError};
use async_trait::async_trait;
use camino::Utf8Path;
use rusqlite::{ErrorCode, OptionalExtension};
use std::sync::{Arc, Mutex};

const DATABASE_FILE: &str = "mailgate.sqlite3";

/// Embedded SQL backend. All stores share one database file in the configured
/// directory, one table per store. Queries run on the blocking thread pool.
pub struct SqliteBackend {
    conn: Arc<Mutex<rusqlite::Connection>>,
    statements: Arc<Statements>,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl SqliteBackend {
    pub async fn open<P: AsRef<Utf8Path>>(dir: P, name: &str) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        if !dir.is_dir() {
            return Err(StoreError::open(name, format!("{} is not a directory", dir)));
        }
        let path = dir.join(DATABASE_FILE);
        let statements = Statements::new(name, ParamStyle::Qmark);

        let create_table = statements.create_table.clone();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = rusqlite::Connection::open(&path)?;
            conn.execute_batch(concat!(
                "PRAGMA journal_mode = WAL; ",
                "PRAGMA synchronous = NORMAL; ",
                "PRAGMA busy_timeout = 30000;"
            ))?;
            conn.execute(&create_table, [])?;
            Ok::<_, rusqlite::Error>(conn)
        })
        .await
        .map_err(|e| StoreError::open(name, e))?
        .map_err(|e| StoreError::open(name, e))?;

        Ok(SqliteBackend {
            conn: Arc::new(Mutex::new(conn)),
            statements: Arc::new(statements),
        })
    }

    async fn spawn_worker<U, V>(&self, f: U) -> Result<V, StoreError>
    where
        U: FnOnce(&rusqlite::Connection, &Statements) -> Result<V, StoreError> + Send + 'static,
        V: Send + 'static,
    {
        let conn = self.conn.clone();
        let statements = self.statements.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| StoreError::Backend("sqlite connection mutex poisoned".to_string()))?;
            f(&conn, &statements)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("sqlite worker failed: {}", e)))?
    }
}

#[async_trait]
impl Backend for SqliteBackend {
    async fn get(&mut self, key: &str) -> Result<Option<i64>, StoreError> {
        let key = key.to_string();
        self.spawn_worker(move |conn, st| {
            Ok(conn
                .prepare_cached(&st.select)?
                .query_row([&key], |row| row.get::<_, i64>(0))
                .optional()?)
        })
        .await
    }

    async fn set(&mut self, key: &str, value: i64) -> Result<(), StoreError> {
        let key = key.to_string();
        self.spawn_worker(move |conn, st| {
            match conn
                .prepare_cached(&st.insert)?
                .execute(rusqlite::params![key, value])
            {
                Err(rusqlite::Error::SqliteFailure(err, _))
                    if err.code == ErrorCode::ConstraintViolation =>
                {
                    conn.prepare_cached(&st.update)?
                        .execute(rusqlite::params![value, key])?;
                }
                result => {
                    result?;
                }
            }
            Ok(())
        })
        .await
    }

    async fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        let key = key.to_string();
        self.spawn_worker(move |conn, st| {
            conn.prepare_cached(&st.delete)?.execute([&key])?;
            Ok(())
        })
        .await
    }

    async fn purge_older_than(&mut self, cutoff: i64) -> Result<u64, StoreError> {
        self.spawn_worker(move |conn, st| {
            let removed = conn.prepare_cached(&st.purge)?.execute([cutoff])?;
            Ok(removed as u64)
        })
        .await
    }

    fn kind(&self) -> &'static str {
        "sqlite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino::Utf8PathBuf;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_upsert_and_purge() {
        let temp = tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let mut backend = SqliteBackend::open(&dir, "greylist_not_passed").await.unwrap();

        assert_eq!(backend.get("a").await.unwrap(), None);
        backend.set("a", 10).await.unwrap();
        // Second insert hits the primary key and falls back to an update.
        backend.set("a", 20).await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), Some(20));

        backend.set("b", 5).await.unwrap();
        assert_eq!(backend.purge_older_than(10).await.unwrap(), 1);
        assert_eq!(backend.get("b").await.unwrap(), None);

        backend.delete("a").await.unwrap();
        backend.delete("a").await.unwrap();
        assert_eq!(backend.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stores_share_file_but_not_tables() {
        let temp = tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        let mut good = SqliteBackend::open(&dir, "dialback_good").await.unwrap();
        let mut bad = SqliteBackend::open(&dir, "dialback_bad").await.unwrap();

        good.set("sender", 1).await.unwrap();
        assert_eq!(bad.get("sender").await.unwrap(), None);
        assert!(dir.join(DATABASE_FILE).exists());
    }

    #[tokio::test]
    async fn test_missing_directory() {
        let result = SqliteBackend::open("/nonexistent/mailgate", "whitelist").await;
        assert!(matches!(result, Err(StoreError::Open { .. })));
    }
}
