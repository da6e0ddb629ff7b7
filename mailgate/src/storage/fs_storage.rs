use crate::storage::{Backend, StoreError};
use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use fs2::FileExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::fs;
use tracing::warn;

/// Single-file map backend.
///
/// The whole map lives in memory and is written to `<dir>/<name>.json` on
/// flush. Values are kept as decimal strings. Writes go to a temporary file
/// that is renamed over the old one, so a crash never leaves a torn file.
///
/// Several processes may share the directory. Each lock of the store takes an
/// exclusive `flock` on `<dir>/.<name>.lock` and re-reads the map, so a
/// read-modify-write never works on a stale copy. Writes made under a guard
/// that is dropped without `unlock` are thrown away by the next reload.
pub struct FileBackend {
    path: Utf8PathBuf,
    tmp_path: Utf8PathBuf,
    lock_file: Arc<std::fs::File>,
    locked: bool,
    entries: HashMap<String, String>,
    dirty: bool,
}

impl FileBackend {
    pub async fn open<P: AsRef<Utf8Path>>(dir: P, name: &str) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        match fs::metadata(dir).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => return Err(StoreError::open(name, format!("{} is not a directory", dir))),
            Err(e) => return Err(StoreError::open(name, format!("{}: {}", dir, e))),
        }

        let path = dir.join(format!("{}.json", name));
        let tmp_path = dir.join(format!(".{}.json.tmp", name));
        let lock_path = dir.join(format!(".{}.lock", name));

        let lock_file = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .await
            .map_err(|e| StoreError::open(name, format!("{}: {}", lock_path, e)))?
            .into_std()
            .await;

        let mut backend = FileBackend {
            path,
            tmp_path,
            lock_file: Arc::new(lock_file),
            locked: false,
            entries: HashMap::new(),
            dirty: false,
        };
        backend
            .acquire()
            .await
            .map_err(|e| StoreError::open(name, e))?;
        // Creating the file up front surfaces permission problems at start-up.
        let flushed = backend.flush().await;
        backend.release();
        flushed.map_err(|e| StoreError::open(name, e))?;
        Ok(backend)
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    fn parse(key: &str, raw: &str) -> Result<i64, StoreError> {
        raw.parse::<i64>()
            .map_err(|_| StoreError::Corrupt(format!("value {:?} for key {} is not a timestamp", raw, key)))
    }

    /// Replaces the in-memory map with the file's current contents.
    async fn load(&mut self) -> Result<(), StoreError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => {
                self.entries = serde_json::from_str(&contents)
                    .map_err(|e| StoreError::Corrupt(format!("{}: {}", self.path, e)))?;
                self.dirty = false;
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                self.entries.clear();
                self.dirty = true;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for FileBackend {
    async fn get(&mut self, key: &str) -> Result<Option<i64>, StoreError> {
        self.entries
            .get(key)
            .map(|raw| Self::parse(key, raw))
            .transpose()
    }

    async fn set(&mut self, key: &str, value: i64) -> Result<(), StoreError> {
        self.entries.insert(key.to_string(), value.to_string());
        self.dirty = true;
        Ok(())
    }

    async fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        if self.entries.remove(key).is_some() {
            self.dirty = true;
        }
        Ok(())
    }

    async fn purge_older_than(&mut self, cutoff: i64) -> Result<u64, StoreError> {
        let before = self.entries.len();
        // Unparsable values are dropped along with expired ones.
        self.entries
            .retain(|_, raw| raw.parse::<i64>().map(|v| v >= cutoff).unwrap_or(false));
        let removed = before - self.entries.len();
        if removed > 0 {
            self.dirty = true;
        }
        Ok(removed as u64)
    }

    async fn flush(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        let json = serde_json::to_string(&self.entries)
            .map_err(|e| StoreError::Corrupt(e.to_string()))?;
        fs::write(&self.tmp_path, json).await?;
        fs::rename(&self.tmp_path, &self.path).await?;
        self.dirty = false;
        Ok(())
    }

    async fn acquire(&mut self) -> Result<(), StoreError> {
        let lock_file = self.lock_file.clone();
        // flock blocks until the other holder lets go.
        tokio::task::spawn_blocking(move || FileExt::lock_exclusive(&*lock_file))
            .await
            .map_err(|e| StoreError::Backend(format!("lock task failed: {}", e)))??;
        self.locked = true;

        if let Err(e) = self.load().await {
            self.release();
            return Err(e);
        }
        Ok(())
    }

    fn release(&mut self) {
        if !self.locked {
            return;
        }
        self.locked = false;
        if let Err(e) = FileExt::unlock(&*self.lock_file) {
            warn!(path = %self.path, error = %e, "Failed to release store file lock");
        }
    }

    fn kind(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Store;
    use tempfile::tempdir;
    use tokio::test;

    fn utf8_dir(dir: &tempfile::TempDir) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
    }

    #[test]
    async fn test_open_creates_file() {
        let temp = tempdir().unwrap();
        let backend = FileBackend::open(utf8_dir(&temp), "greylist").await.unwrap();
        assert!(backend.path().exists());
        assert_eq!(backend.path().file_name(), Some("greylist.json"));
    }

    #[test]
    async fn test_open_missing_directory_fails() {
        let temp = tempdir().unwrap();
        let missing = utf8_dir(&temp).join("nope");
        let result = FileBackend::open(&missing, "greylist").await;
        assert!(matches!(result, Err(StoreError::Open { .. })));
    }

    #[test]
    async fn test_values_persist_after_unlock() {
        let temp = tempdir().unwrap();
        let dir = utf8_dir(&temp);

        let backend = FileBackend::open(&dir, "whitelist").await.unwrap();
        let store = Store::with_backend("whitelist", 60, 60, Box::new(backend));
        let mut guard = store.lock().await.unwrap();
        guard.set("abc", 1_700_000_000).await.unwrap();
        guard.set("gone", 1).await.unwrap();
        guard.delete("gone").await.unwrap();
        guard.unlock().await.unwrap();

        let raw = std::fs::read_to_string(dir.join("whitelist.json")).unwrap();
        let on_disk: HashMap<String, String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(on_disk.get("abc").map(String::as_str), Some("1700000000"));
        assert!(!on_disk.contains_key("gone"));

        let mut reopened = FileBackend::open(&dir, "whitelist").await.unwrap();
        assert_eq!(reopened.get("abc").await.unwrap(), Some(1_700_000_000));
    }

    #[test]
    async fn test_corrupt_values() {
        let temp = tempdir().unwrap();
        let dir = utf8_dir(&temp);
        std::fs::write(
            dir.join("dialback_good.json"),
            r#"{"ok":"100","bad":"not-a-number"}"#,
        )
        .unwrap();

        let mut backend = FileBackend::open(&dir, "dialback_good").await.unwrap();
        assert_eq!(backend.get("ok").await.unwrap(), Some(100));
        assert!(matches!(
            backend.get("bad").await,
            Err(StoreError::Corrupt(_))
        ));

        assert_eq!(backend.purge_older_than(50).await.unwrap(), 1);
        assert_eq!(backend.get("bad").await.unwrap(), None);
    }

    #[test]
    async fn test_two_handles_see_each_others_writes() {
        let temp = tempdir().unwrap();
        let dir = utf8_dir(&temp);

        let first = Store::with_backend(
            "greylist_not_passed",
            60,
            60,
            Box::new(FileBackend::open(&dir, "greylist_not_passed").await.unwrap()),
        );
        let second = Store::with_backend(
            "greylist_not_passed",
            60,
            60,
            Box::new(FileBackend::open(&dir, "greylist_not_passed").await.unwrap()),
        );

        let mut guard = first.lock().await.unwrap();
        guard.set("a", 100).await.unwrap();
        guard.unlock().await.unwrap();

        let mut guard = second.lock().await.unwrap();
        assert_eq!(guard.get("a").await.unwrap(), Some(100));
        guard.set("b", 200).await.unwrap();
        guard.unlock().await.unwrap();

        let mut guard = first.lock().await.unwrap();
        assert_eq!(guard.get("b").await.unwrap(), Some(200));
        guard.unlock().await.unwrap();

        let raw = std::fs::read_to_string(dir.join("greylist_not_passed.json")).unwrap();
        let on_disk: HashMap<String, String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(on_disk.len(), 2);
    }

    #[test]
    async fn test_lock_waits_for_other_handle() {
        let temp = tempdir().unwrap();
        let dir = utf8_dir(&temp);

        let first = Store::with_backend(
            "comeagain",
            60,
            60,
            Box::new(FileBackend::open(&dir, "comeagain").await.unwrap()),
        );
        let second = Store::with_backend(
            "comeagain",
            60,
            60,
            Box::new(FileBackend::open(&dir, "comeagain").await.unwrap()),
        );

        let mut held = first.lock().await.unwrap();
        let waiter = tokio::spawn(async move {
            let mut guard = second.lock().await.unwrap();
            let seen = guard.get("k").await.unwrap();
            guard.unlock().await.unwrap();
            seen
        });

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert!(!waiter.is_finished());

        held.set("k", 7).await.unwrap();
        held.unlock().await.unwrap();
        assert_eq!(waiter.await.unwrap(), Some(7));
    }

    #[test]
    async fn test_dropped_guard_discards_writes() {
        let temp = tempdir().unwrap();
        let dir = utf8_dir(&temp);
        let store = Store::with_backend(
            "whitelist",
            60,
            60,
            Box::new(FileBackend::open(&dir, "whitelist").await.unwrap()),
        );

        let mut guard = store.lock().await.unwrap();
        guard.set("k", 1).await.unwrap();
        drop(guard);

        let mut guard = store.lock().await.unwrap();
        assert_eq!(guard.get("k").await.unwrap(), None);
    }

    #[test]
    async fn test_unreadable_file_fails_open() {
        let temp = tempdir().unwrap();
        let dir = utf8_dir(&temp);
        std::fs::write(dir.join("comeagain.json"), "not json").unwrap();
        assert!(matches!(
            FileBackend::open(&dir, "comeagain").await,
            Err(StoreError::Open { .. })
        ));
    }
}
