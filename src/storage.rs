use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::fs::{self, File};
use tokio::io::ErrorKind;
use tracing::{debug, warn};

use crate::atomic::AtomicFile;
use crate::config::STAGING_DIR;

/// Flat file store rooted at a single directory.
#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(self.staging_path()).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    fn staging_path(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Maps a stored name to its absolute path, requiring an existing regular file.
    pub async fn resolve(&self, name: &str) -> Result<PathBuf, StorageError> {
        check_stored_name(name)?;
        let root = fs::canonicalize(&self.root).await?;
        let target = match fs::canonicalize(self.root.join(name)).await {
            Ok(path) => path,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(PathError::NotFound.into());
            }
            Err(err) => return Err(err.into()),
        };
        if !target.starts_with(&root) || target == root {
            warn!(name, "resolved path escapes storage root");
            return Err(PathError::Traversal.into());
        }

        match fs::metadata(&target).await {
            Ok(metadata) if metadata.is_file() => Ok(target),
            Ok(_) => Err(PathError::NotFound.into()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(PathError::NotFound.into()),
            Err(err) => Err(err.into()),
        }
    }

    /// Opens a staged writer that publishes to `name` in one rename.
    pub async fn stage(&self, name: &str) -> Result<AtomicFile, StorageError> {
        check_stored_name(name)?;
        let staging = self.staging_path();
        fs::create_dir_all(&staging).await?;
        Ok(AtomicFile::create(&self.root.join(name), &staging).await?)
    }

    #[cfg(test)]
    pub async fn put(&self, name: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let mut staged = self.stage(name).await?;
        if let Err(err) = staged.write_chunk(bytes).await {
            staged.discard().await;
            return Err(err.into());
        }
        staged.publish().await?;
        Ok(())
    }

    pub async fn open(&self, name: &str) -> Result<(File, std::fs::Metadata), StorageError> {
        let target = self.resolve(name).await?;
        let file = match File::open(&target).await {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(PathError::NotFound.into());
            }
            Err(err) => return Err(err.into()),
        };
        let metadata = file.metadata().await?;
        Ok((file, metadata))
    }

    /// Lists regular files directly under the root. Order is unspecified.
    pub async fn list(&self) -> Result<Vec<StoredFile>, StorageError> {
        let mut dir = fs::read_dir(&self.root).await?;
        let mut entries = Vec::new();

        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            // 遍历期间可能被并发删除
            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            };
            entries.push(StoredFile {
                name: entry.file_name().to_string_lossy().to_string(),
                size: metadata.len(),
                modified: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        Ok(entries)
    }

    /// Unlinks the named entry itself; a symlink is removed, never its target.
    pub async fn delete(&self, name: &str) -> Result<(), StorageError> {
        self.resolve(name).await?;
        match fs::remove_file(self.root.join(name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Err(PathError::NotFound.into()),
            Err(err) => Err(err.into()),
        }
    }

    /// Removes every regular file directly under the root and returns how many
    /// were removed. Subdirectories are left alone.
    pub async fn delete_all(&self) -> Result<usize, StorageError> {
        let mut dir = fs::read_dir(&self.root).await?;
        let mut count = 0;

        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => count += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(err.into()),
            }
        }

        Ok(count)
    }

    /// Removes staged uploads older than `ttl`, left behind by crashed writers.
    pub async fn prune_staging(&self, ttl: Duration) -> Result<usize, StorageError> {
        let mut dir = match fs::read_dir(self.staging_path()).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        };
        let now = SystemTime::now();
        let mut removed = 0;

        while let Some(entry) = dir.next_entry().await? {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if metadata.is_file() && age > ttl && fs::remove_file(entry.path()).await.is_ok() {
                debug!(path = ?entry.path(), "removed stale staged upload");
                removed += 1;
            }
        }

        Ok(removed)
    }
}

/// Lexical checks on a client-supplied stored name, done before any filesystem access.
pub fn check_stored_name(name: &str) -> Result<(), PathError> {
    if name.is_empty()
        || name == "."
        || name.contains("..")
        || name.contains(['/', '\\', '\0'])
        || Path::new(name).is_absolute()
    {
        return Err(PathError::Traversal);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathError {
    Traversal,
    NotFound,
}

#[derive(Debug)]
pub enum StorageError {
    Path(PathError),
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

impl From<PathError> for StorageError {
    fn from(err: PathError) -> Self {
        StorageError::Path(err)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StoredFile {
    pub name: String,
    pub size: u64,
    #[serde(serialize_with = "serialize_modified")]
    pub modified: Option<DateTime<Utc>>,
}

/// 统一的修改时间展示格式。
pub fn format_modified(modified: Option<&DateTime<Utc>>) -> String {
    modified
        .map(|ts| ts.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

fn serialize_modified<S: Serializer>(
    modified: &Option<DateTime<Utc>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_modified(modified.as_ref()))
}

#[cfg(test)]
mod tests {
    use super::{PathError, Storage, StorageError, check_stored_name};
    use std::time::Duration;
    use tempfile::tempdir;

    async fn make_storage() -> (tempfile::TempDir, Storage) {
        let temp = tempdir().expect("tempdir");
        let storage = Storage::new(temp.path().join("root"));
        storage.ensure_root().await.expect("ensure root");
        (temp, storage)
    }

    #[test]
    fn rejects_traversal_names_lexically() {
        for name in ["..", "../etc/passwd", "a/b.txt", "a\\b.txt", "x..y", "/etc/passwd", "", "."] {
            assert_eq!(check_stored_name(name), Err(PathError::Traversal), "{name}");
        }
        assert_eq!(check_stored_name("1700000000_file.txt"), Ok(()));
    }

    #[tokio::test]
    async fn traversal_never_touches_filesystem() {
        let temp = tempdir().expect("tempdir");
        // 根目录不存在：若触及文件系统会得到 Io 错误而不是 Traversal
        let storage = Storage::new(temp.path().join("missing"));
        let result = storage.resolve("../../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::Path(PathError::Traversal))));
        let result = storage.delete("../secret.txt").await;
        assert!(matches!(result, Err(StorageError::Path(PathError::Traversal))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_rejects_symlink_escaping_root() {
        use std::os::unix::fs::symlink;

        let (temp, storage) = make_storage().await;
        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").expect("write outside file");
        symlink(&outside, storage.root_path().join("link.txt")).expect("symlink");

        let result = storage.resolve("link.txt").await;
        assert!(matches!(result, Err(StorageError::Path(PathError::Traversal))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn delete_unlinks_symlink_not_target() {
        use std::os::unix::fs::symlink;

        let (_temp, storage) = make_storage().await;
        storage.put("1_real.txt", b"keep me").await.expect("put");
        let real = storage.root_path().join("1_real.txt");
        let alias = storage.root_path().join("1_alias.txt");
        symlink(&real, &alias).expect("symlink");

        storage.delete("1_alias.txt").await.expect("delete alias");
        assert_eq!(std::fs::read(&real).expect("real survives"), b"keep me");
        assert!(std::fs::symlink_metadata(&alias).is_err());
    }

    #[tokio::test]
    async fn resolve_missing_is_not_found() {
        let (_temp, storage) = make_storage().await;
        let result = storage.resolve("ghost.txt").await;
        assert!(matches!(result, Err(StorageError::Path(PathError::NotFound))));
        let result = storage.delete("ghost.txt").await;
        assert!(matches!(result, Err(StorageError::Path(PathError::NotFound))));
    }

    #[tokio::test]
    async fn put_then_open_round_trips() {
        let (_temp, storage) = make_storage().await;
        storage.put("1_a.txt", b"payload").await.expect("put");
        let path = storage.resolve("1_a.txt").await.expect("resolve");
        assert_eq!(std::fs::read(path).expect("read"), b"payload");
        let (_file, metadata) = storage.open("1_a.txt").await.expect("open");
        assert_eq!(metadata.len(), 7);
    }

    #[tokio::test]
    async fn put_same_name_last_writer_wins() {
        let (_temp, storage) = make_storage().await;
        storage.put("1_a.txt", b"first").await.expect("put first");
        storage.put("1_a.txt", b"second").await.expect("put second");
        let path = storage.resolve("1_a.txt").await.expect("resolve");
        assert_eq!(std::fs::read(path).expect("read"), b"second");
        assert_eq!(storage.list().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn list_skips_directories_and_staging() {
        let (_temp, storage) = make_storage().await;
        storage.put("1_a.txt", b"a").await.expect("put");
        storage.put("2_b.png", b"bb").await.expect("put");
        std::fs::create_dir(storage.root_path().join("nested")).expect("mkdir");
        std::fs::write(storage.root_path().join("nested/inner.txt"), b"x").expect("write");

        let mut files = storage.list().await.expect("list");
        files.sort_by(|a, b| a.name.cmp(&b.name));
        let names: Vec<_> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["1_a.txt", "2_b.png"]);
        assert_eq!(files[1].size, 2);
        assert!(files[0].modified.is_some());
    }

    #[tokio::test]
    async fn resolve_refuses_directories() {
        let (_temp, storage) = make_storage().await;
        let result = storage.delete(".staging").await;
        assert!(matches!(result, Err(StorageError::Path(PathError::NotFound))));
    }

    #[tokio::test]
    async fn delete_all_is_idempotent_and_keeps_subdirectories() {
        let (_temp, storage) = make_storage().await;
        storage.put("1_a.txt", b"a").await.expect("put");
        storage.put("1_b.txt", b"b").await.expect("put");
        std::fs::create_dir(storage.root_path().join("keep")).expect("mkdir");
        std::fs::write(storage.root_path().join("keep/inner.txt"), b"x").expect("write");

        assert_eq!(storage.delete_all().await.expect("delete all"), 2);
        assert_eq!(storage.delete_all().await.expect("delete all"), 0);
        assert!(storage.root_path().join("keep/inner.txt").exists());
        assert!(storage.list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn prune_staging_only_removes_old_parts() {
        let (_temp, storage) = make_storage().await;
        let staged = storage.root_path().join(".staging/abandoned.part");
        std::fs::write(&staged, b"x").expect("write staged");

        assert_eq!(
            storage.prune_staging(Duration::from_secs(3600)).await.expect("prune"),
            0
        );
        assert!(staged.exists());

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(
            storage.prune_staging(Duration::from_millis(1)).await.expect("prune"),
            1
        );
        assert!(!staged.exists());
    }
}
