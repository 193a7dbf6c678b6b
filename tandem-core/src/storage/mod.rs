//! File store
//!
//! The storage directory holds one flat set of regular files. Content is only ever
//! replaced through a staging file `<log dir>/.lock-<name>`:
//!
//! 1. copy the current file (if any) to the staging path
//! 2. append the new bytes, flush and fsync
//! 3. rename the staging file over the target
//!
//! Any failure removes the staging file and leaves the target untouched. Callers
//! serialize commits per filename with a [`LockTable`].

mod locks;

pub use locks::{KeyGuard, LockTable};

use crate::{Error, Result};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tandem_protocol::FileDigests;
use tracing::{debug, info, warn};

/// Prefix of staging files in the log directory
pub const LOCK_PREFIX: &str = ".lock-";

/// Default number of bytes returned by a READ
pub const DEFAULT_READ_LIMIT: usize = 100 * 1024;

const IO_REASON: &str = "File IO error.  Check server settings and permissions.";

/// Regular files in the storage directory plus their digests
pub struct FileStore {
    root: PathBuf,
    staging_dir: PathBuf,
    read_limit: usize,
    digests: RwLock<FileDigests>,
}

impl FileStore {
    /// Open the store, removing staging leftovers and hashing every file
    pub fn open<P: AsRef<Path>, Q: AsRef<Path>>(
        root: P,
        staging_dir: Q,
        read_limit: usize,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let staging_dir = staging_dir.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(&staging_dir)?;

        let store = Self {
            root,
            staging_dir,
            read_limit,
            digests: RwLock::new(FileDigests::new()),
        };
        store.remove_staging_leftovers()?;
        store.refresh()?;
        Ok(store)
    }

    /// Storage directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Bytes returned by [`read_prefix`](Self::read_prefix)
    pub fn read_limit(&self) -> usize {
        self.read_limit
    }

    /// Whether a READ reply of `len` bytes may have been cut at the limit
    pub fn fills_read_limit(&self, len: usize) -> bool {
        len >= self.read_limit
    }

    /// Check that `name` may be created as a new file.
    ///
    /// Rejects directories, hidden names and anything with a path separator.
    pub fn validate_new_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::file_io("Filename must not be empty."));
        }
        if self.root.join(name).is_dir() {
            return Err(Error::file_io("A directory with that name already exists."));
        }
        if name.starts_with('.') {
            return Err(Error::file_io("Creating hidden files is forbidden."));
        }
        if name.contains('/') || name.contains('\\') {
            return Err(Error::file_io(
                "Creating directories (or files in subdirectories) is forbidden.",
            ));
        }
        Ok(())
    }

    /// First `read_limit` bytes of `name`
    pub async fn read_prefix(&self, name: &str) -> Result<Vec<u8>> {
        if !is_plain_name(name) {
            return Err(Error::FileNotFound(name.to_string()));
        }
        let path = self.root.join(name);
        let limit = self.read_limit as u64;
        let name = name.to_string();

        blocking(move || {
            if !path.is_file() {
                return Err(Error::FileNotFound(name));
            }
            let file = File::open(&path)
                .map_err(|_| Error::file_io("Unable to open file.  Check server settings."))?;
            let mut buf = Vec::new();
            file.take(limit)
                .read_to_end(&mut buf)
                .map_err(|_| Error::file_io(IO_REASON))?;
            Ok(buf)
        })
        .await
    }

    /// Append `data` to `name` through the staging file, then refresh its digest
    pub async fn append(&self, name: &str, data: Vec<u8>) -> Result<()> {
        self.stage(name, data, true).await
    }

    /// Replace `name` with `data` through the staging file, then refresh its digest
    pub async fn replace(&self, name: &str, data: Vec<u8>) -> Result<()> {
        self.stage(name, data, false).await
    }

    async fn stage(&self, name: &str, data: Vec<u8>, keep_existing: bool) -> Result<()> {
        let target = self.root.join(name);
        let staging = self.staging_path(name);
        let len = data.len();

        let digest = blocking(move || {
            let result = write_staged(&target, &staging, &data, keep_existing);
            if result.is_err() && staging.exists() {
                let _ = fs::remove_file(&staging);
            }
            result.map_err(|e| {
                warn!(file = %target.display(), error = %e, "Staged write failed");
                Error::file_io(IO_REASON)
            })
        })
        .await?;

        self.digests.write().insert(name.to_string(), digest);
        debug!(file = name, bytes = len, keep_existing, "File updated");
        Ok(())
    }

    /// Snapshot of the digest table
    pub fn digests(&self) -> FileDigests {
        self.digests.read().clone()
    }

    /// Rehash every regular, non-hidden file in the storage directory
    pub fn refresh(&self) -> Result<()> {
        let mut digests = FileDigests::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type()?.is_file() {
                continue;
            }
            digests.insert(name, digest_file(&entry.path())?);
        }
        debug!(files = digests.len(), "File digests rebuilt");
        *self.digests.write() = digests;
        Ok(())
    }

    fn staging_path(&self, name: &str) -> PathBuf {
        self.staging_dir.join(format!("{}{}", LOCK_PREFIX, name))
    }

    fn remove_staging_leftovers(&self) -> Result<()> {
        for entry in fs::read_dir(&self.staging_dir)? {
            let entry = entry?;
            if entry.file_name().to_string_lossy().starts_with(LOCK_PREFIX) {
                info!(file = %entry.path().display(), "Removing staging file left by a crash");
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('.') && !name.contains('/') && !name.contains('\\')
}

/// Build the new content in `staging` and rename it over `target`.
///
/// The digest is taken from the staging file, so once the rename happens nothing
/// is left that can fail.
fn write_staged(
    target: &Path,
    staging: &Path,
    data: &[u8],
    keep_existing: bool,
) -> io::Result<String> {
    if keep_existing && target.exists() {
        fs::copy(target, staging)?;
    } else {
        File::create(staging)?;
    }

    let mut file = OpenOptions::new().append(true).open(staging)?;
    file.write_all(data)?;
    file.flush()?;
    file.sync_all()?;
    drop(file);

    let digest = digest_file(staging)?;
    fs::rename(staging, target)?;
    Ok(digest)
}

/// SHA-256 of a file, hex encoded
pub fn digest_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::internal(format!("Blocking task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> FileStore {
        FileStore::open(dir.path(), dir.path().join(".server_log"), DEFAULT_READ_LIMIT).unwrap()
    }

    fn staging_files(dir: &TempDir) -> Vec<String> {
        fs::read_dir(dir.path().join(".server_log"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(LOCK_PREFIX))
            .collect()
    }

    #[test]
    fn test_validate_new_name() {
        let dir = TempDir::new().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        let store = open(&dir);

        assert!(store.validate_new_name("f.txt").is_ok());
        for bad in ["", ".hidden", "a/b.txt", "sub", "..", "a\\b"] {
            let err = store.validate_new_name(bad).unwrap_err();
            assert_eq!(err.code().as_u16(), 205, "{:?}", bad);
        }
    }

    #[tokio::test]
    async fn test_append_creates_and_extends() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        store.append("f.txt", b"AB".to_vec()).await.unwrap();
        store.append("f.txt", b"CD".to_vec()).await.unwrap();

        assert_eq!(fs::read(dir.path().join("f.txt")).unwrap(), b"ABCD");
        assert!(staging_files(&dir).is_empty());
        assert_eq!(
            store.digests().get("f.txt").unwrap(),
            &digest_file(&dir.path().join("f.txt")).unwrap()
        );
    }

    #[test]
    fn test_write_staged_digests_before_rename() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("f.txt");
        let staging = dir.path().join(".lock-f.txt");
        fs::write(&target, b"AB").unwrap();

        let digest = write_staged(&target, &staging, b"CD", true).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"ABCD");
        assert_eq!(digest, digest_file(&target).unwrap());
        assert!(!staging.exists());

        // A staging path that cannot be created leaves the target alone
        let err = write_staged(&target, &dir.path().join("no/such/dir"), b"EF", true);
        assert!(err.is_err());
        assert_eq!(fs::read(&target).unwrap(), b"ABCD");
    }

    #[tokio::test]
    async fn test_replace_overwrites() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir);

        store.append("f.txt", b"old content".to_vec()).await.unwrap();
        store.replace("f.txt", b"new".to_vec()).await.unwrap();
        assert_eq!(fs::read(dir.path().join("f.txt")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_read_prefix() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::open(dir.path(), dir.path().join(".server_log"), 4).unwrap();
        fs::write(dir.path().join("f.txt"), b"hello world").unwrap();

        let prefix = store.read_prefix("f.txt").await.unwrap();
        assert_eq!(prefix, b"hell");
        assert!(store.fills_read_limit(prefix.len()));
        assert!(!store.fills_read_limit(3));
        let err = store.read_prefix("missing.txt").await.unwrap_err();
        assert_eq!(err.code().as_u16(), 206);
        let err = store.read_prefix("../etc/passwd").await.unwrap_err();
        assert_eq!(err.code().as_u16(), 206);
    }

    #[test]
    fn test_open_removes_leftovers_and_hashes() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join(".server_log");
        fs::create_dir_all(&log_dir).unwrap();
        fs::write(log_dir.join(".lock-f.txt"), b"partial").unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        fs::write(dir.path().join(".hidden"), b"h").unwrap();

        let store = open(&dir);
        assert!(staging_files(&dir).is_empty());

        let digests = store.digests();
        assert_eq!(digests.keys().collect::<Vec<_>>(), vec!["a.txt"]);
        // sha256("a")
        assert_eq!(
            digests["a.txt"],
            "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb"
        );
    }
}
