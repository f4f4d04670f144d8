//! Content hashing for sail.
//!
//! Provides the process-global [`FileHashCache`] that memoizes SHA-256
//! digests of files, and the canonical [`CacheKeyInputs`] record whose hash
//! identifies a shared-cache entry.

mod key;

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
pub use key::{command_digest, CacheKeyInputs, DependencyHash, GlobalKeyComponents, InputHash};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::OnceCell;

#[derive(Debug, Error)]
pub enum Error {
    #[error("file not found: {0}")]
    FileNotFound(Utf8PathBuf),
    #[error("failed to read {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("path is not absolute: {0}")]
    RelativePath(Utf8PathBuf),
}

/// Hex-encoded SHA-256 of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hex-encoded SHA-256 of a string.
pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// A content-aware hasher used instead of raw byte hashing.
///
/// Declaration files are hashed by their stable source version rather than
/// their raw bytes so that formatting-only rewrites do not invalidate
/// dependents. `name` namespaces the memoized result so two hashers never
/// share a cache slot.
pub trait ContentHasher: Send + Sync {
    fn name(&self) -> &'static str;
    fn hash(&self, content: &str) -> String;
}

/// Memoized file hashing keyed on normalized absolute path.
///
/// Concurrent requests for the same path coalesce to a single read. There is
/// no invalidation within a build: a build assumes its source files do not
/// mutate during its own run.
#[derive(Default)]
pub struct FileHashCache {
    raw: DashMap<Utf8PathBuf, Arc<OnceCell<String>>>,
    custom: DashMap<(Utf8PathBuf, &'static str), Arc<OnceCell<String>>>,
}

impl FileHashCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hex SHA-256 of the file's content.
    pub async fn file_hash(&self, path: &Utf8Path) -> Result<String, Error> {
        let path = normalize(path)?;
        let cell = self
            .raw
            .entry(path.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        cell.get_or_try_init(|| async {
            let bytes = read_file(&path).await?;
            Ok(hash_bytes(&bytes))
        })
        .await
        .cloned()
    }

    /// Like [`FileHashCache::file_hash`], but the digest is produced by a
    /// content-aware hasher. The underlying read still happens at most once
    /// per (path, hasher) pair.
    pub async fn file_hash_with(
        &self,
        path: &Utf8Path,
        hasher: &dyn ContentHasher,
    ) -> Result<String, Error> {
        let path = normalize(path)?;
        let cell = self
            .custom
            .entry((path.clone(), hasher.name()))
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();
        cell.get_or_try_init(|| async {
            let bytes = read_file(&path).await?;
            Ok(hasher.hash(&String::from_utf8_lossy(&bytes)))
        })
        .await
        .cloned()
    }
}

async fn read_file(path: &Utf8Path) -> Result<Vec<u8>, Error> {
    tokio::fs::read(path).await.map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            Error::FileNotFound(path.to_owned())
        } else {
            Error::Io {
                path: path.to_owned(),
                source,
            }
        }
    })
}

fn normalize(path: &Utf8Path) -> Result<Utf8PathBuf, Error> {
    if !path.is_absolute() {
        return Err(Error::RelativePath(path.to_owned()));
    }
    // Strip `.` components so `/a/./b` and `/a/b` share a cache slot.
    let mut normalized = Utf8PathBuf::new();
    for component in path.components() {
        match component {
            camino::Utf8Component::CurDir => {}
            other => normalized.push(other.as_str()),
        }
    }
    Ok(normalized)
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use anyhow::Result;
    use camino::Utf8Path;
    use pretty_assertions::assert_eq;

    use super::*;

    fn utf8_path(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_owned()).unwrap()
    }

    #[tokio::test]
    async fn test_file_hash_is_sha256_of_contents() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("input.txt");
        std::fs::write(&file, b"hello")?;

        let cache = FileHashCache::new();
        let hash = cache.file_hash(&utf8_path(&file)).await?;
        // sha256("hello")
        assert_eq!(
            hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_file_is_typed() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let missing = dir.path().join("nope.txt");

        let cache = FileHashCache::new();
        let err = cache.file_hash(&utf8_path(&missing)).await.unwrap_err();
        assert!(matches!(err, Error::FileNotFound(_)), "{err:?}");
        Ok(())
    }

    #[tokio::test]
    async fn test_relative_path_rejected() {
        let cache = FileHashCache::new();
        let err = cache
            .file_hash(Utf8Path::new("relative/file.txt"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RelativePath(_)), "{err:?}");
    }

    #[tokio::test]
    async fn test_dot_components_share_a_slot() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("input.txt");
        std::fs::write(&file, b"content")?;

        struct Counting(AtomicUsize);
        impl ContentHasher for Counting {
            fn name(&self) -> &'static str {
                "counting"
            }
            fn hash(&self, content: &str) -> String {
                self.0.fetch_add(1, Ordering::SeqCst);
                hash_str(content)
            }
        }

        let cache = FileHashCache::new();
        let hasher = Counting(AtomicUsize::new(0));
        let plain = utf8_path(&file);
        let dotted = utf8_path(&dir.path().join(".").join("input.txt"));

        let a = cache.file_hash_with(&plain, &hasher).await?;
        let b = cache.file_hash_with(&dotted, &hasher).await?;
        assert_eq!(a, b);
        assert_eq!(hasher.0.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_requests_coalesce_to_one_read() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let file = dir.path().join("shared.txt");
        std::fs::write(&file, b"shared contents")?;

        struct Counting(AtomicUsize);
        impl ContentHasher for Counting {
            fn name(&self) -> &'static str {
                "counting"
            }
            fn hash(&self, content: &str) -> String {
                self.0.fetch_add(1, Ordering::SeqCst);
                hash_str(content)
            }
        }

        let cache = std::sync::Arc::new(FileHashCache::new());
        let hasher = std::sync::Arc::new(Counting(AtomicUsize::new(0)));
        let path = utf8_path(&file);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            let hasher = hasher.clone();
            let path = path.clone();
            handles.push(tokio::spawn(async move {
                cache.file_hash_with(&path, hasher.as_ref()).await
            }));
        }

        let mut digests = Vec::new();
        for handle in handles {
            digests.push(handle.await??);
        }
        digests.dedup();
        assert_eq!(digests.len(), 1);
        assert_eq!(hasher.0.load(Ordering::SeqCst), 1);
        Ok(())
    }
}
