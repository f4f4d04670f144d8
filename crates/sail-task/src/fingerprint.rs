//! File fingerprints recorded in done-files.

use std::collections::BTreeMap;

use camino::{Utf8Path, Utf8PathBuf};
use sail_hash::FileHashCache;
use sail_workspace::FingerprintMode;
use serde::{Deserialize, Serialize};

use crate::Error;

/// A stable digest of one file: content hash, stat tuple, or a record of its
/// absence. An absent entry never equals a present one, so deleting a file
/// always invalidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum FileFingerprint {
    Hash { hash: String },
    Stat { mtime_ms: u64, size: u64 },
    Absent,
}

/// Fingerprints each file, keyed by its path relative to `base`.
pub async fn fingerprint_files(
    base: &Utf8Path,
    files: &[Utf8PathBuf],
    mode: FingerprintMode,
    hash_cache: &FileHashCache,
) -> Result<BTreeMap<String, FileFingerprint>, Error> {
    let mut fingerprints = BTreeMap::new();
    for file in files {
        let relative = file
            .strip_prefix(base)
            .map(|p| p.to_string())
            .unwrap_or_else(|_| file.to_string());
        let fingerprint = match mode {
            FingerprintMode::Hash => match hash_cache.file_hash(file).await {
                Ok(hash) => FileFingerprint::Hash { hash },
                Err(sail_hash::Error::FileNotFound(_)) => FileFingerprint::Absent,
                Err(err) => return Err(err.into()),
            },
            FingerprintMode::Stat => match tokio::fs::metadata(file).await {
                Ok(metadata) => FileFingerprint::Stat {
                    mtime_ms: metadata
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_millis() as u64)
                        .unwrap_or(0),
                    size: metadata.len(),
                },
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => FileFingerprint::Absent,
                Err(source) => {
                    return Err(Error::Io {
                        path: file.clone(),
                        source,
                    })
                }
            },
        };
        fingerprints.insert(relative, fingerprint);
    }
    Ok(fingerprints)
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use pretty_assertions::assert_eq;

    use super::*;

    fn utf8(path: &std::path::Path) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(path.to_owned()).unwrap()
    }

    #[tokio::test]
    async fn test_hash_mode_keys_on_relative_path() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = utf8(dir.path());
        std::fs::create_dir_all(base.join("src"))?;
        std::fs::write(base.join("src/index.ts"), "export {};")?;

        let cache = FileHashCache::new();
        let fingerprints = fingerprint_files(
            &base,
            &[base.join("src/index.ts")],
            FingerprintMode::Hash,
            &cache,
        )
        .await?;

        assert_eq!(fingerprints.len(), 1);
        assert!(matches!(
            fingerprints.get("src/index.ts"),
            Some(FileFingerprint::Hash { .. })
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_file_is_absent_not_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = utf8(dir.path());

        let cache = FileHashCache::new();
        let fingerprints = fingerprint_files(
            &base,
            &[base.join("gone.ts")],
            FingerprintMode::Hash,
            &cache,
        )
        .await?;
        assert_eq!(fingerprints.get("gone.ts"), Some(&FileFingerprint::Absent));
        Ok(())
    }

    #[tokio::test]
    async fn test_stat_mode_changes_with_size() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let base = utf8(dir.path());
        let file = base.join("out.js");
        std::fs::write(&file, "a")?;

        let cache = FileHashCache::new();
        let before =
            fingerprint_files(&base, &[file.clone()], FingerprintMode::Stat, &cache).await?;
        std::fs::write(&file, "longer contents")?;
        let after =
            fingerprint_files(&base, &[file.clone()], FingerprintMode::Stat, &cache).await?;
        assert_ne!(before.get("out.js"), after.get("out.js"));
        Ok(())
    }
}
