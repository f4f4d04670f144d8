//! The on-disk cache store.
//!
//! Layout under the cache root:
//!
//! ```text
//! VERSION                                  on-disk format marker
//! stats.json                               rolling counters
//! entries/<hex key>/manifest.json          canonical entry manifest
//! entries/<hex key>/files/<2hex>/<hash>    content-addressed payloads
//! ```
//!
//! All writes go through a temp path on the same filesystem followed by a
//! rename. Entry writes are guarded by a per-key advisory lock file;
//! restores hold an in-process read guard that eviction respects.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use camino::{Utf8Path, Utf8PathBuf};
use sail_hash::CacheKeyInputs;
use tracing::{debug, warn};

use crate::{unix_time_ms, CacheEntry, CacheError, CacheStats, OutputFile, CACHE_VERSION};

const ENTRIES_DIR: &str = "entries";
const FILES_DIR: &str = "files";
const MANIFEST_FILE: &str = "manifest.json";
const VERSION_FILE: &str = "VERSION";
const LOCK_FILE: &str = ".lock";

const LOCK_ATTEMPTS: u32 = 100;
const LOCK_RETRY: Duration = Duration::from_millis(10);

const DEFAULT_MAX_SIZE_BYTES: u64 = 10 * 1024 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct CacheOptions {
    pub dir: Utf8PathBuf,
    pub max_size_bytes: u64,
    pub skip_cache_write: bool,
}

impl CacheOptions {
    pub fn new(dir: Utf8PathBuf) -> Self {
        Self {
            dir,
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            skip_cache_write: false,
        }
    }

    pub fn with_max_size(mut self, max_size_bytes: u64) -> Self {
        self.max_size_bytes = max_size_bytes;
        self
    }

    pub fn with_skip_cache_write(mut self, skip: bool) -> Self {
        self.skip_cache_write = skip;
        self
    }
}

/// Execution results stored alongside the outputs.
#[derive(Debug, Clone, Default)]
pub struct ExecMetadata {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub execution_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreOutcome {
    pub success: bool,
    pub files_restored: usize,
    pub bytes_restored: u64,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreOutcome {
    pub success: bool,
    pub reason: Option<&'static str>,
}

impl StoreOutcome {
    fn stored() -> Self {
        Self {
            success: true,
            reason: None,
        }
    }

    fn skipped(reason: &'static str) -> Self {
        Self {
            success: false,
            reason: Some(reason),
        }
    }
}

#[derive(Debug)]
pub struct SharedCache {
    root: Utf8PathBuf,
    max_size_bytes: u64,
    skip_cache_write: bool,
    stats: Mutex<CacheStats>,
    active_reads: Mutex<HashMap<String, usize>>,
}

impl SharedCache {
    /// Opens (or initializes) a cache root. A root written by an
    /// incompatible version is refused; the caller proceeds without a cache.
    pub fn new(options: CacheOptions) -> Result<Self, CacheError> {
        let root = options.dir;
        create_dir_all(&root)?;
        create_dir_all(&root.join(ENTRIES_DIR))?;

        let version_path = root.join(VERSION_FILE);
        match std::fs::read_to_string(&version_path) {
            Ok(found) => {
                if found.trim() != CACHE_VERSION.to_string() {
                    return Err(CacheError::VersionMismatch {
                        found: found.trim().to_owned(),
                    });
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                std::fs::write(&version_path, CACHE_VERSION.to_string()).map_err(|source| {
                    CacheError::Io {
                        path: version_path,
                        source,
                    }
                })?;
            }
            Err(source) => {
                return Err(CacheError::Io {
                    path: version_path,
                    source,
                })
            }
        }

        let stats = CacheStats::load(&root);
        Ok(Self {
            root,
            max_size_bytes: options.max_size_bytes,
            skip_cache_write: options.skip_cache_write,
            stats: Mutex::new(stats),
            active_reads: Mutex::new(HashMap::new()),
        })
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.lock().expect("stats mutex is never poisoned")
    }

    /// Looks up an entry by its canonical key. Corrupt or incompatible
    /// manifests count as misses and are left in place.
    pub fn lookup(&self, inputs: &CacheKeyInputs) -> Result<Option<CacheEntry>, CacheError> {
        let key = inputs.key_hash();
        let manifest_path = self.entry_dir(&key).join(MANIFEST_FILE);

        let raw = match std::fs::read_to_string(&manifest_path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(target: "sail::cache", %key, "cache miss");
                self.update_stats(|stats| stats.misses += 1);
                return Ok(None);
            }
            Err(source) => {
                return Err(CacheError::Io {
                    path: manifest_path,
                    source,
                })
            }
        };

        let mut entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                warn!(target: "sail::cache", %key, %err, "corrupt manifest, treating as a miss");
                self.update_stats(|stats| stats.misses += 1);
                return Ok(None);
            }
        };
        if entry.version != CACHE_VERSION {
            warn!(target: "sail::cache", %key, version = entry.version, "incompatible entry version, treating as a miss");
            self.update_stats(|stats| stats.misses += 1);
            return Ok(None);
        }

        // Bump the access time for LRU eviction; a lost race only costs
        // accuracy, not correctness.
        entry.last_accessed_at = unix_time_ms();
        if let Err(err) = self.write_manifest(&key, &entry) {
            warn!(target: "sail::cache", %key, %err, "failed to bump access time");
        }

        debug!(target: "sail::cache", %key, "cache hit");
        self.update_stats(|stats| stats.hits += 1);
        Ok(Some(entry))
    }

    /// Restores every manifest file into `working_dir`, atomically and with
    /// the recorded mode, verifying each post-write hash. A verification
    /// failure marks the entry suspect (logged, never deleted) and reports
    /// an unsuccessful restore.
    pub fn restore(
        &self,
        entry: &CacheEntry,
        working_dir: &Utf8Path,
    ) -> Result<RestoreOutcome, CacheError> {
        let _guard = ReadGuard::register(self, &entry.key);
        let started = Instant::now();
        let files_dir = self.entry_dir(&entry.key).join(FILES_DIR);

        let mut files_restored = 0;
        let mut bytes_restored = 0u64;
        for output in &entry.outputs {
            let payload = files_dir
                .join(&output.hash[..2])
                .join(&output.hash);
            let contents = match std::fs::read(&payload) {
                Ok(contents) => contents,
                Err(err) => {
                    warn!(target: "sail::cache", key = %entry.key, path = %payload, %err, "payload unreadable, entry is suspect");
                    return Ok(self.failed_restore(entry));
                }
            };

            let target = working_dir.join(&output.path);
            write_atomic(&target, &contents, output.mode)?;

            // Post-write verification: the bytes on disk must hash to the
            // manifest hash.
            let written = std::fs::read(&target).map_err(|source| CacheError::Io {
                path: target.clone(),
                source,
            })?;
            if sail_hash::hash_bytes(&written) != output.hash {
                warn!(target: "sail::cache", key = %entry.key, path = %target, "post-restore hash mismatch, entry is suspect");
                return Ok(self.failed_restore(entry));
            }

            files_restored += 1;
            bytes_restored += output.size;
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        self.update_stats(|stats| {
            stats.restored_count += 1;
            stats.restore_ms_total += elapsed_ms;
            stats.time_saved_ms += entry.execution_time_ms;
        });
        Ok(RestoreOutcome {
            success: true,
            files_restored,
            bytes_restored,
            stdout: entry.stdout.clone(),
            stderr: entry.stderr.clone(),
        })
    }

    /// Stores the outputs of a successful execution. Not-cacheable tasks
    /// (no inputs or no outputs) and disabled writes are skipped with a
    /// reason; a store that would exceed the size cap triggers eviction
    /// first.
    pub fn store(
        &self,
        inputs: &CacheKeyInputs,
        output_files: &[Utf8PathBuf],
        working_dir: &Utf8Path,
        exec: ExecMetadata,
    ) -> Result<StoreOutcome, CacheError> {
        if self.skip_cache_write {
            return Ok(StoreOutcome::skipped("cache writes are disabled"));
        }
        if !inputs.has_inputs() || output_files.is_empty() {
            return Ok(StoreOutcome::skipped("task is not cacheable"));
        }

        let key = inputs.key_hash();
        let entry_dir = self.entry_dir(&key);
        create_dir_all(&entry_dir)?;
        let _lock = EntryLock::acquire(&entry_dir, &key)?;

        let files_dir = entry_dir.join(FILES_DIR);
        let mut outputs = Vec::with_capacity(output_files.len());
        let mut new_bytes = 0u64;
        for file in output_files {
            let contents = match std::fs::read(file) {
                Ok(contents) => contents,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    return Ok(StoreOutcome::skipped("an output file disappeared"));
                }
                Err(source) => {
                    return Err(CacheError::Io {
                        path: file.clone(),
                        source,
                    })
                }
            };
            let hash = sail_hash::hash_bytes(&contents);
            let size = contents.len() as u64;
            let mode = file_mode(file);
            let relative = file
                .strip_prefix(working_dir)
                .map(|p| p.to_string())
                .unwrap_or_else(|_| file.to_string());

            // Identical payloads share one content-addressed file.
            let payload = files_dir.join(&hash[..2]).join(&hash);
            if !payload.is_file() {
                write_atomic(&payload, &contents, 0o644)?;
            }

            new_bytes += size;
            outputs.push(OutputFile {
                path: relative,
                hash,
                size,
                mode,
            });
        }

        if !self.evict_for(new_bytes, &key)? {
            // Even an empty cache cannot hold this entry.
            let _ = std::fs::remove_dir_all(&entry_dir);
            return Ok(StoreOutcome::skipped("entry exceeds the cache size cap"));
        }

        let now = unix_time_ms();
        let entry = CacheEntry {
            version: CACHE_VERSION,
            task_id: format!("{}#{}", inputs.package, inputs.task),
            key: key.clone(),
            inputs: inputs.input_hashes.clone(),
            outputs,
            stdout: exec.stdout,
            stderr: exec.stderr,
            exit_code: exec.exit_code,
            execution_time_ms: exec.execution_time_ms,
            created_at: now,
            last_accessed_at: now,
        };
        self.write_manifest(&key, &entry)?;
        debug!(target: "sail::cache", %key, bytes = new_bytes, "entry stored");

        self.update_stats(|stats| {
            stats.entries += 1;
            stats.total_bytes += new_bytes;
        });
        Ok(StoreOutcome::stored())
    }

    fn failed_restore(&self, entry: &CacheEntry) -> RestoreOutcome {
        self.update_stats(|stats| stats.misses += 1);
        RestoreOutcome {
            success: false,
            files_restored: 0,
            bytes_restored: 0,
            stdout: entry.stdout.clone(),
            stderr: entry.stderr.clone(),
        }
    }

    /// LRU eviction until `incoming` more bytes fit under the cap. Returns
    /// false when they cannot fit even after eviction. The entry being
    /// written, entries being read, and the last surviving entry are never
    /// evicted.
    fn evict_for(&self, incoming: u64, protect_key: &str) -> Result<bool, CacheError> {
        if incoming > self.max_size_bytes {
            return Ok(false);
        }

        let entries_dir = self.root.join(ENTRIES_DIR);
        let mut entries: Vec<(String, u64, u64)> = Vec::new();
        let mut total = 0u64;
        let read_dir = std::fs::read_dir(&entries_dir).map_err(|source| CacheError::Io {
            path: entries_dir.clone(),
            source,
        })?;
        for dir_entry in read_dir.flatten() {
            let Ok(key) = dir_entry.file_name().into_string() else {
                continue;
            };
            let manifest_path = entries_dir.join(&key).join(MANIFEST_FILE);
            let Ok(raw) = std::fs::read_to_string(&manifest_path) else {
                continue;
            };
            let Ok(entry) = serde_json::from_str::<CacheEntry>(&raw) else {
                continue;
            };
            let size: u64 = entry.outputs.iter().map(|o| o.size).sum();
            total += size;
            entries.push((key, entry.last_accessed_at, size));
        }

        if total + incoming <= self.max_size_bytes {
            return Ok(true);
        }

        entries.sort_by_key(|(_, last_accessed, _)| *last_accessed);
        let mut survivors = entries.len();
        for (key, _, size) in entries {
            if total + incoming <= self.max_size_bytes {
                break;
            }
            if key == protect_key || survivors <= 1 {
                continue;
            }
            if self
                .active_reads
                .lock()
                .expect("read guard mutex is never poisoned")
                .contains_key(&key)
            {
                continue;
            }
            debug!(target: "sail::cache", %key, "evicting least-recently-used entry");
            let _ = std::fs::remove_dir_all(entries_dir.join(&key));
            total = total.saturating_sub(size);
            survivors -= 1;
            self.update_stats(|stats| {
                stats.entries = stats.entries.saturating_sub(1);
                stats.total_bytes = stats.total_bytes.saturating_sub(size);
            });
        }

        Ok(total + incoming <= self.max_size_bytes)
    }

    fn entry_dir(&self, key: &str) -> Utf8PathBuf {
        self.root.join(ENTRIES_DIR).join(key)
    }

    fn write_manifest(&self, key: &str, entry: &CacheEntry) -> Result<(), CacheError> {
        let contents =
            serde_json::to_string_pretty(entry).expect("cache entry serializes to JSON");
        write_atomic(
            &self.entry_dir(key).join(MANIFEST_FILE),
            contents.as_bytes(),
            0o644,
        )
    }

    fn update_stats(&self, apply: impl FnOnce(&mut CacheStats)) {
        let mut stats = self.stats.lock().expect("stats mutex is never poisoned");
        apply(&mut stats);
        if let Err(err) = stats.persist(&self.root) {
            warn!(target: "sail::cache", %err, "failed to persist cache stats");
        }
    }
}

/// Advisory per-entry write lock: a lock file created with `create_new`.
struct EntryLock {
    path: Utf8PathBuf,
}

impl EntryLock {
    fn acquire(entry_dir: &Utf8Path, key: &str) -> Result<Self, CacheError> {
        let path = entry_dir.join(LOCK_FILE);
        for _ in 0..LOCK_ATTEMPTS {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
            {
                Ok(_) => return Ok(Self { path }),
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    std::thread::sleep(LOCK_RETRY);
                }
                Err(source) => return Err(CacheError::Io { path, source }),
            }
        }
        Err(CacheError::LockTimeout {
            key: key.to_owned(),
        })
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// In-process read registration; eviction skips registered entries.
struct ReadGuard<'a> {
    cache: &'a SharedCache,
    key: String,
}

impl<'a> ReadGuard<'a> {
    fn register(cache: &'a SharedCache, key: &str) -> Self {
        *cache
            .active_reads
            .lock()
            .expect("read guard mutex is never poisoned")
            .entry(key.to_owned())
            .or_insert(0) += 1;
        Self {
            cache,
            key: key.to_owned(),
        }
    }
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        let mut reads = self
            .cache
            .active_reads
            .lock()
            .expect("read guard mutex is never poisoned");
        if let Some(count) = reads.get_mut(&self.key) {
            *count -= 1;
            if *count == 0 {
                reads.remove(&self.key);
            }
        }
    }
}

fn create_dir_all(path: &Utf8Path) -> Result<(), CacheError> {
    std::fs::create_dir_all(path).map_err(|source| CacheError::Io {
        path: path.to_owned(),
        source,
    })
}

/// Temp-then-rename in the target's directory, creating parents and setting
/// the mode before the rename lands.
fn write_atomic(target: &Utf8Path, contents: &[u8], mode: u32) -> Result<(), CacheError> {
    let parent = target.parent().unwrap_or(Utf8Path::new("."));
    create_dir_all(parent)?;
    let file_name = target.file_name().unwrap_or("file");
    let temp = parent.join(format!(".{file_name}.{}.tmp", std::process::id()));
    std::fs::write(&temp, contents).map_err(|source| CacheError::Io {
        path: temp.clone(),
        source,
    })?;
    set_mode(&temp, mode);
    std::fs::rename(&temp, target).map_err(|source| CacheError::Io {
        path: target.to_owned(),
        source,
    })?;
    Ok(())
}

#[cfg(unix)]
fn set_mode(path: &Utf8Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if mode != 0 {
        let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode));
    }
}

#[cfg(not(unix))]
fn set_mode(_path: &Utf8Path, _mode: u32) {}

#[cfg(unix)]
fn file_mode(path: &Utf8Path) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.permissions().mode() & 0o777)
        .unwrap_or(0o644)
}

#[cfg(not(unix))]
fn file_mode(_path: &Utf8Path) -> u32 {
    0o644
}

#[cfg(test)]
mod test {
    use anyhow::Result;
    use pretty_assertions::assert_eq;
    use sail_hash::InputHash;

    use super::*;

    fn key_inputs(task: &str, input_hash: &str) -> CacheKeyInputs {
        CacheKeyInputs {
            package: "alpha".into(),
            task: task.into(),
            executable: "tsc".into(),
            command: "tsc -p .".into(),
            input_hashes: vec![InputHash {
                path: "src/index.ts".into(),
                hash: input_hash.into(),
            }],
            dependency_hashes: None,
            global: None,
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        cache_dir: Utf8PathBuf,
        work_dir: Utf8PathBuf,
    }

    impl Fixture {
        fn new() -> Result<Self> {
            let dir = tempfile::tempdir()?;
            let base = Utf8PathBuf::from_path_buf(dir.path().to_owned()).unwrap();
            let cache_dir = base.join("cache");
            let work_dir = base.join("work");
            std::fs::create_dir_all(&work_dir)?;
            Ok(Self {
                _dir: dir,
                cache_dir,
                work_dir,
            })
        }

        fn cache(&self) -> Result<SharedCache> {
            Ok(SharedCache::new(CacheOptions::new(self.cache_dir.clone()))?)
        }

        fn write_output(&self, rel: &str, contents: &str) -> Utf8PathBuf {
            let path = self.work_dir.join(rel);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, contents).unwrap();
            path
        }
    }

    #[test]
    fn test_round_trip_restores_identical_bytes() -> Result<()> {
        let fixture = Fixture::new()?;
        let cache = fixture.cache()?;
        let inputs = key_inputs("compile", "aa");
        let output = fixture.write_output("esm/index.js", "export default 42;\n");

        assert!(cache.lookup(&inputs)?.is_none());

        let stored = cache.store(
            &inputs,
            &[output.clone()],
            &fixture.work_dir,
            ExecMetadata {
                stdout: "compiled".into(),
                execution_time_ms: 120,
                ..Default::default()
            },
        )?;
        assert!(stored.success, "{stored:?}");

        // Destroy the output, then restore it from the cache.
        std::fs::remove_file(&output)?;
        let entry = cache.lookup(&inputs)?.expect("entry exists after store");
        assert_eq!(entry.task_id, "alpha#compile");

        let restored = cache.restore(&entry, &fixture.work_dir)?;
        assert!(restored.success);
        assert_eq!(restored.files_restored, 1);
        assert_eq!(restored.stdout, "compiled");
        assert_eq!(
            std::fs::read_to_string(&output)?,
            "export default 42;\n"
        );

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.time_saved_ms, 120);
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn test_restore_preserves_mode() -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let fixture = Fixture::new()?;
        let cache = fixture.cache()?;
        let inputs = key_inputs("compile", "bb");
        let output = fixture.write_output("bin/run.sh", "#!/bin/sh\n");
        std::fs::set_permissions(&output, std::fs::Permissions::from_mode(0o755))?;

        cache.store(&inputs, &[output.clone()], &fixture.work_dir, ExecMetadata::default())?;
        std::fs::remove_file(&output)?;

        let entry = cache.lookup(&inputs)?.unwrap();
        assert!(cache.restore(&entry, &fixture.work_dir)?.success);
        let mode = std::fs::metadata(&output)?.permissions().mode() & 0o777;
        assert_eq!(mode, 0o755);
        Ok(())
    }

    #[test]
    fn test_not_cacheable_without_outputs_or_inputs() -> Result<()> {
        let fixture = Fixture::new()?;
        let cache = fixture.cache()?;

        let no_outputs = cache.store(
            &key_inputs("compile", "aa"),
            &[],
            &fixture.work_dir,
            ExecMetadata::default(),
        )?;
        assert_eq!(no_outputs.reason, Some("task is not cacheable"));

        let mut no_inputs = key_inputs("compile", "aa");
        no_inputs.input_hashes.clear();
        let output = fixture.write_output("esm/index.js", "x");
        let outcome = cache.store(
            &no_inputs,
            &[output],
            &fixture.work_dir,
            ExecMetadata::default(),
        )?;
        assert_eq!(outcome.reason, Some("task is not cacheable"));
        Ok(())
    }

    #[test]
    fn test_skip_cache_write() -> Result<()> {
        let fixture = Fixture::new()?;
        let cache = SharedCache::new(
            CacheOptions::new(fixture.cache_dir.clone()).with_skip_cache_write(true),
        )?;
        let output = fixture.write_output("esm/index.js", "x");
        let outcome = cache.store(
            &key_inputs("compile", "aa"),
            &[output],
            &fixture.work_dir,
            ExecMetadata::default(),
        )?;
        assert_eq!(outcome.reason, Some("cache writes are disabled"));
        Ok(())
    }

    #[test]
    fn test_tampered_payload_fails_restore_and_keeps_entry() -> Result<()> {
        let fixture = Fixture::new()?;
        let cache = fixture.cache()?;
        let inputs = key_inputs("compile", "cc");
        let output = fixture.write_output("esm/index.js", "pristine");
        cache.store(&inputs, &[output.clone()], &fixture.work_dir, ExecMetadata::default())?;

        // Tamper with the payload inside the entry's files/ directory.
        let entry = cache.lookup(&inputs)?.unwrap();
        let payload = fixture
            .cache_dir
            .join(ENTRIES_DIR)
            .join(&entry.key)
            .join(FILES_DIR)
            .join(&entry.outputs[0].hash[..2])
            .join(&entry.outputs[0].hash);
        std::fs::write(&payload, "tampered")?;

        let restored = cache.restore(&entry, &fixture.work_dir)?;
        assert!(!restored.success);

        // The suspect entry is logged but never auto-deleted.
        assert!(cache.lookup(&inputs)?.is_some());
        Ok(())
    }

    #[test]
    fn test_lru_eviction_keeps_newest_and_at_least_one() -> Result<()> {
        let fixture = Fixture::new()?;
        // Cap fits roughly two of the three entries.
        let cache = SharedCache::new(
            CacheOptions::new(fixture.cache_dir.clone()).with_max_size(250),
        )?;

        let first = key_inputs("one", "11");
        let second = key_inputs("two", "22");
        let third = key_inputs("three", "33");
        let payload = "x".repeat(100);

        let out = fixture.write_output("out/one.js", &payload);
        assert!(cache.store(&first, &[out], &fixture.work_dir, ExecMetadata::default())?.success);
        std::thread::sleep(Duration::from_millis(5));
        let out = fixture.write_output("out/two.js", &payload);
        assert!(cache.store(&second, &[out], &fixture.work_dir, ExecMetadata::default())?.success);
        std::thread::sleep(Duration::from_millis(5));

        // Touch the first entry so the second becomes the LRU victim.
        assert!(cache.lookup(&first)?.is_some());
        std::thread::sleep(Duration::from_millis(5));

        let out = fixture.write_output("out/three.js", &payload);
        assert!(cache.store(&third, &[out], &fixture.work_dir, ExecMetadata::default())?.success);

        assert!(cache.lookup(&second)?.is_none(), "LRU entry evicted");
        assert!(cache.lookup(&first)?.is_some());
        assert!(cache.lookup(&third)?.is_some());
        Ok(())
    }

    #[test]
    fn test_oversized_entry_is_refused() -> Result<()> {
        let fixture = Fixture::new()?;
        let cache = SharedCache::new(
            CacheOptions::new(fixture.cache_dir.clone()).with_max_size(10),
        )?;
        let out = fixture.write_output("out/big.js", &"x".repeat(100));
        let outcome = cache.store(
            &key_inputs("big", "dd"),
            &[out],
            &fixture.work_dir,
            ExecMetadata::default(),
        )?;
        assert_eq!(outcome.reason, Some("entry exceeds the cache size cap"));
        Ok(())
    }

    #[test]
    fn test_incompatible_version_is_refused() -> Result<()> {
        let fixture = Fixture::new()?;
        std::fs::create_dir_all(&fixture.cache_dir)?;
        std::fs::write(fixture.cache_dir.join(VERSION_FILE), "999")?;

        let err = SharedCache::new(CacheOptions::new(fixture.cache_dir.clone())).unwrap_err();
        assert!(matches!(err, CacheError::VersionMismatch { found } if found == "999"));
        Ok(())
    }

    #[test]
    fn test_held_lock_times_out() -> Result<()> {
        let fixture = Fixture::new()?;
        let cache = fixture.cache()?;
        let inputs = key_inputs("compile", "ee");
        let key = inputs.key_hash();

        let entry_dir = fixture.cache_dir.join(ENTRIES_DIR).join(&key);
        std::fs::create_dir_all(&entry_dir)?;
        std::fs::write(entry_dir.join(LOCK_FILE), "")?;

        let output = fixture.write_output("esm/index.js", "x");
        let err = cache
            .store(&inputs, &[output], &fixture.work_dir, ExecMetadata::default())
            .unwrap_err();
        assert!(matches!(err, CacheError::LockTimeout { .. }), "{err:?}");
        Ok(())
    }
}
