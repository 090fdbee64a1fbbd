//! Cache root layout, report identity, atomic commit, and LRU eviction.
//!
//! One directory per report identity under the per-user cache root. Builders
//! write into a dot-prefixed temp directory and commit with a single rename;
//! readers open committed artifacts by absolute path and never lock. The
//! only cross-process coordination is a best-effort `gc.lock` taken while
//! evicting.

use crate::error::CacheError;
use crate::types::{DeviceInfo, Level, ParseSummary};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const SCHEMA_VERSION: u32 = 1;

pub const ROWS_FILE: &str = "rows";
pub const SUMMARY_FILE: &str = "summary.json";
pub const TIME_INDEX_FILE: &str = "time_index.bin";
pub const INV_TAG_FILE: &str = "inv_tag.bin";
pub const INV_PID_FILE: &str = "inv_pid.bin";

const TOUCH_FILE: &str = ".touch";
const GC_LOCK_FILE: &str = "gc.lock";

/// Default ceiling for the cache root: 2 GiB.
pub const DEFAULT_MAX_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Stable identity of one bugreport input, derived from path, size, and
/// modification time. Renaming or rewriting the file yields a new identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportIdentity {
    pub fingerprint: String,
    pub path: String,
    pub size: u64,
    pub mtime_ms: i64,
}

impl ReportIdentity {
    pub fn of(path: &Path) -> Result<Self, CacheError> {
        let canonical = fs::canonicalize(path)?;
        let meta = fs::metadata(&canonical)?;
        let mtime_ms = meta
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0);
        let path_str = canonical.to_string_lossy().into_owned();

        let mut h = Sha256::new();
        h.update(path_str.as_bytes());
        h.update(b"\n");
        h.update(meta.len().to_le_bytes());
        h.update(mtime_ms.to_le_bytes());
        let fingerprint = hex::encode(h.finalize());

        Ok(Self {
            fingerprint,
            path: path_str,
            size: meta.len(),
            mtime_ms,
        })
    }

    /// Directory name under the cache root.
    pub fn short(&self) -> &str {
        &self.fingerprint[..16]
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub root: PathBuf,
    pub max_bytes: u64,
}

impl CacheConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }

    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// `<user-cache>/bugsift/`, falling back to `~/.bugsift/cache`.
    pub fn default_user() -> Result<Self, CacheError> {
        let root = dirs::cache_dir()
            .map(|d| d.join("bugsift"))
            .or_else(|| dirs::home_dir().map(|d| d.join(".bugsift").join("cache")))
            .ok_or(CacheError::NoCacheDir)?;
        Ok(Self::new(root))
    }

    pub fn dir_for(&self, identity: &ReportIdentity) -> PathBuf {
        self.root.join(identity.short())
    }

    pub fn temp_dir_for(&self, identity: &ReportIdentity) -> PathBuf {
        self.root
            .join(format!(".tmp-{}-{}", identity.short(), std::process::id()))
    }
}

/// Per-level counters kept in the summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LevelCounts {
    pub verbose: u64,
    pub debug: u64,
    pub info: u64,
    pub warning: u64,
    pub error: u64,
    pub fatal: u64,
}

impl LevelCounts {
    pub fn bump(&mut self, level: Level) {
        match level {
            Level::V => self.verbose += 1,
            Level::D => self.debug += 1,
            Level::I => self.info += 1,
            Level::W => self.warning += 1,
            Level::E => self.error += 1,
            Level::F => self.fatal += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.verbose + self.debug + self.info + self.warning + self.error + self.fatal
    }
}

/// Everything the query layer needs without re-reading the report, persisted
/// as `summary.json`. The schema version gates compatibility; the identity
/// gates staleness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSummary {
    pub schema_version: u32,
    pub identity: ReportIdentity,
    pub device: DeviceInfo,
    /// IANA zone name from the preamble; `null` means timestamps were
    /// normalised best-effort against UTC.
    pub time_zone: Option<String>,
    pub total_rows: u64,
    pub malformed: u64,
    pub level_counts: LevelCounts,
    pub min_ts_ms: Option<i64>,
    pub max_ts_ms: Option<i64>,
    pub min_ts_display: Option<String>,
    pub max_ts_display: Option<String>,
    /// Logical bytes of the report text.
    pub log_bytes: u64,
    pub anrs: u64,
    pub crashes: u64,
    pub ef_total: u64,
    pub ef_recent: u64,
    pub created_at: String,
}

impl CacheSummary {
    pub fn to_parse_summary(&self) -> ParseSummary {
        ParseSummary {
            device: self.device.clone(),
            events: self.total_rows as usize,
            anrs: self.anrs as usize,
            crashes: self.crashes as usize,
            ef_total: self.ef_total as usize,
            ef_recent: self.ef_recent as usize,
            min_ts_ms: self.min_ts_ms,
            max_ts_ms: self.max_ts_ms,
        }
    }
}

/// Write `summary.json` into a build directory.
pub fn write_summary(dir: &Path, summary: &CacheSummary) -> Result<(), CacheError> {
    let json = serde_json::to_vec_pretty(summary)?;
    fs::write(dir.join(SUMMARY_FILE), json)?;
    Ok(())
}

/// Load and validate `summary.json` for the given report identity.
///
/// Schema or identity mismatch is `CacheError::Stale`; a missing directory
/// too. Unreadable JSON is `Corrupt`.
pub fn open_summary(dir: &Path, identity: &ReportIdentity) -> Result<CacheSummary, CacheError> {
    let path = dir.join(SUMMARY_FILE);
    let data = match fs::read(&path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CacheError::Stale("no cache for this report".into()));
        }
        Err(e) => return Err(e.into()),
    };
    let summary: CacheSummary = serde_json::from_slice(&data)
        .map_err(|e| CacheError::Corrupt(format!("summary.json: {e}")))?;

    if summary.schema_version != SCHEMA_VERSION {
        return Err(CacheError::Stale(format!(
            "cache schema {} (current {})",
            summary.schema_version, SCHEMA_VERSION
        )));
    }
    if summary.identity.fingerprint != identity.fingerprint {
        return Err(CacheError::Stale("report changed on disk".into()));
    }

    // Recency marker for eviction ordering; best effort.
    let _ = fs::File::create(dir.join(TOUCH_FILE));
    debug!(dir = %dir.display(), "cache hit");
    Ok(summary)
}

/// Atomically publish a finished build directory.
pub fn commit(temp_dir: &Path, final_dir: &Path) -> Result<(), CacheError> {
    if final_dir.exists() {
        fs::remove_dir_all(final_dir)?;
    }
    fs::rename(temp_dir, final_dir)?;
    Ok(())
}

/// Remove a cache directory, e.g. after detecting corruption on read.
pub fn discard(dir: &Path) -> Result<(), CacheError> {
    if dir.exists() {
        warn!(dir = %dir.display(), "discarding cache directory");
        fs::remove_dir_all(dir)?;
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictionReport {
    pub scanned: usize,
    pub evicted: Vec<String>,
    pub bytes_freed: u64,
    pub bytes_in_use: u64,
    /// True when another process held the advisory lock and we backed off.
    pub skipped: bool,
}

struct GcLock {
    path: PathBuf,
}

impl GcLock {
    fn acquire(root: &Path) -> Option<Self> {
        let path = root.join(GC_LOCK_FILE);
        match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(_) => Some(Self { path }),
            Err(_) => None,
        }
    }
}

impl Drop for GcLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Evict least-recently-used cache directories until the root fits the
/// configured ceiling. `keep` protects a just-committed directory name.
pub fn evict_lru(cfg: &CacheConfig, keep: Option<&str>) -> Result<EvictionReport, CacheError> {
    let mut report = EvictionReport::default();
    if !cfg.root.exists() {
        return Ok(report);
    }
    let Some(_lock) = GcLock::acquire(&cfg.root) else {
        report.skipped = true;
        return Ok(report);
    };

    struct Entry {
        name: String,
        path: PathBuf,
        bytes: u64,
        recency: std::time::SystemTime,
    }

    let mut entries: Vec<Entry> = Vec::new();
    let mut total: u64 = 0;
    for dirent in fs::read_dir(&cfg.root)? {
        let dirent = dirent?;
        let path = dirent.path();
        if !path.is_dir() {
            continue;
        }
        let name = dirent.file_name().to_string_lossy().into_owned();
        if name.starts_with(".tmp-") {
            // Leftover from a crashed or cancelled build.
            if is_older_than(&path, std::time::Duration::from_secs(24 * 3600)) {
                debug!(dir = %path.display(), "removing abandoned temp directory");
                let _ = fs::remove_dir_all(&path);
            }
            continue;
        }
        let bytes = dir_size(&path);
        let recency = fs::metadata(path.join(TOUCH_FILE))
            .or_else(|_| fs::metadata(path.join(SUMMARY_FILE)))
            .and_then(|m| m.modified())
            .unwrap_or(std::time::UNIX_EPOCH);
        total += bytes;
        entries.push(Entry {
            name,
            path,
            bytes,
            recency,
        });
    }

    report.scanned = entries.len();
    entries.sort_by_key(|e| e.recency);

    for entry in entries {
        if total <= cfg.max_bytes {
            break;
        }
        if Some(entry.name.as_str()) == keep {
            continue;
        }
        debug!(dir = %entry.path.display(), bytes = entry.bytes, "evicting cache entry");
        fs::remove_dir_all(&entry.path)?;
        total = total.saturating_sub(entry.bytes);
        report.bytes_freed += entry.bytes;
        report.evicted.push(entry.name);
    }
    report.bytes_in_use = total;
    Ok(report)
}

fn dir_size(path: &Path) -> u64 {
    let mut total = 0;
    if let Ok(entries) = fs::read_dir(path) {
        for entry in entries.flatten() {
            if let Ok(meta) = entry.metadata() {
                if meta.is_file() {
                    total += meta.len();
                } else if meta.is_dir() {
                    total += dir_size(&entry.path());
                }
            }
        }
    }
    total
}

fn is_older_than(path: &Path, age: std::time::Duration) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .map(|t| t.elapsed().map(|e| e > age).unwrap_or(false))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn fake_summary(identity: ReportIdentity) -> CacheSummary {
        CacheSummary {
            schema_version: SCHEMA_VERSION,
            identity,
            device: DeviceInfo::default(),
            time_zone: Some("Asia/Taipei".into()),
            total_rows: 3,
            malformed: 0,
            level_counts: LevelCounts::default(),
            min_ts_ms: None,
            max_ts_ms: None,
            min_ts_display: None,
            max_ts_display: None,
            log_bytes: 100,
            anrs: 0,
            crashes: 0,
            ef_total: 0,
            ef_recent: 0,
            created_at: "2024-08-24T00:00:00Z".into(),
        }
    }

    fn fake_report(dir: &Path, name: &str, body: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body).unwrap();
        path
    }

    #[test]
    fn identity_changes_with_content_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = fake_report(dir.path(), "report.txt", b"aaaa");
        let id1 = ReportIdentity::of(&path).unwrap();
        fake_report(dir.path(), "report.txt", b"aaaabbbb");
        let id2 = ReportIdentity::of(&path).unwrap();
        assert_ne!(id1.fingerprint, id2.fingerprint);
        assert_eq!(id1.short().len(), 16);
    }

    #[test]
    fn summary_round_trip_validates_identity() {
        let dir = tempfile::tempdir().unwrap();
        let report = fake_report(dir.path(), "report.txt", b"content");
        let identity = ReportIdentity::of(&report).unwrap();

        let cache_dir = dir.path().join("cache").join(identity.short());
        fs::create_dir_all(&cache_dir).unwrap();
        write_summary(&cache_dir, &fake_summary(identity.clone())).unwrap();

        let loaded = open_summary(&cache_dir, &identity).unwrap();
        assert_eq!(loaded.total_rows, 3);

        let mut other = identity.clone();
        other.fingerprint = "0".repeat(64);
        assert!(matches!(
            open_summary(&cache_dir, &other),
            Err(CacheError::Stale(_))
        ));
    }

    #[test]
    fn schema_mismatch_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let report = fake_report(dir.path(), "report.txt", b"content");
        let identity = ReportIdentity::of(&report).unwrap();
        let cache_dir = dir.path().join("c");
        fs::create_dir_all(&cache_dir).unwrap();
        let mut summary = fake_summary(identity.clone());
        summary.schema_version = SCHEMA_VERSION + 1;
        write_summary(&cache_dir, &summary).unwrap();
        assert!(matches!(
            open_summary(&cache_dir, &identity),
            Err(CacheError::Stale(_))
        ));
    }

    #[test]
    fn missing_cache_is_stale() {
        let dir = tempfile::tempdir().unwrap();
        let report = fake_report(dir.path(), "report.txt", b"content");
        let identity = ReportIdentity::of(&report).unwrap();
        assert!(matches!(
            open_summary(&dir.path().join("nope"), &identity),
            Err(CacheError::Stale(_))
        ));
    }

    #[test]
    fn commit_replaces_existing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let temp = dir.path().join(".tmp-x");
        let fin = dir.path().join("final");
        fs::create_dir_all(&temp).unwrap();
        fs::write(temp.join("marker"), b"new").unwrap();
        fs::create_dir_all(&fin).unwrap();
        fs::write(fin.join("marker"), b"old").unwrap();

        commit(&temp, &fin).unwrap();
        assert_eq!(fs::read(fin.join("marker")).unwrap(), b"new");
        assert!(!temp.exists());
    }

    #[test]
    fn eviction_removes_oldest_first_and_respects_keep() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CacheConfig::new(dir.path()).with_max_bytes(1024);

        for (name, age_touch) in [("aaaa", true), ("bbbb", false), ("cccc", false)] {
            let d = dir.path().join(name);
            fs::create_dir_all(&d).unwrap();
            fs::write(d.join(ROWS_FILE), vec![0u8; 600]).unwrap();
            fs::write(d.join(SUMMARY_FILE), b"{}").unwrap();
            if age_touch {
                // Oldest: no touch marker, summary mtime only.
                continue;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
            fs::File::create(d.join(".touch")).unwrap();
        }

        let report = evict_lru(&cfg, Some("bbbb")).unwrap();
        assert!(!report.skipped);
        assert!(report.evicted.contains(&"aaaa".to_string()));
        assert!(!report.evicted.contains(&"bbbb".to_string()));
        assert!(report.bytes_in_use <= 1024 || report.evicted.len() == 2);
    }

    #[test]
    fn eviction_backs_off_when_locked() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = CacheConfig::new(dir.path());
        fs::write(dir.path().join(GC_LOCK_FILE), b"").unwrap();
        let report = evict_lru(&cfg, None).unwrap();
        assert!(report.skipped);
    }
}
